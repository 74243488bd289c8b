use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Ceiling for regular uploads, in bytes.
    pub max_upload_bytes: u64,
    /// Ceiling for smile uploads, in bytes.
    pub max_smile_bytes: u64,
    pub thumb_workers: usize,
    /// External thumbnailer command. `None` selects the built-in image thumbnailer.
    pub thumbnailer: Option<String>,
    pub token_ttl: Duration,
    pub identity_retention: Duration,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Media upload processing service")]
pub struct Args {
    /// Host to bind to (overrides IMAGER_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides IMAGER_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where assets are stored (overrides IMAGER_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides IMAGER_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Maximum upload size in MiB (overrides IMAGER_MAX_SIZE_MB)
    #[arg(long)]
    pub max_size_mb: Option<u64>,

    /// Maximum smile size in KiB (overrides IMAGER_MAX_SMILE_KB)
    #[arg(long)]
    pub max_smile_kb: Option<u64>,

    /// Number of concurrent thumbnailing workers (overrides IMAGER_THUMB_WORKERS)
    #[arg(long)]
    pub thumb_workers: Option<usize>,

    /// External thumbnailer command (overrides IMAGER_THUMBNAILER)
    #[arg(long)]
    pub thumbnailer: Option<String>,

    /// Claim token lifetime in seconds (overrides IMAGER_TOKEN_TTL_SECS)
    #[arg(long)]
    pub token_ttl_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("IMAGER_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse("IMAGER_PORT", 8000)?;
        let env_storage =
            env::var("IMAGER_STORAGE_DIR").unwrap_or_else(|_| "./data/assets".into());
        let env_db = env::var("IMAGER_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/imager.db".into());
        let env_max_size_mb = env_parse("IMAGER_MAX_SIZE_MB", 20u64)?;
        let env_max_smile_kb = env_parse("IMAGER_MAX_SMILE_KB", 256u64)?;
        let env_workers = env_parse("IMAGER_THUMB_WORKERS", 3usize)?;
        let env_thumbnailer = env::var("IMAGER_THUMBNAILER")
            .ok()
            .filter(|cmd| !cmd.trim().is_empty());
        let env_token_ttl = env_parse("IMAGER_TOKEN_TTL_SECS", 60u64)?;
        let env_retention_days = env_parse("IMAGER_IDENTITY_RETENTION_DAYS", 7u64)?;

        let max_size_mb = args.max_size_mb.unwrap_or(env_max_size_mb);
        let max_smile_kb = args.max_smile_kb.unwrap_or(env_max_smile_kb);
        let token_ttl_secs = args.token_ttl_secs.unwrap_or(env_token_ttl);
        i64::try_from(token_ttl_secs)
            .with_context(|| format!("token lifetime of {} seconds is too large", token_ttl_secs))?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            max_upload_bytes: scaled(max_size_mb, 1024 * 1024, "maximum upload size")?,
            max_smile_bytes: scaled(max_smile_kb, 1024, "maximum smile size")?,
            thumb_workers: args.thumb_workers.unwrap_or(env_workers).max(1),
            thumbnailer: args.thumbnailer.or(env_thumbnailer),
            token_ttl: Duration::from_secs(token_ttl_secs),
            identity_retention: Duration::from_secs(scaled(
                env_retention_days,
                24 * 60 * 60,
                "identity retention",
            )?),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Convert a configured amount into base units, rejecting overflow.
fn scaled(value: u64, unit: u64, what: &str) -> Result<u64> {
    value
        .checked_mul(unit)
        .with_context(|| format!("{} of {} is too large", what, value))
}

/// Read `name` from the environment, falling back to `default` when unset.
fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

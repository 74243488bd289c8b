//! Health & readiness handlers.
//!
//! - GET /healthz  -> liveness, no I/O
//! - GET /readyz   -> readiness: SQLite round-trip plus an asset-store write check

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::{collections::HashMap, path::Path};
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// HTTP 200 when every check passes, 503 otherwise. The body lists each
/// check with its error, if any.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = HashMap::new();
    checks.insert("sqlite", check_sqlite(&state).await);
    checks.insert("assets", check_disk(&state.store.assets.base_path).await);

    let ready = checks.values().all(|c| c.ok);
    let body = ReadyResponse {
        status: if ready { "ok" } else { "error" }.into(),
        checks,
    };
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn check_sqlite(state: &AppState) -> CheckStatus {
    match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&state.store.db)
        .await
    {
        Ok(1) => CheckStatus::passed(),
        Ok(v) => CheckStatus::failed(format!("unexpected result: {}", v)),
        Err(e) => CheckStatus::failed(format!("error: {}", e)),
    }
}

/// Write, read back and remove a marker file under `root`.
async fn check_disk(root: &Path) -> CheckStatus {
    let marker = root.join(format!(".readyz-{}", Uuid::new_v4()));
    let outcome = match fs::write(&marker, b"readyz").await {
        Ok(()) => match fs::read(&marker).await {
            Ok(bytes) if bytes == b"readyz" => CheckStatus::passed(),
            Ok(_) => CheckStatus::failed("marker content mismatch".into()),
            Err(e) => CheckStatus::failed(format!("could not read marker: {}", e)),
        },
        Err(e) => return CheckStatus::failed(format!("could not write marker: {}", e)),
    };

    if let Err(e) = fs::remove_file(&marker).await {
        tracing::warn!(path = %marker.display(), error = %e, "readiness marker left behind");
    }
    outcome
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn passed() -> Self {
        Self { ok: true, error: None }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn disk_check_passes_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let status = check_disk(dir.path()).await;
        assert!(status.ok, "{:?}", status.error);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn disk_check_fails_on_missing_root() {
        let dir = TempDir::new().unwrap();
        let status = check_disk(&dir.path().join("absent")).await;
        assert!(!status.ok);
        assert!(status.error.unwrap().contains("write"));
    }
}

//! Thumbnailer that shells out to an external program.
//!
//! The program receives the upload on stdin and the actor as its last
//! argument. On success it exits 0 and prints a JSON description with the
//! thumbnail base64-encoded in `thumbnail`. Failures are reported through
//! the exit code.

use super::{ThumbError, Thumbnail, Thumbnailer};
use anyhow::{Context, anyhow};
use base64::{Engine as _, engine::general_purpose};
use serde::Deserialize;
use std::{
    io::Write,
    process::{Command, Stdio},
    thread,
};

pub const EXIT_UNSUPPORTED: i32 = 10;
pub const EXIT_NO_TRACKS: i32 = 11;
pub const EXIT_CORRUPTED: i32 = 12;

#[derive(Clone, Debug)]
pub struct ProcessThumbnailer {
    program: String,
    args: Vec<String>,
}

#[derive(Deserialize)]
struct ProcessOutput {
    mime: String,
    src_width: u16,
    src_height: u16,
    width: u16,
    height: u16,
    #[serde(default)]
    has_alpha: bool,
    #[serde(default)]
    has_video: bool,
    #[serde(default)]
    has_audio: bool,
    #[serde(default)]
    duration: u32,
    #[serde(default)]
    title: String,
    thumbnail: String,
}

impl ProcessThumbnailer {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a whitespace-separated command line. Returns `None` when empty.
    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }
}

impl Thumbnailer for ProcessThumbnailer {
    fn generate(&self, actor: &str, data: &[u8]) -> Result<Thumbnail, ThumbError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(actor)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning thumbnailer `{}`", self.program))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("thumbnailer stdin unavailable"))?;
        let input = data.to_vec();
        // Feed stdin from another thread so a chatty child can't deadlock us.
        let writer = thread::spawn(move || stdin.write_all(&input));

        let output = child
            .wait_with_output()
            .context("waiting for thumbnailer")?;
        // The child may exit before reading everything; a broken pipe is not our error.
        let _ = writer.join();

        let stderr = String::from_utf8_lossy(&output.stderr);
        match output.status.code() {
            Some(0) => parse_output(&output.stdout),
            Some(EXIT_UNSUPPORTED) => Err(ThumbError::Unsupported),
            Some(EXIT_NO_TRACKS) => Err(ThumbError::NoTracks),
            Some(EXIT_CORRUPTED) => Err(ThumbError::Process(stderr.trim().to_string())),
            None => Err(ThumbError::Process(format!(
                "terminated by signal: {}",
                stderr.trim()
            ))),
            Some(code) => Err(ThumbError::Other(anyhow!(
                "thumbnailer exited with {}: {}",
                code,
                stderr.trim()
            ))),
        }
    }
}

fn parse_output(stdout: &[u8]) -> Result<Thumbnail, ThumbError> {
    let out: ProcessOutput =
        serde_json::from_slice(stdout).context("decoding thumbnailer output")?;
    let data = general_purpose::STANDARD
        .decode(out.thumbnail.trim())
        .context("decoding thumbnail payload")?;

    Ok(Thumbnail {
        mime: out.mime,
        src_width: out.src_width,
        src_height: out.src_height,
        width: out.width,
        height: out.height,
        has_alpha: out.has_alpha,
        has_video: out.has_video,
        has_audio: out.has_audio,
        duration: out.duration,
        title: out.title,
        data,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn script(body: &str) -> ProcessThumbnailer {
        ProcessThumbnailer::new(
            "sh",
            vec!["-c".into(), body.into(), "thumbnailer".into()],
        )
    }

    #[test]
    fn success_is_parsed() {
        let thumbnailer = script(
            r#"cat >/dev/null
[ "$1" = "10.0.0.1" ] || exit 3
printf '{"mime":"video/webm","src_width":1280,"src_height":720,"width":200,"height":112,"has_video":true,"has_audio":true,"duration":42,"title":"clip","thumbnail":"aGk="}'"#,
        );
        let thumb = thumbnailer.generate("10.0.0.1", b"webm bytes").unwrap();
        assert_eq!(thumb.mime, "video/webm");
        assert_eq!((thumb.width, thumb.height), (200, 112));
        assert!(thumb.has_video && thumb.has_audio && !thumb.has_alpha);
        assert_eq!(thumb.duration, 42);
        assert_eq!(thumb.title, "clip");
        assert_eq!(thumb.data, b"hi");
    }

    #[test]
    fn exit_codes_map_to_typed_failures() {
        let err = script("cat >/dev/null; exit 10")
            .generate("a", b"x")
            .unwrap_err();
        assert!(matches!(err, ThumbError::Unsupported));

        let err = script("cat >/dev/null; exit 11")
            .generate("a", b"x")
            .unwrap_err();
        assert!(matches!(err, ThumbError::NoTracks));

        let err = script("cat >/dev/null; echo 'bad frame' >&2; exit 12")
            .generate("a", b"x")
            .unwrap_err();
        assert!(matches!(err, ThumbError::Process(msg) if msg == "bad frame"));

        let err = script("exit 3").generate("a", b"x").unwrap_err();
        assert!(matches!(err, ThumbError::Other(_)));
    }

    #[test]
    fn killed_process_counts_as_corrupted() {
        let err = script("kill -9 $$").generate("a", b"x").unwrap_err();
        assert!(matches!(err, ThumbError::Process(_)));
    }

    #[test]
    fn garbage_output_is_internal() {
        let err = script("cat >/dev/null; echo nope")
            .generate("a", b"x")
            .unwrap_err();
        assert!(matches!(err, ThumbError::Other(_)));
    }

    #[test]
    fn missing_program_is_internal() {
        let err = ProcessThumbnailer::new("/nonexistent/thumbnailer", vec![])
            .generate("a", b"x")
            .unwrap_err();
        assert!(matches!(err, ThumbError::Other(_)));
    }

    #[test]
    fn command_line_is_split() {
        assert!(ProcessThumbnailer::from_command_line("   ").is_none());
        let t = ProcessThumbnailer::from_command_line("thumbnailer --quality 80").unwrap();
        assert_eq!(t.program, "thumbnailer");
        assert_eq!(t.args, vec!["--quality", "80"]);
    }
}

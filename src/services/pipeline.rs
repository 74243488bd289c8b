//! The per-job upload pipeline: read → hash → dedup check → thumbnail →
//! persist → token.
//!
//! A `Pipeline` holds no job-local state; workers share one instance and
//! each call to [`Pipeline::process`] owns everything it touches.

use crate::errors::UploadError;
use crate::models::{
    file::{FileRecord, FileType},
    smile::{NewSmile, SmileRecord},
    token::ClaimToken,
};
use crate::services::{
    content_store::AssetKind,
    hasher,
    media_store::{MediaStore, StoreError},
    thumbnailer::{ThumbError, Thumbnail, Thumbnailer},
    tokens::TokenIssuer,
};
use anyhow::Context;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

/// An open, exclusively owned upload body.
pub type ByteSource = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug)]
pub enum JobKind {
    File,
    Smile(NewSmile),
}

#[derive(Debug)]
pub enum Uploaded {
    File { file: FileRecord, token: ClaimToken },
    Smile(SmileRecord),
}

pub type JobResult = Result<Uploaded, UploadError>;

pub struct Pipeline {
    store: MediaStore,
    tokens: TokenIssuer,
    thumbnailer: Arc<dyn Thumbnailer>,
}

impl Pipeline {
    pub fn new(store: MediaStore, tokens: TokenIssuer, thumbnailer: Arc<dyn Thumbnailer>) -> Self {
        Self {
            store,
            tokens,
            thumbnailer,
        }
    }

    /// Run one job to completion. Reads at most `max_bytes` from `source`.
    #[tracing::instrument(skip(self, source, kind), fields(kind = kind.name()))]
    pub async fn process(
        &self,
        actor: &str,
        source: ByteSource,
        max_bytes: u64,
        kind: JobKind,
    ) -> JobResult {
        let data = read_limited(source, max_bytes).await?;
        let sha1 = hasher::digest(&data);
        debug!(digest = %sha1, size = data.len(), "hashed upload");

        match kind {
            JobKind::File => {
                let (file, token) = self.process_file(actor, data, sha1).await?;
                Ok(Uploaded::File { file, token })
            }
            JobKind::Smile(smile) => {
                let record = self.process_smile(actor, data, sha1, smile).await?;
                Ok(Uploaded::Smile(record))
            }
        }
    }

    async fn process_file(
        &self,
        actor: &str,
        data: Vec<u8>,
        sha1: String,
    ) -> Result<(FileRecord, ClaimToken), UploadError> {
        if let Some(file) = self.store.find_file(&sha1).await.map_err(UploadError::hide)? {
            // The sweep may remove the row between lookup and mint.
            if let Some(token) = self.tokens.mint(&sha1).await.map_err(UploadError::hide)? {
                debug!(digest = %sha1, "already stored, skipping thumbnailer");
                return Ok((file, token));
            }
            debug!(digest = %sha1, "stored digest reclaimed during lookup, storing again");
        }

        let (data, thumb) = self.thumbnail(actor, data).await?;
        let file_type = FileType::from_mime(&thumb.mime).ok_or(UploadError::UnsupportedFormat)?;
        let thumb_type = if thumb.has_alpha {
            FileType::Png
        } else {
            FileType::Jpeg
        };

        let file = FileRecord {
            sha1,
            size: data.len() as i64,
            file_type,
            thumb_type,
            src_width: thumb.src_width,
            src_height: thumb.src_height,
            thumb_width: thumb.width,
            thumb_height: thumb.height,
            video: thumb.has_video,
            audio: thumb.has_audio,
            length: thumb.duration,
            title: thumb.title,
        };
        let token = self
            .store
            .commit_file(&file, &data, &thumb.data, &self.tokens)
            .await
            .map_err(UploadError::hide)?;
        debug!(digest = %file.sha1, dims = ?file.dims(), "stored new upload");

        self.spawn_blur(file.sha1.clone(), thumb_type);
        Ok((file, token))
    }

    async fn process_smile(
        &self,
        actor: &str,
        data: Vec<u8>,
        sha1: String,
        smile: NewSmile,
    ) -> Result<SmileRecord, UploadError> {
        let taken = self
            .store
            .smile_name_taken(&smile.name, &smile.board)
            .await
            .map_err(UploadError::hide)?;
        if taken {
            return Err(UploadError::SmileNameTaken);
        }

        // Only the metadata is wanted; the sprite itself is stored as-is.
        let (data, thumb) = self.thumbnail(actor, data).await?;
        let file_type = FileType::from_mime(&thumb.mime).ok_or(UploadError::UnsupportedFormat)?;

        self.store
            .commit_smile(&smile, &sha1, file_type, &data)
            .await
            .map_err(|err| match err {
                StoreError::SmileNameTaken => UploadError::SmileNameTaken,
                other => UploadError::hide(other),
            })
    }

    /// Run the blocking thumbnailer off the async runtime, handing `data` back.
    async fn thumbnail(
        &self,
        actor: &str,
        data: Vec<u8>,
    ) -> Result<(Vec<u8>, Thumbnail), UploadError> {
        let thumbnailer = Arc::clone(&self.thumbnailer);
        let actor = actor.to_string();
        let (data, result) = tokio::task::spawn_blocking(move || {
            let result = thumbnailer.generate(&actor, &data);
            (data, result)
        })
        .await
        .map_err(UploadError::hide)?;

        let thumb = result.map_err(|err| match err {
            ThumbError::Unsupported => UploadError::UnsupportedFormat,
            ThumbError::NoTracks => UploadError::NoMediaTracks,
            ThumbError::Process(msg) => {
                debug!(reason = %msg, "thumbnailer could not decode upload");
                UploadError::CorruptedSource
            }
            ThumbError::Other(err) => UploadError::hide(err.context("thumbnailer failed")),
        })?;
        Ok((data, thumb))
    }

    /// Fire-and-forget blur generation; failures are only logged.
    fn spawn_blur(&self, sha1: String, thumb_type: FileType) {
        let store = self.store.clone();
        let thumbnailer = Arc::clone(&self.thumbnailer);
        tokio::spawn(async move {
            if let Err(err) = blur_placeholder(&store, thumbnailer, &sha1, thumb_type).await {
                warn!(digest = %sha1, error = %err, "blur placeholder not generated");
            }
        });
    }
}

/// Generate and store the blurred placeholder of a stored thumbnail.
async fn blur_placeholder(
    store: &MediaStore,
    thumbnailer: Arc<dyn Thumbnailer>,
    sha1: &str,
    thumb_type: FileType,
) -> anyhow::Result<()> {
    let ext = thumb_type.extension();
    let thumb = store
        .assets
        .read(AssetKind::Thumb, sha1, ext)
        .await
        .context("reading thumbnail")?;
    let blurred =
        tokio::task::spawn_blocking(move || thumbnailer.blur_placeholder(&thumb, thumb_type))
            .await??;
    store
        .assets
        .write(AssetKind::Blur, sha1, ext, &blurred)
        .await
        .context("writing blur placeholder")?;

    // Reclaimed while blurring: the sweep already ran, so clean up here.
    if store.find_file(sha1).await?.is_none() {
        store.assets.delete(AssetKind::Blur, sha1, ext).await?;
        debug!(digest = %sha1, "digest reclaimed, dropped blur placeholder");
        return Ok(());
    }
    debug!(digest = %sha1, "blur placeholder stored");
    Ok(())
}

async fn read_limited(source: ByteSource, max_bytes: u64) -> Result<Vec<u8>, UploadError> {
    let mut data = Vec::new();
    source
        .take(max_bytes.saturating_add(1))
        .read_to_end(&mut data)
        .await
        .map_err(UploadError::ReadFailure)?;
    if data.len() as u64 > max_bytes {
        return Err(UploadError::TooLarge);
    }
    Ok(data)
}

impl JobKind {
    fn name(&self) -> &'static str {
        match self {
            JobKind::File => "file",
            JobKind::Smile(_) => "smile",
        }
    }
}

//! MediaStore - the persistent store behind the upload pipeline.
//!
//! Metadata lives in SQLite, payloads in a [`ContentStore`] on local disk.
//! Conflict policy for a digest written twice: payload files are
//! last-write-wins, the `images` row is ignore-if-exists. The row is
//! committed before the payloads, so payloads are only ever written for a
//! digest the sweep can find.

use crate::models::{
    file::{FileRecord, FileType},
    smile::{NewSmile, SmileRecord},
    token::ClaimToken,
};
use crate::services::{
    content_store::{AssetKind, ContentStore},
    hasher,
    tokens::TokenIssuer,
};
use chrono::Utc;
use sqlx::{FromRow, SqlitePool, types::Json};
use std::io;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid digest")]
    InvalidDigest,
    #[error("smile name already used on this board")]
    SmileNameTaken,
    #[error("claim token not found or expired")]
    TokenNotFound,
    #[error("post not found")]
    PostNotFound,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// An `images` row that no post and no live claim token refers to.
#[derive(Clone, FromRow, Debug, PartialEq, Eq)]
pub struct UnusedAsset {
    pub sha1: String,
    pub file_type: FileType,
    pub thumb_type: FileType,
}

const FILE_COLUMNS: &str = "sha1, size, file_type, thumb_type, src_width, src_height, \
                            thumb_width, thumb_height, video, audio, length, title";

const UNREFERENCED: &str = "NOT EXISTS (SELECT 1 FROM post_files pf WHERE pf.sha1 = images.sha1) \
     AND NOT EXISTS (SELECT 1 FROM image_tokens t WHERE t.sha1 = images.sha1 AND t.expires > ?)";

#[derive(Clone)]
pub struct MediaStore {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: SqlitePool,

    pub assets: ContentStore,
}

impl MediaStore {
    pub fn new(db: SqlitePool, assets: ContentStore) -> Self {
        Self { db, assets }
    }

    fn ensure_digest(sha1: &str) -> StoreResult<()> {
        if hasher::is_digest(sha1) {
            Ok(())
        } else {
            Err(StoreError::InvalidDigest)
        }
    }

    /// Look up the record of an already stored digest.
    pub async fn find_file(&self, sha1: &str) -> StoreResult<Option<FileRecord>> {
        let record = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {} FROM images WHERE sha1 = ?",
            FILE_COLUMNS
        ))
        .bind(sha1)
        .fetch_optional(&self.db)
        .await?;
        Ok(record)
    }

    /// Insert the metadata row together with a claim token, then persist the
    /// original and its thumbnail.
    ///
    /// The token keeps the sweep away while the payloads are written. If a
    /// write fails, the token is revoked and the row and any written payloads
    /// are removed again, unless another upload holds the digest by then.
    pub async fn commit_file(
        &self,
        record: &FileRecord,
        src: &[u8],
        thumb: &[u8],
        tokens: &TokenIssuer,
    ) -> StoreResult<ClaimToken> {
        Self::ensure_digest(&record.sha1)?;

        let mut tx = self.db.begin().await?;
        let result = sqlx::query(
            r#"
            INSERT INTO images (
                sha1, size, file_type, thumb_type, src_width, src_height,
                thumb_width, thumb_height, video, audio, length, title
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(sha1) DO NOTHING
            "#,
        )
        .bind(&record.sha1)
        .bind(record.size)
        .bind(record.file_type)
        .bind(record.thumb_type)
        .bind(record.src_width)
        .bind(record.src_height)
        .bind(record.thumb_width)
        .bind(record.thumb_height)
        .bind(record.video)
        .bind(record.audio)
        .bind(record.length)
        .bind(&record.title)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            debug!(digest = %record.sha1, "image row already present, keeping existing");
        }
        let token = tokens.mint_with(&mut *tx, &record.sha1).await?;
        tx.commit().await?;

        if let Err(err) = self.write_payloads(record, src, thumb).await {
            self.abandon(record, &token, tokens).await;
            return Err(err.into());
        }
        Ok(token)
    }

    async fn write_payloads(&self, record: &FileRecord, src: &[u8], thumb: &[u8]) -> io::Result<()> {
        self.assets
            .write(
                AssetKind::Source,
                &record.sha1,
                record.file_type.extension(),
                src,
            )
            .await?;
        self.assets
            .write(
                AssetKind::Thumb,
                &record.sha1,
                record.thumb_type.extension(),
                thumb,
            )
            .await?;
        Ok(())
    }

    /// Undo a commit whose payloads could not be written.
    async fn abandon(&self, record: &FileRecord, token: &ClaimToken, tokens: &TokenIssuer) {
        if let Err(err) = tokens.revoke(&token.token).await {
            warn!(digest = %record.sha1, error = %err, "failed to revoke token of failed commit");
            return;
        }
        let asset = UnusedAsset {
            sha1: record.sha1.clone(),
            file_type: record.file_type,
            thumb_type: record.thumb_type,
        };
        match self.delete_asset(&asset).await {
            Ok(true) => debug!(digest = %record.sha1, "rolled back failed commit"),
            Ok(false) => debug!(digest = %record.sha1, "digest held elsewhere, keeping row"),
            Err(err) => {
                warn!(digest = %record.sha1, error = %err, "failed to roll back commit")
            }
        }
    }

    /// Whether a non-deleted smile with this name exists on the board.
    pub async fn smile_name_taken(&self, name: &str, board: &str) -> StoreResult<bool> {
        let taken = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM smiles WHERE name = ? AND board = ? AND deleted = 0)",
        )
        .bind(name)
        .bind(board)
        .fetch_one(&self.db)
        .await?;
        Ok(taken)
    }

    /// Store the sprite bytes as-is and insert its row.
    pub async fn commit_smile(
        &self,
        smile: &NewSmile,
        sha1: &str,
        file_type: FileType,
        data: &[u8],
    ) -> StoreResult<SmileRecord> {
        Self::ensure_digest(sha1)?;
        self.assets
            .write(AssetKind::Smile, sha1, file_type.extension(), data)
            .await?;

        sqlx::query_as::<_, SmileRecord>(
            r#"
            INSERT INTO smiles (name, aliases, board, file_hash, file_type, readonly, created)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING id, name, aliases, board, file_hash, file_type, deleted, readonly, created
            "#,
        )
        .bind(&smile.name)
        .bind(Json(&smile.aliases))
        .bind(&smile.board)
        .bind(sha1)
        .bind(file_type)
        .bind(smile.readonly)
        .bind(Utc::now())
        .fetch_one(&self.db)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                StoreError::SmileNameTaken
            } else {
                StoreError::Sqlx(err)
            }
        })
    }

    /// Digests stored but referenced by no post and no live claim token.
    pub async fn list_unreferenced(&self) -> StoreResult<Vec<UnusedAsset>> {
        let rows = sqlx::query_as::<_, UnusedAsset>(&format!(
            "SELECT sha1, file_type, thumb_type FROM images WHERE {}",
            UNREFERENCED
        ))
        .bind(Utc::now().timestamp())
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    /// Delete an unreferenced digest's row and payloads.
    ///
    /// The row is only removed if it is still unreferenced; returns `false`
    /// when something claimed the digest in the meantime. Payload removal
    /// attempts all three artifacts and reports the first failure.
    pub async fn delete_asset(&self, asset: &UnusedAsset) -> StoreResult<bool> {
        Self::ensure_digest(&asset.sha1)?;

        let result = sqlx::query(&format!(
            "DELETE FROM images WHERE sha1 = ? AND {}",
            UNREFERENCED
        ))
        .bind(&asset.sha1)
        .bind(Utc::now().timestamp())
        .execute(&self.db)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }

        let artifacts = [
            (AssetKind::Source, asset.file_type),
            (AssetKind::Thumb, asset.thumb_type),
            (AssetKind::Blur, asset.thumb_type),
        ];
        let mut first_err = None;
        for (kind, file_type) in artifacts {
            if let Err(err) = self
                .assets
                .delete(kind, &asset.sha1, file_type.extension())
                .await
            {
                warn!(digest = %asset.sha1, kind = %kind, error = %err, "failed to remove asset");
                first_err.get_or_insert(err);
            }
        }

        match first_err {
            Some(err) => Err(StoreError::Io(err)),
            None => Ok(true),
        }
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

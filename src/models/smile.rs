//! Represents a small board-scoped decorative sprite.

use crate::models::file::FileType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A smile as stored in the database.
///
/// `(name, board)` is unique among smiles that are not soft-deleted.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct SmileRecord {
    pub id: i64,
    pub name: String,

    #[sqlx(json)]
    pub aliases: Vec<String>,

    pub board: String,

    /// Digest of the sprite bytes, which are stored as-is.
    #[sqlx(rename = "file_hash")]
    pub sha1: String,

    pub file_type: FileType,

    /// Soft-delete flag.
    pub deleted: bool,

    pub readonly: bool,

    #[sqlx(rename = "created")]
    pub created_at: DateTime<Utc>,
}

/// Caller-supplied fields for a smile that is not stored yet.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct NewSmile {
    pub name: String,
    pub board: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub readonly: bool,
}

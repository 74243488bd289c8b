//! Represents a stored original + thumbnail pair, keyed by content digest.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Media classes the pipeline accepts, stored as a small integer.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[repr(i16)]
pub enum FileType {
    Jpeg = 0,
    Png = 1,
    Gif = 2,
    Webm = 3,
    Pdf = 4,
    Ogg = 5,
    Mp4 = 6,
    Mp3 = 7,
    Flac = 8,
}

impl FileType {
    /// Map a MIME type reported by a thumbnailer to a file type.
    pub fn from_mime(mime: &str) -> Option<Self> {
        let kind = match mime {
            "image/jpeg" => Self::Jpeg,
            "image/png" => Self::Png,
            "image/gif" => Self::Gif,
            "application/pdf" => Self::Pdf,
            "video/webm" => Self::Webm,
            "application/ogg" => Self::Ogg,
            "video/mp4" => Self::Mp4,
            "audio/mpeg" => Self::Mp3,
            "audio/flac" | "audio/x-flac" => Self::Flac,
            _ => return None,
        };
        Some(kind)
    }

    pub fn mime(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::Pdf => "application/pdf",
            Self::Webm => "video/webm",
            Self::Ogg => "application/ogg",
            Self::Mp4 => "video/mp4",
            Self::Mp3 => "audio/mpeg",
            Self::Flac => "audio/flac",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::Pdf => "pdf",
            Self::Webm => "webm",
            Self::Ogg => "ogg",
            Self::Mp4 => "mp4",
            Self::Mp3 => "mp3",
            Self::Flac => "flac",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        [
            Self::Jpeg,
            Self::Png,
            Self::Gif,
            Self::Pdf,
            Self::Webm,
            Self::Ogg,
            Self::Mp4,
            Self::Mp3,
            Self::Flac,
        ]
        .into_iter()
        .find(|kind| kind.extension() == ext)
    }
}

/// Canonical metadata for a stored upload.
///
/// There is at most one record per digest: `sha1` is both the primary key
/// and the deduplication key.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct FileRecord {
    /// Lowercase hex SHA-1 of the original bytes.
    pub sha1: String,

    /// Size of the original in bytes.
    pub size: i64,

    pub file_type: FileType,

    /// JPEG, or PNG when the source carries an alpha channel.
    pub thumb_type: FileType,

    pub src_width: u16,
    pub src_height: u16,
    pub thumb_width: u16,
    pub thumb_height: u16,

    /// Whether the source has a video track.
    pub video: bool,

    /// Whether the source has an audio track.
    pub audio: bool,

    /// Duration in seconds.
    pub length: u32,

    pub title: String,
}

impl FileRecord {
    /// Source and thumbnail dimensions as `[src_w, src_h, thumb_w, thumb_h]`.
    pub fn dims(&self) -> [u16; 4] {
        [
            self.src_width,
            self.src_height,
            self.thumb_width,
            self.thumb_height,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_flac_mimes_map_to_flac() {
        assert_eq!(FileType::from_mime("audio/flac"), Some(FileType::Flac));
        assert_eq!(FileType::from_mime("audio/x-flac"), Some(FileType::Flac));
    }

    #[test]
    fn unknown_mime_is_rejected() {
        assert_eq!(FileType::from_mime("application/x-msdownload"), None);
    }

    #[test]
    fn extension_lookup_is_inverse_of_extension() {
        assert_eq!(FileType::from_extension("jpg"), Some(FileType::Jpeg));
        assert_eq!(FileType::from_extension("webm"), Some(FileType::Webm));
        assert_eq!(FileType::from_extension("exe"), None);
    }
}

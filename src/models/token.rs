//! Short-lived claim tokens binding a digest to a not-yet-committed post.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// An opaque handle returned to the uploader.
///
/// Every upload gets its own token, even when the digest was already stored.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ClaimToken {
    pub token: String,
    pub sha1: String,
    pub expires_at: DateTime<Utc>,
}

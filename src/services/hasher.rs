//! Content digests used for deduplication and storage addressing.

use sha1::{Digest, Sha1};

/// Length of a hex-encoded SHA-1 digest.
pub const DIGEST_LEN: usize = 40;

/// Lowercase hex SHA-1 of `data`.
pub fn digest(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Whether `value` looks like a digest produced by [`digest`].
///
/// Anything that ends up in a filesystem path must pass this check.
pub fn is_digest(value: &str) -> bool {
    value.len() == DIGEST_LEN
        && value
            .bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest() {
        assert_eq!(
            digest(b"hello world"),
            "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed"
        );
    }

    #[test]
    fn test_digest_empty() {
        assert_eq!(digest(b""), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    #[test]
    fn test_is_digest() {
        assert!(is_digest(&digest(b"abc")));
        assert!(!is_digest("2AAE6C35C94FCFB415DBE95F408B9CE91EE846ED"));
        assert!(!is_digest("../../etc/passwd"));
        assert!(!is_digest(""));
    }
}

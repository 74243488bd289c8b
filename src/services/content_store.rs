//! ContentStore - on-disk asset payloads addressed by digest.
//!
//! Files live beneath `base_path/{kind}/{d[0..2]}/{d[2..4]}/{digest}.{ext}`.
//! Writes go through a temp file, fsync and rename, so a reader never
//! observes a half-written asset. Writing the same digest twice is
//! last-write-wins; since the bytes are identical per digest, the race between
//! two concurrent uploads of the same content is harmless.

use crate::services::hasher;
use std::{
    fmt,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

/// Which artifact of a digest an asset is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssetKind {
    Source,
    Thumb,
    Blur,
    Smile,
}

impl AssetKind {
    pub fn dir(self) -> &'static str {
        match self {
            AssetKind::Source => "src",
            AssetKind::Thumb => "thumb",
            AssetKind::Blur => "blur",
            AssetKind::Smile => "smile",
        }
    }

    pub fn from_dir(dir: &str) -> Option<Self> {
        match dir {
            "src" => Some(AssetKind::Source),
            "thumb" => Some(AssetKind::Thumb),
            "blur" => Some(AssetKind::Blur),
            "smile" => Some(AssetKind::Smile),
            _ => None,
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir())
    }
}

#[derive(Clone, Debug)]
pub struct ContentStore {
    /// Base directory on disk where asset payloads are stored.
    pub base_path: PathBuf,

    /// Runs between creating the shard directory and writing into it.
    #[cfg(test)]
    before_write: Option<fn(&Path)>,
}

impl ContentStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            #[cfg(test)]
            before_write: None,
        }
    }

    /// Construct the path of an asset. Parent directories may not exist yet.
    ///
    /// Callers must pass a digest that satisfies [`hasher::is_digest`].
    pub fn path_for(&self, kind: AssetKind, digest: &str, ext: &str) -> PathBuf {
        let mut path = self.base_path.join(kind.dir());
        path.push(&digest[0..2]);
        path.push(&digest[2..4]);
        path.push(format!("{}.{}", digest, ext));
        path
    }

    fn checked_path(&self, kind: AssetKind, digest: &str, ext: &str) -> io::Result<PathBuf> {
        if !hasher::is_digest(digest) || !ext.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("invalid asset address {}.{}", digest, ext),
            ));
        }
        Ok(self.path_for(kind, digest, ext))
    }

    /// Atomically write an asset, replacing any previous payload.
    ///
    /// A concurrent delete may prune the shard directory after it was
    /// created; the directory is then recreated and the write retried once.
    pub async fn write(
        &self,
        kind: AssetKind,
        digest: &str,
        ext: &str,
        data: &[u8],
    ) -> io::Result<PathBuf> {
        let file_path = self.checked_path(kind, digest, ext)?;
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::other("asset path missing parent directory"))?;

        let mut retried = false;
        loop {
            fs::create_dir_all(&parent).await?;
            #[cfg(test)]
            if let Some(hook) = self.before_write {
                hook(&parent);
            }

            match place(&parent, &file_path, data).await {
                Err(err) if err.kind() == ErrorKind::NotFound && !retried => {
                    debug!("shard {} vanished during write, retrying", parent.display());
                    retried = true;
                }
                result => {
                    result?;
                    break;
                }
            }
        }

        debug!(kind = %kind, digest, "wrote asset {}", file_path.display());
        Ok(file_path)
    }

    pub async fn read(&self, kind: AssetKind, digest: &str, ext: &str) -> io::Result<Vec<u8>> {
        let path = self.checked_path(kind, digest, ext)?;
        fs::read(path).await
    }

    /// Open an asset for streaming.
    pub async fn open(&self, kind: AssetKind, digest: &str, ext: &str) -> io::Result<File> {
        let path = self.checked_path(kind, digest, ext)?;
        File::open(path).await
    }

    pub async fn exists(&self, kind: AssetKind, digest: &str, ext: &str) -> io::Result<bool> {
        let path = self.checked_path(kind, digest, ext)?;
        fs::try_exists(path).await
    }

    /// Remove an asset. A missing file counts as removed.
    pub async fn delete(&self, kind: AssetKind, digest: &str, ext: &str) -> io::Result<()> {
        let file_path = self.checked_path(kind, digest, ext)?;
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed asset {}", file_path.display()),
            Err(err) if matches!(err.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => {
                debug!("asset {} already missing", file_path.display());
            }
            Err(err) => return Err(err),
        }

        if let Some(parent) = file_path.parent() {
            let kind_root = self.base_path.join(kind.dir());
            self.prune_empty_dirs(parent, &kind_root).await;
        }
        Ok(())
    }

    /// Remove empty shard directories up to, but excluding, `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

/// Write `data` to a temp file in `parent` and rename it over `file_path`.
async fn place(parent: &Path, file_path: &Path, data: &[u8]) -> io::Result<()> {
    let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
    if let Err(err) = write_synced(&tmp_path, data).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(err);
    }

    if let Err(err) = fs::rename(&tmp_path, file_path).await {
        if err.kind() == ErrorKind::AlreadyExists {
            fs::remove_file(file_path).await?;
            fs::rename(&tmp_path, file_path).await?;
        } else {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }
    }
    Ok(())
}

async fn write_synced(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = File::create(path).await?;
    file.write_all(data).await?;
    file.flush().await?;
    file.sync_all().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::hasher::digest;
    use tempfile::TempDir;

    #[tokio::test]
    async fn write_read_delete_prunes_shards() {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::new(dir.path());
        let sha1 = digest(b"payload");

        let path = store
            .write(AssetKind::Source, &sha1, "png", b"payload")
            .await
            .unwrap();
        assert!(path.starts_with(dir.path().join("src").join(&sha1[0..2])));
        assert!(store.exists(AssetKind::Source, &sha1, "png").await.unwrap());
        assert_eq!(
            store.read(AssetKind::Source, &sha1, "png").await.unwrap(),
            b"payload"
        );

        store.delete(AssetKind::Source, &sha1, "png").await.unwrap();
        assert!(!store.exists(AssetKind::Source, &sha1, "png").await.unwrap());
        assert!(!dir.path().join("src").join(&sha1[0..2]).exists());
    }

    #[tokio::test]
    async fn rewrite_replaces_payload() {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::new(dir.path());
        let sha1 = digest(b"x");

        store.write(AssetKind::Thumb, &sha1, "jpg", b"one").await.unwrap();
        store.write(AssetKind::Thumb, &sha1, "jpg", b"two").await.unwrap();
        assert_eq!(
            store.read(AssetKind::Thumb, &sha1, "jpg").await.unwrap(),
            b"two"
        );
    }

    #[tokio::test]
    async fn deleting_missing_asset_is_ok() {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::new(dir.path());
        let sha1 = digest(b"never written");
        store.delete(AssetKind::Blur, &sha1, "jpg").await.unwrap();
    }

    #[tokio::test]
    async fn rejects_non_digest_addresses() {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::new(dir.path());
        let err = store
            .write(AssetKind::Source, "../../../../etc/passwd", "png", b"x")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn write_survives_shard_pruned_underneath_it() {
        use std::sync::atomic::{AtomicBool, Ordering};

        static PRUNED: AtomicBool = AtomicBool::new(false);
        fn prune_once(shard: &Path) {
            if !PRUNED.swap(true, Ordering::SeqCst) {
                std::fs::remove_dir(shard).unwrap();
            }
        }

        let dir = TempDir::new().unwrap();
        let mut store = ContentStore::new(dir.path());
        store.before_write = Some(prune_once);
        let sha1 = digest(b"racing");

        let path = store
            .write(AssetKind::Source, &sha1, "png", b"racing")
            .await
            .unwrap();
        assert!(PRUNED.load(Ordering::SeqCst));
        assert_eq!(std::fs::read(path).unwrap(), b"racing");
    }

    #[tokio::test]
    async fn write_gives_up_when_shard_keeps_vanishing() {
        fn prune_always(shard: &Path) {
            std::fs::remove_dir(shard).unwrap();
        }

        let dir = TempDir::new().unwrap();
        let mut store = ContentStore::new(dir.path());
        store.before_write = Some(prune_always);
        let sha1 = digest(b"unlucky");

        let err = store
            .write(AssetKind::Thumb, &sha1, "jpg", b"unlucky")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}

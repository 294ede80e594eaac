//! Component B: content-addressed derivative cache layout (spec §4.2).
//!
//! `sourceHash = md5(absolutePath + ":" + modifiedTimeMs)`. Two logical
//! caches share one root: a flat directory of `<hash>.<variant>.<ext>`
//! stills, and `hls-abr/<hash>/` trees for HLS ladders.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;

use crate::error::{Error, Result};

/// Deterministic content hash for a source file at a given mtime, per
/// spec §3.1. Stable across cache lookups as long as the file is unchanged;
/// any modification (which bumps mtime) invalidates prior derivatives.
pub fn source_hash(absolute_path: &Path, modified_time_ms: i64) -> String {
    let input = format!("{}:{}", absolute_path.display(), modified_time_ms);
    format!("{:x}", md5::compute(input.as_bytes()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StandardHeight {
    H160,
    H320,
    H640,
    H1080,
    H2160,
    Original,
}

impl StandardHeight {
    pub const LADDER: [StandardHeight; 6] = [
        StandardHeight::H160,
        StandardHeight::H320,
        StandardHeight::H640,
        StandardHeight::H1080,
        StandardHeight::H2160,
        StandardHeight::Original,
    ];

    pub fn pixels(self) -> Option<u32> {
        match self {
            StandardHeight::H160 => Some(160),
            StandardHeight::H320 => Some(320),
            StandardHeight::H640 => Some(640),
            StandardHeight::H1080 => Some(1080),
            StandardHeight::H2160 => Some(2160),
            StandardHeight::Original => None,
        }
    }

    pub fn label(self) -> String {
        match self.pixels() {
            Some(px) => px.to_string(),
            None => "original".to_string(),
        }
    }

    /// Smallest standard height that is `>=` the requested height, or
    /// `Original` if none qualifies (spec §4.9 file-mode height rule).
    pub fn smallest_at_least(requested: u32) -> StandardHeight {
        Self::LADDER
            .into_iter()
            .find(|h| h.pixels().is_some_and(|px| px >= requested))
            .unwrap_or(StandardHeight::Original)
    }
}

#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    /// Creates the cache root and the `hls-abr` subdirectory, bounded by a
    /// 1 second timeout per spec §4.2; failure (timeout or IO) is fatal at
    /// startup (`Error::CacheInit`).
    pub async fn init(root: PathBuf) -> Result<Self> {
        let make_dirs = async {
            fs::create_dir_all(&root).await?;
            fs::create_dir_all(root.join("hls-abr")).await?;
            Ok::<(), std::io::Error>(())
        };

        tokio::time::timeout(Duration::from_secs(1), make_dirs)
            .await
            .map_err(|_| Error::CacheInit("timed out creating cache directories".to_string()))?
            .map_err(|e| Error::CacheInit(e.to_string()))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path for a flat still/webSafe/preview derivative.
    pub fn still_path(&self, hash: &str, variant: &str, ext: &str) -> PathBuf {
        self.root.join(format!("{hash}.{variant}.{ext}"))
    }

    /// Directory holding an HLS ladder's `master.m3u8` and per-rung
    /// subdirectories.
    pub fn hls_dir(&self, hash: &str) -> PathBuf {
        self.root.join("hls-abr").join(hash)
    }

    pub fn hls_master_playlist(&self, hash: &str) -> PathBuf {
        self.hls_dir(hash).join("master.m3u8")
    }

    pub async fn hls_ladder_exists(&self, hash: &str) -> bool {
        fs::metadata(self.hls_master_playlist(hash))
            .await
            .is_ok()
    }
}

/// Rename-on-success guard for a single cache write (spec §5, §9 design
/// notes). Writes land at `<final>.part`; `commit()` renames atomically. If
/// dropped without committing, the `.part` file is left behind to be
/// overwritten (and thus reclaimed) by a later attempt.
pub struct CacheWriteGuard {
    part_path: PathBuf,
    final_path: PathBuf,
    committed: bool,
}

impl CacheWriteGuard {
    pub fn new(final_path: PathBuf) -> Self {
        let mut part_path = final_path.clone().into_os_string();
        part_path.push(".part");
        Self {
            part_path: part_path.into(),
            final_path,
            committed: false,
        }
    }

    pub fn part_path(&self) -> &Path {
        &self.part_path
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    pub async fn commit(mut self) -> Result<()> {
        fs::rename(&self.part_path, &self.final_path).await?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for CacheWriteGuard {
    fn drop(&mut self) {
        if !self.committed {
            tracing::debug!(
                part = %self.part_path.display(),
                "cache write guard dropped without commit; .part left for reclamation"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_hash_is_deterministic() {
        let a = source_hash(Path::new("/media/photo.jpg"), 1_700_000_000_000);
        let b = source_hash(Path::new("/media/photo.jpg"), 1_700_000_000_000);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn source_hash_changes_with_mtime() {
        let a = source_hash(Path::new("/media/photo.jpg"), 1);
        let b = source_hash(Path::new("/media/photo.jpg"), 2);
        assert_ne!(a, b);
    }

    #[test]
    fn smallest_at_least_picks_ceiling() {
        assert_eq!(StandardHeight::smallest_at_least(500), StandardHeight::H640);
        assert_eq!(StandardHeight::smallest_at_least(640), StandardHeight::H640);
        assert_eq!(
            StandardHeight::smallest_at_least(3000),
            StandardHeight::Original
        );
    }

    #[tokio::test]
    async fn init_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cache");
        let layout = CacheLayout::init(root.clone()).await.unwrap();
        assert!(layout.root().is_dir());
        assert!(layout.root().join("hls-abr").is_dir());
    }

    #[tokio::test]
    async fn write_guard_renames_on_commit() {
        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("out.jpg");
        let guard = CacheWriteGuard::new(final_path.clone());
        fs::write(guard.part_path(), b"data").await.unwrap();
        guard.commit().await.unwrap();
        assert!(final_path.exists());
    }

    #[tokio::test]
    async fn write_guard_leaves_part_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("out.jpg");
        let guard = CacheWriteGuard::new(final_path.clone());
        fs::write(guard.part_path(), b"data").await.unwrap();
        drop(guard);
        assert!(!final_path.exists());
        assert!(dir.path().join("out.jpg.part").exists());
    }
}

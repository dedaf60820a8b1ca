//! On-device video cache.
//!
//! Maps a video id to a downloaded file. The id -> path mapping in the
//! [`KvStore`] is only a hint: every lookup re-checks that the file exists
//! and is non-empty, and drops the mapping when it does not.

use crate::assets::AssetKind;
use crate::download::{stream_to_file, ProxyEndpoints};
use crate::error::{Error, Result};
use crate::store::KvStore;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use walkdir::WalkDir;

const MAPPING_PREFIX: &str = "video_";

/// Total size of the cache directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheSize(pub u64);

impl CacheSize {
    pub fn megabytes(&self) -> f64 {
        self.0 as f64 / 1024.0 / 1024.0
    }
}

/// `"0"` for an empty or unreadable cache, otherwise MB with two decimals.
impl fmt::Display for CacheSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            f.write_str("0")
        } else {
            write!(f, "{:.2}", self.megabytes())
        }
    }
}

/// Result of the advisory pre-download check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageCheck {
    /// The cache directory exists and is not read-only.
    pub writable: bool,
    /// `None` when free space could not be determined.
    pub free_mb: Option<u64>,
    pub min_free_mb: u64,
}

impl StorageCheck {
    /// Writable, and enough free space when it is known.
    pub fn ok(&self) -> bool {
        self.writable && self.free_mb.map_or(true, |free| free >= self.min_free_mb)
    }
}

/// Downloaded videos, one `<id>.mp4` per item, plus the id -> path hints.
pub struct VideoCache {
    /// Directory holding the downloaded files.
    cache_dir: PathBuf,
    /// Holds the `video_<id>` mappings.
    store: Arc<KvStore>,
    client: reqwest::Client,
    /// Proxy (or direct) URLs downloads go through.
    endpoints: ProxyEndpoints,
    /// Free space below which the storage check warns.
    min_free_mb: u64,
}

impl VideoCache {
    /// Open the cache in `cache_dir`, creating the directory if needed.
    pub fn new(
        cache_dir: PathBuf,
        store: Arc<KvStore>,
        client: reqwest::Client,
        endpoints: ProxyEndpoints,
        min_free_mb: u64,
    ) -> Result<Self> {
        fs::create_dir_all(&cache_dir)?;

        let cache = Self {
            cache_dir,
            store,
            client,
            endpoints,
            min_free_mb,
        };

        tracing::info!(
            "Video cache at {:?}, {} mapped entries",
            cache.cache_dir,
            cache.store.keys_with_prefix(MAPPING_PREFIX).len()
        );

        Ok(cache)
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn mapping_key(id: i64) -> String {
        format!("{}{}", MAPPING_PREFIX, id)
    }

    /// Final location of the cached file for `id`.
    fn cache_path(&self, id: i64) -> PathBuf {
        self.cache_dir
            .join(format!("{}.{}", id, AssetKind::Video.extension()))
    }

    /// Unique temporary file for one download of `id`.
    fn part_path(&self, id: i64) -> PathBuf {
        self.cache_dir.join(format!(
            "{}.{}.{:08x}.part",
            id,
            AssetKind::Video.extension(),
            rand::random::<u32>()
        ))
    }

    async fn is_playable(path: &Path) -> bool {
        match tokio::fs::metadata(path).await {
            Ok(meta) => meta.is_file() && meta.len() > 0,
            Err(_) => false,
        }
    }

    /// Validated local file for `id`. Stale mappings are discarded.
    pub async fn local_path(&self, id: i64) -> Option<PathBuf> {
        let key = Self::mapping_key(id);
        let path = PathBuf::from(self.store.get(&key)?);

        if Self::is_playable(&path).await {
            return Some(path);
        }

        tracing::debug!("Dropping stale cache mapping for {}: {:?}", id, path);
        if let Err(e) = self.store.remove(&key) {
            tracing::warn!("Failed to drop cache mapping for {}: {}", id, e);
        }
        None
    }

    /// Local path when a valid cached file exists, otherwise `remote_url`.
    pub async fn resolve(&self, id: i64, remote_url: &str) -> String {
        match self.local_path(id).await {
            Some(path) => {
                tracing::debug!("Using local video {:?}", path);
                path.to_string_lossy().into_owned()
            }
            None => remote_url.to_string(),
        }
    }

    /// Called when playback of `id` failed: throw away whatever is cached,
    /// download afresh and return the local path, or `remote_url` when the
    /// download fails.
    pub async fn recover_from_playback_failure(
        &self,
        id: i64,
        remote_url: &str,
        mut on_progress: impl FnMut(f64) + Send,
    ) -> String {
        self.recover_with_cancel(id, remote_url, &mut on_progress, None)
            .await
    }

    /// [`Self::recover_from_playback_failure`] with a flag that aborts the
    /// transfer once set.
    pub async fn recover_with_cancel(
        &self,
        id: i64,
        remote_url: &str,
        on_progress: &mut (dyn FnMut(f64) + Send),
        cancel: Option<&AtomicBool>,
    ) -> String {
        tracing::info!("Playback of {} failed, downloading {}", id, remote_url);
        match self.download(id, remote_url, on_progress, cancel).await {
            Ok(path) => path.to_string_lossy().into_owned(),
            Err(e) => {
                tracing::warn!("Download of {} failed, streaming from network: {}", id, e);
                remote_url.to_string()
            }
        }
    }

    async fn download(
        &self,
        id: i64,
        remote_url: &str,
        on_progress: &mut (dyn FnMut(f64) + Send),
        cancel: Option<&AtomicBool>,
    ) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.cache_dir).await?;

        let check = self.check_storage_access().await;
        if !check.ok() {
            tracing::warn!(
                "Storage check failed (writable: {}, free: {:?} MB), downloading anyway",
                check.writable,
                check.free_mb
            );
        }

        // The cached copy may be what failed to play.
        let path = self.cache_path(id);
        remove_if_present(&path).await?;
        self.store.remove(&Self::mapping_key(id))?;

        let part = self.part_path(id);
        let request = self
            .endpoints
            .request(&self.client, AssetKind::Video, remote_url);

        let written = match stream_to_file(request, &part, on_progress, cancel).await {
            Ok(written) => written,
            Err(e) => {
                let _ = remove_if_present(&part).await;
                return Err(e);
            }
        };

        let size = tokio::fs::metadata(&part).await.map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            let _ = remove_if_present(&part).await;
            return Err(Error::download("downloaded file is empty"));
        }

        // Only a complete file ever appears under the final name.
        if let Err(e) = tokio::fs::rename(&part, &path).await {
            let _ = remove_if_present(&part).await;
            return Err(e.into());
        }
        if let Err(e) = self.store.set(&Self::mapping_key(id), &path.to_string_lossy()) {
            let _ = remove_if_present(&path).await;
            return Err(e);
        }

        tracing::info!(
            "Cached {} ({:.2} MB, {} bytes streamed) at {:?}",
            id,
            size as f64 / 1024.0 / 1024.0,
            written,
            path
        );
        Ok(path)
    }

    /// Advisory check run before downloads; never blocks them.
    pub async fn check_storage_access(&self) -> StorageCheck {
        let dir = self.cache_dir.clone();
        let min_free_mb = self.min_free_mb;
        tokio::task::spawn_blocking(move || storage_check(&dir, min_free_mb))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("Storage check did not complete: {}", e);
                StorageCheck {
                    writable: false,
                    free_mb: None,
                    min_free_mb,
                }
            })
    }

    /// Sum of all file sizes in the cache directory. Never fails.
    pub async fn cache_size(&self) -> CacheSize {
        let dir = self.cache_dir.clone();
        tokio::task::spawn_blocking(move || dir_size(&dir))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("Error calculating cache size: {}", e);
                CacheSize(0)
            })
    }

    /// Delete and recreate the cache directory. Mappings left behind are
    /// harmless since lookups re-validate; they are pruned best-effort.
    pub async fn clear_cache(&self) -> bool {
        if let Err(e) = tokio::fs::remove_dir_all(&self.cache_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::error!("Error clearing cache: {}", e);
                return false;
            }
        }
        if let Err(e) = tokio::fs::create_dir_all(&self.cache_dir).await {
            tracing::error!("Error recreating cache directory: {}", e);
            return false;
        }

        match self.store.remove_prefix(MAPPING_PREFIX) {
            Ok(n) => tracing::info!("Cache cleared, {} mappings dropped", n),
            Err(e) => tracing::warn!("Cache cleared but mappings remain: {}", e),
        }
        true
    }
}

async fn remove_if_present(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn storage_check(dir: &Path, min_free_mb: u64) -> StorageCheck {
    let writable = fs::metadata(dir)
        .map(|m| m.is_dir() && !m.permissions().readonly())
        .unwrap_or(false);

    StorageCheck {
        writable,
        free_mb: free_space_mb(dir),
        min_free_mb,
    }
}

fn dir_size(dir: &Path) -> CacheSize {
    if !dir.is_dir() {
        return CacheSize(0);
    }

    let mut total = 0;
    for entry in WalkDir::new(dir).min_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Error calculating cache size: {}", e);
                return CacheSize(0);
            }
        };
        if entry.file_type().is_file() {
            match entry.metadata() {
                Ok(meta) => total += meta.len(),
                Err(e) => {
                    tracing::warn!("Error calculating cache size: {}", e);
                    return CacheSize(0);
                }
            }
        }
    }
    CacheSize(total)
}

/// Free space on the disk holding `dir`, if it can be determined.
fn free_space_mb(dir: &Path) -> Option<u64> {
    let dir = fs::canonicalize(dir).ok()?;
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| dir.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space() / 1024 / 1024)
}

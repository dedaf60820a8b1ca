//! Player controller.
//!
//! Owns what the visible player needs: the current item and its resolved
//! source, playback preferences, and the prefetched next item. The prefetched
//! item is a single field tagged with the item and order it was computed
//! for, so a stale value is never handed to the swipe handler.

use crate::assets::{Category, VideoItem};
use crate::cache::VideoCache;
use crate::error::Result;
use crate::selector::NextVideoSelector;
use crate::settings::{LoopMode, OrderMode, PlaybackSettings, PlaybackSpeed, SettingsStore};
use crate::source::VideoSource;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Stopped,
    Playing,
    Paused,
    Ended,
}

/// What the view should load.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackTarget {
    pub item: VideoItem,
    pub url: String,
    pub rate: f32,
}

/// Next item computed ahead of time, and what it was computed for.
#[derive(Debug, Clone)]
struct Prefetched {
    for_id: i64,
    order: OrderMode,
    item: VideoItem,
}

/// Local download of an item whose source failed to play.
///
/// Owns everything it touches, so it can run on its own task while the
/// controller moves on. Hand the result back through
/// [`PlayerController::apply_recovered`].
pub struct Recovery {
    cache: Arc<VideoCache>,
    id: i64,
    remote_url: String,
    cancel: Arc<AtomicBool>,
}

impl Recovery {
    /// Download the item. Yields its id and the URL to retry with: the local
    /// file, or the remote URL when the download failed or was cancelled.
    pub async fn run(self, mut on_progress: impl FnMut(f64) + Send) -> (i64, String) {
        let url = self
            .cache
            .recover_with_cancel(self.id, &self.remote_url, &mut on_progress, Some(&self.cancel))
            .await;
        (self.id, url)
    }
}

pub struct PlayerController<S> {
    /// User whose videos are played.
    owner: String,
    category: Category,
    selector: NextVideoSelector<S>,
    cache: Arc<VideoCache>,
    /// Write-through for preference changes.
    settings_store: SettingsStore,
    settings: PlaybackSettings,
    current: Option<VideoItem>,
    /// Resolved URL of `current`: a local file or the remote source.
    source_url: Option<String>,
    state: PlayerState,
    prefetched: Option<Prefetched>,
    /// Set to abort the download started for the current item. Replaced by
    /// a fresh flag on every open.
    download_cancel: Arc<AtomicBool>,
}

impl<S: VideoSource> PlayerController<S> {
    pub fn new(
        owner: &str,
        category: Category,
        selector: NextVideoSelector<S>,
        cache: Arc<VideoCache>,
        settings_store: SettingsStore,
    ) -> Self {
        let settings = settings_store.load();
        Self {
            owner: owner.to_string(),
            category,
            selector,
            cache,
            settings_store,
            settings,
            current: None,
            source_url: None,
            state: PlayerState::Stopped,
            prefetched: None,
            download_cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn settings(&self) -> PlaybackSettings {
        self.settings
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    pub fn current(&self) -> Option<&VideoItem> {
        self.current.as_ref()
    }

    pub fn source_url(&self) -> Option<&str> {
        self.source_url.as_deref()
    }

    /// Prefetched next item, if still valid for the current item and order.
    pub fn prefetched(&self) -> Option<&VideoItem> {
        let current = self.current.as_ref()?;
        self.prefetched
            .as_ref()
            .filter(|p| p.for_id == current.id && p.order == self.settings.order)
            .map(|p| &p.item)
    }

    fn target(&self) -> Option<PlaybackTarget> {
        Some(PlaybackTarget {
            item: self.current.clone()?,
            url: self.source_url.clone()?,
            rate: self.settings.speed.rate(),
        })
    }

    /// Make `item` current and resolve its playable URL.
    pub async fn open(&mut self, item: VideoItem) -> PlaybackTarget {
        self.cancel_download();
        self.prefetched = None;

        let remote = item.media().unwrap_or_default().to_string();
        let url = self.cache.resolve(item.id, &remote).await;
        tracing::debug!("Opening {} from {}", item.id, url);

        let target = PlaybackTarget {
            item: item.clone(),
            url: url.clone(),
            rate: self.settings.speed.rate(),
        };
        self.current = Some(item);
        self.source_url = Some(url);
        self.state = PlayerState::Playing;
        target
    }

    pub fn pause(&mut self) {
        if self.state == PlayerState::Playing {
            self.state = PlayerState::Paused;
        }
    }

    pub fn resume(&mut self) {
        if self.state == PlayerState::Paused {
            self.state = PlayerState::Playing;
        }
    }

    /// Abort any in-flight download for the current item.
    pub fn cancel_download(&mut self) {
        self.download_cancel.store(true, Ordering::Relaxed);
        self.download_cancel = Arc::new(AtomicBool::new(false));
    }

    /// Compute the next item ahead of time.
    pub async fn prefetch_next(&mut self) -> Option<&VideoItem> {
        if self.prefetched().is_none() {
            let current = self.current.as_ref()?;
            let for_id = current.id;
            let order = self.settings.order;
            match self.query_next(for_id).await {
                Ok(item) => {
                    self.prefetched = Some(Prefetched {
                        for_id,
                        order,
                        item,
                    });
                }
                Err(e) => {
                    tracing::warn!("Prefetch after {} failed: {}", for_id, e);
                    return None;
                }
            }
        }
        self.prefetched()
    }

    async fn query_next(&self, current_id: i64) -> Result<VideoItem> {
        self.selector
            .next(
                &self.owner,
                current_id,
                self.category,
                self.settings.order.is_random(),
            )
            .await
    }

    /// Playback reached the end of the current item.
    pub async fn on_playback_finished(&mut self) -> Option<PlaybackTarget> {
        self.state = PlayerState::Ended;
        match self.settings.loop_mode {
            LoopMode::Single => {
                self.state = PlayerState::Playing;
                self.target()
            }
            LoopMode::Auto => self.advance().await,
        }
    }

    pub async fn on_swipe_next(&mut self) -> Option<PlaybackTarget> {
        self.advance().await
    }

    /// Move to the next item. On failure the current item stays.
    async fn advance(&mut self) -> Option<PlaybackTarget> {
        let current_id = self.current.as_ref()?.id;

        let next = match self.prefetched().cloned() {
            Some(item) => item,
            None => match self.query_next(current_id).await {
                Ok(item) => item,
                Err(e) => {
                    tracing::warn!("No next video after {}: {}", current_id, e);
                    return None;
                }
            },
        };
        Some(self.open(next).await)
    }

    /// The player could not load the current source. The returned download
    /// is tied to the current item: opening another item or calling
    /// [`Self::cancel_download`] stops it.
    pub fn begin_recovery(&self) -> Option<Recovery> {
        let item = self.current.as_ref()?;
        Some(Recovery {
            cache: self.cache.clone(),
            id: item.id,
            remote_url: item.media()?.to_string(),
            cancel: self.download_cancel.clone(),
        })
    }

    /// Switch to the URL a [`Recovery`] produced, if its item is still
    /// current. Returns whether it was applied.
    pub fn apply_recovered(&mut self, id: i64, url: &str) -> bool {
        if self.current.as_ref().map(|c| c.id) != Some(id) {
            tracing::debug!("Dropping recovered source for {}, no longer current", id);
            return false;
        }
        self.source_url = Some(url.to_string());
        true
    }

    pub fn set_speed(&mut self, speed: PlaybackSpeed) -> f32 {
        self.settings.speed = speed;
        if let Err(e) = self.settings_store.set_speed(speed) {
            tracing::warn!("Failed to save playback speed: {}", e);
        }
        speed.rate()
    }

    pub fn set_loop_mode(&mut self, mode: LoopMode) {
        self.settings.loop_mode = mode;
        if let Err(e) = self.settings_store.set_loop_mode(mode) {
            tracing::warn!("Failed to save loop mode: {}", e);
        }
    }

    pub fn set_order_mode(&mut self, order: OrderMode) {
        if self.settings.order != order {
            self.prefetched = None;
        }
        self.settings.order = order;
        if let Err(e) = self.settings_store.set_order_mode(order) {
            tracing::warn!("Failed to save play order: {}", e);
        }
    }

    /// Hide the current item and move on.
    pub async fn hide_current(&mut self) -> Option<PlaybackTarget> {
        let id = self.current.as_ref()?.id;
        if let Err(e) = self.selector.source().set_hidden(&self.owner, id, true).await {
            tracing::warn!("Failed to hide {}: {}", id, e);
            return None;
        }
        self.prefetched = None;
        self.advance().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::ProxyEndpoints;
    use crate::source::memory::{item, MemorySource};
    use crate::store::KvStore;
    use crate::testing::{CannedResponse, TestServer};
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    struct Fixture {
        dir: TempDir,
        source: Arc<MemorySource>,
        store: Arc<KvStore>,
        player: PlayerController<MemorySource>,
    }

    fn fixture(items: Vec<VideoItem>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(KvStore::open(dir.path().join("store.json")).unwrap());
        let cache = Arc::new(
            VideoCache::new(
                dir.path().join("videos"),
                store.clone(),
                reqwest::Client::new(),
                ProxyEndpoints::default(),
                100,
            )
            .unwrap(),
        );
        let source = Arc::new(MemorySource::new(items));
        let player = PlayerController::new(
            "u1",
            Category::Liked,
            NextVideoSelector::new(source.clone()),
            cache,
            SettingsStore::new(store.clone()),
        );
        Fixture {
            dir,
            source,
            store,
            player,
        }
    }

    fn liked(ids: &[i64]) -> Vec<VideoItem> {
        ids.iter().map(|&id| item(id, Category::Liked)).collect()
    }

    #[tokio::test]
    async fn open_resolves_remote_url() {
        let mut f = fixture(liked(&[5]));
        let target = f.player.open(item(5, Category::Liked)).await;
        assert_eq!(target.url, "https://cdn.example/5.mp4");
        assert_eq!(target.rate, 1.0);
        assert_eq!(f.player.state(), PlayerState::Playing);
    }

    #[tokio::test]
    async fn pause_and_resume_only_from_matching_state() {
        let mut f = fixture(liked(&[5]));
        f.player.pause();
        assert_eq!(f.player.state(), PlayerState::Stopped);

        f.player.open(item(5, Category::Liked)).await;
        f.player.pause();
        assert_eq!(f.player.state(), PlayerState::Paused);
        f.player.resume();
        assert_eq!(f.player.state(), PlayerState::Playing);
    }

    #[tokio::test]
    async fn auto_advance_in_order_wraps() {
        let mut f = fixture(liked(&[3, 5, 9]));
        f.player.set_loop_mode(LoopMode::Auto);
        f.player.open(item(5, Category::Liked)).await;

        let next = f.player.on_playback_finished().await.unwrap();
        assert_eq!(next.item.id, 9);
        let next = f.player.on_playback_finished().await.unwrap();
        assert_eq!(next.item.id, 3);
    }

    #[tokio::test]
    async fn single_loop_replays() {
        let mut f = fixture(liked(&[3, 5, 9]));
        f.player.open(item(5, Category::Liked)).await;
        let again = f.player.on_playback_finished().await.unwrap();
        assert_eq!(again.item.id, 5);
        assert_eq!(f.player.state(), PlayerState::Playing);
    }

    #[tokio::test]
    async fn swipe_uses_prefetched_item() {
        let mut f = fixture(liked(&[1, 2, 3]));
        f.player.open(item(1, Category::Liked)).await;
        assert_eq!(f.player.prefetch_next().await.unwrap().id, 2);

        f.source.set_offline(true);
        let next = f.player.on_swipe_next().await.unwrap();
        assert_eq!(next.item.id, 2);
        // Prefetch belonged to item 1; nothing valid for item 2 yet.
        assert!(f.player.prefetched().is_none());
    }

    #[tokio::test]
    async fn order_change_invalidates_prefetch() {
        let mut f = fixture(liked(&[1, 2, 3]));
        f.player.open(item(1, Category::Liked)).await;
        f.player.prefetch_next().await.unwrap();

        f.player.set_order_mode(OrderMode::Random);
        assert!(f.player.prefetched().is_none());

        let next = f.player.on_swipe_next().await.unwrap();
        assert_ne!(next.item.id, 1);
    }

    #[tokio::test]
    async fn failed_advance_keeps_current() {
        let mut f = fixture(liked(&[1, 2]));
        f.player.open(item(1, Category::Liked)).await;
        f.source.set_offline(true);

        assert!(f.player.on_swipe_next().await.is_none());
        assert_eq!(f.player.current().unwrap().id, 1);
        assert_eq!(f.player.source_url(), Some("https://cdn.example/1.mp4"));
    }

    #[tokio::test]
    async fn settings_are_persisted_on_change() {
        let mut f = fixture(liked(&[1]));
        assert_eq!(f.player.set_speed(PlaybackSpeed::Double), 2.0);
        f.player.set_order_mode(OrderMode::Random);

        let reloaded = SettingsStore::new(f.store.clone()).load();
        assert_eq!(reloaded.speed, PlaybackSpeed::Double);
        assert_eq!(reloaded.order, OrderMode::Random);
        assert_eq!(reloaded.loop_mode, LoopMode::Single);
    }

    #[tokio::test]
    async fn playback_error_switches_to_local_copy() {
        let server = TestServer::start(vec![CannedResponse::ok(vec![3u8; 4096])]).await;
        let mut video = item(4, Category::Liked);
        video.media_url = Some(server.url("/4.mp4"));
        let mut f = fixture(vec![video.clone()]);

        f.player.open(video).await;
        let (id, url) = f.player.begin_recovery().unwrap().run(|_| {}).await;
        assert_eq!(id, 4);
        assert!(url.ends_with("4.mp4"));
        assert!(!url.starts_with("http"));
        assert!(f.player.apply_recovered(id, &url));
        assert_eq!(f.player.source_url(), Some(url.as_str()));
    }

    #[tokio::test]
    async fn opening_another_item_stops_running_download() {
        let server = TestServer::start(vec![CannedResponse::ok(vec![1u8; 1024 * 1024])
            .pause_after(128 * 1024, Duration::from_millis(300))])
        .await;
        let remote = server.url("/1.mp4");
        let mut video = item(1, Category::Liked);
        video.media_url = Some(remote.clone());
        let mut f = fixture(vec![video.clone(), item(2, Category::Liked)]);

        f.player.open(video).await;
        let recovery = f.player.begin_recovery().unwrap();
        let (started_tx, started_rx) = oneshot::channel();
        let mut started = Some(started_tx);
        let task = tokio::spawn(recovery.run(move |_| {
            if let Some(tx) = started.take() {
                let _ = tx.send(());
            }
        }));

        started_rx.await.unwrap();
        f.player.open(item(2, Category::Liked)).await;
        let (id, url) = task.await.unwrap();

        assert_eq!(url, remote);
        assert!(!f.player.apply_recovered(id, &url));
        assert_eq!(f.player.source_url(), Some("https://cdn.example/2.mp4"));
        assert!(fs::read_dir(f.dir.path().join("videos")).unwrap().next().is_none());
        assert_eq!(f.store.get("video_1"), None);
    }

    #[tokio::test]
    async fn cancel_download_keeps_remote_source() {
        let server = TestServer::start(vec![CannedResponse::ok(vec![1u8; 1024 * 1024])]).await;
        let mut video = item(3, Category::Liked);
        video.media_url = Some(server.url("/3.mp4"));
        let mut f = fixture(vec![video.clone()]);

        f.player.open(video).await;
        let recovery = f.player.begin_recovery().unwrap();
        f.player.cancel_download();
        let (id, url) = recovery.run(|_| {}).await;

        assert!(f.player.apply_recovered(id, &url));
        assert_eq!(f.player.source_url(), Some(server.url("/3.mp4").as_str()));
        assert_eq!(f.store.get("video_3"), None);
    }

    #[tokio::test]
    async fn hide_current_moves_on() {
        let mut f = fixture(liked(&[1, 2, 3]));
        f.player.open(item(2, Category::Liked)).await;
        let next = f.player.hide_current().await.unwrap();
        assert_eq!(next.item.id, 3);

        let next = f.player.on_swipe_next().await.unwrap();
        assert_eq!(next.item.id, 1);
        let next = f.player.on_swipe_next().await.unwrap();
        assert_eq!(next.item.id, 3);
    }
}

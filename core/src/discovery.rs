//! Component H: discovery and enrichment driver (spec §4.8).
//!
//! Two responsibilities: an initial recursive walk seeding bare index rows,
//! and a chained sequential enrichment loop (file info → EXIF → HLS
//! pre-encode) over watermark-filtered batches. The optional `notify`-based
//! watcher (behind the `location-watcher` feature) is adapted from the
//! teacher's `LocationWatcher` (`core/src/location/manager/watcher/mod.rs`):
//! a `tokio::select!` loop with periodic-tick debounce, dispatching
//! add/change/unlink/error events.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use media_encoders::{StillResizer, VideoTool};

use crate::cache::CacheLayout;
use crate::error::Result;
use crate::index::IndexStore;
use crate::metadata;
use crate::path;
use crate::scheduler::{MediaType, Priority, Scheduler};
use crate::singleflight::SingleFlight;

const BATCH_SIZE: u32 = 200;
const DISCOVERY_LOG_INTERVAL: u64 = 10_000;
const PROGRESS_LOG_MIN_INTERVAL: Duration = Duration::from_secs(1);
const IDLE_SLEEP: Duration = Duration::from_millis(500);
const PAUSE_RECHECK: Duration = Duration::from_millis(100);

/// Shared handle wiring the index, cache, scheduler, and encoder tools
/// together for discovery, enrichment, and the request orchestrator alike
/// (one process-lifetime instance per spec §5's "shared resources").
pub struct Driver {
    pub media_root: PathBuf,
    pub index: IndexStore,
    pub cache: CacheLayout,
    pub scheduler: Scheduler,
    pub video_tool: VideoTool,
    pub still_resizer: StillResizer,
    pub auto_pause: Duration,
    /// Coalesces concurrent still/HLS requests for the same `(hash, variant)`
    /// onto one encoder invocation (spec §8 scenario 4).
    pub derivative_flight: SingleFlight<String>,
    scanned_files_count: AtomicU64,
    active_transcodes: AtomicU64,
}

impl Driver {
    pub fn new(
        media_root: PathBuf,
        index: IndexStore,
        cache: CacheLayout,
        scheduler: Scheduler,
        video_tool: VideoTool,
        still_resizer: StillResizer,
        auto_pause: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            media_root,
            index,
            cache,
            scheduler,
            video_tool,
            still_resizer,
            auto_pause,
            derivative_flight: SingleFlight::new(),
            scanned_files_count: AtomicU64::new(0),
            active_transcodes: AtomicU64::new(0),
        })
    }

    pub fn scanned_files_count(&self) -> u64 {
        self.scanned_files_count.load(Ordering::Relaxed)
    }

    pub fn active_transcodes(&self) -> u64 {
        self.active_transcodes.load(Ordering::Relaxed)
    }

    /// Marks one encoder invocation in flight for the lifetime of the
    /// returned guard, for `/api/status`'s `transcodes.active` count.
    pub fn begin_transcode(&self) -> TranscodeGuard<'_> {
        self.active_transcodes.fetch_add(1, Ordering::Relaxed);
        TranscodeGuard { driver: self }
    }

    /// Recursive walk of the media root, seeding bare `(folder, fileName,
    /// mimeType)` rows. Runs as a background task so startup is not
    /// blocked on a full scan of a large tree.
    pub async fn discover(self: Arc<Self>) -> Result<()> {
        let root = self.media_root.clone();
        let mut batch = Vec::with_capacity(BATCH_SIZE as usize);
        let mut total = 0u64;

        for entry in WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = path::to_relative(&root, entry.path()) else {
                continue;
            };
            let (folder, file_name) = path::split(&relative);
            let mime = path::mime_for_filename(&file_name).map(str::to_string);
            batch.push((folder, file_name, mime));
            total += 1;

            if batch.len() as u32 >= BATCH_SIZE {
                self.index.insert_bare_paths(std::mem::take(&mut batch)).await?;
            }
            if total % DISCOVERY_LOG_INTERVAL == 0 {
                info!(total, "discovery progress");
            }
        }
        if !batch.is_empty() {
            self.index.insert_bare_paths(batch).await?;
        }
        self.scanned_files_count.store(total, Ordering::Relaxed);
        info!(total, "discovery complete");
        Ok(())
    }

    /// Runs the chained sequential enrichment stages forever, always
    /// preferring to fully drain an earlier stage before advancing, so new
    /// rows added by discovery or the watcher are picked up without a
    /// restart. Each iteration re-checks the scheduler's pause state.
    pub async fn run_enrichment_loop(self: Arc<Self>) {
        let mut last_progress_log = Instant::now();
        let mut processed_since_log = 0u64;

        loop {
            if self.scheduler.is_paused() {
                sleep(PAUSE_RECHECK).await;
                continue;
            }

            let info_done = match self.process_info_batch().await {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "file-info enrichment batch failed");
                    0
                }
            };
            processed_since_log += info_done as u64;

            if info_done == 0 {
                let exif_done = match self.process_exif_batch().await {
                    Ok(n) => n,
                    Err(e) => {
                        warn!(error = %e, "exif enrichment batch failed");
                        0
                    }
                };
                processed_since_log += exif_done as u64;

                if exif_done == 0 {
                    let hls_done = match self.process_hls_batch().await {
                        Ok(n) => n,
                        Err(e) => {
                            warn!(error = %e, "HLS pre-encode batch failed");
                            0
                        }
                    };
                    processed_since_log += hls_done as u64;

                    if hls_done == 0 {
                        sleep(IDLE_SLEEP).await;
                    }
                }
            }

            if last_progress_log.elapsed() >= PROGRESS_LOG_MIN_INTERVAL && processed_since_log > 0 {
                let rate = processed_since_log as f64 / last_progress_log.elapsed().as_secs_f64();
                debug!(rate = format!("{rate:.1}/s"), "enrichment progress");
                last_progress_log = Instant::now();
                processed_since_log = 0;
            }
        }
    }

    async fn process_info_batch(&self) -> Result<usize> {
        let rows = self.index.batch_missing_info(BATCH_SIZE).await?;
        if rows.is_empty() {
            return Ok(0);
        }
        for row in &rows {
            let relative = row.relative_path();
            let absolute = self.media_root.join(&relative);
            let mut update = metadata::get_file_info(&absolute).await.unwrap_or_default();
            update.info_processed_at = Some(now_ms());
            self.index.add_or_update_file_data(relative, update).await?;
        }
        Ok(rows.len())
    }

    async fn process_exif_batch(&self) -> Result<usize> {
        let rows = self.index.batch_missing_exif(BATCH_SIZE).await?;
        if rows.is_empty() {
            return Ok(0);
        }
        for row in &rows {
            let relative = row.relative_path();
            let absolute = self.media_root.join(&relative);
            let mut update = metadata::get_exif(&absolute, row.mime_type.as_deref(), &self.video_tool)
                .await
                .unwrap_or_default();
            update.exif_processed_at = Some(now_ms());
            self.index.add_or_update_file_data(relative, update).await?;
        }
        Ok(rows.len())
    }

    async fn process_hls_batch(&self) -> Result<usize> {
        let rows = self.index.batch_video_exif_done(BATCH_SIZE).await?;
        let mut processed = 0usize;
        for row in rows {
            let relative = row.relative_path();
            let absolute = self.media_root.join(&relative);
            let mtime_ms = row.modified.unwrap_or(0);
            let hash = crate::cache::source_hash(&absolute, mtime_ms);

            if self.cache.hls_ladder_exists(&hash).await {
                self.mark_hls_processed(relative).await;
                continue;
            }
            processed += 1;

            let _guard = self.begin_transcode();
            let cache = self.cache.clone();
            let video_tool = self.video_tool.clone();
            let rx = self.scheduler.enqueue(Priority::Background, MediaType::Video, async move {
                let out_dir = cache.hls_dir(&hash);
                video_tool
                    .hls(&absolute, &out_dir, media_encoders::DEFAULT_LADDER, |_, _| {})
                    .await
            });
            // Await completion before moving to the next row (spec §4.8).
            match rx.await {
                Ok(Ok(())) => self.mark_hls_processed(relative).await,
                Ok(Err(e)) => warn!(path = %relative, error = %e, "HLS pre-encode failed"),
                Err(_) => warn!(path = %relative, "HLS pre-encode task dropped"),
            }
        }
        Ok(processed)
    }

    async fn mark_hls_processed(&self, relative: String) {
        let update = crate::model::FileRecord {
            hls_processed_at: Some(now_ms()),
            ..Default::default()
        };
        if let Err(e) = self.index.add_or_update_file_data(relative.clone(), update).await {
            warn!(path = %relative, error = %e, "failed to mark HLS watermark");
        }
    }
}

/// RAII decrement for `Driver::active_transcodes`.
pub struct TranscodeGuard<'a> {
    driver: &'a Driver,
}

impl Drop for TranscodeGuard<'_> {
    fn drop(&mut self) {
        self.driver.active_transcodes.fetch_sub(1, Ordering::Relaxed);
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(feature = "location-watcher")]
pub mod watcher {
    //! Live filesystem watching, adapted from the teacher's
    //! `LocationWatcher` (`core/src/location/manager/watcher/mod.rs`):
    //! a `notify` event stream bridged into a `tokio::select!` loop with a
    //! periodic tick driving debounce expiry.

    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
    use tokio::sync::mpsc;
    use tracing::{error, info, warn};

    use super::Driver;
    use crate::path;

    const UNLINK_DEBOUNCE: Duration = Duration::from_millis(500);
    const MOVE_DETECT_WINDOW: Duration = Duration::from_millis(500);
    const MTIME_TOLERANCE_MS: i64 = 20;
    const TICK: Duration = Duration::from_millis(100);

    struct PendingUnlink {
        relative_path: String,
        size: Option<i64>,
        modified_ms: Option<i64>,
        at: Instant,
    }

    /// Starts watching `driver.media_root` for changes; runs until the
    /// returned task is aborted or the process exits.
    pub fn spawn(driver: Arc<Driver>) -> Result<tokio::task::JoinHandle<()>, notify::Error> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();

        let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => error!(error = %e, "watcher error"),
            }
        })?;
        watcher.watch(&driver.media_root, RecursiveMode::Recursive)?;

        let handle = tokio::spawn(async move {
            // Keep the watcher alive for the lifetime of the task.
            let _watcher = watcher;
            let mut pending_unlinks: HashMap<String, PendingUnlink> = HashMap::new();
            let mut tick = tokio::time::interval(TICK);

            loop {
                tokio::select! {
                    event = rx.recv() => {
                        match event {
                            Some(event) => handle_event(&driver, &mut pending_unlinks, event).await,
                            None => break,
                        }
                    }
                    _ = tick.tick() => {
                        expire_unlinks(&driver, &mut pending_unlinks).await;
                    }
                }
            }
            info!("location watcher stopped");
        });

        Ok(handle)
    }

    async fn handle_event(driver: &Arc<Driver>, pending: &mut HashMap<String, PendingUnlink>, event: Event) {
        match event.kind {
            EventKind::Create(_) => {
                for abs_path in event.paths {
                    let Ok(relative) = path::to_relative(&driver.media_root, &abs_path) else { continue };
                    handle_add(driver, pending, relative, &abs_path).await;
                }
            }
            EventKind::Modify(_) => {
                for abs_path in event.paths {
                    let Ok(relative) = path::to_relative(&driver.media_root, &abs_path) else { continue };
                    handle_change(driver, relative).await;
                }
            }
            EventKind::Remove(_) => {
                for abs_path in event.paths {
                    let Ok(relative) = path::to_relative(&driver.media_root, &abs_path) else { continue };
                    handle_unlink(driver, pending, relative).await;
                }
            }
            EventKind::Other | EventKind::Any | EventKind::Access(_) => {}
        }
    }

    async fn handle_add(
        driver: &Arc<Driver>,
        pending: &mut HashMap<String, PendingUnlink>,
        relative: String,
        abs_path: &std::path::Path,
    ) {
        let info = match crate::metadata::get_file_info(abs_path).await {
            Ok(info) => info,
            Err(_) => return,
        };

        let moved_from = pending.iter().find(|(_, p)| {
            p.at.elapsed() <= MOVE_DETECT_WINDOW
                && p.size == info.size_in_bytes
                && match (p.modified_ms, info.modified) {
                    (Some(a), Some(b)) => (a - b).abs() <= MTIME_TOLERANCE_MS,
                    _ => true,
                }
        }).map(|(k, _)| k.clone());

        if let Some(old_relative) = moved_from {
            pending.remove(&old_relative);
            if let Err(e) = driver.index.move_file(old_relative.clone(), relative.clone()).await {
                warn!(old = %old_relative, new = %relative, error = %e, "move-detected rename failed");
            }
            return;
        }

        let (folder, file_name) = path::split(&relative);
        let mime = path::mime_for_filename(&file_name).map(str::to_string);
        let _ = driver.index.insert_bare_paths(vec![(folder, file_name, mime)]).await;
    }

    async fn handle_change(driver: &Arc<Driver>, relative: String) {
        // A `None` field in an upsert leaves the existing column untouched
        // (COALESCE merge), so re-queuing for enrichment needs a dedicated
        // clear rather than routing through `add_or_update_file_data`.
        if let Err(e) = driver.index.clear_watermarks(relative.clone()).await {
            warn!(path = %relative, error = %e, "failed to clear watermarks on change");
        }
    }

    async fn handle_unlink(driver: &Arc<Driver>, pending: &mut HashMap<String, PendingUnlink>, relative: String) {
        let existing = driver.index.get(relative.clone()).await.ok().flatten();
        pending.insert(
            relative.clone(),
            PendingUnlink {
                relative_path: relative,
                size: existing.as_ref().and_then(|r| r.size_in_bytes),
                modified_ms: existing.and_then(|r| r.modified),
                at: Instant::now(),
            },
        );
    }

    async fn expire_unlinks(driver: &Arc<Driver>, pending: &mut HashMap<String, PendingUnlink>) {
        let expired: Vec<String> = pending
            .iter()
            .filter(|(_, p)| p.at.elapsed() > UNLINK_DEBOUNCE)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if let Some(p) = pending.remove(&key) {
                let _ = driver.index.delete_file(p.relative_path).await;
            }
        }
    }
}

//! Component J: status reporter (spec §4.10).
//!
//! A snapshot function shared by a plain JSON endpoint and a 1 Hz SSE
//! stream, following the teacher's `core/src/api/jobs.rs` `progress`
//! subscription idiom (`async_stream::stream!` over a periodic signal)
//! adapted from an rspc subscription to a bare `text/event-stream`.

use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use futures::Stream;
use serde::Serialize;
use tracing::warn;

use crate::discovery::Driver;
use crate::error::Result;
use crate::http::{ApiError, AppContext};
use crate::model::FileRecord;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageProgress {
    pub completed: u64,
    pub total: u64,
    pub percent: f64,
}

impl StageProgress {
    fn new(completed: u64, total: u64) -> Self {
        let percent = if total == 0 { 0.0 } else { (completed as f64 / total as f64) * 100.0 };
        Self { completed, total, percent }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSnapshot {
    pub info: u64,
    pub exif: u64,
    pub thumbnails: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub info: StageProgress,
    pub exif: StageProgress,
    pub thumbnails: StageProgress,
    /// Average of every stage with a non-zero `total` (spec §4.10); a
    /// library with no video files simply drops `thumbnails` from the
    /// average rather than dragging it to 100%.
    pub overall: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentItem {
    pub path: String,
    pub processed_at: i64,
}

impl RecentItem {
    fn new(record: FileRecord, processed_at: i64) -> Self {
        Self { path: record.relative_path(), processed_at }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentSnapshot {
    pub thumbnail: Option<RecentItem>,
    pub exif: Option<RecentItem>,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscodesSnapshot {
    pub active: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub database_size: u64,
    pub scanned_files_count: u64,
    pub pending: PendingSnapshot,
    pub progress: ProgressSnapshot,
    pub recent: RecentSnapshot,
    pub transcodes: TranscodesSnapshot,
}

const STREAM_INTERVAL: Duration = Duration::from_secs(1);

pub async fn snapshot(ctx: &Driver) -> Result<StatusSnapshot> {
    let database_size = ctx.index.row_count().await?;
    let video_count = ctx.index.video_count().await?;
    let pending = ctx.index.pending_counts().await?;

    let info = StageProgress::new(database_size.saturating_sub(pending.info), database_size);
    let exif = StageProgress::new(database_size.saturating_sub(pending.exif), database_size);
    let thumbnails = StageProgress::new(video_count.saturating_sub(pending.thumbnails), video_count);

    let stage_percents: Vec<f64> = [info, exif, thumbnails]
        .into_iter()
        .filter(|s| s.total > 0)
        .map(|s| s.percent)
        .collect();
    let overall = if stage_percents.is_empty() {
        0.0
    } else {
        stage_percents.iter().sum::<f64>() / stage_percents.len() as f64
    };

    let recent_thumbnail = ctx
        .index
        .most_recent_by_watermark("hls_processed_at")
        .await?
        .map(|r| {
            let at = r.hls_processed_at.unwrap_or(0);
            RecentItem::new(r, at)
        });
    let recent_exif = ctx
        .index
        .most_recent_by_watermark("exif_processed_at")
        .await?
        .map(|r| {
            let at = r.exif_processed_at.unwrap_or(0);
            RecentItem::new(r, at)
        });

    Ok(StatusSnapshot {
        database_size,
        scanned_files_count: ctx.scanned_files_count(),
        pending: PendingSnapshot { info: pending.info, exif: pending.exif, thumbnails: pending.thumbnails },
        progress: ProgressSnapshot { info, exif, thumbnails, overall },
        recent: RecentSnapshot { thumbnail: recent_thumbnail, exif: recent_exif },
        transcodes: TranscodesSnapshot { active: ctx.active_transcodes() },
    })
}

pub async fn handle_status(ctx: AppContext) -> std::result::Result<Response, ApiError> {
    let snap = snapshot(&ctx).await?;
    Ok(Json(snap).into_response())
}

/// `/api/status/stream`: the same payload as `handle_status`, re-sent once
/// a second until the client disconnects (axum drops the stream then).
pub fn handle_status_stream(ctx: AppContext) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        let mut ticker = tokio::time::interval(STREAM_INTERVAL);
        loop {
            ticker.tick().await;
            match snapshot(&ctx).await {
                Ok(snap) => {
                    let json = serde_json::to_string(&snap).unwrap_or_else(|_| "{}".to_string());
                    yield Ok(Event::default().data(json));
                }
                Err(e) => warn!(error = %e, "status snapshot failed"),
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

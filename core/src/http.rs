//! Component I: request orchestrator (spec §4.9).
//!
//! Plain async functions, one per endpoint, taking the shared [`Driver`] as
//! context. A thin `axum` router in the `media-server` binary extracts
//! query parameters with `axum::extract::Query` and the `Range` header
//! itself, then calls straight into these. Every request pauses the
//! scheduler first (spec §5: requests are the "user is looking" signal the
//! priority order exists for).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::cache::StandardHeight;
use crate::discovery::Driver;
use crate::error::Error;
use crate::filter::{self, Filter, FilterCondition, GeoBounds, LogicalFilter, LogicalOp};
use crate::index::QueryOptions;
use crate::model::{FileRecord, Representation};
use crate::path;
use crate::scheduler::{MediaType, Priority};

/// Shared process context, as an `Arc` so background/enqueued tasks can
/// hold their own owning handle independent of the request future.
pub type AppContext = Arc<Driver>;

/// A response too large to return in one piece for this deployment.
/// Matched against `Config`'s absence of pagination rather than a hard
/// protocol limit; chosen generously since the wire format has no
/// streaming-JSON fallback (spec §4.9's 413 case).
const MAX_JSON_RESPONSE_BYTES: usize = 16 * 1024 * 1024;

const DEFAULT_PAGE_SIZE: u32 = 100;
const DEFAULT_STILL_HEIGHT: u32 = 640;

/// Wraps [`Error`] for `IntoResponse`, mapping variants to the status-code
/// table in spec §6.1/§7.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            Error::PathEscape { .. } => (StatusCode::FORBIDDEN, self.0.to_string()),
            Error::NotFound(_) | Error::NotIndexed(_) => (StatusCode::NOT_FOUND, self.0.to_string()),
            Error::CorruptInput(_) => (StatusCode::UNPROCESSABLE_ENTITY, self.0.to_string()),
            Error::Encoder(media_encoders::EncoderError::CorruptInput { .. }) => {
                (StatusCode::UNPROCESSABLE_ENTITY, self.0.to_string())
            }
            Error::Encoder(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string()),
            Error::ResponseTooLarge(_) => (StatusCode::PAYLOAD_TOO_LARGE, self.0.to_string()),
            Error::RangeUnsatisfiable => (StatusCode::RANGE_NOT_SATISFIABLE, self.0.to_string()),
            Error::BadRequest(_) => (StatusCode::BAD_REQUEST, self.0.to_string()),
            Error::ContentionRetry | Error::CacheInit(_) | Error::Io(_) | Error::Store(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string())
            }
        };
        let body = serde_json::json!({ "error": status.as_u16(), "message": message });
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryParams {
    pub filter: Option<String>,
    pub metadata: Option<String>,
    pub page: Option<u32>,
    #[serde(rename = "pageSize")]
    pub page_size: Option<u32>,
    pub count: Option<bool>,
    pub aggregate: Option<String>,
    pub cluster: Option<bool>,
    #[serde(rename = "clusterSize")]
    pub cluster_size: Option<f64>,
    pub west: Option<f64>,
    pub south: Option<f64>,
    #[serde(rename = "includeSubfolders")]
    pub include_subfolders: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileParams {
    pub representation: Option<String>,
    pub height: Option<u32>,
    pub segment: Option<String>,
}

pub async fn handle_health() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

pub async fn handle_folders(
    ctx: AppContext,
    folder_path: String,
) -> Result<Response, ApiError> {
    let folder = path::normalize_folder(&folder_path);
    let names = ctx.index.folders(folder).await?;
    Ok(Json(serde_json::json!({ "folders": names })).into_response())
}

/// Query mode (spec §4.9): `/api/files/<path>/?<q>`. Combines a
/// non-negotiable folder scope with the caller's own `filter=`, then
/// branches on `count` / `aggregate` / `cluster` before falling through to
/// the ordinary paginated listing.
pub async fn handle_query(
    ctx: AppContext,
    folder_path: String,
    params: QueryParams,
) -> Result<Response, ApiError> {
    ctx.scheduler.pause(ctx.auto_pause);

    let folder = path::normalize_folder(&folder_path);
    let recursive = params.include_subfolders.unwrap_or(false);
    let folder_filter = Filter::Condition(FilterCondition {
        fields: vec![("folder".to_string(), crate::filter::Constraint::Folder { folder, recursive })],
    });

    let combined_filter = match params.filter.as_deref() {
        Some(raw) => {
            let user_filter = filter::parse(raw)?;
            Filter::Logical(LogicalFilter {
                operation: LogicalOp::And,
                conditions: vec![folder_filter, user_filter],
            })
        }
        None => folder_filter,
    };

    if params.count.unwrap_or(false) {
        let n = ctx.index.count(Some(combined_filter)).await?;
        return json_response(&serde_json::json!({ "count": n }));
    }

    if let Some(aggregate) = params.aggregate.as_deref() {
        return handle_aggregate(&ctx, combined_filter, aggregate, &params).await;
    }

    if params.cluster.unwrap_or(false) {
        return handle_cluster(&ctx, combined_filter, &params).await;
    }

    let page = params.page.unwrap_or(1).max(1);
    let page_size = params.page_size.unwrap_or(DEFAULT_PAGE_SIZE).max(1);
    let result = ctx
        .index
        .query(QueryOptions { filter: Some(combined_filter), page, page_size })
        .await?;

    let fields = parse_metadata_fields(params.metadata.as_deref());
    let items: Vec<JsonValue> = result.items.iter().map(|r| record_to_json(r, fields.as_deref())).collect();
    json_response(&serde_json::json!({
        "items": items,
        "total": result.total,
        "page": result.page,
        "pageSize": result.page_size,
    }))
}

async fn handle_aggregate(
    ctx: &Driver,
    combined_filter: Filter,
    aggregate: &str,
    _params: &QueryParams,
) -> Result<Response, ApiError> {
    let all = ctx
        .index
        .query(QueryOptions { filter: Some(combined_filter), page: 1, page_size: u32::MAX })
        .await?;

    match aggregate {
        "dateRange" => {
            let range = filter::date_range(&all.items);
            json_response(&serde_json::json!({ "minDate": range.min_date, "maxDate": range.max_date }))
        }
        "dateHistogram" => {
            let dates: Vec<i64> = all.items.iter().filter_map(|r| r.date_taken).collect();
            let buckets = filter::date_histogram(dates);
            let payload: Vec<_> = buckets
                .iter()
                .map(|b| serde_json::json!({ "start": b.start_ms, "end": b.end_ms, "count": b.count }))
                .collect();
            json_response(&serde_json::json!({ "buckets": payload }))
        }
        other => Err(Error::BadRequest(format!("unknown aggregate `{other}`")).into()),
    }
}

async fn handle_cluster(
    ctx: &Driver,
    combined_filter: Filter,
    params: &QueryParams,
) -> Result<Response, ApiError> {
    let all = ctx
        .index
        .query(QueryOptions { filter: Some(combined_filter), page: 1, page_size: u32::MAX })
        .await?;

    let cluster_size = params.cluster_size.unwrap_or(1.0);
    let bounds = match (params.south, params.west) {
        (Some(south), Some(west)) => Some(GeoBounds { south, west }),
        _ => None,
    };
    let clusters = filter::geo_clusters(&all.items, cluster_size, bounds);
    let payload: Vec<_> = clusters
        .into_iter()
        .map(|c| {
            serde_json::json!({
                "centerLat": c.center_lat,
                "centerLon": c.center_lon,
                "count": c.count,
                "sample": record_to_json(&c.sample, None),
            })
        })
        .collect();
    json_response(&serde_json::json!({ "clusters": payload }))
}

fn parse_metadata_fields(raw: Option<&str>) -> Option<Vec<String>> {
    let raw = raw?;
    if let Ok(JsonValue::Array(arr)) = serde_json::from_str::<JsonValue>(raw) {
        return Some(arr.into_iter().filter_map(|v| v.as_str().map(str::to_string)).collect());
    }
    Some(raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
}

fn record_to_json(record: &FileRecord, fields: Option<&[String]>) -> JsonValue {
    let full = serde_json::to_value(record).expect("FileRecord always serialises");
    match fields {
        None => full,
        Some(fields) => {
            let mut picked = serde_json::Map::new();
            if let JsonValue::Object(map) = full {
                for f in fields {
                    if let Some(v) = map.get(f) {
                        picked.insert(f.clone(), v.clone());
                    }
                }
            }
            JsonValue::Object(picked)
        }
    }
}

fn json_response(value: &JsonValue) -> Result<Response, ApiError> {
    let bytes = serde_json::to_vec(value).map_err(|e| Error::BadRequest(e.to_string()))?;
    if bytes.len() > MAX_JSON_RESPONSE_BYTES {
        return Err(Error::ResponseTooLarge(
            "narrow the `metadata` field list, `pageSize`, or filter further".to_string(),
        )
        .into());
    }
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        bytes,
    )
        .into_response())
}

/// File mode (spec §4.9): `/api/files/<path>`. Dispatches on
/// `representation` and the record's media kind (rules 1-5).
pub async fn handle_file(
    ctx: AppContext,
    relative_path: String,
    params: FileParams,
    range_header: Option<String>,
) -> Result<Response, ApiError> {
    ctx.scheduler.pause(ctx.auto_pause);

    // Escape check first (spec §4.9 rule 1): a path that lexically walks
    // above the media root is rejected with 403 whether or not it exists.
    let candidate = path::resolve_under_root(&ctx.media_root, &relative_path)?;
    let meta = tokio::fs::metadata(&candidate)
        .await
        .map_err(|_| Error::NotFound(relative_path.clone()))?;
    if !meta.is_file() {
        return Err(Error::NotFound(relative_path).into());
    }
    let relative = path::to_relative(&ctx.media_root, &candidate)?;
    let absolute = ctx.media_root.join(&relative);

    let representation: Representation = params
        .representation
        .as_deref()
        .unwrap_or("")
        .parse()
        .map_err(ApiError)?;

    if representation == Representation::Metadata {
        let record = ctx.index.get(relative.clone()).await?.ok_or(Error::NotIndexed(relative))?;
        return Ok(Json(serde_json::to_value(&record).expect("FileRecord always serialises")).into_response());
    }

    if representation == Representation::Hls {
        return handle_hls(&ctx, &absolute, &relative, &meta, params.segment.as_deref()).await;
    }

    let record = ctx.index.get(relative.clone()).await?.unwrap_or_default();
    let is_video = is_video_path(&record, &relative);
    let is_image = !is_video && is_image_path(&record, &relative);

    if representation.is_still_derivative() {
        if is_video {
            return handle_video_still(&ctx, &absolute, &meta, params.height).await;
        }
        if is_image {
            return handle_image_still(&ctx, &absolute, &meta, params.height).await;
        }
    }

    stream_original(&absolute, &meta, range_header.as_deref()).await
}

fn is_video_path(record: &FileRecord, relative: &str) -> bool {
    if record.mime_type.is_some() {
        return record.is_video();
    }
    path::mime_for_filename(relative).is_some_and(media_file_ext::is_video_mime)
}

fn is_image_path(record: &FileRecord, relative: &str) -> bool {
    if record.mime_type.is_some() {
        return record.is_image();
    }
    path::mime_for_filename(relative).is_some_and(media_file_ext::is_image_mime)
}

fn modified_ms(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}

/// Video + still-derivative representation (rule 3): a single frame grab at
/// the requested (or default) height, awaited at `userBlocked` priority.
/// The cache variant is keyed on bare `height` alone (spec §4.2) so a
/// `resize`/`webSafe`/`preview` request for the same height shares one
/// derivative instead of each minting its own copy.
async fn handle_video_still(
    ctx: &AppContext,
    absolute: &Path,
    meta: &std::fs::Metadata,
    requested_height: Option<u32>,
) -> Result<Response, ApiError> {
    let hash = crate::cache::source_hash(absolute, modified_ms(meta));
    let height = requested_height.unwrap_or(DEFAULT_STILL_HEIGHT);
    let variant = height.to_string();
    let final_path = ctx.cache.still_path(&hash, &variant, "jpg");

    if !path_exists(&final_path).await {
        let flight_key = format!("{hash}:{variant}");
        let ctx2 = ctx.clone();
        let absolute2 = absolute.to_path_buf();
        let final2 = final_path.clone();
        ctx.derivative_flight
            .work(flight_key, async move {
                let ctx3 = ctx2.clone();
                let rx = ctx2.scheduler.enqueue(Priority::UserBlocked, MediaType::Video, async move {
                    let _guard = ctx3.begin_transcode();
                    ensure_video_thumbnail(&ctx3, &absolute2, &final2, height).await
                });
                rx.await.map_err(|_| Error::Store("video thumbnail task dropped".to_string()))?
            })
            .await?;
    }

    serve_static_file(&final_path, "image/jpeg").await
}

async fn ensure_video_thumbnail(
    ctx: &Driver,
    absolute: &Path,
    final_path: &Path,
    height: u32,
) -> Result<(), Error> {
    let guard = crate::cache::CacheWriteGuard::new(final_path.to_path_buf());
    ctx.video_tool.thumbnail(absolute, guard.part_path(), height).await?;
    guard.commit().await?;
    Ok(())
}

/// Image + non-original representation (rule 4): background-generate every
/// standard height at `userImplicit`, but await the specifically requested
/// height at `userBlocked` so this request doesn't stall on the whole
/// ladder.
async fn handle_image_still(
    ctx: &AppContext,
    absolute: &Path,
    meta: &std::fs::Metadata,
    requested_height: Option<u32>,
) -> Result<Response, ApiError> {
    let hash = crate::cache::source_hash(absolute, modified_ms(meta));
    let requested = StandardHeight::smallest_at_least(requested_height.unwrap_or(DEFAULT_STILL_HEIGHT));
    let final_path = still_variant_path(ctx, &hash, requested);

    if !path_exists(&final_path).await {
        let pixels = requested.pixels().unwrap_or(DEFAULT_STILL_HEIGHT);
        let flight_key = format!("{hash}:{}", requested.label());
        let ctx2 = ctx.clone();
        let absolute2 = absolute.to_path_buf();
        let final2 = final_path.clone();
        ctx.derivative_flight
            .work(flight_key, async move {
                let ctx3 = ctx2.clone();
                let rx = ctx2.scheduler.enqueue(Priority::UserBlocked, MediaType::Image, async move {
                    let _guard = ctx3.begin_transcode();
                    ensure_still(&ctx3, &absolute2, &final2, pixels).await
                });
                rx.await.map_err(|_| Error::Store("still resize task dropped".to_string()))?
            })
            .await?;
    }

    for height in StandardHeight::LADDER {
        if height == requested || height == StandardHeight::Original {
            continue;
        }
        let Some(pixels) = height.pixels() else { continue };
        let path = still_variant_path(ctx, &hash, height);
        if path_exists(&path).await {
            continue;
        }
        let flight_key = format!("{hash}:{}", height.label());
        let ctx_flight = ctx.clone();
        let absolute2 = absolute.to_path_buf();
        tokio::spawn(async move {
            let ctx2 = ctx_flight.clone();
            let _ = ctx_flight
                .derivative_flight
                .work(flight_key, async move {
                    let ctx3 = ctx2.clone();
                    let rx = ctx2.scheduler.enqueue(Priority::UserImplicit, MediaType::Image, async move {
                        let _guard = ctx3.begin_transcode();
                        ensure_still(&ctx3, &absolute2, &path, pixels).await
                    });
                    rx.await.map_err(|_| Error::Store("still resize task dropped".to_string()))?
                })
                .await;
        });
    }

    serve_static_file(&final_path, "image/jpeg").await
}

fn still_variant_path(ctx: &Driver, hash: &str, height: StandardHeight) -> PathBuf {
    ctx.cache.still_path(hash, &height.label(), "jpg")
}

async fn ensure_still(
    ctx: &Driver,
    absolute: &Path,
    final_path: &Path,
    pixels: u32,
) -> Result<(), Error> {
    let guard = crate::cache::CacheWriteGuard::new(final_path.to_path_buf());
    let output = media_encoders::StillOutput { path: guard.part_path().to_path_buf(), target_height: pixels };
    ctx.still_resizer.resize(absolute, std::slice::from_ref(&output)).await?;
    guard.commit().await?;
    Ok(())
}

async fn serve_static_file(path: &Path, mime: &'static str) -> Result<Response, ApiError> {
    let bytes = tokio::fs::read(path).await.map_err(Error::Io)?;
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(mime)),
            (header::CACHE_CONTROL, HeaderValue::from_static("public, max-age=31536000")),
        ],
        bytes,
    )
        .into_response())
}

/// HLS representation (rule 2): no `segment` serves the rewritten master
/// playlist (generating the ladder first if absent); a `segment` serves a
/// rung playlist (rewritten the same way) or a raw `.ts` chunk.
async fn handle_hls(
    ctx: &AppContext,
    absolute: &Path,
    relative: &str,
    meta: &std::fs::Metadata,
    segment: Option<&str>,
) -> Result<Response, ApiError> {
    let hash = crate::cache::source_hash(absolute, modified_ms(meta));

    if let Some(seg) = segment {
        return serve_hls_asset(ctx, &hash, seg).await;
    }

    if !ctx.cache.hls_ladder_exists(&hash).await {
        let flight_key = format!("{hash}:hls");
        let ctx2 = ctx.clone();
        let absolute2 = absolute.to_path_buf();
        let hash2 = hash.clone();
        ctx.derivative_flight
            .work(flight_key, async move {
                let ctx3 = ctx2.clone();
                let rx = ctx2.scheduler.enqueue(Priority::UserBlocked, MediaType::Video, async move {
                    let _guard = ctx3.begin_transcode();
                    ensure_hls_ladder(&ctx3, &absolute2, &hash2).await
                });
                rx.await.map_err(|_| Error::Store("HLS encode task dropped".to_string()))?
            })
            .await?;
    }

    let content = tokio::fs::read_to_string(ctx.cache.hls_master_playlist(&hash))
        .await
        .map_err(|_| Error::NotFound(relative.to_string()))?;
    Ok(playlist_response(rewrite_hls_playlist(&content, "")))
}

async fn ensure_hls_ladder(ctx: &Driver, absolute: &Path, hash: &str) -> Result<(), Error> {
    let out_dir = ctx.cache.hls_dir(hash);
    ctx.video_tool
        .hls(absolute, &out_dir, media_encoders::DEFAULT_LADDER, |_, _| {})
        .await?;
    Ok(())
}

async fn serve_hls_asset(ctx: &Driver, hash: &str, seg: &str) -> Result<Response, ApiError> {
    let safe = sanitize_hls_segment(seg)
        .ok_or_else(|| Error::BadRequest("invalid HLS segment path".to_string()))?;
    let full_path = ctx.cache.hls_dir(hash).join(&safe);

    if safe.ends_with(".m3u8") {
        let current_dir = Path::new(&safe)
            .parent()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();
        let content = tokio::fs::read_to_string(&full_path)
            .await
            .map_err(|_| Error::NotFound(seg.to_string()))?;
        Ok(playlist_response(rewrite_hls_playlist(&content, &current_dir)))
    } else {
        let bytes = tokio::fs::read(&full_path).await.map_err(|_| Error::NotFound(seg.to_string()))?;
        Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, HeaderValue::from_static("video/mp2t"))],
            bytes,
        )
            .into_response())
    }
}

fn sanitize_hls_segment(seg: &str) -> Option<String> {
    let p = Path::new(seg);
    if p.is_absolute() || p.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
        return None;
    }
    Some(seg.to_string())
}

/// Rewrites every non-comment line of an HLS playlist into a query-only
/// reference back to this same file-mode endpoint (`?representation=hls&
/// segment=...`), which a client resolves relative to the URL it just
/// fetched without us needing to know our own external host.
fn rewrite_hls_playlist(content: &str, current_dir: &str) -> String {
    content
        .lines()
        .map(|line| {
            if line.starts_with('#') || line.trim().is_empty() {
                line.to_string()
            } else {
                let joined = if current_dir.is_empty() {
                    line.to_string()
                } else {
                    format!("{current_dir}/{line}")
                };
                format!("?representation=hls&segment={joined}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn playlist_response(body: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/vnd.apple.mpegurl"))],
        body,
    )
        .into_response()
}

/// Rule 5 (the fallthrough): stream the original file, honouring a single
/// byte range if present. Multiple ranges in one request are not split
/// into a multipart response; the first range wins.
async fn stream_original(
    absolute: &Path,
    meta: &std::fs::Metadata,
    range_header: Option<&str>,
) -> Result<Response, ApiError> {
    let total_len = meta.len();
    let mime = path::mime_for_filename(absolute.file_name().and_then(|n| n.to_str()).unwrap_or(""))
        .unwrap_or("application/octet-stream");

    let mut headers = HeaderMap::new();
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("public, max-age=31536000"));
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime).unwrap_or(HeaderValue::from_static("application/octet-stream")),
    );

    let mut file = tokio::fs::File::open(absolute).await.map_err(Error::Io)?;

    let Some(range_value) = range_header else {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_str(&total_len.to_string()).unwrap());
        let body = Body::from_stream(ReaderStream::new(file));
        return Ok((StatusCode::OK, headers, body).into_response());
    };

    let ranges = http_range::HttpRange::parse(range_value, total_len)
        .map_err(|_| Error::RangeUnsatisfiable)?;
    let Some(range) = ranges.first() else {
        return Err(Error::RangeUnsatisfiable.into());
    };

    file.seek(std::io::SeekFrom::Start(range.start)).await.map_err(Error::Io)?;
    let end_inclusive = range.start + range.length - 1;
    headers.insert(
        header::CONTENT_RANGE,
        HeaderValue::from_str(&format!("bytes {}-{}/{}", range.start, end_inclusive, total_len)).unwrap(),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from_str(&range.length.to_string()).unwrap());
    let body = Body::from_stream(ReaderStream::new(file.take(range.length)));
    Ok((StatusCode::PARTIAL_CONTENT, headers, body).into_response())
}

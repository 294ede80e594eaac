//! `media-server` — thin axum shell over `media-core`. Mirrors the
//! teacher's split between a plain-function core and a binary that only
//! does process bootstrap and HTTP routing; unlike the teacher's Tauri
//! apps, this binary's whole job is serving `core::http` over the network
//! (spec §6.1).

use axum::extract::{OriginalUri, Path as AxPath, Query, State};
use axum::http::{HeaderMap, Method};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use media_core::cache::CacheLayout;
use media_core::config::Config;
use media_core::http::{self, ApiError, AppContext, FileParams, QueryParams};
use media_core::index::IndexStore;
use media_core::scheduler::Scheduler;
use media_core::status;
use media_core::Driver;
use media_encoders::{StillResizer, VideoTool};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    info!(media_root = %config.media_root.display(), port = config.port, "starting media-server");

    let cache = CacheLayout::init(config.cache_dir.clone()).await?;
    let index = IndexStore::open(config.index_db_path.clone(), config.media_root.clone()).await?;
    let scheduler = Scheduler::new(config.scheduler_concurrency);
    let video_tool = VideoTool::new(
        std::env::var("FFMPEG_BIN").unwrap_or_else(|_| "ffmpeg".to_string()),
        std::env::var("FFPROBE_BIN").unwrap_or_else(|_| "ffprobe".to_string()),
    );
    let still_resizer = StillResizer::new(
        std::env::var("STILL_RESIZER_SCRIPT")
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|_| std::path::PathBuf::from("./scripts/resize.py")),
    );

    let driver = Driver::new(
        config.media_root.clone(),
        index,
        cache,
        scheduler,
        video_tool,
        still_resizer,
        config.auto_pause,
    );

    if !config.no_auto_start {
        tokio::spawn(driver.clone().discover());
        tokio::spawn(driver.clone().run_enrichment_loop());
        #[cfg(feature = "location-watcher")]
        {
            if let Err(e) = media_core::discovery::watcher::spawn(driver.clone()) {
                tracing::warn!(error = %e, "failed to start filesystem watcher");
            }
        }
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/health", get(health))
        .route("/api/folders/", get(folders_root))
        .route("/api/folders/*path", get(folders))
        .route("/api/files/", get(files_query_root))
        .route("/api/files/*path", get(files))
        .route("/api/status", get(status_snapshot))
        .route("/api/status/stream", get(status_stream))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(driver);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

async fn health() -> Response {
    http::handle_health().await
}

async fn folders_root(State(ctx): State<AppContext>) -> Result<Response, ApiError> {
    http::handle_folders(ctx, String::new()).await
}

async fn folders(State(ctx): State<AppContext>, AxPath(path): AxPath<String>) -> Result<Response, ApiError> {
    http::handle_folders(ctx, path).await
}

/// `/api/files/` (query mode at the media root) — no wildcard segment, so
/// it needs its own route; everything else about it matches [`files`].
async fn files_query_root(
    State(ctx): State<AppContext>,
    Query(params): Query<QueryParams>,
) -> Result<Response, ApiError> {
    http::handle_query(ctx, String::new(), params).await
}

/// `/api/files/<path>` — dispatches on the trailing slash in the raw
/// request URI (spec §4.9): `.../` is query mode, anything else is file
/// mode. `AxPath`'s wildcard capture strips a bare trailing slash on some
/// axum versions, so the mode decision reads the original URI directly
/// rather than trusting the captured segment.
async fn files(
    State(ctx): State<AppContext>,
    AxPath(path): AxPath<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let raw_query = uri.query().unwrap_or("");

    if uri.path().ends_with('/') {
        let folder = path.strip_suffix('/').unwrap_or(&path).to_string();
        let params: QueryParams = serde_urlencoded::from_str(raw_query).unwrap_or_default();
        return http::handle_query(ctx, folder, params).await;
    }

    let file_params: FileParams = serde_urlencoded::from_str(raw_query).unwrap_or_default();
    let range_header = headers
        .get(axum::http::header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    http::handle_file(ctx, path, file_params, range_header).await
}

async fn status_snapshot(State(ctx): State<AppContext>) -> Result<Response, ApiError> {
    status::handle_status(ctx).await
}

async fn status_stream(State(ctx): State<AppContext>) -> impl IntoResponse {
    status::handle_status_stream(ctx)
}

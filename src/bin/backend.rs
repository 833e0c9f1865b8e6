#![forbid(unsafe_code)]

//! HTTP front for the subscription feed service.
//!
//! The browser client imports its subscriptions from a Takeout dump and then
//! asks this server for recent uploads, channel metadata and playable video.
//! Nothing is persisted: every answer comes from the in-memory cache, the
//! channel Atom feeds, or a yt-dlp invocation.

use std::{any::Any, convert::Infallible, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Path, Query, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use chrono::{SecondsFormat, Utc};
use clap::Parser;
use futures_util::Stream;
use serde::Deserialize;
use serde_json::{Value, json};
use subfeed::{
    aggregate::{BatchAggregator, FeedEvent},
    cache::{CacheStats, CacheValue, SWEEP_INTERVAL, SharedCache, TtlCache, keys, spawn_sweeper},
    config::{ConfigOverrides, ServerConfig, resolve_server_config},
    extractor::Extractor,
    feed::{ChannelVideoFetcher, FeedSource, HttpFeedSource},
    limiter::ConcurrencyLimiter,
    metadata::MetadataFetcher,
    models::{Channel, ChannelInfo, Video, VideoDetails, VideoSnippet, VideoStatistics},
    stream::{Quality, open_stream},
    takeout::extract_channels,
};
use tokio::{signal, sync::mpsc};
use tower_http::{catch_panic::CatchPanicLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const BODY_LIMIT_BYTES: usize = 50 * 1024 * 1024;
const SSE_KEEPALIVE: Duration = Duration::from_secs(30);
const EVENT_BUFFER: usize = 16;
const DEFAULT_LOG_FILTER: &str = "subfeed=info,backend=info,tower_http=info";

#[derive(Debug, Parser)]
#[command(name = "backend", version, about = "Subscription feed backend")]
struct BackendArgs {
    /// Address to listen on (overrides SUBFEED_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides SUBFEED_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Path to the yt-dlp executable (overrides YTDLP_PATH)
    #[arg(long = "ytdlp")]
    ytdlp_path: Option<PathBuf>,

    /// Env file read before the process environment
    #[arg(long = "env-file")]
    env_file: Option<PathBuf>,
}

impl BackendArgs {
    fn into_overrides(self) -> ConfigOverrides {
        ConfigOverrides {
            host: self.host,
            port: self.port,
            ytdlp_path: self.ytdlp_path,
            env_path: self.env_file,
        }
    }
}

/// Shared state injected into every Axum handler. All members are cheap
/// clones over the same cache and limiter.
#[derive(Clone)]
struct AppState {
    cache: SharedCache,
    fetcher: ChannelVideoFetcher,
    aggregator: BatchAggregator,
    metadata: MetadataFetcher,
}

impl AppState {
    fn new(config: &ServerConfig) -> Self {
        let source = Arc::new(HttpFeedSource::new(config.feed_base_url.clone()));
        Self::with_feed_source(config, source)
    }

    fn with_feed_source(config: &ServerConfig, source: Arc<dyn FeedSource>) -> Self {
        let cache: SharedCache = Arc::new(TtlCache::new(config.cache_ttl));
        let limiter = ConcurrencyLimiter::new(config.max_concurrency);
        let fetcher = ChannelVideoFetcher::new(cache.clone(), source);
        let aggregator = BatchAggregator::new(fetcher.clone(), limiter.clone());
        let metadata = MetadataFetcher::new(
            cache.clone(),
            Extractor::new(&config.ytdlp_path),
            limiter,
        )
        .with_ttl(config.metadata_ttl);

        Self {
            cache,
            fetcher,
            aggregator,
            metadata,
        }
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    /// Creates a 400 error with the provided message.
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    /// Creates a 404 error with the provided message.
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    /// Creates a 500 error with the provided message.
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        let body = json!({
            "error": self.message,
        });
        (self.status, headers, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let args = BackendArgs::parse();
    let config = resolve_server_config(args.into_overrides()).context("loading configuration")?;
    info!(
        ytdlp = %config.ytdlp_path.display(),
        max_concurrency = config.max_concurrency,
        cache_ttl_secs = config.cache_ttl.as_secs(),
        "configuration loaded"
    );

    let state = AppState::new(&config);
    let sweeper = spawn_sweeper(state.cache.clone(), SWEEP_INTERVAL);
    let app = build_router(state);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("API server listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    sweeper.abort();
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/process-takeout", post(process_takeout))
        .route("/api/channel/{channel_id}/videos", get(channel_videos))
        .route("/api/channel/{channel_id}/info", get(channel_info))
        .route("/api/channels/info", post(channels_info))
        .route("/api/channels/videos", post(channels_videos))
        .route("/api/channels/videos/stream", post(channels_videos_stream))
        .route("/api/video/{video_id}", get(video_stub))
        .route("/api/video/{video_id}/info", get(video_info))
        .route("/api/video/{video_id}/stream", get(stream_video))
        .route("/api/cache/stats", get(cache_stats))
        .route("/api/cache/clear", post(clear_cache))
        .fallback(not_found_fallback)
        .layer(DefaultBodyLimit::max(BODY_LIMIT_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(panic_response))
        .with_state(state)
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this handler; Ctrl+C still ends the
    // process when it fails to install.
    if let Err(err) = signal::ctrl_c().await {
        error!(error = %err, "failed to install Ctrl+C handler");
    }
    info!("shutting down");
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(detail, "request handler panicked");
    ApiError::internal("Internal server error").into_response()
}

async fn not_found_fallback() -> ApiError {
    ApiError::not_found("endpoint not found")
}

/// Pulls an array field out of a JSON body, mapping every shape problem to
/// the same 400 message.
fn array_field(
    payload: Result<Json<Value>, JsonRejection>,
    field: &str,
    message: &str,
) -> ApiResult<Vec<Value>> {
    let Json(mut body) = payload.map_err(|err| {
        warn!(error = %err, "rejected request body");
        ApiError::bad_request(message)
    })?;
    match body.get_mut(field).map(Value::take) {
        Some(Value::Array(items)) => Ok(items),
        _ => Err(ApiError::bad_request(message)),
    }
}

fn parse_channels(payload: Result<Json<Value>, JsonRejection>) -> ApiResult<Vec<Channel>> {
    const INVALID: &str = "Invalid channels array";
    let items = array_field(payload, "channels", INVALID)?;
    serde_json::from_value(Value::Array(items)).map_err(|_| ApiError::bad_request(INVALID))
}

async fn process_takeout(payload: Result<Json<Value>, JsonRejection>) -> ApiResult<Json<Value>> {
    let items = array_field(payload, "data", "Invalid data format")?;
    let channels = extract_channels(&items);
    info!(channels = channels.len(), "processed takeout data");
    Ok(Json(json!({
        "total": channels.len(),
        "channels": channels,
    })))
}

async fn channel_videos(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
) -> Json<Arc<Vec<Video>>> {
    Json(
        state
            .fetcher
            .fetch_channel_videos(&Channel::from_id(channel_id))
            .await,
    )
}

async fn channel_info(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
) -> Json<Arc<ChannelInfo>> {
    Json(state.metadata.fetch_channel_info(&channel_id).await)
}

async fn channels_info(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<Vec<Arc<ChannelInfo>>>> {
    const INVALID: &str = "Invalid channelIds array";
    let items = array_field(payload, "channelIds", INVALID)?;
    let channel_ids: Vec<String> =
        serde_json::from_value(Value::Array(items)).map_err(|_| ApiError::bad_request(INVALID))?;
    Ok(Json(
        state.metadata.fetch_multiple_channels_info(&channel_ids).await,
    ))
}

async fn channels_videos(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<Vec<Video>>> {
    let channels = parse_channels(payload)?;
    let videos = state
        .aggregator
        .fetch_all_videos(&channels)
        .await
        .map_err(|err| {
            error!(error = %err, "collecting channel videos failed");
            ApiError::internal("Failed to fetch videos")
        })?;
    Ok(Json(videos))
}

/// Progress is framed as `data: <json>` events. The aggregation runs on its
/// own task; if the client leaves, the channel closes and no further batches
/// are started.
async fn channels_videos_stream(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let channels = parse_channels(payload)?;
    info!(channels = channels.len(), "streaming channel videos");

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let aggregator = state.aggregator.clone();
    tokio::spawn(async move { aggregator.stream_videos(channels, tx).await });

    let events = futures_util::stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        Some((Ok(sse_event(&event)), rx))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(SSE_KEEPALIVE).text("keepalive")))
}

fn sse_event(event: &FeedEvent) -> Event {
    Event::default().json_data(event).unwrap_or_else(|err| {
        error!(error = %err, "failed to encode progress event");
        Event::default().data(json!({"type": "error", "error": err.to_string()}).to_string())
    })
}

async fn video_info(
    State(state): State<AppState>,
    Path(video_id): Path<String>,
) -> ApiResult<Json<Arc<VideoDetails>>> {
    state
        .metadata
        .fetch_video_info(&video_id)
        .await
        .map(Json)
        .map_err(|err| {
            error!(%video_id, error = %err, "video info lookup failed");
            ApiError::internal("Failed to fetch video info")
        })
}

#[derive(Debug, Default, Deserialize)]
struct StreamParams {
    quality: Option<String>,
}

async fn stream_video(
    State(state): State<AppState>,
    Path(video_id): Path<String>,
    Query(params): Query<StreamParams>,
) -> ApiResult<Response> {
    let quality = Quality::parse(params.quality.as_deref())
        .map_err(|err| ApiError::bad_request(err.to_string()))?;
    let stream = open_stream(state.metadata.extractor(), &video_id, quality).map_err(|err| {
        error!(%video_id, error = %err, "failed to start stream process");
        ApiError::internal("Failed to start video stream")
    })?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp4")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::ACCEPT_RANGES, "bytes")
        .body(Body::from_stream(stream))
        .map_err(|err| ApiError::internal(err.to_string()))
}

/// Serves a video seen in an earlier feed fetch, or a blank stub.
async fn video_stub(State(state): State<AppState>, Path(video_id): Path<String>) -> Json<Video> {
    if let Some(CacheValue::Video(video)) = state.cache.get(&keys::video(&video_id)) {
        return Json(video.as_ref().clone());
    }
    Json(Video {
        snippet: VideoSnippet {
            title: "Video".to_string(),
            description: String::new(),
            thumbnails: None,
            channel_title: String::new(),
            channel_id: None,
            published_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        },
        statistics: Some(VideoStatistics {
            view_count: "0".to_string(),
            like_count: "0".to_string(),
        }),
        content_details: None,
        id: video_id,
    })
}

async fn cache_stats(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.cache.stats())
}

async fn clear_cache(State(state): State<AppState>) -> Json<Value> {
    state.cache.flush_all();
    info!("cache cleared");
    Json(json!({ "message": "Cache cleared" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::to_bytes;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use subfeed::feed::FeedError;
    use tempfile::{TempDir, tempdir};

    /// One video per channel, published on a day derived from the id.
    struct StaticFeeds {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FeedSource for StaticFeeds {
        async fn fetch_feed(&self, channel_id: &str) -> Result<String, FeedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if channel_id == "UCdown" {
                return Err(FeedError::Status(503));
            }
            let day: u32 = channel_id.trim_start_matches("UC").parse().unwrap_or(0) % 28 + 1;
            Ok(format!(
                r#"<feed>
<entry>
 <yt:videoId>{channel_id}-v</yt:videoId>
 <title>Upload from {channel_id}</title>
 <author><name>Name {channel_id}</name></author>
 <published>2024-02-{day:02}T08:00:00+00:00</published>
 <media:group><media:description>desc</media:description></media:group>
</entry>
</feed>"#
            ))
        }
    }

    struct BackendTestContext {
        _temp: TempDir,
        feeds: Arc<StaticFeeds>,
        state: AppState,
    }

    impl BackendTestContext {
        fn new() -> Self {
            Self::with_ytdlp_body("exit 1")
        }

        /// `body` becomes a `/bin/sh` script standing in for yt-dlp.
        fn with_ytdlp_body(body: &str) -> Self {
            let temp = tempdir().unwrap();
            let stub = temp.path().join("yt-dlp");
            std::fs::write(&stub, format!("#!/bin/sh\n{body}\n")).unwrap();
            let mut perms = std::fs::metadata(&stub).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&stub, perms).unwrap();

            let config = ServerConfig {
                ytdlp_path: stub,
                ..ServerConfig::default()
            };
            let feeds = Arc::new(StaticFeeds {
                calls: AtomicUsize::new(0),
            });
            let state = AppState::with_feed_source(&config, feeds.clone());
            Self {
                _temp: temp,
                feeds,
                state,
            }
        }
    }

    fn channels_body(ids: &[&str]) -> Result<Json<Value>, JsonRejection> {
        let channels: Vec<Value> = ids
            .iter()
            .map(|id| json!({"channelId": id, "name": format!("Name {id}"), "url": ""}))
            .collect();
        Ok(Json(json!({ "channels": channels })))
    }

    async fn json_body(response: Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[test]
    fn args_map_to_overrides() {
        let args = BackendArgs::try_parse_from([
            "backend",
            "--port",
            "4000",
            "--ytdlp",
            "/opt/yt-dlp",
            "--env-file",
            "/etc/subfeed.env",
        ])
        .unwrap();
        let overrides = args.into_overrides();
        assert_eq!(overrides.port, Some(4000));
        assert_eq!(overrides.host, None);
        assert_eq!(overrides.ytdlp_path, Some(PathBuf::from("/opt/yt-dlp")));
        assert_eq!(overrides.env_path, Some(PathBuf::from("/etc/subfeed.env")));
    }

    #[tokio::test]
    async fn process_takeout_extracts_unique_channels() {
        let body = json!({"data": [
            {"snippet": {"channelId": "UC1", "channelTitle": "One"}},
            {"snippet": {"channelId": "UC1", "channelTitle": "One again"}},
            {"snippet": {"channelId": "UC2", "channelTitle": "Two"}},
            {"title": "no snippet"}
        ]});
        let Json(result) = process_takeout(Ok(Json(body))).await.unwrap();
        assert_eq!(result["total"], 2);
        assert_eq!(result["channels"][0]["channelId"], "UC1");
        assert_eq!(result["channels"][0]["name"], "One");
        assert_eq!(
            result["channels"][1]["url"],
            "https://www.youtube.com/channel/UC2"
        );
    }

    #[tokio::test]
    async fn process_takeout_rejects_missing_array() {
        let err = process_takeout(Ok(Json(json!({"data": "nope"}))))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        let parsed = json_body(err.into_response()).await;
        assert_eq!(parsed["error"], "Invalid data format");
    }

    #[tokio::test]
    async fn channel_videos_uses_cache() {
        let ctx = BackendTestContext::new();
        let Json(first) = channel_videos(State(ctx.state.clone()), Path("UC3".into())).await;
        let Json(second) = channel_videos(State(ctx.state.clone()), Path("UC3".into())).await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].snippet.channel_title, "Name UC3");
        assert!(first[0].snippet.description.ends_with("..."));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(ctx.feeds.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn channels_videos_sorts_newest_first() {
        let ctx = BackendTestContext::new();
        let Json(videos) = channels_videos(
            State(ctx.state.clone()),
            channels_body(&["UC1", "UC5", "UCdown", "UC3"]),
        )
        .await
        .unwrap();
        let ids: Vec<&str> = videos.iter().map(|video| video.id.as_str()).collect();
        assert_eq!(ids, vec!["UC5-v", "UC3-v", "UC1-v"]);
    }

    #[tokio::test]
    async fn channels_videos_rejects_bad_payload() {
        let ctx = BackendTestContext::new();
        let err = channels_videos(State(ctx.state.clone()), Ok(Json(json!({"channels": 5}))))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let err = channels_videos(
            State(ctx.state.clone()),
            Ok(Json(json!({"channels": [{"name": "no id"}]}))),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stream_endpoint_emits_progress_events() {
        let ctx = BackendTestContext::new();
        let ids: Vec<String> = (1..=7).map(|index| format!("UC{index}")).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let sse = channels_videos_stream(State(ctx.state.clone()), channels_body(&id_refs))
            .await
            .unwrap();

        let response = sse.into_response();
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        let events: Vec<Value> = text
            .lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .map(|data| serde_json::from_str(data).unwrap())
            .collect();

        let kinds: Vec<&str> = events
            .iter()
            .map(|event| event["type"].as_str().unwrap())
            .collect();
        assert_eq!(kinds, vec!["connected", "batch", "batch", "complete"]);
        assert_eq!(events[1]["processed"], 5);
        assert_eq!(events[2]["processed"], 7);
        assert_eq!(events[2]["total"], 7);
        assert_eq!(events[3]["total"], 7);
        assert_eq!(events[3]["videos"][0]["id"], "UC7-v");
    }

    #[tokio::test]
    async fn stream_endpoint_rejects_bad_payload() {
        let ctx = BackendTestContext::new();
        let result = channels_videos_stream(State(ctx.state.clone()), Ok(Json(json!({})))).await;
        match result {
            Err(err) => assert_eq!(err.status, StatusCode::BAD_REQUEST),
            Ok(_) => panic!("expected a 400"),
        }
    }

    #[tokio::test]
    async fn channel_info_falls_back_to_placeholder() {
        let ctx = BackendTestContext::new();
        let Json(info) = channel_info(State(ctx.state.clone()), Path("UCXXXX".into())).await;
        assert_eq!(info.channel_id, "UCXXXX");
        assert_eq!(info.subscriber_count, 0);
        assert_eq!(info.name, "Unknown Channel");
    }

    #[tokio::test]
    async fn channels_info_validates_and_preserves_order() {
        let ctx = BackendTestContext::with_ytdlp_body(r#"echo '{"uploader": "Known"}'"#);
        let Json(infos) = channels_info(
            State(ctx.state.clone()),
            Ok(Json(json!({"channelIds": ["UCb", "UCa"]}))),
        )
        .await
        .unwrap();
        let ids: Vec<&str> = infos.iter().map(|info| info.channel_id.as_str()).collect();
        assert_eq!(ids, vec!["UCb", "UCa"]);
        assert!(infos.iter().all(|info| info.name == "Known"));

        let err = channels_info(
            State(ctx.state.clone()),
            Ok(Json(json!({"channelIds": [1, 2]}))),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "Invalid channelIds array");
    }

    #[tokio::test]
    async fn video_info_failure_is_internal_error() {
        let ctx = BackendTestContext::new();
        let err = video_info(State(ctx.state.clone()), Path("gone".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn video_stub_prefers_cached_feed_video() {
        let ctx = BackendTestContext::new();
        let Json(stub) = video_stub(State(ctx.state.clone()), Path("unknown".into())).await;
        assert_eq!(stub.id, "unknown");
        assert_eq!(stub.snippet.title, "Video");
        assert_eq!(stub.statistics.unwrap().view_count, "0");

        channel_videos(State(ctx.state.clone()), Path("UC4".into())).await;
        let Json(cached) = video_stub(State(ctx.state.clone()), Path("UC4-v".into())).await;
        assert_eq!(cached.snippet.title, "Upload from UC4");
    }

    #[tokio::test]
    async fn stream_video_rejects_invalid_quality() {
        let ctx = BackendTestContext::new();
        let err = stream_video(
            State(ctx.state.clone()),
            Path("vid".into()),
            Query(StreamParams {
                quality: Some("ultra".into()),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stream_video_reports_spawn_failure() {
        let ctx = BackendTestContext::new();
        let config = ServerConfig {
            ytdlp_path: PathBuf::from("/nonexistent/yt-dlp"),
            ..ServerConfig::default()
        };
        let state = AppState::with_feed_source(&config, ctx.feeds.clone());
        let err = stream_video(State(state), Path("vid".into()), Query(StreamParams::default()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "Failed to start video stream");
    }

    #[tokio::test]
    async fn stream_video_pipes_process_output() {
        let ctx = BackendTestContext::with_ytdlp_body("printf 'fake-mp4'");
        let response = stream_video(
            State(ctx.state.clone()),
            Path("vid".into()),
            Query(StreamParams {
                quality: Some("720".into()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "video/mp4"
        );
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "no-cache"
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"fake-mp4");
    }

    #[tokio::test]
    async fn cache_stats_and_clear() {
        let ctx = BackendTestContext::new();
        channel_videos(State(ctx.state.clone()), Path("UC1".into())).await;
        channel_videos(State(ctx.state.clone()), Path("UC1".into())).await;

        let Json(stats) = cache_stats(State(ctx.state.clone())).await;
        assert_eq!(stats.keys, 2);
        assert_eq!(stats.hits, 1);
        assert!(stats.vsize > 0);

        let Json(message) = clear_cache(State(ctx.state.clone())).await;
        assert_eq!(message["message"], "Cache cleared");
        let Json(stats) = cache_stats(State(ctx.state.clone())).await;
        assert_eq!(stats, CacheStats::default());
    }

    #[tokio::test]
    async fn unknown_route_is_json_404() {
        let response = not_found_fallback().await.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let parsed = json_body(response).await;
        assert_eq!(parsed["error"], "endpoint not found");
    }

    #[tokio::test]
    async fn panics_become_json_500() {
        let response = panic_response(Box::new("boom"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let parsed = json_body(response).await;
        assert_eq!(parsed["error"], "Internal server error");
    }

    #[tokio::test]
    async fn api_error_serializes_json() {
        let response = ApiError::not_found("missing").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let parsed = json_body(response).await;
        assert_eq!(parsed["error"], "missing");
    }

    #[test]
    fn router_builds() {
        let _router = build_router(AppState::new(&ServerConfig::default()));
    }
}

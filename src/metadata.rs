//! Channel and video metadata resolved through the extractor.
//!
//! Lookups are slow (several seconds per call), so every successful result
//! is cached for an hour. Channel lookups never fail from the caller's point
//! of view: a broken extraction yields a placeholder record instead.

use std::{
    collections::{BTreeMap, btree_map::Entry},
    sync::Arc,
    time::Duration,
};

use futures_util::future::join_all;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    cache::{CacheValue, SharedCache, keys},
    extractor::{Extractor, ExtractorError, RawChannelInfo, RawFormat, RawVideoInfo},
    limiter::ConcurrencyLimiter,
    models::{ChannelInfo, VideoDetails, VideoFormat, channel_url, fallback_profile_image, watch_url},
};

pub const METADATA_TTL: Duration = Duration::from_secs(3600);
pub const UNKNOWN_CHANNEL: &str = "Unknown Channel";
pub const UNKNOWN_TITLE: &str = "Unknown Title";
pub const MIN_RENDITION_HEIGHT: u32 = 360;
pub const MAX_RENDITION_HEIGHT: u32 = 1440;
const DEFAULT_FPS: f64 = 30.0;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error(transparent)]
    Extractor(#[from] ExtractorError),
    #[error("metadata lookup task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Clone)]
pub struct MetadataFetcher {
    cache: SharedCache,
    extractor: Arc<Extractor>,
    limiter: ConcurrencyLimiter,
    ttl: Duration,
}

impl MetadataFetcher {
    pub fn new(cache: SharedCache, extractor: Extractor, limiter: ConcurrencyLimiter) -> Self {
        Self {
            cache,
            extractor: Arc::new(extractor),
            limiter,
            ttl: METADATA_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn extractor(&self) -> &Extractor {
        &self.extractor
    }

    /// Returns cached or freshly extracted channel info, or a placeholder when
    /// extraction fails. Placeholders are not cached.
    ///
    /// The extraction runs on its own task so it still completes and fills
    /// the cache if the caller goes away.
    pub async fn fetch_channel_info(&self, channel_id: &str) -> Arc<ChannelInfo> {
        if let Some(CacheValue::ChannelInfo(info)) = self.cache.get(&keys::channel_info(channel_id)) {
            debug!(channel_id, "cache hit for channel info");
            return info;
        }

        info!(channel_id, "fetching channel info");
        let this = self.clone();
        let id = channel_id.to_string();
        let lookup = tokio::spawn(async move { this.lookup_channel_info(&id).await });

        match lookup.await {
            Ok(Ok(info)) => info,
            Ok(Err(err)) => {
                warn!(channel_id, error = %err, "channel info extraction failed, using placeholder");
                Arc::new(placeholder_channel_info(channel_id))
            }
            Err(err) => {
                error!(channel_id, error = %err, "channel info task failed, using placeholder");
                Arc::new(placeholder_channel_info(channel_id))
            }
        }
    }

    async fn lookup_channel_info(&self, channel_id: &str) -> Result<Arc<ChannelInfo>, ExtractorError> {
        let raw = self.extractor.channel_info(&channel_url(channel_id)).await?;
        let info = Arc::new(map_channel_info(channel_id, raw));
        self.cache.set_with_ttl(
            keys::channel_info(channel_id),
            CacheValue::ChannelInfo(info.clone()),
            self.ttl,
        );
        Ok(info)
    }

    pub async fn fetch_video_info(&self, video_id: &str) -> Result<Arc<VideoDetails>, MetadataError> {
        if let Some(CacheValue::VideoDetails(details)) = self.cache.get(&keys::video_info(video_id)) {
            debug!(video_id, "cache hit for video info");
            return Ok(details);
        }

        info!(video_id, "fetching video info");
        let this = self.clone();
        let id = video_id.to_string();
        let details = tokio::spawn(async move { this.lookup_video_info(&id).await }).await??;
        Ok(details)
    }

    async fn lookup_video_info(&self, video_id: &str) -> Result<Arc<VideoDetails>, ExtractorError> {
        let raw = self.extractor.video_info(&watch_url(video_id)).await?;
        let details = Arc::new(map_video_details(video_id, raw));
        self.cache.set_with_ttl(
            keys::video_info(video_id),
            CacheValue::VideoDetails(details.clone()),
            self.ttl,
        );
        Ok(details)
    }

    /// One limiter-bounded lookup per id, results in input order. Lookups
    /// start in input order too: a driver task takes each slot in turn and
    /// hands it to the lookup. Lookups whose task dies are dropped from the
    /// result.
    pub async fn fetch_multiple_channels_info(&self, channel_ids: &[String]) -> Vec<Arc<ChannelInfo>> {
        info!(count = channel_ids.len(), "fetching info for channels");
        let this = self.clone();
        let channel_ids = channel_ids.to_vec();
        let driver = tokio::spawn(async move {
            let mut handles = Vec::with_capacity(channel_ids.len());
            for channel_id in channel_ids {
                let permit = this.limiter.acquire().await;
                let lookup = this.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    lookup.fetch_channel_info(&channel_id).await
                }));
            }
            join_all(handles).await
        });

        let outcomes = match driver.await {
            Ok(outcomes) => outcomes,
            Err(err) => {
                error!(error = %err, "channel info lookups aborted");
                return Vec::new();
            }
        };
        outcomes
            .into_iter()
            .filter_map(|outcome| match outcome {
                Ok(info) => Some(info),
                Err(err) => {
                    warn!(error = %err, "dropping failed channel info lookup");
                    None
                }
            })
            .collect()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.is_empty())
}

pub fn map_channel_info(channel_id: &str, raw: RawChannelInfo) -> ChannelInfo {
    let best_thumbnail = raw
        .thumbnails
        .iter()
        .reduce(|best, current| {
            let area = |thumb: &crate::extractor::RawThumbnail| {
                thumb.width.unwrap_or(0) * thumb.height.unwrap_or(0)
            };
            if area(current) > area(best) { current } else { best }
        })
        .map(|thumb| thumb.url.clone());

    let profile_image = match best_thumbnail {
        Some(url) => url,
        None => raw
            .uploader_url
            .as_ref()
            .map(|_| fallback_profile_image(channel_id)),
    };

    ChannelInfo {
        channel_id: channel_id.to_string(),
        name: non_empty(raw.uploader)
            .or_else(|| non_empty(raw.channel))
            .unwrap_or_else(|| UNKNOWN_CHANNEL.to_string()),
        url: channel_url(channel_id),
        description: raw.description.unwrap_or_default(),
        subscriber_count: raw.channel_follower_count.unwrap_or(0),
        video_count: raw.playlist_count.unwrap_or(0),
        profile_image,
        banner_image: None,
        categories: raw.categories,
        tags: raw.tags,
        country: non_empty(raw.uploader_location),
        custom_url: non_empty(raw.uploader_url),
        created_at: None,
    }
}

/// Stand-in returned when extraction fails. It is indistinguishable from a
/// real but empty channel.
pub fn placeholder_channel_info(channel_id: &str) -> ChannelInfo {
    ChannelInfo {
        channel_id: channel_id.to_string(),
        name: UNKNOWN_CHANNEL.to_string(),
        url: channel_url(channel_id),
        description: String::new(),
        subscriber_count: 0,
        video_count: 0,
        profile_image: Some(fallback_profile_image(channel_id)),
        banner_image: None,
        categories: Vec::new(),
        tags: Vec::new(),
        country: None,
        custom_url: Some(channel_url(channel_id)),
        created_at: None,
    }
}

pub fn map_video_details(video_id: &str, raw: RawVideoInfo) -> VideoDetails {
    VideoDetails {
        id: video_id.to_string(),
        title: non_empty(raw.title).unwrap_or_else(|| UNKNOWN_TITLE.to_string()),
        description: raw.description.unwrap_or_default(),
        channel_title: non_empty(raw.uploader).unwrap_or_else(|| UNKNOWN_CHANNEL.to_string()),
        duration: format_duration(raw.duration),
        formats: select_renditions(&raw.formats),
        categories: raw.categories,
    }
}

/// Video renditions between 360p and 1440p, one per height (highest bitrate
/// wins, first seen on ties), tallest first.
pub fn select_renditions(formats: &[RawFormat]) -> Vec<VideoFormat> {
    let mut by_height: BTreeMap<u32, &RawFormat> = BTreeMap::new();
    for format in formats {
        if format.vcodec.as_deref() == Some("none") {
            continue;
        }
        let Some(height) = format.height else {
            continue;
        };
        if !(MIN_RENDITION_HEIGHT..=MAX_RENDITION_HEIGHT).contains(&height) {
            continue;
        }
        match by_height.entry(height) {
            Entry::Vacant(slot) => {
                slot.insert(format);
            }
            Entry::Occupied(mut slot) => {
                if format.tbr.unwrap_or(0.0) > slot.get().tbr.unwrap_or(0.0) {
                    slot.insert(format);
                }
            }
        }
    }

    by_height
        .into_iter()
        .rev()
        .map(|(height, format)| VideoFormat {
            quality: non_empty(format.format_note.clone()).unwrap_or_else(|| format!("{height}p")),
            height,
            width: format.width.unwrap_or(0),
            fps: format.fps.filter(|fps| *fps > 0.0).unwrap_or(DEFAULT_FPS),
            itag: format.format_id.clone().unwrap_or_default(),
            container: format.ext.clone().unwrap_or_default(),
            codecs: format.vcodec.clone().unwrap_or_default(),
            bitrate: format.tbr.unwrap_or(0.0),
            has_audio: format.acodec.as_deref() != Some("none"),
        })
        .collect()
}

/// `H:MM:SS` from one hour up, `M:SS` below; missing or zero is `0:00`.
/// Fractional seconds are dropped.
pub fn format_duration(seconds: Option<f64>) -> String {
    let total = seconds
        .filter(|value| value.is_finite() && *value > 0.0)
        .map(|value| value.floor() as u64)
        .unwrap_or(0);
    if total == 0 {
        return "0:00".to_string();
    }

    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes}:{secs:02}")
    }
}

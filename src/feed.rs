//! Latest uploads for a single channel, read from its public Atom feed.
//!
//! The feed is cheap compared to the extractor but carries very little: no
//! durations, no like counts and only sometimes a view count. Missing data is
//! filled with fixed defaults so the client always receives the same shape.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use quick_xml::{
    Reader,
    events::{BytesStart, Event},
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    cache::{CacheValue, SharedCache, keys},
    models::{Channel, ContentDetails, Thumbnail, Thumbnails, Video, VideoSnippet, VideoStatistics},
};

pub const DEFAULT_FEED_BASE_URL: &str = "https://www.youtube.com/feeds/videos.xml";
pub const MAX_FEED_ENTRIES: usize = 5;
pub const DESCRIPTION_LIMIT: usize = 200;
pub const ELLIPSIS: &str = "...";
const FEED_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed request failed with status {0}")]
    Status(u16),
    #[error("feed request failed: {0}")]
    Transport(String),
    #[error("malformed feed: {0}")]
    Parse(String),
}

/// Transport for raw feed documents.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch_feed(&self, channel_id: &str) -> Result<String, FeedError>;
}

/// Fetches feeds over HTTPS with a shared `ureq` agent on the blocking pool.
#[derive(Clone)]
pub struct HttpFeedSource {
    agent: ureq::Agent,
    base_url: String,
}

impl HttpFeedSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(FEED_TIMEOUT)
            .user_agent(concat!("subfeed/", env!("CARGO_PKG_VERSION")))
            .build();
        Self {
            agent,
            base_url: base_url.into(),
        }
    }

    pub fn feed_url(&self, channel_id: &str) -> String {
        format!("{}?channel_id={}", self.base_url, channel_id)
    }
}

impl Default for HttpFeedSource {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_BASE_URL)
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn fetch_feed(&self, channel_id: &str) -> Result<String, FeedError> {
        let agent = self.agent.clone();
        let url = self.feed_url(channel_id);
        tokio::task::spawn_blocking(move || match agent.get(&url).call() {
            Ok(response) => response
                .into_string()
                .map_err(|err| FeedError::Transport(err.to_string())),
            Err(ureq::Error::Status(code, _)) => Err(FeedError::Status(code)),
            Err(err) => Err(FeedError::Transport(err.to_string())),
        })
        .await
        .map_err(|err| FeedError::Transport(err.to_string()))?
    }
}

/// Resolves a channel to its newest videos, consulting the shared cache
/// first.
#[derive(Clone)]
pub struct ChannelVideoFetcher {
    cache: SharedCache,
    source: Arc<dyn FeedSource>,
}

impl ChannelVideoFetcher {
    pub fn new(cache: SharedCache, source: Arc<dyn FeedSource>) -> Self {
        Self { cache, source }
    }

    /// Never fails: transport and parse problems degrade to an empty list,
    /// which is not cached so the next request retries.
    pub async fn fetch_channel_videos(&self, channel: &Channel) -> Arc<Vec<Video>> {
        let key = keys::channel_videos(&channel.channel_id);
        if let Some(CacheValue::Videos(videos)) = self.cache.get(&key) {
            debug!(channel_id = %channel.channel_id, "cache hit for channel videos");
            return videos;
        }

        debug!(channel_id = %channel.channel_id, "fetching channel feed");
        let parsed = match self.source.fetch_feed(&channel.channel_id).await {
            Ok(xml) => parse_feed(&xml, channel),
            Err(err) => Err(err),
        };

        match parsed {
            Ok(videos) => {
                let videos = Arc::new(videos);
                for video in videos.iter() {
                    self.cache
                        .set(keys::video(&video.id), CacheValue::Video(Arc::new(video.clone())));
                }
                self.cache.set(key, CacheValue::Videos(videos.clone()));
                videos
            }
            Err(err) => {
                warn!(channel_id = %channel.channel_id, error = %err, "channel feed unavailable");
                Arc::new(Vec::new())
            }
        }
    }
}

/// Atom elements read from each `<entry>`, keyed by their qualified names.
#[derive(Debug, Clone, Copy)]
enum EntryField {
    VideoId,
    Title,
    Author,
    Published,
    Description,
}

impl EntryField {
    fn from_tag(name: &[u8], in_author: bool) -> Option<Self> {
        match name {
            b"yt:videoId" => Some(Self::VideoId),
            b"title" => Some(Self::Title),
            b"name" if in_author => Some(Self::Author),
            b"published" => Some(Self::Published),
            b"media:description" => Some(Self::Description),
            _ => None,
        }
    }
}

/// First occurrence of every field inside one entry.
#[derive(Debug, Default)]
struct EntryFields {
    video_id: Option<String>,
    title: Option<String>,
    author: Option<String>,
    published: Option<String>,
    description: Option<String>,
    views: Option<String>,
}

impl EntryFields {
    fn slot(&mut self, field: EntryField) -> &mut Option<String> {
        match field {
            EntryField::VideoId => &mut self.video_id,
            EntryField::Title => &mut self.title,
            EntryField::Author => &mut self.author,
            EntryField::Published => &mut self.published,
            EntryField::Description => &mut self.description,
        }
    }

    /// Starts collecting text for `field` unless an earlier element already
    /// filled it.
    fn open(&mut self, field: EntryField) -> Option<EntryField> {
        let slot = self.slot(field);
        if slot.is_some() {
            return None;
        }
        *slot = Some(String::new());
        Some(field)
    }

    fn read_views(&mut self, tag: &BytesStart<'_>) -> Result<(), FeedError> {
        if self.views.is_some() {
            return Ok(());
        }
        for attr in tag.attributes().with_checks(false).flatten() {
            if attr.key.as_ref() == b"views" {
                let value = attr.unescape_value().map_err(parse_error)?;
                self.views = Some(value.trim().to_string());
            }
        }
        Ok(())
    }
}

fn parse_error(err: impl std::fmt::Display) -> FeedError {
    FeedError::Parse(err.to_string())
}

/// Normalizes the first `MAX_FEED_ENTRIES` entries of an Atom document.
///
/// Entries without a video id are skipped.
pub fn parse_feed(xml: &str, channel: &Channel) -> Result<Vec<Video>, FeedError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut saw_feed = false;
    let mut in_author = false;
    let mut entry: Option<EntryFields> = None;
    let mut current: Option<EntryField> = None;
    let mut videos = Vec::new();

    loop {
        match reader.read_event().map_err(parse_error)? {
            Event::Eof => break,
            Event::Start(tag) => match tag.name().as_ref() {
                b"feed" => saw_feed = true,
                b"entry" => entry = Some(EntryFields::default()),
                b"author" => in_author = true,
                b"media:statistics" => {
                    if let Some(fields) = entry.as_mut() {
                        fields.read_views(&tag)?;
                    }
                }
                name => {
                    current = match (entry.as_mut(), EntryField::from_tag(name, in_author)) {
                        (Some(fields), Some(field)) => fields.open(field),
                        _ => None,
                    };
                }
            },
            Event::Empty(tag) => match tag.name().as_ref() {
                b"feed" => saw_feed = true,
                b"media:statistics" => {
                    if let Some(fields) = entry.as_mut() {
                        fields.read_views(&tag)?;
                    }
                }
                name => {
                    if let (Some(fields), Some(field)) =
                        (entry.as_mut(), EntryField::from_tag(name, in_author))
                    {
                        fields.open(field);
                    }
                }
            },
            Event::Text(text) => {
                if let (Some(fields), Some(field)) = (entry.as_mut(), current) {
                    let text = text.unescape().map_err(parse_error)?;
                    fields.slot(field).get_or_insert_with(String::new).push_str(&text);
                }
            }
            Event::CData(data) => {
                if let (Some(fields), Some(field)) = (entry.as_mut(), current) {
                    let text = String::from_utf8_lossy(&data);
                    fields.slot(field).get_or_insert_with(String::new).push_str(&text);
                }
            }
            Event::End(tag) => {
                current = None;
                match tag.name().as_ref() {
                    b"author" => in_author = false,
                    b"entry" => {
                        let finished = entry.take().and_then(|fields| normalize_entry(fields, channel));
                        if let Some(video) = finished {
                            videos.push(video);
                            if videos.len() == MAX_FEED_ENTRIES {
                                break;
                            }
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    if !saw_feed {
        return Err(FeedError::Parse("missing <feed> root".to_string()));
    }
    Ok(videos)
}

fn normalize_entry(fields: EntryFields, channel: &Channel) -> Option<Video> {
    let id = fields
        .video_id
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())?;
    let author = fields
        .author
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| channel.name.clone());
    let views = fields.views.filter(|value| !value.is_empty());

    Some(Video {
        snippet: VideoSnippet {
            title: fields.title.unwrap_or_default().trim().to_string(),
            description: truncate_description(fields.description.unwrap_or_default().trim()),
            thumbnails: Some(Thumbnails {
                high: Thumbnail {
                    url: crate::models::thumbnail_url(&id),
                },
            }),
            channel_title: author,
            channel_id: Some(channel.channel_id.clone()),
            published_at: fields.published.unwrap_or_default().trim().to_string(),
        },
        statistics: Some(VideoStatistics {
            view_count: views.unwrap_or_else(|| "0".to_string()),
            like_count: "0".to_string(),
        }),
        content_details: Some(ContentDetails {
            duration: "0:00".to_string(),
        }),
        id,
    })
}

/// Keeps at most `DESCRIPTION_LIMIT` characters and always appends the
/// ellipsis, even for short descriptions.
pub fn truncate_description(description: &str) -> String {
    let mut truncated: String = description.chars().take(DESCRIPTION_LIMIT).collect();
    truncated.push_str(ELLIPSIS);
    truncated
}

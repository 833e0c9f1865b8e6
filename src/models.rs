//! Records exchanged with the browser client.
//!
//! All structs serialize with camelCase keys because the frontend consumes
//! them as-is. Optional fields are explicit `Option`s so missing values show
//! up as `null` instead of disappearing from the payload.

use serde::{Deserialize, Serialize};

pub const CHANNEL_URL_PREFIX: &str = "https://www.youtube.com/channel/";
pub const WATCH_URL_PREFIX: &str = "https://www.youtube.com/watch?v=";

/// Canonical page for a channel id.
pub fn channel_url(channel_id: &str) -> String {
    format!("{CHANNEL_URL_PREFIX}{channel_id}")
}

/// Canonical watch page for a video id.
pub fn watch_url(video_id: &str) -> String {
    format!("{WATCH_URL_PREFIX}{video_id}")
}

/// Still image served for every video id, no lookup required.
pub fn thumbnail_url(video_id: &str) -> String {
    format!("https://i.ytimg.com/vi/{video_id}/hqdefault.jpg")
}

/// Avatar endpoint used when the extractor gives us nothing better.
pub fn fallback_profile_image(channel_id: &str) -> String {
    format!("https://yt3.ggpht.com/channel/{channel_id}")
}

/// A subscribed channel as imported by the client.
///
/// Only `channel_id` is required on input; several endpoints receive bare
/// ids and fill the rest in later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub channel_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

impl Channel {
    pub fn from_id(channel_id: impl Into<String>) -> Self {
        let channel_id = channel_id.into();
        Self {
            url: channel_url(&channel_id),
            channel_id,
            name: String::new(),
            handle: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Video {
    pub id: String,
    pub snippet: VideoSnippet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<VideoStatistics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_details: Option<ContentDetails>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoSnippet {
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnails: Option<Thumbnails>,
    pub channel_title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    /// RFC 3339 timestamp as published by the feed.
    pub published_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thumbnails {
    pub high: Thumbnail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thumbnail {
    pub url: String,
}

/// Counts are strings on the wire, mirroring the YouTube Data API shape the
/// client was written against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoStatistics {
    pub view_count: String,
    pub like_count: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentDetails {
    pub duration: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    pub channel_id: String,
    pub name: String,
    pub url: String,
    pub description: String,
    pub subscriber_count: u64,
    pub video_count: u64,
    pub profile_image: Option<String>,
    pub banner_image: Option<String>,
    pub categories: Vec<String>,
    pub tags: Vec<String>,
    pub country: Option<String>,
    pub custom_url: Option<String>,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoDetails {
    pub id: String,
    pub title: String,
    pub description: String,
    pub channel_title: String,
    pub duration: String,
    pub formats: Vec<VideoFormat>,
    pub categories: Vec<String>,
}

/// One playable rendition, deduplicated per height.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoFormat {
    pub quality: String,
    pub height: u32,
    pub width: u32,
    pub fps: f64,
    pub itag: String,
    pub container: String,
    pub codecs: String,
    pub bitrate: f64,
    pub has_audio: bool,
}

//! Process-wide key/value cache with per-entry expiry.
//!
//! Entries expire lazily: `get` on a stale key evicts it and reports a miss.
//! `purge_expired` exists for the optional background sweeper so memory held
//! by keys that are never read again is eventually released.

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::{task::JoinHandle, time::Instant};

use crate::models::{ChannelInfo, Video, VideoDetails};

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(600);

/// Rough memory footprint of a cached value, used for `CacheStats::vsize`.
pub trait ApproxSize {
    fn approx_size(&self) -> usize;
}

/// Counters reported by `/api/cache/stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub keys: usize,
    pub hits: u64,
    pub misses: u64,
    pub ksize: usize,
    pub vsize: usize,
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

struct Inner<V> {
    entries: HashMap<String, Entry<V>>,
    hits: u64,
    misses: u64,
}

pub struct TtlCache<V> {
    inner: Mutex<Inner<V>>,
    default_ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
            }),
            default_ttl,
        }
    }

    /// Returns a clone of the live value. Values are expected to be cheap to
    /// clone (`Arc` payloads), so two reads share one allocation.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let lookup = inner
            .entries
            .get(key)
            .map(|entry| (entry.expires_at > now).then(|| entry.value.clone()));

        match lookup {
            Some(Some(value)) => {
                inner.hits += 1;
                Some(value)
            }
            Some(None) => {
                inner.entries.remove(key);
                inner.misses += 1;
                None
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    /// Stores `value`, replacing whatever was there (last write wins).
    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.inner.lock().entries.insert(key.into(), entry);
    }

    /// Drops every entry and resets the hit/miss counters.
    pub fn flush_all(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.hits = 0;
        inner.misses = 0;
    }

    /// Evicts stale entries and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| entry.expires_at > now);
        before - inner.entries.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone + ApproxSize> TtlCache<V> {
    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let inner = self.inner.lock();
        let mut stats = CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            ..CacheStats::default()
        };
        for (key, entry) in inner.entries.iter() {
            if entry.expires_at <= now {
                continue;
            }
            stats.keys += 1;
            stats.ksize += key.len();
            stats.vsize += entry.value.approx_size();
        }
        stats
    }
}

/// Payloads stored in the shared backend cache.
#[derive(Debug, Clone)]
pub enum CacheValue {
    Videos(Arc<Vec<Video>>),
    Video(Arc<Video>),
    ChannelInfo(Arc<ChannelInfo>),
    VideoDetails(Arc<VideoDetails>),
}

impl ApproxSize for CacheValue {
    fn approx_size(&self) -> usize {
        let encoded = match self {
            Self::Videos(videos) => serde_json::to_vec(videos.as_ref()),
            Self::Video(video) => serde_json::to_vec(video.as_ref()),
            Self::ChannelInfo(info) => serde_json::to_vec(info.as_ref()),
            Self::VideoDetails(details) => serde_json::to_vec(details.as_ref()),
        };
        encoded.map(|bytes| bytes.len()).unwrap_or(0)
    }
}

pub type SharedCache = Arc<TtlCache<CacheValue>>;

/// Key layout shared by every cache user. Each family has its own prefix so
/// video lists and metadata never collide.
pub mod keys {
    pub fn channel_videos(channel_id: &str) -> String {
        format!("channel:{channel_id}")
    }

    pub fn channel_info(channel_id: &str) -> String {
        format!("channelInfo:{channel_id}")
    }

    pub fn video_info(video_id: &str) -> String {
        format!("videoInfo:{video_id}")
    }

    pub fn video(video_id: &str) -> String {
        format!("video:{video_id}")
    }
}

/// Periodically purges expired entries for the lifetime of the process.
pub fn spawn_sweeper<V>(cache: Arc<TtlCache<V>>, every: Duration) -> JoinHandle<()>
where
    V: Clone + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = cache.purge_expired();
            if removed > 0 {
                tracing::debug!(removed, "purged expired cache entries");
            }
        }
    })
}

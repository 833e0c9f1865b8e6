//! Fan-out over many channels, either collected into one sorted list or
//! reported batch by batch as progress events.

use std::{cmp::Reverse, sync::Arc};

use chrono::{DateTime, FixedOffset};
use futures_util::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::mpsc,
    task::{JoinError, JoinHandle},
};
use tracing::{debug, error, info};

use crate::{
    feed::ChannelVideoFetcher,
    limiter::ConcurrencyLimiter,
    models::{Channel, Video},
};

pub const COLLECT_BATCH_SIZE: usize = 10;
pub const STREAM_BATCH_SIZE: usize = 5;

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("channel fetch task failed: {0}")]
    Task(#[from] JoinError),
}

/// Progress messages for the streaming endpoint, serialized as
/// `{"type": "...", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FeedEvent {
    Connected,
    Batch {
        videos: Vec<Video>,
        processed: usize,
        total: usize,
    },
    /// `total` counts videos, not channels.
    Complete { videos: Vec<Video>, total: usize },
    Error { error: String },
}

#[derive(Clone)]
pub struct BatchAggregator {
    fetcher: ChannelVideoFetcher,
    limiter: ConcurrencyLimiter,
}

impl BatchAggregator {
    pub fn new(fetcher: ChannelVideoFetcher, limiter: ConcurrencyLimiter) -> Self {
        Self { fetcher, limiter }
    }

    /// Fetches `channels` behind the limiter on a driver task.
    ///
    /// The driver takes a slot for each channel in order and moves it into
    /// that channel's fetch task, so fetches start in submission order. It
    /// runs detached: fetches complete, and are cached, even if whoever
    /// awaits the handle goes away.
    fn spawn_ordered(&self, channels: Vec<Channel>) -> JoinHandle<Vec<Result<Arc<Vec<Video>>, JoinError>>> {
        let fetcher = self.fetcher.clone();
        let limiter = self.limiter.clone();
        tokio::spawn(async move {
            let mut handles = Vec::with_capacity(channels.len());
            for channel in channels {
                let permit = limiter.acquire().await;
                let fetcher = fetcher.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    fetcher.fetch_channel_videos(&channel).await
                }));
            }
            join_all(handles).await
        })
    }

    /// Videos of every channel in `channels`, concatenated in channel order.
    async fn fetch_in_order(&self, channels: Vec<Channel>) -> Result<Vec<Video>, JoinError> {
        let mut videos = Vec::new();
        for result in self.spawn_ordered(channels).await? {
            videos.extend(result?.iter().cloned());
        }
        Ok(videos)
    }

    /// Every channel's videos, newest first.
    ///
    /// Batches are not barriers here: every batch is queued at once and only
    /// the limiter throttles them.
    pub async fn fetch_all_videos(&self, channels: &[Channel]) -> Result<Vec<Video>, AggregateError> {
        info!(
            channels = channels.len(),
            batches = channels.len().div_ceil(COLLECT_BATCH_SIZE),
            "fetching videos for channels"
        );
        let mut videos = self.fetch_in_order(channels.to_vec()).await?;
        sort_by_recency(&mut videos);
        info!(videos = videos.len(), "collected channel videos");
        Ok(videos)
    }

    /// Processes channels five at a time, one batch after another, and
    /// reports each batch as it lands.
    ///
    /// Stops early when the receiver is gone; fetches already in flight
    /// still finish. A failed batch ends the run with an `Error` event.
    pub async fn stream_videos(&self, channels: Vec<Channel>, events: mpsc::Sender<FeedEvent>) {
        if events.send(FeedEvent::Connected).await.is_err() {
            return;
        }

        let total = channels.len();
        let mut processed = 0;
        let mut all_videos = Vec::new();

        for batch in channels.chunks(STREAM_BATCH_SIZE) {
            let batch_videos = match self.fetch_in_order(batch.to_vec()).await {
                Ok(videos) => videos,
                Err(err) => {
                    error!(error = %err, "channel batch failed");
                    let _ = events
                        .send(FeedEvent::Error {
                            error: err.to_string(),
                        })
                        .await;
                    return;
                }
            };

            processed += batch.len();
            all_videos.extend(batch_videos.iter().cloned());
            debug!(processed, total, "channel batch done");

            let event = FeedEvent::Batch {
                videos: batch_videos,
                processed,
                total,
            };
            if events.send(event).await.is_err() {
                debug!(processed, total, "progress receiver dropped, stopping");
                return;
            }
        }

        sort_by_recency(&mut all_videos);
        let total = all_videos.len();
        let _ = events
            .send(FeedEvent::Complete {
                videos: all_videos,
                total,
            })
            .await;
    }
}

fn published_at(video: &Video) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(video.snippet.published_at.trim()).ok()
}

/// Newest first. Videos whose timestamp does not parse go last; ties keep
/// their input order.
pub fn sort_by_recency(videos: &mut [Video]) {
    videos.sort_by_cached_key(|video| Reverse(published_at(video)));
}

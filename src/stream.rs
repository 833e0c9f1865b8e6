//! Live video proxy: one extractor process per request, piped straight into
//! the response body.
//!
//! The process must never outlive its response. `StreamProcess` owns the
//! child and tears it down on drop, which covers normal completion, client
//! disconnects (hyper drops the body) and handler errors alike.

use std::{
    fmt, io,
    pin::Pin,
    process::ExitStatus,
    str::FromStr,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use futures_util::Stream;
use nix::{
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, ChildStderr, ChildStdout},
    runtime::Handle,
    task::JoinHandle,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::{
    extractor::{Extractor, ExtractorError},
    models::watch_url,
};

pub const DEFAULT_QUALITY_HEIGHT: u32 = 1080;
pub const HIGHEST_QUALITY_HEIGHT: u32 = 1440;
pub const TERMINATE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
#[error("invalid quality {0:?}, expected \"highest\" or a pixel height")]
pub struct InvalidQuality(String);

#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Extractor(#[from] ExtractorError),
    #[error("stream process has no stdout")]
    MissingStdout,
}

/// Requested output quality, capped at a maximum frame height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Highest,
    Height(u32),
}

impl Quality {
    /// Parses the `quality` query parameter; absent means 1080p.
    pub fn parse(raw: Option<&str>) -> Result<Self, InvalidQuality> {
        match raw {
            None => Ok(Self::default()),
            Some(value) => value.parse(),
        }
    }

    pub fn max_height(self) -> u32 {
        match self {
            Self::Highest => HIGHEST_QUALITY_HEIGHT,
            Self::Height(height) => height,
        }
    }

    /// Best video at or under the cap merged with best audio, falling back to
    /// a muxed stream under the cap, then to anything.
    pub fn format_selector(self) -> String {
        let height = self.max_height();
        format!("bestvideo[height<={height}]+bestaudio/best[height<={height}]/best")
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self::Height(DEFAULT_QUALITY_HEIGHT)
    }
}

impl FromStr for Quality {
    type Err = InvalidQuality;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("highest") {
            return Ok(Self::Highest);
        }
        match trimmed.parse::<u32>() {
            Ok(height) if height > 0 => Ok(Self::Height(height)),
            _ => Err(InvalidQuality(value.to_string())),
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Highest => f.write_str("highest"),
            Self::Height(height) => write!(f, "{height}p"),
        }
    }
}

/// Owns a running extractor process.
pub struct StreamProcess {
    child: Option<Child>,
    video_id: String,
}

impl StreamProcess {
    pub fn new(child: Child, video_id: impl Into<String>) -> Self {
        Self {
            child: Some(child),
            video_id: video_id.into(),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    pub fn is_terminated(&self) -> bool {
        self.child.is_none()
    }

    /// Sends SIGTERM and hands the child to a reaper task that escalates to
    /// SIGKILL after `TERMINATE_GRACE`.
    ///
    /// Only the first call does anything. Outside a runtime the child is
    /// killed outright and `None` is returned.
    pub fn terminate(&mut self) -> Option<JoinHandle<Option<ExitStatus>>> {
        let mut child = self.child.take()?;

        if let Some(pid) = child.id() {
            if let Err(err) = send_sigterm(pid) {
                debug!(video_id = %self.video_id, pid, error = %err, "SIGTERM not delivered");
            }
        }

        let Ok(runtime) = Handle::try_current() else {
            if let Err(err) = child.start_kill() {
                warn!(video_id = %self.video_id, error = %err, "failed to kill stream process");
            }
            return None;
        };
        Some(runtime.spawn(reap(child, self.video_id.clone())))
    }
}

impl Drop for StreamProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn send_sigterm(pid: u32) -> nix::Result<()> {
    let pid = i32::try_from(pid).map_err(|_| nix::errno::Errno::ESRCH)?;
    kill(Pid::from_raw(pid), Signal::SIGTERM)
}

async fn reap(mut child: Child, video_id: String) -> Option<ExitStatus> {
    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(%video_id, %status, "stream process exited");
            Some(status)
        }
        Ok(Err(err)) => {
            warn!(%video_id, error = %err, "failed to wait for stream process");
            None
        }
        Err(_) => {
            debug!(%video_id, "stream process ignored SIGTERM, killing");
            if let Err(err) = child.kill().await {
                warn!(%video_id, error = %err, "failed to kill stream process");
                return None;
            }
            child.wait().await.ok()
        }
    }
}

/// Response body backed by the process's stdout.
pub struct MediaStream {
    stdout: ReaderStream<ChildStdout>,
    process: StreamProcess,
}

impl MediaStream {
    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }
}

impl Stream for MediaStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.process.is_terminated() {
            return Poll::Ready(None);
        }
        match Pin::new(&mut this.stdout).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(err))) => {
                warn!(video_id = %this.process.video_id, error = %err, "stream read failed");
                this.process.terminate();
                Poll::Ready(None)
            }
            Poll::Ready(None) => {
                debug!(video_id = %this.process.video_id, "stream finished");
                this.process.terminate();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Launches the extractor for `video_id` and returns its output as a byte
/// stream. Fails before any bytes are produced if the process cannot start.
pub fn open_stream(
    extractor: &Extractor,
    video_id: &str,
    quality: Quality,
) -> Result<MediaStream, StreamError> {
    let selector = quality.format_selector();
    let mut child = extractor.spawn_media_pipe(&watch_url(video_id), &selector)?;
    info!(video_id, %quality, pid = ?child.id(), "started stream process");

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(log_stderr(stderr, video_id.to_string()));
    }
    let stdout = child.stdout.take();
    let process = StreamProcess::new(child, video_id);
    let stdout = stdout.ok_or(StreamError::MissingStdout)?;

    Ok(MediaStream {
        stdout: ReaderStream::new(stdout),
        process,
    })
}

async fn log_stderr(stderr: ChildStderr, video_id: String) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.contains("WARNING:") {
            debug!(%video_id, "extractor: {line}");
        }
    }
}

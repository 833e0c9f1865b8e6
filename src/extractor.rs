//! Thin wrapper around the `yt-dlp` executable.
//!
//! Two kinds of invocations exist: one-shot JSON dumps (`--dump-single-json`)
//! that are awaited to completion, and long-running media pipes whose stdout
//! is handed to the stream proxy.

use std::{
    io,
    path::PathBuf,
    process::{ExitStatus, Stdio},
};

use serde::{Deserialize, Deserializer, de::DeserializeOwned};
use thiserror::Error;
use tokio::process::{Child, Command};

pub const DEFAULT_YTDLP_PROGRAM: &str = "yt-dlp";

const REFERER_HEADER: &str = "referer:youtube.com";
const USER_AGENT_HEADER: &str = "user-agent:Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";
const STDERR_EXCERPT_LIMIT: usize = 512;

#[derive(Debug, Error)]
pub enum ExtractorError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("extractor exited with {status}: {stderr}")]
    Failed { status: ExitStatus, stderr: String },
    #[error("invalid extractor output: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Location of the extractor binary plus the argument conventions shared by
/// every invocation.
#[derive(Debug, Clone)]
pub struct Extractor {
    program: PathBuf,
}

impl Extractor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.stdin(Stdio::null());
        command
    }

    fn add_headers(command: &mut Command) {
        command
            .arg("--add-header")
            .arg(REFERER_HEADER)
            .arg("--add-header")
            .arg(USER_AGENT_HEADER);
    }

    /// Channel-level metadata without expanding the uploads playlist.
    pub async fn channel_info(&self, channel_url: &str) -> Result<RawChannelInfo, ExtractorError> {
        let mut command = self.command();
        command
            .arg("--dump-single-json")
            .arg("--playlist-end")
            .arg("1")
            .arg("--flat-playlist")
            .arg("--no-check-certificates")
            .arg("--no-warnings")
            .arg("--quiet");
        Self::add_headers(&mut command);
        command.arg(channel_url);
        self.dump_json(command).await
    }

    pub async fn video_info(&self, video_url: &str) -> Result<RawVideoInfo, ExtractorError> {
        let mut command = self.command();
        command
            .arg("--dump-single-json")
            .arg("--no-check-certificates")
            .arg("--no-warnings")
            .arg("--prefer-free-formats");
        Self::add_headers(&mut command);
        command.arg(video_url);
        self.dump_json(command).await
    }

    async fn dump_json<T: DeserializeOwned>(&self, mut command: Command) -> Result<T, ExtractorError> {
        let output = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| ExtractorError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr: String = stderr.trim().chars().take(STDERR_EXCERPT_LIMIT).collect();
            return Err(ExtractorError::Failed {
                status: output.status,
                stderr,
            });
        }

        Ok(serde_json::from_slice(&output.stdout)?)
    }

    /// Starts a process that writes a single remuxed mp4 to stdout.
    ///
    /// `kill_on_drop` is only a backstop; callers are expected to wrap the
    /// child in a `StreamProcess` for graceful teardown.
    pub fn spawn_media_pipe(&self, video_url: &str, selector: &str) -> Result<Child, ExtractorError> {
        let mut command = self.command();
        command
            .arg("--format")
            .arg(selector)
            .arg("--output")
            .arg("-")
            .arg("--quiet")
            .arg("--no-warnings")
            .arg("--prefer-free-formats")
            .arg("--no-check-certificates")
            .arg("--remux-video")
            .arg("mp4");
        Self::add_headers(&mut command);
        command
            .arg(video_url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExtractorError::Spawn {
                program: self.program.display().to_string(),
                source,
            })
    }
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new(DEFAULT_YTDLP_PROGRAM)
    }
}

/// yt-dlp writes `null` for many absent collections.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Subset of the channel dump that the metadata fetcher maps.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawChannelInfo {
    pub uploader: Option<String>,
    pub channel: Option<String>,
    pub description: Option<String>,
    pub channel_follower_count: Option<u64>,
    pub playlist_count: Option<u64>,
    pub uploader_url: Option<String>,
    pub uploader_location: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub thumbnails: Vec<RawThumbnail>,
    #[serde(deserialize_with = "null_as_default")]
    pub categories: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub tags: Vec<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct RawThumbnail {
    pub url: Option<String>,
    pub width: Option<u64>,
    pub height: Option<u64>,
}

/// Subset of the single-video dump.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawVideoInfo {
    pub title: Option<String>,
    pub description: Option<String>,
    pub uploader: Option<String>,
    pub duration: Option<f64>,
    #[serde(deserialize_with = "null_as_default")]
    pub formats: Vec<RawFormat>,
    #[serde(deserialize_with = "null_as_default")]
    pub categories: Vec<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct RawFormat {
    pub format_id: Option<String>,
    pub format_note: Option<String>,
    pub ext: Option<String>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub tbr: Option<f64>,
}

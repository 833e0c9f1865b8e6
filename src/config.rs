#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    cache::DEFAULT_TTL, extractor::DEFAULT_YTDLP_PROGRAM, feed::DEFAULT_FEED_BASE_URL,
    limiter::DEFAULT_MAX_CONCURRENCY, metadata::METADATA_TTL,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_SUBFEED_PORT: u16 = 3001;
pub const DEFAULT_SUBFEED_HOST: &str = "127.0.0.1";

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub ytdlp_path: PathBuf,
    pub feed_base_url: String,
    pub cache_ttl: Duration,
    pub metadata_ttl: Duration,
    pub max_concurrency: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_SUBFEED_HOST.to_string(),
            port: DEFAULT_SUBFEED_PORT,
            ytdlp_path: PathBuf::from(DEFAULT_YTDLP_PROGRAM),
            feed_base_url: DEFAULT_FEED_BASE_URL.to_string(),
            cache_ttl: DEFAULT_TTL,
            metadata_ttl: METADATA_TTL,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Values supplied on the command line. They win over the environment,
/// which wins over the env file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub ytdlp_path: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_server_config(overrides: ConfigOverrides) -> Result<ServerConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_server_config_with_overrides(
        &file_vars,
        env_var_string,
        overrides,
    ))
}

#[cfg(test)]
fn build_server_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> ServerConfig {
    build_server_config_with_overrides(file_vars, env_lookup, ConfigOverrides::default())
}

fn build_server_config_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: ConfigOverrides,
) -> ServerConfig {
    let defaults = ServerConfig::default();
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);
    let parsed_secs = |key: &str| {
        lookup(key)
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    };

    let host = overrides
        .host
        .and_then(non_blank)
        .or_else(|| lookup("SUBFEED_HOST"))
        .unwrap_or(defaults.host);
    let port = overrides
        .port
        .or_else(|| lookup("SUBFEED_PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(defaults.port);
    let ytdlp_path = overrides
        .ytdlp_path
        .filter(|path| !path.as_os_str().is_empty())
        .or_else(|| lookup("YTDLP_PATH").map(PathBuf::from))
        .unwrap_or(defaults.ytdlp_path);
    let feed_base_url = lookup("SUBFEED_FEED_BASE_URL").unwrap_or(defaults.feed_base_url);
    let cache_ttl = parsed_secs("SUBFEED_CACHE_TTL_SECS").unwrap_or(defaults.cache_ttl);
    let metadata_ttl = parsed_secs("SUBFEED_METADATA_TTL_SECS").unwrap_or(defaults.metadata_ttl);
    let max_concurrency = lookup("SUBFEED_MAX_CONCURRENCY")
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|limit| *limit > 0)
        .unwrap_or(defaults.max_concurrency);

    ServerConfig {
        host,
        port,
        ytdlp_path,
        feed_base_url,
        cache_ttl,
        metadata_ttl,
        max_concurrency,
    }
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(non_blank)
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .and_then(non_blank)
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn config_from(contents: &str) -> ServerConfig {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_server_config(&vars, |_| None)
    }

    #[test]
    fn empty_file_yields_defaults() {
        let config = config_from("");
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.bind_addr(), "127.0.0.1:3001");
        assert_eq!(config.ytdlp_path, PathBuf::from("yt-dlp"));
        assert_eq!(config.cache_ttl, Duration::from_secs(300));
        assert_eq!(config.metadata_ttl, Duration::from_secs(3600));
        assert_eq!(config.max_concurrency, 10);
    }

    #[test]
    fn reads_every_key_from_file() {
        let config = config_from(
            "SUBFEED_HOST=\"0.0.0.0\"\nSUBFEED_PORT=\"4242\"\nYTDLP_PATH=/opt/yt-dlp\n\
             SUBFEED_FEED_BASE_URL=http://localhost:9/feed\nSUBFEED_CACHE_TTL_SECS=60\n\
             SUBFEED_METADATA_TTL_SECS=120\nSUBFEED_MAX_CONCURRENCY=4\n",
        );
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 4242);
        assert_eq!(config.ytdlp_path, PathBuf::from("/opt/yt-dlp"));
        assert_eq!(config.feed_base_url, "http://localhost:9/feed");
        assert_eq!(config.cache_ttl, Duration::from_secs(60));
        assert_eq!(config.metadata_ttl, Duration::from_secs(120));
        assert_eq!(config.max_concurrency, 4);
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let config = config_from(
            "SUBFEED_PORT=\"nope\"\nSUBFEED_CACHE_TTL_SECS=-5\nSUBFEED_METADATA_TTL_SECS=0\n\
             SUBFEED_MAX_CONCURRENCY=0\n",
        );
        assert_eq!(config.port, DEFAULT_SUBFEED_PORT);
        assert_eq!(config.cache_ttl, DEFAULT_TTL);
        assert_eq!(config.metadata_ttl, METADATA_TTL);
        assert_eq!(config.max_concurrency, DEFAULT_MAX_CONCURRENCY);
    }

    #[test]
    fn env_wins_over_file() {
        let vars = read_env_file(make_config("SUBFEED_PORT=7000\nYTDLP_PATH=/file\n").path())
            .unwrap();
        let config = build_server_config(&vars, |key| {
            if key == "SUBFEED_PORT" {
                Some("8000".to_string())
            } else {
                None
            }
        });
        assert_eq!(config.port, 8000);
        assert_eq!(config.ytdlp_path, PathBuf::from("/file"));
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export SUBFEED_HOST="0.0.0.0"
            YTDLP_PATH='/usr/local/bin/yt-dlp'
            SUBFEED_PORT =  "9090"
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("SUBFEED_HOST").unwrap(), "0.0.0.0");
        assert_eq!(vars.get("YTDLP_PATH").unwrap(), "/usr/local/bin/yt-dlp");
        assert_eq!(vars.get("SUBFEED_PORT").unwrap(), "9090");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn override_precedence() {
        let mut vars = HashMap::new();
        vars.insert("SUBFEED_HOST".to_string(), "file-host".to_string());
        vars.insert("SUBFEED_PORT".to_string(), "7000".to_string());
        vars.insert("YTDLP_PATH".to_string(), "/file/yt-dlp".to_string());

        let overrides = ConfigOverrides {
            host: Some("override-host".into()),
            port: Some(9000),
            ytdlp_path: None,
            env_path: None,
        };

        let config = build_server_config_with_overrides(
            &vars,
            |key| {
                if key == "YTDLP_PATH" {
                    Some("/env/yt-dlp".to_string())
                } else if key == "SUBFEED_PORT" {
                    Some("8000".to_string())
                } else {
                    None
                }
            },
            overrides,
        );

        assert_eq!(config.host, "override-host");
        assert_eq!(config.port, 9000);
        assert_eq!(config.ytdlp_path, PathBuf::from("/env/yt-dlp"));
    }

    #[test]
    fn blank_values_are_ignored() {
        let vars = read_env_file(make_config("SUBFEED_HOST=\"  \"\nYTDLP_PATH=\n").path()).unwrap();
        let config = build_server_config_with_overrides(
            &vars,
            |_| None,
            ConfigOverrides {
                host: Some("   ".into()),
                ..ConfigOverrides::default()
            },
        );
        assert_eq!(config.host, DEFAULT_SUBFEED_HOST);
        assert_eq!(config.ytdlp_path, PathBuf::from(DEFAULT_YTDLP_PROGRAM));
    }

    #[test]
    fn resolve_reads_explicit_env_path() {
        let cfg = make_config("SUBFEED_FEED_BASE_URL=http://127.0.0.1:1/feed\n");
        let config = resolve_server_config(ConfigOverrides {
            env_path: Some(cfg.path().to_path_buf()),
            ..ConfigOverrides::default()
        })
        .unwrap();
        assert_eq!(config.feed_base_url, "http://127.0.0.1:1/feed");
    }
}

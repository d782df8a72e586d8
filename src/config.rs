use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Credentials and endpoint for the upstream workspace.
///
/// Credential acquisition itself is out of scope — tokens are read from this
/// config (or the environment) and handed to the client as-is. The presence
/// of `app_token` is what enables push capture; without it the poller is the
/// only live-capture option.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Bot or user token used for all Web API calls.
    pub token: String,
    /// App-level token for the long-lived event socket. Optional.
    #[serde(default)]
    pub app_token: Option<String>,
    /// API base URL override, mainly for tests against a local stub.
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

fn default_api_base() -> String {
    "https://slack.com/api".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    /// Minimum spacing between outbound requests, shared by every worker.
    #[serde(default = "default_request_interval_ms")]
    pub request_interval_ms: u64,
    /// Worker count for full backfills of fresh channels.
    #[serde(default = "default_backfill_concurrency")]
    pub backfill_concurrency: usize,
    /// Worker count for incremental checks (most return zero new messages).
    #[serde(default = "default_incremental_concurrency")]
    pub incremental_concurrency: usize,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// How often the poller refreshes its in-memory channel list.
    #[serde(default = "default_channel_refresh_secs")]
    pub channel_refresh_secs: u64,
    /// TTL gate for low-value per-channel metadata (pins, bookmarks).
    #[serde(default = "default_metadata_ttl_secs")]
    pub metadata_ttl_secs: u64,
}

fn default_request_interval_ms() -> u64 {
    1200
}
fn default_backfill_concurrency() -> usize {
    2
}
fn default_incremental_concurrency() -> usize {
    6
}
fn default_poll_interval_secs() -> u64 {
    60
}
fn default_channel_refresh_secs() -> u64 {
    900
}
fn default_metadata_ttl_secs() -> u64 {
    86_400
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            request_interval_ms: default_request_interval_ms(),
            backfill_concurrency: default_backfill_concurrency(),
            incremental_concurrency: default_incremental_concurrency(),
            poll_interval_secs: default_poll_interval_secs(),
            channel_refresh_secs: default_channel_refresh_secs(),
            metadata_ttl_secs: default_metadata_ttl_secs(),
        }
    }
}

impl LimitsConfig {
    pub fn request_interval(&self) -> Duration {
        Duration::from_millis(self.request_interval_ms)
    }

    pub fn metadata_ttl(&self) -> Duration {
        Duration::from_secs(self.metadata_ttl_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_final_limit")]
    pub final_limit: i64,
    /// Messages fetched on each side of a non-thread hit during context
    /// expansion.
    #[serde(default = "default_context_window")]
    pub context_window: i64,
}

fn default_final_limit() -> i64 {
    12
}
fn default_context_window() -> i64 {
    5
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            final_limit: default_final_limit(),
            context_window: default_context_window(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.source.token.is_empty() {
        anyhow::bail!("source.token must not be empty");
    }

    if config.limits.request_interval_ms == 0 {
        anyhow::bail!("limits.request_interval_ms must be > 0");
    }

    if config.limits.backfill_concurrency == 0 || config.limits.incremental_concurrency == 0 {
        anyhow::bail!("limits concurrency values must be >= 1");
    }

    if config.retrieval.final_limit < 1 {
        anyhow::bail!("retrieval.final_limit must be >= 1");
    }

    if config.retrieval.context_window < 0 {
        anyhow::bail!("retrieval.context_window must be >= 0");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_in() {
        let toml_src = r#"
            [db]
            path = "/tmp/chx.sqlite"

            [source]
            token = "xoxb-test"

            [server]
            bind = "127.0.0.1:7341"
        "#;
        let config: Config = toml::from_str(toml_src).unwrap();
        assert_eq!(config.limits.request_interval_ms, 1200);
        assert_eq!(config.limits.incremental_concurrency, 6);
        assert_eq!(config.retrieval.final_limit, 12);
        assert!(config.source.app_token.is_none());
    }
}

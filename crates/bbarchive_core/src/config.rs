use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "https://blackboard.utwente.nl";
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";

const DEFAULT_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_RATE_LIMIT_MS: u64 = 150;
const DEFAULT_RETRIES: usize = 2;
const DEFAULT_RETRY_DELAY_MS: u64 = 500;
const DEFAULT_MAX_REDIRECTS: usize = 10;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_POLL_LIMIT: usize = 60;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ArchiveConfig {
    #[serde(default)]
    pub blackboard: BlackboardSection,
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub stream: StreamSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct BlackboardSection {
    pub base_url: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct HttpSection {
    pub timeout_ms: Option<u64>,
    pub rate_limit_ms: Option<u64>,
    pub retries: Option<usize>,
    pub retry_delay_ms: Option<u64>,
    pub max_redirects: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct StreamSection {
    pub poll_interval_ms: Option<u64>,
    pub poll_limit: Option<usize>,
}

impl ArchiveConfig {
    /// Resolve the portal base URL: env BB_BASE_URL > config > DEFAULT_BASE_URL.
    pub fn base_url(&self) -> String {
        self.base_url_with_lookup(|key| env::var(key).ok())
    }

    fn base_url_with_lookup<F>(&self, lookup_env: F) -> String
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw = non_empty(lookup_env("BB_BASE_URL"))
            .or_else(|| self.blackboard.base_url.clone())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        raw.trim().trim_end_matches('/').to_string()
    }

    /// Resolve user agent: env BB_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        self.user_agent_with_lookup(|key| env::var(key).ok())
    }

    fn user_agent_with_lookup<F>(&self, lookup_env: F) -> String
    where
        F: Fn(&str) -> Option<String>,
    {
        non_empty(lookup_env("BB_USER_AGENT"))
            .or_else(|| self.blackboard.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn stream_poll_interval_ms(&self) -> u64 {
        self.stream
            .poll_interval_ms
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS)
    }

    pub fn stream_poll_limit(&self) -> usize {
        self.stream.poll_limit.unwrap_or(DEFAULT_POLL_LIMIT).max(1)
    }
}

/// HTTP settings for a portal session after env overrides are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub max_redirects: usize,
}

impl SessionConfig {
    pub fn from_config(config: &ArchiveConfig) -> Self {
        Self::from_config_with_lookup(config, |key| env::var(key).ok())
    }

    fn from_config_with_lookup<F>(config: &ArchiveConfig, lookup_env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let http = &config.http;
        Self {
            user_agent: config.user_agent_with_lookup(&lookup_env),
            timeout_ms: parsed(&lookup_env, "BB_HTTP_TIMEOUT_MS")
                .or(http.timeout_ms)
                .unwrap_or(DEFAULT_TIMEOUT_MS),
            rate_limit_ms: parsed(&lookup_env, "BB_RATE_LIMIT_MS")
                .or(http.rate_limit_ms)
                .unwrap_or(DEFAULT_RATE_LIMIT_MS),
            max_retries: parsed(&lookup_env, "BB_HTTP_RETRIES")
                .or(http.retries)
                .unwrap_or(DEFAULT_RETRIES),
            retry_delay_ms: parsed(&lookup_env, "BB_HTTP_RETRY_DELAY_MS")
                .or(http.retry_delay_ms)
                .unwrap_or(DEFAULT_RETRY_DELAY_MS),
            max_redirects: http.max_redirects.unwrap_or(DEFAULT_MAX_REDIRECTS),
        }
    }
}

/// Load and parse an ArchiveConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<ArchiveConfig> {
    if !config_path.exists() {
        return Ok(ArchiveConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: ArchiveConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parsed<F, V>(lookup_env: &F, key: &str) -> Option<V>
where
    F: Fn(&str) -> Option<String>,
    V: std::str::FromStr,
{
    lookup_env(key).and_then(|value| value.trim().parse::<V>().ok())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_has_no_overrides() {
        let config = ArchiveConfig::default();
        assert!(config.blackboard.base_url.is_none());
        assert!(config.http.timeout_ms.is_none());
        assert_eq!(config.stream_poll_limit(), DEFAULT_POLL_LIMIT);
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("load config");
        assert_eq!(config, ArchiveConfig::default());
    }

    #[test]
    fn load_config_parses_all_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[blackboard]
base_url = "https://bb.example.edu/"
user_agent = "archiver-test/1.0"

[http]
timeout_ms = 1000
rate_limit_ms = 0
retries = 5

[stream]
poll_interval_ms = 10
poll_limit = 3
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(
            config.blackboard.base_url.as_deref(),
            Some("https://bb.example.edu/")
        );
        assert_eq!(config.http.timeout_ms, Some(1000));
        assert_eq!(config.http.retries, Some(5));
        assert_eq!(config.stream_poll_interval_ms(), 10);
        assert_eq!(config.stream_poll_limit(), 3);
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[blackboard\nbase_url = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn base_url_prefers_env_and_trims_trailing_slash() {
        let config = ArchiveConfig {
            blackboard: BlackboardSection {
                base_url: Some("https://config.example.edu/".to_string()),
                user_agent: None,
            },
            ..ArchiveConfig::default()
        };
        assert_eq!(
            config.base_url_with_lookup(|_| None),
            "https://config.example.edu"
        );

        let env = HashMap::from([(
            "BB_BASE_URL".to_string(),
            " https://env.example.edu/ ".to_string(),
        )]);
        assert_eq!(
            config.base_url_with_lookup(|key| env.get(key).cloned()),
            "https://env.example.edu"
        );
    }

    #[test]
    fn session_config_applies_env_over_file_values() {
        let config = ArchiveConfig {
            http: HttpSection {
                timeout_ms: Some(5_000),
                retries: Some(4),
                ..HttpSection::default()
            },
            ..ArchiveConfig::default()
        };
        let env = HashMap::from([
            ("BB_HTTP_RETRIES".to_string(), "1".to_string()),
            ("BB_RATE_LIMIT_MS".to_string(), "not-a-number".to_string()),
        ]);
        let session = SessionConfig::from_config_with_lookup(&config, |key| env.get(key).cloned());
        assert_eq!(session.timeout_ms, 5_000);
        assert_eq!(session.max_retries, 1);
        assert_eq!(session.rate_limit_ms, DEFAULT_RATE_LIMIT_MS);
        assert_eq!(session.user_agent, DEFAULT_USER_AGENT);
        assert_eq!(session.max_redirects, DEFAULT_MAX_REDIRECTS);
    }

    #[test]
    fn session_user_agent_prefers_env_then_file() {
        let config = ArchiveConfig {
            blackboard: BlackboardSection {
                base_url: None,
                user_agent: Some("archiver-file/2.0".to_string()),
            },
            ..ArchiveConfig::default()
        };
        let from_file = SessionConfig::from_config_with_lookup(&config, |_| None);
        assert_eq!(from_file.user_agent, "archiver-file/2.0");

        let env = HashMap::from([("BB_USER_AGENT".to_string(), "archiver-env/3.0".to_string())]);
        let from_env = SessionConfig::from_config_with_lookup(&config, |key| env.get(key).cloned());
        assert_eq!(from_env.user_agent, "archiver-env/3.0");
        assert_eq!(
            config.user_agent_with_lookup(|key| env.get(key).cloned()),
            from_env.user_agent
        );

        let blank = HashMap::from([("BB_USER_AGENT".to_string(), "  ".to_string())]);
        let from_blank = SessionConfig::from_config_with_lookup(&config, |key| blank.get(key).cloned());
        assert_eq!(from_blank.user_agent, "archiver-file/2.0");
    }
}

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::compiler::{DEFAULT_IDENTIFIER, MINIMAL_IDENTIFIER};
use crate::filters::FilterSource;
use crate::matcher::MatcherLimits;
use crate::stats::DEFAULT_MAX_BLOCKED_URLS;

/// Configuration for the ad blocker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdBlockerConfig {
    #[serde(default = "default_settings_path")]
    pub settings_path: PathBuf,
    #[serde(default = "default_rule_set_identifier")]
    pub rule_set_identifier: String,
    #[serde(default = "default_minimal_rule_set_identifier")]
    pub minimal_rule_set_identifier: String,
    #[serde(default = "default_max_rules")]
    pub max_rules: usize,
    #[serde(default = "default_regex_size_limit")]
    pub regex_size_limit: usize,
    #[serde(default = "default_max_blocked_urls_per_page")]
    pub max_blocked_urls_per_page: usize,
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
    /// Lists registered (empty) at start-up and filled by a refresh.
    #[serde(default)]
    pub subscriptions: Vec<FilterSource>,
}

impl Default for AdBlockerConfig {
    fn default() -> Self {
        Self {
            settings_path: default_settings_path(),
            rule_set_identifier: default_rule_set_identifier(),
            minimal_rule_set_identifier: default_minimal_rule_set_identifier(),
            max_rules: default_max_rules(),
            regex_size_limit: default_regex_size_limit(),
            max_blocked_urls_per_page: default_max_blocked_urls_per_page(),
            command_buffer: default_command_buffer(),
            subscriptions: vec![FilterSource::easylist(), FilterSource::easyprivacy()],
        }
    }
}

impl AdBlockerConfig {
    /// Keeps all state under `dir` and starts without subscriptions.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            settings_path: dir.as_ref().join("settings.json"),
            subscriptions: vec![],
            ..Self::default()
        }
    }

    /// Loads a JSON configuration file; missing keys take their defaults.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn matcher_limits(&self) -> MatcherLimits {
        MatcherLimits {
            max_rules: self.max_rules,
            regex_size_limit: self.regex_size_limit,
        }
    }
}

// Defaults
fn default_settings_path() -> PathBuf {
    let base = std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local/share")))
        .unwrap_or_else(std::env::temp_dir);
    base.join("ad-blocker").join("settings.json")
}
fn default_rule_set_identifier() -> String {
    DEFAULT_IDENTIFIER.to_string()
}
fn default_minimal_rule_set_identifier() -> String {
    MINIMAL_IDENTIFIER.to_string()
}
fn default_max_rules() -> usize {
    MatcherLimits::default().max_rules
}
fn default_regex_size_limit() -> usize {
    MatcherLimits::default().regex_size_limit
}
fn default_max_blocked_urls_per_page() -> usize {
    DEFAULT_MAX_BLOCKED_URLS
}
fn default_command_buffer() -> usize {
    256
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_partial_config_takes_defaults() {
        let path = std::env::temp_dir()
            .join(format!("ad-blocker-config-{}.json", std::process::id()));
        tokio::fs::write(&path, r#"{"max_rules": 10, "subscriptions": []}"#)
            .await
            .unwrap();

        let config = AdBlockerConfig::load(&path).await.unwrap();
        assert_eq!(config.max_rules, 10);
        assert_eq!(config.max_blocked_urls_per_page, DEFAULT_MAX_BLOCKED_URLS);
        assert_eq!(config.rule_set_identifier, DEFAULT_IDENTIFIER);
        assert!(config.subscriptions.is_empty());
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_missing_config_is_an_error() {
        assert!(AdBlockerConfig::load("/nonexistent/ad-blocker.json").await.is_err());
    }
}

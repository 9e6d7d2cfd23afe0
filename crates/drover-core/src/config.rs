//! Runtime configuration.
//!
//! Loaded from TOML with every field optional; unknown keys are tolerated
//! so configs survive version skew in both directions.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result};
use serde::Deserialize;

const DEFAULT_MAX_STEPS_PER_RUN: usize = 40;
const DEFAULT_MAX_RETRIES_PER_STEP: usize = 3;
const DEFAULT_RESERVED_CONTEXT_TOKENS: u64 = 16_384;

/// Compaction tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    pub enabled: bool,
    /// Lowers the effective window the trigger projects against; never
    /// raises it.
    pub threshold_override_tokens: Option<u64>,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_override_tokens: None,
        }
    }
}

/// Runtime limits and knobs for the run loop.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bound on steps per run; exceeding it is a reported status, not a
    /// crash.
    pub max_steps_per_run: usize,
    /// Total provider-call attempts per step (and per compaction
    /// summarization), including the first.
    pub max_retries_per_step: usize,
    /// Margin kept free below the provider's context window before
    /// compaction kicks in.
    pub reserved_context_tokens: u64,
    /// Optional per-tool-call timeout in seconds.
    pub tool_timeout_secs: Option<u64>,
    /// Where context logs go, for embedders that persist runs.
    pub log_dir: Option<PathBuf>,
    pub compaction: CompactionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_steps_per_run: DEFAULT_MAX_STEPS_PER_RUN,
            max_retries_per_step: DEFAULT_MAX_RETRIES_PER_STEP,
            reserved_context_tokens: DEFAULT_RESERVED_CONTEXT_TOKENS,
            tool_timeout_secs: None,
            log_dir: None,
            compaction: CompactionConfig::default(),
        }
    }
}

impl Config {
    /// Parses a TOML document.
    ///
    /// # Errors
    /// Returns an error if the document is not valid TOML.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config")
    }

    /// Loads a config file; a missing file yields the defaults.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn tool_timeout(&self) -> Option<Duration> {
        self.tool_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.max_steps_per_run, 40);
        assert_eq!(config.max_retries_per_step, 3);
        assert_eq!(config.reserved_context_tokens, 16_384);
        assert!(config.tool_timeout().is_none());
        assert!(config.compaction.enabled);
    }

    #[test]
    fn test_partial_toml_overrides_only_named_fields() {
        let config = Config::from_toml_str(
            r#"
            max_steps_per_run = 2
            tool_timeout_secs = 30

            [compaction]
            enabled = false
            "#,
        )
        .unwrap();

        assert_eq!(config.max_steps_per_run, 2);
        assert_eq!(config.tool_timeout(), Some(Duration::from_secs(30)));
        assert!(!config.compaction.enabled);
        // Unnamed fields keep their defaults.
        assert_eq!(config.max_retries_per_step, 3);
    }

    #[test]
    fn test_unknown_keys_are_tolerated() {
        let config = Config::from_toml_str(
            r#"
            future_knob = "whatever"
            max_steps_per_run = 7
            "#,
        )
        .unwrap();
        assert_eq!(config.max_steps_per_run, 7);
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let config = Config::load(Path::new("/nonexistent/drover.toml")).unwrap();
        assert_eq!(config.max_steps_per_run, 40);
    }
}

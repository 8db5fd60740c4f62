use std::{collections::HashMap, fs, path::{Path, PathBuf}, time::Duration};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::timer::AuthMode;

/// Replay settings, loaded from a TOML file and overridden from the command line.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ReplayConfig {
    /// Target URL prefix, e.g. "http://staging:8080". Required.
    #[serde(default)]
    pub root: Option<String>,

    /// Playback speed multiplier.
    #[serde(default = "default_speed")]
    pub speed: f64,

    /// JSON-lines result log; empty disables it.
    #[serde(default)]
    pub output: Option<PathBuf>,

    /// JSON-lines response body log; empty disables it.
    #[serde(default)]
    pub body_output: Option<PathBuf>,

    /// How the credential column is turned into an Authorization header.
    #[serde(default)]
    pub auth: AuthMode,

    /// Maximum requests in flight, 0 for unbounded.
    #[serde(default)]
    pub concurrency: usize,

    /// Per-request deadline in milliseconds, 0 disables it.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Stop dispatching after this many failures in a row, 0 never stops.
    #[serde(default)]
    pub max_consecutive_failures: u32,

    /// Suppress the per-request console lines.
    #[serde(default)]
    pub quiet: bool,

    /// Parsed events buffered ahead of the scheduler.
    #[serde(default = "default_read_ahead")]
    pub read_ahead: usize,

    #[serde(flatten)]
    pub other_fields: HashMap<String, toml::Value>,
}

fn default_speed() -> f64 {
    1.0
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_read_ahead() -> usize {
    1024
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            root: None,
            speed: default_speed(),
            output: None,
            body_output: None,
            auth: AuthMode::default(),
            concurrency: 0,
            request_timeout_ms: default_request_timeout_ms(),
            max_consecutive_failures: 0,
            quiet: false,
            read_ahead: default_read_ahead(),
            other_fields: HashMap::new(),
        }
    }
}

impl ReplayConfig {
    pub fn load(path: &Path) -> Result<Self, ReplayConfigLoadError> {
        let raw = fs::read_to_string(path).map_err(ReplayConfigLoadError::Io)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ReplayConfigLoadError> {
        let config: Self = toml::from_str(raw).map_err(ReplayConfigLoadError::Parse)?;

        for (key, value) in &config.other_fields {
            warn!("Unknown configuration '{key}' with value {value:?}");
        }

        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.root().is_none() {
            anyhow::bail!("root parameter is required");
        }
        if !self.speed.is_finite() || self.speed <= 0.0 {
            anyhow::bail!("speed must be a positive number, got {}", self.speed);
        }
        Ok(())
    }

    pub fn root(&self) -> Option<&str> {
        self.root.as_deref().filter(|r| !r.is_empty())
    }

    pub fn output_path(&self) -> Option<&Path> {
        non_empty(self.output.as_deref())
    }

    pub fn body_output_path(&self) -> Option<&Path> {
        non_empty(self.body_output.as_deref())
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    pub fn concurrency_limit(&self) -> Option<usize> {
        (self.concurrency > 0).then_some(self.concurrency)
    }

    pub fn failure_limit(&self) -> Option<u32> {
        (self.max_consecutive_failures > 0).then_some(self.max_consecutive_failures)
    }
}

fn non_empty(path: Option<&Path>) -> Option<&Path> {
    path.filter(|p| !p.as_os_str().is_empty())
}

#[derive(Debug, thiserror::Error)]
pub enum ReplayConfigLoadError {
    #[error("Could not open config")]
    Io(#[from] std::io::Error),
    #[error("Could not parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

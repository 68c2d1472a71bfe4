//! Engine settings: polling cadence, timeouts, retry budgets and the agent
//! service endpoint.
//!
//! Values come from built-in defaults, optionally overlaid by a TOML file,
//! then by `ARENA_*` environment variables.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ArenaError, ArenaResult};

pub const DEFAULT_API_BASE_URL: &str = "https://api.cursor.com/v0";

/// Tunables for the coordinator and the phase engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Agent service base URL.
    pub api_base_url: String,
    /// Seconds between status/conversation polls.
    pub poll_interval_secs: u64,
    pub launch_timeout_secs: u64,
    pub follow_up_timeout_secs: u64,
    /// How long an agent may sit FINISHED without replying to a follow-up.
    pub grace_secs: u64,
    /// Per-HTTP-request timeout.
    pub request_timeout_secs: u64,
    /// Total attempts for one HTTP request, including the first.
    pub max_attempts: u32,
    /// Backoff base; attempt `n` waits `base * 2^n` plus jitter.
    pub backoff_base_secs: f64,
    /// Re-prompts for an artifact the agent failed to commit.
    pub artifact_retries: u32,
    /// Timeout for one artifact fetch from the repository host.
    pub fetch_timeout_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            poll_interval_secs: 10,
            launch_timeout_secs: 600,
            follow_up_timeout_secs: 600,
            grace_secs: 30,
            request_timeout_secs: 60,
            max_attempts: 5,
            backoff_base_secs: 2.0,
            artifact_retries: 3,
            fetch_timeout_secs: 30,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> ArenaResult<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ArenaError::config(format!("{name}={raw} is not a valid value"))),
        Err(_) => Ok(None),
    }
}

impl EngineSettings {
    /// Defaults overlaid with environment variables.
    pub fn from_env() -> ArenaResult<Self> {
        let mut settings = Self::default();
        settings.apply_env()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Settings from a TOML file, then environment overrides.
    pub fn load(path: &Path) -> ArenaResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut settings: Self = toml::from_str(&raw)
            .map_err(|e| ArenaError::config(format!("{}: {e}", path.display())))?;
        settings.apply_env()?;
        settings.validate()?;
        Ok(settings)
    }

    fn apply_env(&mut self) -> ArenaResult<()> {
        if let Ok(url) = std::env::var("ARENA_API_URL") {
            self.api_base_url = url;
        }
        if let Some(v) = env_parse("ARENA_POLL_INTERVAL_SECS")? {
            self.poll_interval_secs = v;
        }
        if let Some(v) = env_parse("ARENA_LAUNCH_TIMEOUT_SECS")? {
            self.launch_timeout_secs = v;
        }
        if let Some(v) = env_parse("ARENA_FOLLOW_UP_TIMEOUT_SECS")? {
            self.follow_up_timeout_secs = v;
        }
        if let Some(v) = env_parse("ARENA_GRACE_SECS")? {
            self.grace_secs = v;
        }
        if let Some(v) = env_parse("ARENA_REQUEST_TIMEOUT_SECS")? {
            self.request_timeout_secs = v;
        }
        if let Some(v) = env_parse("ARENA_MAX_ATTEMPTS")? {
            self.max_attempts = v;
        }
        if let Some(v) = env_parse("ARENA_ARTIFACT_RETRIES")? {
            self.artifact_retries = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> ArenaResult<()> {
        if self.max_attempts == 0 {
            return Err(ArenaError::config("max_attempts must be at least 1"));
        }
        if self.poll_interval_secs == 0 {
            return Err(ArenaError::config("poll_interval_secs must be at least 1"));
        }
        if !(self.backoff_base_secs.is_finite() && self.backoff_base_secs >= 0.0) {
            return Err(ArenaError::config("backoff_base_secs must be non-negative"));
        }
        if self.api_base_url.trim().is_empty() {
            return Err(ArenaError::config("api_base_url is empty"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.launch_timeout_secs)
    }

    pub fn follow_up_timeout(&self) -> Duration {
        Duration::from_secs(self.follow_up_timeout_secs)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

//! Supervisor configuration.
//!
//! Resolution order, later wins: built-in defaults, `~/.docbot/config.yaml`,
//! the `GITHUB_TOKEN` environment variable, command-line flags.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use docbot_workload::WorkloadOptions;

use crate::error::{io_err, DaemonError};
use crate::paths::config_path;
use crate::queue::Backoff;

pub const TOKEN_ENV: &str = "GITHUB_TOKEN";
pub const DEFAULT_API_URL: &str = "https://api.github.com";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Run the periodic batch refresh.
    pub enable_pr_sync: bool,
    pub sync_interval_secs: u64,
    /// Workers per controller.
    pub workers: usize,
    pub github_api_url: String,
    #[serde(skip_serializing)]
    pub github_token: Option<String>,
    /// First requeue delay after a failed reconcile; doubled per attempt.
    pub requeue_backoff_ms: u64,
    pub requeue_max_ms: u64,
    #[serde(flatten)]
    pub workload: WorkloadOptions,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            enable_pr_sync: false,
            sync_interval_secs: 30,
            workers: 2,
            github_api_url: DEFAULT_API_URL.to_owned(),
            github_token: None,
            requeue_backoff_ms: 500,
            requeue_max_ms: 60_000,
            workload: WorkloadOptions::default(),
        }
    }
}

impl ControllerConfig {
    /// Defaults overlaid with `<home>/.docbot/config.yaml` when it exists.
    pub fn load_at(home: &Path) -> Result<Self, DaemonError> {
        let path = config_path(home);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(io_err(&path, err)),
        };
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&contents).map_err(|source| DaemonError::Config { path, source })
    }

    /// Take the host token from `GITHUB_TOKEN` when set.
    pub fn with_env(self) -> Self {
        self.with_token(std::env::var(TOKEN_ENV).ok())
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        if let Some(token) = token.filter(|t| !t.trim().is_empty()) {
            self.github_token = Some(token);
        }
        self
    }

    pub fn validate(&self) -> Result<(), DaemonError> {
        if self.workers == 0 {
            return Err(DaemonError::InvalidConfig("workers must be at least 1".into()));
        }
        if self.sync_interval_secs == 0 {
            return Err(DaemonError::InvalidConfig(
                "sync_interval_secs must be at least 1".into(),
            ));
        }
        if self.requeue_backoff_ms == 0 || self.requeue_max_ms < self.requeue_backoff_ms {
            return Err(DaemonError::InvalidConfig(
                "requeue_max_ms must be at least requeue_backoff_ms, which must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.requeue_backoff_ms),
            Duration::from_millis(self.requeue_max_ms),
        )
    }
}

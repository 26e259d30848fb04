//! Process configuration.
//!
//! [`IndexerConfig`] is built once by the binary (environment + CLI flags) and
//! then passed down immutably; library code never reads the environment.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::utils::rate_limit::RateLimitPolicy;
use crate::{Error, Result};

pub const DEFAULT_DATABASE_URL: &str = "sqlite:oso-indexer.db?mode=rwc";
pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";
pub const DEFAULT_BATCH_SIZE: usize = 5000;

/// Event recorder tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Buffered records that trigger a flush.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Interval of the periodic flusher, in milliseconds.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

fn default_max_batch_size() -> usize {
    5000
}

fn default_flush_interval_ms() -> u64 {
    10_000
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

impl RecorderConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Target of remote worker dispatch: a GitHub Actions workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerDispatchConfig {
    pub owner: String,
    pub repo: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub workflow_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexerConfig {
    pub database_url: String,
    pub cache_dir: PathBuf,
    pub run_dir: PathBuf,
    /// Chunk size for bulk pointer reads.
    pub batch_size: usize,
    #[serde(default, skip_serializing)]
    pub github_token: Option<String>,
    pub github_api_url: String,
    #[serde(default)]
    pub recorder: RecorderConfig,
    #[serde(default)]
    pub rate_limit: RateLimitPolicy,
    #[serde(default)]
    pub dispatch: Option<WorkerDispatchConfig>,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            cache_dir: PathBuf::from("cache"),
            run_dir: PathBuf::from("run"),
            batch_size: DEFAULT_BATCH_SIZE,
            github_token: None,
            github_api_url: DEFAULT_GITHUB_API_URL.to_string(),
            recorder: RecorderConfig::default(),
            rate_limit: RateLimitPolicy::default(),
            dispatch: None,
        }
    }
}

impl IndexerConfig {
    /// Build the configuration from the process environment.
    ///
    /// `.env` is loaded first if present. Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(dir) = lookup("INDEXER_CACHE_DIR") {
            config.cache_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("INDEXER_RUN_DIR") {
            config.run_dir = PathBuf::from(dir);
        }
        if let Some(size) = lookup("INDEXER_BATCH_SIZE") {
            config.batch_size = size
                .parse()
                .map_err(|_| Error::config(format!("INDEXER_BATCH_SIZE is not a number: {size}")))?;
        }
        if let Some(url) = lookup("GITHUB_API_URL") {
            config.github_api_url = url;
        }
        config.github_token = lookup("GITHUB_TOKEN");

        let dispatch = [
            "GITHUB_WORKERS_OWNER",
            "GITHUB_WORKERS_REPO",
            "GITHUB_WORKERS_REF",
            "GITHUB_WORKERS_WORKFLOW_ID",
        ]
        .map(&lookup);

        config.dispatch = match dispatch {
            [None, None, None, None] => None,
            [Some(owner), Some(repo), Some(git_ref), Some(workflow_id)] => {
                Some(WorkerDispatchConfig {
                    owner,
                    repo,
                    git_ref,
                    workflow_id,
                })
            }
            _ => {
                return Err(Error::config(
                    "GITHUB_WORKERS_OWNER, GITHUB_WORKERS_REPO, GITHUB_WORKERS_REF and \
                     GITHUB_WORKERS_WORKFLOW_ID must be set together",
                ));
            }
        };

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::config("batch_size must be greater than zero"));
        }
        if self.recorder.max_batch_size == 0 {
            return Err(Error::config(
                "recorder.max_batch_size must be greater than zero",
            ));
        }
        if self.recorder.flush_interval_ms == 0 {
            return Err(Error::config(
                "recorder.flush_interval_ms must be greater than zero",
            ));
        }
        if let Some(dispatch) = &self.dispatch
            && [
                &dispatch.owner,
                &dispatch.repo,
                &dispatch.git_ref,
                &dispatch.workflow_id,
            ]
            .iter()
            .any(|v| v.trim().is_empty())
        {
            return Err(Error::config("worker dispatch target is incomplete"));
        }
        Ok(())
    }

    pub fn log_dir(&self) -> PathBuf {
        self.run_dir.join("logs")
    }
}

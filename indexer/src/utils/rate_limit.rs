//! Rate-limit classification for GitHub-style APIs.
//!
//! A limited response is either *primary* (quota exhausted, wait for the
//! reset) or *secondary* (abuse detection, short back-off). Each kind has its
//! own retry budget.

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry budget for rate-limited requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Retries allowed after primary (quota) limits.
    #[serde(default = "default_primary_max_retries")]
    pub primary_max_retries: u32,
    /// Retries allowed after secondary (abuse) limits.
    #[serde(default = "default_secondary_max_retries")]
    pub secondary_max_retries: u32,
    /// Wait used when a secondary limit carries no `retry-after`.
    #[serde(default = "default_secondary_wait_ms")]
    pub default_secondary_wait_ms: u64,
    /// Upper bound for any single wait.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
}

fn default_primary_max_retries() -> u32 {
    50
}

fn default_secondary_max_retries() -> u32 {
    3
}

fn default_secondary_wait_ms() -> u64 {
    60_000
}

fn default_max_wait_ms() -> u64 {
    60 * 60 * 1000
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            primary_max_retries: default_primary_max_retries(),
            secondary_max_retries: default_secondary_max_retries(),
            default_secondary_wait_ms: default_secondary_wait_ms(),
            max_wait_ms: default_max_wait_ms(),
        }
    }
}

impl RateLimitPolicy {
    pub fn max_retries(&self, kind: RateLimitKind) -> u32 {
        match kind {
            RateLimitKind::Primary => self.primary_max_retries,
            RateLimitKind::Secondary => self.secondary_max_retries,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum RateLimitKind {
    Primary,
    Secondary,
}

/// A classified rate-limit response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub kind: RateLimitKind,
    pub wait: Duration,
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Classify a response. Returns `None` when it is not a rate limit.
pub fn classify(
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
    now: DateTime<Utc>,
    policy: &RateLimitPolicy,
) -> Option<RateLimit> {
    if status != StatusCode::FORBIDDEN && status != StatusCode::TOO_MANY_REQUESTS {
        return None;
    }

    let max_wait = Duration::from_millis(policy.max_wait_ms);
    let retry_after = header_u64(headers, "retry-after").map(Duration::from_secs);

    if header_u64(headers, "x-ratelimit-remaining") == Some(0) {
        let wait = retry_after.unwrap_or_else(|| {
            header_u64(headers, "x-ratelimit-reset")
                .and_then(|reset| i64::try_from(reset).ok())
                .map(|reset| (reset - now.timestamp()).max(1) as u64)
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(60))
        });
        return Some(RateLimit {
            kind: RateLimitKind::Primary,
            wait: wait.min(max_wait),
        });
    }

    if retry_after.is_some() || body.to_ascii_lowercase().contains("secondary rate limit") {
        let wait =
            retry_after.unwrap_or(Duration::from_millis(policy.default_secondary_wait_ms));
        return Some(RateLimit {
            kind: RateLimitKind::Secondary,
            wait: wait.min(max_wait),
        });
    }

    None
}

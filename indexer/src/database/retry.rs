//! Busy-retry for the write transactions that workers contend on.
//!
//! Several workers share one SQLite file. Claiming a job and extending an
//! event pointer both open an immediate transaction, so concurrent workers
//! see `SQLITE_BUSY` until the current writer commits.

use rand::random;
use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Backoff schedule for busy retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusyRetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl BusyRetryPolicy {
    /// Roughly ten seconds of waiting before giving up.
    pub const WORKER: Self = Self {
        max_retries: 12,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_secs(2),
    };

    /// Exponential delay for `attempt` plus up to 25% jitter, capped at `max_delay`.
    fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(20));
        let capped = exp.min(self.max_delay);
        let jitter_ms = random::<u64>() % (capped.as_millis() as u64 / 4 + 1);
        (capped + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }
}

impl Default for BusyRetryPolicy {
    fn default() -> Self {
        Self::WORKER
    }
}

pub(crate) fn is_sqlite_busy_error(err: &Error) -> bool {
    let Error::DatabaseSqlx(sqlx_err) = err else {
        return false;
    };

    let message = match sqlx_err {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY (5) / SQLITE_LOCKED (6)
            if matches!(db_err.code().map(Cow::into_owned).as_deref(), Some("5" | "6")) {
                return true;
            }
            db_err.message().to_ascii_lowercase()
        }
        other => other.to_string().to_ascii_lowercase(),
    };
    message.contains("database is locked") || message.contains("database is busy")
}

/// Run `op` under [`BusyRetryPolicy::WORKER`].
pub async fn retry_on_sqlite_busy<T, F, Fut>(operation: &'static str, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_with_policy(BusyRetryPolicy::WORKER, operation, op).await
}

/// Run `op`, retrying while SQLite reports the database as busy or locked.
/// Any other error is returned immediately.
pub async fn retry_with_policy<T, F, Fut>(
    policy: BusyRetryPolicy,
    operation: &'static str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    let mut waited = Duration::ZERO;
    loop {
        let err = match op().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(
                        operation,
                        attempt,
                        waited_ms = waited.as_millis() as u64,
                        "Database write went through after contention"
                    );
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !is_sqlite_busy_error(&err) {
            return Err(err);
        }
        if attempt >= policy.max_retries {
            warn!(
                operation,
                attempts = attempt + 1,
                waited_ms = waited.as_millis() as u64,
                "Database still busy, giving up"
            );
            return Err(err);
        }

        let delay = policy.delay(attempt);
        debug!(
            operation,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "Database busy, retrying"
        );
        sleep(delay).await;
        waited += delay;
        attempt += 1;
    }
}

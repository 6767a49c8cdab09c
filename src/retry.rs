//! Bounded exponential backoff for collaborator I/O (snapshot API, relay
//! publish, file writes).

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

use crate::pipeline::ShutdownSignal;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BASE_DELAY_MS: u64 = 500;
const DEFAULT_MAX_DELAY_MS: u64 = 10_000;

/// Marks an error that another attempt cannot fix.
#[derive(Debug)]
pub struct Permanent;

impl fmt::Display for Permanent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("permanent failure")
    }
}

/// Tags `err` so [`RetryPolicy::run`] gives up on it at once.
pub fn permanent(err: anyhow::Error) -> anyhow::Error {
    err.context(Permanent)
}

/// True when `err`, or anything it wraps, was tagged with [`permanent`].
pub fn is_permanent(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Permanent>().is_some()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct RetryConfigFile {
    pub max_retries: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub(crate) fn from_file(file: RetryConfigFile) -> Self {
        let defaults = Self::default();
        Self {
            max_retries: file.max_retries.unwrap_or(defaults.max_retries),
            base_delay: file
                .base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            max_delay: file
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
        }
    }

    /// Wait before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Total time spent waiting if every attempt fails. Client timeouts are
    /// sized from this.
    pub fn total_budget(&self) -> Duration {
        (1..=self.max_retries).map(|n| self.delay_for(n)).sum()
    }

    /// Runs `op` until it succeeds or the retries are exhausted. Errors
    /// tagged [`permanent`] are returned without retrying. Waits are cut
    /// short by shutdown, which ends the retry loop with the last error.
    pub fn run<T>(
        &self,
        what: &str,
        shutdown: &ShutdownSignal,
        mut op: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if is_permanent(&err) => {
                    return Err(err.context(format!(
                        "{} failed permanently on attempt {}",
                        what,
                        attempt + 1
                    )));
                }
                Err(err) if attempt >= self.max_retries => {
                    return Err(err.context(format!(
                        "{} failed after {} attempt(s)",
                        what,
                        attempt + 1
                    )));
                }
                Err(err) => {
                    attempt += 1;
                    let delay = self.delay_for(attempt);
                    log::warn!(
                        "{} failed: {:#}; retry {} of {} in {:?}",
                        what,
                        err,
                        attempt,
                        self.max_retries,
                        delay
                    );
                    if !shutdown.sleep(delay) {
                        return Err(anyhow!("{} abandoned on shutdown: {:#}", what, err));
                    }
                }
            }
        }
    }
}

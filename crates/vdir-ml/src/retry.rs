//! Bounded deadlock-retry combinator for backend transactions.
//!
//! An attempt runs "begin txn, do work, commit". A backend deadlock restarts
//! the attempt after a short backoff; any other error is terminal. Running
//! out of attempts turns the deadlock into [`DirError::LockDeadlock`].

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{DirError, Result};

/// Configuration for deadlock retries.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt (default: 5).
    pub max_retries: u32,
    /// Initial backoff duration (default: 1ms).
    pub initial_backoff: Duration,
    /// Maximum backoff duration (default: 50ms).
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff (default: 2.0).
    pub backoff_multiplier: f64,
    /// Whether to add random jitter to backoff (default: true).
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(50),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Outcome of one attempt as seen by the retry loop.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum AttemptClass {
    /// The attempt succeeded.
    Success,
    /// Transient conflict, worth another attempt.
    Retryable,
    /// Give up immediately.
    Fatal,
}

/// Classifies a result for the retry loop.
pub fn classify<T>(result: &Result<T>) -> AttemptClass {
    match result {
        Ok(_) => AttemptClass::Success,
        Err(e) if e.is_deadlock() => AttemptClass::Retryable,
        Err(_) => AttemptClass::Fatal,
    }
}

/// Runs attempts with exponential backoff on backend deadlocks.
#[derive(Debug, Clone, Default)]
pub struct DeadlockRetry {
    config: RetryConfig,
}

impl DeadlockRetry {
    /// Creates a retry runner with the given configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Runs `attempt` until it succeeds, fails fatally or retries run out.
    /// The closure receives the 1-based attempt number.
    pub fn run<T, F>(&self, op: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut(u32) -> Result<T>,
    {
        let mut n = 0u32;
        loop {
            n += 1;
            let result = attempt(n);
            match classify(&result) {
                AttemptClass::Success | AttemptClass::Fatal => return result,
                AttemptClass::Retryable => {
                    if n > self.config.max_retries {
                        warn!(op, attempts = n, "deadlock retries exhausted");
                        return Err(DirError::LockDeadlock { attempts: n });
                    }
                    let backoff = self.compute_backoff(n - 1);
                    debug!(op, attempt = n, backoff_us = backoff.as_micros() as u64, "retrying after deadlock");
                    std::thread::sleep(backoff);
                }
            }
        }
    }

    fn compute_backoff(&self, attempt: u32) -> Duration {
        let base_delay_us = self.config.initial_backoff.as_micros() as f64;
        let max_delay_us = self.config.max_backoff.as_micros() as f64;
        let computed = base_delay_us * self.config.backoff_multiplier.powi(attempt as i32);
        let capped = computed.min(max_delay_us) as u64;

        if self.config.jitter && capped > 1 {
            let jitter_us = rand::thread_rng().gen_range(0..capped / 2 + 1);
            Duration::from_micros(capped.saturating_add(jitter_us))
        } else {
            Duration::from_micros(capped)
        }
    }
}

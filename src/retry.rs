//! Attempt bookkeeping shared by the control-byte writer and the arbiter.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ErrorKind;

/// Delay applied after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay after every failure.
    Fixed(Duration),
    /// `step × attempt`, with `attempt` counted from 1.
    Linear(Duration),
}

impl Backoff {
    pub fn delay(self, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed(delay) => delay,
            Backoff::Linear(step) => step * attempt,
        }
    }
}

/// How often a single operation may be retried and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub retries: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub const fn new(retries: u32, backoff: Backoff) -> Self {
        Self { retries, backoff }
    }

    pub fn max_attempts(&self) -> u32 {
        self.retries + 1
    }
}

/// Per-call attempt counter, passed through each iteration of a retry loop.
#[derive(Debug, Clone)]
pub struct RetryState {
    attempt: u32,
    max_attempts: u32,
    last_failure: Option<ErrorKind>,
}

impl RetryState {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts: max_attempts.max(1),
            last_failure: None,
        }
    }

    /// Start the next attempt and return its 1-based number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn has_remaining(&self) -> bool {
        self.attempt < self.max_attempts
    }

    pub fn record_failure(&mut self, kind: ErrorKind) {
        self.last_failure = Some(kind);
    }

    pub fn last_failure(&self) -> Option<ErrorKind> {
        self.last_failure
    }

    /// Delay to wait after the current (failed) attempt.
    pub fn next_delay(&self, backoff: Backoff) -> Duration {
        backoff.delay(self.attempt)
    }
}

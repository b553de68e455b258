// Copyright 2024 encode-offload Authors
// SPDX-License-Identifier: Apache-2.0

//! Polling retry policy
//!
//! Used wherever a caller waits for a slot or a frame to become ready.
//! Only "not ready" outcomes are retried; every other error is returned as
//! soon as it is seen.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::trace;
use serde::{Deserialize, Serialize};

use crate::{MediaError, Result};

/// Default sleep between two attempts (microseconds)
pub const DEFAULT_BACKOFF_US: u64 = 1000;

/// How long and how often to poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Give up after this many attempts (None = no limit)
    pub max_attempts: Option<u32>,
    /// Give up once this many milliseconds have passed (None = no limit)
    pub deadline_ms: Option<u64>,
    /// Sleep between attempts (microseconds)
    pub backoff_us: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl RetryPolicy {
    /// Retry forever with the default back-off
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            deadline_ms: None,
            backoff_us: DEFAULT_BACKOFF_US,
        }
    }

    /// Limit the number of attempts
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }

    /// Limit the total wait
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_ms = Some(deadline.as_millis() as u64);
        self
    }

    /// Change the sleep between attempts
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff_us = backoff.as_micros() as u64;
        self
    }

    /// Sleep between attempts
    pub fn backoff(&self) -> Duration {
        Duration::from_micros(self.backoff_us)
    }

    /// Run `op` until it stops reporting "not ready"
    ///
    /// `terminate` is checked before every attempt; once raised the wait ends
    /// with [`MediaError::Cancelled`]. Running out of attempts or time ends it
    /// with [`MediaError::TimedOut`].
    pub fn run<T, F>(&self, terminate: Option<&AtomicBool>, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let start = Instant::now();
        let deadline = self.deadline_ms.map(Duration::from_millis);
        let mut attempts: u32 = 0;

        loop {
            if terminate.is_some_and(|flag| flag.load(Ordering::Acquire)) {
                return Err(MediaError::Cancelled);
            }

            attempts = attempts.saturating_add(1);
            match op() {
                Err(e) if e.is_not_ready() => trace!("Attempt {attempts} not ready"),
                other => return other,
            }

            if self.max_attempts.is_some_and(|max| attempts >= max) {
                return Err(MediaError::TimedOut);
            }
            if deadline.is_some_and(|limit| start.elapsed() >= limit) {
                return Err(MediaError::TimedOut);
            }
            thread::sleep(self.backoff());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_returns_first_ready_value() {
        let mut calls = 0;
        let value = RetryPolicy::unbounded()
            .with_backoff(Duration::ZERO)
            .run(None, || {
                calls += 1;
                if calls < 3 {
                    Err(MediaError::NotEnoughData)
                } else {
                    Ok(calls)
                }
            })
            .unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn test_max_attempts() {
        let mut calls = 0;
        let result: Result<()> = RetryPolicy::unbounded()
            .with_max_attempts(4)
            .with_backoff(Duration::ZERO)
            .run(None, || {
                calls += 1;
                Err(MediaError::ResourceExhausted)
            });
        assert!(matches!(result, Err(MediaError::TimedOut)));
        assert_eq!(calls, 4);
    }

    #[test]
    fn test_deadline() {
        let start = Instant::now();
        let result: Result<()> = RetryPolicy::unbounded()
            .with_deadline(Duration::from_millis(20))
            .with_backoff(Duration::from_millis(2))
            .run(None, || Err(MediaError::NotEnoughData));
        assert!(matches!(result, Err(MediaError::TimedOut)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_hard_errors_not_retried() {
        let mut calls = 0;
        let result: Result<()> = RetryPolicy::unbounded().run(None, || {
            calls += 1;
            Err(MediaError::InvalidState("refused".into()))
        });
        assert!(matches!(result, Err(MediaError::InvalidState(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_terminate_flag_cancels() {
        let terminate = Arc::new(AtomicBool::new(false));
        let flag = terminate.clone();
        let setter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            flag.store(true, Ordering::Release);
        });

        let result: Result<()> = RetryPolicy::unbounded()
            .run(Some(&terminate), || Err(MediaError::NotEnoughData));
        setter.join().unwrap();
        assert!(matches!(result, Err(MediaError::Cancelled)));
    }
}

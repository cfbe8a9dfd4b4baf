//! Bounded reconnection with a per-attempt virtual port

use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of consecutive reconnection attempts
    pub max_attempts: u32,
    /// Delay before the first attempt (zero reconnects immediately)
    pub initial_backoff: Duration,
    /// Maximum delay between attempts
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

/// Reconnection errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RetryError {
    #[error("Retry budget exhausted after {0} attempts")]
    Exhausted(u32),
}

/// One granted reconnection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAttempt {
    /// 1-based attempt number since the last successful connection
    pub attempt: u32,
    /// Virtual port to connect with
    pub virtual_port: u32,
    /// Delay to wait before connecting
    pub backoff: Duration,
}

/// Tracks the retry budget and the virtual port of the guest connection
///
/// The virtual port is bumped on every attempt and never rewinds, so a new
/// attempt can never be confused with a stale one on the remote side.
#[derive(Debug)]
pub struct RetryBudget {
    config: RetryConfig,
    attempt: u32,
    virtual_port: u32,
    current_backoff: Duration,
}

impl RetryBudget {
    pub fn new(config: RetryConfig, virtual_port: u32) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempt: 0,
            virtual_port,
        }
    }

    /// Consume one attempt from the budget
    pub fn next_attempt(&mut self) -> Result<RetryAttempt, RetryError> {
        if self.attempt >= self.config.max_attempts {
            return Err(RetryError::Exhausted(self.attempt));
        }

        self.attempt += 1;
        self.virtual_port = self.virtual_port.wrapping_add(1);
        let backoff = self.current_backoff;

        let next_backoff =
            Duration::from_secs_f64(self.current_backoff.as_secs_f64() * self.config.multiplier);
        self.current_backoff = next_backoff.min(self.config.max_backoff);

        debug!(
            "Reconnection attempt {}/{} on virtual port {}",
            self.attempt, self.config.max_attempts, self.virtual_port
        );

        Ok(RetryAttempt {
            attempt: self.attempt,
            virtual_port: self.virtual_port,
            backoff,
        })
    }

    /// Reset the attempt counter (call after a successful connection).
    /// The virtual port keeps its value.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current_backoff = self.config.initial_backoff;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn virtual_port(&self) -> u32 {
        self.virtual_port
    }

    pub fn remaining(&self) -> u32 {
        self.config.max_attempts.saturating_sub(self.attempt)
    }
}

//! Exponential reconnect backoff.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reconnect policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if !self.enabled {
            return Ok(());
        }
        if self.initial_delay_ms == 0 {
            return Err(CoreError::invalid("reconnect.initial_delay_ms", "must be > 0"));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(CoreError::invalid(
                "reconnect.max_delay_ms",
                "must be >= initial_delay_ms",
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(CoreError::invalid("reconnect.multiplier", "must be >= 1.0"));
        }
        Ok(())
    }

    /// Delay before the attempt that follows `attempt` failures.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let raw = self.initial_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(capped.round() as u64)
    }
}

/// Attempt counter for one client connection.
#[derive(Debug, Clone)]
pub struct ReconnectState {
    config: ReconnectConfig,
    attempt: u32,
}

impl ReconnectState {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Attempts made since the last successful connection.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Returns whether no further attempts are allowed.
    pub fn is_exhausted(&self) -> bool {
        if !self.config.enabled {
            return true;
        }
        matches!(self.config.max_attempts, Some(max) if self.attempt >= max)
    }

    /// Schedules the next attempt.
    ///
    /// Returns the 1-based attempt number and its delay, or `None` when the
    /// policy is exhausted.
    pub fn next_attempt(&mut self) -> Option<(u32, Duration)> {
        if self.is_exhausted() {
            tracing::debug!("Reconnect policy exhausted after {} attempts", self.attempt);
            return None;
        }
        let delay = self.config.delay_for(self.attempt);
        self.attempt += 1;
        tracing::trace!("Reconnect attempt {} in {:?}", self.attempt, delay);
        Some((self.attempt, delay))
    }

    /// Called once a connection reaches the ready state.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

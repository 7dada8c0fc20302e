//! Connection state and retry policy.
//!
//! ```text
//! Disconnected ──connect──> Connecting ──ok──> Connected
//!      ▲                        │                  │
//!      │                     failure        unexpected close
//!      │                        ▼                  │
//!      └──── close() ─── retry scheduled <─────────┘
//! ```
//!
//! An intentional close never schedules a retry. A successful connect
//! resets the attempt counter.

use std::time::Duration;

/// Where the client is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Short label for display.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

/// Auto-reconnect behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Growth factor between attempts.
    pub multiplier: f64,
    /// Give up after this many consecutive failures (0 = never).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 0,
        }
    }
}

impl ReconnectConfig {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Consecutive-failure counter driving the retry schedule.
#[derive(Debug)]
pub(crate) struct Backoff {
    config: ReconnectConfig,
    attempt: u32,
}

impl Backoff {
    pub(crate) fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Schedule the next retry, or `None` once attempts are exhausted.
    pub(crate) fn next_delay(&mut self) -> Option<Duration> {
        if self.config.max_attempts != 0 && self.attempt >= self.config.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some(self.config.delay_for(self.attempt))
    }

    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }

    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }
}

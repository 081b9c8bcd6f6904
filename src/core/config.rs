//! Raft timing parameters.

use std::time::Duration;

/// Configuration for the ticker and the server loop.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Minimum election timeout in ticks (default: 5)
    pub tick_min: u64,
    /// Maximum election timeout in ticks (default: 10)
    pub tick_max: u64,
    /// Wall-clock interval between ticks in the server loop
    /// (default: 50ms)
    pub tick_interval: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            tick_min: 5,
            tick_max: 10,
            tick_interval: Duration::from_millis(50),
        }
    }
}

impl RaftConfig {
    /// Create a new config with a custom election timeout range.
    pub fn with_tick_range(mut self, min: u64, max: u64) -> Self {
        self.tick_min = min;
        self.tick_max = max;
        self
    }

    /// Create a new config with a custom tick interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Draw a random election timeout within the configured range.
    pub fn random_timeout(&self) -> u64 {
        use rand::Rng;
        rand::rng().random_range(self.tick_min..=self.tick_max)
    }

    /// The leader's heartbeat cadence: strictly below the minimum
    /// election timeout so heartbeats precede any follower timeout.
    pub fn leader_timeout(&self) -> u64 {
        1.max(self.tick_min.saturating_sub(1))
    }
}

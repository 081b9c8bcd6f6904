//! Randomized election/heartbeat timer.
//!
//! A counter decremented by `tick()`. Non-leaders reset to a uniform
//! draw from `[tick_min, tick_max]`; leaders reset below `tick_min` so
//! a heartbeat always lands before any follower can time out.

use super::config::RaftConfig;

#[derive(Debug)]
pub struct Ticker {
    leader_timeout: u64,
}

impl Ticker {
    pub fn new(config: &RaftConfig) -> Self {
        Ticker {
            leader_timeout: config.random_timeout(),
        }
    }

    /// Advance time by one tick; true when the timer expires.
    pub fn tick(&mut self) -> bool {
        self.leader_timeout = self.leader_timeout.saturating_sub(1);
        self.leader_timeout == 0
    }

    pub fn reset_follower(&mut self, config: &RaftConfig) {
        self.leader_timeout = config.random_timeout();
    }

    pub fn reset_leader(&mut self, config: &RaftConfig) {
        self.leader_timeout = config.leader_timeout();
    }

    /// Force the remaining ticks. Tests use this to trigger an election
    /// deterministically.
    pub fn set_timeout(&mut self, ticks: u64) {
        self.leader_timeout = ticks;
    }

    pub fn remaining(&self) -> u64 {
        self.leader_timeout
    }
}

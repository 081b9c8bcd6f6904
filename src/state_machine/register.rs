//! Register state machine used by tests and examples.

use std::sync::Arc;

use parking_lot::Mutex;

use super::traits::StateMachine;
use crate::error::{Error, Result};
use crate::log::{Command, LogEntry};

/// Holds the most recent user payload plus the full applied history.
#[derive(Debug, Default)]
pub struct Register {
    commit_index: u64,
    applied: Vec<String>,
    data: Option<String>,
}

impl Register {
    pub fn new() -> Self {
        Register::default()
    }

    /// Most recently applied user payload, if any.
    pub fn data(&self) -> Option<String> {
        self.data.clone()
    }

    /// Every user payload applied so far, in order.
    pub fn applied(&self) -> Vec<String> {
        self.applied.clone()
    }
}

impl StateMachine for Register {
    fn commit_index(&self) -> u64 {
        self.commit_index
    }

    fn execute(&mut self, entries: &[LogEntry]) -> Result<()> {
        for entry in entries {
            if entry.index != self.commit_index + 1 {
                return Err(Error::InvalidIndex(format!(
                    "execute at {} with commit index {}",
                    entry.index, self.commit_index
                )));
            }
            self.commit_index = entry.index;
            if let Command::User(payload) = &entry.command {
                self.applied.push(payload.clone());
                self.data = Some(payload.clone());
            }
        }
        Ok(())
    }
}

/// Shared register for inspecting applied state from tests.
pub type SharedRegister = Arc<Mutex<Register>>;

pub fn shared_register() -> SharedRegister {
    Arc::new(Mutex::new(Register::new()))
}

//! Message-bus abstraction.
//!
//! Delivery is unordered and may drop; retries come from the
//! ticker-driven replication loop, never from the bus.

use async_trait::async_trait;

use crate::core::{Message, NodeId, Reply};

/// Errors that can occur while sending over the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Connection to the target node failed
    ConnectionFailed,
    /// Request timed out
    Timeout,
    /// Target node not found
    NodeNotFound,
}

impl std::fmt::Display for BusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusError::ConnectionFailed => write!(f, "connection failed"),
            BusError::Timeout => write!(f, "request timed out"),
            BusError::NodeNotFound => write!(f, "node not found"),
        }
    }
}

impl std::error::Error for BusError {}

/// Request/response transport between nodes.
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    async fn send(&self, to: &NodeId, message: Message) -> Result<Reply, BusError>;
}

//! Outstanding-request tracking over a message bus.
//!
//! Each outbound message runs in its own task; the reply is forwarded
//! to the server's mailbox tagged with the message id. Cancelling
//! aborts the task; a reply that slips through anyway is discarded by
//! the node, which no longer has the id registered.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::traits::MessageBus;
use crate::core::{MessageId, Outbound, Reply};

pub struct BusAdapter {
    bus: Arc<dyn MessageBus>,
    responses: mpsc::Sender<(MessageId, Reply)>,
    tasks: HashMap<MessageId, AbortHandle>,
}

impl BusAdapter {
    pub fn new(bus: Arc<dyn MessageBus>, responses: mpsc::Sender<(MessageId, Reply)>) -> Self {
        BusAdapter {
            bus,
            responses,
            tasks: HashMap::new(),
        }
    }

    /// Send a batch of outbound messages, tracking each until its
    /// response arrives or it is cancelled. Send failures are dropped;
    /// the ticker-driven retries cover them.
    pub fn dispatch(&mut self, outbound: Vec<Outbound>) {
        self.tasks.retain(|_, task| !task.is_finished());
        for Outbound { id, to, message } in outbound {
            let bus = self.bus.clone();
            let responses = self.responses.clone();
            let task = tokio::spawn(async move {
                if let Ok(reply) = bus.send(&to, message).await {
                    let _ = responses.send((id, reply)).await;
                }
            });
            self.tasks.insert(id, task.abort_handle());
        }
    }

    pub fn cancel(&mut self, id: MessageId) {
        if let Some(task) = self.tasks.remove(&id) {
            task.abort();
        }
    }

    /// Cancel every in-flight send. Called on role transitions.
    pub fn cancel_all(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }

    pub fn outstanding(&self) -> usize {
        self.tasks.len()
    }
}

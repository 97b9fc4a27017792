//! Request/response correlation by type code.
//!
//! The device answers a GET with a frame of the same type code and carries no
//! request id, so at most one request per type code can be outstanding. A new
//! request for a type that is already pending rejects the earlier waiter with
//! [`ClientError::Superseded`] and takes its place.

use crate::error::ClientError;
use dps150_protocol::Reading;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

/// Outcome delivered to a waiter.
pub type Reply = Result<Reading, ClientError>;

/// Identifies one registration, so that a timed-out waiter only removes its
/// own entry and never a newer replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub type_code: u8,
    id: u64,
}

struct Pending {
    id: u64,
    tx: oneshot::Sender<Reply>,
}

/// Pending-request table keyed by type code.
#[derive(Default)]
pub struct Correlator {
    pending: Mutex<HashMap<u8, Pending>>,
    next_id: AtomicU64,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for `type_code`, superseding any earlier one.
    pub fn register(&self, type_code: u8) -> (Ticket, oneshot::Receiver<Reply>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let previous = self.pending.lock().insert(type_code, Pending { id, tx });
        if let Some(previous) = previous {
            tracing::debug!("request for type {} superseded", type_code);
            let _ = previous.tx.send(Err(ClientError::Superseded(type_code)));
        }

        (Ticket { type_code, id }, rx)
    }

    /// Resolves the waiter for `type_code`, if any. Returns whether one was
    /// waiting.
    pub fn resolve(&self, type_code: u8, reading: Reading) -> bool {
        let entry = self.pending.lock().remove(&type_code);
        match entry {
            Some(pending) => {
                let _ = pending.tx.send(Ok(reading));
                true
            }
            None => false,
        }
    }

    /// Removes the entry for `ticket` if it is still the registered one.
    pub fn remove(&self, ticket: &Ticket) -> bool {
        let mut pending = self.pending.lock();
        match pending.get(&ticket.type_code) {
            Some(entry) if entry.id == ticket.id => {
                pending.remove(&ticket.type_code);
                true
            }
            _ => false,
        }
    }

    /// Rejects every outstanding waiter with [`ClientError::ConnectionClosed`].
    pub fn reject_all(&self) -> usize {
        let drained: Vec<Pending> = self.pending.lock().drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for pending in drained {
            let _ = pending.tx.send(Err(ClientError::ConnectionClosed));
        }
        count
    }

    /// Waits for the reply to `ticket`, removing the entry on timeout.
    pub async fn wait(
        &self,
        ticket: Ticket,
        rx: oneshot::Receiver<Reply>,
        timeout: Duration,
    ) -> Reply {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                tracing::debug!("request for type {} timed out", ticket.type_code);
                self.remove(&ticket);
                Err(ClientError::Timeout)
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_pending(&self, type_code: u8) -> bool {
        self.pending.lock().contains_key(&type_code)
    }
}

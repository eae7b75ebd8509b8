use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::message::ChatMessage;

/// Server-assigned identity of one connection, rendered as `user_<N>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(u64);

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user_{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("outbound stream is closed")]
    Closed,
    #[error("delivery timed out after {0:?}")]
    TimedOut(Duration),
}

/// Capability to push messages into one session's outbound stream.
///
/// The session owns the receiving end of the queue and the cancellation token;
/// the registry only keeps clones, so dropping the session closes the queue
/// even while a snapshot still holds this handle.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::Sender<ChatMessage>,
    closer: CancellationToken,
}

impl Outbound {
    pub fn new(tx: mpsc::Sender<ChatMessage>, closer: CancellationToken) -> Self {
        Self { tx, closer }
    }

    /// Queues `message` for the session's writer, waiting at most `limit`
    /// for room in the queue.
    pub async fn deliver(
        &self,
        message: ChatMessage,
        limit: Duration,
    ) -> Result<(), DeliveryError> {
        match tokio::time::timeout(limit, self.tx.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(DeliveryError::Closed),
            Err(_) => Err(DeliveryError::TimedOut(limit)),
        }
    }

    /// Asks the owning session to tear itself down.
    pub fn close(&self) {
        self.closer.cancel();
    }
}

/// Connection registry plus the identity counter scoped to it.
///
/// The map is sharded, so `register`/`remove` on one identity never wait on a
/// snapshot walking other shards for longer than a single shard lock.
pub struct Registry {
    clients: DashMap<Identity, Outbound>,
    next_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_identity(&self) -> Identity {
        Identity(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn register(&self, identity: Identity, handle: Outbound) {
        let previous = self.clients.insert(identity, handle);
        debug_assert!(previous.is_none(), "identity {identity} registered twice");
    }

    /// Removes the entry if it is still present. Returns whether anything was removed.
    pub fn remove(&self, identity: Identity) -> bool {
        self.clients.remove(&identity).is_some()
    }

    pub fn snapshot(&self) -> Vec<(Identity, Outbound)> {
        self.clients
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    pub fn contains(&self, identity: Identity) -> bool {
        self.clients.contains_key(&identity)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

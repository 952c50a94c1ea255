//! The pending-command set.
//!
//! Maps correlation ids to the callers waiting on them. Each entry owns the
//! sending half of a oneshot channel, so an entry can be resolved at most
//! once: whoever removes it from the map first (reply, timeout, disconnect)
//! decides the outcome. Entries remember which peer connection their frame
//! went to, so losing one connection only fails the commands sent over it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{CorrelationId, PeerId};
use crate::error::RelayError;

/// What a waiting caller eventually receives.
pub type Outcome = Result<Value, RelayError>;

/// A command sent to the peer and not yet resolved.
#[derive(Debug)]
struct PendingCommand {
    command: String,
    params: Map<String, Value>,
    /// Connection the frame was queued on; `None` until sent.
    peer: Option<PeerId>,
    submitted_at: Instant,
    slot: oneshot::Sender<Outcome>,
}

/// Counters describing relay traffic.
#[derive(Debug, Default)]
struct Counters {
    registered: AtomicU64,
    completed: AtomicU64,
    timed_out: AtomicU64,
    disconnected: AtomicU64,
    unknown_replies: AtomicU64,
}

/// Point-in-time copy of the relay counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStats {
    /// Commands registered.
    pub registered: u64,
    /// Commands resolved by a reply (result or error).
    pub completed: u64,
    /// Commands resolved by timeout.
    pub timed_out: u64,
    /// Commands resolved because no peer was available.
    pub disconnected: u64,
    /// Replies that matched no pending command.
    pub unknown_replies: u64,
}

/// Commands awaiting a reply from the peer.
#[derive(Debug, Default)]
pub struct PendingCommands {
    pending: DashMap<CorrelationId, PendingCommand>,
    counters: Counters,
}

impl PendingCommands {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a command under a fresh correlation id.
    pub fn register(
        &self,
        command: &str,
        params: Map<String, Value>,
    ) -> (CorrelationId, oneshot::Receiver<Outcome>) {
        let id = CorrelationId::new();
        let (slot, rx) = oneshot::channel();

        self.pending.insert(
            id,
            PendingCommand {
                command: command.to_string(),
                params,
                peer: None,
                submitted_at: Instant::now(),
                slot,
            },
        );
        self.counters.registered.fetch_add(1, Ordering::Relaxed);
        debug!(correlation_id = %id, command, "Registered pending command");

        (id, rx)
    }

    /// Records that `id`'s frame was queued on connection `peer`.
    pub fn assign_peer(&self, id: &CorrelationId, peer: PeerId) {
        if let Some(mut entry) = self.pending.get_mut(id) {
            entry.peer = Some(peer);
        }
    }

    /// Resolves a pending command with the peer's reply.
    ///
    /// Returns `false` if the id is unknown or was already resolved.
    pub fn complete(&self, id: CorrelationId, outcome: Outcome) -> bool {
        let Some((_, entry)) = self.pending.remove(&id) else {
            self.note_unknown_reply(&id.to_string());
            return false;
        };

        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        let elapsed = entry.submitted_at.elapsed();
        debug!(
            correlation_id = %id,
            command = %entry.command,
            params = entry.params.len(),
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            ok = outcome.is_ok(),
            "Completed pending command"
        );

        // The caller may have given up in the instant between removal and send
        entry.slot.send(outcome).is_ok()
    }

    /// Removes a command whose caller stopped waiting after `timeout`.
    pub fn time_out(&self, id: &CorrelationId, timeout: Duration) -> bool {
        let Some((_, entry)) = self.pending.remove(id) else {
            return false;
        };
        self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
        warn!(
            correlation_id = %id,
            command = %entry.command,
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "Command timed out waiting for peer reply"
        );
        true
    }

    /// Removes a command that could not be delivered.
    pub fn abandon(&self, id: &CorrelationId) -> bool {
        if self.pending.remove(id).is_some() {
            self.counters.disconnected.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Removes a command whose caller went away without an outcome.
    pub fn cancel(&self, id: &CorrelationId) -> bool {
        let Some((_, entry)) = self.pending.remove(id) else {
            return false;
        };
        debug!(correlation_id = %id, command = %entry.command, "Caller stopped waiting, dropping pending command");
        true
    }

    /// Resolves every command sent over connection `peer` with `error`.
    ///
    /// Commands sent to other connections, or not sent yet, are untouched.
    /// Returns the number of commands resolved.
    pub fn fail_peer(&self, peer: PeerId, error: &RelayError) -> usize {
        let ids: Vec<CorrelationId> = self
            .pending
            .iter()
            .filter(|entry| entry.peer == Some(peer))
            .map(|entry| *entry.key())
            .collect();
        let mut failed = 0;

        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                debug!(correlation_id = %id, command = %entry.command, error = %error, "Failing pending command");
                let _ = entry.slot.send(Err(error.clone()));
                failed += 1;
            }
        }

        if matches!(error, RelayError::PeerDisconnected) {
            self.counters
                .disconnected
                .fetch_add(failed as u64, Ordering::Relaxed);
        }
        failed
    }

    /// Records a reply that matched nothing.
    pub fn note_unknown_reply(&self, id: &str) {
        self.counters.unknown_replies.fetch_add(1, Ordering::Relaxed);
        warn!(correlation_id = id, "Discarding reply for unknown or already-resolved command");
    }

    /// Returns `true` if `id` is still awaiting a reply.
    #[must_use]
    pub fn is_pending(&self, id: &CorrelationId) -> bool {
        self.pending.contains_key(id)
    }

    /// Number of commands awaiting a reply.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns `true` if nothing is awaiting a reply.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> RelayStats {
        RelayStats {
            registered: self.counters.registered.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            disconnected: self.counters.disconnected.load(Ordering::Relaxed),
            unknown_replies: self.counters.unknown_replies.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn register_and_complete() {
        let pending = PendingCommands::new();

        let (id, rx) = pending.register("get_selection", Map::new());
        assert!(pending.is_pending(&id));
        assert_eq!(pending.len(), 1);

        assert!(pending.complete(id, Ok(json!({"selectionCount": 0}))));
        assert_eq!(rx.await.unwrap(), Ok(json!({"selectionCount": 0})));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn second_completion_is_discarded() {
        let pending = PendingCommands::new();
        let (id, rx) = pending.register("get_selection", Map::new());

        assert!(pending.complete(id, Ok(json!(1))));
        assert!(!pending.complete(id, Ok(json!(2))));
        assert_eq!(rx.await.unwrap(), Ok(json!(1)));
        assert_eq!(pending.stats().unknown_replies, 1);
    }

    #[tokio::test]
    async fn fail_peer_resolves_everything_sent_to_it() {
        let pending = PendingCommands::new();
        let (a, rx1) = pending.register("a", Map::new());
        let (b, rx2) = pending.register("b", Map::new());
        pending.assign_peer(&a, 7);
        pending.assign_peer(&b, 7);

        assert_eq!(pending.fail_peer(7, &RelayError::PeerDisconnected), 2);
        assert!(pending.is_empty());
        assert_eq!(rx1.await.unwrap(), Err(RelayError::PeerDisconnected));
        assert_eq!(rx2.await.unwrap(), Err(RelayError::PeerDisconnected));
        assert_eq!(pending.stats().disconnected, 2);
    }

    #[tokio::test]
    async fn fail_peer_spares_other_connections() {
        let pending = PendingCommands::new();
        let (old, old_rx) = pending.register("get_selection", Map::new());
        let (new, mut new_rx) = pending.register("get_selection", Map::new());
        let (unsent, _unsent_rx) = pending.register("get_selection", Map::new());
        pending.assign_peer(&old, 1);
        pending.assign_peer(&new, 2);

        assert_eq!(pending.fail_peer(1, &RelayError::PeerDisconnected), 1);
        assert_eq!(old_rx.await.unwrap(), Err(RelayError::PeerDisconnected));
        assert!(pending.is_pending(&new));
        assert!(pending.is_pending(&unsent));
        assert!(new_rx.try_recv().is_err());

        assert!(pending.complete(new, Ok(json!("fresh"))));
        assert_eq!(new_rx.await.unwrap(), Ok(json!("fresh")));
    }

    #[test]
    fn cancel_is_not_counted() {
        let pending = PendingCommands::new();
        let (id, _rx) = pending.register("get_document_info", Map::new());

        assert!(pending.cancel(&id));
        assert!(!pending.cancel(&id));
        assert!(pending.is_empty());
        assert_eq!(pending.stats().disconnected, 0);
    }

    #[test]
    fn time_out_removes_once() {
        let pending = PendingCommands::new();
        let (id, _rx) = pending.register("read_my_design", Map::new());

        assert!(pending.time_out(&id, Duration::from_secs(30)));
        assert!(!pending.time_out(&id, Duration::from_secs(30)));
        assert!(!pending.complete(id, Ok(json!(null))));

        let stats = pending.stats();
        assert_eq!(stats.registered, 1);
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.completed, 0);
        assert_eq!(stats.unknown_replies, 1);
    }

    #[test]
    fn abandon_counts_as_disconnected() {
        let pending = PendingCommands::new();
        let (id, _rx) = pending.register("get_document_info", Map::new());

        assert!(pending.abandon(&id));
        assert!(!pending.abandon(&id));
        assert_eq!(pending.stats().disconnected, 1);
    }
}

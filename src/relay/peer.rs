//! The single active peer.
//!
//! The Figma plugin is the only consumer of the socket protocol. The
//! registry tracks at most one live connection; a new connection replaces
//! the previous one (last-connected-wins). The socket itself is owned by the
//! connection task; the registry only holds the sending half of that task's
//! outbound queue, so dropping it closes the connection.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::SendError;

/// Identifies one accepted peer connection.
pub type PeerId = u64;

/// Outbound queue of an accepted connection.
pub type PeerSender = mpsc::UnboundedSender<String>;

#[derive(Debug)]
struct ActivePeer {
    id: PeerId,
    outbound: PeerSender,
}

/// Result of accepting a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connected {
    /// Id assigned to the new connection.
    pub id: PeerId,
    /// Id of the connection it displaced, if any.
    pub replaced: Option<PeerId>,
}

/// Owns the handle to the one logical peer.
#[derive(Debug, Default)]
pub struct PeerConnectionRegistry {
    active: Mutex<Option<ActivePeer>>,
    next_id: AtomicU64,
}

impl PeerConnectionRegistry {
    /// Creates a registry with no peer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `outbound` the active peer, displacing any previous one.
    pub fn on_connect(&self, outbound: PeerSender) -> Connected {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let previous = self.active.lock().replace(ActivePeer { id, outbound });
        let replaced = previous.map(|peer| peer.id);

        match replaced {
            Some(old) => info!(peer_id = id, replaced = old, "Peer connected, replacing previous peer"),
            None => info!(peer_id = id, "Peer connected"),
        }

        Connected { id, replaced }
    }

    /// Clears the active peer if it is still `id`.
    ///
    /// Returns `false` when `id` had already been replaced, in which case the
    /// current peer is left untouched.
    pub fn on_disconnect(&self, id: PeerId) -> bool {
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|peer| peer.id == id) {
            *active = None;
            info!(peer_id = id, "Peer disconnected");
            true
        } else {
            debug!(peer_id = id, "Stale peer connection closed");
            false
        }
    }

    /// Queues a frame for the active peer, returning that peer's id.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::NotConnected`] if there is no live peer.
    pub fn send(&self, frame: String) -> Result<PeerId, SendError> {
        self.send_tagged(frame, |_| {})
    }

    /// Like [`send`](Self::send), but first hands the receiving peer's id to
    /// `tag`.
    ///
    /// `tag` runs under the registry lock, so whatever it records is ordered
    /// before any connect or disconnect that displaces that peer.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::NotConnected`] if there is no live peer.
    pub fn send_tagged(&self, frame: String, tag: impl FnOnce(PeerId)) -> Result<PeerId, SendError> {
        let mut active = self.active.lock();
        let Some(peer) = active.as_ref() else {
            return Err(SendError::NotConnected);
        };

        let id = peer.id;
        tag(id);
        if peer.outbound.send(frame).is_err() {
            // connection task already exited
            debug!(peer_id = id, "Dropping closed peer");
            *active = None;
            return Err(SendError::NotConnected);
        }
        Ok(id)
    }

    /// Returns `true` if a live peer is connected.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|peer| !peer.outbound.is_closed())
    }

    /// Returns the id of the active peer.
    #[must_use]
    pub fn active_peer(&self) -> Option<PeerId> {
        self.active.lock().as_ref().map(|peer| peer.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_without_peer_fails() {
        let registry = PeerConnectionRegistry::new();
        assert!(!registry.is_active());
        assert_eq!(
            registry.send("{}".to_string()),
            Err(SendError::NotConnected)
        );
    }

    #[test]
    fn frames_reach_the_active_peer() {
        let registry = PeerConnectionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let connected = registry.on_connect(tx);
        assert_eq!(connected.replaced, None);
        assert!(registry.is_active());

        registry.send("frame".to_string()).unwrap();
        assert_eq!(rx.try_recv().unwrap(), "frame");
    }

    #[test]
    fn last_connected_wins() {
        let registry = PeerConnectionRegistry::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        let first = registry.on_connect(tx1);
        let second = registry.on_connect(tx2);
        assert_eq!(second.replaced, Some(first.id));
        assert_eq!(registry.active_peer(), Some(second.id));

        assert_eq!(registry.send("frame".to_string()), Ok(second.id));
        assert_eq!(rx2.try_recv().unwrap(), "frame");
        // the displaced connection's queue is closed
        assert!(matches!(
            rx1.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));

        // the old connection going away must not clear the new one
        assert!(!registry.on_disconnect(first.id));
        assert!(registry.is_active());
        assert!(registry.on_disconnect(second.id));
        assert!(!registry.is_active());
    }

    #[test]
    fn closed_connection_counts_as_disconnected() {
        let registry = PeerConnectionRegistry::new();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.on_connect(tx);
        drop(rx);

        assert!(!registry.is_active());
        assert_eq!(
            registry.send("frame".to_string()),
            Err(SendError::NotConnected)
        );
        assert_eq!(registry.active_peer(), None);
    }
}

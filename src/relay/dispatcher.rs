//! The correlation core.
//!
//! [`CommandDispatcher::invoke`] registers a pending command, sends its frame
//! to the active peer and suspends on that command's oneshot until the reply,
//! a timeout, or a peer disconnect resolves it. Many invocations may be in
//! flight at once; replies are matched by correlation id only, never by
//! arrival order.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::frame::{encode_command, parse_reply, FrameError, ReplyFrame};
use super::peer::{PeerConnectionRegistry, PeerId, PeerSender};
use super::pending::{PendingCommands, RelayStats};
use super::CorrelationId;
use crate::error::RelayError;

/// Relays commands to the peer and routes replies back to their callers.
#[derive(Debug)]
pub struct CommandDispatcher {
    peers: Arc<PeerConnectionRegistry>,
    pending: PendingCommands,
    default_timeout: Duration,
}

impl CommandDispatcher {
    /// Creates a dispatcher over `peers`.
    #[must_use]
    pub fn new(peers: Arc<PeerConnectionRegistry>, default_timeout: Duration) -> Self {
        Self {
            peers,
            pending: PendingCommands::new(),
            default_timeout,
        }
    }

    /// The peer registry this dispatcher sends through.
    #[must_use]
    pub const fn peers(&self) -> &Arc<PeerConnectionRegistry> {
        &self.peers
    }

    /// The timeout tool calls use.
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Number of commands awaiting a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Relay counters.
    #[must_use]
    pub fn stats(&self) -> RelayStats {
        self.pending.stats()
    }

    /// Accepts a new peer connection.
    ///
    /// Commands still pending against a displaced peer can never be
    /// answered, so they are failed with [`RelayError::PeerDisconnected`].
    /// Commands already sent to the new peer are left alone.
    pub fn attach_peer(&self, outbound: PeerSender) -> PeerId {
        let connected = self.peers.on_connect(outbound);
        if let Some(replaced) = connected.replaced {
            let failed = self.pending.fail_peer(replaced, &RelayError::PeerDisconnected);
            if failed > 0 {
                info!(failed, peer_id = replaced, "Failed commands pending on the replaced peer");
            }
        }
        connected.id
    }

    /// Handles a peer connection closing.
    ///
    /// Commands sent over that connection fail even if the registry had
    /// already dropped it, for instance after a send found it closed.
    pub fn detach_peer(&self, id: PeerId) {
        self.peers.on_disconnect(id);
        let failed = self.pending.fail_peer(id, &RelayError::PeerDisconnected);
        if failed > 0 {
            info!(failed, peer_id = id, "Failed commands pending on the disconnected peer");
        }
    }

    /// Routes an inbound frame to the command it answers.
    ///
    /// Frames that are not replies, or that answer nothing pending, are
    /// logged and dropped.
    pub fn handle_inbound(&self, text: &str) {
        let frame = match parse_reply(text) {
            Ok(frame) => frame,
            Err(FrameError::NoOutcome(id)) => {
                debug!(correlation_id = %id, "Ignoring peer frame without result or error");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Ignoring malformed peer frame");
                return;
            }
        };

        let Some(id) = CorrelationId::parse(frame.id()) else {
            self.pending.note_unknown_reply(frame.id());
            return;
        };

        let outcome = match frame {
            ReplyFrame::Result { result, .. } => Ok(result),
            ReplyFrame::Error { error, .. } => Err(RelayError::PeerError(error)),
        };
        self.pending.complete(id, outcome);
    }

    /// Sends `command` to the peer and waits for its reply.
    ///
    /// # Errors
    ///
    /// - [`RelayError::PeerDisconnected`] immediately if no peer is
    ///   connected, or later if the peer goes away first
    /// - [`RelayError::Timeout`] if no reply arrives within `timeout`
    /// - [`RelayError::PeerError`] if the peer reports a failure
    pub async fn invoke(
        &self,
        command: &str,
        params: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, RelayError> {
        let frame_params = params.clone();
        let (id, rx) = self.pending.register(command, params);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };
        let frame = encode_command(id, command, &frame_params);

        let sent = self
            .peers
            .send_tagged(frame, |peer| self.pending.assign_peer(&id, peer));
        let Ok(peer) = sent else {
            self.pending.abandon(&id);
            warn!(correlation_id = %id, command, "No peer connected, command not sent");
            return Err(RelayError::PeerDisconnected);
        };
        debug!(correlation_id = %id, command, peer_id = peer, "Sent command to peer");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // slot dropped without a value
            Ok(Err(_)) => Err(RelayError::PeerDisconnected),
            Err(_) => {
                self.pending.time_out(&id, timeout);
                Err(RelayError::Timeout {
                    command: command.to_string(),
                    timeout,
                })
            }
        }
    }

    /// [`invoke`](Self::invoke) with the default timeout.
    ///
    /// # Errors
    ///
    /// See [`invoke`](Self::invoke).
    pub async fn invoke_default(
        &self,
        command: &str,
        params: Map<String, Value>,
    ) -> Result<Value, RelayError> {
        self.invoke(command, params, self.default_timeout).await
    }
}

/// Drops a command's pending entry if its `invoke` future is dropped
/// before an outcome arrives.
struct PendingGuard<'a> {
    pending: &'a PendingCommands,
    id: CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.cancel(&self.id);
    }
}

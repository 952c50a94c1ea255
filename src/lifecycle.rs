//! Start/stop orchestration of the two listeners.
//!
//! ```text
//! Stopped ─▶ ReclaimingPeerPort ─▶ PeerListenerReady ─▶ ReclaimingMcpPort ─▶ Running
//!                  │                                          │
//!                  └──────────────▶ Failed ◀──────────────────┘
//! ```
//!
//! Every start reclaims the port first. A failed `start_all` stops whatever
//! it started before reporting `Failed`. Operations are serialized: a second
//! caller waits for the first to finish. The exception is `kill_all`, which
//! interrupts a start that is still reclaiming and terminates port holders
//! before it waits for the lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{LifecycleError, RegistryError};
use crate::listener::{self, ListenerHandle};
use crate::mcp::{self, McpServer};
use crate::relay::{CommandDispatcher, PeerConnectionRegistry};
use crate::reclaim::PortReclaimer;

/// Where the manager is in its start/stop cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleState {
    /// Nothing is listening.
    Stopped,
    /// Making the peer port bindable.
    ReclaimingPeerPort,
    /// Only the peer listener is up.
    PeerListenerReady,
    /// Making the MCP port bindable.
    ReclaimingMcpPort,
    /// Both listeners are up.
    Running,
    /// Only the MCP front-end is up.
    McpOnly,
    /// The last start attempt failed and nothing is listening.
    Failed,
}

/// Snapshot for status display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleStatus {
    /// Current state.
    pub state: LifecycleState,
    /// Whether the peer WebSocket listener is serving.
    pub peer_listener_running: bool,
    /// Whether the MCP front-end is serving.
    pub mcp_server_running: bool,
    /// Whether the Figma plugin is connected.
    pub peer_connected: bool,
    /// Commands awaiting a reply.
    pub pending_commands: usize,
    /// Configured peer port.
    pub peer_port: u16,
    /// Configured MCP port.
    pub mcp_port: u16,
    /// Why the last operation failed, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct Listeners {
    peer: Option<ListenerHandle>,
    mcp: Option<ListenerHandle>,
}

impl Listeners {
    fn settled_state(&self) -> LifecycleState {
        match (self.peer.is_some(), self.mcp.is_some()) {
            (true, true) => LifecycleState::Running,
            (true, false) => LifecycleState::PeerListenerReady,
            (false, true) => LifecycleState::McpOnly,
            (false, false) => LifecycleState::Stopped,
        }
    }
}

/// Owns both listeners and the relay they share.
#[derive(Debug)]
pub struct ServerLifecycleManager {
    config: Config,
    reclaimer: PortReclaimer,
    dispatcher: Arc<CommandDispatcher>,
    server: Arc<McpServer>,
    state: Mutex<LifecycleState>,
    last_error: Mutex<Option<String>>,
    listeners: tokio::sync::Mutex<Listeners>,
    /// Mirrors of `listeners` readable while an operation holds the lock.
    peer_running: AtomicBool,
    mcp_running: AtomicBool,
    /// Bumped by every kill-all; in-flight reclamation watches it.
    kills: watch::Sender<u64>,
}

impl ServerLifecycleManager {
    /// Creates a manager using the platform's port probe and terminator.
    ///
    /// # Errors
    ///
    /// Returns an error if the tool catalogue cannot be built.
    pub fn from_config(config: Config) -> Result<Self, RegistryError> {
        let reclaimer = PortReclaimer::new(config.reclaim.clone());
        Self::new(config, reclaimer)
    }

    /// Creates a manager with an explicit reclaimer.
    ///
    /// # Errors
    ///
    /// Returns an error if the tool catalogue cannot be built.
    pub fn new(config: Config, reclaimer: PortReclaimer) -> Result<Self, RegistryError> {
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::new(PeerConnectionRegistry::new()),
            config.relay.command_timeout(),
        ));
        let server = Arc::new(mcp::build_server(dispatcher.clone())?);

        Ok(Self {
            config,
            reclaimer,
            dispatcher,
            server,
            state: Mutex::new(LifecycleState::Stopped),
            last_error: Mutex::new(None),
            listeners: tokio::sync::Mutex::new(Listeners::default()),
            peer_running: AtomicBool::new(false),
            mcp_running: AtomicBool::new(false),
            kills: watch::Sender::new(0),
        })
    }

    /// The relay shared by both listeners.
    #[must_use]
    pub const fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// Snapshot of the manager and relay.
    ///
    /// Does not wait for an in-progress operation.
    #[must_use]
    pub fn status(&self) -> LifecycleStatus {
        let (peer_listener_running, mcp_server_running) = match self.listeners.try_lock() {
            Ok(listeners) => (
                listeners.peer.as_ref().is_some_and(ListenerHandle::is_running),
                listeners.mcp.as_ref().is_some_and(ListenerHandle::is_running),
            ),
            Err(_) => (
                self.peer_running.load(Ordering::Acquire),
                self.mcp_running.load(Ordering::Acquire),
            ),
        };

        LifecycleStatus {
            state: self.state(),
            peer_listener_running,
            mcp_server_running,
            peer_connected: self.dispatcher.peers().is_active(),
            pending_commands: self.dispatcher.pending_count(),
            peer_port: self.config.peer.port,
            mcp_port: self.config.mcp.port,
            last_error: self.last_error.lock().clone(),
        }
    }

    /// Starts the peer listener, then the MCP front-end.
    ///
    /// Listeners already running are left alone. If either port cannot be
    /// reclaimed or bound, whatever this call started is stopped again and
    /// the state becomes [`LifecycleState::Failed`].
    ///
    /// # Errors
    ///
    /// Returns the first reclamation or bind failure.
    pub async fn start_all(&self) -> Result<(), LifecycleError> {
        let mut listeners = self.listeners.lock().await;
        info!("Starting all servers");

        let mut started_peer = false;
        if listeners.peer.is_none() {
            self.set_state(LifecycleState::ReclaimingPeerPort);
            match self.open_peer_listener().await {
                Ok(handle) => {
                    listeners.peer = Some(handle);
                    self.publish(&listeners);
                    started_peer = true;
                }
                Err(e) => {
                    self.record_failure(&listeners, &e);
                    return Err(e);
                }
            }
        }
        self.set_state(LifecycleState::PeerListenerReady);

        if listeners.mcp.is_none() {
            self.set_state(LifecycleState::ReclaimingMcpPort);
            match self.open_mcp_server().await {
                Ok(handle) => listeners.mcp = Some(handle),
                Err(e) => {
                    if started_peer {
                        if let Some(mut handle) = listeners.peer.take() {
                            warn!("Rolling back peer listener after MCP start failure");
                            handle.stop().await;
                        }
                    }
                    self.record_failure(&listeners, &e);
                    return Err(e);
                }
            }
        }

        *self.last_error.lock() = None;
        self.settle(&listeners);
        info!(
            peer_port = self.config.peer.port,
            mcp_port = self.config.mcp.port,
            "All servers running"
        );
        Ok(())
    }

    /// Stops the MCP front-end, then the peer listener.
    pub async fn stop_all(&self) {
        let mut listeners = self.listeners.lock().await;
        info!("Stopping all servers");
        Self::stop_mcp(&mut listeners).await;
        Self::stop_peer(&mut listeners).await;
        self.settle(&listeners);
    }

    /// Starts only the peer listener.
    ///
    /// # Errors
    ///
    /// Returns a reclamation or bind failure.
    pub async fn start_peer_listener(&self) -> Result<(), LifecycleError> {
        let mut listeners = self.listeners.lock().await;
        if listeners.peer.is_some() {
            return Ok(());
        }

        self.set_state(LifecycleState::ReclaimingPeerPort);
        match self.open_peer_listener().await {
            Ok(handle) => {
                listeners.peer = Some(handle);
                *self.last_error.lock() = None;
                self.settle(&listeners);
                Ok(())
            }
            Err(e) => {
                self.record_failure(&listeners, &e);
                Err(e)
            }
        }
    }

    /// Stops only the peer listener.
    pub async fn stop_peer_listener(&self) {
        let mut listeners = self.listeners.lock().await;
        Self::stop_peer(&mut listeners).await;
        self.settle(&listeners);
    }

    /// Starts only the MCP front-end.
    ///
    /// # Errors
    ///
    /// Returns a reclamation or bind failure.
    pub async fn start_mcp_server(&self) -> Result<(), LifecycleError> {
        let mut listeners = self.listeners.lock().await;
        if listeners.mcp.is_some() {
            return Ok(());
        }

        self.set_state(LifecycleState::ReclaimingMcpPort);
        match self.open_mcp_server().await {
            Ok(handle) => {
                listeners.mcp = Some(handle);
                *self.last_error.lock() = None;
                self.settle(&listeners);
                Ok(())
            }
            Err(e) => {
                self.record_failure(&listeners, &e);
                Err(e)
            }
        }
    }

    /// Stops only the MCP front-end.
    pub async fn stop_mcp_server(&self) {
        let mut listeners = self.listeners.lock().await;
        Self::stop_mcp(&mut listeners).await;
        self.settle(&listeners);
    }

    /// Stops everything and terminates whatever else holds either port.
    ///
    /// Does not wait for an in-flight start: a start that is still reclaiming
    /// a port is interrupted, and the ports' holders are terminated before
    /// this call queues for the listeners. Always ends in
    /// [`LifecycleState::Stopped`].
    pub async fn kill_all(&self) {
        warn!("Force killing all servers");
        self.kills.send_modify(|kills| *kills += 1);

        // this process is never among the holders it terminates
        for port in [self.config.peer.port, self.config.mcp.port] {
            self.reclaimer.terminate_holders(port).await;
        }

        let mut listeners = self.listeners.lock().await;
        Self::stop_mcp(&mut listeners).await;
        Self::stop_peer(&mut listeners).await;
        self.publish(&listeners);

        let release = Duration::from_millis(self.reclaimer.config().kill_all_release_ms);
        if !release.is_zero() {
            tokio::time::sleep(release).await;
        }

        *self.last_error.lock() = None;
        self.set_state(LifecycleState::Stopped);
        info!("All servers killed");
    }

    async fn open_peer_listener(&self) -> Result<ListenerHandle, LifecycleError> {
        let peer = &self.config.peer;
        let listener = self.reclaim_and_bind(&peer.host, peer.port).await?;
        listener::peer::serve(listener, self.dispatcher.clone(), peer.max_message_bytes).map_err(
            |source| LifecycleError::Bind {
                port: peer.port,
                source,
            },
        )
    }

    async fn open_mcp_server(&self) -> Result<ListenerHandle, LifecycleError> {
        let mcp = &self.config.mcp;
        let listener = self.reclaim_and_bind(&mcp.host, mcp.port).await?;
        mcp::transport::serve(listener, self.server.clone()).map_err(|source| {
            LifecycleError::Bind {
                port: mcp.port,
                source,
            }
        })
    }

    async fn reclaim_and_bind(&self, host: &str, port: u16) -> Result<TcpListener, LifecycleError> {
        let mut kills = self.kills.subscribe();
        let available = tokio::select! {
            available = self.reclaimer.ensure_available(port) => available,
            _ = kills.changed() => {
                warn!(port, "Port reclamation interrupted by kill-all");
                return Err(LifecycleError::Interrupted { port });
            }
        };
        if !available {
            return Err(LifecycleError::PortUnavailable { port });
        }
        TcpListener::bind((host, port))
            .await
            .map_err(|source| LifecycleError::Bind { port, source })
    }

    async fn stop_peer(listeners: &mut Listeners) {
        if let Some(mut handle) = listeners.peer.take() {
            handle.stop().await;
        }
    }

    async fn stop_mcp(listeners: &mut Listeners) {
        if let Some(mut handle) = listeners.mcp.take() {
            handle.stop().await;
        }
    }

    fn set_state(&self, state: LifecycleState) {
        *self.state.lock() = state;
    }

    fn publish(&self, listeners: &Listeners) {
        self.peer_running
            .store(listeners.peer.is_some(), Ordering::Release);
        self.mcp_running
            .store(listeners.mcp.is_some(), Ordering::Release);
    }

    fn settle(&self, listeners: &Listeners) {
        self.publish(listeners);
        self.set_state(listeners.settled_state());
    }

    fn record_failure(&self, listeners: &Listeners, e: &LifecycleError) {
        error!(port = e.port(), error = %e, "Server start failed");
        self.publish(listeners);
        *self.last_error.lock() = Some(e.to_string());
        let state = match listeners.settled_state() {
            LifecycleState::Stopped => LifecycleState::Failed,
            other => other,
        };
        self.set_state(state);
    }
}

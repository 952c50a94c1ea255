//! Integration tests for server lifecycle management.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use figma_relay_mcp::config::{Config, ReclaimConfig};
use figma_relay_mcp::error::LifecycleError;
use figma_relay_mcp::reclaim::{KillReport, PortReclaimer, ProcessTerminator, TcpProbe};
use figma_relay_mcp::{LifecycleState, ServerLifecycleManager};

/// Records the ports it was asked to clear; never kills anything.
#[derive(Default)]
struct RecordingTerminator {
    ports: Mutex<Vec<u16>>,
}

#[async_trait]
impl ProcessTerminator for RecordingTerminator {
    async fn find_and_kill_processes_on_port(&self, port: u16) -> io::Result<KillReport> {
        self.ports.lock().push(port);
        Ok(KillReport::default())
    }
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn manager(terminator: Arc<RecordingTerminator>) -> ServerLifecycleManager {
    let mut config = Config::default();
    config.peer.port = free_port();
    config.mcp.port = free_port();
    let reclaimer = PortReclaimer::with_backends(
        ReclaimConfig::immediate(2),
        Arc::new(TcpProbe::default()),
        terminator,
    );
    ServerLifecycleManager::new(config, reclaimer).unwrap()
}

/// A manager on the default backoff schedule, so reclaiming a held port
/// takes long enough to be observed.
fn slow_manager(terminator: Arc<RecordingTerminator>) -> Arc<ServerLifecycleManager> {
    let mut config = Config::default();
    config.peer.port = free_port();
    config.mcp.port = free_port();
    let reclaim = ReclaimConfig {
        kill_all_release_ms: 0,
        ..ReclaimConfig::default()
    };
    let reclaimer = PortReclaimer::with_backends(reclaim, Arc::new(TcpProbe::default()), terminator);
    Arc::new(ServerLifecycleManager::new(config, reclaimer).unwrap())
}

async fn wait_for_state(manager: &ServerLifecycleManager, state: LifecycleState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while manager.state() != state {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

fn bindable(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

// =============================================================================
// Rollback Tests
// =============================================================================

#[tokio::test]
async fn test_held_mcp_port_rolls_back_peer_listener() {
    let manager = manager(Arc::new(RecordingTerminator::default()));
    let peer_port = manager.config().peer.port;
    let mcp_port = manager.config().mcp.port;
    let holder = std::net::TcpListener::bind(("0.0.0.0", mcp_port)).unwrap();

    let err = manager.start_all().await.unwrap_err();

    assert!(matches!(err, LifecycleError::PortUnavailable { port } if port == mcp_port));
    let status = manager.status();
    assert_eq!(status.state, LifecycleState::Failed);
    assert!(!status.peer_listener_running);
    assert!(!status.mcp_server_running);
    assert!(status.last_error.unwrap().contains(&mcp_port.to_string()));
    assert!(bindable(peer_port));

    drop(holder);
    manager.start_all().await.unwrap();
    assert_eq!(manager.state(), LifecycleState::Running);
    assert!(manager.status().last_error.is_none());

    manager.stop_all().await;
}

#[tokio::test]
async fn test_held_peer_port_never_starts_mcp() {
    let terminator = Arc::new(RecordingTerminator::default());
    let manager = manager(terminator.clone());
    let peer_port = manager.config().peer.port;
    let holder = std::net::TcpListener::bind(("0.0.0.0", peer_port)).unwrap();

    let err = manager.start_all().await.unwrap_err();

    assert_eq!(err.port(), peer_port);
    assert_eq!(manager.state(), LifecycleState::Failed);
    assert!(!manager.status().mcp_server_running);
    // first pass plus the final pass
    assert_eq!(*terminator.ports.lock(), [peer_port, peer_port]);

    drop(holder);
}

// =============================================================================
// Kill-All Tests
// =============================================================================

#[tokio::test]
async fn test_kill_all_resets_running_servers() {
    let terminator = Arc::new(RecordingTerminator::default());
    let manager = manager(terminator.clone());
    let peer_port = manager.config().peer.port;
    let mcp_port = manager.config().mcp.port;

    manager.start_all().await.unwrap();
    assert_eq!(manager.state(), LifecycleState::Running);

    manager.kill_all().await;

    assert_eq!(manager.state(), LifecycleState::Stopped);
    assert_eq!(*terminator.ports.lock(), [peer_port, mcp_port]);
    assert!(bindable(peer_port));
    assert!(bindable(mcp_port));
}

#[tokio::test]
async fn test_kill_all_interrupts_reclaiming_start() {
    let terminator = Arc::new(RecordingTerminator::default());
    let manager = slow_manager(terminator.clone());
    let peer_port = manager.config().peer.port;
    let holder = std::net::TcpListener::bind(("0.0.0.0", peer_port)).unwrap();

    let start = tokio::spawn({
        let manager = manager.clone();
        async move { manager.start_all().await }
    });
    wait_for_state(&manager, LifecycleState::ReclaimingPeerPort).await;

    let began = Instant::now();
    manager.kill_all().await;
    assert!(began.elapsed() < Duration::from_secs(2));

    let err = start.await.unwrap().unwrap_err();
    assert!(matches!(err, LifecycleError::Interrupted { port } if port == peer_port));

    let status = manager.status();
    assert_eq!(status.state, LifecycleState::Stopped);
    assert!(!status.peer_listener_running);
    assert!(status.last_error.is_none());
    assert!(terminator.ports.lock().contains(&manager.config().mcp.port));

    drop(holder);
}

#[tokio::test]
async fn test_status_during_start_sees_running_peer_listener() {
    let manager = slow_manager(Arc::new(RecordingTerminator::default()));
    manager.start_peer_listener().await.unwrap();
    let holder = std::net::TcpListener::bind(("0.0.0.0", manager.config().mcp.port)).unwrap();

    let start = tokio::spawn({
        let manager = manager.clone();
        async move { manager.start_all().await }
    });
    wait_for_state(&manager, LifecycleState::ReclaimingMcpPort).await;

    let status = manager.status();
    assert!(status.peer_listener_running);
    assert!(!status.mcp_server_running);

    manager.kill_all().await;
    assert!(start.await.unwrap().is_err());
    assert!(!manager.status().peer_listener_running);
    drop(holder);
}

#[tokio::test]
async fn test_kill_all_clears_failure() {
    let manager = manager(Arc::new(RecordingTerminator::default()));
    let holder = std::net::TcpListener::bind(("0.0.0.0", manager.config().mcp.port)).unwrap();
    assert!(manager.start_all().await.is_err());
    assert_eq!(manager.state(), LifecycleState::Failed);
    drop(holder);

    manager.kill_all().await;

    let status = manager.status();
    assert_eq!(status.state, LifecycleState::Stopped);
    assert!(status.last_error.is_none());
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let manager = manager(Arc::new(RecordingTerminator::default()));
    manager.stop_all().await;
    manager.stop_peer_listener().await;
    manager.stop_mcp_server().await;
    assert_eq!(manager.state(), LifecycleState::Stopped);
}

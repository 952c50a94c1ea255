//! Port reclamation.
//!
//! Both listeners bind fixed, well-known ports. A previous instance that
//! crashed or was left running keeps those ports bound, so every start first
//! makes sure the port is bindable, terminating whatever holds it if needed.
//!
//! The algorithm is platform-agnostic; the OS-specific parts (probing a port
//! and finding/killing its holders) sit behind [`PortProbe`] and
//! [`ProcessTerminator`].
//!
//! ```text
//! probe ──free──▶ ok
//!   │
//!   held
//!   ▼
//! kill pass ─▶ wait/probe × N (1s,1s,1s,2s,2s,2s,3s,3s,3s,3s) ──free──▶ ok
//!                   │
//!                   still held
//!                   ▼
//!           final kill pass ─▶ wait 3s ─▶ probe ──free──▶ ok
//!                                           │
//!                                           ▼
//!                                        failure
//! ```

mod process;

pub use process::{parse_lsof_pids, parse_netstat_pids, SystemTerminator};

use std::io;
use std::net::{IpAddr, Ipv4Addr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::config::ReclaimConfig;

/// Checks whether a TCP port can currently be bound.
pub trait PortProbe: Send + Sync {
    /// Returns `true` if `port` is free.
    fn is_available(&self, port: u16) -> bool;
}

/// Probes by binding and immediately releasing a listener.
#[derive(Debug, Clone, Copy)]
pub struct TcpProbe {
    addr: IpAddr,
}

impl TcpProbe {
    /// Creates a probe that binds on `addr`.
    #[must_use]
    pub const fn new(addr: IpAddr) -> Self {
        Self { addr }
    }
}

impl Default for TcpProbe {
    /// Binds the unspecified address, which collides with a holder on any interface.
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }
}

impl PortProbe for TcpProbe {
    fn is_available(&self, port: u16) -> bool {
        TcpListener::bind((self.addr, port)).is_ok()
    }
}

/// Processes found on a port and the ones that were successfully terminated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KillReport {
    /// Process ids found holding the port.
    pub found: Vec<u32>,
    /// Process ids the termination signal was delivered to.
    pub killed: Vec<u32>,
}

/// Finds and forcefully terminates the processes bound to a port.
#[async_trait]
pub trait ProcessTerminator: Send + Sync {
    /// Terminates every process (other than this one) holding `port`.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform inspection facility could not be run.
    async fn find_and_kill_processes_on_port(&self, port: u16) -> io::Result<KillReport>;
}

/// Makes well-known ports bindable again.
#[derive(Clone)]
pub struct PortReclaimer {
    probe: Arc<dyn PortProbe>,
    terminator: Arc<dyn ProcessTerminator>,
    config: ReclaimConfig,
}

impl std::fmt::Debug for PortReclaimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortReclaimer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PortReclaimer {
    /// Creates a reclaimer backed by the host OS.
    #[must_use]
    pub fn new(config: ReclaimConfig) -> Self {
        Self::with_backends(
            config,
            Arc::new(TcpProbe::default()),
            Arc::new(SystemTerminator::new()),
        )
    }

    /// Creates a reclaimer with explicit probe and terminator backends.
    #[must_use]
    pub fn with_backends(
        config: ReclaimConfig,
        probe: Arc<dyn PortProbe>,
        terminator: Arc<dyn ProcessTerminator>,
    ) -> Self {
        Self {
            probe,
            terminator,
            config,
        }
    }

    /// Returns the reclamation schedule.
    #[must_use]
    pub const fn config(&self) -> &ReclaimConfig {
        &self.config
    }

    /// Returns `true` if `port` is bindable right now.
    #[must_use]
    pub fn is_available(&self, port: u16) -> bool {
        self.probe.is_available(port)
    }

    /// Ensures `port` is bindable, terminating its holders if necessary.
    ///
    /// Returns `false` once the whole schedule has been exhausted.
    pub async fn ensure_available(&self, port: u16) -> bool {
        info!(port, "Checking port availability");

        if self.probe.is_available(port) {
            info!(port, "Port is already available");
            return true;
        }

        info!(port, "Port is in use, attempting cleanup");
        self.kill_pass(port).await;

        let waits = self.config.waits();
        let max_attempts = waits.len();
        let mut waited = Duration::ZERO;

        for (index, wait) in waits.into_iter().enumerate() {
            let attempt = index + 1;
            info!(
                port,
                attempt,
                max_attempts,
                wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                "Waiting for port to be released"
            );
            pause(wait).await;
            waited += wait;

            if self.probe.is_available(port) {
                info!(
                    port,
                    waited_secs = waited.as_secs_f64(),
                    "Port released"
                );
                return true;
            }
            debug!(port, attempt, "Port still in use");
        }

        warn!(port, max_attempts, "Port not released, making final termination attempt");
        self.kill_pass(port).await;
        pause(Duration::from_millis(self.config.final_wait_ms)).await;

        if self.probe.is_available(port) {
            info!(port, "Port released after final termination attempt");
            return true;
        }

        error!(port, "Port remains unavailable despite all cleanup attempts");
        false
    }

    /// Runs one termination pass on `port` without any probing or retrying.
    ///
    /// Returns `false` if the platform backend itself failed.
    pub async fn terminate_holders(&self, port: u16) -> bool {
        match self.terminator.find_and_kill_processes_on_port(port).await {
            Ok(report) => {
                log_report(port, &report);
                true
            }
            Err(e) => {
                warn!(port, error = %e, "Failed to terminate processes on port");
                false
            }
        }
    }

    /// Terminates holders and gives the OS time to release the socket.
    async fn kill_pass(&self, port: u16) {
        match self.terminator.find_and_kill_processes_on_port(port).await {
            Ok(report) => {
                log_report(port, &report);
                if !report.killed.is_empty() {
                    pause(Duration::from_millis(self.config.settle_after_kill_ms)).await;
                }
            }
            Err(e) => {
                warn!(port, error = %e, "Failed to terminate processes on port");
            }
        }
    }
}

fn log_report(port: u16, report: &KillReport) {
    if report.found.is_empty() {
        info!(port, "No processes found using port");
    } else {
        info!(port, found = ?report.found, killed = ?report.killed, "Process termination completed");
    }
}

async fn pause(wait: Duration) {
    if !wait.is_zero() {
        tokio::time::sleep(wait).await;
    }
}

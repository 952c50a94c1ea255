//! Platform backends for finding and killing the processes that hold a port.
//!
//! - **Unix:** `lsof -nP -iTCP:<port> -sTCP:LISTEN -t`, then `kill -9 <pid>`
//! - **Windows:** `netstat -ano`, then `taskkill /PID <pid> /F`
//!
//! Only listening sockets are considered, so clients that merely have a
//! connection open to the port (the Figma desktop app, a browser) are left
//! alone. The current process is never targeted.

use std::collections::BTreeSet;
use std::io;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use super::{KillReport, ProcessTerminator};

/// Terminates port holders using the host OS's command-line tools.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTerminator;

impl SystemTerminator {
    /// Creates the terminator for the current platform.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessTerminator for SystemTerminator {
    async fn find_and_kill_processes_on_port(&self, port: u16) -> io::Result<KillReport> {
        info!(port, "Searching for processes using port");

        let own_pid = std::process::id();
        let found: Vec<u32> = find_listening_pids(port)
            .await?
            .into_iter()
            .filter(|pid| *pid != own_pid)
            .collect();

        let mut killed = Vec::with_capacity(found.len());
        for &pid in &found {
            info!(pid, port, "Killing process using port");
            match kill_pid(pid).await {
                Ok(true) => {
                    info!(pid, "Successfully killed process");
                    killed.push(pid);
                }
                Ok(false) => warn!(pid, "Failed to kill process"),
                Err(e) => warn!(pid, error = %e, "Failed to run kill command"),
            }
        }

        Ok(KillReport { found, killed })
    }
}

#[cfg(unix)]
async fn find_listening_pids(port: u16) -> io::Result<Vec<u32>> {
    let output = Command::new("lsof")
        .args(["-nP", &format!("-iTCP:{port}"), "-sTCP:LISTEN", "-t"])
        .output()
        .await?;

    // lsof exits non-zero when nothing matches
    if !output.status.success() {
        return Ok(Vec::new());
    }

    Ok(parse_lsof_pids(&String::from_utf8_lossy(&output.stdout)))
}

#[cfg(unix)]
async fn kill_pid(pid: u32) -> io::Result<bool> {
    let status = Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .await?;
    Ok(status.success())
}

#[cfg(windows)]
async fn find_listening_pids(port: u16) -> io::Result<Vec<u32>> {
    let output = Command::new("netstat").arg("-ano").output().await?;

    if !output.status.success() {
        return Ok(Vec::new());
    }

    Ok(parse_netstat_pids(
        &String::from_utf8_lossy(&output.stdout),
        port,
    ))
}

#[cfg(windows)]
async fn kill_pid(pid: u32) -> io::Result<bool> {
    let status = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F"])
        .status()
        .await?;
    Ok(status.success())
}

/// Parses the one-pid-per-line output of `lsof -t`.
#[must_use]
pub fn parse_lsof_pids(output: &str) -> Vec<u32> {
    output
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Extracts the pids of TCP sockets listening on `port` from `netstat -ano`.
///
/// Rows look like `TCP    0.0.0.0:3055    0.0.0.0:0    LISTENING    1234`.
/// Only the local address column is matched, so a remote port of the same
/// number is ignored.
#[must_use]
pub fn parse_netstat_pids(output: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{port}");

    output
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            let [proto, local, _remote, state, pid] = parts.as_slice() else {
                return None;
            };
            if !proto.eq_ignore_ascii_case("TCP") || !state.eq_ignore_ascii_case("LISTENING") {
                return None;
            }
            if !local.ends_with(&suffix) {
                return None;
            }
            pid.parse::<u32>().ok().filter(|pid| *pid != 0)
        })
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsof_output_is_deduplicated() {
        let output = "4123\n4123\n977\n\n";
        assert_eq!(parse_lsof_pids(output), vec![977, 4123]);
    }

    #[test]
    fn lsof_ignores_garbage_lines() {
        assert_eq!(parse_lsof_pids("lsof: WARNING\n12\n"), vec![12]);
        assert!(parse_lsof_pids("").is_empty());
    }

    #[test]
    fn netstat_matches_local_listening_rows_only() {
        let output = "
Active Connections

  Proto  Local Address          Foreign Address        State           PID
  TCP    0.0.0.0:3055           0.0.0.0:0              LISTENING       5512
  TCP    [::]:3055              [::]:0                 LISTENING       5512
  TCP    127.0.0.1:50123        127.0.0.1:3055         ESTABLISHED     7788
  TCP    127.0.0.1:3055         127.0.0.1:50123        ESTABLISHED     5512
  TCP    0.0.0.0:30550          0.0.0.0:0              LISTENING       9001
  UDP    0.0.0.0:3055           *:*                                    6000
";
        assert_eq!(parse_netstat_pids(output, 3055), vec![5512]);
    }

    #[test]
    fn netstat_without_match_is_empty() {
        let output = "  TCP    0.0.0.0:135    0.0.0.0:0    LISTENING    1060\n";
        assert!(parse_netstat_pids(output, 3056).is_empty());
    }
}

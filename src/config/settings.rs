//! Configuration structures for deserialisation.
//!
//! These structures map directly to the JSON configuration file format.
//! Every section is optional; omitted fields take the defaults the desktop
//! application has always shipped with (peer on 3055, MCP on 3056).

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Optional JSON schema reference (ignored during parsing).
    #[serde(rename = "$schema", default)]
    _schema: Option<String>,

    /// Optional comment field (ignored during parsing).
    #[serde(rename = "_comment", default)]
    _comment: Option<String>,

    /// Peer (Figma plugin) WebSocket listener.
    #[serde(default)]
    pub peer: PeerConfig,

    /// MCP HTTP/SSE front-end.
    #[serde(default)]
    pub mcp: McpConfig,

    /// Command relay settings.
    #[serde(default)]
    pub relay: RelayConfig,

    /// Port reclamation schedule.
    #[serde(default)]
    pub reclaim: ReclaimConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation checks fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.peer.port == 0 || self.mcp.port == 0 {
            return Err(ConfigError::ValidationError {
                message: "ports must be non-zero".to_string(),
            });
        }
        if self.peer.port == self.mcp.port {
            return Err(ConfigError::ValidationError {
                message: format!(
                    "peer and mcp ports must differ (both are {})",
                    self.peer.port
                ),
            });
        }
        if self.relay.command_timeout_secs == 0 {
            return Err(ConfigError::ValidationError {
                message: "relay.command_timeout_secs must be greater than zero".to_string(),
            });
        }
        if self.reclaim.backoff.iter().all(|tier| tier.attempts == 0) {
            return Err(ConfigError::ValidationError {
                message: "reclaim.backoff must contain at least one attempt".to_string(),
            });
        }
        Ok(())
    }
}

/// Peer WebSocket listener configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerConfig {
    /// Interface to bind.
    #[serde(default = "default_host")]
    pub host: String,

    /// Well-known port the Figma plugin connects to.
    #[serde(default = "default_peer_port")]
    pub port: u16,

    /// Largest inbound frame accepted from the peer, in bytes.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_peer_port(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

/// MCP front-end configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct McpConfig {
    /// Interface to bind.
    #[serde(default = "default_host")]
    pub host: String,

    /// Well-known port MCP clients connect to (`http://host:port/sse`).
    #[serde(default = "default_mcp_port")]
    pub port: u16,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_mcp_port(),
        }
    }
}

/// Command relay configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    /// How long a tool call waits for the plugin's reply.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl RelayConfig {
    /// Returns the command timeout as a [`Duration`].
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

/// One tier of the reclamation backoff: `attempts` probes, each preceded by
/// a `wait_ms` sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffTier {
    /// Number of probes in this tier.
    pub attempts: u32,
    /// Wait before each probe, in milliseconds.
    pub wait_ms: u64,
}

/// Port reclamation configuration.
///
/// The defaults (3×1s, 3×2s, 4×3s, then a final 3s wait) are empirical.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReclaimConfig {
    /// Progressive backoff tiers, in order.
    #[serde(default = "default_backoff")]
    pub backoff: Vec<BackoffTier>,

    /// Wait after the final forced termination pass.
    #[serde(default = "default_final_wait_ms")]
    pub final_wait_ms: u64,

    /// Pause after a termination pass that killed at least one process.
    #[serde(default = "default_settle_after_kill_ms")]
    pub settle_after_kill_ms: u64,

    /// Pause after kill-all before the state is reset.
    #[serde(default = "default_kill_all_release_ms")]
    pub kill_all_release_ms: u64,
}

impl ReclaimConfig {
    /// Expands the tiers into the per-attempt wait sequence.
    #[must_use]
    pub fn waits(&self) -> Vec<Duration> {
        self.backoff
            .iter()
            .flat_map(|tier| {
                std::iter::repeat(Duration::from_millis(tier.wait_ms)).take(tier.attempts as usize)
            })
            .collect()
    }

    /// A schedule with no waits at all, for tests.
    #[must_use]
    pub fn immediate(attempts: u32) -> Self {
        Self {
            backoff: vec![BackoffTier {
                attempts,
                wait_ms: 0,
            }],
            final_wait_ms: 0,
            settle_after_kill_ms: 0,
            kill_all_release_ms: 0,
        }
    }
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            backoff: default_backoff(),
            final_wait_ms: default_final_wait_ms(),
            settle_after_kill_ms: default_settle_after_kill_ms(),
            kill_all_release_ms: default_kill_all_release_ms(),
        }
    }
}

fn default_backoff() -> Vec<BackoffTier> {
    vec![
        BackoffTier {
            attempts: 3,
            wait_ms: 1000,
        },
        BackoffTier {
            attempts: 3,
            wait_ms: 2000,
        },
        BackoffTier {
            attempts: 4,
            wait_ms: 3000,
        },
    ]
}

const fn default_final_wait_ms() -> u64 {
    3000
}

const fn default_settle_after_kill_ms() -> u64 {
    1500
}

const fn default_kill_all_release_ms() -> u64 {
    2000
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_peer_port() -> u16 {
    3055
}

const fn default_mcp_port() -> u16 {
    3056
}

const fn default_max_message_bytes() -> usize {
    16 * 1024 * 1024
}

const fn default_command_timeout_secs() -> u64 {
    30
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.peer.port, 3055);
        assert_eq!(config.mcp.port, 3056);
        assert_eq!(config.relay.command_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn parse_full_config() {
        let json = r#"{
            "$schema": "https://json-schema.org/draft/2020-12/schema",
            "_comment": "Test config",
            "peer": { "host": "0.0.0.0", "port": 4055, "max_message_bytes": 1024 },
            "mcp": { "host": "0.0.0.0", "port": 4056 },
            "relay": { "command_timeout_secs": 5 },
            "reclaim": {
                "backoff": [{ "attempts": 2, "wait_ms": 250 }],
                "final_wait_ms": 500,
                "settle_after_kill_ms": 100,
                "kill_all_release_ms": 0
            },
            "logging": { "level": "debug" }
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.peer.host, "0.0.0.0");
        assert_eq!(config.peer.port, 4055);
        assert_eq!(config.peer.max_message_bytes, 1024);
        assert_eq!(config.mcp.port, 4056);
        assert_eq!(config.relay.command_timeout_secs, 5);
        assert_eq!(
            config.reclaim.waits(),
            vec![Duration::from_millis(250), Duration::from_millis(250)]
        );
        assert_eq!(config.reclaim.final_wait_ms, 500);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn default_backoff_is_three_tiers_of_ten_attempts() {
        let waits = ReclaimConfig::default().waits();
        assert_eq!(waits.len(), 10);
        assert_eq!(waits[0], Duration::from_secs(1));
        assert_eq!(waits[2], Duration::from_secs(1));
        assert_eq!(waits[3], Duration::from_secs(2));
        assert_eq!(waits[5], Duration::from_secs(2));
        assert_eq!(waits[6], Duration::from_secs(3));
        assert_eq!(waits[9], Duration::from_secs(3));
        assert_eq!(waits.iter().sum::<Duration>(), Duration::from_secs(21));
    }

    #[test]
    fn reject_identical_ports() {
        let json = r#"{ "peer": { "port": 4000 }, "mcp": { "port": 4000 } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn reject_zero_timeout() {
        let json = r#"{ "relay": { "command_timeout_secs": 0 } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn reject_empty_backoff() {
        let json = r#"{ "reclaim": { "backoff": [] } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn reject_unknown_fields() {
        let result: Result<Config, _> = serde_json::from_str(r#"{ "unknown_field": 1 }"#);
        assert!(result.is_err());
    }
}

//! Error types for figma-relay-mcp.
//!
//! Every failure mode of the relay and of port reclamation is a distinct
//! variant so callers can tell a timeout from a dropped peer from a refused
//! port without inspecting message text.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read configuration file: {path}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be parsed.
    #[error("failed to parse configuration file: {path}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Configuration file not found.
    #[error("configuration file not found: {path}")]
    NotFound {
        /// Path where the configuration file was expected.
        path: PathBuf,
    },

    /// Configuration validation failed.
    #[error("configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation failure.
        message: String,
    },
}

/// Outcome of a relayed command that did not produce a result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// No reply arrived within the allotted window.
    #[error("command '{command}' timed out after {}s", timeout.as_secs_f64())]
    Timeout {
        /// The command that was sent.
        command: String,
        /// The window that elapsed.
        timeout: Duration,
    },

    /// No peer was connected, or the peer went away while the command was pending.
    #[error("Figma plugin is not connected")]
    PeerDisconnected,

    /// The peer answered with an explicit error payload.
    #[error("{0}")]
    PeerError(String),
}

/// Failure to hand a frame to the active peer.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// There is no active peer connection.
    #[error("no active peer connection")]
    NotConnected,
}

/// Tool arguments that do not match the tool's declared input schema.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The arguments value was not a JSON object.
    #[error("tool arguments must be an object")]
    NotAnObject,

    /// A required parameter is absent.
    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    /// A parameter is present but has the wrong shape.
    #[error("Parameter '{name}' must be {expected}")]
    WrongType {
        /// Parameter name.
        name: String,
        /// Human-readable description of the expected type.
        expected: &'static str,
    },
}

/// Errors raised while building the tool catalogue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A tool with this name is already registered.
    #[error("tool '{0}' is already registered")]
    DuplicateTool(String),
}

/// Errors raised while starting or stopping the two listeners.
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// Reclamation exhausted its schedule and the port is still held.
    #[error("port {port} is unavailable")]
    PortUnavailable {
        /// The port that could not be reclaimed.
        port: u16,
    },

    /// The port was reported free but binding it failed anyway.
    #[error("failed to bind port {port}")]
    Bind {
        /// The port that could not be bound.
        port: u16,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Kill-all interrupted the start while it was reclaiming the port.
    #[error("start on port {port} was interrupted by kill-all")]
    Interrupted {
        /// The port being reclaimed.
        port: u16,
    },
}

impl LifecycleError {
    /// Returns the port the failure refers to.
    #[must_use]
    pub const fn port(&self) -> u16 {
        match self {
            Self::PortUnavailable { port }
            | Self::Bind { port, .. }
            | Self::Interrupted { port } => *port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let error = ConfigError::NotFound {
            path: PathBuf::from("/path/to/config.json"),
        };
        let msg = error.to_string();
        assert!(msg.contains("not found"));
        assert!(msg.contains("config.json"));
    }

    #[test]
    fn timeout_names_command_and_window() {
        let error = RelayError::Timeout {
            command: "get_selection".to_string(),
            timeout: Duration::from_secs(30),
        };
        let msg = error.to_string();
        assert!(msg.contains("get_selection"));
        assert!(msg.contains("30s"));
    }

    #[test]
    fn peer_error_is_verbatim() {
        let error = RelayError::PeerError("Node not found: 1:23".to_string());
        assert_eq!(error.to_string(), "Node not found: 1:23");
    }

    #[test]
    fn lifecycle_error_reports_port() {
        let error = LifecycleError::PortUnavailable { port: 3056 };
        assert_eq!(error.port(), 3056);
        assert!(error.to_string().contains("3056"));
    }
}

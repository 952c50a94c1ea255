//! figma-relay-mcp: MCP server that drives the Figma plugin over a WebSocket
//!
//! This library exposes Figma document operations as MCP tools. The tools do
//! no work themselves: each call is forwarded to the Figma plugin over its
//! WebSocket connection and the plugin's reply becomes the tool result.
//!
//! # Architecture
//!
//! - **Peer listener**: WebSocket server the Figma plugin connects to
//! - **Relay**: correlates outbound commands with inbound replies
//! - **MCP front-end**: HTTP+SSE server exposing the tool catalogue
//! - **Reclamation**: frees the fixed ports from stale processes before binding
//! - **Lifecycle**: starts and stops the two listeners in order
//!
//! # Modules
//!
//! - [`config`]: Configuration loading and validation
//! - [`error`]: Error types
//! - [`lifecycle`]: Start/stop orchestration
//! - [`listener`]: Running listeners and the peer socket
//! - [`mcp`]: MCP protocol implementation
//! - [`reclaim`]: Port reclamation
//! - [`relay`]: Command correlation

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod listener;
pub mod mcp;
pub mod reclaim;
pub mod relay;

pub use lifecycle::{LifecycleState, LifecycleStatus, ServerLifecycleManager};

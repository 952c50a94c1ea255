//! Model Context Protocol (MCP) server implementation.
//!
//! This module exposes Figma document operations as MCP tools. Clients talk
//! JSON-RPC 2.0 over an HTTP+SSE transport; each tool call is relayed to the
//! Figma plugin and its reply returned as the tool result.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         MCP Server                          │
//! │                                                             │
//! │   ┌─────────────┐    ┌─────────────┐    ┌─────────────┐    │
//! │   │  Transport  │───▶│   Server    │───▶│   Tools     │    │
//! │   │ (HTTP+SSE)  │    │  (sessions) │    │  (registry) │    │
//! │   └─────────────┘    └─────────────┘    └─────────────┘    │
//! │          │                                     │            │
//! │          ▼                                     ▼            │
//! │   ┌──────────────────┐            ┌─────────────────────┐  │
//! │   │ JSON-RPC Messages│            │  CommandDispatcher  │  │
//! │   └──────────────────┘            └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Protocol Version
//!
//! This implementation targets MCP protocol version 2024-11-05.

pub mod document;
pub mod protocol;
pub mod server;
pub mod tools;
pub mod transport;

use std::sync::Arc;

pub use protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, OutgoingMessage, MCP_PROTOCOL_VERSION};
pub use server::{McpServer, McpSession};
pub use tools::{ToolCallResult, ToolRegistry};

use crate::error::RegistryError;
use crate::relay::CommandDispatcher;

/// Builds the server with the full tool catalogue.
///
/// # Errors
///
/// Returns an error if two tools share a name.
pub fn build_server(dispatcher: Arc<CommandDispatcher>) -> Result<McpServer, RegistryError> {
    let mut tools = ToolRegistry::new();
    document::register_document_tools(&mut tools)?;
    tracing::debug!(count = tools.len(), "Registered tools");
    Ok(McpServer::new(Arc::new(tools), dispatcher))
}

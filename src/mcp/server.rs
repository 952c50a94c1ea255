//! MCP server implementation for the Figma relay.
//!
//! This module implements the MCP server lifecycle for each client session:
//!
//! 1. **Initialisation**: Capability negotiation and version agreement
//! 2. **Operation**: Handling tool calls and other requests
//! 3. **Shutdown**: The session ends when its event stream closes
//!
//! # Architecture
//!
//! The server holds no Figma state. Every tool call is validated against the
//! tool's schema and relayed to the plugin by the shared
//! [`CommandDispatcher`]; the plugin does the work.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use super::protocol::{
    ErrorCode, IncomingMessage, JsonRpcError, JsonRpcErrorData, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, OutgoingMessage, RequestId, MCP_PROTOCOL_VERSION,
    SERVER_NAME,
};
use super::tools::ToolRegistry;
use crate::relay::CommandDispatcher;

/// Session state in the MCP lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Waiting for initialize request.
    AwaitingInit,
    /// Initialize received, waiting for initialized notification.
    Initialising,
    /// Ready for normal operation.
    Running,
    /// Session is closing.
    ShuttingDown,
}

/// Server capabilities advertised during initialisation.
#[derive(Debug, Clone, Serialize)]
pub struct ServerCapabilities {
    /// Tool-related capabilities.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolCapabilities>,
}

impl Default for ServerCapabilities {
    fn default() -> Self {
        Self {
            tools: Some(ToolCapabilities::default()),
        }
    }
}

/// Tool-specific capabilities.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolCapabilities {
    /// Whether the tool list can change during the session.
    #[serde(rename = "listChanged", skip_serializing_if = "is_false")]
    pub list_changed: bool,
}

#[allow(clippy::trivially_copy_pass_by_ref)] // serde's skip_serializing_if requires a predicate fn(&T) -> bool, so we must take &bool here
const fn is_false(b: &bool) -> bool {
    !*b
}

/// Server information for initialisation response.
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    /// Server name.
    pub name: String,
    /// Server version.
    pub version: String,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            name: SERVER_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Client information received during initialisation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    /// Client name.
    pub name: String,
    /// Client version.
    #[serde(default)]
    pub version: Option<String>,
}

/// Parameters for the initialize request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// Protocol version requested by client.
    pub protocol_version: String,
    /// Client capabilities.
    #[serde(default)]
    pub capabilities: Value,
    /// Client information.
    #[serde(default)]
    pub client_info: Option<ClientInfo>,
}

/// Parameters for tools/call request.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallParams {
    /// Name of the tool to call.
    pub name: String,
    /// Arguments for the tool.
    #[serde(default)]
    pub arguments: Value,
}

/// Per-client protocol state.
#[derive(Debug)]
pub struct McpSession {
    id: Uuid,
    state: Mutex<ServerState>,
    protocol_version: Mutex<Option<String>>,
}

impl McpSession {
    /// Creates a session awaiting `initialize`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: Mutex::new(ServerState::AwaitingInit),
            protocol_version: Mutex::new(None),
        }
    }

    /// Session identifier used in the message endpoint URL.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the current session state.
    #[must_use]
    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    /// Negotiated protocol version, once initialised.
    #[must_use]
    pub fn protocol_version(&self) -> Option<String> {
        self.protocol_version.lock().clone()
    }

    /// Marks the session as closing.
    pub fn close(&self) {
        *self.state.lock() = ServerState::ShuttingDown;
    }
}

impl Default for McpSession {
    fn default() -> Self {
        Self::new()
    }
}

/// The MCP server shared by all sessions.
#[derive(Debug)]
pub struct McpServer {
    /// Tools exposed to clients.
    tools: Arc<ToolRegistry>,
    /// Relay to the Figma plugin.
    dispatcher: Arc<CommandDispatcher>,
}

impl McpServer {
    /// Creates a server exposing `tools` over `dispatcher`.
    #[must_use]
    pub const fn new(tools: Arc<ToolRegistry>, dispatcher: Arc<CommandDispatcher>) -> Self {
        Self { tools, dispatcher }
    }

    /// The relay this server calls through.
    #[must_use]
    pub const fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    /// The registered tools.
    #[must_use]
    pub const fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// Whether handling `msg` waits on the Figma plugin.
    #[must_use]
    pub fn is_relayed(msg: &IncomingMessage) -> bool {
        matches!(msg, IncomingMessage::Request(req) if req.method == "tools/call")
    }

    /// Handles a parsed incoming message.
    ///
    /// Returns the reply to push to the client, or `None` for notifications.
    pub async fn handle_message(
        &self,
        session: &McpSession,
        msg: IncomingMessage,
    ) -> Option<OutgoingMessage> {
        match msg {
            IncomingMessage::Request(req) => Some(self.handle_request(session, req).await),
            IncomingMessage::Notification(ref notif) => {
                Self::handle_notification(session, notif);
                None
            }
        }
    }

    /// Handles an incoming request.
    async fn handle_request(&self, session: &McpSession, req: JsonRpcRequest) -> OutgoingMessage {
        tracing::debug!(session = %session.id(), id = %req.id, method = %req.method, "Request");

        let response = match req.method.as_str() {
            "initialize" => Self::handle_initialize(session, &req),
            "tools/list" => self.handle_tools_list(session, &req),
            "tools/call" => self.handle_tools_call(session, &req).await,
            "ping" => Ok(Self::handle_ping(&req)),
            _ => Err(JsonRpcError::method_not_found(req.id.clone(), &req.method)),
        };

        response.into()
    }

    /// Handles an incoming notification.
    fn handle_notification(session: &McpSession, notif: &JsonRpcNotification) {
        if notif.method == "notifications/initialized" {
            let mut state = session.state.lock();
            if *state == ServerState::Initialising {
                *state = ServerState::Running;
                tracing::info!(session = %session.id(), "Session initialised");
            }
        }
    }

    /// Handles the initialize request.
    fn handle_initialize(
        session: &McpSession,
        req: &JsonRpcRequest,
    ) -> Result<JsonRpcResponse, JsonRpcError> {
        let params: InitializeParams = req.params_as("initialize")?;

        {
            let mut state = session.state.lock();
            if *state != ServerState::AwaitingInit {
                return Err(JsonRpcError::new(
                    Some(req.id.clone()),
                    JsonRpcErrorData::with_message(
                        ErrorCode::InvalidRequest,
                        "Server already initialised",
                    ),
                ));
            }
            *state = ServerState::Initialising;
        }

        if params.protocol_version != MCP_PROTOCOL_VERSION {
            tracing::debug!(
                requested = %params.protocol_version,
                offered = MCP_PROTOCOL_VERSION,
                "Client requested a different protocol version"
            );
        }
        if let Some(client) = &params.client_info {
            tracing::info!(client = %client.name, version = ?client.version, "Client connected");
        }

        let negotiated_version = MCP_PROTOCOL_VERSION.to_string();
        *session.protocol_version.lock() = Some(negotiated_version.clone());

        let result = json!({
            "protocolVersion": negotiated_version,
            "capabilities": ServerCapabilities::default(),
            "serverInfo": ServerInfo::default(),
        });

        Ok(JsonRpcResponse::success(req.id.clone(), result))
    }

    /// Handles the tools/list request.
    fn handle_tools_list(
        &self,
        session: &McpSession,
        req: &JsonRpcRequest,
    ) -> Result<JsonRpcResponse, JsonRpcError> {
        Self::require_running(session, &req.id)?;

        let result = json!({
            "tools": self.tools.listings(),
        });

        Ok(JsonRpcResponse::success(req.id.clone(), result))
    }

    /// Handles the tools/call request.
    async fn handle_tools_call(
        &self,
        session: &McpSession,
        req: &JsonRpcRequest,
    ) -> Result<JsonRpcResponse, JsonRpcError> {
        Self::require_running(session, &req.id)?;

        let params: ToolCallParams = req.params_as("tool call")?;

        let result = self
            .tools
            .call(&params.name, &params.arguments, &self.dispatcher)
            .await;

        let result_value = serde_json::to_value(&result).map_err(|e| {
            tracing::error!(error = %e, "Failed to serialise tool call result");
            JsonRpcError::internal_error(
                req.id.clone(),
                "Internal error: failed to serialise result",
            )
        })?;

        Ok(JsonRpcResponse::success(req.id.clone(), result_value))
    }

    /// Handles the ping request.
    fn handle_ping(req: &JsonRpcRequest) -> JsonRpcResponse {
        JsonRpcResponse::success(req.id.clone(), json!({}))
    }

    /// Ensures the session is in the Running state.
    fn require_running(session: &McpSession, id: &RequestId) -> Result<(), JsonRpcError> {
        if session.state() != ServerState::Running {
            return Err(JsonRpcError::new(
                Some(id.clone()),
                JsonRpcErrorData::with_message(ErrorCode::InvalidRequest, "Server not initialised"),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::mcp::document::register_document_tools;
    use crate::mcp::protocol::parse_message;
    use crate::relay::PeerConnectionRegistry;

    fn server() -> McpServer {
        let mut tools = ToolRegistry::new();
        register_document_tools(&mut tools).unwrap();
        let dispatcher = CommandDispatcher::new(
            Arc::new(PeerConnectionRegistry::new()),
            Duration::from_secs(30),
        );
        McpServer::new(Arc::new(tools), Arc::new(dispatcher))
    }

    async fn send(server: &McpServer, session: &McpSession, json: &str) -> Option<Value> {
        let msg = parse_message(json).unwrap();
        server
            .handle_message(session, msg)
            .await
            .map(|out| serde_json::to_value(out).unwrap())
    }

    async fn initialise(server: &McpServer, session: &McpSession) {
        send(
            server,
            session,
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2024-11-05","capabilities":{},"clientInfo":{"name":"test"}}}"#,
        )
        .await
        .unwrap();
        assert!(send(server, session, r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .await
            .is_none());
    }

    #[test]
    fn session_initial_state() {
        let session = McpSession::new();
        assert_eq!(session.state(), ServerState::AwaitingInit);
        assert!(session.protocol_version().is_none());
    }

    #[tokio::test]
    async fn initialize_negotiates_version() {
        let server = server();
        let session = McpSession::new();

        let reply = send(
            &server,
            &session,
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2024-11-05"}}"#,
        )
        .await
        .unwrap();

        assert_eq!(reply["result"]["protocolVersion"], MCP_PROTOCOL_VERSION);
        assert_eq!(reply["result"]["serverInfo"]["name"], SERVER_NAME);
        assert_eq!(session.state(), ServerState::Initialising);
    }

    #[tokio::test]
    async fn second_initialize_is_rejected() {
        let server = server();
        let session = McpSession::new();
        initialise(&server, &session).await;

        let reply = send(
            &server,
            &session,
            r#"{"jsonrpc":"2.0","id":2,"method":"initialize","params":{"protocolVersion":"2024-11-05"}}"#,
        )
        .await
        .unwrap();
        assert_eq!(reply["error"]["code"], ErrorCode::InvalidRequest.code());
    }

    #[tokio::test]
    async fn tools_list_requires_initialisation() {
        let server = server();
        let session = McpSession::new();

        let reply = send(&server, &session, r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#)
            .await
            .unwrap();
        assert_eq!(reply["error"]["message"], "Server not initialised");

        initialise(&server, &session).await;
        let reply = send(&server, &session, r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#)
            .await
            .unwrap();
        assert_eq!(reply["result"]["tools"].as_array().unwrap().len(), 5);
    }

    #[test]
    fn only_tool_calls_are_relayed() {
        let relayed = |json: &str| McpServer::is_relayed(&parse_message(json).unwrap());

        assert!(relayed(r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"get_selection"}}"#));
        assert!(!relayed(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#));
        assert!(!relayed(r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2024-11-05"}}"#));
        assert!(!relayed(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#));
    }

    #[tokio::test]
    async fn unknown_method_is_not_found() {
        let server = server();
        let session = McpSession::new();
        let reply = send(&server, &session, r#"{"jsonrpc":"2.0","id":9,"method":"resources/list"}"#)
            .await
            .unwrap();
        assert_eq!(reply["error"]["code"], ErrorCode::MethodNotFound.code());
        assert_eq!(reply["id"], 9);
    }

    #[tokio::test]
    async fn tools_call_relays_to_peer() {
        let server = Arc::new(server());
        let session = Arc::new(McpSession::new());
        initialise(&server, &session).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        server.dispatcher().attach_peer(tx);

        let call = tokio::spawn({
            let server = server.clone();
            let session = session.clone();
            async move {
                send(
                    &server,
                    &session,
                    r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"get_node_info","arguments":{"nodeId":"1:2"}}}"#,
                )
                .await
            }
        });

        let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["command"], "get_node_info");
        assert_eq!(frame["params"], json!({"nodeId": "1:2"}));
        server
            .dispatcher()
            .handle_inbound(&json!({"id": frame["id"], "result": {"name": "Frame"}}).to_string());

        let reply = call.await.unwrap().unwrap();
        assert_eq!(
            reply["result"]["content"][0]["text"],
            r#"Retrieved detailed information for node: {"name":"Frame"}"#
        );
        assert!(reply["result"].get("isError").is_none());
    }

    #[tokio::test]
    async fn tools_call_without_peer_is_error_result() {
        let server = server();
        let session = McpSession::new();
        initialise(&server, &session).await;

        let reply = send(
            &server,
            &session,
            r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"get_selection"}}"#,
        )
        .await
        .unwrap();

        assert_eq!(reply["result"]["isError"], true);
        assert_eq!(
            reply["result"]["content"][0]["text"],
            "Error getting selection: Figma plugin is not connected"
        );
    }
}

//! HTTP+SSE transport for MCP communication.
//!
//! A client opens `GET /sse` and receives an `endpoint` event naming its
//! message URL (`/messages?sessionId=<uuid>`). It then POSTs one JSON-RPC
//! message per request to that URL; replies are pushed back on the event
//! stream as `message` events. The POST acknowledges with `202 Accepted`
//! once the message has been applied to the session; only `tools/call` is
//! still running at that point, so slow relays never hold an HTTP request
//! open and their replies arrive in completion order.

use std::convert::Infallible;
use std::io;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::protocol::{parse_message, IncomingMessage, OutgoingMessage};
use super::server::{McpServer, McpSession};
use crate::listener::{spawn_router, wait_for_shutdown, ListenerHandle, ShutdownSignal};

/// Path of the event stream.
pub const SSE_PATH: &str = "/sse";

/// Path clients POST messages to.
pub const MESSAGES_PATH: &str = "/messages";

/// Path of the status endpoint.
pub const HEALTH_PATH: &str = "/health";

struct SessionEntry {
    session: Arc<McpSession>,
    outbound: mpsc::UnboundedSender<OutgoingMessage>,
}

type Sessions = Arc<DashMap<Uuid, SessionEntry>>;

#[derive(Clone)]
struct McpState {
    server: Arc<McpServer>,
    sessions: Sessions,
    shutdown: ShutdownSignal,
}

/// Removes a session once its event stream is dropped.
struct SessionGuard {
    id: Uuid,
    sessions: Sessions,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some((_, entry)) = self.sessions.remove(&self.id) {
            entry.session.close();
            debug!(session = %self.id, "Session closed");
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageQuery {
    session_id: Uuid,
}

/// Starts the MCP front-end on an already-bound listener.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub fn serve(listener: TcpListener, server: Arc<McpServer>) -> io::Result<ListenerHandle> {
    spawn_router("mcp", listener, move |shutdown| {
        Router::new()
            .route(SSE_PATH, get(open_stream))
            .route(MESSAGES_PATH, post(post_message))
            .route(HEALTH_PATH, get(health))
            .with_state(McpState {
                server,
                sessions: Arc::new(DashMap::new()),
                shutdown,
            })
    })
}

async fn open_stream(
    State(state): State<McpState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let session = Arc::new(McpSession::new());
    let id = session.id();
    let (outbound, queue) = mpsc::unbounded_channel();
    state.sessions.insert(id, SessionEntry { session, outbound });
    info!(session = %id, "MCP client connected");

    let guard = SessionGuard {
        id,
        sessions: state.sessions.clone(),
    };
    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("{MESSAGES_PATH}?sessionId={id}"));
    let shutdown = Box::pin(wait_for_shutdown(state.shutdown.clone()));

    let replies = stream::unfold(
        (queue, shutdown, guard),
        |(mut queue, mut shutdown, guard)| async move {
            tokio::select! {
                message = queue.recv() => {
                    let message = message?;
                    Some((Ok(message_event(&message)), (queue, shutdown, guard)))
                }
                () = &mut shutdown => None,
            }
        },
    );

    Sse::new(stream::once(async move { Ok(endpoint) }).chain(replies))
        .keep_alive(KeepAlive::default())
}

fn message_event(message: &OutgoingMessage) -> Event {
    match serde_json::to_string(message) {
        Ok(text) => Event::default().event("message").data(text),
        Err(e) => {
            warn!(error = %e, "Failed to serialise outgoing message");
            Event::default().comment("dropped unserialisable message")
        }
    }
}

async fn post_message(
    State(state): State<McpState>,
    Query(query): Query<MessageQuery>,
    body: String,
) -> StatusCode {
    let Some((session, outbound)) = state
        .sessions
        .get(&query.session_id)
        .map(|entry| (entry.session.clone(), entry.outbound.clone()))
    else {
        debug!(session = %query.session_id, "Message for unknown session");
        return StatusCode::NOT_FOUND;
    };

    let message = match parse_message(&body) {
        Ok(message) => message,
        Err(error) => {
            let _ = outbound.send(error.into());
            return StatusCode::BAD_REQUEST;
        }
    };

    // Everything except tool calls changes or reads session state, so it is
    // handled before the POST is acknowledged. Tool calls wait on the plugin
    // and run concurrently.
    if McpServer::is_relayed(&message) {
        let server = state.server.clone();
        tokio::spawn(async move { deliver(&server, &session, message, &outbound).await });
    } else {
        deliver(&state.server, &session, message, &outbound).await;
    }

    StatusCode::ACCEPTED
}

async fn deliver(
    server: &McpServer,
    session: &McpSession,
    message: IncomingMessage,
    outbound: &mpsc::UnboundedSender<OutgoingMessage>,
) {
    if let Some(reply) = server.handle_message(session, message).await {
        if outbound.send(reply).is_err() {
            debug!(session = %session.id(), "Session closed before reply was delivered");
        }
    }
}

async fn health(State(state): State<McpState>) -> impl IntoResponse {
    let dispatcher = state.server.dispatcher();
    Json(json!({
        "peerConnected": dispatcher.peers().is_active(),
        "pendingCommands": dispatcher.pending_count(),
        "sessions": state.sessions.len(),
        "stats": dispatcher.stats(),
    }))
}

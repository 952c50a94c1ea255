//! WebSocket listener the Figma plugin connects to.
//!
//! Each accepted socket becomes the active peer. One task per connection
//! owns the socket: it drains the connection's outbound queue (command
//! frames from the dispatcher) and feeds every inbound text message to
//! [`CommandDispatcher::handle_inbound`]. Writes are therefore serialized by
//! that single task.

use std::io;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{spawn_router, wait_for_shutdown, ListenerHandle, ShutdownSignal};
use crate::relay::CommandDispatcher;

#[derive(Clone)]
struct PeerState {
    dispatcher: Arc<CommandDispatcher>,
    max_message_bytes: usize,
    shutdown: ShutdownSignal,
}

/// Starts serving peer connections on an already-bound listener.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub fn serve(
    listener: TcpListener,
    dispatcher: Arc<CommandDispatcher>,
    max_message_bytes: usize,
) -> io::Result<ListenerHandle> {
    spawn_router("peer", listener, move |shutdown| {
        Router::new()
            .route("/", get(upgrade))
            .with_state(PeerState {
                dispatcher,
                max_message_bytes,
                shutdown,
            })
    })
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<PeerState>) -> impl IntoResponse {
    ws.max_message_size(state.max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: PeerState) {
    let (mut sink, mut stream) = socket.split();
    let (outbound, mut queue) = mpsc::unbounded_channel::<String>();
    let peer_id = state.dispatcher.attach_peer(outbound);

    let shutdown = wait_for_shutdown(state.shutdown.clone());
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            frame = queue.recv() => {
                let Some(frame) = frame else {
                    debug!(peer_id, "Peer replaced, closing connection");
                    break;
                };
                if let Err(e) = sink.send(Message::Text(frame)).await {
                    warn!(peer_id, error = %e, "Failed to send frame to peer");
                    break;
                }
            }

            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => state.dispatcher.handle_inbound(&text),
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => state.dispatcher.handle_inbound(&text),
                        Err(_) => warn!(peer_id, "Ignoring non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(peer_id, "Peer closed the connection");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(peer_id, error = %e, "Peer socket error");
                        break;
                    }
                }
            }

            () = &mut shutdown => {
                info!(peer_id, "Listener stopping, closing peer connection");
                break;
            }
        }
    }

    let _ = sink.close().await;
    state.dispatcher.detach_peer(peer_id);
}

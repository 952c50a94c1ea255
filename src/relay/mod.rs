//! Command relay between MCP tool calls and the Figma plugin.
//!
//! # Architecture
//!
//! ```text
//!  tool call ──▶ CommandDispatcher::invoke ──▶ PendingCommands (id → oneshot)
//!                        │                              ▲
//!                        ▼                              │ complete / time_out / fail_peer
//!              PeerConnectionRegistry::send      handle_inbound
//!                        │                              ▲
//!                        ▼                              │
//!                 ┌─────────────────── peer socket ─────┴──┐
//!                 │        { id, command, params }  ▶      │
//!                 │   ◀    { id, result } | { id, error }  │
//!                 └────────────────────────────────────────┘
//! ```

mod correlation;
mod dispatcher;
pub mod frame;
mod peer;
mod pending;

pub use correlation::CorrelationId;
pub use dispatcher::CommandDispatcher;
pub use peer::{Connected, PeerConnectionRegistry, PeerId, PeerSender};
pub use pending::{Outcome, PendingCommands, RelayStats};

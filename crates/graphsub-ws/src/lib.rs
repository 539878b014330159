//! GraphQL subscription transport over WebSocket.
//!
//! This crate carries GraphQL subscription traffic over a single WebSocket
//! connection, multiplexing any number of concurrently running subscription
//! streams and tearing each down correctly on client cancel, server error or
//! socket closure.
//!
//! # Dialects
//!
//! Two incompatible wire protocols are spoken, selected per connection from
//! the negotiated subprotocol:
//!
//! | Subprotocol | Dialect | Liveness |
//! |---|---|---|
//! | `graphql-ws` (or none) | legacy | server `ka` keep-alives |
//! | `graphql-transport-ws` | modern | ping/pong with a 2x read deadline |
//!
//! The connection state machine only ever sees semantic
//! [`MessageKind`](protocol::MessageKind)s; the codec in [`protocol`] owns
//! the wire tokens of both dialects.
//!
//! # Flow
//!
//! ```text
//! HTTP request ──► supports() ──► handle_upgrade() ──► 101 + subprotocol
//!                                                          │
//!                                                          ▼
//!                         serve(io, subprotocol, service) ──► init handshake
//!                                                          │
//!                                                          ▼
//!                         read loop ──► start/stop/ping/pong dispatch
//!                              │
//!                              ▼
//!                         one task per subscription ──► data/error/complete
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use graphsub_ws::Websocket;
//!
//! let transport = Websocket::new()
//!     .init_timeout(Duration::from_secs(10))
//!     .keep_alive_interval(Duration::from_secs(25))
//!     .ping_pong_interval(Duration::from_secs(25));
//!
//! // In the HTTP handler:
//! if transport.supports(&request) {
//!     let upgrade = transport.handle_upgrade(&request);
//!     if upgrade.success {
//!         // send upgrade.response, then once the stream is yours:
//!         // transport.serve(io, upgrade.subprotocol.as_deref(), service).await;
//!     }
//!     return upgrade.response;
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
mod exchange;
pub mod protocol;
pub mod response;
pub mod upgrade;

// Re-exports for convenience
pub use config::{WebsocketConfig, WebsocketErrorFunc, WebsocketInitFunc};
pub use connection::{ConnectionId, Websocket};
pub use error::{CloseCode, WebsocketError, WsError, WsResult};
pub use protocol::{
    Dialect, MessageKind, WireMessage, GRAPHQL_TRANSPORT_WS_SUBPROTOCOL, GRAPHQL_WS_SUBPROTOCOL,
};
pub use response::{send_error, send_error_message, GraphQLResponse};
pub use upgrade::WebsocketUpgrade;

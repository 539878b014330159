//! Wire dialects and the frame codec.
//!
//! Two incompatible GraphQL-over-WebSocket protocols exist in the wild: the
//! older `graphql-ws` subprotocol and the newer `graphql-transport-ws` one.
//! They agree on the envelope shape (`{"type", "id", "payload"}`) but not on
//! the type tokens or the liveness mechanism. The codec translates both into
//! the semantic [`MessageKind`] set so the connection state machine never
//! sees a wire token.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::{WsError, WsResult};

/// Subprotocol identifier of the older dialect.
pub const GRAPHQL_WS_SUBPROTOCOL: &str = "graphql-ws";

/// Subprotocol identifier of the newer dialect.
pub const GRAPHQL_TRANSPORT_WS_SUBPROTOCOL: &str = "graphql-transport-ws";

/// The wire dialect negotiated for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// The `graphql-ws` subprotocol, with server `ka` keep-alives.
    Legacy,
    /// The `graphql-transport-ws` subprotocol, with bidirectional ping/pong.
    Modern,
}

impl Dialect {
    /// Select the dialect for a negotiated subprotocol.
    ///
    /// Clients are required to send a subprotocol; an empty negotiation
    /// falls back to the legacy dialect for compatibility with older
    /// clients. Anything other than the two known identifiers is rejected.
    pub fn from_subprotocol(subprotocol: Option<&str>) -> WsResult<Self> {
        match subprotocol.unwrap_or("") {
            "" | GRAPHQL_WS_SUBPROTOCOL => Ok(Self::Legacy),
            GRAPHQL_TRANSPORT_WS_SUBPROTOCOL => Ok(Self::Modern),
            other => Err(WsError::UnsupportedSubprotocol(other.to_string())),
        }
    }

    /// The subprotocol identifier this dialect answers to.
    pub fn subprotocol(self) -> &'static str {
        match self {
            Self::Legacy => GRAPHQL_WS_SUBPROTOCOL,
            Self::Modern => GRAPHQL_TRANSPORT_WS_SUBPROTOCOL,
        }
    }
}

/// Semantic message kinds shared by both dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Client opens the handshake.
    Init,
    /// Server accepts the handshake.
    ConnectionAck,
    /// Server liveness frame (legacy only).
    KeepAlive,
    /// Connection-scoped error.
    ConnectionError,
    /// Client starts a subscription.
    Start,
    /// Server delivers a subscription payload.
    Data,
    /// Id-scoped error.
    Error,
    /// Server terminates a subscription.
    Complete,
    /// Client cancels a subscription.
    Stop,
    /// Client terminates the connection (legacy only).
    ConnectionClose,
    /// Liveness probe (modern only).
    Ping,
    /// Liveness reply (modern only).
    Pong,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::ConnectionAck => "connection_ack",
            Self::KeepAlive => "keep_alive",
            Self::ConnectionError => "connection_error",
            Self::Start => "start",
            Self::Data => "data",
            Self::Error => "error",
            Self::Complete => "complete",
            Self::Stop => "stop",
            Self::ConnectionClose => "connection_close",
            Self::Ping => "ping",
            Self::Pong => "pong",
        };
        f.write_str(name)
    }
}

/// One decoded wire message.
///
/// The payload stays an opaque JSON blob; only the codec and the specific
/// handler that needs it ever look inside.
#[derive(Debug, Clone)]
pub struct WireMessage {
    /// The semantic kind.
    pub kind: MessageKind,
    /// The client-chosen subscription id, for id-scoped kinds.
    pub id: Option<String>,
    /// The raw JSON payload, when present.
    pub payload: Option<Box<RawValue>>,
}

impl WireMessage {
    /// A bare message of the given kind.
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            id: None,
            payload: None,
        }
    }

    /// Attach a subscription id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Attach a raw JSON payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Box<RawValue>) -> Self {
        self.payload = Some(payload);
        self
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    id: Option<String>,
    payload: Option<Box<RawValue>>,
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<&'a RawValue>,
}

/// Decode one text frame into a [`WireMessage`].
///
/// Returns [`WsError::InvalidMessage`] when the frame is not well-formed
/// JSON or its type token is not part of the dialect.
pub fn decode(dialect: Dialect, text: &str) -> WsResult<WireMessage> {
    let envelope: Envelope = serde_json::from_str(text).map_err(|_| WsError::InvalidMessage)?;
    let kind = decode_kind(dialect, &envelope.kind).ok_or(WsError::InvalidMessage)?;
    Ok(WireMessage {
        kind,
        id: envelope.id,
        payload: envelope.payload,
    })
}

/// Encode a [`WireMessage`] into the text frame for the dialect.
pub fn encode(dialect: Dialect, msg: &WireMessage) -> WsResult<String> {
    let kind = encode_kind(dialect, msg.kind)?;
    serde_json::to_string(&EnvelopeRef {
        kind,
        id: msg.id.as_deref(),
        payload: msg.payload.as_deref(),
    })
    .map_err(|err| WsError::EncodeFailed(err.to_string()))
}

fn decode_kind(dialect: Dialect, token: &str) -> Option<MessageKind> {
    match dialect {
        Dialect::Legacy => match token {
            "connection_init" => Some(MessageKind::Init),
            "connection_ack" => Some(MessageKind::ConnectionAck),
            "ka" => Some(MessageKind::KeepAlive),
            "connection_error" => Some(MessageKind::ConnectionError),
            "start" => Some(MessageKind::Start),
            "data" => Some(MessageKind::Data),
            "error" => Some(MessageKind::Error),
            "complete" => Some(MessageKind::Complete),
            "stop" => Some(MessageKind::Stop),
            "connection_terminate" => Some(MessageKind::ConnectionClose),
            _ => None,
        },
        Dialect::Modern => match token {
            "connection_init" => Some(MessageKind::Init),
            "connection_ack" => Some(MessageKind::ConnectionAck),
            "subscribe" => Some(MessageKind::Start),
            "next" => Some(MessageKind::Data),
            "error" => Some(MessageKind::Error),
            // A client-sent complete cancels the subscription.
            "complete" => Some(MessageKind::Stop),
            "ping" => Some(MessageKind::Ping),
            "pong" => Some(MessageKind::Pong),
            _ => None,
        },
    }
}

fn encode_kind(dialect: Dialect, kind: MessageKind) -> WsResult<&'static str> {
    let token = match dialect {
        Dialect::Legacy => match kind {
            MessageKind::Init => "connection_init",
            MessageKind::ConnectionAck => "connection_ack",
            MessageKind::KeepAlive => "ka",
            MessageKind::ConnectionError => "connection_error",
            MessageKind::Start => "start",
            MessageKind::Data => "data",
            MessageKind::Error => "error",
            MessageKind::Complete => "complete",
            MessageKind::Stop => "stop",
            MessageKind::ConnectionClose => "connection_terminate",
            MessageKind::Ping | MessageKind::Pong => {
                return Err(WsError::EncodeFailed(format!(
                    "{kind} is not expressible in the graphql-ws dialect"
                )))
            }
        },
        Dialect::Modern => match kind {
            MessageKind::Init => "connection_init",
            MessageKind::ConnectionAck => "connection_ack",
            MessageKind::Start => "subscribe",
            MessageKind::Data => "next",
            // The modern dialect has no connection-scoped error type; the
            // closest expressible frame is an id-less error.
            MessageKind::Error | MessageKind::ConnectionError => "error",
            MessageKind::Complete => "complete",
            MessageKind::Stop => "complete",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::KeepAlive | MessageKind::ConnectionClose => {
                return Err(WsError::EncodeFailed(format!(
                    "{kind} is not expressible in the graphql-transport-ws dialect"
                )))
            }
        },
    };
    Ok(token)
}

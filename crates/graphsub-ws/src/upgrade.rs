//! HTTP upgrade handling.
//!
//! Validates the RFC 6455 handshake, negotiates a subprotocol and builds the
//! `101 Switching Protocols` response. Completing the upgrade is the
//! server's job (the mechanics differ per HTTP stack); once it owns the raw
//! IO stream it hands it to [`Websocket::serve`] together with the
//! subprotocol selected here.

use base64::Engine;
use http::{header, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Bytes;
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::connection::Websocket;
use crate::error::{WsError, WsResult};
use crate::response;

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The outcome of an upgrade attempt.
pub struct WebsocketUpgrade {
    /// The response to send to the client.
    pub response: Response<Full<Bytes>>,
    /// The selected subprotocol, echoed in the response when present.
    pub subprotocol: Option<String>,
    /// Whether the handshake was accepted.
    pub success: bool,
}

impl Websocket {
    /// Whether the request asks for a protocol upgrade.
    pub fn supports<B>(&self, request: &Request<B>) -> bool {
        request.headers().contains_key(header::UPGRADE)
    }

    /// Validate the upgrade handshake and build the switching response.
    ///
    /// On success the caller sends the response, takes over the IO stream
    /// and passes it to [`Websocket::serve`] with the selected subprotocol.
    /// On failure the response is a `400` carrying a GraphQL-style error
    /// body.
    pub fn handle_upgrade<B>(&self, request: &Request<B>) -> WebsocketUpgrade {
        let accept = match handshake_accept_key(request) {
            Ok(accept) => accept,
            Err(err) => {
                debug!(%err, "websocket upgrade refused");
                return WebsocketUpgrade {
                    response: response::send_error_message(
                        StatusCode::BAD_REQUEST,
                        "unable to upgrade",
                    ),
                    subprotocol: None,
                    success: false,
                };
            }
        };

        let subprotocol = select_subprotocol(request, self.advertised_subprotocols());

        let mut builder = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "websocket")
            .header("Sec-WebSocket-Accept", accept);
        if let Some(subprotocol) = &subprotocol {
            builder = builder.header("Sec-WebSocket-Protocol", subprotocol);
        }
        let response = builder.body(Full::new(Bytes::new())).unwrap();

        WebsocketUpgrade {
            response,
            subprotocol,
            success: true,
        }
    }
}

fn header_str<'a, B>(request: &'a Request<B>, name: &str) -> Option<&'a str> {
    request.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Check the RFC 6455 preconditions and compute the accept key.
fn handshake_accept_key<B>(request: &Request<B>) -> WsResult<String> {
    let connection_upgrade = header_str(request, "connection")
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    if !connection_upgrade {
        return Err(WsError::NotWebsocketRequest(
            "missing Connection: Upgrade header".into(),
        ));
    }

    let upgrade_websocket = header_str(request, "upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    if !upgrade_websocket {
        return Err(WsError::NotWebsocketRequest(
            "missing Upgrade: websocket header".into(),
        ));
    }

    if header_str(request, "sec-websocket-version") != Some("13") {
        return Err(WsError::NotWebsocketRequest(
            "Sec-WebSocket-Version must be 13".into(),
        ));
    }

    let key = header_str(request, "sec-websocket-key")
        .filter(|key| !key.is_empty())
        .ok_or_else(|| WsError::NotWebsocketRequest("missing Sec-WebSocket-Key header".into()))?;

    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    Ok(base64::engine::general_purpose::STANDARD.encode(hasher.finalize()))
}

/// The subprotocols offered by the client, in offer order.
fn requested_subprotocols<B>(request: &Request<B>) -> Vec<String> {
    request
        .headers()
        .get_all("sec-websocket-protocol")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|protocol| protocol.trim().to_string())
        .filter(|protocol| !protocol.is_empty())
        .collect()
}

/// Pick the first client-offered subprotocol the server advertises.
fn select_subprotocol<B>(request: &Request<B>, advertised: &[String]) -> Option<String> {
    requested_subprotocols(request)
        .into_iter()
        .find(|candidate| advertised.iter().any(|a| a.eq_ignore_ascii_case(candidate)))
}

//! Reading and writing logical messages on a WebSocket stream.
//!
//! This sits between the codec and the socket: it pulls tungstenite frames,
//! normalises close conditions into [`WsError`] values the state machine can
//! match on, and serialises outbound messages.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tungstenite::protocol::CloseFrame;

use crate::error::{WsError, WsResult};
use crate::protocol::{self, Dialect, WireMessage};

const CLOSE_NORMAL: u16 = 1000;
const CLOSE_NO_STATUS: u16 = 1005;

/// Read the next logical message from the stream.
///
/// Transport-level ping/pong frames are answered by tungstenite itself and
/// skipped here; close frames and socket failures surface as errors per
/// [`normalize_close`].
pub(crate) async fn next_message<S>(
    stream: &mut SplitStream<WebSocketStream<S>>,
    dialect: Dialect,
) -> WsResult<WireMessage>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = match stream.next().await {
            None => return Err(WsError::ConnClosed),
            Some(Err(err)) => return Err(normalize_read_error(err)),
            Some(Ok(frame)) => frame,
        };

        match frame {
            tungstenite::Message::Text(text) => return protocol::decode(dialect, &text),
            tungstenite::Message::Binary(bytes) => {
                // Lenient: some clients send JSON in binary frames.
                let text = std::str::from_utf8(&bytes).map_err(|_| WsError::InvalidMessage)?;
                return protocol::decode(dialect, text);
            }
            tungstenite::Message::Close(frame) => return Err(normalize_close(frame)),
            tungstenite::Message::Ping(_)
            | tungstenite::Message::Pong(_)
            | tungstenite::Message::Frame(_) => continue,
        }
    }
}

/// Serialise one message and write it as a text frame.
pub(crate) async fn send_message<S>(
    sink: &mut SplitSink<WebSocketStream<S>, tungstenite::Message>,
    dialect: Dialect,
    msg: &WireMessage,
) -> WsResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let text = protocol::encode(dialect, msg)?;
    sink.send(tungstenite::Message::Text(text.into()))
        .await
        .map_err(WsError::from)
}

/// Normalise a peer close frame.
///
/// Normal closure and no-status closes collapse into [`WsError::ConnClosed`];
/// every other close code passes through verbatim so callers can still
/// observe it.
pub(crate) fn normalize_close(frame: Option<CloseFrame>) -> WsError {
    match frame {
        None => WsError::ConnClosed,
        Some(frame) => {
            let code = u16::from(frame.code);
            if code == CLOSE_NORMAL || code == CLOSE_NO_STATUS {
                WsError::ConnClosed
            } else {
                WsError::CloseFrame {
                    code,
                    reason: frame.reason.to_string(),
                }
            }
        }
    }
}

fn normalize_read_error(err: tungstenite::Error) -> WsError {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            WsError::ConnClosed
        }
        other => WsError::Tungstenite(other),
    }
}

//! Connection lifecycle.
//!
//! One [`Websocket`] transport serves many connections. Each connection runs
//! the init handshake, then a read loop that multiplexes subscription
//! traffic: `start` spawns a forwarding task per subscription, `stop` cancels
//! one, and the close path tears everything down exactly once.
//!
//! Concurrency model per connection: the read loop owns the read half of the
//! socket; every writer (the read loop, timer tasks, subscription tasks and
//! the close path) goes through one connection-level async mutex that also
//! guards the registry of cancel handles. Registry operations under the lock
//! are bounded and never call user code.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::value::to_raw_value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::time::{interval_at, timeout, timeout_at, Instant};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tungstenite::protocol::Role;
use uuid::Uuid;

use graphsub_core::{
    ConnectionContext, GraphQLError, InitPayload, SubscriptionContext, SubscriptionPayloads,
    SubscriptionRequest, SubscriptionService,
};

use crate::config::{WebsocketConfig, WebsocketErrorFunc, WebsocketInitFunc};
use crate::error::{CloseCode, WebsocketError, WsError};
use crate::exchange;
use crate::protocol::{
    Dialect, MessageKind, WireMessage, GRAPHQL_TRANSPORT_WS_SUBPROTOCOL, GRAPHQL_WS_SUBPROTOCOL,
};

/// A unique identifier for a connection, used for log correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Create a new random connection ID.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The GraphQL-over-WebSocket subscription transport.
///
/// Speaks both the `graphql-ws` and `graphql-transport-ws` dialects; the
/// dialect is picked per connection from the negotiated subprotocol.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use std::time::Duration;
/// use graphsub_ws::Websocket;
///
/// let transport = Websocket::new()
///     .init_timeout(Duration::from_secs(10))
///     .keep_alive_interval(Duration::from_secs(25))
///     .ping_pong_interval(Duration::from_secs(25))
///     .on_init(|ctx, payload| async move {
///         if payload.authorization().is_empty() {
///             return Err("missing credentials".into());
///         }
///         Ok(ctx)
///     });
///
/// // After the HTTP upgrade completed:
/// transport.serve(io, negotiated.as_deref(), Arc::clone(&service)).await;
/// ```
#[derive(Clone, Default)]
pub struct Websocket {
    config: WebsocketConfig,
    init_func: Option<WebsocketInitFunc>,
    error_func: Option<WebsocketErrorFunc>,
    extra_subprotocols: Vec<String>,
    advertised: OnceLock<Vec<String>>,
}

impl Websocket {
    /// Create a transport with default configuration and no hooks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the timing configuration wholesale.
    #[must_use]
    pub fn with_config(mut self, config: WebsocketConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the init handshake timeout.
    #[must_use]
    pub fn init_timeout(mut self, timeout: Duration) -> Self {
        self.config.init_timeout = Some(timeout);
        self
    }

    /// Set the legacy keep-alive cadence.
    #[must_use]
    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.config.keep_alive_interval = Some(interval);
        self
    }

    /// Set the modern ping/pong cadence.
    #[must_use]
    pub fn ping_pong_interval(mut self, interval: Duration) -> Self {
        self.config.ping_pong_interval = Some(interval);
        self
    }

    /// Install the init hook.
    ///
    /// The hook sees the client's init payload and may reject the connection
    /// or enrich the connection context before returning it.
    #[must_use]
    pub fn on_init<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(ConnectionContext, InitPayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ConnectionContext, GraphQLError>> + Send + 'static,
    {
        self.init_func = Some(Arc::new(move |ctx, payload| Box::pin(hook(ctx, payload))));
        self
    }

    /// Install the asynchronous error sink.
    #[must_use]
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ConnectionContext, WebsocketError) + Send + Sync + 'static,
    {
        self.error_func = Some(Arc::new(hook));
        self
    }

    /// Advertise additional subprotocols besides the two GraphQL ones.
    #[must_use]
    pub fn with_subprotocols(mut self, protocols: impl IntoIterator<Item = String>) -> Self {
        self.extra_subprotocols.extend(protocols);
        self
    }

    /// The subprotocols offered during the upgrade.
    ///
    /// Both GraphQL identifiers are injected on first use; the computed list
    /// is cached so repeated upgrades see the same offer.
    pub(crate) fn advertised_subprotocols(&self) -> &[String] {
        self.advertised.get_or_init(|| {
            let mut protocols = self.extra_subprotocols.clone();
            for graphql in [GRAPHQL_TRANSPORT_WS_SUBPROTOCOL, GRAPHQL_WS_SUBPROTOCOL] {
                if !protocols.iter().any(|p| p == graphql) {
                    protocols.push(graphql.to_string());
                }
            }
            protocols
        })
    }

    /// Serve an upgraded raw IO stream.
    ///
    /// `subprotocol` is the identifier negotiated during the HTTP upgrade
    /// (`None` when the client offered nothing). Returns when the connection
    /// has fully shut down.
    pub async fn serve<S>(
        &self,
        stream: S,
        subprotocol: Option<&str>,
        service: Arc<dyn SubscriptionService>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let ws = WebSocketStream::from_raw_socket(stream, Role::Server, None).await;
        self.serve_stream(ws, subprotocol, service).await;
    }

    /// Serve an already-wrapped WebSocket stream.
    pub async fn serve_stream<S>(
        &self,
        stream: WebSocketStream<S>,
        subprotocol: Option<&str>,
        service: Arc<dyn SubscriptionService>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, reader) = stream.split();

        let dialect = match Dialect::from_subprotocol(subprotocol) {
            Ok(dialect) => dialect,
            Err(err) => {
                warn!(%err, "rejecting connection");
                let frame = close_frame(CloseCode::Protocol, &err.to_string());
                let _ = sink.send(tungstenite::Message::Close(Some(frame))).await;
                let _ = sink.close().await;
                return;
            }
        };

        let id = ConnectionId::new();
        debug!(connection_id = %id, subprotocol = dialect.subprotocol(), "connection accepted");

        let shared = Arc::new(Shared {
            id,
            dialect,
            state: Mutex::new(WriteState {
                sink,
                registry: SubscriptionRegistry::default(),
            }),
            closed: AtomicBool::new(false),
            error_func: self.error_func.clone(),
            ctx: RwLock::new(ConnectionContext::new()),
        });

        let mut conn = Connection {
            config: self.config.clone(),
            init_func: self.init_func.clone(),
            service,
            dialect,
            reader,
            shared,
        };

        if conn.init().await {
            conn.run().await;
        }
    }
}

fn close_frame(code: CloseCode, reason: &str) -> tungstenite::protocol::CloseFrame {
    tungstenite::protocol::CloseFrame {
        code: tungstenite::protocol::frame::coding::CloseCode::from(code.as_u16()),
        reason: reason.to_string().into(),
    }
}

/// Cancel handles for a connection's active subscriptions, keyed by the
/// client-chosen id.
///
/// Entries carry a serial so a finished task can only unregister the entry it
/// registered, never a replacement that reused its id.
#[derive(Default)]
struct SubscriptionRegistry {
    entries: HashMap<String, SubscriptionHandle>,
    next_serial: u64,
}

struct SubscriptionHandle {
    serial: u64,
    cancel: CancellationToken,
}

impl SubscriptionRegistry {
    fn register(&mut self, id: &str, cancel: CancellationToken) -> (u64, Option<CancellationToken>) {
        self.next_serial += 1;
        let serial = self.next_serial;
        let displaced = self
            .entries
            .insert(id.to_owned(), SubscriptionHandle { serial, cancel })
            .map(|handle| handle.cancel);
        (serial, displaced)
    }

    fn cancel_handle(&self, id: &str) -> Option<CancellationToken> {
        self.entries.get(id).map(|handle| handle.cancel.clone())
    }

    fn remove(&mut self, id: &str, serial: u64) -> bool {
        match self.entries.get(id) {
            Some(handle) if handle.serial == serial => {
                self.entries.remove(id);
                true
            }
            _ => false,
        }
    }

    fn drain(&mut self) -> Vec<CancellationToken> {
        self.entries
            .drain()
            .map(|(_, handle)| handle.cancel)
            .collect()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

struct WriteState<S> {
    sink: SplitSink<WebSocketStream<S>, tungstenite::Message>,
    registry: SubscriptionRegistry,
}

struct Shared<S> {
    id: ConnectionId,
    dialect: Dialect,
    state: Mutex<WriteState<S>>,
    closed: AtomicBool,
    error_func: Option<WebsocketErrorFunc>,
    ctx: RwLock<ConnectionContext>,
}

impl<S> Shared<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn report_error(&self, error: WsError, is_read_error: bool) {
        warn!(connection_id = %self.id, %error, is_read_error, "websocket fault");
        if let Some(hook) = &self.error_func {
            let ctx = self.ctx.read().clone();
            hook(&ctx, WebsocketError {
                error,
                is_read_error,
            });
        }
    }

    async fn write(&self, msg: &WireMessage) {
        if self.is_closed() {
            return;
        }
        let result = {
            let mut state = self.state.lock().await;
            // The close path may have won the race for the lock; the close
            // frame must stay the last frame on the wire.
            if self.is_closed() {
                return;
            }
            exchange::send_message(&mut state.sink, self.dialect, msg).await
        };
        if let Err(err) = result {
            self.report_error(err, false);
        }
    }

    async fn send_connection_error(&self, message: String) {
        let err = GraphQLError::new(message);
        match to_raw_value(&err) {
            Ok(payload) => {
                self.write(&WireMessage::new(MessageKind::ConnectionError).with_payload(payload))
                    .await;
            }
            Err(err) => warn!(connection_id = %self.id, %err, "undecodable connection error payload"),
        }
    }

    async fn send_error(&self, id: &str, errors: &[GraphQLError]) {
        match to_raw_value(errors) {
            Ok(payload) => {
                self.write(
                    &WireMessage::new(MessageKind::Error)
                        .with_id(id)
                        .with_payload(payload),
                )
                .await;
            }
            Err(err) => warn!(connection_id = %self.id, %err, "undecodable error payload"),
        }
    }

    async fn complete(&self, id: &str) {
        self.write(&WireMessage::new(MessageKind::Complete).with_id(id))
            .await;
    }

    /// The single shutdown path: write the close frame, cancel every active
    /// subscription, close the socket. The first caller wins; later calls
    /// are no-ops.
    async fn close(&self, code: CloseCode, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(connection_id = %self.id, code = code.as_u16(), reason, "closing connection");

        let mut state = self.state.lock().await;
        let frame = close_frame(code, reason);
        let _ = state
            .sink
            .send(tungstenite::Message::Close(Some(frame)))
            .await;
        for cancel in state.registry.drain() {
            cancel.cancel();
        }
        let _ = state.sink.close().await;
    }
}

struct Connection<S> {
    config: WebsocketConfig,
    init_func: Option<WebsocketInitFunc>,
    service: Arc<dyn SubscriptionService>,
    dialect: Dialect,
    reader: SplitStream<WebSocketStream<S>>,
    shared: Arc<Shared<S>>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn next_message_with_timeout(&mut self, bound: Duration) -> Result<WireMessage, WsError> {
        match timeout(bound, exchange::next_message(&mut self.reader, self.dialect)).await {
            Ok(result) => result,
            Err(_) => Err(WsError::ReadTimeout),
        }
    }

    /// Run the init handshake. Returns true when the connection may enter
    /// the ready state.
    async fn init(&mut self) -> bool {
        let first = match self.config.effective_init_timeout() {
            Some(bound) => self.next_message_with_timeout(bound).await,
            None => exchange::next_message(&mut self.reader, self.dialect).await,
        };

        let msg = match first {
            Ok(msg) => msg,
            Err(WsError::ReadTimeout) => {
                self.shared
                    .close(CloseCode::Protocol, "connection initialisation timeout")
                    .await;
                return false;
            }
            Err(err) => {
                if matches!(err, WsError::InvalidMessage) {
                    self.shared
                        .send_connection_error("invalid json".to_string())
                        .await;
                }
                self.shared.close(CloseCode::Protocol, "decoding error").await;
                return false;
            }
        };

        match msg.kind {
            MessageKind::Init => {}
            MessageKind::ConnectionClose => {
                self.shared.close(CloseCode::Normal, "terminated").await;
                return false;
            }
            other => {
                self.shared
                    .send_connection_error(format!("unexpected message {other}"))
                    .await;
                self.shared
                    .close(CloseCode::Protocol, "unexpected message")
                    .await;
                return false;
            }
        }

        let mut init_payload = InitPayload::new();
        if let Some(raw) = &msg.payload {
            init_payload = match serde_json::from_str(raw.get()) {
                Ok(payload) => payload,
                Err(err) => {
                    debug!(connection_id = %self.shared.id, %err, "undecodable init payload");
                    return false;
                }
            };
            self.shared
                .ctx
                .write()
                .set_init_payload(init_payload.clone());
        }

        if let Some(hook) = &self.init_func {
            let ctx = self.shared.ctx.read().clone();
            match hook(ctx, init_payload).await {
                Ok(enriched) => *self.shared.ctx.write() = enriched,
                Err(err) => {
                    self.shared.send_connection_error(err.message).await;
                    self.shared.close(CloseCode::Normal, "terminated").await;
                    return false;
                }
            }
        }

        self.shared
            .write(&WireMessage::new(MessageKind::ConnectionAck))
            .await;
        if self.dialect == Dialect::Legacy {
            self.shared
                .write(&WireMessage::new(MessageKind::KeepAlive))
                .await;
        }
        debug!(connection_id = %self.shared.id, "connection initialised");
        true
    }

    async fn run(&mut self) {
        let token = { self.shared.ctx.read().cancel_token().clone() };

        if self.dialect == Dialect::Legacy {
            if let Some(period) = self.config.effective_keep_alive_interval() {
                tokio::spawn(keep_alive_loop(self.shared.clone(), token.clone(), period));
            }
        }

        let ping_interval = match self.dialect {
            Dialect::Modern => self.config.effective_ping_pong_interval(),
            Dialect::Legacy => None,
        };
        // A client that stops answering pings must fail the next read, so
        // the deadline is armed on entry, not on the first ping.
        let mut read_deadline = ping_interval.map(|period| Instant::now() + 2 * period);
        if let Some(period) = ping_interval {
            tokio::spawn(ping_loop(self.shared.clone(), token.clone(), period));
        }

        let shared = self.shared.clone();
        loop {
            let next = {
                let read = read_with_deadline(&mut self.reader, self.dialect, read_deadline);
                tokio::select! {
                    _ = token.cancelled() => {
                        let reason = { shared.ctx.read().close_reason() };
                        if let Some(reason) = reason {
                            shared.send_connection_error(reason).await;
                        }
                        shared.close(CloseCode::Normal, "terminated").await;
                        return;
                    }
                    next = read => next,
                }
            };

            let msg = match next {
                Ok(msg) => msg,
                Err(err) => {
                    if shared.is_closed() {
                        // The read failed because our own close path already
                        // ran; nothing to report.
                        return;
                    }
                    if !err.is_conn_closed() {
                        shared.report_error(err, true);
                    }
                    shared.close(CloseCode::Abnormal, "unexpected closure").await;
                    return;
                }
            };

            match msg.kind {
                MessageKind::Start => self.subscribe(msg).await,
                MessageKind::Stop => {
                    let id = msg.id.unwrap_or_default();
                    let cancel = { shared.state.lock().await.registry.cancel_handle(&id) };
                    if let Some(cancel) = cancel {
                        cancel.cancel();
                    }
                }
                MessageKind::ConnectionClose => {
                    shared.close(CloseCode::Normal, "terminated").await;
                    return;
                }
                MessageKind::Ping => {
                    let mut pong = WireMessage::new(MessageKind::Pong);
                    pong.payload = msg.payload;
                    shared.write(&pong).await;
                }
                MessageKind::Pong => {
                    if let Some(period) = ping_interval {
                        read_deadline = Some(Instant::now() + 2 * period);
                    }
                }
                other => {
                    shared
                        .send_connection_error(format!("unexpected message {other}"))
                        .await;
                    shared
                        .close(CloseCode::Protocol, "unexpected message")
                        .await;
                    return;
                }
            }
        }
    }

    async fn subscribe(&self, msg: WireMessage) {
        let id = msg.id.clone().unwrap_or_default();

        let request = match msg
            .payload
            .as_deref()
            .map(|raw| serde_json::from_str::<SubscriptionRequest>(raw.get()))
        {
            Some(Ok(request)) => request,
            _ => {
                self.shared
                    .send_error(&id, &[GraphQLError::new("invalid json")])
                    .await;
                self.shared.complete(&id).await;
                return;
            }
        };

        let ctx = { self.shared.ctx.read().subscription_context() }.with_error_capture();
        let cancel = ctx.cancel_token().clone();

        let payloads = match self.service.subscribe(ctx.clone(), request).await {
            Ok(payloads) => payloads,
            Err(err) => {
                self.shared.send_error(&id, &[err]).await;
                self.shared.complete(&id).await;
                cancel.cancel();
                return;
            }
        };

        let serial = {
            let mut state = self.shared.state.lock().await;
            let (serial, displaced) = state.registry.register(&id, cancel);
            if let Some(previous) = displaced {
                warn!(
                    connection_id = %self.shared.id,
                    subscription_id = %id,
                    "subscription id reused, cancelling previous subscription"
                );
                previous.cancel();
            }
            serial
        };

        debug!(connection_id = %self.shared.id, subscription_id = %id, "subscription started");
        tokio::spawn(run_subscription(
            self.shared.clone(),
            id,
            serial,
            ctx,
            payloads,
        ));
    }
}

async fn read_with_deadline<S>(
    reader: &mut SplitStream<WebSocketStream<S>>,
    dialect: Dialect,
    deadline: Option<Instant>,
) -> Result<WireMessage, WsError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match deadline {
        Some(deadline) => match timeout_at(deadline, exchange::next_message(reader, dialect)).await
        {
            Ok(result) => result,
            Err(_) => Err(WsError::ReadTimeout),
        },
        None => exchange::next_message(reader, dialect).await,
    }
}

async fn keep_alive_loop<S>(shared: Arc<Shared<S>>, token: CancellationToken, period: Duration)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {
                shared.write(&WireMessage::new(MessageKind::KeepAlive)).await;
            }
        }
    }
}

async fn ping_loop<S>(shared: Arc<Shared<S>>, token: CancellationToken, period: Duration)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {
                shared.write(&WireMessage::new(MessageKind::Ping)).await;
            }
        }
    }
}

/// Forward one subscription's payloads until the stream ends or the
/// subscription is cancelled, then emit the terminal frame and unregister.
///
/// This task never closes the socket.
async fn run_subscription<S>(
    shared: Arc<Shared<S>>,
    id: String,
    serial: u64,
    ctx: SubscriptionContext,
    mut payloads: SubscriptionPayloads,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            next = payloads.recv() => match next {
                None => break,
                Some(payload) => match to_raw_value(&payload) {
                    Ok(raw) => {
                        shared
                            .write(
                                &WireMessage::new(MessageKind::Data)
                                    .with_id(id.as_str())
                                    .with_payload(raw),
                            )
                            .await;
                    }
                    Err(err) => {
                        shared
                            .send_error(&id, &[GraphQLError::from_std(&err)])
                            .await;
                    }
                },
            },
        }
    }

    let errors = ctx.collect_errors();
    if errors.is_empty() {
        shared.complete(&id).await;
    } else {
        shared.send_error(&id, &errors).await;
    }

    {
        let mut state = shared.state.lock().await;
        state.registry.remove(&id, serial);
    }
    ctx.cancel();

    // Let the producer observe closure instead of blocking forever on a
    // full channel; buffered leftovers are dropped.
    payloads.close();
    while payloads.try_recv().is_ok() {}

    debug!(connection_id = %shared.id, subscription_id = %id, "subscription finished");
}

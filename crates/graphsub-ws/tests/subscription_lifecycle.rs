//! End-to-end transport tests.
//!
//! Each test wires a real client-side `WebSocketStream` to the transport
//! through an in-memory duplex pipe, so full frames travel both ways without
//! a TCP listener.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{duplex, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_tungstenite::WebSocketStream;
use tungstenite::protocol::Role;
use tungstenite::Message;

use graphsub_core::{
    ConnectionContext, GraphQLError, SubscriptionContext, SubscriptionPayloads,
    SubscriptionRequest, SubscriptionService,
};
use graphsub_ws::Websocket;

type Client = WebSocketStream<DuplexStream>;

async fn connect(
    transport: Websocket,
    subprotocol: &str,
    service: Arc<dyn SubscriptionService>,
) -> Client {
    let (client_io, server_io) = duplex(64 * 1024);
    let subprotocol = (!subprotocol.is_empty()).then(|| subprotocol.to_string());
    tokio::spawn(async move {
        transport
            .serve(server_io, subprotocol.as_deref(), service)
            .await;
    });
    WebSocketStream::from_raw_socket(client_io, Role::Client, None).await
}

async fn recv_frame(client: &mut Client) -> Option<Result<Message, tungstenite::Error>> {
    timeout(Duration::from_secs(2), client.next())
        .await
        .expect("timed out waiting for a frame")
}

async fn recv_json(client: &mut Client) -> Value {
    loop {
        match recv_frame(client).await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(&text).expect("server frame should be JSON")
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            other => panic!("expected a text frame, got {other:?}"),
        }
    }
}

async fn send_json(client: &mut Client, value: Value) {
    client
        .send(Message::Text(value.to_string().into()))
        .await
        .expect("client send failed");
}

async fn init_legacy(client: &mut Client) {
    send_json(client, json!({"type": "connection_init"})).await;
    assert_eq!(recv_json(client).await["type"], "connection_ack");
    assert_eq!(recv_json(client).await["type"], "ka");
}

async fn init_modern(client: &mut Client) {
    send_json(client, json!({"type": "connection_init"})).await;
    assert_eq!(recv_json(client).await["type"], "connection_ack");
}

async fn expect_close(client: &mut Client, code: u16, reason: &str) {
    match recv_frame(client).await {
        Some(Ok(Message::Close(Some(frame)))) => {
            assert_eq!(u16::from(frame.code), code);
            assert_eq!(frame.reason.to_string(), reason);
        }
        other => panic!("expected a close frame, got {other:?}"),
    }
}

async fn assert_silence(client: &mut Client, window: Duration) {
    if let Ok(frame) = timeout(window, client.next()).await {
        panic!("expected no further frames, got {frame:?}");
    }
}

/// Emits a fixed list of payloads, then ends the stream.
struct StaticService {
    payloads: Vec<Value>,
    calls: Arc<AtomicUsize>,
}

impl StaticService {
    fn new(payloads: Vec<Value>) -> Self {
        Self {
            payloads,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl SubscriptionService for StaticService {
    fn subscribe(
        &self,
        _ctx: SubscriptionContext,
        _request: SubscriptionRequest,
    ) -> BoxFuture<'static, Result<SubscriptionPayloads, GraphQLError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let payloads = self.payloads.clone();
        Box::pin(async move {
            let (tx, rx) = mpsc::channel(8);
            tokio::spawn(async move {
                for payload in payloads {
                    if tx.send(payload).await.is_err() {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            });
            Ok(rx)
        })
    }
}

/// Emits increasing integers forever, until cancelled.
struct CounterService;

impl SubscriptionService for CounterService {
    fn subscribe(
        &self,
        ctx: SubscriptionContext,
        _request: SubscriptionRequest,
    ) -> BoxFuture<'static, Result<SubscriptionPayloads, GraphQLError>> {
        Box::pin(async move {
            let (tx, rx) = mpsc::channel(8);
            tokio::spawn(async move {
                let mut n = 1u64;
                loop {
                    tokio::select! {
                        _ = ctx.cancelled() => return,
                        sent = tx.send(json!(n)) => {
                            if sent.is_err() {
                                return;
                            }
                            n += 1;
                            tokio::time::sleep(Duration::from_millis(20)).await;
                        }
                    }
                }
            });
            Ok(rx)
        })
    }
}

/// Rejects every subscription synchronously.
struct FailingService;

impl SubscriptionService for FailingService {
    fn subscribe(
        &self,
        _ctx: SubscriptionContext,
        _request: SubscriptionRequest,
    ) -> BoxFuture<'static, Result<SubscriptionPayloads, GraphQLError>> {
        Box::pin(async move { Err(GraphQLError::new("execution failed")) })
    }
}

/// Deposits errors through the capture slot instead of sending payloads.
struct CaptureErrorService;

impl SubscriptionService for CaptureErrorService {
    fn subscribe(
        &self,
        ctx: SubscriptionContext,
        _request: SubscriptionRequest,
    ) -> BoxFuture<'static, Result<SubscriptionPayloads, GraphQLError>> {
        Box::pin(async move {
            let (tx, rx) = mpsc::channel::<Value>(1);
            tokio::spawn(async move {
                ctx.add_error(GraphQLError::new("First error"));
                ctx.add_error(GraphQLError::new("Second error"));
                drop(tx);
            });
            Ok(rx)
        })
    }
}

/// Echoes the connection's authorization entry back as the only payload.
struct EchoAuthService;

impl SubscriptionService for EchoAuthService {
    fn subscribe(
        &self,
        ctx: SubscriptionContext,
        _request: SubscriptionRequest,
    ) -> BoxFuture<'static, Result<SubscriptionPayloads, GraphQLError>> {
        Box::pin(async move {
            let (tx, rx) = mpsc::channel(1);
            let auth = ctx
                .init_payload()
                .map(|payload| payload.authorization())
                .unwrap_or_default();
            tokio::spawn(async move {
                let _ = tx.send(json!({ "authorization": auth })).await;
            });
            Ok(rx)
        })
    }
}

#[tokio::test]
async fn legacy_init_handshake_acks_then_keeps_alive() {
    let mut client = connect(
        Websocket::new(),
        "graphql-ws",
        Arc::new(StaticService::new(vec![])),
    )
    .await;
    init_legacy(&mut client).await;
}

#[tokio::test]
async fn legacy_subscription_delivers_payloads_then_completes() {
    let service = Arc::new(StaticService::new(vec![json!(1), json!(2), json!(3)]));
    let mut client = connect(Websocket::new(), "graphql-ws", service).await;
    init_legacy(&mut client).await;

    send_json(
        &mut client,
        json!({"type":"start","id":"1","payload":{"query":"subscription{tick}"}}),
    )
    .await;

    for expected in 1..=3 {
        let frame = recv_json(&mut client).await;
        assert_eq!(frame["type"], "data");
        assert_eq!(frame["id"], "1");
        assert_eq!(frame["payload"], json!(expected));
    }
    let complete = recv_json(&mut client).await;
    assert_eq!(complete["type"], "complete");
    assert_eq!(complete["id"], "1");
}

#[tokio::test]
async fn legacy_stop_cancels_the_subscription() {
    let mut client = connect(Websocket::new(), "graphql-ws", Arc::new(CounterService)).await;
    init_legacy(&mut client).await;

    send_json(
        &mut client,
        json!({"type":"start","id":"1","payload":{"query":"subscription{count}"}}),
    )
    .await;

    let first = recv_json(&mut client).await;
    assert_eq!(first["type"], "data");
    assert_eq!(first["id"], "1");

    send_json(&mut client, json!({"type":"stop","id":"1"})).await;

    // Frames already in flight may still arrive, but the terminal frame must
    // come and nothing may follow it.
    loop {
        let frame = recv_json(&mut client).await;
        match frame["type"].as_str() {
            Some("data") => continue,
            Some("complete") => {
                assert_eq!(frame["id"], "1");
                break;
            }
            other => panic!("unexpected frame type {other:?}"),
        }
    }
    assert_silence(&mut client, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn invalid_start_payload_reports_and_never_subscribes() {
    let service = Arc::new(StaticService::new(vec![json!(1)]));
    let calls = service.calls.clone();
    let mut client = connect(Websocket::new(), "graphql-ws", service).await;
    init_legacy(&mut client).await;

    send_json(
        &mut client,
        json!({"type":"start","id":"1","payload":"notjson"}),
    )
    .await;

    let error = recv_json(&mut client).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["id"], "1");
    assert_eq!(error["payload"][0]["message"], "invalid json");

    let complete = recv_json(&mut client).await;
    assert_eq!(complete["type"], "complete");
    assert_eq!(complete["id"], "1");

    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn modern_ping_pong_keeps_the_connection_alive_until_pongs_stop() {
    let transport = Websocket::new().ping_pong_interval(Duration::from_millis(50));
    let mut client = connect(
        transport,
        "graphql-transport-ws",
        Arc::new(StaticService::new(vec![])),
    )
    .await;
    init_modern(&mut client).await;

    // Answering the first ping must keep the connection going.
    let ping = recv_json(&mut client).await;
    assert_eq!(ping["type"], "ping");
    send_json(&mut client, json!({"type":"pong"})).await;

    let ping = recv_json(&mut client).await;
    assert_eq!(ping["type"], "ping");

    // Stop answering: the 2x read deadline must terminate the connection.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let frame = timeout_at(deadline, client.next())
            .await
            .expect("server should have closed the connection");
        match frame {
            Some(Ok(Message::Text(_))) => continue,
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(_)) => continue,
        }
    }
}

#[tokio::test]
async fn init_timeout_closes_with_protocol_error() {
    let transport = Websocket::new().init_timeout(Duration::from_millis(50));
    let mut client = connect(
        transport,
        "graphql-ws",
        Arc::new(StaticService::new(vec![])),
    )
    .await;

    expect_close(&mut client, 1002, "connection initialisation timeout").await;
}

#[tokio::test]
async fn modern_subscription_uses_subscribe_and_next_tokens() {
    let service = Arc::new(StaticService::new(vec![json!({"tick": 1})]));
    let mut client = connect(Websocket::new(), "graphql-transport-ws", service).await;
    init_modern(&mut client).await;

    send_json(
        &mut client,
        json!({"type":"subscribe","id":"sub1","payload":{"query":"subscription{tick}"}}),
    )
    .await;

    let next = recv_json(&mut client).await;
    assert_eq!(next["type"], "next");
    assert_eq!(next["id"], "sub1");
    assert_eq!(next["payload"], json!({"tick": 1}));

    let complete = recv_json(&mut client).await;
    assert_eq!(complete["type"], "complete");
    assert_eq!(complete["id"], "sub1");
}

#[tokio::test]
async fn modern_client_complete_cancels_the_subscription() {
    let mut client = connect(
        Websocket::new(),
        "graphql-transport-ws",
        Arc::new(CounterService),
    )
    .await;
    init_modern(&mut client).await;

    send_json(
        &mut client,
        json!({"type":"subscribe","id":"sub1","payload":{"query":"subscription{count}"}}),
    )
    .await;

    let first = recv_json(&mut client).await;
    assert_eq!(first["type"], "next");

    send_json(&mut client, json!({"type":"complete","id":"sub1"})).await;

    loop {
        let frame = recv_json(&mut client).await;
        match frame["type"].as_str() {
            Some("next") => continue,
            Some("complete") => {
                assert_eq!(frame["id"], "sub1");
                break;
            }
            other => panic!("unexpected frame type {other:?}"),
        }
    }
    assert_silence(&mut client, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn unsupported_subprotocol_is_rejected_before_init() {
    let mut client = connect(
        Websocket::new(),
        "soap",
        Arc::new(StaticService::new(vec![])),
    )
    .await;

    match recv_frame(&mut client).await {
        Some(Ok(Message::Close(Some(frame)))) => {
            assert_eq!(u16::from(frame.code), 1002);
            assert!(frame
                .reason
                .to_string()
                .contains("unsupported negotiated subprotocol"));
        }
        other => panic!("expected a close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn init_hook_rejection_sends_connection_error_then_closes() {
    let transport = Websocket::new().on_init(|_ctx, _payload| async move {
        Err::<ConnectionContext, GraphQLError>(GraphQLError::new("unauthorized"))
    });
    let mut client = connect(
        transport,
        "graphql-ws",
        Arc::new(StaticService::new(vec![])),
    )
    .await;

    send_json(
        &mut client,
        json!({"type":"connection_init","payload":{"authorization":"nope"}}),
    )
    .await;

    let error = recv_json(&mut client).await;
    assert_eq!(error["type"], "connection_error");
    assert_eq!(error["payload"]["message"], "unauthorized");

    expect_close(&mut client, 1000, "terminated").await;
}

#[tokio::test]
async fn init_payload_reaches_the_service() {
    let transport = Websocket::new().on_init(|ctx, payload| async move {
        if payload.authorization().is_empty() {
            return Err(GraphQLError::new("missing credentials"));
        }
        Ok(ctx)
    });
    let mut client = connect(transport, "graphql-ws", Arc::new(EchoAuthService)).await;

    send_json(
        &mut client,
        json!({"type":"connection_init","payload":{"Authorization":"Bearer t"}}),
    )
    .await;
    assert_eq!(recv_json(&mut client).await["type"], "connection_ack");
    assert_eq!(recv_json(&mut client).await["type"], "ka");

    send_json(
        &mut client,
        json!({"type":"start","id":"1","payload":{"query":"subscription{whoami}"}}),
    )
    .await;

    let data = recv_json(&mut client).await;
    assert_eq!(data["type"], "data");
    assert_eq!(data["payload"], json!({"authorization": "Bearer t"}));

    assert_eq!(recv_json(&mut client).await["type"], "complete");
}

#[tokio::test]
async fn captured_errors_replace_the_complete_frame() {
    let mut client = connect(
        Websocket::new(),
        "graphql-ws",
        Arc::new(CaptureErrorService),
    )
    .await;
    init_legacy(&mut client).await;

    send_json(
        &mut client,
        json!({"type":"start","id":"1","payload":{"query":"subscription{tick}"}}),
    )
    .await;

    let error = recv_json(&mut client).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["id"], "1");
    assert_eq!(error["payload"][0]["message"], "First error");
    assert_eq!(error["payload"][1]["message"], "Second error");

    // The error frame is the terminal frame; no complete may follow.
    assert_silence(&mut client, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn unexpected_pre_init_message_is_a_protocol_error() {
    let mut client = connect(
        Websocket::new(),
        "graphql-ws",
        Arc::new(StaticService::new(vec![])),
    )
    .await;

    send_json(
        &mut client,
        json!({"type":"start","id":"1","payload":{"query":"subscription{tick}"}}),
    )
    .await;

    let error = recv_json(&mut client).await;
    assert_eq!(error["type"], "connection_error");
    assert_eq!(error["payload"]["message"], "unexpected message start");

    expect_close(&mut client, 1002, "unexpected message").await;
}

#[tokio::test]
async fn subscribe_error_is_reported_id_scoped() {
    let mut client = connect(Websocket::new(), "graphql-ws", Arc::new(FailingService)).await;
    init_legacy(&mut client).await;

    send_json(
        &mut client,
        json!({"type":"start","id":"9","payload":{"query":"subscription{tick}"}}),
    )
    .await;

    let error = recv_json(&mut client).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["id"], "9");
    assert_eq!(error["payload"][0]["message"], "execution failed");

    let complete = recv_json(&mut client).await;
    assert_eq!(complete["type"], "complete");
    assert_eq!(complete["id"], "9");
}

#[tokio::test]
async fn malformed_json_during_init_closes_with_decoding_error() {
    let mut client = connect(
        Websocket::new(),
        "graphql-ws",
        Arc::new(StaticService::new(vec![])),
    )
    .await;

    client
        .send(Message::Text("not json".into()))
        .await
        .expect("client send failed");

    let error = recv_json(&mut client).await;
    assert_eq!(error["type"], "connection_error");
    assert_eq!(error["payload"]["message"], "invalid json");

    expect_close(&mut client, 1002, "decoding error").await;
}

#[tokio::test]
async fn connection_terminate_closes_normally() {
    let mut client = connect(
        Websocket::new(),
        "graphql-ws",
        Arc::new(StaticService::new(vec![])),
    )
    .await;
    init_legacy(&mut client).await;

    send_json(&mut client, json!({"type":"connection_terminate"})).await;
    expect_close(&mut client, 1000, "terminated").await;
}

#[tokio::test]
async fn cancelling_the_connection_emits_the_close_reason() {
    let slot: Arc<std::sync::Mutex<Option<ConnectionContext>>> = Arc::default();
    let stash = slot.clone();
    let transport = Websocket::new().on_init(move |ctx, _payload| {
        let stash = stash.clone();
        async move {
            *stash.lock().unwrap() = Some(ctx.clone());
            Ok::<ConnectionContext, GraphQLError>(ctx)
        }
    });
    let mut client = connect(
        transport,
        "graphql-ws",
        Arc::new(StaticService::new(vec![])),
    )
    .await;
    init_legacy(&mut client).await;

    let ctx = slot.lock().unwrap().take().expect("init hook should have run");
    ctx.set_close_reason("server shutting down");
    ctx.cancel();

    let error = recv_json(&mut client).await;
    assert_eq!(error["type"], "connection_error");
    assert_eq!(error["payload"]["message"], "server shutting down");

    expect_close(&mut client, 1000, "terminated").await;
}

#[tokio::test]
async fn legacy_keep_alive_ticks_at_the_configured_cadence() {
    let transport = Websocket::new().keep_alive_interval(Duration::from_millis(50));
    let mut client = connect(
        transport,
        "graphql-ws",
        Arc::new(StaticService::new(vec![])),
    )
    .await;
    init_legacy(&mut client).await;

    // The immediate post-ack frame was consumed by init_legacy; the ticker
    // must keep them coming.
    assert_eq!(recv_json(&mut client).await["type"], "ka");
    assert_eq!(recv_json(&mut client).await["type"], "ka");
}

//! End-to-end tests against an in-process Mercury gateway.
//!
//! Each test spins up a scripted WebSocket server on a loopback port and
//! drives a real [`TransportClient`] against it: handshake, event
//! delivery, retry, failover, and shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_test::assert_ok;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WsCloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{WebSocketStream, accept_async};

use mercury_client::client::{Interest, OfflineKind, TransportClient, TransportEvent};
use mercury_client::error::{Error, Result};
use mercury_client::providers::{CredentialProvider, RegistrationProvider, UrlResolver};
use mercury_client::{CloseFrame, TransportConfig};

const TIMEOUT: Duration = Duration::from_secs(5);

type ServerWs = WebSocketStream<TcpStream>;

// ============================================================================
// Scripted Gateway
// ============================================================================

/// What one accepted connection does.
#[derive(Clone)]
enum Behavior {
    /// Accept TCP, then drop before the WebSocket handshake.
    DropTcp,
    /// Complete the handshake request, read the authorization frame, then
    /// close with the given code before acknowledging.
    CloseBeforeAuth { code: u16, reason: String },
    /// Like `CloseBeforeAuth` but the close frame carries no status.
    CloseBeforeAuthNoStatus,
    /// Authorize the client, push `events`, answer pings, and optionally
    /// close after the pushed events.
    Serve {
        events: Vec<Value>,
        then_close: Option<(u16, String)>,
    },
    /// Authorize the client but never answer pings.
    ServeNoPong,
}

impl Behavior {
    fn serve() -> Self {
        Self::Serve {
            events: Vec::new(),
            then_close: None,
        }
    }
}

/// Starts a gateway that applies `behaviors` to connections in order,
/// falling back to plain serving once the script runs out. Returns the
/// gateway URL and a counter of accepted connections.
async fn spawn_gateway(behaviors: Vec<Behavior>) -> (String, Arc<AtomicU32>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&connections);
    tokio::spawn(async move {
        let mut behaviors = behaviors.into_iter();
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let behavior = behaviors.next().unwrap_or_else(Behavior::serve);
            match behavior {
                Behavior::DropTcp => drop(stream),
                behavior => {
                    tokio::spawn(async move {
                        if let Ok(ws) = accept_async(stream).await {
                            serve_connection(ws, behavior).await;
                        }
                    });
                }
            }
        }
    });

    (format!("ws://{addr}"), connections)
}

async fn serve_connection(mut ws: ServerWs, behavior: Behavior) {
    match behavior {
        Behavior::DropTcp => unreachable!("handled before the handshake"),

        Behavior::CloseBeforeAuth { code, reason } => {
            read_authorization(&mut ws).await;
            let frame = WsCloseFrame {
                code: CloseCode::from(code),
                reason: reason.into(),
            };
            let _ = ws.send(Message::Close(Some(frame))).await;
            while ws.next().await.is_some() {}
        }

        Behavior::CloseBeforeAuthNoStatus => {
            read_authorization(&mut ws).await;
            let _ = ws.send(Message::Close(None)).await;
            while ws.next().await.is_some() {}
        }

        Behavior::Serve { events, then_close } => {
            read_authorization(&mut ws).await;
            authorize(&mut ws).await;

            for (i, event) in events.into_iter().enumerate() {
                let envelope = json!({
                    "id": format!("evt-{i}"),
                    "sequenceNumber": (i as u64 + 2).to_string(),
                    "data": event,
                });
                let _ = ws.send(Message::Text(envelope.to_string().into())).await;
            }

            if let Some((code, reason)) = then_close {
                let frame = WsCloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                };
                let _ = ws.send(Message::Close(Some(frame))).await;
            }

            // Answer pings until the client goes away. Reading also lets
            // tungstenite complete the close handshake.
            while let Some(Ok(message)) = ws.next().await {
                if let Message::Text(text) = message {
                    let value: Value = serde_json::from_str(text.as_str()).unwrap();
                    if value["type"] == "ping" {
                        let pong = json!({"id": value["id"], "type": "pong"});
                        let _ = ws.send(Message::Text(pong.to_string().into())).await;
                    }
                }
            }
        }

        Behavior::ServeNoPong => {
            read_authorization(&mut ws).await;
            authorize(&mut ws).await;
            while ws.next().await.is_some() {}
        }
    }
}

/// Reads frames until the authorization control frame arrives.
async fn read_authorization(ws: &mut ServerWs) {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                let value: Value = serde_json::from_str(text.as_str()).unwrap();
                if value["type"] == "authorization" {
                    assert!(value["data"]["token"].is_string());
                    return;
                }
            }
            Some(Ok(_)) => {}
            _ => return,
        }
    }
}

/// Acknowledges authorization with a buffer-state event.
async fn authorize(ws: &mut ServerWs) {
    let hello = json!({
        "id": "hello-1",
        "sequenceNumber": "1",
        "data": {"eventType": "mercury.buffer_state"}
    });
    let _ = ws.send(Message::Text(hello.to_string().into())).await;
}

// ============================================================================
// Fake Providers
// ============================================================================

#[derive(Clone, Default)]
struct FakeRegistration {
    registered: Arc<AtomicBool>,
    registers: Arc<AtomicU32>,
    refreshes: Arc<AtomicU32>,
}

#[async_trait]
impl RegistrationProvider for FakeRegistration {
    fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    async fn register(&self) -> Result<()> {
        self.registers.fetch_add(1, Ordering::SeqCst);
        self.registered.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn refresh(&self) -> Result<()> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Clone, Default)]
struct FakeCredentials {
    refreshes: Arc<AtomicU32>,
    forced: Arc<AtomicBool>,
}

#[async_trait]
impl CredentialProvider for FakeCredentials {
    async fn token(&self) -> Result<String> {
        Ok("Bearer test-token".to_string())
    }

    async fn refresh(&self, force: bool) -> Result<()> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        if force {
            self.forced.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[derive(Clone)]
struct FakeUrls {
    primary: String,
    fallback: Option<String>,
    failed: Arc<Mutex<Vec<String>>>,
}

impl FakeUrls {
    fn new(primary: &str) -> Self {
        Self {
            primary: primary.to_string(),
            fallback: None,
            failed: Arc::default(),
        }
    }

    fn with_fallback(primary: &str, fallback: &str) -> Self {
        Self {
            fallback: Some(fallback.to_string()),
            ..Self::new(primary)
        }
    }
}

#[async_trait]
impl UrlResolver for FakeUrls {
    async fn resolve(&self) -> Result<String> {
        Ok(self.primary.clone())
    }

    async fn mark_failed_and_get_new(&self, failed_url: &str) -> Result<String> {
        self.failed.lock().unwrap().push(failed_url.to_string());
        self.fallback
            .clone()
            .ok_or_else(|| Error::url_resolution("no healthy endpoint available"))
    }
}

// ============================================================================
// Fixture
// ============================================================================

struct Fixture {
    client: TransportClient<FakeRegistration, FakeCredentials, FakeUrls>,
    registration: FakeRegistration,
    credentials: FakeCredentials,
    urls: FakeUrls,
}

fn test_config() -> TransportConfig {
    TransportConfig {
        ping_interval: Duration::from_millis(100),
        pong_timeout: Duration::from_millis(1_000),
        backoff_initial: Duration::from_millis(50),
        backoff_max: Duration::from_millis(200),
        force_close_delay: Duration::from_millis(500),
        max_retries: Some(5),
        high_availability: false,
    }
}

fn fixture(url: &str, config: TransportConfig) -> Fixture {
    fixture_with_urls(FakeUrls::new(url), config)
}

fn fixture_with_urls(urls: FakeUrls, config: TransportConfig) -> Fixture {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let registration = FakeRegistration::default();
    let credentials = FakeCredentials::default();
    let client = TransportClient::new(
        config,
        registration.clone(),
        credentials.clone(),
        urls.clone(),
    );
    Fixture {
        client,
        registration,
        credentials,
        urls,
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
    timeout(TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for lifecycle event")
        .expect("lifecycle stream ended")
}

/// Skips lifecycle events until the next offline transition.
async fn next_offline(
    rx: &mut mpsc::UnboundedReceiver<TransportEvent>,
) -> (OfflineKind, CloseFrame) {
    loop {
        if let TransportEvent::Offline { kind, frame } = next_event(rx).await {
            return (kind, frame);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_connect_delivers_events_and_applies_overrides() -> anyhow::Result<()> {
    let (url, _connections) = spawn_gateway(vec![Behavior::Serve {
        events: vec![
            json!({
                "eventType": "mercury.registration_status",
                "localClusterServiceUrls": {"conversation": "https://local.example.com"}
            }),
            json!({
                "eventType": "conversation.activity",
                "activity": {"target": {"url": "https://origin"}},
                "headers": {"activity.target.url": "https://override"}
            }),
        ],
        then_close: None,
    }])
    .await;

    let fx = fixture(&url, test_config());
    let mut lifecycle = fx.client.lifecycle();
    let mut any = fx.client.subscribe(Interest::Any);
    let mut conversation =
        fx.client.subscribe(Interest::Namespace("conversation".to_string()));

    fx.client.connect().await?;
    assert!(fx.client.is_connected());
    assert!(matches!(next_event(&mut lifecycle).await, TransportEvent::Online));

    // Registration happened exactly once on first connect.
    assert_eq!(fx.registration.registers.load(Ordering::SeqCst), 1);

    // The handshake acknowledgment is itself delivered.
    let hello = timeout(TIMEOUT, any.recv()).await?.unwrap();
    assert_eq!(hello.event_type(), Some("mercury.buffer_state"));

    let status = timeout(TIMEOUT, any.recv()).await?.unwrap();
    assert_eq!(status.event_type(), Some("mercury.registration_status"));
    assert_eq!(
        fx.client.local_cluster_service_urls(),
        Some(json!({"conversation": "https://local.example.com"})),
    );

    // The namespace subscriber sees only conversation events, with
    // header overrides already merged.
    let activity = timeout(TIMEOUT, conversation.recv()).await?.unwrap();
    assert_eq!(activity.event_type(), Some("conversation.activity"));
    assert_eq!(activity.data["activity"]["target"]["url"], json!("https://override"));

    fx.client.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn test_registered_handler_runs_for_its_event() -> anyhow::Result<()> {
    let (url, _connections) = spawn_gateway(vec![Behavior::Serve {
        events: vec![json!({"eventType": "presence.update", "status": "active"})],
        then_close: None,
    }])
    .await;

    let fx = fixture(&url, test_config());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    fx.client.register_handler("presence", "update", move |envelope| {
        sink.lock().unwrap().push(envelope.data["status"].clone());
        Ok(())
    });

    // A subscription on the same event tells us when dispatch has run.
    let mut updates = fx.client.subscribe(Interest::Event("presence.update".to_string()));
    fx.client.connect().await?;

    timeout(TIMEOUT, updates.recv()).await?.unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![json!("active")]);

    fx.client.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn test_concurrent_connects_share_one_attempt() -> anyhow::Result<()> {
    let (url, connections) = spawn_gateway(vec![]).await;
    let fx = fixture(&url, test_config());

    let (a, b) = tokio::join!(fx.client.connect(), fx.client.connect());
    assert_ok!(a);
    assert_ok!(b);

    assert_eq!(connections.load(Ordering::SeqCst), 1);
    assert_eq!(fx.registration.registers.load(Ordering::SeqCst), 1);

    // Connecting while connected is a no-op.
    fx.client.connect().await?;
    assert_eq!(connections.load(Ordering::SeqCst), 1);

    fx.client.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn test_transient_failure_retries_until_connected() -> anyhow::Result<()> {
    let (url, connections) =
        spawn_gateway(vec![Behavior::DropTcp, Behavior::DropTcp]).await;
    let fx = fixture(&url, test_config());
    let mut lifecycle = fx.client.lifecycle();

    fx.client.connect().await?;

    assert_eq!(connections.load(Ordering::SeqCst), 3);
    // The first failure is routine and not announced; the failed retry is.
    match next_event(&mut lifecycle).await {
        TransportEvent::ConnectionFailed { retries, .. } => assert_eq!(retries, 1),
        other => panic!("expected connection failure, got {other:?}"),
    }
    assert!(matches!(next_event(&mut lifecycle).await, TransportEvent::Online));

    fx.client.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn test_forbidden_aborts_retries() {
    let (url, connections) = spawn_gateway(vec![Behavior::CloseBeforeAuth {
        code: 4403,
        reason: "not entitled".to_string(),
    }])
    .await;
    let fx = fixture(&url, test_config());

    let result = fx.client.connect().await;
    assert!(matches!(result, Err(Error::Forbidden { code: 4403, .. })));

    // No second attempt was made.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(connections.load(Ordering::SeqCst), 1);
    assert!(!fx.client.is_connected());
}

#[tokio::test]
async fn test_not_authorized_forces_credential_refresh() -> anyhow::Result<()> {
    let (url, connections) = spawn_gateway(vec![Behavior::CloseBeforeAuth {
        code: 4401,
        reason: "authorization failed".to_string(),
    }])
    .await;
    let fx = fixture(&url, test_config());

    fx.client.connect().await?;

    assert_eq!(connections.load(Ordering::SeqCst), 2);
    assert_eq!(fx.credentials.refreshes.load(Ordering::SeqCst), 1);
    assert!(fx.credentials.forced.load(Ordering::SeqCst));

    fx.client.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn test_unknown_response_refreshes_registration() -> anyhow::Result<()> {
    let (url, connections) =
        spawn_gateway(vec![Behavior::CloseBeforeAuthNoStatus]).await;
    let fx = fixture(&url, test_config());

    fx.client.connect().await?;

    assert_eq!(connections.load(Ordering::SeqCst), 2);
    assert_eq!(fx.registration.refreshes.load(Ordering::SeqCst), 1);

    fx.client.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn test_replaced_connection_stays_down() -> anyhow::Result<()> {
    let (url, connections) = spawn_gateway(vec![Behavior::Serve {
        events: vec![],
        then_close: Some((4000, "replaced".to_string())),
    }])
    .await;
    let fx = fixture(&url, test_config());
    let mut lifecycle = fx.client.lifecycle();

    fx.client.connect().await?;

    let (kind, frame) = next_offline(&mut lifecycle).await;
    assert_eq!(kind, OfflineKind::Replaced);
    assert_eq!(frame.code, 4000);

    // No reconnect follows a replacement.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(connections.load(Ordering::SeqCst), 1);
    assert!(!fx.client.is_connected());
    Ok(())
}

#[tokio::test]
async fn test_idle_close_reconnects() -> anyhow::Result<()> {
    let (url, connections) = spawn_gateway(vec![Behavior::Serve {
        events: vec![],
        then_close: Some((1000, "idle".to_string())),
    }])
    .await;
    let fx = fixture(&url, test_config());
    let mut lifecycle = fx.client.lifecycle();

    fx.client.connect().await?;
    assert!(matches!(next_event(&mut lifecycle).await, TransportEvent::Online));

    let (kind, frame) = next_offline(&mut lifecycle).await;
    assert_eq!(kind, OfflineKind::Transient);
    assert_eq!(frame.reason, "idle");

    // The second connection comes up on its own.
    loop {
        if matches!(next_event(&mut lifecycle).await, TransportEvent::Online) {
            break;
        }
    }
    assert_eq!(connections.load(Ordering::SeqCst), 2);

    fx.client.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn test_pong_timeout_triggers_reconnect() -> anyhow::Result<()> {
    let (url, connections) = spawn_gateway(vec![Behavior::ServeNoPong]).await;

    let mut config = test_config();
    config.ping_interval = Duration::from_millis(50);
    config.pong_timeout = Duration::from_millis(150);

    let fx = fixture(&url, config);
    let mut lifecycle = fx.client.lifecycle();

    fx.client.connect().await?;
    assert!(matches!(next_event(&mut lifecycle).await, TransportEvent::Online));

    let (kind, frame) = next_offline(&mut lifecycle).await;
    assert_eq!(kind, OfflineKind::Transient);
    assert_eq!(frame.reason, "Pong not received");

    loop {
        if matches!(next_event(&mut lifecycle).await, TransportEvent::Online) {
            break;
        }
    }
    assert_eq!(connections.load(Ordering::SeqCst), 2);

    fx.client.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn test_high_availability_fails_over_to_new_endpoint() -> anyhow::Result<()> {
    // The primary endpoint refuses every connection; the fallback serves.
    let (primary, primary_connections) =
        spawn_gateway(vec![Behavior::DropTcp, Behavior::DropTcp, Behavior::DropTcp])
            .await;
    let (fallback, fallback_connections) = spawn_gateway(vec![]).await;

    let mut config = test_config();
    config.high_availability = true;

    let urls = FakeUrls::with_fallback(&primary, &fallback);
    let fx = fixture_with_urls(urls, config);

    fx.client.connect().await?;

    assert_eq!(primary_connections.load(Ordering::SeqCst), 1);
    assert_eq!(fallback_connections.load(Ordering::SeqCst), 1);
    assert_eq!(*fx.urls.failed.lock().unwrap(), vec![primary]);

    fx.client.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn test_disconnect_is_idempotent_and_suppresses_reconnect() -> anyhow::Result<()> {
    let (url, connections) = spawn_gateway(vec![]).await;
    let fx = fixture(&url, test_config());
    let mut lifecycle = fx.client.lifecycle();

    fx.client.connect().await?;
    assert!(matches!(next_event(&mut lifecycle).await, TransportEvent::Online));

    fx.client.disconnect().await?;
    assert!(!fx.client.is_connected());

    let (kind, _frame) = next_offline(&mut lifecycle).await;
    assert_eq!(kind, OfflineKind::Permanent);

    // Second disconnect is a no-op.
    fx.client.disconnect().await?;

    // And nothing reconnects behind our back.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(connections.load(Ordering::SeqCst), 1);

    // The client can come back up on demand.
    fx.client.connect().await?;
    assert!(fx.client.is_connected());
    assert_eq!(connections.load(Ordering::SeqCst), 2);

    fx.client.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn test_panicking_handler_does_not_stop_delivery() -> anyhow::Result<()> {
    let (url, _connections) = spawn_gateway(vec![Behavior::Serve {
        events: vec![
            json!({"eventType": "alarm.trip"}),
            json!({"eventType": "conversation.activity"}),
        ],
        then_close: None,
    }])
    .await;

    let fx = fixture(&url, test_config());
    fx.client
        .register_handler("alarm", "trip", |_| panic!("handler exploded"));

    let mut events = fx.client.subscribe(Interest::Any);
    fx.client.connect().await?;

    let hello = timeout(TIMEOUT, events.recv()).await?.unwrap();
    assert_eq!(hello.event_type(), Some("mercury.buffer_state"));
    let tripped = timeout(TIMEOUT, events.recv()).await?.unwrap();
    assert_eq!(tripped.event_type(), Some("alarm.trip"));

    // The event after the panicking handler still arrives.
    let after = timeout(TIMEOUT, events.recv()).await?.unwrap();
    assert_eq!(after.event_type(), Some("conversation.activity"));

    // And the pump is alive to handle the close.
    fx.client.disconnect().await?;
    assert!(!fx.client.is_connected());
    Ok(())
}

#[tokio::test]
async fn test_connect_attempt_survives_caller_cancellation() -> anyhow::Result<()> {
    let (url, connections) =
        spawn_gateway(vec![Behavior::DropTcp, Behavior::DropTcp]).await;

    let mut config = test_config();
    config.backoff_initial = Duration::from_millis(200);
    config.backoff_max = Duration::from_millis(200);
    let fx = fixture(&url, config);

    // A caller that gives up mid-backoff must not strand the attempt.
    let abandoned = timeout(Duration::from_millis(50), fx.client.connect()).await;
    assert!(abandoned.is_err());

    // The attempt keeps running; a later caller joins it and resolves.
    timeout(Duration::from_secs(3), fx.client.connect()).await??;
    assert!(fx.client.is_connected());
    assert_eq!(connections.load(Ordering::SeqCst), 3);

    fx.client.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn test_connect_to_pins_url_and_skips_resolver() -> anyhow::Result<()> {
    let (url, connections) = spawn_gateway(vec![]).await;

    // The resolver points at a dead endpoint; pinning must bypass it.
    let urls = FakeUrls::new("ws://127.0.0.1:9");
    let fx = fixture_with_urls(urls, test_config());

    fx.client.connect_to(&url).await?;
    assert!(fx.client.is_connected());
    assert_eq!(connections.load(Ordering::SeqCst), 1);

    fx.client.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn test_disconnect_while_connecting_aborts() {
    // A gateway that never completes the handshake keeps connect() in
    // its backoff loop.
    let (url, _connections) = spawn_gateway(vec![
        Behavior::DropTcp,
        Behavior::DropTcp,
        Behavior::DropTcp,
        Behavior::DropTcp,
    ])
    .await;

    let mut config = test_config();
    config.backoff_initial = Duration::from_millis(200);
    config.backoff_max = Duration::from_millis(200);

    let fx = fixture(&url, config);
    let client = fx.client.clone();
    let connecting = tokio::spawn(async move { client.connect().await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    fx.client.disconnect().await.unwrap();

    let result = connecting.await.unwrap();
    assert!(matches!(result, Err(Error::Aborted)));
    assert!(!fx.client.is_connected());
}

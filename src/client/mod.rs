//! Managed Mercury connection: lifecycle, retry, and event dispatch.
//!
//! [`TransportClient`] owns the connection lifecycle on top of
//! [`crate::transport`]. It ensures a device registration exists, resolves
//! and decorates the endpoint URL, opens the socket with backoff, pumps
//! socket events into handlers and subscribers, and decides after every
//! closure whether to reconnect.
//!
//! | Piece | Responsibility |
//! |-------|----------------|
//! | [`TransportClient`] | connect/disconnect lifecycle, reconnect policy |
//! | [`dispatch`] | handler registry and subscriber fan-out |
//! | [`TransportEvent`] | observable lifecycle transitions |
//!
//! # Lifecycle
//!
//! Concurrent [`connect`](TransportClient::connect) calls collapse into
//! one attempt; later callers wait on the first. A connected client
//! reconnects automatically after transient closures and goes quiet after
//! permanent ones. [`disconnect`](TransportClient::disconnect) aborts any
//! in-flight attempt, closes the socket gracefully, and suppresses the
//! reconnect the resulting closure would otherwise trigger.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::protocol::{CloseDisposition, CloseFrame, Envelope};
use crate::providers::{CredentialProvider, RegistrationProvider, UrlResolver};
use crate::transport::backoff::{AbortHandle, BackoffCall};
use crate::transport::socket::{Socket, SocketEvent, SocketOptions};

pub mod dispatch;

pub use dispatch::{EventHandler, HandlerRegistry, Interest, Subscribers};

// ============================================================================
// TransportEvent
// ============================================================================

/// Observable lifecycle transitions of a [`TransportClient`].
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The client connected and is receiving events.
    Online,

    /// The connection closed.
    Offline {
        /// Whether the client will reconnect on its own.
        kind: OfflineKind,
        /// The close frame that ended the connection.
        frame: CloseFrame,
    },

    /// A gap in the event stream was detected; messages were lost.
    SequenceMismatch {
        /// Sequence number actually received.
        actual: u64,
        /// Sequence number that was expected.
        expected: u64,
    },

    /// A connection retry failed; the backoff loop decides what happens
    /// next. Not emitted for the initial attempt or for abnormal (1006)
    /// closures.
    ConnectionFailed {
        /// The failure, stringified.
        error: String,
        /// Retries performed before this failure.
        retries: u32,
    },
}

/// What an [`TransportEvent::Offline`] transition means for the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineKind {
    /// The client stays down until [`TransportClient::connect`] is called
    /// again.
    Permanent,
    /// A newer connection superseded this one; the client stays down.
    Replaced,
    /// The client is reconnecting automatically.
    Transient,
}

// ============================================================================
// Connection State
// ============================================================================

/// Connection phase, with piggybacked waiters while connecting.
enum Phase {
    Disconnected,
    Connecting {
        waiters: Vec<oneshot::Sender<Result<()>>>,
    },
    Connected,
}

struct State {
    phase: Phase,
    socket: Option<Socket>,
    abort: Option<AbortHandle>,
    shutting_down: bool,
    pump: Option<JoinHandle<()>>,
}

impl State {
    fn new() -> Self {
        Self {
            phase: Phase::Disconnected,
            socket: None,
            abort: None,
            shutting_down: false,
            pump: None,
        }
    }

    fn is_idle(&self) -> bool {
        matches!(self.phase, Phase::Disconnected) && self.socket.is_none() && self.abort.is_none()
    }
}

// ============================================================================
// TransportClient
// ============================================================================

struct Inner<R, C, U> {
    config: TransportConfig,
    registration: R,
    credentials: C,
    urls: U,
    /// Stable per-client session id; the first half of every tracking id.
    session_id: String,
    state: Mutex<State>,
    /// URL of the most recent successful attempt; reconnects reuse it.
    last_url: Mutex<Option<String>>,
    registry: Mutex<HandlerRegistry>,
    subscribers: Mutex<Subscribers>,
    lifecycle: Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>,
    local_cluster_urls: Mutex<Option<Value>>,
}

/// Managed Mercury connection.
///
/// Cheap to clone; clones share one connection.
pub struct TransportClient<R, C, U> {
    inner: Arc<Inner<R, C, U>>,
}

impl<R, C, U> Clone for TransportClient<R, C, U> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R, C, U> TransportClient<R, C, U>
where
    R: RegistrationProvider + 'static,
    C: CredentialProvider + 'static,
    U: UrlResolver + 'static,
{
    /// Creates a disconnected client.
    #[must_use]
    pub fn new(config: TransportConfig, registration: R, credentials: C, urls: U) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                registration,
                credentials,
                urls,
                session_id: Uuid::new_v4().to_string(),
                state: Mutex::new(State::new()),
                last_url: Mutex::new(None),
                registry: Mutex::new(HandlerRegistry::new()),
                subscribers: Mutex::new(Subscribers::new()),
                lifecycle: Mutex::new(Vec::new()),
                local_cluster_urls: Mutex::new(None),
            }),
        }
    }

    /// Returns the client configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Returns `true` while the client holds a live connection.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self.inner.state.lock().phase, Phase::Connected)
    }

    /// Registers `handler` for events of `namespace.name`.
    ///
    /// One handler per pair; registering again replaces the previous one.
    /// Handler errors and panics are logged and never interrupt delivery
    /// of later events.
    pub fn register_handler(
        &self,
        namespace: impl Into<String>,
        name: impl Into<String>,
        handler: impl Fn(&Envelope) -> Result<()> + Send + Sync + 'static,
    ) {
        self.inner.registry.lock().register(namespace, name, handler);
    }

    /// Subscribes to inbound events matching `interest`.
    pub fn subscribe(&self, interest: Interest) -> mpsc::UnboundedReceiver<Envelope> {
        self.inner.subscribers.lock().subscribe(interest)
    }

    /// Subscribes to lifecycle transitions.
    pub fn lifecycle(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lifecycle.lock().push(tx);
        rx
    }

    /// Cluster-local service URLs from the most recent registration
    /// status event, if one has arrived.
    #[must_use]
    pub fn local_cluster_service_urls(&self) -> Option<Value> {
        self.inner.local_cluster_urls.lock().clone()
    }

    // ------------------------------------------------------------------------
    // Connect
    // ------------------------------------------------------------------------

    /// Connects, retrying with exponential backoff until the socket is
    /// authorized.
    ///
    /// Registers the device first when no registration exists. Concurrent
    /// calls collapse into the in-flight attempt and resolve together;
    /// calling on a connected client is a no-op.
    ///
    /// # Errors
    ///
    /// - [`Error::BadRequest`] / [`Error::Forbidden`]: the service
    ///   rejected the connection outright; retrying would not help.
    /// - [`Error::RetriesExhausted`]: the configured retry ceiling was
    ///   hit.
    /// - [`Error::Aborted`]: [`disconnect`](Self::disconnect) was called
    ///   while connecting.
    pub async fn connect(&self) -> Result<()> {
        self.connect_with(None).await
    }

    /// Like [`connect`](Self::connect) but pins the endpoint URL instead
    /// of asking the [`UrlResolver`].
    ///
    /// High-availability failover still overrides the pinned URL for the
    /// attempt immediately following a marked failure.
    pub async fn connect_to(&self, url: impl Into<String>) -> Result<()> {
        self.connect_with(Some(url.into())).await
    }

    async fn connect_with(&self, pinned: Option<String>) -> Result<()> {
        let (rx, primary) = {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return Err(Error::invalid_state("client is disconnecting"));
            }
            match &mut state.phase {
                Phase::Connected => return Ok(()),
                Phase::Connecting { waiters } => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    (rx, false)
                }
                Phase::Disconnected => {
                    let (tx, rx) = oneshot::channel();
                    state.phase = Phase::Connecting { waiters: vec![tx] };
                    (rx, true)
                }
            }
        };

        // The attempt runs on its own task and every caller, first
        // included, waits on a channel: a caller that drops its future
        // (timeout, select) cannot strand the connecting phase.
        if primary {
            let call = BackoffCall::new(
                self.inner.config.backoff_initial,
                self.inner.config.backoff_max,
                self.inner.config.max_retries,
            );
            // The abort handle goes in before the task starts so a
            // disconnect can cancel the attempt at every stage.
            self.inner.state.lock().abort = Some(call.abort_handle());

            let client = self.clone();
            tokio::spawn(async move {
                let result = client.drive_connect(call, pinned).await;
                client.finish_connect(&result);
            });
        } else {
            debug!("connect already in progress; awaiting existing attempt");
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Aborted),
        }
    }

    /// Runs the full connect sequence on the single-flight task.
    async fn drive_connect(&self, call: BackoffCall, pinned: Option<String>) -> Result<()> {
        if !self.inner.registration.is_registered() {
            info!("device not registered; registering");
            self.inner.registration.register().await?;
        }

        // Endpoint handed back by failover, consumed by the next attempt.
        let failover_url: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let pinned: Arc<Option<String>> = Arc::new(pinned);

        let client = self.clone();
        let (socket, event_rx) = call
            .run(move |retry| {
                let client = client.clone();
                let failover_url = Arc::clone(&failover_url);
                let pinned = Arc::clone(&pinned);
                async move { client.attempt_connection(retry, pinned, failover_url).await }
            })
            .await?;

        let pump = tokio::spawn(self.clone().pump_events(event_rx));
        let raced_shutdown = {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                true
            } else {
                state.socket = Some(socket.clone());
                state.pump = Some(pump);
                state.abort = None;
                false
            }
        };

        // A disconnect that landed mid-handshake wins.
        if raced_shutdown {
            socket.close(None).await?;
            return Err(Error::Aborted);
        }

        self.emit(TransportEvent::Online);
        Ok(())
    }

    /// One socket-open attempt, including the failure side effects that
    /// make the next attempt worth trying.
    async fn attempt_connection(
        &self,
        retry: u32,
        pinned: Arc<Option<String>>,
        failover_url: Arc<Mutex<Option<String>>>,
    ) -> Result<(Socket, mpsc::UnboundedReceiver<SocketEvent>)> {
        // Rebind so the lock guard is gone before any await.
        let failed_over = failover_url.lock().take();
        let raw_url = match failed_over {
            Some(url) => url,
            None => match pinned.as_ref() {
                Some(url) => url.clone(),
                None => self.inner.urls.resolve().await?,
            },
        };
        let url = decorate_url(&raw_url)?;
        let token = self.inner.credentials.token().await?;

        let options = SocketOptions {
            force_close_delay: self.inner.config.force_close_delay,
            ping_interval: self.inner.config.ping_interval,
            pong_timeout: self.inner.config.pong_timeout,
            token,
            tracking_id: self.tracking_id(),
        };

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        match Socket::open(url, options, event_tx).await {
            Ok(socket) => {
                *self.inner.last_url.lock() = Some(raw_url);
                Ok((socket, event_rx))
            }
            Err(error) => {
                self.handle_connection_error(&error, &raw_url, &failover_url)
                    .await;
                // Abnormal closures on the first try are routine; anything
                // past that is worth telling subscribers about.
                if error.close_code() != Some(1006) && retry > 0 {
                    self.emit(TransportEvent::ConnectionFailed {
                        error: error.to_string(),
                        retries: retry,
                    });
                }
                Err(error)
            }
        }
    }

    /// Failure side effects: refresh whatever the failure implicates so
    /// the retry is not doomed to repeat it.
    async fn handle_connection_error(
        &self,
        error: &Error,
        failed_url: &str,
        failover_url: &Arc<Mutex<Option<String>>>,
    ) {
        match error {
            // An unexplained closure usually means the registration this
            // URL came from has gone stale.
            Error::UnknownResponse { .. } => {
                info!("connection closed without status; refreshing registration");
                if let Err(refresh_error) = self.inner.registration.refresh().await {
                    warn!(%refresh_error, "registration refresh failed");
                }
            }
            Error::NotAuthorized { .. } => {
                info!("connection not authorized; refreshing credentials");
                if let Err(refresh_error) = self.inner.credentials.refresh(true).await {
                    warn!(%refresh_error, "credential refresh failed");
                }
            }
            Error::ConnectionFailed { .. } if self.inner.config.high_availability => {
                info!(url = %failed_url, "marking endpoint failed, requesting replacement");
                match self.inner.urls.mark_failed_and_get_new(failed_url).await {
                    Ok(replacement) => *failover_url.lock() = Some(replacement),
                    Err(resolve_error) => {
                        warn!(%resolve_error, "endpoint failover failed");
                    }
                }
            }
            _ => {}
        }
    }

    /// Settles the phase and releases piggybacked waiters.
    fn finish_connect(&self, result: &Result<()>) {
        let waiters = {
            let mut state = self.inner.state.lock();
            state.abort = None;
            let phase = std::mem::replace(
                &mut state.phase,
                if result.is_ok() {
                    Phase::Connected
                } else {
                    Phase::Disconnected
                },
            );
            match phase {
                Phase::Connecting { waiters } => waiters,
                _ => Vec::new(),
            }
        };

        for waiter in waiters {
            let _ = waiter.send(match result {
                Ok(()) => Ok(()),
                Err(error) => Err(error.duplicate()),
            });
        }
    }

    /// Client tracking id: `<session>_<millis>`.
    fn tracking_id(&self) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        format!("{}_{}", self.inner.session_id, millis)
    }

    // ------------------------------------------------------------------------
    // Disconnect
    // ------------------------------------------------------------------------

    /// Disconnects and stays down until the next
    /// [`connect`](Self::connect).
    ///
    /// Aborts an in-flight connection attempt, closes a live socket
    /// gracefully, and waits for the event pump to drain. Idempotent.
    ///
    /// # Errors
    ///
    /// Propagates a failure to close the socket; the client still ends up
    /// disconnected.
    pub async fn disconnect(&self) -> Result<()> {
        let (socket, abort, pump) = {
            let mut state = self.inner.state.lock();
            if state.is_idle() {
                info!("client already disconnected");
                return Ok(());
            }
            state.shutting_down = true;
            (state.socket.take(), state.abort.take(), state.pump.take())
        };

        info!("disconnecting");
        if let Some(abort) = abort {
            abort.abort();
        }

        let close_result = match socket {
            Some(socket) => socket.close(None).await,
            None => Ok(()),
        };

        if let Some(pump) = pump {
            let _ = pump.await;
        }

        {
            let mut state = self.inner.state.lock();
            state.phase = Phase::Disconnected;
            state.shutting_down = false;
        }

        close_result
    }

    // ------------------------------------------------------------------------
    // Event Pump
    // ------------------------------------------------------------------------

    /// Consumes socket events until the socket closes.
    async fn pump_events(self, mut event_rx: mpsc::UnboundedReceiver<SocketEvent>) {
        while let Some(event) = event_rx.recv().await {
            match event {
                SocketEvent::Message(mut envelope) => {
                    envelope.apply_overrides();
                    self.handle_message(envelope);
                }
                SocketEvent::Pong(_) => {}
                SocketEvent::SequenceMismatch { actual, expected } => {
                    warn!(actual, expected, "event stream gap detected");
                    self.emit(TransportEvent::SequenceMismatch { actual, expected });
                }
                SocketEvent::Close(frame) => {
                    self.handle_close(frame);
                    break;
                }
            }
        }
        debug!("event pump terminated");
    }

    /// Dispatches one inbound event.
    fn handle_message(&self, envelope: Envelope) {
        if envelope.event_type() == Some("mercury.registration_status")
            && let Some(urls) = envelope.data.get("localClusterServiceUrls")
        {
            debug!("updating local cluster service urls");
            *self.inner.local_cluster_urls.lock() = Some(urls.clone());
        }

        let handled = self.inner.registry.lock().dispatch(&envelope);
        let delivered = self.inner.subscribers.lock().deliver(&envelope);
        if !handled && delivered == 0 {
            debug!(
                event_type = ?envelope.event_type(),
                "no handler or subscriber for event",
            );
        }
    }

    /// Reacts to the socket closing: classify, notify, maybe reconnect.
    fn handle_close(&self, frame: CloseFrame) {
        let disposition = frame.classify();
        let shutting_down = {
            let mut state = self.inner.state.lock();
            state.socket = None;
            state.phase = Phase::Disconnected;
            state.shutting_down
        };

        info!(
            code = frame.code,
            reason = %frame.reason,
            disposition = ?disposition,
            "socket closed",
        );

        match disposition {
            CloseDisposition::Transient if !shutting_down => {
                self.emit(TransportEvent::Offline {
                    kind: OfflineKind::Transient,
                    frame,
                });
                // Reconnect to the endpoint we were just talking to.
                let client = self.clone();
                let last_url = self.inner.last_url.lock().clone();
                tokio::spawn(async move {
                    if let Err(error) = client.connect_with(last_url).await {
                        warn!(%error, "reconnect failed");
                    }
                });
            }
            CloseDisposition::Replaced => {
                self.emit(TransportEvent::Offline {
                    kind: OfflineKind::Replaced,
                    frame,
                });
            }
            CloseDisposition::Unexpected => {
                warn!(code = frame.code, "unrecognized close code; staying down");
                self.emit(TransportEvent::Offline {
                    kind: OfflineKind::Permanent,
                    frame,
                });
            }
            // Transient-while-shutting-down lands here too: the closure
            // came from our own disconnect.
            _ => {
                self.emit(TransportEvent::Offline {
                    kind: OfflineKind::Permanent,
                    frame,
                });
            }
        }
    }

    /// Delivers a lifecycle event, pruning dead subscribers.
    fn emit(&self, event: TransportEvent) {
        self.inner
            .lifecycle
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

// ============================================================================
// URL Decoration
// ============================================================================

/// Appends the query parameters Mercury expects from text-mode clients.
fn decorate_url(raw: &str) -> Result<String> {
    let mut url = Url::parse(raw).map_err(|e| Error::url_resolution(e.to_string()))?;
    url.query_pairs_mut()
        .append_pair("outboundWireFormat", "text")
        .append_pair("bufferStates", "true")
        .append_pair("aliasHttpStatus", "true");
    Ok(url.into())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decorate_url_appends_wire_format_params() {
        let url = decorate_url("wss://mercury.example.com/v1/apps/wx2").unwrap();
        assert_eq!(
            url,
            "wss://mercury.example.com/v1/apps/wx2?outboundWireFormat=text&bufferStates=true&aliasHttpStatus=true",
        );
    }

    #[test]
    fn test_decorate_url_preserves_existing_query() {
        let url = decorate_url("wss://mercury.example.com/v1?mercuryRegistrationStatus=true")
            .unwrap();
        assert!(url.starts_with("wss://mercury.example.com/v1?mercuryRegistrationStatus=true&"));
        assert!(url.contains("outboundWireFormat=text"));
    }

    #[test]
    fn test_decorate_url_rejects_garbage() {
        assert!(matches!(
            decorate_url("not a url"),
            Err(Error::UrlResolution { .. })
        ));
    }
}

//! Socket: one WebSocket connection and its liveness protocol.
//!
//! A [`Socket`] owns exactly one underlying WebSocket. It performs the
//! authorization handshake on open, acknowledges every inbound frame,
//! tracks sequence numbers for gap detection, and runs the ping/pong
//! liveness loop. All state transitions are observable through the
//! [`SocketEvent`] stream handed to [`Socket::open`]; there is no
//! callback API.
//!
//! # Event Loop
//!
//! The socket spawns a tokio task that multiplexes:
//!
//! - Inbound frames from the service (messages, pongs, close)
//! - Outbound sends and close requests from the owning client
//! - The ping interval, pong timeout, and force-close timers

// ============================================================================
// Imports
// ============================================================================

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Sleep, sleep};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WsCloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::protocol::{CloseFrame, ControlFrame, Envelope};

// ============================================================================
// Types
// ============================================================================

/// The underlying stream produced by [`connect_async`].
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Write half of the socket.
type WsSink = SplitSink<WsStream, Message>;

/// An optional armed timer. `None` means the timer is not running.
type Timer = Option<Pin<Box<Sleep>>>;

// ============================================================================
// SocketOptions
// ============================================================================

/// Options required to open a socket.
#[derive(Clone)]
pub struct SocketOptions {
    /// How long a graceful close waits for the server's close
    /// acknowledgment before the closure is forced locally.
    pub force_close_delay: Duration,
    /// Interval between liveness pings.
    pub ping_interval: Duration,
    /// How long to wait for a pong before closing the socket.
    pub pong_timeout: Duration,
    /// Bearer token for the authorization handshake.
    pub token: String,
    /// Client tracking id, `<session>_<millis>`.
    pub tracking_id: String,
}

impl std::fmt::Debug for SocketOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketOptions")
            .field("force_close_delay", &self.force_close_delay)
            .field("ping_interval", &self.ping_interval)
            .field("pong_timeout", &self.pong_timeout)
            .field("token", &"<redacted>")
            .field("tracking_id", &self.tracking_id)
            .finish()
    }
}

// ============================================================================
// CloseOptions
// ============================================================================

/// Code and reason for a graceful close.
#[derive(Debug, Clone)]
pub struct CloseOptions {
    /// Close code; must be 1000 or between 3000 and 4999 inclusive.
    pub code: u16,
    /// Close reason.
    pub reason: String,
}

impl Default for CloseOptions {
    fn default() -> Self {
        Self {
            code: 1000,
            reason: "Done".to_string(),
        }
    }
}

// ============================================================================
// SocketEvent
// ============================================================================

/// Observable socket state transitions.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// An ordinary message envelope arrived.
    Message(Envelope),

    /// A pong reply arrived.
    Pong(Envelope),

    /// A gap was detected between consecutive sequence numbers.
    ///
    /// Advisory: the message that exposed the gap is still delivered.
    SequenceMismatch {
        /// Sequence number actually received.
        actual: u64,
        /// Sequence number that was expected.
        expected: u64,
    },

    /// The socket closed. Terminal; no further events follow.
    Close(CloseFrame),
}

// ============================================================================
// SocketCommand
// ============================================================================

/// Internal commands for the event loop.
enum SocketCommand {
    /// Transmit a serialized text frame.
    Send {
        text: String,
        done: oneshot::Sender<Result<()>>,
    },
    /// Begin a graceful close.
    Close {
        code: u16,
        reason: String,
        done: oneshot::Sender<Result<()>>,
    },
}

// ============================================================================
// Socket
// ============================================================================

/// Handle to one live WebSocket connection.
///
/// Cheap to clone; all clones drive the same underlying connection. The
/// connection closes gracefully when the last handle is dropped.
#[derive(Clone)]
pub struct Socket {
    /// Channel to the event loop.
    command_tx: mpsc::UnboundedSender<SocketCommand>,
    /// URL the socket was opened against.
    url: String,
    /// Cleared by the event loop on termination.
    open: Arc<AtomicBool>,
}

impl Socket {
    /// Opens a socket and completes the authorization handshake.
    ///
    /// Connects to `url`, sends an authorization frame bearing the token
    /// and tracking id, and waits for the service's buffer-state or
    /// registration-status acknowledgment before resolving and starting
    /// the ping loop. Events (including any messages that arrive before
    /// authorization completes) are delivered on `event_tx`.
    ///
    /// # Errors
    ///
    /// A closure before authorization completes maps by normalized close
    /// code: 1005 → [`Error::UnknownResponse`], 4400 →
    /// [`Error::BadRequest`], 4401 → [`Error::NotAuthorized`], 4403 →
    /// [`Error::Forbidden`], anything else →
    /// [`Error::ConnectionFailed`]. Failures to reach the endpoint at
    /// all surface as [`Error::ConnectionFailed`] with code 0.
    pub async fn open(
        url: impl Into<String>,
        options: SocketOptions,
        event_tx: mpsc::UnboundedSender<SocketEvent>,
    ) -> Result<Self> {
        let url = url.into();
        if url.is_empty() {
            return Err(Error::invalid_state("`url` is required"));
        }

        info!(%url, "creating websocket");
        let (ws_stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::connection_failed(0, e.to_string()))?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (auth_tx, auth_rx) = oneshot::channel();
        let open = Arc::new(AtomicBool::new(true));

        tokio::spawn(run_event_loop(
            ws_stream,
            command_rx,
            event_tx,
            options,
            auth_tx,
            Arc::clone(&open),
        ));

        // Resolves once the service acknowledges the authorization, or
        // rejects with the mapped close error.
        auth_rx.await.map_err(|_| Error::ConnectionClosed)??;
        info!("socket authorized");

        Ok(Self {
            command_tx,
            url,
            open,
        })
    }

    /// Returns the URL this socket was opened against.
    #[inline]
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns `true` while the connection is live.
    #[inline]
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Serializes `data` to JSON text and transmits it.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] when the socket is not open;
    /// [`Error::Json`] when serialization fails.
    pub async fn send<T: Serialize>(&self, data: &T) -> Result<()> {
        if !self.is_open() {
            return Err(Error::invalid_state("socket is not open"));
        }

        let text = serde_json::to_string(data)?;
        let (done_tx, done_rx) = oneshot::channel();
        self.command_tx
            .send(SocketCommand::Send {
                text,
                done: done_tx,
            })
            .map_err(|_| Error::ConnectionClosed)?;

        done_rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Requests a graceful close and waits for it to complete.
    ///
    /// Waits for the server's close acknowledgment up to the socket's
    /// force-close delay, after which the closure is forced locally
    /// (observable as a close event with reason `"Done (forced)"`).
    /// Resolves immediately when the socket is already closed.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidCloseCode`] when the code is not 1000 and not in
    /// 3000–4999.
    pub async fn close(&self, options: Option<CloseOptions>) -> Result<()> {
        let options = options.unwrap_or_default();

        if !self.is_open() {
            info!("socket already closed");
            return Ok(());
        }

        let (done_tx, done_rx) = oneshot::channel();
        if self
            .command_tx
            .send(SocketCommand::Close {
                code: options.code,
                reason: options.reason,
                done: done_tx,
            })
            .is_err()
        {
            // Event loop already gone; nothing left to close.
            return Ok(());
        }

        match done_rx.await {
            Ok(result) => result,
            Err(_) => Ok(()),
        }
    }
}

// ============================================================================
// Event Loop
// ============================================================================

/// Event loop that owns the WebSocket I/O, timers, and handshake state.
async fn run_event_loop(
    ws_stream: WsStream,
    mut command_rx: mpsc::UnboundedReceiver<SocketCommand>,
    event_tx: mpsc::UnboundedSender<SocketEvent>,
    options: SocketOptions,
    auth_tx: oneshot::Sender<Result<()>>,
    open: Arc<AtomicBool>,
) {
    let (mut ws_write, mut ws_read) = ws_stream.split();

    let mut auth_tx = Some(auth_tx);
    let mut expected_sequence: Option<u64> = None;
    let mut awaiting_pong: Option<String> = None;
    let mut close_waiters: Vec<oneshot::Sender<Result<()>>> = Vec::new();
    let mut commands_open = true;

    let mut ping_timer: Timer = None;
    let mut pong_timer: Timer = None;
    let mut force_close_timer: Timer = None;

    info!("authorizing");
    let auth = ControlFrame::authorization(options.token.clone(), options.tracking_id.clone());
    if let Err(error) = send_frame(&mut ws_write, &auth).await {
        if let Some(tx) = auth_tx.take() {
            let _ = tx.send(Err(Error::connection_failed(1006, error.to_string())));
        }
        open.store(false, Ordering::SeqCst);
        return;
    }

    let close_frame = loop {
        tokio::select! {
            message = ws_read.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        let envelope = match Envelope::parse(text.as_str()) {
                            Ok(envelope) => envelope,
                            Err(error) => {
                                // Nothing to do with an unparsable frame
                                // but skip it.
                                warn!(%error, "error while receiving websocket message");
                                continue;
                            }
                        };

                        // Sequence gap detection. Advisory: the message is
                        // still delivered below.
                        if let Some(actual) = envelope.sequence_number {
                            if let Some(expected) = expected_sequence
                                && actual != expected
                            {
                                debug!(
                                    actual,
                                    expected,
                                    "sequence number mismatch indicates lost message",
                                );
                                let _ = event_tx.send(SocketEvent::SequenceMismatch {
                                    actual,
                                    expected,
                                });
                            }
                            expected_sequence = Some(actual + 1);
                        }

                        // Acknowledge by message id.
                        if let Some(id) = envelope.id.clone()
                            && let Err(error) =
                                send_frame(&mut ws_write, &ControlFrame::ack(id)).await
                        {
                            warn!(%error, "failed to acknowledge message");
                        }

                        if envelope.is_pong() {
                            debug!(pong_id = ?envelope.id, "pong");
                            if let Some(expected_id) = awaiting_pong.take() {
                                if envelope.id.as_deref() == Some(expected_id.as_str()) {
                                    pong_timer = None;
                                    ping_timer =
                                        Some(Box::pin(sleep(options.ping_interval)));
                                } else {
                                    info!(
                                        expected = %expected_id,
                                        received = ?envelope.id,
                                        "received pong for wrong ping id, closing socket",
                                    );
                                    begin_close(
                                        &mut ws_write,
                                        &mut force_close_timer,
                                        options.force_close_delay,
                                        1000,
                                        "Pong mismatch",
                                    )
                                    .await;
                                }
                            }
                            let _ = event_tx.send(SocketEvent::Pong(envelope));
                        } else {
                            // The first buffer-state or registration-status
                            // event completes the authorization handshake
                            // and starts the ping loop.
                            if auth_tx.is_some()
                                && !envelope.is_control()
                                && matches!(
                                    envelope.event_type(),
                                    Some("mercury.buffer_state")
                                        | Some("mercury.registration_status"),
                                )
                            {
                                if let Some(tx) = auth_tx.take() {
                                    let _ = tx.send(Ok(()));
                                }
                                ping_timer = Some(Box::pin(sleep(Duration::ZERO)));
                            }
                            let _ = event_tx.send(SocketEvent::Message(envelope));
                        }
                    }

                    Some(Ok(Message::Close(frame))) => {
                        let frame = CloseFrame::from_ws(frame).normalize();
                        info!(code = frame.code, reason = %frame.reason, "socket closed");
                        break frame;
                    }

                    Some(Err(error)) => {
                        warn!(%error, "websocket error");
                        break CloseFrame::new(1006, error.to_string());
                    }

                    None => {
                        debug!("websocket stream ended");
                        break CloseFrame::new(1006, "");
                    }

                    // Transport-level ping/pong and binary frames play no
                    // part in the Mercury protocol.
                    _ => {}
                }
            }

            command = command_rx.recv(), if commands_open => {
                match command {
                    Some(SocketCommand::Send { text, done }) => {
                        let result = ws_write
                            .send(Message::Text(text.into()))
                            .await
                            .map_err(Error::from);
                        let _ = done.send(result);
                    }

                    Some(SocketCommand::Close { code, reason, done }) => {
                        if code != 1000 && !(3000..=4999).contains(&code) {
                            let _ = done.send(Err(Error::InvalidCloseCode { code }));
                        } else {
                            close_waiters.push(done);
                            begin_close(
                                &mut ws_write,
                                &mut force_close_timer,
                                options.force_close_delay,
                                code,
                                &reason,
                            )
                            .await;
                        }
                    }

                    None => {
                        // All handles dropped; close out gracefully.
                        commands_open = false;
                        begin_close(
                            &mut ws_write,
                            &mut force_close_timer,
                            options.force_close_delay,
                            1000,
                            "Done",
                        )
                        .await;
                    }
                }
            }

            _ = armed(&mut ping_timer) => {
                ping_timer = None;
                let (frame, id) = ControlFrame::ping();
                debug!(ping_id = %id, "ping");
                awaiting_pong = Some(id);
                pong_timer = Some(Box::pin(sleep(options.pong_timeout)));
                if let Err(error) = send_frame(&mut ws_write, &frame).await {
                    warn!(%error, "failed to send ping");
                }
            }

            _ = armed(&mut pong_timer) => {
                pong_timer = None;
                info!("pong not received in expected period, closing socket");
                begin_close(
                    &mut ws_write,
                    &mut force_close_timer,
                    options.force_close_delay,
                    1000,
                    "Pong not received",
                )
                .await;
            }

            _ = armed(&mut force_close_timer) => {
                info!("no close event received, forcing closure");
                break CloseFrame::new(1000, "Done (forced)");
            }
        }
    };

    open.store(false, Ordering::SeqCst);

    // A closure before authorization completes rejects open() instead of
    // emitting a close event.
    if let Some(tx) = auth_tx.take() {
        let _ = tx.send(Err(close_frame.into_open_error()));
    } else {
        let _ = event_tx.send(SocketEvent::Close(close_frame));
    }

    for waiter in close_waiters {
        let _ = waiter.send(Ok(()));
    }

    debug!("socket event loop terminated");
}

// ============================================================================
// Event Loop Helpers
// ============================================================================

/// Awaits an armed timer; pending forever when unarmed.
async fn armed(timer: &mut Timer) {
    match timer.as_mut() {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

/// Serializes and transmits a control frame.
async fn send_frame(ws_write: &mut WsSink, frame: &ControlFrame) -> Result<()> {
    let json = serde_json::to_string(frame)?;
    ws_write.send(Message::Text(json.into())).await?;
    Ok(())
}

/// Sends a close frame and arms the force-close timer.
///
/// No-op when a close is already in progress.
async fn begin_close(
    ws_write: &mut WsSink,
    force_close_timer: &mut Timer,
    force_close_delay: Duration,
    code: u16,
    reason: &str,
) {
    if force_close_timer.is_some() {
        return;
    }

    info!(code, reason, "closing socket");
    let frame = WsCloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    };
    if let Err(error) = ws_write.send(Message::Close(Some(frame))).await {
        warn!(%error, "failed to send close frame");
    }
    *force_close_timer = Some(Box::pin(sleep(force_close_delay)));
}

// ============================================================================
// Tests
// ============================================================================

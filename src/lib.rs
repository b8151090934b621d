//! Mercury client - Reconnecting WebSocket transport for event delivery.
//!
//! This library maintains a long-lived connection to a Mercury event
//! gateway: it authorizes the socket, acknowledges and orders inbound
//! messages, keeps the link alive with application-level ping/pong, and
//! reconnects with exponential backoff when the link drops.
//!
//! # Architecture
//!
//! Three layers, each observable through a channel rather than callbacks:
//!
//! - **Socket**: one WebSocket connection; handshake, acks, liveness
//! - **Backoff**: retried connection attempts with cooperative abort
//! - **Client**: lifecycle management, close classification, dispatch
//!
//! Key design principles:
//!
//! - Every closure is classified before the reconnect decision
//! - Concurrent connects collapse into one in-flight attempt
//! - Registration, credentials, and endpoints come from provider traits
//! - Event-driven architecture (no polling)
//!
//! # Quick Start
//!
//! ```no_run
//! use mercury_client::{Interest, TransportClient, TransportConfig, Result};
//! # use mercury_client::providers::{CredentialProvider, RegistrationProvider, UrlResolver};
//! # async fn run<R, C, U>(registration: R, credentials: C, urls: U) -> Result<()>
//! # where
//! #     R: RegistrationProvider + 'static,
//! #     C: CredentialProvider + 'static,
//! #     U: UrlResolver + 'static,
//! # {
//! let client = TransportClient::new(
//!     TransportConfig::default(),
//!     registration,
//!     credentials,
//!     urls,
//! );
//!
//! let mut events = client.subscribe(Interest::Namespace("conversation".to_string()));
//! client.connect().await?;
//!
//! while let Some(envelope) = events.recv().await {
//!     println!("{:?}", envelope.event_type());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`client`] | Managed connection: lifecycle, reconnect, dispatch |
//! | [`config`] | Timing and retry configuration |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`protocol`] | Wire types: control frames, envelopes, close codes |
//! | [`providers`] | Registration, credential, and URL provider traits |
//! | [`transport`] | Socket and backoff internals |

// ============================================================================
// Modules
// ============================================================================

/// Managed connection: lifecycle, reconnect policy, event dispatch.
///
/// [`TransportClient`] is the main entry point of the library.
pub mod client;

/// Timing and retry configuration.
pub mod config;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Wire protocol types.
///
/// Control frames sent by the client, envelopes received from the
/// service, and close-code classification.
pub mod protocol;

/// Provider traits for the environment the client runs in.
pub mod providers;

/// Socket and backoff internals.
///
/// Most consumers only need [`client`]; this layer is public for tests
/// and for callers managing a single connection by hand.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Client types
pub use client::{
    HandlerRegistry, Interest, OfflineKind, TransportClient, TransportEvent,
};

// Configuration
pub use config::TransportConfig;

// Error types
pub use error::{Error, Result};

// Protocol types
pub use protocol::{CloseDisposition, CloseFrame, ControlFrame, Envelope};

// Transport types
pub use transport::{CloseOptions, Socket, SocketEvent, SocketOptions};

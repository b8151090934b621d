//! Connection transport: the raw socket and the retry driver.
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`socket`] | One WebSocket connection: handshake, acks, ping/pong, close |
//! | [`backoff`] | Exponential-backoff retry loop with cooperative abort |
//!
//! The transport layer knows nothing about registration, credentials, or
//! event dispatch; [`crate::client`] composes those on top.

pub mod backoff;
pub mod socket;

pub use backoff::{AbortHandle, BackoffCall, BackoffSchedule};
pub use socket::{CloseOptions, Socket, SocketEvent, SocketOptions};

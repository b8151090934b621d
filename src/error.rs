//! Error types for the Mercury transport client.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use mercury_client::{Result, TransportClient};
//!
//! async fn example(client: &TransportClient) -> Result<()> {
//!     client.connect(None).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Connection lifecycle | [`Error::BadRequest`], [`Error::NotAuthorized`], [`Error::Forbidden`], [`Error::UnknownResponse`], [`Error::ConnectionFailed`] |
//! | Socket state | [`Error::InvalidState`], [`Error::InvalidCloseCode`], [`Error::ConnectionClosed`] |
//! | Backoff | [`Error::Aborted`], [`Error::RetriesExhausted`] |
//! | Providers | [`Error::Registration`], [`Error::Credentials`], [`Error::UrlResolution`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`], [`Error::ChannelClosed`] |
//!
//! Connection-lifecycle errors are raised only during the open/authorize
//! phase and carry the originating close code and reason. Fatal variants
//! ([`Error::BadRequest`], [`Error::Forbidden`]) abort the backoff loop
//! immediately; everything else is retried.

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;
use tokio_tungstenite::tungstenite::Error as WsError;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging. The
/// connection-lifecycle variants map one-to-one onto the close codes the
/// Mercury service uses before authorization completes.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Connection Lifecycle Errors
    // ========================================================================
    /// Service rejected the connection outright (close code 4400).
    ///
    /// Usually means the current credentials belong to an account class
    /// that cannot open a realtime session. Fatal: never retried.
    #[error("Bad request (close code {code}): {reason}")]
    BadRequest {
        /// Close code received from the server.
        code: u16,
        /// Close reason received from the server.
        reason: String,
    },

    /// Authorization failed (close code 4401).
    ///
    /// Implies an expired token. Triggers one forced credential refresh
    /// before the next attempt.
    #[error("Not authorized (close code {code}): {reason}")]
    NotAuthorized {
        /// Close code received from the server.
        code: u16,
        /// Close reason received from the server.
        reason: String,
    },

    /// User is not entitled to the service (close code 4403). Fatal.
    #[error("Forbidden (close code {code}): {reason}")]
    Forbidden {
        /// Close code received from the server.
        code: u16,
        /// Close reason received from the server.
        reason: String,
    },

    /// Ambiguous closure before authorization (close code 1005).
    ///
    /// Some platforms collapse distinct close codes into 1005, so this is
    /// treated as a stale-registration signal: the device registration is
    /// refreshed and the attempt retried.
    #[error("Unknown response (close code {code}): {reason}")]
    UnknownResponse {
        /// Close code received from the server.
        code: u16,
        /// Close reason received from the server.
        reason: String,
    },

    /// Generic pre-authorization connection failure.
    ///
    /// Retryable; in high-availability mode it additionally triggers an
    /// endpoint failover before the next attempt.
    #[error("Connection failed (close code {code}): {reason}")]
    ConnectionFailed {
        /// Close code received from the server (0 when none was observed).
        code: u16,
        /// Description of the failure.
        reason: String,
    },

    // ========================================================================
    // Socket State Errors
    // ========================================================================
    /// Socket operation attempted while not in the open ready-state.
    #[error("Invalid socket state: {message}")]
    InvalidState {
        /// Description of the state violation.
        message: String,
    },

    /// Close code outside the range permitted by the websocket protocol.
    ///
    /// Close codes must be 1000 or between 3000 and 4999 inclusive.
    #[error("Invalid close code: {code}")]
    InvalidCloseCode {
        /// The rejected close code.
        code: u16,
    },

    /// Socket closed while an operation was outstanding.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Backoff Errors
    // ========================================================================
    /// Connect attempt sequence was aborted cooperatively.
    #[error("Connection attempt aborted")]
    Aborted,

    /// Retry ceiling exceeded without a successful attempt.
    #[error("Gave up connecting after {retries} retries")]
    RetriesExhausted {
        /// Number of retries performed before giving up.
        retries: u32,
    },

    // ========================================================================
    // Provider Errors
    // ========================================================================
    /// Device registration provider failed.
    #[error("Registration error: {message}")]
    Registration {
        /// Description of the registration failure.
        message: String,
    },

    /// Credential provider failed.
    #[error("Credentials error: {message}")]
    Credentials {
        /// Description of the credential failure.
        message: String,
    },

    /// Websocket URL could not be resolved.
    #[error("URL resolution error: {message}")]
    UrlResolution {
        /// Description of the resolution failure.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Channel receive error.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a bad request error.
    #[inline]
    pub fn bad_request(code: u16, reason: impl Into<String>) -> Self {
        Self::BadRequest {
            code,
            reason: reason.into(),
        }
    }

    /// Creates a not authorized error.
    #[inline]
    pub fn not_authorized(code: u16, reason: impl Into<String>) -> Self {
        Self::NotAuthorized {
            code,
            reason: reason.into(),
        }
    }

    /// Creates a forbidden error.
    #[inline]
    pub fn forbidden(code: u16, reason: impl Into<String>) -> Self {
        Self::Forbidden {
            code,
            reason: reason.into(),
        }
    }

    /// Creates an unknown response error.
    #[inline]
    pub fn unknown_response(code: u16, reason: impl Into<String>) -> Self {
        Self::UnknownResponse {
            code,
            reason: reason.into(),
        }
    }

    /// Creates a generic connection failure.
    #[inline]
    pub fn connection_failed(code: u16, reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            code,
            reason: reason.into(),
        }
    }

    /// Creates an invalid state error.
    #[inline]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates a registration error.
    #[inline]
    pub fn registration(message: impl Into<String>) -> Self {
        Self::Registration {
            message: message.into(),
        }
    }

    /// Creates a credentials error.
    #[inline]
    pub fn credentials(message: impl Into<String>) -> Self {
        Self::Credentials {
            message: message.into(),
        }
    }

    /// Creates a URL resolution error.
    #[inline]
    pub fn url_resolution(message: impl Into<String>) -> Self {
        Self::UrlResolution {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this failure must abort the backoff loop.
    ///
    /// `BadRequest` implies the credentials can never open a realtime
    /// session; `Forbidden` implies the user is not entitled. Retrying
    /// either would hammer a permanently rejecting server.
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::BadRequest { .. } | Self::Forbidden { .. })
    }

    /// Returns `true` if this is a pre-authorization lifecycle error.
    #[inline]
    #[must_use]
    pub fn is_lifecycle_error(&self) -> bool {
        matches!(
            self,
            Self::BadRequest { .. }
                | Self::NotAuthorized { .. }
                | Self::Forbidden { .. }
                | Self::UnknownResponse { .. }
                | Self::ConnectionFailed { .. }
        )
    }

    /// Returns the close code carried by a lifecycle error, if any.
    #[inline]
    #[must_use]
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::BadRequest { code, .. }
            | Self::NotAuthorized { code, .. }
            | Self::Forbidden { code, .. }
            | Self::UnknownResponse { code, .. }
            | Self::ConnectionFailed { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Best-effort copy, for fanning one failure out to several waiting
    /// callers.
    ///
    /// Variants wrapping non-cloneable external errors collapse into
    /// [`Error::ConnectionFailed`] with code 0 and the original message.
    #[must_use]
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Self::BadRequest { code, reason } => Self::bad_request(*code, reason),
            Self::NotAuthorized { code, reason } => Self::not_authorized(*code, reason),
            Self::Forbidden { code, reason } => Self::forbidden(*code, reason),
            Self::UnknownResponse { code, reason } => Self::unknown_response(*code, reason),
            Self::ConnectionFailed { code, reason } => Self::connection_failed(*code, reason),
            Self::InvalidState { message } => Self::invalid_state(message),
            Self::InvalidCloseCode { code } => Self::InvalidCloseCode { code: *code },
            Self::ConnectionClosed => Self::ConnectionClosed,
            Self::Aborted => Self::Aborted,
            Self::RetriesExhausted { retries } => Self::RetriesExhausted { retries: *retries },
            Self::Registration { message } => Self::registration(message),
            Self::Credentials { message } => Self::credentials(message),
            Self::UrlResolution { message } => Self::url_resolution(message),
            Self::Io(_) | Self::Json(_) | Self::WebSocket(_) | Self::ChannelClosed(_) => {
                Self::connection_failed(0, self.to_string())
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

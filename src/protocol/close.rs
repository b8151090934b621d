//! Close frames, code normalization, and closure classification.
//!
//! Mercury signals connection outcomes through websocket close codes. Two
//! wrinkles make this more than a passthrough:
//!
//! 1. Some platforms collapse distinct close codes into 1005 (no status
//!    received) while preserving the close *reason* string, so codes are
//!    reconstructed from known reasons before any decision is made.
//! 2. A closure is either transient (reconnect automatically) or fatal
//!    (surface to the caller, do not retry); getting the split wrong
//!    causes either retry storms or premature abandonment.

// ============================================================================
// Imports
// ============================================================================

use tokio_tungstenite::tungstenite::protocol::CloseFrame as WsCloseFrame;
use tracing::debug;

use crate::error::Error;

// ============================================================================
// Constants
// ============================================================================

/// Lowercased close reasons on a 1000 (normal) closure that still warrant
/// an automatic reconnect.
pub const NORMAL_RECONNECT_REASONS: [&str; 4] = [
    "idle",
    "done (forced)",
    "pong not received",
    "pong mismatch",
];

/// Close code reported when no status was received (RFC 6455 §7.1.5).
pub(crate) const CODE_NO_STATUS: u16 = 1005;

/// Mercury's "superseded by another connection" close code.
pub(crate) const CODE_REPLACED: u16 = 4000;

// ============================================================================
// CloseFrame
// ============================================================================

/// A websocket close code and reason as observed by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// Close code, 1005 when none was received.
    pub code: u16,
    /// Close reason, possibly empty.
    pub reason: String,
}

impl CloseFrame {
    /// Creates a close frame.
    #[inline]
    #[must_use]
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Converts a tungstenite close frame. A missing frame means the peer
    /// sent no status, which surfaces as code 1005.
    #[must_use]
    pub fn from_ws(frame: Option<WsCloseFrame>) -> Self {
        match frame {
            Some(frame) => Self::new(u16::from(frame.code), frame.reason.as_str()),
            None => Self::new(CODE_NO_STATUS, ""),
        }
    }

    /// Reconstructs close codes that the platform collapsed into 1005.
    ///
    /// A 1005 whose reason is `"replaced"` becomes 4000; authentication
    /// failure reasons become 1008.
    #[must_use]
    pub fn normalize(mut self) -> Self {
        if self.code == CODE_NO_STATUS && !self.reason.is_empty() {
            match self.reason.to_lowercase().as_str() {
                "replaced" => {
                    debug!(reason = %self.reason, "fixing close code for reason");
                    self.code = CODE_REPLACED;
                }
                "authentication failed"
                | "authentication did not happen within the timeout window of 30000 seconds." => {
                    debug!(reason = %self.reason, "fixing close code for reason");
                    self.code = 1008;
                }
                _ => {}
            }
        }
        self
    }

    /// Classifies this closure for the reconnect decision.
    ///
    /// Callers are expected to [`normalize`](Self::normalize) first.
    #[must_use]
    pub fn classify(&self) -> CloseDisposition {
        match self.code {
            // Service rejected the last message entirely.
            1003 => CloseDisposition::Rejected,
            CODE_REPLACED => CloseDisposition::Replaced,
            // Going away, no status, abnormal closure, internal error.
            1001 | 1005 | 1006 | 1011 => CloseDisposition::Transient,
            1000 => {
                if NORMAL_RECONNECT_REASONS.contains(&self.reason.to_lowercase().as_str()) {
                    CloseDisposition::Transient
                } else {
                    CloseDisposition::Permanent
                }
            }
            // Unrecognized codes are treated as fatal.
            _ => CloseDisposition::Unexpected,
        }
    }

    /// Maps a pre-authorization closure to its open error.
    #[must_use]
    pub fn into_open_error(self) -> Error {
        match self.code {
            CODE_NO_STATUS => Error::unknown_response(self.code, self.reason),
            4400 => Error::bad_request(self.code, self.reason),
            4401 => Error::not_authorized(self.code, self.reason),
            4403 => Error::forbidden(self.code, self.reason),
            code => Error::connection_failed(code, self.reason),
        }
    }
}

// ============================================================================
// CloseDisposition
// ============================================================================

/// What a closure means for the connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    /// Service rejected the session; permanent, do not reconnect.
    Rejected,
    /// Superseded by a newer connection; permanent, do not reconnect.
    Replaced,
    /// Benign closure; reconnect automatically.
    Transient,
    /// Deliberate normal closure; do not reconnect.
    Permanent,
    /// Unrecognized close code; logged and treated as permanent.
    Unexpected,
}

impl CloseDisposition {
    /// Returns `true` if the client should reconnect after this closure.
    #[inline]
    #[must_use]
    pub fn should_reconnect(self) -> bool {
        matches!(self, Self::Transient)
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Outbound control message types.
//!
//! Control messages are the client-originated frames of the Mercury
//! protocol: the authorization handshake, liveness pings, and per-message
//! acknowledgments.
//!
//! # Format
//!
//! ```json
//! {"id": "uuid", "type": "authorization", "data": {"token": "..."}, "trackingId": "..."}
//! {"id": "uuid", "type": "ping"}
//! {"messageId": "uuid", "type": "ack"}
//! ```

// ============================================================================
// Imports
// ============================================================================

use serde::Serialize;
use uuid::Uuid;

// ============================================================================
// ControlFrame
// ============================================================================

/// A client-originated control frame.
///
/// The `type` field discriminates the variants on the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlFrame {
    /// Authorization handshake, sent once immediately after the socket
    /// opens.
    Authorization {
        /// Fresh message id.
        id: String,
        /// Token payload.
        data: AuthorizationData,
        /// Client tracking id, `<session>_<millis>`.
        #[serde(rename = "trackingId")]
        tracking_id: String,
    },

    /// Liveness ping. The server answers with a pong envelope carrying the
    /// same id.
    Ping {
        /// Fresh ping id, echoed back in the pong.
        id: String,
    },

    /// Acknowledgment of an inbound frame, keyed by that frame's id.
    Ack {
        /// Id of the frame being acknowledged.
        #[serde(rename = "messageId")]
        message_id: String,
    },
}

impl ControlFrame {
    /// Creates an authorization frame with a fresh id.
    #[must_use]
    pub fn authorization(token: impl Into<String>, tracking_id: impl Into<String>) -> Self {
        Self::Authorization {
            id: Uuid::new_v4().to_string(),
            data: AuthorizationData {
                token: token.into(),
            },
            tracking_id: tracking_id.into(),
        }
    }

    /// Creates a ping frame, returning the frame and its id.
    #[must_use]
    pub fn ping() -> (Self, String) {
        let id = Uuid::new_v4().to_string();
        (Self::Ping { id: id.clone() }, id)
    }

    /// Creates an acknowledgment for the given message id.
    #[inline]
    #[must_use]
    pub fn ack(message_id: impl Into<String>) -> Self {
        Self::Ack {
            message_id: message_id.into(),
        }
    }
}

// ============================================================================
// AuthorizationData
// ============================================================================

/// Token payload of an authorization frame.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationData {
    /// Bearer token string.
    pub token: String,
}

// ============================================================================
// Tests
// ============================================================================

//! Mercury wire protocol types.
//!
//! This module defines the JSON text-frame format spoken with the Mercury
//! service. The format must remain bit-compatible with the existing
//! backend.
//!
//! # Protocol Overview
//!
//! | Message | Direction | Purpose |
//! |---------|-----------|---------|
//! | `authorization` | Client → Server | Bearer token + tracking id |
//! | `ping` / `pong` | Client → Server / Server → Client | Liveness |
//! | `ack` | Client → Server | Acknowledge an inbound frame |
//! | envelope | Server → Client | Event delivery |
//!
//! # Event Naming
//!
//! Envelope event types follow `namespace.name` format:
//!
//! - `mercury.buffer_state`
//! - `mercury.registration_status`
//! - `conversation.activity`
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `close` | Close frames, code normalization, reconnect classification |
//! | `control` | Outbound control messages |
//! | `envelope` | Inbound message envelope |

// ============================================================================
// Submodules
// ============================================================================

/// Close frames and closure classification.
pub mod close;

/// Outbound control message types.
pub mod control;

/// Inbound message envelope.
pub mod envelope;

// ============================================================================
// Re-exports
// ============================================================================

pub use close::{CloseDisposition, CloseFrame, NORMAL_RECONNECT_REASONS};
pub use control::{AuthorizationData, ControlFrame};
pub use envelope::Envelope;

//! Inbound message envelope.
//!
//! Every server-originated text frame is an envelope: a top-level
//! `sequenceNumber` (sent as a string, parsed as an integer), an optional
//! `type` field distinguishing `"pong"` replies from ordinary messages, an
//! `id` used for acknowledgment, and a `data` object carrying the event
//! payload.
//!
//! # Format
//!
//! ```json
//! {
//!   "id": "uuid",
//!   "sequenceNumber": "42",
//!   "data": {
//!     "eventType": "conversation.activity",
//!     "activity": { ... },
//!     "headers": { "data.activity.target.url": "https://..." }
//!   }
//! }
//! ```
//!
//! `data.headers`, when present, maps dotted key paths to override values
//! that are merged into `data` before dispatch.

// ============================================================================
// Imports
// ============================================================================

use std::result::Result as StdResult;

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

// ============================================================================
// Envelope
// ============================================================================

/// An inbound frame from the Mercury service.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    /// Message id, referenced by the acknowledgment reply.
    #[serde(default)]
    pub id: Option<String>,

    /// Per-connection sequence number. Sent as a string on the wire.
    #[serde(
        rename = "sequenceNumber",
        default,
        deserialize_with = "deserialize_sequence_number"
    )]
    pub sequence_number: Option<u64>,

    /// Frame type. `"pong"` marks liveness replies; ordinary messages
    /// carry no type.
    #[serde(rename = "type", default)]
    pub frame_type: Option<String>,

    /// Event payload. `data.eventType` names the event as
    /// `namespace.name`.
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Parses an envelope from a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns [`serde_json::Error`] when the frame is not valid JSON.
    pub fn parse(text: &str) -> StdResult<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Returns `true` if this is a pong reply.
    #[inline]
    #[must_use]
    pub fn is_pong(&self) -> bool {
        self.frame_type.as_deref() == Some("pong")
    }

    /// Returns `true` if this is a control reply of any kind (a frame
    /// with a `type` field) rather than an event delivery.
    #[inline]
    #[must_use]
    pub fn is_control(&self) -> bool {
        self.frame_type.is_some()
    }

    /// Returns the dotted event type from the payload, if present.
    #[inline]
    #[must_use]
    pub fn event_type(&self) -> Option<&str> {
        self.data.get("eventType").and_then(Value::as_str)
    }

    /// Returns the namespace half of the event type.
    ///
    /// ```
    /// # use mercury_client::protocol::Envelope;
    /// let envelope = Envelope::parse(
    ///     r#"{"data": {"eventType": "conversation.activity"}}"#,
    /// ).unwrap();
    /// assert_eq!(envelope.namespace(), "conversation");
    /// ```
    #[inline]
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.event_type()
            .and_then(|t| t.split('.').next())
            .unwrap_or_default()
    }

    /// Returns the name half of the event type.
    #[inline]
    #[must_use]
    pub fn event_name(&self) -> &str {
        self.event_type()
            .and_then(|t| t.split('.').nth(1))
            .unwrap_or_default()
    }

    /// Merges `data.headers` overrides into the payload.
    ///
    /// Each header key is a dotted path relative to `data`; intermediate
    /// objects are created as needed. Missing headers are a no-op.
    pub fn apply_overrides(&mut self) {
        let Some(headers) = self.data.get("headers").and_then(Value::as_object) else {
            return;
        };

        let overrides: Vec<(String, Value)> = headers
            .iter()
            .map(|(path, value)| (path.clone(), value.clone()))
            .collect();

        for (path, value) in overrides {
            set_path(&mut self.data, &path, value);
        }
    }
}

// ============================================================================
// Path Assignment
// ============================================================================

/// Sets `value` at a dotted `path` inside `target`, creating intermediate
/// objects along the way. Non-object intermediates are replaced.
fn set_path(target: &mut Value, path: &str, value: Value) {
    let mut current = target;
    let mut segments = path.split('.').peekable();

    while let Some(segment) = segments.next() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let map = current.as_object_mut().expect("object ensured above");

        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return;
        }

        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

// ============================================================================
// Sequence Number Deserialization
// ============================================================================

/// Accepts the wire's string form as well as a bare integer. Unparsable
/// values deserialize to `None` rather than failing the whole frame.
fn deserialize_sequence_number<'de, D>(deserializer: D) -> StdResult<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    let raw = Option::<Raw>::deserialize(deserializer)?;
    Ok(raw.and_then(|r| match r {
        Raw::Number(n) => Some(n),
        Raw::Text(t) => t.trim().parse().ok(),
    }))
}

// ============================================================================
// Tests
// ============================================================================

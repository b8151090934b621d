//! Event dispatch: handler registry and subscriber fan-out.
//!
//! Inbound events reach consumers two ways:
//!
//! - A [`HandlerRegistry`] maps an exact `(namespace, name)` pair to one
//!   synchronous handler, for components that own an event type.
//! - [`Subscribers`] fans every event out to channel subscribers by
//!   [`Interest`]: everything, one namespace, or one exact event type.
//!
//! Both run for every event; an event nobody claims is logged and dropped.
//! Handler failures — errors and panics alike — are contained at the
//! dispatch boundary so one bad handler cannot stall event delivery.

// ============================================================================
// Imports
// ============================================================================

use std::panic::{self, AssertUnwindSafe};

use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::protocol::Envelope;

// ============================================================================
// HandlerRegistry
// ============================================================================

/// A registered event handler.
pub type EventHandler = Box<dyn Fn(&Envelope) -> Result<()> + Send + Sync>;

/// Exact-match dispatch table keyed by `(namespace, name)`.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: FxHashMap<(String, String), EventHandler>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for events of `namespace.name`, replacing any
    /// previous handler for that pair.
    pub fn register(
        &mut self,
        namespace: impl Into<String>,
        name: impl Into<String>,
        handler: impl Fn(&Envelope) -> Result<()> + Send + Sync + 'static,
    ) {
        self.handlers
            .insert((namespace.into(), name.into()), Box::new(handler));
    }

    /// Dispatches `envelope` to its registered handler, if any.
    ///
    /// Returns `true` when a handler ran. Handler errors and panics are
    /// logged here and never propagated to the caller.
    pub fn dispatch(&self, envelope: &Envelope) -> bool {
        let key = (
            envelope.namespace().to_string(),
            envelope.event_name().to_string(),
        );
        let Some(handler) = self.handlers.get(&key) else {
            return false;
        };

        match panic::catch_unwind(AssertUnwindSafe(|| handler(envelope))) {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                warn!(
                    %error,
                    namespace = %key.0,
                    name = %key.1,
                    "event handler failed",
                );
            }
            Err(_) => {
                warn!(
                    namespace = %key.0,
                    name = %key.1,
                    "event handler panicked",
                );
            }
        }
        true
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ============================================================================
// Interest
// ============================================================================

/// What slice of the event stream a subscriber wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interest {
    /// Every event.
    Any,
    /// Events whose type starts with this namespace.
    Namespace(String),
    /// Events with exactly this `namespace.name` type.
    Event(String),
}

impl Interest {
    /// Returns `true` when `envelope` falls under this interest.
    #[must_use]
    pub fn matches(&self, envelope: &Envelope) -> bool {
        match self {
            Self::Any => true,
            Self::Namespace(namespace) => envelope.namespace() == namespace,
            Self::Event(event_type) => envelope.event_type() == Some(event_type.as_str()),
        }
    }
}

// ============================================================================
// Subscribers
// ============================================================================

/// Channel subscribers grouped by interest.
///
/// Senders whose receivers have been dropped are pruned on the next
/// delivery.
#[derive(Debug, Default)]
pub struct Subscribers {
    entries: Vec<(Interest, mpsc::UnboundedSender<Envelope>)>,
}

impl Subscribers {
    /// Creates an empty subscriber list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscription and returns its receiving end.
    pub fn subscribe(&mut self, interest: Interest) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.entries.push((interest, tx));
        rx
    }

    /// Delivers `envelope` to every matching subscriber.
    ///
    /// Returns the number of subscribers that received it.
    pub fn deliver(&mut self, envelope: &Envelope) -> usize {
        let mut delivered = 0;
        self.entries.retain(|(interest, tx)| {
            if tx.is_closed() {
                return false;
            }
            if interest.matches(envelope) && tx.send(envelope.clone()).is_ok() {
                delivered += 1;
            }
            true
        });

        if delivered == 0 {
            debug!(event_type = ?envelope.event_type(), "no subscribers for event");
        }
        delivered
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Exponential-backoff retry driver for connection attempts.
//!
//! [`BackoffCall`] retries a caller-supplied attempt function until it
//! succeeds, fails fatally, is aborted, or exceeds an optional retry
//! ceiling. The delay before retry `i + 1` is `min(initial * 2^i, max)`.
//!
//! Failure classification: [`Error::is_fatal`] failures (bad request,
//! forbidden) abort immediately; everything else is retried on the
//! schedule. Side effects tied to particular failures — registration
//! refresh, credential refresh, endpoint failover — belong to the attempt
//! function itself, which runs them before returning the error.

// ============================================================================
// Imports
// ============================================================================

use std::cmp;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

// ============================================================================
// BackoffSchedule
// ============================================================================

/// Exponential delay schedule, capped at a maximum.
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    initial: Duration,
    max: Duration,
    delay: Duration,
}

impl BackoffSchedule {
    /// Creates a schedule starting at `initial`, doubling up to `max`.
    #[inline]
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            delay: initial,
        }
    }

    /// Returns the next delay and advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let current = cmp::min(self.delay, self.max);
        self.delay = self.delay.saturating_mul(2);
        current
    }

    /// Resets the schedule back to the initial delay.
    #[inline]
    pub fn reset(&mut self) {
        self.delay = self.initial;
    }
}

// ============================================================================
// AbortHandle
// ============================================================================

/// Cooperative abort signal for an in-flight [`BackoffCall`].
///
/// Aborting cancels the pending retry sleep and drops any in-flight
/// attempt; the overall call rejects with [`Error::Aborted`].
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    aborted: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl AbortHandle {
    /// Creates an un-aborted handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals abort. Idempotent.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Returns `true` once abort has been signalled.
    #[inline]
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Resolves once abort has been signalled.
    pub async fn aborted(&self) {
        loop {
            if self.is_aborted() {
                return;
            }
            let notified = self.notify.notified();
            // Re-check after registering interest so a signal between the
            // load and the registration is not lost.
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}

// ============================================================================
// BackoffCall
// ============================================================================

/// One retried operation: attempt, classify, sleep, repeat.
pub struct BackoffCall {
    schedule: BackoffSchedule,
    max_retries: Option<u32>,
    abort: AbortHandle,
    retries: u32,
}

impl BackoffCall {
    /// Creates a call with the given schedule and optional retry ceiling.
    #[must_use]
    pub fn new(initial: Duration, max: Duration, max_retries: Option<u32>) -> Self {
        Self {
            schedule: BackoffSchedule::new(initial, max),
            max_retries,
            abort: AbortHandle::new(),
            retries: 0,
        }
    }

    /// Returns a handle that can abort this call from another task.
    #[inline]
    #[must_use]
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Number of retries performed so far.
    #[inline]
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Drives `attempt` until success, fatal failure, abort, or retry
    /// exhaustion. The attempt receives the current retry count.
    ///
    /// # Errors
    ///
    /// - [`Error::Aborted`] when the abort handle fires.
    /// - [`Error::RetriesExhausted`] once the ceiling is exceeded.
    /// - The attempt's own error when it is fatal.
    pub async fn run<T, F, Fut>(mut self, mut attempt: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        loop {
            if self.abort.is_aborted() {
                info!("connection aborted");
                return Err(Error::Aborted);
            }

            debug!(attempt = self.retries, "executing connection attempt");
            let outcome = tokio::select! {
                outcome = attempt(self.retries) => outcome,
                _ = self.abort.aborted() => {
                    info!("connection aborted");
                    return Err(Error::Aborted);
                }
            };

            let error = match outcome {
                Ok(value) => {
                    info!(retries = self.retries, "connected");
                    return Ok(value);
                }
                Err(error) => error,
            };

            if error.is_fatal() {
                warn!(%error, "received unrecoverable response; aborting retries");
                return Err(error);
            }

            if let Some(max) = self.max_retries
                && self.retries >= max
            {
                info!(retries = self.retries, "failed to connect; giving up");
                return Err(Error::RetriesExhausted {
                    retries: self.retries,
                });
            }

            let delay = self.schedule.next_delay();
            info!(
                retry = self.retries + 1,
                delay_ms = delay.as_millis() as u64,
                %error,
                "failed to connect; scheduling retry",
            );

            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.abort.aborted() => {
                    info!("connection aborted");
                    return Err(Error::Aborted);
                }
            }

            self.retries += 1;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Environment providers the client depends on.
//!
//! The client itself never mints tokens, performs device registration, or
//! chooses endpoints; it asks these traits. Implementations typically wrap
//! an HTTP API client and a credential store.

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;

use crate::error::Result;

// ============================================================================
// RegistrationProvider
// ============================================================================

/// Device registration backing the connection.
///
/// The connection URL comes out of registration, so a stale registration
/// manifests as an unknown response on open; the client reacts by asking
/// for a refresh before retrying.
#[async_trait]
pub trait RegistrationProvider: Send + Sync {
    /// Returns `true` when a device registration currently exists.
    fn is_registered(&self) -> bool;

    /// Registers the device.
    async fn register(&self) -> Result<()>;

    /// Refreshes an existing registration in place.
    async fn refresh(&self) -> Result<()>;
}

// ============================================================================
// CredentialProvider
// ============================================================================

/// Source of the bearer token used in the authorization handshake.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Returns the current token, including any scheme prefix.
    async fn token(&self) -> Result<String>;

    /// Refreshes the token. With `force` the provider must mint a new
    /// token even if the current one has not expired.
    async fn refresh(&self, force: bool) -> Result<()>;
}

// ============================================================================
// UrlResolver
// ============================================================================

/// Source of the WebSocket endpoint URL.
///
/// With high availability enabled, a failed endpoint can be reported back
/// so the next attempt lands on a different cluster member.
#[async_trait]
pub trait UrlResolver: Send + Sync {
    /// Resolves the current connection URL, before decoration.
    async fn resolve(&self) -> Result<String>;

    /// Marks `failed_url` as unhealthy and returns a replacement.
    async fn mark_failed_and_get_new(&self, failed_url: &str) -> Result<String>;
}

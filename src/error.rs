//! Errors surfaced by the session bootstrap.
//!
//! Every variant is fatal for the current startup attempt. Nothing at this layer
//! retries or silently recovers; restarting is left to the surrounding process.

use thiserror::Error;

/// Failure of one of the bootstrap steps.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BootstrapError {
    /// Neither `matrix.user_token` nor `matrix.user_password` is set.
    #[error("no credential configured: set matrix.user_token or matrix.user_password")]
    MissingCredential,

    /// The homeserver rejected the credential, or the credential belongs to another account.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The local store or the relational database cannot be opened.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The device this session would run as does not match the encryption state of the local store.
    ///
    /// Continuing would make encrypted rooms drop incoming messages for this session.
    #[error("device identity mismatch for device {device_id}: {detail}")]
    DeviceIdentityMismatch { device_id: String, detail: String },

    /// The homeserver could not be reached or did not answer in time.
    #[error("homeserver unreachable: {0}")]
    HomeserverUnreachable(String),
}

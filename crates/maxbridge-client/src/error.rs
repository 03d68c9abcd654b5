//! Max client errors.

use thiserror::Error;

/// Errors returned by Max clients.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Authentication failed. Never retried; the session must be
    /// re-provisioned.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Resource not found. Dropped silently by callers that tolerate it.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Rate limited by the server.
    #[error("Rate limited, retry after {retry_after}s")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after: u64,
    },

    /// Protocol-level error reported by the server.
    #[error("Max API error {code}: {message}")]
    Upstream {
        /// Server-reported error code.
        code: String,
        /// Server-reported error message.
        message: String,
    },

    /// Network or connection failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Response could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Timed out waiting for a response.
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// Operation attempted while not connected.
    #[error("Not connected")]
    NotConnected,
}

impl ClientError {
    /// Whether this error indicates invalid credentials.
    #[must_use]
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

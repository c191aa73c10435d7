//! Application error model with failure classification
//!
//! Defines a typed error hierarchy using `thiserror` for internal error
//! handling, and classifies each variant so the event loop, the connection
//! monitor and the facade can decide whether to retry, skip, deauthorize or
//! surface the failure to the user.

use thiserror::Error;

/// HTTP status the remote API uses for rejected-but-harmless requests
const STATUS_UNPROCESSABLE: u16 = 422;
/// HTTP status the remote API uses when it throttles a client
const STATUS_TOO_MANY_REQUESTS: u16 = 429;
/// HTTP status the remote API uses for expired or revoked authorization
const STATUS_UNAUTHORIZED: u16 = 401;

/// Application error type
///
/// Covers every failure the bridge core may encounter. Use the
/// classification helpers rather than matching on variants when deciding
/// how to react.
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid caller input (validation failed, malformed request)
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Resource not found (user, store, setting)
    #[error("not found: {0}")]
    NotFound(String),
    /// Authentication or authorization failure (bad credentials, revoked auth)
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// Remote auth exists but local key material could not be unlocked
    #[error("user is locked: {0}")]
    Locked(String),
    /// The account is already connected
    #[error("user already logged in: {0}")]
    AlreadyLoggedIn(String),
    /// Connection-level failure talking to the remote API
    #[error("network error: {0}")]
    Network(String),
    /// Remote API answered with an error status
    #[error("api error {status}: {message}")]
    Api {
        /// HTTP status code returned by the API
        status: u16,
        /// Server-provided error message
        message: String,
    },
    /// Operation timeout (listener bind, IMAP response, remote call)
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// Conflict (duplicate account ID, concurrent modification)
    #[error("conflict: {0}")]
    Conflict(String),
    /// Local mailbox store failure (corrupted, missing, unable to create)
    #[error("store error: {0}")]
    Store(String),
    /// Configuration failure (port in use, data directory move failed)
    #[error("configuration error: {0}")]
    Config(String),
    /// Operation not supported by this build
    #[error("not implemented: {0}")]
    NotImplemented(String),
    /// A component was asked to act in a state that should be impossible
    #[error("invariant violated: {0}")]
    Invariant(String),
    /// Filesystem failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// Internal error (unexpected failure, external crate error)
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Convenience constructor for `InvalidInput`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Convenience constructor for `Api`
    pub fn api(status: u16, msg: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: msg.into(),
        }
    }

    /// Whether the failure means the remote API is unreachable
    ///
    /// Network-class failures are reported to the connection monitor and
    /// never counted against a single event.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }

    /// Whether retrying the same operation later may succeed
    ///
    /// True for network-class failures, throttling (429) and server-side
    /// failures (5xx).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) => true,
            Self::Api { status, .. } => *status == STATUS_TOO_MANY_REQUESTS || *status >= 500,
            _ => false,
        }
    }

    /// Whether the API rejected the request as unprocessable (422)
    ///
    /// Such events are skipped: applying one fewer event does not corrupt
    /// the local state.
    pub fn is_unprocessable(&self) -> bool {
        matches!(self, Self::Api { status, .. } if *status == STATUS_UNPROCESSABLE)
    }

    /// Whether the failure revokes the session's authorization
    pub fn is_auth(&self) -> bool {
        match self {
            Self::AuthFailed(_) => true,
            Self::Api { status, .. } => *status == STATUS_UNAUTHORIZED,
            _ => false,
        }
    }
}

/// Type alias for fallible return values
///
/// Use this for all internal functions that can fail. Provides a consistent
/// error type throughout the codebase.
pub type AppResult<T> = Result<T, AppError>;

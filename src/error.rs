use std::sync::Arc;

/// Represents a result type for operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the SDK.
///
/// Evaluation calls never return these: evaluation faults are swallowed by the
/// [`ErrorBoundary`](crate::ErrorBoundary) and converted into a safe default.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Secret key is missing or malformed. Fatal at construction.
    #[error("invalid sdk key, secret keys must start with \"secret-\"")]
    InvalidSdkKey,

    /// Invalid URL configuration.
    #[error("invalid url configuration")]
    InvalidUrl(#[source] url::ParseError),

    /// The server responded with a non-success status code.
    #[error("request failed with status {status}")]
    Network {
        /// HTTP status code.
        status: u16,
        /// Whether the request may succeed if retried.
        retryable: bool,
    },

    /// The request was unauthorized, the sdk key is likely invalid.
    #[error("unauthorized, sdk key is likely invalid")]
    Unauthorized,

    /// Connection-level failure (DNS, TLS, timeout, ...).
    #[error(transparent)]
    Transport(Arc<reqwest::Error>),

    /// Malformed specification document or payload.
    #[error("failed to parse payload")]
    Serialization(#[source] Arc<serde_json::Error>),

    /// Persistent storage adapter failed.
    #[error("persistent storage failure: {0}")]
    Persistence(String),

    /// An id list body could not be applied, even after a full re-fetch.
    #[error("invalid id list {0}")]
    InvalidIdList(String),

    /// Data adapter failed.
    #[error("data adapter failure: {0}")]
    DataAdapter(String),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// A background thread panicked. This should normally never happen.
    #[error("background thread panicked")]
    ThreadPanicked,

    /// Operation requires a running client.
    #[error("client is shut down")]
    AlreadyShutdown,
}

impl Error {
    /// Returns `true` if the failed operation may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network { retryable, .. } => *retryable,
            Error::Transport(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            _ => false,
        }
    }

    /// Build a network error from a status code, classifying it as retryable or terminal.
    pub(crate) fn from_status(status: u16) -> Error {
        match status {
            401 | 403 => Error::Unauthorized,
            _ => Error::Network {
                status,
                retryable: is_retryable_status(status),
            },
        }
    }
}

/// 408, any 5xx, and the proxy timeouts (522, 524, 599) are worth retrying.
pub(crate) fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 500..=599)
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Transport(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Serialization(Arc::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_status_codes() {
        for status in [408, 500, 502, 522, 524, 599] {
            assert!(Error::from_status(status).is_retryable(), "{status}");
        }
        for status in [400, 404, 413] {
            assert!(!Error::from_status(status).is_retryable(), "{status}");
        }
        assert!(matches!(Error::from_status(401), Error::Unauthorized));
        assert!(matches!(Error::from_status(403), Error::Unauthorized));
    }
}

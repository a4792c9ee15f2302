use thiserror::Error;

/// Failures reported by a [`CacheBackend`](super::CacheBackend).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The backend could not be reached or rejected the operation.
    #[error("cache store unavailable: {message}")]
    Unavailable { message: String },
    /// The backend has no native implementation of a batched operation.
    #[error("batched `{operation}` is not supported by this backend")]
    Unsupported { operation: &'static str },
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn unsupported(operation: &'static str) -> Self {
        Self::Unsupported { operation }
    }
}

/// A context component could not be rendered deterministically.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FingerprintError {
    #[error("malformed cache context component `{component}`: {reason}")]
    MalformedContext {
        component: String,
        reason: String,
    },
}

impl FingerprintError {
    pub fn malformed(component: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedContext {
            component: component.into(),
            reason: reason.into(),
        }
    }
}

/// An artifact could not be captured for storage, or a stored payload could not be restored.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("artifact has no extractable content")]
    NoContent,
    #[error("artifact status {status} is not cacheable")]
    Status { status: u16 },
    #[error("header `{name}` cannot be captured or restored")]
    Header { name: String },
    /// The response was streamed to the client without being buffered.
    #[error("response body was not buffered")]
    Unbuffered,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error("cache value codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// A purge hook could not release invalidated paths.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("purge failed: {message}")]
pub struct PurgeError {
    message: String,
}

impl PurgeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

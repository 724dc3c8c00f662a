//! Error types for the bridge.
//!
//! [`PoolError`] is what a [`Pool`](crate::Pool) returns when a call cannot be
//! executed. [`Error`] covers everything that can fail on the request path
//! around the pool and implements `From<Error>` for `tonic::Status`, so every
//! failure reaches the caller as a structured status.
//!
//! ## Error Cases
//! - `ContextEncode`: The execution context could not be serialized.
//! - `ContextDecode`: The worker returned a context that is not valid JSON.
//! - `EmbeddedStatusEncoding`: The worker's embedded status is not base64.
//! - `EmbeddedStatusDecode`: The worker's embedded status is not a valid
//!   `google.rpc.Status`.
//! - `Pool`: The pool failed to execute the call; translated with
//!   [`translate_pool_error`](crate::translate_pool_error).

use bytes::Bytes;
use core::{fmt, time::Duration};
use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the request path.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to encode rpc context: {0}")]
    ContextEncode(#[source] serde_json::Error),

    #[error("failed to decode worker context: {0}")]
    ContextDecode(#[source] serde_json::Error),

    #[error("failed to decode embedded status: {0}")]
    EmbeddedStatusEncoding(#[from] base64::DecodeError),

    #[error("failed to decode embedded status: {0}")]
    EmbeddedStatusDecode(#[from] prost::DecodeError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::Pool(e) => crate::translate_pool_error(&e),
            other => Status::internal(other.to_string()),
        }
    }
}

/// Raw error message reported by a worker process.
///
/// Kept as bytes because the delimited error convention may append serialized
/// protobuf details that are not valid UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerError(Bytes);

impl WorkerError {
    pub fn new(message: impl Into<Bytes>) -> Self {
        Self(message.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl std::error::Error for WorkerError {}

/// Failure to execute a payload on the worker pool.
#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    /// The worker ran the call and reported an error.
    #[error("worker error: {0}")]
    Worker(#[source] WorkerError),

    /// Reading from or writing to a worker process failed.
    #[error("worker i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A worker sent a frame that does not follow the framing protocol.
    #[error("malformed worker frame: {reason}")]
    Protocol { reason: String },

    /// No response arrived within the configured execution timeout.
    #[error("worker did not respond within {0:?}")]
    Timeout(Duration),

    /// Internal channel between the pool and a worker task failed.
    #[error("channel error: {context}")]
    Channel { context: String },

    /// The pool has been destroyed and accepts no more work.
    #[error("worker pool is shutting down")]
    Shutdown,

    /// Adds context to an underlying pool error.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<PoolError>,
    },
}

impl PoolError {
    pub fn worker(message: impl Into<Bytes>) -> Self {
        Self::Worker(WorkerError::new(message))
    }

    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

//! Structured gRPC statuses produced from worker failures.
//!
//! Workers have no status binding of their own. They signal a precise gRPC
//! status through a plain error string:
//!
//! ```text
//! <code>|:|<message>|:|<serialized google.protobuf.Any>|:|...
//! ```
//!
//! [`translate_pool_error`] turns such a string into a [`Status`] carrying the
//! code, message and details. Details travel to the caller as an encoded
//! [`RpcStatus`] in the `grpc-status-details-bin` trailer, the same way
//! `tonic-types` ships rich error details.

use crate::PoolError;
use crate::error::WorkerError;
use bytes::Bytes;
use prost::Message;
use prost_types::Any;
use tonic::{Code, Status};

/// Separates the code, message and detail segments of a worker error.
pub const DELIMITER: &str = "|:|";

/// The `google.rpc.Status` message.
#[derive(Clone, PartialEq, Message)]
pub struct RpcStatus {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(message, repeated, tag = "3")]
    pub details: Vec<Any>,
}

impl RpcStatus {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: Vec::new(),
        }
    }

    /// Converts into a [`Status`] whose details carry the encoded message.
    pub fn into_status(self) -> Status {
        let encoded = Bytes::from(self.encode_to_vec());
        Status::with_details(Code::from(self.code), self.message, encoded)
    }

    /// Recovers the encoded status from a [`Status`], if it carries one.
    pub fn from_status(status: &Status) -> Option<Self> {
        if status.details().is_empty() {
            return None;
        }
        Self::decode(status.details()).ok()
    }
}

/// Maps a pool failure to the status returned to the caller.
///
/// The error's source chain is unwrapped to its innermost cause first. When
/// that message follows the delimited convention it becomes a precise status,
/// otherwise the whole error becomes an `Internal` status. A delimited message
/// whose code segment is not a `u32` is left untranslated and surfaces as
/// `Unknown` with the original message.
pub fn translate_pool_error(err: &PoolError) -> Status {
    let raw = innermost_message(err);
    if !contains(&raw, DELIMITER.as_bytes()) {
        return Status::internal(err.to_string());
    }

    match from_delimited(&raw) {
        Some(status) => status,
        None => Status::unknown(err.to_string()),
    }
}

/// Parses a delimited worker error. Returns `None` when the code segment is
/// missing or does not parse as a `u32`.
pub fn from_delimited(raw: &[u8]) -> Option<Status> {
    let mut chunks = split(raw, DELIMITER.as_bytes());

    let code_chunk = chunks.next()?;
    let message = chunks.next()?;

    let code = core::str::from_utf8(code_chunk).ok()?.parse::<u32>().ok()?;

    // Zero is OK, which cannot describe a failure; keep the fallback.
    let code = if code > 0 && code < u32::MAX {
        code as i32
    } else {
        Code::Internal as i32
    };

    let mut status = RpcStatus::new(code, String::from_utf8_lossy(message));
    status.details = chunks.filter_map(|chunk| Any::decode(chunk).ok()).collect();

    Some(status.into_status())
}

fn innermost_message(err: &(dyn std::error::Error + 'static)) -> Vec<u8> {
    let mut current = err;
    while let Some(source) = current.source() {
        current = source;
    }

    match current.downcast_ref::<WorkerError>() {
        Some(worker) => worker.as_bytes().to_vec(),
        None => current.to_string().into_bytes(),
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn split<'a>(mut raw: &'a [u8], delimiter: &'a [u8]) -> impl Iterator<Item = &'a [u8]> + 'a {
    let mut done = false;
    core::iter::from_fn(move || {
        if done {
            return None;
        }
        match raw.windows(delimiter.len()).position(|w| w == delimiter) {
            Some(at) => {
                let chunk = &raw[..at];
                raw = &raw[at + delimiter.len()..];
                Some(chunk)
            }
            None => {
                done = true;
                Some(raw)
            }
        }
    })
}

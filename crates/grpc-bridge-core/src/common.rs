//! Shared types and error definitions used across the `grpc-bridge` server
//! and worker pool implementations.
//!
//! ## Submodules
//!
//! - [`codec`] - Pass-through tonic codec for opaque message bodies.
//! - [`context`] - Execution context sent to workers with every call.
//! - [`error`] - Crate and pool error types.
//! - [`payload`] - Worker envelope and its reuse pool.
//! - [`pool`] - Worker pool contract and the shared lifecycle guard.
//! - [`status`] - `google.rpc.Status` and worker error translation.

pub mod codec;
pub mod context;
pub mod error;
pub mod payload;
pub mod pool;
pub mod status;

pub use codec::RawCodec;
pub use context::{ContextMap, PEER_ADDRESS, PEER_AUTH_TYPE, RpcContext};
pub use error::{Error, PoolError, Result, WorkerError};
pub use payload::{Payload, PayloadCodec, PayloadPool, PooledPayload};
pub use pool::{GuardedPool, Pool, WorkerInfo};
pub use status::{DELIMITER, RpcStatus, translate_pool_error};

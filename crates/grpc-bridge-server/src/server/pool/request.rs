use bytes::Bytes;
use grpc_bridge_core::PoolError;
use tokio::sync::oneshot;

/// Work sent from the [`ProcessPool`](super::ProcessPool) to one worker task.
pub enum WorkRequest {
    /// Run one encoded request frame and reply with the raw response frame.
    Exec {
        frame: Bytes,
        response: oneshot::Sender<Result<Bytes, PoolError>>,
    },
    /// Replace the worker process.
    Reset {
        response: oneshot::Sender<Result<(), PoolError>>,
    },
    /// Stop the worker process and exit the task.
    Shutdown { response: oneshot::Sender<()> },
}

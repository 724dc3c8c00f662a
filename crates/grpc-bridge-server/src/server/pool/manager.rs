//! Process-backed worker pool.
//!
//! [`ProcessPool`] owns a fixed set of worker tasks. Each task owns one child
//! process and talks to it over length-delimited frames on stdin/stdout (see
//! [`frame`](super::frame)). Calls are distributed round-robin over bounded
//! [`mpsc`] channels and answered through a [`oneshot`] per request, so a
//! worker only ever has one call outstanding on its process.
//!
//! Shutdown is coordinated with a shared [`CancellationToken`]: once
//! cancelled, no new work is accepted and every worker is asked to stop its
//! process and acknowledge.

use super::frame;
use super::request::WorkRequest;
use super::worker::{Worker, WorkerCommand, WorkerProcess, WorkerSettings, worker_loop};
use core::time::Duration;
use grpc_bridge_core::{Payload, Pool, PoolError, WorkerInfo};
use portable_atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Settings for [`ProcessPool::start`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub command: WorkerCommand,
    pub num_workers: usize,
    /// Queue depth of each worker's request channel.
    pub queue_capacity: usize,
    pub exec_timeout: Duration,
    /// How long `destroy` and `reset` wait for each worker to acknowledge.
    pub ack_timeout: Duration,
    pub max_frame_length: usize,
}

impl PoolConfig {
    pub fn new(command: WorkerCommand) -> Self {
        Self {
            command,
            num_workers: 4,
            queue_capacity: 64,
            exec_timeout: Duration::from_secs(60),
            ack_timeout: Duration::from_secs(3),
            max_frame_length: 8 * 1024 * 1024,
        }
    }
}

struct WorkerHandle {
    tx: mpsc::Sender<WorkRequest>,
    pid: Arc<AtomicU32>,
}

/// A [`Pool`] of external worker processes.
pub struct ProcessPool {
    workers: Vec<WorkerHandle>,
    next_worker: AtomicUsize,
    shutdown_token: CancellationToken,
    ack_timeout: Duration,
}

impl ProcessPool {
    /// Spawns every worker process and its task.
    ///
    /// # Errors
    ///
    /// Fails if any process cannot be started. Workers started before the
    /// failure are stopped when their channels are dropped.
    pub fn start(config: PoolConfig) -> Result<Self, PoolError> {
        let num_workers = config.num_workers.max(1);
        let settings = Arc::new(WorkerSettings {
            command: config.command,
            exec_timeout: config.exec_timeout,
            max_frame_length: config.max_frame_length,
        });

        let mut workers = Vec::with_capacity(num_workers);
        for index in 0..num_workers {
            let process = WorkerProcess::spawn(&settings.command, settings.max_frame_length)
                .map_err(|e| e.context(format!("failed to start worker {index}")))?;
            let pid = Arc::new(AtomicU32::new(process.pid().unwrap_or(0)));
            let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));

            let worker = Worker {
                index,
                settings: Arc::clone(&settings),
                pid: Arc::clone(&pid),
                process: Some(process),
            };
            tokio::spawn(worker_loop(worker, rx));
            workers.push(WorkerHandle { tx, pid });
        }

        tracing::info!(
            "Started {num_workers} workers running `{}`",
            settings.command.program
        );

        Ok(Self {
            workers,
            next_worker: AtomicUsize::new(0),
            shutdown_token: CancellationToken::new(),
            ack_timeout: config.ack_timeout,
        })
    }

    /// Returns the index of the next worker to receive work (round-robin).
    fn next_worker_index(&self) -> usize {
        self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len()
    }

    async fn send(&self, index: usize, request: WorkRequest) -> Result<(), PoolError> {
        self.workers[index]
            .tx
            .send(request)
            .await
            .map_err(|_| PoolError::Channel {
                context: format!("worker {index} channel closed"),
            })
    }
}

#[tonic::async_trait]
impl Pool for ProcessPool {
    async fn exec(&self, payload: &Payload) -> Result<Payload, PoolError> {
        if self.shutdown_token.is_cancelled() {
            return Err(PoolError::Shutdown);
        }

        let request = frame::encode(payload, 0)?;
        let index = self.next_worker_index();
        let (tx, rx) = oneshot::channel();
        self.send(
            index,
            WorkRequest::Exec {
                frame: request,
                response: tx,
            },
        )
        .await?;

        let response = rx
            .await
            .map_err(|_| PoolError::Channel {
                context: format!("worker {index} dropped the request"),
            })?
            .map_err(|e| e.context(format!("worker {index}")))?;

        frame::decode(response)?
            .into_result()
            .map_err(|e| e.context(format!("worker {index}")))
    }

    async fn reset(&self) -> Result<(), PoolError> {
        if self.shutdown_token.is_cancelled() {
            return Err(PoolError::Shutdown);
        }
        tracing::info!("Resetting {} workers", self.workers.len());

        let mut pending = Vec::with_capacity(self.workers.len());
        for index in 0..self.workers.len() {
            let (tx, rx) = oneshot::channel();
            self.send(index, WorkRequest::Reset { response: tx }).await?;
            pending.push((index, rx));
        }

        let results = futures::future::join_all(pending.into_iter().map(|(index, rx)| async move {
            match rx.await {
                Ok(result) => result.map_err(|e| e.context(format!("worker {index}"))),
                Err(_) => Err(PoolError::Channel {
                    context: format!("worker {index} dropped the reset"),
                }),
            }
        }))
        .await;

        results.into_iter().collect()
    }

    /// - Cancels the shared [`CancellationToken`] to refuse new work.
    /// - Sends a [`WorkRequest::Shutdown`] to each worker.
    /// - Waits (up to the ack timeout per worker) for acknowledgements.
    async fn destroy(&self) {
        tracing::debug!("Cancelling remaining work via shutdown token");
        self.shutdown_token.cancel();

        let mut shutdown_handles = Vec::with_capacity(self.workers.len());
        for (i, worker) in self.workers.iter().enumerate() {
            let (tx, rx) = oneshot::channel();
            if let Err(e) = worker.tx.send(WorkRequest::Shutdown { response: tx }).await {
                tracing::error!("Failed to send shutdown to worker {i}: {e}");
            } else {
                shutdown_handles.push((i, rx));
            }
        }

        let ack_timeout = self.ack_timeout;
        let timeout_futures = shutdown_handles.into_iter().map(|(i, rx)| async move {
            match timeout(ack_timeout, rx).await {
                Ok(Ok(())) => tracing::trace!("Worker {i} shutdown acknowledged"),
                Ok(Err(e)) => tracing::error!("Worker {i} returned error: {e}"),
                Err(_) => tracing::warn!("Worker {i} shutdown timed out"),
            }
        });
        futures::future::join_all(timeout_futures).await;

        tracing::info!("Worker pool shutdown complete");
    }

    fn workers(&self) -> Vec<WorkerInfo> {
        self.workers
            .iter()
            .enumerate()
            .map(|(index, worker)| {
                let pid = worker.pid.load(Ordering::Acquire);
                WorkerInfo {
                    index,
                    pid: (pid != 0).then_some(pid),
                }
            })
            .collect()
    }
}

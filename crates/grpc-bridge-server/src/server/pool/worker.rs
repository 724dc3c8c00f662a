use super::request::WorkRequest;
use bytes::Bytes;
use core::time::Duration;
use futures::{SinkExt, StreamExt};
use grpc_bridge_core::PoolError;
use portable_atomic::{AtomicU32, Ordering};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// How long a worker process gets to exit after its stdin is closed.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Program and arguments used to start a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// A running worker process and its framed stdio.
pub struct WorkerProcess {
    child: Child,
    writer: FramedWrite<ChildStdin, LengthDelimitedCodec>,
    reader: FramedRead<ChildStdout, LengthDelimitedCodec>,
}

impl WorkerProcess {
    /// Starts a process. Its stderr is inherited so worker logs reach ours.
    ///
    /// # Errors
    ///
    /// Fails if the program cannot be started.
    pub fn spawn(command: &WorkerCommand, max_frame_length: usize) -> Result<Self, PoolError> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PoolError::from(e).context(format!("failed to spawn `{}`", command.program)))?;

        let stdin = child.stdin.take().ok_or_else(|| PoolError::Protocol {
            reason: "worker stdin is not piped".to_owned(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| PoolError::Protocol {
            reason: "worker stdout is not piped".to_owned(),
        })?;

        let codec = || {
            LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(max_frame_length)
                .new_codec()
        };

        Ok(Self {
            child,
            writer: FramedWrite::new(stdin, codec()),
            reader: FramedRead::new(stdout, codec()),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Writes one request frame and reads one response frame.
    pub async fn roundtrip(&mut self, frame: Bytes) -> Result<Bytes, PoolError> {
        self.writer.send(frame).await?;

        match self.reader.next().await {
            Some(Ok(response)) => Ok(response.freeze()),
            Some(Err(e)) => Err(e.into()),
            None => Err(PoolError::Protocol {
                reason: "worker closed its output".to_owned(),
            }),
        }
    }

    /// Closes stdin and waits briefly for the process to exit, killing it
    /// otherwise.
    pub async fn stop(self) {
        let Self {
            mut child,
            writer,
            reader,
        } = self;
        drop(writer);
        drop(reader);

        match timeout(STOP_GRACE, child.wait()).await {
            Ok(Ok(status)) => tracing::trace!("worker process exited with {status}"),
            Ok(Err(e)) => tracing::warn!("failed to wait for worker process: {e}"),
            Err(_) => {
                if let Err(e) = child.kill().await {
                    tracing::warn!("failed to kill worker process: {e}");
                }
            }
        }
    }
}

/// Settings shared by all worker tasks of a pool.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub command: WorkerCommand,
    pub exec_timeout: Duration,
    pub max_frame_length: usize,
}

/// State owned by one worker task.
pub struct Worker {
    pub index: usize,
    pub settings: Arc<WorkerSettings>,
    pub pid: Arc<AtomicU32>,
    pub process: Option<WorkerProcess>,
}

impl Worker {
    fn replace(&mut self, process: Option<WorkerProcess>) -> Option<WorkerProcess> {
        let pid = process.as_ref().and_then(WorkerProcess::pid).unwrap_or(0);
        self.pid.store(pid, Ordering::Release);
        core::mem::replace(&mut self.process, process)
    }

    async fn respawn(&mut self) -> Result<(), PoolError> {
        if let Some(old) = self.replace(None) {
            old.stop().await;
        }
        let process = WorkerProcess::spawn(&self.settings.command, self.settings.max_frame_length)?;
        tracing::debug!(worker = self.index, pid = ?process.pid(), "worker process started");
        self.replace(Some(process));
        Ok(())
    }

    async fn exec(&mut self, frame: Bytes) -> Result<Bytes, PoolError> {
        if self.process.is_none() {
            self.respawn().await?;
        }
        let Some(process) = self.process.as_mut() else {
            return Err(PoolError::Protocol {
                reason: "worker process is not running".to_owned(),
            });
        };

        let limit = self.settings.exec_timeout;
        let err = match timeout(limit, process.roundtrip(frame)).await {
            Ok(Ok(response)) => return Ok(response),
            Ok(Err(e)) => e,
            Err(_) => PoolError::Timeout(limit),
        };

        // The process state is unknown after a failed exchange.
        tracing::warn!(worker = self.index, "replacing worker process: {err}");
        if let Err(e) = self.respawn().await {
            tracing::error!(worker = self.index, "failed to restart worker process: {e}");
        }
        Err(err)
    }
}

/// Worker task: processes [`WorkRequest`]s until shutdown or until the pool
/// drops its sender.
pub async fn worker_loop(mut worker: Worker, mut rx: mpsc::Receiver<WorkRequest>) {
    tracing::trace!("Worker {} started", worker.index);

    while let Some(work) = rx.recv().await {
        match work {
            WorkRequest::Exec { frame, response } => {
                if response.is_closed() {
                    tracing::trace!("Worker {} skipping abandoned request", worker.index);
                    continue;
                }
                let result = worker.exec(frame).await;
                if response.send(result).is_err() {
                    tracing::trace!("Worker {} caller went away", worker.index);
                }
            }
            WorkRequest::Reset { response } => {
                let result = worker.respawn().await;
                if response.send(result).is_err() {
                    tracing::error!("Worker {} failed to acknowledge reset", worker.index);
                }
            }
            WorkRequest::Shutdown { response } => {
                tracing::debug!("Worker {} received shutdown signal", worker.index);
                if let Some(process) = worker.replace(None) {
                    process.stop().await;
                }
                if response.send(()).is_err() {
                    tracing::error!("Worker {} failed to acknowledge shutdown", worker.index);
                }
                break;
            }
        }
    }

    if let Some(process) = worker.replace(None) {
        process.stop().await;
    }
    tracing::trace!("Worker {} stopped", worker.index);
}

use grpc_bridge_core::{Payload, Pool, PoolError, WorkerInfo};
use parking_lot::Mutex;

type Respond = dyn Fn(&Payload) -> Result<Payload, PoolError> + Send + Sync;

/// Returns every request unchanged with an empty context.
#[derive(Debug, Default)]
pub struct EchoPool;

#[tonic::async_trait]
impl Pool for EchoPool {
    async fn exec(&self, payload: &Payload) -> Result<Payload, PoolError> {
        Ok(Payload::new(Vec::new(), payload.body.clone()))
    }

    async fn reset(&self) -> Result<(), PoolError> {
        Ok(())
    }

    async fn destroy(&self) {}

    fn workers(&self) -> Vec<WorkerInfo> {
        vec![WorkerInfo { index: 0, pid: None }]
    }
}

/// Records requests and answers with a fixed function.
pub struct RecordingPool {
    seen: Mutex<Vec<Payload>>,
    respond: Box<Respond>,
}

impl RecordingPool {
    pub fn with(
        respond: impl Fn(&Payload) -> Result<Payload, PoolError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        }
    }

    pub fn echo() -> Self {
        Self::with(|payload| Ok(Payload::new(Vec::new(), payload.body.clone())))
    }

    pub fn requests(&self) -> Vec<Payload> {
        self.seen.lock().clone()
    }
}

#[tonic::async_trait]
impl Pool for RecordingPool {
    async fn exec(&self, payload: &Payload) -> Result<Payload, PoolError> {
        self.seen.lock().push(payload.clone());
        (self.respond)(payload)
    }

    async fn reset(&self) -> Result<(), PoolError> {
        Ok(())
    }

    async fn destroy(&self) {}

    fn workers(&self) -> Vec<WorkerInfo> {
        Vec::new()
    }
}

/// Never answers; executions stay pending until their future is dropped.
#[derive(Debug, Default)]
pub struct StallPool;

#[tonic::async_trait]
impl Pool for StallPool {
    async fn exec(&self, _payload: &Payload) -> Result<Payload, PoolError> {
        core::future::pending().await
    }

    async fn reset(&self) -> Result<(), PoolError> {
        Ok(())
    }

    async fn destroy(&self) {}

    fn workers(&self) -> Vec<WorkerInfo> {
        Vec::new()
    }
}

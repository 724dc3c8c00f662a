//! Global unary interceptor.
//!
//! An interceptor wraps every proxied call. It receives the decoded request,
//! the call's [`UnaryServerInfo`], and a [`Next`] handle that runs the actual
//! pool invocation. It may inspect or rewrite the request, short-circuit with
//! its own status, or observe the outcome.

use super::service::ServiceProxy;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tonic::{Request, Response, Status};

/// Information about the call being intercepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnaryServerInfo {
    /// `/<service>/<method>`
    pub full_method: String,
}

/// Continuation that invokes the proxied method.
pub struct Next {
    proxy: Arc<ServiceProxy>,
    method: Arc<str>,
}

impl Next {
    pub(super) fn new(proxy: Arc<ServiceProxy>, method: Arc<str>) -> Self {
        Self { proxy, method }
    }

    pub async fn run(self, request: Request<Bytes>) -> Result<Response<Bytes>, Status> {
        self.proxy.invoke(&self.method, request).await
    }
}

#[tonic::async_trait]
pub trait UnaryInterceptor: Send + Sync + 'static {
    async fn intercept(
        &self,
        request: Request<Bytes>,
        info: UnaryServerInfo,
        next: Next,
    ) -> Result<Response<Bytes>, Status>;
}

/// Logs every call with its duration: failures at `error`, successes at
/// `debug`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingInterceptor;

#[tonic::async_trait]
impl UnaryInterceptor for LoggingInterceptor {
    async fn intercept(
        &self,
        request: Request<Bytes>,
        info: UnaryServerInfo,
        next: Next,
    ) -> Result<Response<Bytes>, Status> {
        let start = Instant::now();
        let result = next.run(request).await;

        match &result {
            Ok(_) => tracing::debug!(
                method = %info.full_method,
                elapsed = ?start.elapsed(),
                "method was called successfully"
            ),
            Err(status) => tracing::error!(
                method = %info.full_method,
                elapsed = ?start.elapsed(),
                code = ?status.code(),
                "method call was finished with error: {}",
                status.message()
            ),
        }

        result
    }
}

//! Runtime service proxy.
//!
//! A [`ServiceProxy`] stands in for the code `tonic-build` would generate for
//! one `.proto` service. Instead of a trait with one method per RPC it keeps a
//! table of method names, and every method is served by the same path:
//!
//! 1. the raw request body is decoded by [`RawCodec`];
//! 2. the body and a JSON [`RpcContext`] are put into a pooled payload;
//! 3. the payload is executed on the worker pool under the shared read guard;
//! 4. the worker's response context is turned back into response metadata, or
//!    into the status the worker embedded in it;
//! 5. the raw response body is returned to the caller.
//!
//! Pool failures go through [`translate_pool_error`](grpc_bridge_core::translate_pool_error)
//! so workers can choose the exact status code and details.

use super::interceptor::{Next, UnaryInterceptor, UnaryServerInfo};
use super::metadata::{ResponseMetadata, apply_metadata, request_context};
use super::tracker::CallTracker;
use crate::server::telemetry::{increment_call_errors, increment_requests, record_call_duration};
use bytes::Bytes;
use core::convert::Infallible;
use core::task::{Context, Poll};
use grpc_bridge_core::{Error, GuardedPool, PayloadPool, RawCodec, RpcContext};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tonic::codec::{CompressionEncoding, EnabledCompressionEncodings};
use tonic::codegen::{Body, BoxFuture, Service, StdError, http};
use tonic::server::{Grpc, UnaryService};
use tonic::{Request, Response, Status};

/// Message size limits applied to every proxied method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageLimits {
    pub max_decoding: Option<usize>,
    pub max_encoding: Option<usize>,
}

/// Serves one gRPC service by forwarding its calls to the worker pool.
pub struct ServiceProxy {
    name: String,
    proto_path: PathBuf,
    methods: Vec<String>,
    pool: GuardedPool,
    payloads: PayloadPool,
    interceptor: Option<Arc<dyn UnaryInterceptor>>,
    tracker: Arc<CallTracker>,
    limits: MessageLimits,
}

impl ServiceProxy {
    /// Creates a proxy for the package-qualified service `name`.
    pub fn new(name: impl Into<String>, proto_path: impl Into<PathBuf>, pool: GuardedPool) -> Self {
        Self {
            name: name.into(),
            proto_path: proto_path.into(),
            methods: Vec::new(),
            pool,
            payloads: PayloadPool::default(),
            interceptor: None,
            tracker: CallTracker::new(),
            limits: MessageLimits::default(),
        }
    }

    pub fn with_interceptor(mut self, interceptor: Option<Arc<dyn UnaryInterceptor>>) -> Self {
        self.interceptor = interceptor;
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<CallTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_limits(mut self, limits: MessageLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_payload_capacity(mut self, capacity: usize) -> Self {
        self.payloads = PayloadPool::new(capacity);
        self
    }

    /// Adds a method to the service. Names are not deduplicated.
    pub fn register_method(&mut self, method: impl Into<String>) {
        self.methods.push(method.into());
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn proto_path(&self) -> &Path {
        &self.proto_path
    }

    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    pub fn payloads(&self) -> &PayloadPool {
        &self.payloads
    }

    /// Describes the service with one handler per registered method, in
    /// registration order.
    pub fn service_descriptor(self: &Arc<Self>) -> ServiceDesc {
        let methods = self
            .methods
            .iter()
            .map(|method| MethodDesc {
                method_name: method.clone(),
                handler: MethodHandler {
                    proxy: Arc::clone(self),
                    method: Arc::from(method.as_str()),
                    full_method: Arc::from(format!("/{}/{}", self.name, method)),
                },
            })
            .collect();

        ServiceDesc {
            service_name: self.name.clone(),
            metadata: self.proto_path.clone(),
            methods,
        }
    }

    /// Runs one call on the worker pool.
    ///
    /// Performs exactly one pool execution. The pooled payload is released
    /// on every path out of this function.
    #[tracing::instrument(name = "invoke", skip_all, fields(service = %self.name, method = %method))]
    pub async fn invoke(
        &self,
        method: &str,
        request: Request<Bytes>,
    ) -> Result<Response<Bytes>, Status> {
        let mut payload = self.payloads.acquire();

        RpcContext::new(self.name.as_str(), method, request_context(&request))
            .write_json(&mut payload.context)
            .map_err(Error::ContextEncode)?;
        payload.body = request.into_inner();

        let response = self.pool.exec(&payload).await.map_err(Error::Pool)?;

        let metadata = ResponseMetadata::parse(&response.context)?.into_result()?;

        let mut reply = Response::new(response.body);
        apply_metadata(&metadata, reply.metadata_mut());
        Ok(reply)
    }

    async fn handle(
        self: Arc<Self>,
        method: Arc<str>,
        full_method: Arc<str>,
        request: Request<Bytes>,
    ) -> Result<Response<Bytes>, Status> {
        let Some(_call) = self.tracker.enter() else {
            return Err(Status::unavailable("Service is shutting down"));
        };

        let start = Instant::now();
        increment_requests(&full_method);

        let result = match self.interceptor.clone() {
            Some(interceptor) => {
                let info = UnaryServerInfo {
                    full_method: full_method.to_string(),
                };
                let next = Next::new(Arc::clone(&self), method);
                interceptor.intercept(request, info, next).await
            }
            None => self.invoke(&method, request).await,
        };

        if result.is_err() {
            increment_call_errors(&full_method);
        }
        record_call_duration(&full_method, start.elapsed().as_secs_f64() * 1000.0);

        result
    }
}

/// Runtime description of a service, ready to be routed.
pub struct ServiceDesc {
    pub service_name: String,
    /// The `.proto` file the service was declared in.
    pub metadata: PathBuf,
    pub methods: Vec<MethodDesc>,
}

pub struct MethodDesc {
    pub method_name: String,
    pub handler: MethodHandler,
}

impl MethodDesc {
    /// Route path, `/<service>/<method>`.
    pub fn path(&self) -> &str {
        &self.handler.full_method
    }
}

/// Tower service answering one proxied method.
#[derive(Clone)]
pub struct MethodHandler {
    proxy: Arc<ServiceProxy>,
    method: Arc<str>,
    full_method: Arc<str>,
}

struct UnaryCall(MethodHandler);

impl UnaryService<Bytes> for UnaryCall {
    type Response = Bytes;
    type Future = BoxFuture<Response<Self::Response>, Status>;

    fn call(&mut self, request: Request<Bytes>) -> Self::Future {
        let MethodHandler {
            proxy,
            method,
            full_method,
        } = self.0.clone();
        Box::pin(proxy.handle(method, full_method, request))
    }
}

fn compression_encodings() -> EnabledCompressionEncodings {
    let mut encodings = EnabledCompressionEncodings::default();
    encodings.enable(CompressionEncoding::Zstd);
    encodings.enable(CompressionEncoding::Gzip);
    encodings.enable(CompressionEncoding::Deflate);
    encodings
}

impl<B> Service<http::Request<B>> for MethodHandler
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::Body>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let limits = self.proxy.limits;
        let method = UnaryCall(self.clone());

        Box::pin(async move {
            let mut grpc = Grpc::new(RawCodec)
                .apply_compression_config(compression_encodings(), compression_encodings())
                .apply_max_message_size_config(limits.max_decoding, limits.max_encoding);
            Ok(grpc.unary(method, req).await)
        })
    }
}

#![allow(dead_code)]

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use grpc_bridge_core::{PEER_ADDRESS, Payload, Pool, PoolError, RawCodec, RpcContext, RpcStatus, WorkerInfo};
use grpc_bridge_server::{Bridge, ServiceDescriptor};
use prost::Message;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Server};
use tonic::{Request, Response, Status};

/// In-memory pool whose behavior is selected by the called method.
#[derive(Debug, Default)]
pub struct ScriptedPool;

#[tonic::async_trait]
impl Pool for ScriptedPool {
    async fn exec(&self, payload: &Payload) -> Result<Payload, PoolError> {
        let ctx: RpcContext = serde_json::from_slice(&payload.context)
            .map_err(|e| PoolError::worker(e.to_string()))?;

        match ctx.method.as_str() {
            "Hello" => Ok(Payload::new(Vec::new(), payload.body.clone())),
            "Fail" => {
                let status = STANDARD.encode(RpcStatus::new(3, "bad arg").encode_to_vec());
                Ok(Payload::new(format!(r#"{{"error":["{status}"]}}"#), "ignored"))
            }
            "Denied" => Err(PoolError::worker("7|:|denied")),
            "Crash" => Err(PoolError::worker("segfault")),
            "Peer" => {
                let peer = ctx
                    .context
                    .get(PEER_ADDRESS)
                    .and_then(|v| v.first())
                    .cloned()
                    .unwrap_or_default();
                Ok(Payload::new(Vec::new(), peer))
            }
            "Meta" => Ok(Payload::new(
                br#"{"x-served-by":["scripted"],"x-echo":"one"}"#.to_vec(),
                payload.body.clone(),
            )),
            "Pair" => {
                let call_id = ctx.context.get("x-call-id").cloned().unwrap_or_default();
                let reply = serde_json::json!({
                    "x-call-id": call_id,
                    "x-method": [ctx.method.clone()],
                });
                Ok(Payload::new(reply.to_string(), payload.body.clone()))
            }
            other => Err(PoolError::worker(format!("12|:|no script for {other}"))),
        }
    }

    async fn reset(&self) -> Result<(), PoolError> {
        Ok(())
    }

    async fn destroy(&self) {}

    fn workers(&self) -> Vec<WorkerInfo> {
        vec![WorkerInfo { index: 0, pid: None }]
    }
}

pub fn greeter() -> ServiceDescriptor {
    ServiceDescriptor {
        package: "pkg".into(),
        name: "Greeter".into(),
        methods: ["Hello", "Fail", "Denied", "Crash", "Peer", "Meta", "Pair"]
            .iter()
            .map(|m| m.to_string())
            .collect(),
    }
}

/// Serves the bridge on an ephemeral local port.
pub async fn serve(bridge: &Bridge) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let routes = bridge.routes();

    tokio::spawn(async move {
        Server::builder()
            .add_routes(routes)
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    addr
}

pub struct RawClient {
    grpc: tonic::client::Grpc<Channel>,
}

impl RawClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let channel = Channel::from_shared(format!("http://{addr}"))
            .unwrap()
            .connect()
            .await
            .unwrap();
        Self {
            grpc: tonic::client::Grpc::new(channel),
        }
    }

    pub async fn call(&mut self, path: &'static str, request: Request<Bytes>) -> Result<Response<Bytes>, Status> {
        self.grpc
            .ready()
            .await
            .map_err(|e| Status::unavailable(e.to_string()))?;
        self.grpc
            .unary(request, PathAndQuery::from_static(path), RawCodec)
            .await
    }

    pub async fn body(&mut self, path: &'static str, body: &'static [u8]) -> Result<Bytes, Status> {
        self.call(path, Request::new(Bytes::from_static(body)))
            .await
            .map(Response::into_inner)
    }
}

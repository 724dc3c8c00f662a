mod common;

use bytes::Bytes;
use common::{RawClient, ScriptedPool, greeter, serve};
use grpc_bridge_core::{GuardedPool, RpcStatus};
use grpc_bridge_server::{Bridge, Next, UnaryInterceptor, UnaryServerInfo};
use std::sync::Arc;
use tonic::{Code, Request, Response, Status};

fn bridge() -> Bridge {
    Bridge::builder(GuardedPool::new(Arc::new(ScriptedPool)))
        .service("greeter.proto", greeter())
        .build()
        .unwrap()
}

#[tokio::test]
async fn unary_call_is_echoed_by_the_worker() {
    let bridge = bridge();
    let mut client = RawClient::connect(serve(&bridge).await).await;

    let body = client.body("/pkg.Greeter/Hello", b"ping").await.unwrap();

    assert_eq!(body, Bytes::from_static(b"ping"));
}

#[tokio::test]
async fn empty_request_body_reaches_the_worker() {
    let bridge = bridge();
    let mut client = RawClient::connect(serve(&bridge).await).await;

    let body = client.body("/pkg.Greeter/Hello", b"").await.unwrap();

    assert!(body.is_empty());
}

#[tokio::test]
async fn embedded_error_becomes_the_call_status() {
    let bridge = bridge();
    let mut client = RawClient::connect(serve(&bridge).await).await;

    let status = client.body("/pkg.Greeter/Fail", b"x").await.unwrap_err();

    assert_eq!(status.code(), Code::InvalidArgument);
    assert_eq!(status.message(), "bad arg");
    let details = RpcStatus::from_status(&status).unwrap();
    assert_eq!(details.code, 3);
}

#[tokio::test]
async fn delimited_worker_error_is_translated() {
    let bridge = bridge();
    let mut client = RawClient::connect(serve(&bridge).await).await;

    let status = client.body("/pkg.Greeter/Denied", b"").await.unwrap_err();
    assert_eq!(status.code(), Code::PermissionDenied);
    assert_eq!(status.message(), "denied");

    let status = client.body("/pkg.Greeter/Crash", b"").await.unwrap_err();
    assert_eq!(status.code(), Code::Internal);
    assert!(status.message().contains("segfault"));
}

#[tokio::test]
async fn response_metadata_is_attached() {
    let bridge = bridge();
    let mut client = RawClient::connect(serve(&bridge).await).await;

    let response = client
        .call("/pkg.Greeter/Meta", Request::new(Bytes::from_static(b"m")))
        .await
        .unwrap();

    assert_eq!(response.metadata().get("x-served-by").unwrap(), "scripted");
    assert_eq!(response.metadata().get("x-echo").unwrap(), "one");
    assert_eq!(response.into_inner(), Bytes::from_static(b"m"));
}

#[tokio::test]
async fn peer_address_reaches_the_worker() {
    let bridge = bridge();
    let mut client = RawClient::connect(serve(&bridge).await).await;

    let body = client.body("/pkg.Greeter/Peer", b"").await.unwrap();

    let peer = String::from_utf8(body.to_vec()).unwrap();
    assert!(peer.starts_with("127.0.0.1:"), "unexpected peer {peer}");
}

#[tokio::test]
async fn unknown_method_is_unimplemented() {
    let bridge = bridge();
    let mut client = RawClient::connect(serve(&bridge).await).await;

    let status = client.body("/pkg.Greeter/Missing", b"").await.unwrap_err();
    assert_eq!(status.code(), Code::Unimplemented);

    let status = client.body("/pkg.Other/Hello", b"").await.unwrap_err();
    assert_eq!(status.code(), Code::Unimplemented);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_do_not_cross_talk() {
    let bridge = bridge();
    let addr = serve(&bridge).await;

    let calls = (0..64).map(|i| async move {
        let mut client = RawClient::connect(addr).await;
        let body = Bytes::from(format!("request-{i}"));
        let mut request = Request::new(body.clone());
        request
            .metadata_mut()
            .insert("x-call-id", i.to_string().parse().unwrap());

        let reply = client.call("/pkg.Greeter/Pair", request).await.unwrap();

        assert_eq!(reply.metadata().get("x-call-id").unwrap(), i.to_string().as_str());
        assert_eq!(reply.metadata().get("x-method").unwrap(), "Pair");
        assert_eq!(reply.into_inner(), body);
    });
    futures::future::join_all(calls).await;

    let idle = bridge.proxies()[0].payloads().idle();
    assert!(idle >= 1 && idle <= 64, "idle payloads: {idle}");
}

struct DenyInterceptor;

#[tonic::async_trait]
impl UnaryInterceptor for DenyInterceptor {
    async fn intercept(
        &self,
        request: Request<Bytes>,
        info: UnaryServerInfo,
        next: Next,
    ) -> Result<Response<Bytes>, Status> {
        if request.metadata().contains_key("x-deny") {
            return Err(Status::permission_denied(info.full_method));
        }
        let mut response = next.run(request).await?;
        response
            .metadata_mut()
            .insert("x-intercepted", "yes".parse().unwrap());
        Ok(response)
    }
}

#[tokio::test]
async fn interceptor_wraps_every_call() {
    let bridge = Bridge::builder(GuardedPool::new(Arc::new(ScriptedPool)))
        .interceptor(DenyInterceptor)
        .service("greeter.proto", greeter())
        .build()
        .unwrap();
    let mut client = RawClient::connect(serve(&bridge).await).await;

    let response = client
        .call("/pkg.Greeter/Hello", Request::new(Bytes::from_static(b"hi")))
        .await
        .unwrap();
    assert_eq!(response.metadata().get("x-intercepted").unwrap(), "yes");

    let mut denied = Request::new(Bytes::from_static(b"hi"));
    denied.metadata_mut().insert("x-deny", "1".parse().unwrap());
    let status = client.call("/pkg.Greeter/Hello", denied).await.unwrap_err();
    assert_eq!(status.code(), Code::PermissionDenied);
    assert_eq!(status.message(), "/pkg.Greeter/Hello");
}

#[tokio::test]
async fn drained_bridge_refuses_calls() {
    let bridge = bridge();
    let mut client = RawClient::connect(serve(&bridge).await).await;

    assert!(bridge.tracker().drain(core::time::Duration::from_millis(50)).await);
    let status = client.body("/pkg.Greeter/Hello", b"x").await.unwrap_err();

    assert_eq!(status.code(), Code::Unavailable);
}

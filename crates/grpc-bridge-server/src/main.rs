use anyhow::Context;
use clap::Parser;
use futures::Stream;
use grpc_bridge_core::GuardedPool;
use grpc_bridge_server::server::telemetry::{TelemetryProviders, init_telemetry};
use grpc_bridge_server::{
    Bridge, CliArgs, LoggingInterceptor, ProcessPool, ProtoParser, ServerConfig, load_services,
    server_builder,
};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::server::Connected;
use tonic_health::ServingStatus;
use tonic_health::server::HealthReporter;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;

    let parser = ProtoParser::new(config.proto_includes.clone());
    let services = load_services(&parser, &config.protos)?;

    let pool = ProcessPool::start(config.pool.clone()).context("failed to start worker pool")?;
    let pool = GuardedPool::new(Arc::new(pool));

    let mut builder = Bridge::builder(pool)
        .limits(config.limits)
        .payload_pool_size(config.payload_pool_size)
        .services(services);
    if config.log_calls {
        builder = builder.interceptor(LoggingInterceptor);
    }
    let bridge = builder.build()?;

    if config.uds {
        #[cfg(unix)]
        {
            use tokio::net::UnixListener;
            use tokio_stream::wrappers::UnixListenerStream;
            let uds_path = config.server_addr.clone();
            let uds = UnixListener::bind(&uds_path)
                .with_context(|| format!("failed to bind {uds_path}"))?;
            let incoming = UnixListenerStream::new(uds);
            log_startup_info(&uds_path, &config, &bridge);
            let res = run_server_with_incoming(providers, incoming, config, bridge).await;
            // Best effort; a panic may leave the socket file behind.
            let _ = std::fs::remove_file(&uds_path);
            res
        }
        #[cfg(not(unix))]
        {
            anyhow::bail!("Unix domain sockets are not supported on this platform");
        }
    } else {
        let tcp_path = config.server_addr.clone();
        let tcp = TcpListener::bind(&tcp_path)
            .await
            .with_context(|| format!("failed to bind {tcp_path}"))?;
        let incoming = TcpListenerStream::new(tcp);
        log_startup_info(&tcp_path, &config, &bridge);
        run_server_with_incoming(providers, incoming, config, bridge).await
    }
}

async fn run_server_with_incoming<I, IO, IE>(
    providers: TelemetryProviders,
    incoming: I,
    config: ServerConfig,
    bridge: Bridge,
) -> anyhow::Result<()>
where
    I: Stream<Item = Result<IO, IE>>,
    IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
    IE: Into<tower::BoxError>,
{
    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    let service_names: Vec<String> = bridge.service_names().map(str::to_owned).collect();
    for name in &service_names {
        health_reporter
            .set_service_status(name, ServingStatus::Serving)
            .await;
    }

    #[cfg(unix)]
    spawn_reset_on_hangup(bridge.pool().clone());

    server_builder(&config)?
        .add_routes(bridge.routes())
        .add_service(health_service)
        .serve_with_incoming_shutdown(
            incoming,
            shutdown_signal(bridge, service_names, health_reporter, &config, providers),
        )
        .await?;

    tracing::info!("Service shut down successfully");
    Ok(())
}

fn log_startup_info(addr: &str, config: &ServerConfig, bridge: &Bridge) {
    if cfg!(debug_assertions) {
        tracing::info!("Starting gRPC bridge on {} with full config: {:#?}", addr, config);
    } else {
        tracing::info!(
            "Starting gRPC bridge on {} with {} workers",
            addr,
            config.pool.num_workers
        );
    }
    for proxy in bridge.proxies() {
        tracing::info!(
            "Serving {} ({} methods) from {}",
            proxy.name(),
            proxy.methods().len(),
            proxy.proto_path().display()
        );
    }
}

/// Replaces every worker process on `SIGHUP`.
#[cfg(unix)]
fn spawn_reset_on_hangup(pool: GuardedPool) {
    tokio::spawn(async move {
        let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("failed to install SIGHUP handler: {e}");
                return;
            }
        };

        while hangup.recv().await.is_some() {
            tracing::info!("Received SIGHUP signal, resetting workers");
            match pool.reset().await {
                Ok(()) => tracing::info!("Worker pool reset complete"),
                Err(e) => tracing::error!("Worker pool reset failed: {e}"),
            }
        }
    });
}

async fn shutdown_signal(
    bridge: Bridge,
    service_names: Vec<String>,
    health_reporter: HealthReporter,
    config: &ServerConfig,
    providers: TelemetryProviders,
) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, terminating gracefully...");

    // 1. Publish the status
    for name in &service_names {
        health_reporter
            .set_service_status(name, ServingStatus::NotServing)
            .await;
    }

    // 2. Refuse new calls and drain in-flight ones
    let tracker = bridge.tracker();
    tracing::info!("Draining in-flight calls ({} active)", tracker.inflight());
    if tracker.drain(config.shutdown_timeout).await {
        tracing::debug!("All in-flight calls drained successfully");
    } else {
        tracing::warn!(
            "Graceful drain timed out ({} calls still active)",
            tracker.inflight()
        );
    }

    // 3. Stop the workers once no execution holds the pool
    bridge.pool().destroy().await;

    providers.shutdown();
}

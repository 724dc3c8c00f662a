//! Server assembly.
//!
//! A [`Bridge`] is the set of [`ServiceProxy`]s built from the configured
//! `.proto` files, all sharing one [`GuardedPool`] and one [`CallTracker`].
//! It is turned into tonic [`Routes`] keyed by exact `/<service>/<method>`
//! paths; any other path answers `Unimplemented`.

use crate::server::config::{ClientAuth, ServerConfig, TlsConfig, TransportConfig};
use crate::server::parser::{ProtoParser, ServiceDescriptor};
use crate::server::proxy::{CallTracker, MessageLimits, ServiceProxy, UnaryInterceptor};
use anyhow::{Context, bail};
use grpc_bridge_core::GuardedPool;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tonic::Status;
use tonic::service::Routes;
use tonic::transport::server::Server;
use tonic::transport::{Certificate, Identity, ServerTlsConfig};

/// Collects services and shared settings for a [`Bridge`].
pub struct BridgeBuilder {
    pool: GuardedPool,
    tracker: Arc<CallTracker>,
    interceptor: Option<Arc<dyn UnaryInterceptor>>,
    limits: MessageLimits,
    payload_pool_size: usize,
    services: Vec<(PathBuf, ServiceDescriptor)>,
}

impl BridgeBuilder {
    pub fn interceptor(mut self, interceptor: impl UnaryInterceptor) -> Self {
        self.interceptor = Some(Arc::new(interceptor));
        self
    }

    pub fn limits(mut self, limits: MessageLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn payload_pool_size(mut self, size: usize) -> Self {
        self.payload_pool_size = size;
        self
    }

    /// Adds one service declared in `proto_path`.
    pub fn service(mut self, proto_path: impl Into<PathBuf>, descriptor: ServiceDescriptor) -> Self {
        self.services.push((proto_path.into(), descriptor));
        self
    }

    pub fn services(
        mut self,
        services: impl IntoIterator<Item = (PathBuf, ServiceDescriptor)>,
    ) -> Self {
        self.services.extend(services);
        self
    }

    /// Builds one proxy per service.
    ///
    /// # Errors
    ///
    /// Fails if two methods resolve to the same route.
    pub fn build(self) -> anyhow::Result<Bridge> {
        let mut seen = HashSet::new();
        let mut proxies = Vec::with_capacity(self.services.len());

        for (proto_path, descriptor) in self.services {
            let mut proxy = ServiceProxy::new(descriptor.full_name(), proto_path, self.pool.clone())
                .with_interceptor(self.interceptor.clone())
                .with_tracker(Arc::clone(&self.tracker))
                .with_limits(self.limits)
                .with_payload_capacity(self.payload_pool_size);

            for method in descriptor.methods {
                let path = format!("/{}/{method}", proxy.name());
                if !seen.insert(path.clone()) {
                    bail!("duplicate route {path} declared in {}", proxy.proto_path().display());
                }
                proxy.register_method(method);
            }

            tracing::debug!(
                service = proxy.name(),
                methods = proxy.methods().len(),
                "registered service"
            );
            proxies.push(Arc::new(proxy));
        }

        Ok(Bridge {
            proxies,
            tracker: self.tracker,
            pool: self.pool,
        })
    }
}

/// Every proxied service, ready to be served.
pub struct Bridge {
    proxies: Vec<Arc<ServiceProxy>>,
    tracker: Arc<CallTracker>,
    pool: GuardedPool,
}

impl Bridge {
    pub fn builder(pool: GuardedPool) -> BridgeBuilder {
        BridgeBuilder {
            pool,
            tracker: CallTracker::new(),
            interceptor: None,
            limits: MessageLimits::default(),
            payload_pool_size: 64,
            services: Vec::new(),
        }
    }

    /// Package-qualified names of the served services.
    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.proxies.iter().map(|p| p.name())
    }

    pub fn proxies(&self) -> &[Arc<ServiceProxy>] {
        &self.proxies
    }

    pub fn tracker(&self) -> &Arc<CallTracker> {
        &self.tracker
    }

    pub fn pool(&self) -> &GuardedPool {
        &self.pool
    }

    /// Router with one route per method and an `Unimplemented` fallback.
    pub fn router(&self) -> axum::Router {
        let mut router = axum::Router::new();
        for proxy in &self.proxies {
            for method in proxy.service_descriptor().methods {
                let path = method.path().to_owned();
                router = router.route_service(&path, method.handler);
            }
        }
        router.fallback(|| async {
            Status::unimplemented("unknown service or method").into_http::<axum::body::Body>()
        })
    }

    pub fn routes(&self) -> Routes {
        Routes::from(self.router())
    }
}

/// Parses every non-empty path in `protos`, pairing each declared service
/// with the file it came from.
///
/// # Errors
///
/// Fails on the first file `parser` cannot compile.
pub fn load_services(
    parser: &ProtoParser,
    protos: &[PathBuf],
) -> anyhow::Result<Vec<(PathBuf, ServiceDescriptor)>> {
    let mut loaded = Vec::new();
    for proto in protos.iter().filter(|p| !p.as_os_str().is_empty()) {
        let services = parser
            .parse_file(proto)
            .with_context(|| format!("failed to parse {}", proto.display()))?;
        if services.is_empty() {
            tracing::warn!("{} declares no services", proto.display());
        }
        loaded.extend(services.into_iter().map(|s| (proto.clone(), s)));
    }
    Ok(loaded)
}

/// Builds the tonic server with transport and TLS options applied.
///
/// # Errors
///
/// Fails if TLS material cannot be read or is rejected.
pub fn server_builder(config: &ServerConfig) -> anyhow::Result<Server> {
    let mut server = apply_transport(Server::builder(), &config.transport);

    if let Some(tls) = &config.tls {
        server = server
            .tls_config(tls_config(tls)?)
            .context("invalid TLS configuration")?;
    }

    Ok(server)
}

fn apply_transport(mut server: Server, transport: &TransportConfig) -> Server {
    server = server
        .max_concurrent_streams(transport.max_concurrent_streams)
        .http2_keepalive_interval(transport.keepalive_time)
        .http2_keepalive_timeout(transport.keepalive_timeout);

    if let Some(age) = transport.max_connection_age {
        server = server.max_connection_age(age);
    }
    if transport.max_connection_idle.is_some() {
        tracing::warn!("MAX_CONNECTION_IDLE is not supported by the transport and is ignored");
    }
    if transport.max_connection_age_grace.is_some() {
        tracing::warn!("MAX_CONNECTION_AGE_GRACE is not supported by the transport and is ignored");
    }

    server
}

fn read_pem(path: &Path) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn tls_config(tls: &TlsConfig) -> anyhow::Result<ServerTlsConfig> {
    let identity = Identity::from_pem(read_pem(&tls.cert)?, read_pem(&tls.key)?);
    let mut config = ServerTlsConfig::new().identity(identity);

    if let Some(root_ca) = &tls.root_ca {
        config = config
            .client_ca_root(Certificate::from_pem(read_pem(root_ca)?))
            .client_auth_optional(tls.client_auth == ClientAuth::VerifyIfGiven);
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::proxy::testing::EchoPool;
    use core::time::Duration;

    fn descriptor(name: &str, methods: &[&str]) -> ServiceDescriptor {
        ServiceDescriptor {
            package: "pkg".into(),
            name: name.into(),
            methods: methods.iter().map(|m| m.to_string()).collect(),
        }
    }

    fn pool() -> GuardedPool {
        GuardedPool::new(Arc::new(EchoPool))
    }

    #[test]
    fn proxies_share_pool_and_tracker() {
        let shared = pool();
        let bridge = Bridge::builder(shared.clone())
            .service("a.proto", descriptor("Greeter", &["Hello", "Bye"]))
            .service("b.proto", descriptor("Admin", &["Reset"]))
            .build()
            .unwrap();

        let names: Vec<_> = bridge.service_names().collect();
        assert_eq!(names, ["pkg.Greeter", "pkg.Admin"]);
        assert_eq!(bridge.proxies()[0].methods(), ["Hello", "Bye"]);
        assert_eq!(bridge.proxies()[1].proto_path(), Path::new("b.proto"));
        assert!(bridge.pool().shares_guard_with(&shared));
    }

    #[test]
    fn services_extend_in_order() {
        let bridge = Bridge::builder(pool())
            .services([
                (PathBuf::from("a.proto"), descriptor("A", &["X"])),
                (PathBuf::from("b.proto"), descriptor("B", &["Y"])),
            ])
            .build()
            .unwrap();

        let names: Vec<_> = bridge.service_names().collect();
        assert_eq!(names, ["pkg.A", "pkg.B"]);
    }

    #[test]
    fn empty_proto_paths_are_skipped() {
        let loaded = load_services(&ProtoParser::default(), &[PathBuf::new()]).unwrap();

        assert!(loaded.is_empty());
    }

    #[test]
    fn duplicate_routes_are_rejected() {
        let err = Bridge::builder(pool())
            .service("a.proto", descriptor("Greeter", &["Hello"]))
            .service("b.proto", descriptor("Greeter", &["Hello"]))
            .build()
            .err()
            .unwrap();

        assert!(err.to_string().contains("/pkg.Greeter/Hello"));
    }

    #[test]
    fn duplicate_method_in_one_service_is_rejected() {
        let result = Bridge::builder(pool())
            .service("a.proto", descriptor("Greeter", &["Hello", "Hello"]))
            .build();

        assert!(result.is_err());
    }

    #[test]
    fn every_transport_option_is_applied() {
        let transport = TransportConfig {
            max_concurrent_streams: Some(64),
            max_connection_idle: Some(Duration::from_secs(60)),
            max_connection_age: Some(Duration::from_secs(600)),
            max_connection_age_grace: Some(Duration::from_secs(5)),
            keepalive_time: Some(Duration::from_secs(30)),
            keepalive_timeout: Some(Duration::from_secs(10)),
        };

        let _server = apply_transport(Server::builder(), &transport);
        let _defaults = apply_transport(Server::builder(), &TransportConfig::default());
    }

    #[test]
    fn missing_tls_material_is_an_error() {
        let tls = TlsConfig {
            cert: "/nonexistent/cert.pem".into(),
            key: "/nonexistent/key.pem".into(),
            root_ca: None,
            client_auth: ClientAuth::RequireAndVerify,
        };

        let err = tls_config(&tls).unwrap_err();
        assert!(err.to_string().contains("cert.pem"));
    }
}

use crate::server::pool::{PoolConfig, WorkerCommand};
use crate::server::proxy::MessageLimits;
use anyhow::bail;
use clap::{Parser, ValueEnum};
use core::time::Duration;
use std::path::PathBuf;

const MB: usize = 1024 * 1024;

/// Room reserved in a worker frame for the header and the JSON context.
const FRAME_OVERHEAD: usize = MB;

/// Runtime configuration for the `grpc-bridge-server` binary.
///
/// Every option can be given on the command line or through the environment
/// (a `.env` file is loaded first).
#[derive(Parser, Debug, Clone)]
#[command(
    name = "grpc-bridge-server",
    version,
    about = "Serves .proto-declared gRPC services from an external worker pool"
)]
pub struct CliArgs {
    /// Address to listen on (TCP or Unix socket path; use --uds for Unix socket).
    ///
    /// Example: "0.0.0.0:9001" or "/tmp/grpc-bridge.sock"
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:9001"))]
    pub server_addr: String,

    /// Listen on a Unix socket instead of TCP. If set, `SERVER_ADDR` must be a file path.
    #[arg(short, long, default_value_t = false)]
    pub uds: bool,

    /// `.proto` files whose services are served. Repeat the flag or separate
    /// paths with commas.
    #[arg(long, env = "PROTO", value_delimiter = ',', required = true)]
    pub proto: Vec<PathBuf>,

    /// Additional `protoc` include directories.
    #[arg(long, env = "PROTO_INCLUDE", value_delimiter = ',')]
    pub proto_include: Vec<PathBuf>,

    /// Command that starts one worker process, e.g. "php worker.php".
    #[arg(long, env = "WORKER_COMMAND")]
    pub worker_command: String,

    /// Number of worker processes.
    #[arg(long, env = "NUM_WORKERS", default_value_t = 4)]
    pub num_workers: usize,

    /// Per-worker request queue depth.
    #[arg(long, env = "WORKER_QUEUE_SIZE", default_value_t = 64)]
    pub worker_queue_size: usize,

    /// Milliseconds a worker may take to answer one call.
    #[arg(long, env = "EXEC_TIMEOUT_MS", default_value_t = 60_000)]
    pub exec_timeout_ms: u64,

    /// Seconds to wait for in-flight calls on shutdown.
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 10)]
    pub shutdown_timeout: u64,

    /// Maximum inbound message size in MB.
    #[arg(long, env = "MAX_RECV_MSG_SIZE", default_value_t = 50)]
    pub max_recv_msg_size: usize,

    /// Maximum outbound message size in MB.
    #[arg(long, env = "MAX_SEND_MSG_SIZE", default_value_t = 50)]
    pub max_send_msg_size: usize,

    /// Maximum concurrent HTTP/2 streams per connection.
    #[arg(long, env = "MAX_CONCURRENT_STREAMS")]
    pub max_concurrent_streams: Option<u32>,

    /// Seconds of idleness before a connection is closed.
    #[arg(long, env = "MAX_CONNECTION_IDLE")]
    pub max_connection_idle: Option<u64>,

    /// Maximum connection lifetime in seconds.
    #[arg(long, env = "MAX_CONNECTION_AGE")]
    pub max_connection_age: Option<u64>,

    /// Grace period in seconds after the maximum connection age.
    #[arg(long, env = "MAX_CONNECTION_AGE_GRACE")]
    pub max_connection_age_grace: Option<u64>,

    /// Interval in seconds between HTTP/2 keepalive pings.
    #[arg(long, env = "KEEPALIVE_TIME")]
    pub keepalive_time: Option<u64>,

    /// Seconds to wait for a keepalive acknowledgement.
    #[arg(long, env = "KEEPALIVE_TIMEOUT")]
    pub keepalive_timeout: Option<u64>,

    /// PEM certificate chain for TLS.
    #[arg(long, env = "TLS_CERT", requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key for TLS.
    #[arg(long, env = "TLS_KEY", requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    /// PEM CA bundle used to verify client certificates.
    #[arg(long, env = "TLS_ROOT_CA")]
    pub tls_root_ca: Option<PathBuf>,

    /// Client certificate policy when a root CA is configured.
    #[arg(long, env = "TLS_CLIENT_AUTH", value_enum, default_value_t = ClientAuth::RequireAndVerify)]
    pub tls_client_auth: ClientAuth,

    /// Idle payload envelopes kept for reuse per service.
    #[arg(long, env = "PAYLOAD_POOL_SIZE", default_value_t = 64)]
    pub payload_pool_size: usize,

    /// Disable the per-call logging interceptor.
    #[arg(long, env = "DISABLE_CALL_LOG", default_value_t = false)]
    pub disable_call_log: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ClientAuth {
    VerifyIfGiven,
    RequireAndVerify,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub root_ca: Option<PathBuf>,
    pub client_auth: ClientAuth,
}

/// HTTP/2 connection options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportConfig {
    pub max_concurrent_streams: Option<u32>,
    pub max_connection_idle: Option<Duration>,
    pub max_connection_age: Option<Duration>,
    pub max_connection_age_grace: Option<Duration>,
    pub keepalive_time: Option<Duration>,
    pub keepalive_timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub uds: bool,
    pub protos: Vec<PathBuf>,
    pub proto_includes: Vec<PathBuf>,
    pub pool: PoolConfig,
    pub shutdown_timeout: Duration,
    pub limits: MessageLimits,
    pub transport: TransportConfig,
    pub tls: Option<TlsConfig>,
    pub payload_pool_size: usize,
    pub log_calls: bool,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.num_workers == 0 {
            bail!("NUM_WORKERS must be greater than 0");
        }
        if args.worker_queue_size == 0 {
            bail!("WORKER_QUEUE_SIZE must be greater than 0");
        }
        if args.exec_timeout_ms == 0 {
            bail!("EXEC_TIMEOUT_MS must be greater than 0");
        }

        let mut words = args.worker_command.split_whitespace();
        let Some(program) = words.next() else {
            bail!("WORKER_COMMAND must not be empty");
        };
        let command = WorkerCommand::new(program, words);

        let protos: Vec<PathBuf> = args
            .proto
            .into_iter()
            .filter(|p| !p.as_os_str().is_empty())
            .collect();
        if protos.is_empty() {
            bail!("at least one PROTO file is required");
        }
        for proto in &protos {
            if !proto.is_file() {
                bail!("proto file {} does not exist", proto.display());
            }
        }

        let max_recv = args
            .max_recv_msg_size
            .checked_mul(MB)
            .ok_or_else(|| anyhow::anyhow!("Overflow in MAX_RECV_MSG_SIZE computation"))?;
        let max_send = args
            .max_send_msg_size
            .checked_mul(MB)
            .ok_or_else(|| anyhow::anyhow!("Overflow in MAX_SEND_MSG_SIZE computation"))?;
        if max_recv == 0 || max_send == 0 {
            bail!("message size limits must be greater than 0");
        }
        let max_frame_length = max_recv
            .max(max_send)
            .checked_add(FRAME_OVERHEAD)
            .ok_or_else(|| anyhow::anyhow!("Overflow in frame length computation"))?;

        let tls = match (args.tls_cert, args.tls_key) {
            (Some(cert), Some(key)) => Some(TlsConfig {
                cert,
                key,
                root_ca: args.tls_root_ca,
                client_auth: args.tls_client_auth,
            }),
            (None, None) => {
                if args.tls_root_ca.is_some() {
                    bail!("TLS_ROOT_CA requires TLS_CERT and TLS_KEY");
                }
                None
            }
            _ => bail!("TLS_CERT and TLS_KEY must be set together"),
        };

        let secs = |v: Option<u64>| v.map(Duration::from_secs);

        Ok(Self {
            server_addr: args.server_addr,
            uds: args.uds,
            protos,
            proto_includes: args.proto_include,
            pool: PoolConfig {
                command,
                num_workers: args.num_workers,
                queue_capacity: args.worker_queue_size,
                exec_timeout: Duration::from_millis(args.exec_timeout_ms),
                ack_timeout: Duration::from_secs(3),
                max_frame_length,
            },
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
            limits: MessageLimits {
                max_decoding: Some(max_recv),
                max_encoding: Some(max_send),
            },
            transport: TransportConfig {
                max_concurrent_streams: args.max_concurrent_streams,
                max_connection_idle: secs(args.max_connection_idle),
                max_connection_age: secs(args.max_connection_age),
                max_connection_age_grace: secs(args.max_connection_age_grace),
                keepalive_time: secs(args.keepalive_time),
                keepalive_timeout: secs(args.keepalive_timeout),
            },
            tls,
            payload_pool_size: args.payload_pool_size,
            log_calls: !args.disable_call_log,
        })
    }
}

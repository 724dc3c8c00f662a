#![doc = include_str!("../README.md")]

pub mod server;

pub use server::assembly::{Bridge, BridgeBuilder, load_services, server_builder};
pub use server::config::{CliArgs, ServerConfig};
pub use server::parser::{ProtoParser, ServiceDescriptor};
pub use server::pool::{PoolConfig, ProcessPool, WorkerCommand};
pub use server::proxy::{LoggingInterceptor, Next, UnaryInterceptor, UnaryServerInfo};

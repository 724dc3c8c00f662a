pub mod assembly;
pub mod config;
pub mod parser;
pub mod pool;
pub mod proxy;
pub mod telemetry;

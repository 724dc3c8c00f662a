pub mod frame;
mod manager;
mod request;
mod worker;

pub use manager::*;
pub use worker::WorkerCommand;

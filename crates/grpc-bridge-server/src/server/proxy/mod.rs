mod interceptor;
mod metadata;
mod service;
#[cfg(test)]
pub(crate) mod testing;
mod tracker;

pub use interceptor::*;
pub use metadata::*;
pub use service::*;
pub use tracker::*;

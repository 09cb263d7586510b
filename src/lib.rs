//! Fault-tolerant relay for OpenAI-compatible APIs: channel failover, transparent streaming,
//! and quota metering.

mod error;
pub mod gateway;
pub(crate) mod utils;

pub use error::{DittoError, Result};

pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod metrics;
pub mod orchestration;
pub mod quality;
pub mod store;

pub use error::{Error, Result};

pub mod config;
pub mod error;

pub use config::{Config, PoolConfig, TaskConfig};
pub use error::*;

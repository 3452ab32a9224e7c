pub mod config;
pub mod error;

pub use config::{ConfigError, ServiceConfig};
pub use error::ServiceError;

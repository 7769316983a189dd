pub mod config;
pub mod error;

pub use config::{AwsConfig, Config, ListenerConfig, ListenerKind, QueueConfig};
pub use error::ConfigError;

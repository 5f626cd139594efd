pub mod config;
pub mod connector;
pub mod error;
pub mod instance;
pub mod instance_cache;
pub mod telemetry;

pub use config::{BaseConfig, InstanceCacheConfig};
pub use connector::{
    ApiConnector, ApiConnectorConfig, ApiSession, PostgresConnector, PostgresConnectorConfig,
    PostgresSession, SessionConnector, UpstreamSession,
};
pub use error::{InstanceError, Result};
pub use instance::{fingerprint_token, ConnectionInstance};
pub use instance_cache::{InstanceCache, InstanceCacheStats};
pub use telemetry::init_tracing;

//! Upstream session establishment.
//!
//! A [`SessionConnector`] turns `(base config, session key, access token)`
//! into a live [`UpstreamSession`]. The instance cache owns the sessions it
//! gets back and closes them on eviction.

pub mod api;
pub mod postgres;

use crate::config::BaseConfig;
use crate::error::Result;
use async_trait::async_trait;
use std::any::Any;
use tenancy_models::SessionKey;

pub use api::{ApiConnector, ApiConnectorConfig, ApiSession};
pub use postgres::{PostgresConnector, PostgresConnectorConfig, PostgresSession};

/// Establishes tenant-scoped sessions against an external endpoint
#[async_trait]
pub trait SessionConnector: Send + Sync + 'static {
    async fn connect(
        &self,
        base: &BaseConfig,
        key: &SessionKey,
        access_token: &str,
    ) -> Result<Box<dyn UpstreamSession>>;
}

/// A live session owned by exactly one connection instance
#[async_trait]
pub trait UpstreamSession: Send + Sync + 'static {
    /// Release network resources held by the session.
    async fn close(&self);

    /// Short human-readable description for diagnostics.
    fn describe(&self) -> String;

    fn as_any(&self) -> &dyn Any;
}

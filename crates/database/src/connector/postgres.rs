use super::{SessionConnector, UpstreamSession};
use crate::config::BaseConfig;
use crate::error::{InstanceError, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::any::Any;
use std::time::Duration;
use tenancy_models::SessionKey;

#[derive(Debug, Clone)]
pub struct PostgresConnectorConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    /// Session setting that carries the tenant id (read by RLS policies)
    pub tenant_setting: String,
    /// Session setting that carries the user id
    pub user_setting: String,
}

impl Default for PostgresConnectorConfig {
    fn default() -> Self {
        Self {
            database_url: "postgresql://localhost:5432/tenancy".to_string(),
            max_connections: 5,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(10),
            tenant_setting: "app.tenant_id".to_string(),
            user_setting: "app.user_id".to_string(),
        }
    }
}

impl PostgresConnectorConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("TENANCY_DATABASE_URL")
                .unwrap_or_else(|_| Self::default().database_url),
            max_connections: std::env::var("TENANCY_DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            min_connections: std::env::var("TENANCY_DB_MIN_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
            ..Default::default()
        }
    }
}

/// Opens a dedicated pool per (user, tenant), authenticated with the caller's
/// access token and pinned to the tenant through session settings.
#[derive(Debug, Clone)]
pub struct PostgresConnector {
    config: PostgresConnectorConfig,
}

impl PostgresConnector {
    pub fn new(config: PostgresConnectorConfig) -> Self {
        Self { config }
    }

    fn connect_options(&self, access_token: &str) -> Result<PgConnectOptions> {
        let options: PgConnectOptions = self
            .config
            .database_url
            .parse()
            .map_err(|e| InstanceError::Configuration(format!("Invalid database URL: {}", e)))?;

        Ok(options.password(access_token))
    }
}

#[async_trait]
impl SessionConnector for PostgresConnector {
    async fn connect(
        &self,
        _base: &BaseConfig,
        key: &SessionKey,
        access_token: &str,
    ) -> Result<Box<dyn UpstreamSession>> {
        let options = self.connect_options(access_token)?;

        let tenant_setting = self.config.tenant_setting.clone();
        let user_setting = self.config.user_setting.clone();
        let tenant_id = key.tenant_id.clone();
        let user_id = key.user_id.clone();

        let pool = PgPoolOptions::new()
            .max_connections(self.config.max_connections)
            .min_connections(self.config.min_connections)
            .acquire_timeout(self.config.acquire_timeout)
            .idle_timeout(Duration::from_secs(600))
            .after_connect(move |conn, _meta| {
                let tenant_setting = tenant_setting.clone();
                let user_setting = user_setting.clone();
                let tenant_id = tenant_id.clone();
                let user_id = user_id.clone();
                Box::pin(async move {
                    if let Some(tenant_id) = tenant_id {
                        sqlx::query("SELECT set_config($1, $2, false)")
                            .bind(&tenant_setting)
                            .bind(&tenant_id)
                            .execute(&mut *conn)
                            .await?;
                    }
                    sqlx::query("SELECT set_config($1, $2, false)")
                        .bind(&user_setting)
                        .bind(&user_id)
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect_with(options)
            .await
            .map_err(|e| {
                InstanceError::UpstreamUnavailable(format!(
                    "Failed to connect to tenant database for {}: {}",
                    key, e
                ))
            })?;

        tracing::debug!("Created connection pool for {}", key);

        Ok(Box::new(PostgresSession {
            pool,
            key: key.clone(),
        }))
    }
}

pub struct PostgresSession {
    pool: PgPool,
    key: SessionKey,
}

impl PostgresSession {
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl UpstreamSession for PostgresSession {
    async fn close(&self) {
        self.pool.close().await;
    }

    fn describe(&self) -> String {
        format!("postgres pool for {} ({} connections)", self.key, self.pool.size())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

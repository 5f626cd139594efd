use super::{SessionConnector, UpstreamSession};
use crate::config::BaseConfig;
use crate::error::{InstanceError, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Method, RequestBuilder, StatusCode};
use std::any::Any;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tenancy_models::SessionKey;

#[derive(Debug, Clone)]
pub struct ApiConnectorConfig {
    /// Path (relative to the API base) probed when establishing a session
    pub probe_path: String,
    /// Header carrying the tenant id on tenant-scoped sessions
    pub tenant_header: String,
    pub request_timeout: Duration,
}

impl Default for ApiConnectorConfig {
    fn default() -> Self {
        Self {
            probe_path: "/me".to_string(),
            tenant_header: "X-Tenant-Id".to_string(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl ApiConnectorConfig {
    pub fn from_env() -> Self {
        Self {
            request_timeout: Duration::from_secs(
                std::env::var("TENANCY_API_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10),
            ),
            ..Default::default()
        }
    }
}

/// Establishes HTTP sessions against the tenant database API.
///
/// A session is considered established once the probe endpoint accepts the
/// caller's bearer token.
#[derive(Debug, Clone, Default)]
pub struct ApiConnector {
    config: ApiConnectorConfig,
}

impl ApiConnector {
    pub fn new(config: ApiConnectorConfig) -> Self {
        Self { config }
    }

    fn default_headers(&self, key: &SessionKey, access_token: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        let mut auth = HeaderValue::from_str(&format!("Bearer {}", access_token)).map_err(|_| {
            InstanceError::InvalidCredential(
                "Access token contains characters not allowed in a header".to_string(),
            )
        })?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        if let Some(tenant_id) = &key.tenant_id {
            let name = HeaderName::from_bytes(self.config.tenant_header.as_bytes()).map_err(|e| {
                InstanceError::Configuration(format!(
                    "Invalid tenant header name '{}': {}",
                    self.config.tenant_header, e
                ))
            })?;
            let value = HeaderValue::from_str(tenant_id).map_err(|_| {
                InstanceError::InvalidCredential(format!(
                    "Tenant id '{}' is not a valid header value",
                    tenant_id
                ))
            })?;
            headers.insert(name, value);
        }

        Ok(headers)
    }
}

#[async_trait]
impl SessionConnector for ApiConnector {
    async fn connect(
        &self,
        base: &BaseConfig,
        key: &SessionKey,
        access_token: &str,
    ) -> Result<Box<dyn UpstreamSession>> {
        let headers = self.default_headers(key, access_token)?;

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(self.config.request_timeout)
            .build()
            .map_err(|e| InstanceError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        let base_url = base.api_base_path.trim_end_matches('/').to_string();
        let probe_url = join_path(&base_url, &self.config.probe_path);

        let response = client.get(&probe_url).send().await.map_err(|e| {
            InstanceError::UpstreamUnavailable(format!("Failed to reach {}: {}", probe_url, e))
        })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(InstanceError::rejected(&probe_url, status.as_u16()));
        }
        if !status.is_success() {
            return Err(InstanceError::UpstreamUnavailable(format!(
                "{} returned status {}",
                probe_url, status
            )));
        }

        tracing::debug!("Established API session for {} at {}", key, base_url);

        Ok(Box::new(ApiSession {
            client: Mutex::new(Some(client)),
            base_url,
            key: key.clone(),
        }))
    }
}

/// HTTP client preconfigured with the caller's token and tenant scope
pub struct ApiSession {
    /// `None` once released; dropping the client closes its pooled sockets
    client: Mutex<Option<reqwest::Client>>,
    base_url: String,
    key: SessionKey,
}

impl ApiSession {
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Start a request against `path`, relative to the API base.
    pub fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let client = self.lock_client().clone().ok_or_else(|| {
            InstanceError::UpstreamUnavailable(format!(
                "Session for {} has been released",
                self.key
            ))
        })?;
        Ok(client.request(method, join_path(&self.base_url, path)))
    }

    pub fn is_closed(&self) -> bool {
        self.lock_client().is_none()
    }

    fn lock_client(&self) -> MutexGuard<'_, Option<reqwest::Client>> {
        self.client.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl UpstreamSession for ApiSession {
    async fn close(&self) {
        let client = self.lock_client().take();
        drop(client);
    }

    fn describe(&self) -> String {
        format!("api session {} -> {}", self.key, self.base_url)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn join_path(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url, path.trim_start_matches('/'))
}

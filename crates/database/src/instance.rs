use crate::connector::UpstreamSession;
use chrono::{DateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tenancy_models::{InstanceInfo, SessionKey};
use uuid::Uuid;

/// Live, tenant-scoped handle returned by the instance cache.
///
/// Cloning is cheap and every clone refers to the same underlying session;
/// use [`ConnectionInstance::ptr_eq`] to compare identity.
#[derive(Clone)]
pub struct ConnectionInstance {
    inner: Arc<InstanceInner>,
}

struct InstanceInner {
    id: Uuid,
    key: SessionKey,
    token_fingerprint: String,
    created_at: DateTime<Utc>,
    last_used_ms: AtomicI64,
    released: AtomicBool,
    session: Box<dyn UpstreamSession>,
}

impl ConnectionInstance {
    pub(crate) fn new(key: SessionKey, access_token: &str, session: Box<dyn UpstreamSession>) -> Self {
        let now = Utc::now();
        Self {
            inner: Arc::new(InstanceInner {
                id: Uuid::new_v4(),
                key,
                token_fingerprint: fingerprint_token(access_token),
                created_at: now,
                last_used_ms: AtomicI64::new(now.timestamp_millis()),
                released: AtomicBool::new(false),
                session,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn key(&self) -> &SessionKey {
        &self.inner.key
    }

    pub fn user_id(&self) -> &str {
        &self.inner.key.user_id
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.inner.key.tenant_id.as_deref()
    }

    pub fn token_fingerprint(&self) -> &str {
        &self.inner.token_fingerprint
    }

    /// Whether this instance was created with `access_token`
    pub fn was_created_with(&self, access_token: &str) -> bool {
        self.inner.token_fingerprint == fingerprint_token(access_token)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn last_used_at(&self) -> DateTime<Utc> {
        let ms = self.inner.last_used_ms.load(Ordering::Acquire);
        Utc.timestamp_millis_opt(ms)
            .single()
            .unwrap_or(self.inner.created_at)
    }

    pub(crate) fn touch(&self) {
        self.inner
            .last_used_ms
            .fetch_max(Utc::now().timestamp_millis(), Ordering::AcqRel);
    }

    pub fn session(&self) -> &dyn UpstreamSession {
        self.inner.session.as_ref()
    }

    /// Borrow the underlying session as its concrete connector type.
    pub fn session_as<T: UpstreamSession>(&self) -> Option<&T> {
        self.inner.session.as_any().downcast_ref::<T>()
    }

    pub fn ptr_eq(&self, other: &ConnectionInstance) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Close the underlying session. Only the first call does any work.
    pub(crate) async fn release(&self) {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.session.close().await;
    }

    pub fn info(&self) -> InstanceInfo {
        InstanceInfo {
            id: self.inner.id,
            user_id: self.inner.key.user_id.clone(),
            tenant_id: self.inner.key.tenant_id.clone(),
            token_fingerprint: self.inner.token_fingerprint.clone(),
            created_at: self.inner.created_at,
            last_used_at: self.last_used_at(),
        }
    }
}

impl fmt::Debug for ConnectionInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInstance")
            .field("id", &self.inner.id)
            .field("key", &self.inner.key)
            .field("session", &self.inner.session.describe())
            .field("released", &self.is_released())
            .finish()
    }
}

/// Short SHA-256 fingerprint of an access token, safe to log
pub fn fingerprint_token(access_token: &str) -> String {
    let digest = Sha256::digest(access_token.as_bytes());
    hex::encode(&digest[..8])
}

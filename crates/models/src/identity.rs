use serde::{Deserialize, Serialize};
use std::fmt;
use validator::Validate;

/// Lookup key for a cached instance.
///
/// The access token is deliberately absent: two requests for the same user
/// and tenant share one instance regardless of the token they carry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub user_id: String,
    /// `None` means the session is not scoped to any tenant.
    pub tenant_id: Option<String>,
}

impl SessionKey {
    pub fn new(user_id: impl Into<String>, tenant_id: Option<impl Into<String>>) -> Self {
        Self {
            user_id: user_id.into(),
            tenant_id: tenant_id.map(Into::into),
        }
    }

    pub fn is_tenant_scoped(&self) -> bool {
        self.tenant_id.is_some()
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tenant_id {
            Some(tenant_id) => write!(f, "{}@{}", self.user_id, tenant_id),
            None => write!(f, "{}@<none>", self.user_id),
        }
    }
}

/// Per-request identity: who is asking, for which tenant, with which token.
#[derive(Clone, PartialEq, Eq, Deserialize, Validate)]
pub struct IdentityKey {
    #[validate(length(min = 1))]
    pub user_id: String,

    pub tenant_id: Option<String>,

    #[validate(length(min = 1))]
    pub access_token: String,
}

impl IdentityKey {
    pub fn new(
        user_id: impl Into<String>,
        tenant_id: Option<impl Into<String>>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            tenant_id: tenant_id.map(Into::into),
            access_token: access_token.into(),
        }
    }

    pub fn session_key(&self) -> SessionKey {
        SessionKey {
            user_id: self.user_id.clone(),
            tenant_id: self.tenant_id.clone(),
        }
    }
}

// Tokens must never end up in logs.
impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKey")
            .field("user_id", &self.user_id)
            .field("tenant_id", &self.tenant_id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

impl From<&IdentityKey> for SessionKey {
    fn from(key: &IdentityKey) -> Self {
        key.session_key()
    }
}

/// Identity as handed over by the request layer (cookie/session parsing).
///
/// `user_id` is absent for unauthenticated callers.
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawIdentity {
    pub access_token: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

impl RawIdentity {
    /// Blank tenant ids count as "no tenant".
    pub fn normalized_tenant_id(&self) -> Option<String> {
        self.tenant_id
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    }
}

impl fmt::Debug for RawIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawIdentity")
            .field("user_id", &self.user_id)
            .field("tenant_id", &self.tenant_id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

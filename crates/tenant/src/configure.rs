// Configures a connection instance from the identity the request layer
// extracted (cookie/session parsing happens upstream of this crate)

use crate::context::TenantContext;
use tenancy_database::{ConnectionInstance, InstanceCache, InstanceError, Result};
use tenancy_models::{IdentityKey, RawIdentity};

/// Build the identity key for a raw request identity.
///
/// Unauthenticated callers (no user id) are rejected; a blank tenant id
/// means the session is not tenant scoped.
pub fn identity_from_raw(raw: &RawIdentity) -> Result<IdentityKey> {
    let user_id = raw
        .user_id
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| {
            InstanceError::InvalidCredential("Caller is not authenticated (no user id)".to_string())
        })?;

    if raw.access_token.is_empty() {
        return Err(InstanceError::InvalidCredential(
            "Access token must not be empty".to_string(),
        ));
    }

    Ok(IdentityKey::new(
        user_id,
        raw.normalized_tenant_id(),
        raw.access_token.as_str(),
    ))
}

/// Return the instance for this caller's user and tenant, reusing an
/// existing one when the same user already has one for the same tenant.
pub async fn configure_instance(
    cache: &InstanceCache,
    raw: &RawIdentity,
) -> Result<ConnectionInstance> {
    let identity = identity_from_raw(raw)?;
    tracing::trace!("Configuring instance for {:?}", identity);
    cache.get_instance(&identity).await
}

/// Same as [`configure_instance`], wrapped in a request-scoped context
pub async fn resolve_context(cache: &InstanceCache, raw: &RawIdentity) -> Result<TenantContext> {
    configure_instance(cache, raw).await.map(TenantContext::new)
}

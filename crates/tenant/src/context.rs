// Tenant context for request handling

use tenancy_database::ConnectionInstance;
use tenancy_models::SessionKey;

#[derive(Debug, Clone)]
pub struct TenantContext {
    pub key: SessionKey,
    pub instance: ConnectionInstance,
}

impl TenantContext {
    pub fn new(instance: ConnectionInstance) -> Self {
        Self {
            key: instance.key().clone(),
            instance,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.key.user_id
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.key.tenant_id.as_deref()
    }

    pub fn is_tenant_scoped(&self) -> bool {
        self.key.is_tenant_scoped()
    }
}

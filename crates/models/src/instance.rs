use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Diagnostic snapshot of a cached connection instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub id: Uuid,
    pub user_id: String,
    pub tenant_id: Option<String>,
    /// Hex SHA-256 prefix of the token the instance was created with
    pub token_fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Registry row for one consumer bill number.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct RegistryRecord {
    pub id: Uuid,
    pub consumer_number: String,
    pub status: String,
    pub remark: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of an idempotent insert.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub record: RegistryRecord,
    /// `false` when the number was already registered.
    pub inserted: bool,
}

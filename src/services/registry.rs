use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::models::bill::ExtractedIdentifier;
use crate::models::registry::{Registration, RegistryRecord};

/// Store of every consumer bill number seen so far.
///
/// `upsert` must be atomic: two concurrent calls with the same identifier
/// yield exactly one `inserted == true`.
#[async_trait]
pub trait DuplicateRegistry: Send + Sync {
    async fn find(&self, id: &ExtractedIdentifier) -> Result<Option<RegistryRecord>, RegistryError>;

    async fn upsert(&self, id: &ExtractedIdentifier) -> Result<Registration, RegistryError>;
}

/// Process-local registry used for tests and when no database is configured.
#[derive(Default)]
pub struct MemoryRegistry {
    records: Mutex<HashMap<String, RegistryRecord>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with numbers registered by an earlier run.
    pub fn with_numbers<I, S>(numbers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let registry = Self::new();
        {
            let mut records = registry.lock();
            for number in numbers {
                let number = number.into();
                records.insert(number.clone(), new_record(number));
            }
        }
        registry
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RegistryRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn new_record(consumer_number: String) -> RegistryRecord {
    let now = Utc::now();
    RegistryRecord {
        id: Uuid::new_v4(),
        consumer_number,
        status: "pending".to_string(),
        remark: String::new(),
        created_at: now,
        updated_at: now,
    }
}

#[async_trait]
impl DuplicateRegistry for MemoryRegistry {
    async fn find(&self, id: &ExtractedIdentifier) -> Result<Option<RegistryRecord>, RegistryError> {
        Ok(self.lock().get(id.as_str()).cloned())
    }

    async fn upsert(&self, id: &ExtractedIdentifier) -> Result<Registration, RegistryError> {
        let mut records = self.lock();
        if let Some(existing) = records.get(id.as_str()) {
            return Ok(Registration {
                record: existing.clone(),
                inserted: false,
            });
        }
        let record = new_record(id.as_str().to_string());
        records.insert(record.consumer_number.clone(), record.clone());
        Ok(Registration {
            record,
            inserted: true,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Registry database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Registry unavailable: {0}")]
    Unavailable(String),
}

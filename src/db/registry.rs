use async_trait::async_trait;
use sqlx::PgPool;

use crate::models::bill::ExtractedIdentifier;
use crate::models::registry::{Registration, RegistryRecord};
use crate::services::registry::{DuplicateRegistry, RegistryError};

/// Duplicate registry backed by the `consumer_numbers` table.
///
/// Atomicity of check-and-insert comes from the unique index:
/// `ON CONFLICT DO NOTHING` lets exactly one concurrent insert win.
#[derive(Clone)]
pub struct PgRegistry {
    pool: PgPool,
}

impl PgRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Numbers registered so far, newest first.
    pub async fn list_numbers(&self) -> Result<Vec<String>, RegistryError> {
        let numbers: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT consumer_number
            FROM consumer_numbers
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(numbers.into_iter().map(|(n,)| n).collect())
    }
}

#[async_trait]
impl DuplicateRegistry for PgRegistry {
    async fn find(&self, id: &ExtractedIdentifier) -> Result<Option<RegistryRecord>, RegistryError> {
        let record = sqlx::query_as::<_, RegistryRecord>(
            r#"
            SELECT id, consumer_number, status, remark, created_at, updated_at
            FROM consumer_numbers
            WHERE consumer_number = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn upsert(&self, id: &ExtractedIdentifier) -> Result<Registration, RegistryError> {
        let inserted = sqlx::query_as::<_, RegistryRecord>(
            r#"
            INSERT INTO consumer_numbers (consumer_number)
            VALUES ($1)
            ON CONFLICT (consumer_number) DO NOTHING
            RETURNING id, consumer_number, status, remark, created_at, updated_at
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(record) = inserted {
            return Ok(Registration {
                record,
                inserted: true,
            });
        }

        // Lost the race (or registered earlier): the winning row is committed by now.
        match self.find(id).await? {
            Some(record) => Ok(Registration {
                record,
                inserted: false,
            }),
            None => Err(RegistryError::Unavailable(format!(
                "consumer number {id} conflicted on insert but is not readable"
            ))),
        }
    }
}

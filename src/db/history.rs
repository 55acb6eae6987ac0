use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::report::BatchReport;

/// One duplicate within a batch, as stored in `extraction_history.duplicates`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateNote {
    pub filename: String,
    pub consumer_number: String,
}

/// One failure within a batch, as stored in `extraction_history.failures`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureNote {
    pub filename: String,
    pub reason: String,
}

/// Summary row for one batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionHistory {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub total_images: i32,
    pub success_count: i32,
    pub duplicate_count: i32,
    pub failed_count: i32,
    pub pending_count: i32,
    pub first_attempt_success_count: i32,
    pub retry_success_count: i32,
    pub stopped_due_to_quota: bool,
    pub duplicates: Vec<DuplicateNote>,
    pub failures: Vec<FailureNote>,
}

pub fn duplicate_notes(report: &BatchReport) -> Vec<DuplicateNote> {
    report
        .duplicates()
        .map(|s| DuplicateNote {
            filename: s.original.clone(),
            consumer_number: s.consumer_number.clone(),
        })
        .collect()
}

pub fn failure_notes(report: &BatchReport) -> Vec<FailureNote> {
    report
        .failed
        .iter()
        .map(|f| FailureNote {
            filename: f.original.clone(),
            reason: f.reason.clone(),
        })
        .collect()
}

fn count(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

/// Record the outcome of a batch run.
pub async fn record_batch(pool: &PgPool, report: &BatchReport) -> Result<Uuid, sqlx::Error> {
    let duplicates = serde_json::to_value(duplicate_notes(report))
        .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
    let failures = serde_json::to_value(failure_notes(report))
        .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
    let stats = &report.stats;

    let row = sqlx::query(
        r#"
        INSERT INTO extraction_history (
            batch_id, total_images, success_count, duplicate_count, failed_count,
            pending_count, first_attempt_success_count, retry_success_count,
            stopped_due_to_quota, duplicates, failures
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        RETURNING id
        "#,
    )
    .bind(report.batch_id)
    .bind(count(stats.total))
    .bind(count(stats.success))
    .bind(count(stats.duplicate))
    .bind(count(stats.failed))
    .bind(count(stats.pending))
    .bind(count(stats.first_attempt_success))
    .bind(count(stats.retry_success))
    .bind(stats.stopped_due_to_quota)
    .bind(duplicates)
    .bind(failures)
    .fetch_one(pool)
    .await?;

    Ok(row.try_get("id")?)
}

/// Most recent batch summaries, newest first.
pub async fn recent(pool: &PgPool, limit: i64) -> Result<Vec<ExtractionHistory>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT id, batch_id, recorded_at, total_images, success_count, duplicate_count,
               failed_count, pending_count, first_attempt_success_count, retry_success_count,
               stopped_due_to_quota, duplicates, failures
        FROM extraction_history
        ORDER BY recorded_at DESC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|r| {
            let duplicates: serde_json::Value = r.try_get("duplicates")?;
            let failures: serde_json::Value = r.try_get("failures")?;
            Ok(ExtractionHistory {
                id: r.try_get("id")?,
                batch_id: r.try_get("batch_id")?,
                recorded_at: r.try_get("recorded_at")?,
                total_images: r.try_get("total_images")?,
                success_count: r.try_get("success_count")?,
                duplicate_count: r.try_get("duplicate_count")?,
                failed_count: r.try_get("failed_count")?,
                pending_count: r.try_get("pending_count")?,
                first_attempt_success_count: r.try_get("first_attempt_success_count")?,
                retry_success_count: r.try_get("retry_success_count")?,
                stopped_due_to_quota: r.try_get("stopped_due_to_quota")?,
                duplicates: serde_json::from_value(duplicates)
                    .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
                failures: serde_json::from_value(failures)
                    .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            })
        })
        .collect()
}

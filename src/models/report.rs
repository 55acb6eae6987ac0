use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An image whose bill number was extracted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SuccessEntry {
    pub original: String,
    pub consumer_number: String,
    /// Key of the stored copy in the success location.
    pub stored_as: Option<String>,
    /// The number was already present in the registry.
    pub duplicate: bool,
    pub attempts: u32,
    pub model: String,
    pub credential: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FailedEntry {
    pub original: String,
    pub reason: String,
    pub stored_as: Option<String>,
    pub attempts: u32,
}

/// An image left for a later run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingEntry {
    pub original: String,
    pub reason: String,
    pub stored_as: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchStats {
    pub total: usize,
    pub success: usize,
    pub duplicate: usize,
    pub failed: usize,
    pub pending: usize,
    pub first_attempt_success: usize,
    pub retry_success: usize,
    pub stopped_due_to_quota: bool,
}

/// Terminal artifact of one batch run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub success: Vec<SuccessEntry>,
    pub failed: Vec<FailedEntry>,
    pub pending: Vec<PendingEntry>,
    pub stats: BatchStats,
}

impl BatchReport {
    pub fn duplicates(&self) -> impl Iterator<Item = &SuccessEntry> {
        self.success.iter().filter(|s| s.duplicate)
    }
}

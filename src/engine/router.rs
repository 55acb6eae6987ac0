use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use super::attempt::Provenance;
use super::retry::JobOutcome;
use crate::models::bill::ExtractedIdentifier;
use crate::models::job::{Job, JobStatus};
use crate::services::registry::DuplicateRegistry;
use crate::services::storage::{ImageStore, Location, StorageError};

const REASON_TAG_CHARS: usize = 40;

/// Where a job ended up once routed.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Success {
        identifier: ExtractedIdentifier,
        provenance: Provenance,
        duplicate: bool,
        stored_as: Option<String>,
    },
    Failed {
        reason: String,
        stored_as: Option<String>,
        attempts: u32,
    },
    Pending {
        reason: String,
        stored_as: Option<String>,
    },
}

/// A routed job, ready for aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    pub index: usize,
    pub name: String,
    pub disposition: Disposition,
}

impl JobResult {
    pub fn status(&self) -> JobStatus {
        match self.disposition {
            Disposition::Success { .. } => JobStatus::Success,
            Disposition::Failed { .. } => JobStatus::Failed,
            Disposition::Pending { .. } => JobStatus::Pending,
        }
    }
}

/// Short file-name-safe tag from the leading classification of a reason
/// (`"transient: ..."` → `transient`).
pub fn reason_tag(reason: &str) -> String {
    let head = reason.split(':').next().unwrap_or(reason);
    let mut tag = String::new();
    for c in head.trim().chars() {
        let c = if c.is_ascii_alphanumeric() {
            c.to_ascii_lowercase()
        } else {
            '_'
        };
        if c == '_' && (tag.is_empty() || tag.ends_with('_')) {
            continue;
        }
        tag.push(c);
        if tag.len() >= REASON_TAG_CHARS {
            break;
        }
    }
    let tag = tag.trim_end_matches('_');
    if tag.is_empty() {
        "failed".to_string()
    } else {
        tag.to_string()
    }
}

fn timestamp() -> String {
    Utc::now().format("%Y%m%dT%H%M%S%3f").to_string()
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

pub fn success_name(identifier: &ExtractedIdentifier, job: &Job) -> String {
    format!(
        "{}_{}_{}.{}",
        identifier,
        timestamp(),
        short_id(),
        job.extension()
    )
}

pub fn failed_name(reason: &str, job: &Job) -> String {
    format!(
        "{}_{}_{}_{}.{}",
        reason_tag(reason),
        job.stem(),
        timestamp(),
        short_id(),
        job.extension()
    )
}

/// Stable across runs so re-parking a file replaces its earlier copy.
pub fn pending_name(job: &Job) -> String {
    job.stored_name.clone()
}

/// Persists each job's bytes to exactly one location and consults the
/// duplicate registry for successes.
pub struct OutcomeRouter {
    store: Arc<dyn ImageStore>,
    registry: Arc<dyn DuplicateRegistry>,
}

impl OutcomeRouter {
    pub fn new(store: Arc<dyn ImageStore>, registry: Arc<dyn DuplicateRegistry>) -> Self {
        Self { store, registry }
    }

    pub async fn route(&self, job: &Job, outcome: JobOutcome) -> JobResult {
        match outcome {
            JobOutcome::Extracted {
                identifier,
                provenance,
                ..
            } => self.route_success(job, identifier, provenance).await,
            JobOutcome::Failed { reason, attempts } => {
                self.reject(job, &reason, attempts.len() as u32).await
            }
            JobOutcome::Pending { reason, .. } => self.park(job, &reason).await,
        }
    }

    async fn route_success(
        &self,
        job: &Job,
        identifier: ExtractedIdentifier,
        provenance: Provenance,
    ) -> JobResult {
        let name = success_name(&identifier, job);
        let key = match self.store_bytes(Location::Success, &name, job).await {
            Ok(key) => key,
            Err(e) => {
                tracing::error!(job = %job.name, error = %e, "Failed to store extracted image");
                return self.park(job, &format!("storage_error: {e}")).await;
            }
        };

        let registration = match self.registry.upsert(&identifier).await {
            Ok(registration) => registration,
            Err(e) => {
                tracing::error!(job = %job.name, consumer_number = %identifier, error = %e, "Duplicate registry unavailable");
                if let Err(delete_err) = self.store.delete(Location::Success, &name).await {
                    tracing::warn!(job = %job.name, file = %name, error = %delete_err, "Failed to withdraw unregistered success copy");
                }
                return self
                    .park(job, &format!("registry_unavailable: {e}"))
                    .await;
            }
        };

        let duplicate = !registration.inserted;
        if duplicate {
            metrics::counter!("bill_extract_duplicates_total").increment(1);
            tracing::info!(job = %job.name, consumer_number = %identifier, "Consumer number already registered");
        }

        self.finish(JobResult {
            index: job.index,
            name: job.name.clone(),
            disposition: Disposition::Success {
                identifier,
                provenance,
                duplicate,
                stored_as: Some(key),
            },
        })
    }

    /// Route to the failed location.
    pub async fn reject(&self, job: &Job, reason: &str, attempts: u32) -> JobResult {
        match self
            .store_bytes(Location::Failed, &failed_name(reason, job), job)
            .await
        {
            Ok(key) => self.finish(JobResult {
                index: job.index,
                name: job.name.clone(),
                disposition: Disposition::Failed {
                    reason: reason.to_string(),
                    stored_as: Some(key),
                    attempts,
                },
            }),
            Err(e) => {
                tracing::error!(job = %job.name, error = %e, "Failed to store failed image");
                self.park(job, &format!("{reason}; storage_error: {e}")).await
            }
        }
    }

    /// Route to the pending location for a later run.
    pub async fn park(&self, job: &Job, reason: &str) -> JobResult {
        let disposition = match self
            .store_bytes(Location::Pending, &pending_name(job), job)
            .await
        {
            Ok(key) => Disposition::Pending {
                reason: reason.to_string(),
                stored_as: Some(key),
            },
            Err(e) => {
                tracing::error!(job = %job.name, error = %e, "Failed to store pending image, bytes not persisted");
                Disposition::Failed {
                    reason: format!("{reason}; storage_error: {e}"),
                    stored_as: None,
                    attempts: 0,
                }
            }
        };

        self.finish(JobResult {
            index: job.index,
            name: job.name.clone(),
            disposition,
        })
    }

    async fn store_bytes(&self, location: Location, name: &str, job: &Job) -> Result<String, StorageError> {
        let content_type = job
            .mime
            .map(|m| m.to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());
        self.store.put(location, name, &job.bytes, &content_type).await
    }

    fn finish(&self, result: JobResult) -> JobResult {
        let status = result.status();
        metrics::counter!("bill_extract_jobs_total", "status" => status.as_ref().to_string())
            .increment(1);
        tracing::info!(job = %result.name, status = %status, "Job routed");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::models::bill::IdentifierFormat;
    use crate::models::job::JobInput;
    use crate::models::registry::{Registration, RegistryRecord};
    use crate::services::registry::{MemoryRegistry, RegistryError};
    use crate::services::storage::MemoryStore;

    struct BrokenRegistry;

    /// Accepts pending and failed copies, refuses success copies.
    #[derive(Default)]
    struct NoSuccessStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl ImageStore for NoSuccessStore {
        async fn put(
            &self,
            location: Location,
            name: &str,
            data: &[u8],
            content_type: &str,
        ) -> Result<String, StorageError> {
            if location == Location::Success {
                return Err(StorageError::Config("success bucket read-only".into()));
            }
            self.inner.put(location, name, data, content_type).await
        }

        async fn get(&self, location: Location, name: &str) -> Result<Vec<u8>, StorageError> {
            self.inner.get(location, name).await
        }

        async fn list(&self, location: Location) -> Result<Vec<String>, StorageError> {
            self.inner.list(location).await
        }

        async fn delete(&self, location: Location, name: &str) -> Result<(), StorageError> {
            self.inner.delete(location, name).await
        }
    }

    #[async_trait]
    impl DuplicateRegistry for BrokenRegistry {
        async fn find(&self, _: &ExtractedIdentifier) -> Result<Option<RegistryRecord>, RegistryError> {
            Err(RegistryError::Unavailable("down".into()))
        }

        async fn upsert(&self, _: &ExtractedIdentifier) -> Result<Registration, RegistryError> {
            Err(RegistryError::Unavailable("down".into()))
        }
    }

    fn job(index: usize, name: &str) -> Job {
        Job::from_input(
            index,
            name.into(),
            JobInput::new(name, b"img".to_vec(), Some("image/png".into())),
        )
    }

    fn extracted(number: &str) -> JobOutcome {
        JobOutcome::Extracted {
            identifier: ExtractedIdentifier::parse(number, &IdentifierFormat::default()).unwrap(),
            provenance: Provenance {
                model: "m".into(),
                credential: "key-1".into(),
                attempt: 1,
            },
            attempts: vec![],
        }
    }

    #[test]
    fn test_reason_tag() {
        assert_eq!(reason_tag("transient: Recognition API returned 503"), "transient");
        assert_eq!(reason_tag("Invalid Value!!: x"), "invalid_value");
        assert_eq!(reason_tag(":::"), "failed");
        assert!(reason_tag(&"x".repeat(100)).len() <= REASON_TAG_CHARS);
    }

    #[test]
    fn test_names() {
        let id = ExtractedIdentifier::parse("110013196591", &IdentifierFormat::default()).unwrap();
        let j = job(0, "scan 7.png");
        assert!(success_name(&id, &j).starts_with("110013196591_"));
        assert!(success_name(&id, &j).ends_with(".png"));
        assert_ne!(success_name(&id, &j), success_name(&id, &j));
        assert!(failed_name("not_found: x", &j).starts_with("not_found_scan_7_"));
        assert_ne!(failed_name("not_found: x", &j), failed_name("not_found: x", &j));
        assert_eq!(pending_name(&j), "scan_7.png");
        assert_eq!(pending_name(&job(0, "scan")), "scan.png");
    }

    #[tokio::test]
    async fn test_duplicate_flagged_but_successful() {
        let store = Arc::new(MemoryStore::new());
        let router = OutcomeRouter::new(store.clone(), Arc::new(MemoryRegistry::new()));

        let first = router.route(&job(0, "a.png"), extracted("110013196591")).await;
        let second = router.route(&job(1, "b.png"), extracted("110013196591")).await;

        assert!(matches!(first.disposition, Disposition::Success { duplicate: false, .. }));
        assert!(matches!(second.disposition, Disposition::Success { duplicate: true, .. }));
        assert_eq!(store.count(Location::Success), 2);
    }

    #[tokio::test]
    async fn test_failed_and_pending_locations() {
        let store = Arc::new(MemoryStore::new());
        let router = OutcomeRouter::new(store.clone(), Arc::new(MemoryRegistry::new()));

        let failed = router
            .route(
                &job(0, "a.png"),
                JobOutcome::Failed {
                    reason: "transient: 503".into(),
                    attempts: vec![],
                },
            )
            .await;
        let pending = router.park(&job(1, "b.png"), "batch stopped").await;

        assert_eq!(failed.status(), JobStatus::Failed);
        assert_eq!(pending.status(), JobStatus::Pending);
        assert_eq!(store.count(Location::Failed), 1);
        assert!(store.names(Location::Failed)[0].starts_with("transient_a_"));
        assert_eq!(store.names(Location::Pending), vec!["b.png"]);
        assert_eq!(store.count(Location::Success), 0);
    }

    #[tokio::test]
    async fn test_registry_outage_parks_job() {
        let store = Arc::new(MemoryStore::new());
        let router = OutcomeRouter::new(store.clone(), Arc::new(BrokenRegistry));

        let result = router.route(&job(0, "a.png"), extracted("110013196591")).await;

        match result.disposition {
            Disposition::Pending { reason, .. } => assert!(reason.starts_with("registry_unavailable")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(store.count(Location::Pending), 1);
        assert_eq!(store.count(Location::Success), 0);
    }

    #[tokio::test]
    async fn test_unstored_success_is_not_registered() {
        let store = Arc::new(NoSuccessStore::default());
        let registry = Arc::new(MemoryRegistry::new());
        let router = OutcomeRouter::new(store.clone(), registry.clone());

        let result = router.route(&job(0, "a.png"), extracted("110013196591")).await;

        match result.disposition {
            Disposition::Pending { reason, .. } => assert!(reason.starts_with("storage_error")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(registry.len(), 0);
        assert_eq!(store.inner.count(Location::Pending), 1);
    }
}

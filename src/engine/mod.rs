pub mod aggregate;
pub mod attempt;
pub mod pacing;
pub mod plan;
pub mod retry;
pub mod router;
pub mod scheduler;

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::bill::IdentifierFormat;
use crate::models::job::{unique_names, unique_names_avoiding, ImageMime, Job, JobInput};
use crate::models::report::BatchReport;
use crate::services::recognition::{Credential, Recognizer};
use crate::services::registry::DuplicateRegistry;
use crate::services::storage::{ImageStore, Location, StorageError};

use attempt::AttemptExecutor;
use pacing::{Pacer, PacingPolicy};
use retry::{BackoffPolicy, CredentialPool, NotFoundPolicy, RetryPlanner};
use router::{JobResult, OutcomeRouter};
use scheduler::{Pipeline, Processed, WorkerPool};

/// Tunables for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Model identifiers, most preferred first.
    pub model_tiers: Vec<String>,
    /// Rounds per tier.
    pub max_retries: u32,
    pub concurrency: usize,
    pub pacing: PacingPolicy,
    pub backoff: BackoffPolicy,
    pub format: IdentifierFormat,
    pub not_found_policy: NotFoundPolicy,
}

/// Resolves and routes a single job inside the worker pool.
struct ExtractionPipeline {
    planner: RetryPlanner,
    router: OutcomeRouter,
}

#[async_trait]
impl Pipeline for ExtractionPipeline {
    async fn process(&self, job: Arc<Job>) -> Processed {
        if job.mime.is_none() {
            tracing::warn!(job = %job.name, "Unsupported image type, skipping recognition");
            let result = self
                .router
                .reject(&job, "unsupported_media_type: not a PNG, JPEG or WebP image", 0)
                .await;
            return Processed {
                result,
                halt: false,
            };
        }

        let outcome = self.planner.resolve(&job).await;
        let halt = outcome.is_batch_fatal();
        let result = self.router.route(&job, outcome).await;
        Processed { result, halt }
    }

    async fn park(&self, job: Arc<Job>, reason: String) -> JobResult {
        self.router.park(&job, &reason).await
    }

    async fn abandon(&self, job: Arc<Job>, reason: String) -> JobResult {
        self.router.reject(&job, &reason, 0).await
    }
}

/// Entry point for running batches against one set of collaborators.
///
/// The pacer lives as long as the engine so consecutive batches share one
/// rate-limit clock; credential quota state is reset per batch.
pub struct BatchEngine {
    settings: EngineSettings,
    recognizer: Arc<dyn Recognizer>,
    credentials: Vec<Credential>,
    registry: Arc<dyn DuplicateRegistry>,
    store: Arc<dyn ImageStore>,
    pacer: Arc<Pacer>,
}

impl BatchEngine {
    pub fn new(
        settings: EngineSettings,
        recognizer: Arc<dyn Recognizer>,
        credentials: Vec<Credential>,
        registry: Arc<dyn DuplicateRegistry>,
        store: Arc<dyn ImageStore>,
    ) -> Result<Self, EngineError> {
        if credentials.is_empty() {
            return Err(EngineError::Config("at least one API key is required".into()));
        }
        if settings.model_tiers.is_empty() {
            return Err(EngineError::Config("at least one model tier is required".into()));
        }
        if settings.max_retries == 0 {
            return Err(EngineError::Config("max_retries must be at least 1".into()));
        }

        let pacer = Arc::new(Pacer::new(settings.pacing));
        Ok(Self {
            settings,
            recognizer,
            credentials,
            registry,
            store,
            pacer,
        })
    }

    /// Process every input to exactly one of success, failed or pending.
    ///
    /// Stored names already present in the pending location are not reused,
    /// so a new image never replaces an older pending copy.
    pub async fn run_batch(&self, inputs: Vec<JobInput>) -> BatchReport {
        let reserved = match self.store.list(Location::Pending).await {
            Ok(names) => names.into_iter().collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Could not list pending images");
                HashSet::new()
            }
        };
        self.execute(inputs, &reserved).await
    }

    async fn execute(&self, inputs: Vec<JobInput>, reserved: &HashSet<String>) -> BatchReport {
        let batch_id = Uuid::new_v4();
        let names = unique_names(inputs.iter().map(|input| input.name.as_str()));
        let mut jobs: Vec<Job> = inputs
            .into_iter()
            .zip(names)
            .enumerate()
            .map(|(index, (input, name))| Job::from_input(index, name, input))
            .collect();

        // Distinct originals can sanitize to the same stored name.
        let stored = unique_names_avoiding(jobs.iter().map(|job| job.stored_name.as_str()), reserved);
        for (job, name) in jobs.iter_mut().zip(stored) {
            job.stored_name = name;
        }

        tracing::info!(
            batch_id = %batch_id,
            total = jobs.len(),
            concurrency = self.settings.concurrency,
            tiers = ?self.settings.model_tiers,
            credentials = self.credentials.len(),
            "Starting extraction batch"
        );

        let planner = RetryPlanner::new(
            AttemptExecutor::new(self.recognizer.clone(), self.settings.format),
            self.pacer.clone(),
            Arc::new(CredentialPool::new(self.credentials.clone())),
            self.settings.model_tiers.clone(),
            self.settings.max_retries,
            self.settings.backoff,
            self.settings.not_found_policy,
        );
        let pipeline = Arc::new(ExtractionPipeline {
            planner,
            router: OutcomeRouter::new(self.store.clone(), self.registry.clone()),
        });

        let run = WorkerPool::new(self.settings.concurrency)
            .run(jobs, pipeline)
            .await;
        let report = aggregate::finalize(batch_id, run.results, run.halted);

        let stats = &report.stats;
        if stats.stopped_due_to_quota {
            tracing::warn!(
                batch_id = %batch_id,
                pending = stats.pending,
                "Batch stopped early: API quota exhausted on every key"
            );
        }
        tracing::info!(
            batch_id = %batch_id,
            total = stats.total,
            success = stats.success,
            duplicate = stats.duplicate,
            failed = stats.failed,
            pending = stats.pending,
            first_attempt_success = stats.first_attempt_success,
            retry_success = stats.retry_success,
            "Batch finished"
        );

        report
    }

    /// Run a batch over everything in the pending location. Sources of jobs
    /// that were stored as success or failed are removed; jobs that are
    /// pending again were rewritten in place.
    pub async fn resubmit_pending(&self) -> Result<BatchReport, EngineError> {
        let names = self.store.list(Location::Pending).await?;
        let mut inputs = Vec::with_capacity(names.len());
        for name in names {
            match self.store.get(Location::Pending, &name).await {
                Ok(bytes) => {
                    let mime = std::path::Path::new(&name)
                        .extension()
                        .and_then(|e| e.to_str())
                        .and_then(ImageMime::from_extension)
                        .map(|m| m.to_string());
                    inputs.push(JobInput::new(name, bytes, mime));
                }
                Err(e) => {
                    tracing::warn!(file = %name, error = %e, "Skipping unreadable pending image");
                }
            }
        }

        tracing::info!(count = inputs.len(), "Resubmitting pending images");
        let report = self.execute(inputs, &HashSet::new()).await;

        let resolved = report
            .success
            .iter()
            .map(|s| s.original.as_str())
            .chain(
                report
                    .failed
                    .iter()
                    .filter(|f| f.stored_as.is_some())
                    .map(|f| f.original.as_str()),
            );
        for name in resolved {
            if let Err(e) = self.store.delete(Location::Pending, name).await {
                tracing::warn!(file = %name, error = %e, "Failed to remove resolved pending image");
            }
        }

        Ok(report)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid engine configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

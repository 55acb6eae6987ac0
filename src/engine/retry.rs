use rand::Rng;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::attempt::{AttemptExecutor, AttemptOutcome, AttemptRecord, Provenance, RetryableKind};
use super::pacing::Pacer;
use super::plan::AttemptPlan;
use crate::models::bill::ExtractedIdentifier;
use crate::models::job::Job;
use crate::services::recognition::Credential;

/// Upper bound for a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(600);

/// How an explicit "no bill number visible" reply is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotFoundPolicy {
    /// Same as an invalid value: retried within the round budget.
    #[default]
    Retry,
    /// Fail the job immediately.
    Fail,
}

/// `base * multiplier^(round-1) + uniform(0..jitter)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub jitter: Duration,
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            base: Duration::ZERO,
            multiplier: 1.0,
            jitter: Duration::ZERO,
        }
    }

    /// Delay after `round` without jitter.
    pub fn base_delay(&self, round: u32) -> Duration {
        let exponent = i32::try_from(round.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base.as_secs_f64() * self.multiplier.max(0.0).powi(exponent);
        if secs.is_finite() {
            Duration::from_secs_f64(secs.min(MAX_BACKOFF.as_secs_f64()))
        } else {
            MAX_BACKOFF
        }
    }

    pub fn delay(&self, round: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
        };
        self.base_delay(round) + jitter
    }
}

/// API keys shared by every pipeline of a batch.
///
/// Hands out rotation offsets round-robin so concurrent jobs start on
/// different keys, and remembers keys whose account quota is exhausted.
pub struct CredentialPool {
    credentials: Vec<Credential>,
    cursor: AtomicUsize,
    exhausted: Vec<AtomicBool>,
}

impl CredentialPool {
    pub fn new(credentials: Vec<Credential>) -> Self {
        let exhausted = credentials.iter().map(|_| AtomicBool::new(false)).collect();
        Self {
            credentials,
            cursor: AtomicUsize::new(0),
            exhausted,
        }
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    pub fn get(&self, index: usize) -> &Credential {
        &self.credentials[index]
    }

    pub fn next_offset(&self) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns `true` if this call flipped the key to exhausted.
    pub fn mark_exhausted(&self, index: usize) -> bool {
        !self.exhausted[index].swap(true, Ordering::SeqCst)
    }

    pub fn is_exhausted(&self, index: usize) -> bool {
        self.exhausted[index].load(Ordering::SeqCst)
    }

    pub fn all_exhausted(&self) -> bool {
        self.exhausted.iter().all(|e| e.load(Ordering::SeqCst))
    }
}

/// Terminal result of resolving one job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Extracted {
        identifier: ExtractedIdentifier,
        provenance: Provenance,
        attempts: Vec<AttemptRecord>,
    },
    Failed {
        reason: String,
        attempts: Vec<AttemptRecord>,
    },
    /// Stopped because no credential has quota left. Raises the batch-level
    /// fatal condition.
    Pending {
        reason: String,
        attempts: Vec<AttemptRecord>,
    },
}

impl JobOutcome {
    pub fn is_batch_fatal(&self) -> bool {
        matches!(self, JobOutcome::Pending { .. })
    }
}

/// Drives the attempt executor over the tier/credential matrix for a job.
pub struct RetryPlanner {
    executor: AttemptExecutor,
    pacer: Arc<Pacer>,
    credentials: Arc<CredentialPool>,
    tiers: Vec<String>,
    max_retries: u32,
    backoff: BackoffPolicy,
    not_found: NotFoundPolicy,
}

impl RetryPlanner {
    pub fn new(
        executor: AttemptExecutor,
        pacer: Arc<Pacer>,
        credentials: Arc<CredentialPool>,
        tiers: Vec<String>,
        max_retries: u32,
        backoff: BackoffPolicy,
        not_found: NotFoundPolicy,
    ) -> Self {
        Self {
            executor,
            pacer,
            credentials,
            tiers,
            max_retries,
            backoff,
            not_found,
        }
    }

    pub fn credentials(&self) -> &CredentialPool {
        &self.credentials
    }

    /// Upper bound on recognition calls for one job.
    pub fn max_calls(&self) -> usize {
        self.tiers.len() * self.max_retries as usize * self.credentials.len()
    }

    fn tier_usable(&self, tier: usize, dead: &HashSet<(usize, usize)>) -> bool {
        (0..self.credentials.len())
            .any(|c| !dead.contains(&(tier, c)) && !self.credentials.is_exhausted(c))
    }

    pub async fn resolve(&self, job: &Job) -> JobOutcome {
        let mut plan = AttemptPlan::new(
            self.tiers.len(),
            self.max_retries,
            self.credentials.len(),
            self.credentials.next_offset(),
        );
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut dead: HashSet<(usize, usize)> = HashSet::new();
        let mut last_reason: Option<String> = None;
        let mut current: Option<(usize, u32)> = None;
        let mut ordinal: u32 = 0;

        while let Some(step) = plan.next() {
            if current != Some((step.tier, step.round)) {
                if self.credentials.all_exhausted() {
                    return quota_pending(job, attempts, last_reason);
                }
                if !self.tier_usable(step.tier, &dead) {
                    tracing::debug!(job = %job.name, tier = %self.tiers[step.tier], "No usable credential left in tier");
                    plan.end_tier();
                    current = None;
                    continue;
                }
                if let Some((tier, round)) = current {
                    if tier == step.tier {
                        let delay = self.backoff.delay(round);
                        tracing::info!(
                            job = %job.name,
                            model = %self.tiers[tier],
                            round,
                            delay_ms = delay.as_millis() as u64,
                            "Round failed, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
                current = Some((step.tier, step.round));
            }

            if dead.contains(&(step.tier, step.credential))
                || self.credentials.is_exhausted(step.credential)
            {
                continue;
            }

            let credential = self.credentials.get(step.credential);
            let model = self.tiers[step.tier].as_str();

            self.pacer.reserve_slot(credential.id()).await;
            ordinal += 1;
            let outcome = self.executor.attempt(job, model, credential, ordinal).await;
            attempts.push(AttemptRecord::new(ordinal, model, credential, &outcome));
            let reason = outcome.reason();

            match outcome {
                AttemptOutcome::Success {
                    identifier,
                    provenance,
                } => {
                    tracing::info!(
                        job = %job.name,
                        model,
                        credential = credential.id(),
                        attempt = ordinal,
                        "Extracted consumer number"
                    );
                    return JobOutcome::Extracted {
                        identifier,
                        provenance,
                        attempts,
                    };
                }
                AttemptOutcome::Retryable {
                    kind: RetryableKind::Transient,
                    ..
                } => {
                    tracing::warn!(
                        job = %job.name,
                        model,
                        credential = credential.id(),
                        attempt = ordinal,
                        reason = reason.as_deref().unwrap_or_default(),
                        "Transient error, rotating credential"
                    );
                }
                AttemptOutcome::Retryable {
                    kind: RetryableKind::NotFound,
                    ..
                } if self.not_found == NotFoundPolicy::Fail => {
                    return JobOutcome::Failed {
                        reason: reason.unwrap_or_else(|| "not_found".to_string()),
                        attempts,
                    };
                }
                AttemptOutcome::Retryable { .. } => {
                    tracing::warn!(
                        job = %job.name,
                        model,
                        credential = credential.id(),
                        attempt = ordinal,
                        reason = reason.as_deref().unwrap_or_default(),
                        "Unusable output, ending round"
                    );
                    plan.end_round();
                }
                AttemptOutcome::Permanent { .. } => {
                    tracing::warn!(
                        job = %job.name,
                        model,
                        credential = credential.id(),
                        reason = reason.as_deref().unwrap_or_default(),
                        "Permanent error, dropping credential for this tier"
                    );
                    dead.insert((step.tier, step.credential));
                }
                AttemptOutcome::FatalBatch { .. } => {
                    if self.credentials.mark_exhausted(step.credential) {
                        tracing::error!(
                            credential = credential.id(),
                            reason = reason.as_deref().unwrap_or_default(),
                            "Credential quota exhausted"
                        );
                    }
                }
            }

            if reason.is_some() {
                last_reason = reason;
            }
        }

        if self.credentials.all_exhausted() {
            return quota_pending(job, attempts, last_reason);
        }

        let reason = match last_reason {
            Some(reason) => format!("{reason} (retries exhausted after {ordinal} attempts)"),
            None => "no_attempt: no usable model and credential".to_string(),
        };
        tracing::warn!(job = %job.name, attempts = ordinal, reason = %reason, "Extraction failed");
        JobOutcome::Failed { reason, attempts }
    }
}

fn quota_pending(job: &Job, attempts: Vec<AttemptRecord>, last: Option<String>) -> JobOutcome {
    tracing::warn!(job = %job.name, "Every credential is out of quota, parking job");
    let reason = match last {
        Some(last) => format!("quota exhausted on every credential ({last})"),
        None => "quota exhausted on every credential".to_string(),
    };
    JobOutcome::Pending { reason, attempts }
}

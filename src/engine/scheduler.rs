use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use super::router::JobResult;
use crate::models::job::Job;

/// Reason attached to jobs that never started because the batch halted.
pub const HALTED_REASON: &str = "batch_halted: every credential is out of quota";

/// What one admitted job produced.
#[derive(Debug)]
pub struct Processed {
    pub result: JobResult,
    /// The job hit a batch-fatal condition; admit nothing further.
    pub halt: bool,
}

/// Per-job work run by the pool.
#[async_trait]
pub trait Pipeline: Send + Sync + 'static {
    async fn process(&self, job: Arc<Job>) -> Processed;

    /// Route a job that will not run in this batch.
    async fn park(&self, job: Arc<Job>, reason: String) -> JobResult;

    /// Route a job whose pipeline task died.
    async fn abandon(&self, job: Arc<Job>, reason: String) -> JobResult;
}

#[derive(Debug)]
pub struct PoolRun {
    /// One result per submitted job, in completion order.
    pub results: Vec<JobResult>,
    pub halted: bool,
}

/// Runs job pipelines with at most `concurrency` in flight.
pub struct WorkerPool {
    concurrency: usize,
}

impl WorkerPool {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub async fn run<P: Pipeline>(&self, jobs: Vec<Job>, pipeline: Arc<P>) -> PoolRun {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let halted = Arc::new(AtomicBool::new(false));
        let mut running: Vec<(Arc<Job>, JoinHandle<JobResult>)> = Vec::with_capacity(jobs.len());
        let mut results = Vec::with_capacity(jobs.len());
        let mut queue = jobs.into_iter().map(Arc::new);

        while let Some(job) = queue.next() {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    results.push(pipeline.park(job, HALTED_REASON.to_string()).await);
                    continue;
                }
            };

            if halted.load(Ordering::SeqCst) {
                drop(permit);
                let skipped = 1 + queue.len();
                tracing::warn!(skipped, "Batch halted, parking jobs that have not started");
                results.push(pipeline.park(job, HALTED_REASON.to_string()).await);
                for job in queue.by_ref() {
                    results.push(pipeline.park(job, HALTED_REASON.to_string()).await);
                }
                break;
            }

            let handle = tokio::spawn({
                let pipeline = pipeline.clone();
                let halted = halted.clone();
                let job = job.clone();
                async move {
                    let processed = pipeline.process(job).await;
                    if processed.halt {
                        halted.store(true, Ordering::SeqCst);
                    }
                    drop(permit);
                    processed.result
                }
            });
            running.push((job, handle));
        }

        for (job, handle) in running {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!(job = %job.name, error = %e, "Job pipeline crashed");
                    let reason = format!("pipeline_crashed: {e}");
                    results.push(pipeline.abandon(job, reason).await);
                }
            }
        }

        PoolRun {
            results,
            halted: halted.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::Instant;

    use crate::engine::router::Disposition;
    use crate::models::job::JobInput;

    #[derive(Default)]
    struct Probe {
        active: AtomicUsize,
        peak: AtomicUsize,
        halt_on: Option<usize>,
        panic_on: Option<usize>,
    }

    fn result(job: &Job, disposition: Disposition) -> JobResult {
        JobResult {
            index: job.index,
            name: job.name.clone(),
            disposition,
        }
    }

    #[async_trait]
    impl Pipeline for Probe {
        async fn process(&self, job: Arc<Job>) -> Processed {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(1)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.panic_on == Some(job.index) {
                panic!("boom");
            }
            let halt = self.halt_on == Some(job.index);
            let disposition = if halt {
                Disposition::Pending {
                    reason: "quota".into(),
                    stored_as: None,
                }
            } else {
                Disposition::Failed {
                    reason: "done".into(),
                    stored_as: None,
                    attempts: 1,
                }
            };
            Processed {
                result: result(&job, disposition),
                halt,
            }
        }

        async fn park(&self, job: Arc<Job>, reason: String) -> JobResult {
            result(
                &job,
                Disposition::Pending {
                    reason,
                    stored_as: None,
                },
            )
        }

        async fn abandon(&self, job: Arc<Job>, reason: String) -> JobResult {
            result(
                &job,
                Disposition::Failed {
                    reason,
                    stored_as: None,
                    attempts: 0,
                },
            )
        }
    }

    fn jobs(n: usize) -> Vec<Job> {
        (0..n)
            .map(|i| {
                let name = format!("{i}.png");
                Job::from_input(i, name.clone(), JobInput::new(name, vec![], None))
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_limit_respected() {
        let probe = Arc::new(Probe::default());
        let start = Instant::now();
        let run = WorkerPool::new(3).run(jobs(10), probe.clone()).await;

        assert_eq!(run.results.len(), 10);
        assert!(!run.halted);
        assert_eq!(probe.peak.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_halt_parks_unstarted_jobs() {
        let probe = Arc::new(Probe {
            halt_on: Some(1),
            ..Default::default()
        });
        let run = WorkerPool::new(1).run(jobs(5), probe).await;

        assert!(run.halted);
        assert_eq!(run.results.len(), 5);
        let parked: Vec<usize> = run
            .results
            .iter()
            .filter(|r| {
                matches!(&r.disposition, Disposition::Pending { reason, .. } if reason == HALTED_REASON)
            })
            .map(|r| r.index)
            .collect();
        assert_eq!(parked, vec![2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crashed_pipeline_is_abandoned() {
        let probe = Arc::new(Probe {
            panic_on: Some(2),
            ..Default::default()
        });
        let run = WorkerPool::new(2).run(jobs(4), probe).await;

        assert_eq!(run.results.len(), 4);
        let crashed = run.results.iter().find(|r| r.index == 2).unwrap();
        assert!(matches!(
            &crashed.disposition,
            Disposition::Failed { reason, .. } if reason.starts_with("pipeline_crashed")
        ));
    }

    #[test]
    fn test_zero_concurrency_is_clamped() {
        assert_eq!(WorkerPool::new(0).concurrency(), 1);
    }
}

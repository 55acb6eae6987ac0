//! Folds routed job results into the batch report.

use uuid::Uuid;

use super::router::{Disposition, JobResult};
use crate::models::report::{BatchReport, BatchStats, FailedEntry, PendingEntry, SuccessEntry};

/// Build the report for one batch. Output does not depend on the order in
/// which `results` completed.
pub fn finalize(batch_id: Uuid, mut results: Vec<JobResult>, stopped: bool) -> BatchReport {
    results.sort_by_key(|r| r.index);

    let mut stats = BatchStats {
        total: results.len(),
        stopped_due_to_quota: stopped,
        ..Default::default()
    };
    let mut success = Vec::new();
    let mut failed = Vec::new();
    let mut pending = Vec::new();

    for result in results {
        match result.disposition {
            Disposition::Success {
                identifier,
                provenance,
                duplicate,
                stored_as,
            } => {
                stats.success += 1;
                if duplicate {
                    stats.duplicate += 1;
                }
                if provenance.attempt <= 1 {
                    stats.first_attempt_success += 1;
                } else {
                    stats.retry_success += 1;
                }
                success.push(SuccessEntry {
                    original: result.name,
                    consumer_number: identifier.to_string(),
                    stored_as,
                    duplicate,
                    attempts: provenance.attempt,
                    model: provenance.model,
                    credential: provenance.credential,
                });
            }
            Disposition::Failed {
                reason,
                stored_as,
                attempts,
            } => {
                stats.failed += 1;
                failed.push(FailedEntry {
                    original: result.name,
                    reason,
                    stored_as,
                    attempts,
                });
            }
            Disposition::Pending { reason, stored_as } => {
                stats.pending += 1;
                pending.push(PendingEntry {
                    original: result.name,
                    reason,
                    stored_as,
                });
            }
        }
    }

    BatchReport {
        batch_id,
        success,
        failed,
        pending,
        stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::attempt::Provenance;
    use crate::models::bill::{ExtractedIdentifier, IdentifierFormat};

    fn success(index: usize, number: &str, attempt: u32, duplicate: bool) -> JobResult {
        JobResult {
            index,
            name: format!("{index}.png"),
            disposition: Disposition::Success {
                identifier: ExtractedIdentifier::parse(number, &IdentifierFormat::default())
                    .unwrap(),
                provenance: Provenance {
                    model: "gemini-2.5-flash".into(),
                    credential: "key-1".into(),
                    attempt,
                },
                duplicate,
                stored_as: Some(format!("success/{number}.png")),
            },
        }
    }

    fn failed(index: usize) -> JobResult {
        JobResult {
            index,
            name: format!("{index}.png"),
            disposition: Disposition::Failed {
                reason: "transient: 503".into(),
                stored_as: None,
                attempts: 10,
            },
        }
    }

    fn pending(index: usize) -> JobResult {
        JobResult {
            index,
            name: format!("{index}.png"),
            disposition: Disposition::Pending {
                reason: "quota".into(),
                stored_as: None,
            },
        }
    }

    #[test]
    fn test_counts_add_up() {
        let report = finalize(
            Uuid::nil(),
            vec![
                success(0, "110013196591", 1, false),
                success(1, "110013196591", 3, true),
                failed(2),
                pending(3),
                pending(4),
            ],
            true,
        );

        let stats = &report.stats;
        assert_eq!(stats.total, 5);
        assert_eq!(stats.success + stats.failed + stats.pending, stats.total);
        assert_eq!(stats.duplicate, 1);
        assert_eq!(stats.first_attempt_success, 1);
        assert_eq!(stats.retry_success, 1);
        assert!(stats.stopped_due_to_quota);
        assert_eq!(report.duplicates().count(), 1);
    }

    #[test]
    fn test_order_independent() {
        let forward = vec![success(0, "110013196591", 1, false), failed(1), pending(2)];
        let mut backward = forward.clone();
        backward.reverse();

        assert_eq!(
            finalize(Uuid::nil(), forward, false),
            finalize(Uuid::nil(), backward, false)
        );
    }

    #[test]
    fn test_report_json_shape() {
        let report = finalize(Uuid::nil(), vec![success(0, "110013196591", 2, false)], false);
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["success"][0]["consumerNumber"], "110013196591");
        assert_eq!(json["success"][0]["attempts"], 2);
        assert_eq!(json["stats"]["retrySuccess"], 1);
        assert_eq!(json["stats"]["stoppedDueToQuota"], false);
        assert!(json["pending"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_empty_batch() {
        let report = finalize(Uuid::nil(), vec![], false);
        assert_eq!(report.stats, BatchStats::default());
    }
}

use crate::engine::DomainResult;
use delegor_core::TaskOutcome;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One flagged result within a [`ValidationReport`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    /// The task whose result was flagged.
    pub task_id: Uuid,
    /// Why it was flagged.
    pub reason: String,
}

/// Structural validation of a group's per-domain outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Results inspected.
    pub total: usize,
    /// Results that passed validation.
    pub successful: usize,
    /// Results that failed validation.
    pub failed: usize,
    /// One entry per flagged result.
    pub anomalies: Vec<Anomaly>,
    /// `successful / total`, or zero for an empty group.
    pub quality_score: f64,
}

/// Residual check over aggregated results: catches structurally empty or
/// failed outcomes before they reach the caller unannotated.
pub struct ResultValidator;

impl ResultValidator {
    /// Validate each result and roll the findings up into a report.
    pub fn validate(&self, results: &[DomainResult]) -> ValidationReport {
        let mut anomalies = Vec::new();
        let mut successful = 0;

        for result in results {
            match &result.outcome {
                TaskOutcome::Succeeded { value } => {
                    if value.is_null() {
                        anomalies.push(Anomaly {
                            task_id: result.task_id,
                            reason: "succeeded with an empty result value".into(),
                        });
                    } else {
                        successful += 1;
                    }
                }
                TaskOutcome::Failed { reason } => anomalies.push(Anomaly {
                    task_id: result.task_id,
                    reason: format!("failed: {reason}"),
                }),
                TaskOutcome::Cancelled => anomalies.push(Anomaly {
                    task_id: result.task_id,
                    reason: "cancelled before completion".into(),
                }),
            }
        }

        let total = results.len();
        ValidationReport {
            total,
            successful,
            failed: total - successful,
            quality_score: if total > 0 {
                successful as f64 / total as f64
            } else {
                0.0
            },
            anomalies,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use delegor_core::Domain;

    fn result(outcome: TaskOutcome) -> DomainResult {
        DomainResult {
            task_id: Uuid::new_v4(),
            domain: Domain::Nlp,
            outcome,
        }
    }

    #[test]
    fn test_all_clean() {
        let results = vec![
            result(TaskOutcome::Succeeded { value: serde_json::json!({"ok": 1}) }),
            result(TaskOutcome::Succeeded { value: serde_json::json!([1, 2]) }),
        ];
        let report = ResultValidator.validate(&results);
        assert_eq!(report.total, 2);
        assert_eq!(report.successful, 2);
        assert!(report.anomalies.is_empty());
        assert!((report.quality_score - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_flags_failures_and_null_values() {
        let results = vec![
            result(TaskOutcome::Succeeded { value: serde_json::Value::Null }),
            result(TaskOutcome::Failed { reason: "boom".into() }),
            result(TaskOutcome::Cancelled),
            result(TaskOutcome::Succeeded { value: serde_json::json!(7) }),
        ];
        let report = ResultValidator.validate(&results);
        assert_eq!(report.total, 4);
        assert_eq!(report.successful, 1);
        assert_eq!(report.failed, 3);
        assert_eq!(report.anomalies.len(), 3);
        assert!((report.quality_score - 0.25).abs() < f64::EPSILON);
        assert!(report.anomalies.iter().any(|a| a.reason.contains("boom")));
    }

    #[test]
    fn test_empty_group_scores_zero() {
        let report = ResultValidator.validate(&[]);
        assert_eq!(report.total, 0);
        assert_eq!(report.quality_score, 0.0);
    }
}

//! Task eligibility: recurrence, cron and continuous gaps.

use crate::types::{ManagedTask, Recurrence, TaskKind};
use chrono::{DateTime, Utc};
use common::{Error, Result};
use cron::Schedule;
use std::str::FromStr;
use std::time::Duration;

/// Parse a cron expression, accepting the standard five-field form by
/// pinning seconds to zero.
pub fn parse_cron(expression: &str) -> Result<Schedule> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&normalized)
        .map_err(|e| Error::invalid_schedule(format!("cron expression '{}': {}", trimmed, e)))
}

/// Whether a fire time of `schedule` lies in `(last_run, now]`.
pub fn is_cron_due(schedule: &Schedule, last_run: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    schedule
        .after(&last_run)
        .next()
        .is_some_and(|next| next <= now)
}

/// Time since `last_run`; zero when the clock went backwards.
fn since(last_run: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - last_run).to_std().unwrap_or(Duration::ZERO)
}

/// Decide whether `task` should be offered to the queue at `now`.
///
/// A pending manual trigger makes any enabled task eligible. Without one,
/// `triggered` tasks never are. An `Err` means the task's recurrence is
/// unusable and it stays ineligible until fixed.
pub fn is_due(
    task: &ManagedTask,
    now: DateTime<Utc>,
    continuous_gap: Duration,
    triggered: bool,
) -> Result<bool> {
    if !task.enabled || !task.status.is_eligible() {
        return Ok(false);
    }
    if triggered {
        return Ok(true);
    }

    match task.kind {
        TaskKind::Triggered => Ok(false),
        TaskKind::Continuous => Ok(task
            .last_run
            .is_none_or(|last| since(last, now) > continuous_gap)),
        TaskKind::Scheduled => match &task.recurrence {
            None => Err(Error::invalid_schedule(format!(
                "scheduled task {} has no recurrence",
                task.id
            ))),
            Some(Recurrence::Interval { every }) => {
                if every.is_zero() {
                    return Err(Error::invalid_schedule(format!(
                        "scheduled task {} has a zero interval",
                        task.id
                    )));
                }
                Ok(task.last_run.is_none_or(|last| since(last, now) >= *every))
            }
            Some(Recurrence::Cron { expression }) => {
                let schedule = parse_cron(expression)?;
                Ok(task
                    .last_run
                    .is_none_or(|last| is_cron_due(&schedule, last, now)))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TaskAction, TaskStatus};
    use chrono::TimeZone;
    use common::ErrorKind;

    const GAP: Duration = Duration::from_secs(60);

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    fn scheduled(recurrence: Recurrence) -> ManagedTask {
        ManagedTask::new(1, "nightly", TaskKind::Scheduled, TaskAction::DataCleanup)
            .with_recurrence(recurrence)
    }

    #[test]
    fn test_five_field_cron_is_normalized() {
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron("0 */5 * * * *").is_ok());
        let err = parse_cron("every five minutes").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSchedule);
    }

    #[test]
    fn test_cron_fire_time_in_window() {
        let schedule = parse_cron("0 * * * *").unwrap();
        assert!(is_cron_due(&schedule, at(9, 59, 0), at(10, 0, 0)));
        assert!(!is_cron_due(&schedule, at(10, 0, 0), at(10, 30, 0)));
        assert!(is_cron_due(&schedule, at(10, 0, 0), at(11, 0, 5)));
    }

    #[test]
    fn test_interval_recurrence() {
        let mut task = scheduled(Recurrence::Interval {
            every: Duration::from_secs(300),
        });
        assert!(is_due(&task, at(10, 0, 0), GAP, false).unwrap());

        task.last_run = Some(at(10, 0, 0));
        task.status = TaskStatus::Completed;
        assert!(!is_due(&task, at(10, 4, 59), GAP, false).unwrap());
        assert!(is_due(&task, at(10, 5, 0), GAP, false).unwrap());
    }

    #[test]
    fn test_cron_recurrence() {
        let mut task = scheduled(Recurrence::Cron {
            expression: "30 2 * * *".to_string(),
        });
        task.last_run = Some(at(2, 30, 0));
        assert!(!is_due(&task, at(12, 0, 0), GAP, false).unwrap());

        task.last_run = Some(Utc.with_ymd_and_hms(2024, 4, 30, 2, 30, 0).unwrap());
        assert!(is_due(&task, at(2, 30, 0), GAP, false).unwrap());
    }

    #[test]
    fn test_unusable_recurrence_is_an_error() {
        let task = ManagedTask::new(2, "orphan", TaskKind::Scheduled, TaskAction::Inference);
        assert!(is_due(&task, at(10, 0, 0), GAP, false).is_err());

        let task = scheduled(Recurrence::Cron {
            expression: "61 * * * *".to_string(),
        });
        assert!(is_due(&task, at(10, 0, 0), GAP, false).is_err());
    }

    #[test]
    fn test_continuous_gap() {
        let mut task = ManagedTask::new(3, "stream", TaskKind::Continuous, TaskAction::Inference);
        assert!(is_due(&task, at(10, 0, 0), GAP, false).unwrap());

        task.last_run = Some(at(10, 0, 0));
        assert!(!is_due(&task, at(10, 0, 30), GAP, false).unwrap());
        // Idle for exactly the gap is not yet long enough
        assert!(!is_due(&task, at(10, 1, 0), GAP, false).unwrap());
        assert!(is_due(&task, at(10, 1, 1), GAP, false).unwrap());
    }

    #[test]
    fn test_triggered_needs_a_trigger() {
        let task = ManagedTask::new(4, "on-demand", TaskKind::Triggered, TaskAction::ModelUpdate);
        assert!(!is_due(&task, at(10, 0, 0), GAP, false).unwrap());
        assert!(is_due(&task, at(10, 0, 0), GAP, true).unwrap());
    }

    #[test]
    fn test_status_and_switch_gate_eligibility() {
        let mut task = ManagedTask::new(5, "stream", TaskKind::Continuous, TaskAction::Inference);
        for status in [TaskStatus::Running, TaskStatus::Cancelled] {
            task.status = status;
            assert!(!is_due(&task, at(10, 0, 0), GAP, true).unwrap());
        }
        task.status = TaskStatus::Failed;
        assert!(is_due(&task, at(10, 0, 0), GAP, false).unwrap());

        task.enabled = false;
        assert!(!is_due(&task, at(10, 0, 0), GAP, false).unwrap());
    }
}

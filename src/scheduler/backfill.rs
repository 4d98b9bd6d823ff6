//! Backfill sequencing.
//!
//! A new tenant walks its periods from `backfill_start_period` up to the
//! current month strictly in order: period n+1 is never dispatched while
//! period n is not `completed`.

use std::collections::HashMap;

use crate::models::tenant::Model as Tenant;
use crate::models::work_unit::{Model as WorkUnit, WorkUnitStatus};
use crate::period::Period;

/// What to do with one period's work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodPlan {
    /// Missing, pending, queued for retry, or failed with retries left
    Dispatch,
    /// A run is already in flight
    InFlight,
    /// Completed; nothing left to do
    Done,
    /// Failed with no retries left; needs an operator
    Exhausted,
}

/// Decides whether a period's unit may be dispatched.
pub fn plan_period(unit: Option<&WorkUnit>) -> PeriodPlan {
    let Some(unit) = unit else {
        return PeriodPlan::Dispatch;
    };
    match unit.status {
        WorkUnitStatus::Completed => PeriodPlan::Done,
        WorkUnitStatus::Retrying if unit.awaiting_dispatch() => PeriodPlan::Dispatch,
        WorkUnitStatus::Running | WorkUnitStatus::Retrying => PeriodPlan::InFlight,
        WorkUnitStatus::Pending => PeriodPlan::Dispatch,
        WorkUnitStatus::Failed if unit.can_retry() => PeriodPlan::Dispatch,
        WorkUnitStatus::Failed => PeriodPlan::Exhausted,
    }
}

/// First period in `start..=current` whose unit is not completed, or `None`
/// once the whole window is done.
pub fn next_backfill_period(start: Period, current: Period, units: &[WorkUnit]) -> Option<Period> {
    let completed: Vec<&str> = units
        .iter()
        .filter(|unit| unit.is_completed())
        .map(|unit| unit.period.as_str())
        .collect();

    Period::range_inclusive(start, current)
        .into_iter()
        .find(|period| !completed.contains(&period.to_string().as_str()))
}

/// Next step of a backfilling tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillStep {
    /// Run this period now
    Dispatch(Period),
    /// The next period cannot run yet (in flight or exhausted)
    Blocked(Period, PeriodPlan),
    /// Every period through the current month is completed
    Complete,
}

pub fn plan_backfill(start: Period, current: Period, units: &[WorkUnit]) -> BackfillStep {
    let Some(next) = next_backfill_period(start, current, units) else {
        return BackfillStep::Complete;
    };

    let label = next.to_string();
    let unit = units.iter().find(|unit| unit.period == label);
    match plan_period(unit) {
        PeriodPlan::Dispatch => BackfillStep::Dispatch(next),
        plan => BackfillStep::Blocked(next, plan),
    }
}

/// Backfill progress of one tenant.
#[derive(Debug, Clone, PartialEq)]
pub struct BackfillProgress {
    pub total_months: u64,
    pub completed_months: u64,
    pub failed_months: u64,
    pub running_months: u64,
    pub pending_months: u64,
    pub percent: f64,
}

/// Summarises the tenant's ledger against its backfill window. A tenant
/// without a window reports 100 percent and zero counts.
pub fn summarize(tenant: &Tenant, units: &[WorkUnit], current: Period) -> BackfillProgress {
    let Some(start) = tenant.backfill_start() else {
        return BackfillProgress {
            total_months: 0,
            completed_months: 0,
            failed_months: 0,
            running_months: 0,
            pending_months: 0,
            percent: 100.0,
        };
    };

    let by_period: HashMap<&str, WorkUnitStatus> = units
        .iter()
        .map(|unit| (unit.period.as_str(), unit.status))
        .collect();

    let mut progress = BackfillProgress {
        total_months: 0,
        completed_months: 0,
        failed_months: 0,
        running_months: 0,
        pending_months: 0,
        percent: 0.0,
    };

    for period in Period::range_inclusive(start, current) {
        progress.total_months += 1;
        match by_period.get(period.to_string().as_str()) {
            Some(WorkUnitStatus::Completed) => progress.completed_months += 1,
            Some(WorkUnitStatus::Failed) => progress.failed_months += 1,
            Some(WorkUnitStatus::Running | WorkUnitStatus::Retrying) => {
                progress.running_months += 1
            }
            Some(WorkUnitStatus::Pending) | None => progress.pending_months += 1,
        }
    }

    progress.percent = if tenant.backfill_completed || progress.total_months == 0 {
        100.0
    } else {
        let raw = progress.completed_months as f64 * 100.0 / progress.total_months as f64;
        (raw * 10.0).round() / 10.0
    };
    progress
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn p(value: &str) -> Period {
        value.parse().unwrap()
    }

    fn unit(period: &str, status: WorkUnitStatus) -> WorkUnit {
        let mut unit = WorkUnit::new_pending(Uuid::nil(), p(period), 3, Utc::now().fixed_offset());
        unit.status = status;
        unit
    }

    #[test]
    fn first_incomplete_period_wins() {
        let units = vec![
            unit("2024-01", WorkUnitStatus::Completed),
            unit("2024-02", WorkUnitStatus::Pending),
            unit("2024-03", WorkUnitStatus::Completed),
        ];
        assert_eq!(
            next_backfill_period(p("2024-01"), p("2024-04"), &units),
            Some(p("2024-02"))
        );
    }

    #[test]
    fn missing_units_count_as_incomplete() {
        assert_eq!(
            next_backfill_period(p("2023-11"), p("2024-02"), &[]),
            Some(p("2023-11"))
        );
    }

    #[test]
    fn window_done_means_complete() {
        let units = vec![
            unit("2024-01", WorkUnitStatus::Completed),
            unit("2024-02", WorkUnitStatus::Completed),
        ];
        assert_eq!(next_backfill_period(p("2024-01"), p("2024-02"), &units), None);
        assert_eq!(
            plan_backfill(p("2024-01"), p("2024-02"), &units),
            BackfillStep::Complete
        );
    }

    #[test]
    fn later_period_waits_for_earlier_one() {
        let units = vec![
            unit("2024-01", WorkUnitStatus::Running),
            unit("2024-02", WorkUnitStatus::Pending),
        ];
        assert_eq!(
            plan_backfill(p("2024-01"), p("2024-02"), &units),
            BackfillStep::Blocked(p("2024-01"), PeriodPlan::InFlight)
        );
    }

    #[test]
    fn exhausted_period_blocks_the_window() {
        let mut failed = unit("2024-01", WorkUnitStatus::Failed);
        failed.retry_count = failed.max_retries;
        let units = vec![failed, unit("2024-02", WorkUnitStatus::Pending)];
        assert_eq!(
            plan_backfill(p("2024-01"), p("2024-02"), &units),
            BackfillStep::Blocked(p("2024-01"), PeriodPlan::Exhausted)
        );
    }

    #[test]
    fn retryable_failure_is_dispatched_again() {
        let units = vec![unit("2024-01", WorkUnitStatus::Failed)];
        assert_eq!(
            plan_backfill(p("2024-01"), p("2024-02"), &units),
            BackfillStep::Dispatch(p("2024-01"))
        );
    }

    #[test]
    fn queued_retry_dispatches_until_resumed() {
        let mut queued = unit("2024-01", WorkUnitStatus::Retrying);
        assert_eq!(plan_period(Some(&queued)), PeriodPlan::Dispatch);

        queued.resume(Utc::now().fixed_offset());
        assert_eq!(plan_period(Some(&queued)), PeriodPlan::InFlight);
    }

    #[test]
    fn summary_counts_each_status() {
        let now = Utc::now().fixed_offset();
        let tenant = crate::models::tenant::Model {
            id: Uuid::nil(),
            name: "t".into(),
            enabled: true,
            status: crate::models::tenant::TenantStatus::Active,
            kind: crate::models::tenant::TenantKind::New,
            priority: 0,
            failure_count: 0,
            max_failures: 3,
            last_run_status: crate::models::tenant::RunStatus::Pending,
            last_run_at: None,
            run_started_at: None,
            attempt: 0,
            backfill_start_period: Some("2024-01".into()),
            backfill_completed: false,
            current_period_cursor: Some("2024-02".into()),
            last_completed_period: Some("2024-01".into()),
            created_at: now,
            updated_at: now,
        };
        let units = vec![
            unit("2024-01", WorkUnitStatus::Completed),
            unit("2024-02", WorkUnitStatus::Running),
            unit("2024-03", WorkUnitStatus::Failed),
        ];

        let progress = summarize(&tenant, &units, p("2024-04"));
        assert_eq!(progress.total_months, 4);
        assert_eq!(progress.completed_months, 1);
        assert_eq!(progress.running_months, 1);
        assert_eq!(progress.failed_months, 1);
        assert_eq!(progress.pending_months, 1);
        assert_eq!(progress.percent, 25.0);

        let existing = crate::models::tenant::Model {
            backfill_start_period: None,
            ..tenant
        };
        assert_eq!(summarize(&existing, &units, p("2024-04")).percent, 100.0);
    }
}

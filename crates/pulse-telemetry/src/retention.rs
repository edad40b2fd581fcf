use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::{TelemetryResult, TelemetryStore};

pub const DEFAULT_RETENTION_DAYS: u32 = 30;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionFailure {
    pub entity: String,
    pub error: String,
}

/// Per-entity deletion counts from one prune run. In dry-run mode the
/// counts are would-delete counts and nothing is removed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionReport {
    pub cutoff: DateTime<Utc>,
    pub cutoff_date: NaiveDate,
    pub dry_run: bool,
    pub request_events: u64,
    pub error_events: u64,
    pub daily_summaries: u64,
    pub provider_costs: u64,
    pub failures: Vec<RetentionFailure>,
}

impl RetentionReport {
    pub fn total(&self) -> u64 {
        self.request_events + self.error_events + self.daily_summaries + self.provider_costs
    }

    /// False when any entity's prune step failed. The job wrapper turns
    /// an incomplete report into a non-zero exit for the scheduler.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Deletes raw events and summaries older than the retention window.
/// Purely maintenance: no dependency on the aggregator having run.
pub struct RetentionManager {
    store: Arc<dyn TelemetryStore>,
}

impl RetentionManager {
    pub fn new(store: Arc<dyn TelemetryStore>) -> Self {
        Self { store }
    }

    /// Prune everything older than `retention_days`, measured from the
    /// current instant. Raw events are cut by timestamp, summaries by
    /// calendar date; both strictly before the cutoff.
    pub async fn prune(&self, retention_days: u32, dry_run: bool) -> RetentionReport {
        self.prune_at(Utc::now(), retention_days, dry_run).await
    }

    /// Prune with an explicit reference instant.
    pub async fn prune_at(
        &self,
        now: DateTime<Utc>,
        retention_days: u32,
        dry_run: bool,
    ) -> RetentionReport {
        let cutoff = now - Duration::days(i64::from(retention_days));
        let cutoff_date = cutoff.date_naive();

        let mut report = RetentionReport {
            cutoff,
            cutoff_date,
            dry_run,
            request_events: 0,
            error_events: 0,
            daily_summaries: 0,
            provider_costs: 0,
            failures: Vec::new(),
        };

        // Each entity is pruned independently; one failure never stops
        // the remaining entities from being attempted.
        let request_events = if dry_run {
            self.store.count_request_events_before(cutoff).await
        } else {
            self.store.delete_request_events_before(cutoff).await
        };
        record_step(&mut report, "request_events", request_events, |r, n| {
            r.request_events = n
        });

        let error_events = if dry_run {
            self.store.count_error_events_before(cutoff).await
        } else {
            self.store.delete_error_events_before(cutoff).await
        };
        record_step(&mut report, "error_events", error_events, |r, n| {
            r.error_events = n
        });

        let daily_summaries = if dry_run {
            self.store.count_daily_summaries_before(cutoff_date).await
        } else {
            self.store.delete_daily_summaries_before(cutoff_date).await
        };
        record_step(&mut report, "daily_summaries", daily_summaries, |r, n| {
            r.daily_summaries = n
        });

        let provider_costs = if dry_run {
            self.store.count_provider_costs_before(cutoff_date).await
        } else {
            self.store.delete_provider_costs_before(cutoff_date).await
        };
        record_step(&mut report, "provider_costs", provider_costs, |r, n| {
            r.provider_costs = n
        });

        log::info!(
            "retention prune (dry_run={}) cutoff {}: {} rows across {} failures",
            dry_run,
            cutoff,
            report.total(),
            report.failures.len()
        );

        report
    }
}

fn record_step(
    report: &mut RetentionReport,
    entity: &str,
    result: TelemetryResult<u64>,
    assign: impl FnOnce(&mut RetentionReport, u64),
) {
    match result {
        Ok(count) => assign(report, count),
        Err(error) => {
            log::error!("retention step for {} failed: {}", entity, error);
            report.failures.push(RetentionFailure {
                entity: entity.to_string(),
                error: error.to_string(),
            });
        }
    }
}

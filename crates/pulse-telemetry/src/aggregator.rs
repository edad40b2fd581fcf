use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::storage::{day_start, TelemetryResult, TelemetryStore, UsageLedger};
use crate::types::{
    DailySummary, EndpointDaily, Provider, ProviderCostSummary, RawRequestEvent, UsageRecord,
};

/// Nearest-rank percentile: index `floor(n * p)` into the ascending
/// sort, clamped to the last element, no interpolation. The query
/// engine shares this function so live and historical views agree.
pub fn nearest_rank(sorted: &[u64], percentile: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let index = ((sorted.len() as f64) * percentile).floor() as usize;
    sorted[index.min(sorted.len() - 1)]
}

/// What one `aggregate` call did, for job logs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AggregationOutcome {
    pub date: NaiveDate,
    pub events: u64,
    pub summary_written: bool,
    pub cost_rows: u64,
}

/// Batch rollup of raw events and ledger records into daily summaries.
/// Invoked by an external scheduler; idempotent per date.
pub struct Aggregator {
    store: Arc<dyn TelemetryStore>,
    ledger: Arc<dyn UsageLedger>,
}

impl Aggregator {
    pub fn new(store: Arc<dyn TelemetryStore>, ledger: Arc<dyn UsageLedger>) -> Self {
        Self { store, ledger }
    }

    /// Aggregate one UTC calendar day. Re-running for the same date
    /// overwrites the same rows and never duplicates.
    pub async fn aggregate(&self, date: NaiveDate) -> TelemetryResult<AggregationOutcome> {
        let start = day_start(date);
        let end = day_start(date + Duration::days(1));

        let events = self.store.request_events_between(start, end).await?;
        let mut summary_written = false;

        if events.is_empty() {
            // A day with no traffic produces no row; callers treat a
            // missing row as zero.
            log::debug!("no request events on {}, skipping daily summary", date);
        } else {
            let summary = build_daily_summary(date, &events);
            self.store.upsert_daily_summary(summary).await?;
            summary_written = true;
        }

        let usage = self.ledger.usage_between(start, end).await?;
        let cost_rows = group_usage(date, &usage);
        let cost_count = cost_rows.len() as u64;
        for row in cost_rows {
            self.store.upsert_provider_cost(row).await?;
        }

        log::info!(
            "aggregated {}: {} events, summary_written={}, {} cost rows",
            date,
            events.len(),
            summary_written,
            cost_count
        );

        Ok(AggregationOutcome {
            date,
            events: events.len() as u64,
            summary_written,
            cost_rows: cost_count,
        })
    }

    /// Aggregate the most recently completed UTC day.
    pub async fn aggregate_yesterday(&self) -> TelemetryResult<AggregationOutcome> {
        let yesterday = Utc::now().date_naive() - Duration::days(1);
        self.aggregate(yesterday).await
    }

    /// Aggregate `days` calendar days walking backwards from `end_date`
    /// (yesterday when not given). Empty days are skipped, not errors;
    /// a storage failure aborts the walk so the scheduler can retry.
    pub async fn backfill(
        &self,
        days: u32,
        end_date: Option<NaiveDate>,
    ) -> TelemetryResult<Vec<AggregationOutcome>> {
        let end_date = end_date.unwrap_or_else(|| Utc::now().date_naive() - Duration::days(1));
        let mut outcomes = Vec::new();

        for offset in 0..days.max(1) {
            let date = end_date - Duration::days(i64::from(offset));
            outcomes.push(self.aggregate(date).await?);
        }

        Ok(outcomes)
    }
}

fn build_daily_summary(date: NaiveDate, events: &[RawRequestEvent]) -> DailySummary {
    let total_requests = events.len() as u64;
    let mut client_error_count = 0u64;
    let mut server_error_count = 0u64;
    let mut latency_sum = 0u64;
    let mut max_latency_ms = 0u64;

    struct EndpointAccum {
        requests: u64,
        errors: u64,
        latency_sum: u64,
    }
    let mut endpoints: HashMap<String, EndpointAccum> = HashMap::new();

    for event in events {
        if (400..500).contains(&event.status_code) {
            client_error_count += 1;
        } else if event.status_code >= 500 {
            server_error_count += 1;
        }
        latency_sum += event.latency_ms;
        max_latency_ms = max_latency_ms.max(event.latency_ms);

        let entry = endpoints
            .entry(event.endpoint.clone())
            .or_insert(EndpointAccum {
                requests: 0,
                errors: 0,
                latency_sum: 0,
            });
        entry.requests += 1;
        if event.status_code >= 400 {
            entry.errors += 1;
        }
        entry.latency_sum += event.latency_ms;
    }

    let mut latencies: Vec<u64> = events.iter().map(|event| event.latency_ms).collect();
    latencies.sort_unstable();

    DailySummary {
        date,
        total_requests,
        error_count: client_error_count + server_error_count,
        client_error_count,
        server_error_count,
        mean_latency_ms: latency_sum as f64 / total_requests as f64,
        p50_latency_ms: nearest_rank(&latencies, 0.50),
        p95_latency_ms: nearest_rank(&latencies, 0.95),
        max_latency_ms,
        endpoints: endpoints
            .into_iter()
            .map(|(endpoint, accum)| {
                (
                    endpoint,
                    EndpointDaily {
                        request_count: accum.requests,
                        error_count: accum.errors,
                        mean_latency_ms: accum.latency_sum as f64 / accum.requests as f64,
                    },
                )
            })
            .collect(),
    }
}

fn group_usage(date: NaiveDate, records: &[UsageRecord]) -> Vec<ProviderCostSummary> {
    struct CostAccum {
        requests: u64,
        cost: Decimal,
        prompt_tokens: u64,
        completion_tokens: u64,
    }

    let mut groups: BTreeMap<String, CostAccum> = BTreeMap::new();
    for record in records {
        let entry = groups.entry(record.model.clone()).or_insert(CostAccum {
            requests: 0,
            cost: Decimal::ZERO,
            prompt_tokens: 0,
            completion_tokens: 0,
        });
        entry.requests += 1;
        entry.cost += record.estimated_cost;
        entry.prompt_tokens += record.prompt_tokens;
        entry.completion_tokens += record.completion_tokens;
    }

    groups
        .into_iter()
        .map(|(model, accum)| ProviderCostSummary {
            date,
            provider: Provider::classify(&model),
            model,
            request_count: accum.requests,
            total_cost: accum.cost,
            total_tokens: accum.prompt_tokens + accum.completion_tokens,
            prompt_tokens: accum.prompt_tokens,
            completion_tokens: accum.completion_tokens,
        })
        .collect()
}

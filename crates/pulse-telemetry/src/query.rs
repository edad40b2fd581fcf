use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::aggregator::nearest_rank;
use crate::storage::{day_start, TelemetryError, TelemetryResult, TelemetryStore, UsageLedger};
use crate::types::Provider;

/// Fixed set of dashboard windows. Bucket widths keep the point count
/// bounded regardless of traffic volume.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeRange {
    LastHour,
    LastDay,
    LastWeek,
    LastMonth,
}

impl TimeRange {
    pub fn token(self) -> &'static str {
        match self {
            Self::LastHour => "1h",
            Self::LastDay => "24h",
            Self::LastWeek => "7d",
            Self::LastMonth => "30d",
        }
    }

    pub fn duration(self) -> Duration {
        match self {
            Self::LastHour => Duration::hours(1),
            Self::LastDay => Duration::hours(24),
            Self::LastWeek => Duration::days(7),
            Self::LastMonth => Duration::days(30),
        }
    }

    pub fn bucket_seconds(self) -> i64 {
        match self {
            Self::LastHour => 60,
            Self::LastDay => 3_600,
            Self::LastWeek | Self::LastMonth => 86_400,
        }
    }
}

impl FromStr for TimeRange {
    type Err = TelemetryError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        match token {
            "1h" => Ok(Self::LastHour),
            "24h" => Ok(Self::LastDay),
            "7d" => Ok(Self::LastWeek),
            "30d" => Ok(Self::LastMonth),
            other => Err(TelemetryError::UnknownTimeRange(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Rps,
    Latency,
    ErrorRate,
    Costs,
}

impl Metric {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rps => "rps",
            Self::Latency => "latency",
            Self::ErrorRate => "error_rate",
            Self::Costs => "costs",
        }
    }

    pub const ALL: [Metric; 4] = [Self::Rps, Self::Latency, Self::ErrorRate, Self::Costs];
}

impl FromStr for Metric {
    type Err = TelemetryError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "rps" => Ok(Self::Rps),
            "latency" => Ok(Self::Latency),
            "error_rate" => Ok(Self::ErrorRate),
            "costs" => Ok(Self::Costs),
            other => Err(TelemetryError::UnknownMetric(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpsPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LatencyPoint {
    pub timestamp: DateTime<Utc>,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub mean_ms: f64,
}

/// Error rate is a percentage (0-100).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorRatePoint {
    pub timestamp: DateTime<Utc>,
    pub error_rate: f64,
    pub total_requests: u64,
    pub error_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CostPoint {
    pub date: NaiveDate,
    pub total_cost: Decimal,
    pub by_service: HashMap<String, Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Series {
    Rps(Vec<RpsPoint>),
    Latency(Vec<LatencyPoint>),
    ErrorRate(Vec<ErrorRatePoint>),
    Costs(Vec<CostPoint>),
}

impl Series {
    pub fn len(&self) -> usize {
        match self {
            Self::Rps(points) => points.len(),
            Self::Latency(points) => points.len(),
            Self::ErrorRate(points) => points.len(),
            Self::Costs(points) => points.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read-only, deterministic series over raw events, daily summaries and
/// the usage ledger. Safe for arbitrary concurrent callers.
pub struct QueryEngine {
    store: Arc<dyn TelemetryStore>,
    ledger: Arc<dyn UsageLedger>,
    raw_threshold: Duration,
}

impl QueryEngine {
    pub fn new(store: Arc<dyn TelemetryStore>, ledger: Arc<dyn UsageLedger>) -> Self {
        Self {
            store,
            ledger,
            raw_threshold: Duration::hours(24),
        }
    }

    /// Longest window still served from raw events; wider windows read
    /// daily summaries instead, trading granularity for scan size.
    pub fn with_raw_threshold(mut self, threshold: Duration) -> Self {
        self.raw_threshold = threshold;
        self
    }

    /// Parse caller-supplied tokens and produce the series. Unknown
    /// tokens are caller errors, distinct from an empty result.
    pub async fn series_by_name(
        &self,
        metric: &str,
        range: &str,
        now: DateTime<Utc>,
    ) -> TelemetryResult<Series> {
        let metric = Metric::from_str(metric)?;
        let range = TimeRange::from_str(range)?;
        self.series(metric, range, now).await
    }

    /// An empty range yields an empty series, never an error. Buckets
    /// with no traffic are omitted; callers treat missing as zero.
    pub async fn series(
        &self,
        metric: Metric,
        range: TimeRange,
        now: DateTime<Utc>,
    ) -> TelemetryResult<Series> {
        match metric {
            Metric::Costs => self.cost_series(range, now).await,
            Metric::Rps | Metric::Latency | Metric::ErrorRate => {
                if range.duration() <= self.raw_threshold {
                    self.raw_series(metric, range, now).await
                } else {
                    self.summary_series(metric, range, now).await
                }
            }
        }
    }

    async fn raw_series(
        &self,
        metric: Metric,
        range: TimeRange,
        now: DateTime<Utc>,
    ) -> TelemetryResult<Series> {
        let start = now - range.duration();
        let events = self.store.request_events_between(start, now).await?;
        let bucket_seconds = range.bucket_seconds();

        struct Bucket {
            requests: u64,
            errors: u64,
            latencies: Vec<u64>,
        }
        let mut buckets: BTreeMap<i64, Bucket> = BTreeMap::new();

        for event in &events {
            let aligned = align(event.occurred_at, bucket_seconds);
            let bucket = buckets.entry(aligned).or_insert(Bucket {
                requests: 0,
                errors: 0,
                latencies: Vec::new(),
            });
            bucket.requests += 1;
            if event.status_code >= 400 {
                bucket.errors += 1;
            }
            bucket.latencies.push(event.latency_ms);
        }

        let series = match metric {
            Metric::Rps => Series::Rps(
                buckets
                    .into_iter()
                    .map(|(aligned, bucket)| RpsPoint {
                        timestamp: from_aligned(aligned),
                        value: bucket.requests as f64 / bucket_seconds as f64,
                    })
                    .collect(),
            ),
            Metric::Latency => Series::Latency(
                buckets
                    .into_iter()
                    .map(|(aligned, mut bucket)| {
                        bucket.latencies.sort_unstable();
                        let sum: u64 = bucket.latencies.iter().sum();
                        LatencyPoint {
                            timestamp: from_aligned(aligned),
                            p50_ms: nearest_rank(&bucket.latencies, 0.50),
                            p95_ms: nearest_rank(&bucket.latencies, 0.95),
                            mean_ms: sum as f64 / bucket.latencies.len() as f64,
                        }
                    })
                    .collect(),
            ),
            Metric::ErrorRate => Series::ErrorRate(
                buckets
                    .into_iter()
                    .map(|(aligned, bucket)| ErrorRatePoint {
                        timestamp: from_aligned(aligned),
                        error_rate: bucket.errors as f64 * 100.0 / bucket.requests as f64,
                        total_requests: bucket.requests,
                        error_count: bucket.errors,
                    })
                    .collect(),
            ),
            Metric::Costs => unreachable!("costs are served by cost_series"),
        };

        Ok(series)
    }

    async fn summary_series(
        &self,
        metric: Metric,
        range: TimeRange,
        now: DateTime<Utc>,
    ) -> TelemetryResult<Series> {
        let start_date = (now - range.duration()).date_naive();
        let end_date = now.date_naive();
        let summaries = self
            .store
            .daily_summaries_between(start_date, end_date)
            .await?;

        let series = match metric {
            Metric::Rps => Series::Rps(
                summaries
                    .iter()
                    .map(|summary| RpsPoint {
                        timestamp: day_start(summary.date),
                        value: summary.total_requests as f64 / 86_400.0,
                    })
                    .collect(),
            ),
            Metric::Latency => Series::Latency(
                summaries
                    .iter()
                    .map(|summary| LatencyPoint {
                        timestamp: day_start(summary.date),
                        p50_ms: summary.p50_latency_ms,
                        p95_ms: summary.p95_latency_ms,
                        mean_ms: summary.mean_latency_ms,
                    })
                    .collect(),
            ),
            Metric::ErrorRate => Series::ErrorRate(
                summaries
                    .iter()
                    .map(|summary| ErrorRatePoint {
                        timestamp: day_start(summary.date),
                        error_rate: if summary.total_requests == 0 {
                            0.0
                        } else {
                            summary.error_count as f64 * 100.0 / summary.total_requests as f64
                        },
                        total_requests: summary.total_requests,
                        error_count: summary.error_count,
                    })
                    .collect(),
            ),
            Metric::Costs => unreachable!("costs are served by cost_series"),
        };

        Ok(series)
    }

    /// Cost points are always daily. Narrow windows read the ledger
    /// directly so today's spend is visible before aggregation runs;
    /// wide windows read the upserted cost summaries.
    async fn cost_series(&self, range: TimeRange, now: DateTime<Utc>) -> TelemetryResult<Series> {
        let mut days: BTreeMap<NaiveDate, HashMap<String, Decimal>> = BTreeMap::new();

        if range.duration() <= self.raw_threshold {
            let start = now - range.duration();
            let records = self.ledger.usage_between(start, now).await?;
            for record in records {
                let by_service = days.entry(record.occurred_at.date_naive()).or_default();
                *by_service
                    .entry(service_label(&record.model))
                    .or_insert(Decimal::ZERO) += record.estimated_cost;
            }
        } else {
            let start_date = (now - range.duration()).date_naive();
            let rows = self
                .store
                .provider_costs_between(start_date, now.date_naive())
                .await?;
            for row in rows {
                let by_service = days.entry(row.date).or_default();
                *by_service
                    .entry(service_label(&row.model))
                    .or_insert(Decimal::ZERO) += row.total_cost;
            }
        }

        Ok(Series::Costs(
            days.into_iter()
                .map(|(date, by_service)| CostPoint {
                    date,
                    total_cost: by_service.values().copied().sum(),
                    by_service,
                })
                .collect(),
        ))
    }
}

fn service_label(model: &str) -> String {
    format!("{}/{}", Provider::classify(model).as_str(), model)
}

fn align(timestamp: DateTime<Utc>, bucket_seconds: i64) -> i64 {
    let seconds = timestamp.timestamp();
    seconds - seconds.rem_euclid(bucket_seconds)
}

fn from_aligned(aligned: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(aligned, 0)
        .expect("aligned bucket timestamps are always in range")
}

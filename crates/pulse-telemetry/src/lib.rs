pub mod aggregator;
pub mod config;
pub mod export;
pub mod query;
pub mod recorder;
pub mod retention;
pub mod service;
pub mod storage;
pub mod types;

pub use aggregator::{nearest_rank, AggregationOutcome, Aggregator};
pub use config::TelemetryConfig;
pub use export::export_csv;
pub use query::{
    CostPoint, ErrorRatePoint, LatencyPoint, Metric, QueryEngine, RpsPoint, Series, TimeRange,
};
pub use recorder::{EventRecorder, RequestTimer};
pub use retention::{
    RetentionFailure, RetentionManager, RetentionReport, DEFAULT_RETENTION_DAYS,
};
pub use service::TelemetryService;
pub use storage::{
    SqliteTelemetryStore, TelemetryError, TelemetryResult, TelemetryStore, UsageLedger,
};
pub use types::{
    DailySummary, EndpointDaily, ErrorKind, Provider, ProviderCostSummary, RawErrorEvent,
    RawRequestEvent, RequestContext, RequestOutcome, SanitizedContext, UsageRecord,
};

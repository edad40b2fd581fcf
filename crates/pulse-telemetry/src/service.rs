use std::sync::Arc;

use chrono::Duration;

use crate::aggregator::Aggregator;
use crate::config::TelemetryConfig;
use crate::query::QueryEngine;
use crate::recorder::EventRecorder;
use crate::retention::{RetentionManager, RetentionReport};
use crate::storage::{SqliteTelemetryStore, TelemetryResult, TelemetryStore, UsageLedger};

/// Wires the engine's parts over one SQLite database. The host keeps a
/// single service for the process lifetime and hands the recorder to its
/// request hook and the aggregator/retention handles to its scheduler.
#[derive(Clone)]
pub struct TelemetryService {
    config: TelemetryConfig,
    recorder: EventRecorder,
    aggregator: Arc<Aggregator>,
    retention: Arc<RetentionManager>,
    query: Arc<QueryEngine>,
}

impl TelemetryService {
    pub async fn open(config: TelemetryConfig) -> TelemetryResult<Self> {
        let store = Arc::new(SqliteTelemetryStore::new(&config.db_path));
        store.init().await?;

        let store_trait: Arc<dyn TelemetryStore> = store.clone();
        let ledger: Arc<dyn UsageLedger> = store;

        let recorder = EventRecorder::new(store_trait.clone());
        let aggregator = Arc::new(Aggregator::new(store_trait.clone(), ledger.clone()));
        let retention = Arc::new(RetentionManager::new(store_trait.clone()));
        let query = Arc::new(
            QueryEngine::new(store_trait, ledger).with_raw_threshold(Duration::hours(
                i64::from(config.raw_query_threshold_hours),
            )),
        );

        Ok(Self {
            config,
            recorder,
            aggregator,
            retention,
            query,
        })
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    pub fn recorder(&self) -> &EventRecorder {
        &self.recorder
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    pub fn query(&self) -> &QueryEngine {
        &self.query
    }

    /// Prune with the configured retention window.
    pub async fn prune(&self, dry_run: bool) -> RetentionReport {
        self.retention.prune(self.config.retention_days, dry_run).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tempfile::tempdir;

    use super::TelemetryService;
    use crate::config::TelemetryConfig;
    use crate::query::{Metric, TimeRange};
    use crate::types::{RequestContext, RequestOutcome};

    #[tokio::test]
    async fn service_wires_recorder_and_query_over_one_database() {
        let dir = tempdir().expect("temp dir");
        let service = TelemetryService::open(TelemetryConfig {
            db_path: dir.path().join("telemetry.db"),
            ..TelemetryConfig::default()
        })
        .await
        .expect("open service");

        let ctx = RequestContext::new("GET", "/api/sessions");
        service
            .recorder()
            .record(&ctx, &RequestOutcome::Response { status_code: 200 }, 12)
            .await;

        let series = service
            .query()
            .series(Metric::Rps, TimeRange::LastHour, Utc::now())
            .await
            .expect("series");
        assert_eq!(series.len(), 1);

        let report = service.prune(true).await;
        assert!(report.dry_run);
        assert_eq!(report.total(), 0);
    }
}

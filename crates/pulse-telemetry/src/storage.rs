use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::types::{
    DailySummary, ErrorKind, Provider, ProviderCostSummary, RawErrorEvent, RawRequestEvent,
    UsageRecord,
};

pub type TelemetryResult<T> = Result<T, TelemetryError>;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("time parse error: {0}")]
    Chrono(#[from] chrono::ParseError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("decimal parse error: {0}")]
    Decimal(#[from] rust_decimal::Error),

    #[error("storage task join error: {0}")]
    Task(String),

    #[error("invalid telemetry data: {0}")]
    InvalidData(String),

    #[error("unknown metric: {0}")]
    UnknownMetric(String),

    #[error("unknown time range: {0}")]
    UnknownTimeRange(String),
}

/// Storage owned by the observability engine: raw events in, summaries
/// upserted, retention deletes out. All timestamps are UTC.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    async fn init(&self) -> TelemetryResult<()>;

    async fn insert_request_event(&self, event: RawRequestEvent) -> TelemetryResult<()>;
    async fn insert_error_event(&self, event: RawErrorEvent) -> TelemetryResult<()>;

    async fn request_events_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> TelemetryResult<Vec<RawRequestEvent>>;

    async fn error_events_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> TelemetryResult<Vec<RawErrorEvent>>;

    async fn upsert_daily_summary(&self, summary: DailySummary) -> TelemetryResult<()>;
    async fn daily_summary(&self, date: NaiveDate) -> TelemetryResult<Option<DailySummary>>;
    async fn daily_summaries_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> TelemetryResult<Vec<DailySummary>>;

    async fn upsert_provider_cost(&self, summary: ProviderCostSummary) -> TelemetryResult<()>;
    async fn provider_costs_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> TelemetryResult<Vec<ProviderCostSummary>>;

    async fn count_request_events_before(&self, cutoff: DateTime<Utc>) -> TelemetryResult<u64>;
    async fn delete_request_events_before(&self, cutoff: DateTime<Utc>) -> TelemetryResult<u64>;
    async fn count_error_events_before(&self, cutoff: DateTime<Utc>) -> TelemetryResult<u64>;
    async fn delete_error_events_before(&self, cutoff: DateTime<Utc>) -> TelemetryResult<u64>;
    async fn count_daily_summaries_before(&self, cutoff: NaiveDate) -> TelemetryResult<u64>;
    async fn delete_daily_summaries_before(&self, cutoff: NaiveDate) -> TelemetryResult<u64>;
    async fn count_provider_costs_before(&self, cutoff: NaiveDate) -> TelemetryResult<u64>;
    async fn delete_provider_costs_before(&self, cutoff: NaiveDate) -> TelemetryResult<u64>;
}

/// Read side of the usage ledger. The ledger is populated by the host's
/// API client layer; this engine never writes to it.
#[async_trait]
pub trait UsageLedger: Send + Sync {
    async fn usage_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> TelemetryResult<Vec<UsageRecord>>;
}

#[derive(Debug, Clone)]
pub struct SqliteTelemetryStore {
    db_path: PathBuf,
}

impl SqliteTelemetryStore {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    async fn with_connection<T, F>(&self, func: F) -> TelemetryResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> TelemetryResult<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let connection = open_connection(&db_path)?;
            func(&connection)
        })
        .await
        .map_err(|error| TelemetryError::Task(error.to_string()))?
    }
}

#[async_trait]
impl TelemetryStore for SqliteTelemetryStore {
    async fn init(&self) -> TelemetryResult<()> {
        self.with_connection(|connection| {
            connection.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS request_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    request_id TEXT NOT NULL,
                    occurred_at TEXT NOT NULL,
                    endpoint TEXT NOT NULL,
                    method TEXT NOT NULL,
                    status_code INTEGER NOT NULL,
                    latency_ms INTEGER NOT NULL,
                    principal TEXT
                );

                CREATE TABLE IF NOT EXISTS error_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    request_id TEXT NOT NULL,
                    occurred_at TEXT NOT NULL,
                    endpoint TEXT NOT NULL,
                    method TEXT NOT NULL,
                    status_code INTEGER NOT NULL,
                    kind TEXT NOT NULL,
                    message TEXT NOT NULL,
                    stack_trace TEXT NOT NULL DEFAULT '',
                    principal TEXT,
                    context TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS daily_summaries (
                    date TEXT PRIMARY KEY,
                    total_requests INTEGER NOT NULL,
                    error_count INTEGER NOT NULL,
                    client_error_count INTEGER NOT NULL,
                    server_error_count INTEGER NOT NULL,
                    mean_latency_ms REAL NOT NULL,
                    p50_latency_ms INTEGER NOT NULL,
                    p95_latency_ms INTEGER NOT NULL,
                    max_latency_ms INTEGER NOT NULL,
                    endpoints TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS provider_cost_summaries (
                    date TEXT NOT NULL,
                    provider TEXT NOT NULL,
                    model TEXT NOT NULL,
                    request_count INTEGER NOT NULL,
                    total_cost TEXT NOT NULL,
                    total_tokens INTEGER NOT NULL,
                    prompt_tokens INTEGER NOT NULL,
                    completion_tokens INTEGER NOT NULL,
                    PRIMARY KEY (date, provider, model)
                );

                -- Populated by the host's API client layer; read-only here.
                CREATE TABLE IF NOT EXISTS usage_records (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    occurred_at TEXT NOT NULL,
                    model TEXT NOT NULL,
                    prompt_tokens INTEGER NOT NULL,
                    completion_tokens INTEGER NOT NULL,
                    estimated_cost TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_request_occurred_at ON request_events(occurred_at);
                CREATE INDEX IF NOT EXISTS idx_request_endpoint ON request_events(endpoint);
                CREATE INDEX IF NOT EXISTS idx_error_occurred_at ON error_events(occurred_at);
                CREATE INDEX IF NOT EXISTS idx_usage_occurred_at ON usage_records(occurred_at);
                "#,
            )?;
            Ok(())
        })
        .await
    }

    async fn insert_request_event(&self, event: RawRequestEvent) -> TelemetryResult<()> {
        self.with_connection(move |connection| {
            connection.execute(
                r#"
                INSERT INTO request_events (
                    request_id, occurred_at, endpoint, method, status_code, latency_ms, principal
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    event.request_id,
                    format_timestamp(event.occurred_at),
                    event.endpoint,
                    event.method,
                    i64::from(event.status_code),
                    event.latency_ms as i64,
                    event.principal,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn insert_error_event(&self, event: RawErrorEvent) -> TelemetryResult<()> {
        let context = serde_json::to_string(&event.context)?;
        self.with_connection(move |connection| {
            connection.execute(
                r#"
                INSERT INTO error_events (
                    request_id, occurred_at, endpoint, method, status_code,
                    kind, message, stack_trace, principal, context
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
                params![
                    event.request_id,
                    format_timestamp(event.occurred_at),
                    event.endpoint,
                    event.method,
                    i64::from(event.status_code),
                    event.kind.label(),
                    event.message,
                    event.stack_trace,
                    event.principal,
                    context,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn request_events_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> TelemetryResult<Vec<RawRequestEvent>> {
        self.with_connection(move |connection| {
            let mut stmt = connection.prepare(
                r#"
                SELECT request_id, occurred_at, endpoint, method, status_code, latency_ms, principal
                FROM request_events
                WHERE occurred_at >= ?1 AND occurred_at < ?2
                ORDER BY occurred_at ASC
                "#,
            )?;
            let mut rows = stmt.query(params![format_timestamp(start), format_timestamp(end)])?;
            let mut events = Vec::new();

            while let Some(row) = rows.next()? {
                events.push(RawRequestEvent {
                    request_id: row.get(0)?,
                    occurred_at: parse_timestamp(row.get::<_, String>(1)?)?,
                    endpoint: row.get(2)?,
                    method: row.get(3)?,
                    status_code: row.get::<_, i64>(4)? as u16,
                    latency_ms: row.get::<_, i64>(5)? as u64,
                    principal: row.get(6)?,
                });
            }

            Ok(events)
        })
        .await
    }

    async fn error_events_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> TelemetryResult<Vec<RawErrorEvent>> {
        self.with_connection(move |connection| {
            let mut stmt = connection.prepare(
                r#"
                SELECT request_id, occurred_at, endpoint, method, status_code,
                       kind, message, stack_trace, principal, context
                FROM error_events
                WHERE occurred_at >= ?1 AND occurred_at < ?2
                ORDER BY occurred_at ASC
                "#,
            )?;
            let mut rows = stmt.query(params![format_timestamp(start), format_timestamp(end)])?;
            let mut events = Vec::new();

            while let Some(row) = rows.next()? {
                let kind: String = row.get(5)?;
                let context: String = row.get(9)?;
                events.push(RawErrorEvent {
                    request_id: row.get(0)?,
                    occurred_at: parse_timestamp(row.get::<_, String>(1)?)?,
                    endpoint: row.get(2)?,
                    method: row.get(3)?,
                    status_code: row.get::<_, i64>(4)? as u16,
                    kind: ErrorKind::from_label(&kind),
                    message: row.get(6)?,
                    stack_trace: row.get(7)?,
                    principal: row.get(8)?,
                    context: serde_json::from_str(&context)?,
                });
            }

            Ok(events)
        })
        .await
    }

    async fn upsert_daily_summary(&self, summary: DailySummary) -> TelemetryResult<()> {
        let endpoints = serde_json::to_string(&summary.endpoints)?;
        self.with_connection(move |connection| {
            connection.execute(
                r#"
                INSERT INTO daily_summaries (
                    date, total_requests, error_count, client_error_count, server_error_count,
                    mean_latency_ms, p50_latency_ms, p95_latency_ms, max_latency_ms, endpoints
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(date) DO UPDATE SET
                    total_requests = excluded.total_requests,
                    error_count = excluded.error_count,
                    client_error_count = excluded.client_error_count,
                    server_error_count = excluded.server_error_count,
                    mean_latency_ms = excluded.mean_latency_ms,
                    p50_latency_ms = excluded.p50_latency_ms,
                    p95_latency_ms = excluded.p95_latency_ms,
                    max_latency_ms = excluded.max_latency_ms,
                    endpoints = excluded.endpoints
                "#,
                params![
                    format_date(summary.date),
                    summary.total_requests as i64,
                    summary.error_count as i64,
                    summary.client_error_count as i64,
                    summary.server_error_count as i64,
                    summary.mean_latency_ms,
                    summary.p50_latency_ms as i64,
                    summary.p95_latency_ms as i64,
                    summary.max_latency_ms as i64,
                    endpoints,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn daily_summary(&self, date: NaiveDate) -> TelemetryResult<Option<DailySummary>> {
        self.with_connection(move |connection| {
            let row = connection
                .query_row(
                    r#"
                    SELECT date, total_requests, error_count, client_error_count, server_error_count,
                           mean_latency_ms, p50_latency_ms, p95_latency_ms, max_latency_ms, endpoints
                    FROM daily_summaries
                    WHERE date = ?1
                    "#,
                    params![format_date(date)],
                    map_summary_row,
                )
                .optional()?;

            row.map(finish_summary_row).transpose()
        })
        .await
    }

    async fn daily_summaries_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> TelemetryResult<Vec<DailySummary>> {
        self.with_connection(move |connection| {
            let mut stmt = connection.prepare(
                r#"
                SELECT date, total_requests, error_count, client_error_count, server_error_count,
                       mean_latency_ms, p50_latency_ms, p95_latency_ms, max_latency_ms, endpoints
                FROM daily_summaries
                WHERE date >= ?1 AND date <= ?2
                ORDER BY date ASC
                "#,
            )?;
            let rows = stmt.query_map(params![format_date(start), format_date(end)], map_summary_row)?;

            let mut summaries = Vec::new();
            for row in rows {
                summaries.push(finish_summary_row(row?)?);
            }
            Ok(summaries)
        })
        .await
    }

    async fn upsert_provider_cost(&self, summary: ProviderCostSummary) -> TelemetryResult<()> {
        self.with_connection(move |connection| {
            connection.execute(
                r#"
                INSERT INTO provider_cost_summaries (
                    date, provider, model, request_count, total_cost,
                    total_tokens, prompt_tokens, completion_tokens
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(date, provider, model) DO UPDATE SET
                    request_count = excluded.request_count,
                    total_cost = excluded.total_cost,
                    total_tokens = excluded.total_tokens,
                    prompt_tokens = excluded.prompt_tokens,
                    completion_tokens = excluded.completion_tokens
                "#,
                params![
                    format_date(summary.date),
                    summary.provider.as_str(),
                    summary.model,
                    summary.request_count as i64,
                    summary.total_cost.to_string(),
                    summary.total_tokens as i64,
                    summary.prompt_tokens as i64,
                    summary.completion_tokens as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn provider_costs_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> TelemetryResult<Vec<ProviderCostSummary>> {
        self.with_connection(move |connection| {
            let mut stmt = connection.prepare(
                r#"
                SELECT date, provider, model, request_count, total_cost,
                       total_tokens, prompt_tokens, completion_tokens
                FROM provider_cost_summaries
                WHERE date >= ?1 AND date <= ?2
                ORDER BY date ASC, provider ASC, model ASC
                "#,
            )?;
            let mut rows = stmt.query(params![format_date(start), format_date(end)])?;
            let mut summaries = Vec::new();

            while let Some(row) = rows.next()? {
                let date: String = row.get(0)?;
                let provider: String = row.get(1)?;
                let total_cost: String = row.get(4)?;
                summaries.push(ProviderCostSummary {
                    date: parse_date(&date)?,
                    provider: Provider::from_db(&provider).ok_or_else(|| {
                        TelemetryError::InvalidData(format!("unknown provider: {}", provider))
                    })?,
                    model: row.get(2)?,
                    request_count: row.get::<_, i64>(3)? as u64,
                    total_cost: Decimal::from_str(&total_cost)?,
                    total_tokens: row.get::<_, i64>(5)? as u64,
                    prompt_tokens: row.get::<_, i64>(6)? as u64,
                    completion_tokens: row.get::<_, i64>(7)? as u64,
                });
            }

            Ok(summaries)
        })
        .await
    }

    async fn count_request_events_before(&self, cutoff: DateTime<Utc>) -> TelemetryResult<u64> {
        self.with_connection(move |connection| {
            count_before(connection, "request_events", "occurred_at", &format_timestamp(cutoff))
        })
        .await
    }

    async fn delete_request_events_before(&self, cutoff: DateTime<Utc>) -> TelemetryResult<u64> {
        self.with_connection(move |connection| {
            delete_before(connection, "request_events", "occurred_at", &format_timestamp(cutoff))
        })
        .await
    }

    async fn count_error_events_before(&self, cutoff: DateTime<Utc>) -> TelemetryResult<u64> {
        self.with_connection(move |connection| {
            count_before(connection, "error_events", "occurred_at", &format_timestamp(cutoff))
        })
        .await
    }

    async fn delete_error_events_before(&self, cutoff: DateTime<Utc>) -> TelemetryResult<u64> {
        self.with_connection(move |connection| {
            delete_before(connection, "error_events", "occurred_at", &format_timestamp(cutoff))
        })
        .await
    }

    async fn count_daily_summaries_before(&self, cutoff: NaiveDate) -> TelemetryResult<u64> {
        self.with_connection(move |connection| {
            count_before(connection, "daily_summaries", "date", &format_date(cutoff))
        })
        .await
    }

    async fn delete_daily_summaries_before(&self, cutoff: NaiveDate) -> TelemetryResult<u64> {
        self.with_connection(move |connection| {
            delete_before(connection, "daily_summaries", "date", &format_date(cutoff))
        })
        .await
    }

    async fn count_provider_costs_before(&self, cutoff: NaiveDate) -> TelemetryResult<u64> {
        self.with_connection(move |connection| {
            count_before(connection, "provider_cost_summaries", "date", &format_date(cutoff))
        })
        .await
    }

    async fn delete_provider_costs_before(&self, cutoff: NaiveDate) -> TelemetryResult<u64> {
        self.with_connection(move |connection| {
            delete_before(connection, "provider_cost_summaries", "date", &format_date(cutoff))
        })
        .await
    }
}

#[async_trait]
impl UsageLedger for SqliteTelemetryStore {
    async fn usage_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> TelemetryResult<Vec<UsageRecord>> {
        self.with_connection(move |connection| {
            let mut stmt = connection.prepare(
                r#"
                SELECT occurred_at, model, prompt_tokens, completion_tokens, estimated_cost
                FROM usage_records
                WHERE occurred_at >= ?1 AND occurred_at < ?2
                ORDER BY occurred_at ASC
                "#,
            )?;
            let mut rows = stmt.query(params![format_timestamp(start), format_timestamp(end)])?;
            let mut records = Vec::new();

            while let Some(row) = rows.next()? {
                let estimated_cost: String = row.get(4)?;
                records.push(UsageRecord {
                    occurred_at: parse_timestamp(row.get::<_, String>(0)?)?,
                    model: row.get(1)?,
                    prompt_tokens: row.get::<_, i64>(2)? as u64,
                    completion_tokens: row.get::<_, i64>(3)? as u64,
                    estimated_cost: Decimal::from_str(&estimated_cost)?,
                });
            }

            Ok(records)
        })
        .await
    }
}

fn open_connection(path: &Path) -> TelemetryResult<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let connection = Connection::open(path)?;
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;
        PRAGMA synchronous = NORMAL;
        "#,
    )?;
    Ok(connection)
}

fn count_before(
    connection: &Connection,
    table: &str,
    column: &str,
    cutoff: &str,
) -> TelemetryResult<u64> {
    let sql = format!("SELECT COUNT(*) FROM {} WHERE {} < ?1", table, column);
    let count: i64 = connection.query_row(&sql, params![cutoff], |row| row.get(0))?;
    Ok(count as u64)
}

fn delete_before(
    connection: &Connection,
    table: &str,
    column: &str,
    cutoff: &str,
) -> TelemetryResult<u64> {
    let sql = format!("DELETE FROM {} WHERE {} < ?1", table, column);
    let deleted = connection.execute(&sql, params![cutoff])?;
    Ok(deleted as u64)
}

type SummaryRow = (String, i64, i64, i64, i64, f64, i64, i64, i64, String);

fn map_summary_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SummaryRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn finish_summary_row(row: SummaryRow) -> TelemetryResult<DailySummary> {
    let (
        date,
        total_requests,
        error_count,
        client_error_count,
        server_error_count,
        mean_latency_ms,
        p50_latency_ms,
        p95_latency_ms,
        max_latency_ms,
        endpoints,
    ) = row;

    Ok(DailySummary {
        date: parse_date(&date)?,
        total_requests: total_requests as u64,
        error_count: error_count as u64,
        client_error_count: client_error_count as u64,
        server_error_count: server_error_count as u64,
        mean_latency_ms,
        p50_latency_ms: p50_latency_ms as u64,
        p95_latency_ms: p95_latency_ms as u64,
        max_latency_ms: max_latency_ms as u64,
        endpoints: serde_json::from_str(&endpoints)?,
    })
}

pub(crate) fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339()
}

pub(crate) fn parse_timestamp(raw: String) -> TelemetryResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(&raw)?.with_timezone(&Utc))
}

pub(crate) fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub(crate) fn parse_date(raw: &str) -> TelemetryResult<NaiveDate> {
    Ok(NaiveDate::parse_from_str(raw, "%Y-%m-%d")?)
}

/// Start of a UTC calendar day as a timestamp.
pub(crate) fn day_start(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::{Duration, TimeZone, Utc};
    use rusqlite::{params, Connection};
    use tempfile::tempdir;

    use super::{SqliteTelemetryStore, TelemetryStore, UsageLedger};
    use crate::types::{
        DailySummary, ErrorKind, Provider, ProviderCostSummary, RawErrorEvent, RawRequestEvent,
        RequestContext, SanitizedContext,
    };

    fn request_event(at: chrono::DateTime<Utc>, status: u16) -> RawRequestEvent {
        RawRequestEvent {
            request_id: uuid::Uuid::new_v4().to_string(),
            occurred_at: at,
            endpoint: "/api/sessions".to_string(),
            method: "GET".to_string(),
            status_code: status,
            latency_ms: 42,
            principal: None,
        }
    }

    #[tokio::test]
    async fn round_trips_request_and_error_events() {
        let dir = tempdir().expect("temp dir");
        let store = SqliteTelemetryStore::new(dir.path().join("telemetry.db"));
        store.init().await.expect("init");

        let at = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).single().expect("datetime");
        store
            .insert_request_event(request_event(at, 200))
            .await
            .expect("insert request");

        let ctx = RequestContext::new("GET", "/api/sessions?id=7");
        store
            .insert_error_event(RawErrorEvent {
                request_id: "req-1".to_string(),
                occurred_at: at,
                endpoint: "/api/sessions".to_string(),
                method: "GET".to_string(),
                status_code: 404,
                kind: ErrorKind::Http { status_code: 404 },
                message: "not found".to_string(),
                stack_trace: String::new(),
                principal: Some("user-3".to_string()),
                context: SanitizedContext::from(&ctx),
            })
            .await
            .expect("insert error");

        let requests = store
            .request_events_between(at - Duration::minutes(1), at + Duration::minutes(1))
            .await
            .expect("read requests");
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].status_code, 200);

        let errors = store
            .error_events_between(at - Duration::minutes(1), at + Duration::minutes(1))
            .await
            .expect("read errors");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::Http { status_code: 404 });
        assert_eq!(errors[0].context.path, "/api/sessions");
        assert!(errors[0].context.query_params.is_empty());
    }

    #[tokio::test]
    async fn day_window_select_is_inclusive_start_exclusive_end() {
        let dir = tempdir().expect("temp dir");
        let store = SqliteTelemetryStore::new(dir.path().join("telemetry.db"));
        store.init().await.expect("init");

        let start = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().expect("datetime");
        let end = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).single().expect("datetime");

        store.insert_request_event(request_event(start, 200)).await.expect("at start");
        store
            .insert_request_event(request_event(end - Duration::seconds(1), 200))
            .await
            .expect("just inside");
        store.insert_request_event(request_event(end, 200)).await.expect("at end");

        let events = store.request_events_between(start, end).await.expect("read");
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn daily_summary_upsert_replaces_the_same_date() {
        let dir = tempdir().expect("temp dir");
        let store = SqliteTelemetryStore::new(dir.path().join("telemetry.db"));
        store.init().await.expect("init");

        let date = chrono::NaiveDate::from_ymd_opt(2026, 3, 1).expect("date");
        let mut summary = DailySummary {
            date,
            total_requests: 10,
            error_count: 2,
            client_error_count: 1,
            server_error_count: 1,
            mean_latency_ms: 55.0,
            p50_latency_ms: 60,
            p95_latency_ms: 100,
            max_latency_ms: 100,
            endpoints: HashMap::new(),
        };

        store.upsert_daily_summary(summary.clone()).await.expect("first upsert");
        summary.total_requests = 12;
        store.upsert_daily_summary(summary.clone()).await.expect("second upsert");

        let stored = store.daily_summary(date).await.expect("read").expect("row exists");
        assert_eq!(stored.total_requests, 12);

        let all = store
            .daily_summaries_between(date, date)
            .await
            .expect("range read");
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn provider_cost_upsert_is_keyed_by_triple() {
        let dir = tempdir().expect("temp dir");
        let store = SqliteTelemetryStore::new(dir.path().join("telemetry.db"));
        store.init().await.expect("init");

        let date = chrono::NaiveDate::from_ymd_opt(2026, 3, 1).expect("date");
        let mut cost = ProviderCostSummary {
            date,
            provider: Provider::Anthropic,
            model: "claude-3-opus".to_string(),
            request_count: 4,
            total_cost: "0.12".parse().expect("decimal"),
            total_tokens: 900,
            prompt_tokens: 600,
            completion_tokens: 300,
        };

        store.upsert_provider_cost(cost.clone()).await.expect("first");
        cost.request_count = 6;
        cost.total_cost = "0.18".parse().expect("decimal");
        store.upsert_provider_cost(cost.clone()).await.expect("second");

        let rows = store.provider_costs_between(date, date).await.expect("read");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].request_count, 6);
        assert_eq!(rows[0].total_cost, "0.18".parse().expect("decimal"));
    }

    #[tokio::test]
    async fn reads_usage_records_written_by_the_host() {
        let dir = tempdir().expect("temp dir");
        let db_path = dir.path().join("telemetry.db");
        let store = SqliteTelemetryStore::new(&db_path);
        store.init().await.expect("init");

        // The host's API client layer owns this table; simulate its writes.
        let connection = Connection::open(&db_path).expect("open");
        connection
            .execute(
                "INSERT INTO usage_records (occurred_at, model, prompt_tokens, completion_tokens, estimated_cost)
                 VALUES (?1, 'gpt-4o', 100, 50, '0.0045')",
                params!["2026-03-01T12:00:00+00:00"],
            )
            .expect("seed usage");

        let start = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().expect("datetime");
        let records = store
            .usage_between(start, start + Duration::days(1))
            .await
            .expect("read usage");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].model, "gpt-4o");
        assert_eq!(records[0].total_tokens(), 150);
        assert_eq!(records[0].estimated_cost, "0.0045".parse().expect("decimal"));
    }

    #[tokio::test]
    async fn delete_before_is_strict() {
        let dir = tempdir().expect("temp dir");
        let store = SqliteTelemetryStore::new(dir.path().join("telemetry.db"));
        store.init().await.expect("init");

        let cutoff = Utc.with_ymd_and_hms(2026, 3, 15, 0, 0, 0).single().expect("datetime");
        store
            .insert_request_event(request_event(cutoff - Duration::seconds(1), 200))
            .await
            .expect("older");
        store.insert_request_event(request_event(cutoff, 200)).await.expect("at cutoff");

        assert_eq!(
            store.count_request_events_before(cutoff).await.expect("count"),
            1
        );
        assert_eq!(
            store.delete_request_events_before(cutoff).await.expect("delete"),
            1
        );
        let survivors = store
            .request_events_between(cutoff - Duration::days(1), cutoff + Duration::days(1))
            .await
            .expect("read");
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].occurred_at, cutoff);
    }
}

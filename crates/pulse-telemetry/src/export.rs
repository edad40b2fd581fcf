use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::query::{Metric, QueryEngine, Series, TimeRange};
use crate::storage::{day_start, format_timestamp, TelemetryResult};

fn columns(metric: Metric) -> &'static [&'static str] {
    match metric {
        Metric::Rps => &["rps"],
        Metric::Latency => &["p50_latency", "p95_latency", "mean_latency"],
        Metric::ErrorRate => &["error_rate", "total_requests", "error_count"],
        Metric::Costs => &["total_cost"],
    }
}

/// Flat tabular export of the selected series over one range.
///
/// `metrics` is a comma-separated subset of rps/latency/error_rate/costs;
/// `None` or an empty string selects all four. The header names a leading
/// timestamp column plus exactly the requested columns - unrequested
/// metrics contribute no columns at all. Rows are the sorted union of
/// bucket timestamps; a cell is empty when its series has no point there.
pub async fn export_csv(
    engine: &QueryEngine,
    metrics: Option<&str>,
    range: TimeRange,
    now: DateTime<Utc>,
) -> TelemetryResult<String> {
    let selected = parse_selection(metrics)?;

    let mut header: Vec<&'static str> = vec!["timestamp"];
    for metric in &selected {
        header.extend_from_slice(columns(*metric));
    }

    // timestamp -> column -> formatted cell
    let mut rows: BTreeMap<DateTime<Utc>, BTreeMap<&'static str, String>> = BTreeMap::new();

    for metric in &selected {
        match engine.series(*metric, range, now).await? {
            Series::Rps(points) => {
                for point in points {
                    rows.entry(point.timestamp)
                        .or_default()
                        .insert("rps", format!("{:.4}", point.value));
                }
            }
            Series::Latency(points) => {
                for point in points {
                    let cells = rows.entry(point.timestamp).or_default();
                    cells.insert("p50_latency", point.p50_ms.to_string());
                    cells.insert("p95_latency", point.p95_ms.to_string());
                    cells.insert("mean_latency", format!("{:.2}", point.mean_ms));
                }
            }
            Series::ErrorRate(points) => {
                for point in points {
                    let cells = rows.entry(point.timestamp).or_default();
                    cells.insert("error_rate", format!("{:.2}", point.error_rate));
                    cells.insert("total_requests", point.total_requests.to_string());
                    cells.insert("error_count", point.error_count.to_string());
                }
            }
            Series::Costs(points) => {
                for point in points {
                    rows.entry(day_start(point.date))
                        .or_default()
                        .insert("total_cost", point.total_cost.to_string());
                }
            }
        }
    }

    let mut output = String::new();
    output.push_str(&header.join(","));
    output.push('\n');

    for (timestamp, cells) in rows {
        let mut line: Vec<String> = vec![format_timestamp(timestamp)];
        for column in header.iter().skip(1) {
            line.push(cells.get(column).cloned().unwrap_or_default());
        }
        output.push_str(&line.join(","));
        output.push('\n');
    }

    Ok(output)
}

fn parse_selection(metrics: Option<&str>) -> TelemetryResult<Vec<Metric>> {
    let raw = match metrics {
        None => return Ok(Metric::ALL.to_vec()),
        Some(raw) if raw.trim().is_empty() => return Ok(Metric::ALL.to_vec()),
        Some(raw) => raw,
    };

    let mut requested = Vec::new();
    for name in raw.split(',') {
        let metric = Metric::from_str(name.trim())?;
        if !requested.contains(&metric) {
            requested.push(metric);
        }
    }

    // Canonical column order regardless of how the caller listed them.
    Ok(Metric::ALL
        .into_iter()
        .filter(|metric| requested.contains(metric))
        .collect())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, Duration, TimeZone, Utc};
    use rusqlite::{params, Connection};
    use tempfile::tempdir;

    use super::export_csv;
    use crate::query::{QueryEngine, TimeRange};
    use crate::storage::{SqliteTelemetryStore, TelemetryError, TelemetryStore};
    use crate::types::RawRequestEvent;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).single().expect("datetime")
    }

    async fn engine_with_data() -> (QueryEngine, tempfile::TempDir) {
        let dir = tempdir().expect("temp dir");
        let db_path = dir.path().join("telemetry.db");
        let store = Arc::new(SqliteTelemetryStore::new(&db_path));
        store.init().await.expect("init");

        for (minutes, status, latency) in [(5i64, 200u16, 10u64), (5, 500, 90), (20, 200, 30)] {
            store
                .insert_request_event(RawRequestEvent {
                    request_id: uuid::Uuid::new_v4().to_string(),
                    occurred_at: now() - Duration::minutes(minutes),
                    endpoint: "/api/sessions".to_string(),
                    method: "GET".to_string(),
                    status_code: status,
                    latency_ms: latency,
                    principal: None,
                })
                .await
                .expect("seed request");
        }

        let connection = Connection::open(&db_path).expect("open");
        connection
            .execute(
                "INSERT INTO usage_records (occurred_at, model, prompt_tokens, completion_tokens, estimated_cost)
                 VALUES (?1, 'gpt-4o', 10, 5, '0.002')",
                params!["2026-03-10T11:50:00+00:00"],
            )
            .expect("seed usage");

        (QueryEngine::new(store.clone(), store), dir)
    }

    #[test]
    fn selection_filters_columns() {
        let all = super::parse_selection(None).expect("all");
        assert_eq!(all.len(), 4);

        let some = super::parse_selection(Some("latency, rps")).expect("subset");
        // Canonical order: rps before latency.
        assert_eq!(some, vec![super::Metric::Rps, super::Metric::Latency]);

        assert!(matches!(
            super::parse_selection(Some("rps,bogus")),
            Err(TelemetryError::UnknownMetric(_))
        ));
    }

    #[tokio::test]
    async fn export_with_rps_only_omits_latency_columns() {
        let (engine, _dir) = engine_with_data().await;

        let csv = export_csv(&engine, Some("rps"), TimeRange::LastHour, now())
            .await
            .expect("export");
        let header = csv.lines().next().expect("header");
        assert_eq!(header, "timestamp,rps");
        assert!(!csv.contains("p50_latency"));
        assert!(csv.lines().count() > 1);
    }

    #[tokio::test]
    async fn export_without_filter_includes_all_columns() {
        let (engine, _dir) = engine_with_data().await;

        let csv = export_csv(&engine, None, TimeRange::LastHour, now())
            .await
            .expect("export");
        let header = csv.lines().next().expect("header");
        assert_eq!(
            header,
            "timestamp,rps,p50_latency,p95_latency,mean_latency,error_rate,total_requests,error_count,total_cost"
        );
    }

    #[tokio::test]
    async fn rows_align_on_bucket_timestamps_with_empty_cells_elsewhere() {
        let (engine, _dir) = engine_with_data().await;

        let csv = export_csv(&engine, Some("rps,costs"), TimeRange::LastHour, now())
            .await
            .expect("export");
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "timestamp,rps,total_cost");

        // The cost point sits on the day boundary, separate from the
        // minute buckets, so its row has an empty rps cell.
        let cost_row = lines
            .iter()
            .find(|line| line.ends_with("0.002"))
            .expect("cost row");
        assert!(cost_row.contains(",,") || cost_row.contains("T00:00:00"));

        // Two request buckets (minute 5 and minute 20 land apart).
        let rps_rows = lines
            .iter()
            .skip(1)
            .filter(|line| !line.split(',').nth(1).unwrap_or("").is_empty())
            .count();
        assert_eq!(rps_rows, 2);
    }

    #[tokio::test]
    async fn empty_database_still_produces_a_header() {
        let dir = tempdir().expect("temp dir");
        let store = Arc::new(SqliteTelemetryStore::new(dir.path().join("telemetry.db")));
        store.init().await.expect("init");
        let engine = QueryEngine::new(store.clone(), store);

        let csv = export_csv(&engine, Some("error_rate"), TimeRange::LastDay, now())
            .await
            .expect("export");
        assert_eq!(csv, "timestamp,error_rate,total_requests,error_count\n");
    }
}

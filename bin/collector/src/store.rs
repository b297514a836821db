use std::{collections::HashMap, str::FromStr, time::Duration};

use anyhow::Context;
use census_client::entities::{
  format_timestamp, parse_timestamp, telemetry::TelemetryReport,
};
use chrono::{DateTime, Utc};
use sqlx::{
  SqlitePool,
  sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions,
  },
};

/// Reports from one installation inside this window fold into one row.
pub const DEDUP_WINDOW_DAYS: i64 = 7;

pub struct Store {
  pool: SqlitePool,
}

impl Store {
  pub async fn new(path: &str) -> anyhow::Result<Store> {
    let options = SqliteConnectOptions::from_str(path)
      .with_context(|| format!("Invalid database path {path}"))?
      .create_if_missing(true)
      .journal_mode(SqliteJournalMode::Wal)
      .busy_timeout(Duration::from_secs(5));
    let max_connections =
      if path.contains(":memory:") { 1 } else { 5 };
    let pool = SqlitePoolOptions::new()
      .max_connections(max_connections)
      .connect_with(options)
      .await
      .with_context(|| {
        format!("Failed to open database at {path}")
      })?;
    sqlx::migrate!("./migrations")
      .run(&pool)
      .await
      .context("Failed to run collector migrations")?;
    Ok(Store { pool })
  }

  /// At-least-once ingestion with a rolling dedup window: repeated
  /// reports fold into the installation's current row while that row
  /// is younger than the window; a report past the window starts a
  /// fresh row. The stored `last_seen` is max-of-observed so a delayed
  /// out-of-order report never regresses it.
  pub async fn ingest(
    &self,
    report: &TelemetryReport,
    now: DateTime<Utc>,
  ) -> anyhow::Result<()> {
    let installation_id = report.installation_id.to_string();
    let window_start = format_timestamp(
      &(now - chrono::Duration::days(DEDUP_WINDOW_DAYS)),
    );

    let existing: Option<(i64, String, String)> = sqlx::query_as(
      "SELECT id, first_seen, last_seen FROM telemetry_reports
       WHERE installation_id = ?
       ORDER BY last_seen DESC LIMIT 1",
    )
    .bind(&installation_id)
    .fetch_optional(&self.pool)
    .await
    .context("Failed to query prior report")?;

    let running = report
      .containers_by_state
      .get("running")
      .copied()
      .unwrap_or_default();
    let payload = serde_json::to_string(report)?;

    match existing {
      Some((id, first_seen, last_seen))
        if first_seen.as_str() >= window_start.as_str() =>
      {
        let last_seen = parse_timestamp(&last_seen)?.max(now);
        sqlx::query(
          "UPDATE telemetry_reports SET
             last_seen = ?, version = ?, host_count = ?,
             agent_count = ?, container_total = ?,
             running_containers = ?, avg_cpu_percent = ?,
             avg_memory_percent = ?, total_memory_limit = ?,
             timezone = ?, payload = ?
           WHERE id = ?",
        )
        .bind(format_timestamp(&last_seen))
        .bind(&report.version)
        .bind(report.host_count)
        .bind(report.agent_count)
        .bind(report.container_total)
        .bind(running)
        .bind(report.avg_cpu_percent)
        .bind(report.avg_memory_percent)
        .bind(report.total_memory_limit)
        .bind(&report.timezone)
        .bind(&payload)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to fold report into existing row")?;
      }
      _ => {
        sqlx::query(
          "INSERT INTO telemetry_reports (installation_id, first_seen, last_seen, version, host_count, agent_count, container_total, running_containers, avg_cpu_percent, avg_memory_percent, total_memory_limit, timezone, payload)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&installation_id)
        .bind(format_timestamp(&now))
        .bind(format_timestamp(&now))
        .bind(&report.version)
        .bind(report.host_count)
        .bind(report.agent_count)
        .bind(report.container_total)
        .bind(running)
        .bind(report.avg_cpu_percent)
        .bind(report.avg_memory_percent)
        .bind(report.total_memory_limit)
        .bind(&report.timezone)
        .bind(&payload)
        .execute(&self.pool)
        .await
        .context("Failed to insert report")?;
      }
    }
    Ok(())
  }

  /// Aggregates over the latest row per installation.
  pub async fn summary(
    &self,
  ) -> anyhow::Result<serde_json::Value> {
    let row: (i64, i64, i64, i64, Option<f64>) = sqlx::query_as(
      "SELECT COUNT(*), COALESCE(SUM(host_count), 0),
              COALESCE(SUM(container_total), 0),
              COALESCE(SUM(running_containers), 0),
              AVG(avg_cpu_percent)
       FROM telemetry_reports t
       WHERE last_seen = (
         SELECT MAX(last_seen) FROM telemetry_reports t2
         WHERE t2.installation_id = t.installation_id
       )",
    )
    .fetch_one(&self.pool)
    .await
    .context("Failed to compute summary")?;
    Ok(serde_json::json!({
      "installations": row.0,
      "hosts": row.1,
      "containers": row.2,
      "running_containers": row.3,
      "avg_cpu_percent": row.4,
    }))
  }

  /// Version -> installation count, over latest rows.
  pub async fn versions(
    &self,
  ) -> anyhow::Result<HashMap<String, i64>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
      "SELECT version, COUNT(*)
       FROM telemetry_reports t
       WHERE last_seen = (
         SELECT MAX(last_seen) FROM telemetry_reports t2
         WHERE t2.installation_id = t.installation_id
       )
       GROUP BY version",
    )
    .fetch_all(&self.pool)
    .await
    .context("Failed to compute version distribution")?;
    Ok(rows.into_iter().collect())
  }

  /// Active installations per day, most recent first.
  pub async fn timeline(
    &self,
    days: i64,
  ) -> anyhow::Result<Vec<(String, i64)>> {
    sqlx::query_as(
      "SELECT substr(last_seen, 1, 10) AS day, COUNT(DISTINCT installation_id)
       FROM telemetry_reports
       GROUP BY day ORDER BY day DESC LIMIT ?",
    )
    .bind(days)
    .fetch_all(&self.pool)
    .await
    .context("Failed to compute timeline")
  }

  pub async fn row_count(&self) -> anyhow::Result<i64> {
    sqlx::query_scalar("SELECT COUNT(*) FROM telemetry_reports")
      .fetch_one(&self.pool)
      .await
      .context("Failed to count reports")
  }
}

#[cfg(test)]
mod tests {
  use chrono::{Duration, TimeZone, Utc};
  use uuid::Uuid;

  use super::*;

  async fn store() -> Store {
    Store::new("sqlite::memory:")
      .await
      .expect("failed to open in-memory store")
  }

  fn report(installation_id: Uuid) -> TelemetryReport {
    TelemetryReport {
      installation_id,
      version: String::from("0.9.0"),
      host_count: 2,
      container_total: 10,
      ..Default::default()
    }
  }

  fn at(days: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
      + Duration::days(days)
  }

  #[tokio::test]
  async fn submissions_inside_window_fold_into_one_row() {
    let store = store().await;
    let id = Uuid::new_v4();
    store.ingest(&report(id), at(0)).await.unwrap();
    store.ingest(&report(id), at(1)).await.unwrap();
    assert_eq!(store.row_count().await.unwrap(), 1);
  }

  #[tokio::test]
  async fn submissions_past_window_start_a_new_row() {
    let store = store().await;
    let id = Uuid::new_v4();
    store.ingest(&report(id), at(0)).await.unwrap();
    store.ingest(&report(id), at(8)).await.unwrap();
    assert_eq!(store.row_count().await.unwrap(), 2);
  }

  #[tokio::test]
  async fn window_anchors_on_the_row_birth() {
    // t=0, t=3d, t=6d fold into one row; t=9d is past that row's
    // window and starts a new one.
    let store = store().await;
    let id = Uuid::new_v4();
    for days in [0, 3, 6] {
      store.ingest(&report(id), at(days)).await.unwrap();
    }
    assert_eq!(store.row_count().await.unwrap(), 1);
    store.ingest(&report(id), at(9)).await.unwrap();
    assert_eq!(store.row_count().await.unwrap(), 2);
  }

  #[tokio::test]
  async fn out_of_order_report_never_regresses_last_seen() {
    let store = store().await;
    let id = Uuid::new_v4();
    store.ingest(&report(id), at(5)).await.unwrap();
    store.ingest(&report(id), at(2)).await.unwrap();
    let (last_seen,): (String,) = sqlx::query_as(
      "SELECT last_seen FROM telemetry_reports",
    )
    .fetch_one(&store.pool)
    .await
    .unwrap();
    assert_eq!(
      parse_timestamp(&last_seen).unwrap(),
      at(5),
    );
  }

  #[tokio::test]
  async fn distinct_installations_do_not_fold() {
    let store = store().await;
    store
      .ingest(&report(Uuid::new_v4()), at(0))
      .await
      .unwrap();
    store
      .ingest(&report(Uuid::new_v4()), at(0))
      .await
      .unwrap();
    assert_eq!(store.row_count().await.unwrap(), 2);

    let summary = store.summary().await.unwrap();
    assert_eq!(summary["installations"], 2);
    assert_eq!(summary["hosts"], 4);
  }
}

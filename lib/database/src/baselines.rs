use anyhow::Context;
use census_client::entities::{
  baseline::ContainerBaseline, format_timestamp, parse_timestamp,
};
use chrono::{DateTime, Duration, Utc};

use crate::Client;

#[derive(sqlx::FromRow)]
struct BaselineRow {
  container_id: String,
  host_id: i64,
  image_id: String,
  avg_cpu: f64,
  avg_memory_percent: f64,
  avg_memory_usage: f64,
  sample_count: i64,
  window_start: String,
  window_end: String,
}

impl TryFrom<BaselineRow> for ContainerBaseline {
  type Error = anyhow::Error;

  fn try_from(row: BaselineRow) -> anyhow::Result<ContainerBaseline> {
    Ok(ContainerBaseline {
      container_id: row.container_id,
      host_id: row.host_id,
      image_id: row.image_id,
      avg_cpu: row.avg_cpu,
      avg_memory_percent: row.avg_memory_percent,
      avg_memory_usage: row.avg_memory_usage,
      sample_count: row.sample_count,
      window_start: parse_timestamp(&row.window_start)?,
      window_end: parse_timestamp(&row.window_end)?,
    })
  }
}

impl Client {
  /// Recompute baselines from the rolling window of sampled
  /// snapshots. Rows are replaced per (container, host, image);
  /// groups under `min_samples` do not materialize.
  pub async fn recompute_baselines(
    &self,
    now: DateTime<Utc>,
    window_hours: i64,
    min_samples: i64,
  ) -> anyhow::Result<u64> {
    let window_start =
      format_timestamp(&(now - Duration::hours(window_hours)));
    let window_end = format_timestamp(&now);
    let result = sqlx::query(
      "INSERT OR REPLACE INTO container_baselines (container_id, host_id, image_id, avg_cpu, avg_memory_percent, avg_memory_usage, sample_count, window_start, window_end)
       SELECT container_id, host_id, image_id,
         AVG(cpu_percent),
         AVG(COALESCE(memory_percent, 0)),
         AVG(CAST(COALESCE(memory_usage, 0) AS REAL)),
         COUNT(*), ?2, ?3
       FROM container_snapshots
       WHERE scanned_at >= ?2 AND scanned_at <= ?3
         AND cpu_percent IS NOT NULL
       GROUP BY container_id, host_id, image_id
       HAVING COUNT(*) >= ?1",
    )
    .bind(min_samples)
    .bind(&window_start)
    .bind(&window_end)
    .execute(&self.pool)
    .await
    .context("Failed to recompute baselines")?;
    Ok(result.rows_affected())
  }

  pub async fn get_baseline(
    &self,
    container_id: &str,
    host_id: i64,
    image_id: &str,
  ) -> anyhow::Result<Option<ContainerBaseline>> {
    let row = sqlx::query_as::<_, BaselineRow>(
      "SELECT container_id, host_id, image_id, avg_cpu, avg_memory_percent, avg_memory_usage, sample_count, window_start, window_end
       FROM container_baselines
       WHERE container_id = ? AND host_id = ? AND image_id = ?",
    )
    .bind(container_id)
    .bind(host_id)
    .bind(image_id)
    .fetch_optional(&self.pool)
    .await
    .context("Failed to query baseline")?;
    row.map(ContainerBaseline::try_from).transpose()
  }

  /// Average observed usage since `since`, for the anomaly comparison
  /// during a post-update observation window.
  pub async fn observed_usage_since(
    &self,
    container_id: &str,
    host_id: i64,
    since: DateTime<Utc>,
  ) -> anyhow::Result<Option<(f64, f64, i64)>> {
    let row: Option<(Option<f64>, Option<f64>, i64)> =
      sqlx::query_as(
        "SELECT AVG(cpu_percent), AVG(COALESCE(memory_percent, 0)), COUNT(*)
         FROM container_snapshots
         WHERE container_id = ? AND host_id = ?
           AND scanned_at >= ? AND cpu_percent IS NOT NULL",
      )
      .bind(container_id)
      .bind(host_id)
      .bind(format_timestamp(&since))
      .fetch_optional(&self.pool)
      .await
      .context("Failed to query observed usage")?;
    Ok(row.and_then(|(cpu, memory, count)| {
      Some((cpu?, memory.unwrap_or_default(), count))
    }))
  }
}

#[cfg(test)]
mod tests {
  use census_client::entities::container::ContainerState;

  use crate::{snapshots::test_support::*, test_client};

  #[tokio::test]
  async fn baseline_requires_minimum_samples() {
    let db = test_client().await;
    let host = seed_host(&db, "a").await;
    for i in 0..9 {
      db.append_snapshots(&[snapshot(
        host,
        "web",
        ContainerState::Running,
        "sha256:aaa",
        Some(10.0),
        ts(i, 0),
      )])
      .await
      .unwrap();
    }
    let rows =
      db.recompute_baselines(ts(48, 0), 48, 10).await.unwrap();
    assert_eq!(rows, 0);

    db.append_snapshots(&[snapshot(
      host,
      "web",
      ContainerState::Running,
      "sha256:aaa",
      Some(20.0),
      ts(9, 0),
    )])
    .await
    .unwrap();
    let rows =
      db.recompute_baselines(ts(48, 0), 48, 10).await.unwrap();
    assert_eq!(rows, 1);

    let baseline = db
      .get_baseline("web-id", host, "sha256:aaa")
      .await
      .unwrap()
      .unwrap();
    assert_eq!(baseline.sample_count, 10);
    assert!((baseline.avg_cpu - 11.0).abs() < 1e-9);
  }

  #[tokio::test]
  async fn image_change_accumulates_separate_baseline() {
    let db = test_client().await;
    let host = seed_host(&db, "a").await;
    for i in 0..10 {
      db.append_snapshots(&[snapshot(
        host,
        "web",
        ContainerState::Running,
        "sha256:aaa",
        Some(10.0),
        ts(i, 0),
      )])
      .await
      .unwrap();
    }
    for i in 10..20 {
      db.append_snapshots(&[snapshot(
        host,
        "web",
        ContainerState::Running,
        "sha256:bbb",
        Some(30.0),
        ts(i, 0),
      )])
      .await
      .unwrap();
    }
    db.recompute_baselines(ts(48, 0), 48, 10).await.unwrap();

    let old = db
      .get_baseline("web-id", host, "sha256:aaa")
      .await
      .unwrap()
      .unwrap();
    let new = db
      .get_baseline("web-id", host, "sha256:bbb")
      .await
      .unwrap()
      .unwrap();
    assert!((old.avg_cpu - 10.0).abs() < 1e-9);
    assert!((new.avg_cpu - 30.0).abs() < 1e-9);
  }
}

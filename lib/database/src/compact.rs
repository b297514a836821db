use anyhow::Context;
use census_client::entities::{format_timestamp, parse_timestamp};
use chrono::{DateTime, Duration, Utc};

use crate::{Client, lifecycle::GAP_HOURS};

/// Groups with at most this many snapshots are left alone by the
/// redundancy compactor.
const COMPACTION_MIN_GROUP: usize = 10;

#[derive(sqlx::FromRow)]
struct CompactRow {
  container_id: String,
  host_id: i64,
  state: String,
  image_id: String,
  cpu_percent: Option<f64>,
  scanned_at: String,
}

fn adjacent(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
  b - a <= Duration::hours(GAP_HOURS)
}

/// Compute the set of redundant snapshot keys among rows older than
/// `cutoff` and delete them. Kept per (container_id, host_id): the
/// first and last snapshot, any snapshot whose state or image differs
/// from its predecessor, and the rows on either side of a gap longer
/// than the lifecycle gap threshold.
///
/// Deletion walks each group in time order and only drops a row when
/// the remaining neighbors stay within the gap threshold, so removing
/// several consecutive rows can never merge small gaps into one the
/// lifecycle derivation would report.
async fn delete_redundant(
  pool: &sqlx::SqlitePool,
  cutoff: &str,
  min_group: usize,
  stats_only: bool,
) -> anyhow::Result<u64> {
  let rows = sqlx::query_as::<_, CompactRow>(
    "SELECT container_id, host_id, state, image_id, cpu_percent, scanned_at
     FROM container_snapshots
     ORDER BY container_id, host_id, scanned_at",
  )
  .fetch_all(pool)
  .await
  .context("Failed to load snapshots for compaction")?;

  let mut deletions: Vec<(String, i64, String)> = Vec::new();

  for group in rows.chunk_by(|a, b| {
    a.container_id == b.container_id && a.host_id == b.host_id
  }) {
    if group.len() <= min_group.max(2) {
      continue;
    }
    let times = group
      .iter()
      .map(|row| parse_timestamp(&row.scanned_at))
      .collect::<anyhow::Result<Vec<_>>>()?;

    let mut last_kept = 0usize;
    for i in 1..group.len() - 1 {
      let row = &group[i];
      let anchor = &group[last_kept];
      let redundant = row.scanned_at.as_str() < cutoff
        && (!stats_only || row.cpu_percent.is_some())
        && row.state == anchor.state
        && row.image_id == anchor.image_id
        && adjacent(times[i - 1], times[i])
        && adjacent(times[i], times[i + 1])
        && adjacent(times[last_kept], times[i + 1]);
      if redundant {
        deletions.push((
          row.container_id.clone(),
          row.host_id,
          row.scanned_at.clone(),
        ));
      } else {
        last_kept = i;
      }
    }
  }

  if deletions.is_empty() {
    return Ok(0);
  }

  let mut tx = pool
    .begin()
    .await
    .context("Failed to begin compaction transaction")?;
  for (container_id, host_id, scanned_at) in &deletions {
    sqlx::query(
      "DELETE FROM container_snapshots
       WHERE container_id = ? AND host_id = ? AND scanned_at = ?",
    )
    .bind(container_id)
    .bind(host_id)
    .bind(scanned_at)
    .execute(&mut *tx)
    .await
    .context("Failed to delete redundant snapshot")?;
  }
  tx.commit()
    .await
    .context("Failed to commit compaction")?;
  Ok(deletions.len() as u64)
}

impl Client {
  /// Roll granular samples older than one hour into `stats_hourly`,
  /// then drop the covered samples the lifecycle derivation does not
  /// need. Idempotent: buckets already materialized are skipped, so a
  /// second run inserts nothing.
  pub async fn aggregate_old_stats(
    &self,
    now: DateTime<Utc>,
  ) -> anyhow::Result<u64> {
    let cutoff = format_timestamp(&(now - Duration::hours(1)));

    let inserted = sqlx::query(
      "INSERT INTO stats_hourly (container_id, host_id, hour_bucket, avg_cpu, max_cpu, avg_memory, max_memory, sample_count)
       SELECT container_id, host_id,
         strftime('%Y-%m-%dT%H:00:00.000Z', scanned_at) AS bucket,
         AVG(cpu_percent), MAX(cpu_percent),
         AVG(CAST(COALESCE(memory_usage, 0) AS REAL)),
         MAX(CAST(COALESCE(memory_usage, 0) AS REAL)),
         COUNT(*)
       FROM container_snapshots s
       WHERE scanned_at < ?1 AND cpu_percent IS NOT NULL
         AND NOT EXISTS (
           SELECT 1 FROM stats_hourly a
           WHERE a.container_id = s.container_id
             AND a.host_id = s.host_id
             AND a.hour_bucket = strftime('%Y-%m-%dT%H:00:00.000Z', s.scanned_at)
         )
       GROUP BY container_id, host_id, bucket",
    )
    .bind(&cutoff)
    .execute(&self.pool)
    .await
    .context("Failed to aggregate old stats")?
    .rows_affected();

    let deleted =
      delete_redundant(&self.pool, &cutoff, 0, true).await?;
    if inserted > 0 || deleted > 0 {
      debug!(
        "Stats aggregation: {inserted} buckets materialized, {deleted} samples dropped"
      );
    }
    Ok(inserted)
  }

  /// Compact redundant snapshots older than `older_than_days`,
  /// regardless of whether they carry stats. Only applied to
  /// (container, host) groups with more than 10 snapshots. Preserves
  /// everything the lifecycle derivation relies on.
  pub async fn compact_redundant_snapshots(
    &self,
    now: DateTime<Utc>,
    older_than_days: i64,
  ) -> anyhow::Result<u64> {
    let cutoff =
      format_timestamp(&(now - Duration::days(older_than_days)));
    delete_redundant(&self.pool, &cutoff, COMPACTION_MIN_GROUP, false)
      .await
  }

  /// Drop all history older than the retention horizon.
  pub async fn retention_cleanup(
    &self,
    now: DateTime<Utc>,
    older_than_days: i64,
  ) -> anyhow::Result<u64> {
    let cutoff =
      format_timestamp(&(now - Duration::days(older_than_days)));
    let snapshots = sqlx::query(
      "DELETE FROM container_snapshots WHERE scanned_at < ?",
    )
    .bind(&cutoff)
    .execute(&self.pool)
    .await
    .context("Failed to delete expired snapshots")?
    .rows_affected();
    sqlx::query("DELETE FROM stats_hourly WHERE hour_bucket < ?")
      .bind(&cutoff)
      .execute(&self.pool)
      .await
      .context("Failed to delete expired stats aggregates")?;
    sqlx::query("DELETE FROM scan_results WHERE started_at < ?")
      .bind(&cutoff)
      .execute(&self.pool)
      .await
      .context("Failed to delete expired scan results")?;
    Ok(snapshots)
  }
}

#[cfg(test)]
mod tests {
  use census_client::entities::container::{
    ContainerState, StatsRange,
  };

  use crate::{snapshots::test_support::*, test_client};

  #[tokio::test]
  async fn aggregation_is_idempotent() {
    let db = test_client().await;
    let host = seed_host(&db, "a").await;
    // 4 samples within one hour bucket, 6 hours ago.
    for minute in [0, 5, 10, 15] {
      db.append_snapshots(&[snapshot(
        host,
        "web",
        ContainerState::Running,
        "sha256:aaa",
        Some(10.0 + f64::from(minute)),
        ts(0, i64::from(minute)),
      )])
      .await
      .unwrap();
    }
    let now = ts(6, 0);
    let inserted = db.aggregate_old_stats(now).await.unwrap();
    assert_eq!(inserted, 1);

    let again = db.aggregate_old_stats(now).await.unwrap();
    assert_eq!(again, 0);

    let buckets: i64 =
      sqlx::query_scalar("SELECT COUNT(*) FROM stats_hourly")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(buckets, 1);

    let (avg, max, count): (f64, f64, i64) = sqlx::query_as(
      "SELECT avg_cpu, max_cpu, sample_count FROM stats_hourly",
    )
    .fetch_one(&db.pool)
    .await
    .unwrap();
    assert!((avg - 17.5).abs() < 1e-9);
    assert!((max - 25.0).abs() < 1e-9);
    assert_eq!(count, 4);
  }

  #[tokio::test]
  async fn aggregation_preserves_lifecycle_boundaries() {
    let db = test_client().await;
    let host = seed_host(&db, "a").await;
    // running -> running -> exited -> exited, all old, all sampled.
    let states = [
      ContainerState::Running,
      ContainerState::Running,
      ContainerState::Exited,
      ContainerState::Exited,
    ];
    for (i, state) in states.into_iter().enumerate() {
      db.append_snapshots(&[snapshot(
        host,
        "web",
        state,
        "sha256:aaa",
        Some(10.0),
        ts(0, i as i64 * 10),
      )])
      .await
      .unwrap();
    }
    db.aggregate_old_stats(ts(8, 0)).await.unwrap();

    let history =
      db.history(ts(0, 0), ts(8, 0), None).await.unwrap();
    let times: Vec<_> =
      history.iter().map(|s| s.scanned_at).collect();
    // First, the state transition, and last all survive.
    assert!(times.contains(&ts(0, 0)));
    assert!(times.contains(&ts(0, 20)));
    assert!(times.contains(&ts(0, 30)));

    // The aggregate carries the full sample count.
    let count: i64 =
      sqlx::query_scalar("SELECT sample_count FROM stats_hourly")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(count, 4);
  }

  #[tokio::test]
  async fn stats_series_merges_granular_and_hourly() {
    let db = test_client().await;
    let host = seed_host(&db, "a").await;
    for minute in [0, 10] {
      db.append_snapshots(&[snapshot(
        host,
        "web",
        ContainerState::Running,
        "sha256:aaa",
        Some(20.0),
        ts(0, minute),
      )])
      .await
      .unwrap();
    }
    // Recent granular sample that stays unaggregated.
    db.append_snapshots(&[snapshot(
      host,
      "web",
      ContainerState::Running,
      "sha256:aaa",
      Some(40.0),
      ts(5, 30),
    )])
    .await
    .unwrap();
    db.aggregate_old_stats(ts(6, 0)).await.unwrap();

    let series = db
      .container_stats("web-id", host, StatsRange::All, ts(6, 0))
      .await
      .unwrap();
    // One hourly bucket plus at least the recent granular sample; any
    // boundary rows kept for lifecycle also appear. Time-ordered.
    assert!(series.len() >= 2);
    assert!(series.windows(2).all(|pair| pair[0].ts <= pair[1].ts));
    assert!(series.iter().any(|point| point.sample_count == 2));
    assert!(series.iter().any(|point| {
      point.sample_count == 1 && (point.avg_cpu - 40.0).abs() < 1e-9
    }));
  }

  #[tokio::test]
  async fn compaction_is_lossless_for_lifecycle() {
    let db = test_client().await;
    let host = seed_host(&db, "a").await;

    // A varied timeline: steady running, a stop, a restart, an image
    // update, a long gap, then steady again. No stats, so aggregation
    // never touches it.
    let mut moments = Vec::new();
    for i in 0..8 {
      moments.push((
        ts(0, i * 10),
        ContainerState::Running,
        "sha256:aaa",
      ));
    }
    moments.push((ts(2, 0), ContainerState::Exited, "sha256:aaa"));
    moments.push((ts(2, 10), ContainerState::Running, "sha256:aaa"));
    for i in 0..4 {
      moments.push((
        ts(2, 20 + i * 10),
        ContainerState::Running,
        "sha256:bbb",
      ));
    }
    // > 2h gap before this block.
    for i in 0..4 {
      moments
        .push((ts(6, i * 10), ContainerState::Running, "sha256:bbb"));
    }
    for (at, state, image_id) in &moments {
      db.append_snapshots(&[snapshot(
        host, "web", *state, image_id, None, *at,
      )])
      .await
      .unwrap();
    }

    let before = db
      .lifecycle_events("web", host)
      .await
      .unwrap()
      .iter()
      .map(|e| (e.kind, e.timestamp))
      .collect::<Vec<_>>();

    let deleted = db
      .compact_redundant_snapshots(ts(24 * 40, 0), 7)
      .await
      .unwrap();
    assert!(deleted > 0);

    let after = db
      .lifecycle_events("web", host)
      .await
      .unwrap()
      .iter()
      .map(|e| (e.kind, e.timestamp))
      .collect::<Vec<_>>();
    assert_eq!(before, after);
  }

  #[tokio::test]
  async fn compaction_never_fabricates_gaps() {
    let db = test_client().await;
    let host = seed_host(&db, "a").await;
    // 12 steady rows spaced 70 minutes apart: every middle row sits
    // within the gap threshold of its neighbors, but deleting two
    // adjacent rows would create a 3.5h hole.
    for i in 0..12 {
      db.append_snapshots(&[snapshot(
        host,
        "web",
        ContainerState::Running,
        "sha256:aaa",
        None,
        ts(0, i * 70),
      )])
      .await
      .unwrap();
    }
    db.compact_redundant_snapshots(ts(24 * 40, 0), 7)
      .await
      .unwrap();

    let events = db.lifecycle_events("web", host).await.unwrap();
    use census_client::entities::lifecycle::LifecycleEventKind::*;
    assert!(
      events.iter().all(|e| e.kind != Disappeared),
      "compaction must not fabricate disappearances"
    );
  }

  #[tokio::test]
  async fn small_groups_are_not_compacted() {
    let db = test_client().await;
    let host = seed_host(&db, "a").await;
    for i in 0..5 {
      db.append_snapshots(&[snapshot(
        host,
        "web",
        ContainerState::Running,
        "sha256:aaa",
        None,
        ts(0, i * 10),
      )])
      .await
      .unwrap();
    }
    let deleted = db
      .compact_redundant_snapshots(ts(24 * 40, 0), 7)
      .await
      .unwrap();
    assert_eq!(deleted, 0);
  }

  #[tokio::test]
  async fn retention_drops_old_history() {
    let db = test_client().await;
    let host = seed_host(&db, "a").await;
    db.append_snapshots(&[snapshot(
      host,
      "web",
      ContainerState::Running,
      "sha256:aaa",
      None,
      ts(0, 0),
    )])
    .await
    .unwrap();
    db.append_snapshots(&[snapshot(
      host,
      "web",
      ContainerState::Running,
      "sha256:aaa",
      None,
      ts(24 * 35, 0),
    )])
    .await
    .unwrap();
    let deleted =
      db.retention_cleanup(ts(24 * 36, 0), 30).await.unwrap();
    assert_eq!(deleted, 1);
    let history =
      db.history(ts(0, 0), ts(24 * 36, 0), None).await.unwrap();
    assert_eq!(history.len(), 1);
  }
}

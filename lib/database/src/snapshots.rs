use anyhow::Context;
use census_client::entities::{
  container::{
    ContainerSnapshot, ContainerState, PortMapping, StatsPoint,
    StatsRange,
  },
  format_timestamp, parse_timestamp,
};
use chrono::{DateTime, Utc};
use sqlx::{Sqlite, Transaction};

use crate::Client;

pub(crate) const SNAPSHOT_COLUMNS: &str = "container_id, host_id, name, image, image_id, state, status_text, ports, labels, networks, mounts, links, compose_project, restart_count, cpu_percent, memory_usage, memory_limit, memory_percent, scanned_at";

#[derive(sqlx::FromRow)]
pub struct SnapshotRow {
  pub container_id: String,
  pub host_id: i64,
  pub name: String,
  pub image: String,
  pub image_id: String,
  pub state: String,
  pub status_text: String,
  pub ports: String,
  pub labels: String,
  pub networks: String,
  pub mounts: String,
  pub links: String,
  pub compose_project: Option<String>,
  pub restart_count: i64,
  pub cpu_percent: Option<f64>,
  pub memory_usage: Option<i64>,
  pub memory_limit: Option<i64>,
  pub memory_percent: Option<f64>,
  pub scanned_at: String,
}

impl TryFrom<SnapshotRow> for ContainerSnapshot {
  type Error = anyhow::Error;

  fn try_from(row: SnapshotRow) -> anyhow::Result<ContainerSnapshot> {
    Ok(ContainerSnapshot {
      container_id: row.container_id,
      host_id: row.host_id,
      name: row.name,
      image: row.image,
      image_id: row.image_id,
      state: ContainerState::from_docker(&row.state),
      status_text: row.status_text,
      ports: serde_json::from_str::<Vec<PortMapping>>(&row.ports)
        .unwrap_or_default(),
      labels: serde_json::from_str(&row.labels).unwrap_or_default(),
      networks: serde_json::from_str(&row.networks)
        .unwrap_or_default(),
      mounts: serde_json::from_str(&row.mounts).unwrap_or_default(),
      links: serde_json::from_str(&row.links).unwrap_or_default(),
      compose_project: row.compose_project,
      restart_count: row.restart_count,
      cpu_percent: row.cpu_percent,
      memory_usage: row.memory_usage,
      memory_limit: row.memory_limit,
      memory_percent: row.memory_percent,
      scanned_at: parse_timestamp(&row.scanned_at)?,
    })
  }
}

pub(crate) fn rows_into_snapshots(
  rows: Vec<SnapshotRow>,
) -> anyhow::Result<Vec<ContainerSnapshot>> {
  rows.into_iter().map(ContainerSnapshot::try_from).collect()
}

pub(crate) async fn insert_snapshot(
  tx: &mut Transaction<'_, Sqlite>,
  snapshot: &ContainerSnapshot,
) -> anyhow::Result<()> {
  sqlx::query(
    "INSERT OR IGNORE INTO container_snapshots (container_id, host_id, name, image, image_id, state, status_text, ports, labels, networks, mounts, links, compose_project, restart_count, cpu_percent, memory_usage, memory_limit, memory_percent, scanned_at)
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
  )
  .bind(&snapshot.container_id)
  .bind(snapshot.host_id)
  .bind(&snapshot.name)
  .bind(&snapshot.image)
  .bind(&snapshot.image_id)
  .bind(snapshot.state.to_string())
  .bind(&snapshot.status_text)
  .bind(serde_json::to_string(&snapshot.ports)?)
  .bind(serde_json::to_string(&snapshot.labels)?)
  .bind(serde_json::to_string(&snapshot.networks)?)
  .bind(serde_json::to_string(&snapshot.mounts)?)
  .bind(serde_json::to_string(&snapshot.links)?)
  .bind(&snapshot.compose_project)
  .bind(snapshot.restart_count)
  .bind(snapshot.cpu_percent)
  .bind(snapshot.memory_usage)
  .bind(snapshot.memory_limit)
  .bind(snapshot.memory_percent)
  .bind(format_timestamp(&snapshot.scanned_at))
  .execute(&mut **tx)
  .await
  .context("Failed to insert snapshot")?;
  Ok(())
}

impl Client {
  /// Append a batch of snapshots in one transaction.
  pub async fn append_snapshots(
    &self,
    snapshots: &[ContainerSnapshot],
  ) -> anyhow::Result<()> {
    let mut tx = self
      .pool
      .begin()
      .await
      .context("Failed to begin snapshot transaction")?;
    for snapshot in snapshots {
      insert_snapshot(&mut tx, snapshot).await?;
    }
    tx.commit()
      .await
      .context("Failed to commit snapshot batch")?;
    Ok(())
  }

  /// Containers present in the most recent scan of every host.
  pub async fn latest_per_host(
    &self,
  ) -> anyhow::Result<Vec<ContainerSnapshot>> {
    let rows = sqlx::query_as::<_, SnapshotRow>(&format!(
      "SELECT {SNAPSHOT_COLUMNS} FROM container_snapshots s
       WHERE scanned_at = (
         SELECT MAX(scanned_at) FROM container_snapshots s2
         WHERE s2.host_id = s.host_id
       )
       ORDER BY host_id, name"
    ))
    .fetch_all(&self.pool)
    .await
    .context("Failed to query latest snapshots")?;
    rows_into_snapshots(rows)
  }

  /// Containers present in the most recent scan of one host.
  pub async fn latest_for_host(
    &self,
    host_id: i64,
  ) -> anyhow::Result<Vec<ContainerSnapshot>> {
    let rows = sqlx::query_as::<_, SnapshotRow>(&format!(
      "SELECT {SNAPSHOT_COLUMNS} FROM container_snapshots
       WHERE host_id = ? AND scanned_at = (
         SELECT MAX(scanned_at) FROM container_snapshots s2
         WHERE s2.host_id = ?
       )
       ORDER BY name"
    ))
    .bind(host_id)
    .bind(host_id)
    .fetch_all(&self.pool)
    .await
    .context("Failed to query latest snapshots for host")?;
    rows_into_snapshots(rows)
  }

  pub async fn history(
    &self,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    host_id: Option<i64>,
  ) -> anyhow::Result<Vec<ContainerSnapshot>> {
    let rows = sqlx::query_as::<_, SnapshotRow>(&format!(
      "SELECT {SNAPSHOT_COLUMNS} FROM container_snapshots
       WHERE scanned_at >= ? AND scanned_at <= ?
         AND (?3 IS NULL OR host_id = ?3)
       ORDER BY scanned_at, host_id, name"
    ))
    .bind(format_timestamp(&start))
    .bind(format_timestamp(&end))
    .bind(host_id)
    .fetch_all(&self.pool)
    .await
    .context("Failed to query snapshot history")?;
    rows_into_snapshots(rows)
  }

  /// The most recent snapshot of each (name, host) pair strictly
  /// before `before`. This is what the notification engine diffs a new
  /// batch against.
  pub async fn previous_snapshots(
    &self,
    host_id: i64,
    before: DateTime<Utc>,
  ) -> anyhow::Result<Vec<ContainerSnapshot>> {
    let rows = sqlx::query_as::<_, SnapshotRow>(&format!(
      "SELECT {SNAPSHOT_COLUMNS} FROM container_snapshots s
       WHERE host_id = ? AND scanned_at < ?2 AND scanned_at = (
         SELECT MAX(scanned_at) FROM container_snapshots s2
         WHERE s2.host_id = s.host_id AND s2.name = s.name
           AND s2.scanned_at < ?2
       )"
    ))
    .bind(host_id)
    .bind(format_timestamp(&before))
    .fetch_all(&self.pool)
    .await
    .context("Failed to query previous snapshots")?;
    rows_into_snapshots(rows)
  }

  /// Merged stats series for one container: granular samples still in
  /// the snapshot log plus hourly aggregates, ordered by time.
  pub async fn container_stats(
    &self,
    container_id: &str,
    host_id: i64,
    range: StatsRange,
    now: DateTime<Utc>,
  ) -> anyhow::Result<Vec<StatsPoint>> {
    let start = range.start(now).map(|start| format_timestamp(&start));
    let rows = sqlx::query_as::<_, (String, f64, f64, f64, f64, i64)>(
      "SELECT scanned_at AS ts, cpu_percent, cpu_percent,
              CAST(COALESCE(memory_usage, 0) AS REAL),
              CAST(COALESCE(memory_usage, 0) AS REAL), 1
       FROM container_snapshots
       WHERE container_id = ?1 AND host_id = ?2
         AND cpu_percent IS NOT NULL
         AND (?3 IS NULL OR scanned_at >= ?3)
       UNION ALL
       SELECT hour_bucket, avg_cpu, max_cpu, avg_memory, max_memory, sample_count
       FROM stats_hourly
       WHERE container_id = ?1 AND host_id = ?2
         AND (?3 IS NULL OR hour_bucket >= ?3)
       ORDER BY ts",
    )
    .bind(container_id)
    .bind(host_id)
    .bind(start)
    .fetch_all(&self.pool)
    .await
    .context("Failed to query container stats")?;

    rows
      .into_iter()
      .map(
        |(ts, avg_cpu, max_cpu, avg_memory, max_memory, count)| {
          Ok(StatsPoint {
            ts: parse_timestamp(&ts)?,
            avg_cpu,
            max_cpu,
            avg_memory,
            max_memory,
            sample_count: count,
          })
        },
      )
      .collect()
  }
}

#[cfg(test)]
pub(crate) mod test_support {
  use census_client::entities::host::{
    ConnectionType, CreateHostBody,
  };
  use chrono::{TimeZone, Utc};

  use super::*;
  use crate::Client;

  pub fn ts(hours: i64, minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
      + chrono::Duration::minutes(hours * 60 + minutes)
  }

  pub async fn seed_host(db: &Client, name: &str) -> i64 {
    db.create_host(
      &CreateHostBody {
        name: name.to_string(),
        address: String::from("/var/run/docker.sock"),
        connection_type: ConnectionType::LocalSocket,
        token: None,
        enabled: true,
        collect_stats: true,
      },
      ts(0, 0),
    )
    .await
    .expect("failed to seed host")
    .id
  }

  pub fn snapshot(
    host_id: i64,
    name: &str,
    state: ContainerState,
    image_id: &str,
    cpu: Option<f64>,
    scanned_at: DateTime<Utc>,
  ) -> ContainerSnapshot {
    ContainerSnapshot {
      container_id: format!("{name}-id"),
      host_id,
      name: name.to_string(),
      image: format!("{name}:latest"),
      image_id: image_id.to_string(),
      state,
      status_text: String::from("Up"),
      restart_count: 0,
      cpu_percent: cpu,
      memory_usage: cpu.map(|_| 1024),
      memory_limit: cpu.map(|_| 4096),
      memory_percent: cpu.map(|_| 25.0),
      scanned_at,
      ..Default::default()
    }
  }
}

#[cfg(test)]
mod tests {
  use census_client::entities::container::ContainerState;

  use super::test_support::*;
  use crate::test_client;

  #[tokio::test]
  async fn latest_per_host_returns_only_newest_scan() {
    let db = test_client().await;
    let host = seed_host(&db, "a").await;
    db.append_snapshots(&[
      snapshot(
        host,
        "web",
        ContainerState::Running,
        "sha256:aaa",
        Some(10.0),
        ts(0, 0),
      ),
      snapshot(
        host,
        "db",
        ContainerState::Running,
        "sha256:bbb",
        Some(5.0),
        ts(0, 0),
      ),
    ])
    .await
    .unwrap();
    // Second scan: db is gone.
    db.append_snapshots(&[snapshot(
      host,
      "web",
      ContainerState::Running,
      "sha256:aaa",
      Some(12.0),
      ts(0, 5),
    )])
    .await
    .unwrap();

    let latest = db.latest_for_host(host).await.unwrap();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].name, "web");
    assert_eq!(latest[0].cpu_percent, Some(12.0));
  }

  #[tokio::test]
  async fn append_only_rows_are_never_rewritten() {
    let db = test_client().await;
    let host = seed_host(&db, "a").await;
    let first = snapshot(
      host,
      "web",
      ContainerState::Running,
      "sha256:aaa",
      Some(10.0),
      ts(0, 0),
    );
    db.append_snapshots(&[first.clone()]).await.unwrap();

    // A conflicting write for the same (container, host, scan moment)
    // is ignored, not applied.
    let mut conflicting = first.clone();
    conflicting.cpu_percent = Some(99.0);
    db.append_snapshots(&[conflicting]).await.unwrap();

    for minute in 1_i64..4 {
      db.append_snapshots(&[snapshot(
        host,
        "web",
        ContainerState::Running,
        "sha256:aaa",
        Some(10.0 + minute as f64),
        ts(0, minute),
      )])
      .await
      .unwrap();
      let history =
        db.history(ts(0, 0), ts(1, 0), None).await.unwrap();
      // Strictly growing, never rewritten.
      assert_eq!(history.len(), minute as usize + 1);
      assert_eq!(history[0].cpu_percent, Some(10.0));
    }
  }

  #[tokio::test]
  async fn previous_snapshots_picks_newest_before_cutoff() {
    let db = test_client().await;
    let host = seed_host(&db, "a").await;
    for minute in [0, 5, 10] {
      db.append_snapshots(&[snapshot(
        host,
        "web",
        ContainerState::Running,
        "sha256:aaa",
        None,
        ts(0, minute),
      )])
      .await
      .unwrap();
    }
    let previous =
      db.previous_snapshots(host, ts(0, 10)).await.unwrap();
    assert_eq!(previous.len(), 1);
    assert_eq!(previous[0].scanned_at, ts(0, 5));
  }
}

use anyhow::Context;
use census_client::entities::{
  container::ContainerSnapshot, format_timestamp,
  host::HostStatus, parse_timestamp, scan::ScanResult,
};
use chrono::{DateTime, Utc};

use crate::{Client, snapshots::insert_snapshot};

#[derive(sqlx::FromRow)]
struct ScanResultRow {
  id: i64,
  host_id: i64,
  started_at: String,
  completed_at: String,
  success: bool,
  error: Option<String>,
  containers_found: i64,
}

impl TryFrom<ScanResultRow> for ScanResult {
  type Error = anyhow::Error;

  fn try_from(row: ScanResultRow) -> anyhow::Result<ScanResult> {
    Ok(ScanResult {
      id: row.id,
      host_id: row.host_id,
      started_at: parse_timestamp(&row.started_at)?,
      completed_at: parse_timestamp(&row.completed_at)?,
      success: row.success,
      error: row.error,
      containers_found: row.containers_found,
    })
  }
}

impl Client {
  /// Persist one successful host scan: every snapshot of the cycle
  /// (all sharing the scan start instant), the scan result, and the
  /// host status flip, in a single transaction.
  pub async fn record_scan_success(
    &self,
    host_id: i64,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
    snapshots: &[ContainerSnapshot],
  ) -> anyhow::Result<ScanResult> {
    let mut tx = self
      .pool
      .begin()
      .await
      .context("Failed to begin scan transaction")?;

    for snapshot in snapshots {
      insert_snapshot(&mut tx, snapshot).await?;
    }

    let id = sqlx::query(
      "INSERT INTO scan_results (host_id, started_at, completed_at, success, containers_found)
       VALUES (?, ?, ?, 1, ?)",
    )
    .bind(host_id)
    .bind(format_timestamp(&started_at))
    .bind(format_timestamp(&completed_at))
    .bind(snapshots.len() as i64)
    .execute(&mut *tx)
    .await
    .context("Failed to insert scan result")?
    .last_insert_rowid();

    sqlx::query(
      "UPDATE hosts SET status = ?, last_seen = ?, updated_at = ? WHERE id = ?",
    )
    .bind(HostStatus::Online.to_string())
    .bind(format_timestamp(&completed_at))
    .bind(format_timestamp(&completed_at))
    .bind(host_id)
    .execute(&mut *tx)
    .await
    .context("Failed to update host status")?;

    tx.commit()
      .await
      .context("Failed to commit scan transaction")?;

    self.get_scan_result(id).await
  }

  /// Persist a failed host scan. No snapshots are written.
  pub async fn record_scan_failure(
    &self,
    host_id: i64,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
    error: &str,
    status: HostStatus,
  ) -> anyhow::Result<ScanResult> {
    let mut tx = self
      .pool
      .begin()
      .await
      .context("Failed to begin scan transaction")?;

    let id = sqlx::query(
      "INSERT INTO scan_results (host_id, started_at, completed_at, success, error, containers_found)
       VALUES (?, ?, ?, 0, ?, 0)",
    )
    .bind(host_id)
    .bind(format_timestamp(&started_at))
    .bind(format_timestamp(&completed_at))
    .bind(error)
    .execute(&mut *tx)
    .await
    .context("Failed to insert scan result")?
    .last_insert_rowid();

    sqlx::query(
      "UPDATE hosts SET status = ?, updated_at = ? WHERE id = ?",
    )
    .bind(status.to_string())
    .bind(format_timestamp(&completed_at))
    .bind(host_id)
    .execute(&mut *tx)
    .await
    .context("Failed to update host status")?;

    tx.commit()
      .await
      .context("Failed to commit scan transaction")?;

    self.get_scan_result(id).await
  }

  async fn get_scan_result(
    &self,
    id: i64,
  ) -> anyhow::Result<ScanResult> {
    sqlx::query_as::<_, ScanResultRow>(
      "SELECT id, host_id, started_at, completed_at, success, error, containers_found
       FROM scan_results WHERE id = ?",
    )
    .bind(id)
    .fetch_one(&self.pool)
    .await
    .context("Failed to read back scan result")?
    .try_into()
  }

  pub async fn list_scan_results(
    &self,
    limit: i64,
  ) -> anyhow::Result<Vec<ScanResult>> {
    let rows = sqlx::query_as::<_, ScanResultRow>(
      "SELECT id, host_id, started_at, completed_at, success, error, containers_found
       FROM scan_results ORDER BY started_at DESC, id DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(&self.pool)
    .await
    .context("Failed to list scan results")?;
    rows.into_iter().map(ScanResult::try_from).collect()
  }

  /// The most recent successful scan of a host strictly before
  /// `before`. Drives the disappearance boundary check.
  pub async fn previous_successful_scan(
    &self,
    host_id: i64,
    before: DateTime<Utc>,
  ) -> anyhow::Result<Option<ScanResult>> {
    let row = sqlx::query_as::<_, ScanResultRow>(
      "SELECT id, host_id, started_at, completed_at, success, error, containers_found
       FROM scan_results
       WHERE host_id = ? AND success = 1 AND started_at < ?
       ORDER BY started_at DESC LIMIT 1",
    )
    .bind(host_id)
    .bind(format_timestamp(&before))
    .fetch_optional(&self.pool)
    .await
    .context("Failed to query previous scan")?;
    row.map(ScanResult::try_from).transpose()
  }
}

#[cfg(test)]
mod tests {
  use census_client::entities::container::ContainerState;

  use crate::{snapshots::test_support::*, test_client};

  #[tokio::test]
  async fn success_writes_snapshots_and_result_atomically() {
    let db = test_client().await;
    let host = seed_host(&db, "a").await;
    let result = db
      .record_scan_success(
        host,
        ts(0, 0),
        ts(0, 1),
        &[snapshot(
          host,
          "web",
          ContainerState::Running,
          "sha256:aaa",
          None,
          ts(0, 0),
        )],
      )
      .await
      .unwrap();
    assert!(result.success);
    assert_eq!(result.containers_found, 1);

    let host = db.get_host(host).await.unwrap();
    assert_eq!(
      host.status,
      census_client::entities::host::HostStatus::Online
    );
    assert!(host.last_seen.is_some());
  }

  #[tokio::test]
  async fn failure_records_error_without_snapshots() {
    let db = test_client().await;
    let host = seed_host(&db, "a").await;
    let result = db
      .record_scan_failure(
        host,
        ts(0, 0),
        ts(0, 1),
        "scan timed out after 30s",
        census_client::entities::host::HostStatus::Offline,
      )
      .await
      .unwrap();
    assert!(!result.success);
    assert_eq!(
      result.error.as_deref(),
      Some("scan timed out after 30s")
    );
    assert!(db.latest_for_host(host).await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn previous_successful_scan_skips_failures() {
    let db = test_client().await;
    let host = seed_host(&db, "a").await;
    db.record_scan_success(host, ts(0, 0), ts(0, 1), &[])
      .await
      .unwrap();
    db.record_scan_failure(
      host,
      ts(0, 10),
      ts(0, 11),
      "boom",
      census_client::entities::host::HostStatus::Offline,
    )
    .await
    .unwrap();
    let previous = db
      .previous_successful_scan(host, ts(0, 20))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(previous.started_at, ts(0, 0));
  }
}

use anyhow::Context;
use census_client::entities::{
  baseline::{ThresholdKind, ThresholdState},
  format_timestamp, parse_timestamp,
};
use chrono::{DateTime, Utc};

use crate::Client;

#[derive(sqlx::FromRow)]
struct ThresholdRow {
  container_id: String,
  host_id: i64,
  threshold_kind: String,
  breached_since: String,
  last_notified_at: Option<String>,
  breach_count: i64,
}

impl TryFrom<ThresholdRow> for ThresholdState {
  type Error = anyhow::Error;

  fn try_from(row: ThresholdRow) -> anyhow::Result<ThresholdState> {
    Ok(ThresholdState {
      container_id: row.container_id,
      host_id: row.host_id,
      threshold_kind: row
        .threshold_kind
        .parse()
        .unwrap_or(ThresholdKind::Cpu),
      breached_since: parse_timestamp(&row.breached_since)?,
      last_notified_at: row
        .last_notified_at
        .as_deref()
        .map(parse_timestamp)
        .transpose()?,
      breach_count: row.breach_count,
    })
  }
}

impl Client {
  /// Record one breaching sample. Inserts a fresh row with
  /// `breached_since = now`, or bumps the count on an existing one —
  /// `breached_since` is never moved while the breach persists, which
  /// is what makes sustained-duration checks work across restarts.
  pub async fn record_threshold_breach(
    &self,
    container_id: &str,
    host_id: i64,
    kind: ThresholdKind,
    now: DateTime<Utc>,
  ) -> anyhow::Result<ThresholdState> {
    sqlx::query(
      "INSERT INTO threshold_states (container_id, host_id, threshold_kind, breached_since, breach_count)
       VALUES (?, ?, ?, ?, 1)
       ON CONFLICT (container_id, host_id, threshold_kind)
       DO UPDATE SET breach_count = breach_count + 1",
    )
    .bind(container_id)
    .bind(host_id)
    .bind(kind.to_string())
    .bind(format_timestamp(&now))
    .execute(&self.pool)
    .await
    .context("Failed to record threshold breach")?;

    self
      .get_threshold_state(container_id, host_id, kind)
      .await?
      .context("Threshold state missing after upsert")
  }

  pub async fn get_threshold_state(
    &self,
    container_id: &str,
    host_id: i64,
    kind: ThresholdKind,
  ) -> anyhow::Result<Option<ThresholdState>> {
    let row = sqlx::query_as::<_, ThresholdRow>(
      "SELECT container_id, host_id, threshold_kind, breached_since, last_notified_at, breach_count
       FROM threshold_states
       WHERE container_id = ? AND host_id = ? AND threshold_kind = ?",
    )
    .bind(container_id)
    .bind(host_id)
    .bind(kind.to_string())
    .fetch_optional(&self.pool)
    .await
    .context("Failed to query threshold state")?;
    row.map(ThresholdState::try_from).transpose()
  }

  pub async fn set_threshold_notified(
    &self,
    container_id: &str,
    host_id: i64,
    kind: ThresholdKind,
    now: DateTime<Utc>,
  ) -> anyhow::Result<()> {
    sqlx::query(
      "UPDATE threshold_states SET last_notified_at = ?
       WHERE container_id = ? AND host_id = ? AND threshold_kind = ?",
    )
    .bind(format_timestamp(&now))
    .bind(container_id)
    .bind(host_id)
    .bind(kind.to_string())
    .execute(&self.pool)
    .await
    .context("Failed to update threshold state")?;
    Ok(())
  }

  /// A non-breaching sample ends the breach. The next breach starts a
  /// full new duration (hysteresis).
  pub async fn clear_threshold_state(
    &self,
    container_id: &str,
    host_id: i64,
    kind: ThresholdKind,
  ) -> anyhow::Result<()> {
    sqlx::query(
      "DELETE FROM threshold_states
       WHERE container_id = ? AND host_id = ? AND threshold_kind = ?",
    )
    .bind(container_id)
    .bind(host_id)
    .bind(kind.to_string())
    .execute(&self.pool)
    .await
    .context("Failed to clear threshold state")?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use chrono::{Duration, TimeZone, Utc};

  use super::*;
  use crate::{snapshots::test_support::seed_host, test_client};

  #[tokio::test]
  async fn breached_since_is_stable_across_samples() {
    let db = test_client().await;
    let host = seed_host(&db, "a").await;
    let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();

    let first = db
      .record_threshold_breach("cid", host, ThresholdKind::Cpu, t0)
      .await
      .unwrap();
    assert_eq!(first.breached_since, t0);
    assert_eq!(first.breach_count, 1);

    let second = db
      .record_threshold_breach(
        "cid",
        host,
        ThresholdKind::Cpu,
        t0 + Duration::seconds(60),
      )
      .await
      .unwrap();
    assert_eq!(second.breached_since, t0);
    assert_eq!(second.breach_count, 2);
  }

  #[tokio::test]
  async fn clear_resets_the_duration() {
    let db = test_client().await;
    let host = seed_host(&db, "a").await;
    let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();

    db.record_threshold_breach("cid", host, ThresholdKind::Cpu, t0)
      .await
      .unwrap();
    db.clear_threshold_state("cid", host, ThresholdKind::Cpu)
      .await
      .unwrap();
    assert!(
      db.get_threshold_state("cid", host, ThresholdKind::Cpu)
        .await
        .unwrap()
        .is_none()
    );

    let rebreach = t0 + Duration::seconds(800);
    let state = db
      .record_threshold_breach(
        "cid",
        host,
        ThresholdKind::Cpu,
        rebreach,
      )
      .await
      .unwrap();
    assert_eq!(state.breached_since, rebreach);
    assert_eq!(state.breach_count, 1);
  }

  #[tokio::test]
  async fn kinds_are_tracked_independently() {
    let db = test_client().await;
    let host = seed_host(&db, "a").await;
    let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
    db.record_threshold_breach("cid", host, ThresholdKind::Cpu, t0)
      .await
      .unwrap();
    assert!(
      db.get_threshold_state("cid", host, ThresholdKind::Memory)
        .await
        .unwrap()
        .is_none()
    );
  }
}

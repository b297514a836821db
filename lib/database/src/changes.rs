use std::collections::HashSet;

use anyhow::Context;
use census_client::entities::{
  container::ContainerState,
  format_timestamp,
  lifecycle::{
    ActivityEntry, ChangeEntry, ChangesReport, ImageUpdateEntry,
    StateChangeEntry,
  },
  parse_timestamp,
};
use chrono::{DateTime, Utc};

use crate::Client;

const TOP_ACTIVITY_LIMIT: i64 = 10;

#[derive(sqlx::FromRow)]
struct BoundaryRow {
  name: String,
  host_id: i64,
  at: String,
  image: String,
}

#[derive(sqlx::FromRow)]
struct TransitionRow {
  name: String,
  host_id: i64,
  scanned_at: String,
  new_value: String,
  old_value: String,
}

#[derive(sqlx::FromRow)]
struct ImageTransitionRow {
  name: String,
  host_id: i64,
  scanned_at: String,
  image: String,
  image_id: String,
  prev_image: String,
  prev_image_id: String,
}

impl Client {
  /// Five window-function groupings over [start, end]: new containers,
  /// removed containers, image updates, state changes, and the most
  /// active containers by transition count. A container in both the
  /// new and removed sets is marked transient.
  pub async fn changes_report(
    &self,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    host_id: Option<i64>,
  ) -> anyhow::Result<ChangesReport> {
    let start_raw = format_timestamp(&start);
    let end_raw = format_timestamp(&end);

    // Earliest snapshot per (name, host) falls inside the interval.
    let new_rows = sqlx::query_as::<_, BoundaryRow>(
      "SELECT s.name, s.host_id, MIN(s.scanned_at) AS at,
         (SELECT image FROM container_snapshots c
          WHERE c.host_id = s.host_id AND c.name = s.name
          ORDER BY c.scanned_at LIMIT 1) AS image
       FROM container_snapshots s
       WHERE (?3 IS NULL OR s.host_id = ?3)
       GROUP BY s.host_id, s.name
       HAVING at >= ?1 AND at <= ?2
       ORDER BY at",
    )
    .bind(&start_raw)
    .bind(&end_raw)
    .bind(host_id)
    .fetch_all(&self.pool)
    .await
    .context("Failed to query new containers")?;

    // Latest snapshot falls inside the interval and the host has
    // scanned since, so the absence is real rather than the host
    // simply not having been scanned yet.
    let removed_rows = sqlx::query_as::<_, BoundaryRow>(
      "SELECT s.name, s.host_id, MAX(s.scanned_at) AS at,
         (SELECT image FROM container_snapshots c
          WHERE c.host_id = s.host_id AND c.name = s.name
          ORDER BY c.scanned_at DESC LIMIT 1) AS image
       FROM container_snapshots s
       WHERE (?3 IS NULL OR s.host_id = ?3)
       GROUP BY s.host_id, s.name
       HAVING at >= ?1 AND at < ?2
         AND at < (SELECT MAX(scanned_at) FROM container_snapshots x
                   WHERE x.host_id = s.host_id)
       ORDER BY at",
    )
    .bind(&start_raw)
    .bind(&end_raw)
    .bind(host_id)
    .fetch_all(&self.pool)
    .await
    .context("Failed to query removed containers")?;

    let image_rows = sqlx::query_as::<_, ImageTransitionRow>(
      "SELECT name, host_id, scanned_at, image, image_id,
              prev_image, prev_image_id
       FROM (
         SELECT name, host_id, scanned_at, image, image_id,
           LAG(image) OVER w AS prev_image,
           LAG(image_id) OVER w AS prev_image_id
         FROM container_snapshots
         WHERE (?3 IS NULL OR host_id = ?3)
         WINDOW w AS (PARTITION BY host_id, name ORDER BY scanned_at)
       )
       WHERE prev_image_id IS NOT NULL
         AND image_id != prev_image_id
         AND scanned_at >= ?1 AND scanned_at <= ?2
       ORDER BY scanned_at",
    )
    .bind(&start_raw)
    .bind(&end_raw)
    .bind(host_id)
    .fetch_all(&self.pool)
    .await
    .context("Failed to query image updates")?;

    let state_rows = sqlx::query_as::<_, TransitionRow>(
      "SELECT name, host_id, scanned_at,
              state AS new_value, prev_state AS old_value
       FROM (
         SELECT name, host_id, scanned_at, state,
           LAG(state) OVER w AS prev_state
         FROM container_snapshots
         WHERE (?3 IS NULL OR host_id = ?3)
         WINDOW w AS (PARTITION BY host_id, name ORDER BY scanned_at)
       )
       WHERE prev_state IS NOT NULL
         AND state != prev_state
         AND scanned_at >= ?1 AND scanned_at <= ?2
       ORDER BY scanned_at",
    )
    .bind(&start_raw)
    .bind(&end_raw)
    .bind(host_id)
    .fetch_all(&self.pool)
    .await
    .context("Failed to query state changes")?;

    let activity_rows = sqlx::query_as::<_, (String, i64, i64)>(
      "SELECT name, host_id, COUNT(*) AS transitions
       FROM (
         SELECT name, host_id, scanned_at, state,
           LAG(state) OVER w AS prev_state
         FROM container_snapshots
         WHERE (?3 IS NULL OR host_id = ?3)
         WINDOW w AS (PARTITION BY host_id, name ORDER BY scanned_at)
       )
       WHERE prev_state IS NOT NULL
         AND state != prev_state
         AND scanned_at >= ?1 AND scanned_at <= ?2
       GROUP BY host_id, name
       ORDER BY transitions DESC, name
       LIMIT ?4",
    )
    .bind(&start_raw)
    .bind(&end_raw)
    .bind(host_id)
    .bind(TOP_ACTIVITY_LIMIT)
    .fetch_all(&self.pool)
    .await
    .context("Failed to query top activity")?;

    let new_keys: HashSet<(String, i64)> = new_rows
      .iter()
      .map(|row| (row.name.clone(), row.host_id))
      .collect();
    let removed_keys: HashSet<(String, i64)> = removed_rows
      .iter()
      .map(|row| (row.name.clone(), row.host_id))
      .collect();

    let into_entry = |row: BoundaryRow,
                      other: &HashSet<(String, i64)>|
     -> anyhow::Result<ChangeEntry> {
      let transient =
        other.contains(&(row.name.clone(), row.host_id));
      Ok(ChangeEntry {
        timestamp: parse_timestamp(&row.at)?,
        container_name: row.name,
        host_id: row.host_id,
        image: row.image,
        transient,
      })
    };

    Ok(ChangesReport {
      start,
      end,
      new_containers: new_rows
        .into_iter()
        .map(|row| into_entry(row, &removed_keys))
        .collect::<anyhow::Result<_>>()?,
      removed_containers: removed_rows
        .into_iter()
        .map(|row| into_entry(row, &new_keys))
        .collect::<anyhow::Result<_>>()?,
      image_updates: image_rows
        .into_iter()
        .map(|row| {
          Ok(ImageUpdateEntry {
            timestamp: parse_timestamp(&row.scanned_at)?,
            container_name: row.name,
            host_id: row.host_id,
            old_image: row.prev_image,
            new_image: row.image,
            old_image_id: row.prev_image_id,
            new_image_id: row.image_id,
          })
        })
        .collect::<anyhow::Result<_>>()?,
      state_changes: state_rows
        .into_iter()
        .map(|row| {
          Ok(StateChangeEntry {
            timestamp: parse_timestamp(&row.scanned_at)?,
            container_name: row.name,
            host_id: row.host_id,
            old_state: ContainerState::from_docker(&row.old_value),
            new_state: ContainerState::from_docker(&row.new_value),
          })
        })
        .collect::<anyhow::Result<_>>()?,
      top_activity: activity_rows
        .into_iter()
        .map(|(name, host_id, transitions)| ActivityEntry {
          container_name: name,
          host_id,
          transitions,
        })
        .collect(),
    })
  }
}

#[cfg(test)]
mod tests {
  use census_client::entities::container::ContainerState;

  use crate::{snapshots::test_support::*, test_client};

  #[tokio::test]
  async fn transient_container_lands_in_both_sets() {
    let db = test_client().await;
    let host = seed_host(&db, "a").await;

    // Steady container spanning the whole interval.
    for hour in 0..12 {
      db.append_snapshots(&[snapshot(
        host,
        "steady",
        ContainerState::Running,
        "sha256:aaa",
        None,
        ts(hour, 0),
      )])
      .await
      .unwrap();
    }
    // svc appears at start+1h, disappears well before end.
    for hour in [1, 2, 3] {
      db.append_snapshots(&[snapshot(
        host,
        "svc",
        ContainerState::Running,
        "sha256:bbb",
        None,
        ts(hour, 0),
      )])
      .await
      .unwrap();
    }

    let report = db
      .changes_report(ts(0, 30), ts(11, 30), None)
      .await
      .unwrap();

    let new_names: Vec<_> = report
      .new_containers
      .iter()
      .map(|entry| entry.container_name.as_str())
      .collect();
    assert_eq!(new_names, vec!["svc"]);
    assert!(report.new_containers[0].transient);

    let removed_names: Vec<_> = report
      .removed_containers
      .iter()
      .map(|entry| entry.container_name.as_str())
      .collect();
    assert_eq!(removed_names, vec!["svc"]);
    assert!(report.removed_containers[0].transient);
  }

  #[tokio::test]
  async fn image_and_state_transitions_by_name_within_interval() {
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
    // Image update outside the queried interval.
    db.append_snapshots(&[snapshot(
      host,
      "web",
      ContainerState::Running,
      "sha256:bbb",
      None,
      ts(1, 0),
    )])
    .await
    .unwrap();
    // State flap and image update inside the interval.
    db.append_snapshots(&[snapshot(
      host,
      "web",
      ContainerState::Exited,
      "sha256:bbb",
      None,
      ts(3, 0),
    )])
    .await
    .unwrap();
    db.append_snapshots(&[snapshot(
      host,
      "web",
      ContainerState::Running,
      "sha256:ccc",
      None,
      ts(4, 0),
    )])
    .await
    .unwrap();

    let report =
      db.changes_report(ts(2, 0), ts(5, 0), None).await.unwrap();

    assert_eq!(report.image_updates.len(), 1);
    assert_eq!(report.image_updates[0].old_image_id, "sha256:bbb");
    assert_eq!(report.image_updates[0].new_image_id, "sha256:ccc");

    assert_eq!(report.state_changes.len(), 2);
    assert_eq!(report.top_activity.len(), 1);
    assert_eq!(report.top_activity[0].transitions, 2);
  }

  #[tokio::test]
  async fn host_filter_restricts_report() {
    let db = test_client().await;
    let host_a = seed_host(&db, "a").await;
    let host_b = seed_host(&db, "b").await;
    for (host, name) in [(host_a, "one"), (host_b, "two")] {
      db.append_snapshots(&[snapshot(
        host,
        name,
        ContainerState::Running,
        "sha256:aaa",
        None,
        ts(1, 0),
      )])
      .await
      .unwrap();
    }
    let report = db
      .changes_report(ts(0, 0), ts(2, 0), Some(host_b))
      .await
      .unwrap();
    assert_eq!(report.new_containers.len(), 1);
    assert_eq!(report.new_containers[0].container_name, "two");
  }
}

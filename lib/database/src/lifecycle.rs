use anyhow::Context;
use census_client::entities::{
  container::{ContainerSnapshot, ContainerState},
  lifecycle::{LifecycleEvent, LifecycleEventKind, LifecycleSummary},
  parse_timestamp,
};
use chrono::{DateTime, Duration, Utc};

use crate::Client;

/// A gap between consecutive snapshots longer than this reads as the
/// container disappearing and reappearing. Chosen well above the scan
/// interval so missed scans do not produce false positives.
pub const GAP_HOURS: i64 = 2;

/// The slice of a snapshot the derivation needs.
#[derive(Debug, Clone)]
pub struct TimelinePoint {
  pub scanned_at: DateTime<Utc>,
  pub state: ContainerState,
  pub image: String,
  pub image_id: String,
}

impl From<&ContainerSnapshot> for TimelinePoint {
  fn from(snapshot: &ContainerSnapshot) -> TimelinePoint {
    TimelinePoint {
      scanned_at: snapshot.scanned_at,
      state: snapshot.state,
      image: snapshot.image.clone(),
      image_id: snapshot.image_id.clone(),
    }
  }
}

fn short_digest(image_id: &str) -> String {
  let id = image_id.strip_prefix("sha256:").unwrap_or(image_id);
  id.chars().take(12).collect()
}

fn transition_kind(
  old: ContainerState,
  new: ContainerState,
) -> LifecycleEventKind {
  use ContainerState::*;
  match (old, new) {
    (Paused, Running) => LifecycleEventKind::Resumed,
    (_, Running) => LifecycleEventKind::Started,
    (_, Paused) => LifecycleEventKind::Paused,
    (_, Exited) | (_, Dead) => LifecycleEventKind::Stopped,
    _ => LifecycleEventKind::StateChange,
  }
}

fn event(
  container_name: &str,
  host_id: i64,
  kind: LifecycleEventKind,
  timestamp: DateTime<Utc>,
  description: String,
) -> LifecycleEvent {
  LifecycleEvent {
    timestamp,
    container_name: container_name.to_string(),
    host_id,
    kind,
    old_state: None,
    new_state: None,
    old_image: None,
    new_image: None,
    old_image_id: None,
    new_image_id: None,
    description,
  }
}

/// Reconstruct the event timeline of one (container name, host) from
/// its snapshot rows in time order. Deterministic given an ordered
/// sequence; tolerant of collapsed duplicate middle rows.
pub fn derive_lifecycle_events(
  container_name: &str,
  host_id: i64,
  points: &[TimelinePoint],
) -> Vec<LifecycleEvent> {
  let Some(first) = points.first() else {
    return Vec::new();
  };

  let mut events = Vec::new();

  let mut first_seen = event(
    container_name,
    host_id,
    LifecycleEventKind::FirstSeen,
    first.scanned_at,
    format!(
      "First observed {} with image {}",
      first.state, first.image
    ),
  );
  first_seen.new_state = Some(first.state);
  first_seen.new_image = Some(first.image.clone());
  first_seen.new_image_id = Some(first.image_id.clone());
  events.push(first_seen);

  for pair in points.windows(2) {
    let (prev, curr) = (&pair[0], &pair[1]);

    if curr.scanned_at - prev.scanned_at
      > Duration::hours(GAP_HOURS)
    {
      let mut disappeared = event(
        container_name,
        host_id,
        LifecycleEventKind::Disappeared,
        prev.scanned_at,
        format!(
          "Not observed for over {GAP_HOURS} hours after this scan"
        ),
      );
      disappeared.old_state = Some(prev.state);
      events.push(disappeared);

      let mut reappeared = event(
        container_name,
        host_id,
        LifecycleEventKind::Reappeared,
        curr.scanned_at,
        String::from("Observed again after an extended absence"),
      );
      reappeared.new_state = Some(curr.state);
      events.push(reappeared);
    }

    if curr.state != prev.state {
      let kind = transition_kind(prev.state, curr.state);
      let mut change = event(
        container_name,
        host_id,
        kind,
        curr.scanned_at,
        format!("State changed {} -> {}", prev.state, curr.state),
      );
      change.old_state = Some(prev.state);
      change.new_state = Some(curr.state);
      events.push(change);
    }

    if curr.image_id != prev.image_id {
      let mut update = event(
        container_name,
        host_id,
        LifecycleEventKind::ImageUpdated,
        curr.scanned_at,
        format!(
          "Image updated {} ({}) -> {} ({})",
          prev.image,
          short_digest(&prev.image_id),
          curr.image,
          short_digest(&curr.image_id),
        ),
      );
      update.old_image = Some(prev.image.clone());
      update.new_image = Some(curr.image.clone());
      update.old_image_id = Some(prev.image_id.clone());
      update.new_image_id = Some(curr.image_id.clone());
      events.push(update);
    }
  }

  let last = points.last().unwrap_or(first);
  let mut last_seen = event(
    container_name,
    host_id,
    LifecycleEventKind::LastSeen,
    last.scanned_at,
    format!(
      "Most recently observed {} ({} observations)",
      last.state,
      points.len()
    ),
  );
  last_seen.new_state = Some(last.state);
  events.push(last_seen);

  events
}

#[derive(sqlx::FromRow)]
struct TimelineRow {
  scanned_at: String,
  state: String,
  image: String,
  image_id: String,
}

#[derive(sqlx::FromRow)]
struct SummaryRow {
  name: String,
  host_id: i64,
  host_name: String,
  first_seen: String,
  last_seen: String,
  snapshot_count: i64,
  state_changes: i64,
  current_state: String,
  current_image: String,
}

impl Client {
  /// Event timeline for one (container name, host).
  pub async fn lifecycle_events(
    &self,
    container_name: &str,
    host_id: i64,
  ) -> anyhow::Result<Vec<LifecycleEvent>> {
    let rows = sqlx::query_as::<_, TimelineRow>(
      "SELECT scanned_at, state, image, image_id
       FROM container_snapshots
       WHERE name = ? AND host_id = ?
       ORDER BY scanned_at",
    )
    .bind(container_name)
    .bind(host_id)
    .fetch_all(&self.pool)
    .await
    .context("Failed to query container timeline")?;

    let points = rows
      .into_iter()
      .map(|row| {
        Ok(TimelinePoint {
          scanned_at: parse_timestamp(&row.scanned_at)?,
          state: ContainerState::from_docker(&row.state),
          image: row.image,
          image_id: row.image_id,
        })
      })
      .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(derive_lifecycle_events(container_name, host_id, &points))
  }

  /// Per-container rollups, most recently seen first.
  pub async fn lifecycle_summaries(
    &self,
    limit: i64,
    host_id: Option<i64>,
  ) -> anyhow::Result<Vec<LifecycleSummary>> {
    let rows = sqlx::query_as::<_, SummaryRow>(
      "SELECT t.name, t.host_id, h.name AS host_name,
         MIN(t.scanned_at) AS first_seen,
         MAX(t.scanned_at) AS last_seen,
         COUNT(*) AS snapshot_count,
         SUM(t.changed) AS state_changes,
         MAX(CASE WHEN t.rn = 1 THEN t.state END) AS current_state,
         MAX(CASE WHEN t.rn = 1 THEN t.image END) AS current_image
       FROM (
         SELECT name, host_id, scanned_at, state, image,
           CASE
             WHEN LAG(state) OVER w IS NOT NULL
              AND state != LAG(state) OVER w
             THEN 1 ELSE 0
           END AS changed,
           ROW_NUMBER() OVER (
             PARTITION BY host_id, name ORDER BY scanned_at DESC
           ) AS rn
         FROM container_snapshots
         WHERE (?1 IS NULL OR host_id = ?1)
         WINDOW w AS (PARTITION BY host_id, name ORDER BY scanned_at)
       ) t
       JOIN hosts h ON h.id = t.host_id
       GROUP BY t.host_id, t.name, h.name
       ORDER BY last_seen DESC
       LIMIT ?2",
    )
    .bind(host_id)
    .bind(limit)
    .fetch_all(&self.pool)
    .await
    .context("Failed to query lifecycle summaries")?;

    rows
      .into_iter()
      .map(|row| {
        Ok(LifecycleSummary {
          container_name: row.name,
          host_id: row.host_id,
          host_name: row.host_name,
          first_seen: parse_timestamp(&row.first_seen)?,
          last_seen: parse_timestamp(&row.last_seen)?,
          current_state: ContainerState::from_docker(
            &row.current_state,
          ),
          current_image: row.current_image,
          snapshot_count: row.snapshot_count,
          state_changes: row.state_changes,
        })
      })
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use census_client::entities::container::ContainerState;
  use chrono::{TimeZone, Utc};

  use super::*;
  use crate::{snapshots::test_support, test_client};

  fn at(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
      + Duration::minutes(minutes)
  }

  fn point(
    minutes: i64,
    state: ContainerState,
    image_id: &str,
  ) -> TimelinePoint {
    TimelinePoint {
      scanned_at: at(minutes),
      state,
      image: String::from("nginx:1.24"),
      image_id: image_id.to_string(),
    }
  }

  #[test]
  fn empty_timeline_is_empty() {
    assert!(derive_lifecycle_events("web", 1, &[]).is_empty());
  }

  #[test]
  fn single_row_yields_first_and_last_seen() {
    let events = derive_lifecycle_events(
      "web",
      1,
      &[point(0, ContainerState::Running, "a")],
    );
    let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
      kinds,
      vec![
        LifecycleEventKind::FirstSeen,
        LifecycleEventKind::LastSeen
      ]
    );
  }

  #[test]
  fn three_hour_gap_yields_one_disappear_reappear_pair() {
    let points = [
      point(0, ContainerState::Running, "a"),
      point(60, ContainerState::Running, "a"),
      point(60 + 180, ContainerState::Running, "a"),
    ];
    let events = derive_lifecycle_events("web", 1, &points);
    let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
      kinds,
      vec![
        LifecycleEventKind::FirstSeen,
        LifecycleEventKind::Disappeared,
        LifecycleEventKind::Reappeared,
        LifecycleEventKind::LastSeen,
      ]
    );
    // Disappearance is stamped at the last sighting.
    assert_eq!(events[1].timestamp, at(60));
    assert_eq!(events[2].timestamp, at(240));
  }

  #[test]
  fn thirty_minute_gap_yields_nothing() {
    let points = [
      point(0, ContainerState::Running, "a"),
      point(30, ContainerState::Running, "a"),
    ];
    let events = derive_lifecycle_events("web", 1, &points);
    assert!(
      events
        .iter()
        .all(|e| e.kind != LifecycleEventKind::Disappeared
          && e.kind != LifecycleEventKind::Reappeared)
    );
  }

  #[test]
  fn state_transitions_get_refined_kinds() {
    let points = [
      point(0, ContainerState::Running, "a"),
      point(10, ContainerState::Paused, "a"),
      point(20, ContainerState::Running, "a"),
      point(30, ContainerState::Exited, "a"),
      point(40, ContainerState::Running, "a"),
    ];
    let events = derive_lifecycle_events("web", 1, &points);
    let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
      kinds,
      vec![
        LifecycleEventKind::FirstSeen,
        LifecycleEventKind::Paused,
        LifecycleEventKind::Resumed,
        LifecycleEventKind::Stopped,
        LifecycleEventKind::Started,
        LifecycleEventKind::LastSeen,
      ]
    );
  }

  #[test]
  fn image_update_records_both_refs_and_digests() {
    let mut updated = point(10, ContainerState::Running, "sha256:bbbbbbbbbbbbbbbb");
    updated.image = String::from("nginx:1.25");
    let points = [
      point(0, ContainerState::Running, "sha256:aaaaaaaaaaaaaaaa"),
      updated,
    ];
    let events = derive_lifecycle_events("web", 1, &points);
    let update = events
      .iter()
      .find(|e| e.kind == LifecycleEventKind::ImageUpdated)
      .unwrap();
    assert_eq!(update.old_image.as_deref(), Some("nginx:1.24"));
    assert_eq!(update.new_image.as_deref(), Some("nginx:1.25"));
    assert!(update.description.contains("aaaaaaaaaaaa"));
    assert!(update.description.contains("bbbbbbbbbbbb"));
  }

  #[tokio::test]
  async fn summaries_count_changes_and_pick_latest_state() {
    let db = test_client().await;
    let host = test_support::seed_host(&db, "a").await;
    let timeline = [
      (0, ContainerState::Running),
      (10, ContainerState::Exited),
      (20, ContainerState::Running),
    ];
    for (minute, state) in timeline {
      db.append_snapshots(&[test_support::snapshot(
        host,
        "web",
        state,
        "sha256:aaa",
        None,
        test_support::ts(0, minute),
      )])
      .await
      .unwrap();
    }
    let summaries =
      db.lifecycle_summaries(10, None).await.unwrap();
    assert_eq!(summaries.len(), 1);
    let summary = &summaries[0];
    assert_eq!(summary.container_name, "web");
    assert_eq!(summary.host_name, "a");
    assert_eq!(summary.snapshot_count, 3);
    assert_eq!(summary.state_changes, 2);
    assert_eq!(summary.current_state, ContainerState::Running);
  }
}

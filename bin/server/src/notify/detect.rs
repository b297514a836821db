use std::collections::HashMap;

use census_client::entities::{
  baseline::ThresholdKind,
  container::{ContainerSnapshot, ContainerState},
  host::Host,
  notification::{EventKind, NotificationEvent, NotificationRule},
};
use chrono::{DateTime, Duration, Utc};
use database::GAP_HOURS;

use crate::{
  notify::glob_match,
  state::{AnomalyWindow, anomaly_windows, settings},
};

fn base_event(
  host: &Host,
  snapshot: &ContainerSnapshot,
  kind: EventKind,
  message: String,
) -> NotificationEvent {
  NotificationEvent {
    kind,
    host_id: host.id,
    host_name: host.name.clone(),
    container_id: snapshot.container_id.clone(),
    container_name: snapshot.name.clone(),
    image: snapshot.image.clone(),
    image_id: snapshot.image_id.clone(),
    timestamp: snapshot.scanned_at,
    message,
    cpu_percent: None,
    memory_percent: None,
    breached_since: None,
  }
}

/// Detect every event a freshly persisted scan batch implies:
/// lifecycle diffs against the previous observation, sustained
/// threshold breaches, and anomalies against captured pre-update
/// baselines.
pub async fn detect_events(
  db: &database::Client,
  host: &Host,
  rules: &[NotificationRule],
  snapshots: &[ContainerSnapshot],
  scanned_at: DateTime<Utc>,
) -> anyhow::Result<Vec<NotificationEvent>> {
  let mut events =
    lifecycle_events(db, host, snapshots, scanned_at).await?;
  events.extend(
    threshold_events(db, host, rules, snapshots, scanned_at)
      .await?,
  );
  events
    .extend(anomaly_events(host, snapshots, scanned_at).await);
  Ok(events)
}

fn transition_event_kind(
  old: ContainerState,
  new: ContainerState,
) -> EventKind {
  use ContainerState::*;
  match (old, new) {
    (Paused, Running) => EventKind::ContainerResumed,
    (_, Running) => EventKind::ContainerStarted,
    (_, Paused) => EventKind::ContainerPaused,
    (_, Exited) | (_, Dead) => EventKind::ContainerStopped,
    _ => EventKind::StateChange,
  }
}

/// Diff the batch against each container's most recent prior snapshot
/// (same name + host). Containers present before but absent now are
/// checked against the disappearance gap policy; the event is emitted
/// exactly once, on the first scan where the gap exceeds the
/// threshold.
async fn lifecycle_events(
  db: &database::Client,
  host: &Host,
  snapshots: &[ContainerSnapshot],
  scanned_at: DateTime<Utc>,
) -> anyhow::Result<Vec<NotificationEvent>> {
  let previous = db.previous_snapshots(host.id, scanned_at).await?;
  let previous: HashMap<&str, &ContainerSnapshot> = previous
    .iter()
    .map(|snapshot| (snapshot.name.as_str(), snapshot))
    .collect();

  let mut events = Vec::new();

  for snapshot in snapshots {
    let Some(prior) = previous.get(snapshot.name.as_str()) else {
      events.push(base_event(
        host,
        snapshot,
        EventKind::NewContainer,
        format!(
          "New container {} ({}) on {}",
          snapshot.name, snapshot.image, host.name
        ),
      ));
      continue;
    };

    if snapshot.state != prior.state {
      let kind = transition_event_kind(prior.state, snapshot.state);
      events.push(base_event(
        host,
        snapshot,
        kind,
        format!(
          "{} on {}: {} -> {}",
          snapshot.name, host.name, prior.state, snapshot.state
        ),
      ));
    }

    if snapshot.image_id != prior.image_id {
      events.push(base_event(
        host,
        snapshot,
        EventKind::ImageUpdated,
        format!(
          "{} on {} updated image {} -> {}",
          snapshot.name, host.name, prior.image, snapshot.image
        ),
      ));
      capture_pre_update_baseline(db, host, prior, snapshot).await;
    }
  }

  // Disappearances among containers not in this batch.
  let current: HashMap<&str, ()> = snapshots
    .iter()
    .map(|snapshot| (snapshot.name.as_str(), ()))
    .collect();
  let gap = Duration::hours(GAP_HOURS);
  for (name, prior) in previous {
    if current.contains_key(name) {
      continue;
    }
    if scanned_at - prior.scanned_at <= gap {
      continue;
    }
    // Only fire on the scan that crosses the gap threshold; on every
    // later scan the previous successful scan was already past it.
    let already_reported = db
      .previous_successful_scan(host.id, scanned_at)
      .await?
      .is_some_and(|scan| scan.started_at - prior.scanned_at > gap);
    if already_reported {
      continue;
    }
    events.push(base_event(
      host,
      prior,
      EventKind::ContainerDisappeared,
      format!(
        "{} on {} has not been seen since {}",
        prior.name, host.name, prior.scanned_at
      ),
    ));
  }

  Ok(events)
}

/// On an image update the current baseline becomes the pre-update
/// reference for the post-update observation window. The window is
/// keyed by the new container id, since an image change normally means
/// a recreated container.
async fn capture_pre_update_baseline(
  db: &database::Client,
  host: &Host,
  prior: &ContainerSnapshot,
  current: &ContainerSnapshot,
) {
  let baseline = match db
    .get_baseline(&prior.container_id, host.id, &prior.image_id)
    .await
  {
    Ok(Some(baseline)) => baseline,
    Ok(None) => return,
    Err(e) => {
      error!(
        "Failed to capture pre-update baseline for {} | {e:#}",
        prior.name
      );
      return;
    }
  };
  debug!(
    "Captured pre-update baseline for {} ({} samples)",
    prior.name, baseline.sample_count
  );
  anomaly_windows()
    .insert(
      (current.container_id.clone(), host.id),
      AnomalyWindow {
        pre_update: baseline,
        started_at: current.scanned_at,
        breached_since: None,
      },
    )
    .await;
}

fn rule_targets_container(
  rule: &NotificationRule,
  host: &Host,
  snapshot: &ContainerSnapshot,
) -> bool {
  (rule.host_id.is_none() || rule.host_id == Some(host.id))
    && rule
      .container_pattern
      .as_deref()
      .is_none_or(|pattern| glob_match(pattern, &snapshot.name))
    && rule
      .image_pattern
      .as_deref()
      .is_none_or(|pattern| glob_match(pattern, &snapshot.image))
}

/// Threshold state machine: a breaching sample opens (or extends) the
/// persisted breach row; a non-breaching sample deletes it, so the
/// next breach starts a full new duration. One event per breached
/// kind is emitted carrying the breach start; the per-rule duration
/// check happens at match time.
async fn threshold_events(
  db: &database::Client,
  host: &Host,
  rules: &[NotificationRule],
  snapshots: &[ContainerSnapshot],
  scanned_at: DateTime<Utc>,
) -> anyhow::Result<Vec<NotificationEvent>> {
  let mut events = Vec::new();

  for snapshot in snapshots {
    if snapshot.state != ContainerState::Running {
      continue;
    }
    let measurements = [
      (
        ThresholdKind::Cpu,
        EventKind::HighCpu,
        snapshot.cpu_percent,
      ),
      (
        ThresholdKind::Memory,
        EventKind::HighMemory,
        snapshot.memory_percent,
      ),
    ];
    for (kind, event_kind, value) in measurements {
      let Some(value) = value else { continue };

      let thresholds = rules
        .iter()
        .filter(|rule| {
          rule.event_kinds.contains(&event_kind)
            && rule_targets_container(rule, host, snapshot)
        })
        .filter_map(|rule| match kind {
          ThresholdKind::Cpu => rule.cpu_threshold,
          ThresholdKind::Memory => rule.memory_threshold,
        })
        .collect::<Vec<_>>();
      let Some(min_threshold) = thresholds
        .iter()
        .copied()
        .min_by(|a, b| a.total_cmp(b))
      else {
        continue;
      };

      if value >= min_threshold {
        let state = db
          .record_threshold_breach(
            &snapshot.container_id,
            host.id,
            kind,
            scanned_at,
          )
          .await?;
        let mut event = base_event(
          host,
          snapshot,
          event_kind,
          format!(
            "{} on {}: {} at {value:.1}% (breached since {})",
            snapshot.name,
            host.name,
            match kind {
              ThresholdKind::Cpu => "cpu",
              ThresholdKind::Memory => "memory",
            },
            state.breached_since,
          ),
        );
        event.cpu_percent = snapshot.cpu_percent;
        event.memory_percent = snapshot.memory_percent;
        event.breached_since = Some(state.breached_since);
        events.push(event);
      } else {
        db.clear_threshold_state(
          &snapshot.container_id,
          host.id,
          kind,
        )
        .await?;
      }
    }
  }

  Ok(events)
}

/// While a post-update observation window is open, usage at least 25%
/// (configurable) above the captured pre-update baseline, sustained
/// for a rule's threshold duration, reads as anomalous behavior.
async fn anomaly_events(
  host: &Host,
  snapshots: &[ContainerSnapshot],
  scanned_at: DateTime<Utc>,
) -> Vec<NotificationEvent> {
  let baselines = settings().load().baselines.clone();
  let excess = 1.0 + baselines.anomaly_threshold_percent / 100.0;
  let windows = anomaly_windows();
  let mut events = Vec::new();

  for snapshot in snapshots {
    if snapshot.state != ContainerState::Running {
      continue;
    }
    let key = (snapshot.container_id.clone(), host.id);
    let Some(mut window) = windows.get(&key).await else {
      continue;
    };

    if scanned_at - window.started_at
      > Duration::hours(baselines.anomaly_window_hours)
    {
      windows.remove(&key).await;
      continue;
    }

    let cpu_breach = snapshot.cpu_percent.is_some_and(|cpu| {
      window.pre_update.avg_cpu > 0.0
        && cpu > window.pre_update.avg_cpu * excess
    });
    let memory_breach =
      snapshot.memory_percent.is_some_and(|memory| {
        window.pre_update.avg_memory_percent > 0.0
          && memory > window.pre_update.avg_memory_percent * excess
      });

    if cpu_breach || memory_breach {
      let since = window.breached_since.unwrap_or(scanned_at);
      if window.breached_since.is_none() {
        window.breached_since = Some(since);
        windows.insert(key, window.clone()).await;
      }
      let mut event = base_event(
        host,
        snapshot,
        EventKind::AnomalousBehavior,
        format!(
          "{} on {} exceeds its pre-update baseline by more than {:.0}%",
          snapshot.name,
          host.name,
          baselines.anomaly_threshold_percent,
        ),
      );
      event.cpu_percent = snapshot.cpu_percent;
      event.memory_percent = snapshot.memory_percent;
      event.breached_since = Some(since);
      events.push(event);
    } else if window.breached_since.is_some() {
      window.breached_since = None;
      windows.insert(key, window).await;
    }
  }

  events
}

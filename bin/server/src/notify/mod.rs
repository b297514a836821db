use std::collections::HashMap;

use census_client::entities::{
  baseline::ThresholdKind,
  container::ContainerSnapshot,
  host::Host,
  notification::{
    EventKind, NotificationChannel, NotificationEvent,
    NotificationRule, NotificationSilence,
  },
};
use chrono::{DateTime, Utc};
use wildcard::Wildcard;

use crate::state::db_client;

pub mod batch;
pub mod channels;
pub mod detect;

/// Shell-style glob over container / image / host names. An invalid
/// pattern degrades to a literal comparison.
pub fn glob_match(pattern: &str, value: &str) -> bool {
  match Wildcard::new(pattern.as_bytes()) {
    Ok(wildcard) => wildcard.is_match(value.as_bytes()),
    Err(_) => pattern == value,
  }
}

/// Whether a threshold / anomaly breach has lasted at least the
/// rule's required duration. Events without a breach reference pass.
fn sustained(
  rule: &NotificationRule,
  event: &NotificationEvent,
) -> bool {
  event.breached_since.is_none_or(|since| {
    (event.timestamp - since).num_seconds()
      >= rule.threshold_duration_seconds
  })
}

pub fn rule_matches(
  rule: &NotificationRule,
  event: &NotificationEvent,
) -> bool {
  if !rule.event_kinds.contains(&event.kind) {
    return false;
  }
  if rule.host_id.is_some_and(|host_id| host_id != event.host_id) {
    return false;
  }
  if let Some(pattern) = &rule.container_pattern
    && !glob_match(pattern, &event.container_name)
  {
    return false;
  }
  if let Some(pattern) = &rule.image_pattern
    && !glob_match(pattern, &event.image)
  {
    return false;
  }
  match event.kind {
    EventKind::HighCpu => {
      rule.cpu_threshold.is_some_and(|threshold| {
        event.cpu_percent.is_some_and(|cpu| cpu >= threshold)
      }) && sustained(rule, event)
    }
    EventKind::HighMemory => {
      rule.memory_threshold.is_some_and(|threshold| {
        event
          .memory_percent
          .is_some_and(|memory| memory >= threshold)
      }) && sustained(rule, event)
    }
    EventKind::AnomalousBehavior => sustained(rule, event),
    _ => true,
  }
}

/// An unexpired silence selects the event iff its container selector
/// (exact id, exact name, or glob) and its optional host selector both
/// match.
pub fn silence_matches(
  silence: &NotificationSilence,
  event: &NotificationEvent,
) -> bool {
  let host_ok = if let Some(host_id) = silence.host_id {
    host_id == event.host_id
  } else if let Some(pattern) = &silence.host_pattern {
    glob_match(pattern, &event.host_name)
  } else {
    true
  };
  if !host_ok {
    return false;
  }

  if let Some(container_id) = &silence.container_id {
    container_id == &event.container_id
  } else if let Some(container_name) = &silence.container_name {
    container_name == &event.container_name
  } else if let Some(pattern) = &silence.container_pattern {
    glob_match(pattern, &event.container_name)
  } else {
    true
  }
}

fn active_silence<'a>(
  silences: &'a [NotificationSilence],
  event: &NotificationEvent,
) -> Option<&'a NotificationSilence> {
  silences
    .iter()
    .filter(|silence| silence.silenced_until > event.timestamp)
    .find(|silence| silence_matches(silence, event))
}

/// Entry point, called after each successful scan's snapshots are
/// persisted: detect events, match rules, apply silences and
/// cooldowns, deliver within the rate budget.
pub async fn process_scan(
  host: &Host,
  snapshots: &[ContainerSnapshot],
  scanned_at: DateTime<Utc>,
) {
  process_scan_with(db_client(), host, snapshots, scanned_at).await
}

pub(crate) async fn process_scan_with(
  db: &database::Client,
  host: &Host,
  snapshots: &[ContainerSnapshot],
  scanned_at: DateTime<Utc>,
) {
  let rules = match db.list_enabled_rules().await {
    Ok(rules) => rules,
    Err(e) => {
      error!("Failed to load notification rules | {e:#}");
      return;
    }
  };

  let events = match detect::detect_events(
    db, host, &rules, snapshots, scanned_at,
  )
  .await
  {
    Ok(events) => events,
    Err(e) => {
      error!(
        "Event detection failed for {} | {e:#}",
        host.name
      );
      return;
    }
  };
  if events.is_empty() {
    return;
  }

  let silences = db
    .list_active_silences(scanned_at)
    .await
    .inspect_err(|e| error!("Failed to load silences | {e:#}"))
    .unwrap_or_default();
  let channels: HashMap<i64, NotificationChannel> = db
    .list_channels()
    .await
    .inspect_err(|e| error!("Failed to load channels | {e:#}"))
    .unwrap_or_default()
    .into_iter()
    .map(|channel| (channel.id, channel))
    .collect();

  for event in events {
    dispatch_event(db, &event, &rules, &silences, &channels).await;
  }
}

/// Per-rule matching failures never abort other rules; per-channel
/// failures never abort other channels.
async fn dispatch_event(
  db: &database::Client,
  event: &NotificationEvent,
  rules: &[NotificationRule],
  silences: &[NotificationSilence],
  channels: &HashMap<i64, NotificationChannel>,
) {
  for rule in rules {
    if !rule_matches(rule, event) {
      continue;
    }

    if let Some(silence) = active_silence(silences, event) {
      // Suppressed events are recorded locally, without delivery.
      if let Some(&channel_id) = rule.channel_ids.first() {
        let metadata = serde_json::json!({
          "suppressed": true,
          "silence_id": silence.id,
        });
        if let Err(e) = db
          .append_notification_log(
            rule.id,
            channel_id,
            event.kind,
            Some(&event.container_id),
            Some(&event.container_name),
            Some(event.host_id),
            &event.message,
            &metadata,
            event.timestamp,
            false,
            Some("suppressed by silence"),
          )
          .await
        {
          error!("Failed to record suppressed event | {e:#}");
        }
      }
      continue;
    }

    match db
      .last_successful_notification(
        rule.id,
        Some(&event.container_id),
        Some(event.host_id),
      )
      .await
    {
      Ok(Some(last_sent)) => {
        let elapsed = (event.timestamp - last_sent).num_seconds();
        if elapsed < rule.cooldown_seconds {
          debug!(
            "Cooldown drop for rule {} / {} ({elapsed}s < {}s)",
            rule.name, event.container_name, rule.cooldown_seconds
          );
          continue;
        }
      }
      Ok(None) => {}
      Err(e) => {
        error!("Cooldown lookup failed | {e:#}");
        continue;
      }
    }

    let mut delivered = false;
    for channel_id in &rule.channel_ids {
      let Some(channel) = channels.get(channel_id) else {
        continue;
      };
      if !channel.enabled {
        continue;
      }

      if !crate::state::notification_bucket().try_acquire() {
        batch::enqueue(channel.id, rule.id, event.clone()).await;
        continue;
      }

      let delivery = channels::delivery_for_event(event);
      let outcome = channels::deliver(channel, &delivery).await;
      let (success, error) = match &outcome {
        Ok(()) => (true, None),
        Err(e) => (false, Some(format!("{e:#}"))),
      };
      delivered |= success;
      if let Err(e) = db
        .append_notification_log(
          rule.id,
          channel.id,
          event.kind,
          Some(&event.container_id),
          Some(&event.container_name),
          Some(event.host_id),
          &event.message,
          &delivery.payload,
          event.timestamp,
          success,
          error.as_deref(),
        )
        .await
      {
        error!("Failed to append notification log | {e:#}");
      }
    }

    if delivered {
      let threshold_kind = match event.kind {
        EventKind::HighCpu => Some(ThresholdKind::Cpu),
        EventKind::HighMemory => Some(ThresholdKind::Memory),
        _ => None,
      };
      if let Some(kind) = threshold_kind
        && let Err(e) = db
          .set_threshold_notified(
            &event.container_id,
            event.host_id,
            kind,
            event.timestamp,
          )
          .await
      {
        error!("Failed to mark threshold notified | {e:#}");
      }
    }
  }
}

/// Expired silences are pruned on their own ticker.
pub fn spawn_silence_expiry_loop() {
  tokio::spawn(async move {
    loop {
      tokio::select! {
        _ = crate::state::shutdown().cancelled() => break,
        _ = tokio::time::sleep(std::time::Duration::from_secs(60)) => {}
      }
      match db_client().delete_expired_silences(Utc::now()).await {
        Ok(0) => {}
        Ok(removed) => debug!("Expired {removed} silences"),
        Err(e) => error!("Silence expiry failed | {e:#}"),
      }
    }
  });
}

#[cfg(test)]
mod tests {
  use census_client::entities::notification::NotificationSilence;
  use chrono::{Duration, TimeZone};

  use super::*;

  fn event(name: &str) -> NotificationEvent {
    NotificationEvent {
      kind: EventKind::ContainerStopped,
      host_id: 1,
      host_name: String::from("prod-1"),
      container_id: format!("{name}-id"),
      container_name: name.to_string(),
      image: String::from("nginx:1.24"),
      image_id: String::from("sha256:aaa"),
      timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
      message: String::new(),
      cpu_percent: None,
      memory_percent: None,
      breached_since: None,
    }
  }

  fn rule(kinds: Vec<EventKind>) -> NotificationRule {
    NotificationRule {
      id: 1,
      name: String::from("r"),
      enabled: true,
      event_kinds: kinds,
      host_id: None,
      container_pattern: None,
      image_pattern: None,
      cpu_threshold: None,
      memory_threshold: None,
      threshold_duration_seconds: 0,
      cooldown_seconds: 300,
      channel_ids: vec![1],
    }
  }

  #[test]
  fn glob_wildcards() {
    assert!(glob_match("dev-*", "dev-api"));
    assert!(glob_match("dev-*", "dev-db"));
    assert!(!glob_match("dev-*", "prod-api"));
    assert!(glob_match("web-?", "web-1"));
    assert!(!glob_match("web-?", "web-12"));
    assert!(glob_match("exact", "exact"));
  }

  #[test]
  fn rule_matching_kind_host_and_patterns() {
    let mut r = rule(vec![EventKind::ContainerStopped]);
    assert!(rule_matches(&r, &event("web")));

    r.event_kinds = vec![EventKind::NewContainer];
    assert!(!rule_matches(&r, &event("web")));

    let mut r = rule(vec![EventKind::ContainerStopped]);
    r.host_id = Some(2);
    assert!(!rule_matches(&r, &event("web")));

    let mut r = rule(vec![EventKind::ContainerStopped]);
    r.container_pattern = Some(String::from("db-*"));
    assert!(!rule_matches(&r, &event("web")));
    assert!(rule_matches(&r, &event("db-main")));

    let mut r = rule(vec![EventKind::ContainerStopped]);
    r.image_pattern = Some(String::from("nginx:*"));
    assert!(rule_matches(&r, &event("web")));
  }

  #[test]
  fn threshold_rules_require_value_and_duration() {
    let mut r = rule(vec![EventKind::HighCpu]);
    r.cpu_threshold = Some(80.0);
    r.threshold_duration_seconds = 120;

    let mut e = event("web");
    e.kind = EventKind::HighCpu;
    e.cpu_percent = Some(88.0);
    // Breach only 60s old: not sustained yet.
    e.breached_since = Some(e.timestamp - Duration::seconds(60));
    assert!(!rule_matches(&r, &e));

    e.breached_since = Some(e.timestamp - Duration::seconds(130));
    assert!(rule_matches(&r, &e));

    // Under the rule's threshold.
    e.cpu_percent = Some(75.0);
    assert!(!rule_matches(&r, &e));
  }

  #[test]
  fn silence_glob_selects_matching_containers() {
    let until =
      Utc.with_ymd_and_hms(2025, 6, 1, 1, 0, 0).unwrap();
    let silence = NotificationSilence {
      id: 1,
      container_pattern: Some(String::from("dev-*")),
      silenced_until: until,
      ..Default::default()
    };
    assert!(silence_matches(&silence, &event("dev-api")));
    assert!(silence_matches(&silence, &event("dev-db")));
    assert!(!silence_matches(&silence, &event("prod-api")));
  }

  #[test]
  fn silence_host_selector_combines_with_container() {
    let until =
      Utc.with_ymd_and_hms(2025, 6, 1, 1, 0, 0).unwrap();
    let silence = NotificationSilence {
      id: 1,
      host_pattern: Some(String::from("staging-*")),
      container_pattern: Some(String::from("tmp-*")),
      silenced_until: until,
      ..Default::default()
    };
    // Host pattern does not match "prod-1".
    assert!(!silence_matches(&silence, &event("tmp-job-42")));

    let silence = NotificationSilence {
      host_pattern: Some(String::from("*")),
      ..silence
    };
    assert!(silence_matches(&silence, &event("tmp-job-42")));
    assert!(!silence_matches(&silence, &event("web")));
  }

  #[test]
  fn expired_silences_do_not_apply() {
    let event = event("tmp-job");
    let expired = NotificationSilence {
      id: 1,
      container_pattern: Some(String::from("tmp-*")),
      silenced_until: event.timestamp - Duration::seconds(1),
      ..Default::default()
    };
    assert!(active_silence(&[expired], &event).is_none());
  }
}

#[cfg(test)]
mod engine_tests {
  use census_client::entities::{
    container::ContainerState,
    host::{ConnectionType, CreateHostBody},
    notification::ChannelConfig,
  };
  use chrono::{Duration, TimeZone};
  use database::{ChannelBody, RuleBody, SilenceBody};

  use super::*;

  fn at(seconds: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
      + Duration::seconds(seconds)
  }

  async fn test_db() -> database::Client {
    database::Client::new("sqlite::memory:")
      .await
      .expect("failed to open in-memory database")
  }

  async fn seed_host(db: &database::Client) -> Host {
    db.create_host(
      &CreateHostBody {
        name: format!("host-{}", uuid::Uuid::new_v4()),
        address: String::from("/var/run/docker.sock"),
        connection_type: ConnectionType::LocalSocket,
        token: None,
        enabled: true,
        collect_stats: true,
      },
      at(0),
    )
    .await
    .expect("failed to seed host")
  }

  async fn in_app_channel(db: &database::Client) -> i64 {
    db.create_channel(&ChannelBody {
      name: format!("inapp-{}", uuid::Uuid::new_v4()),
      config: ChannelConfig::InApp {},
      enabled: true,
    })
    .await
    .expect("failed to create channel")
    .id
  }

  fn rule_body(
    kinds: Vec<EventKind>,
    channel_id: i64,
  ) -> RuleBody {
    RuleBody {
      name: format!("rule-{}", uuid::Uuid::new_v4()),
      enabled: true,
      event_kinds: kinds,
      host_id: None,
      container_pattern: None,
      image_pattern: None,
      cpu_threshold: None,
      memory_threshold: None,
      threshold_duration_seconds: 0,
      cooldown_seconds: 300,
      channel_ids: vec![channel_id],
    }
  }

  fn snapshot(
    host_id: i64,
    name: &str,
    image: &str,
    image_id: &str,
    cpu: Option<f64>,
    scanned_at: DateTime<Utc>,
  ) -> ContainerSnapshot {
    ContainerSnapshot {
      container_id: format!("{name}-id"),
      host_id,
      name: name.to_string(),
      image: image.to_string(),
      image_id: image_id.to_string(),
      state: ContainerState::Running,
      cpu_percent: cpu,
      memory_usage: cpu.map(|_| 1024),
      memory_limit: cpu.map(|_| 4096),
      memory_percent: cpu.map(|_| 25.0),
      scanned_at,
      ..Default::default()
    }
  }

  /// Persist and process one scan, the way the scanner does.
  async fn run_scan(
    db: &database::Client,
    host: &Host,
    snapshots: Vec<ContainerSnapshot>,
    scanned_at: DateTime<Utc>,
  ) {
    db.record_scan_success(
      host.id,
      scanned_at,
      scanned_at + Duration::seconds(1),
      &snapshots,
    )
    .await
    .expect("failed to record scan");
    process_scan_with(db, host, &snapshots, scanned_at).await;
  }

  async fn successful_log(
    db: &database::Client,
  ) -> Vec<census_client::entities::notification::NotificationLogEntry>
  {
    db.list_notification_log(1000)
      .await
      .unwrap()
      .into_iter()
      .filter(|entry| entry.success)
      .collect()
  }

  #[tokio::test]
  async fn image_update_notifies_once() {
    let db = test_db().await;
    let host = seed_host(&db).await;
    let channel = in_app_channel(&db).await;
    db.create_rule(&rule_body(
      vec![EventKind::ImageUpdated],
      channel,
    ))
    .await
    .unwrap();

    run_scan(
      &db,
      &host,
      vec![snapshot(
        host.id, "web", "nginx:1.24", "sha256:a", None, at(0),
      )],
      at(0),
    )
    .await;
    run_scan(
      &db,
      &host,
      vec![snapshot(
        host.id, "web", "nginx:1.24", "sha256:a", None, at(60),
      )],
      at(60),
    )
    .await;
    run_scan(
      &db,
      &host,
      vec![snapshot(
        host.id, "web", "nginx:1.25", "sha256:b", None, at(120),
      )],
      at(120),
    )
    .await;

    let log = successful_log(&db).await;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].event_kind, EventKind::ImageUpdated);
    assert_eq!(log[0].sent_at, at(120));
  }

  #[tokio::test]
  async fn threshold_fires_after_duration_and_respects_cooldown() {
    let db = test_db().await;
    let host = seed_host(&db).await;
    let channel = in_app_channel(&db).await;
    let mut rule =
      rule_body(vec![EventKind::HighCpu], channel);
    rule.cpu_threshold = Some(80.0);
    rule.threshold_duration_seconds = 120;
    rule.cooldown_seconds = 300;
    db.create_rule(&rule).await.unwrap();

    // cpu% series: 85@0, 90@60, 88@130, 40@200, 95@800, 96@920.
    let series = [
      (0, Some(85.0)),
      (60, Some(90.0)),
      (130, Some(88.0)),
      (200, Some(40.0)),
      (800, Some(95.0)),
      (920, Some(96.0)),
    ];
    for (t, cpu) in series {
      run_scan(
        &db,
        &host,
        vec![snapshot(
          host.id,
          "worker",
          "job:latest",
          "sha256:a",
          cpu,
          at(t),
        )],
        at(t),
      )
      .await;
    }

    let log = successful_log(&db).await;
    let mut times: Vec<_> =
      log.iter().map(|entry| entry.sent_at).collect();
    times.sort();
    assert_eq!(times, vec![at(130), at(920)]);
    assert!(
      log.iter().all(|entry| entry.event_kind == EventKind::HighCpu)
    );
  }

  #[tokio::test]
  async fn sustained_breach_within_cooldown_notifies_once() {
    let db = test_db().await;
    let host = seed_host(&db).await;
    let channel = in_app_channel(&db).await;
    let mut rule =
      rule_body(vec![EventKind::HighCpu], channel);
    rule.cpu_threshold = Some(80.0);
    rule.threshold_duration_seconds = 120;
    rule.cooldown_seconds = 300;
    db.create_rule(&rule).await.unwrap();

    for t in [0, 130, 260] {
      run_scan(
        &db,
        &host,
        vec![snapshot(
          host.id,
          "worker",
          "job:latest",
          "sha256:a",
          Some(85.0),
          at(t),
        )],
        at(t),
      )
      .await;
    }

    assert_eq!(successful_log(&db).await.len(), 1);
  }

  #[tokio::test]
  async fn silence_pattern_suppresses_delivery() {
    let db = test_db().await;
    let host = seed_host(&db).await;
    let channel = in_app_channel(&db).await;
    db.create_rule(&rule_body(
      vec![EventKind::NewContainer],
      channel,
    ))
    .await
    .unwrap();
    db.create_silence(&SilenceBody {
      host_id: None,
      host_pattern: Some(String::from("*")),
      container_id: None,
      container_name: None,
      container_pattern: Some(String::from("tmp-*")),
      silenced_until: at(3600),
      reason: String::from("maintenance"),
    })
    .await
    .unwrap();

    run_scan(
      &db,
      &host,
      vec![snapshot(
        host.id,
        "tmp-job-42",
        "job:latest",
        "sha256:a",
        None,
        at(0),
      )],
      at(0),
    )
    .await;

    assert!(successful_log(&db).await.is_empty());
    // Still recorded locally as suppressed.
    let all = db.list_notification_log(100).await.unwrap();
    assert_eq!(all.len(), 1);
    assert!(!all[0].success);
    assert_eq!(
      all[0].error.as_deref(),
      Some("suppressed by silence")
    );
  }

  #[tokio::test]
  async fn disappearance_emitted_exactly_once_after_gap() {
    let db = test_db().await;
    let host = seed_host(&db).await;
    let channel = in_app_channel(&db).await;
    db.create_rule(&rule_body(
      vec![EventKind::ContainerDisappeared],
      channel,
    ))
    .await
    .unwrap();

    let hour = 3600;
    run_scan(
      &db,
      &host,
      vec![snapshot(
        host.id, "web", "nginx", "sha256:a", None, at(0),
      )],
      at(0),
    )
    .await;
    run_scan(
      &db,
      &host,
      vec![snapshot(
        host.id, "web", "nginx", "sha256:a", None, at(hour),
      )],
      at(hour),
    )
    .await;
    // Half an hour of absence: under the gap threshold, nothing.
    run_scan(&db, &host, Vec::new(), at(hour + 1800)).await;
    assert!(successful_log(&db).await.is_empty());

    // Crosses the 2h threshold: exactly one disappearance.
    run_scan(&db, &host, Vec::new(), at(hour + 3 * hour)).await;
    assert_eq!(successful_log(&db).await.len(), 1);

    // Still gone on the next scan: no repeat.
    run_scan(&db, &host, Vec::new(), at(hour + 4 * hour)).await;
    let log = successful_log(&db).await;
    assert_eq!(log.len(), 1);
    assert_eq!(
      log[0].event_kind,
      EventKind::ContainerDisappeared
    );
  }

  #[tokio::test]
  async fn batched_events_flush_as_one_summary() {
    let db = test_db().await;
    let host = seed_host(&db).await;
    let channel = in_app_channel(&db).await;
    let rule = db
      .create_rule(&rule_body(
        vec![EventKind::NewContainer],
        channel,
      ))
      .await
      .unwrap();

    for i in 0..5 {
      let event = NotificationEvent {
        kind: EventKind::NewContainer,
        host_id: host.id,
        host_name: host.name.clone(),
        container_id: format!("c{i}"),
        container_name: format!("svc-{i}"),
        image: String::from("nginx"),
        image_id: String::from("sha256:a"),
        timestamp: at(0),
        message: format!("New container svc-{i}"),
        cpu_percent: None,
        memory_percent: None,
        breached_since: None,
      };
      batch::enqueue(channel, rule.id, event).await;
    }
    assert_eq!(batch::queued_count().await, 5);

    batch::flush_with(&db).await;
    assert_eq!(batch::queued_count().await, 0);

    let log = db.list_notification_log(100).await.unwrap();
    assert_eq!(log.len(), 5);
    assert!(log.iter().all(|entry| entry.success));
    assert!(
      log
        .iter()
        .all(|entry| entry.metadata["batched"] == true)
    );
  }
}

use std::{
  collections::HashMap,
  sync::OnceLock,
  time::Duration,
};

use census_client::entities::notification::NotificationEvent;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::{
  notify::channels,
  state::{db_client, settings, shutdown},
};

struct Queued {
  rule_id: i64,
  event: NotificationEvent,
}

/// Events that found the token bucket empty, queued per channel until
/// the next batch flush.
fn queues() -> &'static Mutex<HashMap<i64, Vec<Queued>>> {
  static QUEUES: OnceLock<Mutex<HashMap<i64, Vec<Queued>>>> =
    OnceLock::new();
  QUEUES.get_or_init(Default::default)
}

pub async fn enqueue(
  channel_id: i64,
  rule_id: i64,
  event: NotificationEvent,
) {
  debug!(
    "Rate limit reached, queueing {} for channel {channel_id}",
    event.kind
  );
  queues()
    .lock()
    .await
    .entry(channel_id)
    .or_default()
    .push(Queued { rule_id, event });
}

/// Number of events currently queued across channels.
pub async fn queued_count() -> usize {
  queues().lock().await.values().map(Vec::len).sum()
}

/// Flush every channel's queue as one summary notification each. The
/// summary bypasses the token bucket: it is the pressure relief for
/// rate-limited bursts, not another burst source.
pub async fn flush_all() {
  flush_with(db_client()).await
}

pub(crate) async fn flush_with(db: &database::Client) {
  let drained: Vec<(i64, Vec<Queued>)> =
    queues().lock().await.drain().collect();

  for (channel_id, queued) in drained {
    if queued.is_empty() {
      continue;
    }
    let channel = match db.get_channel(channel_id).await {
      Ok(channel) => channel,
      Err(e) => {
        warn!(
          "Dropping {} queued events for missing channel {channel_id} | {e:#}",
          queued.len()
        );
        continue;
      }
    };
    if !channel.enabled {
      continue;
    }

    let events = queued
      .iter()
      .map(|queued| queued.event.clone())
      .collect::<Vec<_>>();
    let delivery = channels::delivery_for_summary(&events);
    let outcome = channels::deliver(&channel, &delivery).await;
    let (success, error) = match &outcome {
      Ok(()) => (true, None),
      Err(e) => (false, Some(format!("{e:#}"))),
    };

    let now = Utc::now();
    let batch_size = queued.len();
    for queued in &queued {
      let metadata = serde_json::json!({
        "batched": true,
        "batch_size": batch_size,
      });
      if let Err(e) = db
        .append_notification_log(
          queued.rule_id,
          channel.id,
          queued.event.kind,
          Some(&queued.event.container_id),
          Some(&queued.event.container_name),
          Some(queued.event.host_id),
          &queued.event.message,
          &metadata,
          now,
          success,
          error.as_deref(),
        )
        .await
      {
        error!("Failed to log batched notification | {e:#}");
      }
    }
  }
}

/// Flushes queues on the configured batch interval.
pub fn spawn_batch_flush_loop() {
  tokio::spawn(async move {
    loop {
      let interval = settings()
        .load()
        .notifications
        .batch_interval_seconds
        .max(5);
      tokio::select! {
        _ = shutdown().cancelled() => break,
        _ = tokio::time::sleep(Duration::from_secs(interval)) => {}
      }
      flush_all().await;
    }
  });
}

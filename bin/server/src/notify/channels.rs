use std::time::Duration;

use anyhow::{Context, anyhow};
use census_client::entities::notification::{
  ChannelConfig, EventKind, NotificationChannel, NotificationEvent,
};
use tokio::time::timeout;

/// Attempts per delivery, with exponential backoff between them.
const DELIVERY_ATTEMPTS: u32 = 3;
/// Per-attempt deadline.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// What actually goes out on a channel, independent of transport.
#[derive(Debug, Clone)]
pub struct Delivery {
  pub title: String,
  pub message: String,
  pub priority: u8,
  pub tags: Vec<String>,
  /// Full structured body for webhook consumers and the log.
  pub payload: serde_json::Value,
}

/// Ntfy priority by event kind: hard lifecycle failures are urgent,
/// resource alerts high, the rest informational.
fn priority_for(kind: EventKind) -> u8 {
  match kind {
    EventKind::ContainerStopped
    | EventKind::ContainerDisappeared => 5,
    EventKind::HighCpu
    | EventKind::HighMemory
    | EventKind::AnomalousBehavior => 4,
    EventKind::ContainerPaused | EventKind::ContainerResumed => 2,
    _ => 3,
  }
}

pub fn delivery_for_event(event: &NotificationEvent) -> Delivery {
  Delivery {
    title: format!(
      "[{}] {} on {}",
      event.kind, event.container_name, event.host_name
    ),
    message: event.message.clone(),
    priority: priority_for(event.kind),
    tags: vec![event.kind.to_string()],
    payload: serde_json::to_value(event)
      .unwrap_or(serde_json::Value::Null),
  }
}

/// Coalesce rate-limited events into one summary notification.
pub fn delivery_for_summary(
  events: &[NotificationEvent],
) -> Delivery {
  let mut lines = events
    .iter()
    .map(|event| event.message.clone())
    .collect::<Vec<_>>();
  lines.truncate(20);
  if events.len() > lines.len() {
    lines.push(format!("... and {} more", events.len() - lines.len()));
  }
  Delivery {
    title: format!("{} queued notifications", events.len()),
    message: lines.join("\n"),
    priority: events
      .iter()
      .map(|event| priority_for(event.kind))
      .max()
      .unwrap_or(3),
    tags: vec![String::from("summary")],
    payload: serde_json::json!({
      "summary": true,
      "count": events.len(),
      "events": events,
    }),
  }
}

/// Send with up to 3 attempts and a 10s per-attempt deadline.
/// In-app channels are a no-op send: the log row written for every
/// attempt is the in-app notification.
pub async fn deliver(
  channel: &NotificationChannel,
  delivery: &Delivery,
) -> anyhow::Result<()> {
  if let ChannelConfig::InApp {} = channel.config {
    return Ok(());
  }

  let mut last_error = anyhow!("no delivery attempt made");
  for attempt in 0..DELIVERY_ATTEMPTS {
    if attempt > 0 {
      tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
    }
    match timeout(ATTEMPT_TIMEOUT, send_once(channel, delivery))
      .await
    {
      Ok(Ok(())) => return Ok(()),
      Ok(Err(e)) => last_error = e,
      Err(_) => {
        last_error = anyhow!(
          "delivery attempt timed out after {}s",
          ATTEMPT_TIMEOUT.as_secs()
        )
      }
    }
  }
  Err(last_error.context(format!(
    "Delivery to channel '{}' failed after {DELIVERY_ATTEMPTS} attempts",
    channel.name
  )))
}

async fn send_once(
  channel: &NotificationChannel,
  delivery: &Delivery,
) -> anyhow::Result<()> {
  match &channel.config {
    ChannelConfig::InApp {} => Ok(()),
    ChannelConfig::Webhook { url, headers } => {
      let client = reqwest::Client::new();
      let mut request = client.post(url).json(&delivery.payload);
      for (name, value) in headers {
        request = request.header(name, value);
      }
      let response = request
        .send()
        .await
        .with_context(|| format!("POST {url} failed"))?;
      let status = response.status();
      if !status.is_success() {
        return Err(anyhow!("webhook returned {status}"));
      }
      Ok(())
    }
    ChannelConfig::Ntfy {
      server_url,
      topic,
      token,
    } => {
      let url = format!(
        "{}/{topic}",
        server_url.trim_end_matches('/')
      );
      let client = reqwest::Client::new();
      let mut request = client
        .post(&url)
        .header("Title", delivery.title.clone())
        .header("Priority", delivery.priority.to_string())
        .header("Tags", delivery.tags.join(","))
        .body(delivery.message.clone());
      if let Some(token) = token {
        request = request.bearer_auth(token);
      }
      let response = request
        .send()
        .await
        .with_context(|| format!("POST {url} failed"))?;
      let status = response.status();
      if !status.is_success() {
        return Err(anyhow!("ntfy returned {status}"));
      }
      Ok(())
    }
  }
}

/// Send a synthetic event through the channel, for the channel test
/// endpoint.
pub async fn test_channel(
  channel: &NotificationChannel,
) -> anyhow::Result<()> {
  let delivery = Delivery {
    title: String::from("Census test notification"),
    message: format!(
      "Channel '{}' is configured correctly",
      channel.name
    ),
    priority: 3,
    tags: vec![String::from("test")],
    payload: serde_json::json!({ "test": true }),
  };
  deliver(channel, &delivery).await
}

#[cfg(test)]
mod tests {
  use super::*;

  fn event(kind: EventKind) -> NotificationEvent {
    NotificationEvent {
      kind,
      host_id: 1,
      host_name: String::from("a"),
      container_id: String::from("cid"),
      container_name: String::from("web"),
      image: String::from("nginx"),
      image_id: String::from("sha256:aaa"),
      timestamp: chrono::Utc::now(),
      message: String::from("msg"),
      cpu_percent: None,
      memory_percent: None,
      breached_since: None,
    }
  }

  #[test]
  fn priorities_by_severity() {
    assert_eq!(priority_for(EventKind::ContainerStopped), 5);
    assert_eq!(priority_for(EventKind::HighCpu), 4);
    assert_eq!(priority_for(EventKind::NewContainer), 3);
    assert_eq!(priority_for(EventKind::ContainerPaused), 2);
  }

  #[test]
  fn summary_takes_highest_priority_and_counts() {
    let events = vec![
      event(EventKind::NewContainer),
      event(EventKind::ContainerStopped),
    ];
    let delivery = delivery_for_summary(&events);
    assert_eq!(delivery.priority, 5);
    assert_eq!(delivery.payload["count"], 2);
  }

  #[tokio::test]
  async fn in_app_send_is_a_noop() {
    let channel = NotificationChannel {
      id: 1,
      name: String::from("inapp"),
      config: ChannelConfig::InApp {},
      enabled: true,
    };
    let delivery = delivery_for_event(&event(EventKind::HighCpu));
    assert!(deliver(&channel, &delivery).await.is_ok());
  }
}

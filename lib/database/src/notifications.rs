use std::collections::HashMap;

use anyhow::{Context, anyhow};
use census_client::entities::{
  format_timestamp,
  notification::{
    ChannelConfig, EventKind, NotificationChannel,
    NotificationLogEntry, NotificationRule, NotificationSilence,
  },
  parse_timestamp,
};
use chrono::{DateTime, Duration, Utc};

use crate::Client;

/// Log rows inside this window always survive cleanup.
const LOG_RETENTION_DAYS: i64 = 7;
/// When the log exceeds this size, the newest rows up to this count
/// also survive cleanup regardless of age.
const LOG_RETENTION_COUNT: i64 = 100;

/// Body for creating / updating a channel.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ChannelBody {
  pub name: String,
  #[serde(flatten)]
  pub config: ChannelConfig,
  #[serde(default = "default_true")]
  pub enabled: bool,
}

/// Body for creating / updating a rule.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RuleBody {
  pub name: String,
  #[serde(default = "default_true")]
  pub enabled: bool,
  pub event_kinds: Vec<EventKind>,
  #[serde(default)]
  pub host_id: Option<i64>,
  #[serde(default)]
  pub container_pattern: Option<String>,
  #[serde(default)]
  pub image_pattern: Option<String>,
  #[serde(default)]
  pub cpu_threshold: Option<f64>,
  #[serde(default)]
  pub memory_threshold: Option<f64>,
  #[serde(default)]
  pub threshold_duration_seconds: i64,
  #[serde(default = "default_cooldown")]
  pub cooldown_seconds: i64,
  pub channel_ids: Vec<i64>,
}

/// Body for creating a silence.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SilenceBody {
  #[serde(default)]
  pub host_id: Option<i64>,
  #[serde(default)]
  pub host_pattern: Option<String>,
  #[serde(default)]
  pub container_id: Option<String>,
  #[serde(default)]
  pub container_name: Option<String>,
  #[serde(default)]
  pub container_pattern: Option<String>,
  pub silenced_until: DateTime<Utc>,
  #[serde(default)]
  pub reason: String,
}

fn default_true() -> bool {
  true
}

fn default_cooldown() -> i64 {
  300
}

#[derive(sqlx::FromRow)]
struct ChannelRow {
  id: i64,
  name: String,
  config: String,
  enabled: bool,
}

#[derive(sqlx::FromRow)]
struct RuleRow {
  id: i64,
  name: String,
  enabled: bool,
  event_kinds: String,
  host_id: Option<i64>,
  container_pattern: Option<String>,
  image_pattern: Option<String>,
  cpu_threshold: Option<f64>,
  memory_threshold: Option<f64>,
  threshold_duration_seconds: i64,
  cooldown_seconds: i64,
}

#[derive(sqlx::FromRow)]
struct LogRow {
  id: i64,
  rule_id: i64,
  channel_id: i64,
  event_kind: String,
  container_id: Option<String>,
  container_name: Option<String>,
  host_id: Option<i64>,
  message: String,
  metadata: String,
  sent_at: String,
  success: bool,
  error: Option<String>,
  read: bool,
}

#[derive(sqlx::FromRow)]
struct SilenceRow {
  id: i64,
  host_id: Option<i64>,
  host_pattern: Option<String>,
  container_id: Option<String>,
  container_name: Option<String>,
  container_pattern: Option<String>,
  silenced_until: String,
  reason: String,
}

impl TryFrom<ChannelRow> for NotificationChannel {
  type Error = anyhow::Error;

  fn try_from(row: ChannelRow) -> anyhow::Result<NotificationChannel> {
    Ok(NotificationChannel {
      id: row.id,
      name: row.name,
      config: serde_json::from_str(&row.config)
        .context("Invalid channel config json")?,
      enabled: row.enabled,
    })
  }
}

impl TryFrom<LogRow> for NotificationLogEntry {
  type Error = anyhow::Error;

  fn try_from(row: LogRow) -> anyhow::Result<NotificationLogEntry> {
    Ok(NotificationLogEntry {
      id: row.id,
      rule_id: row.rule_id,
      channel_id: row.channel_id,
      event_kind: row
        .event_kind
        .parse()
        .map_err(|_| anyhow!("Unknown event kind {}", row.event_kind))?,
      container_id: row.container_id,
      container_name: row.container_name,
      host_id: row.host_id,
      message: row.message,
      metadata: serde_json::from_str(&row.metadata)
        .unwrap_or_default(),
      sent_at: parse_timestamp(&row.sent_at)?,
      success: row.success,
      error: row.error,
      read: row.read,
    })
  }
}

impl TryFrom<SilenceRow> for NotificationSilence {
  type Error = anyhow::Error;

  fn try_from(row: SilenceRow) -> anyhow::Result<NotificationSilence> {
    Ok(NotificationSilence {
      id: row.id,
      host_id: row.host_id,
      host_pattern: row.host_pattern,
      container_id: row.container_id,
      container_name: row.container_name,
      container_pattern: row.container_pattern,
      silenced_until: parse_timestamp(&row.silenced_until)?,
      reason: row.reason,
    })
  }
}

fn rule_from_row(
  row: RuleRow,
  channel_ids: Vec<i64>,
) -> anyhow::Result<NotificationRule> {
  Ok(NotificationRule {
    id: row.id,
    name: row.name,
    enabled: row.enabled,
    event_kinds: serde_json::from_str(&row.event_kinds)
      .context("Invalid rule event kinds json")?,
    host_id: row.host_id,
    container_pattern: row.container_pattern,
    image_pattern: row.image_pattern,
    cpu_threshold: row.cpu_threshold,
    memory_threshold: row.memory_threshold,
    threshold_duration_seconds: row.threshold_duration_seconds,
    cooldown_seconds: row.cooldown_seconds,
    channel_ids,
  })
}

impl Client {
  // == Channels ==

  pub async fn list_channels(
    &self,
  ) -> anyhow::Result<Vec<NotificationChannel>> {
    let rows = sqlx::query_as::<_, ChannelRow>(
      "SELECT id, name, config, enabled FROM notification_channels ORDER BY name",
    )
    .fetch_all(&self.pool)
    .await
    .context("Failed to list channels")?;
    rows.into_iter().map(NotificationChannel::try_from).collect()
  }

  pub async fn get_channel(
    &self,
    id: i64,
  ) -> anyhow::Result<NotificationChannel> {
    sqlx::query_as::<_, ChannelRow>(
      "SELECT id, name, config, enabled FROM notification_channels WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(&self.pool)
    .await
    .context("Failed to query channel")?
    .with_context(|| format!("No channel found with id {id}"))?
    .try_into()
  }

  pub async fn create_channel(
    &self,
    body: &ChannelBody,
  ) -> anyhow::Result<NotificationChannel> {
    let id = sqlx::query(
      "INSERT INTO notification_channels (name, kind, config, enabled) VALUES (?, ?, ?, ?)",
    )
    .bind(&body.name)
    .bind(body.config.kind().to_string())
    .bind(serde_json::to_string(&body.config)?)
    .bind(body.enabled)
    .execute(&self.pool)
    .await
    .with_context(|| {
      format!("Failed to create channel '{}'", body.name)
    })?
    .last_insert_rowid();
    self.get_channel(id).await
  }

  pub async fn update_channel(
    &self,
    id: i64,
    body: &ChannelBody,
  ) -> anyhow::Result<NotificationChannel> {
    sqlx::query(
      "UPDATE notification_channels SET name = ?, kind = ?, config = ?, enabled = ? WHERE id = ?",
    )
    .bind(&body.name)
    .bind(body.config.kind().to_string())
    .bind(serde_json::to_string(&body.config)?)
    .bind(body.enabled)
    .bind(id)
    .execute(&self.pool)
    .await
    .context("Failed to update channel")?;
    self.get_channel(id).await
  }

  pub async fn delete_channel(&self, id: i64) -> anyhow::Result<()> {
    sqlx::query("DELETE FROM notification_channels WHERE id = ?")
      .bind(id)
      .execute(&self.pool)
      .await
      .context("Failed to delete channel")?;
    Ok(())
  }

  // == Rules ==

  pub async fn list_rules(
    &self,
  ) -> anyhow::Result<Vec<NotificationRule>> {
    let rows = sqlx::query_as::<_, RuleRow>(
      "SELECT id, name, enabled, event_kinds, host_id, container_pattern, image_pattern, cpu_threshold, memory_threshold, threshold_duration_seconds, cooldown_seconds
       FROM notification_rules ORDER BY name",
    )
    .fetch_all(&self.pool)
    .await
    .context("Failed to list rules")?;

    let joins = sqlx::query_as::<_, (i64, i64)>(
      "SELECT rule_id, channel_id FROM rule_channels",
    )
    .fetch_all(&self.pool)
    .await
    .context("Failed to list rule channels")?;

    let mut by_rule: HashMap<i64, Vec<i64>> = HashMap::new();
    for (rule_id, channel_id) in joins {
      by_rule.entry(rule_id).or_default().push(channel_id);
    }

    rows
      .into_iter()
      .map(|row| {
        let channels =
          by_rule.remove(&row.id).unwrap_or_default();
        rule_from_row(row, channels)
      })
      .collect()
  }

  pub async fn list_enabled_rules(
    &self,
  ) -> anyhow::Result<Vec<NotificationRule>> {
    Ok(
      self
        .list_rules()
        .await?
        .into_iter()
        .filter(|rule| rule.enabled)
        .collect(),
    )
  }

  pub async fn get_rule(
    &self,
    id: i64,
  ) -> anyhow::Result<NotificationRule> {
    self
      .list_rules()
      .await?
      .into_iter()
      .find(|rule| rule.id == id)
      .with_context(|| format!("No rule found with id {id}"))
  }

  pub async fn create_rule(
    &self,
    body: &RuleBody,
  ) -> anyhow::Result<NotificationRule> {
    if body.channel_ids.is_empty() {
      return Err(anyhow!(
        "A notification rule needs at least one channel"
      ));
    }
    let mut tx = self
      .pool
      .begin()
      .await
      .context("Failed to begin rule transaction")?;
    let id = sqlx::query(
      "INSERT INTO notification_rules (name, enabled, event_kinds, host_id, container_pattern, image_pattern, cpu_threshold, memory_threshold, threshold_duration_seconds, cooldown_seconds)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&body.name)
    .bind(body.enabled)
    .bind(serde_json::to_string(&body.event_kinds)?)
    .bind(body.host_id)
    .bind(&body.container_pattern)
    .bind(&body.image_pattern)
    .bind(body.cpu_threshold)
    .bind(body.memory_threshold)
    .bind(body.threshold_duration_seconds)
    .bind(body.cooldown_seconds)
    .execute(&mut *tx)
    .await
    .with_context(|| format!("Failed to create rule '{}'", body.name))?
    .last_insert_rowid();

    for channel_id in &body.channel_ids {
      sqlx::query(
        "INSERT OR IGNORE INTO rule_channels (rule_id, channel_id) VALUES (?, ?)",
      )
      .bind(id)
      .bind(channel_id)
      .execute(&mut *tx)
      .await
      .context("Failed to link rule to channel")?;
    }
    tx.commit()
      .await
      .context("Failed to commit rule transaction")?;
    self.get_rule(id).await
  }

  pub async fn update_rule(
    &self,
    id: i64,
    body: &RuleBody,
  ) -> anyhow::Result<NotificationRule> {
    if body.channel_ids.is_empty() {
      return Err(anyhow!(
        "A notification rule needs at least one channel"
      ));
    }
    let mut tx = self
      .pool
      .begin()
      .await
      .context("Failed to begin rule transaction")?;
    sqlx::query(
      "UPDATE notification_rules SET name = ?, enabled = ?, event_kinds = ?, host_id = ?, container_pattern = ?, image_pattern = ?, cpu_threshold = ?, memory_threshold = ?, threshold_duration_seconds = ?, cooldown_seconds = ? WHERE id = ?",
    )
    .bind(&body.name)
    .bind(body.enabled)
    .bind(serde_json::to_string(&body.event_kinds)?)
    .bind(body.host_id)
    .bind(&body.container_pattern)
    .bind(&body.image_pattern)
    .bind(body.cpu_threshold)
    .bind(body.memory_threshold)
    .bind(body.threshold_duration_seconds)
    .bind(body.cooldown_seconds)
    .bind(id)
    .execute(&mut *tx)
    .await
    .context("Failed to update rule")?;

    sqlx::query("DELETE FROM rule_channels WHERE rule_id = ?")
      .bind(id)
      .execute(&mut *tx)
      .await
      .context("Failed to clear rule channels")?;
    for channel_id in &body.channel_ids {
      sqlx::query(
        "INSERT OR IGNORE INTO rule_channels (rule_id, channel_id) VALUES (?, ?)",
      )
      .bind(id)
      .bind(channel_id)
      .execute(&mut *tx)
      .await
      .context("Failed to link rule to channel")?;
    }
    tx.commit()
      .await
      .context("Failed to commit rule transaction")?;
    self.get_rule(id).await
  }

  pub async fn delete_rule(&self, id: i64) -> anyhow::Result<()> {
    sqlx::query("DELETE FROM notification_rules WHERE id = ?")
      .bind(id)
      .execute(&self.pool)
      .await
      .context("Failed to delete rule")?;
    Ok(())
  }

  // == Silences ==

  pub async fn list_silences(
    &self,
  ) -> anyhow::Result<Vec<NotificationSilence>> {
    let rows = sqlx::query_as::<_, SilenceRow>(
      "SELECT id, host_id, host_pattern, container_id, container_name, container_pattern, silenced_until, reason
       FROM notification_silences ORDER BY silenced_until DESC",
    )
    .fetch_all(&self.pool)
    .await
    .context("Failed to list silences")?;
    rows.into_iter().map(NotificationSilence::try_from).collect()
  }

  pub async fn list_active_silences(
    &self,
    now: DateTime<Utc>,
  ) -> anyhow::Result<Vec<NotificationSilence>> {
    let rows = sqlx::query_as::<_, SilenceRow>(
      "SELECT id, host_id, host_pattern, container_id, container_name, container_pattern, silenced_until, reason
       FROM notification_silences WHERE silenced_until > ?",
    )
    .bind(format_timestamp(&now))
    .fetch_all(&self.pool)
    .await
    .context("Failed to list active silences")?;
    rows.into_iter().map(NotificationSilence::try_from).collect()
  }

  pub async fn create_silence(
    &self,
    body: &SilenceBody,
  ) -> anyhow::Result<NotificationSilence> {
    let silence = NotificationSilence {
      id: 0,
      host_id: body.host_id,
      host_pattern: body.host_pattern.clone(),
      container_id: body.container_id.clone(),
      container_name: body.container_name.clone(),
      container_pattern: body.container_pattern.clone(),
      silenced_until: body.silenced_until,
      reason: body.reason.clone(),
    };
    if !silence.has_selector() {
      return Err(anyhow!(
        "A silence needs at least one host or container selector"
      ));
    }
    let id = sqlx::query(
      "INSERT INTO notification_silences (host_id, host_pattern, container_id, container_name, container_pattern, silenced_until, reason)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(body.host_id)
    .bind(&body.host_pattern)
    .bind(&body.container_id)
    .bind(&body.container_name)
    .bind(&body.container_pattern)
    .bind(format_timestamp(&body.silenced_until))
    .bind(&body.reason)
    .execute(&self.pool)
    .await
    .context("Failed to create silence")?
    .last_insert_rowid();
    Ok(NotificationSilence { id, ..silence })
  }

  pub async fn delete_silence(&self, id: i64) -> anyhow::Result<()> {
    sqlx::query("DELETE FROM notification_silences WHERE id = ?")
      .bind(id)
      .execute(&self.pool)
      .await
      .context("Failed to delete silence")?;
    Ok(())
  }

  /// Drop expired silences. Returns how many were removed.
  pub async fn delete_expired_silences(
    &self,
    now: DateTime<Utc>,
  ) -> anyhow::Result<u64> {
    let result = sqlx::query(
      "DELETE FROM notification_silences WHERE silenced_until <= ?",
    )
    .bind(format_timestamp(&now))
    .execute(&self.pool)
    .await
    .context("Failed to delete expired silences")?;
    Ok(result.rows_affected())
  }

  // == Log ==

  #[allow(clippy::too_many_arguments)]
  pub async fn append_notification_log(
    &self,
    rule_id: i64,
    channel_id: i64,
    event_kind: EventKind,
    container_id: Option<&str>,
    container_name: Option<&str>,
    host_id: Option<i64>,
    message: &str,
    metadata: &serde_json::Value,
    sent_at: DateTime<Utc>,
    success: bool,
    error: Option<&str>,
  ) -> anyhow::Result<i64> {
    let id = sqlx::query(
      "INSERT INTO notification_log (rule_id, channel_id, event_kind, container_id, container_name, host_id, message, metadata, sent_at, success, error)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(rule_id)
    .bind(channel_id)
    .bind(event_kind.to_string())
    .bind(container_id)
    .bind(container_name)
    .bind(host_id)
    .bind(message)
    .bind(serde_json::to_string(metadata)?)
    .bind(format_timestamp(&sent_at))
    .bind(success)
    .bind(error)
    .execute(&self.pool)
    .await
    .context("Failed to append notification log")?
    .last_insert_rowid();
    Ok(id)
  }

  pub async fn list_notification_log(
    &self,
    limit: i64,
  ) -> anyhow::Result<Vec<NotificationLogEntry>> {
    let rows = sqlx::query_as::<_, LogRow>(
      "SELECT id, rule_id, channel_id, event_kind, container_id, container_name, host_id, message, metadata, sent_at, success, error, read
       FROM notification_log ORDER BY sent_at DESC, id DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(&self.pool)
    .await
    .context("Failed to list notification log")?;
    rows
      .into_iter()
      .map(NotificationLogEntry::try_from)
      .collect()
  }

  pub async fn unread_notification_count(
    &self,
  ) -> anyhow::Result<i64> {
    sqlx::query_scalar(
      "SELECT COUNT(*) FROM notification_log WHERE read = 0 AND success = 1",
    )
    .fetch_one(&self.pool)
    .await
    .context("Failed to count unread notifications")
  }

  pub async fn mark_notifications_read(
    &self,
    ids: &[i64],
  ) -> anyhow::Result<()> {
    for id in ids {
      sqlx::query(
        "UPDATE notification_log SET read = 1 WHERE id = ?",
      )
      .bind(id)
      .execute(&self.pool)
      .await
      .context("Failed to mark notification read")?;
    }
    Ok(())
  }

  pub async fn mark_all_notifications_read(
    &self,
  ) -> anyhow::Result<()> {
    sqlx::query("UPDATE notification_log SET read = 1")
      .execute(&self.pool)
      .await
      .context("Failed to mark notifications read")?;
    Ok(())
  }

  pub async fn clear_notification_log(&self) -> anyhow::Result<()> {
    sqlx::query("DELETE FROM notification_log")
      .execute(&self.pool)
      .await
      .context("Failed to clear notification log")?;
    Ok(())
  }

  /// Most recent successful delivery for (rule, container, host) —
  /// the cooldown reference point.
  pub async fn last_successful_notification(
    &self,
    rule_id: i64,
    container_id: Option<&str>,
    host_id: Option<i64>,
  ) -> anyhow::Result<Option<DateTime<Utc>>> {
    let sent_at: Option<String> = sqlx::query_scalar(
      "SELECT sent_at FROM notification_log
       WHERE rule_id = ? AND success = 1
         AND COALESCE(container_id, '') = COALESCE(?, '')
         AND COALESCE(host_id, -1) = COALESCE(?, -1)
       ORDER BY sent_at DESC LIMIT 1",
    )
    .bind(rule_id)
    .bind(container_id)
    .bind(host_id)
    .fetch_optional(&self.pool)
    .await
    .context("Failed to query last notification")?;
    sent_at.as_deref().map(parse_timestamp).transpose()
  }

  /// Keep rows from the last 7 days; once the log has grown past 100
  /// rows, the 100 most recent also survive regardless of age. On a
  /// small log, age alone decides, so stale rows still expire.
  pub async fn cleanup_notification_log(
    &self,
    now: DateTime<Utc>,
  ) -> anyhow::Result<u64> {
    let cutoff = format_timestamp(
      &(now - Duration::days(LOG_RETENTION_DAYS)),
    );
    let total: i64 =
      sqlx::query_scalar("SELECT COUNT(*) FROM notification_log")
        .fetch_one(&self.pool)
        .await
        .context("Failed to count notification log")?;

    let result = if total > LOG_RETENTION_COUNT {
      sqlx::query(
        "DELETE FROM notification_log
         WHERE sent_at < ?
           AND id NOT IN (
             SELECT id FROM notification_log
             ORDER BY sent_at DESC, id DESC
             LIMIT ?
           )",
      )
      .bind(&cutoff)
      .bind(LOG_RETENTION_COUNT)
      .execute(&self.pool)
      .await
    } else {
      sqlx::query("DELETE FROM notification_log WHERE sent_at < ?")
        .bind(&cutoff)
        .execute(&self.pool)
        .await
    }
    .context("Failed to clean up notification log")?;
    Ok(result.rows_affected())
  }
}

#[cfg(test)]
mod tests {
  use census_client::entities::notification::ChannelKind;
  use chrono::{TimeZone, Utc};

  use super::*;
  use crate::test_client;

  fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 20, 12, 0, 0).unwrap()
  }

  async fn log_at(
    db: &Client,
    sent_at: DateTime<Utc>,
    success: bool,
  ) -> i64 {
    db.append_notification_log(
      1,
      1,
      EventKind::NewContainer,
      Some("cid"),
      Some("web"),
      Some(1),
      "msg",
      &serde_json::Value::Null,
      sent_at,
      success,
      None,
    )
    .await
    .unwrap()
  }

  #[tokio::test]
  async fn channel_round_trip() {
    let db = test_client().await;
    let channel = db
      .create_channel(&ChannelBody {
        name: String::from("ops"),
        config: ChannelConfig::Ntfy {
          server_url: String::from("https://ntfy.sh"),
          topic: String::from("census"),
          token: None,
        },
        enabled: true,
      })
      .await
      .unwrap();
    assert_eq!(channel.config.kind(), ChannelKind::Ntfy);
    let listed = db.list_channels().await.unwrap();
    assert_eq!(listed.len(), 1);
  }

  #[tokio::test]
  async fn rule_requires_channels_and_joins_them() {
    let db = test_client().await;
    let channel = db
      .create_channel(&ChannelBody {
        name: String::from("inapp"),
        config: ChannelConfig::InApp {},
        enabled: true,
      })
      .await
      .unwrap();

    let missing_channels = RuleBody {
      name: String::from("r"),
      enabled: true,
      event_kinds: vec![EventKind::NewContainer],
      host_id: None,
      container_pattern: None,
      image_pattern: None,
      cpu_threshold: None,
      memory_threshold: None,
      threshold_duration_seconds: 0,
      cooldown_seconds: 300,
      channel_ids: Vec::new(),
    };
    assert!(db.create_rule(&missing_channels).await.is_err());

    let rule = db
      .create_rule(&RuleBody {
        channel_ids: vec![channel.id],
        ..missing_channels
      })
      .await
      .unwrap();
    assert_eq!(rule.channel_ids, vec![channel.id]);

    // Deleting the channel cascades out of the join table.
    db.delete_channel(channel.id).await.unwrap();
    let rule = db.get_rule(rule.id).await.unwrap();
    assert!(rule.channel_ids.is_empty());
  }

  #[tokio::test]
  async fn silence_requires_selector() {
    let db = test_client().await;
    let empty = SilenceBody {
      host_id: None,
      host_pattern: None,
      container_id: None,
      container_name: None,
      container_pattern: None,
      silenced_until: now(),
      reason: String::new(),
    };
    assert!(db.create_silence(&empty).await.is_err());

    db.create_silence(&SilenceBody {
      container_pattern: Some(String::from("tmp-*")),
      ..empty
    })
    .await
    .unwrap();

    // Active filter excludes expired ones.
    assert!(
      db
        .list_active_silences(now() + Duration::hours(1))
        .await
        .unwrap()
        .is_empty()
    );
    assert_eq!(
      db.list_active_silences(now() - Duration::hours(1))
        .await
        .unwrap()
        .len(),
      1
    );
    assert_eq!(
      db.delete_expired_silences(now()).await.unwrap(),
      1
    );
  }

  #[tokio::test]
  async fn cooldown_lookup_ignores_failures_and_other_scopes() {
    let db = test_client().await;
    log_at(&db, now() - Duration::minutes(10), false).await;
    assert!(
      db.last_successful_notification(1, Some("cid"), Some(1))
        .await
        .unwrap()
        .is_none()
    );
    log_at(&db, now() - Duration::minutes(5), true).await;
    let sent = db
      .last_successful_notification(1, Some("cid"), Some(1))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(sent, now() - Duration::minutes(5));
    // Different container scope.
    assert!(
      db.last_successful_notification(1, Some("other"), Some(1))
        .await
        .unwrap()
        .is_none()
    );
  }

  #[tokio::test]
  async fn log_cleanup_small_table_ages_out() {
    let db = test_client().await;
    for _ in 0..5 {
      log_at(&db, now() - Duration::days(8), true).await;
    }
    for _ in 0..3 {
      log_at(&db, now() - Duration::hours(1), true).await;
    }
    let deleted =
      db.cleanup_notification_log(now()).await.unwrap();
    assert_eq!(deleted, 5);
    assert_eq!(
      db.list_notification_log(1000).await.unwrap().len(),
      3
    );
  }

  #[tokio::test]
  async fn log_cleanup_keeps_everything_within_window() {
    let db = test_client().await;
    for _ in 0..150 {
      log_at(&db, now() - Duration::days(1), true).await;
    }
    let deleted =
      db.cleanup_notification_log(now()).await.unwrap();
    assert_eq!(deleted, 0);
    assert_eq!(
      db.list_notification_log(1000).await.unwrap().len(),
      150
    );
  }

  #[tokio::test]
  async fn log_cleanup_union_of_recent_and_top_100() {
    let db = test_client().await;
    for _ in 0..150 {
      log_at(&db, now() - Duration::days(10), true).await;
    }
    for _ in 0..10 {
      log_at(&db, now() - Duration::hours(1), true).await;
    }
    db.cleanup_notification_log(now()).await.unwrap();
    let remaining =
      db.list_notification_log(1000).await.unwrap();
    // 100 most recent overall: the 10 young rows plus 90 old ones.
    assert_eq!(remaining.len(), 100);
    let young = remaining
      .iter()
      .filter(|entry| {
        entry.sent_at > now() - Duration::days(LOG_RETENTION_DAYS)
      })
      .count();
    assert_eq!(young, 10);
  }

  #[tokio::test]
  async fn clear_all_drops_everything() {
    let db = test_client().await;
    for _ in 0..5 {
      log_at(&db, now(), true).await;
    }
    db.clear_notification_log().await.unwrap();
    assert!(
      db.list_notification_log(10).await.unwrap().is_empty()
    );
  }

  #[tokio::test]
  async fn unread_count_and_mark_read() {
    let db = test_client().await;
    let id = log_at(&db, now(), true).await;
    log_at(&db, now(), true).await;
    assert_eq!(db.unread_notification_count().await.unwrap(), 2);
    db.mark_notifications_read(&[id]).await.unwrap();
    assert_eq!(db.unread_notification_count().await.unwrap(), 1);
    db.mark_all_notifications_read().await.unwrap();
    assert_eq!(db.unread_notification_count().await.unwrap(), 0);
  }
}

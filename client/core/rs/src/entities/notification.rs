use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Every kind of event the notification engine can produce.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  Display,
  EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
  NewContainer,
  ContainerStarted,
  ContainerStopped,
  ContainerPaused,
  ContainerResumed,
  StateChange,
  ImageUpdated,
  ContainerDisappeared,
  HighCpu,
  HighMemory,
  AnomalousBehavior,
}

impl EventKind {
  /// Whether the event carries a measurement that must clear a rule's
  /// threshold before the rule matches.
  pub fn is_threshold(self) -> bool {
    matches!(self, EventKind::HighCpu | EventKind::HighMemory)
  }
}

/// A detected event, before rule matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
  pub kind: EventKind,
  pub host_id: i64,
  pub host_name: String,
  pub container_id: String,
  pub container_name: String,
  pub image: String,
  pub image_id: String,
  pub timestamp: DateTime<Utc>,
  pub message: String,
  /// Measurement for threshold / anomaly events.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub cpu_percent: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub memory_percent: Option<f64>,
  /// When the breach driving a threshold event began.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub breached_since: Option<DateTime<Utc>>,
}

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
  EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChannelKind {
  Webhook,
  Ntfy,
  InApp,
}

/// Kind-specific delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelConfig {
  Webhook {
    url: String,
    #[serde(default)]
    headers: HashMap<String, String>,
  },
  Ntfy {
    server_url: String,
    topic: String,
    #[serde(default)]
    token: Option<String>,
  },
  InApp {},
}

impl ChannelConfig {
  pub fn kind(&self) -> ChannelKind {
    match self {
      ChannelConfig::Webhook { .. } => ChannelKind::Webhook,
      ChannelConfig::Ntfy { .. } => ChannelKind::Ntfy,
      ChannelConfig::InApp {} => ChannelKind::InApp,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationChannel {
  pub id: i64,
  pub name: String,
  #[serde(flatten)]
  pub config: ChannelConfig,
  pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRule {
  pub id: i64,
  pub name: String,
  pub enabled: bool,
  /// Kinds this rule subscribes to.
  pub event_kinds: Vec<EventKind>,
  /// Restrict to one host. Unset matches all hosts.
  #[serde(default)]
  pub host_id: Option<i64>,
  /// Glob over container names.
  #[serde(default)]
  pub container_pattern: Option<String>,
  /// Glob over image refs.
  #[serde(default)]
  pub image_pattern: Option<String>,
  #[serde(default)]
  pub cpu_threshold: Option<f64>,
  #[serde(default)]
  pub memory_threshold: Option<f64>,
  /// Minimum sustained breach before a threshold event fires.
  #[serde(default)]
  pub threshold_duration_seconds: i64,
  /// Minimum interval between successful notifications for the same
  /// (rule, container, host).
  #[serde(default = "default_cooldown")]
  pub cooldown_seconds: i64,
  /// Non-empty set of channel ids to deliver to.
  pub channel_ids: Vec<i64>,
}

fn default_cooldown() -> i64 {
  300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationLogEntry {
  pub id: i64,
  pub rule_id: i64,
  pub channel_id: i64,
  pub event_kind: EventKind,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub container_id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub container_name: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub host_id: Option<i64>,
  pub message: String,
  #[serde(default)]
  pub metadata: serde_json::Value,
  pub sent_at: DateTime<Utc>,
  pub success: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  pub read: bool,
}

/// Suppression rule. At least one host / container selector must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationSilence {
  pub id: i64,
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

impl NotificationSilence {
  pub fn has_selector(&self) -> bool {
    self.host_id.is_some()
      || self.host_pattern.is_some()
      || self.container_id.is_some()
      || self.container_name.is_some()
      || self.container_pattern.is_some()
  }
}

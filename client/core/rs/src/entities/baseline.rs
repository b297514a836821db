use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Rolling statistical summary of one container under one image,
/// used as the anomaly reference after image updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerBaseline {
  pub container_id: String,
  pub host_id: i64,
  pub image_id: String,
  pub avg_cpu: f64,
  pub avg_memory_percent: f64,
  pub avg_memory_usage: f64,
  pub sample_count: i64,
  pub window_start: DateTime<Utc>,
  pub window_end: DateTime<Utc>,
}

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
pub enum ThresholdKind {
  Cpu,
  Memory,
}

/// Persisted breach tracking. One row per (container, host, kind);
/// deleted on the first non-breaching sample so a re-breach starts
/// a fresh duration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdState {
  pub container_id: String,
  pub host_id: i64,
  pub threshold_kind: ThresholdKind,
  pub breached_since: DateTime<Utc>,
  pub last_notified_at: Option<DateTime<Utc>>,
  pub breach_count: i64,
}

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Anonymous aggregate submitted by an installation to a collector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryReport {
  pub installation_id: Uuid,
  pub version: String,
  pub host_count: i64,
  pub agent_count: i64,
  pub container_total: i64,
  /// Container counts keyed by state name.
  #[serde(default)]
  pub containers_by_state: HashMap<String, i64>,
  #[serde(default)]
  pub avg_cpu_percent: Option<f64>,
  #[serde(default)]
  pub avg_memory_percent: Option<f64>,
  #[serde(default)]
  pub total_memory_limit: i64,
  #[serde(default)]
  pub total_restarts: i64,
  #[serde(default)]
  pub images: Vec<ImageUsage>,
  /// Agent version -> host count.
  #[serde(default)]
  pub agent_versions: HashMap<String, i64>,
  #[serde(default)]
  pub timezone: String,
  pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUsage {
  /// Repository without tag, e.g. `nginx`.
  pub image: String,
  pub count: i64,
  pub size: i64,
}

/// Per-endpoint submission state, surfaced in the UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEndpoint {
  pub id: i64,
  pub url: String,
  pub enabled: bool,
  pub last_success: Option<DateTime<Utc>>,
  pub last_failure: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub failure_reason: Option<String>,
}

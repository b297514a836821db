use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::entities::container::ContainerState;

/// Derived (never stored) event in a container's timeline,
/// reconstructed from the append-only snapshot log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
  pub timestamp: DateTime<Utc>,
  pub container_name: String,
  pub host_id: i64,
  pub kind: LifecycleEventKind,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub old_state: Option<ContainerState>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub new_state: Option<ContainerState>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub old_image: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub new_image: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub old_image_id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub new_image_id: Option<String>,
  pub description: String,
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
pub enum LifecycleEventKind {
  FirstSeen,
  Started,
  Stopped,
  Paused,
  Resumed,
  StateChange,
  ImageUpdated,
  Disappeared,
  Reappeared,
  LastSeen,
}

/// Per-container rollup for the lifecycle list endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleSummary {
  pub container_name: String,
  pub host_id: i64,
  pub host_name: String,
  pub first_seen: DateTime<Utc>,
  pub last_seen: DateTime<Utc>,
  pub current_state: ContainerState,
  pub current_image: String,
  pub snapshot_count: i64,
  pub state_changes: i64,
}

/// Change report over an interval. Containers present in both the new
/// and removed sets are marked transient.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangesReport {
  pub start: DateTime<Utc>,
  pub end: DateTime<Utc>,
  pub new_containers: Vec<ChangeEntry>,
  pub removed_containers: Vec<ChangeEntry>,
  pub image_updates: Vec<ImageUpdateEntry>,
  pub state_changes: Vec<StateChangeEntry>,
  pub top_activity: Vec<ActivityEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEntry {
  pub container_name: String,
  pub host_id: i64,
  pub timestamp: DateTime<Utc>,
  pub image: String,
  /// Appeared and disappeared within the same interval.
  pub transient: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUpdateEntry {
  pub container_name: String,
  pub host_id: i64,
  pub timestamp: DateTime<Utc>,
  pub old_image: String,
  pub new_image: String,
  pub old_image_id: String,
  pub new_image_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChangeEntry {
  pub container_name: String,
  pub host_id: i64,
  pub timestamp: DateTime<Utc>,
  pub old_state: ContainerState,
  pub new_state: ContainerState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
  pub container_name: String,
  pub host_id: i64,
  pub transitions: i64,
}

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
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
pub enum ContainerState {
  Running,
  Exited,
  Paused,
  Restarting,
  Created,
  Dead,
  Removing,
  #[default]
  Other,
}

impl ContainerState {
  /// Lenient mapping from the daemon's state string.
  pub fn from_docker(raw: &str) -> ContainerState {
    raw
      .trim()
      .to_ascii_lowercase()
      .parse()
      .unwrap_or(ContainerState::Other)
  }
}

#[derive(
  Debug, Clone, Default, PartialEq, Serialize, Deserialize,
)]
pub struct PortMapping {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub ip: Option<String>,
  pub private_port: u16,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub public_port: Option<u16>,
  pub protocol: String,
}

/// One paired cpu / memory measurement. `None` fields mean
/// "not collected", not zero.
#[derive(
  Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize,
)]
pub struct StatsSample {
  pub cpu_percent: Option<f64>,
  pub memory: Option<MemorySample>,
}

#[derive(
  Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize,
)]
pub struct MemorySample {
  pub usage: u64,
  pub limit: u64,
  pub percent: f64,
}

/// Fully enriched live view of one container, as collected against the
/// daemon. The agent returns these; local / api / ssh hosts build the
/// same shape in-process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerInfo {
  pub id: String,
  pub name: String,
  pub image: String,
  pub image_id: String,
  pub state: ContainerState,
  pub status: String,
  #[serde(default)]
  pub ports: Vec<PortMapping>,
  #[serde(default)]
  pub labels: HashMap<String, String>,
  #[serde(default)]
  pub networks: Vec<String>,
  #[serde(default)]
  pub mounts: Vec<String>,
  #[serde(default)]
  pub links: Vec<String>,
  #[serde(default)]
  pub compose_project: Option<String>,
  #[serde(default)]
  pub restart_count: i64,
  #[serde(default)]
  pub created_at: Option<DateTime<Utc>>,
  /// Populated only when stats collection ran for this container.
  #[serde(default)]
  pub stats: Option<StatsSample>,
}

/// Immutable record of one container at one scan moment.
/// Primary key (container_id, host_id, scanned_at); rows are never updated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerSnapshot {
  pub container_id: String,
  pub host_id: i64,
  pub name: String,
  pub image: String,
  pub image_id: String,
  pub state: ContainerState,
  pub status_text: String,
  #[serde(default)]
  pub ports: Vec<PortMapping>,
  #[serde(default)]
  pub labels: HashMap<String, String>,
  #[serde(default)]
  pub networks: Vec<String>,
  #[serde(default)]
  pub mounts: Vec<String>,
  #[serde(default)]
  pub links: Vec<String>,
  #[serde(default)]
  pub compose_project: Option<String>,
  pub restart_count: i64,
  pub cpu_percent: Option<f64>,
  pub memory_usage: Option<i64>,
  pub memory_limit: Option<i64>,
  pub memory_percent: Option<f64>,
  pub scanned_at: DateTime<Utc>,
}

impl ContainerSnapshot {
  pub fn from_info(
    info: ContainerInfo,
    host_id: i64,
    scanned_at: DateTime<Utc>,
  ) -> ContainerSnapshot {
    // memory_usage implies memory_limit, enforced at construction.
    let memory = info.stats.as_ref().and_then(|s| s.memory);
    ContainerSnapshot {
      container_id: info.id,
      host_id,
      name: info.name,
      image: info.image,
      image_id: info.image_id,
      state: info.state,
      status_text: info.status,
      ports: info.ports,
      labels: info.labels,
      networks: info.networks,
      mounts: info.mounts,
      links: info.links,
      compose_project: info.compose_project,
      restart_count: info.restart_count,
      cpu_percent: info.stats.as_ref().and_then(|s| s.cpu_percent),
      memory_usage: memory.map(|m| m.usage as i64),
      memory_limit: memory.map(|m| m.limit as i64),
      memory_percent: memory.map(|m| m.percent),
      scanned_at,
    }
  }
}

/// One point of a container stats series. Granular snapshots map to
/// single-sample points; hourly aggregates carry their full bucket.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StatsPoint {
  pub ts: DateTime<Utc>,
  pub avg_cpu: f64,
  pub max_cpu: f64,
  pub avg_memory: f64,
  pub max_memory: f64,
  pub sample_count: i64,
}

/// Accepted values for the `range` query of the stats endpoint.
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
  EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StatsRange {
  #[strum(serialize = "1h")]
  #[serde(rename = "1h")]
  OneHour,
  #[default]
  #[strum(serialize = "24h")]
  #[serde(rename = "24h")]
  OneDay,
  #[strum(serialize = "7d")]
  #[serde(rename = "7d")]
  SevenDays,
  All,
}

impl StatsRange {
  pub fn start(self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match self {
      StatsRange::OneHour => Some(now - chrono::Duration::hours(1)),
      StatsRange::OneDay => Some(now - chrono::Duration::hours(24)),
      StatsRange::SevenDays => Some(now - chrono::Duration::days(7)),
      StatsRange::All => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn state_parses_daemon_strings() {
    assert_eq!(
      ContainerState::from_docker("running"),
      ContainerState::Running
    );
    assert_eq!(
      ContainerState::from_docker(" Exited "),
      ContainerState::Exited
    );
    assert_eq!(
      ContainerState::from_docker("weird"),
      ContainerState::Other
    );
  }

  #[test]
  fn range_parses() {
    assert_eq!("1h".parse::<StatsRange>().unwrap(), StatsRange::OneHour);
    assert_eq!("all".parse::<StatsRange>().unwrap(), StatsRange::All);
  }
}

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// `GET /health` on the agent. Public.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealth {
  pub status: String,
  pub version: String,
}

/// `GET /info` on the agent. Public.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentInfo {
  pub version: String,
  #[serde(default)]
  pub docker_version: Option<String>,
  #[serde(default)]
  pub os: Option<String>,
  #[serde(default)]
  pub containers: i64,
}

/// `GET /api/telemetry` on the agent: the aggregate the server folds
/// into its own telemetry report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentTelemetry {
  pub version: String,
  pub container_total: i64,
  #[serde(default)]
  pub containers_by_state: HashMap<String, i64>,
  #[serde(default)]
  pub image_count: i64,
}

/// `GET .../logs` responses from the agent and the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerLogs {
  pub lines: Vec<String>,
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// A configured Docker host. The scanner treats every enabled host as an
/// independent scan unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
  pub id: i64,
  /// Unique across the installation. Container identity across
  /// recreations is (container name, host), so renaming a host
  /// does not break history, but deleting one drops it.
  pub name: String,
  /// Address URI. Interpretation depends on `connection_type`:
  /// a unix socket path, an agent base url, a Docker API url,
  /// or `user@host` for ssh.
  pub address: String,
  pub connection_type: ConnectionType,
  /// Bearer token for agent hosts.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub token: Option<String>,
  pub enabled: bool,
  /// Whether to sample per-container cpu / memory during scans.
  pub collect_stats: bool,
  pub status: HostStatus,
  pub last_seen: Option<DateTime<Utc>>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

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
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionType {
  /// The local Docker socket.
  #[default]
  LocalSocket,
  /// A census agent reachable over http.
  Agent,
  /// The Docker Engine API exposed directly over tcp.
  DirectApi,
  /// The remote Docker socket forwarded through an ssh tunnel.
  Ssh,
}

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
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HostStatus {
  Online,
  Offline,
  AuthFailed,
  #[default]
  Unknown,
}

/// Body for `POST /api/hosts/agent` and `POST /api/hosts/agent/test`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateHostBody {
  pub name: String,
  pub address: String,
  #[serde(default)]
  pub connection_type: ConnectionType,
  #[serde(default)]
  pub token: Option<String>,
  #[serde(default = "default_enabled")]
  pub enabled: bool,
  #[serde(default = "default_enabled")]
  pub collect_stats: bool,
}

fn default_enabled() -> bool {
  true
}

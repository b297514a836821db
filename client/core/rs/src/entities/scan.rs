use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one scan of one host. Appended on success and failure both;
/// failed scans never persist partial snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
  pub id: i64,
  pub host_id: i64,
  pub started_at: DateTime<Utc>,
  pub completed_at: DateTime<Utc>,
  pub success: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  pub containers_found: i64,
}

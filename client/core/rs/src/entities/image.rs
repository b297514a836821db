use serde::{Deserialize, Serialize};

/// One image present on a host, as reported by the daemon's image list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageInfo {
  /// Content digest (`sha256:...`).
  pub id: String,
  #[serde(default)]
  pub tags: Vec<String>,
  /// Size in bytes.
  pub size: i64,
  /// Unix seconds.
  #[serde(default)]
  pub created: i64,
  /// Number of containers using the image, where the daemon reports it.
  #[serde(default)]
  pub containers: i64,
}

/// Image list entry on the server surface, tagged with the owning host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostImage {
  pub host_id: i64,
  pub host_name: String,
  #[serde(flatten)]
  pub image: ImageInfo,
}

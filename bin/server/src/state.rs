use std::sync::{Arc, OnceLock};

use anyhow::{Context, anyhow};
use arc_swap::ArcSwap;
use cache::CloneCache;
use census_client::entities::{
  baseline::ContainerBaseline, image::ImageInfo,
  settings::Settings,
};
use chrono::{DateTime, Utc};
use rate_limit::TokenBucket;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;

use crate::config::core_config;

static DB_CLIENT: OnceLock<database::Client> = OnceLock::new();

pub fn db_client() -> &'static database::Client {
  DB_CLIENT.get().unwrap_or_else(|| {
    error!(
      "FATAL: db_client accessed before initialized | Ensure init_db_client() is called during startup | Exiting..."
    );
    std::process::exit(1)
  })
}

/// Must be called in app startup sequence.
pub async fn init_db_client() {
  let init = async {
    let client =
      database::Client::new(&core_config().database_path)
        .await
        .context("failed to initialize database client")?;
    DB_CLIENT.set(client).map_err(|_| {
      anyhow!(
        "db_client initialized more than once - this should not happen"
      )
    })?;
    anyhow::Ok(())
  }
  .await;
  if let Err(e) = init {
    error!(
      "FATAL: Failed to initialize database::Client | {e:#} | Exiting..."
    );
    std::process::exit(1)
  }
}

/// Hot-reloaded settings snapshot. Background jobs read the current
/// value on every iteration.
pub fn settings() -> &'static ArcSwap<Settings> {
  static SETTINGS: OnceLock<ArcSwap<Settings>> = OnceLock::new();
  SETTINGS.get_or_init(Default::default)
}

/// Wakes the scanner loop immediately when the interval changes.
pub fn settings_changed() -> &'static watch::Sender<()> {
  static SETTINGS_CHANGED: OnceLock<watch::Sender<()>> =
    OnceLock::new();
  SETTINGS_CHANGED.get_or_init(|| watch::channel(()).0)
}

/// Cancelled on shutdown; every background loop selects on it.
pub fn shutdown() -> &'static CancellationToken {
  static SHUTDOWN: OnceLock<CancellationToken> = OnceLock::new();
  SHUTDOWN.get_or_init(CancellationToken::new)
}

/// Makes sure one host is never scanned twice simultaneously, and not
/// more often than once per second. Value is the last scan start in
/// unix ms.
pub fn scan_controller()
-> &'static CloneCache<i64, Arc<Mutex<i64>>> {
  static CONTROLLER: OnceLock<CloneCache<i64, Arc<Mutex<i64>>>> =
    OnceLock::new();
  CONTROLLER.get_or_init(Default::default)
}

/// Consecutive agent auth failures per host.
pub fn auth_failures() -> &'static CloneCache<i64, u32> {
  static AUTH_FAILURES: OnceLock<CloneCache<i64, u32>> =
    OnceLock::new();
  AUTH_FAILURES.get_or_init(Default::default)
}

/// Image list captured during each host's latest successful scan,
/// feeding telemetry aggregation.
pub fn host_images() -> &'static CloneCache<i64, Arc<Vec<ImageInfo>>>
{
  static HOST_IMAGES: OnceLock<
    CloneCache<i64, Arc<Vec<ImageInfo>>>,
  > = OnceLock::new();
  HOST_IMAGES.get_or_init(Default::default)
}

/// Post-image-update observation window with the captured pre-update
/// baseline. Keyed by (container_id, host_id).
#[derive(Debug, Clone)]
pub struct AnomalyWindow {
  pub pre_update: ContainerBaseline,
  pub started_at: DateTime<Utc>,
  pub breached_since: Option<DateTime<Utc>>,
}

pub fn anomaly_windows()
-> &'static CloneCache<(String, i64), AnomalyWindow> {
  static ANOMALY_WINDOWS: OnceLock<
    CloneCache<(String, i64), AnomalyWindow>,
  > = OnceLock::new();
  ANOMALY_WINDOWS.get_or_init(Default::default)
}

/// Global delivery budget: capacity = configured max per hour.
pub fn notification_bucket() -> &'static TokenBucket {
  static BUCKET: OnceLock<TokenBucket> = OnceLock::new();
  BUCKET.get_or_init(|| {
    TokenBucket::per_hour(
      settings().load().notifications.max_per_hour,
    )
  })
}

#[derive(Debug, Clone, Default)]
pub struct VersionInfo {
  pub latest_version: Option<String>,
  pub release_url: Option<String>,
}

pub fn version_info() -> &'static ArcSwap<VersionInfo> {
  static VERSION_INFO: OnceLock<ArcSwap<VersionInfo>> =
    OnceLock::new();
  VERSION_INFO.get_or_init(Default::default)
}

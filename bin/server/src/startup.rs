use std::sync::Arc;

use chrono::Utc;

use crate::{
  config::core_config,
  jobs, notify, scanner,
  state::{db_client, settings},
  telemetry, version,
};

/// Runs after the database client is initialized, before the HTTP
/// surface comes up.
pub async fn on_startup() {
  let db = db_client();
  let config = core_config();

  let mut loaded = match db.load_settings().await {
    Ok(loaded) => loaded,
    Err(e) => {
      error!(
        "Failed to load settings, using defaults | {e:#}"
      );
      Default::default()
    }
  };
  // Environment overrides are applied and persisted, so the database
  // stays the single source of truth afterwards.
  if let Some(interval) = config.scanner_interval_seconds {
    loaded.scanner.interval_seconds = interval;
  }
  if let Some(interval) = config.telemetry_interval_hours {
    loaded.telemetry.interval_hours = interval;
  }
  if let Err(e) = db.save_settings(&loaded).await {
    error!("Failed to persist settings | {e:#}");
  }
  settings().store(Arc::new(loaded));

  if let Err(e) = db.ensure_local_host(Utc::now()).await {
    error!("Failed to seed local host | {e:#}");
  }
  if let Err(e) = db
    .ensure_telemetry_endpoints(&config.telemetry_endpoints)
    .await
  {
    error!("Failed to seed telemetry endpoints | {e:#}");
  }
  match db.installation_id().await {
    Ok(id) => debug!("Installation id: {id}"),
    Err(e) => error!("Failed to ensure installation id | {e:#}"),
  }
}

pub fn spawn_background_tasks() {
  scanner::spawn_scanner_loop();
  jobs::spawn_maintenance_loops();
  notify::spawn_silence_expiry_loop();
  notify::batch::spawn_batch_flush_loop();
  telemetry::spawn_telemetry_loop();
  version::spawn_version_check_loop();
}

use std::sync::Arc;

use axum::{
  Json, Router,
  http::StatusCode,
  routing::{get, post},
};
use census_client::entities::settings::{
  Settings, UpdateScannerConfigBody,
};
use serror::{AddStatusCode, AddStatusCodeError};

use crate::state::{
  db_client, notification_bucket, settings, settings_changed,
};

pub fn router() -> Router {
  Router::new()
    .route("/", get(read).post(update))
    .route("/scanner", post(update_scanner))
}

async fn read() -> Json<Settings> {
  Json(settings().load().as_ref().clone())
}

/// Persist, then swap the live snapshot and nudge the running
/// subsystems. The scanner re-arms its ticker; the rate limiter takes
/// the new capacity; everything else reads the snapshot on its next
/// iteration.
async fn apply(new_settings: Settings) -> serror::Result<()> {
  db_client().save_settings(&new_settings).await?;
  notification_bucket().set_capacity_per_hour(
    new_settings.notifications.max_per_hour,
  );
  settings().store(Arc::new(new_settings));
  settings_changed().send(()).ok();
  Ok(())
}

async fn update(
  Json(body): Json<Settings>,
) -> serror::Result<Json<Settings>> {
  validate(&body).status_code(StatusCode::BAD_REQUEST)?;
  apply(body.clone()).await?;
  Ok(Json(body))
}

async fn update_scanner(
  Json(body): Json<UpdateScannerConfigBody>,
) -> serror::Result<Json<Settings>> {
  let mut new_settings = settings().load().as_ref().clone();
  new_settings.scanner.interval_seconds = body.interval_seconds;
  if let Some(timeout) = body.timeout_seconds {
    new_settings.scanner.timeout_seconds = timeout;
  }
  validate(&new_settings).status_code(StatusCode::BAD_REQUEST)?;
  apply(new_settings.clone()).await?;
  Ok(Json(new_settings))
}

/// An invalid update returns 400 and changes nothing.
fn validate(settings: &Settings) -> anyhow::Result<()> {
  if settings.scanner.interval_seconds < 10 {
    return Err(anyhow::anyhow!(
      "Scan interval must be at least 10 seconds"
    ));
  }
  if settings.scanner.timeout_seconds == 0 {
    return Err(anyhow::anyhow!(
      "Scan timeout must be positive"
    ));
  }
  if settings.notifications.max_per_hour == 0 {
    return Err(anyhow::anyhow!(
      "Notification rate limit must be positive"
    ));
  }
  if settings.baselines.window_hours <= 0
    || settings.baselines.min_samples <= 0
  {
    return Err(anyhow::anyhow!(
      "Baseline window and sample minimum must be positive"
    ));
  }
  if settings.retention.snapshot_days <= 0 {
    return Err(anyhow::anyhow!(
      "Retention horizon must be positive"
    ));
  }
  Ok(())
}

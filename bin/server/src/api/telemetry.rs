use axum::{
  Json, Router,
  routing::{get, post},
};
use census_client::entities::telemetry::{
  TelemetryEndpoint, TelemetryReport,
};

use crate::{state::db_client, telemetry};

pub fn router() -> Router {
  Router::new()
    .route("/", get(status))
    .route("/preview", get(preview))
    .route("/reset", post(reset))
}

/// Per-endpoint submission state.
async fn status() -> serror::Result<Json<Vec<TelemetryEndpoint>>> {
  Ok(Json(db_client().list_telemetry_endpoints().await?))
}

/// The exact aggregate that would be submitted, for user inspection.
async fn preview() -> serror::Result<Json<TelemetryReport>> {
  Ok(Json(telemetry::build_report().await?))
}

/// Clear recorded failures so submission is retried cleanly.
async fn reset() -> serror::Result<Json<serde_json::Value>> {
  db_client().reset_telemetry_failures().await?;
  Ok(Json(serde_json::json!({ "reset": true })))
}

use axum::Json;
use serde::Serialize;

use crate::{state::version_info, version::update_available};

#[derive(Serialize)]
pub struct HealthResponse {
  pub status: &'static str,
  pub version: &'static str,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub latest_version: Option<String>,
  pub update_available: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub release_url: Option<String>,
}

pub async fn health() -> Json<HealthResponse> {
  let info = version_info().load();
  Json(HealthResponse {
    status: "ok",
    version: env!("CARGO_PKG_VERSION"),
    latest_version: info.latest_version.clone(),
    update_available: update_available(
      info.latest_version.as_deref(),
    ),
    release_url: info.release_url.clone(),
  })
}

use std::sync::Arc;

use axum::{
  Json, Router,
  extract::{Request, State},
  http::{StatusCode, header},
  middleware::{self, Next},
  response::{IntoResponse, Response},
  routing::{get, post},
};
use census_client::entities::telemetry::TelemetryReport;
use chrono::Utc;
use data_encoding::BASE64;

use crate::{config::collector_config, store::Store};

pub type AppState = Arc<Store>;

pub fn app(store: AppState) -> Router {
  let dashboard = Router::new()
    .route("/summary", get(summary))
    .route("/versions", get(versions))
    .route("/timeline", get(timeline))
    .layer(middleware::from_fn(require_basic_auth));

  Router::new()
    .route("/health", get(health))
    .route("/api/ingest", post(ingest))
    .nest("/api/stats", dashboard)
    .with_state(store)
}

async fn health() -> Json<serde_json::Value> {
  Json(serde_json::json!({
    "status": "ok",
    "version": env!("CARGO_PKG_VERSION"),
  }))
}

/// Public, unauthenticated by design: installations only ever push
/// anonymous aggregates here.
async fn ingest(
  State(store): State<AppState>,
  Json(report): Json<TelemetryReport>,
) -> serror::Result<StatusCode> {
  store.ingest(&report, Utc::now()).await?;
  Ok(StatusCode::ACCEPTED)
}

async fn summary(
  State(store): State<AppState>,
) -> serror::Result<Json<serde_json::Value>> {
  Ok(Json(store.summary().await?))
}

async fn versions(
  State(store): State<AppState>,
) -> serror::Result<Json<serde_json::Value>> {
  Ok(Json(serde_json::to_value(store.versions().await?)?))
}

async fn timeline(
  State(store): State<AppState>,
) -> serror::Result<Json<serde_json::Value>> {
  let days = store
    .timeline(30)
    .await?
    .into_iter()
    .map(|(day, count)| {
      serde_json::json!({ "day": day, "installations": count })
    })
    .collect::<Vec<_>>();
  Ok(Json(serde_json::Value::Array(days)))
}

async fn require_basic_auth(
  request: Request,
  next: Next,
) -> Response {
  let config = collector_config();
  if !config.auth_enabled {
    return next.run(request).await;
  }

  let authorized = request
    .headers()
    .get(header::AUTHORIZATION)
    .and_then(|value| value.to_str().ok())
    .and_then(|value| value.strip_prefix("Basic "))
    .and_then(|encoded| BASE64.decode(encoded.as_bytes()).ok())
    .and_then(|decoded| String::from_utf8(decoded).ok())
    .is_some_and(|credentials| {
      credentials
        == format!(
          "{}:{}",
          config.auth_username, config.auth_password
        )
    });

  if authorized {
    next.run(request).await
  } else {
    (
      StatusCode::UNAUTHORIZED,
      [(header::WWW_AUTHENTICATE, "Basic realm=\"census\"")],
      "unauthorized",
    )
      .into_response()
  }
}

use axum::{
  Router,
  extract::Request,
  http::{HeaderName, HeaderValue, StatusCode, header},
  middleware::{self, Next},
  response::{IntoResponse, Response},
  routing::get,
};
use data_encoding::BASE64;
use tower_http::{
  cors::CorsLayer, set_header::SetResponseHeaderLayer,
};

use crate::config::core_config;

mod config;
mod containers;
mod health;
mod hosts;
mod images;
mod metrics;
mod notifications;
mod reports;
mod scan;
mod telemetry;

pub fn app() -> Router {
  let api = Router::new()
    .route("/health", get(health::health))
    .nest("/hosts", hosts::router())
    .nest("/containers", containers::router())
    .nest("/images", images::router())
    .nest("/scan", scan::router())
    .nest("/notifications", notifications::router())
    .nest("/config", config::router())
    .nest("/telemetry", telemetry::router())
    .nest("/reports", reports::router())
    .route("/metrics", get(metrics::metrics));

  Router::new()
    .nest("/api", api)
    .layer(middleware::from_fn(require_basic_auth))
    .layer(
      CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any),
    )
    .layer(SetResponseHeaderLayer::overriding(
      HeaderName::from_static("x-content-type-options"),
      HeaderValue::from_static("nosniff"),
    ))
    .layer(SetResponseHeaderLayer::overriding(
      HeaderName::from_static("x-frame-options"),
      HeaderValue::from_static("DENY"),
    ))
}

/// Optional basic auth over `/api/*`. The health route stays public so
/// load balancers and the UI can always probe it.
async fn require_basic_auth(request: Request, next: Next) -> Response {
  let config = core_config();
  if !config.auth_enabled
    || request.uri().path() == "/api/health"
  {
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

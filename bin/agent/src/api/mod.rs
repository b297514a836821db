use axum::{
  Router,
  extract::Request,
  http::{StatusCode, header},
  middleware::{self, Next},
  response::{IntoResponse, Response},
  routing::get,
};
use axum::Json;
use census_client::entities::agent::{AgentHealth, AgentInfo};

use crate::{config::agent_config, state::docker_client};

mod containers;
mod images;
mod telemetry;

/// Header carrying the bearer token; `Authorization: Bearer` is
/// also accepted.
const TOKEN_HEADER: &str = "x-api-token";

pub fn app() -> Router {
  let protected = Router::new()
    .nest("/containers", containers::router())
    .nest("/images", images::router())
    .route("/telemetry", get(telemetry::telemetry))
    .layer(middleware::from_fn(require_token));

  Router::new()
    .route("/health", get(health))
    .route("/info", get(info))
    .nest("/api", protected)
}

async fn require_token(request: Request, next: Next) -> Response {
  let headers = request.headers();
  let presented = headers
    .get(TOKEN_HEADER)
    .and_then(|value| value.to_str().ok())
    .or_else(|| {
      headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
    });

  match presented {
    Some(token) if token == agent_config().token => {
      next.run(request).await
    }
    _ => (
      StatusCode::UNAUTHORIZED,
      axum::Json(serde_json::json!({
        "error": "API token mismatch — please verify the token is correct"
      })),
    )
      .into_response(),
  }
}

async fn health() -> Json<AgentHealth> {
  Json(AgentHealth {
    status: String::from("ok"),
    version: env!("CARGO_PKG_VERSION").to_string(),
  })
}

async fn info() -> serror::Result<Json<AgentInfo>> {
  let docker = docker_client().get()?;
  let (docker_version, operating_system, containers) = tokio::join!(
    docker.version(),
    docker.operating_system(),
    docker.list_containers(false, 1),
  );
  Ok(Json(AgentInfo {
    version: env!("CARGO_PKG_VERSION").to_string(),
    docker_version: docker_version.unwrap_or_default(),
    os: operating_system.unwrap_or_default(),
    containers: containers.map(|c| c.len() as i64).unwrap_or(-1),
  }))
}

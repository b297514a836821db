use axum::{
  Json, Router,
  extract::Path,
  routing::{delete, get, post},
};
use census_client::entities::host::{CreateHostBody, Host};
use chrono::Utc;
use serror::{AddStatusCode, AddStatusCodeError};

use crate::{connection, state::db_client};

pub fn router() -> Router {
  Router::new()
    .route("/", get(list))
    .route("/{id}", get(get_one))
    .route("/{id}", delete(remove))
    .route("/agent", post(create))
    .route("/agent/test", post(test))
}

async fn list() -> serror::Result<Json<Vec<Host>>> {
  Ok(Json(db_client().list_hosts().await?))
}

async fn get_one(
  Path(id): Path<i64>,
) -> serror::Result<Json<Host>> {
  Ok(Json(
    db_client()
      .get_host(id)
      .await
      .status_code(axum::http::StatusCode::NOT_FOUND)?,
  ))
}

async fn create(
  Json(body): Json<CreateHostBody>,
) -> serror::Result<Json<Host>> {
  if body.name.trim().is_empty() || body.address.trim().is_empty() {
    return Err(
      anyhow::anyhow!("Host name and address are required")
        .status_code(axum::http::StatusCode::BAD_REQUEST),
    );
  }
  let host = db_client().create_host(&body, Utc::now()).await?;
  Ok(Json(host))
}

/// Probe connectivity (and for agents, the token) without persisting
/// anything.
async fn test(
  Json(body): Json<CreateHostBody>,
) -> serror::Result<Json<serde_json::Value>> {
  let probe = Host {
    id: 0,
    name: body.name.clone(),
    address: body.address.clone(),
    connection_type: body.connection_type,
    token: body.token.clone(),
    enabled: true,
    collect_stats: false,
    status: Default::default(),
    last_seen: None,
    created_at: Utc::now(),
    updated_at: Utc::now(),
  };
  let handle = connection::connect(&probe).await?;
  handle.test().await?;
  Ok(Json(serde_json::json!({ "reachable": true })))
}

async fn remove(
  Path(id): Path<i64>,
) -> serror::Result<Json<serde_json::Value>> {
  db_client().delete_host(id).await?;
  Ok(Json(serde_json::json!({ "deleted": id })))
}

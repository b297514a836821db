use axum::{
  Json, Router,
  extract::{Path, Query},
  routing::{get, post},
};
use census_client::entities::{
  agent::ContainerLogs, container::ContainerInfo,
};
use serde::Deserialize;

use crate::state::docker_client;

/// Inspect / stats fan-out width within one listing.
const WORKERS: usize = 8;

pub fn router() -> Router {
  Router::new()
    .route("/", get(list))
    .route("/{id}/start", post(start))
    .route("/{id}/stop", post(stop))
    .route("/{id}/restart", post(restart))
    .route("/{id}/remove", post(remove))
    .route("/{id}/logs", get(logs))
}

#[derive(Deserialize)]
struct ListQuery {
  #[serde(default)]
  stats: bool,
}

async fn list(
  Query(query): Query<ListQuery>,
) -> serror::Result<Json<Vec<ContainerInfo>>> {
  let docker = docker_client().get()?;
  let containers =
    docker.list_containers(query.stats, WORKERS).await?;
  Ok(Json(containers))
}

#[derive(Deserialize)]
struct TimeoutQuery {
  timeout: Option<i32>,
}

#[derive(Deserialize)]
struct ForceQuery {
  #[serde(default)]
  force: bool,
}

async fn start(
  Path(id): Path<String>,
) -> serror::Result<Json<serde_json::Value>> {
  docker_client().get()?.start_container(&id).await?;
  Ok(Json(serde_json::json!({ "started": id })))
}

async fn stop(
  Path(id): Path<String>,
  Query(query): Query<TimeoutQuery>,
) -> serror::Result<Json<serde_json::Value>> {
  docker_client()
    .get()?
    .stop_container(&id, query.timeout)
    .await?;
  Ok(Json(serde_json::json!({ "stopped": id })))
}

async fn restart(
  Path(id): Path<String>,
  Query(query): Query<TimeoutQuery>,
) -> serror::Result<Json<serde_json::Value>> {
  docker_client()
    .get()?
    .restart_container(&id, query.timeout)
    .await?;
  Ok(Json(serde_json::json!({ "restarted": id })))
}

async fn remove(
  Path(id): Path<String>,
  Query(query): Query<ForceQuery>,
) -> serror::Result<Json<serde_json::Value>> {
  docker_client()
    .get()?
    .remove_container(&id, query.force)
    .await?;
  Ok(Json(serde_json::json!({ "removed": id })))
}

#[derive(Deserialize)]
struct LogsQuery {
  #[serde(default = "default_tail")]
  tail: u64,
}

fn default_tail() -> u64 {
  100
}

async fn logs(
  Path(id): Path<String>,
  Query(query): Query<LogsQuery>,
) -> serror::Result<Json<ContainerLogs>> {
  let logs = docker_client()
    .get()?
    .container_logs(&id, query.tail)
    .await?;
  Ok(Json(logs))
}

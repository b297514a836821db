use axum::{
  Json, Router,
  extract::{Path, Query},
  http::StatusCode,
  routing::{delete, get, post},
};
use census_client::entities::{
  agent::ContainerLogs,
  container::{ContainerSnapshot, StatsPoint, StatsRange},
  lifecycle::{LifecycleEvent, LifecycleSummary},
  parse_timestamp,
};
use chrono::Utc;
use serde::Deserialize;
use serror::{AddStatusCode, AddStatusCodeError};

use crate::{connection, state::db_client};

pub fn router() -> Router {
  Router::new()
    .route("/", get(list))
    .route("/host/{id}", get(list_for_host))
    .route("/history", get(history))
    .route("/lifecycle", get(lifecycle_summaries))
    .route(
      "/lifecycle/{host_id}/{container_name}",
      get(lifecycle_events),
    )
    .route("/{host_id}/{container_id}/start", post(start))
    .route("/{host_id}/{container_id}/stop", post(stop))
    .route("/{host_id}/{container_id}/restart", post(restart))
    .route("/{host_id}/{container_id}", delete(remove))
    .route("/{host_id}/{container_id}/logs", get(logs))
    .route("/{host_id}/{container_id}/stats", get(stats))
}

async fn list() -> serror::Result<Json<Vec<ContainerSnapshot>>> {
  Ok(Json(db_client().latest_per_host().await?))
}

async fn list_for_host(
  Path(id): Path<i64>,
) -> serror::Result<Json<Vec<ContainerSnapshot>>> {
  Ok(Json(db_client().latest_for_host(id).await?))
}

#[derive(Deserialize)]
struct HistoryQuery {
  start: String,
  end: String,
  host_id: Option<i64>,
}

async fn history(
  Query(query): Query<HistoryQuery>,
) -> serror::Result<Json<Vec<ContainerSnapshot>>> {
  let start = parse_timestamp(&query.start)
    .status_code(StatusCode::BAD_REQUEST)?;
  let end = parse_timestamp(&query.end)
    .status_code(StatusCode::BAD_REQUEST)?;
  Ok(Json(
    db_client().history(start, end, query.host_id).await?,
  ))
}

#[derive(Deserialize)]
struct LifecycleQuery {
  #[serde(default = "default_limit")]
  limit: i64,
  host_id: Option<i64>,
}

fn default_limit() -> i64 {
  100
}

async fn lifecycle_summaries(
  Query(query): Query<LifecycleQuery>,
) -> serror::Result<Json<Vec<LifecycleSummary>>> {
  Ok(Json(
    db_client()
      .lifecycle_summaries(query.limit, query.host_id)
      .await?,
  ))
}

async fn lifecycle_events(
  Path((host_id, container_name)): Path<(i64, String)>,
) -> serror::Result<Json<Vec<LifecycleEvent>>> {
  Ok(Json(
    db_client()
      .lifecycle_events(&container_name, host_id)
      .await?,
  ))
}

#[derive(Deserialize)]
struct TimeoutQuery {
  /// Seconds the daemon waits before killing, for stop / restart.
  #[serde(default = "default_timeout")]
  timeout: i32,
}

fn default_timeout() -> i32 {
  10
}

async fn handle_for(
  host_id: i64,
) -> serror::Result<connection::HostHandle> {
  let host = db_client()
    .get_host(host_id)
    .await
    .status_code(StatusCode::NOT_FOUND)?;
  Ok(connection::connect(&host).await?)
}

async fn start(
  Path((host_id, container_id)): Path<(i64, String)>,
) -> serror::Result<Json<serde_json::Value>> {
  handle_for(host_id).await?.start_container(&container_id).await?;
  Ok(Json(serde_json::json!({ "started": container_id })))
}

async fn stop(
  Path((host_id, container_id)): Path<(i64, String)>,
  Query(query): Query<TimeoutQuery>,
) -> serror::Result<Json<serde_json::Value>> {
  handle_for(host_id)
    .await?
    .stop_container(&container_id, Some(query.timeout))
    .await?;
  Ok(Json(serde_json::json!({ "stopped": container_id })))
}

async fn restart(
  Path((host_id, container_id)): Path<(i64, String)>,
  Query(query): Query<TimeoutQuery>,
) -> serror::Result<Json<serde_json::Value>> {
  handle_for(host_id)
    .await?
    .restart_container(&container_id, Some(query.timeout))
    .await?;
  Ok(Json(serde_json::json!({ "restarted": container_id })))
}

#[derive(Deserialize)]
struct ForceQuery {
  #[serde(default)]
  force: bool,
}

async fn remove(
  Path((host_id, container_id)): Path<(i64, String)>,
  Query(query): Query<ForceQuery>,
) -> serror::Result<Json<serde_json::Value>> {
  handle_for(host_id)
    .await?
    .remove_container(&container_id, query.force)
    .await?;
  Ok(Json(serde_json::json!({ "removed": container_id })))
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
  Path((host_id, container_id)): Path<(i64, String)>,
  Query(query): Query<LogsQuery>,
) -> serror::Result<Json<ContainerLogs>> {
  let logs = handle_for(host_id)
    .await?
    .container_logs(&container_id, query.tail)
    .await?;
  Ok(Json(logs))
}

#[derive(Deserialize)]
struct StatsQuery {
  #[serde(default)]
  range: StatsRange,
}

async fn stats(
  Path((host_id, container_id)): Path<(i64, String)>,
  Query(query): Query<StatsQuery>,
) -> serror::Result<Json<Vec<StatsPoint>>> {
  Ok(Json(
    db_client()
      .container_stats(
        &container_id,
        host_id,
        query.range,
        Utc::now(),
      )
      .await?,
  ))
}

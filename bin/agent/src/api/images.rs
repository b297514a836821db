use axum::{
  Json, Router,
  extract::{Path, Query},
  routing::{get, post},
};
use census_client::entities::image::ImageInfo;
use serde::Deserialize;

use crate::state::docker_client;

pub fn router() -> Router {
  Router::new()
    .route("/", get(list))
    .route("/{id}/remove", post(remove))
    .route("/prune", post(prune))
}

async fn list() -> serror::Result<Json<Vec<ImageInfo>>> {
  let images = docker_client().get()?.list_images().await?;
  Ok(Json(images))
}

#[derive(Deserialize)]
struct ForceQuery {
  #[serde(default)]
  force: bool,
}

async fn remove(
  Path(id): Path<String>,
  Query(query): Query<ForceQuery>,
) -> serror::Result<Json<serde_json::Value>> {
  docker_client().get()?.remove_image(&id, query.force).await?;
  Ok(Json(serde_json::json!({ "removed": id })))
}

async fn prune() -> serror::Result<Json<serde_json::Value>> {
  let space_reclaimed = docker_client().get()?.prune_images().await?;
  Ok(Json(
    serde_json::json!({ "space_reclaimed": space_reclaimed }),
  ))
}

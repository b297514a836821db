use axum::{
  Json, Router,
  extract::{Path, Query},
  routing::{delete, get, post},
};
use census_client::entities::image::HostImage;
use futures_util::future::join_all;
use serde::Deserialize;
use serror::{AddStatusCode, AddStatusCodeError};

use crate::{connection, state::db_client};

pub fn router() -> Router {
  Router::new()
    .route("/", get(list_all))
    .route("/host/{id}", get(list_for_host))
    .route("/host/{id}/prune", post(prune))
    .route("/{host_id}/{image_id}", delete(remove))
}

/// Live image lists across all enabled hosts. Per-host failures are
/// skipped so one offline host does not blank the page.
async fn list_all() -> serror::Result<Json<Vec<HostImage>>> {
  let hosts = db_client().list_enabled_hosts().await?;
  let per_host = join_all(hosts.iter().map(|host| async {
    let handle = connection::connect(host).await.ok()?;
    let images = handle
      .list_images()
      .await
      .inspect_err(|e| {
        debug!("Image list failed for {} | {e:#}", host.name)
      })
      .ok()?;
    Some(
      images
        .into_iter()
        .map(|image| HostImage {
          host_id: host.id,
          host_name: host.name.clone(),
          image,
        })
        .collect::<Vec<_>>(),
    )
  }))
  .await;
  Ok(Json(per_host.into_iter().flatten().flatten().collect()))
}

async fn list_for_host(
  Path(id): Path<i64>,
) -> serror::Result<Json<Vec<HostImage>>> {
  let host = db_client()
    .get_host(id)
    .await
    .status_code(axum::http::StatusCode::NOT_FOUND)?;
  let handle = connection::connect(&host).await?;
  let images = handle
    .list_images()
    .await?
    .into_iter()
    .map(|image| HostImage {
      host_id: host.id,
      host_name: host.name.clone(),
      image,
    })
    .collect();
  Ok(Json(images))
}

#[derive(Deserialize)]
struct ForceQuery {
  #[serde(default)]
  force: bool,
}

async fn remove(
  Path((host_id, image_id)): Path<(i64, String)>,
  Query(query): Query<ForceQuery>,
) -> serror::Result<Json<serde_json::Value>> {
  let host = db_client()
    .get_host(host_id)
    .await
    .status_code(axum::http::StatusCode::NOT_FOUND)?;
  connection::connect(&host)
    .await?
    .remove_image(&image_id, query.force)
    .await?;
  Ok(Json(serde_json::json!({ "removed": image_id })))
}

async fn prune(
  Path(id): Path<i64>,
) -> serror::Result<Json<serde_json::Value>> {
  let host = db_client()
    .get_host(id)
    .await
    .status_code(axum::http::StatusCode::NOT_FOUND)?;
  let space_reclaimed =
    connection::connect(&host).await?.prune_images().await?;
  Ok(Json(
    serde_json::json!({ "space_reclaimed": space_reclaimed }),
  ))
}

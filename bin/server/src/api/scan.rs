use axum::{
  Json, Router,
  extract::Query,
  routing::{get, post},
};
use census_client::entities::scan::ScanResult;
use serde::Deserialize;
use serror::{AddStatusCode, AddStatusCodeError};

use crate::{scanner, state::db_client};

pub fn router() -> Router {
  Router::new()
    .route("/", post(trigger))
    .route("/results", get(results))
}

#[derive(Deserialize, Default)]
struct TriggerBody {
  /// Scan only this host; omitted means all enabled hosts.
  host_id: Option<i64>,
}

/// Manual scans run the same path as the scheduler, but wait for any
/// in-flight scan of the same host instead of yielding to it.
async fn trigger(
  body: Option<Json<TriggerBody>>,
) -> serror::Result<Json<Vec<ScanResult>>> {
  let body = body.map(|Json(body)| body).unwrap_or_default();
  let results = match body.host_id {
    Some(host_id) => {
      let host = db_client()
        .get_host(host_id)
        .await
        .status_code(axum::http::StatusCode::NOT_FOUND)?;
      scanner::scan_one(&host, true)
        .await
        .into_iter()
        .collect()
    }
    None => scanner::scan_all(true).await,
  };
  Ok(Json(results))
}

#[derive(Deserialize)]
struct ResultsQuery {
  #[serde(default = "default_limit")]
  limit: i64,
}

fn default_limit() -> i64 {
  50
}

async fn results(
  Query(query): Query<ResultsQuery>,
) -> serror::Result<Json<Vec<ScanResult>>> {
  Ok(Json(
    db_client().list_scan_results(query.limit).await?,
  ))
}

use axum::{Json, Router, extract::Query, routing::get};
use census_client::entities::{
  lifecycle::ChangesReport, parse_timestamp,
};
use serde::Deserialize;
use serror::{AddStatusCode, AddStatusCodeError};

use crate::state::db_client;

pub fn router() -> Router {
  Router::new().route("/changes", get(changes))
}

#[derive(Deserialize)]
struct ChangesQuery {
  start: String,
  end: String,
  host_id: Option<i64>,
}

async fn changes(
  Query(query): Query<ChangesQuery>,
) -> serror::Result<Json<ChangesReport>> {
  let start = parse_timestamp(&query.start)
    .status_code(axum::http::StatusCode::BAD_REQUEST)?;
  let end = parse_timestamp(&query.end)
    .status_code(axum::http::StatusCode::BAD_REQUEST)?;
  if end <= start {
    return Err(
      anyhow::anyhow!("'end' must be after 'start'")
        .status_code(axum::http::StatusCode::BAD_REQUEST),
    );
  }
  Ok(Json(
    db_client().changes_report(start, end, query.host_id).await?,
  ))
}

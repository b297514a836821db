use axum::{
  Json, Router,
  extract::{Path, Query},
  http::StatusCode,
  routing::{delete, get, post, put},
};
use census_client::entities::notification::{
  NotificationChannel, NotificationLogEntry, NotificationRule,
  NotificationSilence,
};
use chrono::Utc;
use database::{ChannelBody, RuleBody, SilenceBody};
use serde::Deserialize;
use serror::{AddStatusCode, AddStatusCodeError};

use crate::{
  notify::{batch, channels},
  state::db_client,
};

pub fn router() -> Router {
  Router::new()
    .route("/channels", get(list_channels).post(create_channel))
    .route("/channels/{id}", put(update_channel))
    .route("/channels/{id}", delete(delete_channel))
    .route("/channels/{id}/test", post(test_channel))
    .route("/rules", get(list_rules).post(create_rule))
    .route("/rules/{id}", put(update_rule))
    .route("/rules/{id}", delete(delete_rule))
    .route("/log", get(log).delete(clear_log))
    .route("/log/read", post(mark_read))
    .route("/log/read-all", post(mark_all_read))
    .route("/silences", get(list_silences).post(create_silence))
    .route("/silences/{id}", delete(delete_silence))
    .route("/status", get(status))
}

async fn list_channels()
-> serror::Result<Json<Vec<NotificationChannel>>> {
  Ok(Json(db_client().list_channels().await?))
}

async fn create_channel(
  Json(body): Json<ChannelBody>,
) -> serror::Result<Json<NotificationChannel>> {
  Ok(Json(
    db_client()
      .create_channel(&body)
      .await
      .status_code(StatusCode::BAD_REQUEST)?,
  ))
}

async fn update_channel(
  Path(id): Path<i64>,
  Json(body): Json<ChannelBody>,
) -> serror::Result<Json<NotificationChannel>> {
  Ok(Json(
    db_client()
      .update_channel(id, &body)
      .await
      .status_code(StatusCode::BAD_REQUEST)?,
  ))
}

async fn delete_channel(
  Path(id): Path<i64>,
) -> serror::Result<Json<serde_json::Value>> {
  db_client().delete_channel(id).await?;
  Ok(Json(serde_json::json!({ "deleted": id })))
}

async fn test_channel(
  Path(id): Path<i64>,
) -> serror::Result<Json<serde_json::Value>> {
  let channel = db_client()
    .get_channel(id)
    .await
    .status_code(StatusCode::NOT_FOUND)?;
  channels::test_channel(&channel).await?;
  Ok(Json(serde_json::json!({ "delivered": true })))
}

async fn list_rules()
-> serror::Result<Json<Vec<NotificationRule>>> {
  Ok(Json(db_client().list_rules().await?))
}

async fn create_rule(
  Json(body): Json<RuleBody>,
) -> serror::Result<Json<NotificationRule>> {
  Ok(Json(
    db_client()
      .create_rule(&body)
      .await
      .status_code(StatusCode::BAD_REQUEST)?,
  ))
}

async fn update_rule(
  Path(id): Path<i64>,
  Json(body): Json<RuleBody>,
) -> serror::Result<Json<NotificationRule>> {
  Ok(Json(
    db_client()
      .update_rule(id, &body)
      .await
      .status_code(StatusCode::BAD_REQUEST)?,
  ))
}

async fn delete_rule(
  Path(id): Path<i64>,
) -> serror::Result<Json<serde_json::Value>> {
  db_client().delete_rule(id).await?;
  Ok(Json(serde_json::json!({ "deleted": id })))
}

#[derive(Deserialize)]
struct LogQuery {
  #[serde(default = "default_limit")]
  limit: i64,
}

fn default_limit() -> i64 {
  100
}

async fn log(
  Query(query): Query<LogQuery>,
) -> serror::Result<Json<Vec<NotificationLogEntry>>> {
  Ok(Json(
    db_client().list_notification_log(query.limit).await?,
  ))
}

async fn clear_log() -> serror::Result<Json<serde_json::Value>> {
  db_client().clear_notification_log().await?;
  Ok(Json(serde_json::json!({ "cleared": true })))
}

#[derive(Deserialize)]
struct MarkReadBody {
  ids: Vec<i64>,
}

async fn mark_read(
  Json(body): Json<MarkReadBody>,
) -> serror::Result<Json<serde_json::Value>> {
  db_client().mark_notifications_read(&body.ids).await?;
  Ok(Json(serde_json::json!({ "read": body.ids.len() })))
}

async fn mark_all_read()
-> serror::Result<Json<serde_json::Value>> {
  db_client().mark_all_notifications_read().await?;
  Ok(Json(serde_json::json!({ "read": "all" })))
}

async fn list_silences()
-> serror::Result<Json<Vec<NotificationSilence>>> {
  Ok(Json(db_client().list_silences().await?))
}

async fn create_silence(
  Json(body): Json<SilenceBody>,
) -> serror::Result<Json<NotificationSilence>> {
  Ok(Json(
    db_client()
      .create_silence(&body)
      .await
      .status_code(StatusCode::BAD_REQUEST)?,
  ))
}

async fn delete_silence(
  Path(id): Path<i64>,
) -> serror::Result<Json<serde_json::Value>> {
  db_client().delete_silence(id).await?;
  Ok(Json(serde_json::json!({ "deleted": id })))
}

/// Engine status for the UI header: unread count, configured rule /
/// channel counts, active silences, queued batch size.
async fn status() -> serror::Result<Json<serde_json::Value>> {
  let db = db_client();
  let unread = db.unread_notification_count().await?;
  let channels = db.list_channels().await?;
  let rules = db.list_rules().await?;
  let silences = db.list_active_silences(Utc::now()).await?;
  Ok(Json(serde_json::json!({
    "unread": unread,
    "channels": channels.len(),
    "rules": rules.len(),
    "active_silences": silences.len(),
    "queued_batch_events": batch::queued_count().await,
  })))
}

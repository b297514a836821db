use anyhow::Context;
use census_client::entities::{
  format_timestamp, parse_timestamp, telemetry::TelemetryEndpoint,
};
use chrono::{DateTime, Utc};

use crate::Client;

#[derive(sqlx::FromRow)]
struct EndpointRow {
  id: i64,
  url: String,
  enabled: bool,
  last_success: Option<String>,
  last_failure: Option<String>,
  failure_reason: Option<String>,
}

impl TryFrom<EndpointRow> for TelemetryEndpoint {
  type Error = anyhow::Error;

  fn try_from(row: EndpointRow) -> anyhow::Result<TelemetryEndpoint> {
    Ok(TelemetryEndpoint {
      id: row.id,
      url: row.url,
      enabled: row.enabled,
      last_success: row
        .last_success
        .as_deref()
        .map(parse_timestamp)
        .transpose()?,
      last_failure: row
        .last_failure
        .as_deref()
        .map(parse_timestamp)
        .transpose()?,
      failure_reason: row.failure_reason,
    })
  }
}

impl Client {
  pub async fn list_telemetry_endpoints(
    &self,
  ) -> anyhow::Result<Vec<TelemetryEndpoint>> {
    let rows = sqlx::query_as::<_, EndpointRow>(
      "SELECT id, url, enabled, last_success, last_failure, failure_reason
       FROM telemetry_endpoints ORDER BY url",
    )
    .fetch_all(&self.pool)
    .await
    .context("Failed to list telemetry endpoints")?;
    rows.into_iter().map(TelemetryEndpoint::try_from).collect()
  }

  /// Seed configured endpoints; existing rows keep their state.
  pub async fn ensure_telemetry_endpoints(
    &self,
    urls: &[String],
  ) -> anyhow::Result<()> {
    for url in urls {
      sqlx::query(
        "INSERT OR IGNORE INTO telemetry_endpoints (url) VALUES (?)",
      )
      .bind(url)
      .execute(&self.pool)
      .await
      .context("Failed to seed telemetry endpoint")?;
    }
    Ok(())
  }

  pub async fn record_telemetry_success(
    &self,
    id: i64,
    now: DateTime<Utc>,
  ) -> anyhow::Result<()> {
    sqlx::query(
      "UPDATE telemetry_endpoints
       SET last_success = ?, failure_reason = NULL WHERE id = ?",
    )
    .bind(format_timestamp(&now))
    .bind(id)
    .execute(&self.pool)
    .await
    .context("Failed to record telemetry success")?;
    Ok(())
  }

  pub async fn record_telemetry_failure(
    &self,
    id: i64,
    now: DateTime<Utc>,
    reason: &str,
  ) -> anyhow::Result<()> {
    sqlx::query(
      "UPDATE telemetry_endpoints
       SET last_failure = ?, failure_reason = ? WHERE id = ?",
    )
    .bind(format_timestamp(&now))
    .bind(reason)
    .bind(id)
    .execute(&self.pool)
    .await
    .context("Failed to record telemetry failure")?;
    Ok(())
  }

  /// The user-visible circuit breaker reset.
  pub async fn reset_telemetry_failures(
    &self,
  ) -> anyhow::Result<()> {
    sqlx::query(
      "UPDATE telemetry_endpoints
       SET last_failure = NULL, failure_reason = NULL",
    )
    .execute(&self.pool)
    .await
    .context("Failed to reset telemetry failures")?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use chrono::{TimeZone, Utc};

  use crate::test_client;

  #[tokio::test]
  async fn endpoint_state_round_trip() {
    let db = test_client().await;
    let urls = vec![String::from("https://telemetry.example/ingest")];
    db.ensure_telemetry_endpoints(&urls).await.unwrap();
    // Idempotent seeding.
    db.ensure_telemetry_endpoints(&urls).await.unwrap();

    let endpoints = db.list_telemetry_endpoints().await.unwrap();
    assert_eq!(endpoints.len(), 1);
    let id = endpoints[0].id;

    let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
    db.record_telemetry_failure(id, now, "connection refused")
      .await
      .unwrap();
    let endpoint =
      &db.list_telemetry_endpoints().await.unwrap()[0];
    assert_eq!(
      endpoint.failure_reason.as_deref(),
      Some("connection refused")
    );

    db.reset_telemetry_failures().await.unwrap();
    let endpoint =
      &db.list_telemetry_endpoints().await.unwrap()[0];
    assert!(endpoint.failure_reason.is_none());
    assert!(endpoint.last_failure.is_none());
  }
}

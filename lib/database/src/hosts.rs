use anyhow::Context;
use census_client::entities::{
  format_timestamp,
  host::{ConnectionType, CreateHostBody, Host, HostStatus},
  parse_timestamp,
};
use chrono::{DateTime, Utc};

use crate::Client;

#[derive(sqlx::FromRow)]
struct HostRow {
  id: i64,
  name: String,
  address: String,
  connection_type: String,
  token: Option<String>,
  enabled: bool,
  collect_stats: bool,
  status: String,
  last_seen: Option<String>,
  created_at: String,
  updated_at: String,
}

impl TryFrom<HostRow> for Host {
  type Error = anyhow::Error;

  fn try_from(row: HostRow) -> anyhow::Result<Host> {
    Ok(Host {
      id: row.id,
      name: row.name,
      address: row.address,
      connection_type: row
        .connection_type
        .parse()
        .unwrap_or(ConnectionType::LocalSocket),
      token: row.token,
      enabled: row.enabled,
      collect_stats: row.collect_stats,
      status: row.status.parse().unwrap_or(HostStatus::Unknown),
      last_seen: row
        .last_seen
        .as_deref()
        .map(parse_timestamp)
        .transpose()?,
      created_at: parse_timestamp(&row.created_at)?,
      updated_at: parse_timestamp(&row.updated_at)?,
    })
  }
}

const HOST_COLUMNS: &str = "id, name, address, connection_type, token, enabled, collect_stats, status, last_seen, created_at, updated_at";

impl Client {
  pub async fn list_hosts(&self) -> anyhow::Result<Vec<Host>> {
    let rows = sqlx::query_as::<_, HostRow>(&format!(
      "SELECT {HOST_COLUMNS} FROM hosts ORDER BY name"
    ))
    .fetch_all(&self.pool)
    .await
    .context("Failed to list hosts")?;
    rows.into_iter().map(Host::try_from).collect()
  }

  pub async fn list_enabled_hosts(
    &self,
  ) -> anyhow::Result<Vec<Host>> {
    let rows = sqlx::query_as::<_, HostRow>(&format!(
      "SELECT {HOST_COLUMNS} FROM hosts WHERE enabled = 1 ORDER BY name"
    ))
    .fetch_all(&self.pool)
    .await
    .context("Failed to list enabled hosts")?;
    rows.into_iter().map(Host::try_from).collect()
  }

  pub async fn get_host(&self, id: i64) -> anyhow::Result<Host> {
    let row = sqlx::query_as::<_, HostRow>(&format!(
      "SELECT {HOST_COLUMNS} FROM hosts WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(&self.pool)
    .await
    .context("Failed to query host")?
    .with_context(|| format!("No host found with id {id}"))?;
    row.try_into()
  }

  pub async fn create_host(
    &self,
    host: &CreateHostBody,
    now: DateTime<Utc>,
  ) -> anyhow::Result<Host> {
    let now = format_timestamp(&now);
    let id = sqlx::query(
      "INSERT INTO hosts (name, address, connection_type, token, enabled, collect_stats, status, created_at, updated_at)
       VALUES (?, ?, ?, ?, ?, ?, 'unknown', ?, ?)",
    )
    .bind(&host.name)
    .bind(&host.address)
    .bind(host.connection_type.to_string())
    .bind(&host.token)
    .bind(host.enabled)
    .bind(host.collect_stats)
    .bind(&now)
    .bind(&now)
    .execute(&self.pool)
    .await
    .with_context(|| {
      format!("Failed to create host '{}'", host.name)
    })?
    .last_insert_rowid();
    self.get_host(id).await
  }

  /// Cascades to snapshots, scan results, baselines, thresholds,
  /// silences via foreign keys.
  pub async fn delete_host(&self, id: i64) -> anyhow::Result<()> {
    let result = sqlx::query("DELETE FROM hosts WHERE id = ?")
      .bind(id)
      .execute(&self.pool)
      .await
      .context("Failed to delete host")?;
    if result.rows_affected() == 0 {
      return Err(anyhow::anyhow!("No host found with id {id}"));
    }
    Ok(())
  }

  pub async fn update_host_status(
    &self,
    id: i64,
    status: HostStatus,
    last_seen: Option<DateTime<Utc>>,
  ) -> anyhow::Result<()> {
    sqlx::query(
      "UPDATE hosts SET
        status = ?,
        last_seen = COALESCE(?, last_seen),
        updated_at = COALESCE(?, updated_at)
       WHERE id = ?",
    )
    .bind(status.to_string())
    .bind(last_seen.as_ref().map(format_timestamp))
    .bind(last_seen.as_ref().map(format_timestamp))
    .bind(id)
    .execute(&self.pool)
    .await
    .context("Failed to update host status")?;
    Ok(())
  }

  /// Seed the default local-socket host on an empty installation.
  pub async fn ensure_local_host(
    &self,
    now: DateTime<Utc>,
  ) -> anyhow::Result<()> {
    let count: i64 =
      sqlx::query_scalar("SELECT COUNT(*) FROM hosts")
        .fetch_one(&self.pool)
        .await
        .context("Failed to count hosts")?;
    if count > 0 {
      return Ok(());
    }
    info!("No hosts configured, seeding local docker socket host");
    self
      .create_host(
        &CreateHostBody {
          name: String::from("local"),
          address: String::from("/var/run/docker.sock"),
          connection_type: ConnectionType::LocalSocket,
          token: None,
          enabled: true,
          collect_stats: true,
        },
        now,
      )
      .await?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use census_client::entities::host::ConnectionType;
  use chrono::Utc;

  use super::*;
  use crate::test_client;

  fn body(name: &str) -> CreateHostBody {
    CreateHostBody {
      name: name.to_string(),
      address: String::from("http://agent:9876"),
      connection_type: ConnectionType::Agent,
      token: Some(String::from("secret")),
      enabled: true,
      collect_stats: true,
    }
  }

  #[tokio::test]
  async fn create_get_delete_round_trip() {
    let db = test_client().await;
    let host = db.create_host(&body("a"), Utc::now()).await.unwrap();
    assert_eq!(host.name, "a");
    assert_eq!(host.connection_type, ConnectionType::Agent);
    assert_eq!(host.status, HostStatus::Unknown);

    let listed = db.list_hosts().await.unwrap();
    assert_eq!(listed.len(), 1);

    db.delete_host(host.id).await.unwrap();
    assert!(db.get_host(host.id).await.is_err());
    assert!(db.delete_host(host.id).await.is_err());
  }

  #[tokio::test]
  async fn duplicate_names_rejected() {
    let db = test_client().await;
    db.create_host(&body("a"), Utc::now()).await.unwrap();
    assert!(db.create_host(&body("a"), Utc::now()).await.is_err());
  }

  #[tokio::test]
  async fn status_update_keeps_last_seen_when_none() {
    let db = test_client().await;
    let host = db.create_host(&body("a"), Utc::now()).await.unwrap();
    let seen = Utc::now();
    db.update_host_status(host.id, HostStatus::Online, Some(seen))
      .await
      .unwrap();
    db.update_host_status(host.id, HostStatus::Offline, None)
      .await
      .unwrap();
    let host = db.get_host(host.id).await.unwrap();
    assert_eq!(host.status, HostStatus::Offline);
    assert!(host.last_seen.is_some());
  }

  #[tokio::test]
  async fn ensure_local_host_seeds_once() {
    let db = test_client().await;
    db.ensure_local_host(Utc::now()).await.unwrap();
    db.ensure_local_host(Utc::now()).await.unwrap();
    let hosts = db.list_hosts().await.unwrap();
    assert_eq!(hosts.len(), 1);
    assert_eq!(
      hosts[0].connection_type,
      ConnectionType::LocalSocket
    );
  }
}

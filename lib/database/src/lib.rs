//! SQLite persistence layer for the census server.
//!
//! One database, WAL journaling, 5s busy timeout. The write path
//! serializes on sqlite's single writer while readers proceed through
//! the pool. Timestamps are TEXT columns in the canonical UTC format
//! from [`census_client::entities`], which orders lexicographically.

#[macro_use]
extern crate tracing;

use std::{str::FromStr, time::Duration};

use anyhow::Context;
use sqlx::{
  SqlitePool,
  sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions,
  },
};

mod baselines;
mod changes;
mod compact;
mod hosts;
mod lifecycle;
mod notifications;
mod scan_results;
mod settings;
mod snapshots;
mod telemetry;
mod thresholds;

pub use lifecycle::{
  GAP_HOURS, TimelinePoint, derive_lifecycle_events,
};
pub use notifications::{ChannelBody, RuleBody, SilenceBody};
pub use snapshots::SnapshotRow;

pub struct Client {
  pub pool: SqlitePool,
}

impl Client {
  /// Open (creating if missing) and migrate the database at `path`.
  pub async fn new(path: &str) -> anyhow::Result<Client> {
    let options = SqliteConnectOptions::from_str(path)
      .with_context(|| format!("Invalid database path {path}"))?
      .create_if_missing(true)
      .journal_mode(SqliteJournalMode::Wal)
      .busy_timeout(Duration::from_secs(5))
      .foreign_keys(true);

    // In-memory databases are per-connection; a second pool connection
    // would see an empty schema.
    let max_connections =
      if path.contains(":memory:") { 1 } else { 10 };

    let pool = SqlitePoolOptions::new()
      .max_connections(max_connections)
      .connect_with(options)
      .await
      .with_context(|| {
        format!("Failed to open database at {path}")
      })?;

    sqlx::migrate!("./migrations")
      .run(&pool)
      .await
      .context("Failed to run database migrations")?;

    Ok(Client { pool })
  }

  pub async fn close(&self) {
    self.pool.close().await;
  }
}

#[cfg(test)]
pub(crate) async fn test_client() -> Client {
  Client::new("sqlite::memory:")
    .await
    .expect("failed to open in-memory database")
}

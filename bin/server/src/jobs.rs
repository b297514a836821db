use async_timing_util::{Timelength, wait_until_timelength};
use chrono::Utc;

use crate::state::{db_client, settings, shutdown};

const ADDITIONAL_MS: u128 = 500;

/// Hourly: fold aged samples into their hour buckets and refresh
/// per-image baselines. Daily: compact redundant snapshots, enforce
/// the retention horizon, trim the notification log.
pub fn spawn_maintenance_loops() {
  tokio::spawn(async move {
    loop {
      tokio::select! {
        _ = shutdown().cancelled() => break,
        _ = wait_until_timelength(Timelength::OneHour, ADDITIONAL_MS) => {}
      }
      let now = Utc::now();
      let db = db_client();

      if let Err(e) = db.aggregate_old_stats(now).await {
        error!("Stats aggregation failed | {e:#}");
      }

      let baselines = settings().load().baselines.clone();
      match db
        .recompute_baselines(
          now,
          baselines.window_hours,
          baselines.min_samples,
        )
        .await
      {
        Ok(rows) if rows > 0 => {
          debug!("Recomputed {rows} container baselines")
        }
        Ok(_) => {}
        Err(e) => error!("Baseline recompute failed | {e:#}"),
      }
    }
  });

  tokio::spawn(async move {
    loop {
      tokio::select! {
        _ = shutdown().cancelled() => break,
        _ = wait_until_timelength(Timelength::OneDay, ADDITIONAL_MS) => {}
      }
      let now = Utc::now();
      let db = db_client();
      let retention = settings().load().retention.clone();

      match db
        .compact_redundant_snapshots(now, retention.compaction_days)
        .await
      {
        Ok(0) => {}
        Ok(deleted) => {
          info!("Compacted {deleted} redundant snapshots")
        }
        Err(e) => error!("Snapshot compaction failed | {e:#}"),
      }

      match db.retention_cleanup(now, retention.snapshot_days).await
      {
        Ok(0) => {}
        Ok(deleted) => {
          info!("Retention removed {deleted} expired snapshots")
        }
        Err(e) => error!("Retention cleanup failed | {e:#}"),
      }

      if let Err(e) = db.cleanup_notification_log(now).await {
        error!("Notification log cleanup failed | {e:#}");
      }
    }
  });
}

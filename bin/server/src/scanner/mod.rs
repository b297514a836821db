use std::{sync::Arc, time::Duration};

use census_client::entities::{
  container::{ContainerInfo, ContainerSnapshot},
  host::{Host, HostStatus},
  image::ImageInfo,
  scan::ScanResult,
};
use chrono::Utc;
use futures_util::{StreamExt, stream};
use tokio::time::timeout;

use crate::{
  connection::{self, is_auth_error},
  notify,
  state::{
    auth_failures, db_client, host_images, scan_controller,
    settings, settings_changed, shutdown,
  },
};

/// Agent auth failures in a row before the host is flagged.
const AUTH_FAILED_AFTER: u32 = 2;

/// Drives full scan cycles on the configured interval. The interval is
/// database-resident and hot-reloaded: a settings update wakes the
/// loop so the new period applies immediately.
pub fn spawn_scanner_loop() {
  tokio::spawn(async move {
    // First cycle right away, so a fresh install has data.
    scan_all(false).await;
    let mut changed = settings_changed().subscribe();
    loop {
      let interval =
        settings().load().scanner.interval_seconds.max(10);
      tokio::select! {
        _ = shutdown().cancelled() => break,
        _ = changed.changed() => continue,
        _ = tokio::time::sleep(Duration::from_secs(interval)) => {}
      }
      scan_all(false).await;
    }
    info!("Scanner loop stopped");
  });
}

/// One scan cycle across all enabled hosts, fanned out with a
/// concurrency cap. Per-host failures are reported in the results,
/// never fatal to the cycle.
pub async fn scan_all(force: bool) -> Vec<ScanResult> {
  let hosts = match db_client().list_enabled_hosts().await {
    Ok(hosts) => hosts,
    Err(e) => {
      error!("Failed to list hosts for scan | {e:#}");
      return Vec::new();
    }
  };
  if hosts.is_empty() {
    return Vec::new();
  }

  let cap = hosts
    .len()
    .min(settings().load().scanner.max_concurrent_hosts.max(1));

  stream::iter(hosts)
    .map(|host| async move { scan_one(&host, force).await })
    .buffer_unordered(cap)
    .filter_map(|result| async move { result })
    .collect()
    .await
}

/// One scan of one host, wrapped in the configured per-host timeout.
/// A timeout or collection error records a failed ScanResult and
/// persists no snapshots. Returns None when a concurrent scan of the
/// same host was already running (background cycles yield, manual
/// scans wait).
pub async fn scan_one(
  host: &Host,
  force: bool,
) -> Option<ScanResult> {
  let controller =
    scan_controller().get_or_insert_default(&host.id).await;
  let mut lock = match controller.try_lock() {
    Ok(lock) => lock,
    Err(_) if force => controller.lock().await,
    Err(_) => return None,
  };

  let now_ms = Utc::now().timestamp_millis();
  if !force && *lock > now_ms - 1_000 {
    return None;
  }
  *lock = now_ms;

  let scanner = settings().load().scanner.clone();
  let started_at = Utc::now();

  let outcome = timeout(
    Duration::from_secs(scanner.timeout_seconds.max(1)),
    collect_host(host, scanner.container_workers),
  )
  .await;
  let completed_at = Utc::now();

  let db = db_client();
  let recorded = match outcome {
    Ok(Ok((containers, images))) => {
      auth_failures().remove(&host.id).await;
      host_images().insert(host.id, Arc::new(images)).await;
      // Every snapshot of the cycle shares the scan start instant.
      let snapshots = containers
        .into_iter()
        .map(|info| {
          ContainerSnapshot::from_info(info, host.id, started_at)
        })
        .collect::<Vec<_>>();
      match db
        .record_scan_success(
          host.id,
          started_at,
          completed_at,
          &snapshots,
        )
        .await
      {
        Ok(result) => {
          debug!(
            "Scanned {}: {} containers",
            host.name, result.containers_found
          );
          // The engine consumes the batch only after it is persisted.
          notify::process_scan(host, &snapshots, started_at).await;
          Ok(result)
        }
        Err(e) => {
          db.record_scan_failure(
            host.id,
            started_at,
            completed_at,
            &format!("{e:#}"),
            HostStatus::Offline,
          )
          .await
        }
      }
    }
    Ok(Err(e)) => {
      let status = if is_auth_error(&e) {
        let failures =
          auth_failures().get(&host.id).await.unwrap_or(0) + 1;
        auth_failures().insert(host.id, failures).await;
        if failures >= AUTH_FAILED_AFTER {
          HostStatus::AuthFailed
        } else {
          HostStatus::Offline
        }
      } else {
        HostStatus::Offline
      };
      warn!("Scan failed for {} | {e:#}", host.name);
      db.record_scan_failure(
        host.id,
        started_at,
        completed_at,
        &format!("{e:#}"),
        status,
      )
      .await
    }
    Err(_) => {
      warn!(
        "Scan of {} timed out after {}s",
        host.name, scanner.timeout_seconds
      );
      db.record_scan_failure(
        host.id,
        started_at,
        completed_at,
        &format!(
          "Scan timed out after {}s",
          scanner.timeout_seconds
        ),
        HostStatus::Offline,
      )
      .await
    }
  };

  match recorded {
    Ok(result) => Some(result),
    Err(e) => {
      error!(
        "Failed to record scan result for {} | {e:#}",
        host.name
      );
      None
    }
  }
}

/// Full collection against one host: container list with inspect
/// enrichment and paired stats samples, plus the image list used for
/// telemetry aggregation. The image list is best-effort.
async fn collect_host(
  host: &Host,
  workers: usize,
) -> anyhow::Result<(Vec<ContainerInfo>, Vec<ImageInfo>)> {
  let handle = connection::connect(host).await?;
  let containers =
    handle.list_containers(host.collect_stats, workers).await?;
  let images = handle
    .list_images()
    .await
    .inspect_err(|e| {
      debug!("Image list failed for {} | {e:#}", host.name)
    })
    .unwrap_or_default();
  Ok((containers, images))
}

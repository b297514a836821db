use std::{collections::HashMap, time::Duration};

use agent_client::AgentClient;
use anyhow::Context;
use census_client::entities::{
  container::ContainerState,
  host::ConnectionType,
  telemetry::{ImageUsage, TelemetryReport},
};
use chrono::Utc;
use futures_util::future::join_all;

use crate::state::{db_client, host_images, settings, shutdown};

const SUBMIT_ATTEMPTS: u32 = 3;

/// Opt-in periodic submission of anonymous aggregates. Nothing runs
/// while telemetry is disabled in settings.
pub fn spawn_telemetry_loop() {
  tokio::spawn(async move {
    loop {
      let interval_hours =
        settings().load().telemetry.interval_hours.max(1);
      tokio::select! {
        _ = shutdown().cancelled() => break,
        _ = tokio::time::sleep(Duration::from_secs(interval_hours * 60 * 60)) => {}
      }
      if !settings().load().telemetry.enabled {
        continue;
      }
      submit_telemetry().await;
    }
  });
}

/// Aggregate across all hosts: counts, per-state totals, resource
/// averages, image usage (from each host's latest image list), and
/// the agent version distribution.
pub async fn build_report() -> anyhow::Result<TelemetryReport> {
  let db = db_client();
  let hosts = db.list_hosts().await?;
  let latest = db.latest_per_host().await?;

  let mut containers_by_state: HashMap<String, i64> = HashMap::new();
  for snapshot in &latest {
    *containers_by_state
      .entry(snapshot.state.to_string())
      .or_default() += 1;
  }

  let sampled = latest
    .iter()
    .filter(|snapshot| {
      snapshot.state == ContainerState::Running
        && snapshot.cpu_percent.is_some()
    })
    .collect::<Vec<_>>();
  let avg = |values: Vec<f64>| {
    if values.is_empty() {
      None
    } else {
      Some(values.iter().sum::<f64>() / values.len() as f64)
    }
  };
  let avg_cpu_percent = avg(
    sampled
      .iter()
      .filter_map(|snapshot| snapshot.cpu_percent)
      .collect(),
  );
  let avg_memory_percent = avg(
    sampled
      .iter()
      .filter_map(|snapshot| snapshot.memory_percent)
      .collect(),
  );
  let total_memory_limit = latest
    .iter()
    .filter_map(|snapshot| snapshot.memory_limit)
    .sum();
  let total_restarts =
    latest.iter().map(|snapshot| snapshot.restart_count).sum();

  // Image usage by repository, sized from the image lists captured
  // during each host's latest scan.
  let mut images: HashMap<String, ImageUsage> = HashMap::new();
  for (_, host_image_list) in host_images().get_entries().await {
    for image in host_image_list.iter() {
      let repo = image
        .tags
        .first()
        .map(|tag| {
          tag.split(':').next().unwrap_or(tag).to_string()
        })
        .unwrap_or_else(|| String::from("<untagged>"));
      let entry =
        images.entry(repo.clone()).or_insert(ImageUsage {
          image: repo,
          count: 0,
          size: image.size,
        });
      entry.count += image.containers.max(1);
      entry.size = entry.size.max(image.size);
    }
  }
  let mut images = images.into_values().collect::<Vec<_>>();
  images.sort_by(|a, b| b.count.cmp(&a.count));
  images.truncate(50);

  // Version distribution across reachable agents, best effort.
  let agents = hosts
    .iter()
    .filter(|host| {
      host.connection_type == ConnectionType::Agent && host.enabled
    })
    .collect::<Vec<_>>();
  let agent_count = agents.len() as i64;
  let versions = join_all(agents.iter().map(|host| async {
    AgentClient::new(
      &host.address,
      host.token.clone().unwrap_or_default(),
    )
    .telemetry()
    .await
    .ok()
    .map(|telemetry| telemetry.version)
  }))
  .await;
  let mut agent_versions: HashMap<String, i64> = HashMap::new();
  for version in versions.into_iter().flatten() {
    *agent_versions.entry(version).or_default() += 1;
  }

  Ok(TelemetryReport {
    installation_id: db.installation_id().await?,
    version: env!("CARGO_PKG_VERSION").to_string(),
    host_count: hosts.len() as i64,
    agent_count,
    container_total: latest.len() as i64,
    containers_by_state,
    avg_cpu_percent,
    avg_memory_percent,
    total_memory_limit,
    total_restarts,
    images,
    agent_versions,
    timezone: std::env::var("TZ")
      .unwrap_or_else(|_| String::from("UTC")),
    generated_at: Utc::now(),
  })
}

/// Submit the report to every enabled endpoint, three attempts with
/// exponential backoff each. Per-endpoint outcomes are persisted for
/// the status surface.
pub async fn submit_telemetry() {
  let db = db_client();
  let report = match build_report().await {
    Ok(report) => report,
    Err(e) => {
      error!("Failed to build telemetry report | {e:#}");
      return;
    }
  };
  let endpoints = match db.list_telemetry_endpoints().await {
    Ok(endpoints) => endpoints,
    Err(e) => {
      error!("Failed to list telemetry endpoints | {e:#}");
      return;
    }
  };

  let client = reqwest::Client::new();
  for endpoint in
    endpoints.into_iter().filter(|endpoint| endpoint.enabled)
  {
    let outcome =
      submit_once(&client, &endpoint.url, &report).await;
    let now = Utc::now();
    let record = match &outcome {
      Ok(()) => db.record_telemetry_success(endpoint.id, now).await,
      Err(e) => {
        warn!(
          "Telemetry submission to {} failed | {e:#}",
          endpoint.url
        );
        db.record_telemetry_failure(
          endpoint.id,
          now,
          &format!("{e:#}"),
        )
        .await
      }
    };
    if let Err(e) = record {
      error!("Failed to record telemetry outcome | {e:#}");
    }
  }
}

async fn submit_once(
  client: &reqwest::Client,
  url: &str,
  report: &TelemetryReport,
) -> anyhow::Result<()> {
  let mut last_error = anyhow::anyhow!("no attempt made");
  for attempt in 0..SUBMIT_ATTEMPTS {
    if attempt > 0 {
      tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
    }
    let result = async {
      let response = client
        .post(url)
        .json(report)
        .timeout(Duration::from_secs(10))
        .send()
        .await
        .with_context(|| format!("POST {url} failed"))?;
      let status = response.status();
      if !status.is_success() {
        return Err(anyhow::anyhow!("collector returned {status}"));
      }
      Ok(())
    }
    .await;
    match result {
      Ok(()) => return Ok(()),
      Err(e) => last_error = e,
    }
  }
  Err(last_error)
}

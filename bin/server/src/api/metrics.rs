use std::sync::OnceLock;

use anyhow::Context;
use prometheus::{
  Encoder, GaugeVec, Opts, Registry, TextEncoder,
};
use serror::{AddStatusCode, AddStatusCodeError};

use crate::state::db_client;

struct Metrics {
  registry: Registry,
  cpu: GaugeVec,
  memory: GaugeVec,
}

fn metrics_registry() -> &'static Metrics {
  static METRICS: OnceLock<Metrics> = OnceLock::new();
  METRICS.get_or_init(|| {
    let registry = Registry::new();
    let labels = ["container", "host", "image"];
    let cpu = GaugeVec::new(
      Opts::new(
        "census_container_cpu_percent",
        "Cpu usage of a container at the latest scan, percent.",
      ),
      &labels,
    )
    .expect("invalid cpu gauge definition");
    let memory = GaugeVec::new(
      Opts::new(
        "census_container_memory_bytes",
        "Memory usage of a container at the latest scan, bytes.",
      ),
      &labels,
    )
    .expect("invalid memory gauge definition");
    registry
      .register(Box::new(cpu.clone()))
      .expect("failed to register cpu gauge");
    registry
      .register(Box::new(memory.clone()))
      .expect("failed to register memory gauge");
    Metrics {
      registry,
      cpu,
      memory,
    }
  })
}

/// Prometheus text format over the latest snapshot of every host.
pub async fn metrics() -> serror::Result<String> {
  let latest = db_client().latest_per_host().await?;
  let hosts = db_client().list_hosts().await?;
  let host_names: std::collections::HashMap<i64, &str> = hosts
    .iter()
    .map(|host| (host.id, host.name.as_str()))
    .collect();

  let metrics = metrics_registry();
  // Containers gone since the last scrape must not linger.
  metrics.cpu.reset();
  metrics.memory.reset();

  for snapshot in &latest {
    let host = host_names
      .get(&snapshot.host_id)
      .copied()
      .unwrap_or("unknown");
    let labels =
      [snapshot.name.as_str(), host, snapshot.image.as_str()];
    if let Some(cpu) = snapshot.cpu_percent {
      metrics.cpu.with_label_values(&labels).set(cpu);
    }
    if let Some(memory) = snapshot.memory_usage {
      metrics
        .memory
        .with_label_values(&labels)
        .set(memory as f64);
    }
  }

  let mut buffer = Vec::new();
  TextEncoder::new()
    .encode(&metrics.registry.gather(), &mut buffer)
    .context("Failed to encode metrics")
    .status_code(axum::http::StatusCode::INTERNAL_SERVER_ERROR)?;
  String::from_utf8(buffer)
    .context("Metrics were not valid utf-8")
    .status_code(axum::http::StatusCode::INTERNAL_SERVER_ERROR)
}

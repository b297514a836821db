use std::time::Duration;

use anyhow::{Context, anyhow};
use bollard::{
  Docker, models::ContainerStatsResponse,
  query_parameters::StatsOptions,
};
use census_client::entities::container::{
  MemorySample, StatsSample,
};
use futures_util::StreamExt;
use tokio::{sync::mpsc, time::timeout};

/// Per-sample deadline. The daemon spaces streamed samples ~1s apart,
/// so the pair normally completes in just over a second.
const SAMPLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Read two consecutive samples from the streaming stats endpoint and
/// compute cpu_percent from the counter delta. A single sample carries a
/// zero delta whenever the daemon's prior counters are stale, so the
/// one-shot endpoint is useless here.
///
/// The reader task feeds a bounded channel; the consumer takes exactly
/// two samples and drops the receiver, which ends the reader.
pub async fn sample_stats(
  docker: &Docker,
  id: &str,
) -> anyhow::Result<StatsSample> {
  let (tx, mut rx) = mpsc::channel::<ContainerStatsResponse>(2);

  let docker = docker.clone();
  let container_id = id.to_string();
  let reader = tokio::spawn(async move {
    let mut stream = docker.stats(
      &container_id,
      Some(StatsOptions {
        stream: true,
        one_shot: false,
      }),
    );
    while let Some(result) = stream.next().await {
      let Ok(sample) = result else {
        break;
      };
      if tx.send(sample).await.is_err() {
        break;
      }
    }
  });

  let result = async {
    let first = timeout(SAMPLE_TIMEOUT, rx.recv())
      .await
      .context("Timed out waiting for first stats sample")?
      .ok_or_else(|| anyhow!("Stats stream ended before first sample"))?;
    let second = timeout(SAMPLE_TIMEOUT, rx.recv())
      .await
      .context("Timed out waiting for second stats sample")?
      .ok_or_else(|| {
        anyhow!("Stats stream ended before second sample")
      })?;
    Ok(StatsSample {
      cpu_percent: cpu_percent(&first, &second),
      memory: memory_sample(&second),
    })
  }
  .await;

  drop(rx);
  reader.abort();

  result
}

fn total_cpu_usage(sample: &ContainerStatsResponse) -> Option<u64> {
  sample.cpu_stats.as_ref()?.cpu_usage.as_ref()?.total_usage
}

fn system_cpu_usage(sample: &ContainerStatsResponse) -> Option<u64> {
  sample.cpu_stats.as_ref()?.system_cpu_usage
}

fn online_cpus(sample: &ContainerStatsResponse) -> f64 {
  let cpu_stats = sample.cpu_stats.as_ref();
  let from_percpu = || {
    cpu_stats
      .and_then(|stats| stats.cpu_usage.as_ref())
      .and_then(|usage| usage.percpu_usage.as_ref())
      .map(|percpu| percpu.len() as u32)
  };
  f64::from(
    cpu_stats
      .and_then(|stats| stats.online_cpus)
      .or_else(from_percpu)
      .unwrap_or(1),
  )
}

#[allow(clippy::cast_precision_loss)]
fn cpu_percent(
  first: &ContainerStatsResponse,
  second: &ContainerStatsResponse,
) -> Option<f64> {
  let cpu_delta = total_cpu_usage(second)?
    .saturating_sub(total_cpu_usage(first)?)
    as f64;
  let system_delta = system_cpu_usage(second)?
    .saturating_sub(system_cpu_usage(first)?)
    as f64;
  if system_delta > 0.0 && cpu_delta > 0.0 {
    Some(
      (cpu_delta / system_delta) * online_cpus(second) * 100.0,
    )
  } else {
    Some(0.0)
  }
}

#[allow(clippy::cast_precision_loss)]
fn memory_sample(
  sample: &ContainerStatsResponse,
) -> Option<MemorySample> {
  let memory_stats = sample.memory_stats.as_ref()?;
  let limit = memory_stats.limit?;
  if limit == 0 {
    return None;
  }
  // Match `docker stats`: page cache the kernel can reclaim does not
  // count against the container.
  let inactive_file = memory_stats
    .stats
    .as_ref()
    .and_then(|stats| stats.get("inactive_file").copied())
    .unwrap_or_default();
  let usage =
    memory_stats.usage?.saturating_sub(inactive_file);
  Some(MemorySample {
    usage,
    limit,
    percent: usage as f64 / limit as f64 * 100.0,
  })
}

#[cfg(test)]
mod tests {
  use bollard::models::{
    ContainerCpuStats, ContainerCpuUsage, ContainerMemoryStats,
  };

  use super::*;

  fn sample(
    total_usage: u64,
    system_usage: u64,
    online: u32,
  ) -> ContainerStatsResponse {
    ContainerStatsResponse {
      cpu_stats: Some(ContainerCpuStats {
        cpu_usage: Some(ContainerCpuUsage {
          total_usage: Some(total_usage),
          ..Default::default()
        }),
        system_cpu_usage: Some(system_usage),
        online_cpus: Some(online),
        ..Default::default()
      }),
      ..Default::default()
    }
  }

  #[test]
  fn cpu_percent_from_delta() {
    let first = sample(1_000, 100_000, 4);
    let second = sample(2_000, 110_000, 4);
    // 1000 / 10000 * 4 cpus * 100
    let percent = cpu_percent(&first, &second).unwrap();
    assert!((percent - 40.0).abs() < f64::EPSILON);
  }

  #[test]
  fn zero_delta_is_zero_not_none() {
    let first = sample(1_000, 100_000, 4);
    let second = sample(1_000, 100_000, 4);
    assert_eq!(cpu_percent(&first, &second), Some(0.0));
  }

  #[test]
  fn memory_subtracts_reclaimable_cache() {
    let mut stats = std::collections::HashMap::new();
    stats.insert(String::from("inactive_file"), 200_u64);
    let response = ContainerStatsResponse {
      memory_stats: Some(ContainerMemoryStats {
        usage: Some(1_200),
        limit: Some(10_000),
        stats: Some(stats),
        ..Default::default()
      }),
      ..Default::default()
    };
    let memory = memory_sample(&response).unwrap();
    assert_eq!(memory.usage, 1_000);
    assert_eq!(memory.limit, 10_000);
    assert!((memory.percent - 10.0).abs() < f64::EPSILON);
  }

  #[test]
  fn memory_requires_limit() {
    let response = ContainerStatsResponse {
      memory_stats: Some(ContainerMemoryStats {
        usage: Some(1_200),
        limit: None,
        ..Default::default()
      }),
      ..Default::default()
    };
    assert!(memory_sample(&response).is_none());
  }
}

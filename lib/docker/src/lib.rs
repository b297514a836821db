#[macro_use]
extern crate tracing;

use std::collections::HashMap;

use anyhow::Context;
use bollard::{
  API_DEFAULT_VERSION, Docker,
  query_parameters::{
    ListContainersOptions, ListImagesOptions, LogsOptions,
    RemoveContainerOptions, RemoveImageOptions, RestartContainerOptions,
    StartContainerOptions, StopContainerOptions,
  },
};
use census_client::entities::{
  agent::ContainerLogs,
  container::{ContainerInfo, ContainerState, PortMapping},
  image::ImageInfo,
};
use chrono::DateTime;
use futures_util::{StreamExt, TryStreamExt, stream};

mod stats;

pub use stats::sample_stats;

/// Compose project label set by docker compose on every container
/// it manages.
const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

/// Thin wrapper over the Docker Engine API producing census entities.
/// Used by the agent against the local daemon and by the server for
/// local-socket / direct-api / ssh hosts.
#[derive(Clone)]
pub struct DockerClient {
  docker: Docker,
}

impl DockerClient {
  /// Connect with the standard environment defaults
  /// (DOCKER_HOST or the local socket).
  pub fn connect() -> anyhow::Result<DockerClient> {
    let docker = Docker::connect_with_defaults()
      .context("Failed to connect to docker api")?;
    Ok(DockerClient { docker })
  }

  pub fn connect_socket(path: &str) -> anyhow::Result<DockerClient> {
    let docker =
      Docker::connect_with_socket(path, 120, API_DEFAULT_VERSION)
        .with_context(|| {
          format!("Failed to connect to docker socket at {path}")
        })?;
    Ok(DockerClient { docker })
  }

  pub fn connect_http(address: &str) -> anyhow::Result<DockerClient> {
    let docker =
      Docker::connect_with_http(address, 120, API_DEFAULT_VERSION)
        .with_context(|| {
          format!("Failed to connect to docker api at {address}")
        })?;
    Ok(DockerClient { docker })
  }

  /// Cheap liveness probe.
  pub async fn ping(&self) -> anyhow::Result<()> {
    self
      .docker
      .ping()
      .await
      .context("Docker daemon did not answer ping")?;
    Ok(())
  }

  pub async fn version(&self) -> anyhow::Result<Option<String>> {
    let version = self
      .docker
      .version()
      .await
      .context("Failed to read docker version")?;
    Ok(version.version)
  }

  pub async fn operating_system(
    &self,
  ) -> anyhow::Result<Option<String>> {
    let info = self
      .docker
      .info()
      .await
      .context("Failed to read docker info")?;
    Ok(info.operating_system)
  }

  /// List all containers with full enrichment: inspect details and,
  /// when requested, a paired cpu / memory sample for running
  /// containers. Enrichment fans out over a bounded worker pool.
  pub async fn list_containers(
    &self,
    collect_stats: bool,
    workers: usize,
  ) -> anyhow::Result<Vec<ContainerInfo>> {
    let summaries = self
      .docker
      .list_containers(Some(ListContainersOptions {
        all: true,
        ..Default::default()
      }))
      .await
      .context("Failed to list containers")?;

    let mut containers = stream::iter(summaries)
      .map(|summary| self.enrich_container(summary, collect_stats))
      .buffer_unordered(workers.max(1))
      .filter_map(|container| async move { container })
      .collect::<Vec<_>>()
      .await;

    // Fan-out loses list order.
    containers.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(containers)
  }

  async fn enrich_container(
    &self,
    summary: bollard::models::ContainerSummary,
    collect_stats: bool,
  ) -> Option<ContainerInfo> {
    let id = summary.id?;
    let name = summary
      .names
      .as_ref()
      .and_then(|names| names.first())
      .map(|name| name.trim_start_matches('/').to_string())
      .unwrap_or_else(|| short_id(&id));

    let state = summary
      .state
      .map(|state| ContainerState::from_docker(&format!("{state:?}")))
      .unwrap_or_default();

    let ports = summary
      .ports
      .unwrap_or_default()
      .into_iter()
      .map(|port| PortMapping {
        ip: port.ip,
        private_port: port.private_port,
        public_port: port.public_port,
        protocol: port
          .typ
          .map(|typ| format!("{typ:?}").to_lowercase())
          .unwrap_or_else(|| String::from("tcp")),
      })
      .collect();

    let labels = summary.labels.unwrap_or_default();
    let compose_project =
      labels.get(COMPOSE_PROJECT_LABEL).cloned();

    let mut container = ContainerInfo {
      name,
      image: summary.image.unwrap_or_default(),
      image_id: summary.image_id.unwrap_or_default(),
      state,
      status: summary.status.unwrap_or_default(),
      ports,
      labels,
      compose_project,
      created_at: summary
        .created
        .and_then(|secs| DateTime::from_timestamp(secs, 0)),
      ..Default::default()
    };

    // Inspect failures (eg container removed mid-scan) degrade to the
    // summary-level view instead of dropping the container.
    if let Err(e) = self.inspect_into(&id, &mut container).await {
      debug!("Inspect failed for {id} | {e:#}");
    }

    if collect_stats && container.state == ContainerState::Running {
      match stats::sample_stats(&self.docker, &id).await {
        Ok(sample) => container.stats = Some(sample),
        Err(e) => {
          debug!("Stats sampling failed for {id} | {e:#}");
        }
      }
    }

    container.id = id;
    Some(container)
  }

  async fn inspect_into(
    &self,
    id: &str,
    container: &mut ContainerInfo,
  ) -> anyhow::Result<()> {
    let inspect = self
      .docker
      .inspect_container(
        id,
        None::<bollard::query_parameters::InspectContainerOptions>,
      )
      .await
      .context("Failed to inspect container")?;

    container.restart_count =
      inspect.restart_count.unwrap_or_default();

    if let Some(networks) = inspect
      .network_settings
      .and_then(|settings| settings.networks)
    {
      let mut names = networks.into_keys().collect::<Vec<_>>();
      names.sort();
      container.networks = names;
    }

    if let Some(mounts) = inspect.mounts {
      container.mounts = mounts
        .into_iter()
        .filter_map(|mount| mount.destination)
        .collect();
      container.mounts.sort();
    }

    if let Some(links) = inspect
      .host_config
      .and_then(|host_config| host_config.links)
    {
      container.links = links;
    }

    Ok(())
  }

  pub async fn start_container(
    &self,
    id: &str,
  ) -> anyhow::Result<()> {
    self
      .docker
      .start_container(id, None::<StartContainerOptions>)
      .await
      .with_context(|| format!("Failed to start container {id}"))?;
    Ok(())
  }

  pub async fn stop_container(
    &self,
    id: &str,
    timeout_seconds: Option<i32>,
  ) -> anyhow::Result<()> {
    self
      .docker
      .stop_container(
        id,
        Some(StopContainerOptions {
          t: timeout_seconds,
          ..Default::default()
        }),
      )
      .await
      .with_context(|| format!("Failed to stop container {id}"))?;
    Ok(())
  }

  pub async fn restart_container(
    &self,
    id: &str,
    timeout_seconds: Option<i32>,
  ) -> anyhow::Result<()> {
    self
      .docker
      .restart_container(
        id,
        Some(RestartContainerOptions {
          t: timeout_seconds,
          ..Default::default()
        }),
      )
      .await
      .with_context(|| format!("Failed to restart container {id}"))?;
    Ok(())
  }

  pub async fn remove_container(
    &self,
    id: &str,
    force: bool,
  ) -> anyhow::Result<()> {
    self
      .docker
      .remove_container(
        id,
        Some(RemoveContainerOptions {
          force,
          ..Default::default()
        }),
      )
      .await
      .with_context(|| format!("Failed to remove container {id}"))?;
    Ok(())
  }

  /// Last `tail` log lines, stdout and stderr interleaved.
  pub async fn container_logs(
    &self,
    id: &str,
    tail: u64,
  ) -> anyhow::Result<ContainerLogs> {
    let lines = self
      .docker
      .logs(
        id,
        Some(LogsOptions {
          stdout: true,
          stderr: true,
          tail: tail.to_string(),
          ..Default::default()
        }),
      )
      .map_ok(|output| {
        String::from_utf8_lossy(&output.into_bytes())
          .trim_end_matches(['\r', '\n'])
          .to_string()
      })
      .try_collect::<Vec<_>>()
      .await
      .with_context(|| format!("Failed to read logs for {id}"))?;
    Ok(ContainerLogs { lines })
  }

  pub async fn list_images(&self) -> anyhow::Result<Vec<ImageInfo>> {
    let images = self
      .docker
      .list_images(Some(ListImagesOptions {
        all: false,
        ..Default::default()
      }))
      .await
      .context("Failed to list images")?;
    Ok(
      images
        .into_iter()
        .map(|image| ImageInfo {
          id: image.id,
          tags: image.repo_tags,
          size: image.size,
          created: image.created,
          containers: image.containers,
        })
        .collect(),
    )
  }

  pub async fn remove_image(
    &self,
    id: &str,
    force: bool,
  ) -> anyhow::Result<()> {
    self
      .docker
      .remove_image(
        id,
        Some(RemoveImageOptions {
          force,
          ..Default::default()
        }),
        None,
      )
      .await
      .with_context(|| format!("Failed to remove image {id}"))?;
    Ok(())
  }

  /// Returns bytes reclaimed.
  pub async fn prune_images(&self) -> anyhow::Result<i64> {
    let response = self
      .docker
      .prune_images(
        None::<bollard::query_parameters::PruneImagesOptions>,
      )
      .await
      .context("Failed to prune images")?;
    Ok(response.space_reclaimed.unwrap_or_default())
  }

  /// Image id -> size mapping, used for telemetry aggregation.
  pub async fn image_sizes(
    &self,
  ) -> anyhow::Result<HashMap<String, i64>> {
    Ok(
      self
        .list_images()
        .await?
        .into_iter()
        .map(|image| (image.id, image.size))
        .collect(),
    )
  }
}

pub fn short_id(id: &str) -> String {
  let id = id.strip_prefix("sha256:").unwrap_or(id);
  id.chars().take(12).collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn short_id_truncates_and_strips_digest_prefix() {
    assert_eq!(
      short_id("sha256:abcdef0123456789aaaa"),
      "abcdef012345"
    );
    assert_eq!(short_id("abc"), "abc");
  }
}

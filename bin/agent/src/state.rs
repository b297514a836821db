use std::sync::{Arc, OnceLock};

use anyhow::Context;
use arc_swap::ArcSwap;
use docker::DockerClient;

pub fn docker_client() -> &'static SwappableDockerClient {
  static DOCKER_CLIENT: OnceLock<SwappableDockerClient> =
    OnceLock::new();
  DOCKER_CLIENT.get_or_init(SwappableDockerClient::init)
}

/// Holds the daemon connection, reconnecting lazily if the daemon was
/// down when the agent started.
#[derive(Default)]
pub struct SwappableDockerClient(ArcSwap<Option<DockerClient>>);

impl SwappableDockerClient {
  pub fn init() -> Self {
    let docker = DockerClient::connect()
      // Only logs on first init, although keeps trying to connect.
      .inspect_err(|e| warn!("{e:#}"))
      .ok();
    Self(ArcSwap::new(Arc::new(docker)))
  }

  pub fn get(&self) -> anyhow::Result<DockerClient> {
    if let Some(docker) = self.0.load().as_ref() {
      return Ok(docker.clone());
    }
    let docker = DockerClient::connect()
      .context("Docker daemon is not reachable")?;
    self.0.store(Arc::new(Some(docker.clone())));
    Ok(docker)
  }
}

use std::process::Stdio;

use agent_client::AgentClient;
use anyhow::{Context, anyhow};
use census_client::entities::{
  agent::ContainerLogs,
  container::ContainerInfo,
  host::{ConnectionType, Host},
  image::ImageInfo,
};
use docker::DockerClient;
use tokio::process::{Child, Command};

/// Capability handle over one host's Docker daemon, however it is
/// reached. Local-socket / direct-api / ssh hosts share the bollard
/// path; agent hosts go through the agent's HTTP API.
pub enum HostHandle {
  Docker(DockerClient),
  /// Keeps the tunnel child alive for the lifetime of the handle.
  Ssh(DockerClient, SshTunnel),
  Agent(AgentClient),
}

use HostHandle::{Agent, Docker, Ssh};

/// Open a handle for the host. Cheap for everything except ssh, which
/// spawns a socket-forwarding tunnel.
pub async fn connect(host: &Host) -> anyhow::Result<HostHandle> {
  match host.connection_type {
    ConnectionType::LocalSocket => {
      let docker = if host.address.is_empty() {
        DockerClient::connect()
      } else {
        DockerClient::connect_socket(&host.address)
      }?;
      Ok(Docker(docker))
    }
    ConnectionType::DirectApi => {
      Ok(Docker(DockerClient::connect_http(&host.address)?))
    }
    ConnectionType::Ssh => {
      let tunnel = SshTunnel::open(&host.address, host.id).await?;
      let docker = DockerClient::connect_socket(&tunnel.socket_path)?;
      Ok(Ssh(docker, tunnel))
    }
    ConnectionType::Agent => {
      let token = host.token.clone().unwrap_or_default();
      Ok(Agent(AgentClient::new(&host.address, token)))
    }
  }
}

impl HostHandle {
  /// Cheap connectivity (and, for agents, token) probe.
  pub async fn test(&self) -> anyhow::Result<()> {
    match self {
      Agent(agent) => agent.test().await.map(|_| ()),
      Docker(docker) | Ssh(docker, _) => docker.ping().await,
    }
  }

  pub async fn list_containers(
    &self,
    collect_stats: bool,
    workers: usize,
  ) -> anyhow::Result<Vec<ContainerInfo>> {
    match self {
      Agent(agent) => agent.list_containers(collect_stats).await,
      Docker(docker) | Ssh(docker, _) => {
        docker.list_containers(collect_stats, workers).await
      }
    }
  }

  pub async fn start_container(
    &self,
    id: &str,
  ) -> anyhow::Result<()> {
    match self {
      Agent(agent) => agent.start_container(id).await,
      Docker(docker) | Ssh(docker, _) => {
        docker.start_container(id).await
      }
    }
  }

  pub async fn stop_container(
    &self,
    id: &str,
    timeout_seconds: Option<i32>,
  ) -> anyhow::Result<()> {
    match self {
      Agent(agent) => agent.stop_container(id, timeout_seconds).await,
      Docker(docker) | Ssh(docker, _) => {
        docker.stop_container(id, timeout_seconds).await
      }
    }
  }

  pub async fn restart_container(
    &self,
    id: &str,
    timeout_seconds: Option<i32>,
  ) -> anyhow::Result<()> {
    match self {
      Agent(agent) => {
        agent.restart_container(id, timeout_seconds).await
      }
      Docker(docker) | Ssh(docker, _) => {
        docker.restart_container(id, timeout_seconds).await
      }
    }
  }

  pub async fn remove_container(
    &self,
    id: &str,
    force: bool,
  ) -> anyhow::Result<()> {
    match self {
      Agent(agent) => agent.remove_container(id, force).await,
      Docker(docker) | Ssh(docker, _) => {
        docker.remove_container(id, force).await
      }
    }
  }

  pub async fn container_logs(
    &self,
    id: &str,
    tail: u64,
  ) -> anyhow::Result<ContainerLogs> {
    match self {
      Agent(agent) => agent.container_logs(id, tail).await,
      Docker(docker) | Ssh(docker, _) => {
        docker.container_logs(id, tail).await
      }
    }
  }

  pub async fn list_images(&self) -> anyhow::Result<Vec<ImageInfo>> {
    match self {
      Agent(agent) => agent.list_images().await,
      Docker(docker) | Ssh(docker, _) => docker.list_images().await,
    }
  }

  pub async fn remove_image(
    &self,
    id: &str,
    force: bool,
  ) -> anyhow::Result<()> {
    match self {
      Agent(agent) => agent.remove_image(id, force).await,
      Docker(docker) | Ssh(docker, _) => {
        docker.remove_image(id, force).await
      }
    }
  }

  pub async fn prune_images(&self) -> anyhow::Result<i64> {
    match self {
      Agent(agent) => agent.prune_images().await,
      Docker(docker) | Ssh(docker, _) => docker.prune_images().await,
    }
  }
}

/// Whether an error chain looks like the agent rejecting our token.
pub fn is_auth_error(e: &anyhow::Error) -> bool {
  e.chain()
    .any(|cause| cause.to_string() == agent_client::AUTH_ERROR)
}

/// `ssh -N -L` forwarding the remote docker socket to a local one.
/// Killed on drop.
pub struct SshTunnel {
  pub socket_path: String,
  child: Child,
}

impl SshTunnel {
  async fn open(
    address: &str,
    host_id: i64,
  ) -> anyhow::Result<SshTunnel> {
    let socket_path =
      std::env::temp_dir().join(format!("census-ssh-{host_id}.sock"));
    // A stale socket file makes ssh refuse the forward.
    tokio::fs::remove_file(&socket_path).await.ok();
    let socket_path = socket_path
      .to_str()
      .context("Invalid tunnel socket path")?
      .to_string();

    let child = Command::new("ssh")
      .arg("-N")
      .arg("-o")
      .arg("BatchMode=yes")
      .arg("-o")
      .arg("ExitOnForwardFailure=yes")
      .arg("-L")
      .arg(format!("{socket_path}:/var/run/docker.sock"))
      .arg(address)
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::null())
      .kill_on_drop(true)
      .spawn()
      .with_context(|| {
        format!("Failed to spawn ssh tunnel to {address}")
      })?;

    // Wait for the forwarded socket to appear.
    for _ in 0..20 {
      if tokio::fs::metadata(&socket_path).await.is_ok() {
        return Ok(SshTunnel { socket_path, child });
      }
      tokio::time::sleep(std::time::Duration::from_millis(250))
        .await;
    }

    let mut tunnel = SshTunnel { socket_path, child };
    tunnel.child.kill().await.ok();
    Err(anyhow!(
      "ssh tunnel to {address} did not come up within 5s"
    ))
  }
}

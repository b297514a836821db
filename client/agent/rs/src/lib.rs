//! Client for the census agent HTTP API.
//!
//! The agent is a token-authenticated wrapper over one host's Docker
//! daemon. The server keeps one `AgentClient` per agent-connected host
//! and drives every capability through it.

use std::time::Duration;

use anyhow::{Context, anyhow};
use census_client::entities::{
  agent::{AgentHealth, AgentInfo, AgentTelemetry, ContainerLogs},
  container::ContainerInfo,
  image::ImageInfo,
};
use serde::de::DeserializeOwned;

/// Header carrying the bearer token. `Authorization: Bearer` is
/// accepted by the agent as well.
pub const TOKEN_HEADER: &str = "X-API-Token";

#[derive(Clone)]
pub struct AgentClient {
  address: String,
  token: String,
  client: reqwest::Client,
}

/// Raised when the agent rejects the configured token, so callers can
/// distinguish auth failures from transport errors.
pub const AUTH_ERROR: &str =
  "API token mismatch — please verify the token is correct";

impl AgentClient {
  pub fn new(
    address: impl Into<String>,
    token: impl Into<String>,
  ) -> AgentClient {
    AgentClient {
      address: address.into().trim_end_matches('/').to_string(),
      token: token.into(),
      client: reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .build()
        .unwrap_or_default(),
    }
  }

  async fn get<Res: DeserializeOwned>(
    &self,
    path: &str,
  ) -> anyhow::Result<Res> {
    let response = self
      .client
      .get(format!("{}{path}", self.address))
      .header(TOKEN_HEADER, &self.token)
      .send()
      .await
      .with_context(|| {
        format!("Failed to reach agent at {}", self.address)
      })?;
    Self::parse(response).await
  }

  async fn post<Res: DeserializeOwned>(
    &self,
    path: &str,
  ) -> anyhow::Result<Res> {
    let response = self
      .client
      .post(format!("{}{path}", self.address))
      .header(TOKEN_HEADER, &self.token)
      .send()
      .await
      .with_context(|| {
        format!("Failed to reach agent at {}", self.address)
      })?;
    Self::parse(response).await
  }

  async fn parse<Res: DeserializeOwned>(
    response: reqwest::Response,
  ) -> anyhow::Result<Res> {
    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
      return Err(anyhow!(AUTH_ERROR));
    }
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(anyhow!("Agent returned {status}: {body}"));
    }
    response
      .json()
      .await
      .context("Failed to parse agent response")
  }

  /// Public health route; does not require the token.
  pub async fn health(&self) -> anyhow::Result<AgentHealth> {
    let response = self
      .client
      .get(format!("{}/health", self.address))
      .send()
      .await
      .with_context(|| {
        format!("Failed to reach agent at {}", self.address)
      })?;
    Self::parse(response).await
  }

  pub async fn info(&self) -> anyhow::Result<AgentInfo> {
    self.get("/info").await
  }

  /// Verify connectivity and the token in one round trip.
  pub async fn test(&self) -> anyhow::Result<AgentInfo> {
    self.health().await?;
    self.get("/info").await
  }

  pub async fn list_containers(
    &self,
    stats: bool,
  ) -> anyhow::Result<Vec<ContainerInfo>> {
    if stats {
      self.get("/api/containers?stats=true").await
    } else {
      self.get("/api/containers").await
    }
  }

  pub async fn start_container(
    &self,
    id: &str,
  ) -> anyhow::Result<()> {
    self
      .post::<serde_json::Value>(&format!(
        "/api/containers/{id}/start"
      ))
      .await?;
    Ok(())
  }

  pub async fn stop_container(
    &self,
    id: &str,
    timeout_seconds: Option<i32>,
  ) -> anyhow::Result<()> {
    let path = match timeout_seconds {
      Some(timeout) => {
        format!("/api/containers/{id}/stop?timeout={timeout}")
      }
      None => format!("/api/containers/{id}/stop"),
    };
    self.post::<serde_json::Value>(&path).await?;
    Ok(())
  }

  pub async fn restart_container(
    &self,
    id: &str,
    timeout_seconds: Option<i32>,
  ) -> anyhow::Result<()> {
    let path = match timeout_seconds {
      Some(timeout) => {
        format!("/api/containers/{id}/restart?timeout={timeout}")
      }
      None => format!("/api/containers/{id}/restart"),
    };
    self.post::<serde_json::Value>(&path).await?;
    Ok(())
  }

  pub async fn remove_container(
    &self,
    id: &str,
    force: bool,
  ) -> anyhow::Result<()> {
    self
      .post::<serde_json::Value>(&format!(
        "/api/containers/{id}/remove?force={force}"
      ))
      .await?;
    Ok(())
  }

  pub async fn container_logs(
    &self,
    id: &str,
    tail: u64,
  ) -> anyhow::Result<ContainerLogs> {
    self
      .get(&format!("/api/containers/{id}/logs?tail={tail}"))
      .await
  }

  pub async fn list_images(&self) -> anyhow::Result<Vec<ImageInfo>> {
    self.get("/api/images").await
  }

  pub async fn remove_image(
    &self,
    id: &str,
    force: bool,
  ) -> anyhow::Result<()> {
    self
      .post::<serde_json::Value>(&format!(
        "/api/images/{id}/remove?force={force}"
      ))
      .await?;
    Ok(())
  }

  pub async fn prune_images(&self) -> anyhow::Result<i64> {
    #[derive(serde::Deserialize)]
    struct PruneResponse {
      space_reclaimed: i64,
    }
    let response: PruneResponse =
      self.post("/api/images/prune").await?;
    Ok(response.space_reclaimed)
  }

  pub async fn telemetry(&self) -> anyhow::Result<AgentTelemetry> {
    self.get("/api/telemetry").await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn trailing_slash_is_normalized() {
    let client = AgentClient::new("http://host:9876/", "token");
    assert_eq!(client.address, "http://host:9876");
  }
}

use std::collections::HashMap;

use axum::Json;
use census_client::entities::agent::AgentTelemetry;

use crate::state::docker_client;

/// Aggregate snapshot the server folds into its own telemetry report.
pub async fn telemetry() -> serror::Result<Json<AgentTelemetry>> {
  let docker = docker_client().get()?;
  let (containers, images) = tokio::join!(
    docker.list_containers(false, 8),
    docker.list_images(),
  );
  let containers = containers?;

  let mut by_state: HashMap<String, i64> = HashMap::new();
  for container in &containers {
    *by_state.entry(container.state.to_string()).or_default() += 1;
  }

  Ok(Json(AgentTelemetry {
    version: env!("CARGO_PKG_VERSION").to_string(),
    container_total: containers.len() as i64,
    containers_by_state: by_state,
    image_count: images.map(|i| i.len() as i64).unwrap_or_default(),
  }))
}

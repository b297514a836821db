#[macro_use]
extern crate tracing;

mod api;
mod config;
mod state;

use crate::{config::agent_config, state::docker_client};

async fn app() -> anyhow::Result<()> {
  let config = agent_config();
  logger::init(&config.logging)?;

  info!("Census Agent version: v{}", env!("CARGO_PKG_VERSION"));
  // The token is logged exactly once, at startup.
  info!("API token: {}", config.token);

  if let Err(e) = docker_client().get() {
    warn!(
      "Docker daemon not reachable yet, will keep retrying | {e:#}"
    );
  }

  let address = format!("{}:{}", config.bind_ip, config.port);
  let listener = tokio::net::TcpListener::bind(&address).await?;
  info!("Census Agent listening on {address}");

  axum::serve(listener, api::app()).await?;
  Ok(())
}

#[tokio::main]
async fn main() {
  dotenvy::dotenv().ok();
  if let Err(e) = app().await {
    eprintln!("Fatal startup error: {e:#}");
    std::process::exit(1);
  }
}

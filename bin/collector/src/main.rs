#[macro_use]
extern crate tracing;

mod api;
mod config;
mod store;

use std::sync::Arc;

use crate::{config::collector_config, store::Store};

async fn app() -> anyhow::Result<()> {
  let config = collector_config();
  logger::init(&config.logging)?;

  info!(
    "Census Collector version: v{}",
    env!("CARGO_PKG_VERSION")
  );

  let store = match Store::new(&config.database_url).await {
    Ok(store) => Arc::new(store),
    Err(e) => {
      error!("FATAL: Failed to open database | {e:#} | Exiting...");
      std::process::exit(1);
    }
  };

  let address = format!("0.0.0.0:{}", config.port);
  let listener = tokio::net::TcpListener::bind(&address).await?;
  info!("Census Collector listening on {address}");

  axum::serve(listener, api::app(store)).await?;
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

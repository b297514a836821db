#[macro_use]
extern crate tracing;

mod api;
mod config;
mod connection;
mod jobs;
mod notify;
mod scanner;
mod startup;
mod state;
mod telemetry;
mod version;

use std::time::Duration;

use crate::{
  config::core_config,
  state::{db_client, scan_controller, settings, shutdown},
};

async fn app() -> anyhow::Result<()> {
  let config = core_config();
  logger::init(&config.logging)?;

  info!("Census Server version: v{}", env!("CARGO_PKG_VERSION"));

  state::init_db_client().await;
  startup::on_startup().await;
  startup::spawn_background_tasks();

  let address = format!("{}:{}", config.host, config.port);
  let listener = tokio::net::TcpListener::bind(&address).await?;
  info!("Census Server listening on {address}");

  axum::serve(listener, api::app())
    .with_graceful_shutdown(shutdown_signal())
    .await?;

  drain().await;
  Ok(())
}

async fn shutdown_signal() {
  let ctrl_c = tokio::signal::ctrl_c();
  #[cfg(unix)]
  {
    let mut term = tokio::signal::unix::signal(
      tokio::signal::unix::SignalKind::terminate(),
    )
    .expect("failed to install SIGTERM handler");
    tokio::select! {
      _ = ctrl_c => {},
      _ = term.recv() => {},
    }
  }
  #[cfg(not(unix))]
  {
    ctrl_c.await.ok();
  }
  info!("Shutdown requested");
  shutdown().cancel();
}

/// Wait up to the scan timeout for in-flight scans, flush queued
/// notification batches best-effort, close the database.
async fn drain() {
  let deadline = tokio::time::Instant::now()
    + Duration::from_secs(
      settings().load().scanner.timeout_seconds.max(1),
    );
  loop {
    let mut busy = false;
    for (_, lock) in scan_controller().get_entries().await {
      if lock.try_lock().is_err() {
        busy = true;
        break;
      }
    }
    if !busy || tokio::time::Instant::now() >= deadline {
      break;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
  }

  notify::batch::flush_all().await;
  db_client().close().await;
  info!("Shutdown complete");
}

#[tokio::main]
async fn main() {
  dotenvy::dotenv().ok();
  if let Err(e) = app().await {
    eprintln!("Fatal startup error: {e:#}");
    std::process::exit(1);
  }
}

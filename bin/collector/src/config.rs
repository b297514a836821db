use std::sync::OnceLock;

use clap::Parser;
use logger::{LogConfig, LogLevel};
use serde::Deserialize;

#[derive(Parser)]
#[command(name = "collector", about = "Container Census telemetry collector")]
pub struct CliArgs {
  /// Path to the sqlite database.
  #[arg(long)]
  pub database_url: Option<String>,
  #[arg(long)]
  pub port: Option<u16>,
  /// trace | debug | info | warn | error
  #[arg(long)]
  pub log_level: Option<LogLevel>,
}

#[derive(Deserialize)]
pub struct Env {
  pub database_url: Option<String>,
  pub port: Option<u16>,
  #[serde(default)]
  pub collector_auth_enabled: bool,
  pub collector_auth_username: Option<String>,
  pub collector_auth_password: Option<String>,
  #[serde(default)]
  pub log_level: Option<LogLevel>,
}

pub struct CollectorConfig {
  pub database_url: String,
  pub port: u16,
  /// Basic auth over the dashboard routes. Ingestion stays public.
  pub auth_enabled: bool,
  pub auth_username: String,
  pub auth_password: String,
  pub logging: LogConfig,
}

pub fn collector_config() -> &'static CollectorConfig {
  static COLLECTOR_CONFIG: OnceLock<CollectorConfig> =
    OnceLock::new();
  COLLECTOR_CONFIG.get_or_init(|| {
    let args = CliArgs::parse();
    let env: Env = match envy::from_env() {
      Ok(env) => env,
      Err(e) => {
        eprintln!("Invalid collector environment: {e:#}");
        std::process::exit(2);
      }
    };
    let auth_enabled = env.collector_auth_enabled;
    if auth_enabled
      && (env.collector_auth_username.is_none()
        || env.collector_auth_password.is_none())
    {
      eprintln!(
        "COLLECTOR_AUTH_ENABLED requires COLLECTOR_AUTH_USERNAME and COLLECTOR_AUTH_PASSWORD"
      );
      std::process::exit(2);
    }
    CollectorConfig {
      database_url: args
        .database_url
        .or(env.database_url)
        .unwrap_or_else(|| String::from("collector.db")),
      port: args.port.or(env.port).unwrap_or(8181),
      auth_enabled,
      auth_username: env.collector_auth_username.unwrap_or_default(),
      auth_password: env.collector_auth_password.unwrap_or_default(),
      logging: LogConfig {
        level: args.log_level.or(env.log_level).unwrap_or_default(),
        ..Default::default()
      },
    }
  })
}

use std::sync::OnceLock;

use clap::Parser;
use logger::{LogConfig, LogLevel, StdioLogMode};
use serde::Deserialize;

#[derive(Parser)]
#[command(name = "server", about = "Container Census server")]
pub struct CliArgs {
  /// Path to the sqlite database.
  #[arg(long)]
  pub database_path: Option<String>,
  #[arg(long)]
  pub host: Option<String>,
  #[arg(long)]
  pub port: Option<u16>,
  /// Path to an optional toml config file. Overrides CONFIG_PATH.
  #[arg(long)]
  pub config_path: Option<String>,
  /// trace | debug | info | warn | error
  #[arg(long)]
  pub log_level: Option<LogLevel>,
}

#[derive(Deserialize)]
pub struct Env {
  pub database_path: Option<String>,
  pub server_host: Option<String>,
  pub server_port: Option<u16>,
  pub config_path: Option<String>,
  #[serde(default)]
  pub auth_enabled: Option<bool>,
  pub auth_username: Option<String>,
  pub auth_password: Option<String>,
  /// Seeds the database-resident scanner interval on startup.
  pub scanner_interval_seconds: Option<u64>,
  pub telemetry_interval_hours: Option<u64>,
  /// Comma separated collector urls to submit telemetry to.
  pub telemetry_endpoints: Option<String>,
  #[serde(default)]
  pub log_level: Option<LogLevel>,
  #[serde(default)]
  pub log_json: bool,
}

/// Optional toml config file. Environment variables and CLI flags win
/// over file values.
#[derive(Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
  pub database_path: Option<String>,
  pub server_host: Option<String>,
  pub server_port: Option<u16>,
  pub auth_enabled: Option<bool>,
  pub auth_username: Option<String>,
  pub auth_password: Option<String>,
  pub scanner_interval_seconds: Option<u64>,
  pub telemetry_interval_hours: Option<u64>,
  pub telemetry_endpoints: Vec<String>,
  pub log_level: Option<LogLevel>,
}

pub struct ServerConfig {
  pub database_path: String,
  pub host: String,
  pub port: u16,
  pub auth_enabled: bool,
  pub auth_username: String,
  pub auth_password: String,
  pub scanner_interval_seconds: Option<u64>,
  pub telemetry_interval_hours: Option<u64>,
  pub telemetry_endpoints: Vec<String>,
  pub logging: LogConfig,
}

fn load_file_config(path: Option<&str>) -> FileConfig {
  let Some(path) = path else {
    return FileConfig::default();
  };
  let raw = match std::fs::read_to_string(path) {
    Ok(raw) => raw,
    Err(e) => {
      eprintln!("Failed to read config file at {path}: {e}");
      std::process::exit(2);
    }
  };
  match toml::from_str(&raw) {
    Ok(config) => config,
    Err(e) => {
      eprintln!("Invalid config file at {path}: {e}");
      std::process::exit(2);
    }
  }
}

pub fn core_config() -> &'static ServerConfig {
  static CORE_CONFIG: OnceLock<ServerConfig> = OnceLock::new();
  CORE_CONFIG.get_or_init(|| {
    let args = CliArgs::parse();
    let env: Env = match envy::from_env() {
      Ok(env) => env,
      Err(e) => {
        eprintln!("Invalid server environment: {e:#}");
        std::process::exit(2);
      }
    };
    let file = load_file_config(
      args
        .config_path
        .as_deref()
        .or(env.config_path.as_deref()),
    );

    let auth_enabled = env
      .auth_enabled
      .or(file.auth_enabled)
      .unwrap_or_default();
    let auth_username =
      env.auth_username.or(file.auth_username);
    let auth_password =
      env.auth_password.or(file.auth_password);
    if auth_enabled
      && (auth_username.is_none() || auth_password.is_none())
    {
      eprintln!(
        "AUTH_ENABLED requires AUTH_USERNAME and AUTH_PASSWORD"
      );
      std::process::exit(2);
    }

    let telemetry_endpoints = env
      .telemetry_endpoints
      .map(|raw| {
        raw
          .split(',')
          .map(str::trim)
          .filter(|url| !url.is_empty())
          .map(String::from)
          .collect()
      })
      .unwrap_or(file.telemetry_endpoints);

    ServerConfig {
      database_path: args
        .database_path
        .or(env.database_path)
        .or(file.database_path)
        .unwrap_or_else(|| String::from("census.db")),
      host: args
        .host
        .or(env.server_host)
        .or(file.server_host)
        .unwrap_or_else(|| String::from("0.0.0.0")),
      port: args
        .port
        .or(env.server_port)
        .or(file.server_port)
        .unwrap_or(8080),
      auth_enabled,
      auth_username: auth_username.unwrap_or_default(),
      auth_password: auth_password.unwrap_or_default(),
      scanner_interval_seconds: env
        .scanner_interval_seconds
        .or(file.scanner_interval_seconds),
      telemetry_interval_hours: env
        .telemetry_interval_hours
        .or(file.telemetry_interval_hours),
      telemetry_endpoints,
      logging: LogConfig {
        level: args
          .log_level
          .or(env.log_level)
          .or(file.log_level)
          .unwrap_or_default(),
        stdio: if env.log_json {
          StdioLogMode::Json
        } else {
          StdioLogMode::Standard
        },
        ..Default::default()
      },
    }
  })
}

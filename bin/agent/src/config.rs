use std::{
  fs,
  path::{Path, PathBuf},
  sync::OnceLock,
};

use clap::Parser;
use logger::{LogConfig, LogLevel};
use rand::RngCore;
use serde::Deserialize;

#[derive(Parser)]
#[command(name = "agent", about = "Container Census agent")]
pub struct CliArgs {
  /// API token clients must present. Overrides API_TOKEN and the
  /// persisted token file.
  #[arg(long)]
  pub token: Option<String>,
  /// Port to listen on.
  #[arg(long)]
  pub port: Option<u16>,
  /// IP to bind.
  #[arg(long)]
  pub bind_ip: Option<String>,
  /// Directory for persisted state (the token file).
  #[arg(long)]
  pub data_dir: Option<PathBuf>,
  /// trace | debug | info | warn | error
  #[arg(long)]
  pub log_level: Option<LogLevel>,
}

#[derive(Deserialize)]
pub struct Env {
  pub api_token: Option<String>,
  pub port: Option<u16>,
  pub bind_ip: Option<String>,
  pub data_dir: Option<PathBuf>,
  #[serde(default)]
  pub log_level: Option<LogLevel>,
}

pub struct AgentConfig {
  pub token: String,
  pub port: u16,
  pub bind_ip: String,
  pub logging: LogConfig,
}

const TOKEN_FILE: &str = "agent-token";

pub fn agent_config() -> &'static AgentConfig {
  static AGENT_CONFIG: OnceLock<AgentConfig> = OnceLock::new();
  AGENT_CONFIG.get_or_init(|| {
    let args = CliArgs::parse();
    let env: Env = match envy::from_env() {
      Ok(env) => env,
      Err(e) => {
        eprintln!("Invalid agent environment: {e:#}");
        std::process::exit(2);
      }
    };

    let data_dir = args
      .data_dir
      .or(env.data_dir)
      .unwrap_or_else(|| PathBuf::from("/app/data"));

    let token = resolve_token(
      args.token.or(env.api_token),
      &data_dir.join(TOKEN_FILE),
    );

    AgentConfig {
      token,
      port: args.port.or(env.port).unwrap_or(9876),
      bind_ip: args
        .bind_ip
        .or(env.bind_ip)
        .unwrap_or_else(|| String::from("0.0.0.0")),
      logging: LogConfig {
        level: args.log_level.or(env.log_level).unwrap_or_default(),
        ..Default::default()
      },
    }
  })
}

/// Token priority: CLI flag / env var > persisted file >
/// auto-generated (persisted when the data directory exists).
fn resolve_token(
  explicit: Option<String>,
  token_path: &Path,
) -> String {
  if let Some(token) = explicit.filter(|token| !token.is_empty()) {
    return token;
  }

  if let Ok(token) = fs::read_to_string(token_path) {
    let token = token.trim().to_string();
    if !token.is_empty() {
      return token;
    }
  }

  let mut bytes = [0u8; 32];
  rand::rng().fill_bytes(&mut bytes);
  let token = hex::encode(bytes);

  if token_path.parent().is_some_and(Path::exists) {
    if let Err(e) = persist_token(token_path, &token) {
      eprintln!(
        "WARN: failed to persist generated token at {token_path:?}: {e:#}"
      );
    }
  }

  token
}

fn persist_token(path: &Path, token: &str) -> anyhow::Result<()> {
  fs::write(path, token)?;
  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn explicit_token_wins() {
    let token = resolve_token(
      Some(String::from("from-cli")),
      Path::new("/nonexistent/agent-token"),
    );
    assert_eq!(token, "from-cli");
  }

  #[test]
  fn generated_token_is_hex_when_nothing_configured() {
    let token = resolve_token(
      None,
      Path::new("/nonexistent/agent-token"),
    );
    assert_eq!(token.len(), 64);
    assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
  }

  #[test]
  fn persisted_token_is_read_back() {
    let dir = std::env::temp_dir().join("census-agent-token-test");
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join(TOKEN_FILE);
    let generated = resolve_token(None, &path);
    let reread = resolve_token(None, &path);
    assert_eq!(generated, reread);
    fs::remove_dir_all(&dir).ok();
  }
}

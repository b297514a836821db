use std::sync::Arc;

use anyhow::Context;
use async_timing_util::{Timelength, wait_until_timelength};
use serde::Deserialize;

use crate::state::{VersionInfo, shutdown, version_info};

const RELEASES_URL: &str = "https://api.github.com/repos/selfhosters-cc/container-census/releases/latest";

#[derive(Deserialize)]
struct LatestRelease {
  tag_name: String,
  html_url: String,
}

/// Feeds `latest_version` / `update_available` on the health route.
pub fn spawn_version_check_loop() {
  tokio::spawn(async move {
    refresh().await;
    loop {
      tokio::select! {
        _ = shutdown().cancelled() => break,
        _ = wait_until_timelength(Timelength::TwelveHours, 500) => {}
      }
      refresh().await;
    }
  });
}

async fn refresh() {
  match fetch_latest().await {
    Ok(release) => {
      version_info().store(Arc::new(VersionInfo {
        latest_version: Some(
          release.tag_name.trim_start_matches('v').to_string(),
        ),
        release_url: Some(release.html_url),
      }));
    }
    Err(e) => debug!("Version check failed | {e:#}"),
  }
}

async fn fetch_latest() -> anyhow::Result<LatestRelease> {
  let response = reqwest::Client::new()
    .get(RELEASES_URL)
    .header("User-Agent", "container-census")
    .timeout(std::time::Duration::from_secs(10))
    .send()
    .await
    .context("Failed to reach github releases api")?;
  let status = response.status();
  if !status.is_success() {
    return Err(anyhow::anyhow!("github returned {status}"));
  }
  response
    .json()
    .await
    .context("Failed to parse release response")
}

pub fn update_available(latest: Option<&str>) -> bool {
  latest
    .is_some_and(|latest| latest != env!("CARGO_PKG_VERSION"))
}

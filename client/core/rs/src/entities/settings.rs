use serde::{Deserialize, Serialize};

/// Database-resident configuration. Loaded once at startup, hot-swapped
/// on update; every background job reads the current snapshot on each
/// iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
  pub scanner: ScannerSettings,
  pub notifications: NotificationSettings,
  pub baselines: BaselineSettings,
  pub retention: RetentionSettings,
  pub telemetry: TelemetrySettings,
}

impl Default for Settings {
  fn default() -> Settings {
    Settings {
      scanner: ScannerSettings::default(),
      notifications: NotificationSettings::default(),
      baselines: BaselineSettings::default(),
      retention: RetentionSettings::default(),
      telemetry: TelemetrySettings::default(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerSettings {
  pub interval_seconds: u64,
  pub timeout_seconds: u64,
  /// Upper bound on concurrent per-host scans.
  pub max_concurrent_hosts: usize,
  /// Concurrent inspect / stats workers within one host.
  pub container_workers: usize,
}

impl Default for ScannerSettings {
  fn default() -> ScannerSettings {
    ScannerSettings {
      interval_seconds: 300,
      timeout_seconds: 30,
      max_concurrent_hosts: 16,
      container_workers: 8,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
  /// Token bucket capacity, refilled at capacity / hour.
  pub max_per_hour: u32,
  /// Queued events flush as one summary at this interval.
  pub batch_interval_seconds: u64,
}

impl Default for NotificationSettings {
  fn default() -> NotificationSettings {
    NotificationSettings {
      max_per_hour: 30,
      batch_interval_seconds: 600,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineSettings {
  pub window_hours: i64,
  pub min_samples: i64,
  /// Excess over the pre-update baseline that counts as anomalous.
  pub anomaly_threshold_percent: f64,
  /// How long after an image update anomaly detection stays armed.
  pub anomaly_window_hours: i64,
}

impl Default for BaselineSettings {
  fn default() -> BaselineSettings {
    BaselineSettings {
      window_hours: 48,
      min_samples: 10,
      anomaly_threshold_percent: 25.0,
      anomaly_window_hours: 24,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSettings {
  /// Snapshots older than this are deleted outright.
  pub snapshot_days: i64,
  /// Redundant snapshots older than this are compacted.
  pub compaction_days: i64,
}

impl Default for RetentionSettings {
  fn default() -> RetentionSettings {
    RetentionSettings {
      snapshot_days: 30,
      compaction_days: 7,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
  /// Opt-in; nothing is submitted while false.
  pub enabled: bool,
  pub interval_hours: u64,
}

impl Default for TelemetrySettings {
  fn default() -> TelemetrySettings {
    TelemetrySettings {
      enabled: false,
      interval_hours: 168,
    }
  }
}

/// Body for `POST /api/config/scanner`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateScannerConfigBody {
  pub interval_seconds: u64,
  #[serde(default)]
  pub timeout_seconds: Option<u64>,
}

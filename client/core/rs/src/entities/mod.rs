use anyhow::anyhow;
use chrono::{DateTime, NaiveDateTime, TimeZone, Timelike, Utc};

pub mod agent;
pub mod baseline;
pub mod container;
pub mod host;
pub mod image;
pub mod lifecycle;
pub mod notification;
pub mod scan;
pub mod settings;
pub mod telemetry;

/// Canonical timestamp format written to the database and over the wire.
/// UTC, millisecond precision, `T` separator, `Z` suffix. Rows written in
/// this format order lexicographically, which the snapshot queries rely on.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Naive fallback formats for timestamps produced by other tools
/// (sqlite builtins, older exports). Interpreted as UTC.
const NAIVE_FORMATS: &[&str] = &[
  "%Y-%m-%dT%H:%M:%S%.f",
  "%Y-%m-%d %H:%M:%S%.f",
  "%Y-%m-%dT%H:%M:%S",
  "%Y-%m-%d %H:%M:%S",
];

/// Offset-carrying formats with a space separator, which RFC3339
/// parsing does not accept.
const OFFSET_FORMATS: &[&str] =
  &["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%:z"];

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
  ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a stored timestamp. Accepts RFC3339 with or without fractional
/// seconds, `T` or space separated, with `Z` / numeric offset / no offset
/// (assumed UTC).
pub fn parse_timestamp(raw: &str) -> anyhow::Result<DateTime<Utc>> {
  let raw = raw.trim();
  if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
    return Ok(ts.with_timezone(&Utc));
  }
  for format in OFFSET_FORMATS {
    if let Ok(ts) = DateTime::parse_from_str(raw, format) {
      return Ok(ts.with_timezone(&Utc));
    }
  }
  for format in NAIVE_FORMATS {
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
      return Ok(Utc.from_utc_datetime(&naive));
    }
  }
  Err(anyhow!("Unrecognized timestamp format: {raw}"))
}

/// Truncate to the containing UTC hour. Used as the stats aggregate key.
pub fn hour_bucket(ts: &DateTime<Utc>) -> DateTime<Utc> {
  ts.with_minute(0)
    .and_then(|ts| ts.with_second(0))
    .and_then(|ts| ts.with_nanosecond(0))
    .unwrap_or(*ts)
}

#[cfg(test)]
mod tests {
  use chrono::NaiveDate;

  use super::*;

  fn ts(
    y: i32,
    mo: u32,
    d: u32,
    h: u32,
    mi: u32,
    s: u32,
  ) -> DateTime<Utc> {
    Utc.from_utc_datetime(
      &NaiveDate::from_ymd_opt(y, mo, d)
        .unwrap()
        .and_hms_opt(h, mi, s)
        .unwrap(),
    )
  }

  #[test]
  fn parses_all_accepted_formats() {
    let expect = ts(2025, 3, 14, 9, 26, 53);
    for raw in [
      "2025-03-14T09:26:53Z",
      "2025-03-14T09:26:53.000Z",
      "2025-03-14 09:26:53",
      "2025-03-14 09:26:53.000",
      "2025-03-14T09:26:53+00:00",
      "2025-03-14 09:26:53+00:00",
      "2025-03-14T09:26:53",
    ] {
      assert_eq!(parse_timestamp(raw).unwrap(), expect, "{raw}");
    }
    // Offsets are normalized to UTC.
    assert_eq!(
      parse_timestamp("2025-03-14T11:26:53+02:00").unwrap(),
      expect
    );
    assert!(parse_timestamp("14/03/2025").is_err());
  }

  #[test]
  fn round_trips_canonical_format() {
    let now = ts(2031, 12, 31, 23, 59, 59);
    assert_eq!(parse_timestamp(&format_timestamp(&now)).unwrap(), now);
  }

  #[test]
  fn hour_bucket_truncates() {
    assert_eq!(
      hour_bucket(&ts(2025, 3, 14, 9, 26, 53)),
      ts(2025, 3, 14, 9, 0, 0)
    );
  }
}

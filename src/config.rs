use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::ui::{print_command_status, CommandStatus};

/// Defaults for `migrate` and `status` flags, read from `--config`. Flag and
/// environment values take precedence over everything here.
#[derive(Debug, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct FileConfig {
    pub start: Option<String>,
    pub end: Option<String>,
    pub reader_url: Option<String>,
    pub writer_url: Option<String>,
    pub progress_url: Option<String>,
    pub migration_name: Option<String>,
    pub progress_metric_name: Option<String>,
    pub block_duration: Option<String>,
    pub min_block_duration: Option<String>,
    pub max_block_duration: Option<String>,
    pub target_block_bytes: Option<u64>,
    #[serde(rename = "match")]
    pub selector: Option<String>,
    pub timeout: Option<String>,
    pub max_retries: Option<usize>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

pub fn load_file(path: &Path) -> Result<FileConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: FileConfig = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;

    for key in config.extra.keys() {
        print_command_status(
            CommandStatus::Warning,
            &format!("Warning: unknown config key {} in {}", key, path.display()),
        );
    }
    tracing::debug!(path = %path.display(), "loaded config file");

    Ok(config)
}

pub fn load_optional(path: Option<&Path>) -> Result<FileConfig> {
    match path {
        Some(path) => load_file(path),
        None => Ok(FileConfig::default()),
    }
}

/// Parses `now`, an RFC 3339 timestamp, or integer Unix seconds into Unix
/// milliseconds.
pub fn parse_timestamp(raw: &str, now: DateTime<Utc>) -> Result<i64> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("now") {
        return Ok(now.timestamp_millis());
    }
    if let Ok(seconds) = raw.parse::<i64>() {
        return seconds
            .checked_mul(1000)
            .with_context(|| format!("timestamp {raw} is out of range"));
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|parsed| parsed.timestamp_millis())
        .with_context(|| {
            format!("invalid timestamp '{raw}': expected RFC 3339, Unix seconds, or 'now'")
        })
}

/// Parses durations such as `500ms`, `90s`, `30m`, `1h30m` or `2d`.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        bail!("empty duration");
    }

    let mut total = Duration::ZERO;
    let mut rest = raw;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            bail!("invalid duration '{raw}': expected a number before each unit");
        }
        let amount: u64 = rest[..digits]
            .parse()
            .with_context(|| format!("invalid duration '{raw}'"))?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit_ms: u64 = match &rest[..unit_len] {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            "" => bail!("invalid duration '{raw}': missing unit (ms, s, m, h, d)"),
            other => bail!("invalid duration '{raw}': unknown unit '{other}'"),
        };
        rest = &rest[unit_len..];

        let part = amount
            .checked_mul(unit_ms)
            .with_context(|| format!("duration '{raw}' is too large"))?;
        total = total
            .checked_add(Duration::from_millis(part))
            .with_context(|| format!("duration '{raw}' is too large"))?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_accept_all_supported_forms() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert_eq!(parse_timestamp("now", now).unwrap(), now.timestamp_millis());
        assert_eq!(parse_timestamp("1700000000", now).unwrap(), 1_700_000_000_000);
        assert_eq!(
            parse_timestamp("2024-05-01T10:00:00Z", now).unwrap(),
            now.timestamp_millis() - 2 * 3_600_000
        );
        assert_eq!(
            parse_timestamp("2024-05-01T12:00:00+02:00", now).unwrap(),
            now.timestamp_millis() - 2 * 3_600_000
        );
        assert!(parse_timestamp("yesterday", now).is_err());
    }

    #[test]
    fn durations_combine_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(172_800));
    }

    #[test]
    fn durations_reject_malformed_input() {
        for raw in ["", "10", "h", "5w", "1h-30m", "1.5h"] {
            assert!(parse_duration(raw).is_err(), "{raw} should not parse");
        }
    }

    #[test]
    fn config_file_reads_known_keys_and_keeps_unknown_ones() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("migrate.json");
        std::fs::write(
            &path,
            r#"{
                "reader_url": "http://source:9090/api/v1/read",
                "match": "{job=\"node\"}",
                "max_retries": 5,
                "colour": "blue"
            }"#,
        )
        .unwrap();

        let config = load_file(&path).unwrap();
        assert_eq!(
            config.reader_url.as_deref(),
            Some("http://source:9090/api/v1/read")
        );
        assert_eq!(config.selector.as_deref(), Some(r#"{job="node"}"#));
        assert_eq!(config.max_retries, Some(5));
        assert!(config.extra.contains_key("colour"));
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_file(&dir.path().join("absent.json")).is_err());
        assert_eq!(load_optional(None).unwrap(), FileConfig::default());
    }
}

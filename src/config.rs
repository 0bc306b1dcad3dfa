//! Mirror configuration document.
//!
//! A JSON document with one entry per source set: the directories to watch,
//! the destination roots to mirror into, the check interval, and the policy
//! knobs. Slack credentials for the optional notification sink live at the
//! top level.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed configuration document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid check_interval {0:?}")]
    InvalidDuration(String),
}

/// One source set: directories mirrored to destinations under one policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    pub name: String,
    pub directories: Vec<String>,
    pub destinations: Vec<String>,
    /// Duration string, e.g. `30s`, `1m`, `1m30s`.
    pub check_interval: String,
    /// Free-space floor in bytes; a destination at or below it is skipped.
    pub min_free_space: u64,
    /// Candidates smaller than this are ignored entirely.
    #[serde(default)]
    pub min_file_size: u64,
    /// Replace a destination file whose content differs from the source.
    #[serde(default)]
    pub override_if_different: bool,
}

impl MirrorConfig {
    /// The parsed check interval.
    pub fn period(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.check_interval)
            .ok_or_else(|| ConfigError::InvalidDuration(self.check_interval.clone()))
    }
}

/// The whole configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorSettings {
    pub configs: Vec<MirrorConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slack_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slack_channel_id: Option<String>,
}

impl MirrorSettings {
    /// Load and validate the document at `path`. Malformed JSON or an
    /// unparseable check interval is fatal.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let settings: Self = serde_json::from_str(&raw)?;
        for config in &settings.configs {
            config.period()?;
        }
        Ok(settings)
    }

    /// Write a template document with sample values for the operator to
    /// fill in.
    pub fn write_template(path: &Path) -> Result<(), ConfigError> {
        let template = Self {
            configs: vec![MirrorConfig {
                name: "example".to_string(),
                directories: vec!["exampleDir1".to_string(), "exampleDir2".to_string()],
                destinations: vec!["exampleDestinationDir".to_string()],
                check_interval: "1m".to_string(),
                min_free_space: 10_000 * 1024 * 1024,
                min_file_size: 1,
                override_if_different: false,
            }],
            slack_token: None,
            slack_channel_id: None,
        };
        fs::write(path, serde_json::to_string_pretty(&template)?)?;
        Ok(())
    }
}

/// Parse a compound duration string like `30s`, `1m30s`, `500ms`, `2h`.
/// Every segment needs a unit; unknown units and bare numbers are rejected.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let mut total = Duration::ZERO;
    let mut chars = s.chars().peekable();
    while chars.peek().is_some() {
        let mut value = String::new();
        while let Some(c) = chars.peek() {
            if c.is_ascii_digit() {
                value.push(*c);
                chars.next();
            } else {
                break;
            }
        }
        let mut unit = String::new();
        while let Some(c) = chars.peek() {
            if c.is_ascii_alphabetic() {
                unit.push(*c);
                chars.next();
            } else {
                break;
            }
        }
        let value: u64 = value.parse().ok()?;
        total += match unit.as_str() {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.checked_mul(60)?),
            "h" => Duration::from_secs(value.checked_mul(3600)?),
            _ => return None,
        };
    }
    Some(total)
}

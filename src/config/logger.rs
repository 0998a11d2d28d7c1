//! `[logger]` section.
//!
//! Console output is on by default and names the emitting thread, so a line
//! from `hubpipe-pipeline` can be told apart from one on `hubpipe-callback`.
//! Journald output is opt-in.

use serde::{Deserialize, Serialize};
use time::format_description;
use validator::{Validate, ValidationError};

const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

/// How console lines are stamped. `Custom` takes a `time` format
/// description such as `"[hour]:[minute]:[second]"`; it is always UTC.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampFormat {
    #[default]
    Rfc3339,
    Unix,
    Custom(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggerConfig {
    /// trace, debug, info, warn or error, in any case. `RUST_LOG` wins when set.
    #[validate(custom(function = "validate_log_level"))]
    pub level: String,

    #[validate(custom(function = "validate_timestamp_format"))]
    pub timestamp_format: TimestampFormat,

    #[validate(nested)]
    pub console: Option<ConsoleConfig>,

    #[validate(nested)]
    pub journald: Option<JournaldConfig>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            timestamp_format: TimestampFormat::Rfc3339,
            console: Some(ConsoleConfig::default()),
            journald: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ConsoleConfig {
    pub enabled: bool,
    pub format: LogFormat,
    /// Module path of the event.
    pub show_target: bool,
    pub show_thread_ids: bool,
    pub show_thread_names: bool,
    /// Emit a line when a span closes, with its busy/idle time.
    pub show_spans: bool,
    pub ansi_colors: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            format: LogFormat::Compact,
            show_target: false,
            show_thread_ids: false,
            show_thread_names: true,
            show_spans: false,
            ansi_colors: true,
        }
    }
}

/// systemd journal output, Linux only.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct JournaldConfig {
    pub enabled: bool,
    /// SYSLOG_IDENTIFIER of every entry.
    #[validate(length(min = 1, message = "journald identifier cannot be empty"))]
    pub identifier: String,
}

impl Default for JournaldConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            identifier: "hubpipe".into(),
        }
    }
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    if LEVELS.contains(&level.to_ascii_lowercase().as_str()) {
        return Ok(());
    }
    let mut err = ValidationError::new("log_level");
    err.message = Some(format!("unknown log level '{level}', expected one of {LEVELS:?}").into());
    Err(err)
}

fn validate_timestamp_format(format: &TimestampFormat) -> Result<(), ValidationError> {
    let TimestampFormat::Custom(description) = format else {
        return Ok(());
    };
    if description.is_empty() {
        let mut err = ValidationError::new("timestamp_format");
        err.message = Some("custom timestamp format cannot be empty".into());
        return Err(err);
    }
    format_description::parse_owned::<1>(description).map_err(|e| {
        let mut err = ValidationError::new("timestamp_format");
        err.message = Some(format!("bad timestamp format '{description}': {e}").into());
        err
    })?;
    Ok(())
}

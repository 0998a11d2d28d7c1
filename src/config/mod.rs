//! Configuration loading and validation.
//!
//! The top-level [`Config`] aggregates the logging, pipeline and transport
//! sections. It is read once from a TOML file, validated with the
//! `validator` crate and treated as immutable afterwards.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use validator::Validate;

use self::{logger::LoggerConfig, pipeline::PipelineConfig};

pub mod logger;
pub mod pipeline;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "HUBPIPE_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "/etc/hubpipe/config.toml";

/// Prints a UTC-stamped line to stdout before the tracing subscriber exists.
#[doc(hidden)]
#[macro_export]
macro_rules! print_stamped {
    ($label:expr, $($arg:tt)*) => {
        println!(
            "{}  {} {}",
            console::style(
                time::OffsetDateTime::now_utc()
                    .format(&time::format_description::well_known::Rfc3339)
                    .unwrap_or_default()
            )
            .dim(),
            $label,
            format_args!($($arg)*)
        )
    };
}

#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => { $crate::print_stamped!(console::style("INFO").green(), $($arg)*) };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => { $crate::print_stamped!(console::style("WARN").yellow(), $($arg)*) };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => { $crate::print_stamped!(console::style("ERROR").red(), $($arg)*) };
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No file to load, or the named file is missing.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cannot read configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Malformed configuration: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Top-level configuration.
///
/// Every section is optional in the file and falls back to its defaults.
#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub logger: LoggerConfig,

    #[validate(nested)]
    pub pipeline: PipelineConfig,

    /// Settings of the MQTT session behind the protocol stage.
    #[validate(nested)]
    pub transport: TransportConfig,
}

#[cfg(feature = "hubpipe-mqtt")]
pub type TransportConfig = hubpipe_mqtt::Config;

/// Placeholder section when the crate is built without a transport.
#[cfg(not(feature = "hubpipe-mqtt"))]
#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
pub struct TransportConfig {}

impl Config {
    /// Loads the file named by `HUBPIPE_CONFIG`, falling back to
    /// `/etc/hubpipe/config.toml`.
    pub fn new() -> Result<Self, ConfigError> {
        Self::load(&Self::locate()?)
    }

    fn locate() -> Result<PathBuf, ConfigError> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            let path = PathBuf::from(path);
            print_info!("{} points at {}", CONFIG_ENV, path.display());
            return Ok(path);
        }

        let fallback = Path::new(DEFAULT_CONFIG_PATH);
        if fallback.is_file() {
            return Ok(fallback.to_path_buf());
        }
        Err(ConfigError::Config(format!(
            "{CONFIG_ENV} is not set and {DEFAULT_CONFIG_PATH} does not exist"
        )))
    }

    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::Config(format!(
                "{} does not exist",
                path.display()
            )));
        }

        let config = Self::from_toml(&fs::read_to_string(path)?)?;
        print_info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parses `source` and validates every section.
    pub fn from_toml(source: &str) -> Result<Config, ConfigError> {
        let config: Config =
            toml::from_str(source).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        Ok(config)
    }
}

//! Logging setup for the pipeline.
//!
//! `LoggerManager` validates a [`LoggerConfig`] and installs the global
//! `tracing` subscriber with a console layer and, optionally, a systemd
//! journald layer. Console output names the emitting thread by default,
//! which shows at a glance whether a line came from the pipeline or the
//! callback context.

use std::{fmt as stdfmt, io};

use thiserror::Error;
use time::{
    format_description::{self, well_known::Rfc3339, OwnedFormatItem},
    OffsetDateTime,
};
use tracing::instrument;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, format::Writer, time::FormatTime},
    prelude::*,
    EnvFilter, Layer,
};
use validator::{Validate, ValidationErrors};

use crate::{
    config::logger::{ConsoleConfig, JournaldConfig, LogFormat, LoggerConfig, TimestampFormat},
    print_info, print_warn,
};

type BoxedLayer = Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync>;

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("Logger initialization error: {0}")]
    InitializationError(String),

    #[error("Logger configuration validation error: {0}")]
    ValidationError(#[from] ValidationErrors),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("No logging layers were configured or successfully initialized")]
    NoLayersConfigured,

    /// Journald was the only output and it could not be reached.
    #[error("Failed to initialize journald logger and console output is disabled")]
    JournaldUnavailable,
}

/// Validates logging configuration and installs the global subscriber.
pub struct LoggerManager {
    config: LoggerConfig,
}

impl LoggerManager {
    /// # Errors
    ///
    /// Returns `LoggerError::ValidationError` if the configuration is invalid.
    pub fn new(config: LoggerConfig) -> Result<Self, LoggerError> {
        config.validate()?;

        Ok(LoggerManager { config })
    }

    /// Installs the subscriber. Must be called once, before the pipeline is
    /// built, so the worker threads log through it.
    ///
    /// `RUST_LOG` overrides the configured level when set.
    #[instrument(skip(self))]
    pub fn init(&mut self) -> Result<(), LoggerError> {
        let layers = self.layers()?;
        tracing_subscriber::registry()
            .with(layers)
            .try_init()
            .map_err(|e| LoggerError::InitializationError(e.to_string()))
    }

    fn layers(&self) -> Result<Vec<BoxedLayer>, LoggerError> {
        let mut layers = Vec::new();

        if let Some(console_config) = self.config.console.as_ref().filter(|c| c.enabled) {
            layers.push(self.console_layer(console_config, self.filter())?);
        }

        // Journald layer (Linux/systemd only)
        if let Some(journald_config) = self.config.journald.as_ref().filter(|j| j.enabled) {
            match self.journald_layer(journald_config, self.filter()) {
                Ok(layer) => {
                    layers.push(layer);
                    print_info!(
                        "Systemd journald logger initialized with identifier: {}",
                        journald_config.identifier
                    );
                }
                Err(e) => {
                    print_warn!("Failed to initialize systemd journald logger: {}", e);
                    if layers.is_empty() {
                        return Err(LoggerError::JournaldUnavailable);
                    }
                }
            }
        }

        if layers.is_empty() {
            print_warn!("No logging layers were initialized. Please check your configuration.");
            return Err(LoggerError::NoLayersConfigured);
        }
        Ok(layers)
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.config.level))
    }

    fn timestamp(&self) -> Result<Timestamp, LoggerError> {
        Ok(match &self.config.timestamp_format {
            TimestampFormat::Rfc3339 => Timestamp::Rfc3339,
            TimestampFormat::Unix => Timestamp::Unix,
            TimestampFormat::Custom(description) => Timestamp::Custom(
                format_description::parse_owned::<1>(description)
                    .map_err(|e| LoggerError::InitializationError(e.to_string()))?,
            ),
        })
    }

    fn console_layer(
        &self,
        config: &ConsoleConfig,
        filter: EnvFilter,
    ) -> Result<BoxedLayer, LoggerError> {
        let span_events = if config.show_spans {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let base = fmt::layer()
            .with_target(config.show_target)
            .with_thread_ids(config.show_thread_ids)
            .with_thread_names(config.show_thread_names)
            .with_span_events(span_events)
            .with_ansi(config.ansi_colors)
            .with_timer(self.timestamp()?)
            .with_writer(io::stdout);

        Ok(match config.format {
            LogFormat::Json => base.json().with_filter(filter).boxed(),
            LogFormat::Pretty => base.pretty().with_filter(filter).boxed(),
            LogFormat::Compact => base.compact().with_filter(filter).boxed(),
        })
    }

    fn journald_layer(
        &self,
        config: &JournaldConfig,
        filter: EnvFilter,
    ) -> Result<BoxedLayer, LoggerError> {
        let layer = tracing_journald::layer()?.with_syslog_identifier(config.identifier.clone());
        Ok(layer.with_filter(filter).boxed())
    }
}

/// UTC timer for console lines.
enum Timestamp {
    Rfc3339,
    Unix,
    Custom(OwnedFormatItem),
}

impl FormatTime for Timestamp {
    fn format_time(&self, w: &mut Writer<'_>) -> stdfmt::Result {
        let now = OffsetDateTime::now_utc();
        match self {
            Timestamp::Rfc3339 => {
                write!(w, "{}", now.format(&Rfc3339).map_err(|_| stdfmt::Error)?)
            }
            Timestamp::Unix => write!(w, "{}.{:06}", now.unix_timestamp(), now.microsecond()),
            Timestamp::Custom(items) => {
                write!(w, "{}", now.format(items).map_err(|_| stdfmt::Error)?)
            }
        }
    }
}

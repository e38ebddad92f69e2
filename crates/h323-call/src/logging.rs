//! Logging setup for applications embedding the call engine
//!
//! The engine itself only emits `tracing` events (the call token travels as
//! the `call` field). The `[logging]` table of the endpoint configuration
//! describes the subscriber; binaries and tests hand it to
//! [`setup_logging`] once. `RUST_LOG` directives are honoured on top of it.
//!
//! ```toml
//! [logging]
//! level = "info"
//! format = "json"
//! directives = ["rvoip_h323_call::manager=debug", "rvoip_h323_transport=warn"]
//! ```

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

use crate::errors::{CallError, CallResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per line on stdout
    Json,
}

/// Subscriber settings, loaded with the endpoint configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level name, e.g. "debug"
    pub level: String,
    pub format: LogFormat,
    /// Include file and line information
    pub file_info: bool,
    /// Log span enter and exit
    pub spans: bool,
    /// Per-target overrides in `EnvFilter` syntax
    pub directives: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file_info: false,
            spans: false,
            directives: Vec::new(),
        }
    }
}

impl LoggingConfig {
    pub fn new(level: Level) -> Self {
        Self { level: level.as_str().to_ascii_lowercase(), ..Default::default() }
    }

    pub fn with_json(mut self) -> Self {
        self.format = LogFormat::Json;
        self
    }

    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }

    pub fn with_spans(mut self) -> Self {
        self.spans = true;
        self
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    pub fn level(&self) -> CallResult<Level> {
        parse_log_level(&self.level)
    }

    /// Parsed per-target directives, in configuration order
    pub fn parsed_directives(&self) -> CallResult<Vec<Directive>> {
        self.directives
            .iter()
            .map(|text| {
                Directive::from_str(text).map_err(|e| CallError::Configuration {
                    message: format!("Invalid log directive '{}': {}", text, e),
                })
            })
            .collect()
    }

    pub fn validate(&self) -> CallResult<()> {
        self.level()?;
        self.parsed_directives()?;
        Ok(())
    }

    /// `RUST_LOG`, then the default level, then the configured directives
    pub fn env_filter(&self) -> CallResult<EnvFilter> {
        let mut filter = EnvFilter::from_default_env().add_directive(self.level()?.into());
        for directive in self.parsed_directives()? {
            filter = filter.add_directive(directive);
        }
        Ok(filter)
    }
}

/// Install the global subscriber; fails if one is already installed
pub fn setup_logging(config: &LoggingConfig) -> CallResult<()> {
    let filter = config.env_filter()?;
    let span_events = if config.spans { FmtSpan::ACTIVE } else { FmtSpan::NONE };

    let mut subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_span_events(span_events);
    if config.file_info {
        subscriber = subscriber.with_file(true).with_line_number(true);
    }

    let installed = match config.format {
        LogFormat::Json => subscriber.with_writer(std::io::stdout).json().try_init(),
        LogFormat::Text => subscriber.try_init(),
    };
    installed.map_err(|e| CallError::Configuration {
        message: format!("Logging setup failed: {}", e),
    })?;

    tracing::info!("rvoip-h323-call v{} logging at {}", env!("CARGO_PKG_VERSION"), config.level);
    Ok(())
}

/// Parse a log level name such as "debug"
pub fn parse_log_level(level: &str) -> CallResult<Level> {
    Level::from_str(level).map_err(|_| CallError::Configuration {
        message: format!("Invalid log level: {}", level),
    })
}

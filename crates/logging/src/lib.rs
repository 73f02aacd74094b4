//! Logging for nim-deploy
//!
//! Installs a `tracing` subscriber filtered by `RUST_LOG` (falling back to a
//! level chosen by verbosity) in either human-readable or JSON form. Output
//! of the inference container is logged under the [`CONTAINER_TARGET`]
//! target so it can be filtered separately, e.g. `RUST_LOG=info,container=off`.

use std::fmt;
use std::str::FromStr;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt as subscriber_fmt, EnvFilter};

use common::error::{Error, Result};

/// Target used for lines read from the inference container's log stream
pub const CONTAINER_TARGET: &str = "container";

/// Output format of the subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("Unknown log format: {}", s)),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// How the subscriber should be set up
#[derive(Debug, Clone, Default)]
pub struct LoggingOptions {
    /// 0 = info, 1 = debug, 2+ = trace
    pub verbosity: u8,
    pub format: LogFormat,
}

impl LoggingOptions {
    /// Level used when `RUST_LOG` is not set
    pub fn default_level(&self) -> LevelFilter {
        match self.verbosity {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init(options: &LoggingOptions) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.default_level().to_string()));

    let builder = subscriber_fmt().with_env_filter(filter).with_target(true);

    let result = match options.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    result.map_err(|e| Error::Internal(format!("Failed to initialize logging: {}", e)))
}

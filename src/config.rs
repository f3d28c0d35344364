//! Environment-driven configuration shared with the controller.

use std::str::FromStr;

pub const DEFAULT_PORT: u16 = 3600;

/// Verbosity levels understood by `LOG_LEVEL`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Silent,
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "silent" => Ok(Self::Silent),
            _ => Err(()),
        }
    }
}

impl LogLevel {
    /// The equivalent `tracing` filter directive, or `None` for silent.
    pub fn tracing_filter(self) -> Option<&'static str> {
        match self {
            Self::Debug => Some("debug"),
            Self::Info => Some("info"),
            Self::Warn => Some("warn"),
            Self::Error => Some("error"),
            Self::Silent => None,
        }
    }
}

/// Process configuration from `LOG_LEVEL`, `PORT`, and `TLS`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoreConfig {
    pub log_level: LogLevel,
    pub port: u16,
    pub tls: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            port: DEFAULT_PORT,
            tls: true,
        }
    }
}

impl CoreConfig {
    /// Reads the environment, falling back to defaults on unset or
    /// unparseable values.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            log_level: std::env::var("LOG_LEVEL")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(defaults.log_level),
            port: std::env::var("PORT")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(defaults.port),
            tls: std::env::var("TLS")
                .map(|value| value != "false")
                .unwrap_or(defaults.tls),
        }
    }
}

//! Configures the global default tracing subscriber

use thiserror::Error;

pub use tracing_subscriber::{
    filter::ParseError as InvalidLogFilter, util::TryInitError as LogInitError,
    EnvFilter as LogFilter,
};

/// Configures logging settings
#[derive(Clone, Debug)]
#[cfg_attr(feature = "clap", derive(clap::Args))]
pub struct LogArgs {
    /// The filter that determines what tracing spans and events are enabled.
    #[cfg_attr(
        feature = "clap",
        clap(long = "log-level", env = "K8M_LOG", default_value = LogArgs::DEFAULT_FILTER)
    )]
    pub log_level: String,

    /// The log format to use: `plain` or `json`.
    #[cfg_attr(feature = "clap", clap(long = "log-format", default_value = "plain"))]
    pub log_format: LogFormat,
}

/// Configures whether logs should be emitted in plaintext (the default) or as
/// JSON-encoded messages
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// The default plaintext format
    #[default]
    Plain,

    /// The JSON-encoded format
    Json,
}

/// Indicates that an invalid log format was specified
#[derive(Debug, Error)]
#[error("invalid log format: {0} must be 'plain' or 'json'")]
pub struct InvalidLogFormat(String);

// === impl LogArgs ===

impl LogArgs {
    /// The filter used when none is configured
    pub const DEFAULT_FILTER: &'static str = "k8m=info,warn";

    /// Parses the configured log level filter
    pub fn filter(&self) -> Result<LogFilter, InvalidLogFilter> {
        LogFilter::try_new(&self.log_level)
    }
}

impl Default for LogArgs {
    fn default() -> Self {
        Self {
            log_level: Self::DEFAULT_FILTER.to_string(),
            log_format: LogFormat::default(),
        }
    }
}

// === impl LogFormat ===

impl std::str::FromStr for LogFormat {
    type Err = InvalidLogFormat;

    fn from_str(s: &str) -> Result<Self, InvalidLogFormat> {
        match s {
            "json" => Ok(LogFormat::Json),
            "plain" => Ok(LogFormat::Plain),
            s => Err(InvalidLogFormat(s.to_string())),
        }
    }
}

impl LogFormat {
    /// Attempts to configure the global default tracing subscriber in the
    /// current scope, returning an error if one is already set
    ///
    /// This method returns an error if a global default subscriber has already
    /// been set, or if a `log` logger has already been set.
    pub fn try_init(self, filter: LogFilter) -> Result<(), LogInitError> {
        use tracing_subscriber::prelude::*;

        let registry = tracing_subscriber::registry().with(filter);

        match self {
            LogFormat::Plain => registry.with(tracing_subscriber::fmt::layer()).try_init()?,

            LogFormat::Json => {
                let event_fmt = tracing_subscriber::fmt::format()
                    .json()
                    .with_span_list(true)
                    .with_current_span(false);
                let fmt = tracing_subscriber::fmt::layer()
                    .event_format(event_fmt)
                    .fmt_fields(tracing_subscriber::fmt::format::JsonFields::default());
                registry.with(fmt).try_init()?
            }
        };

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_formats() {
        assert_eq!("plain".parse::<LogFormat>().unwrap(), LogFormat::Plain);
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        let error = "yaml".parse::<LogFormat>().unwrap_err();
        assert_eq!(
            error.to_string(),
            "invalid log format: yaml must be 'plain' or 'json'"
        );
    }

    #[test]
    fn default_filter_is_valid() {
        let args = LogArgs::default();
        assert_eq!(args.log_format, LogFormat::Plain);
        assert!(args.filter().is_ok());

        let invalid = LogArgs {
            log_level: "k8m=loud".to_string(),
            ..LogArgs::default()
        };
        assert!(invalid.filter().is_err());
    }
}

//! Process-wide tracing setup for the launcher and its daemons.
//!
//! Records go to stderr and, when a log directory is given, to files
//! written through non-blocking `tracing-appender` workers. Each sink has its
//! own minimum severity taken from `CF_CONSOLE_SEVERITY` and
//! `CF_FILE_SEVERITY`; `RUST_LOG` overrides both when set.

use std::path::PathBuf;
use std::sync::OnceLock;

use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use cvdhost_shared::StackTraceError;
use cvdhost_shared::errors::stderr_is_terminal;

pub const CONSOLE_SEVERITY_ENV: &str = "CF_CONSOLE_SEVERITY";
pub const FILE_SEVERITY_ENV: &str = "CF_FILE_SEVERITY";

static INITIALIZED: OnceLock<()> = OnceLock::new();

/// Minimum severity names understood in the environment, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Verbose,
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl Severity {
    /// Parse a name (any case) or the integer value `0..=5`.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if let Ok(number) = value.parse::<u8>() {
            return match number {
                0 => Some(Self::Verbose),
                1 => Some(Self::Debug),
                2 => Some(Self::Info),
                3 => Some(Self::Warning),
                4 => Some(Self::Error),
                5 => Some(Self::Fatal),
                _ => None,
            };
        }
        match value.to_ascii_uppercase().as_str() {
            "VERBOSE" => Some(Self::Verbose),
            "DEBUG" => Some(Self::Debug),
            "INFO" => Some(Self::Info),
            "WARNING" => Some(Self::Warning),
            "ERROR" => Some(Self::Error),
            "FATAL" => Some(Self::Fatal),
            _ => None,
        }
    }

    pub fn level_filter(self) -> LevelFilter {
        match self {
            Self::Verbose => LevelFilter::TRACE,
            Self::Debug => LevelFilter::DEBUG,
            Self::Info => LevelFilter::INFO,
            Self::Warning => LevelFilter::WARN,
            // tracing has nothing above ERROR.
            Self::Error | Self::Fatal => LevelFilter::ERROR,
        }
    }
}

/// Severity from `var`, or `default` when unset or unparsable. The second
/// value is the rejected text, reported once logging is up.
fn severity_from_env(var: &str, default: Severity) -> (Severity, Option<String>) {
    match std::env::var(var) {
        Ok(value) => match Severity::parse(&value) {
            Some(severity) => (severity, None),
            None => (default, Some(value)),
        },
        Err(_) => (default, None),
    }
}

#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Directory for file sinks. `None` logs to stderr only.
    pub log_dir: Option<PathBuf>,
    /// File name inside `log_dir`, e.g. `launcher.log`.
    pub file_name: String,
    pub console_default: Severity,
    pub file_default: Severity,
}

impl LogOptions {
    pub fn stderr_only() -> Self {
        Self {
            log_dir: None,
            file_name: String::new(),
            console_default: Severity::Info,
            file_default: Severity::Debug,
        }
    }

    pub fn with_file(log_dir: impl Into<PathBuf>, file_name: impl Into<String>) -> Self {
        Self {
            log_dir: Some(log_dir.into()),
            file_name: file_name.into(),
            ..Self::stderr_only()
        }
    }
}

/// Keeps the file writers flushing. Hold it until the process exits.
#[must_use]
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

fn layer_filter(severity: Severity) -> EnvFilter {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::default().add_directive(severity.level_filter().into()),
    }
}

/// Install the global subscriber. Later calls return an inert guard.
pub fn init_logging(options: LogOptions) -> LoggingGuard {
    if INITIALIZED.set(()).is_err() {
        return LoggingGuard { _file_guard: None };
    }

    let (console, bad_console) = severity_from_env(CONSOLE_SEVERITY_ENV, options.console_default);
    let (file, bad_file) = severity_from_env(FILE_SEVERITY_ENV, options.file_default);

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(stderr_is_terminal())
        .with_filter(layer_filter(console));

    let mut file_guard = None;
    let file_layer = options.log_dir.as_ref().and_then(|dir| {
        if let Err(err) = std::fs::create_dir_all(dir) {
            eprintln!("cannot create log directory {}: {}", dir.display(), err);
            return None;
        }
        let appender = tracing_appender::rolling::never(dir, &options.file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        file_guard = Some(guard);
        Some(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(layer_filter(file)),
        )
    });

    let installed = tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init();
    if installed.is_err() {
        // Another subscriber (e.g. a test harness) is already global.
        return LoggingGuard { _file_guard: None };
    }

    if let Some(value) = bad_console {
        tracing::warn!(%value, "Unknown {} value, using {:?}", CONSOLE_SEVERITY_ENV, console);
    }
    if let Some(value) = bad_file {
        tracing::warn!(%value, "Unknown {} value, using {:?}", FILE_SEVERITY_ENV, file);
    }

    LoggingGuard {
        _file_guard: file_guard,
    }
}

/// Report an error that ends the process: one log record plus the
/// rendered trace on stderr.
pub fn log_fatal(err: &StackTraceError) {
    tracing::error!(kind = %err.kind(), "{}", err.message());
    eprintln!("{}", err.format_for_env(stderr_is_terminal()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names_and_numbers() {
        assert_eq!(Severity::parse("verbose"), Some(Severity::Verbose));
        assert_eq!(Severity::parse("WARNING"), Some(Severity::Warning));
        assert_eq!(Severity::parse(" Error "), Some(Severity::Error));
        assert_eq!(Severity::parse("2"), Some(Severity::Info));
        assert_eq!(Severity::parse("5"), Some(Severity::Fatal));
        assert_eq!(Severity::parse("6"), None);
        assert_eq!(Severity::parse("loud"), None);
    }

    #[test]
    fn test_level_mapping() {
        assert_eq!(Severity::Verbose.level_filter(), LevelFilter::TRACE);
        assert_eq!(Severity::Warning.level_filter(), LevelFilter::WARN);
        assert_eq!(Severity::Fatal.level_filter(), LevelFilter::ERROR);
    }

    #[test]
    fn test_unset_variable_uses_default() {
        let (severity, rejected) =
            severity_from_env("CVDHOST_TEST_SEVERITY_UNSET_VARIABLE", Severity::Debug);
        assert_eq!(severity, Severity::Debug);
        assert!(rejected.is_none());
    }

    #[test]
    fn test_second_init_is_inert() {
        let dir = tempfile::tempdir().unwrap();
        let _first = init_logging(LogOptions::with_file(dir.path(), "first.log"));
        let second = init_logging(LogOptions::stderr_only());
        assert!(second._file_guard.is_none());
    }
}

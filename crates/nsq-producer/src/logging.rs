//! Pluggable per-level logging.
//!
//! The producer and its connection never write log lines directly. Each line goes to the
//! [`Logger`] registered for its [`LogLevel`], if any, and only when the level is at or
//! above the configured minimum. By default every level is routed into `tracing`.

use std::fmt;
use std::sync::Arc;

/// Severity of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    /// Verbose diagnostics.
    Debug = 0,
    /// Lifecycle events.
    Info = 1,
    /// Recoverable problems.
    Warning = 2,
    /// Failures.
    Error = 3,
}

impl LogLevel {
    /// All levels, lowest first.
    pub const ALL: [Self; 4] = [Self::Debug, Self::Info, Self::Warning, Self::Error];

    const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Pad here so `{:<4}` works on the abbreviation.
        f.pad(match self {
            Self::Debug => "DBG",
            Self::Info => "INF",
            Self::Warning => "WRN",
            Self::Error => "ERR",
        })
    }
}

/// A log sink.
///
/// `calldepth` counts the frames between the call site and the sink, for sinks that
/// report caller locations.
pub trait Logger: Send + Sync + 'static {
    /// Emit one fully formatted line.
    fn output(&self, calldepth: usize, message: &str);
}

/// Logger that forwards lines to `tracing` at a fixed level.
#[derive(Debug, Clone, Copy)]
pub struct TracingLogger {
    level: LogLevel,
}

impl TracingLogger {
    /// Create a logger emitting `tracing` events at `level`.
    #[must_use]
    pub const fn new(level: LogLevel) -> Self {
        Self { level }
    }
}

impl Logger for TracingLogger {
    fn output(&self, _calldepth: usize, message: &str) {
        match self.level {
            LogLevel::Debug => tracing::debug!("{}", message),
            LogLevel::Info => tracing::info!("{}", message),
            LogLevel::Warning => tracing::warn!("{}", message),
            LogLevel::Error => tracing::error!("{}", message),
        }
    }
}

/// Logger table: one optional sink per level plus a minimum level.
#[derive(Clone)]
pub struct Logging {
    loggers: [Option<Arc<dyn Logger>>; 4],
    level: LogLevel,
}

impl Logging {
    /// Route every level into `tracing`, emitting `Info` and above.
    #[must_use]
    pub fn new() -> Self {
        Self {
            loggers: LogLevel::ALL.map(|level| {
                Some(Arc::new(TracingLogger::new(level)) as Arc<dyn Logger>)
            }),
            level: LogLevel::Info,
        }
    }

    /// A table that drops everything.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            loggers: [None, None, None, None],
            level: LogLevel::Error,
        }
    }

    /// Use `logger` for every level and set the minimum level.
    pub fn set_logger(&mut self, logger: Option<Arc<dyn Logger>>, level: LogLevel) {
        for slot in &mut self.loggers {
            slot.clone_from(&logger);
        }
        self.level = level;
    }

    /// Use `logger` for one level only.
    pub fn set_logger_for_level(&mut self, logger: Option<Arc<dyn Logger>>, level: LogLevel) {
        self.loggers[level.index()] = logger;
    }

    /// Set the minimum level.
    pub const fn set_level(&mut self, level: LogLevel) {
        self.level = level;
    }

    /// The minimum level.
    #[must_use]
    pub const fn level(&self) -> LogLevel {
        self.level
    }

    /// The sink registered for `level`.
    #[must_use]
    pub fn logger(&self, level: LogLevel) -> Option<&Arc<dyn Logger>> {
        self.loggers[level.index()].as_ref()
    }

    /// Write `args` at `level`, prefixed with the level tag and `prefix`.
    pub fn log(&self, level: LogLevel, prefix: &str, args: fmt::Arguments<'_>) {
        if level < self.level {
            return;
        }
        let Some(logger) = self.logger(level) else {
            return;
        };

        logger.output(2, &format!("{level:<4} {prefix} {args}"));
    }
}

impl Default for Logging {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Logging {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logging")
            .field(
                "loggers",
                &self.loggers.iter().map(Option::is_some).collect::<Vec<_>>(),
            )
            .field("level", &self.level)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use parking_lot::Mutex;

    /// Logger capturing lines for assertions.
    #[derive(Default)]
    pub(crate) struct CaptureLogger {
        pub(crate) lines: Mutex<Vec<String>>,
    }

    impl Logger for CaptureLogger {
        fn output(&self, _calldepth: usize, message: &str) {
            self.lines.lock().push(message.to_string());
        }
    }

    #[test]
    fn test_level_tags_are_padded() {
        assert_eq!(format!("{:<4}|", LogLevel::Warning), "WRN |");
        assert_eq!(LogLevel::Error.to_string(), "ERR");
    }

    #[test]
    fn test_minimum_level_filters() {
        let capture = Arc::new(CaptureLogger::default());
        let mut logging = Logging::new();
        assert_eq!(logging.level(), LogLevel::Info);
        logging.set_logger(Some(capture.clone()), LogLevel::Warning);
        assert_eq!(logging.level(), LogLevel::Warning);

        logging.log(LogLevel::Info, "abc", format_args!("dropped"));
        logging.log(LogLevel::Error, "abc", format_args!("kept {}", 1));

        assert_eq!(*capture.lines.lock(), vec!["ERR  abc kept 1".to_string()]);
    }

    #[test]
    fn test_per_level_override() {
        let errors = Arc::new(CaptureLogger::default());
        let mut logging = Logging::disabled();
        logging.set_level(LogLevel::Debug);
        logging.set_logger_for_level(Some(errors.clone()), LogLevel::Error);

        logging.log(LogLevel::Info, "p", format_args!("nowhere"));
        logging.log(LogLevel::Error, "p", format_args!("boom"));

        assert!(logging.logger(LogLevel::Info).is_none());
        assert_eq!(errors.lines.lock().len(), 1);
    }
}

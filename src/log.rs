use std::fmt::{self, Display, Formatter};
use crate::def::Parsable;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warning => "warning",
            Level::Error => "error",
        }
    }
}

impl Parsable for Level {
    fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "debug" => Some(Level::Debug),
            "info" => Some(Level::Info),
            "warning" | "warn" => Some(Level::Warning),
            "error" => Some(Level::Error),
            _ => None,
        }
    }
}

impl Display for Level {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str().to_uppercase())
    }
}

/// Sink for the server's diagnostics. Only `log` has to be implemented, the
/// per-level methods forward to it.
pub trait Logger: Send + Sync {
    fn log(&self, level: Level, message: &str);

    fn debug(&self, message: &str) {
        self.log(Level::Debug, message)
    }

    fn info(&self, message: &str) {
        self.log(Level::Info, message)
    }

    fn warning(&self, message: &str) {
        self.log(Level::Warning, message)
    }

    fn error(&self, message: &str) {
        self.log(Level::Error, message)
    }
}

/// Writes `LEVEL: message` lines to standard output.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConsoleLogger;

impl ConsoleLogger {
    pub fn format(level: Level, message: &str) -> String {
        format!("{}: {}", level, message)
    }
}

impl Logger for ConsoleLogger {
    fn log(&self, level: Level, message: &str) {
        println!("{}", Self::format(level, message));
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: Level, message: &str) {
        match level {
            Level::Debug => tracing::debug!(target: "httpd", "{}", message),
            Level::Info => tracing::info!(target: "httpd", "{}", message),
            Level::Warning => tracing::warn!(target: "httpd", "{}", message),
            Level::Error => tracing::error!(target: "httpd", "{}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recording(Mutex<Vec<(Level, String)>>);

    impl Logger for Recording {
        fn log(&self, level: Level, message: &str) {
            self.0.lock().push((level, message.to_string()));
        }
    }

    #[test]
    fn console_format() {
        assert_eq!(ConsoleLogger::format(Level::Info, "Info message"), "INFO: Info message");
        assert_eq!(ConsoleLogger::format(Level::Error, "Error message"), "ERROR: Error message");
        assert_eq!(ConsoleLogger::format(Level::Warning, "w"), "WARNING: w");
    }

    #[test]
    fn per_level_calls_go_through_log() {
        let logger = Recording::default();
        logger.debug("Debugging");
        logger.warning("Warning issued");
        logger.error("Error occurred");
        let entries = logger.0.lock().clone();
        assert_eq!(entries, vec![
            (Level::Debug, "Debugging".to_string()),
            (Level::Warning, "Warning issued".to_string()),
            (Level::Error, "Error occurred".to_string()),
        ]);
    }

    #[test]
    fn parses_level_names() {
        assert_eq!(Level::parse("WARN"), Some(Level::Warning));
        assert_eq!(Level::parse("debug"), Some(Level::Debug));
        assert_eq!(Level::parse("trace"), None);
    }
}

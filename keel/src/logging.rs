pub use slog::{debug, error, info, o, trace, warn, Discard, Logger};
pub use sloggers::types::Severity;

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::Build;

/// Builds a terminal logger emitting structured records to stderr.
pub fn term_logger(level: Severity) -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(level);
    builder.destination(Destination::Stderr);

    builder.build().expect("Failed to build terminal logger")
}

/// Root logger that swallows all records. Used by tests and as the default
/// when no parent logger is supplied.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discard_accepts_records() {
        let log = discard();
        debug!(log, "dropped"; "key" => 1);
    }

    #[test]
    fn test_term_logger_builds() {
        let log = term_logger(Severity::Critical);
        trace!(log, "suppressed");
    }
}

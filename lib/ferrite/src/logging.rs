pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Builds the root terminal logger writing to stderr at the requested severity.
/// Unknown severity names fall back to `info`.
pub fn init(level: &str) -> Logger {
    TerminalLoggerBuilder::new()
        .level(severity(level))
        .destination(Destination::Stderr)
        .build()
        .expect("Error building root logger")
}

fn severity(level: &str) -> Severity {
    match level {
        "trace" => Severity::Trace,
        "debug" => Severity::Debug,
        "info" => Severity::Info,
        "warn" | "warning" => Severity::Warning,
        "error" => Severity::Error,
        "critical" => Severity::Critical,
        _ => Severity::Info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_names() {
        assert!(matches!(severity("debug"), Severity::Debug));
        assert!(matches!(severity("warning"), Severity::Warning));
        assert!(matches!(severity("verbose"), Severity::Info));
    }
}

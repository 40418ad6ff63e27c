//! Per-run context threaded through the runner into every harness.

use crate::logger::{LogSink, Logger};
use crate::random::Random;

/// Output sink and random generator shared by all steps of one run.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub sink: LogSink,
    pub random: Random,
}

impl Session {
    pub fn new(sink: LogSink, random: Random) -> Self {
        Self { sink, random }
    }

    /// Session for a reproducible run writing to stdout.
    pub fn seeded(seed: u64) -> Self {
        Self::new(LogSink::stdout(), Random::from_seed(seed))
    }

    pub fn logger(&self, is_debug: bool, prefix: impl Into<String>) -> Logger {
        Logger::new(self.sink.clone(), is_debug, prefix)
    }

    pub fn quiet_logger(&self, prefix: impl Into<String>) -> Logger {
        Logger::quiet(self.sink.clone(), prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loggers_share_the_session_sink() {
        let (sink, captured) = LogSink::capture();
        let session = Session::new(sink, Random::from_seed(1));

        session.logger(false, "[a] ").plain("one");
        session.quiet_logger("").plain("two");

        let lines = captured.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("[a] ") && lines[0].ends_with("one"));
        assert_eq!(lines[1], "two");
    }
}

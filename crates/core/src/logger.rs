//! User-facing output for test steps.
//!
//! Every line a grader prints goes through a [`LogSink`], a single mutex
//! around the output writer, so lines written concurrently by capture relays
//! and test procedures never interleave mid-line. [`Logger`] adds the
//! coloured `[prefix] [secondary] ` header and the debug/quiet filtering.

use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use owo_colors::OwoColorize;

use crate::executable::LineLogger;

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

/// Shared, line-atomic output destination.
#[derive(Clone)]
pub struct LogSink {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl LogSink {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    /// A sink that records everything written to it.
    pub fn capture() -> (Self, CapturedOutput) {
        let captured = CapturedOutput::default();
        (Self::new(captured.clone()), captured)
    }

    /// Write one line (a newline is appended).
    pub fn write_line(&self, line: &str) {
        let mut writer = self.lock();
        let written = writer
            .write_all(line.as_bytes())
            .and_then(|()| writer.write_all(b"\n"))
            .and_then(|()| writer.flush());
        if let Err(err) = written {
            tracing::warn!(error = %err, "Failed to write log line");
        }
    }

    pub fn blank_line(&self) {
        self.write_line("");
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn Write + Send>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::stdout()
    }
}

impl fmt::Debug for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogSink").finish_non_exhaustive()
    }
}

/// In-memory buffer behind [`LogSink::capture`].
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl CapturedOutput {
    pub fn contents(&self) -> String {
        let bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_string).collect()
    }
}

impl Write for CapturedOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Logger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Level {
    Info,
    Success,
    Error,
    Debug,
    Critical,
    Plain,
}

/// Prefixed, coloured logger.
///
/// Quiet loggers only emit [`critical`](Logger::critical) and
/// [`plain`](Logger::plain) lines; debug lines need `is_debug`. Messages
/// containing newlines are split and every line gets the full prefix.
#[derive(Debug, Clone)]
pub struct Logger {
    sink: LogSink,
    prefix: String,
    secondary_prefixes: Vec<String>,
    pub is_debug: bool,
    pub is_quiet: bool,
}

impl Logger {
    pub fn new(sink: LogSink, is_debug: bool, prefix: impl Into<String>) -> Self {
        Self {
            sink,
            prefix: prefix.into(),
            secondary_prefixes: Vec::new(),
            is_debug,
            is_quiet: false,
        }
    }

    /// A logger that only emits critical lines. Used for anti-cheat steps.
    pub fn quiet(sink: LogSink, prefix: impl Into<String>) -> Self {
        Self {
            is_quiet: true,
            ..Self::new(sink, false, prefix)
        }
    }

    pub fn sink(&self) -> &LogSink {
        &self.sink
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn secondary_prefixes(&self) -> &[String] {
        &self.secondary_prefixes
    }

    pub fn last_secondary_prefix(&self) -> Option<&str> {
        self.secondary_prefixes.last().map(String::as_str)
    }

    pub fn set_secondary_prefixes(&mut self, prefixes: Vec<String>) {
        self.secondary_prefixes = prefixes;
    }

    pub fn reset_secondary_prefixes(&mut self) {
        self.secondary_prefixes.clear();
    }

    pub fn push_secondary_prefix(&mut self, prefix: impl Into<String>) {
        self.secondary_prefixes.push(prefix.into());
    }

    pub fn pop_secondary_prefix(&mut self) -> Option<String> {
        self.secondary_prefixes.pop()
    }

    pub fn update_last_secondary_prefix(&mut self, prefix: impl Into<String>) {
        self.pop_secondary_prefix();
        self.push_secondary_prefix(prefix);
    }

    /// Run `f` with `prefix` pushed onto the secondary prefixes.
    pub fn with_additional_secondary_prefix<R>(
        &mut self,
        prefix: impl Into<String>,
        f: impl FnOnce(&mut Self) -> R,
    ) -> R {
        self.push_secondary_prefix(prefix);
        let result = f(self);
        self.pop_secondary_prefix();
        result
    }

    pub fn info(&self, message: impl fmt::Display) {
        self.emit(Level::Info, message);
    }

    pub fn success(&self, message: impl fmt::Display) {
        self.emit(Level::Success, message);
    }

    pub fn error(&self, message: impl fmt::Display) {
        self.emit(Level::Error, message);
    }

    pub fn debug(&self, message: impl fmt::Display) {
        self.emit(Level::Debug, message);
    }

    /// Uncoloured output, emitted regardless of quiet mode.
    pub fn plain(&self, message: impl fmt::Display) {
        self.emit(Level::Plain, message);
    }

    /// Only valid on quiet loggers.
    pub fn critical(&self, message: impl fmt::Display) {
        debug_assert!(self.is_quiet, "critical logs are reserved for quiet loggers");
        self.emit(Level::Critical, message);
    }

    /// Adapter for [`Executable::verbose`](crate::executable::Executable::verbose):
    /// each captured subject line is logged plain with this logger's prefix.
    pub fn line_logger(&self) -> LineLogger {
        let logger = self.clone();
        Arc::new(move |line: &str| logger.plain(line))
    }

    fn enabled(&self, level: Level) -> bool {
        match level {
            Level::Debug => self.is_debug,
            Level::Critical => self.is_quiet,
            Level::Plain => true,
            Level::Info | Level::Success | Level::Error => !self.is_quiet,
        }
    }

    fn full_prefix(&self) -> String {
        let mut prefix = self.prefix.clone();
        for secondary in &self.secondary_prefixes {
            prefix.push_str(&format!("[{secondary}] "));
        }
        if prefix.is_empty() {
            prefix
        } else {
            prefix.yellow().to_string()
        }
    }

    fn emit(&self, level: Level, message: impl fmt::Display) {
        if !self.enabled(level) {
            return;
        }

        let prefix = self.full_prefix();
        let message = message.to_string();
        for line in message.split('\n') {
            let body = match level {
                Level::Info => line.bright_blue().to_string(),
                Level::Success => line.bright_green().to_string(),
                Level::Error | Level::Critical => line.bright_red().to_string(),
                Level::Debug => line.cyan().to_string(),
                Level::Plain => line.to_string(),
            };
            self.sink.write_line(&format!("{prefix}{body}"));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use regex::Regex;

    use super::*;

    fn strip_ansi(text: &str) -> String {
        let ansi = Regex::new(r"\x1b\[[0-9;]*m").expect("regex");
        ansi.replace_all(text, "").into_owned()
    }

    fn plain_lines(captured: &CapturedOutput) -> Vec<String> {
        captured.lines().iter().map(|line| strip_ansi(line)).collect()
    }

    #[test]
    fn prefixes_every_line_of_a_message() {
        let (sink, captured) = LogSink::capture();
        let logger = Logger::new(sink, false, "[stage-1] ");

        logger.info("first\nsecond");

        assert_eq!(
            plain_lines(&captured),
            vec!["[stage-1] first", "[stage-1] second"]
        );
    }

    #[test]
    fn levels_are_coloured() {
        let (sink, captured) = LogSink::capture();
        let logger = Logger::new(sink, true, "");

        logger.success("ok");
        logger.plain("raw");

        let lines = captured.lines();
        assert!(lines[0].contains("\x1b[92m"));
        assert_eq!(lines[1], "raw");
    }

    #[test]
    fn debug_lines_need_debug_mode() {
        let (sink, captured) = LogSink::capture();
        let quiet_debug = Logger::new(sink.clone(), false, "");
        quiet_debug.debug("hidden");
        assert!(captured.contents().is_empty());

        let loud = Logger::new(sink, true, "");
        loud.debug("shown");
        assert_eq!(plain_lines(&captured), vec!["shown"]);
    }

    #[test]
    fn quiet_logger_only_emits_critical_and_plain() {
        let (sink, captured) = LogSink::capture();
        let logger = Logger::quiet(sink, "");

        logger.info("no");
        logger.success("no");
        logger.error("no");
        logger.critical("yes");
        logger.plain("also");

        assert_eq!(plain_lines(&captured), vec!["yes", "also"]);
    }

    #[test]
    fn secondary_prefixes_stack() {
        let (sink, captured) = LogSink::capture();
        let mut logger = Logger::new(sink, false, "[stage-2] ");

        logger.push_secondary_prefix("client-1");
        logger.with_additional_secondary_prefix("replica", |logger| {
            logger.info("nested");
        });
        logger.update_last_secondary_prefix("client-2");
        logger.info("updated");
        assert_eq!(logger.last_secondary_prefix(), Some("client-2"));

        logger.reset_secondary_prefixes();
        logger.info("reset");
        assert_eq!(logger.pop_secondary_prefix(), None);

        assert_eq!(
            plain_lines(&captured),
            vec![
                "[stage-2] [client-1] [replica] nested",
                "[stage-2] [client-2] updated",
                "[stage-2] reset",
            ]
        );
    }

    #[test]
    fn line_logger_writes_plain_lines_with_prefix() {
        let (sink, captured) = LogSink::capture();
        let logger = Logger::new(sink, true, "[your_program] ");

        let line_logger = logger.line_logger();
        line_logger("hello");

        assert_eq!(plain_lines(&captured), vec!["[your_program] hello"]);
    }

    #[test]
    fn concurrent_writers_never_split_lines() {
        let (sink, captured) = LogSink::capture();

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let sink = sink.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        sink.write_line(&format!("worker-{worker} line-{i}"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }

        let pattern = Regex::new(r"^worker-\d line-\d+$").expect("regex");
        let lines = captured.lines();
        assert_eq!(lines.len(), 800);
        assert!(lines.iter().all(|line| pattern.is_match(line)));
    }
}

//! Line-oriented forwarding of captured output to a logger callback.

use std::sync::Arc;
use std::time::Duration;

/// Callback invoked once per captured output line (without the newline).
pub type LineLogger = Arc<dyn Fn(&str) + Send + Sync>;

/// How long a partial line may sit in the buffer before it is forwarded
/// without its newline.
pub const PARTIAL_LINE_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// A logger that drops every line.
pub fn null_logger() -> LineLogger {
    Arc::new(|_line: &str| {})
}

/// Splits a byte stream into lines and hands each one to a [`LineLogger`].
///
/// Bytes are decoded lossily, so a subject emitting invalid UTF-8 still
/// produces readable log lines. Bytes after the last newline stay buffered
/// until more data arrives or [`flush`](LineWriter::flush) is called.
pub struct LineWriter {
    logger: LineLogger,
    pending: Vec<u8>,
}

impl LineWriter {
    pub fn new(logger: LineLogger) -> Self {
        Self {
            logger,
            pending: Vec::new(),
        }
    }

    /// Append `bytes`, emitting every line they complete.
    pub fn write(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);

        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            self.emit(&line[..line.len() - 1]);
        }
    }

    /// Whether a partial line is waiting for its newline.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Emit any buffered partial line.
    pub fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let line = std::mem::take(&mut self.pending);
        self.emit(&line);
    }

    fn emit(&self, line: &[u8]) {
        (self.logger)(&String::from_utf8_lossy(line));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn recording_writer() -> (LineWriter, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let writer = LineWriter::new(Arc::new(move |line: &str| {
            sink.lock().expect("lock").push(line.to_string());
        }));
        (writer, lines)
    }

    #[test]
    fn emits_complete_lines_only() {
        let (mut writer, lines) = recording_writer();

        writer.write(b"first\nsec");
        assert_eq!(*lines.lock().expect("lock"), vec!["first"]);
        assert!(writer.has_pending());

        writer.write(b"ond\nthird\n");
        assert_eq!(
            *lines.lock().expect("lock"),
            vec!["first", "second", "third"]
        );
        assert!(!writer.has_pending());
    }

    #[test]
    fn flush_emits_partial_line_once() {
        let (mut writer, lines) = recording_writer();

        writer.write(b"no newline");
        writer.flush();
        writer.flush();

        assert_eq!(*lines.lock().expect("lock"), vec!["no newline"]);
    }

    #[test]
    fn empty_lines_are_preserved() {
        let (mut writer, lines) = recording_writer();
        writer.write(b"\n\nx\n");
        assert_eq!(*lines.lock().expect("lock"), vec!["", "", "x"]);
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let (mut writer, lines) = recording_writer();
        writer.write(&[0x66, 0xff, 0x6f, b'\n']);
        assert_eq!(*lines.lock().expect("lock"), vec!["f\u{fffd}o"]);
    }
}

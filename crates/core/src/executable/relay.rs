//! Capture relays for a subject's output pipes.
//!
//! One relay task runs per captured stream. It copies the pipe into an
//! in-memory buffer and a [`LineWriter`] until end-of-stream or until
//! [`MAX_CAPTURE_BYTES`] have been captured, reports the capture on the
//! shared [`DrainBarrier`] channel exactly once, and then keeps reading and
//! discarding so a chatty subject never blocks on a full pipe.
//!
//! The barrier also counts pipes whose relay is still reading. The count
//! reaches zero only once every process holding a write end has closed it,
//! which is how a killer tells that the whole group has let go.

use std::fmt;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::line_writer::{LineLogger, LineWriter, PARTIAL_LINE_FLUSH_INTERVAL};

/// Maximum bytes captured per stream (1 MiB).
pub const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

/// Logged once per stream when the capture hit [`MAX_CAPTURE_BYTES`].
pub const TRUNCATION_WARNING: &str =
    "Warning: Logs exceeded allowed limit, output might be truncated.";

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Output stream of a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// Bytes captured from one stream.
#[derive(Debug)]
pub(crate) struct Capture {
    pub stream: StreamKind,
    pub bytes: Vec<u8>,
}

/// A relay could not read its pipe. This is a harness fault, not something
/// the subject can cause by misbehaving.
#[derive(Debug)]
pub(crate) struct RelayFailure {
    pub stream: StreamKind,
    pub source: std::io::Error,
}

type RelayReport = Result<Capture, RelayFailure>;

// ---------------------------------------------------------------------------
// Drain barrier
// ---------------------------------------------------------------------------

/// Counted rendezvous: resolves once every expected relay has reported.
pub(crate) struct DrainBarrier {
    expected: Vec<StreamKind>,
    reports: mpsc::Receiver<RelayReport>,
    sender: Option<mpsc::Sender<RelayReport>>,
    open_pipes: Arc<watch::Sender<usize>>,
}

/// Number of pipes still being read by a relay.
pub(crate) type OpenPipes = watch::Receiver<usize>;

/// Held by a relay for as long as it reads its pipe. Dropping it, including
/// when the relay task is aborted, closes that pipe in the count.
struct PipeGuard(Arc<watch::Sender<usize>>);

impl Drop for PipeGuard {
    fn drop(&mut self) {
        self.0.send_modify(|open| *open = open.saturating_sub(1));
    }
}

/// All captures collected by a [`DrainBarrier`].
#[derive(Debug, Default)]
pub(crate) struct Captures(Vec<Capture>);

impl Captures {
    /// Remove and return the bytes captured for `stream` (empty if absent).
    pub fn take(&mut self, stream: StreamKind) -> Vec<u8> {
        match self.0.iter().position(|c| c.stream == stream) {
            Some(index) => self.0.swap_remove(index).bytes,
            None => Vec::new(),
        }
    }
}

impl DrainBarrier {
    pub fn new(expected: &[StreamKind]) -> Self {
        let (sender, reports) = mpsc::channel(expected.len().max(1));
        let (open_pipes, _) = watch::channel(0);
        Self {
            expected: expected.to_vec(),
            reports,
            sender: Some(sender),
            open_pipes: Arc::new(open_pipes),
        }
    }

    /// Watch the number of pipes that have not reached end-of-stream.
    pub fn open_pipes(&self) -> OpenPipes {
        self.open_pipes.subscribe()
    }

    /// Sender handed to each relay. Once every relay has been spawned the
    /// barrier's own copy is dropped so a vanished relay closes the channel
    /// instead of hanging [`wait`](Self::wait).
    fn sender(&self) -> Option<mpsc::Sender<RelayReport>> {
        self.sender.clone()
    }

    fn seal(&mut self) {
        self.sender = None;
    }

    /// Wait until every expected stream has reported.
    pub async fn wait(&mut self) -> Result<Captures, RelayFailure> {
        let mut captures = Captures::default();

        for _ in 0..self.expected.len() {
            match self.reports.recv().await {
                Some(Ok(capture)) => captures.0.push(capture),
                Some(Err(failure)) => return Err(failure),
                None => {
                    let stream = self
                        .expected
                        .iter()
                        .copied()
                        .find(|kind| captures.0.iter().all(|c| c.stream != *kind))
                        .unwrap_or(StreamKind::Stdout);
                    return Err(RelayFailure {
                        stream,
                        source: std::io::Error::other("relay stopped without reporting"),
                    });
                }
            }
        }

        Ok(captures)
    }
}

// ---------------------------------------------------------------------------
// Relay tasks
// ---------------------------------------------------------------------------

/// Source pipe for one relay.
pub(crate) struct RelaySource<R> {
    pub stream: StreamKind,
    pub reader: R,
}

/// Spawn one relay per source and seal the barrier.
///
/// `output_closed` is raised as soon as any relay finishes capturing.
pub(crate) fn spawn_relays<R>(
    sources: Vec<RelaySource<R>>,
    barrier: &mut DrainBarrier,
    logger: &LineLogger,
    output_closed: &Arc<AtomicBool>,
) -> Vec<JoinHandle<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    barrier.open_pipes.send_replace(sources.len());

    let handles = sources
        .into_iter()
        .filter_map(|source| {
            let open = PipeGuard(Arc::clone(&barrier.open_pipes));
            let done = barrier.sender()?;
            let logger = Arc::clone(logger);
            let output_closed = Arc::clone(output_closed);
            Some(tokio::spawn(relay(source, logger, done, output_closed, open)))
        })
        .collect();

    barrier.seal();
    handles
}

async fn relay<R>(
    mut source: RelaySource<R>,
    logger: LineLogger,
    done: mpsc::Sender<RelayReport>,
    output_closed: Arc<AtomicBool>,
    _open: PipeGuard,
) where
    R: AsyncRead + Unpin,
{
    let report = capture(&mut source, &logger).await;
    let failed = report.is_err();

    output_closed.store(true, Ordering::SeqCst);
    // The receiver is gone only if the invocation was abandoned.
    let _ = done.send(report).await;

    if !failed {
        let discarded = tokio::io::copy(&mut source.reader, &mut tokio::io::sink())
            .await
            .unwrap_or(0);
        if discarded > 0 {
            tracing::debug!(stream = %source.stream, discarded, "Discarded output past capture limit");
        }
    }
}

async fn capture<R>(source: &mut RelaySource<R>, logger: &LineLogger) -> RelayReport
where
    R: AsyncRead + Unpin,
{
    let mut captured = Vec::new();
    let mut lines = LineWriter::new(Arc::clone(logger));
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];

    loop {
        let read = if lines.has_pending() {
            match tokio::time::timeout(PARTIAL_LINE_FLUSH_INTERVAL, source.reader.read(&mut chunk))
                .await
            {
                Ok(read) => read,
                Err(_idle) => {
                    lines.flush();
                    continue;
                }
            }
        } else {
            source.reader.read(&mut chunk).await
        };

        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                return Err(RelayFailure {
                    stream: source.stream,
                    source: err,
                })
            }
        };

        let accepted = n.min(MAX_CAPTURE_BYTES - captured.len());
        captured.extend_from_slice(&chunk[..accepted]);
        lines.write(&chunk[..accepted]);

        if captured.len() == MAX_CAPTURE_BYTES {
            break;
        }
    }

    lines.flush();
    if captured.len() == MAX_CAPTURE_BYTES {
        logger(TRUNCATION_WARNING);
    }

    Ok(Capture {
        stream: source.stream,
        bytes: captured,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

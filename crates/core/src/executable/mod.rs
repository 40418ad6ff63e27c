//! Supervisor for one external program under test.
//!
//! An [`Executable`] is a template (path, timeout, working directory, line
//! logger) plus at most one in-progress invocation. Starting an invocation:
//!
//! 1. resolves the path ([`resolve`]),
//! 2. spawns the subject as leader of a new process group with all three
//!    standard streams piped,
//! 3. starts one capture relay per output stream ([`relay`]),
//! 4. starts a reaper task that collects the exit status and enforces the
//!    wall-clock deadline by killing the whole group.
//!
//! [`Executable::wait`] closes stdin, waits for both relays to report and
//! for the reaper, and resets the handle so it can be started again.
//! [`Executable::kill`] escalates from `SIGTERM` to `SIGKILL` after
//! [`KILL_GRACE_PERIOD`].

mod line_writer;
mod relay;
mod resolve;
mod signal;

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

pub use line_writer::{null_logger, LineLogger, LineWriter, PARTIAL_LINE_FLUSH_INTERVAL};
pub use relay::{StreamKind, MAX_CAPTURE_BYTES, TRUNCATION_WARNING};
pub use signal::{ProcessTarget, Termination};

use relay::{spawn_relays, DrainBarrier, OpenPipes, RelaySource};
use resolve::resolve_executable;

/// Wall-clock limit applied when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Time a subject gets to exit after `SIGTERM` before it is sent `SIGKILL`.
pub const KILL_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// How long a killer waits for the group to let go of its pipes after
/// `SIGKILL`. Only a process that left the group can outlast it.
const FORCEFUL_KILL_LIMIT: Duration = Duration::from_secs(5);

const CAPTURED_STREAMS: [StreamKind; 2] = [StreamKind::Stdout, StreamKind::Stderr];

// ---------------------------------------------------------------------------
// Errors and results
// ---------------------------------------------------------------------------

/// Errors that can occur while supervising a subject.
#[derive(Debug, thiserror::Error)]
pub enum ExecutableError {
    /// Neither `PATH` nor the filesystem knows the configured path.
    #[error("{name} not found")]
    NotFound { name: String },

    /// The path resolved to a directory or a file without execute bits.
    #[error("{path} (resolved to {resolved}) is not an executable file")]
    NotExecutable { path: String, resolved: String },

    #[error("process already in progress")]
    AlreadyInProgress,

    #[error("no process in progress")]
    NotStarted,

    /// The invocation outlived its deadline and was killed.
    #[error("execution timed out")]
    TimedOut,

    /// The subject ignored `SIGTERM` and had to be killed with `SIGKILL`.
    #[error("program failed to exit in {} seconds after receiving sigterm", KILL_GRACE_PERIOD.as_secs())]
    KillGracePeriodExceeded,

    #[error("failed to spawn process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to write to stdin: {0}")]
    Stdin(#[source] std::io::Error),

    #[error("failed to collect exit status: {0}")]
    Wait(#[source] Arc<std::io::Error>),

    /// Reading one of the subject's pipes failed.
    #[error("failed to capture {stream}: {source}")]
    Relay {
        stream: StreamKind,
        #[source]
        source: std::io::Error,
    },
}

impl ExecutableError {
    /// Whether this error points at the harness or host rather than at the
    /// subject's behaviour.
    pub fn is_infrastructure_fault(&self) -> bool {
        matches!(
            self,
            Self::Spawn(_) | Self::Wait(_) | Self::Relay { .. }
        )
    }
}

/// Output of a completed invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Exit code, or `128 + N` when the subject was terminated by signal `N`.
    pub exit_code: i32,
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

// ---------------------------------------------------------------------------
// Shared invocation control
// ---------------------------------------------------------------------------

type ReapOutcome = Result<ExitStatus, Arc<std::io::Error>>;

/// Handle on the in-progress invocation that outlives borrows of the
/// [`Executable`] itself.
#[derive(Clone)]
struct ProcessControl {
    target: ProcessTarget,
    exit: watch::Receiver<Option<ReapOutcome>>,
    open_pipes: OpenPipes,
}

impl ProcessControl {
    /// Resolves once the leader has been reaped and no member of its group
    /// still holds an output pipe.
    async fn stopped(&mut self) {
        // An error means the reaper or relays are gone, which also means the
        // invocation is.
        let _ = self.exit.wait_for(Option::is_some).await;
        let _ = self.open_pipes.wait_for(|open| *open == 0).await;
    }
}

type ControlSlot = Arc<Mutex<Option<ProcessControl>>>;

fn lock_slot(slot: &ControlSlot) -> MutexGuard<'_, Option<ProcessControl>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cloneable handle that can stop whatever invocation its [`Executable`]
/// currently has in progress, without owning the executable.
///
/// Used by teardown records: the step that started the subject may still be
/// holding its executable when the teardown runs.
#[derive(Clone)]
pub struct ProcessKiller {
    control: ControlSlot,
}

impl ProcessKiller {
    /// Whether the executable has an invocation that has not been reaped.
    pub fn is_running(&self) -> bool {
        lock_slot(&self.control)
            .as_ref()
            .is_some_and(|control| control.exit.borrow().is_none())
    }

    /// Terminate the current invocation's process group, escalating to
    /// `SIGKILL` after [`KILL_GRACE_PERIOD`]. Succeeds trivially when
    /// nothing is running.
    ///
    /// The group counts as stopped once the leader is reaped and every
    /// member has closed its output pipes, so a descendant that ignores
    /// `SIGTERM` gets the same escalation as the leader would.
    ///
    /// The executable's own state is left for its next
    /// [`wait`](Executable::wait) to collect.
    pub async fn kill(&self) -> Result<(), ExecutableError> {
        let current = lock_slot(&self.control).clone();
        let Some(mut control) = current else {
            return Ok(());
        };

        control.target.terminate(Termination::Graceful);

        match tokio::time::timeout(KILL_GRACE_PERIOD, control.stopped()).await {
            Ok(()) => {
                // Members that closed their pipes but ignored SIGTERM.
                control.target.terminate(Termination::Forceful);
                Ok(())
            }
            Err(_grace_elapsed) => {
                tracing::warn!(
                    pid = control.target.pid(),
                    "Process group ignored SIGTERM, sending SIGKILL",
                );
                control.target.terminate(Termination::Forceful);
                if tokio::time::timeout(FORCEFUL_KILL_LIMIT, control.stopped())
                    .await
                    .is_err()
                {
                    tracing::warn!(
                        pid = control.target.pid(),
                        "Output pipes still open after SIGKILL",
                    );
                }
                Err(ExecutableError::KillGracePeriodExceeded)
            }
        }
    }
}

impl std::fmt::Debug for ProcessKiller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessKiller")
            .field("running", &self.is_running())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Running state
// ---------------------------------------------------------------------------

/// Everything that exists only while an invocation is in progress. Created
/// in one piece by `start`, dropped in one piece by `wait`.
struct RunningProcess {
    target: ProcessTarget,
    stdin: Option<ChildStdin>,
    drain: DrainBarrier,
    relays: Vec<JoinHandle<()>>,
    exit: watch::Receiver<Option<ReapOutcome>>,
    deadline: Instant,
    timed_out: Arc<AtomicBool>,
    output_closed: Arc<AtomicBool>,
    control: ControlSlot,
    _reaper: DropGuard,
}

impl RunningProcess {
    /// Wait for every relay to report, killing the group if the deadline
    /// passes first (a forked child may hold the pipes open after the
    /// leader exits).
    async fn drain_outputs(&mut self) -> Result<relay::Captures, ExecutableError> {
        let drained = tokio::select! {
            biased;
            captures = self.drain.wait() => captures,
            _ = tokio::time::sleep_until(self.deadline) => {
                self.timed_out.store(true, Ordering::SeqCst);
                self.target.terminate(Termination::Forceful);
                self.drain.wait().await
            }
        };

        drained.map_err(|failure| ExecutableError::Relay {
            stream: failure.stream,
            source: failure.source,
        })
    }

    async fn exit_status(&mut self) -> Result<ExitStatus, ExecutableError> {
        let outcome = {
            let current = self.exit.wait_for(Option::is_some).await.map_err(|_| {
                ExecutableError::Wait(Arc::new(std::io::Error::other(
                    "process reaper stopped before reporting",
                )))
            })?;
            Option::clone(&current)
        };

        match outcome {
            Some(Ok(status)) => Ok(status),
            Some(Err(err)) => Err(ExecutableError::Wait(err)),
            None => Err(ExecutableError::Wait(Arc::new(std::io::Error::other(
                "exit status missing",
            )))),
        }
    }
}

impl Drop for RunningProcess {
    fn drop(&mut self) {
        // Nothing in the group outlives the invocation, whether or not the
        // leader has already been reaped.
        self.target.terminate(Termination::Forceful);
        for relay in &self.relays {
            relay.abort();
        }
        *lock_slot(&self.control) = None;
        // `_reaper` is dropped after this, cancelling the reaper; a leader
        // that is still alive is reaped there.
    }
}

struct Reaper {
    child: Child,
    target: ProcessTarget,
    deadline: Instant,
    cancel: CancellationToken,
    timed_out: Arc<AtomicBool>,
    exit: watch::Sender<Option<ReapOutcome>>,
}

impl Reaper {
    async fn run(mut self) {
        let status = tokio::select! {
            biased;
            _ = tokio::time::sleep_until(self.deadline) => {
                self.timed_out.store(true, Ordering::SeqCst);
                tracing::debug!(pid = self.target.pid(), "Deadline exceeded, killing process group");
                self.target.terminate(Termination::Forceful);
                self.child.wait().await
            }
            _ = self.cancel.cancelled() => {
                tracing::debug!(pid = self.target.pid(), "Invocation abandoned, killing process group");
                self.target.terminate(Termination::Forceful);
                self.child.wait().await
            }
            status = self.child.wait() => status,
        };

        self.target.mark_reaped();
        if let Ok(status) = &status {
            tracing::debug!(pid = self.target.pid(), exit_code = exit_code(*status), "Subject reaped");
        }
        self.exit.send_replace(Some(status.map_err(Arc::new)));
    }
}

// ---------------------------------------------------------------------------
// Executable
// ---------------------------------------------------------------------------

/// A program that can be started, fed input, waited on and killed.
///
/// Cloning copies the template only; the clone has no invocation in
/// progress and its own independent pipes and buffers.
pub struct Executable {
    /// Program to run: a bare name looked up on `PATH`, or a filesystem path.
    pub path: PathBuf,
    /// Wall-clock limit for each invocation.
    pub timeout: Duration,
    /// Directory the subject runs in (inherits the current one if `None`).
    pub working_dir: Option<PathBuf>,
    logger: LineLogger,
    control: ControlSlot,
    running: Option<RunningProcess>,
}

impl Executable {
    /// Create an executable whose output is captured but not logged.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timeout: DEFAULT_TIMEOUT,
            working_dir: None,
            logger: null_logger(),
            control: ControlSlot::default(),
            running: None,
        }
    }

    /// Create an executable that forwards every captured output line to
    /// `logger`.
    pub fn verbose(path: impl Into<PathBuf>, logger: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self {
            logger: Arc::new(logger),
            ..Self::new(path)
        }
    }

    pub fn with_line_logger(mut self, logger: LineLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_timeout_ms(self, timeout_ms: u64) -> Self {
        self.with_timeout(Duration::from_millis(timeout_ms))
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Whether an invocation is in progress.
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Whether at least one output stream of the in-progress invocation has
    /// reached end-of-stream (or its capture limit).
    pub fn has_exited(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| running.output_closed.load(Ordering::SeqCst))
    }

    /// Pid of the in-progress subject.
    pub fn pid(&self) -> Option<u32> {
        self.running.as_ref().map(|running| running.target.pid())
    }

    /// A handle that can stop this executable's invocations from elsewhere.
    pub fn killer(&self) -> ProcessKiller {
        ProcessKiller {
            control: Arc::clone(&self.control),
        }
    }

    /// Start the program without waiting for it to complete.
    pub async fn start(&mut self, args: &[&str]) -> Result<(), ExecutableError> {
        if self.running.is_some() {
            return Err(ExecutableError::AlreadyInProgress);
        }

        let program = resolve_executable(&self.path, self.working_dir.as_deref()).await?;

        let mut command = Command::new(&program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(ExecutableError::Spawn)?;

        let pid = child.id().ok_or_else(|| {
            ExecutableError::Spawn(std::io::Error::other("process exited before it was tracked"))
        })?;
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(ExecutableError::Spawn(std::io::Error::other(
                "standard streams were not piped",
            )));
        };

        let target = ProcessTarget::new(pid);
        let deadline = deadline_after(self.timeout);

        let sources: Vec<RelaySource<Box<dyn AsyncRead + Unpin + Send>>> = vec![
            RelaySource {
                stream: StreamKind::Stdout,
                reader: Box::new(stdout),
            },
            RelaySource {
                stream: StreamKind::Stderr,
                reader: Box::new(stderr),
            },
        ];
        let output_closed = Arc::new(AtomicBool::new(false));
        let mut drain = DrainBarrier::new(&CAPTURED_STREAMS);
        let relays = spawn_relays(sources, &mut drain, &self.logger, &output_closed);
        let open_pipes = drain.open_pipes();

        let timed_out = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(
            Reaper {
                child,
                target: target.clone(),
                deadline,
                cancel: cancel.clone(),
                timed_out: Arc::clone(&timed_out),
                exit: exit_tx,
            }
            .run(),
        );

        *lock_slot(&self.control) = Some(ProcessControl {
            target: target.clone(),
            exit: exit_rx.clone(),
            open_pipes,
        });

        tracing::debug!(
            pid,
            program = %program.display(),
            timeout_ms = self.timeout.as_millis() as u64,
            "Started subject",
        );

        self.running = Some(RunningProcess {
            target,
            stdin: Some(stdin),
            drain,
            relays,
            exit: exit_rx,
            deadline,
            timed_out,
            output_closed,
            control: Arc::clone(&self.control),
            _reaper: cancel.drop_guard(),
        });

        Ok(())
    }

    /// Write `bytes` to the subject's stdin.
    pub async fn write_stdin(&mut self, bytes: &[u8]) -> Result<(), ExecutableError> {
        let running = self.running.as_mut().ok_or(ExecutableError::NotStarted)?;
        let stdin = running.stdin.as_mut().ok_or_else(|| {
            ExecutableError::Stdin(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "stdin already closed",
            ))
        })?;

        stdin.write_all(bytes).await.map_err(ExecutableError::Stdin)?;
        stdin.flush().await.map_err(ExecutableError::Stdin)
    }

    /// Close the subject's stdin, signalling end of input.
    pub fn close_stdin(&mut self) {
        if let Some(running) = self.running.as_mut() {
            drop(running.stdin.take());
        }
    }

    /// Wait for the in-progress invocation to finish and collect its output.
    ///
    /// Closes stdin first, then waits for both output streams to drain, then
    /// for the exit status. If the deadline passed during the invocation the
    /// result is [`ExecutableError::TimedOut`] regardless of how the subject
    /// exited. The handle is idle again when this returns.
    pub async fn wait(&mut self) -> Result<ExecutableResult, ExecutableError> {
        let mut running = self.running.take().ok_or(ExecutableError::NotStarted)?;

        drop(running.stdin.take());

        let mut captures = running.drain_outputs().await?;
        let status = running.exit_status().await?;

        if running.timed_out.load(Ordering::SeqCst) {
            return Err(ExecutableError::TimedOut);
        }

        Ok(ExecutableResult {
            stdout: captures.take(StreamKind::Stdout),
            stderr: captures.take(StreamKind::Stderr),
            exit_code: exit_code(status),
        })
    }

    /// Terminate the in-progress invocation, if any.
    ///
    /// Sends `SIGTERM` to the subject and its process group and waits for
    /// it. If it is still running after [`KILL_GRACE_PERIOD`] the group gets
    /// `SIGKILL` and [`ExecutableError::KillGracePeriodExceeded`] is
    /// returned once it has been reaped. Otherwise returns whatever error
    /// [`wait`](Self::wait) produced.
    pub async fn kill(&mut self) -> Result<(), ExecutableError> {
        let Some(target) = self.running.as_ref().map(|running| running.target.clone()) else {
            return Ok(());
        };

        target.terminate(Termination::Graceful);

        let wait = self.wait();
        tokio::pin!(wait);

        tokio::select! {
            result = &mut wait => result.map(|_| ()),
            _ = tokio::time::sleep(KILL_GRACE_PERIOD) => {
                tracing::warn!(pid = target.pid(), "Subject ignored SIGTERM, sending SIGKILL");
                target.terminate(Termination::Forceful);
                let _ = wait.await;
                Err(ExecutableError::KillGracePeriodExceeded)
            }
        }
    }

    /// Start the program and wait for it to complete.
    pub async fn run(&mut self, args: &[&str]) -> Result<ExecutableResult, ExecutableError> {
        self.start(args).await?;
        self.wait().await
    }

    /// Start the program, write `stdin` to it, and wait for it to complete.
    pub async fn run_with_stdin(
        &mut self,
        stdin: &[u8],
        args: &[&str],
    ) -> Result<ExecutableResult, ExecutableError> {
        self.start(args).await?;

        // Best-effort write; a subject may exit without reading its input.
        if let Err(err) = self.write_stdin(stdin).await {
            tracing::debug!(error = %err, "Subject did not accept stdin");
        }

        self.wait().await
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365))
}

impl Clone for Executable {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            timeout: self.timeout,
            working_dir: self.working_dir.clone(),
            logger: Arc::clone(&self.logger),
            control: ControlSlot::default(),
            running: None,
        }
    }
}

impl std::fmt::Debug for Executable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executable")
            .field("path", &self.path)
            .field("timeout", &self.timeout)
            .field("working_dir", &self.working_dir)
            .field("pid", &self.pid())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

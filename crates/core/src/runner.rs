//! Sequential step orchestration.
//!
//! Each step runs its test procedure on its own task, raced against the
//! step timeout. Whatever wins, the step's teardowns run before the next
//! step starts, and the first step that does not pass ends the run.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::definition::TestCase;
use crate::executable::{Executable, ExecutableError};
use crate::harness::{TeardownRegistry, TestCaseHarness};
use crate::logger::Logger;
use crate::session::Session;

/// Repository config file named in the failure hint.
pub const CONFIG_FILE_NAME: &str = "tester.yml";

/// One test case scheduled for a run, with its display metadata.
#[derive(Debug, Clone)]
pub struct TestRunnerStep {
    pub test_case: TestCase,
    /// Log prefix, e.g. `stage-1`.
    pub tester_log_prefix: String,
    /// Display title, e.g. `Stage #1: Bind to a port`.
    pub title: String,
}

/// How a step concluded.
#[derive(Debug)]
pub enum StepOutcome {
    Passed,
    /// The procedure reported that the subject misbehaved.
    Failed(anyhow::Error),
    /// The procedure did not return within the step timeout.
    TimedOut(Duration),
    /// The procedure panicked or hit a harness fault.
    Crashed(String),
}

impl StepOutcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, Self::Passed)
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed(_) => "failed",
            Self::TimedOut(_) => "timed_out",
            Self::Crashed(_) => "crashed",
        }
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => f.write_str("passed"),
            Self::Failed(err) => write!(f, "{err:#}"),
            Self::TimedOut(timeout) => {
                write!(f, "timed out, test exceeded {} seconds", Seconds(*timeout))
            }
            Self::Crashed(message) => f.write_str(message),
        }
    }
}

/// Whole seconds when exact, otherwise fractional (`0.3`, `1.5`).
struct Seconds(Duration);

impl fmt::Display for Seconds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.subsec_nanos() == 0 {
            write!(f, "{}", self.0.as_secs())
        } else {
            write!(f, "{}", self.0.as_secs_f64())
        }
    }
}

#[derive(Debug)]
pub struct StepReport {
    pub slug: String,
    pub title: String,
    pub outcome: StepOutcome,
    pub elapsed: Duration,
}

/// Result of [`TestRunner::run`]: one report per step that was started.
#[derive(Debug, Default)]
pub struct RunReport {
    pub steps: Vec<StepReport>,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.steps.iter().all(|step| step.outcome.is_passed())
    }

    /// The step that halted the run.
    pub fn failed_step(&self) -> Option<&StepReport> {
        self.steps.iter().find(|step| !step.outcome.is_passed())
    }
}

/// Runs steps in order until one does not pass.
#[derive(Debug, Clone)]
pub struct TestRunner {
    /// Quiet runners give every step a logger that only emits critical lines.
    is_quiet: bool,
    steps: Vec<TestRunnerStep>,
}

impl TestRunner {
    pub fn new(steps: Vec<TestRunnerStep>) -> Self {
        Self {
            is_quiet: false,
            steps,
        }
    }

    pub fn quiet(steps: Vec<TestRunnerStep>) -> Self {
        Self {
            is_quiet: true,
            steps,
        }
    }

    pub fn steps(&self) -> &[TestRunnerStep] {
        &self.steps
    }

    /// Run every step against clones of `executable`.
    pub async fn run(&self, is_debug: bool, executable: &Executable, session: &Session) -> RunReport {
        let mut report = RunReport::default();

        for (index, step) in self.steps.iter().enumerate() {
            if index != 0 {
                session.sink.blank_line();
            }

            let step_report = self.run_step(step, is_debug, executable, session).await;
            let passed = step_report.outcome.is_passed();
            report.steps.push(step_report);

            if !passed {
                break;
            }
        }

        report
    }

    async fn run_step(
        &self,
        step: &TestRunnerStep,
        is_debug: bool,
        executable: &Executable,
        session: &Session,
    ) -> StepReport {
        let logger = self.logger_for_step(is_debug, step, session);
        logger.info(format_args!("Running tests for {}", step.title));

        let teardowns = TeardownRegistry::default();
        let mut harness = TestCaseHarness::with_registry(
            logger.clone(),
            executable.clone(),
            session.random.clone(),
            teardowns.clone(),
        );

        let test_func = Arc::clone(&step.test_case.test_func);
        let timeout = step.test_case.custom_or_default_timeout();
        let started = Instant::now();

        let task = tokio::spawn(async move {
            let result = test_func(&mut harness).await;
            (result, harness)
        });

        // On timeout the task is detached, not aborted; a kill teardown is
        // what makes a procedure blocked on the subject return.
        let (outcome, finished_harness) = match tokio::time::timeout(timeout, task).await {
            Ok(Ok((Ok(()), harness))) => (StepOutcome::Passed, Some(harness)),
            Ok(Ok((Err(err), harness))) => (classify_failure(err), Some(harness)),
            Ok(Err(join_err)) => (StepOutcome::Crashed(crash_message(join_err)), None),
            Err(_elapsed) => (StepOutcome::TimedOut(timeout), None),
        };
        let elapsed = started.elapsed();

        match &outcome {
            StepOutcome::Passed => logger.success("Test passed."),
            failure => report_failure(&logger, failure, is_debug),
        }

        teardowns.run_all(&logger).await;
        drop(finished_harness);

        tracing::info!(
            slug = %step.test_case.slug,
            outcome = outcome.label(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Step finished",
        );

        StepReport {
            slug: step.test_case.slug.clone(),
            title: step.title.clone(),
            outcome,
            elapsed,
        }
    }

    fn logger_for_step(&self, is_debug: bool, step: &TestRunnerStep, session: &Session) -> Logger {
        if self.is_quiet {
            session.quiet_logger("")
        } else {
            session.logger(is_debug, format!("[{}] ", step.tester_log_prefix))
        }
    }
}

fn classify_failure(err: anyhow::Error) -> StepOutcome {
    let infrastructure = err
        .downcast_ref::<ExecutableError>()
        .is_some_and(ExecutableError::is_infrastructure_fault);

    if infrastructure {
        StepOutcome::Crashed(format!("internal error: {err:#}"))
    } else {
        StepOutcome::Failed(err)
    }
}

fn crash_message(join_err: tokio::task::JoinError) -> String {
    if !join_err.is_panic() {
        return format!("test procedure was cancelled: {join_err}");
    }

    let payload: Box<dyn Any + Send> = join_err.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("test procedure panicked: {detail}")
}

fn report_failure(logger: &Logger, outcome: &StepOutcome, is_debug: bool) {
    logger.error(outcome);

    if is_debug {
        logger.error("Test failed");
    } else {
        logger.error(format_args!(
            "Test failed (try setting 'debug: true' in your {CONFIG_FILE_NAME} to see more details)"
        ));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use assert_matches::assert_matches;
    use regex::Regex;

    use super::*;
    use crate::logger::{CapturedOutput, LogSink};
    use crate::random::Random;

    fn session() -> (Session, CapturedOutput) {
        let (sink, captured) = LogSink::capture();
        (Session::new(sink, Random::from_seed(1)), captured)
    }

    fn plain_lines(captured: &CapturedOutput) -> Vec<String> {
        let ansi = Regex::new(r"\x1b\[[0-9;]*m").expect("regex");
        captured
            .lines()
            .iter()
            .map(|line| ansi.replace_all(line, "").into_owned())
            .collect()
    }

    fn step(test_case: TestCase, n: usize) -> TestRunnerStep {
        TestRunnerStep {
            test_case,
            tester_log_prefix: format!("stage-{n}"),
            title: format!("Stage #{n}"),
        }
    }

    type Events = Arc<Mutex<Vec<String>>>;

    fn recording_case(slug: &'static str, events: &Events, fail: bool) -> TestCase {
        let events = Arc::clone(events);
        TestCase::new(slug, move |harness| {
            let events = Arc::clone(&events);
            Box::pin(async move {
                events.lock().expect("lock").push(format!("run {slug}"));
                let on_teardown = Arc::clone(&events);
                harness.register_teardown(move || {
                    on_teardown.lock().expect("lock").push(format!("teardown {slug}"));
                });
                if fail {
                    anyhow::bail!("{slug} went wrong");
                }
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn first_failure_halts_the_run() {
        let (session, captured) = session();
        let events: Events = Arc::default();

        let runner = TestRunner::new(vec![
            step(recording_case("a", &events, false), 1),
            step(recording_case("b", &events, true), 2),
            step(recording_case("c", &events, false), 3),
        ]);
        let report = runner.run(false, &Executable::new("sh"), &session).await;

        assert!(!report.passed());
        assert_eq!(report.steps.len(), 2);
        let failed = report.failed_step().expect("failed step");
        assert_eq!(failed.slug, "b");
        assert_matches!(&failed.outcome, StepOutcome::Failed(err) if err.to_string() == "b went wrong");

        assert_eq!(
            *events.lock().expect("lock"),
            vec!["run a", "teardown a", "run b", "teardown b"]
        );

        assert_eq!(
            plain_lines(&captured),
            vec![
                "[stage-1] Running tests for Stage #1",
                "[stage-1] Test passed.",
                "",
                "[stage-2] Running tests for Stage #2",
                "[stage-2] b went wrong",
                "[stage-2] Test failed (try setting 'debug: true' in your tester.yml to see more details)",
            ]
        );
    }

    #[tokio::test]
    async fn all_steps_passing_passes_the_run() {
        let (session, _captured) = session();
        let events: Events = Arc::default();

        let runner = TestRunner::new(vec![
            step(recording_case("a", &events, false), 1),
            step(recording_case("b", &events, false), 2),
        ]);
        let report = runner.run(true, &Executable::new("sh"), &session).await;

        assert!(report.passed());
        assert!(report.failed_step().is_none());
        assert_eq!(report.steps.len(), 2);
    }

    #[tokio::test]
    async fn hung_step_times_out_and_still_tears_down() {
        let (session, captured) = session();
        let torn_down = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&torn_down);
        let hung = TestCase::new("hang", move |harness| {
            let flag = Arc::clone(&flag);
            Box::pin(async move {
                harness.register_teardown(move || flag.store(true, Ordering::SeqCst));
                std::future::pending::<()>().await;
                Ok(())
            })
        })
        .with_timeout(Duration::from_secs(1));

        let started = Instant::now();
        let report = TestRunner::new(vec![step(hung, 1)])
            .run(true, &Executable::new("sh"), &session)
            .await;
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_secs(3));
        assert_matches!(
            report.failed_step().map(|s| &s.outcome),
            Some(StepOutcome::TimedOut(timeout)) if *timeout == Duration::from_secs(1)
        );
        assert!(torn_down.load(Ordering::SeqCst));

        let lines = plain_lines(&captured);
        assert!(lines.contains(&"[stage-1] timed out, test exceeded 1 seconds".to_string()));
        assert!(lines.contains(&"[stage-1] Test failed".to_string()));
    }

    #[tokio::test]
    async fn timed_out_step_subject_is_killed_by_teardown() {
        let (session, _captured) = session();
        let pid = Arc::new(Mutex::new(None));

        let seen_pid = Arc::clone(&pid);
        let blocked = TestCase::new("blocked", move |harness| {
            let seen_pid = Arc::clone(&seen_pid);
            Box::pin(async move {
                harness.executable.start(&["-c", "sleep 30"]).await?;
                harness.register_kill_teardown();
                *seen_pid.lock().expect("lock") = harness.executable.pid();
                harness.executable.wait().await?;
                Ok(())
            })
        })
        .with_timeout(Duration::from_millis(300));

        let report = TestRunner::new(vec![step(blocked, 1)])
            .run(false, &Executable::new("sh"), &session)
            .await;
        assert_matches!(report.steps[0].outcome, StepOutcome::TimedOut(_));

        let pid = pid.lock().expect("lock").expect("subject started") as i32;
        tokio::time::sleep(Duration::from_millis(200)).await;
        // SAFETY: signal 0 only checks for existence.
        assert_eq!(unsafe { libc::kill(pid, 0) }, -1);
    }

    #[tokio::test]
    async fn panicking_step_is_reported_as_crash() {
        let (session, _captured) = session();
        let panics = TestCase::new("panics", |_harness| {
            Box::pin(async {
                let boom = true;
                if boom {
                    panic!("boom");
                }
                Ok(())
            })
        });

        let report = TestRunner::new(vec![step(panics, 1)])
            .run(false, &Executable::new("sh"), &session)
            .await;

        assert_matches!(
            &report.steps[0].outcome,
            StepOutcome::Crashed(message) if message.contains("boom")
        );
    }

    #[tokio::test]
    async fn subject_errors_are_failures_not_crashes() {
        let (session, _captured) = session();
        let missing = TestCase::new("missing", |harness| {
            Box::pin(async move {
                harness.executable.run(&[]).await?;
                Ok(())
            })
        });

        let report = TestRunner::new(vec![step(missing, 1)])
            .run(false, &Executable::new("/definitely/missing/your_program.sh"), &session)
            .await;

        assert_matches!(
            &report.steps[0].outcome,
            StepOutcome::Failed(err) if err.to_string() == "your_program.sh not found"
        );
    }

    #[test]
    fn timeout_reports_the_configured_duration() {
        let message = |ms| StepOutcome::TimedOut(Duration::from_millis(ms)).to_string();
        assert_eq!(message(300), "timed out, test exceeded 0.3 seconds");
        assert_eq!(message(1500), "timed out, test exceeded 1.5 seconds");
        assert_eq!(message(10_000), "timed out, test exceeded 10 seconds");
    }

    #[test]
    fn infrastructure_faults_are_crashes() {
        let err = anyhow::Error::new(ExecutableError::Spawn(std::io::Error::other("fork failed")));
        assert_matches!(classify_failure(err), StepOutcome::Crashed(_));

        let err = anyhow::Error::new(ExecutableError::TimedOut);
        assert_matches!(classify_failure(err), StepOutcome::Failed(_));
    }

    #[tokio::test]
    async fn quiet_runner_only_prints_critical_lines() {
        let (session, captured) = session();
        let critical = TestCase::new("ac", |harness| {
            Box::pin(async move {
                harness.logger.info("hidden");
                harness.logger.critical("Detected cheating");
                Err::<(), _>(anyhow::anyhow!("cheated"))
            })
        });

        let report = TestRunner::quiet(vec![step(critical, 1)])
            .run(false, &Executable::new("sh"), &session)
            .await;

        assert!(!report.passed());
        assert_eq!(plain_lines(&captured), vec!["Detected cheating"]);
    }
}

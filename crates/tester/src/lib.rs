//! Entry point for grader binaries.
//!
//! A grader declares a [`TesterDefinition`] and hands it to
//! [`run_cli_from_env`] from its `main`:
//!
//! ```ignore
//! fn main() {
//!     std::process::exit(gradekit_tester::run_cli_from_env(definition()));
//! }
//! ```
//!
//! The run executes the test cases named in `TESTER_TEST_CASES_JSON` in
//! order, then the definition's anti-cheat test cases with quiet output.
//! The exit code is 0 only if every step passed.

pub mod context;
pub mod telemetry;

use std::collections::HashMap;

use gradekit_core::definition::TesterDefinition;
use gradekit_core::executable::Executable;
use gradekit_core::logger::LogSink;
use gradekit_core::random::Random;
use gradekit_core::runner::{TestRunner, TestRunnerStep};
use gradekit_core::session::Session;

pub use context::{ContextError, TesterContext, TesterContextTestCase};

/// Log prefix for lines the subject prints.
pub const SUBJECT_LOG_PREFIX: &str = "[your_program] ";

/// A validated run: context, definition and session.
pub struct Tester {
    context: TesterContext,
    definition: TesterDefinition,
    session: Session,
}

impl Tester {
    /// Load the context from `env` and check it against `definition`.
    pub fn new(
        env: &HashMap<String, String>,
        definition: TesterDefinition,
        sink: LogSink,
    ) -> Result<Self, ContextError> {
        let context = TesterContext::from_env(env, &definition)?;
        context.validate(&definition)?;

        let random = match context.random_seed {
            Some(seed) => Random::from_seed(seed),
            None => Random::from_entropy(),
        };

        Ok(Self {
            context,
            definition,
            session: Session::new(sink, random),
        })
    }

    pub fn context(&self) -> &TesterContext {
        &self.context
    }

    /// Run the regular steps, then the anti-cheat steps unless skipped.
    /// Returns the process exit code.
    pub async fn run(&self) -> i32 {
        self.print_debug_context();

        let report = self
            .runner()
            .run(self.context.is_debug, &self.executable(), &self.session)
            .await;
        if !report.passed() {
            return 1;
        }

        if self.context.should_skip_anti_cheat_test_cases {
            return 0;
        }

        let report = self
            .anti_cheat_runner()
            .run(false, &self.quiet_executable(), &self.session)
            .await;
        if !report.passed() {
            return 1;
        }

        0
    }

    fn print_debug_context(&self) {
        if !self.context.is_debug {
            return;
        }

        self.context.print(&self.session.logger(false, ""));
        self.session.sink.blank_line();
    }

    fn runner(&self) -> TestRunner {
        let steps = self
            .context
            .test_cases
            .iter()
            .filter_map(|requested| {
                let test_case = self.definition.test_case_by_slug(&requested.slug)?;
                Some(TestRunnerStep {
                    test_case: test_case.clone(),
                    tester_log_prefix: requested.tester_log_prefix.clone(),
                    title: requested.title.clone(),
                })
            })
            .collect();

        TestRunner::new(steps)
    }

    fn anti_cheat_runner(&self) -> TestRunner {
        let steps = self
            .definition
            .anti_cheat_test_cases
            .iter()
            .enumerate()
            .map(|(index, test_case)| TestRunnerStep {
                test_case: test_case.clone(),
                tester_log_prefix: format!("ac-{}", index + 1),
                title: format!("AC{}", index + 1),
            })
            .collect();

        TestRunner::quiet(steps)
    }

    fn executable(&self) -> Executable {
        let subject_logger = self.session.logger(true, SUBJECT_LOG_PREFIX);
        Executable::new(&self.context.executable_path).with_line_logger(subject_logger.line_logger())
    }

    fn quiet_executable(&self) -> Executable {
        Executable::new(&self.context.executable_path)
    }
}

/// Run a grader against the given environment, printing to stdout.
pub async fn run_cli(env: &HashMap<String, String>, definition: TesterDefinition) -> i32 {
    run_cli_with_sink(env, definition, LogSink::stdout()).await
}

/// [`run_cli`] with output sent to `sink`.
pub async fn run_cli_with_sink(
    env: &HashMap<String, String>,
    definition: TesterDefinition,
    sink: LogSink,
) -> i32 {
    match Tester::new(env, definition, sink.clone()) {
        Ok(tester) => tester.run().await,
        Err(err) => {
            tracing::error!(error = %err, "Tester context rejected");
            sink.write_line(&context_failure_message(&err));
            1
        }
    }
}

fn context_failure_message(err: &ContextError) -> String {
    match err {
        ContextError::User(message) => message.clone(),
        err if err.is_validation_error() => {
            format!("Internal error. Error validating tester context: {err}")
        }
        err => format!("Internal error. Error fetching tester context: {err}"),
    }
}

/// Load `.env`, install tracing, and run with the process environment on a
/// fresh runtime. Returns the process exit code.
pub fn run_cli_from_env(definition: TesterDefinition) -> i32 {
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    let env: HashMap<String, String> = std::env::vars().collect();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(error = %err, "Failed to start async runtime");
            LogSink::stdout().write_line(&format!("Internal error. Failed to start runtime: {err}"));
            return 1;
        }
    };

    runtime.block_on(run_cli(&env, definition))
}

//! Building blocks for graders that run untrusted programs.
//!
//! - [`executable`] supervises one external program: capture, stdin,
//!   deadline, process-group termination.
//! - [`runner`] runs test steps in order against clones of an executable,
//!   each raced against its timeout, with teardowns always executed.
//! - [`harness`] is the per-step context a test procedure receives.

pub mod definition;
pub mod diff;
pub mod executable;
pub mod harness;
pub mod logger;
pub mod random;
pub mod runner;
pub mod session;

pub use definition::{DefinitionError, TestCase, TestFunc, TesterDefinition, DEFAULT_TEST_TIMEOUT};
pub use executable::{Executable, ExecutableError, ExecutableResult, ProcessKiller};
pub use harness::{Teardown, TeardownRegistry, TestCaseHarness};
pub use logger::{LogSink, Logger};
pub use random::Random;
pub use runner::{RunReport, StepOutcome, StepReport, TestRunner, TestRunnerStep, CONFIG_FILE_NAME};
pub use session::Session;

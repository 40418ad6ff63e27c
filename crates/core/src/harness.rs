//! Per-step context handed to a test procedure.
//!
//! A long-lived subject (a server) is started and paired with a kill
//! teardown:
//!
//! ```ignore
//! harness.executable.start(&[]).await?;
//! harness.register_kill_teardown();
//! ```
//!
//! A one-shot subject (a CLI) is just run:
//!
//! ```ignore
//! let result = harness.executable.run(&["cat-file", "-p", sha]).await?;
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;

use crate::executable::{Executable, ProcessKiller};
use crate::logger::Logger;
use crate::random::Random;

/// Cleanup owed once a step has concluded.
pub enum Teardown {
    /// Stop whatever invocation the executable behind the killer has in
    /// progress.
    KillProcess(ProcessKiller),
    Callback(Box<dyn FnOnce() + Send>),
    Future(BoxFuture<'static, ()>),
}

impl Teardown {
    async fn run(self, logger: &Logger) {
        match self {
            Self::KillProcess(killer) => {
                if let Err(err) = killer.kill().await {
                    tracing::warn!(error = %err, "Kill teardown failed");
                    logger.debug(format_args!("Teardown: {err}"));
                }
            }
            Self::Callback(callback) => callback(),
            Self::Future(future) => future.await,
        }
    }
}

impl std::fmt::Debug for Teardown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KillProcess(killer) => f.debug_tuple("KillProcess").field(killer).finish(),
            Self::Callback(_) => f.write_str("Callback"),
            Self::Future(_) => f.write_str("Future"),
        }
    }
}

/// Ordered list of teardowns, shared between a harness and the runner so
/// records survive a step whose procedure is still running.
#[derive(Clone, Default)]
pub struct TeardownRegistry {
    records: Arc<Mutex<Vec<Teardown>>>,
}

impl TeardownRegistry {
    pub fn register(&self, teardown: Teardown) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(teardown);
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run and remove every registered teardown, in registration order.
    ///
    /// Records registered while this runs are executed too.
    pub async fn run_all(&self, logger: &Logger) {
        loop {
            let batch = std::mem::take(
                &mut *self.records.lock().unwrap_or_else(PoisonError::into_inner),
            );
            if batch.is_empty() {
                return;
            }
            for teardown in batch {
                teardown.run(logger).await;
            }
        }
    }
}

impl std::fmt::Debug for TeardownRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeardownRegistry")
            .field("pending", &self.len())
            .finish()
    }
}

/// Passed to every test procedure.
#[derive(Debug)]
pub struct TestCaseHarness {
    /// For every line the procedure wants to show the user.
    pub logger: Logger,
    /// The program under test; a fresh clone of the run's template.
    pub executable: Executable,
    pub random: Random,
    teardowns: TeardownRegistry,
}

impl TestCaseHarness {
    pub fn new(logger: Logger, executable: Executable, random: Random) -> Self {
        Self::with_registry(logger, executable, random, TeardownRegistry::default())
    }

    pub(crate) fn with_registry(
        logger: Logger,
        executable: Executable,
        random: Random,
        teardowns: TeardownRegistry,
    ) -> Self {
        Self {
            logger,
            executable,
            random,
            teardowns,
        }
    }

    pub fn register_teardown(&self, callback: impl FnOnce() + Send + 'static) {
        self.teardowns.register(Teardown::Callback(Box::new(callback)));
    }

    pub fn register_async_teardown(&self, future: impl Future<Output = ()> + Send + 'static) {
        self.teardowns.register(Teardown::Future(Box::pin(future)));
    }

    /// Kill the harness executable's invocation once the step concludes.
    pub fn register_kill_teardown(&self) {
        self.register_kill_teardown_for(&self.executable);
    }

    /// Kill `executable`'s invocation once the step concludes.
    pub fn register_kill_teardown_for(&self, executable: &Executable) {
        self.teardowns
            .register(Teardown::KillProcess(executable.killer()));
    }

    pub async fn run_teardowns(&self) {
        self.teardowns.run_all(&self.logger).await;
    }

    /// Another executable from the same template, e.g. for a second client
    /// process.
    pub fn new_executable(&self) -> Executable {
        self.executable.clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;

use futures::future::BoxFuture;
use regex::Regex;
use tempfile::TempDir;

use gradekit_core::definition::{TestCase, TesterDefinition};
use gradekit_core::harness::TestCaseHarness;
use gradekit_core::logger::{CapturedOutput, LogSink};
use gradekit_tester::context::{REPOSITORY_DIR_ENV, RANDOM_SEED_ENV, SKIP_ANTI_CHEAT_ENV, TEST_CASES_ENV};

pub const EXECUTABLE_FILE_NAME: &str = "your_program.sh";

/// A submission directory with the given `tester.yml` and a
/// `your_program.sh` that is really `/bin/sh`.
///
/// Symlinking avoids executing a file this process just wrote.
pub fn app_dir(config: Option<&str>) -> TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    if let Some(config) = config {
        std::fs::write(dir.path().join("tester.yml"), config).expect("write tester.yml");
    }
    std::os::unix::fs::symlink("/bin/sh", dir.path().join(EXECUTABLE_FILE_NAME))
        .expect("symlink program");
    dir
}

pub fn test_cases_json(slugs: &[&str]) -> String {
    let cases: Vec<serde_json::Value> = slugs
        .iter()
        .enumerate()
        .map(|(index, slug)| {
            serde_json::json!({
                "slug": slug,
                "tester_log_prefix": format!("test-{}", index + 1),
                "title": format!("Stage #{}: {}", index + 1, slug),
            })
        })
        .collect();
    serde_json::to_string(&cases).expect("serialize test cases")
}

pub struct EnvBuilder {
    vars: HashMap<String, String>,
}

impl EnvBuilder {
    pub fn new(dir: &Path, slugs: &[&str]) -> Self {
        let vars = HashMap::from([
            (REPOSITORY_DIR_ENV.to_string(), dir.display().to_string()),
            (TEST_CASES_ENV.to_string(), test_cases_json(slugs)),
        ]);
        Self { vars }
    }

    pub fn skip_anti_cheat(mut self) -> Self {
        self.vars.insert(SKIP_ANTI_CHEAT_ENV.into(), "true".into());
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.vars.insert(RANDOM_SEED_ENV.into(), seed.to_string());
        self
    }

    pub fn build(self) -> HashMap<String, String> {
        self.vars
    }
}

pub fn definition(test_cases: Vec<TestCase>) -> TesterDefinition {
    TesterDefinition {
        executable_file_name: EXECUTABLE_FILE_NAME.into(),
        test_cases,
        ..Default::default()
    }
}

pub fn pass(_harness: &mut TestCaseHarness) -> BoxFuture<'_, anyhow::Result<()>> {
    Box::pin(async { Ok(()) })
}

pub fn fail(_harness: &mut TestCaseHarness) -> BoxFuture<'_, anyhow::Result<()>> {
    Box::pin(async { Err::<(), _>(anyhow::anyhow!("fail")) })
}

pub fn capture() -> (LogSink, CapturedOutput) {
    LogSink::capture()
}

/// Captured lines with colour codes removed.
pub fn plain_lines(captured: &CapturedOutput) -> Vec<String> {
    let ansi = Regex::new(r"\x1b\[[0-9;]*m").expect("regex");
    captured
        .lines()
        .iter()
        .map(|line| ansi.replace_all(line, "").into_owned())
        .collect()
}

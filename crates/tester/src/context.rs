//! Run configuration: environment variables plus the submission's
//! `tester.yml`.
//!
//! | Env var                   | Required | Description                                   |
//! |---------------------------|----------|-----------------------------------------------|
//! | `TESTER_REPOSITORY_DIR`   | yes      | Directory holding the submission              |
//! | `TESTER_TEST_CASES_JSON`  | yes      | `[{"slug", "tester_log_prefix", "title"}]`    |
//! | `TESTER_SKIP_ANTI_CHEAT`  | no       | `true` skips anti-cheat test cases            |
//! | `TESTER_RANDOM_SEED`      | no       | Integer seed for reproducible random values   |

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use gradekit_core::definition::{DefinitionError, TesterDefinition};
use gradekit_core::logger::Logger;
use gradekit_core::CONFIG_FILE_NAME;

pub const REPOSITORY_DIR_ENV: &str = "TESTER_REPOSITORY_DIR";
pub const TEST_CASES_ENV: &str = "TESTER_TEST_CASES_JSON";
pub const SKIP_ANTI_CHEAT_ENV: &str = "TESTER_SKIP_ANTI_CHEAT";
pub const RANDOM_SEED_ENV: &str = "TESTER_RANDOM_SEED";

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// A problem with the submission itself; the message is shown verbatim.
    #[error("{0}")]
    User(String),

    #[error("{0} env var not found")]
    MissingEnv(&'static str),

    #[error("failed to parse TESTER_TEST_CASES_JSON: {0}")]
    InvalidTestCases(#[source] serde_json::Error),

    #[error("TESTER_TEST_CASES_JSON contains a test case with an empty {0}")]
    EmptyField(&'static str),

    #[error("TESTER_TEST_CASES_JSON is empty")]
    NoTestCases,

    #[error("TESTER_RANDOM_SEED must be an integer, got {0:?}")]
    InvalidRandomSeed(String),

    #[error("tester context does not have test case with slug {0}")]
    UnknownSlug(String),

    #[error(transparent)]
    Definition(#[from] DefinitionError),
}

impl ContextError {
    /// Whether the configuration was read but does not fit the definition.
    pub fn is_validation_error(&self) -> bool {
        matches!(self, Self::UnknownSlug(_) | Self::Definition(_))
    }
}

/// One entry of `TESTER_TEST_CASES_JSON`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TesterContextTestCase {
    /// e.g. `bind-to-port`
    pub slug: String,
    /// e.g. `stage-1`
    pub tester_log_prefix: String,
    /// e.g. `Stage #1: Bind to a port`
    pub title: String,
}

#[derive(Debug, Default, Deserialize)]
struct RepositoryConfig {
    #[serde(default)]
    debug: bool,
}

/// Everything a run needs to know that is not part of the definition.
#[derive(Debug, Clone)]
pub struct TesterContext {
    pub executable_path: PathBuf,
    pub is_debug: bool,
    pub test_cases: Vec<TesterContextTestCase>,
    pub should_skip_anti_cheat_test_cases: bool,
    pub random_seed: Option<u64>,
}

impl TesterContext {
    pub fn from_env(
        env: &HashMap<String, String>,
        definition: &TesterDefinition,
    ) -> Result<Self, ContextError> {
        let submission_dir = env
            .get(REPOSITORY_DIR_ENV)
            .map(PathBuf::from)
            .ok_or(ContextError::MissingEnv(REPOSITORY_DIR_ENV))?;

        let test_cases_json = env
            .get(TEST_CASES_ENV)
            .ok_or(ContextError::MissingEnv(TEST_CASES_ENV))?;
        let test_cases: Vec<TesterContextTestCase> =
            serde_json::from_str(test_cases_json).map_err(ContextError::InvalidTestCases)?;

        let should_skip_anti_cheat_test_cases =
            env.get(SKIP_ANTI_CHEAT_ENV).is_some_and(|value| value == "true");

        for test_case in &test_cases {
            if test_case.slug.is_empty() {
                return Err(ContextError::EmptyField("slug"));
            }
            if test_case.tester_log_prefix.is_empty() {
                return Err(ContextError::EmptyField("tester_log_prefix"));
            }
            if test_case.title.is_empty() {
                return Err(ContextError::EmptyField("title"));
            }
        }

        let random_seed = parse_random_seed(env)?;
        let executable_path = executable_path(&submission_dir, definition);
        let config = read_repository_config(&submission_dir.join(CONFIG_FILE_NAME))?;

        if test_cases.is_empty() {
            return Err(ContextError::NoTestCases);
        }

        Ok(Self {
            executable_path,
            is_debug: config.debug,
            test_cases,
            should_skip_anti_cheat_test_cases,
            random_seed,
        })
    }

    /// Every requested slug must name a test case in `definition`.
    pub fn validate(&self, definition: &TesterDefinition) -> Result<(), ContextError> {
        definition.validate()?;

        for test_case in &self.test_cases {
            if definition.test_case_by_slug(&test_case.slug).is_none() {
                return Err(ContextError::UnknownSlug(test_case.slug.clone()));
            }
        }

        Ok(())
    }

    pub fn print(&self, logger: &Logger) {
        logger.plain(format_args!("Debug = {}", self.is_debug));
    }
}

fn parse_random_seed(env: &HashMap<String, String>) -> Result<Option<u64>, ContextError> {
    match env.get(RANDOM_SEED_ENV).map(|value| value.trim()) {
        None | Some("") => Ok(None),
        Some(value) => value
            .parse::<i64>()
            .map(|seed| Some(seed as u64))
            .map_err(|_| ContextError::InvalidRandomSeed(value.to_string())),
    }
}

/// `<dir>/<executable_file_name>`, unless only the legacy file exists.
fn executable_path(submission_dir: &Path, definition: &TesterDefinition) -> PathBuf {
    let current = submission_dir.join(&definition.executable_file_name);

    let Some(legacy_name) = definition
        .legacy_executable_file_name
        .as_deref()
        .filter(|name| !name.is_empty())
    else {
        return current;
    };

    let legacy = submission_dir.join(legacy_name);
    let current_missing = matches!(
        std::fs::metadata(&current),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound
    );

    if current_missing && legacy.exists() {
        tracing::debug!(path = %legacy.display(), "Using legacy executable");
        legacy
    } else {
        current
    }
}

fn read_repository_config(path: &Path) -> Result<RepositoryConfig, ContextError> {
    let contents = std::fs::read_to_string(path).map_err(|_| {
        ContextError::User(format!(
            "Can't read {CONFIG_FILE_NAME} file in your repository. This is required to run tests."
        ))
    })?;

    if contents.trim().is_empty() {
        return Ok(RepositoryConfig::default());
    }

    serde_yaml::from_str(&contents)
        .map_err(|err| ContextError::User(format!("Error parsing {CONFIG_FILE_NAME}: {err}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

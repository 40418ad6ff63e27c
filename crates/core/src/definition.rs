//! Test case definitions supplied by a grader.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;

use crate::harness::TestCaseHarness;

/// Timeout for a test case that does not set one.
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A test procedure: receives the step's harness and reports pass or fail.
pub type TestFunc =
    Arc<dyn for<'a> Fn(&'a mut TestCaseHarness) -> BoxFuture<'a, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("test case #{index} has an empty slug")]
    EmptySlug { index: usize },

    #[error("duplicate test case slug: {0}")]
    DuplicateSlug(String),

    #[error("failed to read course definition {path}: {source}")]
    CourseYamlRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse course definition: {0}")]
    CourseYamlParse(#[from] serde_yaml::Error),

    #[error("stage slugs in course definition {in_course:?} do not match test cases {in_definition:?}")]
    CourseYamlMismatch {
        in_course: Vec<String>,
        in_definition: Vec<String>,
    },
}

/// One test case a grader knows how to run.
#[derive(Clone)]
pub struct TestCase {
    /// Unique identifier; matches the stage slug in the course definition.
    pub slug: String,
    pub test_func: TestFunc,
    /// `None` or zero means [`DEFAULT_TEST_TIMEOUT`].
    pub timeout: Option<Duration>,
}

impl TestCase {
    pub fn new<F>(slug: impl Into<String>, test_func: F) -> Self
    where
        F: for<'a> Fn(&'a mut TestCaseHarness) -> BoxFuture<'a, anyhow::Result<()>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            slug: slug.into(),
            test_func: Arc::new(test_func),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn custom_or_default_timeout(&self) -> Duration {
        match self.timeout {
            Some(timeout) if !timeout.is_zero() => timeout,
            _ => DEFAULT_TEST_TIMEOUT,
        }
    }
}

impl std::fmt::Debug for TestCase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestCase")
            .field("slug", &self.slug)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Everything a grader declares about the program it tests.
#[derive(Debug, Clone, Default)]
pub struct TesterDefinition {
    /// Program file name inside the submission, e.g. `your_program.sh`.
    pub executable_file_name: String,
    /// Older file name still accepted when only it exists.
    pub legacy_executable_file_name: Option<String>,
    pub test_cases: Vec<TestCase>,
    /// Steps run after the regular ones with quiet output.
    pub anti_cheat_test_cases: Vec<TestCase>,
}

#[derive(Debug, Deserialize)]
struct CourseYaml {
    #[serde(default)]
    stages: Vec<StageYaml>,
}

#[derive(Debug, Deserialize)]
struct StageYaml {
    slug: String,
}

impl TesterDefinition {
    pub fn test_case_by_slug(&self, slug: &str) -> Option<&TestCase> {
        self.test_cases.iter().find(|test_case| test_case.slug == slug)
    }

    /// Every slug (regular and anti-cheat) must be non-empty and unique.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        let mut seen = HashSet::new();

        let all = self.test_cases.iter().chain(&self.anti_cheat_test_cases);
        for (index, test_case) in all.enumerate() {
            if test_case.slug.is_empty() {
                return Err(DefinitionError::EmptySlug { index });
            }
            if !seen.insert(test_case.slug.as_str()) {
                return Err(DefinitionError::DuplicateSlug(test_case.slug.clone()));
            }
        }

        Ok(())
    }

    /// Check that the course definition at `path` lists exactly this
    /// definition's test cases, in order, as its `stages[].slug`.
    pub fn validate_against_course_yaml(&self, path: &Path) -> Result<(), DefinitionError> {
        let contents = std::fs::read_to_string(path).map_err(|source| DefinitionError::CourseYamlRead {
            path: path.to_path_buf(),
            source,
        })?;
        let course: CourseYaml = serde_yaml::from_str(&contents)?;

        let in_course: Vec<String> = course.stages.into_iter().map(|stage| stage.slug).collect();
        let in_definition: Vec<String> = self
            .test_cases
            .iter()
            .map(|test_case| test_case.slug.clone())
            .collect();

        if in_course != in_definition {
            return Err(DefinitionError::CourseYamlMismatch {
                in_course,
                in_definition,
            });
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

use std::fmt;
use std::sync::Arc;

use proctor_proto::TestCase;

use crate::host::TestHostLauncher;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryCriteria {
    sources: Vec<String>,
    run_settings: String,
    batch_size: Option<u32>,
}

impl DiscoveryCriteria {
    pub fn new<I, S>(sources: I, run_settings: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sources: sources.into_iter().map(Into::into).collect(),
            run_settings: run_settings.into(),
            batch_size: None,
        }
    }

    /// Maximum number of test cases the host should pack into one message.
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = Some(batch_size.max(1));
        self
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    pub fn run_settings(&self) -> &str {
        &self.run_settings
    }

    pub fn batch_size(&self) -> Option<u32> {
        self.batch_size
    }
}

/// What to execute: whole sources, or an explicit selection of test cases.
#[derive(Clone, Default)]
pub struct RunCriteria {
    sources: Vec<String>,
    tests: Vec<TestCase>,
    run_settings: String,
    batch_size: Option<u32>,
    launcher: Option<Arc<dyn TestHostLauncher>>,
}

impl RunCriteria {
    pub fn from_sources<I, S>(sources: I, run_settings: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sources: sources.into_iter().map(Into::into).collect(),
            run_settings: run_settings.into(),
            ..Self::default()
        }
    }

    /// Run-by-tests. Sources are derived from the selection, first seen first.
    pub fn from_tests(tests: Vec<TestCase>, run_settings: impl Into<String>) -> Self {
        let mut sources: Vec<String> = Vec::new();
        for test in &tests {
            if !sources.contains(&test.source) {
                sources.push(test.source.clone());
            }
        }
        Self {
            sources,
            tests,
            run_settings: run_settings.into(),
            ..Self::default()
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = Some(batch_size.max(1));
        self
    }

    /// Starts the test host through `launcher` instead of the default spawn.
    pub fn with_test_host_launcher(mut self, launcher: Arc<dyn TestHostLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    pub fn tests(&self) -> &[TestCase] {
        &self.tests
    }

    pub fn has_specific_tests(&self) -> bool {
        !self.tests.is_empty()
    }

    pub fn run_settings(&self) -> &str {
        &self.run_settings
    }

    pub fn batch_size(&self) -> Option<u32> {
        self.batch_size
    }

    pub fn test_host_launcher(&self) -> Option<&Arc<dyn TestHostLauncher>> {
        self.launcher.as_ref()
    }
}

impl fmt::Debug for RunCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunCriteria")
            .field("sources", &self.sources)
            .field("tests", &self.tests.len())
            .field("run_settings", &self.run_settings)
            .field("batch_size", &self.batch_size)
            .field("custom_launcher", &self.launcher.is_some())
            .finish()
    }
}

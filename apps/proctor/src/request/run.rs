use std::sync::Arc;
use std::time::Duration;

use proctor_proto::{SessionKind, SessionStart};
use tracing::debug;
use uuid::Uuid;

use super::session::{EventSink, SessionCore};
use super::{RequestState, RunEventsHandler, SessionError, SessionOptions, SessionOutcome};
use crate::codec::HostMessage;
use crate::criteria::RunCriteria;
use crate::host::TestHostManager;

/// One test run against one test host.
pub struct TestRunRequest {
    core: Arc<SessionCore>,
    criteria: RunCriteria,
}

impl TestRunRequest {
    /// `host_manager` should already carry the criteria's custom launcher.
    pub fn new(
        criteria: RunCriteria,
        host_manager: Box<dyn TestHostManager>,
        options: SessionOptions,
    ) -> Self {
        let mut executor_uris: Vec<String> = Vec::new();
        let selected = criteria.tests().iter().map(|test| &test.executor_uri);
        for uri in selected.chain(&options.executor_uris) {
            if !executor_uris.contains(uri) {
                executor_uris.push(uri.clone());
            }
        }
        let start = SessionStart {
            kind: SessionKind::Run,
            sources: criteria.sources().to_vec(),
            tests: criteria.tests().to_vec(),
            run_settings: criteria.run_settings().to_string(),
            extensions: options
                .extensions
                .iter()
                .map(|path| path.display().to_string())
                .collect(),
            executor_uris,
            batch_size: criteria.batch_size().or(options.batch_size),
        };
        Self {
            core: SessionCore::new(start, host_manager, options),
            criteria,
        }
    }

    pub fn id(&self) -> Uuid {
        self.core.id()
    }

    pub fn criteria(&self) -> &RunCriteria {
        &self.criteria
    }

    pub fn state(&self) -> RequestState {
        self.core.state()
    }

    pub fn outcome(&self) -> Option<SessionOutcome> {
        self.core.outcome()
    }

    pub fn execute_async(&self, handler: Arc<dyn RunEventsHandler>) -> Result<(), SessionError> {
        debug!(
            session = %self.id(),
            sources = self.criteria.sources().len(),
            tests = self.criteria.tests().len(),
            "starting test run"
        );
        self.core.start(Arc::new(RunSink(handler)))
    }

    pub fn abort(&self) {
        self.core.abort();
    }

    pub fn wait_for_completion(&self, timeout: Duration) -> bool {
        self.core.wait_for_completion(timeout)
    }
}

impl Drop for TestRunRequest {
    fn drop(&mut self) {
        self.core.shutdown();
    }
}

struct RunSink(Arc<dyn RunEventsHandler>);

impl EventSink for RunSink {
    fn deliver(&self, message: HostMessage) -> Result<(), SessionError> {
        match message {
            HostMessage::TestResults(results) => {
                self.0.on_test_results(&results);
                Ok(())
            }
            HostMessage::Log(log) => {
                self.0.on_log_message(&log);
                Ok(())
            }
            other => Err(SessionError::Protocol(format!(
                "unexpected {other:?} during a test run"
            ))),
        }
    }

    fn complete(&self, outcome: &SessionOutcome) {
        self.0.on_run_complete(outcome);
    }
}

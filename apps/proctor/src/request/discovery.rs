use std::sync::Arc;
use std::time::Duration;

use proctor_proto::{SessionKind, SessionStart};
use tracing::debug;
use uuid::Uuid;

use super::session::{EventSink, SessionCore};
use super::{DiscoveryEventsHandler, RequestState, SessionError, SessionOptions, SessionOutcome};
use crate::codec::HostMessage;
use crate::criteria::DiscoveryCriteria;
use crate::host::TestHostManager;

/// One discovery session against one test host.
pub struct DiscoveryRequest {
    core: Arc<SessionCore>,
    criteria: DiscoveryCriteria,
}

impl DiscoveryRequest {
    pub fn new(
        criteria: DiscoveryCriteria,
        host_manager: Box<dyn TestHostManager>,
        options: SessionOptions,
    ) -> Self {
        let start = SessionStart {
            kind: SessionKind::Discovery,
            sources: criteria.sources().to_vec(),
            tests: Vec::new(),
            run_settings: criteria.run_settings().to_string(),
            extensions: options
                .extensions
                .iter()
                .map(|path| path.display().to_string())
                .collect(),
            executor_uris: options.executor_uris.clone(),
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

    pub fn criteria(&self) -> &DiscoveryCriteria {
        &self.criteria
    }

    pub fn state(&self) -> RequestState {
        self.core.state()
    }

    pub fn outcome(&self) -> Option<SessionOutcome> {
        self.core.outcome()
    }

    /// Launches the test host and starts discovery in the background. Events
    /// reach `handler` on the request's driver thread.
    pub fn discover_async(&self, handler: Arc<dyn DiscoveryEventsHandler>) -> Result<(), SessionError> {
        debug!(session = %self.id(), sources = self.criteria.sources().len(), "starting discovery");
        self.core.start(Arc::new(DiscoverySink(handler)))
    }

    pub fn abort(&self) {
        self.core.abort();
    }

    /// True once the request finished and its completion handler returned.
    pub fn wait_for_completion(&self, timeout: Duration) -> bool {
        self.core.wait_for_completion(timeout)
    }
}

impl Drop for DiscoveryRequest {
    fn drop(&mut self) {
        self.core.shutdown();
    }
}

struct DiscoverySink(Arc<dyn DiscoveryEventsHandler>);

impl EventSink for DiscoverySink {
    fn deliver(&self, message: HostMessage) -> Result<(), SessionError> {
        match message {
            HostMessage::TestsFound(tests) => {
                self.0.on_tests_found(&tests);
                Ok(())
            }
            HostMessage::Log(log) => {
                self.0.on_log_message(&log);
                Ok(())
            }
            other => Err(SessionError::Protocol(format!(
                "unexpected {other:?} during discovery"
            ))),
        }
    }

    fn complete(&self, outcome: &SessionOutcome) {
        self.0.on_discovery_complete(outcome);
    }
}

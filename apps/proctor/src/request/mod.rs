//! Discovery and run requests.
//!
//! A request owns one test host session from launch to teardown:
//!
//! ```text
//! Created ──start──▶ Initialized ──handshake──▶ Active ──Session.End──▶ Completed
//!    │                   │                        │
//!    └───────────────────┴────── abort ───────────┴──────────────────▶ Aborted
//!                        └──── timeout / closed / protocol error ─────▶ Faulted
//! ```
//!
//! Events are delivered to a handler on the request's driver thread, in the
//! order the test host sent them. Once `abort` returns no further discovery or
//! result events are delivered.

mod discovery;
mod run;
mod session;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use proctor_proto::{LogMessage, SessionEnd, TestCase, TestResult};
use thiserror::Error;

use crate::codec::CodecError;
use crate::config::ProctorConfig;
use crate::host::HostError;
use crate::settings::RunConfiguration;
use crate::transport::{ChannelError, ConnectionRole};

pub use discovery::DiscoveryRequest;
pub use run::TestRunRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    Created,
    Initialized,
    Active,
    Completed,
    Aborted,
    Faulted,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Aborted | RequestState::Faulted
        )
    }
}

/// Where in the session a fault happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    Connection,
    Handshake,
    Session,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("request cannot be started from the {0:?} state")]
    InvalidState(RequestState),
    #[error("test host did not connect within {0:?}")]
    ConnectionTimeout(Duration),
    #[error("test host did not complete the handshake within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// A known message whose payload did not have the expected shape.
    #[error("protocol violation: {0}")]
    InvalidPayload(#[source] CodecError),
    #[error("test host reported an error: {message}")]
    HostReported {
        message: String,
        detail: Option<String>,
    },
    #[error("failed to start the session driver: {0}")]
    Driver(#[source] io::Error),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Codec(CodecError),
    #[error(transparent)]
    Host(#[from] HostError),
}

impl From<CodecError> for SessionError {
    fn from(error: CodecError) -> Self {
        if error.is_payload_error() {
            SessionError::InvalidPayload(error)
        } else {
            SessionError::Codec(error)
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionFault {
    pub phase: SessionPhase,
    pub error: Arc<SessionError>,
    /// True when the test host was still running and had to be killed.
    pub host_terminated: bool,
}

/// How a request ended. Reported exactly once per request.
#[derive(Debug, Clone)]
pub enum SessionOutcome {
    Completed(SessionEnd),
    Aborted,
    Faulted(SessionFault),
}

impl SessionOutcome {
    pub fn state(&self) -> RequestState {
        match self {
            SessionOutcome::Completed(_) => RequestState::Completed,
            SessionOutcome::Aborted => RequestState::Aborted,
            SessionOutcome::Faulted(_) => RequestState::Faulted,
        }
    }

    pub fn fault(&self) -> Option<&SessionFault> {
        match self {
            SessionOutcome::Faulted(fault) => Some(fault),
            _ => None,
        }
    }
}

/// Per-session knobs, resolved from the process configuration and the
/// request's run settings.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Role the orchestrator takes on the channel.
    pub role: ConnectionRole,
    pub connection_timeout: Duration,
    pub handshake_timeout: Duration,
    pub protocol_version: u32,
    pub host_exit_grace: Duration,
    /// Batch size from run settings; criteria that set one take precedence.
    pub batch_size: Option<u32>,
    pub extensions: Vec<PathBuf>,
    /// Executors the test host should load for the session's sources.
    pub executor_uris: Vec<String>,
}

impl SessionOptions {
    pub fn resolve(config: &ProctorConfig, run_configuration: &RunConfiguration) -> Self {
        Self {
            role: run_configuration
                .connection_role
                .unwrap_or(ConnectionRole::Host),
            connection_timeout: config.connection_timeout,
            handshake_timeout: run_configuration
                .handshake_timeout()
                .unwrap_or(config.handshake_timeout),
            protocol_version: config.protocol_version,
            host_exit_grace: config.host_exit_grace,
            batch_size: run_configuration.batch_size.map(|size| size.max(1)),
            extensions: Vec::new(),
            executor_uris: Vec::new(),
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::resolve(&ProctorConfig::default(), &RunConfiguration::default())
    }
}

pub trait DiscoveryEventsHandler: Send + Sync {
    fn on_tests_found(&self, tests: &[TestCase]);

    fn on_log_message(&self, _message: &LogMessage) {}

    fn on_discovery_complete(&self, outcome: &SessionOutcome);
}

pub trait RunEventsHandler: Send + Sync {
    fn on_test_results(&self, results: &[TestResult]);

    fn on_log_message(&self, _message: &LogMessage) {}

    fn on_run_complete(&self, outcome: &SessionOutcome);
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    TestsFound(Vec<TestCase>),
    TestResults(Vec<TestResult>),
    Log(LogMessage),
    Complete(SessionOutcome),
}

/// Handler that forwards every event into a channel, for callers that would
/// rather pull events than implement a handler.
#[derive(Debug, Clone)]
pub struct EventCollector {
    sender: Sender<SessionEvent>,
}

impl EventCollector {
    pub fn channel() -> (Self, Receiver<SessionEvent>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        (Self { sender }, receiver)
    }

    fn forward(&self, event: SessionEvent) {
        // The receiver may be gone; the session carries on regardless.
        let _ = self.sender.send(event);
    }
}

impl DiscoveryEventsHandler for EventCollector {
    fn on_tests_found(&self, tests: &[TestCase]) {
        self.forward(SessionEvent::TestsFound(tests.to_vec()));
    }

    fn on_log_message(&self, message: &LogMessage) {
        self.forward(SessionEvent::Log(message.clone()));
    }

    fn on_discovery_complete(&self, outcome: &SessionOutcome) {
        self.forward(SessionEvent::Complete(outcome.clone()));
    }
}

impl RunEventsHandler for EventCollector {
    fn on_test_results(&self, results: &[TestResult]) {
        self.forward(SessionEvent::TestResults(results.to_vec()));
    }

    fn on_log_message(&self, message: &LogMessage) {
        self.forward(SessionEvent::Log(message.clone()));
    }

    fn on_run_complete(&self, outcome: &SessionOutcome) {
        self.forward(SessionEvent::Complete(outcome.clone()));
    }
}

//! Shared protocol definitions for orchestrator ↔ test host communication.
//! Kept in a dedicated crate so test host implementations can depend on the
//! wire vocabulary without pulling in the orchestration runtime.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope version emitted without an explicit `Version` field.
pub const LEGACY_PROTOCOL_VERSION: u32 = 1;
/// Highest protocol version this build speaks.
pub const CURRENT_PROTOCOL_VERSION: u32 = 2;

/// Stable `MessageType` tags.
pub mod message_type {
    pub const HANDSHAKE: &str = "Session.Handshake";
    pub const SESSION_START: &str = "Session.Start";
    pub const TEST_FOUND: &str = "Discovery.TestFound";
    pub const TEST_RESULT: &str = "Execution.TestResult";
    pub const SESSION_END: &str = "Session.End";
    pub const ERROR: &str = "Session.Error";
    pub const LOG: &str = "Session.Log";
    pub const ABORT: &str = "Session.Abort";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub protocol_version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Discovery,
    Run,
}

/// Sent by the orchestrator once the handshake has completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStart {
    pub kind: SessionKind,
    #[serde(default)]
    pub sources: Vec<String>,
    /// Explicit test selection for run-by-tests sessions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tests: Vec<TestCase>,
    #[serde(default)]
    pub run_settings: String,
    /// Extension search paths the host should load adapters from.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub executor_uris: Vec<String>,
    /// Hint for how many events the host may batch per message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: Uuid,
    pub fully_qualified_name: String,
    pub display_name: String,
    pub source: String,
    pub executor_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,
}

impl TestCase {
    pub fn new(
        fully_qualified_name: impl Into<String>,
        source: impl Into<String>,
        executor_uri: impl Into<String>,
    ) -> Self {
        let fully_qualified_name = fully_qualified_name.into();
        Self {
            id: Uuid::new_v4(),
            display_name: fully_qualified_name.clone(),
            fully_qualified_name,
            source: source.into(),
            executor_uri: executor_uri.into(),
            code_file_path: None,
            line_number: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    #[default]
    None,
    Passed,
    Failed,
    Skipped,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub test_case: TestCase,
    pub outcome: TestOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_stack_trace: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<String>,
}

impl TestResult {
    pub fn new(test_case: TestCase, outcome: TestOutcome) -> Self {
        Self {
            test_case,
            outcome,
            error_message: None,
            error_stack_trace: None,
            duration_ms: 0,
            messages: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEnd {
    pub total_tests: u64,
    #[serde(default)]
    pub aborted: bool,
    #[serde(default)]
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageLevel {
    Informational,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    pub level: MessageLevel,
    pub message: String,
}

/// Negotiated version for two peers; never below the legacy version.
pub fn negotiate_version(local: u32, peer: u32) -> u32 {
    local.min(peer).max(LEGACY_PROTOCOL_VERSION)
}

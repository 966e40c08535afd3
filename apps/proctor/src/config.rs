use std::env;
use std::path::PathBuf;
#[cfg(test)]
use std::sync::Mutex;
use std::time::Duration;

use proctor_proto::CURRENT_PROTOCOL_VERSION;

use crate::transport::DEFAULT_CONNECTION_TIMEOUT;

pub const ENV_CONNECTION_TIMEOUT_MS: &str = "PROCTOR_CONNECTION_TIMEOUT_MS";
pub const ENV_HANDSHAKE_TIMEOUT_MS: &str = "PROCTOR_HANDSHAKE_TIMEOUT_MS";
pub const ENV_TESTHOST_PATH: &str = "PROCTOR_TESTHOST_PATH";
pub const ENV_PROTOCOL_VERSION: &str = "PROCTOR_PROTOCOL_VERSION";

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_TESTHOST_PATH: &str = "testhost";
/// How long a finished test host may take to exit before it is killed.
pub const DEFAULT_HOST_EXIT_GRACE: Duration = Duration::from_millis(500);

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProctorConfig {
    /// How long to wait for the test host to connect
    pub connection_timeout: Duration,
    /// How long the handshake may take once connected
    pub handshake_timeout: Duration,
    /// Executable spawned by the default host manager
    pub testhost_path: PathBuf,
    /// Highest protocol version offered in the handshake
    pub protocol_version: u32,
    pub host_exit_grace: Duration,
}

impl ProctorConfig {
    /// Load configuration from environment variables. Unparseable values
    /// fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            connection_timeout: env_millis(ENV_CONNECTION_TIMEOUT_MS)
                .unwrap_or(defaults.connection_timeout),
            handshake_timeout: env_millis(ENV_HANDSHAKE_TIMEOUT_MS)
                .unwrap_or(defaults.handshake_timeout),
            testhost_path: env::var_os(ENV_TESTHOST_PATH)
                .filter(|path| !path.is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.testhost_path),
            protocol_version: env::var(ENV_PROTOCOL_VERSION)
                .ok()
                .and_then(|value| value.trim().parse::<u32>().ok())
                .filter(|version| *version >= 1)
                .unwrap_or(defaults.protocol_version),
            host_exit_grace: defaults.host_exit_grace,
        }
    }
}

impl Default for ProctorConfig {
    fn default() -> Self {
        Self {
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            testhost_path: PathBuf::from(DEFAULT_TESTHOST_PATH),
            protocol_version: CURRENT_PROTOCOL_VERSION,
            host_exit_grace: DEFAULT_HOST_EXIT_GRACE,
        }
    }
}

fn env_millis(var: &str) -> Option<Duration> {
    env::var(var)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}

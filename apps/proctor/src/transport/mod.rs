use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::CodecError;

pub mod channel;
pub mod frame;

pub use channel::CommunicationChannel;

pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(90);
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionRole {
    /// Listens on an endpoint and waits for the peer to dial in.
    Host,
    /// Dials an endpoint the peer is listening on.
    Client,
}

impl ConnectionRole {
    pub fn peer(self) -> Self {
        match self {
            ConnectionRole::Host => ConnectionRole::Client,
            ConnectionRole::Client => ConnectionRole::Host,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionRole::Host => "host",
            ConnectionRole::Client => "client",
        }
    }
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a launched test host needs to reach the orchestrator. `role` is the
/// role the test host itself must take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub endpoint: SocketAddr,
    pub role: ConnectionRole,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub connection_timeout: Duration,
    pub retry_interval: Duration,
    pub protocol_version: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            retry_interval: CONNECT_RETRY_INTERVAL,
            protocol_version: proctor_proto::CURRENT_PROTOCOL_VERSION,
        }
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel is already bound to an endpoint")]
    AlreadyBound,
    #[error("operation requires the {expected} role but the channel is a {actual}")]
    WrongRole {
        expected: ConnectionRole,
        actual: ConnectionRole,
    },
    #[error("channel has no connected peer")]
    NotConnected,
    #[error("channel closed")]
    ChannelClosed,
    #[error("no peer connected within {0:?}")]
    ConnectionTimeout(Duration),
    #[error("timed out waiting for a message")]
    Timeout,
    #[error("frame of {0} bytes exceeds the frame limit")]
    FrameTooLarge(usize),
    #[error("channel i/o error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl ChannelError {
    pub(crate) fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected => ChannelError::ChannelClosed,
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ChannelError::Timeout,
            _ => ChannelError::Io(err),
        }
    }
}

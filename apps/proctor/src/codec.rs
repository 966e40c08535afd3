//! JSON envelope codec for the orchestrator ↔ test host protocol.
//!
//! An envelope is `{"MessageType": ..., "Version": ..., "Payload": ...}`. The
//! `Version` field is only written for versions above
//! [`LEGACY_PROTOCOL_VERSION`], so version 1 peers keep seeing the shape they
//! always did. Payload shapes differ by version: legacy discovery and result
//! messages carry a single item, newer ones carry a batch.

use proctor_proto::{
    CURRENT_PROTOCOL_VERSION, Handshake, HostError, LEGACY_PROTOCOL_VERSION, LogMessage,
    SessionEnd, SessionStart, TestCase, TestResult, message_type,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("envelope is not valid UTF-8")]
    NotUtf8,
    #[error("failed to serialize {message_type} payload: {source}")]
    Encode {
        message_type: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("payload for {message_type} does not match the expected shape: {source}")]
    PayloadDecode {
        message_type: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0} message is missing its payload")]
    MissingPayload(String),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),
    #[error("unexpected message type {0}")]
    UnknownMessageType(String),
}

impl CodecError {
    /// True when the envelope was fine but its payload could not be read.
    pub fn is_payload_error(&self) -> bool {
        matches!(
            self,
            CodecError::PayloadDecode { .. } | CodecError::MissingPayload(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    message_type: String,
    payload: Option<Value>,
}

impl Message {
    pub fn new(message_type: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            message_type: message_type.into(),
            payload,
        }
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VersionedMessage {
    message: Message,
    version: u32,
}

impl VersionedMessage {
    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn version(&self) -> u32 {
        self.version
    }
}

/// A decoded envelope: legacy when the wire form carried no version.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Legacy(Message),
    Versioned(VersionedMessage),
}

impl Envelope {
    pub fn message(&self) -> &Message {
        match self {
            Envelope::Legacy(message) => message,
            Envelope::Versioned(versioned) => &versioned.message,
        }
    }

    pub fn version(&self) -> u32 {
        match self {
            Envelope::Legacy(_) => LEGACY_PROTOCOL_VERSION,
            Envelope::Versioned(versioned) => versioned.version,
        }
    }

    pub fn message_type(&self) -> &str {
        self.message().message_type()
    }
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "MessageType")]
    message_type: String,
    #[serde(rename = "Version", default, skip_serializing_if = "Option::is_none")]
    version: Option<u32>,
    #[serde(
        rename = "Payload",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_payload"
    )]
    payload: Option<Value>,
}

/// A `Payload` key that is present is kept, even when it holds `null`; only a
/// missing key means "no payload".
fn present_payload<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Stateless envelope codec. Construct one per owner; it is `Copy` and safe to
/// share across threads.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec;

impl MessageCodec {
    pub fn new() -> Self {
        Self
    }

    /// Envelope without a payload.
    pub fn encode_empty(&self, message_type: &str) -> Result<String, CodecError> {
        self.write(WireEnvelope {
            message_type: message_type.to_string(),
            version: None,
            payload: None,
        })
    }

    pub fn encode<T: Serialize + ?Sized>(
        &self,
        message_type: &str,
        payload: &T,
        version: u32,
    ) -> Result<String, CodecError> {
        if version < LEGACY_PROTOCOL_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let payload = serde_json::to_value(payload).map_err(|source| CodecError::Encode {
            message_type: message_type.to_string(),
            source,
        })?;
        self.write(WireEnvelope {
            message_type: message_type.to_string(),
            version: (version > LEGACY_PROTOCOL_VERSION).then_some(version),
            payload: Some(payload),
        })
    }

    pub fn decode(&self, raw: &str) -> Result<Envelope, CodecError> {
        let wire: WireEnvelope = serde_json::from_str(raw).map_err(CodecError::Malformed)?;
        let message = Message::new(wire.message_type, wire.payload);
        match wire.version {
            None => Ok(Envelope::Legacy(message)),
            Some(0) => Err(CodecError::UnsupportedVersion(0)),
            Some(version) => Ok(Envelope::Versioned(VersionedMessage { message, version })),
        }
    }

    pub fn decode_bytes(&self, raw: &[u8]) -> Result<Envelope, CodecError> {
        let text = std::str::from_utf8(raw).map_err(|_| CodecError::NotUtf8)?;
        self.decode(text)
    }

    pub fn decode_payload<T: DeserializeOwned>(&self, message: &Message) -> Result<T, CodecError> {
        let payload = message
            .payload()
            .ok_or_else(|| CodecError::MissingPayload(message.message_type().to_string()))?;
        T::deserialize(payload).map_err(|source| CodecError::PayloadDecode {
            message_type: message.message_type().to_string(),
            source,
        })
    }

    /// Deep copy through a version 2 serialization round trip.
    pub fn clone_value<T: Serialize + DeserializeOwned>(&self, value: &T) -> Result<T, CodecError> {
        let raw = self.encode("Clone", value, CURRENT_PROTOCOL_VERSION)?;
        let envelope = self.decode(&raw)?;
        self.decode_payload(envelope.message())
    }

    fn write(&self, wire: WireEnvelope) -> Result<String, CodecError> {
        let message_type = wire.message_type.clone();
        serde_json::to_string(&wire).map_err(|source| CodecError::Encode {
            message_type,
            source,
        })
    }
}

/// Messages a test host may send, decoded against the shape their tag implies.
#[derive(Debug, Clone, PartialEq)]
pub enum HostMessage {
    Handshake(Handshake),
    TestsFound(Vec<TestCase>),
    TestResults(Vec<TestResult>),
    SessionEnd(SessionEnd),
    Error(HostError),
    Log(LogMessage),
}

impl HostMessage {
    pub fn from_envelope(codec: &MessageCodec, envelope: &Envelope) -> Result<Self, CodecError> {
        let message = envelope.message();
        let legacy = envelope.version() == LEGACY_PROTOCOL_VERSION;
        match message.message_type() {
            message_type::HANDSHAKE => codec.decode_payload(message).map(HostMessage::Handshake),
            message_type::TEST_FOUND => {
                decode_batch(codec, message, legacy).map(HostMessage::TestsFound)
            }
            message_type::TEST_RESULT => {
                decode_batch(codec, message, legacy).map(HostMessage::TestResults)
            }
            message_type::SESSION_END => match message.payload() {
                None | Some(Value::Null) => Ok(HostMessage::SessionEnd(SessionEnd::default())),
                Some(_) => codec.decode_payload(message).map(HostMessage::SessionEnd),
            },
            message_type::ERROR => codec.decode_payload(message).map(HostMessage::Error),
            message_type::LOG => codec.decode_payload(message).map(HostMessage::Log),
            other => Err(CodecError::UnknownMessageType(other.to_string())),
        }
    }
}

/// Orchestrator-originated messages, the inverse direction of [`HostMessage`].
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerMessage {
    Handshake(Handshake),
    SessionStart(SessionStart),
    Abort,
}

impl ControllerMessage {
    pub fn from_envelope(codec: &MessageCodec, envelope: &Envelope) -> Result<Self, CodecError> {
        let message = envelope.message();
        match message.message_type() {
            message_type::HANDSHAKE => codec
                .decode_payload(message)
                .map(ControllerMessage::Handshake),
            message_type::SESSION_START => codec
                .decode_payload(message)
                .map(ControllerMessage::SessionStart),
            message_type::ABORT => Ok(ControllerMessage::Abort),
            other => Err(CodecError::UnknownMessageType(other.to_string())),
        }
    }
}

fn decode_batch<T: DeserializeOwned>(
    codec: &MessageCodec,
    message: &Message,
    legacy: bool,
) -> Result<Vec<T>, CodecError> {
    if legacy {
        codec.decode_payload::<T>(message).map(|item| vec![item])
    } else {
        codec.decode_payload::<Vec<T>>(message)
    }
}

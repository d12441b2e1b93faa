//! Signaling envelopes and the channel they travel on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::MedleyError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    Sdp,
    Ice,
    ConnectionClose,
    ReceiverStop,
    TrackMeta,
    LockInit,
    LockAccept,
    LockRelease,
    ArchitectureSwitch,
    UserConnected,
    UserDisconnected,
    Unknown(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Sdp => "sdp",
            MessageType::Ice => "ice",
            MessageType::ConnectionClose => "connection:close",
            MessageType::ReceiverStop => "receiver:stop",
            MessageType::TrackMeta => "track:meta",
            MessageType::LockInit => "lock:init",
            MessageType::LockAccept => "lock:accept",
            MessageType::LockRelease => "lock:release",
            MessageType::ArchitectureSwitch => "architecture:switch",
            MessageType::UserConnected => "user:connected",
            MessageType::UserDisconnected => "user:disconnected",
            MessageType::Unknown(other) => other,
        }
    }
}

impl From<String> for MessageType {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "sdp" => MessageType::Sdp,
            "ice" => MessageType::Ice,
            "connection:close" => MessageType::ConnectionClose,
            "receiver:stop" => MessageType::ReceiverStop,
            "track:meta" => MessageType::TrackMeta,
            "lock:init" => MessageType::LockInit,
            "lock:accept" => MessageType::LockAccept,
            "lock:release" => MessageType::LockRelease,
            "architecture:switch" => MessageType::ArchitectureSwitch,
            "user:connected" => MessageType::UserConnected,
            "user:disconnected" => MessageType::UserDisconnected,
            _ => MessageType::Unknown(value),
        }
    }
}

impl From<MessageType> for String {
    fn from(value: MessageType) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub sender: String,
    pub receiver: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub sent: Option<DateTime<Utc>>,
}

impl Envelope {
    pub fn new(
        sender: impl Into<String>,
        receiver: impl Into<String>,
        kind: MessageType,
        data: Value,
    ) -> Self {
        Self {
            sender: sender.into(),
            receiver: receiver.into(),
            kind,
            data,
            sent: Some(Utc::now()),
        }
    }
}

/// Payload of a `track:meta` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackMetaPayload {
    pub mid: String,
    pub meta: String,
}

/// Outbound half of the signaling bus. Inbound envelopes are pumped into
/// the conference by whoever owns the subscription.
pub trait SignalingChannel: Send + Sync {
    fn send(&self, envelope: Envelope) -> Result<(), MedleyError>;
}

//! Capability surface of the underlying media-transport engine.
//!
//! The core never talks ICE/DTLS/SRTP itself: every session owns one
//! [`Transport`] obtained from an injected [`TransportFactory`] and reacts
//! to the [`TransportEvent`]s it emits.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::MedleyError;
use crate::media::{MediaTrack, TrackKind, TrackRef};
use crate::settings::SessionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    #[serde(default)]
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Pseudo-description discarding the pending local offer.
    pub fn rollback() -> Self {
        Self {
            kind: SdpType::Rollback,
            sdp: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sendrecv,
    Sendonly,
    Recvonly,
    Inactive,
}

impl Direction {
    pub fn sends(&self) -> bool {
        matches!(self, Direction::Sendrecv | Direction::Sendonly)
    }

    pub fn receives(&self) -> bool {
        matches!(self, Direction::Sendrecv | Direction::Recvonly)
    }

    /// Direction left once the send capability is dropped.
    pub fn without_send(&self) -> Direction {
        match self {
            Direction::Sendrecv => Direction::Recvonly,
            _ => Direction::Inactive,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Opaque handle of a transceiver, stable from creation on. The `mid`
/// only appears once the transceiver is bound by a negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransceiverId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransceiverInit {
    pub direction: Direction,
    pub streams: Vec<String>,
}

impl TransceiverInit {
    pub fn send_only(streams: Vec<String>) -> Self {
        Self {
            direction: Direction::Sendonly,
            streams,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransceiverInfo {
    pub id: TransceiverId,
    pub mid: Option<String>,
    pub kind: TrackKind,
    pub direction: Direction,
    pub sender: Option<MediaTrack>,
    pub receiver: Option<MediaTrack>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// `None` marks the end of candidate gathering.
    IceCandidate(Option<IceCandidate>),
    IceConnectionStateChanged(IceConnectionState),
    SignalingStateChanged(SignalingState),
    TrackArrived {
        track: MediaTrack,
        streams: Vec<String>,
        transceiver: TransceiverId,
    },
    TrackEnded {
        track_id: String,
    },
    NegotiationNeeded,
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, MedleyError>;
    async fn create_answer(&self) -> Result<SessionDescription, MedleyError>;
    async fn set_local_description(&self, description: SessionDescription) -> Result<(), MedleyError>;
    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), MedleyError>;
    async fn add_ice_candidate(&self, candidate: Option<IceCandidate>) -> Result<(), MedleyError>;

    fn add_transceiver(&self, track: TrackRef, init: TransceiverInit) -> Result<TransceiverId, MedleyError>;
    /// Detaches the sent track, keeping the transceiver.
    fn remove_track(&self, transceiver: TransceiverId) -> Result<(), MedleyError>;
    /// Swaps the sent track without renegotiation.
    fn replace_track(&self, transceiver: TransceiverId, track: Option<MediaTrack>) -> Result<(), MedleyError>;
    fn set_direction(&self, transceiver: TransceiverId, direction: Direction) -> Result<(), MedleyError>;
    /// Stops the receive-side track. Does not emit [`TransportEvent::TrackEnded`].
    fn stop_receiver_track(&self, transceiver: TransceiverId) -> Result<(), MedleyError>;
    fn transceivers(&self) -> Vec<TransceiverInfo>;
    fn signaling_state(&self) -> SignalingState;
    fn restart_ice(&self);
    fn close(&self);
}

/// Creates transports for new sessions. Owns whatever host the engine needs.
pub trait TransportFactory: Send + Sync {
    fn create(&self, config: &SessionConfig) -> Result<(Arc<dyn Transport>, TransportEvents), MedleyError>;
}

//! In-memory signaling bus and transport engine.
//!
//! `LoopbackTransport` simulates unified-plan offer/answer semantics on a
//! JSON session description so sessions can negotiate with each other
//! inside one process: signaling states, mid assignment on the local offer
//! (undone by rollback), negotiation-needed recomputed whenever the
//! transport returns to stable, remote track arrival and a trivial ICE
//! state. The bus routes envelopes by receiver id and records all of them.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::MedleyError;
use crate::media::{MediaTrack, TrackKind, TrackRef};
use crate::negotiation::PeerConnection;
use crate::settings::SessionConfig;
use crate::signaling::{Envelope, MessageType, SignalingChannel};
use crate::transport::{
    Direction, IceCandidate, IceConnectionState, SdpType, SessionDescription, SignalingState,
    TransceiverId, TransceiverInfo, TransceiverInit, Transport, TransportEvent, TransportEvents,
    TransportFactory,
};

/// Lets spawned session and pump tasks run until the queues are drained.
pub async fn settle() {
    for _ in 0..2_000 {
        tokio::task::yield_now().await;
    }
}

// ---------------------------------------------------------------------------
// Signaling bus
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BusState {
    endpoints: HashMap<String, mpsc::UnboundedSender<Envelope>>,
    members: Vec<String>,
    /// Endpoints told about membership changes without being members.
    watchers: Vec<String>,
    log: Vec<Envelope>,
}

#[derive(Clone, Default)]
pub struct LoopbackBus {
    state: Arc<Mutex<BusState>>,
}

struct BusChannel {
    state: Arc<Mutex<BusState>>,
}

const BUS_ID: &str = "@signaling";

fn member_id(id: &str) -> serde_json::Value {
    serde_json::Value::from(id)
}

impl SignalingChannel for BusChannel {
    fn send(&self, envelope: Envelope) -> Result<(), MedleyError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.log.push(envelope.clone());
        match state.endpoints.get(&envelope.receiver) {
            Some(endpoint) => endpoint
                .send(envelope)
                .map_err(|e| MedleyError::Signaling(format!("endpoint gone: {e}"))),
            None => {
                tracing::debug!("no endpoint {}, {} dropped", envelope.receiver, envelope.kind.as_str());
                Ok(())
            }
        }
    }
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn channel(&self) -> Arc<dyn SignalingChannel> {
        Arc::new(BusChannel {
            state: self.state.clone(),
        })
    }

    /// Routes envelopes addressed to `id` into the returned receiver.
    pub fn register(&self, id: &str) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state().endpoints.insert(id.to_string(), tx);
        rx
    }

    pub fn unregister(&self, id: &str) {
        self.state().endpoints.remove(id);
    }

    /// Registers a conference member and exchanges `user:connected` notices
    /// with the members already present. Watchers are told as well.
    pub fn join(&self, id: &str) -> mpsc::UnboundedReceiver<Envelope> {
        let rx = self.register(id);
        let (existing, watchers) = {
            let mut state = self.state();
            let existing = state.members.clone();
            state.members.push(id.to_string());
            (existing, state.watchers.clone())
        };
        let channel = self.channel();
        for member in existing {
            let _ = channel.send(Envelope::new(BUS_ID, member.clone(), MessageType::UserConnected, member_id(id)));
            let _ = channel.send(Envelope::new(BUS_ID, id, MessageType::UserConnected, member_id(&member)));
        }
        for watcher in watchers {
            let _ = channel.send(Envelope::new(BUS_ID, watcher, MessageType::UserConnected, member_id(id)));
        }
        rx
    }

    /// Registers an endpoint (a media server) that follows membership
    /// without being announced to the members.
    pub fn watch(&self, id: &str) -> mpsc::UnboundedReceiver<Envelope> {
        let rx = self.register(id);
        let members = {
            let mut state = self.state();
            state.watchers.push(id.to_string());
            state.members.clone()
        };
        let channel = self.channel();
        for member in members {
            let _ = channel.send(Envelope::new(BUS_ID, id, MessageType::UserConnected, member_id(&member)));
        }
        rx
    }

    pub fn leave(&self, id: &str) {
        let notified: Vec<String> = {
            let mut state = self.state();
            state.members.retain(|m| m != id);
            state.endpoints.remove(id);
            state.members.iter().chain(state.watchers.iter()).cloned().collect()
        };
        let channel = self.channel();
        for endpoint in notified {
            let _ = channel.send(Envelope::new(BUS_ID, endpoint, MessageType::UserDisconnected, member_id(id)));
        }
    }

    pub fn members(&self) -> Vec<String> {
        self.state().members.clone()
    }

    /// Every envelope sent so far, in order.
    pub fn sent(&self) -> Vec<Envelope> {
        self.state().log.clone()
    }

    pub fn sent_between(&self, sender: &str, receiver: &str, kind: MessageType) -> Vec<Envelope> {
        self.state()
            .log
            .iter()
            .filter(|e| e.sender == sender && e.receiver == receiver && e.kind == kind)
            .cloned()
            .collect()
    }

    /// Registers the session's local name and feeds it its envelopes.
    pub fn attach(&self, session: &Arc<PeerConnection>) {
        let mut rx = self.register(session.name());
        let session = session.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                session.handle_envelope(&envelope).await;
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Session description body
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SdpSection {
    mid: String,
    kind: TrackKind,
    direction: Direction,
    #[serde(default)]
    track: Option<MediaTrack>,
    #[serde(default)]
    streams: Vec<String>,
    /// Offerer-local transceiver handle the mid is reserved for.
    #[serde(default)]
    local: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct SdpBody {
    sections: Vec<SdpSection>,
    #[serde(default)]
    ice_restart: bool,
}

fn parse_body(description: &SessionDescription) -> Result<SdpBody, MedleyError> {
    serde_json::from_str(&description.sdp)
        .map_err(|e| MedleyError::Transport(format!("unparsable description: {e}")))
}

fn encode_body(body: &SdpBody) -> Result<String, MedleyError> {
    serde_json::to_string(body).map_err(|e| MedleyError::Transport(format!("encode description: {e}")))
}

fn direction_from(send: bool, recv: bool) -> Direction {
    match (send, recv) {
        (true, true) => Direction::Sendrecv,
        (true, false) => Direction::Sendonly,
        (false, true) => Direction::Recvonly,
        (false, false) => Direction::Inactive,
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct LoopbackTransceiver {
    id: TransceiverId,
    mid: Option<String>,
    kind: TrackKind,
    direction: Direction,
    /// Created by add_transceiver (as opposed to a remote offer).
    local: bool,
    negotiated: Option<Direction>,
    sender: Option<MediaTrack>,
    receiver: Option<MediaTrack>,
    receiver_stopped: bool,
    streams: Vec<String>,
}

impl LoopbackTransceiver {
    fn info(&self) -> TransceiverInfo {
        TransceiverInfo {
            id: self.id,
            mid: self.mid.clone(),
            kind: self.kind,
            direction: self.direction,
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
        }
    }
}

struct TransportState {
    signaling: SignalingState,
    ice: IceConnectionState,
    transceivers: Vec<LoopbackTransceiver>,
    next_id: u64,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    pending_local: Option<SdpBody>,
    pending_remote: Option<SdpBody>,
    negotiation_pending: bool,
    ice_restart: bool,
    remote_candidates: Vec<IceCandidate>,
    candidate_seq: u64,
    rollbacks: usize,
    offers_created: usize,
    applied: Vec<String>,
}

pub struct LoopbackTransport {
    state: Mutex<TransportState>,
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
}

impl LoopbackTransport {
    pub fn new() -> (Arc<Self>, TransportEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            state: Mutex::new(TransportState {
                signaling: SignalingState::Stable,
                ice: IceConnectionState::New,
                transceivers: Vec::new(),
                next_id: 0,
                local: None,
                remote: None,
                pending_local: None,
                pending_remote: None,
                negotiation_pending: false,
                ice_restart: false,
                remote_candidates: Vec::new(),
                candidate_seq: 0,
                rollbacks: 0,
                offers_created: 0,
                applied: Vec::new(),
            }),
            events: Mutex::new(Some(tx)),
        });
        (transport, rx)
    }

    fn state(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(tx) = self.events.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            let _ = tx.send(event);
        }
    }

    fn ensure_open(state: &TransportState) -> Result<(), MedleyError> {
        if state.signaling == SignalingState::Closed {
            return Err(MedleyError::Closed("loopback transport".into()));
        }
        Ok(())
    }

    fn needs_negotiation(state: &TransportState) -> bool {
        state.ice_restart
            || state
                .transceivers
                .iter()
                .filter(|t| t.local)
                .any(|t| t.mid.is_none() || t.negotiated != Some(t.direction))
    }

    /// Fires negotiation-needed once per change burst, only while stable.
    fn check_negotiation(&self, state: &mut TransportState) {
        if state.signaling == SignalingState::Stable
            && !state.negotiation_pending
            && Self::needs_negotiation(state)
        {
            state.negotiation_pending = true;
            self.emit(TransportEvent::NegotiationNeeded);
        }
    }

    fn set_signaling(&self, state: &mut TransportState, signaling: SignalingState) {
        state.signaling = signaling;
        self.emit(TransportEvent::SignalingStateChanged(signaling));
        if signaling == SignalingState::Stable {
            self.check_negotiation(state);
        }
    }

    fn emit_candidate(&self, state: &mut TransportState) {
        state.candidate_seq += 1;
        let candidate = IceCandidate {
            candidate: format!("candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host", state.candidate_seq, 50_000 + state.candidate_seq),
            sdp_mid: state.transceivers.iter().find_map(|t| t.mid.clone()),
            sdp_m_line_index: Some(0),
        };
        self.emit(TransportEvent::IceCandidate(Some(candidate)));
    }

    fn maybe_connect(&self, state: &mut TransportState) {
        if state.remote.is_some()
            && !state.remote_candidates.is_empty()
            && matches!(state.ice, IceConnectionState::New | IceConnectionState::Checking)
        {
            state.ice = IceConnectionState::Connected;
            self.emit(TransportEvent::IceConnectionStateChanged(IceConnectionState::Connected));
        }
    }

    fn next_free_mid(used: &BTreeSet<String>) -> String {
        (0u64..)
            .map(|n| n.to_string())
            .find(|mid| !used.contains(mid))
            .unwrap_or_default()
    }

    /// Hands a sending remote section's track to the matching receiver.
    fn deliver(&self, transceiver: &mut LoopbackTransceiver, section: &SdpSection) {
        if !section.direction.sends() {
            return;
        }
        let Some(remote) = &section.track else {
            return;
        };
        let fresh = transceiver
            .receiver
            .as_ref()
            .is_none_or(|current| current.id != remote.id || transceiver.receiver_stopped);
        if !fresh {
            return;
        }
        // Metadata travels separately through track:meta.
        let track = MediaTrack::with_id(remote.id.clone(), remote.kind);
        transceiver.receiver = Some(track.clone());
        transceiver.receiver_stopped = false;
        self.emit(TransportEvent::TrackArrived {
            track,
            streams: section.streams.clone(),
            transceiver: transceiver.id,
        });
    }

    // -- inspection and fault injection --------------------------------------

    pub fn rollbacks(&self) -> usize {
        self.state().rollbacks
    }

    pub fn offers_created(&self) -> usize {
        self.state().offers_created
    }

    /// Track ids (or kind names) passed to add_transceiver, in call order.
    pub fn applied_transceivers(&self) -> Vec<String> {
        self.state().applied.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state().remote.clone()
    }

    pub fn ice_state(&self) -> IceConnectionState {
        self.state().ice
    }

    pub fn is_closed(&self) -> bool {
        self.state().signaling == SignalingState::Closed
    }

    /// Tracks currently sent, ignoring muted or removed senders.
    pub fn sending(&self) -> Vec<MediaTrack> {
        self.state()
            .transceivers
            .iter()
            .filter(|t| t.direction.sends())
            .filter_map(|t| t.sender.clone())
            .collect()
    }

    pub fn stopped_receivers(&self) -> usize {
        self.state()
            .transceivers
            .iter()
            .filter(|t| t.receiver_stopped)
            .count()
    }

    pub fn set_ice_state(&self, ice: IceConnectionState) {
        self.state().ice = ice;
        self.emit(TransportEvent::IceConnectionStateChanged(ice));
    }

    /// Simulates the remote track ending on its own.
    pub fn end_remote_track(&self, track_id: &str) {
        let mut state = self.state();
        for transceiver in state.transceivers.iter_mut() {
            if transceiver.receiver.as_ref().is_some_and(|t| t.id == track_id) {
                transceiver.receiver_stopped = true;
            }
        }
        self.emit(TransportEvent::TrackEnded {
            track_id: track_id.to_string(),
        });
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn create_offer(&self) -> Result<SessionDescription, MedleyError> {
        let mut state = self.state();
        Self::ensure_open(&state)?;
        state.negotiation_pending = false;
        state.offers_created += 1;
        let mut used: BTreeSet<String> = state.transceivers.iter().filter_map(|t| t.mid.clone()).collect();
        let mut sections = Vec::new();
        for transceiver in &state.transceivers {
            let mid = match &transceiver.mid {
                Some(mid) => mid.clone(),
                None => {
                    let mid = Self::next_free_mid(&used);
                    used.insert(mid.clone());
                    mid
                }
            };
            sections.push(SdpSection {
                mid,
                kind: transceiver.kind,
                direction: transceiver.direction,
                track: transceiver.direction.sends().then(|| transceiver.sender.clone()).flatten(),
                streams: transceiver.streams.clone(),
                local: Some(transceiver.id.0),
            });
        }
        let body = SdpBody {
            sections,
            ice_restart: state.ice_restart,
        };
        Ok(SessionDescription::offer(encode_body(&body)?))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MedleyError> {
        let state = self.state();
        Self::ensure_open(&state)?;
        let Some(offer) = &state.pending_remote else {
            return Err(MedleyError::Transport("create answer without remote offer".into()));
        };
        let sections = offer
            .sections
            .iter()
            .filter_map(|offered| {
                let ours = state
                    .transceivers
                    .iter()
                    .find(|t| t.mid.as_deref() == Some(offered.mid.as_str()))?;
                let send = ours.direction.sends() && offered.direction.receives();
                let recv = ours.direction.receives() && offered.direction.sends();
                Some(SdpSection {
                    mid: offered.mid.clone(),
                    kind: offered.kind,
                    direction: direction_from(send, recv),
                    track: if send { ours.sender.clone() } else { None },
                    streams: ours.streams.clone(),
                    local: None,
                })
            })
            .collect();
        let body = SdpBody {
            sections,
            ice_restart: false,
        };
        Ok(SessionDescription::answer(encode_body(&body)?))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), MedleyError> {
        let mut state = self.state();
        Self::ensure_open(&state)?;
        match description.kind {
            SdpType::Offer => {
                if state.signaling != SignalingState::Stable && state.signaling != SignalingState::HaveLocalOffer {
                    return Err(MedleyError::Transport(format!(
                        "local offer in state {:?}",
                        state.signaling
                    )));
                }
                let body = parse_body(&description)?;
                for section in &body.sections {
                    let Some(local) = section.local else { continue };
                    if let Some(transceiver) = state
                        .transceivers
                        .iter_mut()
                        .find(|t| t.id.0 == local && t.mid.is_none())
                    {
                        transceiver.mid = Some(section.mid.clone());
                    }
                }
                state.pending_local = Some(body);
                state.local = Some(description);
                self.set_signaling(&mut state, SignalingState::HaveLocalOffer);
                self.emit_candidate(&mut state);
            }
            SdpType::Answer | SdpType::Pranswer => {
                if state.signaling != SignalingState::HaveRemoteOffer {
                    return Err(MedleyError::Transport(format!(
                        "local answer in state {:?}",
                        state.signaling
                    )));
                }
                if let Some(offer) = state.pending_remote.take() {
                    for section in &offer.sections {
                        if let Some(transceiver) = state
                            .transceivers
                            .iter_mut()
                            .find(|t| t.local && t.mid.as_deref() == Some(section.mid.as_str()))
                        {
                            transceiver.negotiated = Some(transceiver.direction);
                        }
                    }
                }
                state.local = Some(description);
                state.ice_restart = false;
                self.set_signaling(&mut state, SignalingState::Stable);
                self.emit_candidate(&mut state);
                self.maybe_connect(&mut state);
            }
            SdpType::Rollback => match state.signaling {
                SignalingState::HaveLocalOffer => {
                    if let Some(offer) = state.pending_local.take() {
                        for section in &offer.sections {
                            let Some(local) = section.local else { continue };
                            if let Some(transceiver) = state
                                .transceivers
                                .iter_mut()
                                .find(|t| t.id.0 == local && t.negotiated.is_none())
                            {
                                transceiver.mid = None;
                            }
                        }
                    }
                    state.rollbacks += 1;
                    self.set_signaling(&mut state, SignalingState::Stable);
                }
                SignalingState::HaveRemoteOffer => {
                    state.pending_remote = None;
                    state.rollbacks += 1;
                    self.set_signaling(&mut state, SignalingState::Stable);
                }
                other => {
                    return Err(MedleyError::Transport(format!("rollback in state {other:?}")));
                }
            },
        }
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), MedleyError> {
        let mut state = self.state();
        Self::ensure_open(&state)?;
        match description.kind {
            SdpType::Offer => {
                if state.signaling != SignalingState::Stable {
                    return Err(MedleyError::Transport(format!(
                        "remote offer in state {:?}",
                        state.signaling
                    )));
                }
                let body = parse_body(&description)?;
                for section in &body.sections {
                    let index = match state
                        .transceivers
                        .iter()
                        .position(|t| t.mid.as_deref() == Some(section.mid.as_str()))
                    {
                        Some(index) => index,
                        None => {
                            let id = TransceiverId(state.next_id);
                            state.next_id += 1;
                            state.transceivers.push(LoopbackTransceiver {
                                id,
                                mid: Some(section.mid.clone()),
                                kind: section.kind,
                                direction: Direction::Recvonly,
                                local: false,
                                negotiated: None,
                                sender: None,
                                receiver: None,
                                receiver_stopped: false,
                                streams: Vec::new(),
                            });
                            state.transceivers.len() - 1
                        }
                    };
                    let mut transceiver = state.transceivers[index].clone();
                    self.deliver(&mut transceiver, section);
                    state.transceivers[index] = transceiver;
                }
                state.pending_remote = Some(body);
                state.remote = Some(description);
                self.set_signaling(&mut state, SignalingState::HaveRemoteOffer);
            }
            SdpType::Answer | SdpType::Pranswer => {
                if state.signaling != SignalingState::HaveLocalOffer {
                    return Err(MedleyError::Transport(format!(
                        "remote answer in state {:?}",
                        state.signaling
                    )));
                }
                let body = parse_body(&description)?;
                for section in &body.sections {
                    if let Some(index) = state
                        .transceivers
                        .iter()
                        .position(|t| t.mid.as_deref() == Some(section.mid.as_str()))
                    {
                        let mut transceiver = state.transceivers[index].clone();
                        self.deliver(&mut transceiver, section);
                        state.transceivers[index] = transceiver;
                    }
                }
                if let Some(offer) = state.pending_local.take() {
                    for section in &offer.sections {
                        if let Some(transceiver) = state
                            .transceivers
                            .iter_mut()
                            .find(|t| t.local && t.mid.as_deref() == Some(section.mid.as_str()))
                        {
                            transceiver.negotiated = Some(section.direction);
                        }
                    }
                }
                state.remote = Some(description);
                state.ice_restart = false;
                self.set_signaling(&mut state, SignalingState::Stable);
                self.maybe_connect(&mut state);
            }
            SdpType::Rollback => {
                return Err(MedleyError::Transport("remote rollback is not a description".into()));
            }
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: Option<IceCandidate>) -> Result<(), MedleyError> {
        let mut state = self.state();
        Self::ensure_open(&state)?;
        if let Some(candidate) = candidate {
            state.remote_candidates.push(candidate);
            self.maybe_connect(&mut state);
        }
        Ok(())
    }

    fn add_transceiver(&self, track: TrackRef, init: TransceiverInit) -> Result<TransceiverId, MedleyError> {
        let mut state = self.state();
        Self::ensure_open(&state)?;
        let id = TransceiverId(state.next_id);
        state.next_id += 1;
        state.applied.push(match &track {
            TrackRef::Track(track) => track.id.clone(),
            TrackRef::Kind(kind) => kind.as_str().to_string(),
        });
        state.transceivers.push(LoopbackTransceiver {
            id,
            mid: None,
            kind: track.kind(),
            direction: init.direction,
            local: true,
            negotiated: None,
            sender: track.track().cloned(),
            receiver: None,
            receiver_stopped: false,
            streams: init.streams,
        });
        self.check_negotiation(&mut state);
        Ok(id)
    }

    fn remove_track(&self, transceiver: TransceiverId) -> Result<(), MedleyError> {
        let mut state = self.state();
        Self::ensure_open(&state)?;
        let entry = state
            .transceivers
            .iter_mut()
            .find(|t| t.id == transceiver)
            .ok_or_else(|| MedleyError::Transport(format!("unknown transceiver {}", transceiver.0)))?;
        entry.sender = None;
        Ok(())
    }

    fn replace_track(&self, transceiver: TransceiverId, track: Option<MediaTrack>) -> Result<(), MedleyError> {
        let mut state = self.state();
        Self::ensure_open(&state)?;
        let entry = state
            .transceivers
            .iter_mut()
            .find(|t| t.id == transceiver)
            .ok_or_else(|| MedleyError::Transport(format!("unknown transceiver {}", transceiver.0)))?;
        entry.sender = track;
        Ok(())
    }

    fn set_direction(&self, transceiver: TransceiverId, direction: Direction) -> Result<(), MedleyError> {
        let mut state = self.state();
        Self::ensure_open(&state)?;
        let entry = state
            .transceivers
            .iter_mut()
            .find(|t| t.id == transceiver)
            .ok_or_else(|| MedleyError::Transport(format!("unknown transceiver {}", transceiver.0)))?;
        entry.direction = direction;
        self.check_negotiation(&mut state);
        Ok(())
    }

    fn stop_receiver_track(&self, transceiver: TransceiverId) -> Result<(), MedleyError> {
        let mut state = self.state();
        let entry = state
            .transceivers
            .iter_mut()
            .find(|t| t.id == transceiver)
            .ok_or_else(|| MedleyError::Transport(format!("unknown transceiver {}", transceiver.0)))?;
        entry.receiver_stopped = true;
        Ok(())
    }

    fn transceivers(&self) -> Vec<TransceiverInfo> {
        self.state().transceivers.iter().map(LoopbackTransceiver::info).collect()
    }

    fn signaling_state(&self) -> SignalingState {
        self.state().signaling
    }

    fn restart_ice(&self) {
        let mut state = self.state();
        if state.signaling == SignalingState::Closed {
            return;
        }
        state.ice_restart = true;
        state.ice = IceConnectionState::Checking;
        self.check_negotiation(&mut state);
    }

    fn close(&self) {
        {
            let mut state = self.state();
            state.signaling = SignalingState::Closed;
            state.ice = IceConnectionState::Closed;
        }
        // Dropping the sender ends the owning session's event loop.
        self.events.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Hands out loopback transports and keeps them for inspection.
#[derive(Default)]
pub struct LoopbackFactory {
    transports: Mutex<Vec<(String, String, Arc<LoopbackTransport>)>>,
}

impl LoopbackFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created(&self) -> usize {
        self.transports.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Latest transport created for the (local name, peer) pair.
    pub fn transport(&self, name: &str, peer: &str) -> Option<Arc<LoopbackTransport>> {
        self.transports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .rev()
            .find(|(n, p, _)| n == name && p == peer)
            .map(|(_, _, transport)| transport.clone())
    }
}

impl TransportFactory for LoopbackFactory {
    fn create(&self, config: &SessionConfig) -> Result<(Arc<dyn Transport>, TransportEvents), MedleyError> {
        let (transport, events) = LoopbackTransport::new();
        self.transports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((config.name.clone(), config.peer.clone(), transport.clone()));
        Ok((transport, events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut TransportEvents) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn offer_answer_delivers_tracks_and_binds_mids() {
        let (a, mut a_events) = LoopbackTransport::new();
        let (b, mut b_events) = LoopbackTransport::new();
        let track = MediaTrack::with_id("cam", TrackKind::Video).with_meta("alice");
        a.add_transceiver(TrackRef::Track(track), TransceiverInit::send_only(vec!["s1".into()]))
            .unwrap();
        assert!(drain(&mut a_events).contains(&TransportEvent::NegotiationNeeded));

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        assert_eq!(a.transceivers()[0].mid.as_deref(), Some("0"));
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        assert_eq!(a.signaling_state(), SignalingState::Stable);
        assert_eq!(b.signaling_state(), SignalingState::Stable);
        let arrived = drain(&mut b_events).into_iter().find_map(|e| match e {
            TransportEvent::TrackArrived { track, streams, .. } => Some((track, streams)),
            _ => None,
        });
        let (track, streams) = arrived.unwrap();
        assert_eq!(track.id, "cam");
        assert_eq!(track.meta, None);
        assert_eq!(streams, vec!["s1".to_string()]);
        assert!(!drain(&mut a_events).contains(&TransportEvent::NegotiationNeeded));
    }

    #[tokio::test]
    async fn rollback_unassigns_fresh_mids_and_renegotiates() {
        let (a, mut a_events) = LoopbackTransport::new();
        a.add_transceiver(TrackRef::Kind(TrackKind::Audio), TransceiverInit::send_only(Vec::new()))
            .unwrap();
        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer).await.unwrap();
        drain(&mut a_events);

        a.set_local_description(SessionDescription::rollback()).await.unwrap();

        assert_eq!(a.rollbacks(), 1);
        assert_eq!(a.transceivers()[0].mid, None);
        let events = drain(&mut a_events);
        assert!(events.contains(&TransportEvent::SignalingStateChanged(SignalingState::Stable)));
        assert!(events.contains(&TransportEvent::NegotiationNeeded));
    }

    #[tokio::test]
    async fn remote_offer_is_refused_while_offering() {
        let (a, _a_events) = LoopbackTransport::new();
        let (b, _b_events) = LoopbackTransport::new();
        a.add_transceiver(TrackRef::Kind(TrackKind::Audio), TransceiverInit::send_only(Vec::new()))
            .unwrap();
        b.add_transceiver(TrackRef::Kind(TrackKind::Video), TransceiverInit::send_only(Vec::new()))
            .unwrap();
        let a_offer = a.create_offer().await.unwrap();
        a.set_local_description(a_offer).await.unwrap();
        let b_offer = b.create_offer().await.unwrap();
        assert!(a.set_remote_description(b_offer).await.is_err());
    }

    #[tokio::test]
    async fn closing_ends_the_event_stream() {
        let (a, mut events) = LoopbackTransport::new();
        a.close();
        assert!(events.recv().await.is_none());
        assert!(a.create_offer().await.is_err());
    }

    #[tokio::test]
    async fn bus_routes_by_receiver_and_announces_members() {
        let bus = LoopbackBus::new();
        let mut alice = bus.join("alice");
        let mut bob = bus.join("bob");

        let to_alice = alice.recv().await.unwrap();
        assert_eq!(to_alice.kind, MessageType::UserConnected);
        assert_eq!(to_alice.data, "bob");
        let to_bob = bob.recv().await.unwrap();
        assert_eq!(to_bob.data, "alice");

        bus.channel()
            .send(Envelope::new("bob", "alice", MessageType::Ice, serde_json::Value::Null))
            .unwrap();
        assert_eq!(alice.recv().await.unwrap().sender, "bob");
        bus.channel()
            .send(Envelope::new("bob", "nobody", MessageType::Ice, serde_json::Value::Null))
            .unwrap();

        bus.leave("bob");
        let left = alice.recv().await.unwrap();
        assert_eq!(left.kind, MessageType::UserDisconnected);
        assert_eq!(bus.sent_between("bob", "nobody", MessageType::Ice).len(), 1);
    }
}

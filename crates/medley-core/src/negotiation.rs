//! One negotiation session per (local, remote) pair.
//!
//! A [`PeerConnection`] owns its transport and serializes every input
//! (signaling envelope, transport notification, local media request)
//! through a single async lock, so each state transition completes before
//! the next input is looked at. Conflicts between simultaneous
//! renegotiations are resolved by the configured [`NegotiationPolicy`]:
//!
//! - `Rollback`: the yielding side discards its own offer and answers the
//!   remote one, the other side ignores the incoming offer.
//! - `SignaledLock`: every round is reserved with `lock:init` and granted
//!   with `lock:accept`; media changes requested meanwhile are queued and
//!   replayed in order once the session holds the lock.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::Value;
use tokio::sync::Mutex;

use crate::errors::MedleyError;
use crate::events::{ChangeKind, EventEmitter, EventListener, ListenerId, MediaChange, SessionEvent};
use crate::media::{MediaArgument, MediaSelector, MediaStream, MediaTrack, TrackRef};
use crate::settings::{NegotiationPolicy, SessionConfig};
use crate::signaling::{Envelope, MessageType, SignalingChannel, TrackMetaPayload};
use crate::transport::{
    IceCandidate, IceConnectionState, SdpType, SessionDescription, SignalingState,
    TransceiverId, TransceiverInfo, TransceiverInit, Transport, TransportEvent, TransportEvents,
    TransportFactory,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Stable,
    /// Local offer sent, answer outstanding.
    Offering,
    /// A round is reserved by either side (lock policy only).
    Locked,
    Closed,
}

/// A track received from the remote peer.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedTrack {
    pub track: MediaTrack,
    pub mid: Option<String>,
    pub transceiver: TransceiverId,
    pub streams: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum MediaOperation {
    Add { track: TrackRef, init: TransceiverInit },
    Remove(MediaSelector),
}

struct SessionState {
    negotiation: NegotiationState,
    lock_queued: bool,
    queued: VecDeque<MediaOperation>,
    added: Vec<TrackRef>,
    received: Vec<ReceivedTrack>,
    streams: BTreeMap<String, Vec<String>>,
    meta_cache: HashMap<String, String>,
    unbound: Vec<TransceiverId>,
    muted: HashMap<TransceiverId, MediaTrack>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            negotiation: NegotiationState::Stable,
            lock_queued: false,
            queued: VecDeque::new(),
            added: Vec::new(),
            received: Vec::new(),
            streams: BTreeMap::new(),
            meta_cache: HashMap::new(),
            unbound: Vec::new(),
            muted: HashMap::new(),
        }
    }
}

pub struct PeerConnection {
    id: String,
    name: String,
    peer: String,
    policy: NegotiationPolicy,
    yielding: bool,
    verbose: bool,
    signaler: Arc<dyn SignalingChannel>,
    transport: Arc<dyn Transport>,
    events: StdMutex<Option<TransportEvents>>,
    state: Mutex<SessionState>,
    emitter: EventEmitter<SessionEvent>,
    closed: AtomicBool,
}

impl PeerConnection {
    pub fn new(
        config: SessionConfig,
        signaler: Arc<dyn SignalingChannel>,
        factory: &dyn TransportFactory,
    ) -> Result<Self, MedleyError> {
        let (transport, events) = factory.create(&config)?;
        let id = config
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let yielding = config.is_yielding();
        let session = Self {
            id,
            name: config.name,
            peer: config.peer,
            policy: config.policy,
            yielding,
            verbose: config.verbose,
            signaler,
            transport,
            events: StdMutex::new(Some(events)),
            state: Mutex::new(SessionState::new()),
            emitter: EventEmitter::new(),
            closed: AtomicBool::new(false),
        };
        session.step(format_args!(
            "created session with {:?} negotiation, yielding={}",
            session.policy, session.yielding
        ));
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> NegotiationPolicy {
        self.policy
    }

    pub fn is_yielding(&self) -> bool {
        self.yielding
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn add_listener(&self, listener: Arc<dyn EventListener<SessionEvent>>) -> ListenerId {
        self.emitter.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.emitter.remove_listener(id)
    }

    /// Spawns the loop consuming transport notifications. Must be called once.
    pub fn start(self: &Arc<Self>) -> Result<(), MedleyError> {
        let events = self
            .events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| MedleyError::AlreadyStarted(self.id.clone()))?;
        let session = self.clone();
        tokio::spawn(async move {
            session.event_loop(events).await;
        });
        Ok(())
    }

    async fn event_loop(self: Arc<Self>, mut events: TransportEvents) {
        while let Some(event) = events.recv().await {
            self.handle_transport_event(event).await;
        }
        self.step(format_args!("transport event loop ended"));
    }

    pub async fn negotiation_state(&self) -> NegotiationState {
        self.state.lock().await.negotiation
    }

    /// Non-ended tracks received from the peer.
    pub async fn tracks(&self) -> Vec<ReceivedTrack> {
        self.state.lock().await.received.clone()
    }

    /// Streams that still have at least one live track.
    pub async fn streams(&self) -> Vec<MediaStream> {
        let state = self.state.lock().await;
        state
            .streams
            .iter()
            .map(|(id, track_ids)| MediaStream {
                id: id.clone(),
                tracks: state
                    .received
                    .iter()
                    .filter(|r| track_ids.contains(&r.track.id))
                    .map(|r| r.track.clone())
                    .collect(),
                meta: None,
            })
            .collect()
    }

    pub async fn added_tracks(&self) -> Vec<TrackRef> {
        self.state.lock().await.added.clone()
    }

    /// Number of media operations waiting for the lock.
    pub async fn queued_operations(&self) -> usize {
        self.state.lock().await.queued.len()
    }

    pub async fn add_media(&self, media: MediaArgument) -> Result<(), MedleyError> {
        let resolved = media.resolve()?;
        let mut state = self.state.lock().await;
        if state.negotiation == NegotiationState::Closed {
            self.step(format_args!("add_media on closed session dropped"));
            return Ok(());
        }
        match self.policy {
            NegotiationPolicy::Rollback => {
                for media in resolved {
                    let init = TransceiverInit::send_only(media.streams);
                    self.add_track_to_transport(&mut state, media.track, init);
                }
            }
            NegotiationPolicy::SignaledLock => {
                self.request_lock(&mut state);
                for media in resolved {
                    let init = TransceiverInit::send_only(media.streams);
                    state.queued.push_back(MediaOperation::Add {
                        track: media.track,
                        init,
                    });
                }
            }
        }
        Ok(())
    }

    pub async fn remove_media(&self, selector: MediaSelector) {
        let mut state = self.state.lock().await;
        if state.negotiation == NegotiationState::Closed {
            self.step(format_args!("remove_media on closed session dropped"));
            return;
        }
        match self.policy {
            NegotiationPolicy::Rollback => self.remove_track_from_transport(&mut state, &selector),
            NegotiationPolicy::SignaledLock => {
                self.request_lock(&mut state);
                state.queued.push_back(MediaOperation::Remove(selector));
            }
        }
    }

    /// Swaps the sent track on every matching transceiver. No renegotiation.
    pub async fn replace_track(&self, selector: MediaSelector, replacement: Option<MediaTrack>) {
        let mut state = self.state.lock().await;
        if state.negotiation == NegotiationState::Closed {
            return;
        }
        if let Some(pos) = state.added.iter().position(|t| selector.matches_ref(t)) {
            let replacement = replacement.clone().map(TrackRef::Track);
            match replacement {
                Some(track)
                    if !state
                        .added
                        .iter()
                        .enumerate()
                        .any(|(i, t)| i != pos && t.same_as(&track)) =>
                {
                    state.added[pos] = track
                }
                _ => {
                    state.added.remove(pos);
                }
            }
        }
        for transceiver in self.transport.transceivers() {
            if !transceiver.direction.sends() || !sender_matches(&transceiver, &selector) {
                continue;
            }
            if let Err(e) = self
                .transport
                .replace_track(transceiver.id, replacement.clone())
            {
                tracing::warn!(session = %self.id, "replace track failed: {e}");
                continue;
            }
            state.muted.remove(&transceiver.id);
            if let (Some(track), Some(mid)) = (&replacement, &transceiver.mid) {
                self.send_meta(mid, track.meta.clone().unwrap_or_default());
            }
        }
    }

    /// Swaps the sent track for nothing (or back) without renegotiation.
    pub async fn mute_media(&self, selector: MediaSelector, muted: bool) {
        let mut state = self.state.lock().await;
        if state.negotiation == NegotiationState::Closed {
            return;
        }
        for transceiver in self.transport.transceivers() {
            let current = transceiver
                .sender
                .as_ref()
                .or_else(|| state.muted.get(&transceiver.id));
            let matched = match (&selector, current) {
                (MediaSelector::All, _) => true,
                (MediaSelector::Kind(kind), _) => transceiver.kind == *kind,
                (MediaSelector::Track(id), Some(track)) => track.id == *id,
                (MediaSelector::Track(_), None) => false,
            };
            if !matched {
                continue;
            }
            if muted {
                if state.muted.contains_key(&transceiver.id) {
                    continue;
                }
                if let Some(track) = transceiver.sender.clone() {
                    match self.transport.replace_track(transceiver.id, None) {
                        Ok(()) => {
                            state.muted.insert(transceiver.id, track);
                        }
                        Err(e) => tracing::warn!(session = %self.id, "mute failed: {e}"),
                    }
                }
            } else if let Some(track) = state.muted.remove(&transceiver.id) {
                if let Err(e) = self.transport.replace_track(transceiver.id, Some(track)) {
                    tracing::warn!(session = %self.id, "unmute failed: {e}");
                }
            }
        }
    }

    /// Sends a close notice and tears the transport down.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if state.negotiation == NegotiationState::Closed {
            return;
        }
        self.send(MessageType::ConnectionClose, Value::from("immediately"));
        self.shut_down(&mut state);
    }

    pub async fn handle_envelope(&self, envelope: &Envelope) {
        if envelope.sender != self.peer {
            return;
        }
        let mut state = self.state.lock().await;
        if state.negotiation == NegotiationState::Closed {
            self.step(format_args!("{} ignored on closed session", envelope.kind.as_str()));
            return;
        }
        match &envelope.kind {
            MessageType::Sdp => match serde_json::from_value::<SessionDescription>(envelope.data.clone()) {
                Ok(description) => self.handle_sdp(&mut state, description).await,
                Err(e) => tracing::warn!(session = %self.id, "malformed sdp payload: {e}"),
            },
            MessageType::Ice => {
                let candidate = match &envelope.data {
                    Value::Null => None,
                    data => match serde_json::from_value::<IceCandidate>(data.clone()) {
                        Ok(candidate) => Some(candidate),
                        Err(e) => {
                            tracing::warn!(session = %self.id, "malformed ice payload: {e}");
                            return;
                        }
                    },
                };
                if let Err(e) = self.transport.add_ice_candidate(candidate).await {
                    tracing::warn!(session = %self.id, "failed to add ice candidate: {e}");
                }
            }
            MessageType::ConnectionClose => self.handle_remote_close(&mut state),
            MessageType::ReceiverStop => match envelope.data.as_str() {
                Some(mid) => self.stop_receiver(&mut state, mid),
                None => tracing::warn!(session = %self.id, "receiver:stop without mid"),
            },
            MessageType::TrackMeta => {
                match serde_json::from_value::<TrackMetaPayload>(envelope.data.clone()) {
                    Ok(payload) => self.change_meta(&mut state, payload.mid, payload.meta),
                    Err(e) => tracing::warn!(session = %self.id, "malformed track:meta payload: {e}"),
                }
            }
            MessageType::LockInit if self.policy == NegotiationPolicy::SignaledLock => {
                self.handle_lock_init(&mut state)
            }
            MessageType::LockAccept if self.policy == NegotiationPolicy::SignaledLock => {
                self.handle_lock_accept(&mut state).await
            }
            MessageType::LockRelease if self.policy == NegotiationPolicy::SignaledLock => {
                self.handle_lock_release(&mut state)
            }
            other => {
                self.step(format_args!("no handler for message type {}", other.as_str()));
            }
        }
    }

    pub async fn handle_transport_event(&self, event: TransportEvent) {
        let mut state = self.state.lock().await;
        if state.negotiation == NegotiationState::Closed {
            return;
        }
        match event {
            TransportEvent::IceCandidate(Some(candidate)) => match serde_json::to_value(&candidate) {
                Ok(data) => self.send(MessageType::Ice, data),
                Err(e) => tracing::warn!(session = %self.id, "failed to encode candidate: {e}"),
            },
            TransportEvent::IceCandidate(None) => {}
            TransportEvent::IceConnectionStateChanged(ice) => self.handle_ice_change(&mut state, ice),
            TransportEvent::SignalingStateChanged(SignalingState::Stable) => {
                self.sync_new_transceivers(&mut state)
            }
            TransportEvent::SignalingStateChanged(_) => {}
            TransportEvent::TrackArrived {
                track,
                streams,
                transceiver,
            } => self.handle_incoming_track(&mut state, track, streams, transceiver),
            TransportEvent::TrackEnded { track_id } => self.end_received_track(&mut state, &track_id),
            TransportEvent::NegotiationNeeded => {
                if self.policy == NegotiationPolicy::Rollback {
                    self.start_handshake(&mut state).await;
                }
            }
        }
    }

    // -- offer / answer ----------------------------------------------------

    async fn start_handshake(&self, state: &mut SessionState) {
        self.step(format_args!("negotiation is needed"));
        let offer = match self.transport.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                tracing::error!(session = %self.id, "create offer failed: {e}");
                return;
            }
        };
        if self.transport.signaling_state() != SignalingState::Stable {
            self.step(format_args!("signaling not stable, offer abandoned"));
            return;
        }
        if let Err(e) = self.transport.set_local_description(offer.clone()).await {
            tracing::error!(session = %self.id, "set local offer failed: {e}");
            return;
        }
        if self.policy == NegotiationPolicy::Rollback {
            state.negotiation = NegotiationState::Offering;
        }
        self.send_description(&offer);
    }

    async fn handle_sdp(&self, state: &mut SessionState, description: SessionDescription) {
        self.step(format_args!("received sdp {:?}", description.kind));
        let result = match self.policy {
            NegotiationPolicy::Rollback => self.handle_sdp_with_rollback(state, description).await,
            NegotiationPolicy::SignaledLock => self.handle_sdp_with_lock(state, description).await,
        };
        if let Err(e) = result {
            tracing::error!(session = %self.id, "sdp handling failed: {e}");
        }
    }

    async fn handle_sdp_with_rollback(
        &self,
        state: &mut SessionState,
        description: SessionDescription,
    ) -> Result<(), MedleyError> {
        let collision = state.negotiation == NegotiationState::Offering
            || self.transport.signaling_state() != SignalingState::Stable;
        let is_offer = description.kind == SdpType::Offer;
        if is_offer && collision {
            if !self.yielding {
                self.step(format_args!("ignored offer from {} due to glare", self.peer));
                return Ok(());
            }
            self.step(format_args!("handles glare with {} by yielding", self.peer));
            self.transport
                .set_local_description(SessionDescription::rollback())
                .await?;
            state.negotiation = NegotiationState::Stable;
        }
        self.transport.set_remote_description(description).await?;
        if is_offer {
            self.answer().await?;
        }
        state.negotiation = NegotiationState::Stable;
        Ok(())
    }

    async fn handle_sdp_with_lock(
        &self,
        state: &mut SessionState,
        description: SessionDescription,
    ) -> Result<(), MedleyError> {
        let is_offer = description.kind == SdpType::Offer;
        self.transport.set_remote_description(description).await?;
        if is_offer {
            self.answer().await?;
            self.step(format_args!("answered received offer"));
            return Ok(());
        }
        self.send(MessageType::LockRelease, Value::Null);
        self.step(format_args!("unlocks session after complete offer-answer exchange"));
        self.unlock(state);
        Ok(())
    }

    async fn answer(&self) -> Result<(), MedleyError> {
        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(answer.clone()).await?;
        self.send_description(&answer);
        Ok(())
    }

    // -- signaled lock -----------------------------------------------------

    fn request_lock(&self, state: &mut SessionState) {
        if state.negotiation == NegotiationState::Locked {
            state.lock_queued = true;
            self.step(format_args!("already locked, queue next exchange"));
            return;
        }
        state.negotiation = NegotiationState::Locked;
        self.step(format_args!("locked session, waiting for accept"));
        self.send(MessageType::LockInit, Value::Null);
        self.emitter.emit(SessionEvent::Locked);
    }

    fn handle_lock_init(&self, state: &mut SessionState) {
        if state.negotiation == NegotiationState::Locked {
            if !self.yielding {
                self.step(format_args!("not yielding, wait for accept"));
                return;
            }
            self.step(format_args!("yields, queue own media changes"));
            state.lock_queued = true;
        }
        state.negotiation = NegotiationState::Locked;
        self.step(format_args!("accepts lock"));
        self.emitter.emit(SessionEvent::Locked);
        self.send(MessageType::LockAccept, Value::Null);
    }

    async fn handle_lock_accept(&self, state: &mut SessionState) {
        self.emitter.emit(SessionEvent::Accepted);
        state.lock_queued = false;
        while let Some(operation) = state.queued.pop_front() {
            match operation {
                MediaOperation::Add { track, init } => self.add_track_to_transport(state, track, init),
                MediaOperation::Remove(selector) => self.remove_track_from_transport(state, &selector),
            }
        }
        self.step(format_args!("initiates offer-answer exchange"));
        let offer = match self.transport.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                tracing::error!(session = %self.id, "create offer failed: {e}");
                return;
            }
        };
        if let Err(e) = self.transport.set_local_description(offer.clone()).await {
            tracing::error!(session = %self.id, "set local offer failed: {e}");
            return;
        }
        self.send_description(&offer);
    }

    fn handle_lock_release(&self, state: &mut SessionState) {
        self.step(format_args!("unlocking session"));
        self.unlock(state);
    }

    fn unlock(&self, state: &mut SessionState) {
        state.negotiation = NegotiationState::Stable;
        self.emitter.emit(SessionEvent::Unlocked);
        if state.lock_queued {
            self.request_lock(state);
        }
    }

    // -- local media -------------------------------------------------------

    fn add_track_to_transport(&self, state: &mut SessionState, track: TrackRef, init: TransceiverInit) {
        self.step(format_args!("add {:?} track to session", track.kind()));
        state.added.push(track.clone());
        match self.transport.add_transceiver(track, init) {
            Ok(id) => state.unbound.push(id),
            Err(e) => tracing::warn!(session = %self.id, "add transceiver failed: {e}"),
        }
    }

    fn remove_track_from_transport(&self, state: &mut SessionState, selector: &MediaSelector) {
        state.added.retain(|track| !selector.matches_ref(track));
        let mut removed = 0;
        for transceiver in self.transport.transceivers() {
            // Only our own sending transceivers are candidates.
            if !transceiver.direction.sends() {
                continue;
            }
            let stashed = state.muted.get(&transceiver.id);
            let matched = sender_matches(&transceiver, selector)
                || stashed.is_some_and(|track| selector.matches(track));
            if !matched {
                continue;
            }
            if let Err(e) = self.transport.remove_track(transceiver.id) {
                tracing::warn!(session = %self.id, "remove track failed: {e}");
                continue;
            }
            let direction = transceiver.direction.without_send();
            if let Err(e) = self.transport.set_direction(transceiver.id, direction) {
                tracing::warn!(session = %self.id, "direction change failed: {e}");
            }
            state.muted.remove(&transceiver.id);
            state.unbound.retain(|id| *id != transceiver.id);
            if let Some(mid) = transceiver.mid {
                self.send(MessageType::ReceiverStop, Value::from(mid));
            }
            removed += 1;
        }
        self.step(format_args!("removed {removed} tracks from session"));
    }

    /// Sends pending metadata for transceivers bound since the last stable state.
    fn sync_new_transceivers(&self, state: &mut SessionState) {
        if self.transport.signaling_state() != SignalingState::Stable {
            return;
        }
        let transceivers = self.transport.transceivers();
        state.unbound.retain(|id| {
            let Some(bound) = transceivers.iter().find(|t| t.id == *id) else {
                return false;
            };
            let Some(mid) = &bound.mid else {
                return true;
            };
            if let Some(meta) = bound.sender.as_ref().and_then(|t| t.meta.clone()) {
                self.send_meta(mid, meta);
            }
            false
        });
    }

    // -- remote media ------------------------------------------------------

    fn handle_incoming_track(
        &self,
        state: &mut SessionState,
        mut track: MediaTrack,
        streams: Vec<String>,
        transceiver: TransceiverId,
    ) {
        if state.received.iter().any(|r| r.track.id == track.id) {
            return;
        }
        let mid = self
            .transport
            .transceivers()
            .into_iter()
            .find(|t| t.id == transceiver)
            .and_then(|t| t.mid);
        if let Some(meta) = mid.as_ref().and_then(|mid| state.meta_cache.remove(mid)) {
            track.meta = Some(meta);
        }
        self.step(format_args!("received {:?} track {}", track.kind, track.id));
        self.emitter.emit(SessionEvent::TrackAdded {
            track: track.clone(),
            mid: mid.clone(),
        });
        for stream in &streams {
            let members = state.streams.entry(stream.clone()).or_default();
            let is_new = members.is_empty();
            members.push(track.id.clone());
            if is_new {
                self.emitter.emit(SessionEvent::StreamAdded {
                    stream_id: stream.clone(),
                    track: track.clone(),
                });
            }
        }
        state.received.push(ReceivedTrack {
            track: track.clone(),
            mid: mid.clone(),
            transceiver,
            streams,
        });
        self.emitter.emit(SessionEvent::MediaChanged(MediaChange {
            change: ChangeKind::Added,
            track,
            peer: self.peer.clone(),
            mid,
        }));
    }

    /// Fires the removal events of a received track. Later calls for the
    /// same track find nothing and do nothing.
    fn end_received_track(&self, state: &mut SessionState, track_id: &str) {
        let Some(pos) = state.received.iter().position(|r| r.track.id == track_id) else {
            return;
        };
        let received = state.received.remove(pos);
        self.emitter.emit(SessionEvent::MediaChanged(MediaChange {
            change: ChangeKind::Removed,
            track: received.track.clone(),
            peer: self.peer.clone(),
            mid: received.mid.clone(),
        }));
        self.emitter.emit(SessionEvent::TrackRemoved {
            track: received.track.clone(),
            mid: received.mid.clone(),
        });
        for stream in &received.streams {
            let Some(members) = state.streams.get_mut(stream) else {
                continue;
            };
            members.retain(|id| id != track_id);
            if members.is_empty() {
                state.streams.remove(stream);
                self.emitter.emit(SessionEvent::StreamRemoved {
                    stream_id: stream.clone(),
                });
            }
        }
    }

    /// The receive side cannot be torn down independently, so the track is
    /// stopped and its end is raised here.
    fn stop_receiver(&self, state: &mut SessionState, mid: &str) {
        let stopped: Vec<(TransceiverId, MediaTrack)> = self
            .transport
            .transceivers()
            .into_iter()
            .filter(|t| t.mid.as_deref() == Some(mid))
            .filter_map(|t| t.receiver.map(|track| (t.id, track)))
            .collect();
        for (transceiver, track) in stopped {
            if let Err(e) = self.transport.stop_receiver_track(transceiver) {
                tracing::warn!(session = %self.id, "stop receiver failed: {e}");
            }
            self.end_received_track(state, &track.id);
        }
    }

    fn change_meta(&self, state: &mut SessionState, mid: String, meta: String) {
        self.step(format_args!("meta of track bound to {mid} changes to {meta}"));
        if let Some(received) = state
            .received
            .iter_mut()
            .find(|r| r.mid.as_deref() == Some(mid.as_str()))
        {
            received.track.meta = Some(meta);
            let track = received.track.clone();
            self.emitter.emit(SessionEvent::MetaChanged { track, mid });
            return;
        }
        state.meta_cache.insert(mid, meta);
    }

    // -- lifecycle ---------------------------------------------------------

    fn handle_ice_change(&self, state: &mut SessionState, ice: IceConnectionState) {
        match ice {
            IceConnectionState::Disconnected => {
                tracing::info!(session = %self.id, peer = %self.peer, "ice disconnected, closing session");
                self.shut_down(state);
            }
            IceConnectionState::Failed => {
                tracing::info!(session = %self.id, peer = %self.peer, "ice failed, restarting");
                self.transport.restart_ice();
                if self.policy == NegotiationPolicy::SignaledLock {
                    self.request_lock(state);
                }
            }
            _ => {}
        }
    }

    fn handle_remote_close(&self, state: &mut SessionState) {
        self.step(format_args!("session closing down on peer request"));
        let received: Vec<ReceivedTrack> = state.received.clone();
        for track in received {
            if let Err(e) = self.transport.stop_receiver_track(track.transceiver) {
                tracing::warn!(session = %self.id, "stop receiver failed: {e}");
            }
            self.end_received_track(state, &track.track.id);
        }
        self.shut_down(state);
    }

    fn shut_down(&self, state: &mut SessionState) {
        self.transport.close();
        state.negotiation = NegotiationState::Closed;
        state.queued.clear();
        state.lock_queued = false;
        state.unbound.clear();
        self.closed.store(true, Ordering::SeqCst);
        tracing::info!(session = %self.id, peer = %self.peer, "session closed");
        self.emitter.emit(SessionEvent::Closed);
    }

    // -- signaling helpers -------------------------------------------------

    fn send(&self, kind: MessageType, data: Value) {
        let envelope = Envelope::new(self.name.clone(), self.peer.clone(), kind, data);
        if let Err(e) = self.signaler.send(envelope) {
            tracing::warn!(session = %self.id, peer = %self.peer, "signaling send failed: {e}");
        }
    }

    fn send_description(&self, description: &SessionDescription) {
        match serde_json::to_value(description) {
            Ok(data) => self.send(MessageType::Sdp, data),
            Err(e) => tracing::error!(session = %self.id, "failed to encode description: {e}"),
        }
    }

    fn send_meta(&self, mid: &str, meta: String) {
        let payload = TrackMetaPayload {
            mid: mid.to_string(),
            meta,
        };
        match serde_json::to_value(payload) {
            Ok(data) => self.send(MessageType::TrackMeta, data),
            Err(e) => tracing::warn!(session = %self.id, "failed to encode track meta: {e}"),
        }
    }

    fn step(&self, message: std::fmt::Arguments<'_>) {
        if self.verbose {
            tracing::info!(session = %self.id, peer = %self.peer, "{message}");
        } else {
            tracing::debug!(session = %self.id, peer = %self.peer, "{message}");
        }
    }
}

fn sender_matches(transceiver: &TransceiverInfo, selector: &MediaSelector) -> bool {
    match (selector, &transceiver.sender) {
        (MediaSelector::All, _) => true,
        (MediaSelector::Kind(kind), _) => transceiver.kind == *kind,
        (MediaSelector::Track(id), Some(track)) => track.id == *id,
        (MediaSelector::Track(_), None) => false,
    }
}

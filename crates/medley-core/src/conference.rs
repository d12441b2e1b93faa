//! Topology coordinator.
//!
//! A [`Conference`] owns the mesh registry plus one session towards the SFU
//! and one towards the MCU. Outgoing media always goes through the handler
//! of the active architecture; the display model only ever holds tracks of
//! that architecture. Switches are requested through the switch server and
//! applied when its `architecture:switch` notice comes back.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use futures_util::future::join;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};

use crate::architecture::{ArchitectureSelector, Topology};
use crate::errors::MedleyError;
use crate::events::{ConferenceEvent, EventEmitter, EventListener, ListenerId, RegistryEvent, SessionEvent};
use crate::media::{MediaArgument, MediaSelector, MediaStream, MediaTrack};
use crate::negotiation::PeerConnection;
use crate::participants::ConnectionManager;
use crate::settings::ConferenceConfig;
use crate::signaling::{Envelope, MessageType, SignalingChannel};
use crate::topology::TopologyHandler;
use crate::transport::TransportFactory;

/// Owner slot used for the mixed stream of the MCU.
pub const MIXED_OWNER: &str = "mcu";

/// One track shown to the local user.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayedTrack {
    pub owner: String,
    pub track: MediaTrack,
    /// Architecture whose handler delivered the track.
    pub source: Topology,
}

/// Per-owner slots holding at most one track of each kind.
struct Display {
    active: Topology,
    slots: BTreeMap<String, Vec<MediaTrack>>,
}

impl Display {
    fn new(active: Topology) -> Self {
        Self {
            active,
            slots: BTreeMap::new(),
        }
    }

    fn reset(&mut self, active: Topology) {
        self.active = active;
        self.slots.clear();
    }

    fn show(&mut self, owner: &str, track: MediaTrack, source: Topology) -> bool {
        if source != self.active {
            return false;
        }
        if self.slots.get(owner).is_some_and(|slot| slot.contains(&track)) {
            return false;
        }
        // A track is shown under one owner only.
        for (other, slot) in self.slots.iter_mut() {
            if other != owner {
                slot.retain(|t| t.id != track.id);
            }
        }
        self.slots.retain(|other, slot| other == owner || !slot.is_empty());
        let slot = self.slots.entry(owner.to_string()).or_default();
        slot.retain(|t| t.kind != track.kind && t.id != track.id);
        slot.push(track);
        true
    }

    fn hide_track(&mut self, track_id: &str, source: Topology) -> bool {
        if source != self.active {
            return false;
        }
        let mut changed = false;
        for slot in self.slots.values_mut() {
            let before = slot.len();
            slot.retain(|t| t.id != track_id);
            changed |= slot.len() != before;
        }
        self.slots.retain(|_, slot| !slot.is_empty());
        changed
    }

    fn hide_matching(&mut self, owner: &str, selector: &MediaSelector) -> bool {
        let Some(slot) = self.slots.get_mut(owner) else {
            return false;
        };
        let before = slot.len();
        slot.retain(|t| !selector.matches(t));
        let changed = slot.len() != before;
        if slot.is_empty() {
            self.slots.remove(owner);
        }
        changed
    }

    fn hide_owner(&mut self, owner: &str) -> bool {
        self.slots.remove(owner).is_some()
    }

    fn tracks(&self) -> Vec<DisplayedTrack> {
        self.slots
            .iter()
            .flat_map(|(owner, tracks)| {
                tracks.iter().map(|track| DisplayedTrack {
                    owner: owner.clone(),
                    track: track.clone(),
                    source: self.active,
                })
            })
            .collect()
    }
}

/// Display state shared with the handler listeners.
#[derive(Clone)]
struct DisplayHandle {
    display: Arc<StdMutex<Display>>,
    emitter: EventEmitter<ConferenceEvent>,
}

impl DisplayHandle {
    fn lock(&self) -> MutexGuard<'_, Display> {
        self.display.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn active(&self) -> Topology {
        self.lock().active
    }

    /// Runs `change` and announces the result when it touched the display.
    fn update(&self, change: impl FnOnce(&mut Display) -> bool) {
        let changed = change(&mut self.lock());
        if changed {
            self.emitter.emit(ConferenceEvent::DisplayChanged);
        }
    }
}

/// Serialized by the turn lock: media operations and switches never interleave.
struct Turn {
    added_media: Vec<MediaArgument>,
}

pub struct Conference {
    config: ConferenceConfig,
    signaler: Arc<dyn SignalingChannel>,
    mesh: Arc<ConnectionManager>,
    sfu: Arc<PeerConnection>,
    mcu: Arc<PeerConnection>,
    selector: StdMutex<ArchitectureSelector>,
    turn: Mutex<Turn>,
    display: DisplayHandle,
    emitter: EventEmitter<ConferenceEvent>,
    closed: Arc<AtomicBool>,
}

impl Conference {
    pub fn new(
        config: ConferenceConfig,
        signaler: Arc<dyn SignalingChannel>,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self, MedleyError> {
        let selector = ArchitectureSelector::new(config.architectures.clone(), config.architecture)?;
        // Servers always yield, so the client side of their sessions never does.
        let sfu = Arc::new(PeerConnection::new(
            config.session(&config.sfu_peer).with_yielding(false),
            signaler.clone(),
            factory.as_ref(),
        )?);
        let mcu = Arc::new(PeerConnection::new(
            config.session(&config.mcu_peer).with_yielding(false),
            signaler.clone(),
            factory.as_ref(),
        )?);
        let mesh = Arc::new(ConnectionManager::new(config.clone(), signaler.clone(), factory));
        let emitter = EventEmitter::new();
        let closed = Arc::new(AtomicBool::new(false));
        let display = DisplayHandle {
            display: Arc::new(StdMutex::new(Display::new(selector.current()))),
            emitter: emitter.clone(),
        };

        mesh.add_listener(Self::mesh_listener(display.clone(), emitter.clone()));
        sfu.add_listener(Self::server_listener(display.clone(), closed.clone(), Topology::Sfu));
        mcu.add_listener(Self::server_listener(display.clone(), closed.clone(), Topology::Mcu));

        Ok(Self {
            config,
            signaler,
            mesh,
            sfu,
            mcu,
            selector: StdMutex::new(selector),
            turn: Mutex::new(Turn {
                added_media: Vec::new(),
            }),
            display,
            emitter,
            closed,
        })
    }

    /// Starts the server sessions and shows what the initial architecture
    /// already delivers.
    pub async fn start(&self) -> Result<(), MedleyError> {
        self.sfu.start()?;
        self.mcu.start()?;
        let current = self.architecture();
        tracing::info!(name = %self.config.name, "conference starts with {current}");
        let _turn = self.turn.lock().await;
        self.rebuild_display(current, &[]).await;
        Ok(())
    }

    /// Pumps inbound envelopes in arrival order until the channel closes.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(envelope) = inbound.recv().await {
            self.handle_envelope(&envelope).await;
        }
        tracing::info!(name = %self.config.name, "conference inbound channel closed");
    }

    pub fn add_listener(&self, listener: Arc<dyn EventListener<ConferenceEvent>>) -> ListenerId {
        self.emitter.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.emitter.remove_listener(id)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn selector(&self) -> MutexGuard<'_, ArchitectureSelector> {
        self.selector.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn architecture(&self) -> Topology {
        self.selector().current()
    }

    pub fn architectures(&self) -> Vec<Topology> {
        self.selector().architectures().to_vec()
    }

    pub fn next_architecture_value(&self) -> Topology {
        self.selector().next()
    }

    pub fn previous_architecture_value(&self) -> Topology {
        self.selector().previous()
    }

    /// Current conference members, as known by the mesh registry.
    pub fn members(&self) -> Vec<String> {
        self.mesh.users()
    }

    pub fn mesh(&self) -> &Arc<ConnectionManager> {
        &self.mesh
    }

    pub fn sfu(&self) -> &Arc<PeerConnection> {
        &self.sfu
    }

    pub fn mcu(&self) -> &Arc<PeerConnection> {
        &self.mcu
    }

    /// True once closed, or while the handler of the active architecture
    /// has lost its connection.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.handler(self.architecture()).is_closed()
    }

    fn handler(&self, architecture: Topology) -> Arc<dyn TopologyHandler> {
        match architecture {
            Topology::Mesh => self.mesh.clone(),
            Topology::Sfu => self.sfu.clone(),
            Topology::Mcu => self.mcu.clone(),
        }
    }

    // -- switching ---------------------------------------------------------

    /// Asks the switch server to move every member to `name`. The switch
    /// itself happens when the server's notice arrives.
    pub fn switch_architecture(&self, name: &str) -> Result<(), MedleyError> {
        let architecture: Topology = name.parse()?;
        if !self.selector().architectures().contains(&architecture) {
            return Err(MedleyError::UnknownArchitecture(name.to_string()));
        }
        self.step(format_args!("request switching to architecture {architecture}"));
        self.signaler.send(Envelope::new(
            self.config.name.clone(),
            self.config.switch_server.clone(),
            MessageType::ArchitectureSwitch,
            Value::from(architecture.as_str()),
        ))
    }

    pub fn next_architecture(&self) -> Result<(), MedleyError> {
        self.switch_architecture(self.next_architecture_value().as_str())
    }

    pub fn previous_architecture(&self) -> Result<(), MedleyError> {
        self.switch_architecture(self.previous_architecture_value().as_str())
    }

    async fn apply_switch(&self, next: Topology) -> Result<(), MedleyError> {
        let turn = self.turn.lock().await;
        let previous = self.architecture();
        if previous == next {
            self.step(format_args!("already using {next}, switch ignored"));
            return Ok(());
        }
        self.selector().switch_to(next)?;
        tracing::info!(name = %self.config.name, "switching architecture {previous} -> {next}");

        let handler = self.handler(next);
        for media in &turn.added_media {
            if let Err(e) = handler.add_media(media.clone()).await {
                tracing::warn!("could not move media to {next}: {e}");
            }
        }
        self.rebuild_display(next, &turn.added_media).await;
        self.handler(previous).remove_media(MediaSelector::All).await;

        self.emitter
            .emit(ConferenceEvent::ArchitectureSwitched { next, previous });
        Ok(())
    }

    /// Clears the display and refills it from the handler of `architecture`.
    async fn rebuild_display(&self, architecture: Topology, own_media: &[MediaArgument]) {
        // Events arriving while the tracks are collected already land in the
        // new display.
        self.display.update(|display| {
            display.reset(architecture);
            true
        });
        let mut shown: Vec<(String, MediaTrack)> = Vec::new();
        if architecture.aggregates_tracks() {
            for media in own_media {
                shown.extend(media.tracks().into_iter().map(|t| (self.config.name.clone(), t)));
            }
        }
        for (peer, received) in self.handler(architecture).tracks().await {
            let owner = match architecture {
                Topology::Mesh => Some(peer),
                Topology::Sfu => received.track.meta.clone(),
                Topology::Mcu => Some(MIXED_OWNER.to_string()),
            };
            if let Some(owner) = owner {
                shown.push((owner, received.track));
            }
        }
        self.display.update(|display| {
            shown
                .into_iter()
                .fold(false, |changed, (owner, track)| {
                    display.show(&owner, track, architecture) || changed
                })
        });
    }

    // -- inbound -----------------------------------------------------------

    pub async fn handle_envelope(&self, envelope: &Envelope) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if envelope.kind == MessageType::ArchitectureSwitch {
            if envelope.sender != self.config.switch_server {
                tracing::warn!("architecture switch from {} ignored", envelope.sender);
                return;
            }
            let requested = envelope.data.as_str().unwrap_or_default();
            match requested.parse::<Topology>() {
                Ok(next) => {
                    if let Err(e) = self.apply_switch(next).await {
                        tracing::warn!("architecture switch to {requested} failed: {e}");
                    }
                }
                Err(e) => tracing::warn!("architecture switch ignored: {e}"),
            }
            return;
        }
        if envelope.sender == self.config.sfu_peer {
            self.sfu.handle_envelope(envelope).await;
        } else if envelope.sender == self.config.mcu_peer {
            self.mcu.handle_envelope(envelope).await;
        } else {
            self.mesh.handle_envelope(envelope).await;
        }
    }

    // -- media -------------------------------------------------------------

    /// Sends media through the active architecture. Media without metadata
    /// is tagged with the local name.
    pub async fn add_media(&self, media: MediaArgument) -> Result<(), MedleyError> {
        media.resolve()?;
        let media = media.with_default_meta(&self.config.name);
        let mut turn = self.turn.lock().await;
        let architecture = self.architecture();
        let handler = self.handler(architecture);
        if handler.is_closed() {
            return Err(MedleyError::Closed(format!("{architecture} handler")));
        }
        handler.add_media(media.clone()).await?;
        let name = self.config.name.clone();
        let own = media.tracks();
        turn.added_media.push(media);
        if architecture.aggregates_tracks() {
            self.display.update(|display| {
                own.into_iter()
                    .fold(false, |changed, track| display.show(&name, track, architecture) || changed)
            });
        }
        Ok(())
    }

    pub async fn remove_media(&self, selector: MediaSelector) {
        let mut turn = self.turn.lock().await;
        self.handler(self.architecture()).remove_media(selector.clone()).await;
        turn.added_media = turn
            .added_media
            .iter()
            .filter_map(|m| m.without(&selector))
            .collect();
        let name = self.config.name.clone();
        self.display.update(|display| display.hide_matching(&name, &selector));
    }

    pub async fn mute_media(&self, selector: MediaSelector, muted: bool) {
        let _turn = self.turn.lock().await;
        let architecture = self.architecture();
        let handler = self.handler(architecture);
        if handler.is_closed() {
            tracing::warn!(name = %self.config.name, "mute ignored, {architecture} handler is closed");
            return;
        }
        handler.mute_media(selector, muted).await;
    }

    /// Media items added so far. A stream counts as one.
    pub async fn number_of_added_media(&self) -> usize {
        self.turn.lock().await.added_media.len()
    }

    /// What the conference currently delivers: the mixed stream under MCU,
    /// every received track of the active handler otherwise.
    pub async fn output(&self) -> MediaStream {
        match self.architecture() {
            Topology::Mcu => self
                .mcu
                .streams()
                .await
                .into_iter()
                .next()
                .unwrap_or_else(|| MediaStream::new(Vec::new())),
            architecture => MediaStream::new(
                self.handler(architecture)
                    .tracks()
                    .await
                    .into_iter()
                    .map(|(_, received)| received.track)
                    .collect(),
            ),
        }
    }

    pub fn displayed(&self) -> Vec<DisplayedTrack> {
        self.display.lock().tracks()
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut turn = self.turn.lock().await;
        turn.added_media.clear();
        self.mesh.close().await;
        join(self.sfu.close(), self.mcu.close()).await;
        let active = self.display.active();
        self.display.update(|display| {
            display.reset(active);
            true
        });
        tracing::info!(name = %self.config.name, "conference closed");
    }

    // -- listeners ---------------------------------------------------------

    fn mesh_listener(
        display: DisplayHandle,
        emitter: EventEmitter<ConferenceEvent>,
    ) -> Arc<dyn EventListener<RegistryEvent>> {
        Arc::new(move |event: RegistryEvent| match event {
            RegistryEvent::UserConnected(user) => emitter.emit(ConferenceEvent::UserConnected(user)),
            RegistryEvent::UserDisconnected(user) => {
                if display.active() != Topology::Mcu {
                    display.update(|d| d.hide_owner(&user));
                }
                emitter.emit(ConferenceEvent::UserDisconnected(user));
            }
            RegistryEvent::ConnectionClosed(user) => {
                if display.active() == Topology::Mesh {
                    display.update(|d| d.hide_owner(&user));
                }
            }
            RegistryEvent::TrackAdded { user, track, .. } => {
                display.update(|d| d.show(&user, track, Topology::Mesh))
            }
            RegistryEvent::TrackRemoved { track, .. } => {
                display.update(|d| d.hide_track(&track.id, Topology::Mesh))
            }
            _ => {}
        })
    }

    /// SFU tracks are shown under their metadata owner once it is known;
    /// MCU tracks all go to the mixed slot.
    fn server_listener(
        display: DisplayHandle,
        closed: Arc<AtomicBool>,
        source: Topology,
    ) -> Arc<dyn EventListener<SessionEvent>> {
        let owner_of = move |track: &MediaTrack| match source {
            Topology::Mcu => Some(MIXED_OWNER.to_string()),
            _ => track.meta.clone(),
        };
        Arc::new(move |event: SessionEvent| match event {
            SessionEvent::TrackAdded { track, .. } | SessionEvent::MetaChanged { track, .. } => {
                if let Some(owner) = owner_of(&track) {
                    display.update(|d| d.show(&owner, track, source));
                }
            }
            SessionEvent::TrackRemoved { track, .. } => {
                display.update(|d| d.hide_track(&track.id, source))
            }
            SessionEvent::Closed if !closed.load(Ordering::SeqCst) => {
                tracing::warn!("{source} session closed");
                display.emitter.emit(ConferenceEvent::ConnectionClosed(source));
            }
            _ => {}
        })
    }

    fn step(&self, message: std::fmt::Arguments<'_>) {
        if self.config.verbose {
            tracing::info!(name = %self.config.name, "{message}");
        } else {
            tracing::debug!(name = %self.config.name, "{message}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackBus, LoopbackFactory, settle};
    use crate::media::TrackKind;
    use crate::servers::{MediaServer, spawn_switch_server};
    use crate::settings::NegotiationPolicy;
    use crate::transport::IceConnectionState;

    struct Harness {
        bus: LoopbackBus,
        factory: Arc<LoopbackFactory>,
    }

    fn harness() -> Harness {
        let bus = LoopbackBus::new();
        let factory = Arc::new(LoopbackFactory::new());
        MediaServer::spawn(&bus, factory.clone(), "@sfu", Topology::Sfu, NegotiationPolicy::Rollback);
        MediaServer::spawn(&bus, factory.clone(), "@mcu", Topology::Mcu, NegotiationPolicy::Rollback);
        spawn_switch_server(&bus, "@server");
        Harness { bus, factory }
    }

    async fn member(h: &Harness, config: ConferenceConfig) -> Arc<Conference> {
        let inbound = h.bus.join(&config.name);
        let conference = Arc::new(Conference::new(config, h.bus.channel(), h.factory.clone()).unwrap());
        conference.start().await.unwrap();
        tokio::spawn(conference.clone().run(inbound));
        conference
    }

    fn record(conference: &Conference) -> Arc<StdMutex<Vec<ConferenceEvent>>> {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let sink = log.clone();
        conference.add_listener(Arc::new(move |e: ConferenceEvent| sink.lock().unwrap().push(e)));
        log
    }

    fn cam(id: &str) -> MediaArgument {
        MediaArgument::Track(MediaTrack::with_id(id, TrackKind::Video))
    }

    fn shown(conference: &Conference) -> Vec<(String, String, Topology)> {
        conference
            .displayed()
            .into_iter()
            .map(|d| (d.owner, d.track.id, d.source))
            .collect()
    }

    #[tokio::test]
    async fn switching_mesh_to_sfu_moves_display_and_withdraws_mesh_media() {
        let h = harness();
        let alice = member(&h, ConferenceConfig::named("alice")).await;
        let bob = member(&h, ConferenceConfig::named("bob")).await;
        settle().await;
        assert_eq!(alice.members(), vec!["bob".to_string()]);

        bob.add_media(cam("bob-cam")).await.unwrap();
        settle().await;
        assert_eq!(
            shown(&alice),
            vec![("bob".to_string(), "bob-cam".to_string(), Topology::Mesh)]
        );
        let events = record(&alice);

        alice.switch_architecture("sfu").unwrap();
        settle().await;

        assert_eq!(alice.architecture(), Topology::Sfu);
        assert_eq!(bob.architecture(), Topology::Sfu);
        assert_eq!(
            shown(&alice),
            vec![("bob".to_string(), "bob-cam".to_string(), Topology::Sfu)]
        );
        assert_eq!(
            shown(&bob),
            vec![("bob".to_string(), "bob-cam".to_string(), Topology::Sfu)]
        );

        assert!(bob.mesh().added_media().is_empty());
        assert!(bob.mesh().get("alice").unwrap().added_tracks().await.is_empty());
        assert!(h.factory.transport("bob", "alice").unwrap().sending().is_empty());
        assert!(alice.mesh().tracks().await.is_empty());
        assert_eq!(bob.sfu().added_tracks().await.len(), 1);

        let events = events.lock().unwrap();
        assert!(events.contains(&ConferenceEvent::ArchitectureSwitched {
            next: Topology::Sfu,
            previous: Topology::Mesh,
        }));
    }

    #[tokio::test]
    async fn switching_to_the_current_architecture_changes_nothing() {
        let h = harness();
        let alice = member(&h, ConferenceConfig::named("alice")).await;
        alice.add_media(cam("alice-cam")).await.unwrap();
        settle().await;
        let before = shown(&alice);
        let applied = h.factory.transport("alice", "@sfu").unwrap().applied_transceivers();
        let events = record(&alice);

        alice
            .handle_envelope(&Envelope::new("@server", "alice", MessageType::ArchitectureSwitch, "mesh".into()))
            .await;
        settle().await;

        assert!(events.lock().unwrap().is_empty());
        assert_eq!(shown(&alice), before);
        assert_eq!(alice.mesh().added_media().len(), 1);
        assert_eq!(
            h.factory.transport("alice", "@sfu").unwrap().applied_transceivers(),
            applied
        );
    }

    #[tokio::test]
    async fn mcu_displays_only_the_mixed_stream() {
        let h = harness();
        let alice = member(&h, ConferenceConfig::named("alice")).await;
        let bob = member(&h, ConferenceConfig::named("bob")).await;
        bob.add_media(cam("bob-cam")).await.unwrap();
        alice.add_media(cam("alice-cam")).await.unwrap();
        settle().await;

        alice.switch_architecture("mcu").unwrap();
        settle().await;

        assert_eq!(
            shown(&alice),
            vec![(MIXED_OWNER.to_string(), "mix-alice".to_string(), Topology::Mcu)]
        );
        let output: Vec<String> = alice.output().await.tracks.into_iter().map(|t| t.id).collect();
        assert_eq!(output, vec!["mix-alice".to_string()]);
        assert_eq!(alice.mcu().added_tracks().await.len(), 1);
        assert!(alice.mesh().added_media().is_empty());
    }

    #[tokio::test]
    async fn own_media_is_shown_under_local_name_and_hidden_on_removal() {
        let h = harness();
        let alice = member(&h, ConferenceConfig::named("alice")).await;

        alice.add_media(cam("cam-1")).await.unwrap();
        alice.add_media(cam("cam-2")).await.unwrap();
        assert_eq!(
            shown(&alice),
            vec![("alice".to_string(), "cam-2".to_string(), Topology::Mesh)]
        );
        assert_eq!(alice.number_of_added_media().await, 2);
        assert_eq!(alice.mesh().added_media()[0].meta(), Some("alice"));

        alice.remove_media(MediaSelector::Kind(TrackKind::Video)).await;
        assert!(alice.displayed().is_empty());
        assert_eq!(alice.number_of_added_media().await, 0);
    }

    #[tokio::test]
    async fn departed_member_disappears_from_display() {
        let h = harness();
        let alice = member(&h, ConferenceConfig::named("alice")).await;
        let bob = member(&h, ConferenceConfig::named("bob")).await;
        bob.add_media(cam("bob-cam")).await.unwrap();
        settle().await;
        let events = record(&alice);

        h.bus.leave("bob");
        settle().await;

        assert!(alice.displayed().is_empty());
        assert!(alice.members().is_empty());
        assert!(events
            .lock()
            .unwrap()
            .contains(&ConferenceEvent::UserDisconnected("bob".into())));
    }

    #[tokio::test]
    async fn architecture_cycle_and_misuse() {
        let h = harness();
        let alice = member(&h, ConferenceConfig::named("alice")).await;
        assert_eq!(alice.next_architecture_value(), Topology::Sfu);
        assert_eq!(alice.previous_architecture_value(), Topology::Mcu);
        assert!(matches!(
            alice.switch_architecture("p2p"),
            Err(MedleyError::UnknownArchitecture(_))
        ));
        assert!(matches!(alice.start().await, Err(MedleyError::AlreadyStarted(_))));

        alice
            .handle_envelope(&Envelope::new("mallory", "alice", MessageType::ArchitectureSwitch, "sfu".into()))
            .await;
        assert_eq!(alice.architecture(), Topology::Mesh);

        alice.previous_architecture().unwrap();
        settle().await;
        assert_eq!(alice.architecture(), Topology::Mcu);
        assert_eq!(h.bus.sent_between("alice", "@server", MessageType::ArchitectureSwitch).len(), 1);
    }

    #[tokio::test]
    async fn initial_architecture_receives_media() {
        let h = harness();
        let mut config = ConferenceConfig::named("alice");
        config.architecture = Topology::Sfu;
        let alice = member(&h, config).await;

        alice.add_media(cam("alice-cam")).await.unwrap();
        settle().await;

        assert_eq!(alice.architecture(), Topology::Sfu);
        assert_eq!(alice.sfu().added_tracks().await.len(), 1);
        assert!(alice.mesh().added_media().is_empty());
    }

    #[tokio::test]
    async fn lost_server_connection_is_reported() {
        let h = harness();
        let mut config = ConferenceConfig::named("alice");
        config.architecture = Topology::Sfu;
        let alice = member(&h, config).await;
        alice.add_media(cam("alice-cam")).await.unwrap();
        settle().await;
        let events = record(&alice);

        h.factory
            .transport("alice", "@sfu")
            .unwrap()
            .set_ice_state(IceConnectionState::Disconnected);
        settle().await;

        assert!(alice.sfu().is_closed());
        assert!(alice.is_closed());
        assert!(events
            .lock()
            .unwrap()
            .contains(&ConferenceEvent::ConnectionClosed(Topology::Sfu)));
        assert!(matches!(
            alice.add_media(cam("alice-screen")).await,
            Err(MedleyError::Closed(_))
        ));
        assert_eq!(alice.number_of_added_media().await, 1);

        alice.switch_architecture("mesh").unwrap();
        settle().await;
        assert_eq!(alice.architecture(), Topology::Mesh);
        assert!(!alice.is_closed());
        assert_eq!(alice.mesh().added_media().len(), 1);
    }

    #[test]
    fn a_track_is_shown_under_one_owner_only() {
        let mut display = Display::new(Topology::Sfu);
        let track = MediaTrack::with_id("cam", TrackKind::Video);
        assert!(display.show("bob", track.clone().with_meta("bob"), Topology::Sfu));
        assert!(display.show("carol", track.with_meta("carol"), Topology::Sfu));

        let tracks = display.tracks();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].owner, "carol");
        assert!(!display.hide_owner("bob"));
    }

    #[tokio::test]
    async fn explicit_close_does_not_report_lost_connections() {
        let h = harness();
        let alice = member(&h, ConferenceConfig::named("alice")).await;
        let events = record(&alice);

        alice.close().await;
        settle().await;

        assert!(!events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, ConferenceEvent::ConnectionClosed(_))));
    }

    #[tokio::test]
    async fn close_tears_everything_down() {
        let h = harness();
        let alice = member(&h, ConferenceConfig::named("alice")).await;
        let _bob = member(&h, ConferenceConfig::named("bob")).await;
        settle().await;

        alice.close().await;

        assert!(alice.is_closed());
        assert!(alice.sfu().is_closed() && alice.mcu().is_closed());
        assert!(alice.mesh().is_closed());
        assert_eq!(alice.number_of_added_media().await, 0);
        alice
            .handle_envelope(&Envelope::new("@server", "alice", MessageType::ArchitectureSwitch, "sfu".into()))
            .await;
        assert_eq!(alice.architecture(), Topology::Mesh);
    }
}

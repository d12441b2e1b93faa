//! Loopback conference servers: a forwarding SFU, a mixing MCU and the
//! switch server relaying `architecture:switch` requests to every member.
//!
//! They speak the same session protocol as the clients, through
//! [`PeerConnection`]s that always take the yielding role.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::architecture::Topology;
use crate::conference::MIXED_OWNER;
use crate::events::{EventListener, SessionEvent};
use crate::loopback::LoopbackBus;
use crate::media::{MediaArgument, MediaSelector, MediaTrack, TrackKind};
use crate::negotiation::PeerConnection;
use crate::settings::{NegotiationPolicy, SessionConfig};
use crate::signaling::{Envelope, MessageType};
use crate::transport::TransportFactory;

enum ServerInput {
    Envelope(Envelope),
    Publish { origin: String, track: MediaTrack },
    Unpublish { origin: String, track_id: String },
}

/// Server endpoint of the SFU or MCU topology.
///
/// In SFU mode every track a member publishes (once its metadata is known)
/// is forwarded to all other members. In MCU mode each member receives one
/// mixed video track and nothing is forwarded.
pub struct MediaServer {
    id: String,
    mode: Topology,
    policy: NegotiationPolicy,
    bus: LoopbackBus,
    factory: Arc<dyn TransportFactory>,
    sessions: Mutex<BTreeMap<String, Arc<PeerConnection>>>,
    forwarded: Mutex<Vec<(String, MediaTrack)>>,
    inputs: mpsc::UnboundedSender<ServerInput>,
}

impl MediaServer {
    pub fn spawn(
        bus: &LoopbackBus,
        factory: Arc<dyn TransportFactory>,
        id: &str,
        mode: Topology,
        policy: NegotiationPolicy,
    ) -> Arc<Self> {
        let mut envelopes = bus.watch(id);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = Arc::new(Self {
            id: id.to_string(),
            mode,
            policy,
            bus: bus.clone(),
            factory,
            sessions: Mutex::new(BTreeMap::new()),
            forwarded: Mutex::new(Vec::new()),
            inputs: tx.clone(),
        });
        tokio::spawn(async move {
            while let Some(envelope) = envelopes.recv().await {
                if tx.send(ServerInput::Envelope(envelope)).is_err() {
                    break;
                }
            }
        });
        let worker = server.clone();
        tokio::spawn(async move {
            while let Some(input) = rx.recv().await {
                worker.handle(input).await;
            }
        });
        tracing::info!("{} serving as {mode}", server.id);
        server
    }

    fn sessions(&self) -> MutexGuard<'_, BTreeMap<String, Arc<PeerConnection>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn forwarded(&self) -> MutexGuard<'_, Vec<(String, MediaTrack)>> {
        self.forwarded.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn members(&self) -> Vec<String> {
        self.sessions().keys().cloned().collect()
    }

    pub fn session(&self, member: &str) -> Option<Arc<PeerConnection>> {
        self.sessions().get(member).cloned()
    }

    /// Tracks currently forwarded, with the member that published each.
    pub fn forwarded_tracks(&self) -> Vec<(String, MediaTrack)> {
        self.forwarded().clone()
    }

    async fn handle(&self, input: ServerInput) {
        match input {
            ServerInput::Envelope(envelope) => match &envelope.kind {
                MessageType::UserConnected => {
                    if let Some(member) = envelope.data.as_str() {
                        self.open(member).await;
                    }
                }
                MessageType::UserDisconnected => {
                    if let Some(member) = envelope.data.as_str() {
                        self.drop_member(member).await;
                    }
                }
                _ => {
                    if let Some(session) = self.open(&envelope.sender).await {
                        session.handle_envelope(&envelope).await;
                    }
                }
            },
            ServerInput::Publish { origin, track } => self.publish(origin, track).await,
            ServerInput::Unpublish { origin, track_id } => self.unpublish(&origin, &track_id).await,
        }
    }

    async fn open(&self, member: &str) -> Option<Arc<PeerConnection>> {
        if let Some(session) = self.session(member) {
            if !session.is_closed() {
                return Some(session);
            }
            tracing::debug!("{} replaces closed session to {member}", self.id);
            self.sessions().remove(member);
        }
        let config = SessionConfig::new(self.id.clone(), member)
            .with_policy(self.policy)
            .with_yielding(true);
        let session = match PeerConnection::new(config, self.bus.channel(), self.factory.as_ref()) {
            Ok(session) => Arc::new(session),
            Err(e) => {
                tracing::warn!("{} could not open session to {member}: {e}", self.id);
                return None;
            }
        };
        if self.mode == Topology::Sfu {
            session.add_listener(self.publisher(member));
        }
        if let Err(e) = session.start() {
            tracing::warn!("{} could not start session to {member}: {e}", self.id);
            return None;
        }
        self.sessions().insert(member.to_string(), session.clone());
        tracing::debug!("{} opened session to {member}", self.id);

        let welcome: Vec<MediaTrack> = match self.mode {
            Topology::Mcu => vec![
                MediaTrack::with_id(format!("mix-{member}"), TrackKind::Video).with_meta(MIXED_OWNER),
            ],
            _ => self
                .forwarded()
                .iter()
                .filter(|(origin, _)| origin != member)
                .map(|(_, track)| track.clone())
                .collect(),
        };
        for track in welcome {
            if let Err(e) = session.add_media(MediaArgument::Track(track)).await {
                tracing::warn!("{} could not send media to {member}: {e}", self.id);
            }
        }
        Some(session)
    }

    async fn drop_member(&self, member: &str) {
        let session = self.sessions().remove(member);
        if let Some(session) = session {
            session.close().await;
        }
        let published: Vec<String> = self
            .forwarded()
            .iter()
            .filter(|(origin, _)| origin == member)
            .map(|(_, track)| track.id.clone())
            .collect();
        for track_id in published {
            self.unpublish(member, &track_id).await;
        }
    }

    async fn publish(&self, origin: String, track: MediaTrack) {
        {
            let mut forwarded = self.forwarded();
            if forwarded.iter().any(|(_, t)| t.id == track.id) {
                return;
            }
            forwarded.push((origin.clone(), track.clone()));
        }
        tracing::debug!("{} forwards {} of {origin}", self.id, track.id);
        for (member, session) in self.others(&origin) {
            if let Err(e) = session.add_media(MediaArgument::Track(track.clone())).await {
                tracing::warn!("{} could not forward to {member}: {e}", self.id);
            }
        }
    }

    async fn unpublish(&self, origin: &str, track_id: &str) {
        self.forwarded().retain(|(_, t)| t.id != track_id);
        for (_, session) in self.others(origin) {
            session.remove_media(MediaSelector::Track(track_id.to_string())).await;
        }
    }

    fn others(&self, origin: &str) -> Vec<(String, Arc<PeerConnection>)> {
        self.sessions()
            .iter()
            .filter(|(member, _)| member.as_str() != origin)
            .map(|(member, session)| (member.clone(), session.clone()))
            .collect()
    }

    /// Turns a member's received tracks into publish/unpublish inputs.
    fn publisher(&self, member: &str) -> Arc<dyn EventListener<SessionEvent>> {
        let origin = member.to_string();
        let inputs = self.inputs.clone();
        Arc::new(move |event: SessionEvent| {
            let input = match event {
                SessionEvent::TrackAdded { track, .. } | SessionEvent::MetaChanged { track, .. }
                    if track.meta.is_some() =>
                {
                    ServerInput::Publish {
                        origin: origin.clone(),
                        track,
                    }
                }
                SessionEvent::TrackRemoved { track, .. } => ServerInput::Unpublish {
                    origin: origin.clone(),
                    track_id: track.id,
                },
                _ => return,
            };
            let _ = inputs.send(input);
        })
    }
}

/// Relays every `architecture:switch` request to all current members.
pub fn spawn_switch_server(bus: &LoopbackBus, id: &str) -> JoinHandle<()> {
    let mut requests = bus.register(id);
    let bus = bus.clone();
    let id = id.to_string();
    tokio::spawn(async move {
        let channel = bus.channel();
        while let Some(request) = requests.recv().await {
            if request.kind != MessageType::ArchitectureSwitch {
                continue;
            }
            tracing::info!("{} relays switch to {} requested by {}", id, request.data, request.sender);
            for member in bus.members() {
                let notice = Envelope::new(id.clone(), member, MessageType::ArchitectureSwitch, request.data.clone());
                if let Err(e) = channel.send(notice) {
                    tracing::warn!("switch notice not delivered: {e}");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackFactory, settle};

    fn client(bus: &LoopbackBus, factory: &LoopbackFactory, name: &str, server: &str) -> Arc<PeerConnection> {
        let config = SessionConfig::new(name, server).with_yielding(false);
        let session = Arc::new(PeerConnection::new(config, bus.channel(), factory).unwrap());
        bus.attach(&session);
        session.start().unwrap();
        session
    }

    #[tokio::test]
    async fn sfu_forwards_published_tracks_with_owner() {
        let bus = LoopbackBus::new();
        let factory = Arc::new(LoopbackFactory::new());
        let _ = bus.join("alice");
        let _ = bus.join("bob");
        let server = MediaServer::spawn(&bus, factory.clone(), "@sfu", Topology::Sfu, NegotiationPolicy::Rollback);
        let alice = client(&bus, &factory, "alice", "@sfu");
        let bob = client(&bus, &factory, "bob", "@sfu");
        settle().await;
        assert_eq!(server.members(), vec!["alice".to_string(), "bob".to_string()]);

        bob.add_media(MediaArgument::Track(MediaTrack::with_id("cam", TrackKind::Video).with_meta("bob")))
            .await
            .unwrap();
        settle().await;

        let at_alice = alice.tracks().await;
        assert_eq!(at_alice.len(), 1);
        assert_eq!(at_alice[0].track.id, "cam");
        assert_eq!(at_alice[0].track.meta.as_deref(), Some("bob"));
        assert!(bob.tracks().await.is_empty());

        bob.remove_media(MediaSelector::All).await;
        settle().await;
        assert!(alice.tracks().await.is_empty());
        assert!(server.forwarded_tracks().is_empty());
    }

    #[tokio::test]
    async fn mcu_sends_one_mixed_track_per_member() {
        let bus = LoopbackBus::new();
        let factory = Arc::new(LoopbackFactory::new());
        let _ = bus.join("alice");
        let _server = MediaServer::spawn(&bus, factory.clone(), "@mcu", Topology::Mcu, NegotiationPolicy::Rollback);
        let alice = client(&bus, &factory, "alice", "@mcu");
        settle().await;

        let tracks = alice.tracks().await;
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].track.id, "mix-alice");
        assert_eq!(tracks[0].track.meta.as_deref(), Some(MIXED_OWNER));
        assert_eq!(alice.streams().await.len(), 1);
    }

    #[tokio::test]
    async fn closed_member_session_is_replaced_on_reconnect() {
        let bus = LoopbackBus::new();
        let factory = Arc::new(LoopbackFactory::new());
        let _ = bus.join("alice");
        let server = MediaServer::spawn(&bus, factory.clone(), "@mcu", Topology::Mcu, NegotiationPolicy::Rollback);
        let first = client(&bus, &factory, "alice", "@mcu");
        settle().await;

        first.close().await;
        settle().await;
        assert!(server.session("alice").unwrap().is_closed());

        let second = client(&bus, &factory, "alice", "@mcu");
        second
            .add_media(MediaArgument::Track(MediaTrack::with_id("mic", TrackKind::Audio)))
            .await
            .unwrap();
        settle().await;

        assert!(!server.session("alice").unwrap().is_closed());
        let tracks = second.tracks().await;
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].track.id, "mix-alice");
    }

    #[tokio::test]
    async fn switch_server_relays_to_every_member() {
        let bus = LoopbackBus::new();
        let mut alice = bus.join("alice");
        let mut bob = bus.join("bob");
        spawn_switch_server(&bus, "@server");

        bus.channel()
            .send(Envelope::new("alice", "@server", MessageType::ArchitectureSwitch, "sfu".into()))
            .unwrap();
        settle().await;

        for inbox in [&mut alice, &mut bob] {
            let mut relayed = Vec::new();
            while let Ok(envelope) = inbox.try_recv() {
                if envelope.kind == MessageType::ArchitectureSwitch {
                    relayed.push(envelope);
                }
            }
            assert_eq!(relayed.len(), 1);
            assert_eq!(relayed[0].sender, "@server");
            assert_eq!(relayed[0].data, "sfu");
        }
    }
}

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures_util::future::join_all;

use crate::errors::MedleyError;
use crate::events::{EventEmitter, EventListener, ListenerId, RegistryEvent, SessionEvent};
use crate::media::{MediaArgument, MediaSelector};
use crate::negotiation::{PeerConnection, ReceivedTrack};
use crate::settings::ConferenceConfig;
use crate::signaling::{Envelope, MessageType, SignalingChannel};
use crate::transport::TransportFactory;

struct Membership {
    sessions: BTreeMap<String, Arc<PeerConnection>>,
    added_media: Vec<MediaArgument>,
}

/// Mesh peer registry: one negotiation session per remote participant.
///
/// Sessions are created on the first `user:connected` notice and closed on
/// `user:disconnected`. Media added to the registry is replayed onto every
/// session created later.
pub struct ConnectionManager {
    config: ConferenceConfig,
    signaler: Arc<dyn SignalingChannel>,
    factory: Arc<dyn TransportFactory>,
    membership: Arc<Mutex<Membership>>,
    emitter: EventEmitter<RegistryEvent>,
    closed: AtomicBool,
}

impl ConnectionManager {
    pub fn new(
        config: ConferenceConfig,
        signaler: Arc<dyn SignalingChannel>,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            config,
            signaler,
            factory,
            membership: Arc::new(Mutex::new(Membership {
                sessions: BTreeMap::new(),
                added_media: Vec::new(),
            })),
            emitter: EventEmitter::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn EventListener<RegistryEvent>>) -> ListenerId {
        self.emitter.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.emitter.remove_listener(id)
    }

    fn membership(&self) -> MutexGuard<'_, Membership> {
        self.membership.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ids of the participants with a live session, sorted.
    pub fn users(&self) -> Vec<String> {
        self.membership().sessions.keys().cloned().collect()
    }

    pub fn get(&self, user: &str) -> Option<Arc<PeerConnection>> {
        self.membership().sessions.get(user).cloned()
    }

    pub fn participant_count(&self) -> usize {
        self.membership().sessions.len()
    }

    pub fn added_media(&self) -> Vec<MediaArgument> {
        self.membership().added_media.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn handle_envelope(&self, envelope: &Envelope) {
        match &envelope.kind {
            MessageType::UserConnected => match envelope.data.as_str() {
                Some(user) => {
                    if let Err(e) = self.handle_user_connected(user).await {
                        tracing::warn!("could not connect to {user}: {e}");
                    }
                }
                None => tracing::warn!("user:connected without user id"),
            },
            MessageType::UserDisconnected => match envelope.data.as_str() {
                Some(user) => self.handle_user_disconnected(user).await,
                None => tracing::warn!("user:disconnected without user id"),
            },
            _ => match self.get(&envelope.sender) {
                Some(session) => session.handle_envelope(envelope).await,
                None => tracing::debug!(
                    "no mesh session for {}, {} ignored",
                    envelope.sender,
                    envelope.kind.as_str()
                ),
            },
        }
    }

    pub async fn handle_user_connected(&self, user: &str) -> Result<(), MedleyError> {
        if self.is_closed() || user == self.config.name {
            return Ok(());
        }
        // Session creation and the media snapshot happen under one lock so a
        // concurrent add_media reaches the new session exactly once.
        let (session, media) = {
            let mut membership = self.membership();
            if membership.sessions.contains_key(user) {
                return Ok(());
            }
            let session = Arc::new(PeerConnection::new(
                self.config.session(user),
                self.signaler.clone(),
                self.factory.as_ref(),
            )?);
            session.add_listener(self.forwarder(user, session.id()));
            membership.sessions.insert(user.to_string(), session.clone());
            (session, membership.added_media.clone())
        };
        session.start()?;
        tracing::info!("user {user} connected");
        for m in media {
            if let Err(e) = session.add_media(m).await {
                tracing::warn!("could not add media for {user}: {e}");
            }
        }
        self.emitter.emit(RegistryEvent::UserConnected(user.to_string()));
        Ok(())
    }

    pub async fn handle_user_disconnected(&self, user: &str) {
        let session = self.membership().sessions.remove(user);
        if let Some(session) = session {
            session.close().await;
        }
        tracing::info!("user {user} disconnected");
        self.emitter.emit(RegistryEvent::UserDisconnected(user.to_string()));
    }

    /// Adds media to every current session and to all later ones.
    pub async fn add_media(&self, media: MediaArgument) -> Result<(), MedleyError> {
        media.resolve()?;
        let sessions: Vec<Arc<PeerConnection>> = {
            let mut membership = self.membership();
            membership.added_media.push(media.clone());
            membership.sessions.values().cloned().collect()
        };
        for session in sessions {
            if let Err(e) = session.add_media(media.clone()).await {
                tracing::warn!("could not add media for {}: {e}", session.peer());
            }
        }
        Ok(())
    }

    pub async fn remove_media(&self, selector: MediaSelector) {
        let sessions: Vec<Arc<PeerConnection>> = {
            let mut membership = self.membership();
            membership.added_media = membership
                .added_media
                .iter()
                .filter_map(|m| m.without(&selector))
                .collect();
            membership.sessions.values().cloned().collect()
        };
        for session in sessions {
            session.remove_media(selector.clone()).await;
        }
    }

    pub async fn mute_media(&self, selector: MediaSelector, muted: bool) {
        let sessions: Vec<Arc<PeerConnection>> =
            self.membership().sessions.values().cloned().collect();
        for session in sessions {
            session.mute_media(selector.clone(), muted).await;
        }
    }

    /// Every received track, paired with the participant it came from.
    pub async fn tracks(&self) -> Vec<(String, ReceivedTrack)> {
        let sessions: Vec<(String, Arc<PeerConnection>)> = self
            .membership()
            .sessions
            .iter()
            .map(|(user, session)| (user.clone(), session.clone()))
            .collect();
        let mut tracks = Vec::new();
        for (user, session) in sessions {
            tracks.extend(session.tracks().await.into_iter().map(|t| (user.clone(), t)));
        }
        tracks
    }

    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let sessions: Vec<Arc<PeerConnection>> = {
            let mut membership = self.membership();
            membership.added_media.clear();
            std::mem::take(&mut membership.sessions).into_values().collect()
        };
        join_all(sessions.iter().map(|session| session.close())).await;
    }

    /// Relays one session's events as registry events tagged with `user`.
    fn forwarder(&self, user: &str, session_id: &str) -> Arc<dyn EventListener<SessionEvent>> {
        let user = user.to_string();
        let session_id = session_id.to_string();
        let emitter = self.emitter.clone();
        let membership: Weak<Mutex<Membership>> = Arc::downgrade(&self.membership);
        Arc::new(move |event: SessionEvent| match event {
            SessionEvent::TrackAdded { track, mid } => emitter.emit(RegistryEvent::TrackAdded {
                user: user.clone(),
                track,
                mid,
            }),
            SessionEvent::TrackRemoved { track, mid } => emitter.emit(RegistryEvent::TrackRemoved {
                user: user.clone(),
                track,
                mid,
            }),
            SessionEvent::MetaChanged { track, .. } => emitter.emit(RegistryEvent::MetaChanged {
                user: user.clone(),
                track,
            }),
            SessionEvent::MediaChanged(change) => emitter.emit(RegistryEvent::MediaChanged(change)),
            SessionEvent::Closed => {
                if let Some(membership) = membership.upgrade() {
                    let mut membership = membership.lock().unwrap_or_else(|e| e.into_inner());
                    if membership
                        .sessions
                        .get(&user)
                        .is_some_and(|s| s.id() == session_id)
                    {
                        membership.sessions.remove(&user);
                    }
                }
                emitter.emit(RegistryEvent::ConnectionClosed(user.clone()));
            }
            _ => {}
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackBus, LoopbackFactory, settle};
    use crate::media::{MediaTrack, TrackKind};

    fn registry(bus: &LoopbackBus, factory: &Arc<LoopbackFactory>, name: &str) -> ConnectionManager {
        ConnectionManager::new(
            ConferenceConfig::named(name),
            bus.channel(),
            factory.clone(),
        )
    }

    #[tokio::test]
    async fn connect_creates_one_session_per_user() {
        let bus = LoopbackBus::new();
        let factory = Arc::new(LoopbackFactory::new());
        let mgr = registry(&bus, &factory, "alice");

        mgr.handle_user_connected("bob").await.unwrap();
        mgr.handle_user_connected("bob").await.unwrap();
        mgr.handle_user_connected("carol").await.unwrap();
        mgr.handle_user_connected("alice").await.unwrap();

        assert_eq!(mgr.users(), vec!["bob".to_string(), "carol".to_string()]);
        assert_eq!(factory.created(), 2);
        assert!(mgr.get("bob").unwrap().is_yielding());
        assert!(!mgr.get("bob").unwrap().is_closed());
    }

    #[tokio::test]
    async fn disconnect_closes_and_removes() {
        let bus = LoopbackBus::new();
        let factory = Arc::new(LoopbackFactory::new());
        let mgr = registry(&bus, &factory, "alice");
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        mgr.add_listener(Arc::new(move |e: RegistryEvent| sink.lock().unwrap().push(e)));

        mgr.handle_user_connected("bob").await.unwrap();
        let session = mgr.get("bob").unwrap();
        mgr.handle_user_disconnected("bob").await;

        assert!(session.is_closed());
        assert!(mgr.get("bob").is_none());
        let events = events.lock().unwrap();
        assert!(events.contains(&RegistryEvent::UserConnected("bob".into())));
        assert!(events.contains(&RegistryEvent::ConnectionClosed("bob".into())));
        assert!(events.contains(&RegistryEvent::UserDisconnected("bob".into())));
    }

    #[tokio::test]
    async fn media_added_before_join_reaches_new_session() {
        let bus = LoopbackBus::new();
        let factory = Arc::new(LoopbackFactory::new());
        let mgr = registry(&bus, &factory, "alice");
        let track = MediaTrack::with_id("cam", TrackKind::Video);

        mgr.add_media(MediaArgument::Track(track.clone())).await.unwrap();
        mgr.handle_user_connected("bob").await.unwrap();

        let added = mgr.get("bob").unwrap().added_tracks().await;
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].track().unwrap().id, "cam");
        let transport = factory.transport("alice", "bob").unwrap();
        assert_eq!(transport.applied_transceivers(), vec!["cam".to_string()]);
    }

    #[tokio::test]
    async fn remove_media_filters_the_replay_list() {
        let bus = LoopbackBus::new();
        let factory = Arc::new(LoopbackFactory::new());
        let mgr = registry(&bus, &factory, "alice");

        mgr.add_media(MediaArgument::Track(MediaTrack::with_id("mic", TrackKind::Audio)))
            .await
            .unwrap();
        mgr.add_media(MediaArgument::Track(MediaTrack::with_id("cam", TrackKind::Video)))
            .await
            .unwrap();
        mgr.remove_media(MediaSelector::Kind(TrackKind::Audio)).await;

        let left = mgr.added_media();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].tracks()[0].id, "cam");
    }

    #[tokio::test]
    async fn unsupported_media_is_reported() {
        let bus = LoopbackBus::new();
        let factory = Arc::new(LoopbackFactory::new());
        let mgr = registry(&bus, &factory, "alice");
        let err = mgr
            .add_media(MediaArgument::Constraints(Default::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, MedleyError::UnsupportedMedia(_)));
        assert!(mgr.added_media().is_empty());
    }

    #[tokio::test]
    async fn close_closes_every_session() {
        let bus = LoopbackBus::new();
        let factory = Arc::new(LoopbackFactory::new());
        let mgr = registry(&bus, &factory, "alice");
        mgr.handle_user_connected("bob").await.unwrap();
        mgr.handle_user_connected("carol").await.unwrap();
        let bob = mgr.get("bob").unwrap();
        let carol = mgr.get("carol").unwrap();

        mgr.close().await;
        settle().await;

        assert!(bob.is_closed() && carol.is_closed());
        assert_eq!(mgr.participant_count(), 0);
        mgr.handle_user_connected("dave").await.unwrap();
        assert_eq!(mgr.participant_count(), 0);
    }

    #[tokio::test]
    async fn envelopes_are_routed_by_sender() {
        let bus = LoopbackBus::new();
        let factory = Arc::new(LoopbackFactory::new());
        let mgr = registry(&bus, &factory, "alice");

        mgr.handle_envelope(&Envelope::new(
            "@signaling",
            "alice",
            MessageType::UserConnected,
            serde_json::Value::from("bob"),
        ))
        .await;
        assert_eq!(mgr.users(), vec!["bob".to_string()]);

        mgr.handle_envelope(&Envelope::new(
            "bob",
            "alice",
            MessageType::ConnectionClose,
            serde_json::Value::from("immediately"),
        ))
        .await;
        assert!(mgr.get("bob").is_none());
    }
}

use std::sync::{Arc, RwLock};

use crate::architecture::Topology;
use crate::media::MediaTrack;

/// Events emitted by a single peer session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    TrackAdded { track: MediaTrack, mid: Option<String> },
    TrackRemoved { track: MediaTrack, mid: Option<String> },
    StreamAdded { stream_id: String, track: MediaTrack },
    StreamRemoved { stream_id: String },
    MetaChanged { track: MediaTrack, mid: String },
    MediaChanged(MediaChange),
    /// Lock-based negotiation only.
    Locked,
    Accepted,
    Unlocked,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Removed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaChange {
    pub change: ChangeKind,
    pub track: MediaTrack,
    pub peer: String,
    pub mid: Option<String>,
}

/// Events emitted by the mesh peer registry.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    UserConnected(String),
    UserDisconnected(String),
    ConnectionClosed(String),
    TrackAdded { user: String, track: MediaTrack, mid: Option<String> },
    TrackRemoved { user: String, track: MediaTrack, mid: Option<String> },
    MetaChanged { user: String, track: MediaTrack },
    MediaChanged(MediaChange),
}

/// Events emitted by the conference (topology coordinator).
#[derive(Debug, Clone, PartialEq)]
pub enum ConferenceEvent {
    UserConnected(String),
    UserDisconnected(String),
    ArchitectureSwitched { next: Topology, previous: Topology },
    /// The SFU or MCU session closed without the conference being closed.
    ConnectionClosed(Topology),
    DisplayChanged,
}

/// Receives events from one component.
/// Implementations must be Send + Sync (called from tokio tasks).
pub trait EventListener<E>: Send + Sync {
    fn on_event(&self, event: E);
}

impl<E, F> EventListener<E> for F
where
    F: Fn(E) + Send + Sync,
{
    fn on_event(&self, event: E) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listeners<E> {
    next_id: u64,
    entries: Vec<(ListenerId, Arc<dyn EventListener<E>>)>,
}

/// Dispatches one closed set of events to registered listeners.
pub struct EventEmitter<E> {
    listeners: Arc<RwLock<Listeners<E>>>,
}

impl<E> Clone for EventEmitter<E> {
    fn clone(&self) -> Self {
        Self {
            listeners: self.listeners.clone(),
        }
    }
}

impl<E> Default for EventEmitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventEmitter<E> {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(RwLock::new(Listeners {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn EventListener<E>>) -> ListenerId {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let id = ListenerId(listeners.next_id);
        listeners.next_id += 1;
        listeners.entries.push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let before = listeners.entries.len();
        listeners.entries.retain(|(entry, _)| *entry != id);
        listeners.entries.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }
}

impl<E: Clone> EventEmitter<E> {
    pub fn emit(&self, event: E) {
        // Snapshot first so listeners may (un)subscribe while handling.
        let listeners: Vec<Arc<dyn EventListener<E>>> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener.on_event(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener {
        count: Arc<AtomicUsize>,
    }

    impl EventListener<SessionEvent> for CountingListener {
        fn on_event(&self, _event: SessionEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn emitter_dispatches_to_listener() {
        let emitter = EventEmitter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let listener = Arc::new(CountingListener { count: count.clone() });

        emitter.add_listener(listener);
        emitter.emit(SessionEvent::Closed);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn emitter_dispatches_to_multiple_listeners() {
        let emitter = EventEmitter::new();
        let count1 = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::new(AtomicUsize::new(0));

        emitter.add_listener(Arc::new(CountingListener { count: count1.clone() }));
        emitter.add_listener(Arc::new(CountingListener { count: count2.clone() }));

        emitter.emit(SessionEvent::Unlocked);

        assert_eq!(count1.load(Ordering::SeqCst), 1);
        assert_eq!(count2.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_listener_stops_receiving() {
        let emitter = EventEmitter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let id = emitter.add_listener(Arc::new(CountingListener { count: count.clone() }));

        emitter.emit(SessionEvent::Locked);
        assert!(emitter.remove_listener(id));
        assert!(!emitter.remove_listener(id));
        emitter.emit(SessionEvent::Locked);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.listener_count(), 0);
    }

    #[test]
    fn closures_are_listeners() {
        let emitter: EventEmitter<RegistryEvent> = EventEmitter::new();
        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = events.clone();
        emitter.add_listener(Arc::new(move |event: RegistryEvent| {
            sink.lock().unwrap().push(event);
        }));

        emitter.emit(RegistryEvent::UserDisconnected("p1".to_string()));

        let captured = events.lock().unwrap();
        assert_eq!(captured.len(), 1);
        match &captured[0] {
            RegistryEvent::UserDisconnected(user) => assert_eq!(user, "p1"),
            _ => panic!("expected UserDisconnected"),
        }
    }
}

//! Medley core: multi-party media session negotiation.
//!
//! Pure Rust crate with no platform dependencies. The media-transport
//! engine and the signaling service are consumed through the traits in
//! [`transport`] and [`signaling`]; [`loopback`] and [`servers`] provide
//! in-memory implementations for tests and demos.

pub mod architecture;
pub mod conference;
pub mod errors;
pub mod events;
pub mod loopback;
pub mod media;
pub mod negotiation;
pub mod participants;
pub mod servers;
pub mod settings;
pub mod signaling;
pub mod topology;
pub mod transport;

pub use architecture::{ArchitectureSelector, Topology};
pub use conference::{Conference, DisplayedTrack};
pub use errors::MedleyError;
pub use events::{ConferenceEvent, EventListener, RegistryEvent, SessionEvent};
pub use media::{MediaArgument, MediaSelector, MediaStream, MediaTrack, TrackKind};
pub use negotiation::{NegotiationState, PeerConnection};
pub use participants::ConnectionManager;
pub use settings::{ConferenceConfig, ConfigStore, NegotiationPolicy, SessionConfig};
pub use signaling::{Envelope, MessageType, SignalingChannel};
pub use topology::TopologyHandler;
pub use transport::{Transport, TransportEvent, TransportFactory};

//! Common surface of the per-topology media handlers.

use async_trait::async_trait;

use crate::errors::MedleyError;
use crate::media::{MediaArgument, MediaSelector};
use crate::negotiation::{PeerConnection, ReceivedTrack};
use crate::participants::ConnectionManager;

/// What the conference needs from the handler of one topology: the mesh
/// registry, or the single server session of an SFU or MCU.
#[async_trait]
pub trait TopologyHandler: Send + Sync {
    async fn add_media(&self, media: MediaArgument) -> Result<(), MedleyError>;
    async fn remove_media(&self, selector: MediaSelector);
    async fn mute_media(&self, selector: MediaSelector, muted: bool);
    /// Received tracks paired with the peer each one came from.
    async fn tracks(&self) -> Vec<(String, ReceivedTrack)>;
    async fn close(&self);
    fn is_closed(&self) -> bool;
}

#[async_trait]
impl TopologyHandler for ConnectionManager {
    async fn add_media(&self, media: MediaArgument) -> Result<(), MedleyError> {
        ConnectionManager::add_media(self, media).await
    }

    async fn remove_media(&self, selector: MediaSelector) {
        ConnectionManager::remove_media(self, selector).await
    }

    async fn mute_media(&self, selector: MediaSelector, muted: bool) {
        ConnectionManager::mute_media(self, selector, muted).await
    }

    async fn tracks(&self) -> Vec<(String, ReceivedTrack)> {
        ConnectionManager::tracks(self).await
    }

    async fn close(&self) {
        ConnectionManager::close(self).await
    }

    fn is_closed(&self) -> bool {
        ConnectionManager::is_closed(self)
    }
}

#[async_trait]
impl TopologyHandler for PeerConnection {
    async fn add_media(&self, media: MediaArgument) -> Result<(), MedleyError> {
        PeerConnection::add_media(self, media).await
    }

    async fn remove_media(&self, selector: MediaSelector) {
        PeerConnection::remove_media(self, selector).await
    }

    async fn mute_media(&self, selector: MediaSelector, muted: bool) {
        PeerConnection::mute_media(self, selector, muted).await
    }

    async fn tracks(&self) -> Vec<(String, ReceivedTrack)> {
        let peer = self.peer().to_string();
        PeerConnection::tracks(self)
            .await
            .into_iter()
            .map(|track| (peer.clone(), track))
            .collect()
    }

    async fn close(&self) {
        PeerConnection::close(self).await
    }

    fn is_closed(&self) -> bool {
        PeerConnection::is_closed(self)
    }
}

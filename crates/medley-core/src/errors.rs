use thiserror::Error;

#[derive(Debug, Error)]
pub enum MedleyError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("signaling error: {0}")]
    Signaling(String),
    #[error("unsupported media: {0}")]
    UnsupportedMedia(String),
    #[error("session already started: {0}")]
    AlreadyStarted(String),
    #[error("unknown architecture: {0}")]
    UnknownArchitecture(String),
    #[error("session closed: {0}")]
    Closed(String),
}

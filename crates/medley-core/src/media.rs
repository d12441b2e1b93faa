//! Media handles exchanged between the conference, its sessions and the transport.

use serde::{Deserialize, Serialize};

use crate::errors::MedleyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

/// A concrete media track. `meta` carries the display identity of the
/// participant that owns the track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
    #[serde(default)]
    pub meta: Option<String>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), kind)
    }

    pub fn with_id(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            meta: None,
        }
    }

    pub fn with_meta(mut self, meta: impl Into<String>) -> Self {
        self.meta = Some(meta.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
    #[serde(default)]
    pub meta: Option<String>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tracks,
            meta: None,
        }
    }

    pub fn with_meta(mut self, meta: impl Into<String>) -> Self {
        self.meta = Some(meta.into());
        self
    }
}

/// Capture request resolved into one send slot per requested kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MediaConstraints {
    #[serde(default)]
    pub audio: bool,
    #[serde(default)]
    pub video: bool,
}

/// What a transceiver sends: a concrete track or an empty slot of a kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackRef {
    Track(MediaTrack),
    Kind(TrackKind),
}

impl TrackRef {
    pub fn kind(&self) -> TrackKind {
        match self {
            TrackRef::Track(track) => track.kind,
            TrackRef::Kind(kind) => *kind,
        }
    }

    pub fn track(&self) -> Option<&MediaTrack> {
        match self {
            TrackRef::Track(track) => Some(track),
            TrackRef::Kind(_) => None,
        }
    }

    /// Concrete refs compare by track id, symbolic refs by kind.
    pub fn same_as(&self, other: &TrackRef) -> bool {
        match (self, other) {
            (TrackRef::Track(a), TrackRef::Track(b)) => a.id == b.id,
            (TrackRef::Kind(a), TrackRef::Kind(b)) => a == b,
            _ => false,
        }
    }
}

/// Selects local media for removal, muting or replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSelector {
    Track(String),
    Kind(TrackKind),
    All,
}

impl MediaSelector {
    pub fn matches(&self, track: &MediaTrack) -> bool {
        match self {
            MediaSelector::Track(id) => track.id == *id,
            MediaSelector::Kind(kind) => track.kind == *kind,
            MediaSelector::All => true,
        }
    }

    pub fn matches_ref(&self, track: &TrackRef) -> bool {
        match (self, track) {
            (MediaSelector::All, _) => true,
            (MediaSelector::Kind(kind), reference) => reference.kind() == *kind,
            (MediaSelector::Track(id), TrackRef::Track(track)) => track.id == *id,
            (MediaSelector::Track(_), TrackRef::Kind(_)) => false,
        }
    }
}

/// Media handed to `add_media`, resolved once at the API boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaArgument {
    Track(MediaTrack),
    Stream(MediaStream),
    Kind(TrackKind),
    Constraints(MediaConstraints),
}

/// One transceiver to create: what it sends and the stream ids it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMedia {
    pub track: TrackRef,
    pub streams: Vec<String>,
}

impl MediaArgument {
    pub fn resolve(&self) -> Result<Vec<ResolvedMedia>, MedleyError> {
        match self {
            MediaArgument::Track(track) => Ok(vec![ResolvedMedia {
                track: TrackRef::Track(track.clone()),
                streams: vec![uuid::Uuid::new_v4().to_string()],
            }]),
            MediaArgument::Stream(stream) => {
                if stream.tracks.is_empty() {
                    return Err(MedleyError::UnsupportedMedia(format!(
                        "stream {} has no tracks",
                        stream.id
                    )));
                }
                Ok(stream
                    .tracks
                    .iter()
                    .map(|track| {
                        let mut track = track.clone();
                        if let Some(meta) = &stream.meta {
                            track.meta = Some(meta.clone());
                        }
                        ResolvedMedia {
                            track: TrackRef::Track(track),
                            streams: vec![stream.id.clone()],
                        }
                    })
                    .collect())
            }
            MediaArgument::Kind(kind) => Ok(vec![ResolvedMedia {
                track: TrackRef::Kind(*kind),
                streams: Vec::new(),
            }]),
            MediaArgument::Constraints(constraints) => {
                let kinds: Vec<TrackKind> = [
                    (constraints.audio, TrackKind::Audio),
                    (constraints.video, TrackKind::Video),
                ]
                .into_iter()
                .filter_map(|(wanted, kind)| wanted.then_some(kind))
                .collect();
                if kinds.is_empty() {
                    return Err(MedleyError::UnsupportedMedia(
                        "constraints request neither audio nor video".into(),
                    ));
                }
                let stream = uuid::Uuid::new_v4().to_string();
                Ok(kinds
                    .into_iter()
                    .map(|kind| ResolvedMedia {
                        track: TrackRef::Kind(kind),
                        streams: vec![stream.clone()],
                    })
                    .collect())
            }
        }
    }

    /// Concrete tracks carried by this argument.
    pub fn tracks(&self) -> Vec<MediaTrack> {
        match self {
            MediaArgument::Track(track) => vec![track.clone()],
            MediaArgument::Stream(stream) => stream.tracks.clone(),
            MediaArgument::Kind(_) | MediaArgument::Constraints(_) => Vec::new(),
        }
    }

    pub fn meta(&self) -> Option<&str> {
        match self {
            MediaArgument::Track(track) => track.meta.as_deref(),
            MediaArgument::Stream(stream) => stream.meta.as_deref(),
            MediaArgument::Kind(_) | MediaArgument::Constraints(_) => None,
        }
    }

    /// Tags the argument with `meta` unless it already carries one.
    pub fn with_default_meta(self, meta: &str) -> Self {
        match self {
            MediaArgument::Track(mut track) => {
                track.meta.get_or_insert_with(|| meta.to_string());
                MediaArgument::Track(track)
            }
            MediaArgument::Stream(mut stream) => {
                stream.meta.get_or_insert_with(|| meta.to_string());
                MediaArgument::Stream(stream)
            }
            other => other,
        }
    }

    /// What is left of this argument once `selector` is removed from it.
    pub fn without(&self, selector: &MediaSelector) -> Option<MediaArgument> {
        match self {
            MediaArgument::Track(track) => {
                (!selector.matches(track)).then(|| MediaArgument::Track(track.clone()))
            }
            MediaArgument::Stream(stream) => {
                let tracks: Vec<MediaTrack> = stream
                    .tracks
                    .iter()
                    .filter(|track| !selector.matches(track))
                    .cloned()
                    .collect();
                if tracks.is_empty() {
                    None
                } else {
                    Some(MediaArgument::Stream(MediaStream {
                        tracks,
                        ..stream.clone()
                    }))
                }
            }
            MediaArgument::Kind(kind) => match selector {
                MediaSelector::All => None,
                MediaSelector::Kind(removed) if removed == kind => None,
                _ => Some(self.clone()),
            },
            MediaArgument::Constraints(constraints) => {
                let remaining = match selector {
                    MediaSelector::All => MediaConstraints::default(),
                    MediaSelector::Kind(TrackKind::Audio) => MediaConstraints {
                        audio: false,
                        ..*constraints
                    },
                    MediaSelector::Kind(TrackKind::Video) => MediaConstraints {
                        video: false,
                        ..*constraints
                    },
                    MediaSelector::Track(_) => *constraints,
                };
                (remaining.audio || remaining.video)
                    .then_some(MediaArgument::Constraints(remaining))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_meta_is_copied_onto_each_track() {
        let stream = MediaStream::new(vec![
            MediaTrack::with_id("a1", TrackKind::Audio),
            MediaTrack::with_id("v1", TrackKind::Video),
        ])
        .with_meta("alice");
        let resolved = MediaArgument::Stream(stream.clone()).resolve().unwrap();
        assert_eq!(resolved.len(), 2);
        for media in &resolved {
            assert_eq!(media.track.track().unwrap().meta.as_deref(), Some("alice"));
            assert_eq!(media.streams, vec![stream.id.clone()]);
        }
    }

    #[test]
    fn empty_constraints_are_rejected() {
        let err = MediaArgument::Constraints(MediaConstraints::default())
            .resolve()
            .unwrap_err();
        assert!(matches!(err, MedleyError::UnsupportedMedia(_)));
    }

    #[test]
    fn constraints_resolve_to_kind_slots_sharing_a_stream() {
        let resolved = MediaArgument::Constraints(MediaConstraints {
            audio: true,
            video: true,
        })
        .resolve()
        .unwrap();
        assert_eq!(resolved[0].track, TrackRef::Kind(TrackKind::Audio));
        assert_eq!(resolved[1].track, TrackRef::Kind(TrackKind::Video));
        assert_eq!(resolved[0].streams, resolved[1].streams);
    }

    #[test]
    fn selector_matches_refs_by_id_or_kind() {
        let track = TrackRef::Track(MediaTrack::with_id("v1", TrackKind::Video));
        assert!(MediaSelector::Track("v1".into()).matches_ref(&track));
        assert!(!MediaSelector::Track("v2".into()).matches_ref(&track));
        assert!(MediaSelector::Kind(TrackKind::Video).matches_ref(&track));
        assert!(!MediaSelector::Kind(TrackKind::Audio).matches_ref(&track));
        assert!(MediaSelector::All.matches_ref(&TrackRef::Kind(TrackKind::Audio)));
        assert!(!MediaSelector::Track("v1".into()).matches_ref(&TrackRef::Kind(TrackKind::Video)));
    }

    #[test]
    fn without_strips_matching_tracks_from_streams() {
        let stream = MediaStream::new(vec![
            MediaTrack::with_id("a1", TrackKind::Audio),
            MediaTrack::with_id("v1", TrackKind::Video),
        ]);
        let left = MediaArgument::Stream(stream)
            .without(&MediaSelector::Kind(TrackKind::Audio))
            .unwrap();
        assert_eq!(left.tracks().len(), 1);
        assert_eq!(left.tracks()[0].id, "v1");
        assert!(left.without(&MediaSelector::Track("v1".into())).is_none());
    }

    #[test]
    fn default_meta_does_not_override_existing() {
        let tagged = MediaArgument::Track(MediaTrack::with_id("v1", TrackKind::Video).with_meta("bob"))
            .with_default_meta("alice");
        assert_eq!(tagged.meta(), Some("bob"));
        let untagged = MediaArgument::Track(MediaTrack::with_id("v2", TrackKind::Video))
            .with_default_meta("alice");
        assert_eq!(untagged.meta(), Some("alice"));
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;

/// Durations closer than this are treated as the same
const DURATION_UPDATE_TOLERANCE_MS: u64 = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackArtist {
    pub name: String,
}

impl TrackArtist {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

/// A library track as imported by the host application
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Track {
    /// Host-assigned identifier, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub artists: Vec<TrackArtist>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isrc: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    /// Stream identifier chosen by the user or a curated playlist; skips lookup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_id: Option<String>,
    #[serde(default)]
    pub unavailable: bool,
}

impl Track {
    pub fn new(name: &str, artists: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            artists: artists.iter().map(|a| TrackArtist::new(a)).collect(),
            ..Self::default()
        }
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_video_id(mut self, video_id: &str) -> Self {
        self.video_id = Some(video_id.to_string());
        self
    }

    /// Artist names joined with ", "
    pub fn artist_names(&self) -> String {
        self.artists
            .iter()
            .map(|a| a.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn key(&self) -> TrackKey {
        TrackKey::for_track(self)
    }

    /// Update the known duration when it is unknown or differs noticeably.
    /// Returns true when the value changed.
    pub fn refresh_duration(&mut self, duration_ms: u64) -> bool {
        if duration_ms == 0 {
            return false;
        }
        let should_update = match self.duration_ms {
            Some(current) => current.abs_diff(duration_ms) > DURATION_UPDATE_TOLERANCE_MS,
            None => true,
        };
        if should_update {
            self.duration_ms = Some(duration_ms);
        }
        should_update
    }
}

/// Stable identity used for cache lookups and in-flight de-duplication
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackKey(String);

impl TrackKey {
    pub fn for_track(track: &Track) -> Self {
        if let Some(id) = track.id.as_deref().filter(|id| !id.is_empty()) {
            return Self(id.to_string());
        }
        if let Some(isrc) = track.isrc.as_deref().filter(|isrc| !isrc.is_empty()) {
            return Self(isrc.to_string());
        }
        let artists = track
            .artists
            .iter()
            .map(|a| a.name.as_str())
            .collect::<Vec<_>>()
            .join(",");
        Self(format!("{}-{}", track.name, artists))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TrackKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for TrackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a resolved external id came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionSource {
    /// The track carried its own external id
    Pinned,
    /// Chosen from lookup service results
    Search,
}

impl fmt::Display for ResolutionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionSource::Pinned => write!(f, "pinned"),
            ResolutionSource::Search => write!(f, "search"),
        }
    }
}

/// A track resolved to a playable stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionResult {
    pub external_id: String,
    pub playable_url: String,
    pub source: ResolutionSource,
    pub duration_seconds: Option<u32>,
}

impl ResolutionResult {
    pub fn duration_ms(&self) -> Option<u64> {
        self.duration_seconds
            .filter(|secs| *secs > 0)
            .map(|secs| secs as u64 * 1000)
    }
}

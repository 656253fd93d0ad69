// Track metadata value type
// Identity, scrobble eligibility and threshold rules

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Minimum track duration in seconds for a track to be scrobbled
pub const MIN_TRACK_DURATION: f64 = 30.0;
/// Scrobble after this many seconds even if half the track has not played yet
pub const MAX_SCROBBLE_DELAY: f64 = 240.0;

/// Turns empty strings into `None`.
pub fn empty_is_none(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// Metadata of a track as reported by the player.
///
/// Two values are equal when title, artist, album artist, album and play count
/// match. Duration is left out on purpose: players report slightly different
/// durations for the same song, and a replay bumps the play count instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album_artist: Option<String>,
    pub album: Option<String>,
    pub duration_seconds: Option<f64>,
    pub play_count: Option<u32>,
}

impl TrackMetadata {
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = empty_is_none(Some(title.into()));
        self
    }

    pub fn with_artist(mut self, artist: impl Into<String>) -> Self {
        self.artist = empty_is_none(Some(artist.into()));
        self
    }

    pub fn with_album_artist(mut self, album_artist: impl Into<String>) -> Self {
        self.album_artist = empty_is_none(Some(album_artist.into()));
        self
    }

    pub fn with_album(mut self, album: impl Into<String>) -> Self {
        self.album = empty_is_none(Some(album.into()));
        self
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration_seconds = Some(seconds);
        self
    }

    pub fn with_play_count(mut self, play_count: u32) -> Self {
        self.play_count = Some(play_count);
        self
    }

    /// Normalize every text field so empty strings become absent.
    pub fn normalized(self) -> Self {
        Self {
            title: empty_is_none(self.title),
            artist: empty_is_none(self.artist),
            album_artist: empty_is_none(self.album_artist),
            album: empty_is_none(self.album),
            duration_seconds: self.duration_seconds,
            play_count: self.play_count,
        }
    }

    /// Whether Last.fm would accept this track as a scrobble
    pub fn can_be_scrobbled(&self) -> bool {
        self.title.is_some()
            && self.artist.is_some()
            && self
                .duration_seconds
                .map(|d| d >= MIN_TRACK_DURATION)
                .unwrap_or(false)
    }

    /// Playback position in seconds at which the track counts as listened:
    /// half the duration, capped at four minutes.
    pub fn scrobble_threshold(&self) -> Option<f64> {
        self.duration_seconds.map(|d| (d / 2.0).min(MAX_SCROBBLE_DELAY))
    }

    /// Stable hash over the identity fields.
    ///
    /// Persisted in the settings table, so it must not change between runs;
    /// it is taken from an MD5 digest rather than `std::hash`.
    pub fn identity_hash(&self) -> u64 {
        let mut material = String::new();
        for field in [&self.title, &self.artist, &self.album_artist, &self.album] {
            match field {
                Some(value) => {
                    material.push('1');
                    material.push_str(value);
                }
                None => material.push('0'),
            }
            material.push('\u{1f}');
        }
        match self.play_count {
            Some(count) => material.push_str(&format!("1{}", count)),
            None => material.push('0'),
        }

        let digest = md5::compute(material.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest.0[..8]);
        u64::from_be_bytes(bytes)
    }
}

impl PartialEq for TrackMetadata {
    fn eq(&self, other: &Self) -> bool {
        self.title == other.title
            && self.artist == other.artist
            && self.album_artist == other.album_artist
            && self.album == other.album
            && self.play_count == other.play_count
    }
}

impl Eq for TrackMetadata {}

impl Hash for TrackMetadata {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.title.hash(state);
        self.artist.hash(state);
        self.album_artist.hash(state);
        self.album.hash(state);
        self.play_count.hash(state);
    }
}

impl fmt::Display for TrackMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {}",
            self.artist.as_deref().unwrap_or("<unknown artist>"),
            self.title.as_deref().unwrap_or("<unknown title>")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn song() -> TrackMetadata {
        TrackMetadata::default()
            .with_title("Song")
            .with_artist("Artist")
            .with_duration(40.0)
    }

    #[test]
    fn test_empty_strings_are_absent() {
        let track = TrackMetadata::default().with_title("").with_album("");
        assert_eq!(track.title, None);
        assert_eq!(track.album, None);

        let raw = TrackMetadata {
            artist: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(raw.normalized().artist, None);
    }

    #[test]
    fn test_can_be_scrobbled() {
        assert!(song().can_be_scrobbled());
        assert!(!song().with_duration(29.9).can_be_scrobbled());
        assert!(!TrackMetadata::default()
            .with_artist("Artist")
            .with_duration(200.0)
            .can_be_scrobbled());
        assert!(!TrackMetadata::default()
            .with_title("Song")
            .with_duration(200.0)
            .can_be_scrobbled());

        let mut no_duration = song();
        no_duration.duration_seconds = None;
        assert!(!no_duration.can_be_scrobbled());
    }

    #[test]
    fn test_scrobble_threshold() {
        assert_eq!(song().scrobble_threshold(), Some(20.0));
        assert_eq!(song().with_duration(600.0).scrobble_threshold(), Some(240.0));
        assert_eq!(TrackMetadata::default().scrobble_threshold(), None);
    }

    #[test]
    fn test_identity_ignores_duration() {
        let a = song();
        let b = song().with_duration(41.5);
        assert_eq!(a, b);
        assert_eq!(a.identity_hash(), b.identity_hash());

        let replay = song().with_play_count(3);
        assert_ne!(a, replay);
        assert_ne!(a.identity_hash(), replay.identity_hash());
    }

    #[test]
    fn test_identity_distinguishes_missing_fields() {
        let with_album = song().with_album("X");
        let with_album_artist = song().with_album_artist("X");
        assert_ne!(with_album.identity_hash(), with_album_artist.identity_hash());
    }

    #[test]
    fn test_identity_hash_is_stable() {
        assert_eq!(song().identity_hash(), song().identity_hash());
    }
}

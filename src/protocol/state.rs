//! Player state data model.
//!
//! [`PlayerState`] is the snapshot the device polls from its daemon and
//! publishes on the state topic; the session caches the latest one it
//! receives. The diff helpers here drive both the status publisher's
//! change detection and the session's change events.

use serde::{Deserialize, Serialize};

/// Playback state of the daemon.
#[derive(Copy, Clone, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    /// A track is playing.
    Playing,

    /// Playback is paused mid-track.
    Paused,

    /// Nothing is playing.
    Stopped,

    /// The daemon is buffering or loading a track.
    Loading,

    /// The daemon reported an error condition.
    Error,

    /// Anything the daemon reports that this protocol does not model.
    ///
    /// Catch-all on decode, so a newer daemon vocabulary degrades into
    /// `unknown` instead of failing the whole envelope.
    #[default]
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Loading => "loading",
            Self::Error => "error",
            Self::Unknown => "unknown",
        };
        write!(f, "{state}")
    }
}

/// Metadata of one song, either the current one or a playlist entry.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SongMeta {
    /// Track title.
    #[serde(default)]
    pub title: String,

    /// Track artist.
    #[serde(default)]
    pub artist: String,

    /// Track album.
    #[serde(default)]
    pub album: String,

    /// Daemon-relative file path; the stable identity of a track.
    pub file: String,

    /// Track length in seconds.
    #[serde(default)]
    pub duration: f64,

    /// Playback position in seconds, with fractional precision.
    #[serde(default)]
    pub position: f64,

    /// Marks the playing entry inside `playlistTracks`. At most one entry
    /// carries `true`; absent everywhere else.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_current: Option<bool>,
}

/// One entry of the playlist catalog returned by `getPlaylists`.
///
/// The player capability reports names only; devices that resolve tracks
/// eagerly may also attach `items`, and sessions preserve whatever they
/// were given.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistInfo {
    /// Playlist name, unique per daemon.
    pub name: String,

    /// Tracks of the playlist, if the device included them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<SongMeta>>,
}

impl PlaylistInfo {
    /// A catalog entry carrying the name only.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: None,
        }
    }
}

/// Snapshot of the daemon at one instant.
///
/// Invariants, enforced by [`PlayerState::clamped`] on both the polling
/// and the receiving side:
///
/// * `volume` is within `0..=100`
/// * `0 <= position <= duration` for the current song
/// * at most one `playlistTracks` entry is marked current
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    /// Playback state.
    pub state: PlaybackState,

    /// The song being played or paused, absent when stopped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_song: Option<SongMeta>,

    /// Volume in percent, `0..=100`.
    #[serde(default)]
    pub volume: u8,

    /// Whether the daemon repeats the queue.
    #[serde(default)]
    pub repeat: bool,

    /// Whether the daemon shuffles the queue.
    #[serde(default)]
    pub random: bool,

    /// Name of the active playlist, if one is loaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playlist: Option<String>,

    /// Tracks of the active playlist, in daemon order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playlist_tracks: Option<Vec<SongMeta>>,
}

impl PlayerState {
    /// The current song's file path, the identity used for track-change
    /// detection.
    #[must_use]
    pub fn song_file(&self) -> Option<&str> {
        self.current_song.as_ref().map(|song| song.file.as_str())
    }

    /// The current song's playback position in seconds.
    #[must_use]
    pub fn position(&self) -> Option<f64> {
        self.current_song.as_ref().map(|song| song.position)
    }

    /// The index of the entry marked current in `playlistTracks`.
    #[must_use]
    pub fn current_track_index(&self) -> Option<usize> {
        self.playlist_tracks
            .as_ref()?
            .iter()
            .position(|track| track.is_current == Some(true))
    }

    /// Whether this snapshot differs from `last` in any of the fields
    /// that warrant an immediate full publish: playback state, current
    /// song file, volume, repeat, random, or active playlist.
    ///
    /// Position drift alone is deliberately not immediate; it is paced
    /// by the position update interval instead.
    #[must_use]
    pub fn requires_immediate_publish(&self, last: &PlayerState) -> bool {
        self.state != last.state
            || self.song_file() != last.song_file()
            || self.volume != last.volume
            || self.repeat != last.repeat
            || self.random != last.random
            || self.playlist != last.playlist
    }

    /// Returns the snapshot with the data model invariants enforced.
    ///
    /// Volume clamps into `0..=100`, the current position clamps into
    /// `0..=duration` (when a duration is known), and only the first
    /// current-marked playlist entry keeps its marker.
    #[must_use]
    pub fn clamped(mut self) -> Self {
        self.volume = self.volume.min(100);

        if let Some(song) = self.current_song.as_mut() {
            song.position = song.position.max(0.0);
            if song.duration > 0.0 {
                song.position = song.position.min(song.duration);
            }
        }

        if let Some(tracks) = self.playlist_tracks.as_mut() {
            let mut seen_current = false;
            for track in tracks.iter_mut() {
                if track.is_current == Some(true) {
                    if seen_current {
                        track.is_current = None;
                    }
                    seen_current = true;
                }
            }
        }

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn song(file: &str, position: f64) -> SongMeta {
        SongMeta {
            title: "Title".to_owned(),
            artist: "Artist".to_owned(),
            album: "Album".to_owned(),
            file: file.to_owned(),
            duration: 180.0,
            position,
            is_current: None,
        }
    }

    fn playing(file: &str, position: f64, volume: u8) -> PlayerState {
        PlayerState {
            state: PlaybackState::Playing,
            current_song: Some(song(file, position)),
            volume,
            ..PlayerState::default()
        }
    }

    #[test]
    fn unknown_states_decode_without_error() {
        let state: PlaybackState = serde_json::from_str("\"daydreaming\"").unwrap();
        assert_eq!(state, PlaybackState::Unknown);
    }

    #[test]
    fn position_drift_is_not_immediate() {
        let last = playing("a.mp3", 10.0, 50);
        let next = playing("a.mp3", 11.0, 50);
        assert!(!next.requires_immediate_publish(&last));
    }

    #[test]
    fn immediate_triggers_cover_the_full_set() {
        let last = playing("a.mp3", 10.0, 50);

        let mut state_change = last.clone();
        state_change.state = PlaybackState::Paused;
        assert!(state_change.requires_immediate_publish(&last));

        let track_change = playing("b.mp3", 0.0, 50);
        assert!(track_change.requires_immediate_publish(&last));

        let volume_change = playing("a.mp3", 10.0, 70);
        assert!(volume_change.requires_immediate_publish(&last));

        let mut repeat_change = last.clone();
        repeat_change.repeat = true;
        assert!(repeat_change.requires_immediate_publish(&last));

        let mut random_change = last.clone();
        random_change.random = true;
        assert!(random_change.requires_immediate_publish(&last));

        let mut playlist_change = last.clone();
        playlist_change.playlist = Some("Favorites".to_owned());
        assert!(playlist_change.requires_immediate_publish(&last));
    }

    #[test]
    fn clamping_enforces_invariants() {
        let mut state = playing("a.mp3", 500.0, 180);
        state.playlist_tracks = Some(vec![
            SongMeta {
                is_current: Some(true),
                ..song("a.mp3", 0.0)
            },
            SongMeta {
                is_current: Some(true),
                ..song("b.mp3", 0.0)
            },
        ]);

        let clamped = state.clamped();
        assert_eq!(clamped.volume, 100);
        assert!((clamped.position().unwrap() - 180.0).abs() < f64::EPSILON);
        assert_eq!(clamped.current_track_index(), Some(0));
        let tracks = clamped.playlist_tracks.unwrap();
        assert_eq!(tracks[1].is_current, None);
    }

    #[test]
    fn camel_case_wire_names() {
        let state = playing("a.mp3", 1.5, 50);
        let json = serde_json::to_value(&state).unwrap();
        assert!(json.get("currentSong").is_some());
        assert!(json.get("current_song").is_none());
    }
}

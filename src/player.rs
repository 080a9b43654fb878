//! The player capability the bridge consumes.
//!
//! The bridge does not talk to a music daemon itself; the host process
//! hands it an implementation of [`Player`] wrapping whatever daemon it
//! runs (the reference deployment fronts an MPD instance). Every
//! standard command in the protocol vocabulary maps onto exactly one
//! operation here.
//!
//! Implementations are not assumed to be internally thread-safe: the
//! bridge serializes access by routing all calls through the dispatcher
//! and the status publisher, which never call concurrently into the same
//! operation. Implementations that wrap a single daemon connection
//! should still guard it, since the dispatcher and the publisher run as
//! separate tasks.

use async_trait::async_trait;

use crate::{
    error::Result,
    protocol::{PlayerState, SongMeta},
};

/// Abstract operations over the local music daemon.
///
/// All operations return success or failure; failures surface to remote
/// clients as `result=false` responses. [`Player::get_status`] is the
/// canonical source of truth for the status publisher and must return
/// within a bounded time; implementations with an unbounded daemon call
/// should enforce their own timeout and report failure instead.
#[async_trait]
pub trait Player: Send + Sync + 'static {
    /// Starts or resumes playback.
    async fn play(&self) -> Result<()>;

    /// Pauses playback, keeping the current position.
    async fn pause(&self) -> Result<()>;

    /// Stops playback.
    async fn stop(&self) -> Result<()>;

    /// Skips to the next track in the queue.
    async fn next(&self) -> Result<()>;

    /// Skips to the previous track in the queue.
    async fn previous(&self) -> Result<()>;

    /// Sets the volume in percent. Callers validate `0..=100` before
    /// invoking.
    async fn set_volume(&self, volume: u8) -> Result<()>;

    /// Returns the current volume in percent.
    async fn get_volume(&self) -> Result<u8>;

    /// Returns a full snapshot of the daemon.
    async fn get_status(&self) -> Result<PlayerState>;

    /// Returns the names of the stored playlists.
    async fn get_playlists(&self) -> Result<Vec<String>>;

    /// Replaces the queue with the named playlist and starts playback.
    async fn play_playlist(&self, name: &str) -> Result<()>;

    /// Returns the tracks of the named playlist, in order.
    async fn get_playlist_songs(&self, name: &str) -> Result<Vec<SongMeta>>;

    /// Creates a playlist from the given daemon-relative file paths.
    async fn create_playlist(&self, name: &str, files: &[String]) -> Result<()>;

    /// Deletes the named playlist.
    async fn delete_playlist(&self, name: &str) -> Result<()>;

    /// Plays the track at `index` in the current queue.
    ///
    /// The index refers to the playlist most recently reported through
    /// [`Player::get_playlists`] or [`Player::get_playlist_songs`];
    /// implementations reject stale or out-of-range indices rather than
    /// guessing.
    async fn play_track(&self, index: usize) -> Result<()>;

    /// Appends a file to the queue, or to the named stored playlist.
    async fn add_track(&self, file: &str, playlist: Option<&str>) -> Result<()>;

    /// Removes the track at `index` from the queue, or from the named
    /// stored playlist.
    async fn remove_track(&self, index: usize, playlist: Option<&str>) -> Result<()>;

    /// Moves a track from `from` to `to` within the queue, or within
    /// the named stored playlist.
    async fn reorder_track(&self, from: usize, to: usize, playlist: Option<&str>) -> Result<()>;

    /// Enables or disables repeat.
    async fn set_repeat(&self, repeat: bool) -> Result<()>;

    /// Enables or disables shuffle.
    async fn set_random(&self, random: bool) -> Result<()>;

    /// Triggers a rescan of the daemon's music database.
    async fn update_database(&self) -> Result<()>;
}

//! Events emitted by a client session.
//!
//! Sessions deliver these through the unbounded channel handed to
//! [`Session::new`](crate::session::Session::new). Events are emitted
//! after the session's caches have been updated, so a handler that reads
//! the cache back sees at least the state that triggered the event.

use crate::{
    protocol::{PlaybackState, PlaylistInfo, ResponseEnvelope},
    session::SessionStatus,
};

/// A change observed by the session.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// The playback state changed, e.g. from `stopped` to `playing`.
    StateChanged(PlaybackState),

    /// The current song's position changed; seconds with fractional
    /// precision.
    PositionChanged(f64),

    /// The volume changed; percent.
    VolumeChanged(u8),

    /// The playlist catalog was refreshed from a response.
    PlaylistsChanged(Vec<PlaylistInfo>),

    /// The session's connection status changed.
    ConnectionChanged(SessionStatus),

    /// A response envelope arrived, matched to a pending command or not.
    CommandResponse(ResponseEnvelope),

    /// An inbound payload could not be decoded and was dropped.
    Error(String),
}

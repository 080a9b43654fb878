//! Wire protocol types for the device namespace.
//!
//! A device namespace is selected by a `(prefix, deviceId)` pair and owns
//! four topics, one per message kind:
//!
//! | Topic | Direction | Retained |
//! |---|---|---|
//! | `{prefix}/{deviceId}/state` | device to client | yes |
//! | `{prefix}/{deviceId}/commands` | client to device | no |
//! | `{prefix}/{deviceId}/responses` | device to client | no |
//! | `{prefix}/{deviceId}/connection` | device to client | yes |
//!
//! # Submodules
//!
//! * [`topics`] - building and parsing the four canonical topic strings
//! * [`state`] - the player state data model carried by state envelopes
//! * [`messages`] - the four envelope kinds and their JSON codec
//!
//! Payloads are UTF-8 JSON objects with camelCase field names. Envelope
//! kinds are classified by field presence, not by an explicit tag; see
//! [`messages::Envelope`].

pub mod messages;
pub mod state;
pub mod topics;

pub use messages::{
    CommandEnvelope, ConnectionEnvelope, Envelope, Presence, ResponseEnvelope, StateEnvelope,
};
pub use state::{PlaybackState, PlayerState, PlaylistInfo, SongMeta};
pub use topics::{Topic, TopicKind, Topics};

//! Envelope kinds and their JSON codec.
//!
//! Four envelope kinds travel over a device namespace: commands, their
//! responses, retained state snapshots, and retained presence. There is
//! no explicit type tag on the wire; decoding classifies by field
//! presence:
//!
//! * `command` and `commandId` make a [`CommandEnvelope`]
//! * `commandId` and `result` make a [`ResponseEnvelope`]
//! * a top-level `state` makes a [`StateEnvelope`]
//! * a top-level `status` of `online`/`offline` makes a
//!   [`ConnectionEnvelope`]
//!
//! Anything else is rejected as malformed. Unknown sibling fields are
//! ignored; `params` and `data` payloads pass through verbatim as JSON
//! values.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::state::PlayerState;
use crate::{
    error::{Error, Result},
    util,
    uuid::Uuid,
};

/// A playback command issued by a client session.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    /// Command name from the standard vocabulary, e.g. `setVolume`, or an
    /// extension name the device registered.
    pub command: String,

    /// Correlation id, unique per producing session.
    pub command_id: Uuid,

    /// Command parameters; shape depends on the command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,

    /// Client wall clock in epoch seconds; diagnostic only.
    #[serde(default)]
    pub timestamp: f64,
}

impl CommandEnvelope {
    /// Builds a command with a fresh v4 correlation id and the current
    /// wall clock.
    pub fn new(command: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            command: command.into(),
            command_id: Uuid::fast_v4(),
            params,
            timestamp: util::unix_timestamp(),
        }
    }
}

/// The device's answer to one command.
///
/// Exactly one response per command is expected but not guaranteed;
/// duplicates are dropped idempotently by the session.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    /// Correlation id of the command being answered.
    ///
    /// This is a string rather than a [`Uuid`]: a command that could not
    /// even be decoded is answered best-effort with an empty id.
    pub command_id: String,

    /// Whether the command succeeded.
    pub result: bool,

    /// Human-readable outcome, e.g. `play ok` or an error description.
    #[serde(default)]
    pub message: String,

    /// Command-specific payload, e.g. the state object for `getStatus`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Device wall clock in epoch seconds; diagnostic only.
    #[serde(default)]
    pub timestamp: f64,
}

impl ResponseEnvelope {
    /// A successful response for `command_id`.
    pub fn ok(command_id: Uuid, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            command_id: command_id.to_string(),
            result: true,
            message: message.into(),
            data,
            timestamp: util::unix_timestamp(),
        }
    }

    /// A failed response for `command_id`.
    pub fn fail(command_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            command_id: command_id.to_string(),
            result: false,
            message: message.into(),
            data: None,
            timestamp: util::unix_timestamp(),
        }
    }

    /// The best-effort answer to a payload that did not decode as a
    /// command: failure, with an empty correlation id.
    #[must_use]
    pub fn malformed() -> Self {
        Self {
            command_id: String::new(),
            result: false,
            message: "malformed command".to_owned(),
            data: None,
            timestamp: util::unix_timestamp(),
        }
    }

    /// The correlation id parsed back into a [`Uuid`], if present and
    /// well-formed.
    #[must_use]
    pub fn correlation(&self) -> Option<Uuid> {
        self.command_id.parse().ok()
    }
}

/// A retained snapshot of the player, published on every state change
/// and periodically as a refresh.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct StateEnvelope {
    /// The snapshot itself; its fields sit at the top level of the JSON
    /// object.
    #[serde(flatten)]
    pub player: PlayerState,

    /// Device wall clock in epoch seconds; diagnostic only.
    #[serde(default)]
    pub timestamp: f64,
}

impl StateEnvelope {
    /// Wraps a snapshot with the current wall clock.
    #[must_use]
    pub fn new(player: PlayerState) -> Self {
        Self {
            player,
            timestamp: util::unix_timestamp(),
        }
    }
}

/// Device presence, retained on the connection topic.
///
/// `offline` is also configured as the device's last will, so the broker
/// publishes it when the device vanishes without a farewell.
#[derive(Copy, Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    /// The device session is up.
    Online,

    /// The device session ended, gracefully or through the last will.
    Offline,
}

impl fmt::Display for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// A presence announcement.
#[derive(Copy, Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEnvelope {
    /// Online or offline.
    pub status: Presence,

    /// Device wall clock in epoch seconds; diagnostic only.
    #[serde(default)]
    pub timestamp: f64,
}

impl ConnectionEnvelope {
    /// Builds an announcement with the current wall clock.
    #[must_use]
    pub fn new(status: Presence) -> Self {
        Self {
            status,
            timestamp: util::unix_timestamp(),
        }
    }
}

/// Any envelope, classified by field presence.
///
/// The variant order implements the classification rules: serde tries
/// them top to bottom, and each variant's required fields exclude the
/// ones above it. `Connection` has to be last, or its lone required
/// `status` field would never be reached behind a hypothetical broader
/// match; `State` must come after `Command` and `Response`, whose
/// required fields a state object never carries.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(untagged)]
// Large size difference between variants is OK because the largest
// variant, `State`, is also by far the most frequent on the wire.
#[allow(clippy::large_enum_variant)]
pub enum Envelope {
    /// A command: `command` plus `commandId` present.
    Command(CommandEnvelope),

    /// A response: `commandId` plus `result` present.
    Response(ResponseEnvelope),

    /// A state snapshot: top-level `state` present.
    State(StateEnvelope),

    /// A presence announcement: top-level `status` present.
    Connection(ConnectionEnvelope),
}

impl Envelope {
    /// Decodes an envelope from a UTF-8 JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedMessage`](crate::error::ErrorKind::MalformedMessage)
    /// when the payload is not valid JSON or matches none of the four
    /// envelope kinds.
    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| Error::malformed_message(format!("unclassifiable envelope: {e}")))
    }

    /// Encodes the envelope as a UTF-8 JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedMessage`](crate::error::ErrorKind::MalformedMessage)
    /// when a `params` or `data` value cannot be serialized, which only
    /// happens for non-string map keys.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(Into::into)
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command(command) => {
                write!(f, "command {} ({})", command.command, command.command_id)
            }
            Self::Response(response) => write!(
                f,
                "response {} ({})",
                if response.result { "ok" } else { "failed" },
                response.command_id
            ),
            Self::State(state) => write!(f, "state {}", state.player.state),
            Self::Connection(connection) => write!(f, "connection {}", connection.status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::state::{PlaybackState, SongMeta};
    use serde_json::json;

    #[test]
    fn command_round_trips() {
        let command = CommandEnvelope::new("setVolume", Some(json!({"volume": 70})));
        let payload = Envelope::Command(command.clone()).to_vec().unwrap();
        let decoded = Envelope::from_slice(&payload).unwrap();
        assert_eq!(decoded, Envelope::Command(command));
    }

    #[test]
    fn response_round_trips() {
        let response = ResponseEnvelope::ok(
            Uuid::fast_v4(),
            "getVolume ok",
            Some(json!({"volume": 50})),
        );
        let payload = Envelope::Response(response.clone()).to_vec().unwrap();
        let decoded = Envelope::from_slice(&payload).unwrap();
        assert_eq!(decoded, Envelope::Response(response));
    }

    #[test]
    fn state_round_trips_with_flattened_fields() {
        let state = StateEnvelope::new(PlayerState {
            state: PlaybackState::Playing,
            current_song: Some(SongMeta {
                file: "a.mp3".to_owned(),
                duration: 180.0,
                position: 12.5,
                ..SongMeta::default()
            }),
            volume: 50,
            ..PlayerState::default()
        });

        let payload = Envelope::State(state.clone()).to_vec().unwrap();
        let raw: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(raw["state"], "playing");
        assert_eq!(raw["currentSong"]["file"], "a.mp3");

        let decoded = Envelope::from_slice(&payload).unwrap();
        assert_eq!(decoded, Envelope::State(state));
    }

    #[test]
    fn connection_round_trips() {
        let connection = ConnectionEnvelope::new(Presence::Offline);
        let payload = Envelope::Connection(connection).to_vec().unwrap();
        let decoded = Envelope::from_slice(&payload).unwrap();
        assert_eq!(decoded, Envelope::Connection(connection));
    }

    #[test]
    fn classification_by_field_presence() {
        let command = json!({
            "command": "play",
            "commandId": "550e8400-e29b-41d4-a716-446655440000",
            "timestamp": 1.0,
        });
        assert!(matches!(
            Envelope::from_slice(command.to_string().as_bytes()).unwrap(),
            Envelope::Command(_)
        ));

        let response = json!({
            "commandId": "550e8400-e29b-41d4-a716-446655440000",
            "result": true,
            "message": "play ok",
        });
        assert!(matches!(
            Envelope::from_slice(response.to_string().as_bytes()).unwrap(),
            Envelope::Response(_)
        ));

        let state = json!({"state": "stopped", "volume": 50});
        assert!(matches!(
            Envelope::from_slice(state.to_string().as_bytes()).unwrap(),
            Envelope::State(_)
        ));

        let connection = json!({"status": "online", "timestamp": 1.0});
        assert!(matches!(
            Envelope::from_slice(connection.to_string().as_bytes()).unwrap(),
            Envelope::Connection(_)
        ));
    }

    #[test]
    fn unclassifiable_payloads_are_rejected() {
        for payload in [
            &b"not json"[..],
            br#"{"unrelated": true}"#,
            br#"{"status": "sideways"}"#,
            br#"{"commandId": "x", "result": "yes"}"#,
        ] {
            assert!(Envelope::from_slice(payload).is_err());
        }
    }

    #[test]
    fn unknown_sibling_fields_are_ignored() {
        let payload = json!({
            "status": "online",
            "timestamp": 1.0,
            "firmware": "2.4.1",
        });
        let decoded = Envelope::from_slice(payload.to_string().as_bytes()).unwrap();
        assert!(matches!(decoded, Envelope::Connection(_)));
    }

    #[test]
    fn malformed_command_response_has_empty_id() {
        let response = ResponseEnvelope::malformed();
        assert_eq!(response.command_id, "");
        assert!(!response.result);
        assert_eq!(response.message, "malformed command");
        assert_eq!(response.correlation(), None);
    }

    #[test]
    fn non_uuid_command_id_fails_command_decode() {
        let payload = json!({
            "command": "play",
            "commandId": "not-a-uuid",
            "timestamp": 1.0,
        });
        assert!(Envelope::from_slice(payload.to_string().as_bytes()).is_err());
    }
}

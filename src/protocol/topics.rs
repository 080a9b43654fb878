//! Topic strings for a device namespace.
//!
//! Topics are `{prefix}/{deviceId}/{kind}` where the prefix may itself
//! contain `/` separators (the default is `amora/devices`). Subscribers
//! always list exact topics; no wildcards are built or accepted here.

use std::{fmt, str::FromStr};

use serde_with::{DeserializeFromStr, SerializeDisplay};

use crate::error::Error;

/// The four message kinds a device namespace carries.
#[derive(
    Copy, Clone, Debug, DeserializeFromStr, Eq, Hash, PartialEq, PartialOrd, Ord, SerializeDisplay,
)]
pub enum TopicKind {
    /// Retained player state snapshots, device to client.
    State,

    /// Playback commands, client to device.
    Commands,

    /// Command responses, device to client.
    Responses,

    /// Retained device presence, device to client; also the last-will
    /// target.
    Connection,
}

impl TopicKind {
    /// Wire value for [`TopicKind::State`].
    const STATE: &'static str = "state";

    /// Wire value for [`TopicKind::Commands`].
    const COMMANDS: &'static str = "commands";

    /// Wire value for [`TopicKind::Responses`].
    const RESPONSES: &'static str = "responses";

    /// Wire value for [`TopicKind::Connection`].
    const CONNECTION: &'static str = "connection";

    /// All kinds, in a stable order.
    pub const ALL: [TopicKind; 4] = [
        TopicKind::State,
        TopicKind::Commands,
        TopicKind::Responses,
        TopicKind::Connection,
    ];
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::State => Self::STATE,
            Self::Commands => Self::COMMANDS,
            Self::Responses => Self::RESPONSES,
            Self::Connection => Self::CONNECTION,
        };
        write!(f, "{kind}")
    }
}

impl FromStr for TopicKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            Self::STATE => Ok(Self::State),
            Self::COMMANDS => Ok(Self::Commands),
            Self::RESPONSES => Ok(Self::Responses),
            Self::CONNECTION => Ok(Self::Connection),
            _ => Err(Self::Err::malformed_message(format!(
                "unknown topic kind `{s}`"
            ))),
        }
    }
}

/// A fully qualified topic: `(prefix, deviceId, kind)`.
///
/// `Display` renders the wire form; `FromStr` parses it back. Parsing
/// right-splits the two trailing segments, so the prefix may contain `/`
/// but the device id may not.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Topic {
    /// Namespace prefix, e.g. `amora/devices`.
    pub prefix: String,

    /// Device identifier within the prefix.
    pub device_id: String,

    /// Which of the four per-device topics this is.
    pub kind: TopicKind,
}

impl Topic {
    /// Topic segment separator.
    pub(crate) const SEPARATOR: char = '/';

    /// Builds a topic from its parts.
    pub fn new(prefix: impl Into<String>, device_id: impl Into<String>, kind: TopicKind) -> Self {
        Self {
            prefix: prefix.into(),
            device_id: device_id.into(),
            kind,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}{}{}",
            self.prefix,
            Self::SEPARATOR,
            self.device_id,
            Self::SEPARATOR,
            self.kind
        )
    }
}

impl FromStr for Topic {
    type Err = Error;

    /// Parses a concrete topic string into its `(prefix, deviceId, kind)`
    /// parts.
    ///
    /// # Errors
    ///
    /// Will return `Err` if:
    /// - fewer than three segments are present
    /// - the prefix or device id segment is empty
    /// - the trailing segment is not a known kind
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (rest, kind) = s.rsplit_once(Self::SEPARATOR).ok_or_else(|| {
            Self::Err::malformed_message(format!("topic `{s}` should hold a kind segment"))
        })?;
        let kind = kind.parse::<TopicKind>()?;

        let (prefix, device_id) = rest.rsplit_once(Self::SEPARATOR).ok_or_else(|| {
            Self::Err::malformed_message(format!("topic `{s}` should hold a device id segment"))
        })?;
        if prefix.is_empty() || device_id.is_empty() {
            return Err(Self::Err::malformed_message(format!(
                "topic `{s}` should hold non-empty prefix and device id"
            )));
        }

        Ok(Self {
            prefix: prefix.to_owned(),
            device_id: device_id.to_owned(),
            kind,
        })
    }
}

/// The four canonical topics of one device namespace, precomputed.
///
/// Both sides of the protocol hold one of these: the bridge to know what
/// to subscribe to and where to publish, the session likewise with the
/// directions swapped. [`Topics::kind_of`] only recognizes this
/// namespace's exact topics, so foreign traffic is cheaply ignored.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Topics {
    prefix: String,
    device_id: String,
    state: String,
    commands: String,
    responses: String,
    connection: String,
}

impl Topics {
    /// Precomputes the topic strings for `(prefix, device_id)`.
    pub fn new(prefix: impl Into<String>, device_id: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let device_id = device_id.into();
        let topic =
            |kind: TopicKind| Topic::new(prefix.clone(), device_id.clone(), kind).to_string();

        Self {
            state: topic(TopicKind::State),
            commands: topic(TopicKind::Commands),
            responses: topic(TopicKind::Responses),
            connection: topic(TopicKind::Connection),
            prefix,
            device_id,
        }
    }

    /// The namespace prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The device id.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// The retained state topic.
    #[must_use]
    pub fn state(&self) -> &str {
        &self.state
    }

    /// The command topic.
    #[must_use]
    pub fn commands(&self) -> &str {
        &self.commands
    }

    /// The response topic.
    #[must_use]
    pub fn responses(&self) -> &str {
        &self.responses
    }

    /// The retained presence topic.
    #[must_use]
    pub fn connection(&self) -> &str {
        &self.connection
    }

    /// The topic string for `kind`.
    #[must_use]
    pub fn topic(&self, kind: TopicKind) -> &str {
        match kind {
            TopicKind::State => self.state(),
            TopicKind::Commands => self.commands(),
            TopicKind::Responses => self.responses(),
            TopicKind::Connection => self.connection(),
        }
    }

    /// Classifies a concrete topic within this namespace.
    ///
    /// Returns `None` for topics of other namespaces or other devices,
    /// including near misses like wildcard strings.
    #[must_use]
    pub fn kind_of(&self, topic: &str) -> Option<TopicKind> {
        TopicKind::ALL
            .into_iter()
            .find(|kind| self.topic(*kind) == topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_parse_is_identity() {
        for kind in TopicKind::ALL {
            let topic = Topic::new("amora/devices", "kitchen-pi", kind);
            let parsed = topic.to_string().parse::<Topic>().unwrap();
            assert_eq!(topic, parsed);
        }
    }

    #[test]
    fn parse_keeps_multi_segment_prefix() {
        let topic = "tenant/amora/devices/dev-1/state".parse::<Topic>().unwrap();
        assert_eq!(topic.prefix, "tenant/amora/devices");
        assert_eq!(topic.device_id, "dev-1");
        assert_eq!(topic.kind, TopicKind::State);
    }

    #[test]
    fn parse_rejects_unknown_kind() {
        assert!("amora/devices/dev-1/telemetry".parse::<Topic>().is_err());
    }

    #[test]
    fn parse_rejects_missing_segments() {
        assert!("state".parse::<Topic>().is_err());
        assert!("dev-1/state".parse::<Topic>().is_err());
        assert!("//state".parse::<Topic>().is_err());
    }

    #[test]
    fn namespace_topics_are_canonical() {
        let topics = Topics::new("amora/devices", "dev-1");
        assert_eq!(topics.state(), "amora/devices/dev-1/state");
        assert_eq!(topics.commands(), "amora/devices/dev-1/commands");
        assert_eq!(topics.responses(), "amora/devices/dev-1/responses");
        assert_eq!(topics.connection(), "amora/devices/dev-1/connection");
    }

    #[test]
    fn kind_of_only_matches_own_namespace() {
        let topics = Topics::new("amora/devices", "dev-1");
        assert_eq!(
            topics.kind_of("amora/devices/dev-1/commands"),
            Some(TopicKind::Commands)
        );
        assert_eq!(topics.kind_of("amora/devices/dev-2/commands"), None);
        assert_eq!(topics.kind_of("other/dev-1/commands"), None);
        assert_eq!(topics.kind_of("amora/devices/dev-1/#"), None);
    }
}

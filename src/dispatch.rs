//! Device-side command dispatcher.
//!
//! Consumes command envelopes from the commands topic, routes them to
//! the player capability or to a registered extension handler, and
//! answers every one of them on the responses topic. Commands are
//! processed in arrival order; correlation is carried by the command id,
//! so a slow handler delays later commands but never mismatches their
//! responses.
//!
//! Nothing here aborts the dispatcher: malformed payloads, unknown
//! commands, bad parameters and player failures all become
//! `result=false` responses.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};

use crate::{
    error::{Error, Result},
    player::Player,
    protocol::{CommandEnvelope, Envelope, PlaylistInfo, ResponseEnvelope, TopicKind, Topics},
    transport::{InboundMessage, QoS, Transport},
};

/// What a handler produces; becomes a [`ResponseEnvelope`] once the
/// command id is attached.
#[derive(Clone, Debug, PartialEq)]
pub struct Reply {
    /// Whether the command succeeded.
    pub result: bool,

    /// Human-readable outcome.
    pub message: String,

    /// Command-specific payload.
    pub data: Option<Value>,
}

impl Reply {
    /// A successful reply without data.
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            result: true,
            message: message.into(),
            data: None,
        }
    }

    /// A successful reply carrying data.
    pub fn ok_with(message: impl Into<String>, data: Value) -> Self {
        Self {
            result: true,
            message: message.into(),
            data: Some(data),
        }
    }

    /// A failed reply.
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            result: false,
            message: message.into(),
            data: None,
        }
    }

    fn into_response(self, command_id: crate::uuid::Uuid) -> ResponseEnvelope {
        if self.result {
            ResponseEnvelope::ok(command_id, self.message, self.data)
        } else {
            ResponseEnvelope::fail(command_id, self.message)
        }
    }
}

/// An extension command handler.
///
/// Receives the envelope's `params` and produces a [`Reply`]; panics are
/// not caught, so handlers are expected to express failure through
/// [`Reply::fail`].
pub type Handler = Box<dyn Fn(Option<Value>) -> BoxFuture<'static, Reply> + Send + Sync>;

/// Routes inbound command envelopes to handlers and publishes responses.
pub struct Dispatcher {
    player: Arc<dyn Player>,
    transport: Arc<dyn Transport>,
    topics: Topics,
    qos: QoS,
    handlers: HashMap<String, Handler>,
}

impl Dispatcher {
    /// Builds a dispatcher for the standard command vocabulary.
    pub fn new(
        player: Arc<dyn Player>,
        transport: Arc<dyn Transport>,
        topics: Topics,
        qos: QoS,
    ) -> Self {
        Self {
            player,
            transport,
            topics,
            qos,
            handlers: HashMap::new(),
        }
    }

    /// Registers an extension handler for `command`.
    ///
    /// Registered handlers take precedence over the standard vocabulary,
    /// so this can also override a built-in command.
    pub fn register(&mut self, command: impl Into<String>, handler: Handler) {
        let command = command.into();
        debug!("registered handler for command {command}");
        self.handlers.insert(command, handler);
    }

    /// Consumes the inbound stream until it closes or shutdown fires.
    pub async fn run(self, mut inbound: mpsc::UnboundedReceiver<InboundMessage>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                message = inbound.recv() => match message {
                    Some(message) => self.handle(message).await,
                    None => break,
                },
            }
        }
        debug!("dispatcher stopped");
    }

    /// Handles one inbound message end to end.
    async fn handle(&self, message: InboundMessage) {
        if self.topics.kind_of(&message.topic) != Some(TopicKind::Commands) {
            trace!("ignoring message on {}", message.topic);
            return;
        }

        let response = match Envelope::from_slice(&message.payload) {
            Ok(Envelope::Command(command)) => {
                debug!("executing {} ({})", command.command, command.command_id);
                self.dispatch(command).await
            }
            Ok(envelope) => {
                warn!("non-command envelope on commands topic: {envelope}");
                ResponseEnvelope::malformed()
            }
            Err(e) => {
                warn!("undecodable command payload: {e}");
                ResponseEnvelope::malformed()
            }
        };

        let payload = match serde_json::to_vec(&response) {
            Ok(payload) => payload,
            Err(e) => {
                error!("failed to encode response: {e}");
                return;
            }
        };

        // Best effort: a response lost to a transport outage is
        // indistinguishable from a lost delivery and the client's
        // timeout covers both.
        if let Err(e) = self
            .transport
            .publish(self.topics.responses(), payload, self.qos, false)
            .await
        {
            warn!("failed to publish response: {e}");
        }
    }

    /// Executes one decoded command and produces its response.
    ///
    /// Public so hosts can exercise handlers without a transport, e.g.
    /// from a cloud direct-method adapter sharing the same vocabulary.
    pub async fn dispatch(&self, command: CommandEnvelope) -> ResponseEnvelope {
        let reply = if let Some(handler) = self.handlers.get(&command.command) {
            handler(command.params.clone()).await
        } else {
            self.standard(&command).await
        };

        if !reply.result {
            info!("command {} failed: {}", command.command, reply.message);
        }
        reply.into_response(command.command_id)
    }

    /// The standard command vocabulary, mapped 1:1 onto the player
    /// capability.
    async fn standard(&self, command: &CommandEnvelope) -> Reply {
        let params = command.params.clone();
        match command.command.as_str() {
            "play" => unit(self.player.play().await, "play"),
            "pause" => unit(self.player.pause().await, "pause"),
            "stop" => unit(self.player.stop().await, "stop"),
            "next" => unit(self.player.next().await, "next"),
            "previous" => unit(self.player.previous().await, "previous"),
            "updateDatabase" => unit(self.player.update_database().await, "updateDatabase"),

            "setVolume" => match checked(decode::<VolumeParams>(params)) {
                Ok(p) => unit(self.player.set_volume(p).await, "setVolume"),
                Err(reply) => reply,
            },
            "getVolume" => match self.player.get_volume().await {
                Ok(volume) => Reply::ok_with("getVolume ok", json!({ "volume": volume })),
                Err(e) => Reply::fail(e.to_string()),
            },

            "setRepeat" => match decode::<RepeatParams>(params) {
                Ok(p) => unit(self.player.set_repeat(p.repeat).await, "setRepeat"),
                Err(e) => Reply::fail(e.to_string()),
            },
            "setRandom" => match decode::<RandomParams>(params) {
                Ok(p) => unit(self.player.set_random(p.random).await, "setRandom"),
                Err(e) => Reply::fail(e.to_string()),
            },

            "getStatus" => match self.player.get_status().await {
                Ok(state) => match serde_json::to_value(state.clamped()) {
                    Ok(data) => Reply::ok_with("getStatus ok", data),
                    Err(e) => Reply::fail(Error::from(e).to_string()),
                },
                Err(e) => Reply::fail(e.to_string()),
            },

            "getPlaylists" => match self.player.get_playlists().await {
                Ok(names) => {
                    let playlists: Vec<PlaylistInfo> =
                        names.into_iter().map(PlaylistInfo::named).collect();
                    Reply::ok_with("getPlaylists ok", json!({ "playlists": playlists }))
                }
                Err(e) => Reply::fail(e.to_string()),
            },
            "playPlaylist" => match decode::<NameParams>(params) {
                Ok(p) => unit(self.player.play_playlist(&p.name).await, "playPlaylist"),
                Err(e) => Reply::fail(e.to_string()),
            },
            "getPlaylistSongs" => match decode::<NameParams>(params) {
                Ok(p) => match self.player.get_playlist_songs(&p.name).await {
                    Ok(songs) => Reply::ok_with("getPlaylistSongs ok", json!({ "songs": songs })),
                    Err(e) => Reply::fail(e.to_string()),
                },
                Err(e) => Reply::fail(e.to_string()),
            },
            "createPlaylist" => match decode::<CreatePlaylistParams>(params) {
                Ok(p) => unit(
                    self.player.create_playlist(&p.name, &p.files).await,
                    "createPlaylist",
                ),
                Err(e) => Reply::fail(e.to_string()),
            },
            "deletePlaylist" => match decode::<NameParams>(params) {
                Ok(p) => unit(self.player.delete_playlist(&p.name).await, "deletePlaylist"),
                Err(e) => Reply::fail(e.to_string()),
            },

            "playTrack" => match decode::<IndexParams>(params).and_then(|p| p.index()) {
                Ok(index) => unit(self.player.play_track(index).await, "playTrack"),
                Err(e) => Reply::fail(e.to_string()),
            },
            "addTrack" => match decode::<FileParams>(params) {
                Ok(p) => unit(
                    self.player.add_track(&p.file, p.playlist.as_deref()).await,
                    "addTrack",
                ),
                Err(e) => Reply::fail(e.to_string()),
            },
            "removeTrack" => match decode::<IndexParams>(params) {
                Ok(p) => match p.index() {
                    Ok(index) => unit(
                        self.player
                            .remove_track(index, p.playlist.as_deref())
                            .await,
                        "removeTrack",
                    ),
                    Err(e) => Reply::fail(e.to_string()),
                },
                Err(e) => Reply::fail(e.to_string()),
            },
            "reorderTrack" => match decode::<ReorderParams>(params).and_then(ReorderParams::indices)
            {
                Ok((from, to, playlist)) => unit(
                    self.player
                        .reorder_track(from, to, playlist.as_deref())
                        .await,
                    "reorderTrack",
                ),
                Err(e) => Reply::fail(e.to_string()),
            },

            _ => Reply::fail("unknown command"),
        }
    }
}

/// Collapses a unit player result into a reply.
fn unit(result: Result<()>, command: &str) -> Reply {
    match result {
        Ok(()) => Reply::ok(format!("{command} ok")),
        Err(e) => Reply::fail(e.to_string()),
    }
}

/// Decodes `params` into the command's parameter shape.
fn decode<T: DeserializeOwned>(params: Option<Value>) -> Result<T> {
    let params = params.ok_or_else(|| Error::invalid_argument("missing params"))?;
    serde_json::from_value(params).map_err(|e| Error::invalid_argument(e.to_string()))
}

/// Range-checks a decoded volume into `0..=100`.
fn checked(params: Result<VolumeParams>) -> std::result::Result<u8, Reply> {
    let volume = params.map_err(|e| Reply::fail(e.to_string()))?.volume;
    u8::try_from(volume)
        .ok()
        .filter(|v| *v <= 100)
        .ok_or_else(|| {
            Reply::fail(
                Error::invalid_argument(format!("volume {volume} out of range 0..=100"))
                    .to_string(),
            )
        })
}

#[derive(serde::Deserialize)]
struct VolumeParams {
    volume: i64,
}

#[derive(serde::Deserialize)]
struct RepeatParams {
    repeat: bool,
}

#[derive(serde::Deserialize)]
struct RandomParams {
    random: bool,
}

#[derive(serde::Deserialize)]
struct NameParams {
    name: String,
}

#[derive(serde::Deserialize)]
struct CreatePlaylistParams {
    name: String,
    #[serde(default)]
    files: Vec<String>,
}

#[derive(serde::Deserialize)]
struct IndexParams {
    index: i64,
    #[serde(default)]
    playlist: Option<String>,
}

impl IndexParams {
    fn index(&self) -> Result<usize> {
        usize::try_from(self.index)
            .map_err(|_| Error::invalid_argument(format!("index {} is negative", self.index)))
    }
}

#[derive(serde::Deserialize)]
struct FileParams {
    file: String,
    #[serde(default)]
    playlist: Option<String>,
}

#[derive(serde::Deserialize)]
struct ReorderParams {
    from: i64,
    to: i64,
    #[serde(default)]
    playlist: Option<String>,
}

impl ReorderParams {
    fn indices(self) -> Result<(usize, usize, Option<String>)> {
        let from = usize::try_from(self.from)
            .map_err(|_| Error::invalid_argument(format!("from {} is negative", self.from)))?;
        let to = usize::try_from(self.to)
            .map_err(|_| Error::invalid_argument(format!("to {} is negative", self.to)))?;
        Ok((from, to, self.playlist))
    }
}

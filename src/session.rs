//! Client-side session against one device namespace.
//!
//! A [`Session`] subscribes to a device's state and responses topics,
//! keeps the last received [`PlayerState`] and playlist catalog cached,
//! and exposes one async method per player operation. Each command is
//! correlated by a fresh v4 command id; the returned future resolves
//! with the response's `data` or rejects with the response's message, a
//! timeout, or a disconnect.
//!
//! All cache and pending-table mutations happen behind short-lived
//! locks; events are emitted after the locks are released, so an event
//! handler reading the cache back never deadlocks and always sees at
//! least the state that triggered it.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde_json::{json, Value};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::Instant,
};

use crate::{
    config::Config,
    error::{Error, Result},
    events::Event,
    protocol::{
        CommandEnvelope, Envelope, PlayerState, PlaylistInfo, ResponseEnvelope, SongMeta,
        TopicKind, Topics,
    },
    transport::{ConnectionState, InboundMessage, MqttTransport, QoS, Transport},
    uuid::Uuid,
};

/// Connection status as session consumers see it.
///
/// A deliberate reduction of the transport's state: terminal transport
/// errors read as `Disconnected` here, since from the caller's point of
/// view that is what they are.
#[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
pub enum SessionStatus {
    /// No connection.
    #[default]
    Disconnected,

    /// Connecting or reconnecting.
    Connecting,

    /// Connected and subscribed.
    Connected,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// A command awaiting its response.
struct Pending {
    reply_tx: oneshot::Sender<Result<Option<Value>>>,
    enqueued_at: Instant,
}

/// State shared between the session handle and its background tasks.
struct Shared {
    transport: Arc<dyn Transport>,
    topics: Topics,
    qos: QoS,
    command_timeout: Duration,
    status: Mutex<SessionStatus>,
    last_state: Mutex<Option<PlayerState>>,
    playlists: Mutex<Vec<PlaylistInfo>>,
    pending: Mutex<HashMap<Uuid, Pending>>,
    event_tx: mpsc::UnboundedSender<Event>,
}

/// Locks without propagating poisoning: a panicked event handler must
/// not wedge every future cache access.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn emit(&self, event: Event) {
        if self.event_tx.send(event).is_err() {
            trace!("event receiver dropped");
        }
    }

    /// Updates the status, returning whether it actually changed.
    fn set_status(&self, status: SessionStatus) -> bool {
        let mut current = lock(&self.status);
        if *current == status {
            false
        } else {
            *current = status;
            true
        }
    }

    async fn subscribe_topics(&self) -> Result<()> {
        self.transport
            .subscribe(self.topics.state(), self.qos)
            .await?;
        self.transport
            .subscribe(self.topics.responses(), self.qos)
            .await
    }

    /// Publishes one command and awaits its correlated response.
    async fn send_command(&self, command: &str, params: Option<Value>) -> Result<Option<Value>> {
        let envelope = CommandEnvelope::new(command, params);
        let command_id = envelope.command_id;
        let payload = Envelope::Command(envelope).to_vec()?;

        let (reply_tx, reply_rx) = oneshot::channel();
        lock(&self.pending).insert(
            command_id,
            Pending {
                reply_tx,
                enqueued_at: Instant::now(),
            },
        );

        if let Err(e) = self
            .transport
            .publish(self.topics.commands(), payload, self.qos, false)
            .await
        {
            lock(&self.pending).remove(&command_id);
            return Err(e);
        }
        trace!("sent {command} ({command_id})");

        match reply_rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::disconnected("session closed before the response")),
        }
    }

    /// Routes one inbound message by topic kind.
    fn route(&self, message: &InboundMessage) {
        match self.topics.kind_of(&message.topic) {
            Some(TopicKind::State) => match Envelope::from_slice(&message.payload) {
                Ok(Envelope::State(envelope)) => self.apply_state(envelope.player.clamped()),
                Ok(envelope) => {
                    warn!("unexpected envelope on state topic: {envelope}");
                    self.emit(Event::Error(format!(
                        "unexpected envelope on state topic: {envelope}"
                    )));
                }
                Err(e) => {
                    warn!("dropping malformed state payload: {e}");
                    self.emit(Event::Error(e.to_string()));
                }
            },
            Some(TopicKind::Responses) => match Envelope::from_slice(&message.payload) {
                Ok(Envelope::Response(response)) => self.handle_response(response),
                Ok(envelope) => {
                    warn!("unexpected envelope on responses topic: {envelope}");
                    self.emit(Event::Error(format!(
                        "unexpected envelope on responses topic: {envelope}"
                    )));
                }
                Err(e) => {
                    warn!("dropping malformed response payload: {e}");
                    self.emit(Event::Error(e.to_string()));
                }
            },
            // Presence envelopes are not consumed here: the transport's
            // own connection state is authoritative for this session.
            Some(TopicKind::Connection | TopicKind::Commands) | None => {
                trace!("ignoring message on {}", message.topic);
            }
        }
    }

    /// Diffs an incoming snapshot against the cache, stores it, and
    /// queues the change events.
    fn apply_state(&self, incoming: PlayerState) {
        let mut events = Vec::new();
        {
            let mut cached = lock(&self.last_state);
            match cached.as_ref() {
                None => {
                    events.push(Event::StateChanged(incoming.state));
                    events.push(Event::VolumeChanged(incoming.volume));
                    if let Some(position) = incoming.position() {
                        events.push(Event::PositionChanged(position));
                    }
                }
                Some(previous) => {
                    if incoming.state != previous.state {
                        events.push(Event::StateChanged(incoming.state));
                    }
                    if incoming.position() != previous.position() {
                        if let Some(position) = incoming.position() {
                            events.push(Event::PositionChanged(position));
                        }
                    }
                    if incoming.volume != previous.volume {
                        events.push(Event::VolumeChanged(incoming.volume));
                    }
                }
            }
            *cached = Some(incoming);
        }

        for event in events {
            self.emit(event);
        }
    }

    /// Fans a response out to the observer, the playlist cache, and the
    /// pending table.
    fn handle_response(&self, response: ResponseEnvelope) {
        self.emit(Event::CommandResponse(response.clone()));

        if let Some(catalog) = response.data.as_ref().and_then(|data| data.get("playlists")) {
            match serde_json::from_value::<Vec<PlaylistInfo>>(catalog.clone()) {
                Ok(playlists) => {
                    *lock(&self.playlists) = playlists.clone();
                    self.emit(Event::PlaylistsChanged(playlists));
                }
                Err(e) => warn!("unparseable playlist catalog: {e}"),
            }
        }

        let Some(correlation) = response.correlation() else {
            trace!("response without a usable correlation id");
            return;
        };
        // Duplicates and responses to unknown ids fall through here and
        // are dropped without notifying anyone.
        let Some(pending) = lock(&self.pending).remove(&correlation) else {
            trace!("response {correlation} matches no pending command");
            return;
        };

        let outcome = if response.result {
            Ok(response.data)
        } else {
            Err(Error::handler_failure(response.message))
        };
        let _ = pending.reply_tx.send(outcome);
    }

    /// Rejects every pending command older than the command timeout.
    fn sweep(&self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let mut pending = lock(&self.pending);
            let ids: Vec<Uuid> = pending
                .iter()
                .filter(|(_, entry)| now.duration_since(entry.enqueued_at) >= self.command_timeout)
                .map(|(id, _)| *id)
                .collect();
            for id in ids {
                if let Some(entry) = pending.remove(&id) {
                    expired.push((id, entry));
                }
            }
        }

        for (id, entry) in expired {
            debug!("command {id} timed out");
            let _ = entry.reply_tx.send(Err(Error::timeout(format!(
                "no response within {:.1}s",
                self.command_timeout.as_secs_f64()
            ))));
        }
    }

    /// Rejects everything pending because the session is closing.
    fn reject_all_pending(&self) {
        let drained: Vec<Pending> = lock(&self.pending).drain().map(|(_, entry)| entry).collect();
        for entry in drained {
            let _ = entry
                .reply_tx
                .send(Err(Error::disconnected("session disconnected")));
        }
    }

    /// Primes the state cache by asking the device directly. Failure is
    /// tolerable: the retained state envelope usually arrives first
    /// anyway.
    async fn prime(&self) {
        match self.send_command("getStatus", None).await {
            Ok(Some(data)) => match serde_json::from_value::<PlayerState>(data) {
                Ok(state) => self.apply_state(state.clamped()),
                Err(e) => warn!("getStatus returned an unparseable state: {e}"),
            },
            Ok(None) => warn!("getStatus returned no data"),
            Err(e) => debug!("cache priming failed: {e}"),
        }
    }

}

/// Reacts to a transport state transition.
async fn handle_connection_change(shared: &Arc<Shared>, state: &ConnectionState) {
    let status = match state {
        ConnectionState::Connected => SessionStatus::Connected,
        ConnectionState::Connecting => SessionStatus::Connecting,
        ConnectionState::Disconnected | ConnectionState::Error(_) => SessionStatus::Disconnected,
    };
    if !shared.set_status(status) {
        return;
    }

    if status == SessionStatus::Connected {
        // Back after a reconnect: re-establish subscriptions (the
        // broker forgot them under a clean session) and re-prime the
        // cache. Commands pending across the gap are left to the
        // sweep; their responses may still arrive in time.
        info!("transport reconnected; resubscribing");
        if let Err(e) = shared.subscribe_topics().await {
            warn!("resubscription failed: {e}");
        }
        let prime = Arc::clone(shared);
        tokio::spawn(async move { prime.prime().await });
    }

    shared.emit(Event::ConnectionChanged(status));
}

/// Routes inbound messages and transport state changes until shutdown.
async fn route_inbound(
    shared: Arc<Shared>,
    mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
    mut connection: watch::Receiver<ConnectionState>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = connection.borrow_and_update().clone();
                handle_connection_change(&shared, &state).await;
            }
            message = inbound.recv() => match message {
                Some(message) => shared.route(&message),
                None => break,
            },
        }
    }
    debug!("session router stopped");
}

/// Runs the 1 Hz timeout sweep until shutdown.
async fn sweep_pending(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => shared.sweep(),
        }
    }
}

/// A client session against one device namespace.
pub struct Session {
    shared: Arc<Shared>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Builds a session over an existing transport.
    ///
    /// `inbound` must be the receiver half belonging to `transport`;
    /// `event_tx` receives every [`Event`] the session emits.
    pub fn new(
        transport: Arc<dyn Transport>,
        inbound: mpsc::UnboundedReceiver<InboundMessage>,
        config: &Config,
        event_tx: mpsc::UnboundedSender<Event>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                transport,
                topics: config.topics(),
                qos: config.default_qos,
                command_timeout: config.command_timeout,
                status: Mutex::new(SessionStatus::Disconnected),
                last_state: Mutex::new(None),
                playlists: Mutex::new(Vec::new()),
                pending: Mutex::new(HashMap::new()),
                event_tx,
            }),
            inbound: Mutex::new(Some(inbound)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Builds a session with its own MQTT transport from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error when the configuration is invalid or the TLS
    /// material cannot be loaded.
    pub fn with_mqtt(config: &Config, event_tx: mpsc::UnboundedSender<Event>) -> Result<Self> {
        config.validate()?;
        let fallback = format!("client-{}", Uuid::fast_v4());
        let (transport, inbound) = MqttTransport::new(config.transport_options(&fallback))?;
        Ok(Self::new(Arc::new(transport), inbound, config, event_tx))
    }

    /// Connects the transport, subscribes to the device's state and
    /// responses topics, and primes the state cache with `getStatus`.
    ///
    /// # Errors
    ///
    /// Propagates `TransportUnavailable` from the transport and
    /// `NotConnected` from the initial subscriptions. Priming runs in
    /// the background and its failure is only logged.
    pub async fn connect(&self) -> Result<()> {
        let inbound = lock(&self.inbound)
            .take()
            .ok_or_else(|| Error::internal("session already connected"))?;

        let established = async {
            self.shared.transport.connect().await?;
            self.shared.subscribe_topics().await
        }
        .await;
        if let Err(e) = established {
            // Keep the receiver so a later connect attempt can succeed.
            *lock(&self.inbound) = Some(inbound);
            return Err(e);
        }

        let mut tasks = lock(&self.tasks);
        tasks.push(tokio::spawn(route_inbound(
            Arc::clone(&self.shared),
            inbound,
            self.shared.transport.connection(),
            self.shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(sweep_pending(
            Arc::clone(&self.shared),
            self.shutdown.subscribe(),
        )));
        drop(tasks);

        self.shared.set_status(SessionStatus::Connected);
        self.shared
            .emit(Event::ConnectionChanged(SessionStatus::Connected));

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move { shared.prime().await });

        Ok(())
    }

    /// Rejects everything pending with `Disconnected`, stops the
    /// background tasks, and closes the transport.
    pub async fn disconnect(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.shared.reject_all_pending();

        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        let result = self.shared.transport.disconnect().await;
        if self.shared.set_status(SessionStatus::Disconnected) {
            self.shared
                .emit(Event::ConnectionChanged(SessionStatus::Disconnected));
        }
        result
    }

    /// The session's current connection status.
    #[must_use]
    pub fn connection_status(&self) -> SessionStatus {
        *lock(&self.shared.status)
    }

    /// The last player state received from the device, if any.
    #[must_use]
    pub fn cached_player_state(&self) -> Option<PlayerState> {
        lock(&self.shared.last_state).clone()
    }

    /// The last playlist catalog received from the device.
    #[must_use]
    pub fn cached_playlists(&self) -> Vec<PlaylistInfo> {
        lock(&self.shared.playlists).clone()
    }

    /// Issues an arbitrary command and resolves with the response data.
    ///
    /// The standard vocabulary has dedicated methods below; this is the
    /// escape hatch for extension commands the device registered.
    ///
    /// # Errors
    ///
    /// Rejects with the response's message on `result=false`, with
    /// `Timeout` when the device does not answer within the command
    /// timeout, and with `Disconnected` when the session closes first.
    pub async fn command(&self, command: &str, params: Option<Value>) -> Result<Option<Value>> {
        self.shared.send_command(command, params).await
    }

    /// Starts or resumes playback.
    pub async fn play(&self) -> Result<Option<Value>> {
        self.command("play", None).await
    }

    /// Pauses playback.
    pub async fn pause(&self) -> Result<Option<Value>> {
        self.command("pause", None).await
    }

    /// Stops playback.
    pub async fn stop(&self) -> Result<Option<Value>> {
        self.command("stop", None).await
    }

    /// Skips to the next track.
    pub async fn next(&self) -> Result<Option<Value>> {
        self.command("next", None).await
    }

    /// Skips to the previous track.
    pub async fn previous(&self) -> Result<Option<Value>> {
        self.command("previous", None).await
    }

    /// Sets the volume in percent. The device validates the `0..=100`
    /// domain and rejects anything outside it.
    pub async fn set_volume(&self, volume: u8) -> Result<Option<Value>> {
        self.command("setVolume", Some(json!({ "volume": volume })))
            .await
    }

    /// Fetches the current volume.
    pub async fn get_volume(&self) -> Result<u8> {
        let data = self.expect_data("getVolume", None).await?;
        let volume = data
            .get("volume")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::malformed_message("getVolume response carried no volume"))?;
        u8::try_from(volume).map_err(|_| Error::malformed_message("volume out of range"))
    }

    /// Fetches a full state snapshot and refreshes the cache.
    pub async fn get_status(&self) -> Result<PlayerState> {
        let data = self.expect_data("getStatus", None).await?;
        let state: PlayerState = serde_json::from_value(data)?;
        let state = state.clamped();
        self.shared.apply_state(state.clone());
        Ok(state)
    }

    /// Fetches the playlist catalog. The cache refresh and the
    /// `PlaylistsChanged` event happen on the response path, so callers
    /// subscribing to events see exactly one notification.
    pub async fn get_playlists(&self) -> Result<Vec<PlaylistInfo>> {
        let data = self.expect_data("getPlaylists", None).await?;
        let catalog = data
            .get("playlists")
            .cloned()
            .ok_or_else(|| Error::malformed_message("getPlaylists response carried no catalog"))?;
        serde_json::from_value(catalog).map_err(Into::into)
    }

    /// Replaces the queue with the named playlist and starts playback.
    pub async fn play_playlist(&self, name: &str) -> Result<Option<Value>> {
        self.command("playPlaylist", Some(json!({ "name": name })))
            .await
    }

    /// Fetches the tracks of the named playlist.
    pub async fn get_playlist_songs(&self, name: &str) -> Result<Vec<SongMeta>> {
        let data = self
            .expect_data("getPlaylistSongs", Some(json!({ "name": name })))
            .await?;
        let songs = data.get("songs").cloned().ok_or_else(|| {
            Error::malformed_message("getPlaylistSongs response carried no songs")
        })?;
        serde_json::from_value(songs).map_err(Into::into)
    }

    /// Creates a playlist from daemon-relative file paths.
    pub async fn create_playlist(&self, name: &str, files: &[String]) -> Result<Option<Value>> {
        self.command(
            "createPlaylist",
            Some(json!({ "name": name, "files": files })),
        )
        .await
    }

    /// Deletes the named playlist.
    pub async fn delete_playlist(&self, name: &str) -> Result<Option<Value>> {
        self.command("deletePlaylist", Some(json!({ "name": name })))
            .await
    }

    /// Plays the track at `index`.
    ///
    /// The index refers to the playlist most recently returned by
    /// [`Session::get_playlists`] or [`Session::get_playlist_songs`];
    /// the device rejects stale indices with an invalid-argument
    /// response rather than guessing.
    pub async fn play_track(&self, index: usize) -> Result<Option<Value>> {
        self.command("playTrack", Some(json!({ "index": index })))
            .await
    }

    /// Appends a file to the queue, or to the named stored playlist.
    pub async fn add_track(&self, file: &str, playlist: Option<&str>) -> Result<Option<Value>> {
        self.command(
            "addTrack",
            Some(json!({ "file": file, "playlist": playlist })),
        )
        .await
    }

    /// Removes the track at `index` from the queue, or from the named
    /// stored playlist.
    pub async fn remove_track(
        &self,
        index: usize,
        playlist: Option<&str>,
    ) -> Result<Option<Value>> {
        self.command(
            "removeTrack",
            Some(json!({ "index": index, "playlist": playlist })),
        )
        .await
    }

    /// Moves a track from `from` to `to`.
    pub async fn reorder_track(
        &self,
        from: usize,
        to: usize,
        playlist: Option<&str>,
    ) -> Result<Option<Value>> {
        self.command(
            "reorderTrack",
            Some(json!({ "from": from, "to": to, "playlist": playlist })),
        )
        .await
    }

    /// Enables or disables repeat.
    pub async fn set_repeat(&self, repeat: bool) -> Result<Option<Value>> {
        self.command("setRepeat", Some(json!({ "repeat": repeat })))
            .await
    }

    /// Enables or disables shuffle.
    pub async fn set_random(&self, random: bool) -> Result<Option<Value>> {
        self.command("setRandom", Some(json!({ "random": random })))
            .await
    }

    /// Triggers a rescan of the daemon's music database.
    pub async fn update_database(&self) -> Result<Option<Value>> {
        self.command("updateDatabase", None).await
    }

    /// Issues a command whose response must carry data.
    async fn expect_data(&self, command: &str, params: Option<Value>) -> Result<Value> {
        self.command(command, params).await?.ok_or_else(|| {
            Error::malformed_message(format!("{command} response carried no data"))
        })
    }
}

impl Drop for Session {
    /// Stops the background tasks; an explicit
    /// [`Session::disconnect`] is still the polite way out because it
    /// also closes the transport.
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

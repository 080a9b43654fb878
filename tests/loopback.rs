//! End-to-end scenarios: a bridge and a session wired through an
//! in-process loopback broker that emulates topic routing and retained
//! messages.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use amora::config::Config;
use amora::error::{Error, ErrorKind, Result};
use amora::events::Event;
use amora::player::Player;
use amora::protocol::{PlaybackState, PlayerState, SongMeta};
use amora::remote::Bridge;
use amora::session::Session;
use amora::transport::{ConnectionState, InboundMessage, QoS, Transport};

/// Topic routing and retained storage shared by all endpoints.
#[derive(Default)]
struct BrokerCore {
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<InboundMessage>>>,
    retained: HashMap<String, Vec<u8>>,
}

#[derive(Clone, Default)]
struct LoopbackBroker {
    core: Arc<Mutex<BrokerCore>>,
}

impl LoopbackBroker {
    /// A new endpoint: a transport plus its inbound receiver.
    fn endpoint(&self) -> (Arc<LoopbackTransport>, mpsc::UnboundedReceiver<InboundMessage>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        (
            Arc::new(LoopbackTransport {
                broker: self.clone(),
                inbound_tx,
                state_tx,
            }),
            inbound_rx,
        )
    }

    fn deliver(&self, topic: &str, payload: Vec<u8>, retain: bool) {
        let mut core = self.core.lock().unwrap();
        if retain {
            core.retained.insert(topic.to_owned(), payload.clone());
        }
        if let Some(subscribers) = core.subscribers.get_mut(topic) {
            subscribers.retain(|subscriber| {
                subscriber
                    .send(InboundMessage {
                        topic: topic.to_owned(),
                        payload: payload.clone(),
                        retained: false,
                    })
                    .is_ok()
            });
        }
    }

    fn add_subscriber(&self, topic: &str, subscriber: mpsc::UnboundedSender<InboundMessage>) {
        let mut core = self.core.lock().unwrap();
        if let Some(payload) = core.retained.get(topic).cloned() {
            let _ = subscriber.send(InboundMessage {
                topic: topic.to_owned(),
                payload,
                retained: true,
            });
        }
        core.subscribers
            .entry(topic.to_owned())
            .or_default()
            .push(subscriber);
    }
}

/// One endpoint's view of the loopback broker.
struct LoopbackTransport {
    broker: LoopbackBroker,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    state_tx: watch::Sender<ConnectionState>,
}

impl LoopbackTransport {
    fn ensure_connected(&self) -> Result<()> {
        if *self.state_tx.borrow() == ConnectionState::Connected {
            Ok(())
        } else {
            Err(Error::not_connected("loopback endpoint is offline"))
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&self) -> Result<()> {
        self.state_tx.send_replace(ConnectionState::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.state_tx.send_replace(ConnectionState::Disconnected);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<()> {
        self.ensure_connected()?;
        self.broker.add_subscriber(topic, self.inbound_tx.clone());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.ensure_connected()?;
        let mut core = self.broker.core.lock().unwrap();
        if let Some(subscribers) = core.subscribers.get_mut(topic) {
            subscribers.retain(|subscriber| !subscriber.same_channel(&self.inbound_tx));
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, _qos: QoS, retain: bool) -> Result<()> {
        self.ensure_connected()?;
        self.broker.deliver(topic, payload, retain);
        Ok(())
    }

    fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }
}

/// A daemon stand-in whose state mutates the way MPD would.
struct FakePlayer {
    state: Mutex<PlayerState>,
}

impl FakePlayer {
    fn stopped(volume: u8) -> Self {
        Self {
            state: Mutex::new(PlayerState {
                state: PlaybackState::Stopped,
                volume,
                ..PlayerState::default()
            }),
        }
    }
}

#[async_trait]
impl Player for FakePlayer {
    async fn play(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.state = PlaybackState::Playing;
        state.current_song = Some(SongMeta {
            title: "Track A".to_owned(),
            artist: "Artist".to_owned(),
            album: "Album".to_owned(),
            file: "a.mp3".to_owned(),
            duration: 180.0,
            position: 0.0,
            is_current: None,
        });
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        self.state.lock().unwrap().state = PlaybackState::Paused;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.state = PlaybackState::Stopped;
        state.current_song = None;
        Ok(())
    }

    async fn next(&self) -> Result<()> {
        Ok(())
    }

    async fn previous(&self) -> Result<()> {
        Ok(())
    }

    async fn set_volume(&self, volume: u8) -> Result<()> {
        self.state.lock().unwrap().volume = volume;
        Ok(())
    }

    async fn get_volume(&self) -> Result<u8> {
        Ok(self.state.lock().unwrap().volume)
    }

    async fn get_status(&self) -> Result<PlayerState> {
        Ok(self.state.lock().unwrap().clone())
    }

    async fn get_playlists(&self) -> Result<Vec<String>> {
        Ok(vec!["Favorites".to_owned()])
    }

    async fn play_playlist(&self, name: &str) -> Result<()> {
        self.state.lock().unwrap().playlist = Some(name.to_owned());
        Ok(())
    }

    async fn get_playlist_songs(&self, _name: &str) -> Result<Vec<SongMeta>> {
        Ok(vec![SongMeta {
            file: "a.mp3".to_owned(),
            ..SongMeta::default()
        }])
    }

    async fn create_playlist(&self, _name: &str, _files: &[String]) -> Result<()> {
        Ok(())
    }

    async fn delete_playlist(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn play_track(&self, _index: usize) -> Result<()> {
        Ok(())
    }

    async fn add_track(&self, _file: &str, _playlist: Option<&str>) -> Result<()> {
        Ok(())
    }

    async fn remove_track(&self, _index: usize, _playlist: Option<&str>) -> Result<()> {
        Ok(())
    }

    async fn reorder_track(&self, _from: usize, _to: usize, _playlist: Option<&str>) -> Result<()> {
        Ok(())
    }

    async fn set_repeat(&self, repeat: bool) -> Result<()> {
        self.state.lock().unwrap().repeat = repeat;
        Ok(())
    }

    async fn set_random(&self, random: bool) -> Result<()> {
        self.state.lock().unwrap().random = random;
        Ok(())
    }

    async fn update_database(&self) -> Result<()> {
        Ok(())
    }
}

/// Fast intervals so the scenarios finish in milliseconds.
fn test_config() -> Config {
    let mut config = Config::for_device("dev-1");
    config.update_interval = Duration::from_millis(20);
    config.position_update_interval = Duration::from_millis(20);
    config.full_update_interval = Duration::from_millis(100);
    config.command_timeout = Duration::from_millis(300);
    config
}

async fn started_bridge(broker: &LoopbackBroker, player: Arc<FakePlayer>) -> Bridge {
    let (transport, inbound) = broker.endpoint();
    let mut bridge =
        Bridge::with_transport(test_config(), player, transport as Arc<dyn Transport>, inbound);
    bridge.start().await.unwrap();
    bridge
}

async fn connected_session(
    broker: &LoopbackBroker,
) -> (Session, mpsc::UnboundedReceiver<Event>) {
    let (transport, inbound) = broker.endpoint();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let session = Session::new(
        transport as Arc<dyn Transport>,
        inbound,
        &test_config(),
        event_tx,
    );
    session.connect().await.unwrap();
    (session, event_rx)
}

/// Awaits the next event matching `matches`, discarding others.
async fn wait_for<F>(events: &mut mpsc::UnboundedReceiver<Event>, matches: F) -> Event
where
    F: Fn(&Event) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn prime_and_play() {
    let broker = LoopbackBroker::default();
    let player = Arc::new(FakePlayer::stopped(50));
    let mut bridge = started_bridge(&broker, Arc::clone(&player)).await;

    // Let the publisher's first tick retain the initial state.
    tokio::time::sleep(Duration::from_millis(60)).await;

    let (session, mut events) = connected_session(&broker).await;

    // The retained snapshot primes the late subscriber.
    wait_for(&mut events, |e| {
        *e == Event::StateChanged(PlaybackState::Stopped)
    })
    .await;
    wait_for(&mut events, |e| *e == Event::VolumeChanged(50)).await;

    // Issue play and observe both the response and the state change.
    session.play().await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, Event::CommandResponse(r) if r.message == "play ok" && r.result)
    })
    .await;
    wait_for(&mut events, |e| {
        *e == Event::StateChanged(PlaybackState::Playing)
    })
    .await;
    wait_for(&mut events, |e| matches!(e, Event::PositionChanged(p) if *p < 1.0)).await;

    let cached = session.cached_player_state().unwrap();
    assert_eq!(cached.state, PlaybackState::Playing);
    assert_eq!(cached.song_file(), Some("a.mp3"));

    session.disconnect().await.unwrap();
    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn volume_changes_propagate_within_the_update_interval() {
    let broker = LoopbackBroker::default();
    let player = Arc::new(FakePlayer::stopped(50));
    let mut bridge = started_bridge(&broker, Arc::clone(&player)).await;
    let (session, mut events) = connected_session(&broker).await;

    session.set_volume(70).await.unwrap();
    wait_for(&mut events, |e| *e == Event::VolumeChanged(70)).await;
    assert_eq!(session.cached_player_state().unwrap().volume, 70);

    session.disconnect().await.unwrap();
    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_commands_reject_with_the_device_message() {
    let broker = LoopbackBroker::default();
    let player = Arc::new(FakePlayer::stopped(50));
    let mut bridge = started_bridge(&broker, player).await;
    let (session, _events) = connected_session(&broker).await;

    let err = session.command("teleport", None).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::HandlerFailure);
    assert!(err.to_string().contains("unknown command"));

    session.disconnect().await.unwrap();
    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn out_of_range_volume_rejects_as_invalid_argument() {
    let broker = LoopbackBroker::default();
    let player = Arc::new(FakePlayer::stopped(50));
    let mut bridge = started_bridge(&broker, Arc::clone(&player)).await;
    let (session, _events) = connected_session(&broker).await;

    let err = session.set_volume(101).await.unwrap_err();
    assert!(err.to_string().contains("invalid argument"));
    // The daemon never saw the bad value.
    assert_eq!(player.get_volume().await.unwrap(), 50);

    session.disconnect().await.unwrap();
    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn unanswered_commands_reject_with_timeout() {
    // No bridge on this broker: commands vanish into the void.
    let broker = LoopbackBroker::default();
    let (session, _events) = connected_session(&broker).await;

    let err = tokio::time::timeout(Duration::from_secs(5), session.play())
        .await
        .expect("command future must resolve")
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);

    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn playlist_catalog_is_fetched_cached_and_announced() {
    let broker = LoopbackBroker::default();
    let player = Arc::new(FakePlayer::stopped(50));
    let mut bridge = started_bridge(&broker, player).await;
    let (session, mut events) = connected_session(&broker).await;

    let playlists = session.get_playlists().await.unwrap();
    assert_eq!(playlists.len(), 1);
    assert_eq!(playlists[0].name, "Favorites");

    wait_for(&mut events, |e| matches!(e, Event::PlaylistsChanged(_))).await;
    assert_eq!(session.cached_playlists(), playlists);

    session.disconnect().await.unwrap();
    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn presence_is_retained_for_late_subscribers() {
    let broker = LoopbackBroker::default();
    let player = Arc::new(FakePlayer::stopped(50));
    let mut bridge = started_bridge(&broker, player).await;

    // A late observer subscribing to the connection topic sees the
    // retained online announcement.
    let (observer, mut observer_rx) = broker.endpoint();
    observer.connect().await.unwrap();
    observer
        .subscribe("amora/devices/dev-1/connection", QoS::AtLeastOnce)
        .await
        .unwrap();

    let retained = observer_rx.recv().await.unwrap();
    assert!(retained.retained);
    let online: serde_json::Value = serde_json::from_slice(&retained.payload).unwrap();
    assert_eq!(online["status"], "online");

    bridge.stop().await.unwrap();

    let farewell = observer_rx.recv().await.unwrap();
    let offline: serde_json::Value = serde_json::from_slice(&farewell.payload).unwrap();
    assert_eq!(offline["status"], "offline");
}

#[tokio::test]
async fn playback_positions_are_non_decreasing_within_a_track() {
    let broker = LoopbackBroker::default();
    let player = Arc::new(FakePlayer::stopped(50));
    let mut bridge = started_bridge(&broker, Arc::clone(&player)).await;
    let (session, mut events) = connected_session(&broker).await;

    session.play().await.unwrap();

    // Simulate the daemon advancing through the track.
    let mut last = -1.0;
    for step in 1..=3 {
        {
            let mut state = player.state.lock().unwrap();
            if let Some(song) = state.current_song.as_mut() {
                song.position = f64::from(step);
            }
        }
        let Event::PositionChanged(position) =
            wait_for(&mut events, |e| matches!(e, Event::PositionChanged(_))).await
        else {
            unreachable!();
        };
        assert!(position >= last, "position went backwards: {position} < {last}");
        last = position;
    }

    session.disconnect().await.unwrap();
    bridge.stop().await.unwrap();
}

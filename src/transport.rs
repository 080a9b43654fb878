//! MQTT transport adapter.
//!
//! Wraps `rumqttc` behind the narrow [`Transport`] capability the rest of
//! the crate consumes: publish, subscribe, and an observable
//! [`ConnectionState`]. The adapter owns reconnection with exponential
//! backoff, restores requested subscriptions before reporting
//! `Connected` again, and configures the last will when given one.
//!
//! Nothing is queued while disconnected: `publish` and `subscribe` fail
//! fast with `NotConnected` and the caller decides whether to retry. The
//! retained-message model plus the periodic state refresh is the
//! resynchronization mechanism, not a send buffer.

use std::{
    collections::HashMap,
    fmt,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event as MqttEvent, EventLoop, MqttOptions, Packet};
use tokio::sync::{mpsc, watch};
use veil::Redact;

use crate::error::{Error, Result};

/// Quality of service for publishes and subscriptions.
///
/// The protocol runs on at-least-once delivery; duplicates are possible
/// and tolerated at the application layer.
#[derive(Copy, Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum QoS {
    /// Fire and forget.
    AtMostOnce,

    /// At least once; duplicates possible. The protocol default.
    #[default]
    AtLeastOnce,

    /// Exactly once.
    ExactlyOnce,
}

impl TryFrom<u8> for QoS {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            _ => Err(Error::invalid_argument(format!(
                "QoS {value} out of range 0..=2"
            ))),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => Self::AtMostOnce,
            QoS::AtLeastOnce => Self::AtLeastOnce,
            QoS::ExactlyOnce => Self::ExactlyOnce,
        }
    }
}

/// Observable state of the transport connection.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum ConnectionState {
    /// No connection and no attempt in progress.
    #[default]
    Disconnected,

    /// Connecting or reconnecting.
    Connecting,

    /// Connected; publishes and subscriptions are accepted.
    Connected,

    /// The connection failed terminally (reconnect disabled).
    Error(String),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Error(e) => write!(f, "error: {e}"),
        }
    }
}

/// A message delivered on a subscribed topic.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundMessage {
    /// The concrete topic the message arrived on.
    pub topic: String,

    /// Raw payload bytes.
    pub payload: Vec<u8>,

    /// Whether the broker delivered this as a retained message.
    pub retained: bool,
}

/// Last-will configuration: what the broker publishes on the sender's
/// behalf when the connection dies without a DISCONNECT.
#[derive(Clone, Debug, PartialEq)]
pub struct LastWillOptions {
    /// Topic the will is published on.
    pub topic: String,

    /// Will payload bytes.
    pub payload: Vec<u8>,

    /// Delivery QoS of the will.
    pub qos: QoS,

    /// Whether the will is retained.
    pub retain: bool,
}

/// The full option set of the transport adapter.
#[derive(Clone, Redact)]
pub struct TransportOptions {
    /// Broker host name or IP address.
    pub broker_url: String,

    /// Broker port. Defaults to 1883; TLS brokers conventionally listen
    /// on 8883.
    pub port: u16,

    /// Transport session identity; must be unique per active connection.
    pub client_id: String,

    /// Username for credential authentication.
    pub username: Option<String>,

    /// Password for credential authentication.
    #[redact]
    pub password: Option<String>,

    /// Whether to wrap the connection in TLS. Requires `ca_path`.
    pub use_tls: bool,

    /// PEM bundle of the broker's certificate authority.
    pub ca_path: Option<PathBuf>,

    /// Client certificate for mutual TLS; paired with `key_path`.
    pub cert_path: Option<PathBuf>,

    /// Client private key for mutual TLS; paired with `cert_path`.
    pub key_path: Option<PathBuf>,

    /// Heartbeat interval. Defaults to 60 seconds.
    pub keep_alive: Duration,

    /// Whether server-side subscription state is discarded across
    /// reconnects. Defaults to `true`.
    pub clean_session: bool,

    /// Whether to reconnect automatically after a connection loss.
    /// Defaults to `true`.
    pub reconnect_on_failure: bool,

    /// Ceiling for the exponential reconnect backoff. Defaults to
    /// 300 seconds.
    pub max_reconnect_delay: Duration,

    /// How long `connect` waits for the first acknowledgment before
    /// failing with `TransportUnavailable`. Defaults to 10 seconds.
    pub connect_timeout: Duration,

    /// QoS used when the caller does not specify one. Defaults to
    /// at-least-once.
    pub default_qos: QoS,

    /// Last-will configuration, if any.
    pub last_will: Option<LastWillOptions>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            broker_url: "localhost".to_owned(),
            port: 1883,
            client_id: String::new(),
            username: None,
            password: None,
            use_tls: false,
            ca_path: None,
            cert_path: None,
            key_path: None,
            keep_alive: Duration::from_secs(60),
            clean_session: true,
            reconnect_on_failure: true,
            max_reconnect_delay: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
            default_qos: QoS::AtLeastOnce,
            last_will: None,
        }
    }
}

/// The transport capability the bridge and session consume.
///
/// [`MqttTransport`] is the production implementation; tests substitute
/// in-process fakes. Inbound delivery is not part of the trait: the
/// receiver half of the message channel is handed out once, at
/// construction, to whoever owns the routing loop.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establishes the connection.
    ///
    /// # Errors
    ///
    /// Fails with `TransportUnavailable` when the broker cannot be
    /// reached within the configured connect timeout.
    async fn connect(&self) -> Result<()>;

    /// Closes the connection gracefully, suppressing the last will.
    async fn disconnect(&self) -> Result<()>;

    /// Requests delivery of messages published to `topic`.
    ///
    /// # Errors
    ///
    /// Fails with `NotConnected` while the connection is down.
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()>;

    /// Stops delivery for `topic`.
    ///
    /// # Errors
    ///
    /// Fails with `NotConnected` while the connection is down.
    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    /// Publishes `payload` to `topic`.
    ///
    /// # Errors
    ///
    /// Fails with `NotConnected` while the connection is down; nothing
    /// is queued for later.
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> Result<()>;

    /// A fresh observer of the connection state.
    fn connection(&self) -> watch::Receiver<ConnectionState>;
}

/// Exponential backoff with a ceiling and a small downward jitter.
#[derive(Debug)]
struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    const BASE: Duration = Duration::from_secs(1);

    fn new(max: Duration) -> Self {
        Self {
            base: Self::BASE,
            max,
            attempt: 0,
        }
    }

    /// The next delay: `min(base * 2^attempt, max)`, jittered down by up
    /// to 10 percent so a fleet of devices does not reconnect in step.
    fn next_delay(&mut self) -> Duration {
        let exponential = self
            .base
            .checked_mul(2_u32.saturating_pow(self.attempt))
            .unwrap_or(self.max);
        self.attempt = self.attempt.saturating_add(1);
        exponential
            .min(self.max)
            .mul_f64(1.0 - 0.1 * fastrand::f64())
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Parts handed to the driver task on `connect`.
struct Driver {
    event_loop: EventLoop,
    state_tx: watch::Sender<ConnectionState>,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
}

/// The rumqttc-backed [`Transport`] implementation.
///
/// Construction builds the client but does not touch the network;
/// [`Transport::connect`] spawns the event-loop driver. The driver task
/// forwards publishes into the inbound channel, tracks the requested
/// subscription set, and after every reconnect re-establishes those
/// subscriptions before flipping the state back to `Connected`.
pub struct MqttTransport {
    client: AsyncClient,
    options: TransportOptions,
    state_rx: watch::Receiver<ConnectionState>,
    driver: Mutex<Option<Driver>>,
    subscriptions: Arc<Mutex<HashMap<String, QoS>>>,
    shutdown: watch::Sender<bool>,
    closing: Arc<AtomicBool>,
}

impl MqttTransport {
    /// Builds the adapter and returns it together with the inbound
    /// message receiver.
    ///
    /// # Errors
    ///
    /// Returns an error when the TLS material cannot be read or the
    /// options are inconsistent (e.g. a certificate without a key).
    pub fn new(options: TransportOptions) -> Result<(Self, mpsc::UnboundedReceiver<InboundMessage>)> {
        let mut mqtt_options = MqttOptions::new(
            options.client_id.clone(),
            options.broker_url.clone(),
            options.port,
        );
        mqtt_options.set_keep_alive(options.keep_alive);
        mqtt_options.set_clean_session(options.clean_session);
        mqtt_options.set_transport(transport_layer(&options)?);

        if let (Some(username), Some(password)) = (&options.username, &options.password) {
            mqtt_options.set_credentials(username.clone(), password.clone());
        }

        if let Some(will) = &options.last_will {
            mqtt_options.set_last_will(rumqttc::LastWill::new(
                will.topic.clone(),
                will.payload.clone(),
                will.qos.into(),
                will.retain,
            ));
        }

        let (client, event_loop) = AsyncClient::new(mqtt_options, 64);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let transport = Self {
            client,
            options,
            state_rx,
            driver: Mutex::new(Some(Driver {
                event_loop,
                state_tx,
                inbound_tx,
            })),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            shutdown,
            closing: Arc::new(AtomicBool::new(false)),
        };

        Ok((transport, inbound_rx))
    }

    fn ensure_connected(&self) -> Result<()> {
        let state = self.state_rx.borrow();
        if *state == ConnectionState::Connected {
            Ok(())
        } else {
            Err(Error::not_connected(format!("transport is {}", *state)))
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self) -> Result<()> {
        let driver = self
            .driver
            .lock()
            .map_err(|e| Error::internal(e.to_string()))?
            .take()
            .ok_or_else(|| Error::internal("transport already started"))?;

        driver.state_tx.send_replace(ConnectionState::Connecting);
        tokio::spawn(drive(
            driver,
            self.client.clone(),
            Arc::clone(&self.subscriptions),
            Arc::clone(&self.closing),
            self.options.reconnect_on_failure,
            self.options.max_reconnect_delay,
            self.shutdown.subscribe(),
        ));

        let mut state = self.state_rx.clone();
        let connected = tokio::time::timeout(self.options.connect_timeout, async move {
            loop {
                match &*state.borrow_and_update() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Error(e) => {
                        return Err(Error::transport_unavailable(e.clone()))
                    }
                    ConnectionState::Disconnected => {
                        return Err(Error::transport_unavailable(
                            "connection attempt ended before an acknowledgment",
                        ))
                    }
                    ConnectionState::Connecting => {}
                }
                if state.changed().await.is_err() {
                    return Err(Error::internal("connection state channel closed"));
                }
            }
        })
        .await;

        match connected {
            Ok(result) => result,
            Err(elapsed) => Err(Error::transport_unavailable(format!(
                "broker {}:{} unreachable: {elapsed}",
                self.options.broker_url, self.options.port
            ))),
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        if self.client.disconnect().await.is_err() {
            // The event loop is already gone; just stop the driver.
            let _ = self.shutdown.send(true);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        self.ensure_connected()?;
        self.subscriptions
            .lock()
            .map_err(|e| Error::internal(e.to_string()))?
            .insert(topic.to_owned(), qos);
        self.client
            .subscribe(topic, qos.into())
            .await
            .map_err(Into::into)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.ensure_connected()?;
        self.subscriptions
            .lock()
            .map_err(|e| Error::internal(e.to_string()))?
            .remove(topic);
        self.client.unsubscribe(topic).await.map_err(Into::into)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> Result<()> {
        self.ensure_connected()?;
        self.client
            .publish(topic, qos.into(), retain, payload)
            .await
            .map_err(Into::into)
    }

    fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }
}

/// The event-loop driver.
///
/// Runs until a graceful disconnect, a terminal error with reconnection
/// disabled, or a shutdown signal. Always leaves the state channel at
/// `Disconnected` (or `Error`) on the way out.
async fn drive(
    driver: Driver,
    client: AsyncClient,
    subscriptions: Arc<Mutex<HashMap<String, QoS>>>,
    closing: Arc<AtomicBool>,
    reconnect_on_failure: bool,
    max_reconnect_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let Driver {
        mut event_loop,
        state_tx,
        inbound_tx,
    } = driver;
    let mut backoff = Backoff::new(max_reconnect_delay);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            polled = event_loop.poll() => match polled {
                Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                    backoff.reset();
                    restore_subscriptions(&client, &subscriptions).await;
                    state_tx.send_replace(ConnectionState::Connected);
                    debug!("transport connected");
                }
                Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                    let message = InboundMessage {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                        retained: publish.retain,
                    };
                    if inbound_tx.send(message).is_err() {
                        trace!("inbound receiver dropped; discarding message");
                    }
                }
                Ok(MqttEvent::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                    debug!("disconnect acknowledged by event loop");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    if closing.load(Ordering::SeqCst) {
                        break;
                    }
                    if !reconnect_on_failure {
                        error!("connection failed: {e}");
                        state_tx.send_replace(ConnectionState::Error(e.to_string()));
                        return;
                    }

                    state_tx.send_replace(ConnectionState::Connecting);
                    let delay = backoff.next_delay();
                    warn!("connection lost ({e}); retrying in {:.1}s", delay.as_secs_f64());
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    state_tx.send_replace(ConnectionState::Disconnected);
    debug!("transport driver stopped");
}

/// Re-requests every tracked subscription after a reconnect, before the
/// state flips back to `Connected`.
async fn restore_subscriptions(client: &AsyncClient, subscriptions: &Mutex<HashMap<String, QoS>>) {
    let desired: Vec<(String, QoS)> = match subscriptions.lock() {
        Ok(map) => map.iter().map(|(t, q)| (t.clone(), *q)).collect(),
        Err(e) => {
            error!("subscription set poisoned: {e}");
            return;
        }
    };

    for (topic, qos) in desired {
        if let Err(e) = client.subscribe(topic.clone(), qos.into()).await {
            warn!("failed to restore subscription to {topic}: {e}");
        }
    }
}

/// Resolves the network layer from the options: plain TCP, or TLS with
/// the configured trust anchors and optional mutual authentication.
fn transport_layer(options: &TransportOptions) -> Result<rumqttc::Transport> {
    if !options.use_tls {
        return Ok(rumqttc::Transport::Tcp);
    }

    let ca_path = options
        .ca_path
        .as_ref()
        .ok_or_else(|| Error::invalid_argument("useTLS requires caPath"))?;
    let ca = std::fs::read(ca_path)?;

    let client_auth = match (&options.cert_path, &options.key_path) {
        (Some(cert), Some(key)) => Some((std::fs::read(cert)?, std::fs::read(key)?)),
        (None, None) => None,
        _ => {
            return Err(Error::invalid_argument(
                "certPath and keyPath must be provided together",
            ))
        }
    };

    Ok(rumqttc::Transport::Tls(rumqttc::TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth,
    }))
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn backoff_doubles_up_to_the_ceiling() {
        let mut backoff = Backoff::new(Duration::from_secs(8));
        let delays: Vec<Duration> = (0..5).map(|_| backoff.next_delay()).collect();

        // Jitter shaves at most 10 percent off each delay.
        for (delay, expected) in delays.iter().zip([1.0, 2.0, 4.0, 8.0, 8.0]) {
            let secs = delay.as_secs_f64();
            assert!(secs <= expected, "{secs} above ceiling {expected}");
            assert!(secs >= expected * 0.9, "{secs} jittered below {expected}");
        }
    }

    #[test]
    fn backoff_resets_after_success() {
        let mut backoff = Backoff::new(Duration::from_secs(300));
        for _ in 0..4 {
            backoff.next_delay();
        }
        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_secs(1));
    }

    #[test]
    fn qos_round_trips_through_u8() {
        for qos in [QoS::AtMostOnce, QoS::AtLeastOnce, QoS::ExactlyOnce] {
            assert_eq!(QoS::try_from(u8::from(qos)).unwrap(), qos);
        }
        assert!(QoS::try_from(3).is_err());
    }

    #[test]
    fn tls_without_ca_is_rejected() {
        let options = TransportOptions {
            use_tls: true,
            ..TransportOptions::default()
        };
        let err = match transport_layer(&options) {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn password_is_redacted_from_debug_output() {
        let options = TransportOptions {
            username: Some("amora".to_owned()),
            password: Some("hunter2".to_owned()),
            ..TransportOptions::default()
        };
        let debugged = format!("{options:?}");
        assert!(!debugged.contains("hunter2"));
        assert!(debugged.contains("amora"));
    }

    #[tokio::test]
    async fn publish_before_connect_is_rejected() {
        let options = TransportOptions {
            client_id: "test".to_owned(),
            ..TransportOptions::default()
        };
        let (transport, _inbound) = MqttTransport::new(options).unwrap();
        let err = transport
            .publish("amora/devices/dev-1/state", Vec::new(), QoS::AtLeastOnce, true)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotConnected);
    }
}

//! Configuration for bridges and sessions.
//!
//! One [`Config`] covers both sides of the protocol: the transport
//! options, the device namespace, the client-side command timeout, and
//! the device-side publisher intervals. Hosts construct it in code or
//! deserialize it from a configuration file; every field has a
//! documented default, so a minimal file only names the broker and the
//! device.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac, TryFromInto};
use veil::Redact;

use crate::{
    error::{Error, Result},
    protocol::Topics,
    transport::{QoS, TransportOptions},
};

/// Default topic prefix of the device namespace.
pub const DEFAULT_TOPIC_PREFIX: &str = "amora/devices";

/// Initialization structure for a device bridge or a client session.
#[serde_as]
#[derive(Clone, Deserialize, Redact, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Broker host name or IP address. Defaults to `localhost`.
    pub broker_url: String,

    /// Broker port. Defaults to 1883.
    pub port: u16,

    /// Transport session identity. When left empty, the bridge derives
    /// `device-{deviceId}` and the session a random `client-{uuid}`.
    pub client_id: String,

    /// Username for credential authentication. No default.
    pub username: Option<String>,

    /// Password for credential authentication. No default; redacted from
    /// Debug output.
    #[redact]
    pub password: Option<String>,

    /// Whether to use TLS. Defaults to `false`; when enabled, `ca_path`
    /// must point at the broker's CA bundle.
    pub use_tls: bool,

    /// PEM bundle of the broker's certificate authority.
    pub ca_path: Option<PathBuf>,

    /// Client certificate for mutual TLS; paired with `key_path`.
    pub cert_path: Option<PathBuf>,

    /// Client private key for mutual TLS; paired with `cert_path`.
    pub key_path: Option<PathBuf>,

    /// Heartbeat interval in seconds. Defaults to 60.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub keep_alive: Duration,

    /// Whether server-side subscription state is discarded across
    /// reconnects. Defaults to `true`.
    pub clean_session: bool,

    /// Whether the transport reconnects automatically after a loss.
    /// Defaults to `true`.
    pub reconnect_on_failure: bool,

    /// Ceiling for the reconnect backoff, in seconds. Defaults to 300.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub max_reconnect_delay: Duration,

    /// How long `connect` waits before failing, in seconds. Defaults
    /// to 10.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub connect_timeout: Duration,

    /// QoS used when none is specified, as 0, 1 or 2. Defaults to 1.
    #[serde_as(as = "TryFromInto<u8>")]
    pub default_qos: QoS,

    /// Topic prefix of the device namespace. Defaults to
    /// `amora/devices`.
    pub topic_prefix: String,

    /// Device identifier within the prefix. No default; must be set and
    /// must not contain `/`.
    pub device_id: String,

    /// How long the session waits for a command response before
    /// rejecting with a timeout, in seconds. Defaults to 10.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub command_timeout: Duration,

    /// Cadence of the device-side status check, in seconds. Defaults
    /// to 1.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub update_interval: Duration,

    /// Cadence of position updates while playing, in seconds. Defaults
    /// to 1.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub position_update_interval: Duration,

    /// Maximum gap between state publishes regardless of change, in
    /// seconds. Defaults to 5.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub full_update_interval: Duration,
}

impl Default for Config {
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
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_owned(),
            device_id: String::new(),
            command_timeout: Duration::from_secs(10),
            update_interval: Duration::from_secs(1),
            position_update_interval: Duration::from_secs(1),
            full_update_interval: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// A configuration for `device_id` with everything else at its
    /// default.
    pub fn for_device(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            ..Self::default()
        }
    }

    /// Checks the fields whose domains the type system cannot express.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when the device id is empty or contains
    /// a topic separator, or when any interval or timeout is zero.
    pub fn validate(&self) -> Result<()> {
        if self.device_id.is_empty() {
            return Err(Error::invalid_argument("deviceId must be set"));
        }
        if self.device_id.contains('/') {
            return Err(Error::invalid_argument(
                "deviceId must not contain a topic separator",
            ));
        }
        if self.topic_prefix.is_empty() {
            return Err(Error::invalid_argument("topicPrefix must be set"));
        }

        for (name, interval) in [
            ("commandTimeoutSeconds", self.command_timeout),
            ("updateInterval", self.update_interval),
            ("positionUpdateInterval", self.position_update_interval),
            ("fullUpdateInterval", self.full_update_interval),
        ] {
            if interval.is_zero() {
                return Err(Error::invalid_argument(format!("{name} must be non-zero")));
            }
        }

        Ok(())
    }

    /// The four canonical topics of this configuration's namespace.
    #[must_use]
    pub fn topics(&self) -> Topics {
        Topics::new(self.topic_prefix.clone(), self.device_id.clone())
    }

    /// The transport option subset of this configuration.
    ///
    /// `client_id` falls back to `fallback_client_id` when unset; the
    /// last will is left empty for the caller (only the bridge sets
    /// one).
    #[must_use]
    pub fn transport_options(&self, fallback_client_id: &str) -> TransportOptions {
        let client_id = if self.client_id.is_empty() {
            fallback_client_id.to_owned()
        } else {
            self.client_id.clone()
        };

        TransportOptions {
            broker_url: self.broker_url.clone(),
            port: self.port,
            client_id,
            username: self.username.clone(),
            password: self.password.clone(),
            use_tls: self.use_tls,
            ca_path: self.ca_path.clone(),
            cert_path: self.cert_path.clone(),
            key_path: self.key_path.clone(),
            keep_alive: self.keep_alive,
            clean_session: self.clean_session,
            reconnect_on_failure: self.reconnect_on_failure,
            max_reconnect_delay: self.max_reconnect_delay,
            connect_timeout: self.connect_timeout,
            default_qos: self.default_qos,
            last_will: None,
        }
    }
}

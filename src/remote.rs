//! Device-side bridge lifecycle.
//!
//! A [`Bridge`] wires one [`Player`] capability to one device namespace:
//! it opens the transport with a retained offline presence as the last
//! will, subscribes to the commands topic, runs the dispatcher and the
//! status publisher as independent tasks, and announces presence on the
//! connection topic. Everything is instance state; multiple bridges for
//! different devices coexist in one process.
//!
//! Startup order follows the protocol contract: connect, subscribe
//! commands, start the dispatcher, start the status publisher (whose
//! first tick publishes the initial retained state), then publish the
//! retained `online`. Shutdown reverses it, publishing `offline`
//! best-effort before the transport closes so the broker's last will
//! does not have to fire.

use std::sync::Arc;

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::{
    config::Config,
    dispatch::{Dispatcher, Handler},
    error::{Error, Result},
    player::Player,
    protocol::{ConnectionEnvelope, Presence, Topics},
    status::{Intervals, StatusPublisher},
    transport::{InboundMessage, LastWillOptions, MqttTransport, Transport},
};

/// The device-side runtime for one device namespace.
pub struct Bridge {
    config: Config,
    topics: Topics,
    player: Arc<dyn Player>,
    transport: Arc<dyn Transport>,
    inbound: Option<mpsc::UnboundedReceiver<InboundMessage>>,
    dispatcher: Option<Dispatcher>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Bridge {
    /// Builds a bridge with its own MQTT transport from `config`.
    ///
    /// The transport's last will is set to a retained offline presence
    /// on this namespace's connection topic, so clients learn about an
    /// ungraceful death from the broker itself.
    ///
    /// # Errors
    ///
    /// Returns an error when the configuration is invalid or the TLS
    /// material cannot be loaded.
    pub fn new(config: Config, player: Arc<dyn Player>) -> Result<Self> {
        config.validate()?;

        let topics = config.topics();
        let fallback = format!("device-{}", config.device_id);
        let mut options = config.transport_options(&fallback);
        options.last_will = Some(LastWillOptions {
            topic: topics.connection().to_owned(),
            payload: serde_json::to_vec(&ConnectionEnvelope::new(Presence::Offline))?,
            qos: config.default_qos,
            retain: true,
        });

        let (transport, inbound) = MqttTransport::new(options)?;
        Ok(Self::with_transport(
            config,
            player,
            Arc::new(transport),
            inbound,
        ))
    }

    /// Builds a bridge over an existing transport.
    ///
    /// `inbound` must be the receiver half belonging to `transport`.
    /// The caller is responsible for the transport's last-will
    /// configuration; [`Bridge::new`] is the constructor that does both.
    pub fn with_transport(
        config: Config,
        player: Arc<dyn Player>,
        transport: Arc<dyn Transport>,
        inbound: mpsc::UnboundedReceiver<InboundMessage>,
    ) -> Self {
        let topics = config.topics();
        let dispatcher = Dispatcher::new(
            Arc::clone(&player),
            Arc::clone(&transport),
            topics.clone(),
            config.default_qos,
        );
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            topics,
            player,
            transport,
            inbound: Some(inbound),
            dispatcher: Some(dispatcher),
            shutdown,
            tasks: Vec::new(),
        }
    }

    /// Registers an extension command handler.
    ///
    /// # Errors
    ///
    /// Fails once the bridge has started; the handler table is handed to
    /// the dispatcher task on [`Bridge::start`].
    pub fn register_handler(&mut self, command: impl Into<String>, handler: Handler) -> Result<()> {
        self.dispatcher
            .as_mut()
            .ok_or_else(|| Error::internal("bridge already started"))?
            .register(command, handler);
        Ok(())
    }

    /// Connects and starts the dispatcher and the status publisher.
    ///
    /// # Errors
    ///
    /// Propagates `TransportUnavailable` from the transport; if
    /// automatic reconnection is enabled the transport keeps trying in
    /// the background even after this returns an error, and the bridge
    /// may be started again once connected.
    pub async fn start(&mut self) -> Result<()> {
        let inbound = self
            .inbound
            .take()
            .ok_or_else(|| Error::internal("bridge already started"))?;
        let dispatcher = self
            .dispatcher
            .take()
            .ok_or_else(|| Error::internal("bridge already started"))?;

        let established = async {
            self.transport.connect().await?;
            self.transport
                .subscribe(self.topics.commands(), self.config.default_qos)
                .await
        }
        .await;
        if let Err(e) = established {
            self.inbound = Some(inbound);
            self.dispatcher = Some(dispatcher);
            return Err(e);
        }

        self.tasks
            .push(tokio::spawn(dispatcher.run(inbound, self.shutdown.subscribe())));

        let publisher = StatusPublisher::new(
            Arc::clone(&self.player),
            Arc::clone(&self.transport),
            self.topics.clone(),
            Intervals {
                update: self.config.update_interval,
                position_update: self.config.position_update_interval,
                full_update: self.config.full_update_interval,
            },
            self.config.default_qos,
        );
        self.tasks
            .push(tokio::spawn(publisher.run(self.shutdown.subscribe())));

        self.publish_presence(Presence::Online).await?;
        info!("bridge for {} started", self.topics.device_id());
        Ok(())
    }

    /// Publishes the retained offline presence, stops the tasks, and
    /// closes the transport.
    pub async fn stop(&mut self) -> Result<()> {
        // Best effort: if this fails the broker's last will delivers
        // the same retained offline on our behalf.
        if let Err(e) = self.publish_presence(Presence::Offline).await {
            warn!("failed to publish offline presence: {e}");
        }

        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }

        let result = self.transport.disconnect().await;
        info!("bridge for {} stopped", self.topics.device_id());
        result
    }

    /// The namespace this bridge serves.
    #[must_use]
    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    async fn publish_presence(&self, status: Presence) -> Result<()> {
        let payload = serde_json::to_vec(&ConnectionEnvelope::new(status))?;
        self.transport
            .publish(
                self.topics.connection(),
                payload,
                self.config.default_qos,
                true,
            )
            .await
    }
}

//! Device-side status publisher.
//!
//! Polls the player capability on a single timer and publishes retained
//! state envelopes so that clients observe changes with bounded latency
//! and can resynchronize from the periodic refresh. Three thresholds
//! decide whether a tick publishes:
//!
//! * an immediate trigger: playback state, current song, volume, repeat,
//!   random or active playlist changed since the last publish
//! * the position cadence: while playing, at least
//!   `position_update_interval` since the last publish
//! * the refresh floor: at least `full_update_interval` since the last
//!   publish, changed or not
//!
//! Multiple triggers coalesce into at most one full-state publish per
//! tick. A failed poll skips the tick rather than publishing stale
//! state; a failed publish keeps the previous snapshot so the next
//! successful publish re-baselines the diff.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use crate::{
    player::Player,
    protocol::{PlaybackState, PlayerState, StateEnvelope, Topics},
    transport::{QoS, Transport},
};

/// The three publisher intervals.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Intervals {
    /// Cadence of the status check.
    pub update: Duration,

    /// Cadence of position updates while playing.
    pub position_update: Duration,

    /// Maximum gap between publishes regardless of change.
    pub full_update: Duration,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            update: Duration::from_secs(1),
            position_update: Duration::from_secs(1),
            full_update: Duration::from_secs(5),
        }
    }
}

/// Publishes coalesced, retained state updates for one device.
pub struct StatusPublisher {
    player: Arc<dyn Player>,
    transport: Arc<dyn Transport>,
    topics: Topics,
    intervals: Intervals,
    qos: QoS,
    last: Option<PlayerState>,
    last_publish: Option<Instant>,
}

impl StatusPublisher {
    /// Builds a publisher; nothing runs until [`StatusPublisher::run`].
    pub fn new(
        player: Arc<dyn Player>,
        transport: Arc<dyn Transport>,
        topics: Topics,
        intervals: Intervals,
        qos: QoS,
    ) -> Self {
        Self {
            player,
            transport,
            topics,
            intervals,
            qos,
            last: None,
            last_publish: None,
        }
    }

    /// Runs the tick loop until shutdown fires.
    ///
    /// The first tick completes immediately, which doubles as the
    /// initial full-state publish on startup.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.intervals.update);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => self.tick().await,
            }
        }
        debug!("status publisher stopped");
    }

    /// One poll-compare-publish cycle.
    async fn tick(&mut self) {
        let status = match self.player.get_status().await {
            Ok(status) => status.clamped(),
            Err(e) => {
                warn!("status poll failed, skipping tick: {e}");
                return;
            }
        };

        let since_last_publish = self.last_publish.map(|at| at.elapsed());
        if !should_publish(&status, self.last.as_ref(), since_last_publish, &self.intervals) {
            return;
        }

        let envelope = StateEnvelope::new(status.clone());
        let payload = match serde_json::to_vec(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                error!("failed to encode state envelope: {e}");
                return;
            }
        };

        match self
            .transport
            .publish(self.topics.state(), payload, self.qos, true)
            .await
        {
            Ok(()) => {
                trace!("published state {}", status.state);
                self.last = Some(status);
                self.last_publish = Some(Instant::now());
            }
            Err(e) => {
                // The retained last state on the broker stays correct;
                // the next successful tick resynchronizes.
                debug!("state publish skipped: {e}");
            }
        }
    }
}

/// The publish decision for one tick.
fn should_publish(
    current: &PlayerState,
    last: Option<&PlayerState>,
    since_last_publish: Option<Duration>,
    intervals: &Intervals,
) -> bool {
    let (Some(last), Some(since)) = (last, since_last_publish) else {
        return true;
    };

    current.requires_immediate_publish(last)
        || since >= intervals.full_update
        || (current.state == PlaybackState::Playing && since >= intervals.position_update)
}

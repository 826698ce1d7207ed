//! Heartbeat supervisor.
//!
//! Every interval each open connection is either probed with a WebSocket
//! ping or, if it did not answer the previous probe, terminated. A pong
//! re-arms the connection, so a client survives one missed reply cycle and
//! is dropped on the second.

use crate::connection::ConnectionRegistry;
use crate::presence::PresenceBroadcaster;
use crate::shutdown::ShutdownState;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// Result of one supervisor tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    /// Connections force-closed for missing a probe
    pub terminated: usize,
    /// Connections sent a fresh probe
    pub probed: usize,
}

pub struct HeartbeatSupervisor {
    registry: Arc<ConnectionRegistry>,
    presence: Arc<PresenceBroadcaster>,
    interval: Duration,
}

impl HeartbeatSupervisor {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        presence: Arc<PresenceBroadcaster>,
        interval: Duration,
    ) -> Self {
        Self { registry, presence, interval }
    }

    /// Runs one liveness pass.
    ///
    /// Terminated connections lose their presence entry inside the same
    /// registry update; if any entry was removed one snapshot is published
    /// for the whole pass.
    pub async fn tick(&self) -> HeartbeatReport {
        let sweep = self.registry.heartbeat_sweep().await;
        let mut presence_changed = false;

        for (connection_id, outbound, entry) in &sweep.expired {
            outbound.terminate();
            match entry {
                Some(entry) => {
                    presence_changed = true;
                    info!(
                        connection_id = %connection_id,
                        user_id = %entry.user_id,
                        "💀 Terminated unresponsive connection"
                    );
                }
                None => info!(connection_id = %connection_id, "💀 Terminated unresponsive connection"),
            }
        }

        for (_, outbound) in &sweep.probe {
            outbound.ping();
        }

        if presence_changed {
            self.presence.broadcast().await;
        }

        let report = HeartbeatReport { terminated: sweep.expired.len(), probed: sweep.probe.len() };
        debug!(terminated = report.terminated, probed = report.probed, "Heartbeat tick");
        report
    }

    /// Ticks every interval until shutdown.
    pub async fn run(&self, shutdown: ShutdownState) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; connections get a full
        // interval before their first probe.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    info!("💓 Heartbeat supervisor stopping - shutdown initiated");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
    }
}

//! In-process broker backed by a tokio broadcast channel.
//!
//! All sessions created from one [`MemoryBroker`] share the same channel,
//! which mirrors a fanout exchange with one queue per subscriber. Lagging
//! subscribers skip the frames they missed.

use super::{Broker, BrokerDelivery, BrokerSession, DeliveryAcker};
use crate::error::BrokerError;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Notify};
use tracing::{debug, warn};

/// Counters shared by every session of one [`MemoryBroker`].
#[derive(Debug, Default)]
pub struct MemoryBrokerStats {
    published: AtomicU64,
    acked: AtomicU64,
    rejected: AtomicU64,
}

impl MemoryBrokerStats {
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

/// Broadcast-channel broker for tests and single-instance deployments.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    stats: Arc<MemoryBrokerStats>,
}

impl MemoryBroker {
    /// Creates a broker whose subscribers buffer up to `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, stats: Arc::new(MemoryBrokerStats::default()) }
    }

    /// Shared delivery counters.
    pub fn stats(&self) -> Arc<MemoryBrokerStats> {
        self.stats.clone()
    }

    /// Publishes a payload as if it came from another relay instance.
    pub fn inject(&self, payload: impl Into<Vec<u8>>) -> usize {
        self.sender.send(Arc::new(payload.into())).unwrap_or(0)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        // Subscribe now so frames published before consume() are not lost
        let receiver = self.sender.subscribe();
        Ok(Arc::new(MemorySession {
            sender: self.sender.clone(),
            receiver: Mutex::new(Some(receiver)),
            closed: Arc::new(AtomicBool::new(false)),
            close_notify: Arc::new(Notify::new()),
            stats: self.stats.clone(),
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

struct MemorySession {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    receiver: Mutex<Option<broadcast::Receiver<Arc<Vec<u8>>>>>,
    closed: Arc<AtomicBool>,
    close_notify: Arc<Notify>,
    stats: Arc<MemoryBrokerStats>,
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn publish(&self, payload: &[u8]) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::NotConnected);
        }
        // No subscribers is not an error for a fanout topic
        let _ = self.sender.send(Arc::new(payload.to_vec()));
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn consume(
        &self,
    ) -> Result<BoxStream<'static, Result<BrokerDelivery, BrokerError>>, BrokerError> {
        let receiver = self
            .receiver
            .lock()
            .await
            .take()
            .ok_or_else(|| BrokerError::Consume("consumer already started".to_string()))?;

        let closed = self.closed.clone();
        let close_notify = self.close_notify.clone();
        let stats = self.stats.clone();
        let deliveries = stream::unfold(receiver, move |mut receiver| {
            let closed = closed.clone();
            let close_notify = close_notify.clone();
            let stats = stats.clone();
            async move {
                loop {
                    let notified = close_notify.notified();
                    if closed.load(Ordering::Acquire) {
                        return None;
                    }
                    let received = tokio::select! {
                        _ = notified => return None,
                        received = receiver.recv() => received,
                    };
                    match received {
                        Ok(payload) => {
                            let acker = Box::new(MemoryAcker { stats: stats.clone() });
                            let delivery = BrokerDelivery::new(payload.as_ref().clone(), acker);
                            return Some((Ok(delivery), receiver));
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Memory broker subscriber lagged, skipped {} frames", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(deliveries.boxed())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::Release);
        self.close_notify.notify_waiters();
        debug!("Memory broker session closed");
        Ok(())
    }
}

struct MemoryAcker {
    stats: Arc<MemoryBrokerStats>,
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.stats.acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn reject(self: Box<Self>) -> Result<(), BrokerError> {
        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

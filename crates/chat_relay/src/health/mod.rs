//! Health check state for load balancers and orchestrators.
//!
//! The HTTP routes live with the rest of the listener in
//! [`crate::server::handlers`]; this module owns what they report.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Body of the status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    pub service: String,
}

/// Overall health status of the relay.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
}

/// Answers health probes for one relay instance.
#[derive(Debug)]
pub struct HealthManager {
    service_name: String,
    started_at: Instant,
}

impl HealthManager {
    /// Creates a new health manager
    pub fn new(service_name: impl Into<String>) -> Self {
        Self { service_name: service_name.into(), started_at: Instant::now() }
    }

    /// Body of the liveness endpoint.
    pub fn liveness_check(&self) -> &'static str {
        "ok"
    }

    /// Status reported by `GET /`.
    ///
    /// A process that can answer is healthy; broker loss is fatal and ends
    /// the process instead of degrading this status.
    pub fn status(&self) -> HealthCheckResult {
        HealthCheckResult { status: HealthStatus::Healthy, service: self.service_name.clone() }
    }

    /// Time since the relay started.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_body() {
        let health = HealthManager::new("chat-relay");
        let body = serde_json::to_value(health.status()).unwrap();
        assert_eq!(body, serde_json::json!({"status": "healthy", "service": "chat-relay"}));
        assert_eq!(health.liveness_check(), "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_uptime_advances() {
        let health = HealthManager::new("chat-relay");
        tokio::time::advance(Duration::from_secs(90)).await;
        assert!(health.uptime() >= Duration::from_secs(90));
    }
}

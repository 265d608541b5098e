// tee-signer: Health reporting

use parking_lot::RwLock;
use serde::Serialize;

/// Health status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded(String),
    Unhealthy(String),
}

impl HealthStatus {
    /// Whether the process should keep receiving traffic.
    pub fn is_serving(&self) -> bool {
        !matches!(self, HealthStatus::Unhealthy(_))
    }
}

/// Shared health state, set at bootstrap and on runtime degradations.
pub struct HealthChecker {
    status: RwLock<HealthStatus>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(HealthStatus::Healthy),
        }
    }

    pub fn set_healthy(&self) {
        *self.status.write() = HealthStatus::Healthy;
    }

    pub fn set_degraded(&self, reason: impl Into<String>) {
        *self.status.write() = HealthStatus::Degraded(reason.into());
    }

    pub fn set_unhealthy(&self, reason: impl Into<String>) {
        *self.status.write() = HealthStatus::Unhealthy(reason.into());
    }

    pub fn status(&self) -> HealthStatus {
        self.status.read().clone()
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

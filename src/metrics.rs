// tee-signer: Process counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Lock-free request counters.
#[derive(Debug, Default)]
pub struct SignerMetrics {
    total_requests: AtomicU64,
    sign_requests: AtomicU64,
    domain_sign_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    rate_limited_requests: AtomicU64,
    rotations: AtomicU64,
}

/// Point-in-time counter snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub sign_requests: u64,
    pub domain_sign_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rate_limited_requests: u64,
    pub rotations: u64,
    pub audit_events_dropped: u64,
}

impl SignerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sign(&self, success: bool) {
        self.sign_requests.fetch_add(1, Ordering::Relaxed);
        self.record_outcome(success);
    }

    pub fn record_domain_sign(&self, success: bool) {
        self.domain_sign_requests.fetch_add(1, Ordering::Relaxed);
        self.record_outcome(success);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rotation(&self) {
        self.rotations.fetch_add(1, Ordering::Relaxed);
    }

    fn record_outcome(&self, success: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self, audit_events_dropped: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            sign_requests: self.sign_requests.load(Ordering::Relaxed),
            domain_sign_requests: self.domain_sign_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            rate_limited_requests: self.rate_limited_requests.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
            audit_events_dropped,
        }
    }
}

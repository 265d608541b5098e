// tee-signer: TEE signing service
// Domain-separated ECDSA P-256 signing authority with versioned key
// rotation, per-client rate limiting, and non-blocking audit logging.

// Enforce proper error handling - no unwrap/expect in production code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod audit;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod domain;
pub mod error;
pub mod health;
pub mod key_manager;
pub mod metrics;
pub mod rate_limit;
pub mod repository;
pub mod server;
pub mod service;
pub mod tls;

pub use config::SignerConfig;
pub use error::{SignerError, SignerResult};
pub use service::SignerService;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::audit::{AuditLogger, AuditStore, RestAuditStore};
use crate::clock::{Clock, SystemClock};
use crate::health::HealthChecker;
use crate::key_manager::{KeyManager, KeyManagerSettings};
use crate::metrics::SignerMetrics;
use crate::rate_limit::RateLimiter;
use crate::repository::{InMemoryKeyVersionRepository, KeyVersionRepository};

/// Wire up every component from the config and serve until SIGINT/SIGTERM.
pub async fn run(config: SignerConfig) -> SignerResult<()> {
    config.validate()?;
    let seed = config.resolve_master_seed()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let repository: Option<Arc<dyn KeyVersionRepository>> =
        match config.keys.repository_backend.as_str() {
            "memory" => Some(Arc::new(InMemoryKeyVersionRepository::new())),
            _ => None,
        };

    let settings = KeyManagerSettings {
        initial_key_version: config.keys.initial_key_version.clone(),
        overlap_period: chrono::Duration::seconds(config.keys.overlap_period_secs as i64),
        require_repository: config.keys.require_repository,
    };
    let key_manager = Arc::new(
        KeyManager::bootstrap(seed, repository, clock.clone(), settings)
            .await
            .map_err(|e| SignerError::internal_error(format!("bootstrap failed: {}", e)))?,
    );
    info!(
        active_version = key_manager.active_version().as_deref().unwrap_or("none"),
        "key manager ready"
    );

    let store: Option<Arc<dyn AuditStore>> = config.audit.store_url.as_ref().map(|url| {
        Arc::new(RestAuditStore::new(
            url.clone(),
            config.audit.store_key.clone(),
        )) as Arc<dyn AuditStore>
    });
    let audit = Arc::new(AuditLogger::new(
        store,
        config.audit.table.clone(),
        config.audit.buffer,
        Duration::from_millis(config.audit.timeout_ms),
    ));

    let rate_limiter = RateLimiter::new(
        config.rate_limit.rps,
        config.rate_limit.burst,
        clock.clone(),
    );
    let metrics = Arc::new(SignerMetrics::new());

    let health = Arc::new(HealthChecker::new());
    if key_manager.is_degraded() {
        health.set_degraded("running on in-memory keys after repository failure");
    }

    let service = Arc::new(SignerService::new(
        key_manager,
        rate_limiter,
        audit.clone(),
        metrics,
        clock,
    ));

    server::serve(&config, service, health, shutdown_signal()).await?;

    // flush queued audit events before exiting
    audit
        .stop(Duration::from_millis(config.server.shutdown_grace_ms))
        .await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

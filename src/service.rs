// tee-signer: Signing service request routing

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audit::{AuditEvent, AuditLogger};
use crate::clock::Clock;
use crate::crypto;
use crate::domain::{self, DomainSeparatedRequest};
use crate::error::{SignerError, SignerResult};
use crate::key_manager::{KeyManager, KeyManagerError};
use crate::metrics::{MetricsSnapshot, SignerMetrics};
use crate::rate_limit::{RateLimiter, UNKNOWN_CLIENT};

/// Client-facing message for any key-version resolution failure. The
/// message is deliberately generic so callers cannot probe which versions
/// exist.
const INVALID_KEY_VERSION: &str = "invalid key_version";

/// Audit principal for administrative operations
const INTERNAL_PRINCIPAL: &str = "internal";

/// Legacy sign request: a raw 32-byte transaction hash
#[derive(Debug, Clone, Deserialize)]
pub struct SignRequest {
    pub tx_hash: String,
    #[serde(default)]
    pub key_version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignResponse {
    /// 64 raw bytes `r || s`, hex encoded
    pub signature: String,
    pub key_version: String,
}

/// Domain-separated sign request
#[derive(Debug, Clone, Deserialize)]
pub struct DomainSignRequest {
    pub purpose: String,
    pub service_id: String,
    pub chain_id: String,
    pub request_id: String,
    pub payload_hash: String,
    pub expiry_unix: u64,
    #[serde(default)]
    pub key_version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DomainSignResponse {
    /// 64 raw bytes `r || s`, hex encoded
    pub signature: String,
    pub key_version: String,
    pub signed_at: DateTime<Utc>,
    /// Domain hash the caller can reproduce and verify against
    pub domain_hash: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RotateKeyResponse {
    pub old_version: Option<String>,
    pub new_version: String,
    pub rotated: bool,
    pub rotated_at: DateTime<Utc>,
    pub deprecated_until: Option<DateTime<Utc>>,
}

/// The signing service.
///
/// Owns the key manager, rate limiter, audit logger, and metrics; the
/// transport layer hands it the verified client CN with each decoded
/// request. Every request outcome, including rejections, emits an audit
/// event so failed attempts stay observable.
pub struct SignerService {
    key_manager: Arc<KeyManager>,
    rate_limiter: RateLimiter,
    audit: Arc<AuditLogger>,
    metrics: Arc<SignerMetrics>,
    clock: Arc<dyn Clock>,
}

impl SignerService {
    pub fn new(
        key_manager: Arc<KeyManager>,
        rate_limiter: RateLimiter,
        audit: Arc<AuditLogger>,
        metrics: Arc<SignerMetrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            key_manager,
            rate_limiter,
            audit,
            metrics,
            clock,
        }
    }

    /// Legacy signing: sign a raw 32-byte transaction hash.
    pub async fn sign(&self, client_cn: &str, request: SignRequest) -> SignerResult<SignResponse> {
        let now = self.clock.now();
        let cn = normalize_cn(client_cn);

        if !self.rate_limiter.allow(&cn) {
            self.metrics.record_rate_limited();
            // the raw, unvalidated input is recorded so abuse patterns
            // remain observable
            self.emit_audit(now, &cn, request.tx_hash.clone(), self.active_or_default());
            return Err(SignerError::resource_exhausted("rate limit exceeded"));
        }

        let result = self.sign_inner(&request, now).await;
        match &result {
            Ok((response, canonical_hash)) => {
                self.metrics.record_sign(true);
                self.emit_audit(now, &cn, canonical_hash.clone(), response.key_version.clone());
            }
            Err(e) => {
                self.metrics.record_sign(false);
                warn!(client_cn = %cn, error = %e, "sign request failed");
                self.emit_audit(
                    now,
                    &cn,
                    request.tx_hash.clone(),
                    self.requested_or_active(&request.key_version),
                );
            }
        }
        result.map(|(response, _)| response)
    }

    async fn sign_inner(
        &self,
        request: &SignRequest,
        now: DateTime<Utc>,
    ) -> SignerResult<(SignResponse, String)> {
        let (canonical_hash, hash_bytes) = crypto::decode_tx_hash_hex(&request.tx_hash)
            .map_err(|e| SignerError::invalid_argument(e.to_string()))?;

        let (used_version, key) = self.resolve_key(&request.key_version, now).await?;

        let signature = crypto::sign_hash_p256(&mut OsRng, &key, &hash_bytes)
            .map_err(|e| SignerError::internal_error(e.to_string()))?;

        Ok((
            SignResponse {
                signature: hex::encode(signature),
                key_version: used_version,
            },
            canonical_hash,
        ))
    }

    /// Domain-separated signing.
    pub async fn sign_with_domain(
        &self,
        client_cn: &str,
        request: DomainSignRequest,
    ) -> SignerResult<DomainSignResponse> {
        let now = self.clock.now();
        let cn = normalize_cn(client_cn);

        let validated = DomainSeparatedRequest::parse(
            &request.purpose,
            &request.service_id,
            &request.chain_id,
            &request.request_id,
            &request.payload_hash,
            request.expiry_unix,
            now,
        );
        let validated = match validated {
            Ok(validated) => validated,
            Err(e) => {
                self.metrics.record_domain_sign(false);
                warn!(client_cn = %cn, error = %e, "domain sign request rejected");
                self.emit_audit(
                    now,
                    &cn,
                    request.request_id.clone(),
                    self.requested_or_active(&request.key_version),
                );
                return Err(e);
            }
        };

        if !self.rate_limiter.allow(&cn) {
            self.metrics.record_rate_limited();
            self.emit_audit(now, &cn, validated.request_id.clone(), self.active_or_default());
            return Err(SignerError::resource_exhausted("rate limit exceeded"));
        }

        let result = self.sign_domain_inner(&request.key_version, &validated, now).await;
        match &result {
            Ok(response) => {
                self.metrics.record_domain_sign(true);
                self.emit_audit(
                    now,
                    &cn,
                    validated.request_id.clone(),
                    response.key_version.clone(),
                );
            }
            Err(e) => {
                self.metrics.record_domain_sign(false);
                warn!(client_cn = %cn, error = %e, "domain sign request failed");
                self.emit_audit(
                    now,
                    &cn,
                    validated.request_id.clone(),
                    self.requested_or_active(&request.key_version),
                );
            }
        }
        result
    }

    async fn sign_domain_inner(
        &self,
        requested_version: &str,
        validated: &DomainSeparatedRequest,
        now: DateTime<Utc>,
    ) -> SignerResult<DomainSignResponse> {
        let domain_hash = domain::domain_hash(validated);
        let message = domain::signing_message(&domain_hash);

        let (used_version, key) = self.resolve_key(requested_version, now).await?;

        let signature = crypto::sign_hash_p256(&mut OsRng, &key, &message)
            .map_err(|e| SignerError::internal_error(e.to_string()))?;

        Ok(DomainSignResponse {
            signature: hex::encode(signature),
            key_version: used_version,
            signed_at: now,
            domain_hash: hex::encode(domain_hash),
        })
    }

    /// Administrative key rotation. Caller gating happens at the transport
    /// layer; the rotation itself is audited under the internal principal.
    pub async fn rotate_key(&self) -> SignerResult<RotateKeyResponse> {
        let result = self.key_manager.rotate().await.map_err(|e| {
            warn!(error = %e, "key rotation failed");
            SignerError::internal_error("key rotation failed")
        })?;

        self.metrics.record_rotation();
        self.emit_audit(
            result.rotated_at,
            INTERNAL_PRINCIPAL,
            format!(
                "rotate-key old={} new={}",
                result.old_version.as_deref().unwrap_or("none"),
                result.new_version
            ),
            result.new_version.clone(),
        );
        info!(
            new_version = %result.new_version,
            rotated = result.rotated,
            "rotation request handled"
        );

        Ok(RotateKeyResponse {
            old_version: result.old_version,
            new_version: result.new_version,
            rotated: result.rotated,
            rotated_at: result.rotated_at,
            deprecated_until: result.deprecated_until,
        })
    }

    /// Resolve the signing key, collapsing key-version failures into the
    /// generic invalid-argument message.
    async fn resolve_key(
        &self,
        requested_version: &str,
        now: DateTime<Utc>,
    ) -> SignerResult<(String, p256::ecdsa::SigningKey)> {
        if !requested_version.is_empty() && !crypto::is_valid_key_version(requested_version) {
            return Err(SignerError::invalid_argument(INVALID_KEY_VERSION));
        }

        let requested = (!requested_version.is_empty()).then_some(requested_version);
        self.key_manager
            .signing_key_at(requested, now)
            .await
            .map_err(|e| match e {
                KeyManagerError::VersionNotFound | KeyManagerError::VersionExpired => {
                    SignerError::invalid_argument(INVALID_KEY_VERSION)
                }
                other => SignerError::internal_error(other.to_string()),
            })
    }

    fn emit_audit(&self, now: DateTime<Utc>, cn: &str, identifier: String, key_version: String) {
        // best-effort: a full buffer drops the event and bumps the counter
        self.audit.log(AuditEvent {
            timestamp: now,
            client_cn: cn.to_string(),
            tx_hash: identifier,
            key_version,
        });
    }

    fn requested_or_active(&self, requested_version: &str) -> String {
        if requested_version.is_empty() {
            self.active_or_default()
        } else {
            requested_version.to_string()
        }
    }

    fn active_or_default(&self) -> String {
        self.key_manager.active_version().unwrap_or_default()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.audit.dropped())
    }

    pub fn key_manager(&self) -> &Arc<KeyManager> {
        &self.key_manager
    }

    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }
}

fn normalize_cn(client_cn: &str) -> String {
    if client_cn.is_empty() {
        UNKNOWN_CLIENT.to_string()
    } else {
        client_cn.to_string()
    }
}

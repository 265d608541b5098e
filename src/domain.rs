// tee-signer: Domain separation for signing requests

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{SignerError, SignerResult};

/// Stable prefix bound into every domain-separated signing message.
/// On-chain verifiers reconstruct the same composition.
pub const SIGNING_PREFIX: &[u8] = b"NEO-SERVICE-LAYER-V1";

/// Closed set of signing purposes.
///
/// A signature produced for one purpose never verifies in another purpose's
/// context because the purpose label is bound into the domain hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
    Oracle,
    Vrf,
    Automation,
    Privacy,
    Registry,
    AccountPool,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Oracle => "oracle",
            Purpose::Vrf => "vrf",
            Purpose::Automation => "automation",
            Purpose::Privacy => "privacy",
            Purpose::Registry => "registry",
            Purpose::AccountPool => "accountpool",
        }
    }

    pub fn parse(raw: &str) -> Option<Purpose> {
        match raw {
            "oracle" => Some(Purpose::Oracle),
            "vrf" => Some(Purpose::Vrf),
            "automation" => Some(Purpose::Automation),
            "privacy" => Some(Purpose::Privacy),
            "registry" => Some(Purpose::Registry),
            "accountpool" => Some(Purpose::AccountPool),
            _ => None,
        }
    }
}

/// A validated domain-separated signing request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainSeparatedRequest {
    pub purpose: Purpose,
    pub service_id: String,
    pub chain_id: String,
    pub request_id: String,
    pub payload_hash: [u8; 32],
    pub expiry_unix: u64,
}

impl DomainSeparatedRequest {
    /// Validate raw request fields.
    ///
    /// Rejects unknown purposes, empty identity fields, payload hashes that
    /// are not exactly 32 bytes of hex, and expiries not in the future at
    /// `now`.
    pub fn parse(
        purpose: &str,
        service_id: &str,
        chain_id: &str,
        request_id: &str,
        payload_hash_hex: &str,
        expiry_unix: u64,
        now: DateTime<Utc>,
    ) -> SignerResult<Self> {
        let purpose = Purpose::parse(purpose)
            .ok_or_else(|| SignerError::invalid_argument(format!("unknown purpose: {}", purpose)))?;

        if service_id.is_empty() {
            return Err(SignerError::invalid_argument("service_id is required"));
        }
        if chain_id.is_empty() {
            return Err(SignerError::invalid_argument("chain_id is required"));
        }
        if request_id.is_empty() {
            return Err(SignerError::invalid_argument("request_id is required"));
        }

        if payload_hash_hex.len() != 64 {
            return Err(SignerError::invalid_argument(
                "payload_hash must be 64 hex characters",
            ));
        }
        let decoded = hex::decode(payload_hash_hex)
            .map_err(|_| SignerError::invalid_argument("payload_hash is not valid hex"))?;
        let payload_hash: [u8; 32] = decoded
            .try_into()
            .map_err(|_| SignerError::invalid_argument("payload_hash must decode to 32 bytes"))?;

        let now_unix = now.timestamp().max(0) as u64;
        if expiry_unix <= now_unix {
            return Err(SignerError::invalid_argument("request expiry is in the past"));
        }

        Ok(Self {
            purpose,
            service_id: service_id.to_string(),
            chain_id: chain_id.to_string(),
            request_id: request_id.to_string(),
            payload_hash,
            expiry_unix,
        })
    }
}

/// Compute the domain hash binding every request field.
///
/// Layout: `SHA-256(purpose || 0x00 || service_id || 0x00 || chain_id ||
/// 0x00 || request_id || 0x00 || payload_hash || expiry_be_u64)`. The null
/// byte is a field separator; the expiry is 8 bytes big-endian.
pub fn domain_hash(request: &DomainSeparatedRequest) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(request.purpose.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(request.service_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(request.chain_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(request.request_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(request.payload_hash);
    hasher.update(request.expiry_unix.to_be_bytes());
    hasher.finalize().into()
}

/// The message the ECDSA operation actually signs.
pub fn signing_message(domain_hash: &[u8; 32]) -> [u8; 32] {
    Sha256::new()
        .chain_update(SIGNING_PREFIX)
        .chain_update(domain_hash)
        .finalize()
        .into()
}

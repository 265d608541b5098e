// tee-signer: Key derivation and signing primitives

use chrono::{DateTime, Utc};
use hkdf::Hkdf;
use p256::ecdsa::signature::hazmat::RandomizedPrehashSigner;
use p256::ecdsa::{Signature, SigningKey};
use p256::elliptic_curve::bigint::{ArrayEncoding, NonZero, U256};
use p256::elliptic_curve::sec1::FromEncodedPoint;
use p256::PublicKey;
use sha2::Sha256;
use thiserror::Error;

/// HKDF salt for all key derivation
const HKDF_SALT: &[u8] = b"tee-signer";

/// HKDF info prefix; the key version label is appended
const HKDF_INFO_PREFIX: &str = "neo-signer-";

/// P-256 group order minus one. Derived scalars map into [1, n-1] by
/// `d = (okm mod (n-1)) + 1`, which avoids the zero scalar and the
/// degenerate upper boundary.
const ORDER_MINUS_ONE: &str = "FFFFFFFF00000000FFFFFFFFFFFFFFFFBCE6FAADA7179E84F3B9CAC2FC632550";

/// Crypto error types
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("master seed is required")]
    SeedRequired,

    #[error("key version is required")]
    VersionRequired,

    #[error("key derivation failed: {0}")]
    Derivation(String),

    #[error("derived public key is not a valid curve point")]
    PointOffCurve,

    #[error("invalid transaction hash: {0}")]
    InvalidTxHash(String),

    #[error("signing failed: {0}")]
    Signing(String),
}

/// Derive the P-256 private key for `(seed, key_version)`.
///
/// Deterministic: the same pair always yields the same key, across runs and
/// hosts. The HKDF salt, info string, and scalar mapping are fixed wire
/// constants; changing any of them orphans every persisted key version.
pub fn derive_p256(seed: &[u8], key_version: &str) -> Result<SigningKey, CryptoError> {
    if seed.is_empty() {
        return Err(CryptoError::SeedRequired);
    }
    if key_version.is_empty() {
        return Err(CryptoError::VersionRequired);
    }

    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), seed);
    let info = format!("{}{}", HKDF_INFO_PREFIX, key_version);
    let mut okm = [0u8; 32];
    hk.expand(info.as_bytes(), &mut okm)
        .map_err(|e| CryptoError::Derivation(e.to_string()))?;

    let modulus = Option::<NonZero<U256>>::from(NonZero::new(U256::from_be_hex(ORDER_MINUS_ONE)))
        .ok_or_else(|| CryptoError::Derivation("group order constant is zero".to_string()))?;
    let d = U256::from_be_slice(&okm)
        .rem(&modulus)
        .wrapping_add(&U256::ONE);

    let key = SigningKey::from_bytes(&d.to_be_byte_array())
        .map_err(|_| CryptoError::Derivation("derived scalar out of range".to_string()))?;

    // The mapping above cannot produce an off-curve point, but the result is
    // used as a signing authority, so verify d*G decodes anyway.
    let encoded = key.verifying_key().to_encoded_point(false);
    if Option::<PublicKey>::from(PublicKey::from_encoded_point(&encoded)).is_none() {
        return Err(CryptoError::PointOffCurve);
    }

    Ok(key)
}

/// Sign a 32-byte hash, returning the raw 64-byte `r || s` encoding.
///
/// Both halves are big-endian and left-zero-padded to 32 bytes; the output
/// is never ASN.1/DER. The RNG is injectable so tests can assert the byte
/// layout deterministically; production callers pass the OS CSPRNG.
pub fn sign_hash_p256<R>(
    rng: &mut R,
    key: &SigningKey,
    hash: &[u8; 32],
) -> Result<[u8; 64], CryptoError>
where
    R: rand::RngCore + rand::CryptoRng,
{
    let signature: Signature = key
        .sign_prehash_with_rng(rng, hash)
        .map_err(|e| CryptoError::Signing(e.to_string()))?;

    let bytes = signature.to_bytes();
    let mut out = [0u8; 64];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Decode and canonicalize a transaction hash.
///
/// Accepts surrounding whitespace and one optional `0x`/`0X` prefix. The
/// decoded value must be exactly 32 bytes. The canonical form is lowercase
/// hex with a `0x` prefix.
pub fn decode_tx_hash_hex(raw: &str) -> Result<(String, [u8; 32]), CryptoError> {
    let trimmed = raw.trim();
    let stripped = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if stripped.is_empty() {
        return Err(CryptoError::InvalidTxHash("empty hash".to_string()));
    }
    if stripped.len() % 2 != 0 {
        return Err(CryptoError::InvalidTxHash(
            "odd-length hex string".to_string(),
        ));
    }

    let bytes = hex::decode(stripped)
        .map_err(|e| CryptoError::InvalidTxHash(e.to_string()))?;
    let bytes: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
        CryptoError::InvalidTxHash(format!("expected 32 bytes, got {}", v.len()))
    })?;

    Ok((format!("0x{}", hex::encode(bytes)), bytes))
}

/// Canonical version label for a rotation at time `t`.
///
/// Two rotations within the same wall-clock second produce the same label;
/// rotation relies on this for idempotency.
pub fn key_version_from_time(t: DateTime<Utc>) -> String {
    format!("v{}", t.timestamp())
}

/// Check a key version label against the accepted grammar
/// (`v` followed by one or more of `[0-9A-Za-z_-]`).
pub fn is_valid_key_version(version: &str) -> bool {
    let Some(rest) = version.strip_prefix('v') else {
        return false;
    };
    !rest.is_empty()
        && rest
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

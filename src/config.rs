// tee-signer: Configuration support

use std::env;
use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto;
use crate::error::{SignerError, SignerResult};

/// Minimum accepted master seed length in bytes.
pub const MIN_SEED_LEN: usize = 16;

/// Environment variable prefix for overrides.
const ENV_PREFIX: &str = "TEE_SIGNER_";

/// Signer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignerConfig {
    pub server: ServerSection,
    pub keys: KeySection,
    pub rate_limit: RateLimitSection,
    pub audit: AuditSection,
    pub tls: TlsSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Bind address for the mTLS listener
    pub bind_address: String,
    /// Client CNs allowed to call the administrative rotate endpoint.
    /// Empty disables the endpoint entirely.
    pub admin_common_names: Vec<String>,
    /// Grace period for connection drain and audit flush on shutdown
    pub shutdown_grace_ms: u64,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeySection {
    /// Master seed as a raw string. Prefer `master_seed_file` or the
    /// TEE_SIGNER_MASTER_SEED environment variable outside of tests.
    #[serde(skip_serializing)]
    pub master_seed: Option<String>,
    /// Path to a file holding the master seed
    pub master_seed_file: Option<String>,
    /// Starting version label when no repository record exists
    pub initial_key_version: String,
    /// Seconds a rotated key remains valid as deprecated
    pub overlap_period_secs: u64,
    /// Strict mode: repository errors are fatal
    pub require_repository: bool,
    /// Key-version repository backend: "none" (in-process only) or
    /// "memory" (in-memory repository, dev/test deployments)
    pub repository_backend: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    /// Tokens per second per client CN
    pub rps: f64,
    /// Bucket capacity per client CN (minimum 1)
    pub burst: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSection {
    /// Bounded channel capacity
    pub buffer: usize,
    /// Per-event write deadline in milliseconds
    pub timeout_ms: u64,
    /// REST audit store base URL; unset disables persistence
    pub store_url: Option<String>,
    /// Service key for the REST audit store
    pub store_key: Option<String>,
    /// Target table for audit rows
    pub table: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSection {
    /// Server certificate chain (PEM)
    pub cert_file: String,
    /// Server private key (PEM)
    pub key_file: String,
    /// CA bundle used to verify client certificates (PEM)
    pub ca_file: String,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            server: ServerSection::default(),
            keys: KeySection::default(),
            rate_limit: RateLimitSection::default(),
            audit: AuditSection::default(),
            tls: TlsSection::default(),
        }
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8443".to_string(),
            admin_common_names: Vec::new(),
            shutdown_grace_ms: 10_000,
        }
    }
}

impl Default for KeySection {
    fn default() -> Self {
        Self {
            master_seed: None,
            master_seed_file: None,
            initial_key_version: "v1".to_string(),
            overlap_period_secs: 7 * 24 * 3600,
            require_repository: false,
            repository_backend: "none".to_string(),
        }
    }
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            rps: 100.0,
            burst: 100,
        }
    }
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            buffer: 1024,
            timeout_ms: 5000,
            store_url: None,
            store_key: None,
            table: "audit_logs".to_string(),
        }
    }
}

impl Default for TlsSection {
    fn default() -> Self {
        Self {
            cert_file: String::new(),
            key_file: String::new(),
            ca_file: String::new(),
        }
    }
}

// The seed never reaches log output, even at debug level.
impl fmt::Debug for KeySection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySection")
            .field("master_seed", &self.master_seed.as_ref().map(|_| "<redacted>"))
            .field("master_seed_file", &self.master_seed_file)
            .field("initial_key_version", &self.initial_key_version)
            .field("overlap_period_secs", &self.overlap_period_secs)
            .field("require_repository", &self.require_repository)
            .field("repository_backend", &self.repository_backend)
            .finish()
    }
}

impl SignerConfig {
    /// Load config from a TOML file
    pub fn from_file(path: &str) -> SignerResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SignerError::config_error(format!("failed to read config file {}: {}", path, e))
        })?;

        toml::from_str(&content).map_err(|e| {
            SignerError::config_error(format!("failed to parse config file {}: {}", path, e))
        })
    }

    /// Apply TEE_SIGNER_* environment overrides on top of the loaded config
    pub fn apply_env(&mut self) -> SignerResult<()> {
        if let Some(v) = read_env("BIND_ADDRESS") {
            self.server.bind_address = v;
        }
        if let Some(v) = read_env("ADMIN_CNS") {
            self.server.admin_common_names = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = read_env("SHUTDOWN_GRACE_MS") {
            self.server.shutdown_grace_ms = parse_env("SHUTDOWN_GRACE_MS", &v)?;
        }
        if let Some(v) = read_env("MASTER_SEED") {
            self.keys.master_seed = Some(v);
        }
        if let Some(v) = read_env("MASTER_SEED_FILE") {
            self.keys.master_seed_file = Some(v);
        }
        if let Some(v) = read_env("INITIAL_KEY_VERSION") {
            self.keys.initial_key_version = v;
        }
        if let Some(v) = read_env("OVERLAP_PERIOD_SECS") {
            self.keys.overlap_period_secs = parse_env("OVERLAP_PERIOD_SECS", &v)?;
        }
        if let Some(v) = read_env("REQUIRE_REPOSITORY") {
            self.keys.require_repository = parse_env("REQUIRE_REPOSITORY", &v)?;
        }
        if let Some(v) = read_env("REPOSITORY_BACKEND") {
            self.keys.repository_backend = v;
        }
        if let Some(v) = read_env("RATE_LIMIT_RPS") {
            self.rate_limit.rps = parse_env("RATE_LIMIT_RPS", &v)?;
        }
        if let Some(v) = read_env("RATE_LIMIT_BURST") {
            self.rate_limit.burst = parse_env("RATE_LIMIT_BURST", &v)?;
        }
        if let Some(v) = read_env("AUDIT_BUFFER") {
            self.audit.buffer = parse_env("AUDIT_BUFFER", &v)?;
        }
        if let Some(v) = read_env("AUDIT_TIMEOUT_MS") {
            self.audit.timeout_ms = parse_env("AUDIT_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = read_env("AUDIT_STORE_URL") {
            self.audit.store_url = Some(v);
        }
        if let Some(v) = read_env("AUDIT_STORE_KEY") {
            self.audit.store_key = Some(v);
        }
        if let Some(v) = read_env("AUDIT_TABLE") {
            self.audit.table = v;
        }
        if let Some(v) = read_env("TLS_CERT_FILE") {
            self.tls.cert_file = v;
        }
        if let Some(v) = read_env("TLS_KEY_FILE") {
            self.tls.key_file = v;
        }
        if let Some(v) = read_env("TLS_CA_FILE") {
            self.tls.ca_file = v;
        }
        Ok(())
    }

    /// Validate configuration invariants
    pub fn validate(&self) -> SignerResult<()> {
        if self.keys.master_seed.is_none() && self.keys.master_seed_file.is_none() {
            return Err(SignerError::config_error(
                "master key seed is required (keys.master_seed, keys.master_seed_file, or TEE_SIGNER_MASTER_SEED)",
            ));
        }
        if !crypto::is_valid_key_version(&self.keys.initial_key_version) {
            return Err(SignerError::config_error(format!(
                "invalid initial key version label: {}",
                self.keys.initial_key_version
            )));
        }
        if self.keys.overlap_period_secs == 0 {
            return Err(SignerError::config_error(
                "overlap period must be greater than zero",
            ));
        }
        match self.keys.repository_backend.as_str() {
            "none" | "memory" => {}
            other => {
                return Err(SignerError::config_error(format!(
                    "unknown repository backend: {}",
                    other
                )));
            }
        }
        if self.keys.require_repository && self.keys.repository_backend == "none" {
            return Err(SignerError::config_error(
                "require_repository is set but no repository backend is configured",
            ));
        }
        if self.rate_limit.rps <= 0.0 {
            return Err(SignerError::config_error(
                "rate limit rps must be greater than zero",
            ));
        }
        if self.rate_limit.burst == 0 {
            return Err(SignerError::config_error(
                "rate limit burst must be at least 1",
            ));
        }
        if self.audit.buffer == 0 {
            return Err(SignerError::config_error(
                "audit buffer must be at least 1",
            ));
        }
        Ok(())
    }

    /// Resolve the master seed bytes.
    ///
    /// The returned buffer zeroizes on drop. The inline value wins over the
    /// file so environment overrides behave predictably.
    pub fn resolve_master_seed(&self) -> SignerResult<Zeroizing<Vec<u8>>> {
        if let Some(seed) = &self.keys.master_seed {
            let bytes = Zeroizing::new(seed.as_bytes().to_vec());
            return check_seed_len(bytes);
        }
        if let Some(path) = &self.keys.master_seed_file {
            let raw = std::fs::read(path).map_err(|e| {
                SignerError::config_error(format!("failed to read master seed file {}: {}", path, e))
            })?;
            let mut raw = Zeroizing::new(raw);
            while raw.last() == Some(&b'\n') || raw.last() == Some(&b'\r') {
                raw.pop();
            }
            return check_seed_len(raw);
        }
        Err(SignerError::config_error("master key seed is required"))
    }
}

fn check_seed_len(seed: Zeroizing<Vec<u8>>) -> SignerResult<Zeroizing<Vec<u8>>> {
    if seed.len() < MIN_SEED_LEN {
        return Err(SignerError::config_error(format!(
            "master seed must be at least {} bytes",
            MIN_SEED_LEN
        )));
    }
    Ok(seed)
}

fn read_env(name: &str) -> Option<String> {
    env::var(format!("{}{}", ENV_PREFIX, name)).ok()
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> SignerResult<T>
where
    T::Err: fmt::Display,
{
    value.parse().map_err(|e| {
        SignerError::config_error(format!("invalid {}{}: {}", ENV_PREFIX, name, e))
    })
}

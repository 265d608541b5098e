// tee-signer: Key lifecycle management

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use p256::ecdsa::SigningKey;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::clock::Clock;
use crate::crypto::{self, CryptoError};
use crate::repository::{
    KeyStatus, KeyVersionRecord, KeyVersionRepository, KeyVersionUpdate, RepositoryError,
};

/// Key manager settings
#[derive(Debug, Clone)]
pub struct KeyManagerSettings {
    /// Version label used when no repository record exists
    pub initial_key_version: String,
    /// How long a rotated key remains valid as deprecated
    pub overlap_period: Duration,
    /// Strict mode: repository errors during bootstrap and rotation are fatal
    pub require_repository: bool,
}

impl Default for KeyManagerSettings {
    fn default() -> Self {
        Self {
            initial_key_version: "v1".to_string(),
            overlap_period: Duration::days(7),
            require_repository: false,
        }
    }
}

/// Key manager error types
#[derive(Debug, Error)]
pub enum KeyManagerError {
    #[error("key version not found")]
    VersionNotFound,

    #[error("key version expired")]
    VersionExpired,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("repository error: {0}")]
    Repository(String),

    #[error("unexpected lifecycle state: {0}")]
    Lifecycle(String),
}

/// Outcome of a rotation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationResult {
    pub old_version: Option<String>,
    pub new_version: String,
    /// When the previous active version stops being accepted; absent for
    /// idempotent no-op rotations
    pub deprecated_until: Option<DateTime<Utc>>,
    pub rotated_at: DateTime<Utc>,
    pub rotated: bool,
}

struct KeyEntry {
    key: SigningKey,
    status: KeyStatus,
    valid_from: DateTime<Utc>,
    valid_until: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct KeyState {
    active_version: Option<String>,
    keys: HashMap<String, KeyEntry>,
}

/// Derives, caches, and rotates the signing keys.
///
/// Holds at most the active version plus non-expired deprecated versions in
/// memory. A single read/write lock protects the cache; repository calls
/// happen outside the lock and their results are applied under it, so a
/// concurrent `signing_key_at` always observes either the pre-rotation or
/// the post-rotation view, never a window where both fail.
pub struct KeyManager {
    seed: Zeroizing<Vec<u8>>,
    repository: Option<Arc<dyn KeyVersionRepository>>,
    clock: Arc<dyn Clock>,
    settings: KeyManagerSettings,
    state: RwLock<KeyState>,
    degraded: AtomicBool,
}

impl KeyManager {
    /// Bootstrap the manager, reconciling with the repository when one is
    /// configured.
    ///
    /// Repository errors are fatal in strict mode. In permissive mode the
    /// manager degrades to in-memory operation under the initial version
    /// label and flags itself degraded.
    pub async fn bootstrap(
        seed: Zeroizing<Vec<u8>>,
        repository: Option<Arc<dyn KeyVersionRepository>>,
        clock: Arc<dyn Clock>,
        settings: KeyManagerSettings,
    ) -> Result<Self, KeyManagerError> {
        let manager = Self {
            seed,
            repository,
            clock,
            settings,
            state: RwLock::new(KeyState::default()),
            degraded: AtomicBool::new(false),
        };
        let now = manager.clock.now();

        let Some(repo) = manager.repository.clone() else {
            let initial = manager.settings.initial_key_version.clone();
            manager.install_active(&initial, now)?;
            return Ok(manager);
        };

        match repo.get_active_key_version().await {
            Ok(Some(_)) => match manager.refresh_from_repository(now).await {
                Ok(()) => {}
                Err(e) if manager.settings.require_repository => return Err(e),
                Err(e) => manager.degrade_at_bootstrap(e, now)?,
            },
            Ok(None) => {
                let version = crypto::key_version_from_time(now);
                let record = KeyVersionRecord {
                    key_version: version.clone(),
                    status: KeyStatus::Active,
                    valid_from: now,
                    valid_until: None,
                };
                match repo.create_key_version(record).await {
                    Ok(_) => {
                        manager.install_active(&version, now)?;
                        info!(version = %version, "created initial key version");
                    }
                    Err(e) if manager.settings.require_repository => {
                        return Err(KeyManagerError::Repository(e.to_string()));
                    }
                    Err(e) => {
                        manager.degrade_at_bootstrap(
                            KeyManagerError::Repository(e.to_string()),
                            now,
                        )?;
                    }
                }
            }
            Err(e) if manager.settings.require_repository => {
                return Err(KeyManagerError::Repository(e.to_string()));
            }
            Err(e) => {
                manager
                    .degrade_at_bootstrap(KeyManagerError::Repository(e.to_string()), now)?;
            }
        }

        Ok(manager)
    }

    fn degrade_at_bootstrap(
        &self,
        cause: KeyManagerError,
        now: DateTime<Utc>,
    ) -> Result<(), KeyManagerError> {
        warn!(error = %cause, "repository unavailable at bootstrap, degrading to in-memory keys");
        self.degraded.store(true, Ordering::Relaxed);
        let initial = self.settings.initial_key_version.clone();
        self.install_active(&initial, now)
    }

    fn install_active(&self, version: &str, now: DateTime<Utc>) -> Result<(), KeyManagerError> {
        let key = crypto::derive_p256(&self.seed, version)?;
        let mut state = self.state.write();
        state.keys.insert(
            version.to_string(),
            KeyEntry {
                key,
                status: KeyStatus::Active,
                valid_from: now,
                valid_until: None,
            },
        );
        state.active_version = Some(version.to_string());
        Ok(())
    }

    /// Reload the in-memory cache from the repository so the local view
    /// matches the persisted truth.
    async fn refresh_from_repository(&self, now: DateTime<Utc>) -> Result<(), KeyManagerError> {
        let Some(repo) = self.repository.clone() else {
            return Ok(());
        };

        let records = repo
            .list_key_versions_by_status(&[KeyStatus::Active, KeyStatus::Deprecated])
            .await
            .map_err(|e| KeyManagerError::Repository(e.to_string()))?;

        let mut fresh: HashMap<String, KeyEntry> = HashMap::new();
        let mut active_version = None;
        let mut stale = Vec::new();

        for record in records {
            match record.status {
                KeyStatus::Active => {
                    let key = crypto::derive_p256(&self.seed, &record.key_version)?;
                    active_version = Some(record.key_version.clone());
                    fresh.insert(
                        record.key_version,
                        KeyEntry {
                            key,
                            status: KeyStatus::Active,
                            valid_from: record.valid_from,
                            valid_until: None,
                        },
                    );
                }
                KeyStatus::Deprecated => match record.valid_until {
                    Some(until) if until > now => {
                        let key = crypto::derive_p256(&self.seed, &record.key_version)?;
                        fresh.insert(
                            record.key_version,
                            KeyEntry {
                                key,
                                status: KeyStatus::Deprecated,
                                valid_from: record.valid_from,
                                valid_until: Some(until),
                            },
                        );
                    }
                    _ => stale.push(record.key_version),
                },
                KeyStatus::Expired => {}
            }
        }

        {
            let mut state = self.state.write();
            // a version expired locally never comes back, even if the
            // repository still lists it as live
            for (version, entry) in state.keys.drain() {
                if entry.status == KeyStatus::Expired {
                    if active_version.as_deref() == Some(version.as_str()) {
                        warn!(version = %version, "repository lists an expired version as active");
                    }
                    fresh.insert(version, entry);
                }
            }
            state.keys = fresh;
            state.active_version = active_version;
        }

        // deprecated records whose overlap has lapsed are demoted best-effort
        for version in stale {
            if let Err(e) = repo
                .update_key_version(
                    &version,
                    KeyVersionUpdate {
                        status: Some(KeyStatus::Expired),
                        valid_until: None,
                    },
                )
                .await
            {
                if !matches!(e, RepositoryError::NotFound) {
                    debug!(version = %version, error = %e, "failed to expire stale key version");
                }
            }
        }

        Ok(())
    }

    /// Resolve the signing key for `requested_version`, or the active
    /// version when none is requested.
    ///
    /// Returns the resolved version label with the key. Cache misses fall
    /// through to the repository and install lazily.
    pub async fn signing_key_at(
        &self,
        requested_version: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(String, SigningKey), KeyManagerError> {
        self.cleanup(now).await;

        let target = match requested_version {
            Some(version) if !version.is_empty() => version.to_string(),
            _ => self
                .state
                .read()
                .active_version
                .clone()
                .ok_or(KeyManagerError::VersionNotFound)?,
        };

        let cached = {
            let state = self.state.read();
            state
                .keys
                .get(&target)
                .map(|entry| (entry.status, entry.valid_until, entry.key.clone()))
        };
        if let Some((status, valid_until, key)) = cached {
            return match status {
                KeyStatus::Active => Ok((target, key)),
                KeyStatus::Deprecated => match valid_until {
                    Some(until) if now < until => Ok((target, key)),
                    _ => Err(KeyManagerError::VersionExpired),
                },
                KeyStatus::Expired => Err(KeyManagerError::VersionExpired),
            };
        }

        let Some(repo) = self.repository.clone() else {
            return Err(KeyManagerError::VersionNotFound);
        };
        let record = match repo.get_key_version(&target).await {
            Ok(record) => record,
            Err(e) if self.settings.require_repository => {
                return Err(KeyManagerError::Repository(e.to_string()));
            }
            Err(e) => {
                warn!(error = %e, "repository lookup failed, treating version as unknown");
                return Err(KeyManagerError::VersionNotFound);
            }
        };
        let Some(record) = record else {
            return Err(KeyManagerError::VersionNotFound);
        };

        match record.status {
            KeyStatus::Expired => Err(KeyManagerError::VersionExpired),
            KeyStatus::Deprecated if record.valid_until.map_or(true, |until| until <= now) => {
                Err(KeyManagerError::VersionExpired)
            }
            status => {
                let key = crypto::derive_p256(&self.seed, &target)?;
                let mut state = self.state.write();
                let entry = state.keys.entry(target.clone()).or_insert(KeyEntry {
                    key,
                    status,
                    valid_from: record.valid_from,
                    valid_until: record.valid_until,
                });
                if entry.status == KeyStatus::Expired {
                    return Err(KeyManagerError::VersionExpired);
                }
                Ok((target.clone(), entry.key.clone()))
            }
        }
    }

    /// Rotate to a fresh key version.
    ///
    /// The new label is derived from the current second, which makes a
    /// second rotation within the same second a reported no-op. The
    /// outgoing active version stays usable as deprecated until
    /// `now + overlap_period`.
    pub async fn rotate(&self) -> Result<RotationResult, KeyManagerError> {
        let now = self.clock.now();
        self.cleanup(now).await;

        let new_version = crypto::key_version_from_time(now);
        let old_version = self.state.read().active_version.clone();

        if old_version.as_deref() == Some(new_version.as_str()) {
            return Ok(RotationResult {
                old_version,
                new_version,
                deprecated_until: None,
                rotated_at: now,
                rotated: false,
            });
        }

        let deprecated_until = now + self.settings.overlap_period;

        match self.repository.clone() {
            None => {
                self.rotate_in_memory(old_version.as_deref(), &new_version, now, deprecated_until)?;
            }
            Some(repo) => {
                match self
                    .rotate_with_repository(
                        &repo,
                        old_version.as_deref(),
                        &new_version,
                        now,
                        deprecated_until,
                    )
                    .await
                {
                    Ok(()) => {}
                    Err(e) if self.settings.require_repository => return Err(e),
                    Err(e) => {
                        warn!(error = %e, "repository rotation failed, falling back to in-memory rotation");
                        self.degraded.store(true, Ordering::Relaxed);
                        self.rotate_in_memory(
                            old_version.as_deref(),
                            &new_version,
                            now,
                            deprecated_until,
                        )?;
                    }
                }
            }
        }

        info!(
            old_version = old_version.as_deref().unwrap_or("none"),
            new_version = %new_version,
            deprecated_until = %deprecated_until,
            "key rotated"
        );

        Ok(RotationResult {
            old_version,
            new_version,
            deprecated_until: Some(deprecated_until),
            rotated_at: now,
            rotated: true,
        })
    }

    fn rotate_in_memory(
        &self,
        old_version: Option<&str>,
        new_version: &str,
        now: DateTime<Utc>,
        deprecated_until: DateTime<Utc>,
    ) -> Result<(), KeyManagerError> {
        let key = crypto::derive_p256(&self.seed, new_version)?;

        let mut state = self.state.write();
        if let Some(old) = old_version {
            if let Some(entry) = state.keys.get_mut(old) {
                if entry.status == KeyStatus::Active {
                    entry.status = KeyStatus::Deprecated;
                    entry.valid_until = Some(deprecated_until);
                }
            }
        }
        state.keys.insert(
            new_version.to_string(),
            KeyEntry {
                key,
                status: KeyStatus::Active,
                valid_from: now,
                valid_until: None,
            },
        );
        state.active_version = Some(new_version.to_string());
        Ok(())
    }

    async fn rotate_with_repository(
        &self,
        repo: &Arc<dyn KeyVersionRepository>,
        old_version: Option<&str>,
        new_version: &str,
        now: DateTime<Utc>,
        deprecated_until: DateTime<Utc>,
    ) -> Result<(), KeyManagerError> {
        if let Some(old) = old_version {
            match repo
                .update_key_version(
                    old,
                    KeyVersionUpdate {
                        status: Some(KeyStatus::Deprecated),
                        valid_until: Some(deprecated_until),
                    },
                )
                .await
            {
                // a missing old record is recoverable, the rotation proceeds
                Ok(_) | Err(RepositoryError::NotFound) => {}
                Err(e) => return Err(KeyManagerError::Repository(e.to_string())),
            }
        }

        let record = KeyVersionRecord {
            key_version: new_version.to_string(),
            status: KeyStatus::Active,
            valid_from: now,
            valid_until: None,
        };
        match repo.create_key_version(record).await {
            Ok(_) => {}
            Err(RepositoryError::Conflict) => {
                // another process may have landed the same per-second
                // version; accept only if it is active
                let existing = repo
                    .get_key_version(new_version)
                    .await
                    .map_err(|e| KeyManagerError::Repository(e.to_string()))?;
                match existing {
                    Some(record) if record.status == KeyStatus::Active => {}
                    Some(record) => {
                        return Err(KeyManagerError::Lifecycle(format!(
                            "version {} already exists with status {}",
                            new_version,
                            record.status.as_str()
                        )));
                    }
                    None => {
                        return Err(KeyManagerError::Lifecycle(format!(
                            "version {} conflicted on create but cannot be read back",
                            new_version
                        )));
                    }
                }
            }
            Err(e) => return Err(KeyManagerError::Repository(e.to_string())),
        }

        self.refresh_from_repository(now).await
    }

    /// Demote deprecated versions whose overlap has lapsed.
    ///
    /// Runs on every key resolution and at the start of every rotation.
    /// Repository demotion is best-effort; the in-memory demotion is what
    /// enforces rejection.
    pub async fn cleanup(&self, now: DateTime<Utc>) {
        let expired: Vec<String> = {
            let mut state = self.state.write();
            let mut expired = Vec::new();
            for (version, entry) in state.keys.iter_mut() {
                if entry.status == KeyStatus::Deprecated {
                    if let Some(until) = entry.valid_until {
                        if until <= now {
                            entry.status = KeyStatus::Expired;
                            expired.push(version.clone());
                        }
                    }
                }
            }
            expired
        };

        if expired.is_empty() {
            return;
        }
        for version in &expired {
            info!(version = %version, "key version expired");
        }

        if let Some(repo) = self.repository.clone() {
            for version in &expired {
                if let Err(e) = repo
                    .update_key_version(
                        version,
                        KeyVersionUpdate {
                            status: Some(KeyStatus::Expired),
                            valid_until: None,
                        },
                    )
                    .await
                {
                    if !matches!(e, RepositoryError::NotFound) {
                        debug!(version = %version, error = %e, "failed to persist key expiry");
                    }
                }
            }
        }
    }

    /// Currently active version label, if any.
    pub fn active_version(&self) -> Option<String> {
        self.state.read().active_version.clone()
    }

    /// In-memory lifecycle status of a version.
    pub fn version_status(&self, version: &str) -> Option<KeyStatus> {
        self.state.read().keys.get(version).map(|e| e.status)
    }

    /// True when the manager fell back to in-memory operation after a
    /// repository failure in permissive mode.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }
}

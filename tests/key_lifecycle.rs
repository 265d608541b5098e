// Key lifecycle tests: bootstrap reconciliation, rotation with overlap,
// strict vs permissive repository failure handling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use zeroize::Zeroizing;

use tee_signer::clock::{Clock, ManualClock};
use tee_signer::crypto;
use tee_signer::key_manager::{KeyManager, KeyManagerError, KeyManagerSettings};
use tee_signer::repository::{
    InMemoryKeyVersionRepository, KeyStatus, KeyVersionRecord, KeyVersionRepository,
    KeyVersionUpdate, RepositoryError,
};

const SEED: &[u8] = b"master-seed-for-tests";

fn seed() -> Zeroizing<Vec<u8>> {
    Zeroizing::new(SEED.to_vec())
}

fn clock() -> Arc<ManualClock> {
    let start = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
    Arc::new(ManualClock::new(start))
}

async fn bootstrap(
    repository: Option<Arc<dyn KeyVersionRepository>>,
    clock: Arc<ManualClock>,
    settings: KeyManagerSettings,
) -> Result<KeyManager, KeyManagerError> {
    KeyManager::bootstrap(seed(), repository, clock, settings).await
}

/// Repository that fails every call.
struct FailingRepository;

#[async_trait]
impl KeyVersionRepository for FailingRepository {
    async fn get_active_key_version(
        &self,
    ) -> Result<Option<KeyVersionRecord>, RepositoryError> {
        Err(RepositoryError::Backend("connection refused".to_string()))
    }

    async fn get_key_version(
        &self,
        _version: &str,
    ) -> Result<Option<KeyVersionRecord>, RepositoryError> {
        Err(RepositoryError::Backend("connection refused".to_string()))
    }

    async fn list_key_versions_by_status(
        &self,
        _statuses: &[KeyStatus],
    ) -> Result<Vec<KeyVersionRecord>, RepositoryError> {
        Err(RepositoryError::Backend("connection refused".to_string()))
    }

    async fn create_key_version(
        &self,
        _record: KeyVersionRecord,
    ) -> Result<KeyVersionRecord, RepositoryError> {
        Err(RepositoryError::Backend("connection refused".to_string()))
    }

    async fn update_key_version(
        &self,
        _version: &str,
        _update: KeyVersionUpdate,
    ) -> Result<KeyVersionRecord, RepositoryError> {
        Err(RepositoryError::Backend("connection refused".to_string()))
    }
}

/// Delegating repository with a write-failure switch, for exercising the
/// rotation fallback paths after a healthy bootstrap.
struct FlakyRepository {
    inner: InMemoryKeyVersionRepository,
    fail_writes: AtomicBool,
}

impl FlakyRepository {
    fn new() -> Self {
        Self {
            inner: InMemoryKeyVersionRepository::new(),
            fail_writes: AtomicBool::new(false),
        }
    }

    fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    fn writes_failing(&self) -> bool {
        self.fail_writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl KeyVersionRepository for FlakyRepository {
    async fn get_active_key_version(
        &self,
    ) -> Result<Option<KeyVersionRecord>, RepositoryError> {
        self.inner.get_active_key_version().await
    }

    async fn get_key_version(
        &self,
        version: &str,
    ) -> Result<Option<KeyVersionRecord>, RepositoryError> {
        self.inner.get_key_version(version).await
    }

    async fn list_key_versions_by_status(
        &self,
        statuses: &[KeyStatus],
    ) -> Result<Vec<KeyVersionRecord>, RepositoryError> {
        self.inner.list_key_versions_by_status(statuses).await
    }

    async fn create_key_version(
        &self,
        record: KeyVersionRecord,
    ) -> Result<KeyVersionRecord, RepositoryError> {
        if self.writes_failing() {
            return Err(RepositoryError::Backend("write refused".to_string()));
        }
        self.inner.create_key_version(record).await
    }

    async fn update_key_version(
        &self,
        version: &str,
        update: KeyVersionUpdate,
    ) -> Result<KeyVersionRecord, RepositoryError> {
        if self.writes_failing() {
            return Err(RepositoryError::Backend("write refused".to_string()));
        }
        self.inner.update_key_version(version, update).await
    }
}

#[tokio::test]
async fn test_bootstrap_creates_record_in_empty_repository() {
    let clock = clock();
    let repo = Arc::new(InMemoryKeyVersionRepository::new());
    let manager = bootstrap(Some(repo.clone()), clock.clone(), KeyManagerSettings::default())
        .await
        .unwrap();

    let expected_version = crypto::key_version_from_time(clock.now());
    assert_eq!(manager.active_version(), Some(expected_version.clone()));

    let record = repo.get_active_key_version().await.unwrap().unwrap();
    assert_eq!(record.key_version, expected_version);
    assert_eq!(record.status, KeyStatus::Active);
    assert_eq!(record.valid_from, clock.now());
    assert!(record.valid_until.is_none());
}

#[tokio::test]
async fn test_bootstrap_loads_live_versions_and_expires_stale_ones() {
    let clock = clock();
    let now = clock.now();
    let repo = Arc::new(InMemoryKeyVersionRepository::with_records([
        KeyVersionRecord {
            key_version: "v100".to_string(),
            status: KeyStatus::Active,
            valid_from: now - Duration::days(1),
            valid_until: None,
        },
        KeyVersionRecord {
            key_version: "v50".to_string(),
            status: KeyStatus::Deprecated,
            valid_from: now - Duration::days(3),
            valid_until: Some(now + Duration::days(1)),
        },
        KeyVersionRecord {
            key_version: "v10".to_string(),
            status: KeyStatus::Deprecated,
            valid_from: now - Duration::days(9),
            valid_until: Some(now - Duration::seconds(1)),
        },
    ]));

    let manager = bootstrap(Some(repo.clone()), clock.clone(), KeyManagerSettings::default())
        .await
        .unwrap();

    assert_eq!(manager.active_version().as_deref(), Some("v100"));

    // live deprecated version is usable
    let (version, _) = manager.signing_key_at(Some("v50"), now).await.unwrap();
    assert_eq!(version, "v50");

    // stale deprecated version was demoted in the repository and rejected
    let stale = repo.get_key_version("v10").await.unwrap().unwrap();
    assert_eq!(stale.status, KeyStatus::Expired);
    let result = manager.signing_key_at(Some("v10"), now).await;
    assert!(matches!(result, Err(KeyManagerError::VersionExpired)));
}

#[tokio::test]
async fn test_rotation_persists_overlap_and_new_active() {
    let clock = clock();
    let repo = Arc::new(InMemoryKeyVersionRepository::new());
    let manager = bootstrap(Some(repo.clone()), clock.clone(), KeyManagerSettings::default())
        .await
        .unwrap();
    let old_version = manager.active_version().unwrap();

    clock.advance(Duration::seconds(1));
    let result = manager.rotate().await.unwrap();

    assert!(result.rotated);
    assert_eq!(result.old_version.as_deref(), Some(old_version.as_str()));
    assert_eq!(result.new_version, crypto::key_version_from_time(clock.now()));
    assert_eq!(
        result.deprecated_until,
        Some(clock.now() + Duration::days(7))
    );

    let old_record = repo.get_key_version(&old_version).await.unwrap().unwrap();
    assert_eq!(old_record.status, KeyStatus::Deprecated);
    assert_eq!(old_record.valid_until, result.deprecated_until);

    let new_record = repo.get_active_key_version().await.unwrap().unwrap();
    assert_eq!(new_record.key_version, result.new_version);

    // the refreshed cache matches the persisted truth
    assert_eq!(manager.active_version(), Some(result.new_version));
    assert_eq!(
        manager.version_status(&old_version),
        Some(KeyStatus::Deprecated)
    );
}

#[tokio::test]
async fn test_rotation_within_one_second_is_idempotent() {
    let clock = clock();
    let manager = bootstrap(None, clock.clone(), KeyManagerSettings::default())
        .await
        .unwrap();

    clock.advance(Duration::seconds(1));
    let first = manager.rotate().await.unwrap();
    assert!(first.rotated);

    let second = manager.rotate().await.unwrap();
    assert!(!second.rotated);
    assert_eq!(second.new_version, first.new_version);
    assert!(second.deprecated_until.is_none());
}

#[tokio::test]
async fn test_overlap_boundary_is_exclusive() {
    let clock = clock();
    let manager = bootstrap(None, clock.clone(), KeyManagerSettings::default())
        .await
        .unwrap();

    clock.advance(Duration::seconds(1));
    let result = manager.rotate().await.unwrap();
    let deprecated_until = result.deprecated_until.unwrap();

    // one second before the boundary the old key still signs
    clock.set(deprecated_until - Duration::seconds(1));
    assert!(manager.signing_key_at(Some("v1"), clock.now()).await.is_ok());

    // at exactly valid_until it is rejected as expired
    clock.set(deprecated_until);
    let at_boundary = manager.signing_key_at(Some("v1"), clock.now()).await;
    assert!(matches!(at_boundary, Err(KeyManagerError::VersionExpired)));
    assert_eq!(manager.version_status("v1"), Some(KeyStatus::Expired));
}

#[tokio::test]
async fn test_lifecycle_never_regresses() {
    let clock = clock();
    let repo = Arc::new(InMemoryKeyVersionRepository::new());
    let manager = bootstrap(Some(repo.clone()), clock.clone(), KeyManagerSettings::default())
        .await
        .unwrap();
    let first_version = manager.active_version().unwrap();

    clock.advance(Duration::seconds(1));
    manager.rotate().await.unwrap();
    assert_eq!(
        manager.version_status(&first_version),
        Some(KeyStatus::Deprecated)
    );

    // past the overlap the version expires, in memory and in the repository
    clock.advance(Duration::days(8));
    manager.cleanup(clock.now()).await;
    assert_eq!(
        manager.version_status(&first_version),
        Some(KeyStatus::Expired)
    );
    let record = repo.get_key_version(&first_version).await.unwrap().unwrap();
    assert_eq!(record.status, KeyStatus::Expired);

    // further rotations leave the expired version expired
    clock.advance(Duration::seconds(1));
    manager.rotate().await.unwrap();
    assert_eq!(
        manager.version_status(&first_version),
        Some(KeyStatus::Expired)
    );
    let result = manager.signing_key_at(Some(&first_version), clock.now()).await;
    assert!(matches!(result, Err(KeyManagerError::VersionExpired)));
}

#[tokio::test]
async fn test_lazy_load_of_repository_only_version() {
    let clock = clock();
    let repo = Arc::new(InMemoryKeyVersionRepository::new());
    let manager = bootstrap(Some(repo.clone()), clock.clone(), KeyManagerSettings::default())
        .await
        .unwrap();

    // another process deposited a deprecated version the cache has not seen
    repo.create_key_version(KeyVersionRecord {
        key_version: "vside".to_string(),
        status: KeyStatus::Deprecated,
        valid_from: clock.now() - Duration::days(1),
        valid_until: Some(clock.now() + Duration::days(1)),
    })
    .await
    .unwrap();

    let (version, key) = manager
        .signing_key_at(Some("vside"), clock.now())
        .await
        .unwrap();
    assert_eq!(version, "vside");
    // the lazily loaded key is the deterministic derivation for that label
    assert_eq!(
        key.to_bytes(),
        crypto::derive_p256(SEED, "vside").unwrap().to_bytes()
    );
    assert_eq!(manager.version_status("vside"), Some(KeyStatus::Deprecated));
}

#[tokio::test]
async fn test_strict_mode_fails_bootstrap_on_repository_error() {
    let clock = clock();
    let settings = KeyManagerSettings {
        require_repository: true,
        ..KeyManagerSettings::default()
    };
    let result = bootstrap(Some(Arc::new(FailingRepository)), clock, settings).await;
    assert!(matches!(result, Err(KeyManagerError::Repository(_))));
}

#[tokio::test]
async fn test_permissive_mode_degrades_to_memory_on_repository_error() {
    let clock = clock();
    let manager = bootstrap(
        Some(Arc::new(FailingRepository)),
        clock.clone(),
        KeyManagerSettings::default(),
    )
    .await
    .unwrap();

    assert!(manager.is_degraded());
    assert_eq!(manager.active_version().as_deref(), Some("v1"));
    assert!(manager.signing_key_at(None, clock.now()).await.is_ok());
}

#[tokio::test]
async fn test_strict_mode_propagates_rotation_write_failure() {
    let clock = clock();
    let repo = Arc::new(FlakyRepository::new());
    let settings = KeyManagerSettings {
        require_repository: true,
        ..KeyManagerSettings::default()
    };
    let manager = bootstrap(Some(repo.clone()), clock.clone(), settings)
        .await
        .unwrap();
    let old_version = manager.active_version().unwrap();

    clock.advance(Duration::seconds(1));
    repo.fail_writes(true);
    let result = manager.rotate().await;
    assert!(matches!(result, Err(KeyManagerError::Repository(_))));

    // the failed rotation left the active version untouched
    assert_eq!(manager.active_version(), Some(old_version));
}

#[tokio::test]
async fn test_permissive_mode_rotates_in_memory_on_write_failure() {
    let clock = clock();
    let repo = Arc::new(FlakyRepository::new());
    let manager = bootstrap(Some(repo.clone()), clock.clone(), KeyManagerSettings::default())
        .await
        .unwrap();
    let old_version = manager.active_version().unwrap();

    clock.advance(Duration::seconds(1));
    repo.fail_writes(true);
    let result = manager.rotate().await.unwrap();

    assert!(result.rotated);
    assert!(manager.is_degraded());
    assert_eq!(manager.active_version(), Some(result.new_version.clone()));
    assert_eq!(
        manager.version_status(&old_version),
        Some(KeyStatus::Deprecated)
    );

    // local state serves both versions despite the repository outage
    assert!(manager
        .signing_key_at(Some(&old_version), clock.now())
        .await
        .is_ok());
    assert!(manager.signing_key_at(None, clock.now()).await.is_ok());
}

#[tokio::test]
async fn test_create_conflict_accepts_concurrent_active_record() {
    let clock = clock();
    let repo = Arc::new(InMemoryKeyVersionRepository::new());
    let manager = bootstrap(Some(repo.clone()), clock.clone(), KeyManagerSettings::default())
        .await
        .unwrap();

    // a peer process already landed the per-second version as active
    clock.advance(Duration::seconds(1));
    let contended = crypto::key_version_from_time(clock.now());
    repo.create_key_version(KeyVersionRecord {
        key_version: contended.clone(),
        status: KeyStatus::Active,
        valid_from: clock.now(),
        valid_until: None,
    })
    .await
    .unwrap();

    let result = manager.rotate().await.unwrap();
    assert!(result.rotated);
    assert_eq!(result.new_version, contended);
    assert_eq!(manager.active_version(), Some(contended));
}

#[tokio::test]
async fn test_create_conflict_with_dead_record_is_an_error() {
    let clock = clock();
    let repo = Arc::new(InMemoryKeyVersionRepository::new());
    let settings = KeyManagerSettings {
        require_repository: true,
        ..KeyManagerSettings::default()
    };
    let manager = bootstrap(Some(repo.clone()), clock.clone(), settings)
        .await
        .unwrap();

    // the contended version already burned through its lifecycle
    clock.advance(Duration::seconds(1));
    let contended = crypto::key_version_from_time(clock.now());
    repo.create_key_version(KeyVersionRecord {
        key_version: contended,
        status: KeyStatus::Expired,
        valid_from: clock.now() - Duration::days(30),
        valid_until: Some(clock.now() - Duration::days(23)),
    })
    .await
    .unwrap();

    let result = manager.rotate().await;
    assert!(matches!(result, Err(KeyManagerError::Lifecycle(_))));
}

#[tokio::test]
async fn test_two_managers_converge_through_the_repository() {
    let clock = clock();
    let repo: Arc<dyn KeyVersionRepository> = Arc::new(InMemoryKeyVersionRepository::new());
    let first = bootstrap(Some(repo.clone()), clock.clone(), KeyManagerSettings::default())
        .await
        .unwrap();

    clock.advance(Duration::seconds(30));
    first.rotate().await.unwrap();
    let active = first.active_version().unwrap();

    // a second process bootstrapping from the same repository sees the
    // rotated world, and derives bit-identical keys
    let second = bootstrap(Some(repo.clone()), clock.clone(), KeyManagerSettings::default())
        .await
        .unwrap();
    assert_eq!(second.active_version(), Some(active.clone()));

    let (_, key_a) = first.signing_key_at(None, clock.now()).await.unwrap();
    let (_, key_b) = second.signing_key_at(None, clock.now()).await.unwrap();
    assert_eq!(key_a.to_bytes(), key_b.to_bytes());
}

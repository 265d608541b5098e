// tee-signer: Key-version records and repository abstraction

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state of a key version.
///
/// Status only moves forward: `active -> deprecated -> expired`. An expired
/// version is never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Deprecated,
    Expired,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Active => "active",
            KeyStatus::Deprecated => "deprecated",
            KeyStatus::Expired => "expired",
        }
    }
}

/// One persisted key version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyVersionRecord {
    pub key_version: String,
    pub status: KeyStatus,
    pub valid_from: DateTime<Utc>,
    /// Set when the version leaves `active`; absent while active.
    pub valid_until: Option<DateTime<Utc>>,
}

/// Partial update applied to an existing record.
#[derive(Debug, Clone, Default)]
pub struct KeyVersionUpdate {
    pub status: Option<KeyStatus>,
    pub valid_until: Option<DateTime<Utc>>,
}

/// Repository error types
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("key version not found")]
    NotFound,

    #[error("key version already exists")]
    Conflict,

    #[error("repository backend error: {0}")]
    Backend(String),
}

/// Durable store for key-version records.
///
/// The repository is the source of truth for cross-process consistency; the
/// key manager's in-memory cache is derived state. Implementations must
/// enforce uniqueness on `key_version` at create.
#[async_trait]
pub trait KeyVersionRepository: Send + Sync {
    async fn get_active_key_version(&self)
        -> Result<Option<KeyVersionRecord>, RepositoryError>;

    async fn get_key_version(
        &self,
        version: &str,
    ) -> Result<Option<KeyVersionRecord>, RepositoryError>;

    async fn list_key_versions_by_status(
        &self,
        statuses: &[KeyStatus],
    ) -> Result<Vec<KeyVersionRecord>, RepositoryError>;

    async fn create_key_version(
        &self,
        record: KeyVersionRecord,
    ) -> Result<KeyVersionRecord, RepositoryError>;

    async fn update_key_version(
        &self,
        version: &str,
        update: KeyVersionUpdate,
    ) -> Result<KeyVersionRecord, RepositoryError>;
}

/// In-memory repository for dev deployments and tests.
#[derive(Default)]
pub struct InMemoryKeyVersionRepository {
    records: Mutex<HashMap<String, KeyVersionRecord>>,
}

impl InMemoryKeyVersionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the repository with existing records (test setup helper).
    pub fn with_records(records: impl IntoIterator<Item = KeyVersionRecord>) -> Self {
        let repo = Self::new();
        {
            let mut map = repo.records.lock();
            for record in records {
                map.insert(record.key_version.clone(), record);
            }
        }
        repo
    }
}

#[async_trait]
impl KeyVersionRepository for InMemoryKeyVersionRepository {
    async fn get_active_key_version(
        &self,
    ) -> Result<Option<KeyVersionRecord>, RepositoryError> {
        let records = self.records.lock();
        Ok(records
            .values()
            .find(|r| r.status == KeyStatus::Active)
            .cloned())
    }

    async fn get_key_version(
        &self,
        version: &str,
    ) -> Result<Option<KeyVersionRecord>, RepositoryError> {
        Ok(self.records.lock().get(version).cloned())
    }

    async fn list_key_versions_by_status(
        &self,
        statuses: &[KeyStatus],
    ) -> Result<Vec<KeyVersionRecord>, RepositoryError> {
        let records = self.records.lock();
        let mut matched: Vec<KeyVersionRecord> = records
            .values()
            .filter(|r| statuses.contains(&r.status))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.valid_from.cmp(&b.valid_from));
        Ok(matched)
    }

    async fn create_key_version(
        &self,
        record: KeyVersionRecord,
    ) -> Result<KeyVersionRecord, RepositoryError> {
        let mut records = self.records.lock();
        if records.contains_key(&record.key_version) {
            return Err(RepositoryError::Conflict);
        }
        records.insert(record.key_version.clone(), record.clone());
        Ok(record)
    }

    async fn update_key_version(
        &self,
        version: &str,
        update: KeyVersionUpdate,
    ) -> Result<KeyVersionRecord, RepositoryError> {
        let mut records = self.records.lock();
        let record = records.get_mut(version).ok_or(RepositoryError::NotFound)?;
        if let Some(status) = update.status {
            record.status = status;
        }
        if let Some(valid_until) = update.valid_until {
            record.valid_until = Some(valid_until);
        }
        Ok(record.clone())
    }
}

// tee-signer: Tamper-evident audit logging

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// One audit row. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub client_cn: String,
    /// Transaction hash for legacy signs, request id for domain-separated
    /// signs, or an operation marker for administrative actions.
    pub tx_hash: String,
    pub key_version: String,
}

/// Audit store error types
#[derive(Debug, Error)]
pub enum AuditStoreError {
    #[error("audit store request failed: {0}")]
    Request(String),

    #[error("unsupported audit store method: {0}")]
    UnsupportedMethod(String),
}

/// Narrow request surface over the audit backend.
///
/// The logger only ever POSTs JSON rows to its configured table; the wider
/// surface exists so operational tooling can share the store client.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn request(
        &self,
        method: &str,
        table: &str,
        body: Option<serde_json::Value>,
        query: &[(String, String)],
    ) -> Result<(), AuditStoreError>;
}

/// REST audit store posting rows to `{base_url}/rest/v1/{table}`.
pub struct RestAuditStore {
    client: reqwest::Client,
    base_url: String,
    service_key: Option<String>,
}

impl RestAuditStore {
    pub fn new(base_url: impl Into<String>, service_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            service_key,
        }
    }
}

#[async_trait]
impl AuditStore for RestAuditStore {
    async fn request(
        &self,
        method: &str,
        table: &str,
        body: Option<serde_json::Value>,
        query: &[(String, String)],
    ) -> Result<(), AuditStoreError> {
        let url = format!("{}/rest/v1/{}", self.base_url.trim_end_matches('/'), table);

        let mut request = match method {
            "POST" => self.client.post(&url),
            "GET" => self.client.get(&url),
            "PATCH" => self.client.patch(&url),
            "DELETE" => self.client.delete(&url),
            other => return Err(AuditStoreError::UnsupportedMethod(other.to_string())),
        };

        if let Some(key) = &self.service_key {
            request = request.bearer_auth(key).header("apikey", key.as_str());
        }
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AuditStoreError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AuditStoreError::Request(format!(
                "audit store returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// In-memory audit store, used by tests and local development.
#[derive(Default)]
pub struct MemoryAuditStore {
    rows: Mutex<Vec<(String, serde_json::Value)>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded `(table, row)` pairs in insertion order.
    pub fn rows(&self) -> Vec<(String, serde_json::Value)> {
        self.rows.lock().clone()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn request(
        &self,
        _method: &str,
        table: &str,
        body: Option<serde_json::Value>,
        _query: &[(String, String)],
    ) -> Result<(), AuditStoreError> {
        if let Some(body) = body {
            self.rows.lock().push((table.to_string(), body));
        }
        Ok(())
    }
}

/// Bounded asynchronous audit logger.
///
/// `log` never blocks the signing path: events go into a bounded channel
/// and a single background worker persists them best-effort. When the
/// channel is full the event is counted as dropped and discarded.
/// Durability here is intentionally weaker than for key versions.
pub struct AuditLogger {
    sender: Mutex<Option<mpsc::Sender<AuditEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    dropped: Arc<AtomicU64>,
}

impl AuditLogger {
    /// Start the logger and its background writer.
    ///
    /// Must be called from within a tokio runtime. With no store configured
    /// the worker drains and discards, which keeps `log` semantics (and the
    /// dropped counter) identical across dev and production wiring.
    pub fn new(
        store: Option<Arc<dyn AuditStore>>,
        table: impl Into<String>,
        buffer: usize,
        write_timeout: Duration,
    ) -> Self {
        let (sender, mut receiver) = mpsc::channel::<AuditEvent>(buffer.max(1));
        let table = table.into();

        let worker = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let Some(store) = store.as_ref() else {
                    continue;
                };
                let body = match serde_json::to_value(&event) {
                    Ok(body) => body,
                    Err(e) => {
                        warn!(error = %e, "failed to serialize audit event");
                        continue;
                    }
                };
                match tokio::time::timeout(
                    write_timeout,
                    store.request("POST", &table, Some(body), &[]),
                )
                .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, "audit write failed"),
                    Err(_) => warn!("audit write exceeded deadline"),
                }
            }
        });

        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Enqueue an event without blocking.
    ///
    /// Returns false if the buffer is full (counted as dropped) or the
    /// logger has been stopped.
    pub fn log(&self, event: AuditEvent) -> bool {
        let sender = self.sender.lock().clone();
        let Some(sender) = sender else {
            return false;
        };
        match sender.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Events discarded because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Close the channel once and wait for the writer to drain.
    ///
    /// Subsequent `log` calls return false. Returns false if the drain did
    /// not finish within `deadline`.
    pub async fn stop(&self, deadline: Duration) -> bool {
        // dropping the only sender closes the channel
        drop(self.sender.lock().take());

        let worker = self.worker.lock().take();
        let Some(worker) = worker else {
            return true;
        };
        match tokio::time::timeout(deadline, worker).await {
            Ok(_) => true,
            Err(_) => {
                warn!("audit drain did not complete before deadline");
                false
            }
        }
    }
}

//! Store trait, namespaces and the versioned record envelope.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Schema version written into every [`Versioned`] envelope.
pub const SCHEMA_VERSION: u32 = 1;

/// Logical partitions of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Namespace {
    /// Queen state, directives and allocations
    Coordination,
    /// Worker state snapshots
    HiveWorkers,
    /// Raw pattern contributions
    HiveCollective,
    /// Consensus-validated patterns
    CollectivePatterns,
    /// Audit log of conflict resolutions
    ConflictResolutions,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Coordination => "coordination",
            Namespace::HiveWorkers => "hive-workers",
            Namespace::HiveCollective => "hive-collective",
            Namespace::CollectivePatterns => "collective-patterns",
            Namespace::ConflictResolutions => "conflict-resolutions",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised at the store boundary.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unsupported schema version {found} for {namespace}/{key} (expected {expected})")]
    SchemaMismatch {
        namespace: Namespace,
        key: String,
        found: u32,
        expected: u32,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Namespaced key/value store with optional per-entry TTL.
#[async_trait]
pub trait HiveStore: Send + Sync {
    /// Insert or replace a value. `ttl = None` keeps it until deleted.
    async fn put(
        &self,
        namespace: Namespace,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<()>;

    /// Fetch a live (non-expired) value.
    async fn get(&self, namespace: Namespace, key: &str) -> Result<Option<Value>>;

    /// Remove a value, returning whether it existed.
    async fn delete(&self, namespace: Namespace, key: &str) -> Result<bool>;

    /// All live entries of a namespace, ordered by key.
    async fn list(&self, namespace: Namespace) -> Result<Vec<(String, Value)>>;

    /// Fails when the backend cannot serve requests.
    async fn health_check(&self) -> Result<()>;
}

/// Envelope around typed records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub schema_version: u32,
    pub written_at: DateTime<Utc>,
    pub data: T,
}

impl<T> Versioned<T> {
    pub fn new(data: T) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            written_at: Utc::now(),
            data,
        }
    }
}

/// Typed helpers layered over any [`HiveStore`].
#[async_trait]
pub trait StoreExt: HiveStore {
    async fn put_record<T>(
        &self,
        namespace: Namespace,
        key: &str,
        record: &T,
        ttl: Option<Duration>,
    ) -> Result<()>
    where
        T: Serialize + Sync,
    {
        let value = serde_json::to_value(Versioned::new(record))?;
        self.put(namespace, key, value, ttl).await
    }

    async fn get_record<T>(&self, namespace: Namespace, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        let Some(value) = self.get(namespace, key).await? else {
            return Ok(None);
        };

        let envelope: Versioned<T> = serde_json::from_value(value)?;
        if envelope.schema_version != SCHEMA_VERSION {
            return Err(StoreError::SchemaMismatch {
                namespace,
                key: key.to_string(),
                found: envelope.schema_version,
                expected: SCHEMA_VERSION,
            });
        }

        Ok(Some(envelope.data))
    }
}

impl<S: HiveStore + ?Sized> StoreExt for S {}

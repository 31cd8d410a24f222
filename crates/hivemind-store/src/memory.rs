//! In-process [`HiveStore`] backed by a map.

use crate::store::{HiveStore, Namespace, Result, StoreError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now < at).unwrap_or(true)
    }
}

/// Map-backed store. Expired entries are invisible to readers and are
/// purged on the next write to the same namespace.
#[derive(Debug)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<(Namespace, String), Entry>>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle availability; an unavailable store fails every call.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live entries in a namespace.
    pub async fn len(&self, namespace: Namespace) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .iter()
            .filter(|((ns, _), entry)| *ns == namespace && entry.is_live(now))
            .count()
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store disabled".to_string()))
        }
    }
}

#[async_trait]
impl HiveStore for MemoryStore {
    async fn put(
        &self,
        namespace: Namespace,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.ensure_available()?;

        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|(ns, _), entry| *ns != namespace || entry.is_live(now));
        entries.insert(
            (namespace, key.to_string()),
            Entry {
                value,
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );

        debug!(namespace = %namespace, key, "Stored entry");
        Ok(())
    }

    async fn get(&self, namespace: Namespace, key: &str) -> Result<Option<Value>> {
        self.ensure_available()?;

        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(&(namespace, key.to_string()))
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn delete(&self, namespace: Namespace, key: &str) -> Result<bool> {
        self.ensure_available()?;

        let now = Instant::now();
        let removed = self
            .entries
            .write()
            .await
            .remove(&(namespace, key.to_string()));
        Ok(removed.map(|entry| entry.is_live(now)).unwrap_or(false))
    }

    async fn list(&self, namespace: Namespace) -> Result<Vec<(String, Value)>> {
        self.ensure_available()?;

        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|((ns, _), entry)| *ns == namespace && entry.is_live(now))
            .map(|((_, key), entry)| (key.clone(), entry.value.clone()))
            .collect())
    }

    async fn health_check(&self) -> Result<()> {
        self.ensure_available()
    }
}

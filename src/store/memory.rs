use std::collections::{BTreeMap, HashMap};

use log::info;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{Collection, DedupKey, Store};

#[derive(Default)]
struct Inner {
    tracked: Vec<String>,
    appended: HashMap<(Collection, String), Vec<Value>>,
    keyed: BTreeMap<(Collection, DedupKey), Value>,
    upserted: BTreeMap<(Collection, String), Value>,
}

/// In-process store.
///
/// DEMO MODE:
/// - Nothing leaves the process
/// - Every write is logged at info level
pub struct MemoryStore {
    inner: Mutex<Inner>,
    demo: bool,
}

impl MemoryStore {
    pub fn new(demo: bool) -> Self {
        if demo {
            info!("store running in DEMO mode (in-memory, nothing persisted)");
        }
        Self {
            inner: Mutex::new(Inner::default()),
            demo,
        }
    }

    /// Number of rows in a collection, whatever the write mode.
    pub async fn count(&self, collection: Collection) -> usize {
        let inner = self.inner.lock().await;
        let appended: usize = inner
            .appended
            .iter()
            .filter(|((c, _), _)| *c == collection)
            .map(|(_, rows)| rows.len())
            .sum();
        let keyed = inner.keyed.keys().filter(|(c, _)| *c == collection).count();
        let upserted = inner.upserted.keys().filter(|(c, _)| *c == collection).count();
        appended + keyed + upserted
    }
}

#[cfg(test)]
impl MemoryStore {
    pub fn with_tracked(tags: &[&str]) -> Self {
        Self {
            inner: Mutex::new(Inner {
                tracked: tags.iter().map(|t| t.to_string()).collect(),
                ..Inner::default()
            }),
            demo: false,
        }
    }

    /// Rows appended for one entity, oldest first.
    pub async fn appended(&self, collection: Collection, entity: &str) -> Vec<Value> {
        self.inner
            .lock()
            .await
            .appended
            .get(&(collection, entity.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn keyed(&self, collection: Collection, key: &DedupKey) -> Option<Value> {
        self.inner
            .lock()
            .await
            .keyed
            .get(&(collection, key.clone()))
            .cloned()
    }

    pub async fn upserted(&self, collection: Collection, key: &str) -> Option<Value> {
        self.inner
            .lock()
            .await
            .upserted
            .get(&(collection, key.to_string()))
            .cloned()
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn tracked_entities(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.inner.lock().await.tracked.clone())
    }

    async fn track_entity(&self, tag: &str) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.tracked.iter().any(|t| t == tag) {
            return Ok(false);
        }
        inner.tracked.push(tag.to_string());
        Ok(true)
    }

    async fn append(&self, collection: Collection, entity: &str, record: &Value) -> anyhow::Result<()> {
        if self.demo {
            info!("DEMO → append {} {}", collection, entity);
        }
        self.inner
            .lock()
            .await
            .appended
            .entry((collection, entity.to_string()))
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn insert_if_absent(
        &self,
        collection: Collection,
        key: &DedupKey,
        record: &Value,
    ) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().await;
        let slot = (collection, key.clone());
        if inner.keyed.contains_key(&slot) {
            return Ok(false);
        }
        if self.demo {
            info!("DEMO → insert {} {}", collection, key);
        }
        inner.keyed.insert(slot, record.clone());
        Ok(true)
    }

    async fn upsert(&self, collection: Collection, key: &str, record: &Value) -> anyhow::Result<()> {
        if self.demo {
            info!("DEMO → upsert {} {}", collection, key);
        }
        self.inner
            .lock()
            .await
            .upserted
            .insert((collection, key.to_string()), record.clone());
        Ok(())
    }
}

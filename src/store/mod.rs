//! Persistence boundary.
//!
//! The collector only needs a handful of operations from the store:
//! - read / extend the tracked clan set
//! - append a time-stamped snapshot
//! - insert a history record unless its natural key is already taken
//! - upsert a record under a composite key
//!
//! Implementations:
//! - `redis_store`: production backend
//! - `memory`:      demo mode and tests

pub mod memory;
pub mod redis_store;

use std::fmt;

use serde_json::Value;

/// Logical collections written by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    PlayersHistory,
    ClansHistory,
    WarsHistory,
    WarAttacks,
    CapitalRaidsHistory,
    CwlRounds,
}

impl Collection {
    pub fn name(&self) -> &'static str {
        match self {
            Collection::PlayersHistory => "players_history",
            Collection::ClansHistory => "clans_history",
            Collection::WarsHistory => "wars_history",
            Collection::WarAttacks => "war_attacks",
            Collection::CapitalRaidsHistory => "capital_raids_history",
            Collection::CwlRounds => "cwl_rounds",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identity of a history record: the owning entity plus the event's
/// own timestamp (war end time, raid start time).
///
/// At most one record per key is ever stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DedupKey {
    pub entity: String,
    pub natural_ts: String,
}

impl DedupKey {
    pub fn new(entity: impl Into<String>, natural_ts: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            natural_ts: natural_ts.into(),
        }
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.entity, self.natural_ts)
    }
}

/// Store driver used by the collector.
///
/// THREAD SAFETY:
/// - Must be Send + Sync
/// - Shared across the scheduler and every collection cycle
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Snapshot of the tracked clan set.
    async fn tracked_entities(&self) -> anyhow::Result<Vec<String>>;

    /// Adds a clan to the tracked set. Returns `false` if it was
    /// already tracked.
    async fn track_entity(&self, tag: &str) -> anyhow::Result<bool>;

    /// Appends a new time-stamped row. Never deduplicated.
    async fn append(&self, collection: Collection, entity: &str, record: &Value) -> anyhow::Result<()>;

    /// Writes `record` unless a row already exists under `key`.
    /// Returns `true` if the row was written.
    async fn insert_if_absent(
        &self,
        collection: Collection,
        key: &DedupKey,
        record: &Value,
    ) -> anyhow::Result<bool>;

    /// Inserts or replaces the row stored under `key`.
    async fn upsert(&self, collection: Collection, key: &str, record: &Value) -> anyhow::Result<()>;

    /// Releases driver resources. Called once on shutdown.
    async fn close(&self) {}
}

use std::env;
use std::fs;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Deserialize;

use crate::api::models::ClanSearch;

// ------------------------------------------------------------
// Root configuration
// ------------------------------------------------------------
//
// This is the top-level configuration structure loaded from
// `config.json`.
//
// It defines:
// - Upstream API credentials and request policy
// - Rate limiter parameters
// - Store connection settings
// - Collection schedule and tracked clans
// - Optional debug configuration
//
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Upstream game-data API settings
    pub api: ApiConfig,

    /// Token bucket parameters
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Persistent store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Collection schedule and scope
    #[serde(default)]
    pub collection: CollectionConfig,

    /// Optional debug configuration
    pub debug: Option<DebugConfig>,
}

// ------------------------------------------------------------
// API configuration
// ------------------------------------------------------------
//
// Notes:
// - The `key` is security-sensitive and must never be committed.
//   Prefer the COC_API_KEY environment variable.
//
#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    /// Bearer token sent with every request
    #[serde(default)]
    pub key: String,

    /// Base URL including the version prefix
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Hard ceiling for a single request, in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Attempts per logical request (including the first one)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base of the exponential backoff, in seconds
    #[serde(default = "default_backoff_secs")]
    pub backoff_base_secs: f64,

    /// Upper bound on in-flight connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Upper bound on pooled connections per host
    #[serde(default = "default_max_connections_per_host")]
    pub max_connections_per_host: usize,
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs_f64(self.backoff_base_secs)
    }
}

// ------------------------------------------------------------
// Rate limit configuration
// ------------------------------------------------------------
//
// Defaults match the upstream "silver" tier: a burst of 10 and a
// steady state of 10 requests per second.
//
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Bucket size (max burst)
    pub capacity: u32,

    /// Seconds needed to earn one token back
    pub seconds_per_token: f64,

    /// Re-poll interval while the bucket is empty, in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            seconds_per_token: 0.1,
            poll_interval_ms: 100,
        }
    }
}

// ------------------------------------------------------------
// Store configuration
// ------------------------------------------------------------
//
// `database` is used as the key namespace inside Redis.
// `demo` keeps everything in memory and only logs writes.
//
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    pub url: String,
    pub database: String,
    pub demo: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            database: "coc".to_string(),
            demo: false,
        }
    }
}

// ------------------------------------------------------------
// Collection configuration
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CollectionConfig {
    /// Pause between two full cycles
    pub interval_hours: u64,

    /// Fixed pacing delay between two tracked clans
    pub entity_delay_secs: u64,

    /// Only the first N members of a clan are fetched
    pub member_limit: usize,

    /// Concurrent member fetches per clan
    pub member_concurrency: usize,

    /// `limit` passed to the capital raid seasons endpoint
    pub raid_season_limit: u32,

    /// Clans merged into the tracked set at startup
    pub tracked_clans: Vec<String>,

    /// Optional search used to discover more clans at startup
    pub discovery: Option<ClanSearch>,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            interval_hours: 6,
            entity_delay_secs: 2,
            member_limit: 50,
            member_concurrency: 5,
            raid_season_limit: 10,
            tracked_clans: Vec::new(),
            discovery: None,
        }
    }
}

impl CollectionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_hours * 3600)
    }

    pub fn entity_delay(&self) -> Duration {
        Duration::from_secs(self.entity_delay_secs)
    }
}

// ------------------------------------------------------------
// Debug configuration
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
pub struct DebugConfig {
    /// Raises the default log level to `debug`
    pub log: Option<bool>,
}

fn default_base_url() -> String {
    "https://api.clashofclans.com/v1".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_secs() -> f64 {
    1.0
}

fn default_max_connections() -> usize {
    10
}

fn default_max_connections_per_host() -> usize {
    5
}

impl Config {
    /// Reads a JSON configuration file, applies environment
    /// overrides and validates the result.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading config file {path}"))?;
        let mut cfg = Self::from_json(&data)?;
        cfg.apply_env_overrides(|name| env::var(name).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json(data: &str) -> anyhow::Result<Self> {
        serde_json::from_str(data).context("parsing config JSON")
    }

    /// Environment wins over the file for secrets and deployment knobs.
    ///
    /// Recognized variables:
    /// - COC_API_KEY
    /// - STORE_URL
    /// - DB_NAME
    /// - COLLECTION_INTERVAL_HOURS
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("COC_API_KEY") {
            self.api.key = key;
        }
        if let Some(url) = lookup("STORE_URL") {
            self.store.url = url;
        }
        if let Some(db) = lookup("DB_NAME") {
            self.store.database = db;
        }
        if let Some(hours) = lookup("COLLECTION_INTERVAL_HOURS").and_then(|h| h.parse().ok()) {
            self.collection.interval_hours = hours;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api.key.trim().is_empty() {
            bail!("api.key is empty (set it in the config or via COC_API_KEY)");
        }
        if self.api.max_retries == 0 {
            bail!("api.max_retries must be at least 1");
        }
        if !self.api.backoff_base_secs.is_finite() || self.api.backoff_base_secs < 0.0 {
            bail!("api.backoff_base_secs must be a non-negative number");
        }
        if self.rate_limit.capacity == 0 {
            bail!("rate_limit.capacity must be at least 1");
        }
        if !self.rate_limit.seconds_per_token.is_finite() || self.rate_limit.seconds_per_token <= 0.0 {
            bail!("rate_limit.seconds_per_token must be positive");
        }
        if self.collection.interval_hours == 0 {
            bail!("collection.interval_hours must be at least 1");
        }
        if self.collection.member_concurrency == 0 {
            bail!("collection.member_concurrency must be at least 1");
        }
        Ok(())
    }

    pub fn debug_log(&self) -> bool {
        self.debug
            .as_ref()
            .is_some_and(|d| d.log.unwrap_or(false))
    }
}

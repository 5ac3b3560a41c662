use anyhow::{Context, Result};
use std::path::PathBuf;

pub const DB_PATH_VAR: &str = "DISTRIBUTION_DB_PATH";
pub const CACHE_CAPACITY_VAR: &str = "DISTRIBUTION_CACHE_CAPACITY";
pub const TEMPORARY_VAR: &str = "DISTRIBUTION_TEMPORARY";

/// Where and how the sled database is opened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    /// Page cache size in bytes
    pub cache_capacity: u64,
    /// Delete the database files when the store is dropped
    pub temporary: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("distribution.db"),
            cache_capacity: 64 * 1024 * 1024,
            temporary: false,
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup, falling back to defaults for unset keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let db_path = lookup(DB_PATH_VAR)
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);
        let cache_capacity = match lookup(CACHE_CAPACITY_VAR) {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("{CACHE_CAPACITY_VAR} must be a byte count, got {raw}"))?,
            None => defaults.cache_capacity,
        };
        let temporary = match lookup(TEMPORARY_VAR) {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("{TEMPORARY_VAR} must be true or false, got {raw}"))?,
            None => defaults.temporary,
        };

        Ok(Self {
            db_path,
            cache_capacity,
            temporary,
        })
    }
}

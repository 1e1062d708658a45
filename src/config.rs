use std::{path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::db::core::{DEFAULT_BUSY_TIMEOUT, DEFAULT_POOL_SIZE};

pub const ENV_DATABASE_PATH: &str = "CATALOG_DATABASE_PATH";
pub const ENV_BUS_WORKERS: &str = "CATALOG_BUS_WORKERS";
pub const ENV_POOL_SIZE: &str = "CATALOG_POOL_SIZE";
pub const ENV_BUSY_TIMEOUT_MS: &str = "CATALOG_BUSY_TIMEOUT_MS";

pub const DEFAULT_BUS_WORKERS: usize = 4;

/// Settings for [`crate::Catalog::open`]. Absent keys take their defaults;
/// no database path means a private in-memory database.
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    pub database_path: Option<PathBuf>,
    pub bus_workers: usize,
    pub pool_size: u32,
    pub busy_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            bus_workers: DEFAULT_BUS_WORKERS,
            pool_size: DEFAULT_POOL_SIZE,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT.as_millis() as u64,
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("invalid catalog config")
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from `CATALOG_*` variables resolved by `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        if let Some(path) = lookup(ENV_DATABASE_PATH).filter(|path| !path.is_empty()) {
            config.database_path = Some(PathBuf::from(path));
        }
        if let Some(workers) = parse_var(&lookup, ENV_BUS_WORKERS)? {
            config.bus_workers = workers;
        }
        if let Some(pool_size) = parse_var(&lookup, ENV_POOL_SIZE)? {
            config.pool_size = pool_size;
        }
        if let Some(busy_timeout_ms) = parse_var(&lookup, ENV_BUSY_TIMEOUT_MS)? {
            config.busy_timeout_ms = busy_timeout_ms;
        }
        Ok(config)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => {
            let parsed = value
                .trim()
                .parse()
                .with_context(|| format!("invalid value for {}: '{}'", key, value))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

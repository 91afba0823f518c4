use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::db::RetryPolicy;

const DEFAULT_DB_PATH: &str = "data/visa_bulletin.sqlite";
const DEFAULT_CACHE_DIR: &str = "saved_pages";
pub const DEFAULT_INDEX_URL: &str =
    "https://travel.state.gov/content/travel/en/legal/visa-law0/visa-bulletin.html";
const DEFAULT_DB_RETRIES: u32 = 3;
const DEFAULT_DB_BACKOFF_MS: u64 = 1000;

/// Runtime settings, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub cache_dir: PathBuf,
    pub index_url: String,
    pub retry: RetryPolicy,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let db_path = get("VISA_BULLETIN_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));
        let cache_dir = get("VISA_BULLETIN_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR));
        let index_url = get("VISA_BULLETIN_INDEX_URL").unwrap_or_else(|| DEFAULT_INDEX_URL.to_string());

        let max_attempts = match get("VISA_BULLETIN_DB_RETRIES") {
            Some(v) => v
                .trim()
                .parse::<u32>()
                .with_context(|| format!("VISA_BULLETIN_DB_RETRIES is not a number: {:?}", v))?
                .max(1),
            None => DEFAULT_DB_RETRIES,
        };
        let backoff_ms = match get("VISA_BULLETIN_DB_BACKOFF_MS") {
            Some(v) => v
                .trim()
                .parse::<u64>()
                .with_context(|| format!("VISA_BULLETIN_DB_BACKOFF_MS is not a number: {:?}", v))?,
            None => DEFAULT_DB_BACKOFF_MS,
        };

        Ok(Config {
            db_path,
            cache_dir,
            index_url,
            retry: RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(backoff_ms),
            },
        })
    }

    pub fn with_db_path(mut self, path: Option<PathBuf>) -> Self {
        if let Some(p) = path {
            self.db_path = p;
        }
        self
    }
}

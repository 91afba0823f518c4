use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use reqwest::StatusCode;
use tracing::{debug, info, warn};

use crate::sitemap::publication_date_from_url;

const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF_MS: u64 = 2000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!("visa_bulletin/", env!("CARGO_PKG_VERSION"));

pub fn client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// GET a page as text. 429 and 5xx responses are retried with exponential
/// backoff; other failures return immediately.
pub async fn fetch_page(client: &reqwest::Client, url: &str) -> Result<String> {
    let mut attempt = 0;
    loop {
        let response = client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Request failed: {}", url))?;
        let status = response.status();

        if status.is_success() {
            return response
                .text()
                .await
                .with_context(|| format!("Failed to read body of {}", url));
        }
        if !should_retry(status) || attempt == MAX_RETRIES {
            bail!("HTTP {} for {}", status, url);
        }

        let backoff = Duration::from_millis(BASE_BACKOFF_MS * 2u64.pow(attempt));
        warn!(
            "HTTP {} on {} (attempt {}/{}), backing off {:.1}s",
            status,
            url,
            attempt + 1,
            MAX_RETRIES,
            backoff.as_secs_f64()
        );
        tokio::time::sleep(backoff).await;
        attempt += 1;
    }
}

/// A bulletin page saved in the cache directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPage {
    pub path: PathBuf,
    pub publication_date: NaiveDate,
}

/// Bulletin HTML on disk, keyed by the URL's file name.
pub struct PageCache {
    dir: PathBuf,
}

impl PageCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        PageCache { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, url: &str) -> Option<PathBuf> {
        let parsed = reqwest::Url::parse(url).ok()?;
        let name = parsed.path_segments()?.next_back()?;
        if name.is_empty() {
            return None;
        }
        Some(self.dir.join(name))
    }

    pub fn load(&self, url: &str) -> Result<Option<String>> {
        let Some(path) = self.path_for(url) else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        let html = fs::read_to_string(&path).with_context(|| format!("Failed to read {:?}", path))?;
        Ok(Some(html))
    }

    pub fn store(&self, url: &str, html: &str) -> Result<()> {
        let path = self
            .path_for(url)
            .with_context(|| format!("No file name in URL {}", url))?;
        fs::create_dir_all(&self.dir).with_context(|| format!("Failed to create {:?}", self.dir))?;
        fs::write(&path, html).with_context(|| format!("Failed to write {:?}", path))?;
        Ok(())
    }

    /// Every cached bulletin whose file name carries a month, oldest first.
    pub fn list(&self) -> Result<Vec<CachedPage>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut pages = Vec::new();
        for entry in fs::read_dir(&self.dir).with_context(|| format!("Failed to list {:?}", self.dir))? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            match publication_date_from_url(name) {
                Some(publication_date) => pages.push(CachedPage { path, publication_date }),
                None => debug!("Ignoring cache file {:?}", path),
            }
        }
        pages.sort_by_key(|p| p.publication_date);
        Ok(pages)
    }
}

/// Cached copy if present, otherwise download and cache it.
pub async fn fetch_publication(client: &reqwest::Client, cache: &PageCache, url: &str) -> Result<String> {
    if let Some(html) = cache.load(url)? {
        debug!("Cache hit: {}", url);
        return Ok(html);
    }
    info!("Fetching {}", url);
    let html = fetch_page(client, url).await?;
    cache.store(url, &html)?;
    Ok(html)
}

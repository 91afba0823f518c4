use std::collections::HashSet;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use scraper::{Html, Selector};
use tracing::{info, warn};

use crate::fetch::fetch_page;

const BASE_URL: &str = "https://travel.state.gov";
const LINK_MARKER: &str = "visa-bulletin-for-";

static LINK_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());

/// A bulletin page listed on the publication index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BulletinRef {
    pub url: String,
    pub publication_date: NaiveDate,
}

/// `.../visa-bulletin-for-march-2024.html` → 2024-03-01.
pub fn publication_date_from_url(url: &str) -> Option<NaiveDate> {
    let name = url.rsplit('/').next()?;
    let stem = name.strip_prefix(LINK_MARKER)?.strip_suffix(".html")?;
    NaiveDate::parse_from_str(&format!("1-{}", stem), "%d-%B-%Y").ok()
}

fn absolutize(href: &str) -> String {
    if href.starts_with("http") {
        href.to_string()
    } else if href.starts_with('/') {
        format!("{}{}", BASE_URL, href)
    } else {
        format!("{}/{}", BASE_URL, href)
    }
}

/// Collect bulletin links from the index page, newest first. Links whose
/// month cannot be read are skipped with a warning.
pub fn parse_publication_links(html: &str) -> Vec<BulletinRef> {
    let doc = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut refs = Vec::new();

    for a in doc.select(&LINK_SEL) {
        let Some(href) = a.value().attr("href") else { continue };
        let href = href.trim();
        if !href.contains(LINK_MARKER) || !href.ends_with(".html") {
            continue;
        }
        let url = absolutize(href);
        if !seen.insert(url.clone()) {
            continue;
        }
        match publication_date_from_url(&url) {
            Some(publication_date) => refs.push(BulletinRef { url, publication_date }),
            None => warn!("Skipping invalid bulletin link: {}", url),
        }
    }

    refs.sort_by(|a, b| b.publication_date.cmp(&a.publication_date));
    refs.dedup_by_key(|r| r.publication_date);
    refs
}

/// Fetch the publication index and list every bulletin it links to.
pub async fn fetch_bulletin_refs(client: &reqwest::Client, index_url: &str) -> Result<Vec<BulletinRef>> {
    info!("Fetching bulletin index: {}", index_url);
    let html = fetch_page(client, index_url)
        .await
        .context("Failed to fetch bulletin index")?;
    let refs = parse_publication_links(&html);
    info!("Bulletins listed on index: {}", refs.len());
    Ok(refs)
}

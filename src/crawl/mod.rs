//! Discovery for knowledge-base crawls: which pages of a site may be
//! fetched, and how slowly.

pub mod robots;
pub mod sitemap;

use std::time::Duration;

use reqwest::Url;

use robots::RobotsCache;
use sitemap::SitemapFetcher;

pub const USER_AGENT: &str = "Mozilla/5.0 (compatible; MagpipeBot/1.0)";

const MAX_URL_LEN: usize = 2048;
/// Page URLs taken from a site's sitemaps.
const MAX_PAGES: usize = 500;
const MIN_CRAWL_DELAY_SECS: f64 = 1.0;
pub const SYNC_PERIODS: &[&str] = &["24h", "7d", "1mo", "3mo"];

/// Pages to index for a new knowledge source.
#[derive(Debug, Clone, PartialEq)]
pub struct CrawlPlan {
    pub url: String,
    /// Allowed pages found through the site's sitemap, excluding `url`.
    pub page_urls: Vec<String>,
    pub crawl_delay_secs: u64,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CrawlError {
    #[error("URL too long (max 2048 characters)")]
    TooLong,
    #[error("URL must start with http:// or https://")]
    NotHttp,
    #[error("That page is blocked by the site's robots.txt")]
    Disallowed,
}

pub struct Crawler {
    robots: RobotsCache,
    sitemaps: SitemapFetcher,
}

impl Crawler {
    pub fn new(client: reqwest::Client, sitemap_pause: Duration) -> Self {
        Self {
            robots: RobotsCache::new(client.clone()),
            sitemaps: SitemapFetcher::new(client, sitemap_pause),
        }
    }

    pub async fn plan(&self, url: &str) -> Result<CrawlPlan, CrawlError> {
        let url = url.trim();
        if url.len() > MAX_URL_LEN {
            return Err(CrawlError::TooLong);
        }
        let parsed = Url::parse(url).map_err(|_| CrawlError::NotHttp)?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(CrawlError::NotHttp);
        }

        let rules = self.robots.rules(url).await;
        if !rules.is_allowed(url) {
            return Err(CrawlError::Disallowed);
        }

        let root = match rules.sitemaps.first() {
            Some(listed) => Some(listed.clone()),
            None => self.sitemaps.discover(url).await,
        };
        let mut page_urls = Vec::new();
        if let Some(root) = root {
            let (entries, errors) = self.sitemaps.collect(&root, MAX_PAGES).await;
            if !errors.is_empty() {
                tracing::warn!(%root, errors = errors.len(), "Some sitemaps could not be read");
            }
            page_urls = entries
                .into_iter()
                .map(|e| e.loc)
                .filter(|loc| loc != url && rules.is_allowed(loc))
                .collect();
        }

        let delay = rules.crawl_delay_secs(MIN_CRAWL_DELAY_SECS).ceil() as u64;
        tracing::info!(%url, pages = page_urls.len(), delay, "Crawl planned");
        Ok(CrawlPlan {
            url: url.to_string(),
            page_urls,
            crawl_delay_secs: delay,
        })
    }
}

//! Sitemap parsing: XML urlsets, sitemap indexes and plain-text URL lists.

use std::collections::{HashSet, VecDeque};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use reqwest::Url;

use super::robots::is_http_url;
use super::USER_AGENT;

const FETCH_TIMEOUT: Duration = Duration::from_secs(15);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

static URL_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<url(?:\s[^>]*)?>(.*?)</url>").expect("valid regex"));
static SITEMAP_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<sitemap(?:\s[^>]*)?>(.*?)</sitemap>").expect("valid regex"));

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SitemapEntry {
    pub loc: String,
    pub lastmod: Option<String>,
    pub changefreq: Option<String>,
    pub priority: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedSitemap {
    pub urls: Vec<SitemapEntry>,
    /// Child sitemaps listed by an index.
    pub sitemaps: Vec<String>,
}

fn tag(block: &str, name: &str) -> Option<String> {
    let re = Regex::new(&format!(r"(?i)<{name}[^>]*>([^<]*)</{name}>")).ok()?;
    re.captures(block)
        .map(|c| c[1].trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parses one sitemap document. XML is detected by content type or a
/// leading `<`; anything else is read as one URL per line.
pub fn parse(body: &str, content_type: &str, max_urls: usize) -> ParsedSitemap {
    let trimmed = body.trim_start();
    if content_type.contains("xml") || trimmed.starts_with('<') {
        parse_xml(body, max_urls)
    } else {
        parse_text(body, max_urls)
    }
}

fn parse_xml(xml: &str, max_urls: usize) -> ParsedSitemap {
    let mut parsed = ParsedSitemap::default();
    if xml.contains("<sitemapindex") || xml.contains("</sitemapindex>") {
        parsed.sitemaps = SITEMAP_BLOCK
            .captures_iter(xml)
            .filter_map(|c| tag(&c[1], "loc"))
            .filter(|loc| is_http_url(loc))
            .collect();
        return parsed;
    }

    for block in URL_BLOCK.captures_iter(xml) {
        if parsed.urls.len() >= max_urls {
            break;
        }
        let block = &block[1];
        let Some(loc) = tag(block, "loc").filter(|l| is_http_url(l)) else {
            continue;
        };
        parsed.urls.push(SitemapEntry {
            loc,
            lastmod: tag(block, "lastmod"),
            changefreq: tag(block, "changefreq"),
            priority: tag(block, "priority").and_then(|p| p.parse().ok()),
        });
    }
    parsed
}

fn parse_text(text: &str, max_urls: usize) -> ParsedSitemap {
    let urls = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter(|l| is_http_url(l))
        .take(max_urls)
        .map(|loc| SitemapEntry {
            loc: loc.to_string(),
            ..Default::default()
        })
        .collect();
    ParsedSitemap {
        urls,
        sitemaps: Vec::new(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SitemapError {
    #[error("Error fetching sitemap: {0}")]
    Request(String),
    #[error("Failed to fetch sitemap: {0}")]
    Status(reqwest::StatusCode),
}

pub struct SitemapFetcher {
    client: reqwest::Client,
    /// Pause between consecutive sitemap fetches.
    pause: Duration,
}

impl SitemapFetcher {
    pub fn new(client: reqwest::Client, pause: Duration) -> Self {
        Self { client, pause }
    }

    async fn fetch(&self, url: &str, max_urls: usize) -> Result<ParsedSitemap, SitemapError> {
        let resp = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| SitemapError::Request(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(SitemapError::Status(resp.status()));
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = resp
            .text()
            .await
            .map_err(|e| SitemapError::Request(e.to_string()))?;
        Ok(parse(&body, &content_type, max_urls))
    }

    /// Follows sitemap indexes breadth-first, visiting each sitemap once,
    /// until `max_urls` page URLs are collected. Failed sitemaps are
    /// returned as errors alongside whatever was found.
    pub async fn collect(&self, root: &str, max_urls: usize) -> (Vec<SitemapEntry>, Vec<String>) {
        let mut urls = Vec::new();
        let mut errors = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([root.to_string()]);

        while let Some(current) = queue.pop_front() {
            if urls.len() >= max_urls {
                break;
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            match self.fetch(&current, max_urls - urls.len()).await {
                Ok(parsed) => {
                    urls.extend(parsed.urls);
                    queue.extend(parsed.sitemaps.into_iter().filter(|s| !seen.contains(s)));
                }
                Err(e) => {
                    tracing::warn!(sitemap = %current, "{e}");
                    errors.push(e.to_string());
                }
            }
            if !queue.is_empty() && !self.pause.is_zero() {
                tokio::time::sleep(self.pause).await;
            }
        }
        urls.truncate(max_urls);
        (urls, errors)
    }

    /// Probes the usual sitemap locations, then the first `Sitemap:` line
    /// of robots.txt.
    pub async fn discover(&self, base_url: &str) -> Option<String> {
        let origin = Url::parse(base_url).ok()?.origin().ascii_serialization();
        for path in ["/sitemap.xml", "/sitemap_index.xml", "/sitemap-index.xml", "/sitemaps.xml"] {
            let candidate = format!("{origin}{path}");
            let found = self
                .client
                .head(&candidate)
                .header(reqwest::header::USER_AGENT, USER_AGENT)
                .timeout(PROBE_TIMEOUT)
                .send()
                .await
                .is_ok_and(|r| r.status().is_success());
            if found {
                return Some(candidate);
            }
        }

        let robots = self
            .client
            .get(format!("{origin}/robots.txt"))
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .ok()
            .filter(|r| r.status().is_success())?
            .text()
            .await
            .ok()?;
        super::robots::RobotsRules::parse(&robots).sitemaps.into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URLSET: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url>
    <loc>https://example.com/</loc>
    <lastmod>2026-01-02</lastmod>
    <priority>0.8</priority>
  </url>
  <url><loc> https://example.com/pricing </loc><changefreq>weekly</changefreq></url>
  <url><loc>mailto:someone@example.com</loc></url>
</urlset>"#;

    #[test]
    fn parses_urlset_entries() {
        let parsed = parse(URLSET, "application/xml", 100);
        assert_eq!(parsed.urls.len(), 2);
        assert_eq!(parsed.urls[0].loc, "https://example.com/");
        assert_eq!(parsed.urls[0].lastmod.as_deref(), Some("2026-01-02"));
        assert_eq!(parsed.urls[0].priority, Some(0.8));
        assert_eq!(parsed.urls[1].loc, "https://example.com/pricing");
        assert_eq!(parsed.urls[1].changefreq.as_deref(), Some("weekly"));
    }

    #[test]
    fn urlset_respects_cap() {
        assert_eq!(parse(URLSET, "", 1).urls.len(), 1);
    }

    #[test]
    fn index_lists_child_sitemaps() {
        let xml = r#"<sitemapindex>
  <sitemap><loc>https://example.com/a.xml</loc></sitemap>
  <sitemap><loc>https://example.com/b.xml</loc><lastmod>2026-01-01</lastmod></sitemap>
</sitemapindex>"#;
        let parsed = parse(xml, "text/xml", 100);
        assert!(parsed.urls.is_empty());
        assert_eq!(parsed.sitemaps, vec!["https://example.com/a.xml", "https://example.com/b.xml"]);
    }

    #[test]
    fn plain_text_lists() {
        let text = "# pages\nhttps://example.com/a\n\nftp://example.com/b\nhttps://example.com/c\n";
        let parsed = parse(text, "text/plain", 100);
        let locs: Vec<&str> = parsed.urls.iter().map(|u| u.loc.as_str()).collect();
        assert_eq!(locs, vec!["https://example.com/a", "https://example.com/c"]);
    }

    #[tokio::test]
    async fn index_expansion_dedupes_and_caps() {
        let mut server = mockito::Server::new_async().await;
        let base = server.url();
        server
            .mock("GET", "/sitemap.xml")
            .with_header("content-type", "application/xml")
            .with_body(format!(
                "<sitemapindex><sitemap><loc>{base}/a.xml</loc></sitemap><sitemap><loc>{base}/a.xml</loc></sitemap><sitemap><loc>{base}/b.xml</loc></sitemap></sitemapindex>"
            ))
            .create_async()
            .await;
        let a = server
            .mock("GET", "/a.xml")
            .with_body(format!("<urlset><url><loc>{base}/one</loc></url><url><loc>{base}/two</loc></url></urlset>"))
            .expect(1)
            .create_async()
            .await;
        server
            .mock("GET", "/b.xml")
            .with_status(500)
            .create_async()
            .await;

        let fetcher = SitemapFetcher::new(reqwest::Client::new(), Duration::ZERO);
        let (urls, errors) = fetcher.collect(&format!("{base}/sitemap.xml"), 10).await;
        assert_eq!(urls.len(), 2);
        assert_eq!(errors.len(), 1);
        a.assert_async().await;

        let (urls, _) = fetcher.collect(&format!("{base}/sitemap.xml"), 1).await;
        assert_eq!(urls.len(), 1);
    }

    #[tokio::test]
    async fn discovery_falls_back_to_robots() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("HEAD", mockito::Matcher::Any)
            .with_status(404)
            .create_async()
            .await;
        server
            .mock("GET", "/robots.txt")
            .with_body("User-agent: *\nSitemap: https://cdn.example.com/map.xml\n")
            .create_async()
            .await;

        let fetcher = SitemapFetcher::new(reqwest::Client::new(), Duration::ZERO);
        assert_eq!(
            fetcher.discover(&format!("{}/docs", server.url())).await.as_deref(),
            Some("https://cdn.example.com/map.xml")
        );
    }
}

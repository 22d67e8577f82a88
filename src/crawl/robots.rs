//! robots.txt parsing and a per-origin rules cache.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use regex::Regex;
use reqwest::Url;
use tokio::sync::Mutex;

use super::USER_AGENT;

/// Site-supplied delays above this are ignored in favour of the cap.
const MAX_CRAWL_DELAY_SECS: f64 = 10.0;
const CACHE_TTL: Duration = Duration::from_secs(60 * 60);
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RobotsRules {
    pub allow: Vec<String>,
    pub disallow: Vec<String>,
    pub crawl_delay: Option<f64>,
    pub sitemaps: Vec<String>,
}

pub(super) fn is_http_url(raw: &str) -> bool {
    Url::parse(raw).is_ok_and(|u| matches!(u.scheme(), "http" | "https"))
}

impl RobotsRules {
    /// Collects the groups addressed to `*` or to any agent whose name
    /// mentions `bot` or `magpipe`. Sitemap lines apply globally.
    pub fn parse(content: &str) -> Self {
        let mut rules = Self::default();
        let mut relevant = false;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((directive, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();

            match directive.trim().to_lowercase().as_str() {
                "user-agent" => {
                    let agent = value.to_lowercase();
                    relevant = agent == "*" || agent.contains("magpipe") || agent.contains("bot");
                }
                "disallow" if relevant && !value.is_empty() => rules.disallow.push(value.to_string()),
                "allow" if relevant && !value.is_empty() => rules.allow.push(value.to_string()),
                "crawl-delay" if relevant => {
                    if let Ok(delay) = value.parse::<f64>() {
                        if delay > 0.0 {
                            rules.crawl_delay = Some(delay.min(MAX_CRAWL_DELAY_SECS));
                        }
                    }
                }
                "sitemap" if is_http_url(value) => rules.sitemaps.push(value.to_string()),
                _ => {}
            }
        }
        rules
    }

    /// Allow rules are checked before disallow rules; no match allows.
    /// Unparseable URLs are allowed.
    pub fn is_allowed(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return true;
        };
        let mut path = parsed.path().to_string();
        if let Some(query) = parsed.query() {
            path.push('?');
            path.push_str(query);
        }

        if self.allow.iter().any(|rule| matches_rule(&path, rule)) {
            return true;
        }
        !self.disallow.iter().any(|rule| matches_rule(&path, rule))
    }

    /// Seconds to wait between fetches, never below `floor`.
    pub fn crawl_delay_secs(&self, floor: f64) -> f64 {
        self.crawl_delay.map_or(floor, |d| d.max(floor))
    }
}

/// `*` matches any run of characters; a trailing `$` anchors the end.
/// Rules without `$` match as path prefixes.
fn matches_rule(path: &str, rule: &str) -> bool {
    if rule.is_empty() {
        return false;
    }
    let (body, anchored) = match rule.strip_suffix('$') {
        Some(body) => (body, true),
        None => (rule, false),
    };
    let pattern = regex::escape(body).replace(r"\*", ".*");
    let pattern = if anchored {
        format!("^{pattern}$")
    } else {
        format!("^{pattern}")
    };
    match Regex::new(&pattern) {
        Ok(re) => re.is_match(path),
        Err(_) => path.starts_with(&rule.replace('*', "")),
    }
}

/// Fetched rules per origin, kept for an hour.
pub struct RobotsCache {
    client: reqwest::Client,
    entries: Mutex<HashMap<String, (RobotsRules, Instant)>>,
}

impl RobotsCache {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Rules for the origin of `url`. A missing or unreachable robots.txt
    /// allows everything.
    pub async fn rules(&self, url: &str) -> RobotsRules {
        let Ok(parsed) = Url::parse(url) else {
            return RobotsRules::default();
        };
        let origin = parsed.origin().ascii_serialization();

        if let Some((rules, fetched)) = self.entries.lock().await.get(&origin) {
            if fetched.elapsed() < CACHE_TTL {
                return rules.clone();
            }
        }

        let rules = self.fetch(&origin).await;
        self.entries
            .lock()
            .await
            .insert(origin, (rules.clone(), Instant::now()));
        rules
    }

    async fn fetch(&self, origin: &str) -> RobotsRules {
        let resp = self
            .client
            .get(format!("{origin}/robots.txt"))
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await;
        match resp {
            Ok(resp) if resp.status().is_success() => match resp.text().await {
                Ok(text) => RobotsRules::parse(&text),
                Err(e) => {
                    tracing::warn!(origin, "Failed to read robots.txt: {e}");
                    RobotsRules::default()
                }
            },
            Ok(resp) => {
                tracing::debug!(origin, status = %resp.status(), "No robots.txt");
                RobotsRules::default()
            }
            Err(e) => {
                tracing::warn!(origin, "Failed to fetch robots.txt: {e}");
                RobotsRules::default()
            }
        }
    }
}

//! Search provider contract plus the Google results scraper and a fixture-backed provider.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use jobwatch_core::CandidateRecord;
use reqwest::{StatusCode, Url};
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "jobwatch-search";

pub const DEFAULT_SITES: [&str; 3] = ["lever.co", "greenhouse.io", "myworkdayjobs.com"];

/// Items yielded before an `Err` stay valid; the stream ends after the first error.
pub type RecordStream<'a> = BoxStream<'a, Result<CandidateRecord, ProviderError>>;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("search request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("search provider refused the query (rate limited or captcha) at {url}")]
    Blocked { url: String },
    #[error("{0}")]
    Message(String),
}

/// One provider call: a job title (plus optional experience qualifier) restricted to
/// applicant-tracking sites and to results published after `after`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub job_title: String,
    pub experience: Option<String>,
    pub sites: Vec<String>,
    pub after: DateTime<Utc>,
    pub num_results: usize,
    pub lang: String,
    pub region: Option<String>,
}

impl SearchQuery {
    pub fn new(job_title: impl Into<String>, after: DateTime<Utc>) -> Self {
        Self {
            job_title: job_title.into(),
            experience: None,
            sites: DEFAULT_SITES.iter().map(|s| s.to_string()).collect(),
            after,
            num_results: 10,
            lang: "en".to_string(),
            region: None,
        }
    }

    pub fn with_experience(mut self, experience: Option<String>) -> Self {
        self.experience = experience;
        self
    }

    /// `site:a OR site:b "<title>" ["<experience>"] after:<unix seconds>`
    pub fn text(&self) -> String {
        let mut parts = Vec::new();
        if !self.sites.is_empty() {
            parts.push(
                self.sites
                    .iter()
                    .map(|s| format!("site:{s}"))
                    .collect::<Vec<_>>()
                    .join(" OR "),
            );
        }
        parts.push(quoted(&self.job_title));
        if let Some(exp) = self.experience.as_deref().filter(|e| !e.trim().is_empty()) {
            parts.push(quoted(exp));
        }
        parts.push(format!("after:{}", self.after.timestamp()));
        parts.join(" ")
    }

    /// Human label used in reports and logs: the title, with the qualifier in parentheses.
    pub fn label(&self) -> String {
        match self.experience.as_deref() {
            Some(exp) if !exp.trim().is_empty() => format!("{} ({})", self.job_title, exp),
            _ => self.job_title.clone(),
        }
    }
}

impl fmt::Display for SearchQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

fn quoted(term: &str) -> String {
    format!("\"{}\"", term.trim().replace('"', ""))
}

pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lazily produces at most `query.num_results` records.
    fn search<'a>(&'a self, query: &'a SearchQuery) -> RecordStream<'a>;
}

#[derive(Debug, Clone)]
pub struct GoogleConfig {
    pub endpoint: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub page_size: usize,
}

impl Default for GoogleConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://www.google.com/search".to_string(),
            timeout: Duration::from_secs(20),
            // The lightweight results page is only served to text browsers.
            user_agent: Some("Lynx/2.9.0 libwww-FM/2.14 SSL-MM/1.4.1 OpenSSL/3.0.13".to_string()),
            page_size: 10,
        }
    }
}

/// Scrapes the basic HTML results page, fetching one page per stream pull as needed.
#[derive(Debug, Clone)]
pub struct GoogleSearchProvider {
    client: reqwest::Client,
    config: GoogleConfig,
}

struct PageCursor {
    start: usize,
    remaining: usize,
    pages_left: usize,
    buffer: VecDeque<CandidateRecord>,
    seen_urls: HashSet<String>,
    finished: bool,
}

impl GoogleSearchProvider {
    /// Upper bound on page requests for one query: enough pages to fill `num_results`, plus slack
    /// for pages that are mostly repeats.
    pub fn max_pages(&self, num_results: usize) -> usize {
        num_results.div_ceil(self.config.page_size.max(1)) + 2
    }

    pub fn new(config: GoogleConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client, config })
    }

    async fn fetch_page(&self, query: &SearchQuery, start: usize) -> Result<String, ProviderError> {
        let mut params = vec![
            ("q", query.text()),
            ("num", (self.config.page_size.max(1) + 2).to_string()),
            ("hl", query.lang.clone()),
            ("start", start.to_string()),
            ("safe", "active".to_string()),
        ];
        if let Some(region) = &query.region {
            params.push(("gl", region.clone()));
        }

        let resp = self
            .client
            .get(&self.config.endpoint)
            .query(&params)
            .send()
            .await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if status == StatusCode::TOO_MANY_REQUESTS || final_url.contains("/sorry/") {
            return Err(ProviderError::Blocked { url: final_url });
        }
        if !status.is_success() {
            return Err(ProviderError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        Ok(resp.text().await?)
    }
}

impl SearchProvider for GoogleSearchProvider {
    fn name(&self) -> &'static str {
        "google"
    }

    fn search<'a>(&'a self, query: &'a SearchQuery) -> RecordStream<'a> {
        let cursor = PageCursor {
            start: 0,
            remaining: query.num_results,
            pages_left: self.max_pages(query.num_results),
            buffer: VecDeque::new(),
            seen_urls: HashSet::new(),
            finished: false,
        };
        stream::unfold(cursor, move |mut cursor| async move {
            loop {
                if let Some(record) = cursor.buffer.pop_front() {
                    return Some((Ok(record), cursor));
                }
                if cursor.finished || cursor.remaining == 0 || cursor.pages_left == 0 {
                    return None;
                }
                cursor.pages_left -= 1;

                let html = match self.fetch_page(query, cursor.start).await {
                    Ok(html) => html,
                    Err(err) => {
                        cursor.finished = true;
                        return Some((Err(err), cursor));
                    }
                };
                let page = match parse_google_results(&html) {
                    Ok(page) => page,
                    Err(err) => {
                        cursor.finished = true;
                        return Some((Err(err), cursor));
                    }
                };
                debug!(query = %query.label(), start = cursor.start, hits = page.len(), "fetched results page");
                if page.is_empty() {
                    cursor.finished = true;
                    continue;
                }
                cursor.start += page.len();

                let before = cursor.buffer.len();
                for record in page {
                    if cursor.remaining == 0 {
                        break;
                    }
                    let Some(url) = record.url.clone() else {
                        continue;
                    };
                    if cursor.seen_urls.insert(url) {
                        cursor.buffer.push_back(record);
                        cursor.remaining -= 1;
                    }
                }
                // A page of repeats means the engine has nothing further for this query.
                if cursor.buffer.len() == before {
                    debug!(query = %query.label(), start = cursor.start, "results page added nothing new; stopping");
                    cursor.finished = true;
                }
            }
        })
        .boxed()
    }
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn first_text(block: &ElementRef<'_>, selector: &Selector) -> Option<String> {
    block
        .select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn selector(css: &str) -> Result<Selector, ProviderError> {
    Selector::parse(css).map_err(|e| ProviderError::Message(format!("selector {css}: {e}")))
}

/// Result links on the basic page are wrapped as `/url?q=<target>&...`.
pub fn resolve_result_link(href: &str) -> Option<String> {
    let base = Url::parse("https://www.google.com/").ok()?;
    let url = base.join(href).ok()?;
    let target = if url.path() == "/url" {
        let inner = url
            .query_pairs()
            .find(|(k, _)| k == "q" || k == "url")
            .map(|(_, v)| v.to_string())?;
        Url::parse(&inner).ok()?
    } else {
        url
    };
    if !matches!(target.scheme(), "http" | "https") {
        return None;
    }
    let host = target.host_str().unwrap_or_default();
    if host == "google.com" || host.ends_with(".google.com") {
        return None;
    }
    Some(target.to_string())
}

/// Extracts title/url/description triples from a results page. Blocks without a usable
/// link are skipped.
pub fn parse_google_results(html: &str) -> Result<Vec<CandidateRecord>, ProviderError> {
    let document = Html::parse_document(html);
    let layouts = [
        (selector("div.ezO2md")?, selector("span.CVA68e")?, selector("span.FrIlee")?),
        (selector("div.g")?, selector("h3")?, selector("div.VwiC3b")?),
    ];
    let link = selector("a[href]")?;

    for (block_sel, title_sel, desc_sel) in &layouts {
        let records: Vec<CandidateRecord> = document
            .select(block_sel)
            .filter_map(|block| {
                let url = block
                    .select(&link)
                    .filter_map(|a| a.value().attr("href"))
                    .find_map(resolve_result_link)?;
                Some(CandidateRecord {
                    title: first_text(&block, title_sel),
                    url: Some(url),
                    description: first_text(&block, desc_sel),
                })
            })
            .collect();
        if !records.is_empty() {
            return Ok(records);
        }
    }
    Ok(Vec::new())
}

#[derive(Debug, Clone, Deserialize)]
pub struct FixtureFile {
    #[serde(default)]
    pub queries: Vec<FixtureQuery>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FixtureQuery {
    pub job_title: String,
    #[serde(default)]
    pub experience: Option<String>,
    #[serde(default)]
    pub results: Vec<CandidateRecord>,
    /// Emit a provider error after this many records.
    #[serde(default)]
    pub fail_after: Option<usize>,
}

/// Serves canned results from a YAML (or JSON) file; for offline runs and demos.
#[derive(Debug, Clone)]
pub struct FixtureSearchProvider {
    queries: Vec<FixtureQuery>,
}

impl FixtureSearchProvider {
    pub fn new(queries: Vec<FixtureQuery>) -> Self {
        Self { queries }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let file: FixtureFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(file.queries))
    }

    fn lookup(&self, query: &SearchQuery) -> Option<&FixtureQuery> {
        self.queries.iter().find(|q| {
            q.job_title.eq_ignore_ascii_case(query.job_title.trim())
                && match (&q.experience, &query.experience) {
                    (None, _) => true,
                    (Some(a), Some(b)) => a.eq_ignore_ascii_case(b.trim()),
                    (Some(_), None) => false,
                }
        })
    }
}

impl SearchProvider for FixtureSearchProvider {
    fn name(&self) -> &'static str {
        "fixture"
    }

    fn search<'a>(&'a self, query: &'a SearchQuery) -> RecordStream<'a> {
        let Some(entry) = self.lookup(query) else {
            return stream::empty().boxed();
        };
        let limit = query.num_results.min(entry.fail_after.unwrap_or(usize::MAX));
        let records = entry
            .results
            .iter()
            .take(limit)
            .cloned()
            .map(Ok)
            .collect::<Vec<_>>();
        let failure = entry
            .fail_after
            .filter(|n| *n < query.num_results)
            .map(|n| {
                Err(ProviderError::Message(format!(
                    "fixture failure after {n} records for {}",
                    query.label()
                )))
            });
        stream::iter(records.into_iter().chain(failure)).boxed()
    }
}

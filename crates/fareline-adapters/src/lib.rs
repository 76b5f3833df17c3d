//! Raw record sources: flight-search page scraping, flights API pulls, and fixture-backed
//! stand-ins for offline runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use fareline_core::{Clock, RawRecord};
use fareline_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "fareline-adapters";

pub const DEFAULT_MAX_RESULTS: usize = 10;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed source payload: {0}")]
    Malformed(String),
    #[error("reading fixture {path}: {source}")]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Per-route price scrape.
#[async_trait]
pub trait ScrapeSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn scrape(
        &self,
        origin: &str,
        destination: &str,
        date: NaiveDate,
    ) -> Result<Vec<RawRecord>, SourceError>;
}

/// Parameters for a broad flights-API pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiQuery {
    pub flight_date: NaiveDate,
    #[serde(default)]
    pub dep_iata: Option<String>,
    #[serde(default)]
    pub arr_iata: Option<String>,
    pub limit: u32,
}

impl ApiQuery {
    fn to_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("flight_date", self.flight_date.format("%Y-%m-%d").to_string()),
            ("limit", self.limit.to_string()),
        ];
        if let Some(dep) = &self.dep_iata {
            params.push(("dep_iata", dep.clone()));
        }
        if let Some(arr) = &self.arr_iata {
            params.push(("arr_iata", arr.clone()));
        }
        params
    }
}

#[async_trait]
pub trait ApiSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch(&self, query: &ApiQuery) -> Result<Vec<RawRecord>, SourceError>;
}

/// Scrapes `{base_url}/flights/{ORIGIN}-{DEST}/{YYYY-MM-DD}` result pages.
#[derive(Debug, Clone)]
pub struct FlightSearchScraper {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl FlightSearchScraper {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn search_url(&self, origin: &str, destination: &str, date: NaiveDate) -> String {
        format!(
            "{}/flights/{}-{}/{}",
            self.base_url,
            origin,
            destination,
            date.format("%Y-%m-%d")
        )
    }
}

#[async_trait]
impl ScrapeSource for FlightSearchScraper {
    fn source_id(&self) -> &'static str {
        "flight-search"
    }

    async fn scrape(
        &self,
        origin: &str,
        destination: &str,
        date: NaiveDate,
    ) -> Result<Vec<RawRecord>, SourceError> {
        let url = self.search_url(origin, destination, date);
        let page = self.http.get(&url, &[]).await?;
        parse_search_results(
            &page.text(),
            origin,
            destination,
            date,
            page.fetched_at,
            DEFAULT_MAX_RESULTS,
        )
    }
}

fn selector(css: &str) -> Result<Selector, SourceError> {
    Selector::parse(css).map_err(|e| SourceError::Malformed(e.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(element: &ElementRef<'_>, sel: &Selector) -> Option<String> {
    element
        .select(sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

/// Extract up to `max_results` raw records from a search results page.
///
/// Result cards missing any of the expected fields are skipped. Prices are kept as the
/// displayed currency text; parsing happens during normalization.
pub fn parse_search_results(
    html: &str,
    origin: &str,
    destination: &str,
    date: NaiveDate,
    scraped_at: DateTime<Utc>,
    max_results: usize,
) -> Result<Vec<RawRecord>, SourceError> {
    let document = Html::parse_document(html);
    let card_sel = selector(".flight-result")?;
    let airline_sel = selector(".airline-name")?;
    let price_sel = selector(".price-text")?;
    let depart_sel = selector(".depart-time")?;
    let arrive_sel = selector(".arrival-time")?;
    let duration_sel = selector(".duration")?;

    let scraped_at = scraped_at.to_rfc3339_opts(SecondsFormat::Secs, true);
    let date = date.format("%Y-%m-%d").to_string();

    let mut out = Vec::new();
    for result in document.select(&card_sel).take(max_results) {
        let fields = (
            select_first_text(&result, &airline_sel),
            select_first_text(&result, &price_sel),
            select_first_text(&result, &depart_sel),
            select_first_text(&result, &arrive_sel),
            select_first_text(&result, &duration_sel),
        );
        let (Some(airline), Some(price), Some(depart), Some(arrive), Some(duration)) = fields else {
            debug!(origin, destination, "skipping incomplete result card");
            continue;
        };

        let mut record = RawRecord::new();
        record.insert("airline".into(), airline.into());
        record.insert("price".into(), price.into());
        record.insert("departure_time".into(), depart.into());
        record.insert("arrival_time".into(), arrive.into());
        record.insert("duration".into(), duration.into());
        record.insert("origin".into(), origin.into());
        record.insert("destination".into(), destination.into());
        record.insert("date".into(), date.clone().into());
        record.insert("scraped_at".into(), scraped_at.clone().into());
        out.push(record);
    }
    Ok(out)
}

/// Pulls scheduled flights from the AviationStack `flights` endpoint.
#[derive(Debug, Clone)]
pub struct AviationStackSource {
    http: Arc<HttpFetcher>,
    base_url: String,
    access_key: Option<String>,
}

impl AviationStackSource {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>, access_key: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_key,
        }
    }
}

#[async_trait]
impl ApiSource for AviationStackSource {
    fn source_id(&self) -> &'static str {
        "aviationstack"
    }

    async fn fetch(&self, query: &ApiQuery) -> Result<Vec<RawRecord>, SourceError> {
        let Some(key) = self.access_key.as_deref().filter(|k| !k.is_empty()) else {
            return Err(SourceError::Unavailable(
                "AVIATIONSTACK_API_KEY is not configured".to_string(),
            ));
        };
        let mut params = query.to_params();
        params.push(("access_key", key.to_string()));

        let url = format!("{}/flights", self.base_url);
        let response = self.http.get(&url, &params).await?;
        let payload: JsonValue = response.json()?;
        map_api_flights(&payload, response.fetched_at)
    }
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str().filter(|s| !s.trim().is_empty())
}

fn json_value<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    (!cur.is_null()).then_some(cur)
}

/// Map an AviationStack response onto raw record keys.
///
/// Fields the API omits are left out of the record so normalization can decide whether the
/// record is usable. An `error` object in the payload means the pull as a whole failed.
pub fn map_api_flights(payload: &JsonValue, scraped_at: DateTime<Utc>) -> Result<Vec<RawRecord>, SourceError> {
    if let Some(error) = payload.get("error") {
        let message = json_str(error, &["message"])
            .or_else(|| json_str(error, &["code"]))
            .unwrap_or("unknown api error");
        return Err(SourceError::Unavailable(message.to_string()));
    }
    let Some(data) = payload.get("data") else {
        return Ok(Vec::new());
    };
    let entries = data
        .as_array()
        .ok_or_else(|| SourceError::Malformed("`data` is not an array".to_string()))?;

    let scraped_at = scraped_at.to_rfc3339_opts(SecondsFormat::Secs, true);
    let mappings: [(&str, &[&str]); 6] = [
        ("origin", &["departure", "iata"]),
        ("destination", &["arrival", "iata"]),
        ("date", &["flight_date"]),
        ("departure_time", &["departure", "scheduled"]),
        ("arrival_time", &["arrival", "scheduled"]),
        ("price", &["price"]),
    ];

    Ok(entries
        .iter()
        .map(|entry| {
            let mut record = RawRecord::new();
            if let Some(airline) =
                json_str(entry, &["airline", "name"]).or_else(|| json_str(entry, &["airline", "iata"]))
            {
                record.insert("airline".into(), airline.into());
            }
            for (key, path) in mappings {
                if let Some(value) = json_value(entry, path) {
                    record.insert(key.into(), value.clone());
                }
            }
            record.insert("scraped_at".into(), scraped_at.clone().into());
            record
        })
        .collect())
}

/// Serves scrape results from `{root}/{ORIGIN}-{DEST}.html`; a missing file means no results.
/// Records are stamped with the clock's time at each scrape.
#[derive(Clone)]
pub struct FixtureScrapeSource {
    root: PathBuf,
    clock: Arc<dyn Clock>,
}

impl FixtureScrapeSource {
    pub fn new(root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            root: root.into(),
            clock,
        }
    }

    pub fn fixture_path(&self, origin: &str, destination: &str) -> PathBuf {
        self.root.join(format!("{origin}-{destination}.html"))
    }
}

#[async_trait]
impl ScrapeSource for FixtureScrapeSource {
    fn source_id(&self) -> &'static str {
        "flight-search-fixture"
    }

    async fn scrape(
        &self,
        origin: &str,
        destination: &str,
        date: NaiveDate,
    ) -> Result<Vec<RawRecord>, SourceError> {
        let path = self.fixture_path(origin, destination);
        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|source| SourceError::Fixture {
                path: path.clone(),
                source,
            })?;
        if !exists {
            return Ok(Vec::new());
        }
        let html = read_fixture(&path).await?;
        parse_search_results(&html, origin, destination, date, self.clock.now(), DEFAULT_MAX_RESULTS)
    }
}

/// Serves a recorded AviationStack payload from disk.
#[derive(Clone)]
pub struct FixtureApiSource {
    path: PathBuf,
    clock: Arc<dyn Clock>,
}

impl FixtureApiSource {
    pub fn new(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: path.into(),
            clock,
        }
    }
}

#[async_trait]
impl ApiSource for FixtureApiSource {
    fn source_id(&self) -> &'static str {
        "aviationstack-fixture"
    }

    async fn fetch(&self, query: &ApiQuery) -> Result<Vec<RawRecord>, SourceError> {
        let text = read_fixture(&self.path).await?;
        let payload: JsonValue =
            serde_json::from_str(&text).map_err(|e| SourceError::Malformed(e.to_string()))?;
        let mut records = map_api_flights(&payload, self.clock.now())?;
        records.truncate(query.limit as usize);
        Ok(records)
    }
}

async fn read_fixture(path: &Path) -> Result<String, SourceError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| SourceError::Fixture {
            path: path.to_path_buf(),
            source,
        })
}

//! Ingestion pipeline: normalization, per-route scrape cycles, the periodic loop, and the
//! query/analysis facade used by the CLI.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use fareline_adapters::{
    ApiQuery, ApiSource, AviationStackSource, FixtureApiSource, FixtureScrapeSource,
    FlightSearchScraper, ScrapeSource,
};
use fareline_analytics::{analyze, summarize_or_fallback, InsightProvider, OpenAiInsightProvider};
use fareline_core::{FlightObservation, ObservationFilter, ParseError, RawRecord, Route, TrendSummary};

pub use fareline_core::{Clock, FixedClock, SystemClock};
use fareline_storage::{FlightStore, HttpClientConfig, HttpFetcher, TokenBucketConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::fs;
use tokio::sync::watch;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fareline-sync";

const DEFAULT_CITIES: [&str; 5] = ["SYD", "MEL", "BNE", "PER", "ADL"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    Live,
    Fixtures,
}

impl SourceMode {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "fixture" | "fixtures" => SourceMode::Fixtures,
            _ => SourceMode::Live,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiPullConfig {
    #[serde(default)]
    pub dep_iata: Option<String>,
    #[serde(default)]
    pub arr_iata: Option<String>,
    #[serde(default = "default_api_limit")]
    pub limit: u32,
}

fn default_api_limit() -> u32 {
    100
}

impl Default for ApiPullConfig {
    fn default() -> Self {
        Self {
            dep_iata: Some("SYD".to_string()),
            arr_iata: None,
            limit: default_api_limit(),
        }
    }
}

/// Optional `routes.yaml` overriding the city matrix and API pull parameters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouteRegistry {
    #[serde(default)]
    pub cities: Vec<String>,
    #[serde(default)]
    pub api_pull: Option<ApiPullConfig>,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub workspace_root: PathBuf,
    pub cities: Vec<String>,
    pub sync_interval: Duration,
    pub sync_cron: Option<String>,
    pub lookahead_days: i64,
    pub api_pull: ApiPullConfig,
    /// Zero disables pruning.
    pub retention_days: u32,
    pub insight_context: usize,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub source_mode: SourceMode,
    pub fixtures_dir: PathBuf,
    pub search_base_url: String,
    pub aviationstack_base_url: String,
    pub aviationstack_api_key: Option<String>,
    pub openai_base_url: String,
    pub openai_api_key: Option<String>,
    pub insight_model: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://fareline.db?mode=rwc".to_string(),
            workspace_root: PathBuf::from("."),
            cities: DEFAULT_CITIES.iter().map(|c| c.to_string()).collect(),
            sync_interval: Duration::from_secs(86_400),
            sync_cron: None,
            lookahead_days: 30,
            api_pull: ApiPullConfig::default(),
            retention_days: 365,
            insight_context: 100,
            user_agent: "Mozilla/5.0 (compatible; fareline/0.1)".to_string(),
            http_timeout_secs: 20,
            source_mode: SourceMode::Live,
            fixtures_dir: PathBuf::from("./fixtures"),
            search_base_url: "https://www.kayak.com".to_string(),
            aviationstack_base_url: "http://api.aviationstack.com/v1".to_string(),
            aviationstack_api_key: None,
            openai_base_url: "https://api.openai.com/v1".to_string(),
            openai_api_key: None,
            insight_model: "gpt-3.5-turbo".to_string(),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.trim().parse().ok())
}

/// Upper-cases, trims and de-duplicates city codes, keeping first-seen order.
pub fn parse_cities<I, S>(codes: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for code in codes {
        let code = code.as_ref().trim().to_ascii_uppercase();
        if !code.is_empty() && !out.contains(&code) {
            out.push(code);
        }
    }
    out
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: env_string("DATABASE_URL").unwrap_or(defaults.database_url),
            workspace_root: env_string("FARELINE_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            cities: env_string("FARELINE_CITIES")
                .map(|v| parse_cities(v.split(',')))
                .filter(|c| !c.is_empty())
                .unwrap_or(defaults.cities),
            sync_interval: env_parse::<u64>("FARELINE_SYNC_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.sync_interval),
            sync_cron: env_string("FARELINE_SYNC_CRON"),
            lookahead_days: env_parse("FARELINE_LOOKAHEAD_DAYS").unwrap_or(defaults.lookahead_days),
            api_pull: ApiPullConfig {
                dep_iata: env_string("FARELINE_API_ORIGIN")
                    .map(|v| v.trim().to_ascii_uppercase())
                    .or(defaults.api_pull.dep_iata),
                arr_iata: env_string("FARELINE_API_DESTINATION").map(|v| v.trim().to_ascii_uppercase()),
                limit: env_parse("FARELINE_API_LIMIT").unwrap_or(defaults.api_pull.limit),
            },
            retention_days: env_parse("FARELINE_RETENTION_DAYS").unwrap_or(defaults.retention_days),
            insight_context: env_parse("FARELINE_INSIGHT_CONTEXT").unwrap_or(defaults.insight_context),
            user_agent: env_string("FARELINE_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("FARELINE_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            source_mode: env_string("FARELINE_SOURCE_MODE")
                .map(|v| SourceMode::parse(&v))
                .unwrap_or(defaults.source_mode),
            fixtures_dir: env_string("FARELINE_FIXTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.fixtures_dir),
            search_base_url: env_string("FARELINE_SEARCH_BASE_URL").unwrap_or(defaults.search_base_url),
            aviationstack_base_url: env_string("AVIATIONSTACK_BASE_URL")
                .unwrap_or(defaults.aviationstack_base_url),
            aviationstack_api_key: env_string("AVIATIONSTACK_API_KEY"),
            openai_base_url: env_string("OPENAI_BASE_URL").unwrap_or(defaults.openai_base_url),
            openai_api_key: env_string("OPENAI_API_KEY"),
            insight_model: env_string("FARELINE_INSIGHT_MODEL").unwrap_or(defaults.insight_model),
        }
    }

    /// Apply `routes.yaml` if present. Returns whether a file was applied.
    pub async fn apply_route_file(&mut self, path: &Path) -> Result<bool> {
        if !fs::try_exists(path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(false);
        }
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let registry: RouteRegistry =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

        let cities = parse_cities(&registry.cities);
        if !cities.is_empty() {
            self.cities = cities;
        }
        if let Some(api_pull) = registry.api_pull {
            self.api_pull = api_pull;
        }
        Ok(true)
    }

    /// Every ordered (origin, destination) pair of distinct configured cities.
    pub fn route_pairs(&self) -> Vec<Route> {
        let mut pairs = Vec::new();
        for origin in &self.cities {
            for destination in &self.cities {
                if origin != destination {
                    pairs.push(Route::new(origin.clone(), destination.clone()));
                }
            }
        }
        pairs
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRecord {
    pub index: usize,
    pub error: ParseError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedBatch {
    pub observations: Vec<FlightObservation>,
    pub rejected: Vec<RejectedRecord>,
}

/// Convert a raw batch into observations and assign per-route price percentiles.
///
/// Bad records are rejected individually; the rest of the batch is unaffected. Percentiles
/// are computed over the accepted, priced observations of this batch only.
pub fn normalize(records: &[RawRecord]) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();
    for (index, record) in records.iter().enumerate() {
        match normalize_record(record) {
            Ok(obs) => batch.observations.push(obs),
            Err(error) => batch.rejected.push(RejectedRecord { index, error }),
        }
    }
    assign_price_percentiles(&mut batch.observations);
    batch
}

pub fn normalize_record(record: &RawRecord) -> Result<FlightObservation, ParseError> {
    let date = parse_travel_date(record.get("date"))?;
    let scraped_at = parse_timestamp(record.get("scraped_at"))?;

    let airline = required_text(record, "airline")?;
    let origin = required_text(record, "origin")?.to_ascii_uppercase();
    let destination = required_text(record, "destination")?.to_ascii_uppercase();
    if origin == destination {
        return Err(ParseError::SameRoute(origin));
    }
    let price = parse_price(record.get("price"))?;

    Ok(FlightObservation {
        airline,
        price,
        departure_time: optional_text(record, "departure_time").unwrap_or_default(),
        arrival_time: optional_text(record, "arrival_time"),
        duration: optional_text(record, "duration"),
        origin,
        destination,
        date,
        scraped_at,
        price_percentile: None,
    })
}

fn optional_text(record: &RawRecord, key: &str) -> Option<String> {
    match record.get(key)? {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn required_text(record: &RawRecord, key: &'static str) -> Result<String, ParseError> {
    optional_text(record, key).ok_or(ParseError::MissingField(key))
}

/// Accepts JSON numbers and currency text such as `"$1,234.56"` or `"AUD 99"`.
pub fn parse_price(value: Option<&JsonValue>) -> Result<Option<f64>, ParseError> {
    let amount = match value {
        None | Some(JsonValue::Null) => return Ok(None),
        Some(JsonValue::Number(n)) => n
            .as_f64()
            .ok_or_else(|| ParseError::InvalidPrice(n.to_string()))?,
        Some(JsonValue::String(text)) => {
            if text.trim().is_empty() {
                return Ok(None);
            }
            let cleaned = text
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect::<String>();
            cleaned
                .parse::<f64>()
                .map_err(|_| ParseError::InvalidPrice(text.clone()))?
        }
        Some(other) => return Err(ParseError::InvalidPrice(other.to_string())),
    };
    if !amount.is_finite() {
        return Err(ParseError::InvalidPrice(amount.to_string()));
    }
    if amount < 0.0 {
        return Err(ParseError::NegativePrice(amount));
    }
    Ok(Some(amount))
}

const NAIVE_DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"];

fn date_text<'a>(value: Option<&'a JsonValue>, field: &'static str) -> Result<&'a str, ParseError> {
    match value {
        None | Some(JsonValue::Null) => Err(ParseError::MissingField(field)),
        Some(JsonValue::String(s)) if !s.trim().is_empty() => Ok(s.trim()),
        Some(other) => Err(ParseError::InvalidDate {
            field,
            value: other.to_string(),
        }),
    }
}

/// Travel date as written: offsets and times are dropped without timezone conversion.
pub fn parse_travel_date(value: Option<&JsonValue>) -> Result<NaiveDate, ParseError> {
    let text = date_text(value, "date")?;
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Ok(date);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Ok(ts.naive_local().date());
    }
    NAIVE_DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|dt| dt.date())
        .ok_or_else(|| ParseError::InvalidDate {
            field: "date",
            value: text.to_string(),
        })
}

/// Observation timestamp; naive values are read as UTC, bare dates as UTC midnight.
pub fn parse_timestamp(value: Option<&JsonValue>) -> Result<DateTime<Utc>, ParseError> {
    let text = date_text(value, "scraped_at")?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Some(dt) = NAIVE_DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
    {
        return Ok(dt.and_utc());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| ParseError::InvalidDate {
            field: "scraped_at",
            value: text.to_string(),
        })
}

/// Fractional rank of each value (rank / n), ties sharing their average 1-based rank.
pub fn fractional_ranks(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    let mut order = (0..n).collect::<Vec<_>>();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = vec![0.0; n];
    let mut start = 0;
    while start < n {
        let mut end = start;
        while end + 1 < n && values[order[end + 1]] == values[order[start]] {
            end += 1;
        }
        let average_rank = (start + end) as f64 / 2.0 + 1.0;
        for &idx in &order[start..=end] {
            ranks[idx] = average_rank / n as f64;
        }
        start = end + 1;
    }
    ranks
}

pub fn assign_price_percentiles(observations: &mut [FlightObservation]) {
    let mut groups: BTreeMap<Route, Vec<usize>> = BTreeMap::new();
    for (idx, obs) in observations.iter().enumerate() {
        if obs.price.is_some() {
            groups.entry(obs.route()).or_default().push(idx);
        }
    }
    for indices in groups.values() {
        let prices = indices
            .iter()
            .filter_map(|&i| observations[i].price)
            .collect::<Vec<_>>();
        for (&i, rank) in indices.iter().zip(fractional_ranks(&prices)) {
            observations[i].price_percentile = Some(rank);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestTally {
    pub fetched: usize,
    pub rejected: usize,
    pub inserted: usize,
}

impl IngestTally {
    fn add(&mut self, other: IngestTally) {
        self.fetched += other.fetched;
        self.rejected += other.rejected;
        self.inserted += other.inserted;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairFailure {
    pub origin: String,
    pub destination: String,
    pub error: String,
}

/// Outcome of one pass over every route pair plus the API pull.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub target_date: NaiveDate,
    pub pairs_attempted: usize,
    pub pair_failures: Vec<PairFailure>,
    pub scrape: IngestTally,
    pub api: Option<IngestTally>,
    pub api_error: Option<String>,
    pub pruned: u64,
    pub cancelled: bool,
}

impl CycleReport {
    pub fn inserted(&self) -> usize {
        self.scrape.inserted + self.api.map(|a| a.inserted).unwrap_or(0)
    }
}

pub struct SyncSources {
    pub scraper: Arc<dyn ScrapeSource>,
    pub api: Arc<dyn ApiSource>,
    pub insight: Arc<dyn InsightProvider>,
}

impl SyncSources {
    /// Live HTTP sources, or fixture-backed ones when the config asks for them.
    pub fn from_config(config: &SyncConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            token_bucket: Some(TokenBucketConfig {
                capacity: 4,
                refill_every: Duration::from_secs(2),
            }),
            ..Default::default()
        })?);

        let insight: Arc<dyn InsightProvider> = Arc::new(OpenAiInsightProvider::new(
            http.clone(),
            config.openai_base_url.clone(),
            config.openai_api_key.clone(),
            config.insight_model.clone(),
        ));

        let sources = match config.source_mode {
            SourceMode::Live => SyncSources {
                scraper: Arc::new(FlightSearchScraper::new(http.clone(), config.search_base_url.clone())),
                api: Arc::new(AviationStackSource::new(
                    http,
                    config.aviationstack_base_url.clone(),
                    config.aviationstack_api_key.clone(),
                )),
                insight,
            },
            SourceMode::Fixtures => SyncSources {
                scraper: Arc::new(FixtureScrapeSource::new(
                    config.fixtures_dir.join("flight-search"),
                    clock.clone(),
                )),
                api: Arc::new(FixtureApiSource::new(
                    config.fixtures_dir.join("aviationstack").join("flights.json"),
                    clock,
                )),
                insight,
            },
        };
        Ok(sources)
    }
}

/// Scrape → normalize → ingest pipeline with injected store, sources and clock.
pub struct SyncPipeline {
    config: SyncConfig,
    store: FlightStore,
    sources: SyncSources,
    clock: Arc<dyn Clock>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, store: FlightStore, sources: SyncSources) -> Self {
        Self {
            config,
            store,
            sources,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Connect the store (migrating it) and build sources from config.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let store = FlightStore::connect(&config.database_url)
            .await
            .with_context(|| format!("opening store {}", config.database_url))?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let sources = SyncSources::from_config(&config, clock.clone())?;
        Ok(Self::new(config, store, sources).with_clock(clock))
    }

    pub fn store(&self) -> &FlightStore {
        &self.store
    }

    /// One full cycle. Per-pair and API failures are logged and recorded, never returned.
    pub async fn ingest_cycle(&self) -> CycleReport {
        self.run_cycle(None).await
    }

    async fn run_cycle(&self, cancel: Option<&watch::Receiver<bool>>) -> CycleReport {
        let started_at = self.clock.now();
        let run_id = Uuid::new_v4();
        let today = started_at.date_naive();
        let target_date = lookahead_date(today, self.config.lookahead_days).unwrap_or_else(|| {
            warn!(
                lookahead_days = self.config.lookahead_days,
                "lookahead leaves the supported calendar range; scraping today's date"
            );
            today
        });
        let span = info_span!("ingest_cycle", %run_id, %target_date);

        async move {
            let mut report = CycleReport {
                run_id,
                started_at,
                finished_at: started_at,
                target_date,
                pairs_attempted: 0,
                pair_failures: Vec::new(),
                scrape: IngestTally::default(),
                api: None,
                api_error: None,
                pruned: 0,
                cancelled: false,
            };

            for route in self.config.route_pairs() {
                if cancel.is_some_and(|c| *c.borrow()) {
                    report.cancelled = true;
                    break;
                }
                report.pairs_attempted += 1;
                let pair_span = info_span!("route_pair", origin = %route.origin, destination = %route.destination);
                let outcome = self.ingest_pair(&route, target_date).instrument(pair_span).await;
                match outcome {
                    Ok(tally) => report.scrape.add(tally),
                    Err(err) => {
                        let message = format!("{err:#}");
                        warn!(
                            origin = %route.origin,
                            destination = %route.destination,
                            error = %message,
                            "route pair failed; continuing with remaining pairs"
                        );
                        report.pair_failures.push(PairFailure {
                            origin: route.origin,
                            destination: route.destination,
                            error: message,
                        });
                    }
                }
            }

            if !report.cancelled && cancel.is_some_and(|c| *c.borrow()) {
                report.cancelled = true;
            }
            if !report.cancelled {
                match self.ingest_api_pull(started_at.date_naive()).await {
                    Ok(tally) => report.api = Some(tally),
                    Err(err) => {
                        let message = format!("{err:#}");
                        warn!(error = %message, "api pull failed");
                        report.api_error = Some(message);
                    }
                }
            }

            if let Some(cutoff) = retention_cutoff(started_at, self.config.retention_days) {
                match self.store.prune_scraped_before(cutoff).await {
                    Ok(pruned) => report.pruned = pruned,
                    Err(err) => warn!(error = %err, "retention pruning failed"),
                }
            }

            report.finished_at = self.clock.now();
            info!(
                pairs = report.pairs_attempted,
                failed_pairs = report.pair_failures.len(),
                inserted = report.inserted(),
                rejected = report.scrape.rejected + report.api.map(|a| a.rejected).unwrap_or(0),
                cancelled = report.cancelled,
                "ingestion cycle finished"
            );
            report
        }
        .instrument(span)
        .await
    }

    async fn ingest_pair(&self, route: &Route, date: NaiveDate) -> Result<IngestTally> {
        let records = self
            .sources
            .scraper
            .scrape(&route.origin, &route.destination, date)
            .await
            .with_context(|| format!("scraping {route} via {}", self.sources.scraper.source_id()))?;
        self.ingest_records(&records).await
    }

    async fn ingest_api_pull(&self, flight_date: NaiveDate) -> Result<IngestTally> {
        let query = ApiQuery {
            flight_date,
            dep_iata: self.config.api_pull.dep_iata.clone(),
            arr_iata: self.config.api_pull.arr_iata.clone(),
            limit: self.config.api_pull.limit,
        };
        let records = self
            .sources
            .api
            .fetch(&query)
            .await
            .with_context(|| format!("fetching from {}", self.sources.api.source_id()))?;
        self.ingest_records(&records).await
    }

    /// Normalize a raw batch and persist it. Store failures propagate.
    pub async fn ingest_records(&self, records: &[RawRecord]) -> Result<IngestTally> {
        let batch = normalize(records);
        for rejected in &batch.rejected {
            warn!(index = rejected.index, error = %rejected.error, "dropping raw record");
        }
        let inserted = self
            .store
            .ingest(&batch.observations)
            .await
            .context("storing observations")?;
        Ok(IngestTally {
            fetched: records.len(),
            rejected: batch.rejected.len(),
            inserted,
        })
    }

    pub async fn query_observations(&self, filter: &ObservationFilter) -> Result<Vec<FlightObservation>> {
        self.store.query(filter).await.context("querying observations")
    }

    pub async fn trends(&self, filter: &ObservationFilter) -> Result<TrendSummary> {
        Ok(analyze(&self.query_observations(filter).await?))
    }

    /// Answer a free-form question from the most recent observations. Insight failures
    /// degrade to fallback text; only store failures are errors.
    pub async fn ask(&self, question: Option<&str>) -> Result<String> {
        let recent = self
            .store
            .recent(self.config.insight_context)
            .await
            .context("loading recent observations")?;
        let summary = analyze(&recent);
        Ok(summarize_or_fallback(self.sources.insight.as_ref(), &summary, question).await)
    }

    /// Run a cycle now, then one per `sync_interval`, until `cancel` becomes true or its
    /// sender is dropped. An in-flight cycle stops after its current pair.
    pub async fn run_until_cancelled(&self, mut cancel: watch::Receiver<bool>) {
        info!(interval_secs = self.config.sync_interval.as_secs(), "ingestion loop started");
        loop {
            if *cancel.borrow() {
                break;
            }
            let report = self.run_cycle(Some(&cancel)).await;
            if report.cancelled || wait_or_cancel(&mut cancel, self.config.sync_interval).await {
                break;
            }
        }
        info!("ingestion loop stopped");
    }

    /// Cron-driven alternative to the fixed interval, when `sync_cron` is configured.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        let Some(cron) = self.config.sync_cron.clone() else {
            return Ok(None);
        };

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                let report = pipeline.ingest_cycle().await;
                if !report.pair_failures.is_empty() {
                    error!(
                        run_id = %report.run_id,
                        failed_pairs = report.pair_failures.len(),
                        "scheduled cycle finished with failures"
                    );
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

/// Travel date `lookahead_days` after `today`, or `None` outside chrono's calendar range.
fn lookahead_date(today: NaiveDate, lookahead_days: i64) -> Option<NaiveDate> {
    chrono::Duration::try_days(lookahead_days).and_then(|offset| today.checked_add_signed(offset))
}

/// Rows scraped before this instant are pruned. `None` when retention is disabled or the
/// window reaches past the earliest representable time.
fn retention_cutoff(now: DateTime<Utc>, retention_days: u32) -> Option<DateTime<Utc>> {
    if retention_days == 0 {
        return None;
    }
    now.checked_sub_days(chrono::Days::new(u64::from(retention_days)))
}

/// Sleep for `period`; returns true if cancellation arrived first.
async fn wait_or_cancel(cancel: &mut watch::Receiver<bool>, period: Duration) -> bool {
    let sleep = tokio::time::sleep(period);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    return true;
                }
            }
        }
    }
}

/// Build the pipeline from environment plus an optional `routes.yaml` in the workspace root.
pub async fn pipeline_from_env() -> Result<SyncPipeline> {
    let mut config = SyncConfig::from_env();
    let route_file = config.workspace_root.join("routes.yaml");
    if config.apply_route_file(&route_file).await? {
        info!(path = %route_file.display(), cities = ?config.cities, "applied route registry");
    }
    SyncPipeline::from_config(config).await
}

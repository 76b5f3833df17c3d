use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use fareline_adapters::{ApiQuery, ApiSource, FixtureApiSource, FixtureScrapeSource, ScrapeSource, SourceError};
use fareline_analytics::{InsightError, InsightProvider, INSIGHT_FALLBACK};
use fareline_core::{ObservationFilter, RawRecord, TrendSummary};
use fareline_storage::FlightStore;
use fareline_sync::{Clock, FixedClock, SyncConfig, SyncPipeline, SyncSources};
use serde_json::json;
use tokio::sync::watch;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 2, 6, 0, 0).unwrap()
}

fn config(cities: &[&str]) -> SyncConfig {
    SyncConfig {
        cities: cities.iter().map(|c| c.to_string()).collect(),
        sync_interval: Duration::from_millis(50),
        ..SyncConfig::default()
    }
}

fn fixtures_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

/// One Qantas fare per pair; `failing` pairs raise a source error instead.
struct StubScraper {
    failing: Vec<(&'static str, &'static str)>,
    calls: AtomicUsize,
    /// Signalled once the call with this 1-based number starts.
    cancel_on_call: Option<(usize, watch::Sender<bool>)>,
}

impl StubScraper {
    fn new(failing: Vec<(&'static str, &'static str)>) -> Self {
        Self {
            failing,
            calls: AtomicUsize::new(0),
            cancel_on_call: None,
        }
    }
}

#[async_trait]
impl ScrapeSource for StubScraper {
    fn source_id(&self) -> &'static str {
        "stub"
    }

    async fn scrape(
        &self,
        origin: &str,
        destination: &str,
        date: NaiveDate,
    ) -> Result<Vec<RawRecord>, SourceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((on_call, cancel)) = &self.cancel_on_call {
            if call == *on_call {
                cancel.send_replace(true);
            }
        }
        if self.failing.iter().any(|(o, d)| *o == origin && *d == destination) {
            return Err(SourceError::Unavailable("blocked by upstream".into()));
        }
        let record = json!({
            "airline": "Qantas",
            "price": "$100.00",
            "departure_time": "07:00",
            "origin": origin,
            "destination": destination,
            "date": date.format("%Y-%m-%d").to_string(),
            "scraped_at": now().to_rfc3339(),
        });
        Ok(vec![record.as_object().cloned().unwrap()])
    }
}

struct EmptyApi;

#[async_trait]
impl ApiSource for EmptyApi {
    fn source_id(&self) -> &'static str {
        "empty"
    }

    async fn fetch(&self, _: &ApiQuery) -> Result<Vec<RawRecord>, SourceError> {
        Ok(Vec::new())
    }
}

#[derive(Default)]
struct CountingApi {
    calls: AtomicUsize,
}

#[async_trait]
impl ApiSource for CountingApi {
    fn source_id(&self) -> &'static str {
        "counting"
    }

    async fn fetch(&self, _: &ApiQuery) -> Result<Vec<RawRecord>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }
}

struct DownApi;

#[async_trait]
impl ApiSource for DownApi {
    fn source_id(&self) -> &'static str {
        "down"
    }

    async fn fetch(&self, _: &ApiQuery) -> Result<Vec<RawRecord>, SourceError> {
        Err(SourceError::Unavailable("quota exceeded".into()))
    }
}

struct BrokenInsight;

#[async_trait]
impl InsightProvider for BrokenInsight {
    async fn summarize(&self, _: &TrendSummary, _: Option<&str>) -> Result<String, InsightError> {
        Err(InsightError::NotConfigured)
    }
}

struct RouteCountInsight;

#[async_trait]
impl InsightProvider for RouteCountInsight {
    async fn summarize(&self, summary: &TrendSummary, question: Option<&str>) -> Result<String, InsightError> {
        Ok(format!(
            "{} routes; {}",
            summary.popular_routes.len(),
            question.unwrap_or("no question")
        ))
    }
}

async fn pipeline(
    config: SyncConfig,
    scraper: Arc<dyn ScrapeSource>,
    api: Arc<dyn ApiSource>,
    insight: Arc<dyn InsightProvider>,
) -> SyncPipeline {
    let store = FlightStore::in_memory().await.expect("in-memory store");
    SyncPipeline::new(config, store, SyncSources { scraper, api, insight })
        .with_clock(Arc::new(FixedClock(now())))
}

#[tokio::test]
async fn failing_pair_is_recorded_and_remaining_pairs_are_stored() {
    let scraper = Arc::new(StubScraper::new(vec![("SYD", "MEL")]));
    let pipeline = pipeline(
        config(&["SYD", "MEL", "BNE"]),
        scraper.clone(),
        Arc::new(EmptyApi),
        Arc::new(BrokenInsight),
    )
    .await;

    let report = pipeline.ingest_cycle().await;
    assert_eq!(report.pairs_attempted, 6);
    assert_eq!(scraper.calls.load(Ordering::SeqCst), 6);
    assert_eq!(report.pair_failures.len(), 1);
    assert_eq!(report.pair_failures[0].origin, "SYD");
    assert_eq!(report.pair_failures[0].destination, "MEL");
    assert!(report.pair_failures[0].error.contains("blocked by upstream"));
    assert_eq!(report.scrape.inserted, 5);
    assert_eq!(report.target_date, NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());
    assert!(!report.cancelled);

    let mel_bne = pipeline
        .query_observations(&ObservationFilter::route("MEL", "BNE"))
        .await
        .unwrap();
    assert_eq!(mel_bne.len(), 1);
    assert_eq!(mel_bne[0].price, Some(100.0));
    assert_eq!(mel_bne[0].price_percentile, Some(1.0));
    assert!(pipeline
        .query_observations(&ObservationFilter::route("SYD", "MEL"))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn rerunning_a_cycle_adds_nothing() {
    let pipeline = pipeline(
        config(&["SYD", "MEL"]),
        Arc::new(StubScraper::new(Vec::new())),
        Arc::new(EmptyApi),
        Arc::new(BrokenInsight),
    )
    .await;

    assert_eq!(pipeline.ingest_cycle().await.inserted(), 2);
    let second = pipeline.ingest_cycle().await;
    assert_eq!(second.scrape.fetched, 2);
    assert_eq!(second.inserted(), 0);
    assert_eq!(pipeline.store().count().await.unwrap(), 2);
}

#[tokio::test]
async fn api_failure_does_not_discard_scraped_rows() {
    let pipeline = pipeline(
        config(&["SYD", "MEL"]),
        Arc::new(StubScraper::new(Vec::new())),
        Arc::new(DownApi),
        Arc::new(BrokenInsight),
    )
    .await;

    let report = pipeline.ingest_cycle().await;
    assert!(report.api.is_none());
    assert!(report.api_error.as_deref().unwrap().contains("quota exceeded"));
    assert_eq!(report.scrape.inserted, 2);
    assert_eq!(pipeline.store().count().await.unwrap(), 2);
}

#[tokio::test]
async fn cancellation_stops_loop_after_current_pair() {
    let (tx, rx) = watch::channel(false);
    let mut scraper = StubScraper::new(Vec::new());
    scraper.cancel_on_call = Some((1, tx));
    let scraper = Arc::new(scraper);
    let pipeline = pipeline(
        config(&["SYD", "MEL", "BNE"]),
        scraper.clone(),
        Arc::new(EmptyApi),
        Arc::new(BrokenInsight),
    )
    .await;

    tokio::time::timeout(Duration::from_secs(5), pipeline.run_until_cancelled(rx))
        .await
        .expect("loop should stop once cancelled");
    assert_eq!(scraper.calls.load(Ordering::SeqCst), 1);
    assert_eq!(pipeline.store().count().await.unwrap(), 1);
}

#[tokio::test]
async fn cancelling_during_final_pair_skips_api_pull() {
    let (tx, rx) = watch::channel(false);
    let mut scraper = StubScraper::new(Vec::new());
    scraper.cancel_on_call = Some((2, tx));
    let scraper = Arc::new(scraper);
    let api = Arc::new(CountingApi::default());
    let pipeline = pipeline(
        config(&["SYD", "MEL"]),
        scraper.clone(),
        api.clone(),
        Arc::new(BrokenInsight),
    )
    .await;

    tokio::time::timeout(Duration::from_secs(5), pipeline.run_until_cancelled(rx))
        .await
        .expect("loop should stop once cancelled");
    assert_eq!(scraper.calls.load(Ordering::SeqCst), 2);
    assert_eq!(api.calls.load(Ordering::SeqCst), 0);
    assert_eq!(pipeline.store().count().await.unwrap(), 2);
}

#[tokio::test]
async fn store_failure_is_recorded_as_pair_failure() {
    let pipeline = pipeline(
        config(&["SYD", "MEL"]),
        Arc::new(StubScraper::new(Vec::new())),
        Arc::new(EmptyApi),
        Arc::new(BrokenInsight),
    )
    .await;
    pipeline.store().close().await;

    let report = pipeline.ingest_cycle().await;
    assert_eq!(report.pairs_attempted, 2);
    assert_eq!(report.pair_failures.len(), 2);
    assert!(report
        .pair_failures
        .iter()
        .all(|f| f.error.contains("storing observations")));
    assert_eq!(report.scrape.inserted, 0);
}

#[tokio::test]
async fn cycle_prunes_rows_older_than_retention() {
    let pipeline = pipeline(
        SyncConfig {
            retention_days: 30,
            ..config(&["SYD", "MEL"])
        },
        Arc::new(StubScraper::new(Vec::new())),
        Arc::new(EmptyApi),
        Arc::new(BrokenInsight),
    )
    .await;
    let stale = json!({
        "airline": "Rex",
        "price": "$80.00",
        "departure_time": "06:00",
        "origin": "SYD",
        "destination": "MEL",
        "date": "2024-03-01",
        "scraped_at": "2024-02-01T06:00:00Z",
    });
    let seeded = pipeline
        .ingest_records(&[stale.as_object().cloned().unwrap()])
        .await
        .unwrap();
    assert_eq!(seeded.inserted, 1);

    let report = pipeline.ingest_cycle().await;
    assert_eq!(report.pruned, 1);
    assert_eq!(report.scrape.inserted, 2);
    let airlines = pipeline
        .query_observations(&ObservationFilter::default())
        .await
        .unwrap()
        .into_iter()
        .map(|o| o.airline)
        .collect::<Vec<_>>();
    assert_eq!(airlines, vec!["Qantas", "Qantas"]);
}

#[tokio::test]
async fn extreme_date_offsets_do_not_abort_the_cycle() {
    let pipeline = pipeline(
        SyncConfig {
            lookahead_days: 10_000_000_000,
            retention_days: u32::MAX,
            ..config(&["SYD", "MEL"])
        },
        Arc::new(StubScraper::new(Vec::new())),
        Arc::new(EmptyApi),
        Arc::new(BrokenInsight),
    )
    .await;

    let report = pipeline.ingest_cycle().await;
    assert_eq!(report.target_date, now().date_naive());
    assert_eq!(report.scrape.inserted, 2);
    assert_eq!(report.pruned, 0);
}

#[tokio::test]
async fn dropping_the_cancel_sender_ends_the_loop() {
    let (tx, rx) = watch::channel(false);
    let pipeline = pipeline(
        config(&["SYD", "MEL"]),
        Arc::new(StubScraper::new(Vec::new())),
        Arc::new(EmptyApi),
        Arc::new(BrokenInsight),
    )
    .await;

    drop(tx);
    tokio::time::timeout(Duration::from_secs(5), pipeline.run_until_cancelled(rx))
        .await
        .expect("loop should stop when the sender is gone");
    assert_eq!(pipeline.store().count().await.unwrap(), 2);
}

#[tokio::test]
async fn ask_falls_back_when_insight_provider_fails() {
    let pipeline = pipeline(
        config(&["SYD", "MEL"]),
        Arc::new(StubScraper::new(Vec::new())),
        Arc::new(EmptyApi),
        Arc::new(BrokenInsight),
    )
    .await;
    pipeline.ingest_cycle().await;

    let answer = pipeline.ask(Some("When is it cheapest?")).await.unwrap();
    assert_eq!(answer, INSIGHT_FALLBACK);
}

#[tokio::test]
async fn ask_summarizes_recent_observations() {
    let pipeline = pipeline(
        config(&["SYD", "MEL", "BNE"]),
        Arc::new(StubScraper::new(Vec::new())),
        Arc::new(EmptyApi),
        Arc::new(RouteCountInsight),
    )
    .await;
    pipeline.ingest_cycle().await;

    let answer = pipeline.ask(None).await.unwrap();
    assert_eq!(answer, "5 routes; no question");

    let trends = pipeline.trends(&ObservationFilter::default()).await.unwrap();
    assert_eq!(trends.popular_routes.len(), 5);
    assert_eq!(trends.cheapest_airlines[0].airline, "Qantas");
}

#[tokio::test]
async fn fixture_cycle_ingests_cards_and_api_flights() {
    let clock: Arc<dyn Clock> = Arc::new(FixedClock(now()));
    let pipeline = pipeline(
        config(&["SYD", "MEL", "BNE"]),
        Arc::new(FixtureScrapeSource::new(fixtures_root().join("flight-search"), clock.clone())),
        Arc::new(FixtureApiSource::new(
            fixtures_root().join("aviationstack/flights.json"),
            clock,
        )),
        Arc::new(BrokenInsight),
    )
    .await;

    let report = pipeline.ingest_cycle().await;
    assert!(report.pair_failures.is_empty());
    assert_eq!(report.scrape.inserted, 5);
    let api = report.api.expect("api pull succeeded");
    assert_eq!((api.fetched, api.rejected, api.inserted), (3, 1, 2));

    let syd_mel = pipeline
        .query_observations(&ObservationFilter::route("SYD", "MEL"))
        .await
        .unwrap();
    let scraped = syd_mel.iter().filter(|o| o.price.is_some()).collect::<Vec<_>>();
    assert_eq!(scraped.len(), 3);
    let cheapest = scraped
        .iter()
        .min_by(|a, b| a.price.unwrap().total_cmp(&b.price.unwrap()))
        .unwrap();
    assert_eq!(cheapest.airline, "Jetstar");
    assert!((cheapest.price_percentile.unwrap() - 1.0 / 3.0).abs() < 1e-9);
}

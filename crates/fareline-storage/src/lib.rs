//! Deduplicating observation store + rate-limited HTTP fetch utilities for Fareline.

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use fareline_core::{weekday_name, FlightObservation, ObservationFilter};
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, info_span, Instrument};

pub const CRATE_NAME: &str = "fareline-storage";

const SELECT_COLUMNS: &str = "SELECT id, airline, price, departure_time, arrival_time, duration, \
     origin, destination, date, scraped_at, price_percentile FROM flight_observations";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("stored row {id} has malformed {field}: {value}")]
    Corrupt {
        id: String,
        field: &'static str,
        value: String,
    },
}

/// Durable table of flight observations, unique on the observation identity key.
#[derive(Debug, Clone)]
pub struct FlightStore {
    pool: SqlitePool,
}

impl FlightStore {
    /// Open (creating if missing) the database at `url` and apply pending migrations.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// Single-connection in-memory store; contents vanish with the store.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::migrate!().run(&pool).await?;
        Ok(Self { pool })
    }

    /// Persist each candidate unless a row with the same identity key already exists.
    ///
    /// Rows are inserted one at a time, so later candidates see earlier ones from the same
    /// call. Duplicates are dropped silently; existing rows are never updated.
    pub async fn ingest(&self, observations: &[FlightObservation]) -> Result<usize, StoreError> {
        let mut inserted = 0usize;
        for obs in observations {
            if self.insert_if_absent(obs).await? {
                inserted += 1;
            } else {
                debug!(key = %obs.identity_key().canonical(), "duplicate observation skipped");
            }
        }
        Ok(inserted)
    }

    async fn insert_if_absent(&self, obs: &FlightObservation) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO flight_observations (
                id, airline, price, departure_time, arrival_time, duration,
                origin, destination, date, scraped_at, day_of_week, month, price_percentile
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT (airline, origin, destination, date, departure_time) DO NOTHING
            "#,
        )
        .bind(obs.id().to_string())
        .bind(&obs.airline)
        .bind(obs.price)
        .bind(&obs.departure_time)
        .bind(obs.arrival_time.as_deref())
        .bind(obs.duration.as_deref())
        .bind(&obs.origin)
        .bind(&obs.destination)
        .bind(format_date(obs.date))
        .bind(format_timestamp(obs.scraped_at))
        .bind(weekday_name(obs.day_of_week()))
        .bind(obs.month().name())
        .bind(obs.price_percentile)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// All rows matching `filter`, ordered by travel date, departure time, airline.
    pub async fn query(&self, filter: &ObservationFilter) -> Result<Vec<FlightObservation>, StoreError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(SELECT_COLUMNS);
        qb.push(" WHERE 1 = 1");
        if let Some(origin) = &filter.origin {
            qb.push(" AND origin = ").push_bind(origin.clone());
        }
        if let Some(destination) = &filter.destination {
            qb.push(" AND destination = ").push_bind(destination.clone());
        }
        if let Some(from) = filter.date_from {
            qb.push(" AND date >= ").push_bind(format_date(from));
        }
        if let Some(to) = filter.date_to {
            qb.push(" AND date <= ").push_bind(format_date(to));
        }
        qb.push(" ORDER BY date, departure_time, airline");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_observation).collect()
    }

    /// The `limit` most recently scraped observations, newest first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<FlightObservation>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} ORDER BY scraped_at DESC, id LIMIT ?1");
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_observation).collect()
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM flight_observations")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Retention: delete observations scraped strictly before `cutoff`.
    pub async fn prune_scraped_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM flight_observations WHERE scraped_at < ?1")
            .bind(format_timestamp(cutoff))
            .execute(&self.pool)
            .await?;
        if result.rows_affected() > 0 {
            info!(pruned = result.rows_affected(), %cutoff, "retention pruned observations");
        }
        Ok(result.rows_affected())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

// Fixed-width UTC so lexical order in SQLite matches chronological order.
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn row_to_observation(row: &SqliteRow) -> Result<FlightObservation, StoreError> {
    let id: String = row.try_get("id")?;
    let date_text: String = row.try_get("date")?;
    let date = NaiveDate::parse_from_str(&date_text, "%Y-%m-%d").map_err(|_| StoreError::Corrupt {
        id: id.clone(),
        field: "date",
        value: date_text.clone(),
    })?;
    let scraped_text: String = row.try_get("scraped_at")?;
    let scraped_at = DateTime::parse_from_rfc3339(&scraped_text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| StoreError::Corrupt {
            id,
            field: "scraped_at",
            value: scraped_text.clone(),
        })?;

    Ok(FlightObservation {
        airline: row.try_get("airline")?,
        price: row.try_get("price")?,
        departure_time: row.try_get("departure_time")?,
        arrival_time: row.try_get("arrival_time")?,
        duration: row.try_get("duration")?,
        origin: row.try_get("origin")?,
        destination: row.try_get("destination")?,
        date,
        scraped_at,
        price_percentile: row.try_get("price_percentile")?,
    })
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 4,
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Paces outbound requests so a scrape pass over many routes stays polite.
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            refill_every: config.refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: config.capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let period = self.refill_every.as_millis();
            let elapsed = state.last_refill.elapsed();
            if period > 0 && elapsed.as_millis() >= period {
                let refills = u32::try_from(elapsed.as_millis() / period).unwrap_or(u32::MAX);
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let wait = self.refill_every.saturating_sub(elapsed);
            drop(state);
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|err| FetchError::Decode {
            url: self.final_url.clone(),
            message: err.to_string(),
        })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("could not decode response from {url}: {message}")]
    Decode { url: String, message: String },
}

/// Shared HTTP client. Failures are returned as-is; the next ingestion cycle is the retry.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            token_bucket: config.token_bucket.map(|c| Arc::new(SimpleTokenBucket::new(c))),
        })
    }

    pub async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<FetchedResponse, FetchError> {
        let _permit = self.global_limit.acquire().await.expect("semaphore not closed");
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }
        self.send(self.client.get(url).query(query))
            .instrument(info_span!("http_get", url))
            .await
    }

    pub async fn post_json<B: serde::Serialize + ?Sized>(
        &self,
        url: &str,
        bearer_token: Option<&str>,
        body: &B,
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self.global_limit.acquire().await.expect("semaphore not closed");
        let mut request = self.client.post(url).json(body);
        if let Some(token) = bearer_token {
            request = request.bearer_auth(token);
        }
        self.send(request)
            .instrument(info_span!("http_post", url))
            .await
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<FetchedResponse, FetchError> {
        let resp = request.send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            final_url,
            body,
            fetched_at: Utc::now(),
        })
    }
}

//! Trend analysis over flight observations, plus the AI insight wrapper.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use fareline_core::{
    weekday_name, AirlinePrice, DatePrice, DemandShare, FlightObservation, Route, RouteCount,
    TrendSummary,
};
use fareline_storage::{FetchError, HttpFetcher};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "fareline-analytics";

pub const TOP_N: usize = 5;

pub const INSIGHT_FALLBACK: &str = "Unable to generate insights at this time.";

/// Aggregate an arbitrary set of observations. Pure; empty input gives an empty summary.
pub fn analyze(observations: &[FlightObservation]) -> TrendSummary {
    if observations.is_empty() {
        return TrendSummary::default();
    }
    TrendSummary {
        popular_routes: popular_routes(observations, TOP_N),
        price_trends: price_trends(observations),
        cheapest_airlines: cheapest_airlines(observations, TOP_N),
        demand_by_day: demand_by_day(observations),
        demand_by_month: demand_by_month(observations),
    }
}

/// Busiest routes by observation count. Equal counts fall back to route order.
pub fn popular_routes(observations: &[FlightObservation], limit: usize) -> Vec<RouteCount> {
    let mut counts: BTreeMap<Route, usize> = BTreeMap::new();
    for obs in observations {
        *counts.entry(obs.route()).or_default() += 1;
    }
    let mut routes = counts.into_iter().collect::<Vec<_>>();
    routes.sort_by(|a, b| b.1.cmp(&a.1));
    routes
        .into_iter()
        .take(limit)
        .map(|(route, count)| RouteCount {
            origin: route.origin,
            destination: route.destination,
            count,
        })
        .collect()
}

#[derive(Debug, Default, Clone, Copy)]
struct Mean {
    sum: f64,
    n: usize,
}

impl Mean {
    fn push(&mut self, value: f64) {
        self.sum += value;
        self.n += 1;
    }

    fn value(&self) -> f64 {
        self.sum / self.n as f64
    }
}

/// Mean price per travel date. Dates whose observations all lack a price are omitted.
pub fn price_trends(observations: &[FlightObservation]) -> Vec<DatePrice> {
    let mut by_date: BTreeMap<NaiveDate, Mean> = BTreeMap::new();
    for obs in observations {
        if let Some(price) = obs.price {
            by_date.entry(obs.date).or_default().push(price);
        }
    }
    by_date
        .into_iter()
        .map(|(date, mean)| DatePrice {
            date,
            mean_price: mean.value(),
        })
        .collect()
}

/// Airlines with the lowest mean price, ascending. Equal means fall back to name order.
pub fn cheapest_airlines(observations: &[FlightObservation], limit: usize) -> Vec<AirlinePrice> {
    let mut by_airline: BTreeMap<&str, Mean> = BTreeMap::new();
    for obs in observations {
        if let Some(price) = obs.price {
            by_airline.entry(obs.airline.as_str()).or_default().push(price);
        }
    }
    let mut airlines = by_airline
        .into_iter()
        .map(|(airline, mean)| AirlinePrice {
            airline: airline.to_string(),
            mean_price: mean.value(),
        })
        .collect::<Vec<_>>();
    airlines.sort_by(|a, b| a.mean_price.total_cmp(&b.mean_price));
    airlines.truncate(limit);
    airlines
}

fn demand_shares(counts: BTreeMap<u32, (&'static str, usize)>, total: usize) -> Vec<DemandShare> {
    counts
        .into_values()
        .map(|(label, count)| DemandShare {
            label: label.to_string(),
            share: count as f64 / total as f64,
        })
        .collect()
}

/// Share of observations per weekday, Monday first. Absent weekdays are omitted.
pub fn demand_by_day(observations: &[FlightObservation]) -> Vec<DemandShare> {
    let mut counts: BTreeMap<u32, (&'static str, usize)> = BTreeMap::new();
    for obs in observations {
        let day = obs.day_of_week();
        counts
            .entry(day.num_days_from_monday())
            .or_insert((weekday_name(day), 0))
            .1 += 1;
    }
    demand_shares(counts, observations.len())
}

/// Share of observations per calendar month, January first. Absent months are omitted.
pub fn demand_by_month(observations: &[FlightObservation]) -> Vec<DemandShare> {
    let mut counts: BTreeMap<u32, (&'static str, usize)> = BTreeMap::new();
    for obs in observations {
        counts
            .entry(obs.date.month0())
            .or_insert((obs.month().name(), 0))
            .1 += 1;
    }
    demand_shares(counts, observations.len())
}

#[derive(Debug, Error)]
pub enum InsightError {
    #[error("insight provider is not configured")]
    NotConfigured,
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("insight provider returned no text")]
    EmptyResponse,
    #[error("could not encode trend summary: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Turns a trend summary (and optionally a user question) into prose.
#[async_trait]
pub trait InsightProvider: Send + Sync {
    async fn summarize(
        &self,
        summary: &TrendSummary,
        question: Option<&str>,
    ) -> Result<String, InsightError>;
}

pub fn build_prompt(summary: &TrendSummary, question: Option<&str>) -> Result<String, InsightError> {
    let data = serde_json::to_string_pretty(summary)?;
    let mut prompt = format!(
        "You are an airline industry analyst. Analyze this flight data and provide insights:\n\
         {data}\n\n\
         Focus on:\n\
         - Demand trends\n\
         - Pricing patterns\n\
         - Popular routes\n\
         - Seasonal variations\n\
         - Recommendations for hostel businesses near airports\n"
    );
    if let Some(question) = question.map(str::trim).filter(|q| !q.is_empty()) {
        prompt.push_str(&format!("\nSpecifically answer this question: {question}\n"));
    }
    Ok(prompt)
}

/// Chat-completions backed provider.
#[derive(Debug, Clone)]
pub struct OpenAiInsightProvider {
    http: Arc<HttpFetcher>,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

impl OpenAiInsightProvider {
    pub fn new(
        http: Arc<HttpFetcher>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
        }
    }
}

#[async_trait]
impl InsightProvider for OpenAiInsightProvider {
    async fn summarize(
        &self,
        summary: &TrendSummary,
        question: Option<&str>,
    ) -> Result<String, InsightError> {
        let api_key = self
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or(InsightError::NotConfigured)?;
        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0.7,
            "messages": [
                {"role": "system", "content": "You are a helpful airline industry analyst."},
                {"role": "user", "content": build_prompt(summary, question)?},
            ],
        });
        let url = format!("{}/chat/completions", self.base_url);
        let response = self.http.post_json(&url, Some(api_key), &body).await?;
        let completion: ChatCompletion = response.json()?;
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or(InsightError::EmptyResponse)
    }
}

/// Never fails: provider errors are logged and replaced by [`INSIGHT_FALLBACK`].
pub async fn summarize_or_fallback(
    provider: &dyn InsightProvider,
    summary: &TrendSummary,
    question: Option<&str>,
) -> String {
    match provider.summarize(summary, question).await {
        Ok(text) => text,
        Err(err) => {
            warn!(error = %err, "insight provider failed; returning fallback text");
            INSIGHT_FALLBACK.to_string()
        }
    }
}

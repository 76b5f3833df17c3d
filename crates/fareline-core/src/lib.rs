//! Core domain model for Fareline flight price observations.

use chrono::{DateTime, Datelike, Month, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "fareline-core";

/// Loosely-typed record as produced by a scrape or API source, before normalization.
pub type RawRecord = serde_json::Map<String, JsonValue>;

/// Namespace for deterministic observation ids derived from the identity key.
const OBSERVATION_NAMESPACE: Uuid = Uuid::from_u128(0x6f1e_2c44_93a8_4d5e_8b0a_f4a1_7c3e_9d21);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Route {
    pub origin: String,
    pub destination: String,
}

impl Route {
    pub fn new(origin: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            destination: destination.into(),
        }
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.origin, self.destination)
    }
}

/// One price quote for one flight leg at one observation moment.
///
/// `day_of_week` and `month` are accessors over `date`, so they can never drift from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightObservation {
    pub airline: String,
    pub price: Option<f64>,
    pub departure_time: String,
    pub arrival_time: Option<String>,
    pub duration: Option<String>,
    pub origin: String,
    pub destination: String,
    pub date: NaiveDate,
    pub scraped_at: DateTime<Utc>,
    pub price_percentile: Option<f64>,
}

impl FlightObservation {
    pub fn route(&self) -> Route {
        Route::new(self.origin.clone(), self.destination.clone())
    }

    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey {
            airline: self.airline.clone(),
            origin: self.origin.clone(),
            destination: self.destination.clone(),
            date: self.date,
            departure_time: self.departure_time.clone(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.identity_key().id()
    }

    pub fn day_of_week(&self) -> Weekday {
        self.date.weekday()
    }

    pub fn month(&self) -> Month {
        Month::try_from(self.date.month() as u8).expect("calendar month is always 1..=12")
    }
}

/// Fields that make two observations the same underlying flight instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey {
    pub airline: String,
    pub origin: String,
    pub destination: String,
    pub date: NaiveDate,
    pub departure_time: String,
}

impl IdentityKey {
    /// Unambiguous encoding of the key: a JSON array of the five fields.
    pub fn canonical(&self) -> String {
        serde_json::json!([
            self.airline,
            self.origin,
            self.destination,
            self.date.format("%Y-%m-%d").to_string(),
            self.departure_time,
        ])
        .to_string()
    }

    pub fn id(&self) -> Uuid {
        Uuid::new_v5(&OBSERVATION_NAMESPACE, self.canonical().as_bytes())
    }
}

pub fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

/// Source of the current time, injected wherever observations are stamped.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Query filters for stored observations. An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationFilter {
    pub origin: Option<String>,
    pub destination: Option<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

impl ObservationFilter {
    pub fn route(origin: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            origin: Some(origin.into()),
            destination: Some(destination.into()),
            ..Self::default()
        }
    }

    pub fn between(mut self, from: Option<NaiveDate>, to: Option<NaiveDate>) -> Self {
        self.date_from = from;
        self.date_to = to;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteCount {
    pub origin: String,
    pub destination: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatePrice {
    pub date: NaiveDate,
    pub mean_price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AirlinePrice {
    pub airline: String,
    pub mean_price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemandShare {
    pub label: String,
    pub share: f64,
}

/// Ephemeral aggregate view over a set of observations. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendSummary {
    pub popular_routes: Vec<RouteCount>,
    pub price_trends: Vec<DatePrice>,
    pub cheapest_airlines: Vec<AirlinePrice>,
    pub demand_by_day: Vec<DemandShare>,
    pub demand_by_month: Vec<DemandShare>,
}

impl TrendSummary {
    pub fn is_empty(&self) -> bool {
        self.popular_routes.is_empty()
            && self.price_trends.is_empty()
            && self.cheapest_airlines.is_empty()
            && self.demand_by_day.is_empty()
            && self.demand_by_month.is_empty()
    }
}

/// Why a single raw record was rejected during normalization.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` is not a valid date/timestamp: {value}")]
    InvalidDate { field: &'static str, value: String },
    #[error("price is not a currency amount: {0}")]
    InvalidPrice(String),
    #[error("price must be non-negative, got {0}")]
    NegativePrice(f64),
    #[error("origin and destination are both {0}")]
    SameRoute(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn obs(airline: &str, date: NaiveDate, departure: &str) -> FlightObservation {
        FlightObservation {
            airline: airline.to_string(),
            price: Some(120.0),
            departure_time: departure.to_string(),
            arrival_time: None,
            duration: None,
            origin: "SYD".into(),
            destination: "MEL".into(),
            date,
            scraped_at: Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
            price_percentile: None,
        }
    }

    #[test]
    fn calendar_fields_follow_date() {
        let mut o = obs("UA123", NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(), "10:00");
        assert_eq!(o.day_of_week(), Weekday::Sat);
        assert_eq!(o.month(), Month::June);
        assert_eq!(weekday_name(o.day_of_week()), "Saturday");

        o.date = NaiveDate::from_ymd_opt(2024, 12, 25).unwrap();
        assert_eq!(o.day_of_week(), Weekday::Wed);
        assert_eq!(o.month().name(), "December");
    }

    #[test]
    fn identity_id_ignores_price_and_scrape_time() {
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let a = obs("UA123", date, "10:00");
        let mut b = a.clone();
        b.price = Some(999.0);
        b.scraped_at = Utc.with_ymd_and_hms(2024, 5, 20, 8, 0, 0).unwrap();
        assert_eq!(a.id(), b.id());

        let c = obs("UA123", date, "11:00");
        assert_ne!(a.id(), c.id());
        assert_eq!(
            a.identity_key().canonical(),
            r#"["UA123","SYD","MEL","2024-06-01","10:00"]"#
        );
    }

    #[test]
    fn separators_inside_fields_do_not_collide() {
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let mut a = obs("A|B", date, "10:00");
        a.origin = "C".into();
        let mut b = obs("A", date, "10:00");
        b.origin = "B|C".into();
        assert_ne!(a.identity_key(), b.identity_key());
        assert_ne!(a.identity_key().canonical(), b.identity_key().canonical());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn filter_builder_sets_route_and_dates() {
        let from = NaiveDate::from_ymd_opt(2024, 6, 1);
        let f = ObservationFilter::route("SYD", "MEL").between(from, None);
        assert_eq!(f.origin.as_deref(), Some("SYD"));
        assert_eq!(f.destination.as_deref(), Some("MEL"));
        assert_eq!(f.date_from, from);
        assert_eq!(f.date_to, None);
        assert_eq!(ObservationFilter::default().origin, None);
    }

    #[test]
    fn empty_summary_reports_empty() {
        assert!(TrendSummary::default().is_empty());
    }
}

use std::collections::HashMap;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A single record from the append-only event log. Owned by the external
/// event store; read-only to this engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub actor_id: String,
    pub event_type: String,
    pub client_time: DateTime<Utc>,
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
}

impl EventRecord {
    pub fn new(
        actor_id: impl Into<String>,
        event_type: impl Into<String>,
        client_time: DateTime<Utc>,
    ) -> Self {
        Self {
            actor_id: actor_id.into(),
            event_type: event_type.into(),
            client_time,
            properties: HashMap::new(),
        }
    }

    /// Attach a string property (builder-style, used heavily in tests).
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties
            .insert(key.into(), serde_json::Value::String(value.into()));
        self
    }

    /// String view of a property, if present and a string.
    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(|v| v.as_str())
    }
}

/// Half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }

    /// Human-readable label used to tag per-window tables.
    pub fn label(&self) -> String {
        format!(
            "{}..{}",
            self.start.format("%Y-%m-%d"),
            self.end.format("%Y-%m-%d")
        )
    }

    /// `n` consecutive 7-day windows ending at `end`, oldest first.
    pub fn trailing_weeks(end: DateTime<Utc>, n: usize) -> Vec<TimeWindow> {
        (0..n)
            .rev()
            .map(|i| {
                let i = i as i64;
                TimeWindow::new(end - Duration::days(7 * (i + 1)), end - Duration::days(7 * i))
            })
            .collect()
    }
}

/// Cohort bucketing granularity. Truncation is calendar-aligned (day,
/// ISO-week Monday, first of month), never relative to the query range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Day,
    Week,
    Month,
}

impl Granularity {
    /// Truncate a timestamp to its granularity boundary.
    pub fn truncate(&self, t: DateTime<Utc>) -> NaiveDate {
        let d = t.date_naive();
        match self {
            Granularity::Day => d,
            Granularity::Week => {
                d - Duration::days(i64::from(d.weekday().num_days_from_monday()))
            }
            Granularity::Month => NaiveDate::from_ymd_opt(d.year(), d.month(), 1).unwrap_or(d),
        }
    }

    /// Whole granularity units between two already-truncated buckets.
    pub fn units_between(&self, from: NaiveDate, to: NaiveDate) -> i64 {
        match self {
            Granularity::Day => (to - from).num_days(),
            Granularity::Week => (to - from).num_days() / 7,
            Granularity::Month => {
                i64::from(to.year() - from.year()) * 12 + i64::from(to.month() as i32)
                    - i64::from(from.month() as i32)
            }
        }
    }
}

/// One grouped row returned by a count-style query: the dimension values
/// followed by a distinct-actor count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionRow {
    pub dimensions: Vec<String>,
    pub count: u64,
}

impl DimensionRow {
    pub fn new(dimension: impl Into<String>, count: u64) -> Self {
        Self {
            dimensions: vec![dimension.into()],
            count,
        }
    }

    /// The natural row key (first dimension value).
    pub fn key(&self) -> &str {
        self.dimensions.first().map(String::as_str).unwrap_or("")
    }
}

/// Response from the external affiliate/QR tracking service. Errors or
/// empty data signal "not ready yet", not failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QrScanReport {
    pub qr_scans: HashMap<String, u64>,
    pub qr_scan_errors: Vec<String>,
}

impl QrScanReport {
    pub fn total(&self) -> u64 {
        self.qr_scans.values().sum()
    }

    pub fn is_clean(&self) -> bool {
        self.qr_scan_errors.is_empty()
    }

    pub fn has_data(&self) -> bool {
        !self.qr_scans.is_empty()
    }
}

//! External-collaborator contracts — the event store, the membership/club
//! metrics subsystem, and the affiliate QR tracking service.
//!
//! Reporting modules accept these as `Arc<dyn Trait>` so production
//! backends and in-memory test doubles are interchangeable.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::error::ReportResult;
use crate::types::{DimensionRow, EventRecord, QrScanReport, TimeWindow};

/// Query against the append-only event log.
#[derive(Debug, Clone)]
pub struct EventQuery {
    /// Event types to match; empty means all types.
    pub event_types: Vec<String>,
    pub window: TimeWindow,
    /// Exact-match property filters (string comparison).
    pub property_filters: HashMap<String, serde_json::Value>,
}

impl EventQuery {
    pub fn of_type(event_type: impl Into<String>, window: TimeWindow) -> Self {
        Self {
            event_types: vec![event_type.into()],
            window,
            property_filters: HashMap::new(),
        }
    }

    /// Match every event type inside the window.
    pub fn all_in(window: TimeWindow) -> Self {
        Self {
            event_types: Vec::new(),
            window,
            property_filters: HashMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.property_filters
            .insert(key.into(), serde_json::Value::String(value.into()));
        self
    }

    pub fn matches(&self, event: &EventRecord) -> bool {
        if !self.window.contains(event.client_time) {
            return false;
        }
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type) {
            return false;
        }
        self.property_filters
            .iter()
            .all(|(k, v)| event.properties.get(k) == Some(v))
    }
}

/// Read-only query contract over the event store. This engine never writes.
pub trait EventStore: Send + Sync {
    /// All events satisfying the query, in no particular order.
    fn events(&self, query: &EventQuery) -> ReportResult<Vec<EventRecord>>;

    /// Distinct-actor counts grouped by the value of one property key.
    /// Events missing the property are skipped.
    fn grouped_counts(&self, query: &EventQuery, group_by: &str)
        -> ReportResult<Vec<DimensionRow>>;
}

/// Count-style queries exposed by the membership/club subsystem. Consumed
/// through this contract; its SQL is not reimplemented here.
pub trait MembershipMetrics: Send + Sync {
    fn events_by_country(&self, window: &TimeWindow) -> ReportResult<Vec<DimensionRow>>;
    fn invites_by_state(&self, window: &TimeWindow) -> ReportResult<Vec<DimensionRow>>;
    fn top_inviters(&self, window: &TimeWindow) -> ReportResult<Vec<DimensionRow>>;
    fn room_type_totals(&self, window: &TimeWindow) -> ReportResult<Vec<DimensionRow>>;
    fn club_owner_provenance(&self, window: &TimeWindow) -> ReportResult<Vec<DimensionRow>>;
}

/// The external affiliate/QR tracking service. Lags by design; errors or
/// empty data are valid "not ready yet" responses.
pub trait QrTracking: Send + Sync {
    fn scan_report(&self, window: &TimeWindow) -> ReportResult<QrScanReport>;
}

/// In-memory event store for tests and development.
#[derive(Default)]
pub struct MemoryEventStore {
    events: Mutex<Vec<EventRecord>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: EventRecord) {
        self.events
            .lock()
            .expect("event store mutex poisoned")
            .push(event);
    }

    pub fn record_all(&self, events: impl IntoIterator<Item = EventRecord>) {
        self.events
            .lock()
            .expect("event store mutex poisoned")
            .extend(events);
    }

    pub fn len(&self) -> usize {
        self.events.lock().expect("event store mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventStore for MemoryEventStore {
    fn events(&self, query: &EventQuery) -> ReportResult<Vec<EventRecord>> {
        let events = self.events.lock().expect("event store mutex poisoned");
        Ok(events.iter().filter(|e| query.matches(e)).cloned().collect())
    }

    fn grouped_counts(
        &self,
        query: &EventQuery,
        group_by: &str,
    ) -> ReportResult<Vec<DimensionRow>> {
        let events = self.events.lock().expect("event store mutex poisoned");
        let mut actors_by_value: HashMap<String, HashSet<String>> = HashMap::new();
        for event in events.iter().filter(|e| query.matches(e)) {
            if let Some(value) = event.property_str(group_by) {
                actors_by_value
                    .entry(value.to_string())
                    .or_default()
                    .insert(event.actor_id.clone());
            }
        }

        let mut rows: Vec<DimensionRow> = actors_by_value
            .into_iter()
            .map(|(value, actors)| DimensionRow::new(value, actors.len() as u64))
            .collect();
        rows.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key().cmp(b.key())));
        Ok(rows)
    }
}

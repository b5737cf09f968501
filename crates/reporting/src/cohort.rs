//! Cohort builder — assigns every qualifying actor to a calendar-aligned
//! time bucket based on the first event satisfying the base predicate.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use clubroom_core::store::{EventQuery, EventStore};
use clubroom_core::types::{Granularity, TimeWindow};
use clubroom_core::ReportResult;

use crate::predicate::EventPredicate;

/// One actor's cohort membership for a single report run. Exactly one
/// assignment exists per actor per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CohortAssignment {
    pub actor_id: String,
    pub cohort_bucket: NaiveDate,
    pub origin: DateTime<Utc>,
}

pub struct CohortBuilder {
    store: Arc<dyn EventStore>,
}

impl CohortBuilder {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Assign every qualifying actor to a cohort bucket.
    ///
    /// The earliest timestamp inside the window satisfying the predicate
    /// wins; for [`EventPredicate::Sequence`] that is the earliest `first`
    /// event confirmed by a strictly later `then` event inside the window.
    pub fn build_cohorts(
        &self,
        base: &EventPredicate,
        window: &TimeWindow,
        granularity: Granularity,
    ) -> ReportResult<Vec<CohortAssignment>> {
        let mut query = EventQuery::all_in(*window);
        if let Some(types) = base.query_types() {
            query.event_types = types;
        }
        let events = self.store.events(&query)?;

        let mut origins: HashMap<String, DateTime<Utc>> = HashMap::new();
        match base {
            EventPredicate::Sequence { first, then } => {
                let mut firsts: HashMap<String, Vec<DateTime<Utc>>> = HashMap::new();
                let mut latest_then: HashMap<String, DateTime<Utc>> = HashMap::new();
                for event in &events {
                    if event.event_type == *first {
                        firsts
                            .entry(event.actor_id.clone())
                            .or_default()
                            .push(event.client_time);
                    } else if event.event_type == *then {
                        latest_then
                            .entry(event.actor_id.clone())
                            .and_modify(|t| *t = (*t).max(event.client_time))
                            .or_insert(event.client_time);
                    }
                }
                for (actor, mut times) in firsts {
                    let Some(confirmed_before) = latest_then.get(&actor) else {
                        continue;
                    };
                    times.sort_unstable();
                    if let Some(origin) = times.into_iter().find(|t| t < confirmed_before) {
                        origins.insert(actor, origin);
                    }
                }
            }
            _ => {
                for event in &events {
                    if !base.matches(event) {
                        continue;
                    }
                    origins
                        .entry(event.actor_id.clone())
                        .and_modify(|t| *t = (*t).min(event.client_time))
                        .or_insert(event.client_time);
                }
            }
        }

        let mut assignments: Vec<CohortAssignment> = origins
            .into_iter()
            .map(|(actor_id, origin)| CohortAssignment {
                actor_id,
                cohort_bucket: granularity.truncate(origin),
                origin,
            })
            .collect();
        assignments.sort_by(|a, b| {
            a.cohort_bucket
                .cmp(&b.cohort_bucket)
                .then_with(|| a.actor_id.cmp(&b.actor_id))
        });

        debug!(
            actors = assignments.len(),
            window = %window.label(),
            "built cohort assignments"
        );
        Ok(assignments)
    }
}

/// Cohort bucket sizes, ordered by bucket date. Zero-member buckets never
/// appear here; the retention aggregator treats absent buckets as size 0.
pub fn cohort_sizes(assignments: &[CohortAssignment]) -> BTreeMap<NaiveDate, u64> {
    let mut sizes = BTreeMap::new();
    for assignment in assignments {
        *sizes.entry(assignment.cohort_bucket).or_insert(0) += 1;
    }
    sizes
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use clubroom_core::store::MemoryEventStore;
    use clubroom_core::types::EventRecord;
    use clubroom_core::{ReportError, ReportResult};
    use std::collections::HashSet;

    fn ts(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap()
    }

    fn window() -> TimeWindow {
        TimeWindow::new(ts(1, 0), ts(15, 0))
    }

    fn make_store(events: Vec<EventRecord>) -> Arc<MemoryEventStore> {
        let store = Arc::new(MemoryEventStore::new());
        store.record_all(events);
        store
    }

    #[test]
    fn test_actor_assigned_at_most_once_with_earliest_origin() {
        let store = make_store(vec![
            EventRecord::new("a", "register", ts(5, 9)),
            EventRecord::new("a", "register", ts(2, 14)),
            EventRecord::new("a", "register", ts(9, 1)),
            EventRecord::new("b", "register", ts(3, 8)),
        ]);
        let builder = CohortBuilder::new(store);
        let cohorts = builder
            .build_cohorts(
                &EventPredicate::literal("register"),
                &window(),
                Granularity::Day,
            )
            .unwrap();

        let actors: HashSet<&str> = cohorts.iter().map(|c| c.actor_id.as_str()).collect();
        assert_eq!(cohorts.len(), actors.len(), "one assignment per actor");

        let a = cohorts.iter().find(|c| c.actor_id == "a").unwrap();
        assert_eq!(a.origin, ts(2, 14));
        assert_eq!(a.cohort_bucket, ts(2, 14).date_naive());
    }

    #[test]
    fn test_sequence_requires_later_confirmation() {
        let store = make_store(vec![
            // Qualifies: registered day 2, verified day 4.
            EventRecord::new("a", "register", ts(2, 10)),
            EventRecord::new("a", "verified", ts(4, 10)),
            // Never verified.
            EventRecord::new("b", "register", ts(3, 10)),
            // Verified before registering only — not a confirmation.
            EventRecord::new("c", "verified", ts(2, 10)),
            EventRecord::new("c", "register", ts(5, 10)),
        ]);
        let builder = CohortBuilder::new(store);
        let cohorts = builder
            .build_cohorts(
                &EventPredicate::sequence("register", "verified"),
                &window(),
                Granularity::Day,
            )
            .unwrap();

        assert_eq!(cohorts.len(), 1);
        assert_eq!(cohorts[0].actor_id, "a");
        assert_eq!(cohorts[0].origin, ts(2, 10));
    }

    #[test]
    fn test_sequence_picks_earliest_confirmed_first_event() {
        let store = make_store(vec![
            EventRecord::new("a", "register", ts(2, 10)),
            EventRecord::new("a", "register", ts(6, 10)),
            EventRecord::new("a", "verified", ts(4, 10)),
        ]);
        let builder = CohortBuilder::new(store);
        let cohorts = builder
            .build_cohorts(
                &EventPredicate::sequence("register", "verified"),
                &window(),
                Granularity::Day,
            )
            .unwrap();

        // Day-2 registration is confirmed by the day-4 verification; the
        // day-6 registration is not the origin.
        assert_eq!(cohorts[0].origin, ts(2, 10));
    }

    #[test]
    fn test_week_buckets_are_calendar_aligned() {
        // 2024-01-03 is a Wednesday in the ISO week starting Mon 2024-01-01.
        let store = make_store(vec![EventRecord::new("a", "register", ts(3, 10))]);
        let builder = CohortBuilder::new(store);
        let cohorts = builder
            .build_cohorts(
                &EventPredicate::literal("register"),
                &window(),
                Granularity::Week,
            )
            .unwrap();
        assert_eq!(
            cohorts[0].cohort_bucket,
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
        );
    }

    struct UnreachableStore;

    impl EventStore for UnreachableStore {
        fn events(&self, _query: &EventQuery) -> ReportResult<Vec<EventRecord>> {
            Err(ReportError::StoreUnavailable("connection refused".into()))
        }

        fn grouped_counts(
            &self,
            _query: &EventQuery,
            _group_by: &str,
        ) -> ReportResult<Vec<clubroom_core::types::DimensionRow>> {
            Err(ReportError::StoreUnavailable("connection refused".into()))
        }
    }

    #[test]
    fn test_store_failure_yields_no_partial_results() {
        let builder = CohortBuilder::new(Arc::new(UnreachableStore));
        let result = builder.build_cohorts(
            &EventPredicate::literal("register"),
            &window(),
            Granularity::Day,
        );
        assert!(matches!(result, Err(ReportError::StoreUnavailable(_))));
    }
}

//! Retention aggregator — per cohort bucket × offset distinct-actor counts,
//! plus the synthetic average row computed over unions of actor sets.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::debug;

use clubroom_core::store::{EventQuery, EventStore};
use clubroom_core::types::{Granularity, TimeWindow};
use clubroom_core::ReportResult;

use crate::cohort::{cohort_sizes, CohortAssignment};
use crate::predicate::EventPredicate;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionCell {
    pub cohort_bucket: NaiveDate,
    pub offset: u32,
    pub bucket_size: u64,
    pub active_users: u64,
    pub percentage: f64,
}

/// One offset of the synthetic "average" row. The percentage is a true
/// union-of-sets ratio: |⋃ active actor sets| over Σ sizes of the cohorts
/// that have reached the offset — never a mean of per-cohort percentages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AverageCell {
    pub offset: u32,
    pub cohort_total: u64,
    pub active_users: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetentionTable {
    pub cells: Vec<RetentionCell>,
    pub average: Vec<AverageCell>,
}

fn pct(active: u64, size: u64) -> f64 {
    if size == 0 {
        0.0
    } else {
        100.0 * active as f64 / size as f64
    }
}

pub struct RetentionAggregator {
    store: Arc<dyn EventStore>,
}

impl RetentionAggregator {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Compute the dense retention table for the given cohort assignments.
    ///
    /// Activity is scanned strictly after each actor's origin and strictly
    /// before the window end; an event counts when any target predicate
    /// matches. Offsets beyond `max_offset` are discarded.
    pub fn compute_retention(
        &self,
        cohorts: &[CohortAssignment],
        targets: &[EventPredicate],
        max_offset: u32,
        granularity: Granularity,
        window: &TimeWindow,
    ) -> ReportResult<RetentionTable> {
        if cohorts.is_empty() {
            return Ok(RetentionTable::default());
        }

        let mut query = EventQuery::all_in(*window);
        if let Some(types) = query_types_for(targets) {
            query.event_types = types;
        }
        let events = self.store.events(&query)?;

        let by_actor: HashMap<&str, &CohortAssignment> = cohorts
            .iter()
            .map(|c| (c.actor_id.as_str(), c))
            .collect();

        // Distinct actors active per (cohort bucket, offset).
        let mut active: HashMap<(NaiveDate, u32), HashSet<&str>> = HashMap::new();
        for event in &events {
            let Some(assignment) = by_actor.get(event.actor_id.as_str()) else {
                continue;
            };
            if event.client_time <= assignment.origin {
                continue;
            }
            if !targets.iter().any(|t| t.matches(event)) {
                continue;
            }
            let bucket = granularity.truncate(event.client_time);
            let offset = granularity.units_between(assignment.cohort_bucket, bucket);
            if offset < 0 || offset as u32 > max_offset {
                continue;
            }
            active
                .entry((assignment.cohort_bucket, offset as u32))
                .or_default()
                .insert(assignment.actor_id.as_str());
        }

        let sizes = cohort_sizes(cohorts);
        // The last bucket observable inside the half-open window.
        let last_bucket = granularity.truncate(window.end - Duration::seconds(1));

        let mut cells = Vec::new();
        for (&bucket, &size) in &sizes {
            let reach = granularity.units_between(bucket, last_bucket).max(0) as u32;
            for offset in 0..=reach.min(max_offset) {
                let active_users = active
                    .get(&(bucket, offset))
                    .map(|s| s.len() as u64)
                    .unwrap_or(0);
                cells.push(RetentionCell {
                    cohort_bucket: bucket,
                    offset,
                    bucket_size: size,
                    active_users,
                    percentage: pct(active_users, size),
                });
            }
        }

        // Average row: per offset, union actor sets across every cohort
        // that has existed long enough to reach the offset, divided by the
        // summed sizes of those cohorts.
        let max_reach = sizes
            .keys()
            .map(|b| granularity.units_between(*b, last_bucket).max(0) as u32)
            .max()
            .unwrap_or(0);
        let mut average = Vec::new();
        for offset in 0..=max_reach.min(max_offset) {
            let mut union: HashSet<&str> = HashSet::new();
            let mut cohort_total = 0u64;
            for (&bucket, &size) in &sizes {
                let reach = granularity.units_between(bucket, last_bucket).max(0) as u32;
                if reach < offset {
                    continue;
                }
                cohort_total += size;
                if let Some(actors) = active.get(&(bucket, offset)) {
                    union.extend(actors);
                }
            }
            let active_users = union.len() as u64;
            average.push(AverageCell {
                offset,
                cohort_total,
                active_users,
                percentage: pct(active_users, cohort_total),
            });
        }

        debug!(
            cohorts = sizes.len(),
            cells = cells.len(),
            window = %window.label(),
            "computed retention table"
        );
        Ok(RetentionTable { cells, average })
    }
}

/// Union of store query types across targets; `None` when any target is a
/// wildcard and every event type must be fetched.
fn query_types_for(targets: &[EventPredicate]) -> Option<Vec<String>> {
    let mut types = Vec::new();
    for target in targets {
        match target.query_types() {
            Some(t) => types.extend(t),
            None => return None,
        }
    }
    types.sort_unstable();
    types.dedup();
    Some(types)
}

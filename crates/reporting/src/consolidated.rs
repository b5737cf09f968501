//! Consolidated multi-table report — runs the fixed catalog of metric
//! extractors over one custom interval or three trailing weekly windows
//! and assembles the results into a named-table bundle.
//!
//! Extractors are independent: they run concurrently, each under its own
//! timeout, and one failure only empties that one named table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use clubroom_core::config::ReportingConfig;
use clubroom_core::store::{EventQuery, EventStore, MembershipMetrics};
use clubroom_core::types::{DimensionRow, TimeWindow};
use clubroom_core::{ReportError, ReportResult};

use crate::funnel::EVENT_REGISTER;

/// Named extractors in the fixed catalog. Order carries no meaning; the
/// extractors never depend on each other.
pub const EXTRACTOR_NAMES: [&str; 6] = [
    "events_by_country",
    "invites_by_state",
    "top_inviters",
    "room_type_totals",
    "club_owner_provenance",
    "signups_by_utm",
];

/// One named table's rows for one window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableInstance {
    pub window_label: String,
    pub rows: Vec<DimensionRow>,
}

/// Diagnostic recorded when one extractor fails for one window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractorDiagnostic {
    pub extractor: String,
    pub window_label: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportBundle {
    pub report_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub windows: Vec<TimeWindow>,
    /// Table name → one instance per window, oldest window first.
    pub tables: HashMap<String, Vec<TableInstance>>,
    pub diagnostics: Vec<ExtractorDiagnostic>,
}

pub struct ConsolidatedOrchestrator {
    store: Arc<dyn EventStore>,
    membership: Arc<dyn MembershipMetrics>,
    config: ReportingConfig,
}

impl ConsolidatedOrchestrator {
    pub fn new(
        store: Arc<dyn EventStore>,
        membership: Arc<dyn MembershipMetrics>,
        config: ReportingConfig,
    ) -> Self {
        Self {
            store,
            membership,
            config,
        }
    }

    /// Build the consolidated bundle. With `start` absent the catalog runs
    /// over three trailing 7-day windows ending at `end`; with `start`
    /// present it runs once over `[start, end)`.
    pub async fn build_consolidated(
        &self,
        start: Option<DateTime<Utc>>,
        end: DateTime<Utc>,
    ) -> ReportResult<ReportBundle> {
        let windows = match start {
            Some(start) if start >= end => {
                return Err(ReportError::InvalidRequest(format!(
                    "start {start} is not before end {end}"
                )));
            }
            Some(start) => vec![TimeWindow::new(start, end)],
            None => TimeWindow::trailing_weeks(end, 3),
        };

        let report_id = Uuid::new_v4();
        info!(
            report_id = %report_id,
            windows = windows.len(),
            "building consolidated report"
        );

        // Results accumulate here as extractor tasks finish; assembly only
        // starts once every task has completed or failed (merge barrier).
        let results: Arc<DashMap<(usize, usize), Result<Vec<DimensionRow>, String>>> =
            Arc::new(DashMap::new());
        let timeout = Duration::from_millis(self.config.extractor_timeout_ms);

        let mut handles = Vec::new();
        for (wi, window) in windows.iter().enumerate() {
            for (xi, name) in EXTRACTOR_NAMES.into_iter().enumerate() {
                let store = Arc::clone(&self.store);
                let membership = Arc::clone(&self.membership);
                let results = Arc::clone(&results);
                let window = *window;
                handles.push(tokio::spawn(async move {
                    let work = tokio::task::spawn_blocking(move || {
                        run_extractor(name, &store, &membership, &window)
                    });
                    let outcome = match tokio::time::timeout(timeout, work).await {
                        Ok(Ok(Ok(rows))) => Ok(rows),
                        Ok(Ok(Err(e))) => Err(e.to_string()),
                        Ok(Err(join_error)) => Err(format!("extractor panicked: {join_error}")),
                        Err(_) => Err(format!("timed out after {timeout:?}")),
                    };
                    results.insert((wi, xi), outcome);
                }));
            }
        }
        for handle in handles {
            handle
                .await
                .map_err(|e| ReportError::Internal(anyhow::anyhow!(e)))?;
        }

        let mut tables: HashMap<String, Vec<TableInstance>> = HashMap::new();
        let mut diagnostics = Vec::new();
        for (xi, name) in EXTRACTOR_NAMES.iter().enumerate() {
            let mut instances = Vec::with_capacity(windows.len());
            for (wi, window) in windows.iter().enumerate() {
                let label = window.label();
                let rows = match results.remove(&(wi, xi)).map(|(_, v)| v) {
                    Some(Ok(rows)) => rows,
                    Some(Err(message)) => {
                        warn!(
                            extractor = *name,
                            window = %label,
                            error = %message,
                            "extractor failed; table degraded to empty"
                        );
                        diagnostics.push(ExtractorDiagnostic {
                            extractor: (*name).to_string(),
                            window_label: label.clone(),
                            message,
                        });
                        Vec::new()
                    }
                    None => Vec::new(),
                };
                instances.push(TableInstance {
                    window_label: label,
                    rows,
                });
            }
            tables.insert((*name).to_string(), instances);
        }

        Ok(ReportBundle {
            report_id,
            generated_at: Utc::now(),
            windows,
            tables,
            diagnostics,
        })
    }
}

fn run_extractor(
    name: &str,
    store: &Arc<dyn EventStore>,
    membership: &Arc<dyn MembershipMetrics>,
    window: &TimeWindow,
) -> ReportResult<Vec<DimensionRow>> {
    match name {
        "events_by_country" => membership.events_by_country(window),
        "invites_by_state" => membership.invites_by_state(window),
        "top_inviters" => membership.top_inviters(window),
        "room_type_totals" => membership.room_type_totals(window),
        "club_owner_provenance" => membership.club_owner_provenance(window),
        "signups_by_utm" => {
            store.grouped_counts(&EventQuery::of_type(EVENT_REGISTER, *window), "utm_source")
        }
        other => Err(ReportError::ExtractorFailure {
            extractor: other.to_string(),
            message: "unknown extractor".to_string(),
        }),
    }
}

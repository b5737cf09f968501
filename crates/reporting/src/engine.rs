//! Report API surface — the read-only entry points consumed by the
//! presentation layer: retention, weekly funnel, consolidated bundle.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use clubroom_core::config::ReportingConfig;
use clubroom_core::store::{EventStore, MembershipMetrics, QrTracking};
use clubroom_core::types::{Granularity, TimeWindow};
use clubroom_core::{ReportError, ReportResult};

use crate::cohort::CohortBuilder;
use crate::consolidated::{ConsolidatedOrchestrator, ReportBundle};
use crate::funnel::{FunnelAggregator, FunnelStage};
use crate::pivot::{materialize, PivotRow, ShapeRules, WindowTable};
use crate::predicate::EventPredicate;
use crate::reconcile::{QrReconciler, ReconcileHandle, ReconcileState, ReconcileStatus};
use crate::retention::{RetentionAggregator, RetentionTable};

/// Parameters of one retention report run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionRequest {
    pub base: EventPredicate,
    pub targets: Vec<EventPredicate>,
    /// Defaults to far enough back for `max_offset` buckets to exist.
    pub range_start: Option<DateTime<Utc>>,
    pub range_end: DateTime<Utc>,
    pub granularity: Granularity,
    /// Defaults to the configured bound.
    pub max_offset: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetentionResult {
    pub report_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub granularity: Granularity,
    pub window: TimeWindow,
    pub table: RetentionTable,
}

/// Point-in-time view of a funnel invocation, including whatever QR
/// reconciliation has applied so far.
#[derive(Debug, Clone, Serialize)]
pub struct FunnelBundle {
    pub report_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub windows: Vec<TimeWindow>,
    pub stages: Vec<Vec<FunnelStage>>,
    pub reconciliation: ReconcileStatus,
}

/// One funnel invocation's context. Owns the reconciliation worker; the
/// polling task lives no longer than this session's handle.
pub struct FunnelSession {
    report_id: Uuid,
    generated_at: DateTime<Utc>,
    windows: Vec<TimeWindow>,
    reconciler: QrReconciler,
    poll_interval: Duration,
}

impl FunnelSession {
    /// Snapshot the funnel with reconciled counts applied so far.
    pub fn bundle(&self) -> FunnelBundle {
        FunnelBundle {
            report_id: self.report_id,
            generated_at: self.generated_at,
            windows: self.windows.clone(),
            stages: self.reconciler.stages(),
            reconciliation: self.reconciler.status(),
        }
    }

    /// Start the scheduled polling loop for the unresolved windows.
    pub fn start_polling(&self) -> ReconcileHandle {
        self.reconciler.spawn(self.poll_interval)
    }

    pub fn reconciler(&self) -> &QrReconciler {
        &self.reconciler
    }

    /// Warning surfaced alongside otherwise-valid funnel data once the
    /// polling ceiling was hit with windows still unresolved.
    pub fn warning(&self) -> Option<ReportError> {
        let status = self.reconciler.status();
        (status.state == ReconcileState::Exhausted).then(|| {
            ReportError::ReconciliationExhausted {
                attempts: status.attempts,
            }
        })
    }
}

/// The reporting engine. Stateless between invocations; the only in-flight
/// state is each funnel session's reconciliation task.
pub struct ReportEngine {
    store: Arc<dyn EventStore>,
    membership: Arc<dyn MembershipMetrics>,
    qr: Arc<dyn QrTracking>,
    config: ReportingConfig,
}

impl ReportEngine {
    pub fn new(
        store: Arc<dyn EventStore>,
        membership: Arc<dyn MembershipMetrics>,
        qr: Arc<dyn QrTracking>,
        config: ReportingConfig,
    ) -> Self {
        Self {
            store,
            membership,
            qr,
            config,
        }
    }

    /// Cohort-retention report over the requested range.
    pub fn build_retention(&self, request: &RetentionRequest) -> ReportResult<RetentionResult> {
        let max_offset = request.max_offset.unwrap_or(self.config.max_retention_offset);
        let start = request
            .range_start
            .unwrap_or_else(|| default_start(request.range_end, request.granularity, max_offset));
        if start >= request.range_end {
            return Err(ReportError::InvalidRequest(format!(
                "range start {start} is not before end {}",
                request.range_end
            )));
        }
        let window = TimeWindow::new(start, request.range_end);

        let cohorts = CohortBuilder::new(Arc::clone(&self.store)).build_cohorts(
            &request.base,
            &window,
            request.granularity,
        )?;
        let table = RetentionAggregator::new(Arc::clone(&self.store)).compute_retention(
            &cohorts,
            &request.targets,
            max_offset,
            request.granularity,
            &window,
        )?;

        let report_id = Uuid::new_v4();
        info!(
            report_id = %report_id,
            cohorts = cohorts.len(),
            window = %window.label(),
            "built retention report"
        );
        Ok(RetentionResult {
            report_id,
            generated_at: Utc::now(),
            granularity: request.granularity,
            window,
            table,
        })
    }

    /// Weekly funnel: three trailing 7-day windows ending at
    /// `week_start + 7d`, with QR reconciliation prepared for any window
    /// the tracking service could not settle immediately.
    pub fn build_funnel_weekly(&self, week_start: DateTime<Utc>) -> ReportResult<FunnelSession> {
        let end = week_start + chrono::Duration::days(7);
        let windows = TimeWindow::trailing_weeks(end, 3);

        let stages = FunnelAggregator::new(Arc::clone(&self.store)).build_funnel(&windows)?;
        let reconciler = QrReconciler::new(
            Arc::clone(&self.qr),
            &windows,
            stages,
            self.config.qr_max_attempts,
        );
        reconciler.resolve_immediate();

        let report_id = Uuid::new_v4();
        info!(
            report_id = %report_id,
            unresolved = reconciler.status().unresolved_windows,
            "built weekly funnel"
        );
        Ok(FunnelSession {
            report_id,
            generated_at: Utc::now(),
            windows,
            reconciler,
            poll_interval: Duration::from_secs(self.config.qr_poll_interval_secs),
        })
    }

    /// Consolidated multi-table bundle (see [`ConsolidatedOrchestrator`]).
    pub async fn build_consolidated(
        &self,
        start: Option<DateTime<Utc>>,
        end: DateTime<Utc>,
    ) -> ReportResult<ReportBundle> {
        ConsolidatedOrchestrator::new(
            Arc::clone(&self.store),
            Arc::clone(&self.membership),
            self.config.clone(),
        )
        .build_consolidated(start, end)
        .await
    }

    /// Pivot one named table of a consolidated bundle into wide rows.
    pub fn pivot_table(
        &self,
        bundle: &ReportBundle,
        table: &str,
        rules: &ShapeRules,
    ) -> ReportResult<Vec<PivotRow>> {
        let instances = bundle.tables.get(table).ok_or_else(|| {
            ReportError::InvalidRequest(format!("unknown table '{table}' in bundle"))
        })?;
        let windows: Vec<WindowTable> = instances
            .iter()
            .map(|i| WindowTable::from_dimension_rows(&i.window_label, &i.rows))
            .collect();
        Ok(materialize(&windows, rules))
    }
}

/// Default range start: far enough back for `max_offset` buckets.
fn default_start(end: DateTime<Utc>, granularity: Granularity, max_offset: u32) -> DateTime<Utc> {
    let days_per_unit = match granularity {
        Granularity::Day => 1,
        Granularity::Week => 7,
        Granularity::Month => 31,
    };
    end - chrono::Duration::days(days_per_unit * (i64::from(max_offset) + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use clubroom_core::store::MemoryEventStore;
    use clubroom_core::types::{DimensionRow, EventRecord, QrScanReport};
    use std::collections::HashMap;

    use crate::funnel::{EVENT_PAGEVIEW, EVENT_REGISTER, QR_STAGE_INDEX, STAGE_NAMES};

    fn ts(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap()
    }

    struct EmptyMembership;

    impl MembershipMetrics for EmptyMembership {
        fn events_by_country(&self, _w: &TimeWindow) -> ReportResult<Vec<DimensionRow>> {
            Ok(vec![DimensionRow::new("France", 3)])
        }
        fn invites_by_state(&self, _w: &TimeWindow) -> ReportResult<Vec<DimensionRow>> {
            Ok(Vec::new())
        }
        fn top_inviters(&self, _w: &TimeWindow) -> ReportResult<Vec<DimensionRow>> {
            Ok(Vec::new())
        }
        fn room_type_totals(&self, _w: &TimeWindow) -> ReportResult<Vec<DimensionRow>> {
            Ok(Vec::new())
        }
        fn club_owner_provenance(&self, _w: &TimeWindow) -> ReportResult<Vec<DimensionRow>> {
            Ok(Vec::new())
        }
    }

    /// QR double that reports clean data for every window.
    struct CleanTracker {
        per_window: u64,
    }

    impl QrTracking for CleanTracker {
        fn scan_report(&self, _w: &TimeWindow) -> ReportResult<QrScanReport> {
            Ok(QrScanReport {
                qr_scans: HashMap::from([("launch".to_string(), self.per_window)]),
                qr_scan_errors: Vec::new(),
            })
        }
    }

    /// QR double that is never ready.
    struct LaggingTracker;

    impl QrTracking for LaggingTracker {
        fn scan_report(&self, _w: &TimeWindow) -> ReportResult<QrScanReport> {
            Ok(QrScanReport {
                qr_scans: HashMap::new(),
                qr_scan_errors: vec!["pending".to_string()],
            })
        }
    }

    fn engine_with(
        store: Arc<MemoryEventStore>,
        qr: Arc<dyn QrTracking>,
    ) -> ReportEngine {
        ReportEngine::new(store, Arc::new(EmptyMembership), qr, ReportingConfig::default())
    }

    #[test]
    fn test_build_retention_end_to_end() {
        let store = Arc::new(MemoryEventStore::new());
        store.record_all(vec![
            EventRecord::new("a", "register", ts(1, 8)),
            EventRecord::new("a", "verified", ts(1, 9)),
            EventRecord::new("a", EVENT_PAGEVIEW, ts(3, 10)),
            EventRecord::new("b", "register", ts(1, 8)),
            EventRecord::new("b", "verified", ts(1, 10)),
        ]);
        let engine = engine_with(store, Arc::new(LaggingTracker));

        let result = engine
            .build_retention(&RetentionRequest {
                base: EventPredicate::sequence("register", "verified"),
                targets: vec![EventPredicate::any()],
                range_start: Some(ts(1, 0)),
                range_end: ts(4, 0),
                granularity: Granularity::Day,
                max_offset: None,
            })
            .unwrap();

        let day1 = ts(1, 0).date_naive();
        let c0 = result
            .table
            .cells
            .iter()
            .find(|c| c.cohort_bucket == day1 && c.offset == 0)
            .unwrap();
        assert_eq!(c0.active_users, 2);
        assert_eq!(c0.percentage, 100.0);
        let c2 = result
            .table
            .cells
            .iter()
            .find(|c| c.cohort_bucket == day1 && c.offset == 2)
            .unwrap();
        assert_eq!(c2.active_users, 1);
        assert_eq!(c2.percentage, 50.0);
    }

    #[test]
    fn test_retention_rejects_inverted_range() {
        let engine = engine_with(Arc::new(MemoryEventStore::new()), Arc::new(LaggingTracker));
        let result = engine.build_retention(&RetentionRequest {
            base: EventPredicate::literal("register"),
            targets: vec![EventPredicate::any()],
            range_start: Some(ts(5, 0)),
            range_end: ts(1, 0),
            granularity: Granularity::Day,
            max_offset: None,
        });
        assert!(matches!(result, Err(ReportError::InvalidRequest(_))));
    }

    #[test]
    fn test_funnel_weekly_resolves_clean_windows_immediately() {
        let store = Arc::new(MemoryEventStore::new());
        store.record(
            EventRecord::new("a", EVENT_PAGEVIEW, ts(16, 9)).with_property("utm_source", "qr"),
        );
        let engine = engine_with(store, Arc::new(CleanTracker { per_window: 5 }));

        let session = engine.build_funnel_weekly(ts(15, 0)).unwrap();
        let bundle = session.bundle();

        assert_eq!(bundle.windows.len(), 3);
        assert_eq!(bundle.stages.len(), 3);
        for stages in &bundle.stages {
            assert_eq!(stages.len(), STAGE_NAMES.len());
        }
        // Every window settled at build time; the deferred 5 scans per
        // window are already merged into stage 1.
        assert_eq!(bundle.reconciliation.state, ReconcileState::Resolved);
        assert_eq!(bundle.reconciliation.unresolved_windows, 0);
        // Newest window had 1 QR-tagged actor + 5 reconciled scans.
        let stage1 = &bundle.stages[2][QR_STAGE_INDEX];
        assert_eq!(stage1.count, 6);
        assert_eq!(stage1.qr_scans, Some(6));
        assert!(session.warning().is_none());
    }

    #[test]
    fn test_funnel_weekly_surfaces_exhaustion_warning() {
        let engine = engine_with(Arc::new(MemoryEventStore::new()), Arc::new(LaggingTracker));
        let session = engine.build_funnel_weekly(ts(15, 0)).unwrap();
        assert_eq!(session.bundle().reconciliation.unresolved_windows, 3);

        for _ in 0..5 {
            session.reconciler().poll_once();
        }
        assert!(matches!(
            session.warning(),
            Some(ReportError::ReconciliationExhausted { attempts: 5 })
        ));
        // The funnel data itself is still served.
        assert_eq!(session.bundle().stages.len(), 3);
    }

    #[tokio::test]
    async fn test_consolidated_pivot_round() {
        let store = Arc::new(MemoryEventStore::new());
        store.record(
            EventRecord::new("a", EVENT_REGISTER, ts(20, 9)).with_property("utm_source", "qr"),
        );
        let engine = engine_with(store, Arc::new(LaggingTracker));

        let bundle = engine.build_consolidated(None, ts(22, 0)).await.unwrap();
        let rows = engine
            .pivot_table(&bundle, "events_by_country", &ShapeRules::counts("by_country"))
            .unwrap();

        // "France" appears in all three windows (fixed double), merged
        // into one wide row with three window columns.
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].row_key, "France");
        assert_eq!(rows[0].cells.len(), 3);

        let missing = engine.pivot_table(&bundle, "nope", &ShapeRules::counts("x"));
        assert!(matches!(missing, Err(ReportError::InvalidRequest(_))));
    }
}

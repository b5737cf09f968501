//! Analytics reporting engine — cohort retention, conversion funnels with
//! deferred QR reconciliation, consolidated multi-metric bundles, and the
//! pivot materializer that flattens them into wide tables.

pub mod cohort;
pub mod consolidated;
pub mod engine;
pub mod funnel;
pub mod pivot;
pub mod predicate;
pub mod reconcile;
pub mod retention;

pub use cohort::{CohortAssignment, CohortBuilder};
pub use consolidated::{ConsolidatedOrchestrator, ReportBundle};
pub use engine::{FunnelBundle, FunnelSession, ReportEngine, RetentionRequest, RetentionResult};
pub use funnel::{FunnelAggregator, FunnelStage};
pub use pivot::{materialize, PivotRow, ShapeRules};
pub use predicate::EventPredicate;
pub use reconcile::{QrReconciler, ReconcileHandle, ReconcileState, ReconcileStatus};
pub use retention::{RetentionAggregator, RetentionTable};

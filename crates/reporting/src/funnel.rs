//! Funnel aggregator — the fixed seven-stage conversion funnel, computed
//! independently per time window with distinct-actor counts.
//!
//! Stage predicates are not all raw event filters: a stage may be gated on
//! the actor set produced by an earlier stage within the same window
//! (installs only count inside the pageview-or-QR-tagged set, verification
//! only inside the register set).

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use clubroom_core::store::{EventQuery, EventStore};
use clubroom_core::types::{EventRecord, TimeWindow};
use clubroom_core::ReportResult;

pub const EVENT_PAGEVIEW: &str = "pageview";
pub const EVENT_LINK_CLICK: &str = "link_click";
pub const EVENT_APP_INSTALL: &str = "app_install";
pub const EVENT_REGISTER: &str = "register";
pub const EVENT_VERIFIED: &str = "verified";
pub const EVENT_CLUB_JOIN: &str = "club_join";
pub const EVENT_ROOM_PARTICIPATE: &str = "room_participate";

/// UTM source value marking a pageview as QR-driven.
pub const QR_UTM_SOURCE: &str = "qr";

/// Stage names in their fixed order. The order never depends on data.
pub const STAGE_NAMES: [&str; 7] = [
    "pageview",
    "click_scan",
    "install",
    "register",
    "verify",
    "join_club",
    "participate",
];

/// Index of the click/scan stage that QR reconciliation adjusts.
pub const QR_STAGE_INDEX: usize = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunnelStage {
    pub order: usize,
    pub name: String,
    pub count: u64,
    /// QR sub-count displayed for the click/scan stage; `None` elsewhere.
    pub qr_scans: Option<u64>,
}

pub struct FunnelAggregator {
    store: Arc<dyn EventStore>,
}

impl FunnelAggregator {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// One stage list per window, each exactly [`STAGE_NAMES`] long.
    pub fn build_funnel(&self, windows: &[TimeWindow]) -> ReportResult<Vec<Vec<FunnelStage>>> {
        windows.iter().map(|w| self.build_window(w)).collect()
    }

    fn build_window(&self, window: &TimeWindow) -> ReportResult<Vec<FunnelStage>> {
        let events = self.store.events(&EventQuery::all_in(*window))?;

        let actors_of = |kind: &str| -> HashSet<&str> {
            events
                .iter()
                .filter(|e| e.event_type == kind)
                .map(|e| e.actor_id.as_str())
                .collect()
        };

        let pageviews = actors_of(EVENT_PAGEVIEW);
        let qr_tagged: HashSet<&str> = events
            .iter()
            .filter(|e| is_qr_tagged(e))
            .map(|e| e.actor_id.as_str())
            .collect();

        // Click/scan: explicit link clicks plus QR-tagged arrivals.
        let clicks: HashSet<&str> = actors_of(EVENT_LINK_CLICK)
            .union(&qr_tagged)
            .copied()
            .collect();

        // Installs only count for actors already seen via pageview or QR.
        let reach: HashSet<&str> = pageviews.union(&qr_tagged).copied().collect();
        let installs: HashSet<&str> = actors_of(EVENT_APP_INSTALL)
            .intersection(&reach)
            .copied()
            .collect();

        let registers = actors_of(EVENT_REGISTER);
        let verified: HashSet<&str> = actors_of(EVENT_VERIFIED)
            .intersection(&registers)
            .copied()
            .collect();
        let joins = actors_of(EVENT_CLUB_JOIN);
        let participates = actors_of(EVENT_ROOM_PARTICIPATE);

        let counts = [
            pageviews.len(),
            clicks.len(),
            installs.len(),
            registers.len(),
            verified.len(),
            joins.len(),
            participates.len(),
        ];

        let stages = STAGE_NAMES
            .iter()
            .zip(counts)
            .enumerate()
            .map(|(order, (name, count))| FunnelStage {
                order,
                name: (*name).to_string(),
                count: count as u64,
                qr_scans: (order == QR_STAGE_INDEX).then_some(qr_tagged.len() as u64),
            })
            .collect();

        debug!(window = %window.label(), "built funnel window");
        Ok(stages)
    }
}

fn is_qr_tagged(event: &EventRecord) -> bool {
    event.event_type == EVENT_PAGEVIEW && event.property_str("utm_source") == Some(QR_UTM_SOURCE)
}

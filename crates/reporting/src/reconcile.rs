//! QR reconciliation — merges the lagging affiliate scan counts into the
//! click/scan stage of an already-computed funnel.
//!
//! Implemented as an explicit scheduled task with a tagged state
//! (`Idle → Polling → Resolved | Exhausted`), a shared attempt counter,
//! and a cancellation handle bound to one report invocation. Windows are
//! polled strictly oldest-first, one per tick; a success does not reset
//! the schedule.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use clubroom_core::store::QrTracking;
use clubroom_core::types::TimeWindow;

use crate::funnel::{FunnelStage, QR_STAGE_INDEX};

/// Lifecycle of one invocation's reconciliation task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileState {
    Idle,
    Polling,
    Resolved,
    Exhausted,
}

/// Result of a single scheduled poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Scan data arrived and was applied to the given window.
    Applied { window_index: usize },
    /// The service is not ready yet; one attempt was consumed.
    NotReady,
    /// Every window is resolved; nothing left to poll.
    AllResolved,
    /// The attempt ceiling was hit; polling has stopped permanently.
    Exhausted,
}

/// Externally visible reconciliation status, reported with the funnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileStatus {
    pub state: ReconcileState,
    pub attempts: u32,
    pub unresolved_windows: usize,
}

#[derive(Debug)]
struct WindowSlot {
    window: TimeWindow,
    resolved: bool,
    applied_delta: Option<u64>,
}

struct Inner {
    slots: Vec<WindowSlot>,
    /// The funnel being patched; one stage list per window.
    stages: Vec<Vec<FunnelStage>>,
    attempts: u32,
    state: ReconcileState,
}

impl Inner {
    fn apply(&mut self, index: usize, delta: u64) -> bool {
        let Some(slot) = self.slots.get_mut(index) else {
            return false;
        };
        if slot.resolved {
            // Idempotent: re-applying to a resolved window is a no-op.
            return false;
        }
        if let Some(stage) = self
            .stages
            .get_mut(index)
            .and_then(|s| s.get_mut(QR_STAGE_INDEX))
        {
            stage.count += delta;
            stage.qr_scans = Some(stage.qr_scans.unwrap_or(0) + delta);
        }
        slot.applied_delta = Some(delta);
        slot.resolved = true;
        if self.slots.iter().all(|s| s.resolved) {
            self.state = ReconcileState::Resolved;
        }
        true
    }

    fn oldest_unresolved(&self) -> Option<(usize, TimeWindow)> {
        self.slots
            .iter()
            .enumerate()
            .find(|(_, s)| !s.resolved)
            .map(|(i, s)| (i, s.window))
    }
}

/// Reconciliation worker for one funnel invocation. Cheap to clone; all
/// clones share the same state.
#[derive(Clone)]
pub struct QrReconciler {
    tracker: Arc<dyn QrTracking>,
    inner: Arc<Mutex<Inner>>,
    max_attempts: u32,
}

impl QrReconciler {
    pub fn new(
        tracker: Arc<dyn QrTracking>,
        windows: &[TimeWindow],
        stages: Vec<Vec<FunnelStage>>,
        max_attempts: u32,
    ) -> Self {
        let slots = windows
            .iter()
            .map(|w| WindowSlot {
                window: *w,
                resolved: false,
                applied_delta: None,
            })
            .collect();
        Self {
            tracker,
            inner: Arc::new(Mutex::new(Inner {
                slots,
                stages,
                attempts: 0,
                state: ReconcileState::Idle,
            })),
            max_attempts,
        }
    }

    /// Build-time pass: a window resolves immediately iff the tracking
    /// service reports zero errors for it. Consumes no poll attempts.
    pub fn resolve_immediate(&self) {
        let windows: Vec<(usize, TimeWindow)> = {
            let inner = self.lock();
            inner
                .slots
                .iter()
                .enumerate()
                .map(|(i, s)| (i, s.window))
                .collect()
        };
        for (index, window) in windows {
            match self.tracker.scan_report(&window) {
                Ok(report) if report.is_clean() => {
                    let delta = report.total();
                    self.lock().apply(index, delta);
                    debug!(window_index = index, delta, "window resolved at build time");
                }
                Ok(_) | Err(_) => {
                    debug!(window_index = index, "window left unresolved at build time");
                }
            }
        }
    }

    /// Apply a reconciliation payload to one window. Returns `false` when
    /// the window was already resolved (the payload is dropped, never
    /// double-added).
    pub fn apply(&self, window_index: usize, delta: u64) -> bool {
        self.lock().apply(window_index, delta)
    }

    /// One scheduled poll against the oldest unresolved window.
    pub fn poll_once(&self) -> PollOutcome {
        let target = {
            let mut inner = self.lock();
            match inner.state {
                ReconcileState::Exhausted => return PollOutcome::Exhausted,
                ReconcileState::Resolved => return PollOutcome::AllResolved,
                _ => {}
            }
            let Some(target) = inner.oldest_unresolved() else {
                inner.state = ReconcileState::Resolved;
                return PollOutcome::AllResolved;
            };
            inner.state = ReconcileState::Polling;
            target
        };
        let (index, window) = target;

        // The external call happens outside the lock.
        match self.tracker.scan_report(&window) {
            Ok(report) if report.is_clean() && report.has_data() => {
                let delta = report.total();
                self.lock().apply(index, delta);
                metrics::counter!("qr_reconcile.applied").increment(delta);
                info!(window_index = index, delta, "QR scans reconciled");
                PollOutcome::Applied { window_index: index }
            }
            other => {
                if let Err(e) = other {
                    warn!(window_index = index, error = %e, "QR poll failed");
                } else {
                    debug!(window_index = index, "QR data not ready");
                }
                let mut inner = self.lock();
                inner.attempts += 1;
                metrics::counter!("qr_reconcile.failed_polls").increment(1);
                if inner.attempts >= self.max_attempts {
                    inner.state = ReconcileState::Exhausted;
                    warn!(
                        attempts = inner.attempts,
                        unresolved = inner.slots.iter().filter(|s| !s.resolved).count(),
                        "QR reconciliation exhausted"
                    );
                    PollOutcome::Exhausted
                } else {
                    PollOutcome::NotReady
                }
            }
        }
    }

    /// Spawn the polling loop. The returned handle cancels the task when
    /// dropped; no timer outlives the report invocation.
    pub fn spawn(&self, poll_interval: Duration) -> ReconcileHandle {
        let worker = self.clone();
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first interval tick completes immediately; skip it so the
            // first poll happens one full interval after spawn.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut cancel_rx => {
                        debug!("QR reconciliation cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        match worker.poll_once() {
                            PollOutcome::AllResolved | PollOutcome::Exhausted => break,
                            PollOutcome::Applied { .. } | PollOutcome::NotReady => {}
                        }
                    }
                }
            }
        });
        ReconcileHandle {
            cancel: Some(cancel_tx),
            task,
        }
    }

    pub fn status(&self) -> ReconcileStatus {
        let inner = self.lock();
        ReconcileStatus {
            state: inner.state,
            attempts: inner.attempts,
            unresolved_windows: inner.slots.iter().filter(|s| !s.resolved).count(),
        }
    }

    /// Snapshot of the funnel stages including any reconciled deltas.
    pub fn stages(&self) -> Vec<Vec<FunnelStage>> {
        self.lock().stages.clone()
    }

    pub fn applied_delta(&self, window_index: usize) -> Option<u64> {
        self.lock()
            .slots
            .get(window_index)
            .and_then(|s| s.applied_delta)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("reconcile mutex poisoned")
    }
}

/// Cancellation handle for the spawned polling loop.
pub struct ReconcileHandle {
    cancel: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ReconcileHandle {
    pub fn cancel(mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ReconcileHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

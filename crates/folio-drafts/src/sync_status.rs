//! Sync status tracking and recovery.
//!
//! [`SyncTracker`] counts writes from the moment they are queued (a debounce
//! timer is armed, a save is issued) until they complete. Each write is held
//! as an RAII guard, so a write that is dropped or aborted can never leave the
//! counters behind.
//!
//! ```text
//! Settled ──queue──▶ Queued ──start──▶ Syncing ──(watchdog elapsed)──▶ Stuck
//!    ▲                  │                 │                              │
//!    └──────────────────┴──── complete ───┴────── force_resync ──────────┘
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::model::ProjectId;
use crate::resolve::PublishedCache;
use crate::store::PublishedStore;

/// Observable sync state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncState {
    /// Writes queued or in flight.
    pub pending_changes: usize,
    pub is_syncing: bool,
    pub is_stuck: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Settled,
    Queued,
    Syncing,
    Stuck,
}

impl SyncState {
    pub fn status(&self) -> SyncStatus {
        if self.is_stuck {
            SyncStatus::Stuck
        } else if self.is_syncing {
            SyncStatus::Syncing
        } else if self.pending_changes > 0 {
            SyncStatus::Queued
        } else {
            SyncStatus::Settled
        }
    }
}

#[derive(Default)]
struct TrackerState {
    queued: HashSet<u64>,
    in_flight: HashMap<u64, Instant>,
    // reset on every start or completion, so it measures time without progress
    syncing_since: Option<Instant>,
    last_sync_time: Option<DateTime<Utc>>,
    stuck_reported: bool,
}

struct TrackerInner {
    state: Mutex<TrackerState>,
    next_id: AtomicU64,
    watchdog: Duration,
    tx: watch::Sender<SyncState>,
}

#[derive(Clone)]
pub struct SyncTracker {
    inner: Arc<TrackerInner>,
}

impl SyncTracker {
    pub fn new(watchdog: Duration) -> Self {
        let (tx, _) = watch::channel(SyncState::default());
        Self {
            inner: Arc::new(TrackerInner {
                state: Mutex::new(TrackerState::default()),
                next_id: AtomicU64::new(1),
                watchdog,
                tx,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn derive(&self, st: &TrackerState) -> SyncState {
        let is_syncing = !st.in_flight.is_empty();
        let is_stuck = is_syncing
            && st
                .syncing_since
                .is_some_and(|since| since.elapsed() > self.inner.watchdog);
        SyncState {
            pending_changes: st.queued.len() + st.in_flight.len(),
            is_syncing,
            is_stuck,
            last_sync_time: st.last_sync_time,
        }
    }

    fn publish(&self, st: &TrackerState) {
        let next = self.derive(st);
        self.inner.tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    /// Register a write that will be issued later.
    pub fn queue(&self) -> QueuedChange {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut st = self.lock();
        st.queued.insert(id);
        self.publish(&st);
        QueuedChange {
            tracker: self.clone(),
            id,
            active: true,
        }
    }

    pub fn state(&self) -> SyncState {
        let st = self.lock();
        self.derive(&st)
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.inner.tx.subscribe()
    }

    /// Forget every in-flight write. Late completions of those writes are ignored.
    pub fn abandon_in_flight(&self) -> usize {
        let mut st = self.lock();
        let abandoned = st.in_flight.len();
        st.in_flight.clear();
        st.syncing_since = None;
        st.stuck_reported = false;
        self.publish(&st);
        abandoned
    }

    /// Re-derive the state and report a newly stuck sync. Returns whether it is stuck.
    pub fn check(&self) -> bool {
        let mut st = self.lock();
        let state = self.derive(&st);
        if state.is_stuck && !st.stuck_reported {
            st.stuck_reported = true;
            warn!(
                in_flight = st.in_flight.len(),
                watchdog_secs = self.inner.watchdog.as_secs(),
                "sync appears stuck"
            );
        }
        self.publish(&st);
        state.is_stuck
    }

    fn start(&self, id: u64) {
        let mut st = self.lock();
        st.queued.remove(&id);
        let now = Instant::now();
        st.in_flight.insert(id, now);
        st.syncing_since = Some(now);
        st.stuck_reported = false;
        self.publish(&st);
    }

    fn dequeue(&self, id: u64) {
        let mut st = self.lock();
        if st.queued.remove(&id) {
            self.publish(&st);
        }
    }

    fn finish(&self, id: u64, succeeded: bool) {
        let mut st = self.lock();
        if st.in_flight.remove(&id).is_none() {
            // abandoned by force_resync
            return;
        }
        if succeeded {
            st.last_sync_time = Some(Utc::now());
        }
        st.syncing_since = if st.in_flight.is_empty() {
            None
        } else {
            Some(Instant::now())
        };
        st.stuck_reported = false;
        self.publish(&st);
    }
}

/// A write that has been scheduled but not issued.
#[must_use]
pub struct QueuedChange {
    tracker: SyncTracker,
    id: u64,
    active: bool,
}

impl QueuedChange {
    pub fn start(mut self) -> InFlightChange {
        self.active = false;
        self.tracker.start(self.id);
        InFlightChange {
            tracker: self.tracker.clone(),
            id: self.id,
            done: false,
        }
    }
}

impl Drop for QueuedChange {
    fn drop(&mut self) {
        if self.active {
            self.tracker.dequeue(self.id);
        }
    }
}

/// A write currently awaiting the store. Dropping it counts as a failure.
#[must_use]
pub struct InFlightChange {
    tracker: SyncTracker,
    id: u64,
    done: bool,
}

impl InFlightChange {
    pub fn complete(mut self) {
        self.done = true;
        self.tracker.finish(self.id, true);
    }

    pub fn fail(mut self) {
        self.done = true;
        self.tracker.finish(self.id, false);
    }
}

impl Drop for InFlightChange {
    fn drop(&mut self) {
        if !self.done {
            self.tracker.finish(self.id, false);
        }
    }
}

/// Sync indicator and recovery actions for one project.
pub struct SyncStatusController<P> {
    project: ProjectId,
    tracker: SyncTracker,
    published: PublishedCache<P>,
}

impl<P: PublishedStore + 'static> SyncStatusController<P> {
    pub fn new(project: ProjectId, tracker: SyncTracker, published: PublishedCache<P>) -> Self {
        Self {
            project,
            tracker,
            published,
        }
    }

    pub fn state(&self) -> SyncState {
        self.tracker.state()
    }

    pub fn status(&self) -> SyncStatus {
        self.state().status()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.tracker.subscribe()
    }

    /// Abandon in-flight writes so the indicator leaves `Stuck`.
    ///
    /// Only bookkeeping is reset. A write that completes later is ignored and
    /// a write that never completes is lost, which is why this is a manual action.
    pub fn force_resync(&self) -> SyncState {
        let abandoned = self.tracker.abandon_in_flight();
        warn!(project = %self.project, abandoned, "forced resync");
        self.tracker.state()
    }

    /// Invalidate cached published data. Drafts are never touched.
    pub fn safe_clear_published_cache(&self) {
        self.published.invalidate_all();
        info!(project = %self.project, "cleared published cache");
    }

    /// Periodically re-check for a stuck sync so subscribers see `is_stuck`
    /// flip without another write happening.
    pub fn spawn_watchdog(&self, every: Duration) -> JoinHandle<()> {
        let tracker = self.tracker.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tracker.check();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_guards_drive_status() {
        let tracker = SyncTracker::new(Duration::from_secs(30));
        assert_eq!(tracker.state().status(), SyncStatus::Settled);

        let queued = tracker.queue();
        assert_eq!(tracker.state().status(), SyncStatus::Queued);
        assert_eq!(tracker.state().pending_changes, 1);

        let flight = queued.start();
        assert_eq!(tracker.state().status(), SyncStatus::Syncing);

        flight.complete();
        let state = tracker.state();
        assert_eq!(state.status(), SyncStatus::Settled);
        assert!(state.last_sync_time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_guards_release_counts() {
        let tracker = SyncTracker::new(Duration::from_secs(30));
        drop(tracker.queue());
        let flight = tracker.queue().start();
        drop(flight);
        let state = tracker.state();
        assert_eq!(state.pending_changes, 0);
        assert!(state.last_sync_time.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_after_watchdog_and_reset_by_abandon() {
        let tracker = SyncTracker::new(Duration::from_secs(30));
        let flight = tracker.queue().start();

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!tracker.check());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(tracker.check());
        assert_eq!(tracker.state().status(), SyncStatus::Stuck);

        assert_eq!(tracker.abandon_in_flight(), 1);
        assert_eq!(tracker.state().status(), SyncStatus::Settled);

        // late completion of an abandoned write changes nothing
        flight.complete();
        assert!(tracker.state().last_sync_time.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_resets_stuck_clock() {
        let tracker = SyncTracker::new(Duration::from_secs(30));
        let first = tracker.queue().start();
        let second = tracker.queue().start();

        tokio::time::advance(Duration::from_secs(20)).await;
        first.complete();
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(!tracker.check());
        second.complete();
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_receiver_sees_changes() {
        let tracker = SyncTracker::new(Duration::from_secs(30));
        let mut rx = tracker.subscribe();
        let queued = tracker.queue();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().pending_changes, 1);
        drop(queued);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().pending_changes, 0);
    }
}

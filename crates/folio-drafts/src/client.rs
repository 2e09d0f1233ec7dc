//! Typed, project-scoped access to the draft store.
//!
//! Writes to the same `(kind, key)` are applied in the order they were issued.
//! Each key has a lane: a write takes a sequence number when issued and waits
//! for the lane before reaching the store. If a newer write for the same key
//! was issued in the meantime, the older one is skipped as superseded, so a
//! slow early write can never land on top of a later one.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use smol_str::SmolStr;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::PersistenceError;
use crate::events::{DraftEvent, EditorId, EventBus};
use crate::model::{ChangeKind, ChangeRecord, ChangeValue, ContentBlock, DraftChanges, ProjectId};
use crate::sync_status::{QueuedChange, SyncTracker};
use crate::store::DraftStore;

/// What became of a write.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    Saved(ChangeRecord),
    /// A newer write for the same key was issued before this one reached the store.
    Superseded,
}

impl SaveOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, SaveOutcome::Saved(_))
    }
}

#[derive(Default)]
struct WriteLane {
    issued: AtomicU64,
    gate: Arc<Mutex<()>>,
    // cancelled when a resync detaches the lane
    released: CancellationToken,
}

struct ChangeStoreInner<S> {
    store: Arc<S>,
    project: ProjectId,
    events: EventBus,
    tracker: SyncTracker,
    lanes: DashMap<(ChangeKind, SmolStr), Arc<WriteLane>>,
}

/// Cheap to clone; clones share lanes and the sync tracker.
pub struct ChangeStore<S> {
    inner: Arc<ChangeStoreInner<S>>,
}

impl<S> Clone for ChangeStore<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: DraftStore> ChangeStore<S> {
    pub fn new(store: Arc<S>, project: ProjectId, events: EventBus, tracker: SyncTracker) -> Self {
        Self {
            inner: Arc::new(ChangeStoreInner {
                store,
                project,
                events,
                tracker,
                lanes: DashMap::new(),
            }),
        }
    }

    pub fn project(&self) -> &ProjectId {
        &self.inner.project
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn tracker(&self) -> &SyncTracker {
        &self.inner.tracker
    }

    pub fn backend(&self) -> &Arc<S> {
        &self.inner.store
    }

    pub async fn get_all_changes(&self) -> Result<DraftChanges, PersistenceError> {
        self.inner
            .store
            .get_all_changes(&self.inner.project)
            .await
            .map_err(|source| PersistenceError::Load {
                project: self.inner.project.clone(),
                source,
            })
    }

    pub async fn save_text(
        &self,
        key: &str,
        value: impl Into<String>,
        origin: Option<EditorId>,
    ) -> Result<SaveOutcome, PersistenceError> {
        self.save(key, ChangeValue::Text(value.into()), origin).await
    }

    /// Record that `original_src` has been replaced by `stored_url`.
    pub async fn save_image(
        &self,
        original_src: &str,
        stored_url: impl Into<String>,
    ) -> Result<SaveOutcome, PersistenceError> {
        self.save(original_src, ChangeValue::Image(stored_url.into()), None)
            .await
    }

    pub async fn save_blocks(
        &self,
        section_key: &str,
        blocks: Vec<ContentBlock>,
        origin: Option<EditorId>,
    ) -> Result<SaveOutcome, PersistenceError> {
        self.save(section_key, ChangeValue::ContentBlock(blocks), origin)
            .await
    }

    pub async fn save(
        &self,
        key: &str,
        value: ChangeValue,
        origin: Option<EditorId>,
    ) -> Result<SaveOutcome, PersistenceError> {
        let queued = self.inner.tracker.queue();
        self.save_queued(key, value, origin, queued).await
    }

    /// Like [`save`](Self::save), for a write whose queue slot was taken earlier
    /// (a debounce timer that has already been counted as pending).
    pub async fn save_queued(
        &self,
        key: &str,
        value: ChangeValue,
        origin: Option<EditorId>,
        queued: QueuedChange,
    ) -> Result<SaveOutcome, PersistenceError> {
        let kind = value.kind();
        let lane_key = (kind, SmolStr::new(key));
        let mut lane = self.inner.lanes.entry(lane_key.clone()).or_default().clone();
        let mut seq = lane.issued.fetch_add(1, Ordering::SeqCst) + 1;

        let _gate = loop {
            let gate = lane.released.run_until_cancelled(lane.gate.clone().lock_owned()).await;
            let superseded = lane.issued.load(Ordering::SeqCst) != seq;
            if !superseded {
                if let Some(gate) = gate.filter(|_| !lane.released.is_cancelled()) {
                    break gate;
                }
                // The lane was detached while we waited. Rejoin the current
                // lane only if no write has been issued through it yet.
                let current = self.inner.lanes.entry(lane_key.clone()).or_default().clone();
                if current
                    .issued
                    .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    debug!(%kind, key, "write moved to a fresh lane after resync");
                    lane = current;
                    seq = 1;
                    continue;
                }
            }
            debug!(%kind, key, seq, "write superseded before reaching the store");
            metrics::counter!("folio_draft_writes_total", "kind" => kind.as_str(), "outcome" => "superseded").increment(1);
            return Ok(SaveOutcome::Superseded);
        };

        let flight = queued.start();
        let record = ChangeRecord::new(self.inner.project.clone(), key, value);
        match self.inner.store.save_change(&record).await {
            Ok(()) => {
                flight.complete();
                metrics::counter!("folio_draft_writes_total", "kind" => kind.as_str(), "outcome" => "saved").increment(1);
                debug!(project = %self.inner.project, %kind, key, "saved draft change");
                self.announce(&record, origin);
                Ok(SaveOutcome::Saved(record))
            }
            Err(source) => {
                flight.fail();
                metrics::counter!("folio_draft_writes_total", "kind" => kind.as_str(), "outcome" => "failed").increment(1);
                warn!(project = %self.inner.project, %kind, key, error = %source, "failed to save draft change");
                Err(PersistenceError::Save {
                    kind,
                    key: SmolStr::new(key),
                    source,
                })
            }
        }
    }

    /// Detach every write lane, so writes stuck on an abandoned store call no
    /// longer hold back newer writes to the same key. Writes queued behind
    /// the stuck one move to the fresh lane, unless a newer write got there
    /// first.
    pub fn release_lanes(&self) -> usize {
        let mut released = 0;
        self.inner.lanes.retain(|_, lane| {
            lane.released.cancel();
            released += 1;
            false
        });
        released
    }

    /// Current draft records with their timestamps.
    pub async fn list_records(&self) -> Result<Vec<ChangeRecord>, PersistenceError> {
        self.inner
            .store
            .list_changes(&self.inner.project)
            .await
            .map_err(|source| PersistenceError::Load {
                project: self.inner.project.clone(),
                source,
            })
    }

    /// Delete `records` unless they were rewritten after being read.
    pub async fn remove_records(&self, records: &[ChangeRecord]) -> Result<usize, PersistenceError> {
        self.inner
            .store
            .remove_changes(&self.inner.project, records)
            .await
            .map_err(|source| PersistenceError::Clear {
                project: self.inner.project.clone(),
                source,
            })
    }

    /// Drop every draft of the project.
    pub async fn clear(&self) -> Result<(), PersistenceError> {
        self.inner
            .store
            .clear_changes(&self.inner.project)
            .await
            .map_err(|source| PersistenceError::Clear {
                project: self.inner.project.clone(),
                source,
            })
    }

    fn announce(&self, record: &ChangeRecord, origin: Option<EditorId>) {
        let event = match &record.value {
            ChangeValue::Text(value) => DraftEvent::DraftTextChanged {
                project_id: record.project_id.clone(),
                key: record.key.clone(),
                value: value.clone(),
                origin,
                timestamp: Utc::now(),
            },
            ChangeValue::ContentBlock(blocks) => DraftEvent::ContentBlocksChanged {
                project_id: record.project_id.clone(),
                section_key: record.key.clone(),
                blocks: blocks.as_slice().into(),
                origin,
                timestamp: Utc::now(),
            },
            // the image pipeline reports its own stage events
            ChangeValue::Image(_) => return,
        };
        self.inner.events.emit(event);
    }
}

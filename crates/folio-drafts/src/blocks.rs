//! Ordered content blocks of one section.
//!
//! Every mutation changes the in-memory sequence first and then persists the
//! whole sequence as a single change. A sequence that serializes above the
//! size ceiling is never written; memory snaps back to the last sequence that
//! was handed to the store.

use std::sync::{Arc, Mutex, MutexGuard};

use folio_common::DraftConfig;
use smol_str::SmolStr;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::captions::{BatchProgress, BatchReport, CaptionBatchProcessor};
use crate::client::{ChangeStore, SaveOutcome};
use crate::error::{DraftError, PersistenceError, StoreError, ValidationError};
use crate::events::{DraftEvent, EditorId, Signal};
use crate::model::{BlockPatch, ChangeKind, ContentBlock};
use crate::notify::Notifier;
use crate::resolve::{PublishedCache, Tier};
use crate::store::{CaptionService, DraftStore, PublishedStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    Persisted,
    /// The operation was a no-op (boundary move, same index).
    Unchanged,
    Superseded,
}

struct BlockState {
    blocks: Vec<ContentBlock>,
    // last sequence that passed the size check, saved or still in flight
    accepted: Vec<ContentBlock>,
    source: Tier,
    // bumped by every local mutation; reloads started earlier are dropped
    generation: u64,
    writes_in_flight: usize,
}

struct BlockInner<S, P> {
    section_key: SmolStr,
    store: ChangeStore<S>,
    published: PublishedCache<P>,
    notifier: Notifier,
    max_bytes: usize,
    origin: EditorId,
    state: Mutex<BlockState>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl<S, P> BlockInner<S, P> {
    fn lock(&self) -> MutexGuard<'_, BlockState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<S, P> Drop for BlockInner<S, P> {
    fn drop(&mut self) {
        let listener = self
            .listener
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(listener) = listener.take() {
            listener.abort();
        }
    }
}

struct WriteInFlight<'a, S, P>(&'a BlockInner<S, P>);

impl<S, P> Drop for WriteInFlight<'_, S, P> {
    fn drop(&mut self) {
        self.0.lock().writes_in_flight -= 1;
    }
}

pub struct BlockManager<S, P> {
    inner: Arc<BlockInner<S, P>>,
}

impl<S, P> Clone for BlockManager<S, P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S, P> BlockManager<S, P>
where
    S: DraftStore + 'static,
    P: PublishedStore + 'static,
{
    /// Load a section: draft first, then published, then empty.
    pub async fn load(
        section_key: &str,
        store: ChangeStore<S>,
        published: PublishedCache<P>,
        notifier: Notifier,
        config: &DraftConfig,
    ) -> Result<Self, DraftError> {
        let manager = Self {
            inner: Arc::new(BlockInner {
                section_key: SmolStr::new(section_key),
                store,
                published,
                notifier,
                max_bytes: config.max_block_bytes,
                origin: EditorId::next(),
                state: Mutex::new(BlockState {
                    blocks: Vec::new(),
                    accepted: Vec::new(),
                    source: Tier::Default,
                    generation: 0,
                    writes_in_flight: 0,
                }),
                listener: Mutex::new(None),
            }),
        };
        let (blocks, source) = manager.resolve().await?;
        {
            let mut st = manager.inner.lock();
            st.blocks = blocks.clone();
            st.accepted = blocks;
            st.source = source;
        }
        debug!(section = section_key, ?source, "loaded content blocks");
        Ok(manager)
    }

    async fn resolve(&self) -> Result<(Vec<ContentBlock>, Tier), DraftError> {
        let drafts = self.inner.store.get_all_changes().await?;
        if let Some(blocks) = drafts.content_blocks.get(&self.inner.section_key) {
            return Ok((blocks.clone(), Tier::Draft));
        }
        let published = self.inner.published.get(self.inner.store.project()).await?;
        Ok(
            match published.and_then(|p| p.content_blocks.get(&self.inner.section_key).cloned()) {
                Some(blocks) => (blocks, Tier::Published),
                None => (Vec::new(), Tier::Default),
            },
        )
    }

    pub fn section_key(&self) -> &str {
        &self.inner.section_key
    }

    pub fn blocks(&self) -> Vec<ContentBlock> {
        self.inner.lock().blocks.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tier the current sequence was resolved from.
    pub fn source(&self) -> Tier {
        self.inner.lock().source
    }

    pub async fn move_up(&self, index: usize) -> Result<MutationOutcome, DraftError> {
        self.mutate(|blocks| {
            check_index(index, blocks.len())?;
            if index == 0 {
                return Ok(false);
            }
            blocks.swap(index - 1, index);
            Ok(true)
        })
        .await
    }

    pub async fn move_down(&self, index: usize) -> Result<MutationOutcome, DraftError> {
        self.mutate(|blocks| {
            check_index(index, blocks.len())?;
            if index + 1 == blocks.len() {
                return Ok(false);
            }
            blocks.swap(index, index + 1);
            Ok(true)
        })
        .await
    }

    /// Move one block to `to`, shifting the blocks in between. One write.
    pub async fn move_block(&self, from: usize, to: usize) -> Result<MutationOutcome, DraftError> {
        self.mutate(|blocks| {
            check_index(from, blocks.len())?;
            check_index(to, blocks.len())?;
            if from == to {
                return Ok(false);
            }
            let block = blocks.remove(from);
            blocks.insert(to, block);
            Ok(true)
        })
        .await
    }

    pub async fn update_field(
        &self,
        index: usize,
        patch: BlockPatch,
    ) -> Result<MutationOutcome, DraftError> {
        self.mutate(|blocks| {
            check_index(index, blocks.len())?;
            blocks[index].apply(patch)?;
            Ok(true)
        })
        .await
    }

    /// Insert at `position`, or append when `None`.
    pub async fn insert(
        &self,
        block: ContentBlock,
        position: Option<usize>,
    ) -> Result<MutationOutcome, DraftError> {
        self.mutate(|blocks| {
            let at = position.unwrap_or(blocks.len());
            if at > blocks.len() {
                return Err(ValidationError::IndexOutOfRange {
                    index: at,
                    len: blocks.len(),
                });
            }
            blocks.insert(at, block);
            Ok(true)
        })
        .await
    }

    pub async fn remove(&self, index: usize) -> Result<MutationOutcome, DraftError> {
        self.mutate(|blocks| {
            check_index(index, blocks.len())?;
            blocks.remove(index);
            Ok(true)
        })
        .await
    }

    /// Run the caption processor over this section and store the improved
    /// captions with a single write.
    pub async fn enhance_captions<C: CaptionService>(
        &self,
        processor: &CaptionBatchProcessor<C>,
        on_progress: impl FnMut(&BatchProgress),
    ) -> Result<BatchReport, DraftError> {
        let snapshot = self.blocks();
        let report = processor.enhance(&snapshot, on_progress).await;
        self.apply_captions(&report).await?;
        Ok(report)
    }

    /// Write the captions of a batch report into the matching image blocks.
    pub async fn apply_captions(&self, report: &BatchReport) -> Result<MutationOutcome, DraftError> {
        if report.updates.is_empty() {
            return Ok(MutationOutcome::Unchanged);
        }
        self.mutate(|blocks| Ok(report.apply_to(blocks) > 0)).await
    }

    async fn mutate(
        &self,
        change: impl FnOnce(&mut Vec<ContentBlock>) -> Result<bool, ValidationError>,
    ) -> Result<MutationOutcome, DraftError> {
        let section = &self.inner.section_key;
        let next = {
            let mut st = self.inner.lock();
            let mut next = st.blocks.clone();
            if !change(&mut next)? {
                return Ok(MutationOutcome::Unchanged);
            }
            let size = encoded_len(&next).map_err(|source| PersistenceError::Save {
                kind: ChangeKind::ContentBlock,
                key: section.clone(),
                source,
            })?;
            st.generation += 1;
            if size > self.inner.max_bytes {
                // back to the last sequence handed to the store, even if
                // that write is still in flight
                st.blocks = st.accepted.clone();
                drop(st);
                let err = ValidationError::BlockCollectionTooLarge {
                    section: section.clone(),
                    size,
                    limit: self.inner.max_bytes,
                };
                warn!(section = %section, size, limit = self.inner.max_bytes, "block collection over size limit, reverted");
                self.inner.notifier.error(Some(section.as_str()), err.to_string());
                return Err(err.into());
            }
            st.blocks = next.clone();
            st.accepted = next.clone();
            st.writes_in_flight += 1;
            next
        };
        let _in_flight = WriteInFlight(&self.inner);
        self.persist(next).await
    }

    async fn persist(&self, blocks: Vec<ContentBlock>) -> Result<MutationOutcome, DraftError> {
        let section = &self.inner.section_key;
        match self
            .inner
            .store
            .save_blocks(section, blocks, Some(self.inner.origin))
            .await
        {
            Ok(SaveOutcome::Saved(_)) => {
                self.inner.lock().source = Tier::Draft;
                Ok(MutationOutcome::Persisted)
            }
            Ok(SaveOutcome::Superseded) => Ok(MutationOutcome::Superseded),
            Err(e) => {
                self.inner
                    .notifier
                    .error(Some(section.as_str()), format!("Could not save content blocks: {e}"));
                Err(e.into())
            }
        }
    }

    /// React to a signal from another component. Returns whether the local
    /// sequence changed.
    pub async fn apply_event(&self, event: &DraftEvent) -> Result<bool, DraftError> {
        match event {
            DraftEvent::ContentBlocksChanged {
                section_key, origin, ..
            } if *section_key == self.inner.section_key && *origin != Some(self.inner.origin) => {}
            DraftEvent::Published { .. } | DraftEvent::DraftsCleared { .. } => {}
            _ => return Ok(false),
        }
        self.reload(event.name()).await
    }

    /// Re-read the section from the stores. Dropped when a local mutation
    /// happened meanwhile or a local write has yet to land, since either
    /// would make the result stale.
    pub async fn reload(&self, cause: &str) -> Result<bool, DraftError> {
        let generation = self.inner.lock().generation;
        let (blocks, source) = self.resolve().await?;

        let mut st = self.inner.lock();
        if st.generation != generation || st.writes_in_flight > 0 {
            debug!(section = %self.inner.section_key, cause, "dropping stale reload");
            return Ok(false);
        }
        let changed = st.blocks != blocks;
        st.blocks = blocks.clone();
        st.accepted = blocks;
        st.source = source;
        Ok(changed)
    }

    /// Follow project signals until the manager is dropped or closed.
    pub fn spawn_listener(&self) {
        let mut events = self
            .inner
            .store
            .events()
            .subscribe(self.inner.store.project().clone());
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            while let Some(signal) = events.next_signal().await {
                let Some(inner) = weak.upgrade() else { break };
                let manager = BlockManager { inner };
                let (result, cause) = match &signal {
                    Signal::Event(event) => (manager.apply_event(event).await, event.name()),
                    Signal::Missed(_) => (manager.reload("missed events").await, "missed events"),
                };
                match result {
                    Ok(true) => debug!(section = %manager.section_key(), cause, "blocks reconciled"),
                    Ok(false) => {}
                    Err(e) => warn!(section = %manager.section_key(), error = %e, "failed to reconcile blocks"),
                }
            }
        });
        let mut slot = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    pub fn close(&self) {
        if let Some(listener) = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            listener.abort();
        }
    }
}

fn encoded_len(blocks: &[ContentBlock]) -> Result<usize, StoreError> {
    Ok(serde_json::to_vec(blocks)?.len())
}

fn check_index(index: usize, len: usize) -> Result<(), ValidationError> {
    if index < len {
        Ok(())
    } else {
        Err(ValidationError::IndexOutOfRange { index, len })
    }
}

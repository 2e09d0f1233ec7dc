//! Inline-editable text field with debounced persistence.
//!
//! Keystrokes update the local text at once and re-arm a single trailing-edge
//! timer; the write only happens once input has been quiet for the debounce
//! period. Commit (Enter, modifier+Enter or blur) writes immediately and
//! cancels the timer. Escape reverts to the last persisted value.
//!
//! The timer task holds only a weak handle to the field plus the generation it
//! was armed for, so a field that has been closed or edited again ignores it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use smol_str::SmolStr;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::client::{ChangeStore, SaveOutcome};
use crate::error::{DraftError, ValidationError};
use crate::events::{DraftEvent, EditorId, Signal};
use crate::model::ChangeValue;
use crate::notify::Notifier;
use crate::resolve::{ContentSnapshot, PublishedCache};
use crate::session::EditMode;
use crate::store::{DraftStore, PublishedStore};
use crate::sync_status::QueuedChange;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    SingleLine,
    MultiLine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditKey {
    Enter,
    /// Enter with Ctrl or Cmd held.
    ModEnter,
    Escape,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Saved,
    /// Text equals the last persisted value; nothing was written.
    Unchanged,
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Committed(CommitOutcome),
    Cancelled,
    /// Plain Enter in a multi-line field is a newline.
    Ignored,
}

struct PendingPersist {
    timer: JoinHandle<()>,
    queued: QueuedChange,
}

struct FieldState {
    text: String,
    editing: bool,
    last_persisted: String,
    generation: u64,
    pending: Option<PendingPersist>,
}

impl FieldState {
    fn cancel_pending(&mut self) -> Option<QueuedChange> {
        self.pending.take().map(|p| {
            p.timer.abort();
            p.queued
        })
    }
}

struct FieldInner<S> {
    key: Option<SmolStr>,
    kind: FieldKind,
    default: String,
    debounce: Duration,
    origin: EditorId,
    store: ChangeStore<S>,
    notifier: Notifier,
    closed: AtomicBool,
    state: Mutex<FieldState>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl<S> FieldInner<S> {
    fn lock(&self) -> MutexGuard<'_, FieldState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<S> Drop for FieldInner<S> {
    fn drop(&mut self) {
        self.lock().cancel_pending();
        let listener = self
            .listener
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(listener) = listener.take() {
            listener.abort();
        }
    }
}

pub struct FieldEditor<S> {
    inner: Arc<FieldInner<S>>,
}

impl<S> Clone for FieldEditor<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Options for [`FieldEditor::new`].
#[derive(Debug, Clone)]
pub struct FieldOptions {
    /// Persistence key. Without one the field is display-only.
    pub key: Option<SmolStr>,
    pub kind: FieldKind,
    /// Resolved value to start from.
    pub initial: String,
    /// Shown when neither a draft nor a published value exists.
    pub default: String,
    pub debounce: Duration,
}

impl<S: DraftStore + 'static> FieldEditor<S> {
    pub fn new(
        store: ChangeStore<S>,
        notifier: Notifier,
        options: FieldOptions,
    ) -> Self {
        Self {
            inner: Arc::new(FieldInner {
                key: options.key,
                kind: options.kind,
                default: options.default,
                debounce: options.debounce,
                origin: EditorId::next(),
                store,
                notifier,
                closed: AtomicBool::new(false),
                state: Mutex::new(FieldState {
                    text: options.initial.clone(),
                    editing: false,
                    last_persisted: options.initial,
                    generation: 0,
                    pending: None,
                }),
                listener: Mutex::new(None),
            }),
        }
    }

    pub fn key(&self) -> Option<&str> {
        self.inner.key.as_deref()
    }

    pub fn origin(&self) -> EditorId {
        self.inner.origin
    }

    pub fn text(&self) -> String {
        self.inner.lock().text.clone()
    }

    pub fn last_persisted(&self) -> String {
        self.inner.lock().last_persisted.clone()
    }

    pub fn is_editing(&self) -> bool {
        self.inner.lock().editing
    }

    /// A debounced write is armed and has not fired yet.
    pub fn has_pending(&self) -> bool {
        self.inner.lock().pending.is_some()
    }

    pub fn start_edit(&self, mode: EditMode) -> Result<(), DraftError> {
        if !mode.is_enabled() {
            return Err(ValidationError::EditModeDisabled.into());
        }
        if self.inner.key.is_none() {
            return Err(ValidationError::ReadOnly.into());
        }
        self.inner.lock().editing = true;
        Ok(())
    }

    /// Replace the local text and re-arm the debounce timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn input(&self, text: impl Into<String>) -> Result<(), DraftError> {
        let key = self.editing_key()?;
        let mut st = self.inner.lock();
        st.text = text.into();
        st.generation += 1;
        let generation = st.generation;
        let queued = st
            .cancel_pending()
            .unwrap_or_else(|| self.inner.store.tracker().queue());
        let timer = tokio::spawn(debounced_persist(
            Arc::downgrade(&self.inner),
            generation,
            self.inner.debounce,
        ));
        st.pending = Some(PendingPersist { timer, queued });
        trace!(key = %key, generation, "debounce armed");
        Ok(())
    }

    /// Persist now if the text changed, and leave edit state on success.
    pub async fn commit(&self) -> Result<CommitOutcome, DraftError> {
        let (text, queued) = {
            let mut st = self.inner.lock();
            st.generation += 1;
            (st.text.clone(), st.cancel_pending())
        };
        let outcome = self.inner.persist(text, queued).await?;
        self.inner.lock().editing = false;
        Ok(outcome)
    }

    /// Set the text and commit in one step.
    pub async fn commit_value(&self, value: impl Into<String>) -> Result<CommitOutcome, DraftError> {
        self.editing_key()?;
        self.inner.lock().text = value.into();
        self.commit().await
    }

    pub async fn blur(&self) -> Result<CommitOutcome, DraftError> {
        self.commit().await
    }

    /// Revert to the last persisted value and leave edit state. Never writes.
    pub fn cancel(&self) {
        let mut st = self.inner.lock();
        st.generation += 1;
        st.cancel_pending();
        st.text = st.last_persisted.clone();
        st.editing = false;
    }

    pub async fn key_press(&self, key: EditKey) -> Result<KeyAction, DraftError> {
        match (self.inner.kind, key) {
            (_, EditKey::Escape) => {
                self.cancel();
                Ok(KeyAction::Cancelled)
            }
            (FieldKind::SingleLine, EditKey::Enter) | (_, EditKey::ModEnter) => {
                Ok(KeyAction::Committed(self.commit().await?))
            }
            (FieldKind::MultiLine, EditKey::Enter) => Ok(KeyAction::Ignored),
        }
    }

    /// Adopt an externally resolved value. Ignored while editing or when it
    /// matches what this field last persisted. Returns whether it was adopted.
    pub fn reconcile(&self, external: &str) -> bool {
        let mut st = self.inner.lock();
        if st.editing || st.last_persisted == external {
            return false;
        }
        st.text = external.to_string();
        st.last_persisted = external.to_string();
        true
    }

    /// Follow draft, publish and clear signals for this field's key.
    /// Display-only fields have nothing to follow and return `false`.
    pub fn spawn_listener<P: PublishedStore + 'static>(&self, published: PublishedCache<P>) -> bool {
        let Some(key) = self.inner.key.clone() else {
            return false;
        };
        let mut events = self
            .inner
            .store
            .events()
            .subscribe(self.inner.store.project().clone());
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            while let Some(signal) = events.next_signal().await {
                let Some(inner) = weak.upgrade() else { break };
                let field = FieldEditor { inner };
                let external = match signal {
                    Signal::Event(DraftEvent::DraftTextChanged {
                        key: changed,
                        value,
                        origin,
                        ..
                    }) if changed == key && origin != Some(field.origin()) => Some(value),
                    Signal::Event(DraftEvent::Published { .. } | DraftEvent::DraftsCleared { .. })
                    | Signal::Missed(_) => match field.resolve_stored(&published).await {
                        Ok(value) => Some(value),
                        Err(e) => {
                            debug!(key = %key, error = %e, "could not re-resolve field");
                            None
                        }
                    },
                    _ => None,
                };
                if let Some(external) = external {
                    if field.reconcile(&external) {
                        debug!(key = %key, "field reconciled with external value");
                    }
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
        true
    }

    /// The value this field's key resolves to in the stores, ignoring local edits.
    async fn resolve_stored<P: PublishedStore>(
        &self,
        published: &PublishedCache<P>,
    ) -> Result<String, DraftError> {
        let key = self.inner.key.clone().ok_or(ValidationError::ReadOnly)?;
        let content = ContentSnapshot {
            drafts: self.inner.store.get_all_changes().await?,
            published: published.get(self.inner.store.project()).await?,
        };
        Ok(content.text(&key, None, &self.inner.default).value.to_string())
    }

    /// Tear the field down: cancel the timer and the listener, discard any
    /// write still completing.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.lock().cancel_pending();
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

    fn editing_key(&self) -> Result<SmolStr, DraftError> {
        let key = self.inner.key.clone().ok_or(ValidationError::ReadOnly)?;
        if !self.inner.lock().editing {
            return Err(ValidationError::NotEditing { key }.into());
        }
        Ok(key)
    }
}

impl<S: DraftStore + 'static> FieldInner<S> {
    async fn persist(
        &self,
        text: String,
        queued: Option<QueuedChange>,
    ) -> Result<CommitOutcome, DraftError> {
        let key = self.key.clone().ok_or(ValidationError::ReadOnly)?;
        if self.lock().last_persisted == text {
            return Ok(CommitOutcome::Unchanged);
        }
        let queued = queued.unwrap_or_else(|| self.store.tracker().queue());
        let result = self
            .store
            .save_queued(&key, ChangeValue::Text(text.clone()), Some(self.origin), queued)
            .await;
        match result {
            Ok(SaveOutcome::Saved(_)) => {
                if !self.closed.load(Ordering::SeqCst) {
                    self.lock().last_persisted = text;
                }
                Ok(CommitOutcome::Saved)
            }
            Ok(SaveOutcome::Superseded) => Ok(CommitOutcome::Superseded),
            Err(e) => {
                self.notifier
                    .error(Some(key.as_str()), format!("Could not save your change: {e}"));
                Err(e.into())
            }
        }
    }
}

async fn debounced_persist<S: DraftStore + 'static>(
    field: Weak<FieldInner<S>>,
    generation: u64,
    delay: Duration,
) {
    tokio::time::sleep(delay).await;
    let Some(inner) = field.upgrade() else {
        return;
    };
    let (text, queued) = {
        let mut st = inner.lock();
        if st.generation != generation {
            return;
        }
        let Some(pending) = st.pending.take() else {
            return;
        };
        // detach: dropping our own JoinHandle must not abort us
        let PendingPersist { timer, queued } = pending;
        drop(timer);
        (st.text.clone(), queued)
    };
    if let Err(e) = inner.persist(text, Some(queued)).await {
        debug!(error = %e, "debounced persist failed");
    }
}

//! One project's editing surface: fields, sections, images, sync status and
//! publishing behind a single handle.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use folio_common::FolioConfig;
use smol_str::SmolStr;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::blocks::{BlockManager, MutationOutcome};
use crate::captions::{BatchProgress, BatchReport, CaptionBatchProcessor};
use crate::client::ChangeStore;
use crate::error::{DraftError, ValidationError};
use crate::events::EventBus;
use crate::field::{CommitOutcome, FieldEditor, FieldKind, FieldOptions};
use crate::image::{ImageFile, ImagePipeline, ReplaceOutcome, ReplacedImage};
use crate::model::{BlockPatch, ContentBlock, ProjectId, PublishedSnapshot};
use crate::notify::Notifier;
use crate::resolve::{ContentSnapshot, PublishedCache};
use crate::session::{EditMode, EditSession};
use crate::store::{BlobStore, CaptionService, DraftStore, PublishedStore};
use crate::sync_status::{SyncState, SyncStatusController, SyncTracker};
use crate::publish::Publisher;

/// The external services a workspace writes through.
pub struct Collaborators<S, P, B, C> {
    pub drafts: Arc<S>,
    pub published: Arc<P>,
    pub blobs: Arc<B>,
    pub captions: Arc<C>,
}

pub struct ProjectWorkspace<S, P, B, C> {
    project: ProjectId,
    config: FolioConfig,
    store: ChangeStore<S>,
    published: PublishedCache<P>,
    notifier: Notifier,
    session: EditSession,
    fields: DashMap<SmolStr, FieldEditor<S>>,
    sections: Mutex<HashMap<SmolStr, BlockManager<S, P>>>,
    pipeline: ImagePipeline<S, B, C>,
    captions: CaptionBatchProcessor<C>,
    status: SyncStatusController<P>,
    publisher: Publisher<S, P>,
    watchdog: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<S, P, B, C> ProjectWorkspace<S, P, B, C>
where
    S: DraftStore + 'static,
    P: PublishedStore + 'static,
    B: BlobStore + 'static,
    C: CaptionService + 'static,
{
    pub fn new(project: ProjectId, collaborators: Collaborators<S, P, B, C>, config: FolioConfig) -> Self {
        let events = EventBus::new();
        let notifier = Notifier::new();
        let tracker = SyncTracker::new(config.drafts.watchdog());
        let store = ChangeStore::new(collaborators.drafts, project.clone(), events, tracker.clone());
        let published = PublishedCache::new(collaborators.published, &config.cache);
        let pipeline = ImagePipeline::new(
            store.clone(),
            collaborators.blobs,
            collaborators.captions.clone(),
            config.images.clone(),
            &config.cache,
            notifier.clone(),
        );
        let captions = CaptionBatchProcessor::new(collaborators.captions, config.captions.clone());
        let status = SyncStatusController::new(project.clone(), tracker, published.clone());
        let publisher = Publisher::new(store.clone(), published.clone());

        Self {
            project,
            config,
            store,
            published,
            notifier,
            session: EditSession::new(),
            fields: DashMap::new(),
            sections: Mutex::new(HashMap::new()),
            pipeline,
            captions,
            status,
            publisher,
            watchdog: std::sync::Mutex::new(None),
        }
    }

    pub fn project(&self) -> &ProjectId {
        &self.project
    }

    pub fn events(&self) -> &EventBus {
        self.store.events()
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn pipeline(&self) -> &ImagePipeline<S, B, C> {
        &self.pipeline
    }

    pub fn mode(&self) -> EditMode {
        self.session.mode()
    }

    /// Enable editing and start the stuck-sync watchdog.
    pub fn begin_session(&self) {
        self.session.begin();
        let every = (self.config.drafts.watchdog() / 4).max(std::time::Duration::from_millis(250));
        let mut slot = self
            .watchdog
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_none() {
            *slot = Some(self.status.spawn_watchdog(every));
        }
        info!(project = %self.project, "edit session started");
    }

    /// Commit every field still in edit state, then disable editing.
    pub async fn end_session(&self) -> Result<(), DraftError> {
        let editing: Vec<_> = self
            .fields
            .iter()
            .filter(|f| f.is_editing())
            .map(|f| f.value().clone())
            .collect();
        let mut first_err = None;
        for field in editing {
            if let Err(e) = field.commit().await {
                first_err.get_or_insert(e);
            }
        }
        self.session.end();
        if let Some(handle) = self
            .watchdog
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            handle.abort();
        }
        info!(project = %self.project, "edit session ended");
        first_err.map_or(Ok(()), Err)
    }

    /// Drafts and published data as currently stored.
    pub async fn content(&self) -> Result<ContentSnapshot, DraftError> {
        let drafts = self.store.get_all_changes().await?;
        let published = self.published.get(&self.project).await?;
        Ok(ContentSnapshot { drafts, published })
    }

    /// Register (or fetch) the field for `key`, resolved through the tiers.
    pub async fn field(
        &self,
        key: &str,
        kind: FieldKind,
        default: &str,
    ) -> Result<FieldEditor<S>, DraftError> {
        if let Some(field) = self.fields.get(key) {
            return Ok(field.value().clone());
        }
        let content = self.content().await?;
        let initial = content.text(key, None, default).value.to_string();
        let field = FieldEditor::new(
            self.store.clone(),
            self.notifier.clone(),
            FieldOptions {
                key: Some(SmolStr::new(key)),
                kind,
                initial,
                default: default.to_string(),
                debounce: self.config.drafts.debounce(),
            },
        );
        field.spawn_listener(self.published.clone());
        let field = self
            .fields
            .entry(SmolStr::new(key))
            .or_insert(field)
            .value()
            .clone();
        Ok(field)
    }

    fn registered(&self, key: &str) -> Result<FieldEditor<S>, DraftError> {
        self.fields
            .get(key)
            .map(|f| f.value().clone())
            .ok_or_else(|| ValidationError::UnknownField { key: key.into() }.into())
    }

    fn report<T>(&self, subject: &str, result: Result<T, DraftError>) -> Result<T, DraftError> {
        if let Err(e) = &result {
            // persistence, pipeline and size-limit failures are surfaced where they happen
            if matches!(e, DraftError::Validation(v) if !matches!(v, ValidationError::BlockCollectionTooLarge { .. }))
            {
                self.notifier.error(Some(subject), e.to_string());
            }
        }
        result
    }

    pub fn start_edit(&self, key: &str) -> Result<(), DraftError> {
        let result = self
            .registered(key)
            .and_then(|field| field.start_edit(self.session.mode()));
        self.report(key, result)
    }

    pub fn input(&self, key: &str, text: &str) -> Result<(), DraftError> {
        let result = self.registered(key).and_then(|field| field.input(text));
        self.report(key, result)
    }

    pub async fn commit_edit(&self, key: &str, value: &str) -> Result<CommitOutcome, DraftError> {
        let result = match self.registered(key) {
            Ok(field) => field.commit_value(value).await,
            Err(e) => Err(e),
        };
        self.report(key, result)
    }

    pub fn cancel_edit(&self, key: &str) -> Result<(), DraftError> {
        let result = self.registered(key).map(|field| field.cancel());
        self.report(key, result)
    }

    /// The block manager for `section_key`, loaded on first use.
    pub async fn section(&self, section_key: &str) -> Result<BlockManager<S, P>, DraftError> {
        let mut sections = self.sections.lock().await;
        if let Some(manager) = sections.get(section_key) {
            return Ok(manager.clone());
        }
        let manager = BlockManager::load(
            section_key,
            self.store.clone(),
            self.published.clone(),
            self.notifier.clone(),
            &self.config.drafts,
        )
        .await?;
        manager.spawn_listener();
        sections.insert(SmolStr::new(section_key), manager.clone());
        Ok(manager)
    }

    fn require_edit_mode(&self) -> Result<(), DraftError> {
        if self.session.mode().is_enabled() {
            Ok(())
        } else {
            Err(ValidationError::EditModeDisabled.into())
        }
    }

    pub async fn move_block(
        &self,
        section_key: &str,
        from: usize,
        to: usize,
    ) -> Result<MutationOutcome, DraftError> {
        let result = async {
            self.require_edit_mode()?;
            self.section(section_key).await?.move_block(from, to).await
        }
        .await;
        self.report(section_key, result)
    }

    pub async fn add_block(
        &self,
        section_key: &str,
        block: ContentBlock,
        position: Option<usize>,
    ) -> Result<MutationOutcome, DraftError> {
        let result = async {
            self.require_edit_mode()?;
            self.section(section_key).await?.insert(block, position).await
        }
        .await;
        self.report(section_key, result)
    }

    pub async fn update_block(
        &self,
        section_key: &str,
        index: usize,
        patch: BlockPatch,
    ) -> Result<MutationOutcome, DraftError> {
        let result = async {
            self.require_edit_mode()?;
            self.section(section_key).await?.update_field(index, patch).await
        }
        .await;
        self.report(section_key, result)
    }

    pub async fn remove_block(
        &self,
        section_key: &str,
        index: usize,
    ) -> Result<MutationOutcome, DraftError> {
        let result = async {
            self.require_edit_mode()?;
            self.section(section_key).await?.remove(index).await
        }
        .await;
        self.report(section_key, result)
    }

    /// Run the image pipeline for `original_src`. Image blocks that show the
    /// replaced source are not rewritten; they resolve through the image draft.
    pub async fn replace_image(
        &self,
        original_src: &str,
        file: ImageFile,
    ) -> Result<ReplaceOutcome, DraftError> {
        if let Err(e) = self.require_edit_mode() {
            return self.report(original_src, Err(e));
        }
        let notifier = self.notifier.clone();
        self.pipeline
            .replace_image(original_src, file, move |replaced: &ReplacedImage| {
                debug!(src = %replaced.original_src, url = %replaced.stored_url, "image replaced");
                notifier.info(Some(replaced.original_src.as_str()), "Image replaced");
            })
            .await
    }

    pub async fn enhance_captions(
        &self,
        section_key: &str,
        on_progress: impl FnMut(&BatchProgress),
    ) -> Result<BatchReport, DraftError> {
        let section = self.section(section_key).await?;
        section.enhance_captions(&self.captions, on_progress).await
    }

    pub async fn retry_captions(
        &self,
        section_key: &str,
        failed: &BatchReport,
        on_progress: impl FnMut(&BatchProgress),
    ) -> Result<BatchReport, DraftError> {
        let section = self.section(section_key).await?;
        let report = self
            .captions
            .retry_failed(&failed.progress.errors, on_progress)
            .await;
        section.apply_captions(&report).await?;
        Ok(report)
    }

    pub fn sync_state(&self) -> SyncState {
        self.status.state()
    }

    pub fn status(&self) -> &SyncStatusController<P> {
        &self.status
    }

    /// Abandon in-flight writes and their lanes. See [`SyncStatusController::force_resync`].
    pub fn force_resync(&self) -> SyncState {
        let lanes = self.store.release_lanes();
        debug!(project = %self.project, lanes, "released write lanes");
        self.status.force_resync()
    }

    pub fn safe_clear_published_cache(&self) {
        self.status.safe_clear_published_cache();
    }

    pub async fn publish(&self) -> Result<Arc<PublishedSnapshot>, DraftError> {
        self.publisher.publish().await
    }

    pub async fn clear_drafts(&self) -> Result<(), DraftError> {
        self.publisher.clear_drafts().await
    }

    /// Close every field and section and discard pending caption results.
    pub async fn shutdown(&self) {
        for field in self.fields.iter() {
            field.close();
        }
        for section in self.sections.lock().await.values() {
            section.close();
        }
        self.pipeline.teardown();
        if let Some(handle) = self
            .watchdog
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            handle.abort();
        }
        debug!(project = %self.project, "workspace shut down");
    }
}

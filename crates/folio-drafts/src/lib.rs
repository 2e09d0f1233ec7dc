//! Draft/publish content synchronization.
//!
//! Edits to text fields, ordered content blocks and images are persisted as
//! per-project drafts, separate from the published snapshot readers see.
//! Components share a [`ChangeStore`] and an [`EventBus`] per project; a
//! [`ProjectWorkspace`] bundles them for an editing surface.

pub mod blocks;
pub mod captions;
pub mod client;
pub mod error;
pub mod events;
pub mod field;
pub mod image;
pub mod model;
pub mod notify;
pub mod publish;
pub mod resolve;
pub mod session;
pub mod store;
pub mod sync_status;
pub mod workspace;

pub use blocks::{BlockManager, MutationOutcome};
pub use captions::{BatchProgress, BatchReport, CaptionBatchProcessor};
pub use client::{ChangeStore, SaveOutcome};
pub use error::{
    CaptionError, DraftError, PersistenceError, PipelineFailure, StoreError, UploadError,
    ValidationError,
};
pub use events::{DraftEvent, EditorId, EventBus, Signal};
pub use field::{CommitOutcome, EditKey, FieldEditor, FieldKind, FieldOptions, KeyAction};
pub use image::{ImageAsset, ImageFile, ImagePipeline, ReplaceOutcome, UploadStage};
pub use model::{
    BlockPatch, ChangeKind, ChangeRecord, ChangeValue, ContentBlock, DraftChanges, ProjectId,
    PublishedSnapshot,
};
pub use notify::{Notice, NoticeLevel, Notifier};
pub use publish::Publisher;
pub use resolve::{ContentSnapshot, PublishedCache, Resolved, Tier};
pub use session::{EditMode, EditSession};
pub use store::{BlobStore, CaptionContext, CaptionService, DraftStore, PublishedStore, UploadImage};
pub use sync_status::{SyncState, SyncStatus, SyncStatusController, SyncTracker};
pub use workspace::{Collaborators, ProjectWorkspace};

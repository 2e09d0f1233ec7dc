//! Collaborator interfaces the engine writes through.
//!
//! The engine never talks to a database, blob host or caption model directly.
//! It is generic over these traits; [`memory`] and [`file`] provide draft and
//! published backends, while blob storage and captioning are supplied by the
//! embedding application.

use bytes::Bytes;

use crate::error::{CaptionError, StoreError};
use crate::model::{ChangeRecord, DraftChanges, ProjectId, PublishedSnapshot};

pub mod file;
pub mod memory;

pub use file::{FileDraftStore, FilePublishedStore};
pub use memory::{MemoryDraftStore, MemoryPublishedStore};

/// Durable per-project draft records.
///
/// `save_change` upserts on `(project_id, kind, key)`.
#[trait_variant::make(DraftStore: Send)]
pub trait LocalDraftStore: Sync {
    async fn get_all_changes(&self, project: &ProjectId) -> Result<DraftChanges, StoreError>;

    /// Current records of a project, with their timestamps.
    async fn list_changes(&self, project: &ProjectId) -> Result<Vec<ChangeRecord>, StoreError>;

    async fn save_change(&self, record: &ChangeRecord) -> Result<(), StoreError>;

    /// Delete each of `records` whose stored copy is still exactly that
    /// record. A record rewritten since it was read stays. Returns how many
    /// were deleted.
    async fn remove_changes(
        &self,
        project: &ProjectId,
        records: &[ChangeRecord],
    ) -> Result<usize, StoreError>;

    async fn clear_changes(&self, project: &ProjectId) -> Result<(), StoreError>;
}

/// The published tier.
#[trait_variant::make(PublishedStore: Send)]
pub trait LocalPublishedStore: Sync {
    async fn load_published(
        &self,
        project: &ProjectId,
    ) -> Result<Option<PublishedSnapshot>, StoreError>;

    async fn store_published(
        &self,
        project: &ProjectId,
        snapshot: &PublishedSnapshot,
    ) -> Result<(), StoreError>;
}

/// An image ready for upload.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadImage {
    pub data: Bytes,
    pub mime_type: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Blob storage. `Ok(None)` means the store accepted the call but produced no URL.
#[trait_variant::make(BlobStore: Send)]
pub trait LocalBlobStore: Sync {
    async fn upload_image(
        &self,
        image: &UploadImage,
        project: &ProjectId,
        original_ref: &str,
    ) -> Result<Option<String>, StoreError>;
}

/// Where a caption will be shown, passed to the caption model as context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptionContext {
    ProjectImage,
    ContentBlock,
}

impl CaptionContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProjectImage => "project_image",
            Self::ContentBlock => "content_block",
        }
    }
}

#[trait_variant::make(CaptionService: Send)]
pub trait LocalCaptionService: Sync {
    async fn generate_caption(
        &self,
        image_url: &str,
        context: CaptionContext,
    ) -> Result<String, CaptionError>;
}

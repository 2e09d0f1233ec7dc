//! Error taxonomy for the draft engine.
//!
//! Failures fall into four families (validation, persistence, upload and
//! caption) plus the backend-facing [`StoreError`] they wrap. [`DraftError`]
//! is what public operations return.

use std::path::PathBuf;

use folio_common::SerDeError;
use miette::Diagnostic;
use smol_str::SmolStr;
use thiserror::Error;

use crate::image::UploadStage;
use crate::model::{ChangeKind, ProjectId};

/// Top-level error for engine operations.
#[derive(Debug, Error, Diagnostic)]
pub enum DraftError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Caption(#[from] CaptionError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Pipeline(#[from] PipelineFailure),
}

/// Input rejected before any write happens.
#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum ValidationError {
    #[error("unsupported file type {mime}")]
    #[diagnostic(
        code(validation::unsupported_type),
        help("upload a JPEG, PNG, WebP or GIF image")
    )]
    UnsupportedType { mime: String },

    #[error("file is {size} bytes, the limit is {limit}")]
    #[diagnostic(code(validation::too_large))]
    TooLarge { size: usize, limit: usize },

    #[error("content blocks for {section} serialize to {size} bytes, the limit is {limit}")]
    #[diagnostic(
        code(validation::block_collection_too_large),
        help("remove or shorten blocks in this section")
    )]
    BlockCollectionTooLarge {
        section: SmolStr,
        size: usize,
        limit: usize,
    },

    #[error("could not fit image into {budget} bytes (best attempt {size})")]
    #[diagnostic(code(validation::over_budget))]
    OverBudget { size: usize, budget: usize },

    #[error("could not decode image: {message}")]
    #[diagnostic(code(validation::undecodable))]
    Undecodable { message: String },

    #[error("index {index} is out of range for {len} blocks")]
    #[diagnostic(code(validation::index_out_of_range))]
    IndexOutOfRange { index: usize, len: usize },

    #[error("{block_type} blocks have no {field} field")]
    #[diagnostic(code(validation::field_not_applicable))]
    FieldNotApplicable {
        field: &'static str,
        block_type: &'static str,
    },

    #[error("field is read-only")]
    #[diagnostic(
        code(validation::read_only),
        help("fields without a persistence key are display-only")
    )]
    ReadOnly,

    #[error("edit mode is not enabled")]
    #[diagnostic(code(validation::edit_mode_disabled))]
    EditModeDisabled,

    #[error("field {key} is not in edit state")]
    #[diagnostic(code(validation::not_editing))]
    NotEditing { key: SmolStr },

    #[error("no field registered for {key}")]
    #[diagnostic(code(validation::unknown_field))]
    UnknownField { key: SmolStr },
}

/// A store read or write failed. The local state that triggered it is kept.
#[derive(Debug, Error, Diagnostic)]
pub enum PersistenceError {
    #[error("failed to save {kind} change {key}")]
    #[diagnostic(code(persistence::save), help("the edit is kept locally; commit again to retry"))]
    Save {
        kind: ChangeKind,
        key: SmolStr,
        #[source]
        source: StoreError,
    },

    #[error("failed to load drafts for {project}")]
    #[diagnostic(code(persistence::load))]
    Load {
        project: ProjectId,
        #[source]
        source: StoreError,
    },

    #[error("failed to load published content for {project}")]
    #[diagnostic(code(persistence::load_published))]
    LoadPublished {
        project: ProjectId,
        #[source]
        source: StoreError,
    },

    #[error("failed to clear drafts for {project}")]
    #[diagnostic(code(persistence::clear))]
    Clear {
        project: ProjectId,
        #[source]
        source: StoreError,
    },

    #[error("failed to publish {project}")]
    #[diagnostic(code(persistence::publish))]
    Publish {
        project: ProjectId,
        #[source]
        source: StoreError,
    },
}

/// Blob storage did not produce a usable URL.
#[derive(Debug, Error, Diagnostic)]
pub enum UploadError {
    #[error("blob store returned no URL for {original_src}")]
    #[diagnostic(code(upload::no_url))]
    NoUrl { original_src: SmolStr },

    #[error("upload of {original_src} failed")]
    #[diagnostic(code(upload::store))]
    Store {
        original_src: SmolStr,
        #[source]
        source: StoreError,
    },

    #[error("illegal pipeline transition {from} -> {to}")]
    #[diagnostic(code(upload::illegal_transition))]
    IllegalTransition { from: UploadStage, to: UploadStage },

    #[error("compression task failed: {0}")]
    #[diagnostic(code(upload::task))]
    Task(String),
}

/// Caption generation failed. Never invalidates an upload.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum CaptionError {
    #[error("caption service failed: {message}")]
    #[diagnostic(code(caption::service))]
    Service { message: String },

    #[error("caption service returned an empty caption")]
    #[diagnostic(code(caption::empty))]
    Empty,
}

impl CaptionError {
    pub fn service(message: impl Into<String>) -> Self {
        Self::Service {
            message: message.into(),
        }
    }
}

/// An image pipeline run that ended in `Failed`, with the stage it failed in.
#[derive(Debug, Error, Diagnostic)]
#[error("image pipeline failed while {stage}")]
#[diagnostic(code(upload::pipeline))]
pub struct PipelineFailure {
    pub stage: UploadStage,
    #[source]
    pub source: Box<DraftError>,
}

impl PipelineFailure {
    pub fn new(stage: UploadStage, source: impl Into<DraftError>) -> Self {
        Self {
            stage,
            source: Box::new(source.into()),
        }
    }
}

/// Backend-facing failure, wrapped by the families above.
#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum StoreError {
    #[error("I/O error on {}", path.display())]
    #[diagnostic(code(store::io))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Serde(#[from] SerDeError),

    #[error("backend unavailable: {0}")]
    #[diagnostic(code(store::unavailable))]
    Unavailable(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serde(SerDeError::Json(e))
    }
}

impl DraftError {
    /// True for errors the user fixes by changing input rather than retrying.
    pub fn is_validation(&self) -> bool {
        match self {
            DraftError::Validation(_) => true,
            DraftError::Pipeline(p) => p.source.is_validation(),
            _ => false,
        }
    }
}

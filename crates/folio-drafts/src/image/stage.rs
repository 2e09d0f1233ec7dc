//! Upload pipeline stages and the transitions between them.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use tracing::debug;

use crate::error::UploadError;
use crate::events::{DraftEvent, EventBus};
use crate::model::ProjectId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStage {
    Idle,
    Validating,
    Compressing,
    Uploading,
    PersistingReference,
    CaptionPending,
    Done,
    Failed,
}

impl UploadStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Validating => "validating",
            Self::Compressing => "compressing",
            Self::Uploading => "uploading",
            Self::PersistingReference => "persisting reference",
            Self::CaptionPending => "captioning",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for UploadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn allowed_transitions(from: UploadStage) -> &'static [UploadStage] {
    use UploadStage::*;
    match from {
        Idle => &[Validating, Failed],
        Validating => &[Compressing, Failed],
        Compressing => &[Uploading, Failed],
        Uploading => &[PersistingReference, Failed],
        PersistingReference => &[CaptionPending, Failed],
        CaptionPending => &[Done, Failed],
        Done | Failed => &[],
    }
}

pub fn validate_transition(from: UploadStage, to: UploadStage) -> Result<(), UploadError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(UploadError::IllegalTransition { from, to })
    }
}

/// One run of the pipeline for one source image. Every transition is
/// broadcast as an `ImageReplaced` event.
pub(crate) struct UploadRun {
    project: ProjectId,
    original_src: SmolStr,
    stage: UploadStage,
    events: EventBus,
}

impl UploadRun {
    pub(crate) fn new(project: ProjectId, original_src: SmolStr, events: EventBus) -> Self {
        Self {
            project,
            original_src,
            stage: UploadStage::Idle,
            events,
        }
    }

    #[cfg(test)]
    pub(crate) fn stage(&self) -> UploadStage {
        self.stage
    }

    pub(crate) fn advance(
        &mut self,
        to: UploadStage,
        new_src: Option<&str>,
    ) -> Result<(), UploadError> {
        validate_transition(self.stage, to)?;
        debug!(src = %self.original_src, from = %self.stage, to = %to, "image pipeline transition");
        self.stage = to;
        self.emit(new_src, None);
        Ok(())
    }

    /// Move to `Failed`, returning the stage the run failed in.
    pub(crate) fn fail(&mut self, reason: &str) -> UploadStage {
        let failed_in = self.stage;
        if !failed_in.is_terminal() {
            self.stage = UploadStage::Failed;
            self.emit(None, Some(reason));
        }
        failed_in
    }

    fn emit(&self, new_src: Option<&str>, error: Option<&str>) {
        self.events.emit(DraftEvent::ImageReplaced {
            project_id: self.project.clone(),
            original_src: self.original_src.clone(),
            new_src: new_src.map(str::to_owned),
            stage: self.stage,
            error: error.map(str::to_owned),
            timestamp: Utc::now(),
        });
    }
}

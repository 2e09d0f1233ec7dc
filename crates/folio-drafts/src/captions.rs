//! Batch caption enhancement for image blocks.
//!
//! Requests go to the caption service one at a time with a fixed pause in
//! between. Two batches started concurrently queue behind each other rather
//! than interleave.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use folio_common::CaptionConfig;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::error::CaptionError;
use crate::model::ContentBlock;
use crate::store::{CaptionContext, CaptionService};

/// Captions that say nothing about the image.
const PLACEHOLDER_CAPTIONS: &[&str] = &[
    "image",
    "img",
    "photo",
    "picture",
    "screenshot",
    "untitled",
    "caption",
    "add a caption",
    "placeholder",
    "project image",
];

/// Whether a caption is missing, a placeholder, or too short to be useful.
pub fn needs_caption(caption: Option<&str>, min_len: usize) -> bool {
    let Some(caption) = caption.map(str::trim) else {
        return true;
    };
    if caption.is_empty() || caption.chars().count() < min_len {
        return true;
    }
    let normalized = caption.to_lowercase();
    PLACEHOLDER_CAPTIONS
        .iter()
        .any(|p| normalized == *p)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptionCandidate {
    pub index: usize,
    pub src: String,
}

pub fn find_candidates(blocks: &[ContentBlock], min_len: usize) -> Vec<CaptionCandidate> {
    blocks
        .iter()
        .enumerate()
        .filter_map(|(index, block)| {
            let src = block.image_src()?;
            needs_caption(block.caption(), min_len).then(|| CaptionCandidate {
                index,
                src: src.to_string(),
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptionFailure {
    pub index: usize,
    pub src: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub current_image: Option<String>,
    pub errors: Vec<CaptionFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptionUpdate {
    pub index: usize,
    pub src: String,
    pub caption: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub progress: BatchProgress,
    pub updates: Vec<CaptionUpdate>,
}

impl BatchReport {
    /// Write the generated captions into `blocks`. An update is skipped if its
    /// block no longer shows the image it was generated for.
    pub fn apply_to(&self, blocks: &mut [ContentBlock]) -> usize {
        let mut applied = 0;
        for update in &self.updates {
            if let Some(ContentBlock::Image { src, caption }) = blocks.get_mut(update.index) {
                if *src == update.src {
                    *caption = Some(update.caption.clone());
                    applied += 1;
                }
            }
        }
        applied
    }
}

pub struct CaptionBatchProcessor<C> {
    service: Arc<C>,
    config: CaptionConfig,
    enhanced: Mutex<HashSet<String>>,
    serial: AsyncMutex<()>,
}

impl<C: CaptionService> CaptionBatchProcessor<C> {
    pub fn new(service: Arc<C>, config: CaptionConfig) -> Self {
        Self {
            service,
            config,
            enhanced: Mutex::new(HashSet::new()),
            serial: AsyncMutex::new(()),
        }
    }

    fn already_enhanced(&self, src: &str) -> bool {
        self.enhanced
            .lock()
            .map(|set| set.contains(src))
            .unwrap_or_else(|poisoned| poisoned.into_inner().contains(src))
    }

    fn mark_enhanced(&self, src: &str) {
        self.enhanced
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(src.to_string());
    }

    /// Enhance every image block that needs a caption and was not enhanced before.
    pub async fn enhance(
        &self,
        blocks: &[ContentBlock],
        on_progress: impl FnMut(&BatchProgress),
    ) -> BatchReport {
        let candidates: Vec<_> = find_candidates(blocks, self.config.min_caption_len)
            .into_iter()
            .filter(|c| !self.already_enhanced(&c.src))
            .collect();
        self.run(candidates, on_progress).await
    }

    /// Resubmit the failures of an earlier report.
    pub async fn retry_failed(
        &self,
        failures: &[CaptionFailure],
        on_progress: impl FnMut(&BatchProgress),
    ) -> BatchReport {
        let candidates = failures
            .iter()
            .map(|f| CaptionCandidate {
                index: f.index,
                src: f.src.clone(),
            })
            .collect();
        self.run(candidates, on_progress).await
    }

    async fn run(
        &self,
        candidates: Vec<CaptionCandidate>,
        mut on_progress: impl FnMut(&BatchProgress),
    ) -> BatchReport {
        let _serial = self.serial.lock().await;
        let mut report = BatchReport {
            progress: BatchProgress {
                total: candidates.len(),
                ..Default::default()
            },
            updates: Vec::new(),
        };
        if candidates.is_empty() {
            debug!("no captions to enhance");
            return report;
        }

        for (i, candidate) in candidates.into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.delay()).await;
            }
            report.progress.current_image = Some(candidate.src.clone());
            match self.request(&candidate.src).await {
                Ok(caption) => {
                    self.mark_enhanced(&candidate.src);
                    report.progress.completed += 1;
                    report.updates.push(CaptionUpdate {
                        index: candidate.index,
                        src: candidate.src,
                        caption,
                    });
                }
                Err(e) => {
                    warn!(src = %candidate.src, error = %e, "caption enhancement failed");
                    report.progress.failed += 1;
                    report.progress.errors.push(CaptionFailure {
                        index: candidate.index,
                        src: candidate.src,
                        error: e.to_string(),
                    });
                }
            }
            on_progress(&report.progress);
        }
        report.progress.current_image = None;
        info!(
            total = report.progress.total,
            completed = report.progress.completed,
            failed = report.progress.failed,
            "caption batch finished"
        );
        report
    }

    async fn request(&self, src: &str) -> Result<String, CaptionError> {
        let attempts = self.config.attempts.max(1);
        let mut last = CaptionError::Empty;
        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(self.config.delay()).await;
            }
            match self
                .service
                .generate_caption(src, CaptionContext::ContentBlock)
                .await
            {
                Ok(caption) if !caption.trim().is_empty() => {
                    metrics::counter!("folio_captions_total", "outcome" => "enhanced").increment(1);
                    return Ok(caption.trim().to_string());
                }
                Ok(_) => last = CaptionError::Empty,
                Err(e) => last = e,
            }
            debug!(src, attempt, error = %last, "caption attempt failed");
        }
        metrics::counter!("folio_captions_total", "outcome" => "failed").increment(1);
        Err(last)
    }
}

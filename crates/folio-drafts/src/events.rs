//! Cross-component change signals.
//!
//! Every component of a project shares one [`EventBus`]. A field editor whose
//! key is written elsewhere, or a block manager whose section is changed by a
//! sibling, learns about it here and reconciles.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use smol_str::SmolStr;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::image::UploadStage;
use crate::model::{ContentBlock, ProjectId, PublishedSnapshot};

/// Identity of one editing component, used to drop its own echoes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EditorId(u64);

impl EditorId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone)]
pub enum DraftEvent {
    DraftTextChanged {
        project_id: ProjectId,
        key: SmolStr,
        value: String,
        origin: Option<EditorId>,
        timestamp: DateTime<Utc>,
    },
    ContentBlocksChanged {
        project_id: ProjectId,
        section_key: SmolStr,
        blocks: Arc<[ContentBlock]>,
        origin: Option<EditorId>,
        timestamp: DateTime<Utc>,
    },
    /// One image pipeline stage transition. `error` is set on `Failed`.
    ImageReplaced {
        project_id: ProjectId,
        original_src: SmolStr,
        new_src: Option<String>,
        stage: UploadStage,
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
    Published {
        project_id: ProjectId,
        snapshot: Arc<PublishedSnapshot>,
        timestamp: DateTime<Utc>,
    },
    DraftsCleared {
        project_id: ProjectId,
        timestamp: DateTime<Utc>,
    },
    CaptionGenerated {
        project_id: ProjectId,
        original_src: SmolStr,
        caption: String,
        timestamp: DateTime<Utc>,
    },
}

impl DraftEvent {
    /// Stable wire name of the signal.
    pub fn name(&self) -> &'static str {
        match self {
            Self::DraftTextChanged { .. } => "draftTextChanged",
            Self::ContentBlocksChanged { .. } => "contentBlocksChanged",
            Self::ImageReplaced { .. } => "imageReplaced",
            Self::Published { .. } => "published",
            Self::DraftsCleared { .. } => "draftsCleared",
            Self::CaptionGenerated { .. } => "captionGenerated",
        }
    }

    pub fn project_id(&self) -> &ProjectId {
        match self {
            Self::DraftTextChanged { project_id, .. }
            | Self::ContentBlocksChanged { project_id, .. }
            | Self::ImageReplaced { project_id, .. }
            | Self::Published { project_id, .. }
            | Self::DraftsCleared { project_id, .. }
            | Self::CaptionGenerated { project_id, .. } => project_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::DraftTextChanged { timestamp, .. }
            | Self::ContentBlocksChanged { timestamp, .. }
            | Self::ImageReplaced { timestamp, .. }
            | Self::Published { timestamp, .. }
            | Self::DraftsCleared { timestamp, .. }
            | Self::CaptionGenerated { timestamp, .. } => *timestamp,
        }
    }
}

/// Broadcast bus for [`DraftEvent`]s. Cloning shares the channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DraftEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn emit(&self, event: DraftEvent) {
        trace!(event = event.name(), project = %event.project_id(), "emitting draft event");
        // no subscribers is fine
        let _ = self.sender.send(event);
    }

    /// Subscribe to events of one project.
    pub fn subscribe(&self, project: ProjectId) -> EventSubscription {
        EventSubscription {
            project,
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// What a subscriber receives.
#[derive(Debug, Clone)]
pub enum Signal {
    Event(DraftEvent),
    /// The subscriber fell behind and this many events were dropped. Anything
    /// it derived from events must be re-read from the stores.
    Missed(u64),
}

pub struct EventSubscription {
    project: ProjectId,
    receiver: broadcast::Receiver<DraftEvent>,
}

impl EventSubscription {
    /// Next event or missed-events marker for this project, or `None` once
    /// the bus is gone.
    pub async fn next_signal(&mut self) -> Option<Signal> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.project_id() == &self.project => return Some(Signal::Event(event)),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, project = %self.project, "event subscriber lagged");
                    return Some(Signal::Missed(skipped));
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!(project = %self.project, "event bus closed");
                    return None;
                }
            }
        }
    }

    /// Next event for this project, or `None` once the bus is gone.
    ///
    /// Silently skips over missed events; subscribers that keep state use
    /// [`next_signal`](Self::next_signal) instead.
    pub async fn recv(&mut self) -> Option<DraftEvent> {
        loop {
            if let Signal::Event(event) = self.next_signal().await? {
                return Some(event);
            }
        }
    }
}

//! Draft records, content blocks and the published snapshot.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::error::ValidationError;

/// Identifier of one portfolio project. Every draft is scoped by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(SmolStr);

impl ProjectId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(SmolStr::new(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Filesystem-safe form of the id, used by the file backend.
    pub fn file_stem(&self) -> String {
        self.0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for ProjectId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// What a change record holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Text,
    Image,
    ContentBlock,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::ContentBlock => "content_block",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The payload of a change. The record's kind is derived from the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ChangeValue {
    Text(String),
    /// Stored URL that replaces the original image reference.
    Image(String),
    /// A whole block sequence for one section.
    ContentBlock(Vec<ContentBlock>),
}

impl ChangeValue {
    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Text(_) => ChangeKind::Text,
            Self::Image(_) => ChangeKind::Image,
            Self::ContentBlock(_) => ChangeKind::ContentBlock,
        }
    }
}

/// One persisted draft edit.
///
/// At most one record is current per `(project_id, kind, key)`; stores
/// upsert on that triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub project_id: ProjectId,
    pub key: SmolStr,
    #[serde(flatten)]
    pub value: ChangeValue,
    pub updated_at: DateTime<Utc>,
}

impl ChangeRecord {
    pub fn new(project_id: ProjectId, key: impl Into<SmolStr>, value: ChangeValue) -> Self {
        Self {
            project_id,
            key: key.into(),
            value,
            updated_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> ChangeKind {
        self.value.kind()
    }

    /// `kind:key`, e.g. `content_block:intro` or `image:/img/hero.png`.
    pub fn storage_key(&self) -> String {
        format!("{}:{}", self.kind(), self.key)
    }
}

/// Key under which a generated caption for `original_src` is kept as a text draft.
pub fn caption_key(original_src: &str) -> SmolStr {
    SmolStr::new(format!("caption:{original_src}"))
}

fn default_level() -> u8 {
    2
}

/// One unit of ordered content inside a section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ContentBlock {
    Text {
        value: String,
    },
    Header {
        value: String,
        #[serde(default = "default_level")]
        level: u8,
    },
    Image {
        src: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    Video {
        embed_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    Pdf {
        src: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
}

impl ContentBlock {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text {
            value: value.into(),
        }
    }

    pub fn header(value: impl Into<String>, level: u8) -> Self {
        Self::Header {
            value: value.into(),
            level: level.clamp(1, 6),
        }
    }

    pub fn image(src: impl Into<String>, caption: Option<String>) -> Self {
        Self::Image {
            src: src.into(),
            caption,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Header { .. } => "header",
            Self::Image { .. } => "image",
            Self::Video { .. } => "video",
            Self::Pdf { .. } => "pdf",
        }
    }

    pub fn caption(&self) -> Option<&str> {
        match self {
            Self::Image { caption, .. } | Self::Video { caption, .. } | Self::Pdf { caption, .. } => {
                caption.as_deref()
            }
            _ => None,
        }
    }

    /// Source of an image block, `None` for every other kind.
    pub fn image_src(&self) -> Option<&str> {
        match self {
            Self::Image { src, .. } => Some(src),
            _ => None,
        }
    }

    /// Apply a single-field change. Fails without touching the block if the
    /// field does not exist on this kind.
    pub fn apply(&mut self, patch: BlockPatch) -> Result<(), ValidationError> {
        let block_type = self.type_name();
        let field = patch.field();
        match (self, patch) {
            (Self::Text { value } | Self::Header { value, .. }, BlockPatch::Value(v)) => {
                *value = v;
            }
            (Self::Header { level, .. }, BlockPatch::Level(l)) => {
                *level = l.clamp(1, 6);
            }
            (Self::Image { src, .. } | Self::Pdf { src, .. }, BlockPatch::Src(s)) => {
                *src = s;
            }
            (Self::Video { embed_url, .. }, BlockPatch::EmbedUrl(u)) => {
                *embed_url = u;
            }
            (
                Self::Image { caption, .. } | Self::Video { caption, .. } | Self::Pdf { caption, .. },
                BlockPatch::Caption(c),
            ) => {
                *caption = c;
            }
            _ => return Err(ValidationError::FieldNotApplicable { field, block_type }),
        }
        Ok(())
    }
}

/// A per-field setter for [`ContentBlock::apply`].
#[derive(Debug, Clone, PartialEq)]
pub enum BlockPatch {
    Value(String),
    Src(String),
    Caption(Option<String>),
    EmbedUrl(String),
    Level(u8),
}

impl BlockPatch {
    pub fn field(&self) -> &'static str {
        match self {
            Self::Value(_) => "value",
            Self::Src(_) => "src",
            Self::Caption(_) => "caption",
            Self::EmbedUrl(_) => "embedUrl",
            Self::Level(_) => "level",
        }
    }
}

/// Every current draft of a project, grouped by kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftChanges {
    #[serde(default)]
    pub text_content: BTreeMap<SmolStr, String>,
    #[serde(default)]
    pub content_blocks: BTreeMap<SmolStr, Vec<ContentBlock>>,
    #[serde(default)]
    pub images: BTreeMap<SmolStr, String>,
}

impl DraftChanges {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a ChangeRecord>) -> Self {
        let mut changes = Self::default();
        for record in records {
            changes.upsert(record);
        }
        changes
    }

    pub fn upsert(&mut self, record: &ChangeRecord) {
        match &record.value {
            ChangeValue::Text(v) => {
                self.text_content.insert(record.key.clone(), v.clone());
            }
            ChangeValue::Image(v) => {
                self.images.insert(record.key.clone(), v.clone());
            }
            ChangeValue::ContentBlock(v) => {
                self.content_blocks.insert(record.key.clone(), v.clone());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.text_content.len() + self.content_blocks.len() + self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The last explicitly published version of a project's content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishedSnapshot {
    #[serde(default, alias = "textContent")]
    pub text_content: BTreeMap<SmolStr, String>,
    #[serde(default, alias = "contentBlocks")]
    pub content_blocks: BTreeMap<SmolStr, Vec<ContentBlock>>,
    #[serde(default)]
    pub images: BTreeMap<SmolStr, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

impl PublishedSnapshot {
    /// This snapshot with every draft laid over it. Block sequences are
    /// replaced per section, never merged.
    pub fn overlay(&self, drafts: &DraftChanges) -> PublishedSnapshot {
        let mut next = self.clone();
        next.text_content.extend(
            drafts
                .text_content
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        next.images
            .extend(drafts.images.iter().map(|(k, v)| (k.clone(), v.clone())));
        next.content_blocks.extend(
            drafts
                .content_blocks
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        next.published_at = Some(Utc::now());
        next
    }
}

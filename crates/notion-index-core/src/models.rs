//! Core data models used throughout notion-index.
//!
//! These types represent the source nodes, chunks, vector records and sync
//! checkpoints that flow through the sync and retrieval pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The structural variant of a [`SourceNode`], with its text payload.
///
/// This is a closed set: adding a block type means adding a variant here
/// and one arm in [`crate::normalize`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// A page. Pages are the unit of synchronization.
    Page { title: String },
    /// A database. Traversed for its pages, carries no text of its own.
    Database { title: String },
    Heading { level: u8, text: String },
    Paragraph { text: String },
    BulletedListItem { text: String },
    NumberedListItem { text: String },
    ToDo { text: String, checked: bool },
    Toggle { text: String },
    Quote { text: String },
    Callout { text: String },
    Code { language: String, text: String },
    Divider,
    Table,
    TableRow { cells: Vec<String> },
    /// Embeds, media, and anything else without extractable text.
    Unsupported { block_type: String },
}

impl NodeKind {
    /// Containers hold other documents rather than content.
    pub fn is_container(&self) -> bool {
        matches!(self, Self::Page { .. } | Self::Database { .. })
    }

    /// Documents are the nodes tracked in the checkpoint and chunked.
    pub fn is_document(&self) -> bool {
        matches!(self, Self::Page { .. })
    }

    pub fn title(&self) -> Option<&str> {
        match self {
            Self::Page { title } | Self::Database { title } => Some(title.as_str()),
            _ => None,
        }
    }

    /// Stable label for logs and segment tagging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Page { .. } => "page",
            Self::Database { .. } => "database",
            Self::Heading { .. } => "heading",
            Self::Paragraph { .. } => "paragraph",
            Self::BulletedListItem { .. } => "bulleted_list_item",
            Self::NumberedListItem { .. } => "numbered_list_item",
            Self::ToDo { .. } => "to_do",
            Self::Toggle { .. } => "toggle",
            Self::Quote { .. } => "quote",
            Self::Callout { .. } => "callout",
            Self::Code { .. } => "code",
            Self::Divider => "divider",
            Self::Table => "table",
            Self::TableRow { .. } => "table_row",
            Self::Unsupported { .. } => "unsupported",
        }
    }
}

/// A node in the remote document tree. Owned by the source; read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceNode {
    pub node_id: String,
    pub parent_id: Option<String>,
    pub kind: NodeKind,
    pub has_children: bool,
    pub last_edited_at: DateTime<Utc>,
    #[serde(default)]
    pub url: Option<String>,
}

impl SourceNode {
    pub fn title(&self) -> Option<&str> {
        self.kind.title().filter(|t| !t.is_empty())
    }
}

/// One normalized line (or fenced block) of document text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Source node the text came from.
    pub node_id: String,
    /// Structural tag, see [`NodeKind::label`].
    pub kind: &'static str,
    /// Nesting depth below the owning document.
    pub depth: usize,
    pub text: String,
}

/// A document's content after traversal and normalization.
#[derive(Debug, Clone)]
pub struct NormalizedDocument {
    pub node: SourceNode,
    pub segments: Vec<Segment>,
    /// Number of child nodes skipped as non-text.
    pub skipped: usize,
}

impl NormalizedDocument {
    /// Join segments into the text handed to the chunker.
    pub fn text(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// The atomic retrievable unit, derived from one document node.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// `"{node_id}#{sequence_index}"`.
    pub chunk_id: String,
    pub source_node_id: String,
    pub sequence_index: u32,
    /// Full chunk text, leading overlap included.
    pub text: String,
    /// Number of leading chars repeated from the previous chunk.
    pub overlap: usize,
    /// SHA-256 of `text`, hex encoded.
    pub content_hash: String,
    pub source_last_edited_at: DateTime<Utc>,
    pub title: Option<String>,
    pub url: Option<String>,
}

impl Chunk {
    pub fn chunk_id_for(node_id: &str, sequence_index: u32) -> String {
        format!("{}#{}", node_id, sequence_index)
    }

    /// The chunk text without the overlap carried from its predecessor.
    pub fn body(&self) -> &str {
        match self.text.char_indices().nth(self.overlap) {
            Some((i, _)) => &self.text[i..],
            None => "",
        }
    }
}

/// Metadata persisted alongside each vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub source_node_id: String,
    pub source_last_edited_at: DateTime<Utc>,
    pub sequence_index: u32,
    pub content_hash: String,
    pub title: Option<String>,
    pub url: Option<String>,
}

/// A chunk's identity and text paired with its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub chunk_id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub metadata: RecordMetadata,
}

impl VectorRecord {
    pub fn from_chunk(chunk: &Chunk, embedding: Vec<f32>) -> Self {
        Self {
            chunk_id: chunk.chunk_id.clone(),
            text: chunk.text.clone(),
            embedding,
            metadata: RecordMetadata {
                source_node_id: chunk.source_node_id.clone(),
                source_last_edited_at: chunk.source_last_edited_at,
                sequence_index: chunk.sequence_index,
                content_hash: chunk.content_hash.clone(),
                title: chunk.title.clone(),
                url: chunk.url.clone(),
            },
        }
    }
}

/// Durable record of the last fully applied sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub resource_root_id: String,
    pub last_sync_started_at: DateTime<Utc>,
    pub last_sync_completed_at: DateTime<Utc>,
    /// node_id -> last_edited_at observed when the node was last applied.
    pub node_version_map: BTreeMap<String, DateTime<Utc>>,
    /// page id -> pages and databases found anywhere in its content when it
    /// was last walked. Lets an unchanged page skip listing its blocks.
    #[serde(default)]
    pub child_containers: BTreeMap<String, Vec<String>>,
}

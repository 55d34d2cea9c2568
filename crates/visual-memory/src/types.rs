//! Core data types for visual memories, their history, and classification outcomes.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::diff::DescriptionChange;

/// Stable identifier of a memory. Assigned at creation, never reused.
pub type MemoryId = Uuid;

/// Opaque caller-supplied payload stored alongside a memory.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// SHA-256 digest of the raw image bytes, lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 64-bit perceptual hash. Closeness is measured by Hamming distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PerceptualHash(pub u64);

impl PerceptualHash {
    /// Number of differing bits between two hashes.
    pub fn distance(self, other: PerceptualHash) -> u32 {
        (self.0 ^ other.0).count_ones()
    }
}

impl fmt::Display for PerceptualHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// The pair of identities derived from one image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub content_hash: ContentHash,
    pub perceptual_hash: PerceptualHash,
    pub width: u32,
    pub height: u32,
}

/// Structured semantic content supplied by a description extractor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Description {
    pub text: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Extra structured fields (content type, key points, ...). Keys starting
    /// with `_` are bookkeeping and excluded from diffs.
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl Description {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

/// Current state of one tracked visual subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    pub id: MemoryId,
    /// Content hash of the image that created this memory.
    pub content_hash: ContentHash,
    pub perceptual_hash: PerceptualHash,
    pub description: Description,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Immutable snapshot of a memory taken just before an update overwrote it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryVersion {
    pub memory_id: MemoryId,
    pub version: u32,
    pub description: Description,
    pub perceptual_hash: PerceptualHash,
    pub recorded_at: DateTime<Utc>,
    /// Changes that superseded this snapshot.
    #[serde(default)]
    pub changes: Vec<DescriptionChange>,
}

impl MemoryVersion {
    pub(crate) fn snapshot(memory: &Memory, changes: Vec<DescriptionChange>, now: DateTime<Utc>) -> Self {
        Self {
            memory_id: memory.id,
            version: memory.version,
            description: memory.description.clone(),
            perceptual_hash: memory.perceptual_hash,
            recorded_at: now,
            changes,
        }
    }
}

/// Fast-path dedup entry: a content hash known to belong to a memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub content_hash: ContentHash,
    pub memory_id: MemoryId,
}

/// A memory within the similarity band of a query hash.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub memory: Memory,
    pub distance: u32,
}

/// Classification of one processed image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Created,
    Unchanged,
    Updated,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Created => "created",
            Status::Unchanged => "unchanged",
            Status::Updated => "updated",
        };
        f.write_str(s)
    }
}

/// Result of processing one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub status: Status,
    pub memory_id: MemoryId,
    pub version: u32,
    pub description: Description,
    /// Hamming distance to the matched memory, when one was matched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<u32>,
}

impl Outcome {
    pub(crate) fn from_memory(status: Status, memory: &Memory, distance: Option<u32>) -> Self {
        Self {
            status,
            memory_id: memory.id,
            version: memory.version,
            description: memory.description.clone(),
            distance,
        }
    }
}

/// Semantic comparison verdict between two descriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Same,
    Different,
}

/// Failures of the external description extractor.
#[derive(thiserror::Error, Debug)]
pub enum ExtractionError {
    #[error("extractor unavailable: {0}")]
    Unavailable(String),

    #[error("malformed extractor output: {0}")]
    Malformed(String),

    #[error("extractor timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors that can occur in the memory engine.
#[derive(thiserror::Error, Debug)]
pub enum MemoryError {
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Duplicate content: {0}")]
    DuplicateContent(ContentHash),

    #[error("Memory not found: {0}")]
    NotFound(MemoryId),

    /// The memory moved past the version an update was decided against.
    #[error("Memory {id} is at version {found}, expected {expected}")]
    VersionConflict {
        id: MemoryId,
        expected: u32,
        found: u32,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience result type.
pub type MemoryResult<T> = Result<T, MemoryError>;

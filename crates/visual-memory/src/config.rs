//! Configuration loading and resolution.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::MemoryResult;

/// Default Hamming distance within which two images may show the same subject.
pub const DEFAULT_SIMILARITY_THRESHOLD: u32 = 4;

/// Default bound on a single extractor call.
pub const DEFAULT_EXTRACT_TIMEOUT_MS: u64 = 60_000;

/// How near-duplicate candidates are consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CandidatePolicy {
    /// Compare only against the single closest candidate.
    #[default]
    Nearest,
    /// Compare against up to `max_candidates` in rank order; the first one
    /// judged the same wins, otherwise the closest one is updated.
    Vote { max_candidates: usize },
}

/// Engine tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub similarity_threshold: u32,
    pub extract_timeout_ms: Option<u64>,
    pub candidate_policy: CandidatePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            extract_timeout_ms: Some(DEFAULT_EXTRACT_TIMEOUT_MS),
            candidate_policy: CandidatePolicy::Nearest,
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> MemoryResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn extract_timeout(&self) -> Option<Duration> {
        self.extract_timeout_ms.map(Duration::from_millis)
    }
}

/// Which backend a store persists to. Chosen by the host at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StoreConfig {
    InMemory,
    File { path: PathBuf },
}

/// Environment variable naming the memory file, or `:memory:` for the
/// in-memory backend.
pub const STORE_ENV: &str = "VMEM_FILE";

const IN_MEMORY_SENTINEL: &str = ":memory:";

impl StoreConfig {
    /// Pick the backend for a host: an explicit path, then `VMEM_FILE`, then
    /// the default file location.
    pub fn resolve(explicit: Option<&Path>) -> Self {
        if explicit.is_none() && env_store().as_deref() == Some(IN_MEMORY_SENTINEL) {
            return StoreConfig::InMemory;
        }
        StoreConfig::File {
            path: resolve_store_path(explicit),
        }
    }
}

/// Resolve the memory file path.
///
/// Order: explicit path, `VMEM_FILE`, `memories.vmem` in the working
/// directory if present, then `~/.visual-memory/memories.vmem`.
pub fn resolve_store_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }

    if let Some(env_path) = env_store().filter(|p| p != IN_MEMORY_SENTINEL) {
        return PathBuf::from(env_path);
    }

    let local = PathBuf::from("memories.vmem");
    if local.is_file() {
        return local;
    }

    home_dir().join(".visual-memory").join("memories.vmem")
}

/// `VMEM_FILE`, ignoring an empty value.
fn env_store() -> Option<String> {
    std::env::var(STORE_ENV).ok().filter(|v| !v.trim().is_empty())
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

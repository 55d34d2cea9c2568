//! Durable, indexed collection of memories and their version history.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::config::StoreConfig;
use crate::diff::diff_descriptions;
use crate::similarity::{rank_candidates, BandIndex};
use crate::storage::{StoreSnapshot, VmemReader, VmemWriter};
use crate::types::{
    CacheEntry, Candidate, ContentHash, Description, Memory, MemoryError, MemoryId, MemoryResult,
    MemoryVersion, Metadata, PerceptualHash,
};

/// Memory store with a unique content-hash index and a perceptual band index.
///
/// Reads share the lock and always observe a fully committed state. Writers
/// are ordered by a separate mutex: each one plans its change against a read
/// view, persists it, and only then takes the state lock briefly to publish.
/// A failed write leaves nothing behind, and reads never wait on disk I/O.
pub struct MemoryStore {
    state: RwLock<StoreState>,
    writer: Mutex<()>,
    backend: StoreConfig,
}

#[derive(Debug)]
struct StoreState {
    memories: HashMap<MemoryId, Memory>,
    versions: HashMap<MemoryId, Vec<MemoryVersion>>,
    cache: HashMap<ContentHash, MemoryId>,
    perceptual: BandIndex,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// A validated write, planned against a read view and published after it
/// has been persisted. `claim` is a content hash not yet in the cache.
enum Change {
    Insert {
        memory: Memory,
        claim: Option<ContentHash>,
    },
    Update {
        memory: Memory,
        row: MemoryVersion,
        previous_hash: PerceptualHash,
        claim: Option<ContentHash>,
    },
    Touch {
        memory: Memory,
        claim: Option<ContentHash>,
    },
    Remove {
        memory: Memory,
    },
}

impl MemoryStore {
    /// Open the store for the given backend. A missing file starts empty and
    /// is created on the first write.
    pub fn open(backend: StoreConfig) -> MemoryResult<Self> {
        let state = match &backend {
            StoreConfig::InMemory => StoreState::from_snapshot(StoreSnapshot::empty())?,
            StoreConfig::File { path } if path.exists() => {
                tracing::info!("Opening existing memory file: {}", path.display());
                StoreState::from_snapshot(VmemReader::read_from_file(path)?)?
            }
            StoreConfig::File { path } => {
                tracing::info!("Creating new memory file: {}", path.display());
                StoreState::from_snapshot(StoreSnapshot::empty())?
            }
        };

        tracing::info!(
            "Memory store ready with {} memories and {} history rows",
            state.memories.len(),
            state.versions.values().map(Vec::len).sum::<usize>()
        );

        Ok(Self {
            state: RwLock::new(state),
            writer: Mutex::new(()),
            backend,
        })
    }

    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(StoreState::empty()),
            writer: Mutex::new(()),
            backend: StoreConfig::InMemory,
        }
    }

    pub fn backend(&self) -> &StoreConfig {
        &self.backend
    }

    /// Exact dedup lookup through the content-hash cache.
    pub async fn find_by_content_hash(&self, hash: &ContentHash) -> Option<Memory> {
        let state = self.state.read().await;
        let found = state
            .cache
            .get(hash)
            .and_then(|id| state.memories.get(id))
            .cloned();
        tracing::debug!("Content lookup {hash}: {}", if found.is_some() { "hit" } else { "miss" });
        found
    }

    /// Every memory within `max_distance` of `hash`, closest first, ties
    /// broken by the most recent `updated_at`.
    pub async fn find_near(&self, hash: PerceptualHash, max_distance: u32) -> Vec<Candidate> {
        let state = self.state.read().await;
        match state.perceptual.probe(hash, max_distance) {
            Some(ids) => rank_candidates(
                hash,
                ids.iter().filter_map(|id| state.memories.get(id)),
                max_distance,
            ),
            None => {
                tracing::debug!("Distance {max_distance} exceeds band guarantee, scanning");
                rank_candidates(hash, state.memories.values(), max_distance)
            }
        }
    }

    /// Create a memory at version 1.
    pub async fn insert(
        &self,
        content_hash: ContentHash,
        perceptual_hash: PerceptualHash,
        description: Description,
        metadata: Metadata,
    ) -> MemoryResult<Memory> {
        self.commit(move |state, now| {
            let id = uuid::Uuid::new_v4();
            let claim = state.check_claim(&content_hash, id)?;
            let memory = Memory {
                id,
                content_hash,
                perceptual_hash,
                description,
                version: 1,
                created_at: now,
                updated_at: now,
                metadata,
            };
            Ok(Change::Insert { memory, claim })
        })
        .await
    }

    /// Snapshot the current state into history, then overwrite it with the
    /// new hash and description at the next version.
    ///
    /// `expected_version` is the version the caller decided against. If the
    /// memory has moved on since, nothing is written and
    /// [`MemoryError::VersionConflict`] is returned. `source` is the content
    /// hash of the image that triggered the update; it becomes a cache entry
    /// for this memory.
    pub async fn apply_update(
        &self,
        memory_id: MemoryId,
        expected_version: u32,
        source: &ContentHash,
        perceptual_hash: PerceptualHash,
        description: Description,
    ) -> MemoryResult<Memory> {
        self.commit(move |state, now| {
            let previous = state
                .memories
                .get(&memory_id)
                .ok_or(MemoryError::NotFound(memory_id))?;
            if previous.version != expected_version {
                return Err(MemoryError::VersionConflict {
                    id: memory_id,
                    expected: expected_version,
                    found: previous.version,
                });
            }
            let claim = state.check_claim(source, memory_id)?;

            let changes = diff_descriptions(&previous.description, &description);
            let row = MemoryVersion::snapshot(previous, changes, now);

            let mut updated = previous.clone();
            updated.version += 1;
            updated.perceptual_hash = perceptual_hash;
            updated.description = description;
            updated.updated_at = now.max(updated.updated_at);
            Ok(Change::Update {
                memory: updated,
                row,
                previous_hash: previous.perceptual_hash,
                claim,
            })
        })
        .await
    }

    /// Refresh `updated_at` only. No version bump, no history row.
    ///
    /// When `seen` is given, that content hash is cached for this memory so
    /// the same bytes take the exact-match path next time.
    pub async fn touch_unchanged(
        &self,
        memory_id: MemoryId,
        seen: Option<&ContentHash>,
    ) -> MemoryResult<Memory> {
        self.commit(move |state, now| {
            let mut memory = state
                .memories
                .get(&memory_id)
                .cloned()
                .ok_or(MemoryError::NotFound(memory_id))?;
            let claim = match seen {
                Some(hash) => state.check_claim(hash, memory_id)?,
                None => None,
            };
            memory.updated_at = now.max(memory.updated_at);
            Ok(Change::Touch { memory, claim })
        })
        .await
    }

    /// Delete a memory with its history and cache entries. Administrative
    /// only; classification never removes memories.
    pub async fn remove(&self, memory_id: MemoryId) -> MemoryResult<Memory> {
        let memory = self
            .commit(move |state, _now| {
                let memory = state
                    .memories
                    .get(&memory_id)
                    .cloned()
                    .ok_or(MemoryError::NotFound(memory_id))?;
                Ok(Change::Remove { memory })
            })
            .await?;
        tracing::info!("Removed memory {memory_id}");
        Ok(memory)
    }

    pub async fn get(&self, memory_id: MemoryId) -> Option<Memory> {
        self.state.read().await.memories.get(&memory_id).cloned()
    }

    /// History rows for a memory, oldest version first.
    pub async fn history(&self, memory_id: MemoryId) -> MemoryResult<Vec<MemoryVersion>> {
        let state = self.state.read().await;
        if !state.memories.contains_key(&memory_id) {
            return Err(MemoryError::NotFound(memory_id));
        }
        Ok(state.versions.get(&memory_id).cloned().unwrap_or_default())
    }

    /// Most recently updated memories first.
    pub async fn recent(&self, limit: usize) -> Vec<Memory> {
        let state = self.state.read().await;
        let mut sorted: Vec<&Memory> = state.memories.values().collect();
        sorted.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sorted.into_iter().take(limit).cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.memories.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of content hashes that resolve through the exact-match path.
    pub async fn cache_len(&self) -> usize {
        self.state.read().await.cache.len()
    }

    /// Order writers, plan the change, persist it, then publish.
    ///
    /// Only the writer mutex is held across the blocking file write. The
    /// state lock is shared while planning and exclusive only for `apply`.
    async fn commit<F>(&self, plan: F) -> MemoryResult<Memory>
    where
        F: FnOnce(&StoreState, DateTime<Utc>) -> MemoryResult<Change>,
    {
        let _writer = self.writer.lock().await;
        let now = Utc::now();

        let (change, pending) = {
            let state = self.state.read().await;
            let change = plan(&state, now)?;
            let pending = match &self.backend {
                StoreConfig::File { path } => Some((state.snapshot_with(&change, now), path.clone())),
                StoreConfig::InMemory => None,
            };
            (change, pending)
        };

        if let Some((snapshot, path)) = pending {
            persist(snapshot, path).await?;
        }

        Ok(self.state.write().await.apply(change, now))
    }
}

async fn persist(snapshot: StoreSnapshot, path: PathBuf) -> MemoryResult<()> {
    tokio::task::spawn_blocking(move || -> MemoryResult<()> {
        VmemWriter::write_to_file(&snapshot, &path)?;
        tracing::debug!("Saved memory file: {}", path.display());
        Ok(())
    })
    .await
    .map_err(|e| MemoryError::Internal(format!("Persist task failed: {e}")))?
}

impl StoreState {
    fn empty() -> Self {
        let now = Utc::now();
        Self {
            memories: HashMap::new(),
            versions: HashMap::new(),
            cache: HashMap::new(),
            perceptual: BandIndex::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Rebuild indexes from a persisted snapshot, rejecting inconsistent data.
    fn from_snapshot(snapshot: StoreSnapshot) -> MemoryResult<Self> {
        let mut state = Self::empty();
        state.created_at = snapshot.created_at;
        state.updated_at = snapshot.updated_at;

        for memory in snapshot.memories {
            if state.memories.contains_key(&memory.id) {
                return Err(MemoryError::Storage(format!("Duplicate memory id {}", memory.id)));
            }
            state.perceptual.insert(memory.id, memory.perceptual_hash);
            state.memories.insert(memory.id, memory);
        }

        for entry in snapshot.cache {
            if !state.memories.contains_key(&entry.memory_id) {
                return Err(MemoryError::Storage(format!(
                    "Cache entry {} references unknown memory {}",
                    entry.content_hash, entry.memory_id
                )));
            }
            state.claim(&entry.content_hash, entry.memory_id)?;
        }

        let ids: Vec<MemoryId> = state.memories.keys().copied().collect();
        for id in ids {
            let hash = state.memories[&id].content_hash.clone();
            if !state.cache.contains_key(&hash) {
                tracing::warn!("Restoring missing cache entry for memory {id}");
            }
            state.claim(&hash, id)?;
        }

        for row in snapshot.versions {
            if !state.memories.contains_key(&row.memory_id) {
                return Err(MemoryError::Storage(format!(
                    "History row references unknown memory {}",
                    row.memory_id
                )));
            }
            state.versions.entry(row.memory_id).or_default().push(row);
        }
        for rows in state.versions.values_mut() {
            rows.sort_by_key(|r| r.version);
        }

        Ok(state)
    }

    fn to_snapshot(&self) -> StoreSnapshot {
        let mut memories: Vec<Memory> = self.memories.values().cloned().collect();
        memories.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let mut versions: Vec<MemoryVersion> = self.versions.values().flatten().cloned().collect();
        versions.sort_by(|a, b| a.memory_id.cmp(&b.memory_id).then(a.version.cmp(&b.version)));

        let mut cache: Vec<CacheEntry> = self
            .cache
            .iter()
            .map(|(hash, id)| CacheEntry {
                content_hash: hash.clone(),
                memory_id: *id,
            })
            .collect();
        cache.sort_by(|a, b| a.content_hash.cmp(&b.content_hash));

        StoreSnapshot {
            memories,
            versions,
            cache,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// The snapshot this state would have after `change`, without touching it.
    fn snapshot_with(&self, change: &Change, now: DateTime<Utc>) -> StoreSnapshot {
        let mut snapshot = self.to_snapshot();
        snapshot.updated_at = now;

        match change {
            Change::Remove { memory } => {
                snapshot.memories.retain(|m| m.id != memory.id);
                snapshot.versions.retain(|v| v.memory_id != memory.id);
                snapshot.cache.retain(|e| e.memory_id != memory.id);
            }
            Change::Insert { memory, claim }
            | Change::Touch { memory, claim }
            | Change::Update { memory, claim, .. } => {
                match snapshot.memories.iter_mut().find(|m| m.id == memory.id) {
                    Some(slot) => *slot = memory.clone(),
                    None => snapshot.memories.push(memory.clone()),
                }
                if let Change::Update { row, .. } = change {
                    snapshot.versions.push(row.clone());
                }
                if let Some(hash) = claim {
                    snapshot.cache.push(CacheEntry {
                        content_hash: hash.clone(),
                        memory_id: memory.id,
                    });
                }
            }
        }
        snapshot
    }

    fn apply(&mut self, change: Change, now: DateTime<Utc>) -> Memory {
        self.updated_at = now;
        match change {
            Change::Insert { memory, claim } => {
                self.record(claim, memory.id);
                self.perceptual.insert(memory.id, memory.perceptual_hash);
                self.memories.insert(memory.id, memory.clone());
                memory
            }
            Change::Update {
                memory,
                row,
                previous_hash,
                claim,
            } => {
                self.record(claim, memory.id);
                self.versions.entry(memory.id).or_default().push(row);
                self.perceptual.remove(memory.id, previous_hash);
                self.perceptual.insert(memory.id, memory.perceptual_hash);
                self.memories.insert(memory.id, memory.clone());
                memory
            }
            Change::Touch { memory, claim } => {
                self.record(claim, memory.id);
                self.memories.insert(memory.id, memory.clone());
                memory
            }
            Change::Remove { memory } => {
                self.memories.remove(&memory.id);
                self.versions.remove(&memory.id);
                self.cache.retain(|_, id| *id != memory.id);
                self.perceptual.remove(memory.id, memory.perceptual_hash);
                memory
            }
        }
    }

    /// Enforce the unique constraint: a content hash belongs to one memory.
    /// Returns the hash when it still has to be added to the cache.
    fn check_claim(
        &self,
        hash: &ContentHash,
        memory_id: MemoryId,
    ) -> MemoryResult<Option<ContentHash>> {
        match self.cache.get(hash) {
            Some(owner) if *owner != memory_id => Err(MemoryError::DuplicateContent(hash.clone())),
            Some(_) => Ok(None),
            None => Ok(Some(hash.clone())),
        }
    }

    fn claim(&mut self, hash: &ContentHash, memory_id: MemoryId) -> MemoryResult<()> {
        let claim = self.check_claim(hash, memory_id)?;
        self.record(claim, memory_id);
        Ok(())
    }

    fn record(&mut self, claim: Option<ContentHash>, memory_id: MemoryId) {
        if let Some(hash) = claim {
            self.cache.insert(hash, memory_id);
        }
    }
}

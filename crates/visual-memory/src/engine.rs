//! Memory engine: the single entry point that turns image bytes into an outcome.

use std::sync::Arc;

use crate::classifier::DiffClassifier;
use crate::config::EngineConfig;
use crate::extractor::DescriptionExtractor;
use crate::fingerprint::{decode_base64, fingerprint};
use crate::store::MemoryStore;
use crate::types::{Fingerprint, MemoryError, MemoryId, MemoryResult, Metadata, Outcome, Status};

/// Composes fingerprinting, store lookups and classification.
///
/// Construct once and share; every call is independent and may run
/// concurrently with others.
pub struct MemoryEngine {
    store: Arc<MemoryStore>,
    extractor: Arc<dyn DescriptionExtractor>,
    classifier: DiffClassifier,
    config: EngineConfig,
}

impl MemoryEngine {
    pub fn new(
        store: Arc<MemoryStore>,
        extractor: Arc<dyn DescriptionExtractor>,
        config: EngineConfig,
    ) -> Self {
        tracing::info!(
            "Memory engine ready (threshold {}, policy {:?}, backend {:?})",
            config.similarity_threshold,
            config.candidate_policy,
            store.backend()
        );
        Self {
            store,
            extractor,
            classifier: DiffClassifier::new(&config),
            config,
        }
    }

    /// Fingerprint, classify, and record one image.
    pub async fn process(&self, image: &[u8], metadata: Metadata) -> MemoryResult<Outcome> {
        let fingerprint = fingerprint_off_runtime(image).await?;
        let outcome = self
            .classifier
            .classify(
                &self.store,
                self.extractor.as_ref(),
                image,
                &fingerprint,
                metadata,
            )
            .await?;
        log_outcome(&outcome, &fingerprint);
        Ok(outcome)
    }

    /// Same as [`process`](Self::process) for a base64 upload.
    pub async fn process_base64(&self, data: &str, metadata: Metadata) -> MemoryResult<Outcome> {
        let bytes = decode_base64(data)?;
        self.process(&bytes, metadata).await
    }

    /// Process an image as a possible new state of `target`, bypassing the
    /// neighbor search. Exact duplicates still resolve to their own memory.
    pub async fn process_into(
        &self,
        image: &[u8],
        target: MemoryId,
    ) -> MemoryResult<Outcome> {
        let fingerprint = fingerprint_off_runtime(image).await?;
        let outcome = self
            .classifier
            .classify_against(
                &self.store,
                self.extractor.as_ref(),
                image,
                &fingerprint,
                target,
            )
            .await?;
        log_outcome(&outcome, &fingerprint);
        Ok(outcome)
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

/// Decoding and hashing are CPU-bound, so they run on the blocking pool.
async fn fingerprint_off_runtime(image: &[u8]) -> MemoryResult<Fingerprint> {
    let bytes = image.to_vec();
    tokio::task::spawn_blocking(move || fingerprint(&bytes))
        .await
        .map_err(|e| MemoryError::Internal(format!("Fingerprint task failed: {e}")))?
}

fn log_outcome(outcome: &Outcome, fingerprint: &Fingerprint) {
    match outcome.status {
        Status::Created | Status::Updated => tracing::info!(
            "Memory {} {} at version {} (content {}, phash {})",
            outcome.memory_id,
            outcome.status,
            outcome.version,
            fingerprint.content_hash,
            fingerprint.perceptual_hash
        ),
        Status::Unchanged => tracing::debug!(
            "Memory {} unchanged (distance {:?})",
            outcome.memory_id,
            outcome.distance
        ),
    }
}

//! Created / unchanged / updated decision for one fingerprinted image.

use std::future::Future;
use std::time::Duration;

use crate::config::{CandidatePolicy, EngineConfig};
use crate::extractor::DescriptionExtractor;
use crate::store::MemoryStore;
use crate::types::{
    Candidate, Description, ExtractionError, Fingerprint, Memory, MemoryError, MemoryId,
    MemoryResult, Metadata, Outcome, Status, Verdict,
};

/// Times an update re-compares against a concurrently committed version
/// before giving up with the conflict.
const MAX_RECHECKS: u32 = 3;

/// Decides the classification of an image and performs the resulting write.
///
/// Holds no state across calls beyond its configuration.
#[derive(Debug, Clone)]
pub struct DiffClassifier {
    threshold: u32,
    policy: CandidatePolicy,
    timeout: Option<Duration>,
}

impl DiffClassifier {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            threshold: config.similarity_threshold,
            policy: config.candidate_policy,
            timeout: config.extract_timeout(),
        }
    }

    /// Classify an image against its exact match or near neighbors.
    pub async fn classify(
        &self,
        store: &MemoryStore,
        extractor: &dyn DescriptionExtractor,
        image: &[u8],
        fingerprint: &Fingerprint,
        metadata: Metadata,
    ) -> MemoryResult<Outcome> {
        if let Some(outcome) = self.exact_match(store, fingerprint).await {
            return Ok(outcome);
        }

        let candidates = store
            .find_near(fingerprint.perceptual_hash, self.threshold)
            .await;
        tracing::debug!(
            "{} candidate(s) within distance {} of {}",
            candidates.len(),
            self.threshold,
            fingerprint.perceptual_hash
        );

        let description = self.extract(extractor, image).await?;

        let Some(nearest) = candidates.first() else {
            return self.create(store, fingerprint, description, metadata).await;
        };

        let consulted = match self.policy {
            CandidatePolicy::Nearest => 1,
            CandidatePolicy::Vote { max_candidates } => max_candidates.max(1),
        };
        for candidate in candidates.iter().take(consulted) {
            let verdict = self
                .compare(extractor, &candidate.memory.description, &description)
                .await?;
            if verdict == Verdict::Same {
                return self.keep(store, candidate, fingerprint).await;
            }
        }

        self.update(store, extractor, nearest, fingerprint, description)
            .await
    }

    /// Classify an image as a possible new state of an explicitly named
    /// memory, skipping the neighbor search.
    pub async fn classify_against(
        &self,
        store: &MemoryStore,
        extractor: &dyn DescriptionExtractor,
        image: &[u8],
        fingerprint: &Fingerprint,
        target: MemoryId,
    ) -> MemoryResult<Outcome> {
        if let Some(outcome) = self.exact_match(store, fingerprint).await {
            return Ok(outcome);
        }

        let memory = store.get(target).await.ok_or(MemoryError::NotFound(target))?;
        let description = self.extract(extractor, image).await?;
        let candidate = Candidate {
            distance: fingerprint.perceptual_hash.distance(memory.perceptual_hash),
            memory,
        };

        match self
            .compare(extractor, &candidate.memory.description, &description)
            .await?
        {
            Verdict::Same => self.keep(store, &candidate, fingerprint).await,
            Verdict::Different => {
                self.update(store, extractor, &candidate, fingerprint, description)
                    .await
            }
        }
    }

    async fn exact_match(&self, store: &MemoryStore, fingerprint: &Fingerprint) -> Option<Outcome> {
        let memory = store.find_by_content_hash(&fingerprint.content_hash).await?;
        Some(unchanged(&memory, fingerprint))
    }

    async fn create(
        &self,
        store: &MemoryStore,
        fingerprint: &Fingerprint,
        description: Description,
        metadata: Metadata,
    ) -> MemoryResult<Outcome> {
        let result = store
            .insert(
                fingerprint.content_hash.clone(),
                fingerprint.perceptual_hash,
                description,
                metadata,
            )
            .await;
        match result {
            Ok(memory) => Ok(Outcome::from_memory(Status::Created, &memory, None)),
            Err(e) => self.recover(store, fingerprint, e).await,
        }
    }

    async fn keep(
        &self,
        store: &MemoryStore,
        candidate: &Candidate,
        fingerprint: &Fingerprint,
    ) -> MemoryResult<Outcome> {
        let result = store
            .touch_unchanged(candidate.memory.id, Some(&fingerprint.content_hash))
            .await;
        match result {
            Ok(memory) => Ok(Outcome::from_memory(
                Status::Unchanged,
                &memory,
                Some(candidate.distance),
            )),
            Err(e) => self.recover(store, fingerprint, e).await,
        }
    }

    /// Update the candidate, re-checking against whatever a concurrent
    /// writer committed if the memory moved on in the meantime.
    async fn update(
        &self,
        store: &MemoryStore,
        extractor: &dyn DescriptionExtractor,
        candidate: &Candidate,
        fingerprint: &Fingerprint,
        description: Description,
    ) -> MemoryResult<Outcome> {
        let mut target = candidate.clone();
        let mut rechecks = 0;
        loop {
            let result = store
                .apply_update(
                    target.memory.id,
                    target.memory.version,
                    &fingerprint.content_hash,
                    fingerprint.perceptual_hash,
                    description.clone(),
                )
                .await;
            let found = match result {
                Ok(memory) => {
                    return Ok(Outcome::from_memory(
                        Status::Updated,
                        &memory,
                        Some(target.distance),
                    ))
                }
                Err(MemoryError::VersionConflict { found, .. }) if rechecks < MAX_RECHECKS => found,
                Err(e) => return self.recover(store, fingerprint, e).await,
            };
            rechecks += 1;
            tracing::debug!(
                "Memory {} moved to version {found} concurrently; re-checking",
                target.memory.id
            );

            let winner = store
                .get(target.memory.id)
                .await
                .ok_or(MemoryError::NotFound(target.memory.id))?;
            target = Candidate {
                distance: fingerprint.perceptual_hash.distance(winner.perceptual_hash),
                memory: winner,
            };
            let verdict = self
                .compare(extractor, &target.memory.description, &description)
                .await?;
            if verdict == Verdict::Same {
                return self.keep(store, &target, fingerprint).await;
            }
        }
    }

    /// A concurrent call committed the same bytes first. Retry once as a
    /// lookup and report the winner's memory as unchanged.
    async fn recover(
        &self,
        store: &MemoryStore,
        fingerprint: &Fingerprint,
        error: MemoryError,
    ) -> MemoryResult<Outcome> {
        if !matches!(error, MemoryError::DuplicateContent(_)) {
            return Err(error);
        }
        match store.find_by_content_hash(&fingerprint.content_hash).await {
            Some(winner) => {
                tracing::warn!(
                    "Content {} was committed concurrently; folding into memory {}",
                    fingerprint.content_hash,
                    winner.id
                );
                Ok(unchanged(&winner, fingerprint))
            }
            None => Err(error),
        }
    }

    async fn extract(
        &self,
        extractor: &dyn DescriptionExtractor,
        image: &[u8],
    ) -> MemoryResult<Description> {
        let description = self.bounded(extractor.extract(image)).await?;
        description.validate()?;
        Ok(description)
    }

    async fn compare(
        &self,
        extractor: &dyn DescriptionExtractor,
        previous: &Description,
        current: &Description,
    ) -> MemoryResult<Verdict> {
        Ok(self.bounded(extractor.compare(previous, current)).await?)
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, ExtractionError>
    where
        F: Future<Output = Result<T, ExtractionError>>,
    {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
                tracing::warn!("Extractor call exceeded {limit:?}");
                Err(ExtractionError::Timeout(limit))
            }),
            None => call.await,
        }
    }
}

fn unchanged(memory: &Memory, fingerprint: &Fingerprint) -> Outcome {
    Outcome::from_memory(
        Status::Unchanged,
        memory,
        Some(fingerprint.perceptual_hash.distance(memory.perceptual_hash)),
    )
}

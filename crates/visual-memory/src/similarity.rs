//! Hamming-distance neighbor search over perceptual hashes.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::types::{Candidate, Memory, MemoryId, PerceptualHash};

/// Number of bands the 64-bit hash is split into for bucketing.
pub const BAND_COUNT: u32 = 8;

const BAND_BITS: u32 = 64 / BAND_COUNT;

/// Multi-index over perceptual hashes.
///
/// Two hashes within distance `d < BAND_COUNT` must agree exactly on at least
/// one band, so a query only has to inspect the buckets its own bands fall in.
#[derive(Debug, Clone)]
pub struct BandIndex {
    bands: Vec<HashMap<u8, HashSet<MemoryId>>>,
}

impl BandIndex {
    pub fn new() -> Self {
        Self {
            bands: (0..BAND_COUNT).map(|_| HashMap::new()).collect(),
        }
    }

    pub fn insert(&mut self, id: MemoryId, hash: PerceptualHash) {
        for (band, key) in self.bands.iter_mut().zip(band_keys(hash)) {
            band.entry(key).or_default().insert(id);
        }
    }

    pub fn remove(&mut self, id: MemoryId, hash: PerceptualHash) {
        for (band, key) in self.bands.iter_mut().zip(band_keys(hash)) {
            if let Some(bucket) = band.get_mut(&key) {
                bucket.remove(&id);
                if bucket.is_empty() {
                    band.remove(&key);
                }
            }
        }
    }

    /// Ids that could be within `max_distance` of `hash`, or `None` when the
    /// distance is too wide for the band guarantee and a full scan is needed.
    pub fn probe(&self, hash: PerceptualHash, max_distance: u32) -> Option<HashSet<MemoryId>> {
        if max_distance >= BAND_COUNT {
            return None;
        }
        let mut ids = HashSet::new();
        for (band, key) in self.bands.iter().zip(band_keys(hash)) {
            if let Some(bucket) = band.get(&key) {
                ids.extend(bucket.iter().copied());
            }
        }
        Some(ids)
    }
}

impl Default for BandIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn band_keys(hash: PerceptualHash) -> impl Iterator<Item = u8> {
    (0..BAND_COUNT).map(move |i| (hash.0 >> (i * BAND_BITS)) as u8)
}

/// Filter memories to those within `max_distance` and order them: ascending
/// distance, then most recently updated first, then by id.
pub fn rank_candidates<'a, I>(query: PerceptualHash, memories: I, max_distance: u32) -> Vec<Candidate>
where
    I: IntoIterator<Item = &'a Memory>,
{
    let mut candidates: Vec<Candidate> = memories
        .into_iter()
        .filter_map(|m| {
            let distance = query.distance(m.perceptual_hash);
            (distance <= max_distance).then(|| Candidate {
                memory: m.clone(),
                distance,
            })
        })
        .collect();

    candidates.sort_by(compare_candidates);
    candidates
}

fn compare_candidates(a: &Candidate, b: &Candidate) -> Ordering {
    a.distance
        .cmp(&b.distance)
        .then_with(|| b.memory.updated_at.cmp(&a.memory.updated_at))
        .then_with(|| a.memory.id.cmp(&b.memory.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContentHash, Description};
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn memory(hash: u64, age_secs: i64) -> Memory {
        let now = Utc::now() - Duration::seconds(age_secs);
        Memory {
            id: Uuid::new_v4(),
            content_hash: ContentHash::from_hex(format!("{hash:x}-{age_secs}")),
            perceptual_hash: PerceptualHash(hash),
            description: Description::new("x"),
            version: 1,
            created_at: now,
            updated_at: now,
            metadata: Default::default(),
        }
    }

    #[test]
    fn test_rank_orders_by_distance_then_recency() {
        let old_close = memory(0b111, 100);
        let new_close = memory(0b111 << 8, 10);
        let far = memory(0b11111, 0);
        let out_of_band = memory(u64::MAX, 0);
        let all = vec![far.clone(), old_close.clone(), out_of_band, new_close.clone()];

        let ranked = rank_candidates(PerceptualHash(0), &all, 5);
        let ids: Vec<_> = ranked.iter().map(|c| c.memory.id).collect();
        assert_eq!(ids, vec![new_close.id, old_close.id, far.id]);
        let distances: Vec<_> = ranked.iter().map(|c| c.distance).collect();
        assert_eq!(distances, vec![3, 3, 5]);
    }

    #[test]
    fn test_probe_finds_every_neighbor_below_band_count() {
        let mut index = BandIndex::new();
        let base = 0x0123_4567_89ab_cdefu64;
        let id_base = Uuid::new_v4();
        index.insert(id_base, PerceptualHash(base));

        // Flip one bit in each of seven different bands.
        let mut flipped = base;
        for band in 0..7 {
            flipped ^= 1u64 << (band * BAND_BITS);
        }
        let probed = index.probe(PerceptualHash(flipped), 7).unwrap();
        assert!(probed.contains(&id_base));
    }

    #[test]
    fn test_probe_falls_back_for_wide_distance() {
        let index = BandIndex::new();
        assert!(index.probe(PerceptualHash(0), BAND_COUNT).is_none());
    }

    #[test]
    fn test_remove_clears_buckets() {
        let mut index = BandIndex::new();
        let id = Uuid::new_v4();
        index.insert(id, PerceptualHash(42));
        index.remove(id, PerceptualHash(42));
        assert!(index.probe(PerceptualHash(42), 0).unwrap().is_empty());
    }
}

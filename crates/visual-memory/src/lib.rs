//! Visual memory: a fingerprint-and-diff engine that classifies images as created, unchanged, or updated memories.

pub mod classifier;
pub mod config;
pub mod diff;
pub mod engine;
pub mod extractor;
pub mod fingerprint;
pub mod similarity;
pub mod storage;
pub mod store;
pub mod types;

pub use classifier::DiffClassifier;
pub use config::{resolve_store_path, CandidatePolicy, EngineConfig, StoreConfig};
pub use diff::{diff_descriptions, DescriptionChange};
pub use engine::MemoryEngine;
pub use extractor::DescriptionExtractor;
pub use fingerprint::{content_hash, fingerprint, perceptual_hash};
pub use storage::{StoreSnapshot, VmemReader, VmemWriter};
pub use store::MemoryStore;
pub use types::*;

//! End-to-end classification scenarios through the memory engine.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use image::{DynamicImage, GrayImage, ImageBuffer, ImageFormat, Luma};
use serde_json::json;

use visual_memory::{
    content_hash, CandidatePolicy, ContentHash, Description, DescriptionExtractor, EngineConfig,
    ExtractionError, MemoryEngine, MemoryError, MemoryStore, Metadata, Status, StoreConfig,
};

// ─────────────────────── helpers ───────────────────────

/// Deterministic grayscale noise.
fn noise(seed: u32) -> GrayImage {
    let mut state = seed;
    ImageBuffer::from_fn(32, 32, |_, _| {
        state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        Luma([(state >> 16) as u8])
    })
}

fn inverted(img: &GrayImage) -> GrayImage {
    let mut out = img.clone();
    image::imageops::invert(&mut out);
    out
}

fn encode(img: &GrayImage, format: ImageFormat) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(img.clone())
        .write_to(&mut buf, format)
        .unwrap();
    buf.into_inner()
}

/// Describes images from a fixed catalog keyed by content hash and counts calls.
#[derive(Default)]
struct Catalog {
    entries: HashMap<ContentHash, Description>,
    extracts: AtomicUsize,
}

impl Catalog {
    fn with(mut self, image: &[u8], text: &str) -> Self {
        self.entries.insert(content_hash(image), Description::new(text));
        self
    }

    fn extracts(&self) -> usize {
        self.extracts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DescriptionExtractor for Catalog {
    async fn extract(&self, image: &[u8]) -> Result<Description, ExtractionError> {
        self.extracts.fetch_add(1, Ordering::SeqCst);
        self.entries
            .get(&content_hash(image))
            .cloned()
            .ok_or_else(|| ExtractionError::Unavailable("unknown image".into()))
    }
}

struct Images {
    a: Vec<u8>,
    b: Vec<u8>,
    c: Vec<u8>,
}

/// A and B hold identical pixels in different encodings; C is A inverted.
fn images() -> Images {
    let base = noise(2024);
    Images {
        a: encode(&base, ImageFormat::Png),
        b: encode(&base, ImageFormat::Bmp),
        c: encode(&inverted(&base), ImageFormat::Png),
    }
}

fn engine(catalog: Arc<Catalog>) -> MemoryEngine {
    MemoryEngine::new(
        Arc::new(MemoryStore::in_memory()),
        catalog,
        EngineConfig::default(),
    )
}

// ═══════════════════════════════════════════════════════
// SCENARIOS
// ═══════════════════════════════════════════════════════

#[tokio::test]
async fn test_create_repeat_update_create() {
    let img = images();
    let catalog = Arc::new(
        Catalog::default()
            .with(&img.a, "Inbox with 3 unread messages")
            .with(&img.b, "Inbox with 4 unread messages")
            .with(&img.c, "Calendar for next week"),
    );
    let engine = engine(catalog.clone());

    let first = engine.process(&img.a, Metadata::new()).await.unwrap();
    assert_eq!(first.status, Status::Created);
    assert_eq!(first.version, 1);

    let repeat = engine.process(&img.a, Metadata::new()).await.unwrap();
    assert_eq!(repeat.status, Status::Unchanged);
    assert_eq!(repeat.memory_id, first.memory_id);
    assert_eq!(repeat.version, 1);

    let update = engine.process(&img.b, Metadata::new()).await.unwrap();
    assert_eq!(update.status, Status::Updated);
    assert_eq!(update.memory_id, first.memory_id);
    assert_eq!(update.version, 2);
    assert_eq!(update.distance, Some(0));
    assert_eq!(update.description.text, "Inbox with 4 unread messages");

    let history = engine.store().history(first.memory_id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].version, 1);
    assert_eq!(history[0].description.text, "Inbox with 3 unread messages");

    let unrelated = engine.process(&img.c, Metadata::new()).await.unwrap();
    assert_eq!(unrelated.status, Status::Created);
    assert_ne!(unrelated.memory_id, first.memory_id);
    assert_eq!(engine.store().len().await, 2);
}

#[tokio::test]
async fn test_identical_bytes_cost_nothing_the_second_time() {
    let img = images();
    let catalog = Arc::new(Catalog::default().with(&img.a, "Settings page"));
    let engine = engine(catalog.clone());

    let first = engine.process(&img.a, Metadata::new()).await.unwrap();
    let before = engine.store().get(first.memory_id).await.unwrap();
    assert_eq!(catalog.extracts(), 1);

    let second = engine.process(&img.a, Metadata::new()).await.unwrap();
    assert_eq!(second.status, Status::Unchanged);
    assert_eq!(catalog.extracts(), 1);
    assert_eq!(engine.store().get(first.memory_id).await.unwrap(), before);
}

#[tokio::test]
async fn test_created_memory_keeps_metadata_and_empty_history() {
    let img = images();
    let catalog = Arc::new(Catalog::default().with(&img.c, "Calendar"));
    let engine = engine(catalog);

    let mut metadata = Metadata::new();
    metadata.insert("app_name".into(), json!("Calendar"));
    let outcome = engine.process(&img.c, metadata.clone()).await.unwrap();

    assert_eq!(outcome.status, Status::Created);
    let stored = engine.store().get(outcome.memory_id).await.unwrap();
    assert_eq!(stored.metadata, metadata);
    assert!(engine.store().history(outcome.memory_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_semantically_same_neighbor_is_unchanged_and_cached() {
    let img = images();
    let catalog = Arc::new(
        Catalog::default()
            .with(&img.a, "Login screen")
            .with(&img.b, "Login screen"),
    );
    let engine = engine(catalog.clone());

    let created = engine.process(&img.a, Metadata::new()).await.unwrap();
    let same = engine.process(&img.b, Metadata::new()).await.unwrap();
    assert_eq!(same.status, Status::Unchanged);
    assert_eq!(same.memory_id, created.memory_id);
    assert_eq!(same.version, 1);
    assert_eq!(catalog.extracts(), 2);

    // The neighbor's bytes are now known and skip extraction.
    let again = engine.process(&img.b, Metadata::new()).await.unwrap();
    assert_eq!(again.status, Status::Unchanged);
    assert_eq!(catalog.extracts(), 2);
}

#[tokio::test]
async fn test_updating_bytes_take_fast_path_afterwards() {
    let img = images();
    let catalog = Arc::new(
        Catalog::default()
            .with(&img.a, "Draft document")
            .with(&img.b, "Final document"),
    );
    let engine = engine(catalog.clone());

    engine.process(&img.a, Metadata::new()).await.unwrap();
    let updated = engine.process(&img.b, Metadata::new()).await.unwrap();
    assert_eq!(updated.status, Status::Updated);

    let repeat = engine.process(&img.b, Metadata::new()).await.unwrap();
    assert_eq!(repeat.status, Status::Unchanged);
    assert_eq!(repeat.version, 2);
    assert_eq!(catalog.extracts(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_identical_uploads_create_once() {
    let img = images();
    let catalog = Arc::new(Catalog::default().with(&img.a, "Dashboard"));
    let engine = Arc::new(engine(catalog));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            let bytes = img.a.clone();
            tokio::spawn(async move { engine.process(&bytes, Metadata::new()).await })
        })
        .collect();

    let mut statuses = Vec::new();
    for handle in handles {
        statuses.push(handle.await.unwrap().unwrap().status);
    }

    assert_eq!(statuses.iter().filter(|s| **s == Status::Created).count(), 1);
    assert_eq!(statuses.iter().filter(|s| **s == Status::Unchanged).count(), 7);
    assert_eq!(engine.store().len().await, 1);
}

#[tokio::test]
async fn test_invalid_image_touches_nothing() {
    let catalog = Arc::new(Catalog::default());
    let engine = engine(catalog.clone());

    let err = engine
        .process(b"this is not an image", Metadata::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::InvalidImage(_)));
    assert_eq!(catalog.extracts(), 0);
    assert!(engine.store().is_empty().await);
}

#[tokio::test]
async fn test_extractor_failure_surfaces() {
    let img = images();
    let engine = engine(Arc::new(Catalog::default()));

    let err = engine.process(&img.a, Metadata::new()).await.unwrap_err();
    assert!(matches!(err, MemoryError::Extraction(ExtractionError::Unavailable(_))));
    assert!(engine.store().is_empty().await);
}

#[tokio::test]
async fn test_process_base64() {
    use base64::Engine;
    let img = images();
    let catalog = Arc::new(Catalog::default().with(&img.a, "Terminal output"));
    let engine = engine(catalog);

    let encoded = base64::engine::general_purpose::STANDARD.encode(&img.a);
    let outcome = engine.process_base64(&encoded, Metadata::new()).await.unwrap();
    assert_eq!(outcome.status, Status::Created);

    let err = engine.process_base64("not base64!", Metadata::new()).await.unwrap_err();
    assert!(matches!(err, MemoryError::InvalidImage(_)));
}

#[tokio::test]
async fn test_process_into_explicit_target() {
    let img = images();
    let catalog = Arc::new(
        Catalog::default()
            .with(&img.a, "Light theme editor")
            .with(&img.c, "Dark theme editor"),
    );
    let engine = engine(catalog);

    let created = engine.process(&img.a, Metadata::new()).await.unwrap();
    let outcome = engine.process_into(&img.c, created.memory_id).await.unwrap();
    assert_eq!(outcome.status, Status::Updated);
    assert_eq!(outcome.memory_id, created.memory_id);
    assert_eq!(outcome.version, 2);
    assert!(outcome.distance.unwrap() > EngineConfig::default().similarity_threshold);
}

#[tokio::test]
async fn test_vote_policy_through_engine() {
    let img = images();
    let catalog = Arc::new(
        Catalog::default()
            .with(&img.a, "Chat window")
            .with(&img.b, "Chat window"),
    );
    let engine = MemoryEngine::new(
        Arc::new(MemoryStore::in_memory()),
        catalog,
        EngineConfig {
            candidate_policy: CandidatePolicy::Vote { max_candidates: 2 },
            ..EngineConfig::default()
        },
    );

    let created = engine.process(&img.a, Metadata::new()).await.unwrap();
    let outcome = engine.process(&img.b, Metadata::new()).await.unwrap();
    assert_eq!(outcome.status, Status::Unchanged);
    assert_eq!(outcome.memory_id, created.memory_id);
}

#[tokio::test]
async fn test_file_backed_engine_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let backend = StoreConfig::File {
        path: dir.path().join("memories.vmem"),
    };
    let img = images();
    let catalog = Arc::new(
        Catalog::default()
            .with(&img.a, "Spreadsheet v1")
            .with(&img.b, "Spreadsheet v2"),
    );

    let id = {
        let store = Arc::new(MemoryStore::open(backend.clone()).unwrap());
        let engine = MemoryEngine::new(store, catalog.clone(), EngineConfig::default());
        let created = engine.process(&img.a, Metadata::new()).await.unwrap();
        engine.process(&img.b, Metadata::new()).await.unwrap();
        created.memory_id
    };

    let store = Arc::new(MemoryStore::open(backend).unwrap());
    let engine = MemoryEngine::new(store, catalog.clone(), EngineConfig::default());
    let extracts_before = catalog.extracts();

    let outcome = engine.process(&img.b, Metadata::new()).await.unwrap();
    assert_eq!(outcome.status, Status::Unchanged);
    assert_eq!(outcome.memory_id, id);
    assert_eq!(outcome.version, 2);
    assert_eq!(catalog.extracts(), extracts_before);
    assert_eq!(engine.store().history(id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_outcome_record_shape() {
    let img = images();
    let catalog = Arc::new(Catalog::default().with(&img.a, "Music player"));
    let engine = engine(catalog);

    let outcome = engine.process(&img.a, Metadata::new()).await.unwrap();
    let record = serde_json::to_value(&outcome).unwrap();
    assert_eq!(record["status"], "created");
    assert_eq!(record["version"], 1);
    assert_eq!(record["memory_id"], json!(outcome.memory_id.to_string()));
    assert_eq!(record["description"]["text"], "Music player");
}

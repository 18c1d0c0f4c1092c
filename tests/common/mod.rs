//! Shared test fixtures: in-memory store, fake embedding providers,
//! entity builders.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use converge::config::EngineConfig;
use converge::embed::{Embedder, EmbeddingProvider};
use converge::entity::{Entity, EntityInput, EntityKind};
use converge::error::ConvergeError;
use converge::store::SqliteStore;
use converge::SharedStore;

pub fn open_store() -> SharedStore {
    Arc::new(SqliteStore::open(":memory:").expect("open in-memory store"))
}

/// Deterministic provider: explicit vectors per text, orthogonal-ish fallback
/// for anything unlisted. Counts batch calls so tests can assert the cache
/// and the fuzzy-first filter actually save work.
pub struct FakeProvider {
    vectors: HashMap<String, Vec<f32>>,
    pub calls: Arc<AtomicUsize>,
}

impl FakeProvider {
    pub fn new(vectors: &[(&str, Vec<f32>)]) -> Self {
        Self {
            vectors: vectors
                .iter()
                .map(|(text, v)| (text.to_string(), v.clone()))
                .collect(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Texts without an explicit vector get a nearly-orthogonal one derived from
/// their bytes, so unrelated names never accidentally match.
pub fn fallback_vector(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; 16];
    let mut h: u64 = 1469598103934665603;
    for b in text.bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(1099511628211);
    }
    v[(h % 16) as usize] = 1.0;
    v[((h >> 8) % 16) as usize] += 0.2;
    v
}

#[async_trait]
impl EmbeddingProvider for FakeProvider {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ConvergeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts
            .iter()
            .map(|t| self.vectors.get(t).cloned().unwrap_or_else(|| fallback_vector(t)))
            .collect())
    }
}

/// Provider that always fails with a transient error.
pub struct FailingProvider {
    pub calls: Arc<AtomicUsize>,
}

impl FailingProvider {
    pub fn new() -> Self {
        Self { calls: Arc::new(AtomicUsize::new(0)) }
    }
}

#[async_trait]
impl EmbeddingProvider for FailingProvider {
    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ConvergeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ConvergeError::EmbedBackend("embedding endpoint unavailable".into()))
    }
}

/// Fast test config: no backoff sleeping to speak of.
pub fn test_config() -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.retry.max_attempts = 2;
    cfg.retry.initial_delay = std::time::Duration::from_millis(1);
    cfg.retry.jitter = false;
    cfg.breaker.cooldown = std::time::Duration::from_millis(5);
    cfg
}

pub fn test_embedder(store: &SharedStore, provider: Option<Arc<dyn EmbeddingProvider>>) -> Embedder {
    let cfg = test_config();
    Embedder::new(provider, store.clone(), cfg.retry.clone(), cfg.breaker.clone(), 256)
}

/// Build and ingest an entity; panics on validation failure.
pub fn ingest(
    store: &SharedStore,
    kind: EntityKind,
    name: &str,
    sources: &[&str],
) -> Entity {
    store
        .ingest(EntityInput::new(kind, name).sources(sources))
        .expect("ingest entity")
}

pub fn ingest_with(
    store: &SharedStore,
    input: EntityInput,
) -> Entity {
    store.ingest(input).expect("ingest entity")
}

/// The Opera-family embedding table: Opera and OPERA PMS are semantically
/// close; SAP and Simphony are far from everything.
pub fn opera_vectors() -> Vec<(&'static str, Vec<f32>)> {
    let mut opera = vec![0.0f32; 16];
    opera[0] = 1.0;
    let mut opera_pms = vec![0.0f32; 16];
    opera_pms[0] = 0.9;
    opera_pms[1] = (1.0f32 - 0.81).sqrt();
    vec![("opera", opera), ("opera pms", opera_pms)]
}

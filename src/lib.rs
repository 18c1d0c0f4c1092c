pub mod config;
pub mod consolidate;
pub mod embed;
pub mod entity;
pub mod error;
pub mod similarity;
pub mod store;

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

pub type SharedStore = Arc<store::SqliteStore>;

/// Run a blocking store operation on tokio's blocking thread pool.
///
/// All synchronous SqliteStore calls in async context MUST go through this
/// to avoid starving tokio worker threads.
pub async fn store_call<F, T>(store: &SharedStore, f: F) -> Result<T, error::ConvergeError>
where
    F: FnOnce(&store::SqliteStore) -> T + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| error::ConvergeError::Internal(e.to_string()))
}

/// In-process LRU for embedding vectors, keyed by text hash. The persistent
/// level lives in the store's embedding_cache table.
#[derive(Clone)]
pub struct EmbedCache {
    inner: Arc<parking_lot::Mutex<LruCache<String, Vec<f32>>>>,
}

impl EmbedCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(parking_lot::Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(128).expect("nonzero")),
            ))),
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<f32>> {
        self.inner.lock().get(key).cloned()
    }

    pub fn insert(&self, key: String, value: Vec<f32>) {
        self.inner.lock().put(key, value);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

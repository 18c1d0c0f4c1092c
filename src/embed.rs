//! Embedding collaborator: an OpenAI-compatible `/embeddings` endpoint behind
//! a provider trait, with bounded retry, a circuit breaker, and a two-level
//! cache (in-process LRU + persistent SQLite keyed by text hash).
//!
//! The persistent cache is the one resource deliberately mutated outside the
//! run transaction: entries are pure memoized function results and stay valid
//! across rollback.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::{BreakerConfig, RetryConfig};
use crate::error::ConvergeError;
use crate::{store_call, EmbedCache, SharedStore};

const EMBED_TIMEOUT: Duration = Duration::from_secs(30);

/// Cache key: hash of the normalized text, so repeated runs never regenerate
/// an embedding for unchanged text.
pub fn text_hash(normalized: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

/// Serialize an f32 vector to bytes (little-endian) for SQLite BLOB storage.
pub fn embedding_to_bytes(v: &[f32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(v.len() * 4);
    for &f in v {
        buf.extend_from_slice(&f.to_le_bytes());
    }
    buf
}

/// Deserialize bytes back to an f32 vector.
pub fn bytes_to_embedding(b: &[u8]) -> Vec<f32> {
    b.chunks_exact(4)
        .map(|chunk| {
            let arr: [u8; 4] = chunk.try_into().expect("4 bytes");
            f32::from_le_bytes(arr)
        })
        .collect()
}

/// The external embedding collaborator: text in, fixed-length vector out.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ConvergeError>;
}

/// OpenAI-compatible HTTP embedding endpoint.
pub struct HttpEmbeddingProvider {
    url: String,
    key: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct EmbedRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedData>,
}

#[derive(Deserialize)]
struct EmbedData {
    embedding: Vec<f32>,
}

impl HttpEmbeddingProvider {
    /// Returns `None` if `CONVERGE_EMBED_URL` is not set — semantic
    /// similarity is then disabled and detection runs lexical-only.
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("CONVERGE_EMBED_URL").ok()?;
        let key = std::env::var("CONVERGE_EMBED_KEY").unwrap_or_default();
        let model = std::env::var("CONVERGE_EMBED_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".into());
        let client = reqwest::Client::builder()
            .timeout(EMBED_TIMEOUT)
            .build()
            .expect("failed to build HTTP client");
        Some(Self { url, key, model, client })
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ConvergeError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let req = EmbedRequest { model: self.model.clone(), input: texts.to_vec() };
        let mut builder = self.client.post(&self.url).json(&req);
        if !self.key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.key));
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| ConvergeError::EmbedBackend(format!("embedding request failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ConvergeError::EmbedBackend(format!(
                "embedding API returned {status}: {body}"
            )));
        }
        let parsed: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| ConvergeError::EmbedBackend(format!("embedding response parse failed: {e}")))?;
        let embeddings: Vec<Vec<f32>> = parsed.data.into_iter().map(|d| d.embedding).collect();
        if embeddings.len() != texts.len() {
            return Err(ConvergeError::EmbedBackend(format!(
                "embedding count mismatch: sent {} texts, got {} embeddings",
                texts.len(),
                embeddings.len()
            )));
        }
        Ok(embeddings)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_calls: u32,
    half_open_successes: u32,
}

/// Explicit Closed → Open → HalfOpen state machine around the embedding
/// collaborator. Trips after `failure_threshold` consecutive failures; the
/// run then fails fast instead of retrying indefinitely.
pub struct CircuitBreaker {
    cfg: BreakerConfig,
    inner: parking_lot::Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            inner: parking_lot::Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_calls: 0,
                half_open_successes: 0,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Gate a call attempt. Moves Open → HalfOpen once the cooldown elapses.
    pub fn try_acquire(&self) -> Result<(), ConvergeError> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.cfg.cooldown)
                    .unwrap_or(true);
                if cooled {
                    debug!("circuit breaker half-open, probing");
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_calls = 1;
                    inner.half_open_successes = 0;
                    Ok(())
                } else {
                    Err(ConvergeError::CircuitOpen)
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_calls < self.cfg.half_open_max_calls {
                    inner.half_open_calls += 1;
                    Ok(())
                } else {
                    Err(ConvergeError::CircuitOpen)
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => inner.consecutive_failures = 0,
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.cfg.success_threshold {
                    debug!("circuit breaker closed");
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.cfg.failure_threshold {
                    warn!(
                        failures = inner.consecutive_failures,
                        "circuit breaker open"
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::HalfOpen => {
                warn!("circuit breaker probe failed, reopening");
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
            }
            BreakerState::Open => {}
        }
    }
}

/// Cumulative cache accounting for the run report.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub store_hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.memory_hits + self.store_hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.memory_hits + self.store_hits) as f64 / total as f64
        }
    }
}

/// Embedding front door: provider + breaker + retry + two cache levels.
/// Constructed at run start and dropped at shutdown; tests substitute the
/// provider with an in-memory fake.
pub struct Embedder {
    provider: Option<Arc<dyn EmbeddingProvider>>,
    breaker: CircuitBreaker,
    retry: RetryConfig,
    cache: EmbedCache,
    store: SharedStore,
    stats: parking_lot::Mutex<CacheStats>,
}

impl Embedder {
    pub fn new(
        provider: Option<Arc<dyn EmbeddingProvider>>,
        store: SharedStore,
        retry: RetryConfig,
        breaker: BreakerConfig,
        cache_capacity: usize,
    ) -> Self {
        Self {
            provider,
            breaker: CircuitBreaker::new(breaker),
            retry,
            cache: EmbedCache::new(cache_capacity),
            store,
            stats: parking_lot::Mutex::new(CacheStats::default()),
        }
    }

    /// Whether semantic similarity is available at all.
    pub fn semantic_enabled(&self) -> bool {
        self.provider.is_some()
    }

    pub fn stats(&self) -> CacheStats {
        *self.stats.lock()
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Resolve embeddings for `(hash, text)` pairs, hitting the LRU, then the
    /// persistent cache, then the provider (batched) for the remainder.
    pub async fn embed(
        &self,
        items: &[(String, String)],
    ) -> Result<HashMap<String, Vec<f32>>, ConvergeError> {
        let mut out: HashMap<String, Vec<f32>> = HashMap::new();
        let mut missing: Vec<(String, String)> = Vec::new();
        let mut queued: std::collections::HashSet<String> = std::collections::HashSet::new();

        for (hash, text) in items {
            // Distinct entities can normalize to the same text; resolve each
            // hash once.
            if out.contains_key(hash) || queued.contains(hash) {
                continue;
            }
            if let Some(v) = self.cache.get(hash) {
                self.stats.lock().memory_hits += 1;
                out.insert(hash.clone(), v);
            } else {
                queued.insert(hash.clone());
                missing.push((hash.clone(), text.clone()));
            }
        }

        if missing.is_empty() {
            return Ok(out);
        }

        // Second level: persistent cache.
        let hashes: Vec<String> = missing.iter().map(|(h, _)| h.clone()).collect();
        let store = self.store.clone();
        let cached = store_call(&store, move |s| s.embedding_cache_get_many(&hashes)).await??;
        let mut still_missing: Vec<(String, String)> = Vec::new();
        for (hash, text) in missing {
            if let Some(v) = cached.get(&hash) {
                self.stats.lock().store_hits += 1;
                self.cache.insert(hash.clone(), v.clone());
                out.insert(hash, v.clone());
            } else {
                still_missing.push((hash, text));
            }
        }

        if still_missing.is_empty() {
            return Ok(out);
        }

        let provider = match &self.provider {
            Some(p) => p.clone(),
            None => {
                return Err(ConvergeError::EmbedBackend(
                    "no embedding provider configured".into(),
                ))
            }
        };

        self.stats.lock().misses += still_missing.len() as u64;
        let texts: Vec<String> = still_missing.iter().map(|(_, t)| t.clone()).collect();
        let vectors = self.call_with_retry(provider.as_ref(), &texts).await?;

        let mut to_persist: Vec<(String, Vec<f32>)> = Vec::with_capacity(vectors.len());
        for ((hash, _), vector) in still_missing.into_iter().zip(vectors) {
            self.cache.insert(hash.clone(), vector.clone());
            to_persist.push((hash.clone(), vector.clone()));
            out.insert(hash, vector);
        }
        let store = self.store.clone();
        store_call(&store, move |s| s.embedding_cache_put_many(&to_persist)).await??;

        Ok(out)
    }

    /// Bounded exponential-backoff retry around the provider, gated by the
    /// circuit breaker. Exhausted retries or an open circuit fail the run.
    async fn call_with_retry(
        &self,
        provider: &dyn EmbeddingProvider,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, ConvergeError> {
        let mut delay = self.retry.initial_delay;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.breaker.try_acquire()?;
            match provider.embed_batch(texts).await {
                Ok(vectors) => {
                    self.breaker.on_success();
                    if attempt > 1 {
                        debug!(attempt, "embedding retry succeeded");
                    }
                    return Ok(vectors);
                }
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    self.breaker.on_failure();
                    warn!(attempt, error = %e, "embedding call failed, backing off");
                    let sleep_for = if self.retry.jitter {
                        let factor = 1.0 + rand::random::<f64>() * 0.2;
                        delay.mul_f64(factor)
                    } else {
                        delay
                    };
                    tokio::time::sleep(sleep_for).await;
                    delay = delay
                        .mul_f64(self.retry.exponential_base)
                        .min(self.retry.max_delay);
                }
                Err(e) => {
                    if e.is_transient() {
                        self.breaker.on_failure();
                        warn!(attempt, error = %e, "embedding retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_distinct() {
        assert_eq!(text_hash("opera"), text_hash("opera"));
        assert_ne!(text_hash("opera"), text_hash("sap"));
    }

    #[test]
    fn embedding_bytes_roundtrip() {
        let v = vec![0.25f32, -1.5, 3.75];
        assert_eq!(bytes_to_embedding(&embedding_to_bytes(&v)), v);
    }

    #[test]
    fn breaker_opens_after_threshold() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
            half_open_max_calls: 1,
            success_threshold: 1,
        });
        for _ in 0..3 {
            assert!(breaker.try_acquire().is_ok());
            breaker.on_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(matches!(breaker.try_acquire(), Err(ConvergeError::CircuitOpen)));
    }

    #[test]
    fn breaker_half_open_probe_closes_on_success() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_millis(0),
            half_open_max_calls: 2,
            success_threshold: 2,
        });
        assert!(breaker.try_acquire().is_ok());
        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        // Cooldown of zero: next acquire flips to half-open.
        assert!(breaker.try_acquire().is_ok());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.on_success();
        assert!(breaker.try_acquire().is_ok());
        breaker.on_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn breaker_probe_failure_reopens() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_millis(0),
            half_open_max_calls: 1,
            success_threshold: 1,
        });
        breaker.try_acquire().unwrap();
        breaker.on_failure();
        breaker.try_acquire().unwrap();
        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }
}

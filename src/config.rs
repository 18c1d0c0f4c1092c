//! Engine tuning. Everything the consolidation pipeline treats as a knob
//! lives here with defaults; a handful of env overrides (`CONVERGE_*`) cover
//! the values operators actually reach for. The defaults were tuned on one
//! interview corpus and do not necessarily generalize.

use std::collections::HashMap;
use std::time::Duration;

use crate::entity::EntityKind;

/// Per-kind duplicate thresholds. Tighter for precise identifiers (KPI
/// names), looser for free-text pain points.
#[derive(Debug, Clone, Copy)]
pub struct KindThresholds {
    /// Lexical similarity at or above this is a duplicate on its own.
    pub lexical: f64,
    /// Cosine similarity needed when the pair sits in the ambiguous band.
    pub semantic: f64,
    /// Below this lexical bar a pair is discarded without a semantic call.
    pub lexical_floor: f64,
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Lexical similarity that short-circuits the semantic check entirely.
    pub certain_lexical: f64,
    /// Cap on ambiguous peers kept per entity (top-N by lexical similarity).
    pub max_candidates: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self { certain_lexical: 0.95, max_candidates: 8 }
    }
}

#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Sentences at or above this lexical similarity are the same sentence.
    pub sentence_dedup_sim: f64,
    /// Attribute values below this similarity are a contradiction.
    pub value_agreement_sim: f64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self { sentence_dedup_sim: 0.9, value_agreement_sim: 0.7 }
    }
}

#[derive(Debug, Clone)]
pub struct ScorerConfig {
    /// Source count that yields full base confidence, before corpus scaling.
    pub base_divisor: f64,
    pub agreement_bonus_per_attr: f64,
    pub max_agreement_bonus: f64,
    /// Linear per-contradiction penalty, deliberately uncapped.
    pub contradiction_penalty: f64,
    /// Applied only when a single document vouches for the entity.
    pub single_source_penalty: f64,
    pub review_threshold: f64,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            base_divisor: 5.0,
            agreement_bonus_per_attr: 0.05,
            max_agreement_bonus: 0.2,
            contradiction_penalty: 0.1,
            single_source_penalty: 0.15,
            review_threshold: 0.5,
        }
    }
}

/// One kind-pair the discoverer links.
#[derive(Debug, Clone)]
pub struct RelationRule {
    pub from: EntityKind,
    pub to: EntityKind,
    pub rel_type: String,
}

#[derive(Debug, Clone)]
pub struct RelateConfig {
    pub rules: Vec<RelationRule>,
    /// Minimum shared source documents before an edge is emitted.
    pub min_source_overlap: usize,
}

impl Default for RelateConfig {
    fn default() -> Self {
        let rule = |from, to, rel_type: &str| RelationRule { from, to, rel_type: rel_type.to_string() };
        Self {
            rules: vec![
                rule(EntityKind::System, EntityKind::PainPoint, "exhibits"),
                rule(EntityKind::Process, EntityKind::System, "relies_on"),
                rule(EntityKind::Process, EntityKind::PainPoint, "impeded_by"),
            ],
            min_source_overlap: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PatternConfig {
    /// Fraction of the corpus an entity must appear in to be "recurring".
    pub recurring_fraction: f64,
    /// Distinct strong peers before an entity counts as a hub.
    pub hub_min_peers: usize,
    /// Evidence count a relationship needs to count toward hub fan-out.
    pub hub_min_evidence: usize,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self { recurring_fraction: 0.3, hub_min_peers: 3, hub_min_evidence: 2 }
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a half-open probe.
    pub cooldown: Duration,
    /// Probe calls allowed while half-open.
    pub half_open_max_calls: u32,
    /// Consecutive probe successes needed to close again.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            half_open_max_calls: 2,
            success_threshold: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    thresholds: HashMap<EntityKind, KindThresholds>,
    pub detector: DetectorConfig,
    pub merge: MergeConfig,
    pub scorer: ScorerConfig,
    pub relate: RelateConfig,
    pub patterns: PatternConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    /// In-process embedding cache capacity.
    pub embed_cache_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut thresholds = HashMap::new();
        let t = |lexical, semantic, lexical_floor| KindThresholds { lexical, semantic, lexical_floor };
        thresholds.insert(EntityKind::PainPoint, t(0.78, 0.78, 0.35));
        thresholds.insert(EntityKind::System, t(0.85, 0.80, 0.40));
        thresholds.insert(EntityKind::Process, t(0.82, 0.80, 0.40));
        thresholds.insert(EntityKind::Kpi, t(0.90, 0.86, 0.50));
        thresholds.insert(EntityKind::Role, t(0.85, 0.82, 0.45));
        Self {
            thresholds,
            detector: DetectorConfig::default(),
            merge: MergeConfig::default(),
            scorer: ScorerConfig::default(),
            relate: RelateConfig::default(),
            patterns: PatternConfig::default(),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            embed_cache_capacity: 2048,
        }
    }
}

fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

impl EngineConfig {
    /// Defaults with the handful of env overrides operators actually tune.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_f64("CONVERGE_CERTAIN_LEXICAL") {
            cfg.detector.certain_lexical = v;
        }
        if let Some(v) = env_usize("CONVERGE_MAX_CANDIDATES") {
            cfg.detector.max_candidates = v;
        }
        if let Some(v) = env_f64("CONVERGE_VALUE_AGREEMENT_SIM") {
            cfg.merge.value_agreement_sim = v;
        }
        if let Some(v) = env_f64("CONVERGE_REVIEW_THRESHOLD") {
            cfg.scorer.review_threshold = v;
        }
        if let Some(v) = env_f64("CONVERGE_RECURRING_FRACTION") {
            cfg.patterns.recurring_fraction = v;
        }
        if let Some(v) = env_usize("CONVERGE_MIN_SOURCE_OVERLAP") {
            cfg.relate.min_source_overlap = v;
        }
        cfg
    }

    pub fn thresholds_for(&self, kind: EntityKind) -> KindThresholds {
        self.thresholds
            .get(&kind)
            .copied()
            .unwrap_or(KindThresholds { lexical: 0.85, semantic: 0.80, lexical_floor: 0.40 })
    }

    pub fn set_thresholds(&mut self, kind: EntityKind, t: KindThresholds) {
        self.thresholds.insert(kind, t);
    }
}

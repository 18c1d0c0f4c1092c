//! Consensus confidence: how much to trust a consolidated entity, from
//! source count, attribute agreement, and contradictions.

use tracing::warn;

use crate::config::ScorerConfig;

#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreInputs {
    pub source_count: usize,
    pub agreed_attributes: usize,
    pub contradictions: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    pub confidence: f64,
    pub needs_review: bool,
}

/// The divisor adapts to corpus size: an entity mentioned by ~a quarter of
/// all documents reaches full base confidence no matter how large the corpus
/// grows.
fn effective_divisor(cfg: &ScorerConfig, total_source_documents: usize) -> f64 {
    let corpus_scaled = (total_source_documents as f64 / 4.0).max(1.0);
    cfg.base_divisor.min(corpus_scaled)
}

pub fn score(inputs: &ScoreInputs, total_source_documents: usize, cfg: &ScorerConfig) -> Verdict {
    if inputs.source_count == 0 {
        // Invalid state — ingest validation should have caught it.
        warn!("scoring entity with zero sources; flagging for review");
        return Verdict { confidence: 0.0, needs_review: true };
    }

    let divisor = effective_divisor(cfg, total_source_documents);
    let base = (inputs.source_count as f64 / divisor).min(1.0);

    let agreement_bonus = (cfg.agreement_bonus_per_attr * inputs.agreed_attributes as f64)
        .min(cfg.max_agreement_bonus);

    // Linear and uncapped: every further contradiction keeps eroding trust.
    let contradiction_penalty = cfg.contradiction_penalty * inputs.contradictions as f64;

    // Agreement cannot exist with one witness, so a lone source is penalized
    // regardless of its attribute count.
    let single_source_penalty = if inputs.source_count == 1 {
        cfg.single_source_penalty
    } else {
        0.0
    };

    let confidence =
        (base + agreement_bonus - contradiction_penalty - single_source_penalty).clamp(0.0, 1.0);
    let needs_review = inputs.contradictions > 0 || confidence < cfg.review_threshold;

    Verdict { confidence, needs_review }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ScorerConfig {
        ScorerConfig::default()
    }

    #[test]
    fn zero_sources_is_invalid_state() {
        let v = score(&ScoreInputs::default(), 20, &cfg());
        assert_eq!(v.confidence, 0.0);
        assert!(v.needs_review);
    }

    #[test]
    fn divisor_adapts_to_small_corpora() {
        // 8 documents: divisor becomes 8/4 = 2, so 2 sources already max base.
        let v = score(
            &ScoreInputs { source_count: 2, agreed_attributes: 0, contradictions: 0 },
            8,
            &cfg(),
        );
        assert!((v.confidence - 1.0).abs() < 1e-9, "got {}", v.confidence);
    }

    #[test]
    fn single_source_is_penalized() {
        let config = cfg();
        let one = score(&ScoreInputs { source_count: 1, ..Default::default() }, 40, &config);
        // base = 1/5 = 0.2, minus the single-source penalty.
        assert!((one.confidence - (0.2 - config.single_source_penalty)).abs() < 1e-9);
        assert!(one.needs_review);
    }

    #[test]
    fn contradiction_penalty_compounds_linearly() {
        let config = cfg();
        let base = score(
            &ScoreInputs { source_count: 5, agreed_attributes: 0, contradictions: 0 },
            40,
            &config,
        );
        let with_three = score(
            &ScoreInputs { source_count: 5, agreed_attributes: 0, contradictions: 3 },
            40,
            &config,
        );
        let expected = base.confidence - 3.0 * config.contradiction_penalty;
        assert!((with_three.confidence - expected).abs() < 1e-9);
        assert!(with_three.needs_review);
    }

    #[test]
    fn agreement_bonus_is_capped() {
        let config = cfg();
        let many = score(
            &ScoreInputs { source_count: 3, agreed_attributes: 50, contradictions: 0 },
            40,
            &config,
        );
        let few = score(
            &ScoreInputs {
                source_count: 3,
                agreed_attributes: (config.max_agreement_bonus / config.agreement_bonus_per_attr)
                    as usize,
                contradictions: 0,
            },
            40,
            &config,
        );
        assert!((many.confidence - few.confidence).abs() < 1e-9);
    }

    #[test]
    fn confidence_monotone_in_source_count() {
        let config = cfg();
        for contradictions in [0usize, 2, 5] {
            let mut prev = -1.0f64;
            for sources in 1..=20usize {
                let v = score(
                    &ScoreInputs { source_count: sources, agreed_attributes: 1, contradictions },
                    40,
                    &config,
                );
                assert!(
                    v.confidence >= prev,
                    "confidence dropped at {sources} sources ({contradictions} contradictions)"
                );
                prev = v.confidence;
            }
        }
    }
}

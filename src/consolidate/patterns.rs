//! Cross-source pattern recognition over the consolidated set. Two families:
//! recurring entities (mentioned across a high fraction of the corpus) and
//! hub entities (strong relationship evidence to many distinct peers — the
//! chronically-problematic-system signal).

use std::collections::{BTreeSet, HashMap};

use crate::config::PatternConfig;
use crate::entity::{Entity, Pattern, PatternKind, Relationship};

pub fn recognize(
    entities: &[Entity],
    relationships: &[Relationship],
    total_source_documents: usize,
    run_id: &str,
    cfg: &PatternConfig,
) -> Vec<Pattern> {
    let mut out: Vec<Pattern> = Vec::new();
    if total_source_documents == 0 {
        return out;
    }

    let live: Vec<&Entity> = entities.iter().filter(|e| !e.is_superseded()).collect();
    let fraction_of = |e: &Entity| e.source_count() as f64 / total_source_documents as f64;

    for entity in &live {
        let fraction = fraction_of(entity);
        if fraction >= cfg.recurring_fraction {
            out.push(Pattern {
                id: uuid::Uuid::new_v4().to_string(),
                pattern_type: PatternKind::RecurringEntity,
                member_ids: vec![entity.id.clone()],
                frequency: fraction,
                priority: fraction.clamp(0.0, 1.0),
                run_id: run_id.to_string(),
            });
        }
    }

    // Distinct peers per entity over edges with enough evidence, counting
    // both edge directions.
    let mut peers: HashMap<&str, BTreeSet<&str>> = HashMap::new();
    for rel in relationships {
        if rel.evidence_count < cfg.hub_min_evidence {
            continue;
        }
        peers.entry(&rel.from_id).or_default().insert(&rel.to_id);
        peers.entry(&rel.to_id).or_default().insert(&rel.from_id);
    }

    for entity in &live {
        let Some(entity_peers) = peers.get(entity.id.as_str()) else { continue };
        if entity_peers.len() < cfg.hub_min_peers {
            continue;
        }
        let fraction = fraction_of(entity);
        // Fan-out past the qualifying bar raises priority above a plain
        // recurring pattern of the same frequency.
        let fanout = entity_peers.len() as f64 / cfg.hub_min_peers.max(1) as f64;
        let priority = (fraction * 0.5 + (fanout / (fanout + 1.0))).clamp(0.0, 1.0);
        let mut member_ids = vec![entity.id.clone()];
        member_ids.extend(entity_peers.iter().map(|p| p.to_string()));
        out.push(Pattern {
            id: uuid::Uuid::new_v4().to_string(),
            pattern_type: PatternKind::HubEntity,
            member_ids,
            frequency: fraction,
            priority,
            run_id: run_id.to_string(),
        });
    }

    out.sort_by(|a, b| {
        b.priority
            .partial_cmp(&a.priority)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.member_ids.cmp(&b.member_ids))
    });
    out
}

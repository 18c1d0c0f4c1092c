//! Relationship discovery: link entities of configured kind pairs when their
//! source-document sets overlap enough. Pure re-derivation — same consolidated
//! entities in, same relationships out.

use std::collections::HashMap;

use crate::config::RelateConfig;
use crate::entity::{Entity, EntityKind, Relationship};

pub fn discover(entities: &[Entity], run_id: &str, cfg: &RelateConfig) -> Vec<Relationship> {
    let mut by_kind: HashMap<EntityKind, Vec<&Entity>> = HashMap::new();
    for entity in entities.iter().filter(|e| !e.is_superseded()) {
        by_kind.entry(entity.kind).or_default().push(entity);
    }

    let mut out: Vec<Relationship> = Vec::new();
    for rule in &cfg.rules {
        let (Some(from_pool), Some(to_pool)) = (by_kind.get(&rule.from), by_kind.get(&rule.to))
        else {
            continue;
        };
        for from in from_pool {
            for to in to_pool {
                let evidence = from.sources.intersection(&to.sources).count();
                if evidence < cfg.min_source_overlap {
                    continue;
                }
                let union = from.sources.union(&to.sources).count();
                let strength = if union == 0 { 0.0 } else { evidence as f64 / union as f64 };
                out.push(Relationship {
                    id: uuid::Uuid::new_v4().to_string(),
                    from_id: from.id.clone(),
                    to_id: to.id.clone(),
                    rel_type: rule.rel_type.clone(),
                    strength,
                    evidence_count: evidence,
                    run_id: run_id.to_string(),
                });
            }
        }
    }

    out.sort_by(|a, b| {
        a.rel_type
            .cmp(&b.rel_type)
            .then_with(|| a.from_id.cmp(&b.from_id))
            .then_with(|| a.to_id.cmp(&b.to_id))
    });
    out
}

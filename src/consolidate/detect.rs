//! Duplicate detection: fuzzy-first lexical filtering, semantic confirmation
//! for the ambiguous band, transitive-closure grouping via union-find.
//!
//! Semantic similarity is the expensive call (embedding collaborator), so the
//! pipeline is ordered to avoid it: cheap lexical similarity prunes obviously
//! dissimilar pairs, a certain-duplicate short-circuit skips it for obvious
//! matches, and a per-entity candidate cap bounds the worst case to O(n·k).

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::config::EngineConfig;
use crate::embed::{text_hash, Embedder};
use crate::entity::{Entity, EntityKind};
use crate::error::ConvergeError;
use crate::similarity::{cosine_similarity, lexical_similarity, normalize_name};

/// Text representation an entity is embedded under. Keyed into the cache by
/// its hash, so unchanged text never re-embeds.
pub fn embed_text(entity: &Entity) -> String {
    let name = normalize_name(entity.kind, &entity.name);
    if entity.description.is_empty() {
        name
    } else {
        format!("{name}. {}", entity.description)
    }
}

pub struct DuplicateDetector<'a> {
    cfg: &'a EngineConfig,
}

impl<'a> DuplicateDetector<'a> {
    pub fn new(cfg: &'a EngineConfig) -> Self {
        Self { cfg }
    }

    /// Find duplicate groups in a pool of same-kind entities. Returns groups
    /// of indices into `pool`, each group sorted, only groups of two or more.
    pub async fn find_groups(
        &self,
        kind: EntityKind,
        pool: &[Entity],
        embedder: &Embedder,
    ) -> Result<Vec<Vec<usize>>, ConvergeError> {
        if pool.len() < 2 {
            return Ok(vec![]);
        }
        let thresholds = self.cfg.thresholds_for(kind);
        let names: Vec<String> = pool
            .iter()
            .map(|e| normalize_name(kind, &e.name))
            .collect();

        let mut accepted: Vec<(usize, usize)> = Vec::new();
        let mut ambiguous: Vec<(usize, usize, f64)> = Vec::new();
        let semantic = embedder.semantic_enabled();

        for i in 0..pool.len() {
            for j in (i + 1)..pool.len() {
                let lex = lexical_similarity(&names[i], &names[j]);
                if lex >= self.cfg.detector.certain_lexical {
                    // Certainly a duplicate; never spend a semantic call here.
                    accepted.push((i, j));
                } else if lex >= thresholds.lexical {
                    accepted.push((i, j));
                } else if semantic && lex >= thresholds.lexical_floor {
                    ambiguous.push((i, j, lex));
                }
            }
        }

        let capped = cap_candidates(&ambiguous, pool.len(), self.cfg.detector.max_candidates);
        if ambiguous.len() != capped.len() {
            debug!(
                kind = %kind,
                ambiguous = ambiguous.len(),
                kept = capped.len(),
                "candidate cap pruned ambiguous pairs"
            );
        }

        if !capped.is_empty() {
            let mut needed: HashSet<usize> = HashSet::new();
            for &(i, j, _) in &capped {
                needed.insert(i);
                needed.insert(j);
            }
            let mut items: Vec<(String, String)> = Vec::with_capacity(needed.len());
            let mut hash_of: HashMap<usize, String> = HashMap::new();
            for &idx in &needed {
                let text = embed_text(&pool[idx]);
                let hash = text_hash(&text);
                hash_of.insert(idx, hash.clone());
                items.push((hash, text));
            }
            let vectors = embedder.embed(&items).await?;
            for &(i, j, lex) in &capped {
                let (Some(va), Some(vb)) = (
                    hash_of.get(&i).and_then(|h| vectors.get(h)),
                    hash_of.get(&j).and_then(|h| vectors.get(h)),
                ) else {
                    continue;
                };
                let cos = cosine_similarity(va, vb);
                if cos >= thresholds.semantic {
                    debug!(
                        a = %pool[i].name, b = %pool[j].name,
                        lex = format!("{lex:.3}"), cos = format!("{cos:.3}"),
                        "semantic match in ambiguous band"
                    );
                    accepted.push((i, j));
                }
            }
        }

        Ok(transitive_closure(pool.len(), &accepted))
    }
}

/// Keep each entity's top-N most lexically similar ambiguous peers. A pair
/// survives if it makes the cut for either endpoint.
fn cap_candidates(
    ambiguous: &[(usize, usize, f64)],
    n: usize,
    max_candidates: usize,
) -> Vec<(usize, usize, f64)> {
    let mut per_entity: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n];
    for (pair_idx, &(i, j, lex)) in ambiguous.iter().enumerate() {
        per_entity[i].push((pair_idx, lex));
        per_entity[j].push((pair_idx, lex));
    }
    let mut keep = vec![false; ambiguous.len()];
    for pairs in &mut per_entity {
        pairs.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        for &(pair_idx, _) in pairs.iter().take(max_candidates) {
            keep[pair_idx] = true;
        }
    }
    ambiguous
        .iter()
        .enumerate()
        .filter(|(idx, _)| keep[*idx])
        .map(|(_, &pair)| pair)
        .collect()
}

/// Union-find with path compression. Groups are transitive closures of
/// pairwise matches — A~B and B~C land in one group without requiring A~C.
fn transitive_closure(n: usize, pairs: &[(usize, usize)]) -> Vec<Vec<usize>> {
    let mut parent: Vec<usize> = (0..n).collect();

    fn find(parent: &mut [usize], x: usize) -> usize {
        let mut root = x;
        while parent[root] != root {
            root = parent[root];
        }
        let mut cursor = x;
        while parent[cursor] != root {
            let next = parent[cursor];
            parent[cursor] = root;
            cursor = next;
        }
        root
    }

    for &(i, j) in pairs {
        let ri = find(&mut parent, i);
        let rj = find(&mut parent, j);
        if ri != rj {
            parent[ri] = rj;
        }
    }

    let mut groups: HashMap<usize, Vec<usize>> = HashMap::new();
    for i in 0..n {
        let root = find(&mut parent, i);
        groups.entry(root).or_default().push(i);
    }

    let mut out: Vec<Vec<usize>> = groups
        .into_values()
        .filter(|g| g.len() >= 2)
        .map(|mut g| {
            g.sort_unstable();
            g
        })
        .collect();
    out.sort_by_key(|g| g[0]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closure_unites_chains_without_direct_pair() {
        // A~B, B~C: one group of three even though A~C never matched.
        let groups = transitive_closure(4, &[(0, 1), (1, 2)]);
        assert_eq!(groups, vec![vec![0, 1, 2]]);
    }

    #[test]
    fn closure_keeps_separate_components_apart() {
        let groups = transitive_closure(5, &[(0, 1), (2, 3)]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0], vec![0, 1]);
        assert_eq!(groups[1], vec![2, 3]);
    }

    #[test]
    fn cap_keeps_top_candidates_per_entity() {
        // Entity 0 has three ambiguous peers; cap of 2 keeps the strongest.
        let ambiguous = vec![(0, 1, 0.6), (0, 2, 0.7), (0, 3, 0.5)];
        let capped = cap_candidates(&ambiguous, 4, 2);
        let kept: Vec<(usize, usize)> = capped.iter().map(|&(i, j, _)| (i, j)).collect();
        assert!(kept.contains(&(0, 1)));
        assert!(kept.contains(&(0, 2)));
        // (0,3) survives only via entity 3's own top-N, which it is.
        assert!(kept.contains(&(0, 3)));
    }
}

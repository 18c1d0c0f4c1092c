//! Entity merging: one survivor keeps the id, descriptions combine without
//! repetition, attributes reconcile with contradiction detection, sources
//! union.
//!
//! The group is sorted by (created_at, id) before anything else happens, so
//! the outcome is the same for any permutation of the input.

use std::collections::BTreeMap;

use crate::config::MergeConfig;
use crate::entity::{AttrValue, Contradiction, Entity};
use crate::similarity::{lexical_similarity, value_similarity};
use crate::store::now_ms;

#[derive(Debug)]
pub struct MergeOutcome {
    pub merged: Entity,
    /// Non-survivor members, `superseded_by` pointing at the survivor.
    pub superseded: Vec<Entity>,
    pub contradictions: Vec<Contradiction>,
    /// Attribute keys where multiple sources provided agreeing values.
    pub agreed_attributes: usize,
}

/// Merge a duplicate group into its survivor. The group must share a kind and
/// contain at least two members.
pub fn merge_group(mut group: Vec<Entity>, cfg: &MergeConfig) -> MergeOutcome {
    debug_assert!(group.len() >= 2);
    group.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

    let mut merged = group[0].clone();

    merged.description = combine_descriptions(&group, cfg.sentence_dedup_sim);

    let (attrs_out, contradictions, agreed_attributes) = reconcile_attributes(&group, cfg);
    for (key, value) in attrs_out {
        merged.attrs.set_entry(&key, value);
    }

    // Union, not sum: one document mentioning the entity from three angles is
    // still one witness.
    for member in &group[1..] {
        merged.sources.extend(member.sources.iter().cloned());
    }

    merged.has_contradictions = !contradictions.is_empty();
    merged.contradiction_details = contradictions.clone();
    merged.agreed_attributes = agreed_attributes;
    merged.is_consolidated = true;
    merged.consolidated_at = Some(now_ms());

    let superseded: Vec<Entity> = group[1..]
        .iter()
        .map(|member| {
            let mut m = member.clone();
            m.superseded_by = Some(merged.id.clone());
            m
        })
        .collect();

    MergeOutcome { merged, superseded, contradictions, agreed_attributes }
}

/// Concatenate unique sentences across members, dropping near-identical
/// restatements of a sentence already kept.
fn combine_descriptions(group: &[Entity], dedup_sim: f64) -> String {
    let mut kept: Vec<String> = Vec::new();
    let mut kept_norm: Vec<String> = Vec::new();
    for member in group {
        for sentence in split_sentences(&member.description) {
            let norm = sentence.to_lowercase();
            let duplicate = kept_norm
                .iter()
                .any(|existing| lexical_similarity(existing, &norm) >= dedup_sim);
            if !duplicate {
                kept.push(sentence.to_string());
                kept_norm.push(norm);
            }
        }
    }
    kept.join(". ")
}

pub(crate) fn split_sentences(text: &str) -> Vec<&str> {
    text.split(['.', '!', '?', ';', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

type AttrsOut = BTreeMap<String, AttrValue>;

/// Reconcile attribute values across the group. Returns the merged values,
/// the contradictions found, and how many attributes had multi-source
/// agreement.
fn reconcile_attributes(
    group: &[Entity],
    cfg: &MergeConfig,
) -> (AttrsOut, Vec<Contradiction>, usize) {
    // All values per key in member order. BTreeMap: key order is stable.
    let mut values_by_key: BTreeMap<String, Vec<AttrValue>> = BTreeMap::new();
    for member in group {
        for (key, value) in member.attrs.entries() {
            values_by_key.entry(key).or_default().push(value);
        }
    }

    let mut out: AttrsOut = BTreeMap::new();
    let mut contradictions: Vec<Contradiction> = Vec::new();
    let mut agreed = 0usize;

    for (key, values) in values_by_key {
        // Distinct by rendering, first occurrence wins the slot.
        let mut distinct: Vec<(String, AttrValue, usize)> = Vec::new();
        for value in &values {
            let rendered = value.render();
            match distinct.iter_mut().find(|(r, _, _)| *r == rendered) {
                Some((_, _, count)) => *count += 1,
                None => distinct.push((rendered, value.clone(), 1)),
            }
        }

        if values.len() == 1 {
            // Exactly one member had this attribute: additive new
            // information, never a contradiction.
            out.insert(key, values.into_iter().next().expect("one value"));
            continue;
        }

        if distinct.len() == 1 {
            // Several members, identical value.
            agreed += 1;
            out.insert(key, distinct.remove(0).1);
            continue;
        }

        let min_sim = min_pairwise_similarity(&distinct);
        if min_sim < cfg.value_agreement_sim {
            contradictions.push(Contradiction {
                attribute: key.clone(),
                values: distinct.iter().map(|(r, _, _)| r.clone()).collect(),
                similarity: min_sim,
            });
        } else {
            agreed += 1;
        }

        // Representative value: most frequent, first occurrence on ties.
        let representative = distinct
            .iter()
            .max_by_key(|(_, _, count)| *count)
            .map(|(_, v, _)| v.clone())
            .expect("non-empty distinct values");
        out.insert(key, representative);
    }

    (out, contradictions, agreed)
}

fn min_pairwise_similarity(distinct: &[(String, AttrValue, usize)]) -> f64 {
    let mut min_sim = 1.0f64;
    for i in 0..distinct.len() {
        for j in (i + 1)..distinct.len() {
            let sim = value_similarity(&distinct[i].0, &distinct[j].0);
            if sim < min_sim {
                min_sim = sim;
            }
        }
    }
    min_sim
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentences_split_and_trim() {
        let parts = split_sentences("Check-in is slow. Guests complain!  Nightly audit fails");
        assert_eq!(parts, vec!["Check-in is slow", "Guests complain", "Nightly audit fails"]);
    }

    #[test]
    fn empty_description_yields_no_sentences() {
        assert!(split_sentences("").is_empty());
    }
}

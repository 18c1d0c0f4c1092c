use std::collections::BTreeSet;

use converge::config::MergeConfig;
use converge::consolidate::merge_group;
use converge::entity::{validate_input, Entity, EntityInput, EntityKind};

fn make_entity(
    kind: EntityKind,
    name: &str,
    sources: &[&str],
    attrs: &[(&str, &str)],
    created_at: i64,
) -> Entity {
    let mut input = EntityInput::new(kind, name).sources(sources);
    for (key, value) in attrs {
        input = input.attr(*key, *value);
    }
    let mut entity = validate_input(&input).expect("valid input");
    entity.created_at = created_at;
    entity
}

#[test]
fn survivor_is_earliest_created_with_id_tiebreak() {
    let a = make_entity(EntityKind::System, "Opera", &["d1"], &[], 100);
    let b = make_entity(EntityKind::System, "opera", &["d2"], &[], 50);
    let outcome = merge_group(vec![a.clone(), b.clone()], &MergeConfig::default());
    assert_eq!(outcome.merged.id, b.id, "earlier-created entity keeps its id");
    assert_eq!(outcome.superseded.len(), 1);
    assert_eq!(outcome.superseded[0].id, a.id);
    assert_eq!(outcome.superseded[0].superseded_by.as_deref(), Some(b.id.as_str()));

    // Same created_at: lexicographically smaller id survives.
    let mut c = make_entity(EntityKind::System, "Opera", &["d1"], &[], 100);
    let mut d = make_entity(EntityKind::System, "opera", &["d2"], &[], 100);
    c.id = "aaa".into();
    d.id = "bbb".into();
    let outcome = merge_group(vec![d, c], &MergeConfig::default());
    assert_eq!(outcome.merged.id, "aaa");
}

#[test]
fn sources_union_not_sum() {
    let a = make_entity(EntityKind::System, "Opera", &["d1", "d2"], &[], 1);
    let b = make_entity(EntityKind::System, "opera", &["d2", "d3"], &[], 2);
    let c = make_entity(EntityKind::System, "OPERA PMS", &["d4"], &[], 3);
    let outcome = merge_group(vec![a, b, c], &MergeConfig::default());
    let expected: BTreeSet<String> =
        ["d1", "d2", "d3", "d4"].iter().map(|s| s.to_string()).collect();
    assert_eq!(outcome.merged.sources, expected);
    assert_eq!(outcome.merged.source_count(), 4, "union cardinality, not 5");
}

#[test]
fn conflicting_frequency_is_flagged() {
    let a = make_entity(EntityKind::PainPoint, "night audit fails", &["d1"], &[("frequency", "daily")], 1);
    let b = make_entity(EntityKind::PainPoint, "night audit fails", &["d2"], &[("frequency", "weekly")], 2);
    let outcome = merge_group(vec![a, b], &MergeConfig::default());
    assert!(outcome.merged.has_contradictions);
    assert_eq!(outcome.contradictions.len(), 1);
    let contradiction = &outcome.contradictions[0];
    assert_eq!(contradiction.attribute, "frequency");
    assert_eq!(contradiction.values, vec!["daily".to_string(), "weekly".to_string()]);
    assert!(contradiction.similarity < 0.7);
}

#[test]
fn bilingual_synonyms_are_agreement_not_contradiction() {
    let a = make_entity(EntityKind::PainPoint, "night audit fails", &["d1"], &[("severity", "alta")], 1);
    let b = make_entity(EntityKind::PainPoint, "night audit fails", &["d2"], &[("severity", "high")], 2);
    let outcome = merge_group(vec![a, b], &MergeConfig::default());
    assert!(!outcome.merged.has_contradictions, "alta/high are the same value");
    assert!(outcome.contradictions.is_empty());
    assert_eq!(outcome.agreed_attributes, 1);
}

#[test]
fn single_member_attribute_is_additive() {
    let a = make_entity(EntityKind::System, "Opera", &["d1"], &[("vendor", "Oracle")], 1);
    let b = make_entity(EntityKind::System, "opera", &["d2"], &[("criticality", "alta")], 2);
    let outcome = merge_group(vec![a, b], &MergeConfig::default());
    assert!(outcome.contradictions.is_empty());
    assert_eq!(outcome.agreed_attributes, 0, "no attribute had two voices");
    let entries = outcome.merged.attrs.entries();
    assert_eq!(entries["vendor"].render(), "Oracle");
    assert_eq!(entries["criticality"].render(), "alta");
}

#[test]
fn merge_is_commutative_across_permutations() {
    let a = make_entity(
        EntityKind::PainPoint,
        "checkin queue",
        &["d1", "d2"],
        &[("severity", "alta"), ("frequency", "daily")],
        10,
    );
    let b = make_entity(
        EntityKind::PainPoint,
        "check-in queue",
        &["d3"],
        &[("severity", "high"), ("frequency", "weekly")],
        20,
    );
    let c = make_entity(
        EntityKind::PainPoint,
        "queue at check in",
        &["d2", "d4"],
        &[("impact_area", "front desk")],
        30,
    );

    let base = merge_group(vec![a.clone(), b.clone(), c.clone()], &MergeConfig::default());
    let permutations: Vec<Vec<Entity>> = vec![
        vec![c.clone(), b.clone(), a.clone()],
        vec![b.clone(), a.clone(), c.clone()],
        vec![c.clone(), a.clone(), b.clone()],
    ];
    for permuted in permutations {
        let outcome = merge_group(permuted, &MergeConfig::default());
        assert_eq!(outcome.merged.id, base.merged.id);
        assert_eq!(outcome.merged.name, base.merged.name);
        assert_eq!(outcome.merged.description, base.merged.description);
        assert_eq!(outcome.merged.sources, base.merged.sources);
        assert_eq!(outcome.merged.attrs.entries(), base.merged.attrs.entries());
        assert_eq!(outcome.contradictions, base.contradictions);
        assert_eq!(outcome.agreed_attributes, base.agreed_attributes);
    }
}

#[test]
fn near_identical_sentences_are_deduplicated() {
    let mut a = make_entity(EntityKind::PainPoint, "night audit fails", &["d1"], &[], 1);
    a.description = "The night audit crashes often. Staff restart it manually.".into();
    let mut b = make_entity(EntityKind::PainPoint, "night audit fails", &["d2"], &[], 2);
    b.description = "The night audit crashes often. It blocks next-day reporting.".into();

    let outcome = merge_group(vec![a, b], &MergeConfig::default());
    let crash_mentions = outcome
        .merged
        .description
        .matches("night audit crashes")
        .count();
    assert_eq!(crash_mentions, 1, "repeated sentence kept once");
    assert!(outcome.merged.description.contains("Staff restart it manually"));
    assert!(outcome.merged.description.contains("blocks next-day reporting"));
}

#[test]
fn merged_entity_is_marked_consolidated() {
    let a = make_entity(EntityKind::System, "Opera", &["d1"], &[], 1);
    let b = make_entity(EntityKind::System, "opera", &["d2"], &[], 2);
    let outcome = merge_group(vec![a, b], &MergeConfig::default());
    assert!(outcome.merged.is_consolidated);
    assert!(outcome.merged.consolidated_at.is_some());
    assert!(outcome.merged.superseded_by.is_none());
}

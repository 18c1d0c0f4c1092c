mod common;

use std::sync::Arc;

use converge::consolidate::DuplicateDetector;
use converge::entity::{Entity, EntityInput, EntityKind};

use common::{ingest, open_store, opera_vectors, test_config, test_embedder, FakeProvider};

fn system_pool(store: &converge::SharedStore) -> Vec<Entity> {
    ingest(store, EntityKind::System, "Opera", &["d1", "d2"]);
    ingest(store, EntityKind::System, "opera", &["d2", "d3"]);
    ingest(store, EntityKind::System, "OPERA PMS", &["d4"]);
    ingest(store, EntityKind::System, "SAP", &["d5", "d6"]);
    ingest(store, EntityKind::System, "Simphony", &["d7"]);
    store.list_kind(EntityKind::System).unwrap()
}

#[tokio::test]
async fn opera_family_groups_sap_and_simphony_stay_apart() {
    let store = open_store();
    let pool = system_pool(&store);
    let provider = Arc::new(FakeProvider::new(&opera_vectors()));
    let embedder = test_embedder(&store, Some(provider.clone()));

    let cfg = test_config();
    let detector = DuplicateDetector::new(&cfg);
    let groups = detector
        .find_groups(EntityKind::System, &pool, &embedder)
        .await
        .unwrap();

    assert_eq!(groups.len(), 1, "exactly one duplicate group expected");
    let names: Vec<&str> = groups[0].iter().map(|&i| pool[i].name.as_str()).collect();
    assert_eq!(names.len(), 3);
    for expected in ["Opera", "opera", "OPERA PMS"] {
        assert!(names.contains(&expected), "{expected} missing from group");
    }
}

#[tokio::test]
async fn fuzzy_first_filter_limits_semantic_calls() {
    let store = open_store();
    let pool = system_pool(&store);
    let provider = Arc::new(FakeProvider::new(&opera_vectors()));
    let embedder = test_embedder(&store, Some(provider.clone()));

    let cfg = test_config();
    let detector = DuplicateDetector::new(&cfg);
    detector
        .find_groups(EntityKind::System, &pool, &embedder)
        .await
        .unwrap();

    // Ten pairs total, but only the opera/opera-pms ambiguous band needs
    // embeddings: one batched call, two unique texts.
    assert_eq!(provider.call_count(), 1);
    let stats = embedder.stats();
    assert_eq!(stats.misses, 2, "only two texts should reach the provider");
}

#[tokio::test]
async fn identical_names_skip_semantic_entirely() {
    let store = open_store();
    ingest(&store, EntityKind::System, "Opera", &["d1"]);
    ingest(&store, EntityKind::System, "opera", &["d2"]);
    ingest(&store, EntityKind::System, "SAP", &["d3"]);
    let pool = store.list_kind(EntityKind::System).unwrap();

    let provider = Arc::new(FakeProvider::new(&[]));
    let embedder = test_embedder(&store, Some(provider.clone()));
    let cfg = test_config();
    let detector = DuplicateDetector::new(&cfg);
    let groups = detector
        .find_groups(EntityKind::System, &pool, &embedder)
        .await
        .unwrap();

    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].len(), 2);
    assert_eq!(provider.call_count(), 0, "certain duplicates must not embed");
}

#[tokio::test]
async fn without_provider_detection_is_lexical_only() {
    let store = open_store();
    let pool = system_pool(&store);
    let embedder = test_embedder(&store, None);

    let cfg = test_config();
    let detector = DuplicateDetector::new(&cfg);
    let groups = detector
        .find_groups(EntityKind::System, &pool, &embedder)
        .await
        .unwrap();

    // Opera/opera still match on lexical identity; OPERA PMS needs the
    // semantic leg and stays out.
    assert_eq!(groups.len(), 1);
    let mut names: Vec<&str> = groups[0].iter().map(|&i| pool[i].name.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["Opera", "opera"]);
}

#[tokio::test]
async fn kpi_thresholds_are_tighter_than_pain_points() {
    let store = open_store();
    // The same name pair under two kinds: lexically similar, not identical.
    ingest(&store, EntityKind::PainPoint, "front desk overload", &["d1"]);
    ingest(&store, EntityKind::PainPoint, "front desk overtime", &["d2"]);
    ingest(&store, EntityKind::Kpi, "front desk overload", &["d1"]);
    ingest(&store, EntityKind::Kpi, "front desk overtime", &["d2"]);

    let embedder = test_embedder(&store, None);
    let cfg = test_config();
    let detector = DuplicateDetector::new(&cfg);

    let pains = store.list_kind(EntityKind::PainPoint).unwrap();
    let pain_groups = detector
        .find_groups(EntityKind::PainPoint, &pains, &embedder)
        .await
        .unwrap();
    assert_eq!(pain_groups.len(), 1, "loose pain-point threshold should match");

    let kpis = store.list_kind(EntityKind::Kpi).unwrap();
    let kpi_groups = detector
        .find_groups(EntityKind::Kpi, &kpis, &embedder)
        .await
        .unwrap();
    // "adr variance" vs "adr variances" sits below the 0.90 KPI bar without
    // semantic confirmation.
    assert!(kpi_groups.is_empty(), "tight KPI threshold should not match lexically");
}

#[tokio::test]
async fn empty_and_singleton_pools_yield_no_groups() {
    let store = open_store();
    let embedder = test_embedder(&store, None);
    let cfg = test_config();
    let detector = DuplicateDetector::new(&cfg);

    let groups = detector
        .find_groups(EntityKind::System, &[], &embedder)
        .await
        .unwrap();
    assert!(groups.is_empty());

    let one = vec![store
        .ingest(EntityInput::new(EntityKind::System, "Opera").source("d1"))
        .unwrap()];
    let groups = detector
        .find_groups(EntityKind::System, &one, &embedder)
        .await
        .unwrap();
    assert!(groups.is_empty());
}

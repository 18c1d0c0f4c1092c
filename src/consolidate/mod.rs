//! Consolidation orchestration.
//!
//! One run is one logical transaction: every kind is processed sequentially
//! (detect → merge → score), relationships and patterns are derived over the
//! staged result, and everything commits atomically. A failure anywhere
//! before or during commit leaves the store exactly as it was.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

pub mod detect;
pub mod merge;
pub mod patterns;
pub mod relate;
pub mod score;

pub use detect::DuplicateDetector;
pub use merge::{merge_group, MergeOutcome};
pub use score::{score, ScoreInputs, Verdict};

use crate::config::EngineConfig;
use crate::embed::{CacheStats, Embedder};
use crate::entity::{AuditRecord, ChangeEvent, Entity, EntityKind};
use crate::error::ConvergeError;
use crate::store::{now_ms, StagedRun};
use crate::{store_call, SharedStore};

/// Cooperative cancellation. Checked between stages; cancelling after commit
/// begins has no effect — commit is the point of no return.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), ConvergeError> {
        if self.is_cancelled() {
            Err(ConvergeError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Committing,
    Committed,
    Failing,
    RolledBack,
}

#[derive(Debug, Clone, Serialize)]
pub struct KindReport {
    pub kind: EntityKind,
    pub loaded: usize,
    pub rejected: usize,
    pub duplicate_groups: usize,
    /// Entities superseded into a survivor this run.
    pub merged_away: usize,
    pub contradictions: usize,
    /// Entities whose confidence or review flag changed.
    pub scored: usize,
}

#[derive(Debug, Serialize)]
pub struct ConsolidationReport {
    pub run_id: String,
    pub state: RunState,
    pub kinds: Vec<KindReport>,
    pub relationships: usize,
    pub patterns: usize,
    pub total_source_documents: usize,
    pub cache: CacheStats,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// True unless the run committed: a failed run never leaves partial state.
    pub store_unchanged: bool,
}

pub struct ConsolidationAgent {
    store: SharedStore,
    embedder: Arc<Embedder>,
    cfg: EngineConfig,
    cancel: CancelToken,
}

impl ConsolidationAgent {
    pub fn new(store: SharedStore, embedder: Arc<Embedder>, cfg: EngineConfig) -> Self {
        Self { store, embedder, cfg, cancel: CancelToken::new() }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run consolidation over the given kinds as one transaction.
    pub async fn run(&self, kinds: &[EntityKind]) -> ConsolidationReport {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut report = ConsolidationReport {
            run_id: run_id.clone(),
            state: RunState::Running,
            kinds: Vec::new(),
            relationships: 0,
            patterns: 0,
            total_source_documents: 0,
            cache: CacheStats::default(),
            duration_ms: 0,
            error: None,
            store_unchanged: true,
        };
        info!(run_id = %run_id, kinds = kinds.len(), "consolidation run starting");

        match self.prepare(&run_id, kinds, &mut report).await {
            Ok(staged) => {
                report.state = RunState::Committing;
                let store = self.store.clone();
                let commit = store_call(&store, move |s| s.commit_run(&staged)).await;
                match commit.and_then(|inner| inner) {
                    Ok(()) => {
                        report.state = RunState::Committed;
                        report.store_unchanged = false;
                    }
                    Err(e) => self.fail(&run_id, &mut report, e).await,
                }
            }
            Err(e) => self.fail(&run_id, &mut report, e).await,
        }

        report.cache = self.embedder.stats();
        report.duration_ms = started.elapsed().as_millis() as u64;
        match report.state {
            RunState::Committed => info!(
                run_id = %report.run_id,
                relationships = report.relationships,
                patterns = report.patterns,
                duration_ms = report.duration_ms,
                "consolidation committed"
            ),
            _ => warn!(
                run_id = %report.run_id,
                error = report.error.as_deref().unwrap_or("unknown"),
                "consolidation rolled back, store unchanged"
            ),
        }
        report
    }

    async fn fail(&self, run_id: &str, report: &mut ConsolidationReport, e: ConvergeError) {
        report.state = RunState::Failing;
        report.error = Some(e.to_string());
        report.store_unchanged = true;
        let store = self.store.clone();
        let rid = run_id.to_string();
        let msg = e.to_string();
        if let Err(mark_err) = store_call(&store, move |s| s.mark_run_rolled_back(&rid, &msg))
            .await
            .and_then(|inner| inner)
        {
            warn!(error = %mark_err, "failed to record rolled-back run");
        }
        report.state = RunState::RolledBack;
    }

    /// Stage the whole run. Nothing here writes to the store.
    async fn prepare(
        &self,
        run_id: &str,
        kinds: &[EntityKind],
        report: &mut ConsolidationReport,
    ) -> Result<StagedRun, ConvergeError> {
        {
            let store = self.store.clone();
            let rid = run_id.to_string();
            store_call(&store, move |s| s.create_run(&rid)).await??;
        }
        self.cancel.check()?;

        // Load every kind: requested kinds get consolidated, the rest still
        // participate in relationship discovery and the corpus size.
        let mut pools: HashMap<EntityKind, Vec<Entity>> = HashMap::new();
        let mut rejected_by_kind: HashMap<EntityKind, usize> = HashMap::new();
        for kind in EntityKind::ALL {
            let store = self.store.clone();
            let loaded = store_call(&store, move |s| s.list_kind(kind)).await??;
            let mut valid = Vec::with_capacity(loaded.len());
            let mut rejected = 0usize;
            for entity in loaded {
                if entity.name.trim().is_empty() || entity.sources.is_empty() {
                    warn!(kind = %kind, id = %entity.id, "skipping malformed entity record");
                    rejected += 1;
                } else {
                    valid.push(entity);
                }
            }
            rejected_by_kind.insert(kind, rejected);
            pools.insert(kind, valid);
        }

        let total_docs = {
            let mut docs: BTreeSet<&str> = BTreeSet::new();
            for pool in pools.values() {
                for entity in pool {
                    docs.extend(entity.sources.iter().map(String::as_str));
                }
            }
            docs.len()
        };
        report.total_source_documents = total_docs;

        let mut staged = StagedRun::new(run_id);
        let detector = DuplicateDetector::new(&self.cfg);

        for &kind in kinds {
            self.cancel.check()?;
            let pool = pools.remove(&kind).unwrap_or_default();
            let mut kind_report = KindReport {
                kind,
                loaded: pool.len(),
                rejected: rejected_by_kind.get(&kind).copied().unwrap_or(0),
                duplicate_groups: 0,
                merged_away: 0,
                contradictions: 0,
                scored: 0,
            };

            let groups = detector.find_groups(kind, &pool, &self.embedder).await?;
            kind_report.duplicate_groups = groups.len();

            let mut grouped: HashSet<usize> = HashSet::new();
            let mut consolidated: Vec<Entity> = Vec::new();

            for group_indices in &groups {
                grouped.extend(group_indices.iter().copied());
                let members: Vec<Entity> =
                    group_indices.iter().map(|&i| pool[i].clone()).collect();
                let outcome = merge_group(members.clone(), &self.cfg.merge);
                let mut merged = outcome.merged;

                let verdict = score(
                    &ScoreInputs {
                        source_count: merged.source_count(),
                        agreed_attributes: merged.agreed_attributes,
                        contradictions: merged.contradiction_details.len(),
                    },
                    total_docs,
                    &self.cfg.scorer,
                );
                merged.consensus_confidence = verdict.confidence;
                merged.needs_review = verdict.needs_review;

                kind_report.merged_away += outcome.superseded.len();
                kind_report.contradictions += merged.contradiction_details.len();

                let before_refs: Vec<&Entity> = members.iter().collect();
                let mut after_refs: Vec<&Entity> = vec![&merged];
                after_refs.extend(outcome.superseded.iter());
                staged.audits.push(AuditRecord::new(run_id, kind, "merge", &before_refs, &after_refs));

                staged.events.push(ChangeEvent::new(
                    run_id,
                    "entity_merged",
                    &merged.id,
                    serde_json::json!({
                        "kind": kind.as_str(),
                        "superseded": outcome.superseded.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
                        "confidence": merged.consensus_confidence,
                        "contradictions": merged.contradiction_details.len(),
                    }),
                ));

                staged.entities.extend(outcome.superseded.iter().cloned());
                staged.entities.push(merged.clone());
                consolidated.push(merged);
            }

            for (idx, entity) in pool.iter().enumerate() {
                if grouped.contains(&idx) {
                    continue;
                }
                let mut entity = entity.clone();
                let verdict = score(
                    &ScoreInputs {
                        source_count: entity.source_count(),
                        agreed_attributes: entity.agreed_attributes,
                        contradictions: entity.contradiction_details.len(),
                    },
                    total_docs,
                    &self.cfg.scorer,
                );
                let changed = entity.consensus_confidence != verdict.confidence
                    || entity.needs_review != verdict.needs_review
                    || !entity.is_consolidated;
                if changed {
                    let before = entity.clone();
                    entity.consensus_confidence = verdict.confidence;
                    entity.needs_review = verdict.needs_review;
                    entity.is_consolidated = true;
                    entity.consolidated_at = Some(now_ms());
                    staged.audits.push(AuditRecord::new(
                        run_id,
                        kind,
                        "score",
                        &[&before],
                        &[&entity],
                    ));
                    staged.events.push(ChangeEvent::new(
                        run_id,
                        "entity_scored",
                        &entity.id,
                        serde_json::json!({
                            "kind": kind.as_str(),
                            "confidence": entity.consensus_confidence,
                            "needs_review": entity.needs_review,
                        }),
                    ));
                    staged.entities.push(entity.clone());
                    kind_report.scored += 1;
                }
                consolidated.push(entity);
            }

            info!(
                kind = %kind,
                loaded = kind_report.loaded,
                groups = kind_report.duplicate_groups,
                merged_away = kind_report.merged_away,
                contradictions = kind_report.contradictions,
                "kind consolidated"
            );
            pools.insert(kind, consolidated);
            report.kinds.push(kind_report);
        }

        self.cancel.check()?;

        // Relationship and pattern discovery over the staged consolidated
        // view of the whole corpus.
        let view: Vec<Entity> = pools.into_values().flatten().collect();
        let relationships = relate::discover(&view, run_id, &self.cfg.relate);
        for rel in &relationships {
            staged.events.push(ChangeEvent::new(
                run_id,
                "relationship_created",
                &rel.id,
                serde_json::json!({
                    "from": rel.from_id,
                    "to": rel.to_id,
                    "type": rel.rel_type,
                    "strength": rel.strength,
                    "evidence_count": rel.evidence_count,
                }),
            ));
        }
        let found_patterns =
            patterns::recognize(&view, &relationships, total_docs, run_id, &self.cfg.patterns);
        for pattern in &found_patterns {
            staged.events.push(ChangeEvent::new(
                run_id,
                "pattern_detected",
                &pattern.id,
                serde_json::json!({
                    "pattern_type": pattern.pattern_type.as_str(),
                    "members": pattern.member_ids,
                    "priority": pattern.priority,
                }),
            ));
        }
        report.relationships = relationships.len();
        report.patterns = found_patterns.len();
        staged.relationships = relationships;
        staged.patterns = found_patterns;

        self.cancel.check()?;
        Ok(staged)
    }
}

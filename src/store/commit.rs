//! Staged-run commit, rollback, and the change-event outbox.
//!
//! A consolidation run stages every mutation in memory; nothing touches the
//! store until [`SqliteStore::commit_run`] applies the whole run in one
//! transaction. A failure anywhere drops the transaction and the store is
//! exactly as it was.

use rusqlite::{params, OptionalExtension};
use tracing::info;

use super::{entities::upsert_entity, now_ms, RunStatus, SqliteStore};
use crate::entity::{AuditRecord, ChangeEvent, Entity, Pattern, Relationship};
use crate::error::ConvergeError;

/// Everything one run intends to write.
#[derive(Debug, Default)]
pub struct StagedRun {
    pub run_id: String,
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
    pub patterns: Vec<Pattern>,
    pub audits: Vec<AuditRecord>,
    pub events: Vec<ChangeEvent>,
}

impl StagedRun {
    pub fn new(run_id: &str) -> Self {
        Self { run_id: run_id.to_string(), ..Default::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
            && self.relationships.is_empty()
            && self.patterns.is_empty()
    }
}

impl SqliteStore {
    /// Apply a staged run atomically. Relationships and patterns are derived
    /// state re-computed every run, so their tables are replaced wholesale.
    pub fn commit_run(&self, staged: &StagedRun) -> Result<(), ConvergeError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        for entity in &staged.entities {
            upsert_entity(&tx, entity)?;
        }

        // Referential integrity: every edge endpoint must resolve to a live
        // entity after this run's entity writes.
        for rel in &staged.relationships {
            for endpoint in [&rel.from_id, &rel.to_id] {
                let superseded_by: Option<Option<String>> = tx
                    .query_row(
                        "SELECT superseded_by FROM entities WHERE id = ?1",
                        [endpoint],
                        |row| row.get(0),
                    )
                    .optional()?;
                match superseded_by {
                    None => {
                        return Err(ConvergeError::Integrity(format!(
                            "relationship {} references missing entity {endpoint}",
                            rel.rel_type
                        )))
                    }
                    Some(Some(survivor)) => {
                        return Err(ConvergeError::Integrity(format!(
                            "relationship {} references superseded entity {endpoint} (superseded by {survivor})",
                            rel.rel_type
                        )))
                    }
                    Some(None) => {}
                }
            }
        }

        tx.execute("DELETE FROM relationships", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO relationships (id, from_id, to_id, rel_type, strength, evidence_count, run_id) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7)",
            )?;
            for rel in &staged.relationships {
                stmt.execute(params![
                    rel.id,
                    rel.from_id,
                    rel.to_id,
                    rel.rel_type,
                    rel.strength,
                    rel.evidence_count as i64,
                    rel.run_id,
                ])?;
            }
        }

        tx.execute("DELETE FROM patterns", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO patterns (id, pattern_type, member_ids, frequency, priority, run_id) \
                 VALUES (?1,?2,?3,?4,?5,?6)",
            )?;
            for pattern in &staged.patterns {
                stmt.execute(params![
                    pattern.id,
                    pattern.pattern_type.as_str(),
                    serde_json::to_string(&pattern.member_ids)
                        .map_err(|e| ConvergeError::Internal(format!("members encode: {e}")))?,
                    pattern.frequency,
                    pattern.priority,
                    pattern.run_id,
                ])?;
            }
        }

        {
            let mut stmt = tx.prepare(
                "INSERT INTO audit_log \
                 (id, run_id, entity_kind, operation, before_snapshot, after_snapshot, \
                  created_at, processed, error_message, reversed) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            )?;
            for audit in &staged.audits {
                stmt.execute(params![
                    audit.id,
                    audit.run_id,
                    audit.entity_kind.as_str(),
                    audit.operation,
                    audit.before_snapshot,
                    audit.after_snapshot,
                    audit.created_at,
                    audit.processed,
                    audit.error_message,
                    audit.reversed,
                ])?;
            }
        }

        {
            let mut stmt = tx.prepare(
                "INSERT INTO change_events (run_id, event_type, subject_id, payload, created_at, dispatched) \
                 VALUES (?1,?2,?3,?4,?5,0)",
            )?;
            for event in &staged.events {
                stmt.execute(params![
                    event.run_id,
                    event.event_type,
                    event.subject_id,
                    event.payload,
                    event.created_at,
                ])?;
            }
        }

        let updated = tx.execute(
            "UPDATE runs SET status = ?1, finished_at = ?2 WHERE run_id = ?3 AND status = ?4",
            params![
                RunStatus::Committed.as_str(),
                now_ms(),
                staged.run_id,
                RunStatus::Running.as_str()
            ],
        )?;
        if updated != 1 {
            return Err(ConvergeError::Integrity(format!(
                "run {} is not in running state",
                staged.run_id
            )));
        }

        tx.commit()?;
        info!(
            run_id = %staged.run_id,
            entities = staged.entities.len(),
            relationships = staged.relationships.len(),
            patterns = staged.patterns.len(),
            "run committed"
        );
        Ok(())
    }

    /// Restore every before-snapshot of a committed run, newest mutation
    /// first, and mark the run reversed. Only valid against a committed run —
    /// never a running one.
    pub fn rollback_run(&self, run_id: &str) -> Result<usize, ConvergeError> {
        match self.run_status(run_id)? {
            Some(RunStatus::Committed) => {}
            Some(status) => {
                return Err(ConvergeError::Integrity(format!(
                    "rollback requires a committed run, {run_id} is {}",
                    status.as_str()
                )))
            }
            None => return Err(ConvergeError::NotFound),
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let records: Vec<(String, String)> = {
            let mut stmt = tx.prepare(
                "SELECT id, before_snapshot FROM audit_log \
                 WHERE run_id = ?1 AND reversed = 0 ORDER BY rowid DESC",
            )?;
            let rows = stmt.query_map([run_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out
        };

        let mut restored = 0usize;
        for (audit_id, before_snapshot) in &records {
            let entities: Vec<Entity> = serde_json::from_str(before_snapshot)
                .map_err(|e| ConvergeError::Internal(format!("snapshot decode: {e}")))?;
            for entity in &entities {
                upsert_entity(&tx, entity)?;
                restored += 1;
            }
            tx.execute("UPDATE audit_log SET reversed = 1 WHERE id = ?1", [audit_id])?;
        }

        // Derived state from the reversed run no longer describes the store.
        tx.execute("DELETE FROM relationships WHERE run_id = ?1", [run_id])?;
        tx.execute("DELETE FROM patterns WHERE run_id = ?1", [run_id])?;

        tx.execute(
            "UPDATE runs SET status = ?1, finished_at = ?2 WHERE run_id = ?3",
            params![RunStatus::Reversed.as_str(), now_ms(), run_id],
        )?;

        tx.commit()?;
        info!(run_id, restored, "run rolled back from audit snapshots");
        Ok(restored)
    }

    pub fn audit_records(&self, run_id: &str) -> Result<Vec<AuditRecord>, ConvergeError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, run_id, entity_kind, operation, before_snapshot, after_snapshot, \
             created_at, processed, error_message, reversed \
             FROM audit_log WHERE run_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map([run_id], |row| {
            let kind_str: String = row.get("entity_kind")?;
            Ok(AuditRecord {
                id: row.get("id")?,
                run_id: row.get("run_id")?,
                entity_kind: kind_str.parse().map_err(|_| {
                    rusqlite::Error::FromSqlConversionFailure(
                        2,
                        rusqlite::types::Type::Text,
                        format!("unknown kind: {kind_str}").into(),
                    )
                })?,
                operation: row.get("operation")?,
                before_snapshot: row.get("before_snapshot")?,
                after_snapshot: row.get("after_snapshot")?,
                created_at: row.get("created_at")?,
                processed: row.get("processed")?,
                error_message: row.get("error_message")?,
                reversed: row.get("reversed")?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn list_relationships(&self) -> Result<Vec<Relationship>, ConvergeError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, from_id, to_id, rel_type, strength, evidence_count, run_id \
             FROM relationships ORDER BY rel_type, from_id, to_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Relationship {
                id: row.get(0)?,
                from_id: row.get(1)?,
                to_id: row.get(2)?,
                rel_type: row.get(3)?,
                strength: row.get(4)?,
                evidence_count: row.get::<_, i64>(5)? as usize,
                run_id: row.get(6)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn list_patterns(&self) -> Result<Vec<Pattern>, ConvergeError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, pattern_type, member_ids, frequency, priority, run_id \
             FROM patterns ORDER BY priority DESC, id",
        )?;
        let rows = stmt.query_map([], |row| {
            let type_str: String = row.get(1)?;
            let members_json: String = row.get(2)?;
            Ok(Pattern {
                id: row.get(0)?,
                pattern_type: type_str.parse().map_err(|_| {
                    rusqlite::Error::FromSqlConversionFailure(
                        1,
                        rusqlite::types::Type::Text,
                        format!("unknown pattern type: {type_str}").into(),
                    )
                })?,
                member_ids: serde_json::from_str(&members_json).unwrap_or_default(),
                frequency: row.get(3)?,
                priority: row.get(4)?,
                run_id: row.get(5)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Outbox: undispatched change events, oldest first.
    pub fn pending_events(&self, limit: usize) -> Result<Vec<ChangeEvent>, ConvergeError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT seq, run_id, event_type, subject_id, payload, created_at, dispatched \
             FROM change_events WHERE dispatched = 0 ORDER BY seq LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok(ChangeEvent {
                seq: row.get(0)?,
                run_id: row.get(1)?,
                event_type: row.get(2)?,
                subject_id: row.get(3)?,
                payload: row.get(4)?,
                created_at: row.get(5)?,
                dispatched: row.get(6)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn mark_dispatched(&self, seq: i64) -> Result<(), ConvergeError> {
        self.conn()?.execute("UPDATE change_events SET dispatched = 1 WHERE seq = ?1", [seq])?;
        Ok(())
    }
}

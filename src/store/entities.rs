//! Entity CRUD. Kind strings bound into queries always come from
//! [`EntityKind::as_str`] — the enum is the allow-list.

use rusqlite::{params, OptionalExtension};
use tracing::warn;

use super::SqliteStore;
use crate::entity::{validate_input, Entity, EntityInput, EntityKind};
use crate::error::ConvergeError;

const ENTITY_COLS: &str = "id, kind, name, description, attrs, sources, \
    consensus_confidence, has_contradictions, contradiction_details, needs_review, \
    agreed_attributes, is_consolidated, consolidated_at, superseded_by, created_at";

pub(super) fn entity_from_row(row: &rusqlite::Row) -> rusqlite::Result<Entity> {
    let kind_str: String = row.get("kind")?;
    let attrs_json: String = row.get("attrs")?;
    let sources_json: String = row.get("sources")?;
    let contradictions_json: String = row.get("contradiction_details")?;
    let kind: EntityKind = kind_str.parse().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown kind: {kind_str}").into(),
        )
    })?;
    Ok(Entity {
        id: row.get("id")?,
        kind,
        name: row.get("name")?,
        description: row.get("description")?,
        attrs: serde_json::from_str(&attrs_json)
            .unwrap_or_else(|_| crate::entity::Attrs::empty(kind)),
        sources: serde_json::from_str(&sources_json).unwrap_or_default(),
        consensus_confidence: row.get("consensus_confidence")?,
        has_contradictions: row.get("has_contradictions")?,
        contradiction_details: serde_json::from_str(&contradictions_json).unwrap_or_default(),
        needs_review: row.get("needs_review")?,
        agreed_attributes: row.get::<_, i64>("agreed_attributes")? as usize,
        is_consolidated: row.get("is_consolidated")?,
        consolidated_at: row.get("consolidated_at")?,
        superseded_by: row.get("superseded_by")?,
        created_at: row.get("created_at")?,
    })
}

pub(super) fn upsert_entity(
    conn: &rusqlite::Connection,
    e: &Entity,
) -> Result<(), ConvergeError> {
    conn.execute(
        "INSERT OR REPLACE INTO entities \
         (id, kind, name, description, attrs, sources, consensus_confidence, \
          has_contradictions, contradiction_details, needs_review, agreed_attributes, \
          is_consolidated, consolidated_at, superseded_by, created_at) \
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
        params![
            e.id,
            e.kind.as_str(),
            e.name,
            e.description,
            serde_json::to_string(&e.attrs)
                .map_err(|err| ConvergeError::Internal(format!("attrs encode: {err}")))?,
            serde_json::to_string(&e.sources)
                .map_err(|err| ConvergeError::Internal(format!("sources encode: {err}")))?,
            e.consensus_confidence,
            e.has_contradictions,
            serde_json::to_string(&e.contradiction_details)
                .map_err(|err| ConvergeError::Internal(format!("contradictions encode: {err}")))?,
            e.needs_review,
            e.agreed_attributes as i64,
            e.is_consolidated,
            e.consolidated_at,
            e.superseded_by,
            e.created_at,
        ],
    )?;
    Ok(())
}

impl SqliteStore {
    /// Validate and store a record handed over by the extraction
    /// collaborator. Malformed records are rejected here, per-record.
    pub fn ingest(&self, input: EntityInput) -> Result<Entity, ConvergeError> {
        let entity = validate_input(&input)?;
        let conn = self.conn()?;
        upsert_entity(&conn, &entity)?;
        Ok(entity)
    }

    /// Ingest a batch, skipping (and logging) malformed records. Returns the
    /// accepted entities and the rejection count.
    pub fn ingest_batch(&self, inputs: Vec<EntityInput>) -> Result<(Vec<Entity>, usize), ConvergeError> {
        let mut accepted = Vec::with_capacity(inputs.len());
        let mut rejected = 0usize;
        for input in inputs {
            match self.ingest(input) {
                Ok(e) => accepted.push(e),
                Err(ConvergeError::Validation(msg)) | Err(ConvergeError::UnknownKind(msg)) => {
                    warn!(reason = %msg, "rejected malformed entity record");
                    rejected += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok((accepted, rejected))
    }

    pub fn get_entity(&self, id: &str) -> Result<Option<Entity>, ConvergeError> {
        let conn = self.conn()?;
        let entity = conn
            .query_row(
                &format!("SELECT {ENTITY_COLS} FROM entities WHERE id = ?1"),
                [id],
                entity_from_row,
            )
            .optional()?;
        Ok(entity)
    }

    /// All live (non-superseded) entities of one kind, oldest first so
    /// survivor selection is stable.
    pub fn list_kind(&self, kind: EntityKind) -> Result<Vec<Entity>, ConvergeError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTITY_COLS} FROM entities \
             WHERE kind = ?1 AND superseded_by IS NULL \
             ORDER BY created_at, id"
        ))?;
        let rows = stmt.query_map([kind.as_str()], entity_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Every entity of a kind including superseded ones — audit tooling.
    pub fn list_kind_all(&self, kind: EntityKind) -> Result<Vec<Entity>, ConvergeError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTITY_COLS} FROM entities WHERE kind = ?1 ORDER BY created_at, id"
        ))?;
        let rows = stmt.query_map([kind.as_str()], entity_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn count_consolidated(&self) -> Result<usize, ConvergeError> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM entities WHERE is_consolidated = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }
}

//! Core data model: entities, relationships, patterns, audit records.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::ConvergeError;

/// Fixed set of entity kinds. The snake_case string forms below are the only
/// kind strings ever bound into store queries — anything else is rejected
/// before detection begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    PainPoint,
    System,
    Process,
    Kpi,
    Role,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::PainPoint,
        EntityKind::System,
        EntityKind::Process,
        EntityKind::Kpi,
        EntityKind::Role,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::PainPoint => "pain_point",
            EntityKind::System => "system",
            EntityKind::Process => "process",
            EntityKind::Kpi => "kpi",
            EntityKind::Role => "role",
        }
    }

    /// Attribute keys with a typed slot in [`Attrs`]; everything else lands
    /// in the overflow map.
    pub fn known_attrs(self) -> &'static [&'static str] {
        match self {
            EntityKind::PainPoint => &["severity", "frequency", "impact_area"],
            EntityKind::System => &["vendor", "category", "criticality"],
            EntityKind::Process => &["owner_role", "cadence", "automation_level"],
            EntityKind::Kpi => &["unit", "target", "direction"],
            EntityKind::Role => &["department", "seniority"],
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityKind {
    type Err = ConvergeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pain_point" => Ok(EntityKind::PainPoint),
            "system" => Ok(EntityKind::System),
            "process" => Ok(EntityKind::Process),
            "kpi" => Ok(EntityKind::Kpi),
            "role" => Ok(EntityKind::Role),
            other => Err(ConvergeError::UnknownKind(other.to_string())),
        }
    }
}

/// Attribute value. Untagged so JSON `"alta"`, `12.5` and `true` all parse
/// directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Flag(bool),
    Number(f64),
    Text(String),
}

impl AttrValue {
    /// String rendering used for similarity comparison and snapshots.
    pub fn render(&self) -> String {
        match self {
            AttrValue::Flag(b) => b.to_string(),
            AttrValue::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    format!("{n}")
                }
            }
            AttrValue::Text(s) => s.clone(),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Text(s.to_string())
    }
}

macro_rules! kind_attrs {
    ($name:ident { $($field:ident),+ $(,)? }) => {
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        pub struct $name {
            $(
                #[serde(default, skip_serializing_if = "Option::is_none")]
                pub $field: Option<AttrValue>,
            )+
            #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty")]
            pub extra: BTreeMap<String, AttrValue>,
        }

        impl $name {
            fn entries_into(&self, out: &mut BTreeMap<String, AttrValue>) {
                $(
                    if let Some(v) = &self.$field {
                        out.insert(stringify!($field).to_string(), v.clone());
                    }
                )+
                for (k, v) in &self.extra {
                    out.insert(k.clone(), v.clone());
                }
            }

            fn set(&mut self, key: &str, value: AttrValue) {
                match key {
                    $(
                        stringify!($field) => self.$field = Some(value),
                    )+
                    _ => {
                        self.extra.insert(key.to_string(), value);
                    }
                }
            }
        }
    };
}

kind_attrs!(PainPointAttrs { severity, frequency, impact_area });
kind_attrs!(SystemAttrs { vendor, category, criticality });
kind_attrs!(ProcessAttrs { owner_role, cadence, automation_level });
kind_attrs!(KpiAttrs { unit, target, direction });
kind_attrs!(RoleAttrs { department, seniority });

/// Per-kind attribute bag: typed fields for the schema each kind is known to
/// carry, plus an open overflow map for exploratory fields. Overflow is a
/// BTreeMap: merge iterates attributes in key order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Attrs {
    PainPoint(PainPointAttrs),
    System(SystemAttrs),
    Process(ProcessAttrs),
    Kpi(KpiAttrs),
    Role(RoleAttrs),
}

impl Attrs {
    pub fn empty(kind: EntityKind) -> Self {
        match kind {
            EntityKind::PainPoint => Attrs::PainPoint(PainPointAttrs::default()),
            EntityKind::System => Attrs::System(SystemAttrs::default()),
            EntityKind::Process => Attrs::Process(ProcessAttrs::default()),
            EntityKind::Kpi => Attrs::Kpi(KpiAttrs::default()),
            EntityKind::Role => Attrs::Role(RoleAttrs::default()),
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Attrs::PainPoint(_) => EntityKind::PainPoint,
            Attrs::System(_) => EntityKind::System,
            Attrs::Process(_) => EntityKind::Process,
            Attrs::Kpi(_) => EntityKind::Kpi,
            Attrs::Role(_) => EntityKind::Role,
        }
    }

    /// Flattened view over typed fields and overflow, keyed by attribute name.
    pub fn entries(&self) -> BTreeMap<String, AttrValue> {
        let mut out = BTreeMap::new();
        match self {
            Attrs::PainPoint(a) => a.entries_into(&mut out),
            Attrs::System(a) => a.entries_into(&mut out),
            Attrs::Process(a) => a.entries_into(&mut out),
            Attrs::Kpi(a) => a.entries_into(&mut out),
            Attrs::Role(a) => a.entries_into(&mut out),
        }
        out
    }

    /// Write a value back: typed field when the key is known for this kind,
    /// overflow map otherwise.
    pub fn set_entry(&mut self, key: &str, value: AttrValue) {
        match self {
            Attrs::PainPoint(a) => a.set(key, value),
            Attrs::System(a) => a.set(key, value),
            Attrs::Process(a) => a.set(key, value),
            Attrs::Kpi(a) => a.set(key, value),
            Attrs::Role(a) => a.set(key, value),
        }
    }
}

/// A detected disagreement between sources on one attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contradiction {
    pub attribute: String,
    /// The conflicting rendered values, in member order.
    pub values: Vec<String>,
    /// Lowest pairwise value similarity among the conflicting values.
    pub similarity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub kind: EntityKind,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub attrs: Attrs,
    /// Originating document ids. A set: a source counted once no matter how
    /// many angles it mentioned the entity from.
    pub sources: BTreeSet<String>,
    #[serde(default)]
    pub consensus_confidence: f64,
    #[serde(default)]
    pub has_contradictions: bool,
    #[serde(default)]
    pub contradiction_details: Vec<Contradiction>,
    #[serde(default)]
    pub needs_review: bool,
    /// Attribute keys where multiple sources agreed at the last merge.
    /// Persisted so re-scoring reproduces the same confidence.
    #[serde(default)]
    pub agreed_attributes: usize,
    #[serde(default)]
    pub is_consolidated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consolidated_at: Option<i64>,
    /// Set when this entity lost a merge; the id is never deleted so earlier
    /// relationships stay resolvable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
    pub created_at: i64,
}

impl Entity {
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub fn is_superseded(&self) -> bool {
        self.superseded_by.is_some()
    }
}

/// Raw record handed over by the extraction collaborator. Kind arrives as a
/// string and is checked against the allow-list at ingest.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntityInput {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttrValue>,
    #[serde(default)]
    pub sources: Vec<String>,
}

impl EntityInput {
    pub fn new(kind: EntityKind, name: impl Into<String>) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn description(mut self, d: impl Into<String>) -> Self {
        self.description = d.into();
        self
    }

    pub fn attr(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn source(mut self, doc: impl Into<String>) -> Self {
        self.sources.push(doc.into());
        self
    }

    pub fn sources(mut self, docs: &[&str]) -> Self {
        self.sources.extend(docs.iter().map(|s| s.to_string()));
        self
    }
}

const MAX_NAME_LEN: usize = 512;

/// Validate an input record and build the entity. Malformed records are
/// rejected per-record; they never abort a run.
pub fn validate_input(input: &EntityInput) -> Result<Entity, ConvergeError> {
    let kind: EntityKind = input.kind.parse()?;
    if input.name.trim().is_empty() {
        return Err(ConvergeError::Validation("entity name must not be empty".into()));
    }
    if input.name.chars().count() > MAX_NAME_LEN {
        return Err(ConvergeError::Validation("entity name too long".into()));
    }
    let sources: BTreeSet<String> = input
        .sources
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if sources.is_empty() {
        return Err(ConvergeError::Validation(
            "entity must carry at least one source document".into(),
        ));
    }
    let mut attrs = Attrs::empty(kind);
    for (k, v) in &input.attributes {
        attrs.set_entry(k, v.clone());
    }
    Ok(Entity {
        id: uuid::Uuid::new_v4().to_string(),
        kind,
        name: input.name.trim().to_string(),
        description: input.description.trim().to_string(),
        attrs,
        sources,
        consensus_confidence: 0.0,
        has_contradictions: false,
        contradiction_details: vec![],
        needs_review: false,
        agreed_attributes: 0,
        is_consolidated: false,
        consolidated_at: None,
        superseded_by: None,
        created_at: crate::store::now_ms(),
    })
}

/// Directed edge between two consolidated entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub from_id: String,
    pub to_id: String,
    pub rel_type: String,
    /// Jaccard overlap of the endpoints' source sets, in [0,1].
    pub strength: f64,
    /// Number of documents mentioning both endpoints.
    pub evidence_count: usize,
    pub run_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    RecurringEntity,
    HubEntity,
}

impl PatternKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PatternKind::RecurringEntity => "recurring_entity",
            PatternKind::HubEntity => "hub_entity",
        }
    }
}

impl std::str::FromStr for PatternKind {
    type Err = ConvergeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recurring_entity" => Ok(PatternKind::RecurringEntity),
            "hub_entity" => Ok(PatternKind::HubEntity),
            other => Err(ConvergeError::Internal(format!("unknown pattern kind: {other}"))),
        }
    }
}

/// Derived cross-source pattern. Recomputed wholesale each run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub id: String,
    pub pattern_type: PatternKind,
    pub member_ids: Vec<String>,
    /// Fraction of source documents involved, in [0,1].
    pub frequency: f64,
    pub priority: f64,
    pub run_id: String,
}

/// One mutation inside a run transaction. `before_snapshot` is a JSON array
/// of the entities as they stood before the operation — enough to reconstruct
/// pre-merge state exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub run_id: String,
    pub entity_kind: EntityKind,
    pub operation: String,
    pub before_snapshot: String,
    pub after_snapshot: String,
    pub created_at: i64,
    pub processed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub reversed: bool,
}

impl AuditRecord {
    pub fn new(
        run_id: &str,
        kind: EntityKind,
        operation: &str,
        before: &[&Entity],
        after: &[&Entity],
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            entity_kind: kind,
            operation: operation.to_string(),
            before_snapshot: serde_json::to_string(before).unwrap_or_else(|_| "[]".into()),
            after_snapshot: serde_json::to_string(after).unwrap_or_else(|_| "[]".into()),
            created_at: crate::store::now_ms(),
            processed: true,
            error_message: None,
            reversed: false,
        }
    }
}

/// Transactional-outbox event for downstream stores. Written in the same
/// transaction as the data it describes; consumers poll and acknowledge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(default)]
    pub seq: i64,
    pub run_id: String,
    pub event_type: String,
    pub subject_id: String,
    pub payload: String,
    pub created_at: i64,
    #[serde(default)]
    pub dispatched: bool,
}

impl ChangeEvent {
    pub fn new(run_id: &str, event_type: &str, subject_id: &str, payload: serde_json::Value) -> Self {
        Self {
            seq: 0,
            run_id: run_id.to_string(),
            event_type: event_type.to_string(),
            subject_id: subject_id.to_string(),
            payload: payload.to_string(),
            created_at: crate::store::now_ms(),
            dispatched: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_roundtrip() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
        }
        assert!("drop table".parse::<EntityKind>().is_err());
    }

    #[test]
    fn attrs_known_key_goes_typed() {
        let mut attrs = Attrs::empty(EntityKind::PainPoint);
        attrs.set_entry("severity", AttrValue::from("alta"));
        attrs.set_entry("reported_by", AttrValue::from("front desk"));
        let Attrs::PainPoint(inner) = &attrs else { panic!("wrong variant") };
        assert_eq!(inner.severity, Some(AttrValue::from("alta")));
        assert!(inner.extra.contains_key("reported_by"));
        let entries = attrs.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries["severity"].render(), "alta");
    }

    #[test]
    fn validate_rejects_missing_kind_and_sources() {
        let no_kind = EntityInput { name: "Opera".into(), sources: vec!["d1".into()], ..Default::default() };
        assert!(validate_input(&no_kind).is_err());

        let no_sources = EntityInput::new(EntityKind::System, "Opera");
        assert!(validate_input(&no_sources).is_err());
    }

    #[test]
    fn validate_dedupes_sources() {
        let input = EntityInput::new(EntityKind::System, "Opera").sources(&["d1", "d1", "d2", " "]);
        let e = validate_input(&input).unwrap();
        assert_eq!(e.source_count(), 2);
    }

    #[test]
    fn attr_value_render() {
        assert_eq!(AttrValue::Number(3.0).render(), "3");
        assert_eq!(AttrValue::Number(2.5).render(), "2.5");
        assert_eq!(AttrValue::Flag(true).render(), "true");
    }
}

//! Lexical and semantic similarity primitives.
//!
//! Lexical similarity is a token-sort normalized Levenshtein blended with
//! token Jaccard, so "OPERA PMS" ≈ "pms opera" and case/diacritics never
//! matter. Semantic similarity is plain cosine over embedding vectors.

use std::collections::HashSet;

use crate::entity::EntityKind;

/// Generic nouns that carry no identity within a kind — "the Opera system"
/// and "Opera" are the same thing. Bilingual because transcripts are.
fn stop_words(kind: EntityKind) -> &'static [&'static str] {
    match kind {
        EntityKind::System => &["system", "sistema", "software", "tool", "herramienta", "platform", "plataforma"],
        EntityKind::Process => &["process", "proceso", "procedure", "procedimiento", "workflow"],
        EntityKind::Kpi => &["kpi", "metric", "metrica", "indicator", "indicador", "rate", "tasa"],
        EntityKind::Role => &["role", "rol", "position", "puesto", "staff"],
        EntityKind::PainPoint => &["problem", "problema", "issue", "pain", "point"],
    }
}

/// Fold common Latin diacritics to ASCII. Interview transcripts mix Spanish
/// and English spellings of the same names.
fn fold_char(c: char) -> char {
    match c {
        'á' | 'à' | 'â' | 'ä' | 'ã' => 'a',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'ó' | 'ò' | 'ô' | 'ö' | 'õ' => 'o',
        'ú' | 'ù' | 'û' | 'ü' => 'u',
        'ñ' => 'n',
        'ç' => 'c',
        _ => c,
    }
}

/// Normalize an entity name for comparison and embedding-cache keying:
/// lowercase, diacritics folded, punctuation dropped, kind stop-words removed.
pub fn normalize_name(kind: EntityKind, text: &str) -> String {
    let folded: String = text
        .to_lowercase()
        .chars()
        .map(fold_char)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let stops = stop_words(kind);
    let tokens: Vec<&str> = folded
        .split_whitespace()
        .filter(|t| !stops.contains(t))
        .collect();
    if tokens.is_empty() {
        // Name was nothing but stop-words; keep it rather than comparing "".
        folded.split_whitespace().collect::<Vec<_>>().join(" ")
    } else {
        tokens.join(" ")
    }
}

/// Character-level Levenshtein distance, two-row DP.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

fn edit_similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / max_len as f64
}

fn token_jaccard(a: &str, b: &str) -> f64 {
    let ta: HashSet<&str> = a.split_whitespace().collect();
    let tb: HashSet<&str> = b.split_whitespace().collect();
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }
    let inter = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    if union == 0 {
        0.0
    } else {
        inter as f64 / union as f64
    }
}

/// Lexical similarity in [0,1] over already-normalized text. Token-sort makes
/// the edit distance reorder-tolerant; the Jaccard leg rescues cases where
/// one name is a token subset of the other ("opera" vs "opera pms").
pub fn lexical_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let sort_join = |s: &str| {
        let mut toks: Vec<&str> = s.split_whitespace().collect();
        toks.sort_unstable();
        toks.join(" ")
    };
    let sorted_a = sort_join(a);
    let sorted_b = sort_join(b);
    edit_similarity(&sorted_a, &sorted_b).max(token_jaccard(a, b))
}

/// Bilingual near-synonym groups for attribute values. First entry of each
/// group is the canonical form.
const SYNONYM_GROUPS: &[&[&str]] = &[
    &["high", "alta", "alto", "critical", "critica", "crítico"],
    &["medium", "media", "medio", "moderate", "moderada"],
    &["low", "baja", "bajo", "minor"],
    &["daily", "diario", "diaria", "every day"],
    &["weekly", "semanal", "every week"],
    &["monthly", "mensual", "every month"],
    &["yes", "si", "sí", "true"],
    &["no", "false"],
    &["manual", "a mano", "by hand"],
    &["automated", "automatic", "automatico", "automática", "automatizado"],
];

fn canonicalize_value(v: &str) -> String {
    let folded: String = v.trim().to_lowercase().chars().map(fold_char).collect();
    for group in SYNONYM_GROUPS {
        if group.iter().any(|s| *s == folded) {
            return group[0].to_string();
        }
    }
    folded
}

/// Similarity between two attribute values: canonicalize through the synonym
/// table, then lexical. "alta" vs "high" is 1.0; "daily" vs "weekly" is low.
pub fn value_similarity(a: &str, b: &str) -> f64 {
    let ca = canonicalize_value(a);
    let cb = canonicalize_value(b);
    if ca == cb {
        return 1.0;
    }
    lexical_similarity(&ca, &cb)
}

/// Cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for i in 0..a.len() {
        let (ai, bi) = (a[i] as f64, b[i] as f64);
        dot += ai * bi;
        na += ai * ai;
        nb += bi * bi;
    }
    let denom = na.sqrt() * nb.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

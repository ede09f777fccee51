//! Conflict detection and resolution for overlapping concurrent edits
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::operation::Operation;
use super::{now_millis, DocumentId, UserId};

/// Half-open character range `[start, end)` touched by an edit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffectedRange {
    pub start: u64,
    pub end: u64,
}

impl AffectedRange {
    /// Range of a single operation. Inserts are zero-width at their position.
    pub fn of(op: &Operation) -> Option<Self> {
        if op.is_noop() {
            return None;
        }
        Some(Self {
            start: op.position,
            end: op.end(),
        })
    }

    /// Two ranges overlap unless one ends at or before the other begins.
    ///
    /// Zero-width ranges never satisfy that test on their own, so two inserts
    /// are treated as overlapping exactly when they sit at the same position.
    pub fn overlaps(&self, other: &AffectedRange) -> bool {
        if self.is_empty() && other.is_empty() {
            return self.start == other.start;
        }
        !(self.end <= other.start || other.end <= self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    fn union(&self, other: &AffectedRange) -> Self {
        Self {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// Two operations whose affected ranges overlap
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditConflict {
    pub id: String,
    pub document_id: DocumentId,
    pub conflicting_operations: Vec<Operation>,
    pub affected_range: AffectedRange,
    pub users: Vec<UserId>,
    pub timestamp: i64,
}

impl EditConflict {
    fn between(a: &Operation, b: &Operation, range: AffectedRange) -> Self {
        let mut users = vec![a.author_id.clone()];
        if b.author_id != a.author_id {
            users.push(b.author_id.clone());
        }
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            document_id: a.document_id.clone(),
            conflicting_operations: vec![a.clone(), b.clone()],
            affected_range: range,
            users,
            timestamp: now_millis(),
        }
    }

    /// Whether `op` is one of the conflicting operations
    pub fn involves(&self, op: &Operation) -> bool {
        self.conflicting_operations.iter().any(|c| c.id == op.id)
    }
}

/// How to settle a conflict
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Keep only the operation with the latest timestamp
    LastWriterWins,
    /// Deletes win outright; otherwise inserts are concatenated in timestamp order
    Merge,
    /// Caller-supplied replacement operations, passed through unchanged
    Manual(Vec<Operation>),
}

/// Conflict handling applied by the document coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConflictPolicy {
    /// Detect and report only; transformation alone decides the result
    #[default]
    Transform,
    LastWriterWins,
    Merge,
}

impl ConflictPolicy {
    /// The resolution this policy applies, if any
    pub fn resolution(&self) -> Option<Resolution> {
        match self {
            ConflictPolicy::Transform => None,
            ConflictPolicy::LastWriterWins => Some(Resolution::LastWriterWins),
            ConflictPolicy::Merge => Some(Resolution::Merge),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::Transform => "transform",
            ConflictPolicy::LastWriterWins => "last-writer-wins",
            ConflictPolicy::Merge => "merge",
        }
    }
}

impl FromStr for ConflictPolicy {
    type Err = ConflictError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "transform" => Ok(ConflictPolicy::Transform),
            "last-writer-wins" | "lww" => Ok(ConflictPolicy::LastWriterWins),
            "merge" => Ok(ConflictPolicy::Merge),
            other => Err(ConflictError::UnsupportedStrategy(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConflictError {
    #[error("unsupported conflict resolution strategy: {0}")]
    UnsupportedStrategy(String),
}

/// Find every pair of operations whose affected ranges overlap.
///
/// Quadratic in the number of operations; callers bound the input to the
/// replay window.
pub fn detect_conflicts(operations: &[Operation]) -> Vec<EditConflict> {
    let ranged: Vec<(&Operation, AffectedRange)> = operations
        .iter()
        .filter_map(|op| AffectedRange::of(op).map(|range| (op, range)))
        .collect();

    let mut conflicts = Vec::new();
    for (i, (a, a_range)) in ranged.iter().enumerate() {
        for (b, b_range) in &ranged[i + 1..] {
            if a_range.overlaps(b_range) {
                conflicts.push(EditConflict::between(a, b, a_range.union(b_range)));
            }
        }
    }
    conflicts
}

/// Settle a conflict, returning the operations that survive
pub fn resolve_conflict(conflict: &EditConflict, resolution: &Resolution) -> Vec<Operation> {
    match resolution {
        Resolution::LastWriterWins => conflict
            .conflicting_operations
            .iter()
            .max_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)))
            .cloned()
            .into_iter()
            .collect(),
        Resolution::Merge => merge(&conflict.conflicting_operations),
        Resolution::Manual(replacement) => replacement.clone(),
    }
}

fn merge(operations: &[Operation]) -> Vec<Operation> {
    let mut ordered: Vec<&Operation> = operations.iter().collect();
    ordered.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

    let deletes: Vec<Operation> = ordered
        .iter()
        .filter(|op| op.is_delete())
        .map(|op| (*op).clone())
        .collect();
    if !deletes.is_empty() {
        return deletes;
    }

    let inserts: Vec<&Operation> = ordered.into_iter().filter(|op| op.is_insert()).collect();
    let Some(first) = inserts.first() else {
        return Vec::new();
    };
    if inserts.len() == 1 {
        return vec![(*first).clone()];
    }

    // no de-duplication: identical texts are both kept
    let combined: String = inserts.iter().filter_map(|op| op.content.as_deref()).collect();
    let position = inserts.iter().map(|op| op.position).min().unwrap_or(first.position);
    let base_version = inserts.iter().map(|op| op.base_version).min().unwrap_or(0);
    let latest = inserts.iter().map(|op| op.timestamp).max().unwrap_or(first.timestamp);

    vec![Operation::insert(first.document_id.clone(), position, combined, first.author_id.clone())
        .with_base_version(base_version)
        .with_timestamp(latest)]
}

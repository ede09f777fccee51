//! Operational transformation over linear text.
//!
//! `transform(a, b)` returns `(a', b')` where `a'` is `a` rebased to apply
//! after `b` and `b'` is `b` rebased to apply after `a`, so that
//! `apply(apply(s, a), b') == apply(apply(s, b), a')`.
//!
//! Rules (position arithmetic only, never content-aware):
//! - Insert vs Insert: the insert at the lower position keeps its place and the
//!   other shifts right. On equal positions the left argument wins, so every
//!   replica that calls `transform(accepted, incoming)` orders ties identically.
//! - Delete vs Delete: the overlap is removed from both; a delete that started
//!   inside the other is clamped to the other's start.
//! - Insert vs Delete: an insert landing strictly inside a deleted range is
//!   pinned to the delete's start, and the delete is split around the inserted
//!   text so the insert survives on both replicas.
//!
//! Everything here is total: out-of-range positions are clamped by `apply`.

use super::operation::{Operation, OperationKind};

/// Rebase two concurrent operations against each other.
///
/// Each side of the result is a sequence because a delete may be split in two.
pub fn transform(a: &Operation, b: &Operation) -> (Vec<Operation>, Vec<Operation>) {
    use OperationKind::*;

    match (a.kind, b.kind) {
        (Retain, _) | (_, Retain) => (vec![a.clone()], vec![b.clone()]),
        (Insert, Insert) => {
            if a.position <= b.position {
                (vec![a.clone()], vec![b.with_position(b.position + a.insert_len())])
            } else {
                (vec![a.with_position(a.position + b.insert_len())], vec![b.clone()])
            }
        }
        (Insert, Delete) => (vec![insert_after_delete(a, b)], delete_after_insert(b, a)),
        (Delete, Insert) => (delete_after_insert(a, b), vec![insert_after_delete(b, a)]),
        (Delete, Delete) => (vec![delete_after_delete(a, b)], vec![delete_after_delete(b, a)]),
    }
}

/// Transform two concurrent operation sequences against each other.
///
/// Components of each sequence are expressed in the coordinates produced by
/// the components before them.
pub fn transform_sequences(a: &[Operation], b: &[Operation]) -> (Vec<Operation>, Vec<Operation>) {
    match (a, b) {
        ([], _) | (_, []) => (a.to_vec(), b.to_vec()),
        ([x], [y]) => transform(x, y),
        ([x, rest @ ..], _) if !rest.is_empty() => {
            let (x_after, b_after_x) = transform_sequences(std::slice::from_ref(x), b);
            let (rest_after, b_after_all) = transform_sequences(rest, &b_after_x);
            let mut rebased = x_after;
            rebased.extend(rest_after);
            (rebased, b_after_all)
        }
        (_, [y, rest @ ..]) => {
            let (a_after_y, y_after) = transform_sequences(a, std::slice::from_ref(y));
            let (a_after_all, rest_after) = transform_sequences(&a_after_y, rest);
            let mut rebased = y_after;
            rebased.extend(rest_after);
            (a_after_all, rebased)
        }
    }
}

/// Rebase `ops` so they apply after `applied` has already been applied.
///
/// `applied` wins every tie.
pub fn rebase(ops: &[Operation], applied: &[Operation]) -> Vec<Operation> {
    transform_sequences(applied, ops).1
}

fn insert_after_delete(insert: &Operation, delete: &Operation) -> Operation {
    if insert.position <= delete.position {
        insert.clone()
    } else if insert.position >= delete.end() {
        insert.with_position(insert.position - delete.delete_len())
    } else {
        insert.with_position(delete.position)
    }
}

fn delete_after_insert(delete: &Operation, insert: &Operation) -> Vec<Operation> {
    let inserted = insert.insert_len();
    if insert.position <= delete.position {
        vec![delete.with_position(delete.position + inserted)]
    } else if insert.position >= delete.end() {
        vec![delete.clone()]
    } else {
        // the inserted text sits inside the range: delete around it
        let head = insert.position - delete.position;
        let tail = delete.delete_len() - head;
        vec![
            delete.with_range(delete.position, head),
            delete.with_range(delete.position + inserted, tail),
        ]
    }
}

fn delete_after_delete(delete: &Operation, applied: &Operation) -> Operation {
    if delete.end() <= applied.position {
        delete.clone()
    } else if delete.position >= applied.end() {
        delete.with_position(delete.position - applied.delete_len())
    } else {
        let overlap = delete.end().min(applied.end()) - delete.position.max(applied.position);
        delete.with_range(
            delete.position.min(applied.position),
            delete.delete_len() - overlap,
        )
    }
}

/// Apply one operation to `content`.
///
/// Positions beyond the end are clamped; deletes are truncated at the end of
/// the text. Retain leaves the content untouched.
pub fn apply(content: &str, op: &Operation) -> String {
    let char_count = content.chars().count();
    let position = clamp(op.position, char_count);

    match op.kind {
        OperationKind::Insert => {
            let Some(text) = op.content.as_deref() else {
                return content.to_string();
            };
            let at = byte_offset(content, position);
            let mut out = String::with_capacity(content.len() + text.len());
            out.push_str(&content[..at]);
            out.push_str(text);
            out.push_str(&content[at..]);
            out
        }
        OperationKind::Delete => {
            let end = clamp(op.position.saturating_add(op.delete_len()), char_count);
            let start = byte_offset(content, position);
            let stop = byte_offset(content, end);
            let mut out = String::with_capacity(content.len());
            out.push_str(&content[..start]);
            out.push_str(&content[stop..]);
            out
        }
        OperationKind::Retain => content.to_string(),
    }
}

/// Apply a sequence of operations in order
pub fn apply_all(content: &str, ops: &[Operation]) -> String {
    ops.iter().fold(content.to_string(), |acc, op| apply(&acc, op))
}

fn clamp(position: u64, char_count: usize) -> usize {
    usize::try_from(position).unwrap_or(usize::MAX).min(char_count)
}

fn byte_offset(content: &str, char_position: usize) -> usize {
    content
        .char_indices()
        .nth(char_position)
        .map_or(content.len(), |(idx, _)| idx)
}

//! Operation and cursor data model.
//!
//! Operations are immutable edit descriptions over a linear text buffer.
//! Positions and lengths count Unicode scalar values, not bytes. Rebasing
//! produces new values through the `with_*` helpers; nothing mutates an
//! operation after it has been accepted.

use serde::{Deserialize, Serialize};

use super::{now_millis, DocumentId, OperationId, SyncError, UserId};

/// Kind of edit an operation performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Insert `content` at `position`
    Insert,
    /// Remove `length` characters starting at `position`
    Delete,
    /// Accepted but inert; leaves the content untouched
    Retain,
}

/// An atomic edit in document-coordinate space
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: OperationId,
    pub kind: OperationKind,
    /// Character offset, interpreted against the document as of `base_version`
    pub position: u64,
    /// Inserted text (Insert only)
    pub content: Option<String>,
    /// Number of removed characters (Delete only)
    pub length: Option<u64>,
    pub author_id: UserId,
    /// Client timestamp in milliseconds since the epoch
    pub timestamp: i64,
    pub document_id: DocumentId,
    /// Document version the client saw when it produced this edit
    #[serde(default)]
    pub base_version: u64,
}

impl Operation {
    fn new(
        kind: OperationKind,
        document_id: impl Into<String>,
        position: u64,
        author_id: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            position,
            content: None,
            length: None,
            author_id: author_id.into(),
            timestamp: now_millis(),
            document_id: document_id.into(),
            base_version: 0,
        }
    }

    /// Create an insert operation
    pub fn insert(
        document_id: impl Into<String>,
        position: u64,
        content: impl Into<String>,
        author_id: impl Into<String>,
    ) -> Self {
        let mut op = Self::new(OperationKind::Insert, document_id, position, author_id);
        op.content = Some(content.into());
        op
    }

    /// Create a delete operation
    #[cfg(test)]
    pub fn delete(
        document_id: impl Into<String>,
        position: u64,
        length: u64,
        author_id: impl Into<String>,
    ) -> Self {
        let mut op = Self::new(OperationKind::Delete, document_id, position, author_id);
        op.length = Some(length);
        op
    }

    /// Create a no-op operation
    pub fn retain(document_id: impl Into<String>, author_id: impl Into<String>) -> Self {
        Self::new(OperationKind::Retain, document_id, 0, author_id)
    }

    pub fn with_base_version(mut self, version: u64) -> Self {
        self.base_version = version;
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_author(mut self, author_id: impl Into<String>) -> Self {
        self.author_id = author_id.into();
        self
    }

    /// Copy of this operation moved to `position`
    pub fn with_position(&self, position: u64) -> Self {
        Self {
            position,
            ..self.clone()
        }
    }

    /// Copy of this delete covering `[position, position + length)`.
    /// A zero-length result degrades to an inert Retain.
    pub fn with_range(&self, position: u64, length: u64) -> Self {
        if length == 0 {
            return self.as_retain();
        }
        Self {
            position,
            length: Some(length),
            ..self.clone()
        }
    }

    /// Copy of this operation that keeps its identity but does nothing
    pub fn as_retain(&self) -> Self {
        Self {
            kind: OperationKind::Retain,
            position: 0,
            content: None,
            length: None,
            ..self.clone()
        }
    }

    /// Number of characters this operation inserts
    pub fn insert_len(&self) -> u64 {
        match self.kind {
            OperationKind::Insert => self
                .content
                .as_deref()
                .map_or(0, |c| c.chars().count() as u64),
            _ => 0,
        }
    }

    /// Number of characters this operation removes
    pub fn delete_len(&self) -> u64 {
        match self.kind {
            OperationKind::Delete => self.length.unwrap_or(0),
            _ => 0,
        }
    }

    /// Exclusive end of the range this operation touches
    pub fn end(&self) -> u64 {
        self.position + self.delete_len()
    }

    pub fn is_insert(&self) -> bool {
        self.kind == OperationKind::Insert
    }

    pub fn is_delete(&self) -> bool {
        self.kind == OperationKind::Delete
    }

    pub fn is_noop(&self) -> bool {
        self.kind == OperationKind::Retain
    }

    /// Reject operations that break the kind invariants or exceed `max_chars`
    pub fn validate(&self, max_chars: u64) -> Result<(), SyncError> {
        if self.id.is_empty() {
            return Err(SyncError::MalformedOperation("missing operation id".to_string()));
        }
        if self.position > max_chars {
            return Err(SyncError::MalformedOperation(format!(
                "position {} exceeds the document limit of {} characters",
                self.position, max_chars
            )));
        }
        match self.kind {
            OperationKind::Insert => match self.content.as_deref() {
                Some(text) if !text.is_empty() => {
                    if self.insert_len() > max_chars {
                        return Err(SyncError::MalformedOperation(
                            "inserted text is too large".to_string(),
                        ));
                    }
                    Ok(())
                }
                _ => Err(SyncError::MalformedOperation(
                    "insert requires non-empty content".to_string(),
                )),
            },
            OperationKind::Delete => match self.length {
                Some(0) | None => Err(SyncError::MalformedOperation(
                    "delete requires a positive length".to_string(),
                )),
                Some(len) if len > max_chars => Err(SyncError::MalformedOperation(format!(
                    "delete length {} exceeds the document limit of {} characters",
                    len, max_chars
                ))),
                Some(_) => Ok(()),
            },
            OperationKind::Retain => Ok(()),
        }
    }
}

/// Ephemeral caret location of one user in one document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPosition {
    pub user_id: UserId,
    pub document_id: DocumentId,
    /// Line number (0-based)
    pub line: u32,
    /// Character offset within the line (0-based)
    pub character: u32,
    /// Milliseconds since the epoch
    pub timestamp: i64,
}

impl CursorPosition {
    pub fn new(
        user_id: impl Into<String>,
        document_id: impl Into<String>,
        line: u32,
        character: u32,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            document_id: document_id.into(),
            line,
            character,
            timestamp: now_millis(),
        }
    }

    /// Whether this cursor should replace `other` under last-value-wins
    pub fn supersedes(&self, other: &CursorPosition) -> bool {
        self.timestamp >= other.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_len_counts_chars() {
        let op = Operation::insert("doc", 0, "héllo", "alice");
        assert_eq!(op.insert_len(), 5);
        assert_eq!(op.delete_len(), 0);
        assert_eq!(op.end(), 0);
    }

    #[test]
    fn test_delete_range() {
        let op = Operation::delete("doc", 2, 3, "alice");
        assert_eq!(op.end(), 5);
        assert!(op.is_delete());
    }

    #[test]
    fn test_zero_length_range_becomes_retain() {
        let op = Operation::delete("doc", 2, 3, "alice");
        let shrunk = op.with_range(2, 0);
        assert!(shrunk.is_noop());
        assert_eq!(shrunk.id, op.id);
        // the original is untouched
        assert_eq!(op.length, Some(3));
    }

    #[test]
    fn test_validate_rejects_empty_insert() {
        let op = Operation::insert("doc", 0, "", "alice");
        assert!(matches!(op.validate(1000), Err(SyncError::MalformedOperation(_))));
    }

    #[test]
    fn test_validate_rejects_zero_delete() {
        let mut op = Operation::delete("doc", 0, 1, "alice");
        op.length = Some(0);
        assert!(matches!(op.validate(1000), Err(SyncError::MalformedOperation(_))));
        op.length = None;
        assert!(op.validate(1000).is_err());
    }

    #[test]
    fn test_validate_rejects_absurd_position() {
        let op = Operation::insert("doc", 5_000, "x", "alice");
        assert!(op.validate(1000).is_err());
        assert!(op.validate(10_000).is_ok());
    }

    #[test]
    fn test_retain_is_always_valid() {
        assert!(Operation::retain("doc", "alice").validate(0).is_ok());
    }

    #[test]
    fn test_cursor_last_value_wins() {
        let older = CursorPosition::new("alice", "doc", 1, 1);
        let mut newer = older.clone();
        newer.timestamp += 10;
        assert!(newer.supersedes(&older));
        assert!(!older.supersedes(&newer));
    }
}

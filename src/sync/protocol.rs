//! WebSocket protocol for collaborative editing.
//!
//! Binary frames are `[version u8][type u8][payload len u24 BE][bincode payload]`.
//! Text frames carry the same enums as JSON, externally tagged with kebab-case
//! names: `{"document-change": {"operation": {...}}}`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::coordinator::DocumentState;
use super::operation::{CursorPosition, Operation};
use super::presence::CollaborationUser;
use super::{DocumentId, OperationId, SyncError, UserId};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum message size (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 5;

/// Message type identifiers for binary framing
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    // Membership
    JoinDocument = 0x01,
    LeaveDocument = 0x02,
    DocumentJoined = 0x03,
    UserJoined = 0x04,
    UserLeft = 0x05,

    // Edits
    DocumentChange = 0x10,
    ChangeAccepted = 0x11,
    Resync = 0x12,

    // Cursors
    CursorPosition = 0x20,

    Error = 0x30,

    // Keepalive
    Ping = 0xF0,
    Pong = 0xF1,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(MessageType::JoinDocument),
            0x02 => Ok(MessageType::LeaveDocument),
            0x03 => Ok(MessageType::DocumentJoined),
            0x04 => Ok(MessageType::UserJoined),
            0x05 => Ok(MessageType::UserLeft),
            0x10 => Ok(MessageType::DocumentChange),
            0x11 => Ok(MessageType::ChangeAccepted),
            0x12 => Ok(MessageType::Resync),
            0x20 => Ok(MessageType::CursorPosition),
            0x30 => Ok(MessageType::Error),
            0xF0 => Ok(MessageType::Ping),
            0xF1 => Ok(MessageType::Pong),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

/// Protocol errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Version mismatch: expected {0}, got {1}")]
    VersionMismatch(u8, u8),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for ProtocolError {
    fn from(err: bincode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Join a document with a credential for the identity verifier
    JoinDocument {
        document_id: DocumentId,
        credential: String,
    },

    /// Submit an edit
    DocumentChange { operation: Operation },

    /// Move the local cursor
    CursorPosition { cursor: CursorPosition },

    /// Leave the joined document without closing the connection
    LeaveDocument { document_id: DocumentId },

    /// Keepalive
    Ping { timestamp: u64 },
}

impl ClientMessage {
    fn message_type(&self) -> MessageType {
        match self {
            ClientMessage::JoinDocument { .. } => MessageType::JoinDocument,
            ClientMessage::DocumentChange { .. } => MessageType::DocumentChange,
            ClientMessage::CursorPosition { .. } => MessageType::CursorPosition,
            ClientMessage::LeaveDocument { .. } => MessageType::LeaveDocument,
            ClientMessage::Ping { .. } => MessageType::Ping,
        }
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Reply to a successful join
    DocumentJoined {
        document_id: DocumentId,
        document_state: DocumentState,
        /// Everyone in the document, the caller included
        active_users: Vec<CollaborationUser>,
        #[serde(rename = "self")]
        self_user: CollaborationUser,
    },

    /// A new collaborator entered the document
    UserJoined {
        document_id: DocumentId,
        user: CollaborationUser,
    },

    /// A collaborator's last connection left the document
    UserLeft { document_id: DocumentId, user_id: UserId },

    /// An accepted change, rebased onto the version before `version`
    DocumentChange {
        document_id: DocumentId,
        operations: Vec<Operation>,
        version: u64,
        author_id: UserId,
    },

    /// Acknowledgement to the author of a change
    ChangeAccepted {
        operation_id: OperationId,
        version: u64,
        operations: Vec<Operation>,
        superseded: bool,
    },

    /// Cursor of another collaborator
    CursorPosition { cursor: CursorPosition },

    /// Full state for a client that fell out of the replay window
    Resync {
        document_id: DocumentId,
        document_state: DocumentState,
    },

    Error { code: ErrorCode, message: String },

    Pong { timestamp: u64, server_time: i64 },
}

impl ServerMessage {
    fn message_type(&self) -> MessageType {
        match self {
            ServerMessage::DocumentJoined { .. } => MessageType::DocumentJoined,
            ServerMessage::UserJoined { .. } => MessageType::UserJoined,
            ServerMessage::UserLeft { .. } => MessageType::UserLeft,
            ServerMessage::DocumentChange { .. } => MessageType::DocumentChange,
            ServerMessage::ChangeAccepted { .. } => MessageType::ChangeAccepted,
            ServerMessage::CursorPosition { .. } => MessageType::CursorPosition,
            ServerMessage::Resync { .. } => MessageType::Resync,
            ServerMessage::Error { .. } => MessageType::Error,
            ServerMessage::Pong { .. } => MessageType::Pong,
        }
    }

    /// Error frame for a failed request
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
        }
    }
}

impl From<&SyncError> for ServerMessage {
    fn from(err: &SyncError) -> Self {
        ServerMessage::error(ErrorCode::from(err), err.to_string())
    }
}

/// Machine-readable error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    AccessDenied,
    RetryableUnavailable,
    MalformedOperation,
    ResyncRequired,
    NotJoined,
    AlreadyJoined,
    InvalidMessage,
    ServerError,
}

impl From<&SyncError> for ErrorCode {
    fn from(err: &SyncError) -> Self {
        match err {
            SyncError::AccessDenied(_) => ErrorCode::AccessDenied,
            SyncError::RetryableUnavailable(_) => ErrorCode::RetryableUnavailable,
            SyncError::MalformedOperation(_) => ErrorCode::MalformedOperation,
            SyncError::ResyncRequired { .. } => ErrorCode::ResyncRequired,
            SyncError::NotJoined(_) => ErrorCode::NotJoined,
            SyncError::AlreadyJoined(_) => ErrorCode::AlreadyJoined,
            SyncError::ConnectionNotFound(_)
            | SyncError::UnsupportedStrategy(_)
            | SyncError::Internal(_) => {
                ErrorCode::ServerError
            }
        }
    }
}

/// Protocol codec for encoding/decoding messages
pub struct CollabProtocol;

impl CollabProtocol {
    fn frame(msg_type: MessageType, payload: Vec<u8>) -> Result<Bytes, ProtocolError> {
        if payload.len() + HEADER_LEN > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(
                payload.len() + HEADER_LEN,
                MAX_MESSAGE_SIZE,
            ));
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(msg_type as u8);
        buf.put_u24(payload.len() as u32);
        buf.put_slice(&payload);

        Ok(buf.freeze())
    }

    fn unframe(data: &[u8]) -> Result<(MessageType, &[u8]), ProtocolError> {
        if data.len() < HEADER_LEN {
            return Err(ProtocolError::InvalidFormat("Message too short".to_string()));
        }

        let mut cursor = data;

        let version = cursor.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch(PROTOCOL_VERSION, version));
        }

        let msg_type = MessageType::try_from(cursor.get_u8())?;
        let payload_len = cursor.get_uint(3) as usize;

        if data.len() < HEADER_LEN + payload_len {
            return Err(ProtocolError::InvalidFormat(format!(
                "Expected {} bytes, got {}",
                HEADER_LEN + payload_len,
                data.len()
            )));
        }

        Ok((msg_type, &data[HEADER_LEN..HEADER_LEN + payload_len]))
    }

    /// Encode a client message to a binary frame
    #[cfg(test)]
    pub fn encode_client(msg: &ClientMessage) -> Result<Bytes, ProtocolError> {
        Self::frame(msg.message_type(), bincode::serialize(msg)?)
    }

    /// Encode a server message to a binary frame
    pub fn encode_server(msg: &ServerMessage) -> Result<Bytes, ProtocolError> {
        Self::frame(msg.message_type(), bincode::serialize(msg)?)
    }

    /// Decode a client message from a binary frame
    pub fn decode_client(data: &[u8]) -> Result<ClientMessage, ProtocolError> {
        let (msg_type, payload) = Self::unframe(data)?;
        let msg: ClientMessage = bincode::deserialize(payload)?;
        if msg.message_type() != msg_type {
            return Err(ProtocolError::InvalidFormat(format!(
                "frame type {:?} does not match payload {:?}",
                msg_type,
                msg.message_type()
            )));
        }
        Ok(msg)
    }

    /// Decode a server message from a binary frame
    #[cfg(test)]
    pub fn decode_server(data: &[u8]) -> Result<ServerMessage, ProtocolError> {
        let (_, payload) = Self::unframe(data)?;
        Ok(bincode::deserialize(payload)?)
    }

    /// Decode a client message from a JSON text frame
    pub fn decode_client_json(text: &str) -> Result<ClientMessage, ProtocolError> {
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(text.len(), MAX_MESSAGE_SIZE));
        }
        Ok(serde_json::from_str(text)?)
    }

    /// Encode a server message as JSON text
    pub fn encode_server_json(msg: &ServerMessage) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(msg)?)
    }
}

/// Extension trait for writing u24 values
trait BufMutExt {
    fn put_u24(&mut self, n: u32);
}

impl BufMutExt for BytesMut {
    fn put_u24(&mut self, n: u32) {
        self.put_u8((n >> 16) as u8);
        self.put_u8((n >> 8) as u8);
        self.put_u8(n as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_document_change() {
        let op = Operation::insert("doc-1", 3, "héllo", "alice").with_base_version(12);
        let msg = ClientMessage::DocumentChange { operation: op.clone() };

        let encoded = CollabProtocol::encode_client(&msg).unwrap();
        assert_eq!(encoded[0], PROTOCOL_VERSION);
        assert_eq!(encoded[1], MessageType::DocumentChange as u8);

        match CollabProtocol::decode_client(&encoded).unwrap() {
            ClientMessage::DocumentChange { operation } => assert_eq!(operation, op),
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_encode_decode_document_joined() {
        let alice = CollaborationUser::new("alice", "Alice", "alice@example.com");
        let msg = ServerMessage::DocumentJoined {
            document_id: "doc-1".to_string(),
            document_state: DocumentState::at_version("hello", 4),
            active_users: vec![alice.clone()],
            self_user: alice,
        };

        let encoded = CollabProtocol::encode_server(&msg).unwrap();
        assert_eq!(CollabProtocol::decode_server(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_json_join_document() {
        let text = r#"{"join-document":{"documentId":"doc-1","credential":"token"}}"#;
        assert_eq!(
            CollabProtocol::decode_client_json(text).unwrap(),
            ClientMessage::JoinDocument {
                document_id: "doc-1".to_string(),
                credential: "token".to_string(),
            }
        );
    }

    #[test]
    fn test_json_operation_without_base_version() {
        let text = r#"{"document-change":{"operation":{
            "id":"op-1","kind":"delete","position":1,"content":null,"length":3,
            "authorId":"alice","timestamp":10,"documentId":"doc-1"}}}"#;

        match CollabProtocol::decode_client_json(text).unwrap() {
            ClientMessage::DocumentChange { operation } => {
                assert!(operation.is_delete());
                assert_eq!(operation.base_version, 0);
                assert_eq!(operation.end(), 4);
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_json_server_names() {
        let json = CollabProtocol::encode_server_json(&ServerMessage::UserLeft {
            document_id: "doc-1".to_string(),
            user_id: "bob".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"user-left":{"documentId":"doc-1","userId":"bob"}}"#);

        let err = ServerMessage::from(&SyncError::NotJoined("doc-1".to_string()));
        let json = CollabProtocol::encode_server_json(&err).unwrap();
        assert!(json.starts_with(r#"{"error":{"code":"not-joined""#));
    }

    #[test]
    fn test_version_mismatch() {
        let data = CollabProtocol::encode_client(&ClientMessage::Ping { timestamp: 0 }).unwrap();
        let mut bytes = data.to_vec();
        bytes[0] = 0xFF;

        let result = CollabProtocol::decode_client(&bytes);
        assert!(matches!(result, Err(ProtocolError::VersionMismatch(_, _))));
    }

    #[test]
    fn test_truncated_frame() {
        let data = CollabProtocol::encode_client(&ClientMessage::Ping { timestamp: 7 }).unwrap();
        let result = CollabProtocol::decode_client(&data[..data.len() - 1]);
        assert!(matches!(result, Err(ProtocolError::InvalidFormat(_))));
        assert!(CollabProtocol::decode_client(&[PROTOCOL_VERSION]).is_err());
    }

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::try_from(0x10).unwrap(), MessageType::DocumentChange);
        assert!(matches!(
            MessageType::try_from(0x99),
            Err(ProtocolError::UnknownMessageType(0x99))
        ));
    }

    #[test]
    fn test_error_codes() {
        let resync = SyncError::ResyncRequired {
            base_version: 1,
            current_version: 9,
        };
        assert_eq!(ErrorCode::from(&resync), ErrorCode::ResyncRequired);
        assert_eq!(
            ErrorCode::from(&SyncError::Internal("boom".to_string())),
            ErrorCode::ServerError
        );
    }
}

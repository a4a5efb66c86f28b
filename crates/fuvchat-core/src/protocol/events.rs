//! Named-event wire vocabulary
//!
//! The transport carries `(event name, JSON payload)` pairs. Each direction
//! has one sum type; a pair is parsed into it exactly once at the boundary
//! with [`WireEvent::from_wire`] and handlers match on the variants.

use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ChatError, Result};
use crate::protocol::file_transfer::FileChunk;
use crate::types::{MessageId, MessageStatus, TransferId};

// ----------------------------------------------------------------------------
// Shared Payloads
// ----------------------------------------------------------------------------

/// Small inline attachment, or a reference to a chunked transfer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mime: String,
    #[serde(default)]
    pub size: u64,
    /// Base64 content for inline attachments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Chunked transfer carrying the content instead
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<TransferId>,
}

/// Where a typing indicator is aimed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypingContext {
    #[default]
    Public,
    Private,
}

// ----------------------------------------------------------------------------
// Client -> Server Payloads
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKeyRequest {
    /// Base64 RSA-OAEP wrapped session key
    #[serde(rename = "encrypted_aes_key", alias = "wrapped_key", alias = "wrappedKey")]
    pub wrapped_key: String,
}

/// Body of a public or private send, encrypted or plaintext
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    #[serde(default)]
    pub enc: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ciphertext: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl MessageBody {
    /// Plaintext body
    pub fn plain<S: Into<String>>(text: S) -> Self {
        Self {
            message: Some(text.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateSendRequest {
    #[serde(default)]
    pub recipient: String,
    #[serde(flatten)]
    pub body: MessageBody,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceiptRequest {
    /// Integer ids or numeric strings; anything else is skipped
    #[serde(default, deserialize_with = "lenient_message_ids")]
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingRequest {
    #[serde(default)]
    pub context: TypingContext,
    #[serde(default)]
    pub is_typing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRequest {}

/// Terminal receiver's verdict on a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferAck {
    pub transfer_id: TransferId,
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn lenient_message_ids<'de, D>(deserializer: D) -> core::result::Result<Vec<MessageId>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    let values = match raw {
        Some(Value::Array(items)) => items,
        Some(Value::Null) | None => Vec::new(),
        Some(single) => vec![single],
    };
    Ok(values
        .iter()
        .filter_map(|value| match value {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        })
        .filter(|&id| id > 0)
        .map(MessageId::new)
        .collect())
}

// ----------------------------------------------------------------------------
// Server -> Client Payloads
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserList {
    pub users: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKeyAck {}

/// A public message as broadcast and kept in history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicMessage {
    pub username: String,
    pub message: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileDescriptor>,
}

/// A routed private message; the same body goes to both ends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateMessage {
    pub sender: String,
    pub recipient: String,
    pub message: String,
    pub message_id: MessageId,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileDescriptor>,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadNotice {
    pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingNotice {
    pub username: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatHistory {
    pub messages: Vec<PublicMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferErrorNotice {
    pub transfer_id: TransferId,
    pub message: String,
}

// ----------------------------------------------------------------------------
// Event Sum Types
// ----------------------------------------------------------------------------

/// Events a client emits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    Register(RegisterRequest),
    SessionKey(SessionKeyRequest),
    Message(MessageBody),
    PrivateMessage(PrivateSendRequest),
    PrivateMessageRead(ReadReceiptRequest),
    Typing(TypingRequest),
    RequestHistory(HistoryRequest),
    PublicFileChunk(FileChunk),
    PrivateFileChunk(FileChunk),
    FileTransferAck(TransferAck),
}

/// Events the server emits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    UpdateUserList(UserList),
    Error(ErrorNotice),
    SessionKeyOk(SessionKeyAck),
    Message(PublicMessage),
    PrivateMessageReceived(PrivateMessage),
    PrivateMessageSent(PrivateMessage),
    PrivateMessageRead(ReadNotice),
    PublicTyping(TypingNotice),
    PrivateTyping(TypingNotice),
    ChatHistory(ChatHistory),
    FileChunk(FileChunk),
    FileTransferAck(TransferAck),
    FileTransferError(TransferErrorNotice),
}

impl ServerEvent {
    pub fn error<S: Into<String>>(message: S) -> Self {
        ServerEvent::Error(ErrorNotice {
            message: message.into(),
        })
    }
}

// ----------------------------------------------------------------------------
// Wire Conversion
// ----------------------------------------------------------------------------

/// Conversion between a typed event and a `(name, payload)` pair
pub trait WireEvent: Serialize + DeserializeOwned {
    /// Event name on the wire
    fn name(&self) -> &'static str;

    /// Split into event name and JSON payload
    fn to_wire(&self) -> Result<(&'static str, Value)> {
        let mut tagged = serde_json::to_value(self)?;
        let payload = tagged
            .get_mut("data")
            .map(Value::take)
            .unwrap_or_else(|| Value::Object(Default::default()));
        Ok((self.name(), payload))
    }

    /// Parse an event name and payload; a null payload reads as `{}`
    fn from_wire(name: &str, payload: Value) -> Result<Self> {
        let payload = if payload.is_null() {
            Value::Object(Default::default())
        } else {
            payload
        };
        let tagged = serde_json::json!({ "event": name, "data": payload });
        serde_json::from_value(tagged)
            .map_err(|e| ChatError::protocol(format!("'{}' payload rejected: {}", name, e)))
    }
}

/// One `(event name, payload)` pair as it crosses the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl WireFrame {
    pub fn new<S: Into<String>>(event: S, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Encode a typed event
    pub fn encode<E: WireEvent>(event: &E) -> Result<Self> {
        let (name, data) = event.to_wire()?;
        Ok(Self::new(name, data))
    }

    /// Parse into a typed event
    pub fn decode<E: WireEvent>(self) -> Result<E> {
        E::from_wire(&self.event, self.data)
    }
}

impl WireEvent for ClientCommand {
    fn name(&self) -> &'static str {
        match self {
            ClientCommand::Register(_) => "register",
            ClientCommand::SessionKey(_) => "session_key",
            ClientCommand::Message(_) => "message",
            ClientCommand::PrivateMessage(_) => "private_message",
            ClientCommand::PrivateMessageRead(_) => "private_message_read",
            ClientCommand::Typing(_) => "typing",
            ClientCommand::RequestHistory(_) => "request_history",
            ClientCommand::PublicFileChunk(_) => "public_file_chunk",
            ClientCommand::PrivateFileChunk(_) => "private_file_chunk",
            ClientCommand::FileTransferAck(_) => "file_transfer_ack",
        }
    }
}

impl WireEvent for ServerEvent {
    fn name(&self) -> &'static str {
        match self {
            ServerEvent::UpdateUserList(_) => "update_user_list",
            ServerEvent::Error(_) => "error",
            ServerEvent::SessionKeyOk(_) => "session_key_ok",
            ServerEvent::Message(_) => "message",
            ServerEvent::PrivateMessageReceived(_) => "private_message_received",
            ServerEvent::PrivateMessageSent(_) => "private_message_sent",
            ServerEvent::PrivateMessageRead(_) => "private_message_read",
            ServerEvent::PublicTyping(_) => "public_typing",
            ServerEvent::PrivateTyping(_) => "private_typing",
            ServerEvent::ChatHistory(_) => "chat_history",
            ServerEvent::FileChunk(_) => "file_chunk",
            ServerEvent::FileTransferAck(_) => "file_transfer_ack",
            ServerEvent::FileTransferError(_) => "file_transfer_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_from_wire() {
        let command =
            ClientCommand::from_wire("register", json!({ "username": "alice" })).unwrap();
        assert_eq!(
            command,
            ClientCommand::Register(RegisterRequest {
                username: "alice".to_string()
            })
        );
    }

    #[test]
    fn test_session_key_field_aliases() {
        let canonical =
            ClientCommand::from_wire("session_key", json!({ "encrypted_aes_key": "QUJD" }))
                .unwrap();
        let alias =
            ClientCommand::from_wire("session_key", json!({ "wrappedKey": "QUJD" })).unwrap();
        assert_eq!(canonical, alias);
    }

    #[test]
    fn test_request_history_accepts_null_payload() {
        let command = ClientCommand::from_wire("request_history", Value::Null).unwrap();
        assert_eq!(command, ClientCommand::RequestHistory(HistoryRequest {}));
    }

    #[test]
    fn test_private_message_flattens_body() {
        let command = ClientCommand::from_wire(
            "private_message",
            json!({ "recipient": "bob", "enc": true, "ciphertext": "AA==", "iv": "BB==" }),
        )
        .unwrap();
        match command {
            ClientCommand::PrivateMessage(request) => {
                assert_eq!(request.recipient, "bob");
                assert!(request.body.enc);
                assert_eq!(request.body.ciphertext.as_deref(), Some("AA=="));
                assert!(request.body.message.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_read_receipt_ids_are_lenient() {
        let command = ClientCommand::from_wire(
            "private_message_read",
            json!({ "message_ids": [1, "2", "x", -3, null, 0, " 5 "] }),
        )
        .unwrap();
        assert_eq!(
            command,
            ClientCommand::PrivateMessageRead(ReadReceiptRequest {
                message_ids: vec![MessageId::new(1), MessageId::new(2), MessageId::new(5)]
            })
        );

        let single =
            ClientCommand::from_wire("private_message_read", json!({ "message_ids": 4 }))
                .unwrap();
        assert_eq!(
            single,
            ClientCommand::PrivateMessageRead(ReadReceiptRequest {
                message_ids: vec![MessageId::new(4)]
            })
        );
    }

    #[test]
    fn test_unknown_event_is_protocol_error() {
        let err = ClientCommand::from_wire("launch_rockets", json!({})).unwrap_err();
        assert!(matches!(err, ChatError::Protocol(_)));
    }

    #[test]
    fn test_server_event_names_match_serde_tags() {
        let events = vec![
            ServerEvent::UpdateUserList(UserList { users: vec![] }),
            ServerEvent::error("nope"),
            ServerEvent::SessionKeyOk(SessionKeyAck {}),
            ServerEvent::PrivateMessageRead(ReadNotice {
                message_id: MessageId::new(3),
            }),
            ServerEvent::PrivateTyping(TypingNotice {
                username: "a".to_string(),
                is_typing: true,
            }),
            ServerEvent::FileTransferError(TransferErrorNotice {
                transfer_id: TransferId::from_string("t".to_string()),
                message: "boom".to_string(),
            }),
        ];
        for event in events {
            let tagged = serde_json::to_value(&event).unwrap();
            assert_eq!(tagged["event"], json!(event.name()));
            let (name, payload) = event.to_wire().unwrap();
            assert_eq!(ServerEvent::from_wire(name, payload).unwrap(), event);
        }
    }

    #[test]
    fn test_wire_frame_round_trip() {
        let command = ClientCommand::Typing(TypingRequest {
            context: TypingContext::Private,
            is_typing: true,
            recipient: Some("bob".to_string()),
        });
        let frame = WireFrame::encode(&command).unwrap();
        assert_eq!(frame.event, "typing");
        assert_eq!(frame.data["context"], json!("private"));
        assert_eq!(frame.decode::<ClientCommand>().unwrap(), command);
    }

    #[test]
    fn test_session_key_ok_payload_is_empty_object() {
        let (name, payload) = ServerEvent::SessionKeyOk(SessionKeyAck {}).to_wire().unwrap();
        assert_eq!(name, "session_key_ok");
        assert_eq!(payload, json!({}));
    }
}

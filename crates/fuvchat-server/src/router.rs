//! Message router
//!
//! Validates and routes public messages, private messages, read receipts and
//! typing indicators. Every operation returns the dispatches it wants emitted
//! instead of emitting itself, so no lock is held across transport I/O.

use dashmap::DashMap;
use fuvchat_core::protocol::{
    ChatHistory, MessageBody, PrivateMessage, PrivateSendRequest, PublicMessage, ReadNotice,
    ServerEvent, TypingContext, TypingNotice, TypingRequest,
};
use fuvchat_core::validation::{
    normalize_recipient, normalize_text, sanitize_attachment, AttachmentLimits,
};
use fuvchat_core::{
    ChatError, ConnectionId, MessageId, MessageStatus, Result, SessionError, Timestamp,
    ValidationError,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::history::HistoryBuffer;
use crate::outbound::Dispatch;
use crate::presence::PresenceRegistry;

#[derive(Debug, Clone)]
struct MessageRecord {
    sender: ConnectionId,
    recipient: ConnectionId,
    status: MessageStatus,
}

/// Routes chat traffic between connections
#[derive(Debug)]
pub struct MessageRouter {
    presence: Arc<PresenceRegistry>,
    history: Arc<HistoryBuffer>,
    next_id: AtomicU64,
    records: DashMap<MessageId, MessageRecord>,
    /// Allocation order of `records`, oldest first
    allocated: Mutex<VecDeque<MessageId>>,
    max_records: usize,
    limits: AttachmentLimits,
}

impl MessageRouter {
    pub fn new(
        presence: Arc<PresenceRegistry>,
        history: Arc<HistoryBuffer>,
        limits: AttachmentLimits,
        max_records: usize,
    ) -> Self {
        Self {
            presence,
            history,
            next_id: AtomicU64::new(1),
            records: DashMap::new(),
            allocated: Mutex::new(VecDeque::new()),
            max_records: max_records.max(1),
            limits,
        }
    }

    fn sender_name(&self, connection: &ConnectionId) -> Result<String> {
        self.presence
            .display_name(connection)
            .ok_or_else(|| ValidationError::NotRegistered.into())
    }

    /// Plaintext of a send, decrypting with the sender's session key when marked encrypted
    fn resolve_text(&self, connection: &ConnectionId, body: &MessageBody) -> Result<String> {
        if !body.enc {
            return Ok(normalize_text(body.message.as_deref()));
        }
        let key = self
            .presence
            .session_key(connection)
            .ok_or(SessionError::KeyNotEstablished)?;
        let (Some(ciphertext), Some(iv)) = (body.ciphertext.as_deref(), body.iv.as_deref()) else {
            return Err(ChatError::protocol("encrypted message without ciphertext or iv"));
        };
        let text = key.open_text(ciphertext, iv)?;
        Ok(text.trim().to_string())
    }

    /// Route a public message to everyone, sender included.
    ///
    /// A message with neither text nor attachment is dropped without reply.
    pub fn public_message(
        &self,
        connection: &ConnectionId,
        body: MessageBody,
    ) -> Result<Vec<Dispatch>> {
        let username = self.sender_name(connection)?;
        let text = self.resolve_text(connection, &body)?;
        let file = sanitize_attachment(body.file, self.limits)?;
        if text.is_empty() && file.is_none() {
            debug!(conn = %connection, "Ignoring empty public message");
            return Ok(Vec::new());
        }

        let message = PublicMessage {
            username,
            message: text,
            timestamp: Timestamp::or_now(body.timestamp.as_deref()).to_string(),
            file,
        };
        self.history.append(message.clone());
        Ok(vec![Dispatch::everyone(ServerEvent::Message(message))])
    }

    /// Route a private message to its recipient and echo it to the sender
    pub fn private_message(
        &self,
        connection: &ConnectionId,
        request: PrivateSendRequest,
    ) -> Result<Vec<Dispatch>> {
        let sender = self.sender_name(connection)?;
        let recipient = normalize_recipient(&request.recipient)?;
        if recipient == sender {
            return Err(ValidationError::SelfAddressed.into());
        }
        let recipient_connection =
            self.presence
                .find(&recipient)
                .ok_or_else(|| ValidationError::RecipientOffline {
                    name: recipient.clone(),
                })?;

        let body = request.body;
        let text = self.resolve_text(connection, &body)?;
        let file = sanitize_attachment(body.file, self.limits)?;
        if text.is_empty() && file.is_none() {
            return Err(ValidationError::EmptyMessage.into());
        }
        let timestamp = Timestamp::or_now(body.timestamp.as_deref()).to_string();

        let message_id = self.allocate(connection, &recipient_connection);
        info!(
            conn = %connection,
            message_id = %message_id,
            "Private message {} -> {}",
            sender,
            recipient
        );

        let delivered = PrivateMessage {
            sender,
            recipient,
            message: text,
            message_id,
            status: MessageStatus::Delivered,
            file,
            timestamp,
        };
        let sent = PrivateMessage {
            status: MessageStatus::Sent,
            ..delivered.clone()
        };
        Ok(vec![
            Dispatch::to(
                &recipient_connection,
                ServerEvent::PrivateMessageReceived(delivered),
            ),
            Dispatch::to(connection, ServerEvent::PrivateMessageSent(sent)),
        ])
    }

    fn allocate(&self, sender: &ConnectionId, recipient: &ConnectionId) -> MessageId {
        let message_id = MessageId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.records.insert(
            message_id,
            MessageRecord {
                sender: sender.clone(),
                recipient: recipient.clone(),
                status: MessageStatus::Delivered,
            },
        );

        let mut allocated = self.allocated.lock();
        allocated.push_back(message_id);
        while allocated.len() > self.max_records {
            if let Some(evicted) = allocated.pop_front() {
                self.records.remove(&evicted);
                debug!(message_id = %evicted, "Evicted oldest message record");
            }
        }
        message_id
    }

    /// Mark messages seen by `connection`, notifying each sender once.
    ///
    /// Ids that are unknown, addressed to someone else or already seen are skipped.
    pub fn mark_read(&self, connection: &ConnectionId, message_ids: &[MessageId]) -> Vec<Dispatch> {
        let mut notify = Vec::new();
        for message_id in message_ids {
            let Some(mut record) = self.records.get_mut(message_id) else {
                continue;
            };
            if &record.recipient != connection || record.status == MessageStatus::Seen {
                continue;
            }
            record.status = MessageStatus::Seen;
            notify.push((*message_id, record.sender.clone()));
        }

        notify
            .into_iter()
            .filter(|(_, sender)| self.presence.is_connected(sender))
            .map(|(message_id, sender)| {
                debug!(message_id = %message_id, "Read receipt");
                Dispatch::to(
                    &sender,
                    ServerEvent::PrivateMessageRead(ReadNotice { message_id }),
                )
            })
            .collect()
    }

    /// Status of a private message, if it is still tracked
    pub fn status(&self, message_id: MessageId) -> Option<MessageStatus> {
        self.records.get(&message_id).map(|record| record.status)
    }

    /// Forget messages to or from a departed connection; they can no longer be read
    pub fn forget_connection(&self, connection: &ConnectionId) {
        self.records
            .retain(|_, record| &record.sender != connection && &record.recipient != connection);
        self.allocated
            .lock()
            .retain(|message_id| self.records.contains_key(message_id));
    }

    pub fn tracked_messages(&self) -> usize {
        self.records.len()
    }

    /// Relay a typing indicator. Unregistered senders and unknown recipients are ignored.
    pub fn typing(&self, connection: &ConnectionId, request: TypingRequest) -> Vec<Dispatch> {
        let Some(username) = self.presence.display_name(connection) else {
            return Vec::new();
        };
        let notice = TypingNotice {
            username,
            is_typing: request.is_typing,
        };
        match request.context {
            TypingContext::Public => vec![Dispatch::everyone_except(
                connection,
                ServerEvent::PublicTyping(notice),
            )],
            TypingContext::Private => request
                .recipient
                .as_deref()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .and_then(|name| self.presence.find(name))
                .map(|target| vec![Dispatch::to(&target, ServerEvent::PrivateTyping(notice))])
                .unwrap_or_default(),
        }
    }

    /// Snapshot of the public history
    pub fn history(&self) -> ServerEvent {
        ServerEvent::ChatHistory(ChatHistory {
            messages: self.history.snapshot(),
        })
    }
}

//! Application-facing event channels
//!
//! One typed channel per concern. The application subscribes to the ones it
//! cares about; updates on a channel nobody reads are dropped.

use fuvchat_core::protocol::{PrivateMessage, PublicMessage, ReassembledFile, TransferAck};
use fuvchat_core::{MessageId, TransferId};
use tokio::sync::mpsc;
use tracing::trace;

// ----------------------------------------------------------------------------
// Update Types
// ----------------------------------------------------------------------------

/// Messages, receipts and errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatUpdate {
    Public(PublicMessage),
    PrivateReceived(PrivateMessage),
    PrivateSent(PrivateMessage),
    Read { message_id: MessageId },
    History(Vec<PublicMessage>),
    /// Server `error` events and local validation failures
    Error(String),
}

/// Roster, own identity and typing indicators
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceUpdate {
    Roster(Vec<String>),
    /// The name the server confirmed for this client, or `None` once it is gone
    IdentityChanged(Option<String>),
    Typing {
        username: String,
        is_typing: bool,
        private: bool,
    },
}

/// File transfer lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferUpdate {
    /// Every chunk of an outbound transfer was emitted
    Sent {
        transfer_id: TransferId,
        chunks: usize,
    },
    Progress {
        transfer_id: TransferId,
        received: usize,
        total_chunks: u32,
    },
    Completed {
        transfer_id: TransferId,
        file: ReassembledFile,
    },
    Failed {
        transfer_id: TransferId,
        message: String,
    },
    /// A receiver's ack for one of our transfers
    Acknowledged(TransferAck),
}

/// Connection supervisor state changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionUpdate {
    Connected,
    ConnectFailed { reason: String },
    Disconnected { user_requested: bool },
    Reconnecting { attempt: u32 },
    Reconnected,
    ReconnectFailed { attempts: u32 },
}

// ----------------------------------------------------------------------------
// Channel Bundles
// ----------------------------------------------------------------------------

/// Sending halves, held by the client
#[derive(Debug, Clone)]
pub struct AppEventSenders {
    chat: mpsc::UnboundedSender<ChatUpdate>,
    presence: mpsc::UnboundedSender<PresenceUpdate>,
    transfer: mpsc::UnboundedSender<TransferUpdate>,
    connection: mpsc::UnboundedSender<ConnectionUpdate>,
}

/// Receiving halves, handed to the application
#[derive(Debug)]
pub struct AppEventReceivers {
    pub chat: mpsc::UnboundedReceiver<ChatUpdate>,
    pub presence: mpsc::UnboundedReceiver<PresenceUpdate>,
    pub transfer: mpsc::UnboundedReceiver<TransferUpdate>,
    pub connection: mpsc::UnboundedReceiver<ConnectionUpdate>,
}

pub fn app_channels() -> (AppEventSenders, AppEventReceivers) {
    let (chat, chat_rx) = mpsc::unbounded_channel();
    let (presence, presence_rx) = mpsc::unbounded_channel();
    let (transfer, transfer_rx) = mpsc::unbounded_channel();
    let (connection, connection_rx) = mpsc::unbounded_channel();
    (
        AppEventSenders {
            chat,
            presence,
            transfer,
            connection,
        },
        AppEventReceivers {
            chat: chat_rx,
            presence: presence_rx,
            transfer: transfer_rx,
            connection: connection_rx,
        },
    )
}

impl AppEventSenders {
    pub fn chat(&self, update: ChatUpdate) {
        if self.chat.send(update).is_err() {
            trace!("Chat channel closed; update dropped");
        }
    }

    pub fn presence(&self, update: PresenceUpdate) {
        if self.presence.send(update).is_err() {
            trace!("Presence channel closed; update dropped");
        }
    }

    pub fn transfer(&self, update: TransferUpdate) {
        if self.transfer.send(update).is_err() {
            trace!("Transfer channel closed; update dropped");
        }
    }

    pub fn connection(&self, update: ConnectionUpdate) {
        if self.connection.send(update).is_err() {
            trace!("Connection channel closed; update dropped");
        }
    }
}

//! Chat client facade
//!
//! Ties the connection supervisor, the session handshake and the file
//! sender/receiver together behind one API, and turns inbound server events
//! into typed application updates.

use async_trait::async_trait;
use fuvchat_core::config::ClientConfig;
use fuvchat_core::protocol::{
    FileDescriptor, HistoryRequest, MessageBody, PrivateSendRequest, ReadReceiptRequest,
    RegisterRequest, UserList,
};
use fuvchat_core::validation::{normalize_recipient, normalize_username};
use fuvchat_core::{
    ChatError, ClientCommand, MessageId, Result, ServerEvent, SessionKey, TransferId,
    TransportError, ValidationError,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channels::{
    app_channels, AppEventReceivers, AppEventSenders, ChatUpdate, PresenceUpdate, TransferUpdate,
};
use crate::session::{Gate, SecureIntent, SessionHandshake, SessionTicket};
use crate::supervisor::{ConnectHook, ConnectionSupervisor, Sleeper, SupervisorState};
use crate::transfer::{FileReceiver, FileSender};
use crate::transport::{PublicKeySource, SignalReceiver, Transport, TransportSignal};
use crate::typing::TypingTracker;

/// Error text the server prefixes to a rejected session key
const HANDSHAKE_FAILED_PREFIX: &str = "Session key exchange failed";

// ----------------------------------------------------------------------------
// Connection Hooks
// ----------------------------------------------------------------------------

/// Per-connection state the supervisor sets up and tears down
struct ConnectionHooks {
    session: Arc<SessionHandshake>,
    receiver: Arc<FileReceiver>,
    typing: Arc<Mutex<TypingTracker>>,
    events: AppEventSenders,
}

#[async_trait]
impl ConnectHook for ConnectionHooks {
    async fn on_connected(&self, link: u64) -> Vec<ClientCommand> {
        match self.session.initiate(link).await {
            Ok(command) => vec![command],
            Err(e) => {
                self.events
                    .chat(ChatUpdate::Error(format!("{}: {}", HANDSHAKE_FAILED_PREFIX, e)));
                Vec::new()
            }
        }
    }

    fn on_disconnected(&self) {
        self.session.reset();
        self.receiver.reset();
        self.typing.lock().clear();
    }
}

// ----------------------------------------------------------------------------
// Client
// ----------------------------------------------------------------------------

/// Client half of the chat service
pub struct ChatClient<T: Transport> {
    config: ClientConfig,
    supervisor: Arc<ConnectionSupervisor<T>>,
    session: Arc<SessionHandshake>,
    sender: FileSender,
    receiver: Arc<FileReceiver>,
    typing: Arc<Mutex<TypingTracker>>,
    identity: Mutex<Option<String>>,
    roster: Mutex<Vec<String>>,
    events: AppEventSenders,
}

impl<T: Transport> ChatClient<T> {
    pub fn new(
        config: ClientConfig,
        transport: Arc<T>,
        keys: Arc<dyn PublicKeySource>,
        sleeper: Arc<dyn Sleeper>,
    ) -> (Arc<Self>, AppEventReceivers) {
        let (events, receivers) = app_channels();
        let session = Arc::new(SessionHandshake::new(keys));
        let receiver = Arc::new(FileReceiver::new(&config, events.clone()));
        let typing = Arc::new(Mutex::new(TypingTracker::new()));
        let hooks: Arc<dyn ConnectHook> = Arc::new(ConnectionHooks {
            session: session.clone(),
            receiver: receiver.clone(),
            typing: typing.clone(),
            events: events.clone(),
        });
        let supervisor = ConnectionSupervisor::new(
            transport,
            sleeper,
            Some(hooks),
            config.reconnect.clone(),
            events.clone(),
        );

        let client = Arc::new(Self {
            sender: FileSender::new(&config),
            config,
            supervisor,
            session,
            receiver,
            typing,
            identity: Mutex::new(None),
            roster: Mutex::new(Vec::new()),
            events,
        });
        (client, receivers)
    }

    /// Name the server has confirmed for us
    pub fn identity(&self) -> Option<String> {
        self.identity.lock().clone()
    }

    pub fn roster(&self) -> Vec<String> {
        self.roster.lock().clone()
    }

    pub fn connection_state(&self) -> SupervisorState {
        self.supervisor.state()
    }

    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor<T>> {
        &self.supervisor
    }

    pub fn session(&self) -> &Arc<SessionHandshake> {
        &self.session
    }

    // ------------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------------

    pub async fn connect(&self) -> Result<()> {
        self.supervisor.connect().await
    }

    /// User-requested disconnect; forgets the desired identity
    pub async fn disconnect(&self) -> Result<()> {
        let previous = self.identity.lock().take();
        if previous.is_some() {
            self.events.presence(PresenceUpdate::IdentityChanged(None));
        }
        self.supervisor.disconnect().await
    }

    /// Feed transport signals to the client until the transport goes away
    pub fn spawn_pump(self: &Arc<Self>, mut signals: SignalReceiver) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                client.handle_signal(signal).await;
            }
            debug!("Transport signal channel closed");
        })
    }

    pub async fn handle_signal(&self, signal: TransportSignal) {
        match signal {
            TransportSignal::Event(event) => self.handle_event(event).await,
            TransportSignal::Closed { reason } => self.supervisor.on_transport_lost(&reason),
        }
    }

    // ------------------------------------------------------------------------
    // Outbound Operations
    // ------------------------------------------------------------------------

    /// Register (or re-register) under `raw_name`; remembered across reconnects
    pub async fn register(&self, raw_name: &str) -> Result<()> {
        let username = normalize_username(raw_name, self.config.max_username_len)
            .map_err(|e| self.reject(e))?;
        info!(username = %username, "Registering");
        self.supervisor.set_desired_identity(Some(username.clone()));
        self.supervisor
            .send(ClientCommand::Register(RegisterRequest { username }))
            .await
    }

    pub async fn send_public(&self, text: &str, file: Option<FileDescriptor>) -> Result<()> {
        let text = text.trim();
        if text.is_empty() && file.is_none() {
            return Err(self.reject(ValidationError::EmptyMessage));
        }
        self.dispatch_secure(SecureIntent::Public {
            text: text.to_string(),
            file,
        })
        .await
    }

    pub async fn send_private(
        &self,
        recipient: &str,
        text: &str,
        file: Option<FileDescriptor>,
    ) -> Result<()> {
        let recipient = normalize_recipient(recipient).map_err(|e| self.reject(e))?;
        if self.identity().as_deref() == Some(recipient.as_str()) {
            return Err(self.reject(ValidationError::SelfAddressed));
        }
        let text = text.trim();
        if text.is_empty() && file.is_none() {
            return Err(self.reject(ValidationError::EmptyMessage));
        }
        self.dispatch_secure(SecureIntent::Private {
            recipient,
            text: text.to_string(),
            file,
        })
        .await
    }

    /// Start a chunked transfer to everyone or to one recipient
    pub async fn send_file(
        &self,
        filename: &str,
        data: Vec<u8>,
        recipient: Option<&str>,
    ) -> Result<TransferId> {
        self.sender
            .check(filename, data.len())
            .map_err(|e| self.reject(e))?;
        let recipient = match recipient {
            Some(name) => Some(normalize_recipient(name).map_err(|e| self.reject(e))?),
            None => None,
        };
        let transfer_id = TransferId::generate();
        info!(transfer_id = %transfer_id, filename, bytes = data.len(), "Sending file");
        self.dispatch_secure(SecureIntent::File {
            transfer_id: transfer_id.clone(),
            filename: filename.trim().to_string(),
            data,
            recipient,
        })
        .await?;
        Ok(transfer_id)
    }

    pub async fn mark_read(&self, message_ids: &[MessageId]) -> Result<()> {
        if message_ids.is_empty() {
            return Ok(());
        }
        self.supervisor
            .send(ClientCommand::PrivateMessageRead(ReadReceiptRequest {
                message_ids: message_ids.to_vec(),
            }))
            .await
    }

    /// Report typing state; unchanged states and offline calls are dropped
    pub async fn indicate_typing(&self, recipient: Option<&str>, is_typing: bool) -> Result<()> {
        if !self.supervisor.is_connected() {
            return Ok(());
        }
        let request = self.typing.lock().update(recipient, is_typing);
        match request {
            Some(request) => {
                self.supervisor
                    .send_now(ClientCommand::Typing(request))
                    .await
            }
            None => Ok(()),
        }
    }

    pub async fn request_history(&self) -> Result<()> {
        self.supervisor
            .send(ClientCommand::RequestHistory(HistoryRequest {}))
            .await
    }

    fn reject(&self, error: ValidationError) -> ChatError {
        self.events.chat(ChatUpdate::Error(error.to_string()));
        error.into()
    }

    async fn dispatch_secure(&self, intent: SecureIntent) -> Result<()> {
        match self.session.gate(intent) {
            Ok(Gate::Queued) => Ok(()),
            Ok(Gate::Ready(ticket, intent)) => {
                let result = self.release(&ticket, intent).await;
                if let Err(e) = &result {
                    self.events.chat(ChatUpdate::Error(e.to_string()));
                }
                result
            }
            Err(e) => {
                self.events.chat(ChatUpdate::Error(e.to_string()));
                Err(e)
            }
        }
    }

    /// Seal and emit one secure send on the connection its key belongs to
    async fn release(&self, ticket: &SessionTicket, intent: SecureIntent) -> Result<()> {
        let key = &ticket.key;
        match intent {
            SecureIntent::Public { text, file } => {
                let body = seal_body(key, &text, file)?;
                self.supervisor
                    .send_on_link(ticket.link, ClientCommand::Message(body))
                    .await
            }
            SecureIntent::Private {
                recipient,
                text,
                file,
            } => {
                let body = seal_body(key, &text, file)?;
                self.supervisor
                    .send_on_link(
                        ticket.link,
                        ClientCommand::PrivateMessage(PrivateSendRequest { recipient, body }),
                    )
                    .await
            }
            SecureIntent::File {
                transfer_id,
                filename,
                data,
                recipient,
            } => {
                let commands =
                    self.sender
                        .prepare(key, &transfer_id, &filename, &data, recipient.as_deref())?;
                tokio::spawn(stream_chunks(
                    Arc::clone(&self.supervisor),
                    self.events.clone(),
                    ticket.link,
                    transfer_id,
                    commands,
                    self.config.chunk_throttle(),
                ));
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------------
    // Inbound Events
    // ------------------------------------------------------------------------

    pub async fn handle_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::UpdateUserList(list) => self.on_user_list(list).await,
            ServerEvent::Error(notice) => self.on_error(notice.message),
            ServerEvent::SessionKeyOk(_) => self.on_session_ack().await,
            ServerEvent::Message(message) => self.events.chat(ChatUpdate::Public(message)),
            ServerEvent::PrivateMessageReceived(message) => {
                self.events.chat(ChatUpdate::PrivateReceived(message))
            }
            ServerEvent::PrivateMessageSent(message) => {
                self.events.chat(ChatUpdate::PrivateSent(message))
            }
            ServerEvent::PrivateMessageRead(notice) => self.events.chat(ChatUpdate::Read {
                message_id: notice.message_id,
            }),
            ServerEvent::PublicTyping(notice) => self.events.presence(PresenceUpdate::Typing {
                username: notice.username,
                is_typing: notice.is_typing,
                private: false,
            }),
            ServerEvent::PrivateTyping(notice) => self.events.presence(PresenceUpdate::Typing {
                username: notice.username,
                is_typing: notice.is_typing,
                private: true,
            }),
            ServerEvent::ChatHistory(history) => {
                self.events.chat(ChatUpdate::History(history.messages))
            }
            ServerEvent::FileChunk(chunk) => {
                if let Some(completed) = self.receiver.ingest(&chunk) {
                    let receiver = Arc::clone(&self.receiver);
                    let supervisor = Arc::clone(&self.supervisor);
                    let key = self.session.key();
                    tokio::spawn(async move {
                        let ack = receiver.finish(completed, key).await;
                        if let Err(e) = supervisor.send(ack).await {
                            warn!("Failed to send transfer ack: {}", e);
                        }
                    });
                }
            }
            ServerEvent::FileTransferAck(ack) => {
                self.events.transfer(TransferUpdate::Acknowledged(ack))
            }
            ServerEvent::FileTransferError(notice) => {
                self.events.transfer(TransferUpdate::Failed {
                    transfer_id: notice.transfer_id,
                    message: notice.message,
                })
            }
        }
    }

    async fn on_user_list(&self, list: UserList) {
        *self.roster.lock() = list.users.clone();
        self.events.presence(PresenceUpdate::Roster(list.users.clone()));

        let desired = self.supervisor.desired_identity();
        let change = {
            let mut identity = self.identity.lock();
            match desired.filter(|name| list.users.contains(name)) {
                Some(name) if identity.as_deref() != Some(name.as_str()) => {
                    *identity = Some(name.clone());
                    Some(Some(name))
                }
                Some(_) => None,
                None => match identity.as_ref() {
                    Some(current) if !list.users.contains(current) => {
                        *identity = None;
                        Some(None)
                    }
                    _ => None,
                },
            }
        };

        if let Some(identity) = change {
            info!(identity = ?identity, "Identity changed");
            let adopted = identity.is_some();
            self.events.presence(PresenceUpdate::IdentityChanged(identity));
            if adopted {
                if let Err(e) = self.request_history().await {
                    warn!("History request failed: {}", e);
                }
            }
        }
    }

    fn on_error(&self, message: String) {
        if message.starts_with(HANDSHAKE_FAILED_PREFIX) {
            let dropped = self.session.on_rejected(&message);
            if !dropped.is_empty() {
                warn!(dropped = dropped.len(), "Secure sends dropped after rejected handshake");
            }
        }
        if message.to_lowercase().contains("username") {
            let desired = self.supervisor.desired_identity();
            let mut identity = self.identity.lock();
            if desired.is_some() && *identity == desired {
                *identity = None;
            }
            drop(identity);
            self.supervisor.set_desired_identity(None);
        }
        self.events.chat(ChatUpdate::Error(message));
    }

    async fn on_session_ack(&self) {
        let Some((ticket, released)) = self.session.on_ack() else {
            return;
        };
        for intent in released {
            if let Err(e) = self.release(&ticket, intent).await {
                warn!("Queued secure send failed: {}", e);
                self.events.chat(ChatUpdate::Error(e.to_string()));
            }
        }
    }
}

fn seal_body(key: &SessionKey, text: &str, file: Option<FileDescriptor>) -> Result<MessageBody> {
    let sealed = key.seal(text.as_bytes())?;
    Ok(MessageBody {
        enc: true,
        ciphertext: Some(sealed.ciphertext_b64()),
        iv: Some(sealed.iv_b64()),
        message: None,
        file,
        timestamp: None,
    })
}

/// Emit a transfer's chunks in order on connection `link`, pausing between them.
///
/// Stops once that connection is gone, since the relay could not decrypt
/// the rest under a new session key.
async fn stream_chunks<T: Transport>(
    supervisor: Arc<ConnectionSupervisor<T>>,
    events: AppEventSenders,
    link: u64,
    transfer_id: TransferId,
    commands: Vec<ClientCommand>,
    throttle: Duration,
) {
    let total = commands.len();
    for (index, command) in commands.into_iter().enumerate() {
        if let Err(e) = supervisor.send_on_link(link, command).await {
            warn!(transfer_id = %transfer_id, index, "Chunk send failed: {}", e);
            let message = match e {
                ChatError::Transport(TransportError::Closed) => {
                    "Connection lost during transfer".to_string()
                }
                e => e.to_string(),
            };
            events.transfer(TransferUpdate::Failed {
                transfer_id,
                message,
            });
            return;
        }
        if !throttle.is_zero() && index + 1 < total {
            tokio::time::sleep(throttle).await;
        }
    }
    debug!(transfer_id = %transfer_id, chunks = total, "All chunks emitted");
    events.transfer(TransferUpdate::Sent {
        transfer_id,
        chunks: total,
    });
}

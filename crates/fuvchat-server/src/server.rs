//! Chat server dispatcher
//!
//! Each connection gets one actor task that parses inbound frames and routes
//! them to the owning component. Connections run concurrently; shared state
//! lives in the components behind short locks. Completed uploads are relayed
//! on their own task so a large decrypt never stalls chunk ingestion.

use fuvchat_core::config::ServerConfig;
use fuvchat_core::protocol::{
    ClientCommand, PublicMessage, ServerEvent, SessionKeyAck, UserList, WireEvent, WireFrame,
};
use fuvchat_core::validation::AttachmentLimits;
use fuvchat_core::{
    ChatError, ConnectionId, Result, ServerKeyPair, Timestamp, TransferError,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::history::HistoryBuffer;
use crate::outbound::{deliver, Dispatch, Outbound};
use crate::presence::PresenceRegistry;
use crate::relay::{failure_dispatches, FileRelay, RelaySettings};
use crate::router::MessageRouter;
use crate::session_keys::SessionKeyExchange;

/// Display name used for server-generated notices
pub const SYSTEM_USERNAME: &str = "System";

/// The chat server
pub struct ChatServer {
    config: ServerConfig,
    presence: Arc<PresenceRegistry>,
    history: Arc<HistoryBuffer>,
    keys: SessionKeyExchange,
    router: MessageRouter,
    relay: Arc<FileRelay>,
    outbound: Arc<dyn Outbound>,
}

impl ChatServer {
    pub fn new(
        config: ServerConfig,
        keypair: ServerKeyPair,
        outbound: Arc<dyn Outbound>,
    ) -> Arc<Self> {
        let presence = Arc::new(PresenceRegistry::new(config.max_username_len));
        let history = Arc::new(HistoryBuffer::new(config.max_history));
        let limits = AttachmentLimits {
            max_file_bytes: config.max_file_bytes,
            max_name_len: config.max_attachment_name_len,
        };
        let router = MessageRouter::new(
            presence.clone(),
            history.clone(),
            limits,
            config.max_tracked_messages,
        );
        let relay = Arc::new(FileRelay::new(
            presence.clone(),
            RelaySettings::from(&config),
        ));
        let keys = SessionKeyExchange::new(keypair, presence.clone());

        info!(
            max_history = config.max_history,
            max_file_bytes = config.max_file_bytes,
            "Chat server ready"
        );
        Arc::new(Self {
            config,
            presence,
            history,
            keys,
            router,
            relay,
            outbound,
        })
    }

    /// Build from configuration, loading the private key or generating one
    pub fn from_config(config: ServerConfig, outbound: Arc<dyn Outbound>) -> Result<Arc<Self>> {
        let keypair = match &config.private_key_path {
            Some(path) => {
                info!(path = %path.display(), "Loading server key pair");
                ServerKeyPair::load(path)?
            }
            None => {
                info!(bits = config.rsa_key_bits, "Generating server key pair");
                ServerKeyPair::generate(config.rsa_key_bits)?
            }
        };
        Ok(Self::new(config, keypair, outbound))
    }

    /// PEM public key served out-of-band to clients
    pub fn public_key_pem(&self) -> Result<String> {
        self.keys.public_key_pem()
    }

    pub fn presence(&self) -> &Arc<PresenceRegistry> {
        &self.presence
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn relay(&self) -> &Arc<FileRelay> {
        &self.relay
    }

    // ------------------------------------------------------------------------
    // Connection Lifecycle
    // ------------------------------------------------------------------------

    /// Run a connection's actor: connect, handle frames in order, disconnect on close
    pub fn attach(
        self: &Arc<Self>,
        connection: ConnectionId,
        mut inbound: mpsc::UnboundedReceiver<WireFrame>,
    ) -> JoinHandle<()> {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            server.on_connect(&connection).await;
            while let Some(frame) = inbound.recv().await {
                server.handle_frame(&connection, frame).await;
            }
            server.on_disconnect(&connection).await;
        })
    }

    pub async fn on_connect(&self, connection: &ConnectionId) {
        self.presence.open_session(connection);
        info!(conn = %connection, "Client connected");
        if !self.history.is_empty() {
            deliver(
                self.outbound.as_ref(),
                vec![Dispatch::to(connection, self.router.history())],
            )
            .await;
        }
    }

    pub async fn on_disconnect(&self, connection: &ConnectionId) {
        let departure = self.presence.unregister(connection);
        self.router.forget_connection(connection);
        self.relay.drop_uploads_from(connection);
        info!(conn = %connection, "Client disconnected");

        if let Some(departure) = departure {
            let notice = PublicMessage {
                username: SYSTEM_USERNAME.to_string(),
                message: departure.notice(),
                timestamp: Timestamp::now().to_string(),
                file: None,
            };
            deliver(
                self.outbound.as_ref(),
                vec![
                    Dispatch::everyone(ServerEvent::UpdateUserList(UserList {
                        users: departure.roster,
                    })),
                    Dispatch::everyone(ServerEvent::Message(notice)),
                ],
            )
            .await;
        }
    }

    // ------------------------------------------------------------------------
    // Event Dispatch
    // ------------------------------------------------------------------------

    /// Parse one inbound frame and handle it; a malformed frame gets an error reply
    pub async fn handle_frame(&self, connection: &ConnectionId, frame: WireFrame) {
        match frame.decode::<ClientCommand>() {
            Ok(command) => self.handle(connection, command).await,
            Err(e) => {
                warn!(conn = %connection, "Rejected frame: {}", e);
                deliver(
                    self.outbound.as_ref(),
                    vec![Dispatch::error(connection, e.to_string())],
                )
                .await;
            }
        }
    }

    pub async fn handle(&self, connection: &ConnectionId, command: ClientCommand) {
        debug!(conn = %connection, event = command.name(), "Handling");
        let dispatches = match command {
            ClientCommand::Register(request) => self.register(connection, &request.username),
            ClientCommand::SessionKey(request) => {
                match self.keys.on_handshake(connection, &request.wrapped_key) {
                    Ok(()) => vec![Dispatch::to(
                        connection,
                        ServerEvent::SessionKeyOk(SessionKeyAck {}),
                    )],
                    Err(e) => vec![Dispatch::error(
                        connection,
                        format!("Session key exchange failed: {}", e),
                    )],
                }
            }
            ClientCommand::Message(body) => {
                reply_on_error(connection, self.router.public_message(connection, body))
            }
            ClientCommand::PrivateMessage(request) => {
                reply_on_error(connection, self.router.private_message(connection, request))
            }
            ClientCommand::PrivateMessageRead(request) => {
                self.router.mark_read(connection, &request.message_ids)
            }
            ClientCommand::Typing(request) => self.router.typing(connection, request),
            ClientCommand::RequestHistory(_) => {
                vec![Dispatch::to(connection, self.router.history())]
            }
            ClientCommand::PublicFileChunk(chunk) => self.ingest_chunk(connection, &chunk, false),
            ClientCommand::PrivateFileChunk(chunk) => self.ingest_chunk(connection, &chunk, true),
            ClientCommand::FileTransferAck(ack) => {
                self.relay.acknowledge(connection, ack).into_iter().collect()
            }
        };
        deliver(self.outbound.as_ref(), dispatches).await;
    }

    fn register(&self, connection: &ConnectionId, username: &str) -> Vec<Dispatch> {
        match self.presence.register(connection, username) {
            Ok(roster) => {
                let mut dispatches = vec![Dispatch::everyone(ServerEvent::UpdateUserList(
                    UserList { users: roster },
                ))];
                if !self.history.is_empty() {
                    dispatches.push(Dispatch::to(connection, self.router.history()));
                }
                dispatches
            }
            Err(e) => {
                debug!(conn = %connection, "Registration rejected: {}", e);
                vec![Dispatch::error(connection, e.to_string())]
            }
        }
    }

    fn ingest_chunk(
        &self,
        connection: &ConnectionId,
        chunk: &fuvchat_core::FileChunk,
        is_private: bool,
    ) -> Vec<Dispatch> {
        match self.relay.ingest(connection, chunk, is_private) {
            Ok(Some(completed)) => {
                let relay = Arc::clone(&self.relay);
                let outbound = Arc::clone(&self.outbound);
                tokio::spawn(async move {
                    relay.complete(completed, outbound.as_ref()).await;
                });
                Vec::new()
            }
            Ok(None) => Vec::new(),
            Err(ChatError::Transfer(TransferError::MalformedChunk { .. })) => Vec::new(),
            Err(ChatError::Transfer(e @ TransferError::NotOwner { .. })) => {
                failure_dispatches(connection, &chunk.transfer_id, &e)
            }
            Err(ChatError::Transfer(e)) => {
                let transfer_id = e.transfer_id().unwrap_or(&chunk.transfer_id);
                self.relay.abort(transfer_id);
                failure_dispatches(connection, transfer_id, &e)
            }
            Err(e) => vec![Dispatch::error(connection, e.to_string())],
        }
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// Periodically abort idle uploads, when an idle timeout is configured
    pub fn spawn_transfer_reaper(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let idle = self.config.transfer_idle_timeout()?;
        let period = (idle / 2).max(Duration::from_secs(1));
        let server = Arc::clone(self);
        info!(idle_secs = idle.as_secs(), "Transfer reaper started");
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let dispatches = server.relay.reap_idle(Instant::now(), idle);
                if !dispatches.is_empty() {
                    deliver(server.outbound.as_ref(), dispatches).await;
                }
            }
        }))
    }
}

fn reply_on_error(connection: &ConnectionId, result: Result<Vec<Dispatch>>) -> Vec<Dispatch> {
    match result {
        Ok(dispatches) => dispatches,
        Err(e) => {
            if e.is_user_facing() {
                debug!(conn = %connection, "Rejected: {}", e);
            } else {
                error!(conn = %connection, "Message processing failed: {}", e);
            }
            vec![Dispatch::error(connection, e.to_string())]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::keypair;
    use async_trait::async_trait;
    use fuvchat_core::crypto::wrap_session_key;
    use fuvchat_core::protocol::{MessageBody, PrivateSendRequest, RegisterRequest, SessionKeyRequest};
    use fuvchat_core::protocol::seal_into_chunks;
    use fuvchat_core::{SessionKey, TransferId};
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingOutbound {
        sent: Mutex<Vec<(Option<ConnectionId>, ServerEvent)>>,
    }

    #[async_trait]
    impl Outbound for RecordingOutbound {
        async fn send_to(&self, connection: &ConnectionId, event: ServerEvent) -> Result<()> {
            self.sent.lock().push((Some(connection.clone()), event));
            Ok(())
        }

        async fn broadcast(&self, event: ServerEvent, _except: Option<&ConnectionId>) -> Result<()> {
            self.sent.lock().push((None, event));
            Ok(())
        }
    }

    impl RecordingOutbound {
        fn take(&self) -> Vec<(Option<ConnectionId>, ServerEvent)> {
            std::mem::take(&mut *self.sent.lock())
        }
    }

    fn server() -> (Arc<ChatServer>, Arc<RecordingOutbound>) {
        let outbound = Arc::new(RecordingOutbound::default());
        let server = ChatServer::new(ServerConfig::default(), keypair(), outbound.clone());
        (server, outbound)
    }

    fn register(name: &str) -> ClientCommand {
        ClientCommand::Register(RegisterRequest {
            username: name.to_string(),
        })
    }

    #[tokio::test]
    async fn test_register_broadcasts_roster() {
        let (server, outbound) = server();
        let c1 = ConnectionId::new("c1");
        server.on_connect(&c1).await;
        server.handle(&c1, register("alice")).await;

        let sent = outbound.take();
        assert_eq!(
            sent,
            vec![(
                None,
                ServerEvent::UpdateUserList(UserList {
                    users: vec!["alice".to_string()]
                })
            )]
        );
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected_to_requester_only() {
        let (server, outbound) = server();
        let (c1, c2) = (ConnectionId::new("c1"), ConnectionId::new("c2"));
        server.handle(&c1, register("Bob")).await;
        outbound.take();
        server.handle(&c2, register("bob")).await;

        let sent = outbound.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, Some(c2));
        match &sent[0].1 {
            ServerEvent::Error(notice) => assert!(notice.message.contains("already taken")),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handshake_ack_and_error() {
        let (server, outbound) = server();
        let c1 = ConnectionId::new("c1");
        server.on_connect(&c1).await;

        let pem = server.public_key_pem().unwrap();
        let wrapped = wrap_session_key(&pem, &SessionKey::generate()).unwrap();
        server
            .handle(
                &c1,
                ClientCommand::SessionKey(SessionKeyRequest {
                    wrapped_key: wrapped,
                }),
            )
            .await;
        assert_eq!(
            outbound.take(),
            vec![(Some(c1.clone()), ServerEvent::SessionKeyOk(SessionKeyAck {}))]
        );

        server
            .handle(
                &c1,
                ClientCommand::SessionKey(SessionKeyRequest {
                    wrapped_key: "AAAA".to_string(),
                }),
            )
            .await;
        let sent = outbound.take();
        assert!(matches!(&sent[0].1, ServerEvent::Error(n) if n.message.starts_with("Session key exchange failed")));
        assert!(server.presence().key_ready(&c1));
    }

    #[tokio::test]
    async fn test_history_sent_on_connect_and_register() {
        let (server, outbound) = server();
        let c1 = ConnectionId::new("c1");
        server.handle(&c1, register("alice")).await;
        server
            .handle(&c1, ClientCommand::Message(MessageBody::plain("first")))
            .await;
        outbound.take();

        let c2 = ConnectionId::new("c2");
        server.on_connect(&c2).await;
        server.handle(&c2, register("bob")).await;
        let sent = outbound.take();
        let histories = sent
            .iter()
            .filter(|(to, event)| {
                to.as_ref() == Some(&c2) && matches!(event, ServerEvent::ChatHistory(h) if h.messages.len() == 1)
            })
            .count();
        assert_eq!(histories, 2);
    }

    #[tokio::test]
    async fn test_foreign_chunk_reported_without_aborting_owner() {
        let (server, outbound) = server();
        let (c1, c2) = (ConnectionId::new("c1"), ConnectionId::new("c2"));
        server.handle(&c1, register("alice")).await;
        server.handle(&c2, register("bob")).await;
        let key = SessionKey::generate();
        server.presence().install_key(&c1, key.clone());
        server.presence().install_key(&c2, SessionKey::generate());
        outbound.take();

        let id = TransferId::generate();
        let chunks = seal_into_chunks(&key, &id, "a.bin", &[1u8; 30], 16, None).unwrap();
        assert!(chunks.len() > 1);
        server
            .handle(&c1, ClientCommand::PublicFileChunk(chunks[0].clone()))
            .await;
        server
            .handle(&c2, ClientCommand::PublicFileChunk(chunks[1].clone()))
            .await;

        let sent = outbound.take();
        assert!(sent.iter().all(|(to, _)| to.as_ref() == Some(&c2)));
        assert!(sent.iter().any(|(_, event)| matches!(
            event,
            ServerEvent::FileTransferError(n) if n.transfer_id == id && n.message.contains("another sender")
        )));
        assert_eq!(server.relay().active_uploads(), 1);
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_error() {
        let (server, outbound) = server();
        let c1 = ConnectionId::new("c1");
        server
            .handle_frame(&c1, WireFrame::new("typing", json!({ "context": "shouting" })))
            .await;
        let sent = outbound.take();
        assert!(matches!(&sent[0].1, ServerEvent::Error(n) if n.message.contains("typing")));
    }

    #[tokio::test]
    async fn test_disconnect_announces_departure_and_drops_key() {
        let (server, outbound) = server();
        let (c1, c2) = (ConnectionId::new("c1"), ConnectionId::new("c2"));
        server.handle(&c1, register("alice")).await;
        server.handle(&c2, register("bob")).await;
        server.presence().install_key(&c2, SessionKey::generate());
        server
            .handle(
                &c1,
                ClientCommand::PrivateMessage(PrivateSendRequest {
                    recipient: "bob".to_string(),
                    body: MessageBody::plain("hi"),
                }),
            )
            .await;
        outbound.take();

        server.on_disconnect(&c2).await;
        let sent = outbound.take();
        assert_eq!(
            sent[0],
            (
                None,
                ServerEvent::UpdateUserList(UserList {
                    users: vec!["alice".to_string()]
                })
            )
        );
        assert!(
            matches!(&sent[1].1, ServerEvent::Message(m) if m.username == SYSTEM_USERNAME && m.message == "bob has left the chat.")
        );
        assert!(server.presence().session_key(&c2).is_none());

        server
            .handle(
                &c2,
                ClientCommand::PrivateMessageRead(fuvchat_core::protocol::ReadReceiptRequest {
                    message_ids: vec![fuvchat_core::MessageId::new(1)],
                }),
            )
            .await;
        assert!(outbound.take().is_empty());
    }

    #[tokio::test]
    async fn test_attach_runs_connection_actor() {
        let (server, outbound) = server();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = server.attach(ConnectionId::new("c1"), rx);
        tx.send(WireFrame::new("register", json!({ "username": "alice" })))
            .unwrap();
        drop(tx);
        handle.await.unwrap();

        let sent = outbound.take();
        assert_eq!(sent.len(), 3);
        assert!(server.presence().roster().is_empty());
    }
}

//! fuvchat Harness
//!
//! An in-process transport channel for running a real [`ChatServer`] against
//! real [`ChatClient`]s. Every event is serialized to JSON and parsed again on
//! the way across, so tests exercise the same wire vocabulary a socket would.

use async_trait::async_trait;
use dashmap::DashMap;
use fuvchat_client::{
    signal_channel, AppEventReceivers, ChatClient, PublicKeySource, SignalReceiver,
    SignalSender, Sleeper, Transport, TransportSignal,
};
use fuvchat_core::protocol::{WireEvent, WireFrame};
use fuvchat_core::{
    ChatConfig, ChatError, ClientCommand, ConnectionId, Result, ServerEvent, TransportError,
};
use fuvchat_server::{ChatServer, Outbound};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Serialize a frame to JSON text and parse it back
fn through_json(frame: WireFrame) -> Result<WireFrame> {
    let text = serde_json::to_string(&frame)?;
    Ok(serde_json::from_str(&text)?)
}

/// Encode, serialize, parse and decode, as a socket round trip would
fn over_the_wire<E: WireEvent>(event: &E) -> Result<E> {
    through_json(WireFrame::encode(event)?)?.decode()
}

// ----------------------------------------------------------------------------
// Hub
// ----------------------------------------------------------------------------

struct Link {
    signals: SignalSender,
    frames: mpsc::UnboundedSender<WireFrame>,
}

/// Server side of the in-process channel: one link per live connection
#[derive(Default)]
pub struct LocalHub {
    links: DashMap<ConnectionId, Link>,
    next_id: AtomicU64,
    refusals: AtomicU32,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` connect attempts fail
    pub fn refuse_connects(&self, count: u32) {
        self.refusals.store(count, Ordering::SeqCst);
    }

    fn take_refusal(&self) -> bool {
        self.refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    pub fn connection_count(&self) -> usize {
        self.links.len()
    }

    pub fn connections(&self) -> Vec<ConnectionId> {
        self.links.iter().map(|entry| entry.key().clone()).collect()
    }

    fn open(&self, signals: SignalSender) -> (ConnectionId, mpsc::UnboundedReceiver<WireFrame>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let connection = ConnectionId::new(format!("local-{}", id));
        let (frames, inbound) = mpsc::unbounded_channel();
        self.links
            .insert(connection.clone(), Link { signals, frames });
        debug!(conn = %connection, "Link opened");
        (connection, inbound)
    }

    fn forward(&self, connection: &ConnectionId, command: &ClientCommand) -> Result<()> {
        let frame = through_json(WireFrame::encode(command)?)?;
        let link = self
            .links
            .get(connection)
            .ok_or(ChatError::Transport(TransportError::NotConnected))?;
        link.frames
            .send(frame)
            .map_err(|_| ChatError::send_failed("server side closed"))
    }

    /// Remove a link quietly; the server sees the close, the client is not told
    fn close(&self, connection: &ConnectionId) -> bool {
        self.links.remove(connection).is_some()
    }

    /// Remove a link and hand back its signal sender without telling the client
    fn sever(&self, connection: &ConnectionId) -> Option<SignalSender> {
        self.links.remove(connection).map(|(_, link)| link.signals)
    }
}

#[async_trait]
impl Outbound for LocalHub {
    async fn send_to(&self, connection: &ConnectionId, event: ServerEvent) -> Result<()> {
        let event = over_the_wire(&event)?;
        let link = self.links.get(connection).ok_or_else(|| {
            ChatError::send_failed(format!("no link for connection {}", connection))
        })?;
        link.signals
            .send(TransportSignal::Event(event))
            .map_err(|_| ChatError::send_failed("client side closed"))
    }

    async fn broadcast(&self, event: ServerEvent, except: Option<&ConnectionId>) -> Result<()> {
        let event = over_the_wire(&event)?;
        for link in self.links.iter() {
            if Some(link.key()) == except {
                continue;
            }
            let _ = link.signals.send(TransportSignal::Event(event.clone()));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Client Transport
// ----------------------------------------------------------------------------

/// Client side of the in-process channel
pub struct LocalTransport {
    network: Arc<LocalNetwork>,
    signals: SignalSender,
    connection: Mutex<Option<ConnectionId>>,
}

impl LocalTransport {
    pub fn connection(&self) -> Option<ConnectionId> {
        self.connection.lock().clone()
    }

    fn current(&self) -> Result<ConnectionId> {
        self.connection()
            .ok_or(ChatError::Transport(TransportError::NotConnected))
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(&self) -> Result<()> {
        let hub = &self.network.hub;
        if hub.take_refusal() {
            return Err(ChatError::connect_failed("connection refused"));
        }
        let (connection, inbound) = hub.open(self.signals.clone());
        if let Some(stale) = self.connection.lock().replace(connection.clone()) {
            hub.close(&stale);
        }
        self.network.server.attach(connection, inbound);
        Ok(())
    }

    async fn emit(&self, command: ClientCommand) -> Result<()> {
        let connection = self.current()?;
        self.network.hub.forward(&connection, &command)
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(connection) = self.connection.lock().take() {
            self.network.hub.close(&connection);
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Network
// ----------------------------------------------------------------------------

/// A running server plus the hub its clients connect through
pub struct LocalNetwork {
    config: ChatConfig,
    hub: Arc<LocalHub>,
    server: Arc<ChatServer>,
}

impl LocalNetwork {
    pub fn start(config: ChatConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let hub = Arc::new(LocalHub::new());
        let server = ChatServer::from_config(config.server.clone(), hub.clone())?;
        Ok(Arc::new(Self {
            config,
            hub,
            server,
        }))
    }

    pub fn hub(&self) -> &Arc<LocalHub> {
        &self.hub
    }

    pub fn server(&self) -> &Arc<ChatServer> {
        &self.server
    }

    /// Sever a link as if the network dropped it. The server has seen the link
    /// open first, and the client hears of it only after the server has
    /// processed the close.
    pub async fn drop_connection(&self, connection: &ConnectionId) -> bool {
        while self.hub.links.contains_key(connection)
            && !self.server.presence().is_connected(connection)
        {
            tokio::task::yield_now().await;
        }
        let Some(signals) = self.hub.sever(connection) else {
            return false;
        };
        while self.server.presence().is_connected(connection) {
            tokio::task::yield_now().await;
        }
        info!(conn = %connection, "Link dropped");
        let _ = signals.send(TransportSignal::Closed {
            reason: "link dropped".to_string(),
        });
        true
    }

    /// Sever every link; returns how many were dropped
    pub async fn drop_all(&self) -> usize {
        let mut dropped = 0;
        for connection in self.hub.connections() {
            if self.drop_connection(&connection).await {
                dropped += 1;
            }
        }
        dropped
    }

    /// A fresh client transport and the signals it will report
    pub fn transport(self: &Arc<Self>) -> (Arc<LocalTransport>, SignalReceiver) {
        let (signals, receiver) = signal_channel();
        let transport = Arc::new(LocalTransport {
            network: Arc::clone(self),
            signals,
            connection: Mutex::new(None),
        });
        (transport, receiver)
    }

    /// A client wired to this network with its signal pump running
    pub fn spawn_client(
        self: &Arc<Self>,
        sleeper: Arc<dyn Sleeper>,
    ) -> (
        Arc<ChatClient<LocalTransport>>,
        Arc<LocalTransport>,
        AppEventReceivers,
    ) {
        let (transport, signals) = self.transport();
        let (client, receivers) = ChatClient::new(
            self.config.client.clone(),
            transport.clone(),
            self.clone(),
            sleeper,
        );
        client.spawn_pump(signals);
        (client, transport, receivers)
    }
}

#[async_trait]
impl PublicKeySource for LocalNetwork {
    async fn fetch_public_key_pem(&self) -> Result<String> {
        self.server.public_key_pem()
    }
}

// ----------------------------------------------------------------------------
// Timers
// ----------------------------------------------------------------------------

/// Records requested delays and returns at once
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    waits: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn waits(&self) -> Vec<Duration> {
        self.waits.lock().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.waits.lock().push(duration);
        tokio::task::yield_now().await;
    }
}

//! Connection Supervisor
//!
//! Owns the transport's lifecycle on the client:
//! - `Offline -> Connecting -> Connected`
//! - `Connected -> Reconnecting -> Connected | Offline`
//!
//! Outbound commands issued while not connected wait in the transport-gated
//! queue and are flushed in order once a connection is up. A generation
//! counter makes every connect and reconnect loop idempotent: work belonging
//! to an older generation stops as soon as it notices.

use async_trait::async_trait;
use fuvchat_core::config::ReconnectConfig;
use fuvchat_core::protocol::RegisterRequest;
use fuvchat_core::{ClientCommand, Result, TransportError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::channels::{AppEventSenders, ConnectionUpdate};
use crate::transport::Transport;

// ----------------------------------------------------------------------------
// Timer Abstraction
// ----------------------------------------------------------------------------

/// Waits between reconnect attempts
#[async_trait]
pub trait Sleeper: Send + Sync + 'static {
    async fn sleep(&self, duration: Duration);
}

/// Wall-clock sleeper backed by the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

// ----------------------------------------------------------------------------
// Connection Hooks
// ----------------------------------------------------------------------------

/// Per-connection setup and teardown run by the supervisor
#[async_trait]
pub trait ConnectHook: Send + Sync + 'static {
    /// Commands emitted on a fresh connection ahead of the pending queue.
    /// `link` identifies the connection for [`ConnectionSupervisor::send_on_link`].
    async fn on_connected(&self, link: u64) -> Vec<ClientCommand>;

    /// The current connection is gone, by request or not
    fn on_disconnected(&self);
}

// ----------------------------------------------------------------------------
// Supervisor
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Offline,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

/// A command waiting for the transport
#[derive(Debug, Clone, PartialEq)]
struct Pending {
    command: ClientCommand,
    /// Connection the command is only valid on, if any
    link: Option<u64>,
}

impl Pending {
    fn unbound(command: ClientCommand) -> Self {
        Self {
            command,
            link: None,
        }
    }
}

#[derive(Debug)]
struct SupervisorInner {
    state: SupervisorState,
    /// Bumped on every connect, loss and manual disconnect; doubles as the link id
    generation: u64,
    user_requested: bool,
    /// The link being established closed before it was up
    link_lost: bool,
    desired_identity: Option<String>,
    pending: VecDeque<Pending>,
}

impl SupervisorInner {
    /// Start a new generation; commands bound to older links are dropped
    fn advance(&mut self) -> u64 {
        self.generation += 1;
        self.link_lost = false;
        let generation = self.generation;
        let before = self.pending.len();
        self.pending
            .retain(|entry| entry.link.map_or(true, |link| link == generation));
        let dropped = before - self.pending.len();
        if dropped > 0 {
            debug!(dropped, "Dropped commands bound to a closed connection");
        }
        generation
    }
}

/// Collapse queued registers into one register for `identity` at the front
fn hoist_register(pending: &mut VecDeque<Pending>, identity: String) {
    pending.retain(|entry| !matches!(entry.command, ClientCommand::Register(_)));
    pending.push_front(Pending::unbound(ClientCommand::Register(RegisterRequest {
        username: identity,
    })));
}

/// How an attempt to bring a link up ended
enum Establish {
    Up,
    Lost,
    Superseded,
}

/// Reconnect-with-backoff and the transport-gated queue
pub struct ConnectionSupervisor<T: Transport> {
    transport: Arc<T>,
    sleeper: Arc<dyn Sleeper>,
    hook: Option<Arc<dyn ConnectHook>>,
    config: ReconnectConfig,
    inner: Mutex<SupervisorInner>,
    events: AppEventSenders,
}

impl<T: Transport> ConnectionSupervisor<T> {
    pub fn new(
        transport: Arc<T>,
        sleeper: Arc<dyn Sleeper>,
        hook: Option<Arc<dyn ConnectHook>>,
        config: ReconnectConfig,
        events: AppEventSenders,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            sleeper,
            hook,
            config,
            inner: Mutex::new(SupervisorInner {
                state: SupervisorState::Offline,
                generation: 0,
                user_requested: false,
                link_lost: false,
                desired_identity: None,
                pending: VecDeque::new(),
            }),
            events,
        })
    }

    pub fn state(&self) -> SupervisorState {
        self.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SupervisorState::Connected
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Name to re-register under after every (re)connection
    pub fn set_desired_identity(&self, identity: Option<String>) {
        self.inner.lock().desired_identity = identity;
    }

    pub fn desired_identity(&self) -> Option<String> {
        self.inner.lock().desired_identity.clone()
    }

    /// Connect if offline. A no-op while connecting, connected or reconnecting.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let generation = {
            let mut inner = self.inner.lock();
            if inner.state != SupervisorState::Offline {
                return Ok(());
            }
            inner.state = SupervisorState::Connecting;
            inner.user_requested = false;
            inner.advance()
        };

        info!("Connecting");
        match self.transport.connect().await {
            Ok(()) => {
                self.bring_up(generation, false).await;
                Ok(())
            }
            Err(e) => {
                {
                    let mut inner = self.inner.lock();
                    if inner.generation == generation {
                        inner.state = SupervisorState::Offline;
                    }
                }
                warn!("Connect failed: {}", e);
                self.events.connection(ConnectionUpdate::ConnectFailed {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// User-requested disconnect: no reconnect, pending commands discarded
    pub async fn disconnect(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            inner.user_requested = true;
            inner.advance();
            inner.state = SupervisorState::Offline;
            inner.desired_identity = None;
            let discarded = inner.pending.len();
            inner.pending.clear();
            if discarded > 0 {
                debug!(discarded, "Discarded pending commands");
            }
        }
        if let Some(hook) = &self.hook {
            hook.on_disconnected();
        }
        info!("Disconnecting on request");
        let result = self.transport.disconnect().await;
        self.events.connection(ConnectionUpdate::Disconnected {
            user_requested: true,
        });
        result
    }

    /// The transport closed without being asked to; start reconnecting.
    ///
    /// A close while a link is still being established is recorded and
    /// acted on once the establishing task notices it.
    pub fn on_transport_lost(self: &Arc<Self>, reason: &str) {
        let generation = {
            let mut inner = self.inner.lock();
            if inner.user_requested {
                debug!(reason, "Ignoring transport close after manual disconnect");
                return;
            }
            match inner.state {
                SupervisorState::Connected => inner.generation,
                SupervisorState::Connecting | SupervisorState::Reconnecting { .. } => {
                    debug!(reason, state = ?inner.state, "Transport closed while establishing");
                    inner.link_lost = true;
                    return;
                }
                SupervisorState::Offline => {
                    debug!(reason, "Ignoring transport close while offline");
                    return;
                }
            }
        };
        self.begin_reconnect(generation, reason);
    }

    /// Leave generation `from` for a fresh one and run the reconnect loop on it
    fn begin_reconnect(self: &Arc<Self>, from: u64, reason: &str) {
        let generation = {
            let mut inner = self.inner.lock();
            if inner.generation != from || inner.user_requested {
                return;
            }
            inner.state = SupervisorState::Reconnecting { attempt: 0 };
            inner.advance()
        };

        warn!(reason, "Connection lost");
        if let Some(hook) = &self.hook {
            hook.on_disconnected();
        }
        self.events.connection(ConnectionUpdate::Disconnected {
            user_requested: false,
        });

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            supervisor.reconnect_loop(generation).await;
        });
    }

    /// Emit now if connected; otherwise queue and make sure a connect is under way
    pub async fn send(self: &Arc<Self>, command: ClientCommand) -> Result<()> {
        let (command, start_connect) = {
            let mut inner = self.inner.lock();
            match inner.state {
                SupervisorState::Connected => (Some(command), false),
                state => {
                    inner.pending.push_back(Pending::unbound(command));
                    (None, state == SupervisorState::Offline)
                }
            }
        };

        match command {
            Some(command) => self.transport.emit(command).await,
            None => {
                if start_connect {
                    let supervisor = Arc::clone(self);
                    tokio::spawn(async move {
                        // Failure is reported on the connection channel
                        let _ = supervisor.connect().await;
                    });
                }
                Ok(())
            }
        }
    }

    /// Send a command that is only valid on connection `link`.
    ///
    /// Queued behind the flush while that link is being established, and
    /// refused with [`TransportError::Closed`] once it has gone.
    pub async fn send_on_link(&self, link: u64, command: ClientCommand) -> Result<()> {
        let command = {
            let mut inner = self.inner.lock();
            if inner.generation != link || inner.state == SupervisorState::Offline {
                debug!(link, current = inner.generation, "Refusing send on a closed connection");
                return Err(TransportError::Closed.into());
            }
            if inner.state != SupervisorState::Connected {
                inner.pending.push_back(Pending {
                    command,
                    link: Some(link),
                });
                return Ok(());
            }
            command
        };
        self.transport.emit(command).await
    }

    /// Emit only if connected right now; never queues
    pub async fn send_now(&self, command: ClientCommand) -> Result<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected.into());
        }
        self.transport.emit(command).await
    }

    async fn reconnect_loop(self: &Arc<Self>, generation: u64) {
        let max_attempts = self.config.max_attempts;
        for attempt in 1..=max_attempts {
            {
                let mut inner = self.inner.lock();
                if inner.generation != generation {
                    return;
                }
                inner.state = SupervisorState::Reconnecting { attempt };
                inner.link_lost = false;
            }
            info!(attempt, max_attempts, "Reconnection attempt");
            self.events
                .connection(ConnectionUpdate::Reconnecting { attempt });

            match self.transport.connect().await {
                Ok(()) => {
                    self.bring_up(generation, true).await;
                    return;
                }
                Err(e) => {
                    warn!(attempt, "Reconnection attempt failed: {}", e);
                    if attempt < max_attempts {
                        self.sleeper
                            .sleep(self.config.delay_for_attempt(attempt))
                            .await;
                    }
                }
            }
        }

        {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return;
            }
            inner.state = SupervisorState::Offline;
        }
        warn!(attempts = max_attempts, "Giving up on reconnection");
        self.events.connection(ConnectionUpdate::ReconnectFailed {
            attempts: max_attempts,
        });
    }

    /// Establish the link just opened; a link that dies meanwhile goes back to reconnecting
    async fn bring_up(self: &Arc<Self>, generation: u64, reconnected: bool) {
        match self.establish(generation).await {
            Establish::Up if reconnected => {
                info!("Reconnected");
                self.events.connection(ConnectionUpdate::Reconnected);
            }
            Establish::Up => {
                info!("Connected");
                self.events.connection(ConnectionUpdate::Connected);
            }
            Establish::Lost => self.begin_reconnect(generation, "closed while establishing"),
            Establish::Superseded => {}
        }
    }

    /// Run the hook preamble, then drain the queue until it stays empty.
    ///
    /// A command whose emit fails goes back to the front of the queue with
    /// everything after it, and the link counts as lost.
    async fn establish(&self, generation: u64) -> Establish {
        if let Some(hook) = &self.hook {
            for command in hook.on_connected(generation).await {
                if let Err(e) = self.transport.emit(command).await {
                    warn!("Connection preamble failed: {}", e);
                    self.inner.lock().link_lost = true;
                    break;
                }
            }
        }

        let mut first_batch = true;
        loop {
            let mut batch = {
                let mut inner = self.inner.lock();
                if inner.generation != generation {
                    return Establish::Superseded;
                }
                if inner.link_lost {
                    return Establish::Lost;
                }
                if first_batch {
                    first_batch = false;
                    if let Some(identity) = inner.desired_identity.clone() {
                        hoist_register(&mut inner.pending, identity);
                    }
                }
                if inner.pending.is_empty() {
                    inner.state = SupervisorState::Connected;
                    return Establish::Up;
                }
                std::mem::take(&mut inner.pending)
            };

            debug!(count = batch.len(), "Flushing pending commands");
            while let Some(entry) = batch.pop_front() {
                if let Err(e) = self.transport.emit(entry.command.clone()).await {
                    warn!("Failed to send pending command: {}", e);
                    let mut inner = self.inner.lock();
                    if inner.generation == generation {
                        batch.push_front(entry);
                        while let Some(unsent) = batch.pop_back() {
                            inner.pending.push_front(unsent);
                        }
                        inner.link_lost = true;
                    }
                    break;
                }
            }
        }
    }
}

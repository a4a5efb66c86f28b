//! Session-key exchange, initiator side
//!
//! Each connection generates a fresh key, wraps it with the server's public
//! key and waits for `session_key_ok`. Secure sends made before the ack wait
//! in the session-gated queue and are released in order on ack. Once the
//! exchange has failed they are rejected locally and never transmitted.

use fuvchat_core::crypto::wrap_session_key;
use fuvchat_core::protocol::{FileDescriptor, SessionKeyRequest};
use fuvchat_core::{ClientCommand, Result, SessionError, SessionKey, TransferId};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::transport::PublicKeySource;

/// A send that needs the session key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecureIntent {
    Public {
        text: String,
        file: Option<FileDescriptor>,
    },
    Private {
        recipient: String,
        text: String,
        file: Option<FileDescriptor>,
    },
    File {
        transfer_id: TransferId,
        filename: String,
        data: Vec<u8>,
        recipient: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    /// No exchange on the current connection yet
    Idle,
    AwaitingAck,
    Ready,
    Failed { reason: String },
}

/// An acknowledged key and the connection it was exchanged on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTicket {
    pub key: SessionKey,
    pub link: u64,
}

/// What to do with a secure send right now
#[derive(Debug)]
pub enum Gate {
    /// Key is ready; seal and emit on the ticket's connection
    Ready(SessionTicket, SecureIntent),
    /// Held until the ack arrives
    Queued,
}

#[derive(Debug)]
struct HandshakeInner {
    state: HandshakeState,
    key: Option<SessionKey>,
    link: u64,
    queue: VecDeque<SecureIntent>,
}

/// Client half of the session-key exchange
pub struct SessionHandshake {
    keys: Arc<dyn PublicKeySource>,
    inner: Mutex<HandshakeInner>,
}

impl SessionHandshake {
    pub fn new(keys: Arc<dyn PublicKeySource>) -> Self {
        Self {
            keys,
            inner: Mutex::new(HandshakeInner {
                state: HandshakeState::Idle,
                key: None,
                link: 0,
                queue: VecDeque::new(),
            }),
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.inner.lock().state.clone()
    }

    /// Key for the current connection, once acknowledged
    pub fn key(&self) -> Option<SessionKey> {
        let inner = self.inner.lock();
        match inner.state {
            HandshakeState::Ready => inner.key.clone(),
            _ => None,
        }
    }

    pub fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Generate and wrap a fresh key for connection `link`; returns the `session_key` command
    pub async fn initiate(&self, link: u64) -> Result<ClientCommand> {
        let key = SessionKey::generate();
        let wrapped = match self.keys.fetch_public_key_pem().await {
            Ok(pem) => wrap_session_key(&pem, &key),
            Err(e) => Err(e),
        };

        let mut inner = self.inner.lock();
        inner.link = link;
        match wrapped {
            Ok(wrapped_key) => {
                inner.state = HandshakeState::AwaitingAck;
                inner.key = Some(key);
                debug!(link, "Session key wrapped; awaiting ack");
                Ok(ClientCommand::SessionKey(SessionKeyRequest { wrapped_key }))
            }
            Err(e) => {
                warn!("Session key exchange could not start: {}", e);
                inner.state = HandshakeState::Failed {
                    reason: e.to_string(),
                };
                inner.key = None;
                Err(e)
            }
        }
    }

    /// Pass a secure send through the gate
    pub fn gate(&self, intent: SecureIntent) -> Result<Gate> {
        let mut inner = self.inner.lock();
        let ready = match &inner.state {
            HandshakeState::Ready => inner.key.clone().map(|key| SessionTicket {
                key,
                link: inner.link,
            }),
            HandshakeState::Failed { reason } => {
                return Err(SessionError::HandshakeRejected {
                    reason: reason.clone(),
                }
                .into())
            }
            _ => None,
        };
        if let Some(ticket) = ready {
            return Ok(Gate::Ready(ticket, intent));
        }
        inner.queue.push_back(intent);
        debug!(queued = inner.queue.len(), "Secure send waiting for session key");
        Ok(Gate::Queued)
    }

    /// The server acknowledged our key; returns it with the queued sends in order
    pub fn on_ack(&self) -> Option<(SessionTicket, Vec<SecureIntent>)> {
        let mut inner = self.inner.lock();
        if inner.state != HandshakeState::AwaitingAck {
            debug!(state = ?inner.state, "Ignoring unexpected session key ack");
            return None;
        }
        let key = inner.key.clone()?;
        inner.state = HandshakeState::Ready;
        let released: Vec<SecureIntent> = inner.queue.drain(..).collect();
        info!(link = inner.link, released = released.len(), "Session key established");
        Some((
            SessionTicket {
                key,
                link: inner.link,
            },
            released,
        ))
    }

    /// The server rejected our key; queued sends are dropped and returned
    pub fn on_rejected(&self, reason: &str) -> Vec<SecureIntent> {
        let mut inner = self.inner.lock();
        if inner.state != HandshakeState::AwaitingAck {
            return Vec::new();
        }
        warn!(reason, "Session key rejected");
        inner.state = HandshakeState::Failed {
            reason: reason.to_string(),
        };
        inner.key = None;
        inner.queue.drain(..).collect()
    }

    /// Forget the key and the queue; a new connection starts over
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = HandshakeState::Idle;
        inner.key = None;
        inner.queue.clear();
    }
}

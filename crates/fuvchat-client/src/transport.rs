//! Transport channel seam
//!
//! The client depends only on this interface. A transport reports inbound
//! events and unexpected closes through a [`TransportSignal`] channel handed
//! to it at construction.

use async_trait::async_trait;
use fuvchat_core::{ClientCommand, Result, ServerEvent, SessionError};
use tokio::sync::mpsc;

/// Client half of the bidirectional named-event channel
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open the connection; returns once the channel is usable
    async fn connect(&self) -> Result<()>;

    /// Emit one event
    async fn emit(&self, command: ClientCommand) -> Result<()>;

    /// Tear the connection down
    async fn disconnect(&self) -> Result<()>;
}

/// What a transport reports back to the client
#[derive(Debug, Clone, PartialEq)]
pub enum TransportSignal {
    /// An inbound event, already parsed
    Event(ServerEvent),
    /// The connection closed without being asked to
    Closed { reason: String },
}

pub type SignalSender = mpsc::UnboundedSender<TransportSignal>;
pub type SignalReceiver = mpsc::UnboundedReceiver<TransportSignal>;

pub fn signal_channel() -> (SignalSender, SignalReceiver) {
    mpsc::unbounded_channel()
}

/// Out-of-band source of the server's PEM public key
#[async_trait]
pub trait PublicKeySource: Send + Sync + 'static {
    async fn fetch_public_key_pem(&self) -> Result<String>;
}

/// A public key known ahead of time
#[derive(Debug, Clone)]
pub struct StaticKeySource {
    pem: String,
}

impl StaticKeySource {
    pub fn new<S: Into<String>>(pem: S) -> Self {
        Self { pem: pem.into() }
    }
}

#[async_trait]
impl PublicKeySource for StaticKeySource {
    async fn fetch_public_key_pem(&self) -> Result<String> {
        if self.pem.trim().is_empty() {
            return Err(SessionError::PublicKeyUnavailable {
                reason: "no key configured".to_string(),
            }
            .into());
        }
        Ok(self.pem.clone())
    }
}

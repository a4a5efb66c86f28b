//! Outbound side of the transport channel
//!
//! Components never emit while holding a lock. They compute a list of
//! [`Dispatch`]es under their locks, release them, and the caller hands the
//! list to [`deliver`].

use async_trait::async_trait;
use fuvchat_core::protocol::WireEvent;
use fuvchat_core::{ConnectionId, Result, ServerEvent};
use tracing::{trace, warn};

/// Server-to-client half of the transport
#[async_trait]
pub trait Outbound: Send + Sync + 'static {
    /// Emit to a single connection
    async fn send_to(&self, connection: &ConnectionId, event: ServerEvent) -> Result<()>;

    /// Emit to every live connection, optionally skipping one
    async fn broadcast(&self, event: ServerEvent, except: Option<&ConnectionId>) -> Result<()>;
}

/// Who an event goes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    Connection(ConnectionId),
    Everyone,
    EveryoneExcept(ConnectionId),
}

/// An event paired with its audience
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub audience: Audience,
    pub event: ServerEvent,
}

impl Dispatch {
    pub fn to(connection: &ConnectionId, event: ServerEvent) -> Self {
        Self {
            audience: Audience::Connection(connection.clone()),
            event,
        }
    }

    pub fn everyone(event: ServerEvent) -> Self {
        Self {
            audience: Audience::Everyone,
            event,
        }
    }

    pub fn everyone_except(connection: &ConnectionId, event: ServerEvent) -> Self {
        Self {
            audience: Audience::EveryoneExcept(connection.clone()),
            event,
        }
    }

    /// Error event for the originating connection
    pub fn error<S: Into<String>>(connection: &ConnectionId, message: S) -> Self {
        Self::to(connection, ServerEvent::error(message))
    }
}

/// Emit dispatches in order. A failed emit is logged and does not stop the rest.
pub async fn deliver<O>(outbound: &O, dispatches: Vec<Dispatch>)
where
    O: Outbound + ?Sized,
{
    for Dispatch { audience, event } in dispatches {
        let name = event.name();
        let result = match &audience {
            Audience::Connection(connection) => outbound.send_to(connection, event).await,
            Audience::Everyone => outbound.broadcast(event, None).await,
            Audience::EveryoneExcept(connection) => {
                outbound.broadcast(event, Some(connection)).await
            }
        };
        match result {
            Ok(()) => trace!(event = name, ?audience, "Delivered"),
            Err(e) => warn!(event = name, ?audience, "Delivery failed: {}", e),
        }
    }
}

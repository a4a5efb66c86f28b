//! fuvchat Server
//!
//! The server side of the chat service: the session-key responder, the
//! presence registry, the bounded public history, the message router and the
//! file relay, tied together by [`ChatServer`], which runs one actor task per
//! connection and talks to the transport only through [`Outbound`].

pub mod history;
pub mod logging;
pub mod outbound;
pub mod presence;
pub mod relay;
pub mod router;
pub mod server;
pub mod session_keys;

pub use history::HistoryBuffer;
pub use logging::init_logging;
pub use outbound::{deliver, Audience, Dispatch, Outbound};
pub use presence::{Departure, PresenceRegistry};
pub use relay::{FileRelay, RelaySettings, Upload};
pub use router::MessageRouter;
pub use server::ChatServer;
pub use session_keys::SessionKeyExchange;

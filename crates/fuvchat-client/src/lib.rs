//! fuvchat Client
//!
//! Client half of the chat service: a connection supervisor with
//! register-first queueing and exponential-backoff reconnection, the
//! session-key handshake that gates encrypted sends, chunked file transfer
//! in both directions, and typed update channels for the application.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod channels;
pub mod client;
pub mod session;
pub mod supervisor;
pub mod transfer;
pub mod transport;
pub mod typing;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use channels::{
    app_channels, AppEventReceivers, AppEventSenders, ChatUpdate, ConnectionUpdate,
    PresenceUpdate, TransferUpdate,
};
pub use client::ChatClient;
pub use session::{HandshakeState, SecureIntent, SessionHandshake, SessionTicket};
pub use supervisor::{ConnectHook, ConnectionSupervisor, Sleeper, SupervisorState, TokioSleeper};
pub use transfer::{FileReceiver, FileSender};
pub use transport::{
    signal_channel, PublicKeySource, SignalReceiver, SignalSender, StaticKeySource, Transport,
    TransportSignal,
};
pub use typing::TypingTracker;

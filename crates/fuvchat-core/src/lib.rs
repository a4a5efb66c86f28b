//! fuvchat Core Protocol Implementation
//!
//! Types shared by the chat server and its client: identifiers, the error
//! taxonomy, configuration, the session-key crypto primitives, the named-event
//! wire vocabulary, input validation, and the chunked file-transfer state
//! machine used on both the relay and the receiving client.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod crypto;
pub mod errors;
pub mod protocol;
pub mod types;
pub mod validation;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{ChatConfig, ClientConfig, ReconnectConfig, ServerConfig};
pub use crypto::{SealedPayload, ServerKeyPair, SessionKey};
pub use errors::{
    ChatError, ChatResult, CryptographicError, Result, SessionError, TransferError,
    TransportError, ValidationError,
};
pub use protocol::{
    ChunkAssembler, ChunkMetadata, ClientCommand, CompletedTransfer, FileChunk, IngestOutcome,
    ServerEvent,
};
pub use types::{ConnectionId, MessageId, MessageStatus, Timestamp, TransferId};

//! Error types for fuvchat
//!
//! One error enum per concern (input validation, cryptography, session
//! handshake, file transfer, transport) unified under [`ChatError`]. The
//! `Display` text of [`ValidationError`] is what the server sends back to the
//! originating connection in an `error` event, so it is phrased for users.

use crate::types::TransferId;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Rejected user input. Surfaced only to the originating connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Username cannot be empty.")]
    UsernameEmpty,
    #[error("Username must be at most {max} characters.")]
    UsernameTooLong { max: usize },
    #[error("Username '{name}' is already taken.")]
    UsernameTaken { name: String },
    #[error("Register a username before sending.")]
    NotRegistered,
    #[error("Cannot send an empty message.")]
    EmptyMessage,
    #[error("A valid recipient is required.")]
    RecipientRequired,
    #[error("You cannot send a private message to yourself.")]
    SelfAddressed,
    #[error("User '{name}' not found or offline.")]
    RecipientOffline { name: String },
    #[error("File of {size} bytes exceeds the {max} byte limit.")]
    FileTooLarge { size: u64, max: u64 },
    #[error("Filename cannot be empty.")]
    FilenameEmpty,
}

/// Symmetric and asymmetric primitive failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptographicError {
    #[error("Invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
    #[error("Invalid nonce length: expected {expected} bytes, got {actual}")]
    InvalidNonceLength { expected: usize, actual: usize },
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Key wrap failed: {0}")]
    KeyWrapFailed(String),
    #[error("Key unwrap failed: {0}")]
    KeyUnwrapFailed(String),
    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(String),
    #[error("Malformed base64: {0}")]
    MalformedBase64(String),
    #[error("Key generation failed: {0}")]
    KeyGenerationFailed(String),
}

/// Session-key handshake errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Session key not found.")]
    KeyNotEstablished,
    #[error("Session key exchange rejected: {reason}")]
    HandshakeRejected { reason: String },
    #[error("Server public key unavailable: {reason}")]
    PublicKeyUnavailable { reason: String },
}

/// Errors scoped to a single file transfer
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("Malformed chunk {index} for transfer {transfer_id}: {reason}")]
    MalformedChunk {
        transfer_id: TransferId,
        index: u32,
        reason: String,
    },
    #[error("Transfer {transfer_id} is missing its metadata")]
    MissingMetadata { transfer_id: TransferId },
    #[error("Transfer {transfer_id} of {size} bytes exceeds the {max} byte limit")]
    TooLarge {
        transfer_id: TransferId,
        size: u64,
        max: u64,
    },
    #[error("Reassembly of transfer {transfer_id} failed: {reason}")]
    Reassembly {
        transfer_id: TransferId,
        reason: String,
    },
    #[error("Recipient '{name}' not found")]
    RecipientUnavailable { name: String },
    #[error("Delivery of transfer {transfer_id} interrupted: {reason}")]
    DeliveryInterrupted {
        transfer_id: TransferId,
        reason: String,
    },
    #[error("Transfer {transfer_id} belongs to another sender")]
    NotOwner { transfer_id: TransferId },
    #[error("Transfer {transfer_id} timed out waiting for chunks")]
    TimedOut { transfer_id: TransferId },
    #[error("Staging I/O for transfer {transfer_id} failed: {source}")]
    Storage {
        transfer_id: TransferId,
        #[source]
        source: std::io::Error,
    },
}

impl TransferError {
    /// The transfer this error is scoped to, when there is one
    pub fn transfer_id(&self) -> Option<&TransferId> {
        match self {
            Self::MalformedChunk { transfer_id, .. }
            | Self::MissingMetadata { transfer_id }
            | Self::TooLarge { transfer_id, .. }
            | Self::Reassembly { transfer_id, .. }
            | Self::DeliveryInterrupted { transfer_id, .. }
            | Self::NotOwner { transfer_id }
            | Self::TimedOut { transfer_id }
            | Self::Storage { transfer_id, .. } => Some(transfer_id),
            Self::RecipientUnavailable { .. } => None,
        }
    }
}

/// Transport channel errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,
    #[error("Connection failed: {reason}")]
    ConnectFailed { reason: String },
    #[error("Send failed: {reason}")]
    SendFailed { reason: String },
    #[error("Connection closed")]
    Closed,
}

// ----------------------------------------------------------------------------
// Main Error Type
// ----------------------------------------------------------------------------

/// Unified error type for fuvchat
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptographicError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Malformed payload: {0}")]
    Protocol(String),

    #[error("Configuration error: {reason}")]
    Config { reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ----------------------------------------------------------------------------
// Convenience Constructors
// ----------------------------------------------------------------------------

impl ChatError {
    /// Create a malformed-payload error
    pub fn protocol<T: Into<String>>(message: T) -> Self {
        ChatError::Protocol(message.into())
    }

    /// Create a configuration error
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        ChatError::Config {
            reason: reason.into(),
        }
    }

    /// Create a connect failure
    pub fn connect_failed<T: Into<String>>(reason: T) -> Self {
        ChatError::Transport(TransportError::ConnectFailed {
            reason: reason.into(),
        })
    }

    /// Create a send failure
    pub fn send_failed<T: Into<String>>(reason: T) -> Self {
        ChatError::Transport(TransportError::SendFailed {
            reason: reason.into(),
        })
    }

    /// Errors whose text is meant for the originating user
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            ChatError::Validation(_) | ChatError::Session(_) | ChatError::Protocol(_)
        )
    }

    /// Only transport failures are retried automatically
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChatError::Transport(
                TransportError::NotConnected
                    | TransportError::ConnectFailed { .. }
                    | TransportError::SendFailed { .. }
                    | TransportError::Closed
            )
        )
    }
}

// ----------------------------------------------------------------------------
// Result Types
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, ChatError>;

pub type ChatResult<T> = Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_text_is_user_facing() {
        let err = ChatError::from(ValidationError::UsernameTaken {
            name: "bob".to_string(),
        });
        assert!(err.is_user_facing());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("already taken"));
    }

    #[test]
    fn test_transport_errors_are_retryable() {
        assert!(ChatError::connect_failed("refused").is_retryable());
        assert!(ChatError::from(TransportError::Closed).is_retryable());
        assert!(!ChatError::config_error("bad").is_retryable());
    }

    #[test]
    fn test_transfer_error_scope() {
        let id = TransferId::from_string("t-1".to_string());
        let err = TransferError::MissingMetadata {
            transfer_id: id.clone(),
        };
        assert_eq!(err.transfer_id(), Some(&id));
        let err = TransferError::RecipientUnavailable {
            name: "carol".to_string(),
        };
        assert!(err.transfer_id().is_none());
        assert_eq!(err.to_string(), "Recipient 'carol' not found");
    }
}

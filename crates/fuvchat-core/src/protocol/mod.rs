//! fuvchat Protocol Module
//!
//! - `events`: the named-event vocabulary exchanged over the transport
//! - `file_transfer`: chunking, chunk assembly and reassembly of file transfers

pub mod events;
pub mod file_transfer;

// Re-export event types
pub use events::{
    ChatHistory, ClientCommand, ErrorNotice, FileDescriptor, HistoryRequest, MessageBody,
    PrivateMessage, PrivateSendRequest, PublicMessage, ReadNotice, ReadReceiptRequest,
    RegisterRequest, ServerEvent, SessionKeyAck, SessionKeyRequest, TransferAck,
    TransferErrorNotice, TypingContext, TypingNotice, TypingRequest, UserList, WireEvent, WireFrame,
};

// Re-export file transfer types
pub use file_transfer::{
    seal_into_chunks, split_into_chunks, ChunkAssembler, ChunkMetadata, CompletedTransfer,
    FileChunk, IngestOutcome, ReassembledFile, TransferProgress,
};

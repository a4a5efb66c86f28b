//! Client-side file transfer
//!
//! [`FileSender`] seals a whole file under one nonce and turns the chunks
//! into `public_file_chunk` / `private_file_chunk` commands. [`FileReceiver`]
//! collects relayed `file_chunk` events, reassembles completed transfers off
//! the event path and produces the `file_transfer_ack` for the relay.

use fuvchat_core::config::ClientConfig;
use fuvchat_core::protocol::{seal_into_chunks, TransferAck};
use fuvchat_core::validation::check_file_size;
use fuvchat_core::{
    ChunkAssembler, ClientCommand, CompletedTransfer, FileChunk, IngestOutcome, Result,
    SessionKey, TransferError, TransferId, ValidationError,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::channels::{AppEventSenders, TransferUpdate};

// ----------------------------------------------------------------------------
// Sending
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FileSender {
    chunk_size: usize,
    max_file_bytes: u64,
}

impl FileSender {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            max_file_bytes: config.max_file_bytes,
        }
    }

    /// Reject a file before anything is queued or sealed
    pub fn check(&self, filename: &str, size: usize) -> core::result::Result<(), ValidationError> {
        if filename.trim().is_empty() {
            return Err(ValidationError::FilenameEmpty);
        }
        check_file_size(size as u64, self.max_file_bytes)
    }

    /// Seal `data` and build the chunk commands in emission order
    pub fn prepare(
        &self,
        key: &SessionKey,
        transfer_id: &TransferId,
        filename: &str,
        data: &[u8],
        recipient: Option<&str>,
    ) -> Result<Vec<ClientCommand>> {
        self.check(filename, data.len())?;
        let chunks = seal_into_chunks(
            key,
            transfer_id,
            filename.trim(),
            data,
            self.chunk_size,
            recipient,
        )?;
        let private = recipient.is_some();
        Ok(chunks
            .into_iter()
            .map(|chunk| {
                if private {
                    ClientCommand::PrivateFileChunk(chunk)
                } else {
                    ClientCommand::PublicFileChunk(chunk)
                }
            })
            .collect())
    }
}

// ----------------------------------------------------------------------------
// Receiving
// ----------------------------------------------------------------------------

/// Collects relayed chunks and reassembles finished transfers
#[derive(Debug)]
pub struct FileReceiver {
    assembler: Mutex<ChunkAssembler<()>>,
    events: AppEventSenders,
}

impl FileReceiver {
    pub fn new(config: &ClientConfig, events: AppEventSenders) -> Self {
        Self {
            assembler: Mutex::new(ChunkAssembler::with_size_limit(config.max_file_bytes)),
            events,
        }
    }

    /// Store a chunk and report progress; returns the transfer once complete
    pub fn ingest(&self, chunk: &FileChunk) -> Option<CompletedTransfer<()>> {
        let outcome = self.assembler.lock().ingest(chunk, || ());
        match outcome {
            Ok(IngestOutcome::Ignored) => None,
            Ok(IngestOutcome::Accepted {
                progress,
                completed,
            }) => {
                self.events.transfer(TransferUpdate::Progress {
                    transfer_id: progress.transfer_id,
                    received: progress.received,
                    total_chunks: progress.total_chunks,
                });
                completed
            }
            // Already logged by the assembler; the transfer carries on
            Err(TransferError::MalformedChunk { .. }) => None,
            Err(e) => {
                warn!(transfer_id = %chunk.transfer_id, "Inbound transfer aborted: {}", e);
                self.events.transfer(TransferUpdate::Failed {
                    transfer_id: chunk.transfer_id.clone(),
                    message: e.to_string(),
                });
                None
            }
        }
    }

    /// Reassemble on the blocking pool and report; returns the ack for the relay
    pub async fn finish(
        &self,
        completed: CompletedTransfer<()>,
        key: Option<SessionKey>,
    ) -> ClientCommand {
        let transfer_id = completed.transfer_id.clone();
        let result = tokio::task::spawn_blocking(move || completed.reassemble(key.as_ref()))
            .await
            .map_err(|e| TransferError::Reassembly {
                transfer_id: transfer_id.clone(),
                reason: e.to_string(),
            })
            .and_then(|reassembled| reassembled);

        let ack = match result {
            Ok(file) => {
                info!(
                    transfer_id = %transfer_id,
                    filename = %file.filename,
                    bytes = file.data.len(),
                    "File received"
                );
                self.events.transfer(TransferUpdate::Completed {
                    transfer_id: transfer_id.clone(),
                    file,
                });
                TransferAck {
                    transfer_id,
                    success: true,
                    error: None,
                }
            }
            Err(e) => {
                warn!(transfer_id = %transfer_id, "Reassembly failed: {}", e);
                let message = e.to_string();
                self.events.transfer(TransferUpdate::Failed {
                    transfer_id: transfer_id.clone(),
                    message: message.clone(),
                });
                TransferAck {
                    transfer_id,
                    success: false,
                    error: Some(message),
                }
            }
        };
        ClientCommand::FileTransferAck(ack)
    }

    /// Drop every unfinished inbound transfer
    pub fn reset(&self) {
        let aborted = self.assembler.lock().abort_where(|_| true);
        if !aborted.is_empty() {
            debug!(count = aborted.len(), "Dropped unfinished inbound transfers");
        }
    }

    pub fn active(&self) -> usize {
        self.assembler.lock().active_count()
    }
}

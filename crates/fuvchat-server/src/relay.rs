//! File relay
//!
//! The server collects a sender's encrypted upload, reassembles and decrypts
//! it off the ingestion path, then re-chunks the plaintext and streams it to
//! the private recipient or to everyone. The relay is a trusted intermediary:
//! forwarded chunks are not re-encrypted.

use fuvchat_core::config::ServerConfig;
use fuvchat_core::crypto::encode_b64;
use fuvchat_core::protocol::file_transfer::FINISHED_MEMORY;
use fuvchat_core::protocol::{
    ChunkAssembler, ChunkMetadata, CompletedTransfer, FileChunk, IngestOutcome, ServerEvent,
    TransferAck, TransferErrorNotice,
};
use fuvchat_core::{
    ConnectionId, Result, SessionError, Timestamp, TransferError, TransferId, ValidationError,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::outbound::{deliver, Dispatch, Outbound};
use crate::presence::PresenceRegistry;

// ----------------------------------------------------------------------------
// Settings
// ----------------------------------------------------------------------------

/// How the relay re-chunks and stages uploads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    pub chunk_size: usize,
    pub chunk_delay: Duration,
    pub max_file_bytes: u64,
    pub upload_dir: Option<PathBuf>,
}

impl From<&ServerConfig> for RelaySettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            chunk_size: config.relay_chunk_size,
            chunk_delay: config.relay_chunk_delay(),
            max_file_bytes: config.max_file_bytes,
            upload_dir: config.upload_dir.clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// Upload Tracking
// ----------------------------------------------------------------------------

/// Who is uploading a transfer and where it should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub sender: ConnectionId,
    pub is_private: bool,
    pub recipient: Option<String>,
}

/// Relayed transfers remembered so receiver acks can reach the uploader
#[derive(Debug, Default)]
struct RelayedTransfers {
    order: VecDeque<TransferId>,
    senders: HashMap<TransferId, (ConnectionId, bool)>,
}

impl RelayedTransfers {
    fn remember(&mut self, transfer_id: TransferId, sender: ConnectionId, is_private: bool) {
        if self
            .senders
            .insert(transfer_id.clone(), (sender, is_private))
            .is_none()
        {
            self.order.push_back(transfer_id);
        }
        while self.order.len() > FINISHED_MEMORY {
            if let Some(evicted) = self.order.pop_front() {
                self.senders.remove(&evicted);
            }
        }
    }

    fn forget(&mut self, transfer_id: &TransferId) {
        if self.senders.remove(transfer_id).is_some() {
            self.order.retain(|id| id != transfer_id);
        }
    }
}

/// Where relayed plaintext is read from while streaming
enum PieceSource {
    Memory { data: Vec<u8>, offset: usize },
    Disk { file: tokio::fs::File },
}

impl PieceSource {
    async fn next_piece(&mut self, size: usize) -> std::io::Result<Vec<u8>> {
        match self {
            PieceSource::Memory { data, offset } => {
                let end = (*offset + size).min(data.len());
                let piece = data[*offset..end].to_vec();
                *offset = end;
                Ok(piece)
            }
            PieceSource::Disk { file } => {
                let mut piece = Vec::with_capacity(size);
                file.take(size as u64).read_to_end(&mut piece).await?;
                Ok(piece)
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Relay
// ----------------------------------------------------------------------------

/// Server-side relay for chunked file transfers
#[derive(Debug)]
pub struct FileRelay {
    presence: Arc<PresenceRegistry>,
    uploads: Mutex<ChunkAssembler<Upload>>,
    relayed: Mutex<RelayedTransfers>,
    settings: RelaySettings,
}

impl FileRelay {
    pub fn new(presence: Arc<PresenceRegistry>, settings: RelaySettings) -> Self {
        Self {
            presence,
            uploads: Mutex::new(ChunkAssembler::with_size_limit(settings.max_file_bytes)),
            relayed: Mutex::new(RelayedTransfers::default()),
            settings,
        }
    }

    /// Store an uploaded chunk; returns the transfer once every chunk is in
    pub fn ingest(
        &self,
        connection: &ConnectionId,
        chunk: &FileChunk,
        is_private: bool,
    ) -> Result<Option<CompletedTransfer<Upload>>> {
        if !self.presence.key_ready(connection) {
            return Err(SessionError::KeyNotEstablished.into());
        }
        if self.presence.display_name(connection).is_none() {
            return Err(ValidationError::NotRegistered.into());
        }

        if let Some(metadata) = chunk.metadata.as_ref().filter(|_| chunk.chunk_index == 0) {
            info!(
                conn = %connection,
                transfer_id = %chunk.transfer_id,
                filename = %metadata.filename,
                total_chunks = metadata.total_chunks,
                private = is_private,
                "Upload started"
            );
        }

        let recipient = chunk
            .recipient
            .as_deref()
            .or_else(|| chunk.metadata.as_ref().and_then(|m| m.recipient.as_deref()))
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string);
        let mut uploads = self.uploads.lock();
        if let Some(owner) = uploads.context(&chunk.transfer_id).map(|upload| &upload.sender) {
            if owner != connection {
                warn!(
                    conn = %connection,
                    owner = %owner,
                    transfer_id = %chunk.transfer_id,
                    "Rejecting chunk for another connection's upload"
                );
                return Err(TransferError::NotOwner {
                    transfer_id: chunk.transfer_id.clone(),
                }
                .into());
            }
        }
        let outcome = uploads.ingest(chunk, || Upload {
            sender: connection.clone(),
            is_private,
            recipient,
        })?;
        drop(uploads);

        match outcome {
            IngestOutcome::Ignored => Ok(None),
            IngestOutcome::Accepted {
                progress,
                completed,
            } => {
                debug!(
                    transfer_id = %progress.transfer_id,
                    received = progress.received,
                    total = progress.total_chunks,
                    "Upload progress"
                );
                Ok(completed)
            }
        }
    }

    /// Reassemble a completed upload and stream it on, reporting failure to the uploader
    pub async fn complete<O>(&self, completed: CompletedTransfer<Upload>, outbound: &O)
    where
        O: Outbound + ?Sized,
    {
        let transfer_id = completed.transfer_id.clone();
        let upload = completed.context.clone();
        // Receivers may ack before the last chunk has left this task
        self.relayed.lock().remember(
            transfer_id.clone(),
            upload.sender.clone(),
            upload.is_private,
        );
        match self.relay(completed, &upload, outbound).await {
            Ok(chunks) => {
                info!(transfer_id = %transfer_id, chunks, "Relay complete");
            }
            Err(e) => {
                warn!(transfer_id = %transfer_id, "Relay failed: {}", e);
                self.relayed.lock().forget(&transfer_id);
                deliver(outbound, failure_dispatches(&upload.sender, &transfer_id, &e)).await;
            }
        }
    }

    async fn relay<O>(
        &self,
        completed: CompletedTransfer<Upload>,
        upload: &Upload,
        outbound: &O,
    ) -> core::result::Result<usize, TransferError>
    where
        O: Outbound + ?Sized,
    {
        let transfer_id = completed.transfer_id.clone();
        let key = self.presence.session_key(&upload.sender);
        let file = tokio::task::spawn_blocking(move || completed.reassemble(key.as_ref()))
            .await
            .map_err(|e| TransferError::Reassembly {
                transfer_id: transfer_id.clone(),
                reason: e.to_string(),
            })??;

        let target = if upload.is_private {
            let name = upload.recipient.clone().unwrap_or_default();
            match self.presence.find(&name) {
                Some(connection) => Some(connection),
                None => return Err(TransferError::RecipientUnavailable { name }),
            }
        } else {
            None
        };

        let mut metadata = ChunkMetadata::new(file.filename, file.data.len() as u64);
        metadata.username = self.presence.display_name(&upload.sender);
        metadata.timestamp = Some(Timestamp::now().to_string());
        metadata.is_private = upload.is_private;
        metadata.recipient = upload.recipient.clone().filter(|_| upload.is_private);

        match &self.settings.upload_dir {
            None => {
                let total_size = file.data.len();
                let source = PieceSource::Memory {
                    data: file.data,
                    offset: 0,
                };
                self.stream(&transfer_id, source, total_size, metadata, target.as_ref(), outbound)
                    .await
            }
            Some(dir) => {
                let path = staging_path(dir, &transfer_id);
                let result = self
                    .stream_staged(&transfer_id, &path, file.data, metadata, target.as_ref(), outbound)
                    .await;
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    debug!(path = %path.display(), "Staged upload not removed: {}", e);
                }
                result
            }
        }
    }

    async fn stream_staged<O>(
        &self,
        transfer_id: &TransferId,
        path: &Path,
        data: Vec<u8>,
        metadata: ChunkMetadata,
        target: Option<&ConnectionId>,
        outbound: &O,
    ) -> core::result::Result<usize, TransferError>
    where
        O: Outbound + ?Sized,
    {
        let storage = |source: std::io::Error| TransferError::Storage {
            transfer_id: transfer_id.clone(),
            source,
        };
        let total_size = data.len();
        tokio::fs::write(path, &data).await.map_err(storage)?;
        drop(data);
        let file = tokio::fs::File::open(path).await.map_err(storage)?;
        self.stream(
            transfer_id,
            PieceSource::Disk { file },
            total_size,
            metadata,
            target,
            outbound,
        )
        .await
    }

    async fn stream<O>(
        &self,
        transfer_id: &TransferId,
        mut source: PieceSource,
        total_size: usize,
        metadata: ChunkMetadata,
        target: Option<&ConnectionId>,
        outbound: &O,
    ) -> core::result::Result<usize, TransferError>
    where
        O: Outbound + ?Sized,
    {
        let chunk_size = self.settings.chunk_size.max(1);
        let total = total_size.div_ceil(chunk_size).max(1) as u32;
        let mut metadata = Some(ChunkMetadata {
            total_chunks: total,
            chunk_size,
            transfer_id: Some(transfer_id.clone()),
            ..metadata
        });
        info!(transfer_id = %transfer_id, total, private = target.is_some(), "Relaying file");

        for index in 0..total {
            let piece = source
                .next_piece(chunk_size)
                .await
                .map_err(|source| TransferError::Storage {
                    transfer_id: transfer_id.clone(),
                    source,
                })?;
            let chunk = FileChunk {
                transfer_id: transfer_id.clone(),
                chunk_index: index,
                chunk_data: encode_b64(&piece),
                is_last_chunk: index + 1 == total,
                metadata: if index == 0 { metadata.take() } else { None },
                recipient: None,
            };
            let event = ServerEvent::FileChunk(chunk);
            let sent = match target {
                Some(connection) => outbound.send_to(connection, event).await,
                None => outbound.broadcast(event, None).await,
            };
            sent.map_err(|e| TransferError::DeliveryInterrupted {
                transfer_id: transfer_id.clone(),
                reason: e.to_string(),
            })?;

            if !self.settings.chunk_delay.is_zero() && index + 1 < total {
                tokio::time::sleep(self.settings.chunk_delay).await;
            }
        }
        Ok(total as usize)
    }

    /// Route a receiver's ack back to the uploader.
    ///
    /// A private transfer is forgotten after its ack; a public one keeps
    /// forwarding acks from every receiver except the uploader itself.
    pub fn acknowledge(&self, connection: &ConnectionId, ack: TransferAck) -> Option<Dispatch> {
        let mut relayed = self.relayed.lock();
        let (sender, is_private) = relayed.senders.get(&ack.transfer_id).cloned()?;
        if &sender == connection {
            return None;
        }
        if is_private {
            relayed.forget(&ack.transfer_id);
        }
        drop(relayed);

        if !self.presence.is_connected(&sender) {
            return None;
        }
        debug!(transfer_id = %ack.transfer_id, success = ack.success, "Forwarding ack");
        Some(Dispatch::to(&sender, ServerEvent::FileTransferAck(ack)))
    }

    /// Abort a departed connection's unfinished uploads
    pub fn drop_uploads_from(&self, connection: &ConnectionId) -> usize {
        let aborted = self
            .uploads
            .lock()
            .abort_where(|upload| &upload.sender == connection);
        if !aborted.is_empty() {
            info!(conn = %connection, count = aborted.len(), "Dropped unfinished uploads");
        }
        aborted.len()
    }

    /// Abort uploads idle for longer than `idle`, notifying their senders
    pub fn reap_idle(&self, now: Instant, idle: Duration) -> Vec<Dispatch> {
        let reaped = self.uploads.lock().reap_idle(now, idle);
        reaped
            .into_iter()
            .filter(|(_, upload)| self.presence.is_connected(&upload.sender))
            .flat_map(|(transfer_id, upload)| {
                warn!(transfer_id = %transfer_id, "Upload timed out");
                let error = TransferError::TimedOut {
                    transfer_id: transfer_id.clone(),
                };
                failure_dispatches(&upload.sender, &transfer_id, &error)
            })
            .collect()
    }

    /// Abort one upload after a fatal chunk error
    pub fn abort(&self, transfer_id: &TransferId) {
        self.uploads.lock().abort(transfer_id);
    }

    pub fn active_uploads(&self) -> usize {
        self.uploads.lock().active_count()
    }
}

/// `error` plus `file_transfer_error` for the uploader
pub(crate) fn failure_dispatches(
    sender: &ConnectionId,
    transfer_id: &TransferId,
    error: &TransferError,
) -> Vec<Dispatch> {
    let message = error.to_string();
    vec![
        Dispatch::error(sender, message.clone()),
        Dispatch::to(
            sender,
            ServerEvent::FileTransferError(TransferErrorNotice {
                transfer_id: transfer_id.clone(),
                message,
            }),
        ),
    ]
}

fn staging_path(dir: &Path, transfer_id: &TransferId) -> PathBuf {
    let safe: String = transfer_id
        .as_str()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    dir.join(format!("{}.upload", safe))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fuvchat_core::protocol::{seal_into_chunks, ReassembledFile};
    use fuvchat_core::{ChatError, SessionKey};

    /// Records every emit instead of sending it
    #[derive(Default)]
    struct RecordingOutbound {
        sent: Mutex<Vec<(Option<ConnectionId>, ServerEvent)>>,
    }

    #[async_trait]
    impl Outbound for RecordingOutbound {
        async fn send_to(&self, connection: &ConnectionId, event: ServerEvent) -> Result<()> {
            self.sent.lock().push((Some(connection.clone()), event));
            Ok(())
        }

        async fn broadcast(&self, event: ServerEvent, _except: Option<&ConnectionId>) -> Result<()> {
            self.sent.lock().push((None, event));
            Ok(())
        }
    }

    impl RecordingOutbound {
        fn chunks(&self) -> Vec<(Option<ConnectionId>, FileChunk)> {
            self.sent
                .lock()
                .iter()
                .filter_map(|(to, event)| match event {
                    ServerEvent::FileChunk(chunk) => Some((to.clone(), chunk.clone())),
                    _ => None,
                })
                .collect()
        }

        fn errors(&self) -> Vec<String> {
            self.sent
                .lock()
                .iter()
                .filter_map(|(_, event)| match event {
                    ServerEvent::Error(notice) => Some(notice.message.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    struct Fixture {
        presence: Arc<PresenceRegistry>,
        relay: FileRelay,
        alice: ConnectionId,
        bob: ConnectionId,
        key: SessionKey,
    }

    fn fixture(settings: RelaySettings) -> Fixture {
        let presence = Arc::new(PresenceRegistry::new(50));
        let alice = ConnectionId::new("c-alice");
        let bob = ConnectionId::new("c-bob");
        presence.register(&alice, "alice").unwrap();
        presence.register(&bob, "bob").unwrap();
        let key = SessionKey::generate();
        presence.install_key(&alice, key.clone());
        Fixture {
            relay: FileRelay::new(presence.clone(), settings),
            presence,
            alice,
            bob,
            key,
        }
    }

    fn settings() -> RelaySettings {
        RelaySettings {
            chunk_size: 1000,
            chunk_delay: Duration::ZERO,
            max_file_bytes: 1_000_000,
            upload_dir: None,
        }
    }

    fn upload_all(f: &Fixture, chunks: &[FileChunk], is_private: bool) -> CompletedTransfer<Upload> {
        let mut completed = None;
        for chunk in chunks {
            if let Some(done) = f.relay.ingest(&f.alice, chunk, is_private).unwrap() {
                completed = Some(done);
            }
        }
        completed.expect("upload completes")
    }

    fn reassemble(chunks: &[(Option<ConnectionId>, FileChunk)]) -> ReassembledFile {
        let mut assembler: ChunkAssembler<()> = ChunkAssembler::new();
        let mut done = None;
        for (_, chunk) in chunks {
            if let IngestOutcome::Accepted {
                completed: Some(c), ..
            } = assembler.ingest(chunk, || ()).unwrap()
            {
                done = Some(c);
            }
        }
        done.unwrap().reassemble(None).unwrap()
    }

    #[tokio::test]
    async fn test_private_relay_rechunks_plaintext() {
        let f = fixture(settings());
        let data: Vec<u8> = (0..2500u32).map(|i| (i % 256) as u8).collect();
        let id = TransferId::generate();
        let chunks = seal_into_chunks(&f.key, &id, "notes.txt", &data, 700, Some("bob")).unwrap();
        let completed = upload_all(&f, &chunks, true);
        assert_eq!(f.relay.active_uploads(), 0);

        let outbound = RecordingOutbound::default();
        f.relay.complete(completed, &outbound).await;

        let relayed = outbound.chunks();
        assert_eq!(relayed.len(), 3);
        assert!(relayed.iter().all(|(to, _)| to.as_ref() == Some(&f.bob)));
        let metadata = relayed[0].1.metadata.clone().unwrap();
        assert_eq!(metadata.iv, None);
        assert_eq!(metadata.username.as_deref(), Some("alice"));
        assert_eq!(metadata.recipient.as_deref(), Some("bob"));
        assert!(metadata.is_private);

        let file = reassemble(&relayed);
        assert_eq!(file.filename, "notes.txt");
        assert_eq!(file.data, data);
    }

    #[tokio::test]
    async fn test_public_relay_broadcasts() {
        let f = fixture(settings());
        let chunks =
            seal_into_chunks(&f.key, &TransferId::generate(), "a.bin", b"abc", 64, None).unwrap();
        let completed = upload_all(&f, &chunks, false);
        let outbound = RecordingOutbound::default();
        f.relay.complete(completed, &outbound).await;
        let relayed = outbound.chunks();
        assert_eq!(relayed.len(), 1);
        assert!(relayed[0].0.is_none());
    }

    #[tokio::test]
    async fn test_missing_recipient_reports_to_sender() {
        let f = fixture(settings());
        let id = TransferId::generate();
        let chunks = seal_into_chunks(&f.key, &id, "a.bin", b"abc", 64, Some("carol")).unwrap();
        let completed = upload_all(&f, &chunks, true);
        let outbound = RecordingOutbound::default();
        f.relay.complete(completed, &outbound).await;

        assert!(outbound.chunks().is_empty());
        assert_eq!(outbound.errors(), vec!["Recipient 'carol' not found".to_string()]);
        let sent = outbound.sent.lock();
        assert!(sent.iter().any(|(to, event)| to.as_ref() == Some(&f.alice)
            && matches!(event, ServerEvent::FileTransferError(n) if n.transfer_id == id)));
        drop(sent);

        let ack = TransferAck {
            transfer_id: id,
            success: true,
            error: None,
        };
        assert!(f.relay.acknowledge(&f.bob, ack).is_none());
    }

    #[tokio::test]
    async fn test_decrypt_failure_reports_transfer_error() {
        let f = fixture(settings());
        let chunks = seal_into_chunks(
            &SessionKey::generate(),
            &TransferId::generate(),
            "a.bin",
            b"abc",
            64,
            None,
        )
        .unwrap();
        let completed = upload_all(&f, &chunks, false);
        let outbound = RecordingOutbound::default();
        f.relay.complete(completed, &outbound).await;
        assert!(outbound.chunks().is_empty());
        assert_eq!(outbound.errors().len(), 1);
        assert!(outbound.errors()[0].contains("Reassembly"));
    }

    #[tokio::test]
    async fn test_staged_relay_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(RelaySettings {
            upload_dir: Some(dir.path().to_path_buf()),
            ..settings()
        });
        let data = vec![42u8; 2048];
        let chunks =
            seal_into_chunks(&f.key, &TransferId::generate(), "disk.bin", &data, 512, Some("bob"))
                .unwrap();
        let completed = upload_all(&f, &chunks, true);
        let outbound = RecordingOutbound::default();
        f.relay.complete(completed, &outbound).await;

        let file = reassemble(&outbound.chunks());
        assert_eq!(file.data, data);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_staging_failure_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(RelaySettings {
            upload_dir: Some(dir.path().join("missing")),
            ..settings()
        });
        let chunks =
            seal_into_chunks(&f.key, &TransferId::generate(), "a.bin", b"abc", 64, None).unwrap();
        let completed = upload_all(&f, &chunks, false);
        let outbound = RecordingOutbound::default();
        f.relay.complete(completed, &outbound).await;
        assert!(outbound.chunks().is_empty());
        assert!(outbound.errors()[0].contains("Staging I/O"));
    }

    #[test]
    fn test_ingest_requires_session_key() {
        let f = fixture(settings());
        let chunks =
            seal_into_chunks(&f.key, &TransferId::generate(), "a.bin", b"abc", 64, None).unwrap();
        let err = f.relay.ingest(&f.bob, &chunks[0], false).unwrap_err();
        assert!(matches!(err, ChatError::Session(SessionError::KeyNotEstablished)));
    }

    #[test]
    fn test_chunks_from_another_connection_rejected() {
        let f = fixture(settings());
        f.presence.install_key(&f.bob, SessionKey::generate());
        let id = TransferId::generate();
        let chunks = seal_into_chunks(&f.key, &id, "a.bin", &[7u8; 40], 10, None).unwrap();
        let (last, rest) = chunks.split_last().unwrap();
        for chunk in rest {
            assert!(f.relay.ingest(&f.alice, chunk, false).unwrap().is_none());
        }

        let err = f.relay.ingest(&f.bob, last, false).unwrap_err();
        assert!(matches!(
            err,
            ChatError::Transfer(TransferError::NotOwner { ref transfer_id }) if *transfer_id == id
        ));
        assert_eq!(f.relay.active_uploads(), 1);

        // The owner's transfer is untouched and still completes
        let completed = f.relay.ingest(&f.alice, last, false).unwrap().unwrap();
        assert_eq!(completed.context.sender, f.alice);
        assert_eq!(completed.reassemble(Some(&f.key)).unwrap().data, vec![7u8; 40]);
    }

    #[test]
    fn test_late_upload_chunk_ignored() {
        let f = fixture(settings());
        let chunks =
            seal_into_chunks(&f.key, &TransferId::generate(), "a.bin", b"abcdef", 8, None).unwrap();
        upload_all(&f, &chunks, false);
        assert!(f.relay.ingest(&f.alice, &chunks[0], false).unwrap().is_none());
        assert_eq!(f.relay.active_uploads(), 0);
    }

    #[tokio::test]
    async fn test_ack_forwarding() {
        let f = fixture(settings());
        let id = TransferId::generate();
        let chunks = seal_into_chunks(&f.key, &id, "a.bin", b"abc", 64, Some("bob")).unwrap();
        let completed = upload_all(&f, &chunks, true);
        f.relay.complete(completed, &RecordingOutbound::default()).await;

        let ack = TransferAck {
            transfer_id: id.clone(),
            success: true,
            error: None,
        };
        let dispatch = f.relay.acknowledge(&f.bob, ack.clone()).unwrap();
        assert_eq!(dispatch, Dispatch::to(&f.alice, ServerEvent::FileTransferAck(ack.clone())));
        assert!(f.relay.acknowledge(&f.bob, ack).is_none());
    }

    #[test]
    fn test_disconnect_and_idle_cleanup() {
        let f = fixture(settings());
        let chunks =
            seal_into_chunks(&f.key, &TransferId::generate(), "a.bin", &[1u8; 100], 10, None)
                .unwrap();
        f.relay.ingest(&f.alice, &chunks[0], false).unwrap();
        assert_eq!(f.relay.drop_uploads_from(&f.alice), 1);

        let chunks =
            seal_into_chunks(&f.key, &TransferId::generate(), "b.bin", &[1u8; 100], 10, None)
                .unwrap();
        f.relay.ingest(&f.alice, &chunks[0], false).unwrap();
        assert!(f.relay.reap_idle(Instant::now(), Duration::from_secs(30)).is_empty());
        let dispatches = f
            .relay
            .reap_idle(Instant::now() + Duration::from_secs(60), Duration::from_secs(30));
        assert_eq!(dispatches.len(), 2);
        assert_eq!(f.relay.active_uploads(), 0);
        assert!(f.presence.is_connected(&f.alice));
    }
}

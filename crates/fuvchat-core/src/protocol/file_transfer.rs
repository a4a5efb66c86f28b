//! Chunked file transfer protocol
//!
//! A sender seals the whole file once under a single nonce, splits the
//! ciphertext into fixed-size chunks and emits them in order, with chunk 0
//! carrying the transfer metadata. Receivers (the relay and the terminal
//! client) feed chunks in whatever order they arrive into a
//! [`ChunkAssembler`], which hands back a [`CompletedTransfer`] exactly once
//! when every chunk is present. Reassembly and decryption happen on the
//! completed value, off the ingestion path.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::crypto::{decode_b64, encode_b64, SessionKey};
use crate::errors::{Result, TransferError};
use crate::types::TransferId;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// AES-GCM authentication tag appended to every sealed payload
const SEAL_OVERHEAD: u64 = 16;

/// Finished transfer ids remembered for late-chunk suppression
pub const FINISHED_MEMORY: usize = 1024;

// ----------------------------------------------------------------------------
// Wire Types
// ----------------------------------------------------------------------------

/// Transfer description carried on chunk 0
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub filename: String,
    /// Plaintext size in bytes
    #[serde(default)]
    pub total_size: u64,
    #[serde(default)]
    pub total_chunks: u32,
    #[serde(default)]
    pub chunk_size: usize,
    /// Base64 nonce; absent when the chunks carry plaintext
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<TransferId>,
    /// Originating user, filled in by the relay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
}

impl ChunkMetadata {
    pub fn new<S: Into<String>>(filename: S, total_size: u64) -> Self {
        Self {
            filename: filename.into(),
            total_size,
            total_chunks: 0,
            chunk_size: 0,
            iv: None,
            transfer_id: None,
            username: None,
            timestamp: None,
            is_private: false,
            recipient: None,
        }
    }
}

/// One fragment of a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    pub transfer_id: TransferId,
    pub chunk_index: u32,
    /// Base64 chunk bytes
    pub chunk_data: String,
    #[serde(default)]
    pub is_last_chunk: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ChunkMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
}

// ----------------------------------------------------------------------------
// Chunking
// ----------------------------------------------------------------------------

/// Split `payload` into chunks of at most `chunk_size` bytes.
///
/// Chunk 0 carries `metadata` with `total_chunks`, `chunk_size` and
/// `transfer_id` filled in. An empty payload still yields one (empty) chunk.
pub fn split_into_chunks(
    transfer_id: &TransferId,
    payload: &[u8],
    chunk_size: usize,
    mut metadata: ChunkMetadata,
    recipient: Option<&str>,
) -> Vec<FileChunk> {
    let chunk_size = chunk_size.max(1);
    let pieces: Vec<&[u8]> = if payload.is_empty() {
        vec![payload]
    } else {
        payload.chunks(chunk_size).collect()
    };
    let total = pieces.len() as u32;

    metadata.total_chunks = total;
    metadata.chunk_size = chunk_size;
    metadata.transfer_id = Some(transfer_id.clone());
    let mut metadata = Some(metadata);

    pieces
        .into_iter()
        .enumerate()
        .map(|(index, piece)| {
            let index = index as u32;
            FileChunk {
                transfer_id: transfer_id.clone(),
                chunk_index: index,
                chunk_data: encode_b64(piece),
                is_last_chunk: index + 1 == total,
                metadata: if index == 0 { metadata.take() } else { None },
                recipient: recipient.map(str::to_string),
            }
        })
        .collect()
}

/// Seal `data` under a single nonce and chunk the ciphertext
pub fn seal_into_chunks(
    key: &SessionKey,
    transfer_id: &TransferId,
    filename: &str,
    data: &[u8],
    chunk_size: usize,
    recipient: Option<&str>,
) -> Result<Vec<FileChunk>> {
    let sealed = key.seal(data)?;
    let mut metadata = ChunkMetadata::new(filename, data.len() as u64);
    metadata.iv = Some(sealed.iv_b64());
    metadata.is_private = recipient.is_some();
    metadata.recipient = recipient.map(str::to_string);
    Ok(split_into_chunks(
        transfer_id,
        &sealed.ciphertext,
        chunk_size,
        metadata,
        recipient,
    ))
}

// ----------------------------------------------------------------------------
// Reassembly
// ----------------------------------------------------------------------------

/// Progress after a chunk was stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    pub transfer_id: TransferId,
    pub received: usize,
    /// Zero while still unknown
    pub total_chunks: u32,
}

/// Every chunk of a transfer, removed from the assembler
#[derive(Debug)]
pub struct CompletedTransfer<C> {
    pub transfer_id: TransferId,
    pub context: C,
    pub metadata: Option<ChunkMetadata>,
    pub total_chunks: u32,
    chunks: BTreeMap<u32, Vec<u8>>,
}

/// Decrypted (or relayed plaintext) file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassembledFile {
    pub filename: String,
    pub data: Vec<u8>,
}

impl<C> CompletedTransfer<C> {
    /// Chunk bytes concatenated in index order
    pub fn concatenate(&self) -> core::result::Result<Vec<u8>, TransferError> {
        let mut joined = Vec::with_capacity(self.chunks.values().map(Vec::len).sum());
        for (expected, (index, bytes)) in self.chunks.iter().enumerate() {
            if *index != expected as u32 {
                return Err(TransferError::Reassembly {
                    transfer_id: self.transfer_id.clone(),
                    reason: format!("chunk {} missing", expected),
                });
            }
            joined.extend_from_slice(bytes);
        }
        Ok(joined)
    }

    /// Concatenate and, when the metadata names an IV, decrypt with `key`
    pub fn reassemble(
        &self,
        key: Option<&SessionKey>,
    ) -> core::result::Result<ReassembledFile, TransferError> {
        let metadata = self
            .metadata
            .as_ref()
            .ok_or_else(|| TransferError::MissingMetadata {
                transfer_id: self.transfer_id.clone(),
            })?;
        let joined = self.concatenate()?;

        let data = match metadata.iv.as_deref() {
            None => joined,
            Some(iv_b64) => {
                let key = key.ok_or_else(|| self.reassembly_error("session key not found"))?;
                let iv = decode_b64(iv_b64)
                    .map_err(|e| self.reassembly_error(format!("bad iv: {}", e)))?;
                key.open(&joined, &iv)
                    .map_err(|e| self.reassembly_error(e.to_string()))?
            }
        };

        let filename = if metadata.filename.trim().is_empty() {
            self.transfer_id.to_string()
        } else {
            metadata.filename.clone()
        };
        Ok(ReassembledFile { filename, data })
    }

    fn reassembly_error<S: Into<String>>(&self, reason: S) -> TransferError {
        TransferError::Reassembly {
            transfer_id: self.transfer_id.clone(),
            reason: reason.into(),
        }
    }
}

/// Result of feeding one chunk to the assembler
#[derive(Debug)]
pub enum IngestOutcome<C> {
    /// The transfer already finished or was aborted
    Ignored,
    Accepted {
        progress: TransferProgress,
        completed: Option<CompletedTransfer<C>>,
    },
}

#[derive(Debug)]
struct InboundTransfer<C> {
    context: C,
    total_chunks: u32,
    received_bytes: u64,
    chunks: BTreeMap<u32, Vec<u8>>,
    metadata: Option<ChunkMetadata>,
    last_activity: Instant,
}

/// Bounded set of recently finished transfer ids
#[derive(Debug, Default)]
struct FinishedTransfers {
    order: VecDeque<TransferId>,
    members: HashSet<TransferId>,
}

impl FinishedTransfers {
    fn insert(&mut self, id: TransferId) {
        if !self.members.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > FINISHED_MEMORY {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
    }

    fn contains(&self, id: &TransferId) -> bool {
        self.members.contains(id)
    }
}

/// Collects inbound chunks per transfer.
///
/// `C` is caller context recorded when a transfer is first seen (the relay
/// stores the uploading connection there). Not internally synchronized; the
/// owner wraps it in a lock and never holds that lock across I/O.
#[derive(Debug)]
pub struct ChunkAssembler<C> {
    active: HashMap<TransferId, InboundTransfer<C>>,
    finished: FinishedTransfers,
    max_file_bytes: Option<u64>,
}

impl<C> Default for ChunkAssembler<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> ChunkAssembler<C> {
    pub fn new() -> Self {
        Self {
            active: HashMap::new(),
            finished: FinishedTransfers::default(),
            max_file_bytes: None,
        }
    }

    /// Abort transfers that declare or accumulate more than `max` bytes
    pub fn with_size_limit(max: u64) -> Self {
        Self {
            max_file_bytes: Some(max),
            ..Self::new()
        }
    }

    /// Store one chunk, creating the transfer on first sight.
    ///
    /// A chunk whose data is not valid base64 is dropped with an error and
    /// does not abort the transfer. Exceeding the size limit aborts it.
    pub fn ingest<F>(
        &mut self,
        chunk: &FileChunk,
        context: F,
    ) -> core::result::Result<IngestOutcome<C>, TransferError>
    where
        F: FnOnce() -> C,
    {
        let transfer_id = &chunk.transfer_id;
        if self.finished.contains(transfer_id) {
            debug!(transfer_id = %transfer_id, index = chunk.chunk_index, "Ignoring late chunk");
            return Ok(IngestOutcome::Ignored);
        }

        let bytes = decode_b64(&chunk.chunk_data).map_err(|e| {
            warn!(transfer_id = %transfer_id, index = chunk.chunk_index, "Dropping malformed chunk: {}", e);
            TransferError::MalformedChunk {
                transfer_id: transfer_id.clone(),
                index: chunk.chunk_index,
                reason: e.to_string(),
            }
        })?;

        let limit = self.max_file_bytes;
        let transfer = self
            .active
            .entry(transfer_id.clone())
            .or_insert_with(|| InboundTransfer {
                context: context(),
                total_chunks: 0,
                received_bytes: 0,
                chunks: BTreeMap::new(),
                metadata: None,
                last_activity: Instant::now(),
            });
        transfer.last_activity = Instant::now();

        if chunk.chunk_index == 0 {
            if let Some(metadata) = &chunk.metadata {
                if let Some(max) = limit.filter(|max| metadata.total_size > *max) {
                    let size = metadata.total_size;
                    self.abort(transfer_id);
                    return Err(TransferError::TooLarge {
                        transfer_id: transfer_id.clone(),
                        size,
                        max,
                    });
                }
                if metadata.total_chunks > 0 {
                    transfer.total_chunks = metadata.total_chunks;
                }
                transfer.metadata = Some(metadata.clone());
            }
        }

        let added = bytes.len() as u64;
        if let Some(previous) = transfer.chunks.insert(chunk.chunk_index, bytes) {
            transfer.received_bytes -= previous.len() as u64;
        }
        transfer.received_bytes += added;

        if let Some(max) = limit.filter(|max| transfer.received_bytes > max + SEAL_OVERHEAD) {
            let size = transfer.received_bytes;
            self.abort(transfer_id);
            return Err(TransferError::TooLarge {
                transfer_id: transfer_id.clone(),
                size,
                max,
            });
        }

        if transfer.total_chunks == 0 && chunk.is_last_chunk {
            transfer.total_chunks = chunk.chunk_index + 1;
        }

        let progress = TransferProgress {
            transfer_id: transfer_id.clone(),
            received: transfer.chunks.len(),
            total_chunks: transfer.total_chunks,
        };

        let done = transfer.total_chunks > 0 && progress.received >= transfer.total_chunks as usize;
        let completed = if done {
            self.take_completed(transfer_id)
        } else {
            None
        };

        Ok(IngestOutcome::Accepted {
            progress,
            completed,
        })
    }

    fn take_completed(&mut self, transfer_id: &TransferId) -> Option<CompletedTransfer<C>> {
        let transfer = self.active.remove(transfer_id)?;
        self.finished.insert(transfer_id.clone());
        Some(CompletedTransfer {
            transfer_id: transfer_id.clone(),
            context: transfer.context,
            metadata: transfer.metadata,
            total_chunks: transfer.total_chunks,
            chunks: transfer.chunks,
        })
    }

    /// Drop a transfer; later chunks for it are ignored
    pub fn abort(&mut self, transfer_id: &TransferId) -> Option<C> {
        self.finished.insert(transfer_id.clone());
        self.active.remove(transfer_id).map(|t| t.context)
    }

    /// Abort every transfer whose context matches
    pub fn abort_where<P>(&mut self, mut predicate: P) -> Vec<TransferId>
    where
        P: FnMut(&C) -> bool,
    {
        let doomed: Vec<TransferId> = self
            .active
            .iter()
            .filter(|(_, transfer)| predicate(&transfer.context))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &doomed {
            self.abort(id);
        }
        doomed
    }

    /// Abort transfers that have seen no chunk for `idle` as of `now`
    pub fn reap_idle(&mut self, now: Instant, idle: Duration) -> Vec<(TransferId, C)> {
        let stale: Vec<TransferId> = self
            .active
            .iter()
            .filter(|(_, t)| now.saturating_duration_since(t.last_activity) > idle)
            .map(|(id, _)| id.clone())
            .collect();
        stale
            .into_iter()
            .filter_map(|id| self.abort(&id).map(|context| (id, context)))
            .collect()
    }

    /// Context recorded for an unfinished transfer
    pub fn context(&self, transfer_id: &TransferId) -> Option<&C> {
        self.active.get(transfer_id).map(|transfer| &transfer.context)
    }

    pub fn is_active(&self, transfer_id: &TransferId) -> bool {
        self.active.contains_key(transfer_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(value: &str) -> TransferId {
        TransferId::from_string(value.to_string())
    }

    fn feed(
        assembler: &mut ChunkAssembler<()>,
        chunks: &[FileChunk],
        order: &[usize],
    ) -> Option<CompletedTransfer<()>> {
        let mut completed = None;
        for &i in order {
            if let IngestOutcome::Accepted {
                completed: Some(done),
                ..
            } = assembler.ingest(&chunks[i], || ()).unwrap()
            {
                assert!(completed.is_none(), "completed twice");
                completed = Some(done);
            }
        }
        completed
    }

    #[test]
    fn test_150k_file_splits_into_three_chunks() {
        let data = vec![7u8; 150 * 1024];
        let chunks = split_into_chunks(
            &id("t"),
            &data,
            64 * 1024,
            ChunkMetadata::new("big.bin", data.len() as u64),
            None,
        );
        assert_eq!(chunks.len(), 3);
        let sizes: Vec<usize> = chunks
            .iter()
            .map(|c| decode_b64(&c.chunk_data).unwrap().len())
            .collect();
        assert_eq!(sizes, vec![65536, 65536, 22528]);
        assert!(chunks[2].is_last_chunk && !chunks[0].is_last_chunk);
        let metadata = chunks[0].metadata.as_ref().unwrap();
        assert_eq!(metadata.total_chunks, 3);
        assert!(chunks[1].metadata.is_none());
    }

    #[test]
    fn test_out_of_order_arrival_matches_in_order() {
        let key = SessionKey::generate();
        let data: Vec<u8> = (0..150 * 1024).map(|i| (i % 251) as u8).collect();
        let chunks =
            seal_into_chunks(&key, &id("perm"), "photo.png", &data, 64 * 1024, None).unwrap();
        assert_eq!(chunks.len(), 3);

        let mut in_order = ChunkAssembler::new();
        let a = feed(&mut in_order, &chunks, &[0, 1, 2]).unwrap();
        let mut shuffled = ChunkAssembler::new();
        let b = feed(&mut shuffled, &chunks, &[2, 0, 1]).unwrap();

        let a = a.reassemble(Some(&key)).unwrap();
        let b = b.reassemble(Some(&key)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.data, data);
        assert_eq!(a.filename, "photo.png");
    }

    #[test]
    fn test_late_chunks_are_ignored() {
        let data = vec![1u8; 10];
        let chunks = split_into_chunks(&id("late"), &data, 4, ChunkMetadata::new("f", 10), None);
        let mut assembler = ChunkAssembler::new();
        assert!(feed(&mut assembler, &chunks, &[0, 1, 2]).is_some());
        assert!(!assembler.is_active(&id("late")));

        let outcome = assembler.ingest(&chunks[1], || ()).unwrap();
        assert!(matches!(outcome, IngestOutcome::Ignored));
        assert_eq!(assembler.active_count(), 0);
    }

    #[test]
    fn test_missing_metadata_infers_total_from_last_flag() {
        let data = vec![9u8; 9];
        let mut chunks = split_into_chunks(&id("m"), &data, 4, ChunkMetadata::new("f", 9), None);
        chunks[0].metadata = None;

        let mut assembler = ChunkAssembler::new();
        let first = assembler.ingest(&chunks[2], || ()).unwrap();
        match first {
            IngestOutcome::Accepted { progress, completed } => {
                assert_eq!(progress.total_chunks, 3);
                assert_eq!(progress.received, 1);
                assert!(completed.is_none());
            }
            IngestOutcome::Ignored => panic!("first chunk ignored"),
        }
        let done = feed(&mut assembler, &chunks, &[0, 1]).unwrap();
        assert_eq!(done.concatenate().unwrap(), data);
        let err = done.reassemble(None).unwrap_err();
        assert!(matches!(err, TransferError::MissingMetadata { .. }));
    }

    #[test]
    fn test_malformed_chunk_does_not_abort_transfer() {
        let data = vec![3u8; 8];
        let mut chunks = split_into_chunks(&id("bad"), &data, 4, ChunkMetadata::new("f", 8), None);
        let good = chunks[1].chunk_data.clone();
        chunks[1].chunk_data = "%%%".to_string();

        let mut assembler = ChunkAssembler::new();
        assert!(feed(&mut assembler, &chunks, &[0]).is_none());
        let err = assembler.ingest(&chunks[1], || ()).unwrap_err();
        assert!(matches!(err, TransferError::MalformedChunk { index: 1, .. }));
        assert!(assembler.is_active(&id("bad")));

        chunks[1].chunk_data = good;
        assert!(feed(&mut assembler, &chunks, &[1]).is_some());
    }

    #[test]
    fn test_wrong_key_fails_reassembly() {
        let chunks =
            seal_into_chunks(&SessionKey::generate(), &id("k"), "f", b"hello", 4, None).unwrap();
        let mut assembler = ChunkAssembler::new();
        let done = feed(&mut assembler, &chunks, &[0, 1, 2, 3, 4, 5]).unwrap();
        let err = done.reassemble(Some(&SessionKey::generate())).unwrap_err();
        assert!(matches!(err, TransferError::Reassembly { .. }));
        let err = done.reassemble(None).unwrap_err();
        assert!(err.to_string().contains("session key not found"));
    }

    #[test]
    fn test_declared_oversize_aborts() {
        let mut metadata = ChunkMetadata::new("huge", 10_000);
        metadata.total_chunks = 3;
        let chunk = FileChunk {
            transfer_id: id("huge"),
            chunk_index: 0,
            chunk_data: encode_b64(b"abc"),
            is_last_chunk: false,
            metadata: Some(metadata),
            recipient: None,
        };
        let mut assembler = ChunkAssembler::with_size_limit(1_000);
        let err = assembler.ingest(&chunk, || ()).unwrap_err();
        assert!(matches!(err, TransferError::TooLarge { size: 10_000, .. }));
        assert!(matches!(
            assembler.ingest(&chunk, || ()).unwrap(),
            IngestOutcome::Ignored
        ));
    }

    #[test]
    fn test_accumulated_oversize_aborts() {
        let data = vec![0u8; 64];
        let chunks = split_into_chunks(&id("grow"), &data, 16, ChunkMetadata::new("f", 1), None);
        let mut assembler = ChunkAssembler::with_size_limit(20);
        assert!(assembler.ingest(&chunks[0], || ()).is_ok());
        assert!(assembler.ingest(&chunks[1], || ()).is_ok());
        assert!(matches!(
            assembler.ingest(&chunks[2], || ()),
            Err(TransferError::TooLarge { .. })
        ));
        assert!(!assembler.is_active(&id("grow")));
    }

    #[test]
    fn test_abort_where_and_reap_idle() {
        let data = vec![5u8; 8];
        let mut assembler: ChunkAssembler<&'static str> = ChunkAssembler::new();
        for (name, owner) in [("a", "alice"), ("b", "bob"), ("c", "alice")] {
            let chunks = split_into_chunks(&id(name), &data, 4, ChunkMetadata::new("f", 8), None);
            assembler.ingest(&chunks[0], || owner).unwrap();
        }
        let mut purged = assembler.abort_where(|owner| *owner == "alice");
        purged.sort_by(|x, y| x.as_str().cmp(y.as_str()));
        assert_eq!(purged, vec![id("a"), id("c")]);
        assert_eq!(assembler.active_count(), 1);

        assert!(assembler
            .reap_idle(Instant::now(), Duration::from_secs(60))
            .is_empty());
        let later = Instant::now() + Duration::from_secs(120);
        let reaped = assembler.reap_idle(later, Duration::from_secs(60));
        assert_eq!(reaped, vec![(id("b"), "bob")]);
        assert_eq!(assembler.active_count(), 0);
    }

    /// A payload, a chunk size and a random arrival order for its chunks
    fn payload_with_arrival_order() -> impl Strategy<Value = (Vec<u8>, usize, Vec<usize>)> {
        (proptest::collection::vec(any::<u8>(), 1..2048), 1usize..300).prop_flat_map(
            |(data, chunk_size)| {
                let count = data.len().div_ceil(chunk_size);
                let order = Just((0..count).collect::<Vec<usize>>()).prop_shuffle();
                (Just(data), Just(chunk_size), order)
            },
        )
    }

    proptest! {
        #[test]
        fn prop_any_arrival_order_reassembles(
            (data, chunk_size, order) in payload_with_arrival_order(),
        ) {
            let chunks = split_into_chunks(&id("p"), &data, chunk_size, ChunkMetadata::new("f", data.len() as u64), None);
            prop_assert_eq!(chunks.len(), order.len());

            let mut assembler = ChunkAssembler::new();
            let done = feed(&mut assembler, &chunks, &order).expect("transfer completes");
            let joined = done.concatenate().unwrap();
            prop_assert_eq!(joined.len(), data.len());
            prop_assert_eq!(joined, data);
        }
    }
}

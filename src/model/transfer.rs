//! Receiver-side reassembly of chunked files
//!
//! A transfer is `Notified` by `file-notify`, `Receiving` once chunks arrive,
//! and `Complete` when the received bytes reach the declared size and the
//! chunk ids cover `0..=max` without gaps. Duplicate ids are dropped and do
//! not count towards the size. Stalled transfers are kept until replaced.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::model::payload::{FileChunk, FileNotify};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Notified,
    Receiving,
    Complete,
}

/// What a single chunk did to its transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// The chunk id was already present; the chunk was dropped.
    Duplicate,
    /// Stored; the transfer is still incomplete.
    Progress(TransferState),
    /// Stored, and this chunk completed the transfer.
    Completed,
}

#[derive(Debug, Clone)]
pub struct IncomingFileTransfer {
    pub filename: String,
    pub sender: String,
    /// `None` while chunks arrive ahead of their `file-notify`
    declared_size: Option<u64>,
    received_bytes: u64,
    chunks: BTreeMap<u64, Vec<u8>>,
    started_at: DateTime<Utc>,
}

impl IncomingFileTransfer {
    pub fn new(filename: &str, sender: &str, declared_size: Option<u64>) -> Self {
        Self {
            filename: filename.to_string(),
            sender: sender.to_string(),
            declared_size,
            received_bytes: 0,
            chunks: BTreeMap::new(),
            started_at: Utc::now(),
        }
    }

    pub fn declared_size(&self) -> Option<u64> {
        self.declared_size
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    pub fn elapsed(&self) -> Duration {
        Utc::now() - self.started_at
    }

    /// Store a chunk. Returns `false` for a duplicate id.
    pub fn add_chunk(&mut self, chunk_id: u64, bytes: Vec<u8>) -> bool {
        if self.chunks.contains_key(&chunk_id) {
            return false;
        }
        self.received_bytes += bytes.len() as u64;
        self.chunks.insert(chunk_id, bytes);
        true
    }

    fn gap_free(&self) -> bool {
        self.chunks
            .keys()
            .enumerate()
            .all(|(index, id)| index as u64 == *id)
    }

    pub fn is_complete(&self) -> bool {
        self.declared_size
            .is_some_and(|size| self.received_bytes >= size && self.gap_free())
    }

    pub fn state(&self) -> TransferState {
        if self.is_complete() {
            TransferState::Complete
        } else if self.chunks.is_empty() {
            TransferState::Notified
        } else {
            TransferState::Receiving
        }
    }

    /// Fraction of the declared size received, capped at 1.
    pub fn progress(&self) -> Option<f64> {
        match self.declared_size? {
            0 => Some(1.0),
            size => Some((self.received_bytes as f64 / size as f64).min(1.0)),
        }
    }

    /// The file contents, chunks in ascending id order. `None` until complete.
    pub fn assemble(&self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        Some(self.chunks.values().flatten().copied().collect())
    }
}

/// Every transfer this peer is receiving, keyed by filename.
#[derive(Debug, Default)]
pub struct FileTransfers {
    transfers: HashMap<String, IncomingFileTransfer>,
}

impl FileTransfers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) a transfer.
    ///
    /// Chunks that arrived before the notify from the same sender are kept.
    pub fn on_notify(&mut self, notify: &FileNotify) -> &IncomingFileTransfer {
        let sender = notify.user.as_deref().unwrap_or("unknown");
        let mut transfer = IncomingFileTransfer::new(&notify.filename, sender, Some(notify.size));

        if let Some(early) = self.transfers.remove(&notify.filename) {
            if early.declared_size.is_none() && early.sender == sender {
                transfer.chunks = early.chunks;
                transfer.received_bytes = early.received_bytes;
                transfer.started_at = early.started_at;
            }
        }

        self.transfers
            .entry(notify.filename.clone())
            .or_insert(transfer)
    }

    pub fn on_chunk(&mut self, chunk: &FileChunk) -> Result<ChunkOutcome> {
        let bytes = chunk.bytes()?;
        let sender = chunk.user.as_deref().unwrap_or("unknown");

        let transfer = self
            .transfers
            .entry(chunk.filename.clone())
            .or_insert_with(|| IncomingFileTransfer::new(&chunk.filename, sender, None));

        let was_complete = transfer.is_complete();
        if !transfer.add_chunk(chunk.chunk_id, bytes) {
            return Ok(ChunkOutcome::Duplicate);
        }

        Ok(match transfer.state() {
            TransferState::Complete if !was_complete => ChunkOutcome::Completed,
            state => ChunkOutcome::Progress(state),
        })
    }

    pub fn get(&self, filename: &str) -> Option<&IncomingFileTransfer> {
        self.transfers.get(filename)
    }

    /// Contents of a finished transfer, or `None` while it is still going.
    pub fn assemble(&self, filename: &str) -> Option<Vec<u8>> {
        self.transfers.get(filename)?.assemble()
    }

    /// Remove and return a finished transfer.
    pub fn take_complete(&mut self, filename: &str) -> Option<IncomingFileTransfer> {
        if self.transfers.get(filename)?.is_complete() {
            self.transfers.remove(filename)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notify(filename: &str, size: u64) -> FileNotify {
        FileNotify {
            user: Some("A".to_string()),
            filename: filename.to_string(),
            size,
        }
    }

    fn chunk(filename: &str, id: u64, bytes: &[u8]) -> FileChunk {
        let mut chunk = FileChunk::new(filename, id, bytes);
        chunk.user = Some("A".to_string());
        chunk
    }

    #[test]
    fn out_of_order_chunks_are_concatenated_by_id() {
        let mut transfers = FileTransfers::new();
        transfers.on_notify(&notify("f.txt", 15));

        assert_eq!(
            transfers.on_chunk(&chunk("f.txt", 2, b"data2")).unwrap(),
            ChunkOutcome::Progress(TransferState::Receiving)
        );
        assert!(transfers.assemble("f.txt").is_none());
        transfers.on_chunk(&chunk("f.txt", 0, b"data0")).unwrap();
        assert_eq!(
            transfers.on_chunk(&chunk("f.txt", 1, b"data1")).unwrap(),
            ChunkOutcome::Completed
        );

        assert_eq!(
            transfers.assemble("f.txt").unwrap(),
            b"data0data1data2".to_vec()
        );
    }

    #[test]
    fn duplicates_do_not_mask_a_missing_chunk() {
        let mut transfers = FileTransfers::new();
        transfers.on_notify(&notify("f.bin", 8));

        transfers.on_chunk(&chunk("f.bin", 0, b"aaaa")).unwrap();
        assert_eq!(
            transfers.on_chunk(&chunk("f.bin", 0, b"aaaa")).unwrap(),
            ChunkOutcome::Duplicate
        );
        assert_eq!(transfers.get("f.bin").unwrap().received_bytes(), 4);
        assert!(transfers.assemble("f.bin").is_none());
    }

    #[test]
    fn size_reached_with_a_gap_is_not_complete() {
        let mut transfer = IncomingFileTransfer::new("g", "A", Some(6));
        transfer.add_chunk(0, b"abc".to_vec());
        transfer.add_chunk(2, b"def".to_vec());

        assert_eq!(transfer.received_bytes(), 6);
        assert_eq!(transfer.state(), TransferState::Receiving);
        assert!(transfer.assemble().is_none());
    }

    #[test]
    fn empty_file_is_complete_on_notify() {
        let mut transfers = FileTransfers::new();
        let transfer = transfers.on_notify(&notify("empty", 0));
        assert_eq!(transfer.state(), TransferState::Complete);
        assert_eq!(transfer.progress(), Some(1.0));
        assert_eq!(transfers.take_complete("empty").unwrap().assemble(), Some(vec![]));
        assert!(transfers.is_empty());
    }

    #[test]
    fn chunks_before_notify_wait_for_the_size() {
        let mut transfers = FileTransfers::new();
        transfers.on_chunk(&chunk("early", 0, b"xy")).unwrap();
        assert!(transfers.get("early").unwrap().declared_size().is_none());
        assert_eq!(transfers.get("early").unwrap().progress(), None);

        let transfer = transfers.on_notify(&notify("early", 2));
        assert_eq!(transfer.state(), TransferState::Complete);
        assert_eq!(transfers.assemble("early").unwrap(), b"xy".to_vec());
    }

    #[test]
    fn renotify_restarts_the_transfer() {
        let mut transfers = FileTransfers::new();
        transfers.on_notify(&notify("r", 4));
        transfers.on_chunk(&chunk("r", 0, b"ab")).unwrap();

        let transfer = transfers.on_notify(&notify("r", 4));
        assert_eq!(transfer.state(), TransferState::Notified);
        assert_eq!(transfer.received_bytes(), 0);
    }

    #[test]
    fn incomplete_transfers_are_not_taken() {
        let mut transfers = FileTransfers::new();
        transfers.on_notify(&notify("p", 10));
        transfers.on_chunk(&chunk("p", 0, b"12345")).unwrap();

        assert_eq!(transfers.get("p").unwrap().progress(), Some(0.5));
        assert!(transfers.take_complete("p").is_none());
        assert_eq!(transfers.len(), 1);
    }
}

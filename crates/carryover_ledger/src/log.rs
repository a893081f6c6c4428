//! Ledger log framing and replay.
//!
//! Every frame is laid out as:
//!
//! ```text
//! magic "CLOG" (4) | version u16 (2) | type u8 (1) | len u32 (4) | payload | crc32 (4)
//! ```
//!
//! A transaction is written as `Begin`, one `Put` per record after-image, and
//! `Commit`. Replay applies a transaction's puts only once its commit frame
//! has been read, so a torn tail never surfaces half a transaction.

use crate::backend::LedgerBackend;
use crate::error::{LedgerError, LedgerResult};
use crate::record::{MigrationRecord, RecordId};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Magic bytes opening every frame.
pub const LOG_MAGIC: [u8; 4] = *b"CLOG";

/// Current frame format version.
pub const LOG_VERSION: u16 = 1;

const HEADER_SIZE: usize = 11;
const CRC_SIZE: usize = 4;

/// Identifier of a ledger transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxnId(u64);

impl TxnId {
    /// Creates a transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum FrameType {
    Begin = 1,
    Put = 2,
    Commit = 3,
}

impl FrameType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Begin),
            2 => Some(Self::Put),
            3 => Some(Self::Commit),
            _ => None,
        }
    }
}

/// One entry of the ledger log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Opens a transaction.
    Begin {
        /// Transaction ID.
        txid: TxnId,
    },
    /// Full after-image of a record written by the transaction.
    Put {
        /// Transaction ID.
        txid: TxnId,
        /// The record as committed.
        record: MigrationRecord,
    },
    /// Makes the transaction's puts durable and visible.
    Commit {
        /// Transaction ID.
        txid: TxnId,
    },
}

impl Frame {
    fn frame_type(&self) -> FrameType {
        match self {
            Self::Begin { .. } => FrameType::Begin,
            Self::Put { .. } => FrameType::Put,
            Self::Commit { .. } => FrameType::Commit,
        }
    }

    fn txid(&self) -> TxnId {
        match self {
            Self::Begin { txid } | Self::Put { txid, .. } | Self::Commit { txid } => *txid,
        }
    }

    fn encode_payload(&self) -> LedgerResult<Vec<u8>> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.txid().as_u64().to_le_bytes());
        if let Self::Put { record, .. } = self {
            ciborium::into_writer(record, &mut buf)
                .map_err(|e| LedgerError::Codec(e.to_string()))?;
        }
        Ok(buf)
    }

    fn decode_payload(frame_type: FrameType, payload: &[u8]) -> LedgerResult<Self> {
        if payload.len() < 8 {
            return Err(LedgerError::corrupted("frame payload shorter than txid"));
        }
        let mut txid_bytes = [0u8; 8];
        txid_bytes.copy_from_slice(&payload[..8]);
        let txid = TxnId::new(u64::from_le_bytes(txid_bytes));

        match frame_type {
            FrameType::Begin => Ok(Self::Begin { txid }),
            FrameType::Commit => Ok(Self::Commit { txid }),
            FrameType::Put => {
                let record: MigrationRecord = ciborium::from_reader(&payload[8..])
                    .map_err(|e| LedgerError::Codec(e.to_string()))?;
                Ok(Self::Put { txid, record })
            }
        }
    }

    /// Encodes the frame with its envelope and checksum.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be encoded or is too large.
    pub fn encode(&self) -> LedgerResult<Vec<u8>> {
        let payload = self.encode_payload()?;
        let len = u32::try_from(payload.len())
            .map_err(|_| LedgerError::Codec("frame payload exceeds 4 GiB".into()))?;

        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.extend_from_slice(&LOG_MAGIC);
        data.extend_from_slice(&LOG_VERSION.to_le_bytes());
        data.push(self.frame_type() as u8);
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&payload);
        let crc = compute_crc32(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        Ok(data)
    }
}

/// Result of reading the frame at an offset.
enum ReadOutcome {
    Frame { frame: Frame, next: u64 },
    End,
    Torn(String),
}

fn read_frame(backend: &dyn LedgerBackend, offset: u64, size: u64) -> LedgerResult<ReadOutcome> {
    if offset == size {
        return Ok(ReadOutcome::End);
    }
    if offset + HEADER_SIZE as u64 > size {
        return Ok(ReadOutcome::Torn(format!("partial header at offset {offset}")));
    }

    let header = backend.read_at(offset, HEADER_SIZE)?;
    if header[0..4] != LOG_MAGIC {
        return Ok(ReadOutcome::Torn(format!("bad magic at offset {offset}")));
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != LOG_VERSION {
        return Err(LedgerError::corrupted(format!(
            "unsupported log version {version} at offset {offset}"
        )));
    }
    let Some(frame_type) = FrameType::from_byte(header[6]) else {
        return Ok(ReadOutcome::Torn(format!(
            "unknown frame type {} at offset {offset}",
            header[6]
        )));
    };
    let len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;

    let total = HEADER_SIZE + len + CRC_SIZE;
    if offset + total as u64 > size {
        return Ok(ReadOutcome::Torn(format!("partial frame at offset {offset}")));
    }

    let bytes = backend.read_at(offset, total)?;
    let (body, crc_bytes) = bytes.split_at(HEADER_SIZE + len);
    let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    let actual = compute_crc32(body);
    if stored != actual {
        return Ok(ReadOutcome::Torn(format!(
            "checksum mismatch at offset {offset}: expected {stored:08x}, got {actual:08x}"
        )));
    }

    let frame = match Frame::decode_payload(frame_type, &body[HEADER_SIZE..]) {
        Ok(frame) => frame,
        Err(e) => return Ok(ReadOutcome::Torn(format!("undecodable frame at offset {offset}: {e}"))),
    };
    Ok(ReadOutcome::Frame {
        frame,
        next: offset + total as u64,
    })
}

/// State rebuilt from the log.
#[derive(Debug, Default)]
pub(crate) struct Replay {
    /// Latest committed image of every record.
    pub records: BTreeMap<RecordId, MigrationRecord>,
    /// Highest transaction ID seen in any frame.
    pub max_txid: u64,
    /// Byte length covering every complete commit.
    pub valid_len: u64,
    /// Number of committed transactions replayed.
    pub commits: usize,
    /// Why replay stopped early, if it did.
    pub torn: Option<String>,
}

/// Replays the log from the start.
pub(crate) fn replay(backend: &dyn LedgerBackend) -> LedgerResult<Replay> {
    let size = backend.size()?;
    let mut out = Replay::default();
    let mut open: HashMap<TxnId, Vec<MigrationRecord>> = HashMap::new();
    let mut offset = 0u64;

    loop {
        match read_frame(backend, offset, size)? {
            ReadOutcome::End => break,
            ReadOutcome::Torn(reason) => {
                out.torn = Some(reason);
                break;
            }
            ReadOutcome::Frame { frame, next } => {
                out.max_txid = out.max_txid.max(frame.txid().as_u64());
                match frame {
                    Frame::Begin { txid } => {
                        open.insert(txid, Vec::new());
                    }
                    Frame::Put { txid, record } => {
                        open.entry(txid).or_default().push(record);
                    }
                    Frame::Commit { txid } => {
                        for record in open.remove(&txid).unwrap_or_default() {
                            out.records.insert(record.id, record);
                        }
                        out.commits += 1;
                        out.valid_len = next;
                    }
                }
                offset = next;
            }
        }
    }

    if out.torn.is_none() && !open.is_empty() {
        out.torn = Some(format!("{} transaction(s) without commit", open.len()));
    }
    Ok(out)
}

/// CRC32 (IEEE polynomial) used for frame checksums.
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut bit = 0;
            while bit < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
                bit += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        crc = (crc >> 8) ^ TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::record::{EntityKind, NewRecord, OwnerId, SystemId};
    use chrono::Utc;

    fn record(id: u64) -> MigrationRecord {
        let new = NewRecord::staged(
            OwnerId::new("acme"),
            EntityKind::Brand,
            SystemId::new("legacy"),
            format!("b-{id}"),
            None,
        );
        MigrationRecord::from_new(RecordId::new(id), new, Utc::now())
    }

    fn write_txn(backend: &mut MemoryBackend, txid: u64, ids: &[u64], commit: bool) {
        let txid = TxnId::new(txid);
        backend
            .append(&Frame::Begin { txid }.encode().unwrap())
            .unwrap();
        for id in ids {
            let frame = Frame::Put {
                txid,
                record: record(*id),
            };
            backend.append(&frame.encode().unwrap()).unwrap();
        }
        if commit {
            backend
                .append(&Frame::Commit { txid }.encode().unwrap())
                .unwrap();
        }
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn replay_applies_committed_transactions_only() {
        let mut backend = MemoryBackend::new();
        write_txn(&mut backend, 1, &[1, 2], true);
        let committed_len = backend.size().unwrap();
        write_txn(&mut backend, 2, &[3], false);

        let replay = replay(&backend).unwrap();
        assert_eq!(replay.records.len(), 2);
        assert_eq!(replay.commits, 1);
        assert_eq!(replay.valid_len, committed_len);
        assert_eq!(replay.max_txid, 2);
        assert!(replay.torn.is_some());
    }

    #[test]
    fn replay_stops_at_torn_frame() {
        let mut backend = MemoryBackend::new();
        write_txn(&mut backend, 1, &[1], true);
        let committed_len = backend.size().unwrap();
        write_txn(&mut backend, 2, &[2], true);
        backend.tear_tail(3);

        let replay = replay(&backend).unwrap();
        assert_eq!(replay.records.len(), 1);
        assert_eq!(replay.valid_len, committed_len);
        assert!(replay.torn.unwrap().contains("partial frame"));
    }

    #[test]
    fn replay_detects_flipped_byte() {
        let mut backend = MemoryBackend::new();
        write_txn(&mut backend, 1, &[1], true);
        let mut data = backend.data();
        let middle = data.len() / 2;
        data[middle] ^= 0xFF;

        let replay = replay(&MemoryBackend::with_data(data)).unwrap();
        assert!(replay.records.is_empty());
        assert_eq!(replay.valid_len, 0);
    }

    #[test]
    fn later_put_wins() {
        let mut backend = MemoryBackend::new();
        write_txn(&mut backend, 1, &[1], true);
        let txid = TxnId::new(2);
        let mut updated = record(1);
        updated.source_entity_name = Some("renamed".into());
        backend.append(&Frame::Begin { txid }.encode().unwrap()).unwrap();
        backend
            .append(&Frame::Put { txid, record: updated }.encode().unwrap())
            .unwrap();
        backend.append(&Frame::Commit { txid }.encode().unwrap()).unwrap();

        let replay = replay(&backend).unwrap();
        assert_eq!(
            replay.records[&RecordId::new(1)].source_entity_name.as_deref(),
            Some("renamed")
        );
    }
}

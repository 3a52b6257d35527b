//! Log record wire format (spec.md §6).
//!
//! Grounded on `examples/original_source/include/buf/buf_mgr.h`'s
//! `LogRecord` hierarchy (`LogRecordBeginTxn`/`CommitTxn`/`AbortTxn`/`EOL`/
//! `Update`/`Checkpoint`, each a `GetType()` tag plus a `Flush`/`Parse` pair
//! over a `WritableSlice`/`ReadableSlice`) and `src/buf/logging.cpp`'s
//! `Flush`/`Parse` bodies, which lay fields out in declaration order with no
//! padding. Unlike the original's single global `LogRecordType` enum (which
//! also carries an unused `COMPENSATION` tag and separate redo/undo
//! lengths), this follows the external wire table exactly: six tags (tag 6
//! left unassigned) and one shared `len` field for the `UPDATE` record's
//! redo and undo payloads.

use crate::common::{Lsn, PageId, TxnId};
use crate::error::{Result, SpitfireError};

const TAG_BEGIN: u16 = 1;
const TAG_COMMIT: u16 = 2;
const TAG_ABORT: u16 = 3;
const TAG_UPDATE: u16 = 4;
const TAG_EOL: u16 = 5;
const TAG_CHECKPOINT: u16 = 7;

/// One entry in the write-ahead log. Every variant round-trips exactly
/// through [`LogRecord::encode`]/[`LogRecord::decode`] (spec.md P7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    Begin { prev_lsn: Lsn, tid: TxnId },
    Commit { prev_lsn: Lsn, tid: TxnId },
    Abort { prev_lsn: Lsn, tid: TxnId },
    /// `redo` and `undo` are always the same length: spec.md's wire table
    /// gives the pair a single shared `len` field.
    Update {
        prev_lsn: Lsn,
        tid: TxnId,
        page_id: PageId,
        offset: u64,
        redo: Vec<u8>,
        undo: Vec<u8>,
    },
    Eol { prev_lsn: Lsn, tid: TxnId },
    Checkpoint { checkpoint_lsn: Lsn },
}

impl LogRecord {
    /// The transaction this record belongs to, where applicable. Used to
    /// chain a transaction's records by `prev_lsn` during undo/redo.
    pub fn tid(&self) -> Option<TxnId> {
        match self {
            LogRecord::Begin { tid, .. }
            | LogRecord::Commit { tid, .. }
            | LogRecord::Abort { tid, .. }
            | LogRecord::Update { tid, .. }
            | LogRecord::Eol { tid, .. } => Some(*tid),
            LogRecord::Checkpoint { .. } => None,
        }
    }

    pub fn prev_lsn(&self) -> Lsn {
        match self {
            LogRecord::Begin { prev_lsn, .. }
            | LogRecord::Commit { prev_lsn, .. }
            | LogRecord::Abort { prev_lsn, .. }
            | LogRecord::Update { prev_lsn, .. }
            | LogRecord::Eol { prev_lsn, .. } => *prev_lsn,
            LogRecord::Checkpoint { .. } => crate::common::INVALID_LSN,
        }
    }

    /// Exact encoded size in bytes, including the 2-byte type tag.
    pub fn encoded_len(&self) -> usize {
        match self {
            LogRecord::Begin { .. }
            | LogRecord::Commit { .. }
            | LogRecord::Abort { .. }
            | LogRecord::Eol { .. } => 2 + 8 + 8,
            LogRecord::Update { redo, undo, .. } => {
                debug_assert_eq!(redo.len(), undo.len());
                2 + 8 + 8 + 8 + 8 + 8 + redo.len() + undo.len()
            }
            LogRecord::Checkpoint { .. } => 2 + 8,
        }
    }

    /// Appends the little-endian wire encoding to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            LogRecord::Begin { prev_lsn, tid } => {
                buf.extend_from_slice(&TAG_BEGIN.to_le_bytes());
                buf.extend_from_slice(&prev_lsn.to_le_bytes());
                buf.extend_from_slice(&tid.to_le_bytes());
            }
            LogRecord::Commit { prev_lsn, tid } => {
                buf.extend_from_slice(&TAG_COMMIT.to_le_bytes());
                buf.extend_from_slice(&prev_lsn.to_le_bytes());
                buf.extend_from_slice(&tid.to_le_bytes());
            }
            LogRecord::Abort { prev_lsn, tid } => {
                buf.extend_from_slice(&TAG_ABORT.to_le_bytes());
                buf.extend_from_slice(&prev_lsn.to_le_bytes());
                buf.extend_from_slice(&tid.to_le_bytes());
            }
            LogRecord::Update {
                prev_lsn,
                tid,
                page_id,
                offset,
                redo,
                undo,
            } => {
                debug_assert_eq!(redo.len(), undo.len());
                buf.extend_from_slice(&TAG_UPDATE.to_le_bytes());
                buf.extend_from_slice(&prev_lsn.to_le_bytes());
                buf.extend_from_slice(&tid.to_le_bytes());
                buf.extend_from_slice(&page_id.to_le_bytes());
                buf.extend_from_slice(&offset.to_le_bytes());
                buf.extend_from_slice(&(redo.len() as u64).to_le_bytes());
                buf.extend_from_slice(redo);
                buf.extend_from_slice(undo);
            }
            LogRecord::Eol { prev_lsn, tid } => {
                buf.extend_from_slice(&TAG_EOL.to_le_bytes());
                buf.extend_from_slice(&prev_lsn.to_le_bytes());
                buf.extend_from_slice(&tid.to_le_bytes());
            }
            LogRecord::Checkpoint { checkpoint_lsn } => {
                buf.extend_from_slice(&TAG_CHECKPOINT.to_le_bytes());
                buf.extend_from_slice(&checkpoint_lsn.to_le_bytes());
            }
        }
    }

    /// Decodes one record starting at byte 0 of `bytes`, returning it
    /// alongside the number of bytes consumed. `bytes` may hold trailing
    /// data beyond this record (the caller's read buffer is not
    /// record-aligned in general).
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let mut cur = Cursor::new(bytes);
        let tag = cur.take_u16()?;
        let record = match tag {
            TAG_BEGIN => LogRecord::Begin {
                prev_lsn: cur.take_u64()?,
                tid: cur.take_u64()?,
            },
            TAG_COMMIT => LogRecord::Commit {
                prev_lsn: cur.take_u64()?,
                tid: cur.take_u64()?,
            },
            TAG_ABORT => LogRecord::Abort {
                prev_lsn: cur.take_u64()?,
                tid: cur.take_u64()?,
            },
            TAG_UPDATE => {
                let prev_lsn = cur.take_u64()?;
                let tid = cur.take_u64()?;
                let page_id = cur.take_u64()?;
                let offset = cur.take_u64()?;
                let len = cur.take_u64()? as usize;
                let redo = cur.take_bytes(len)?.to_vec();
                let undo = cur.take_bytes(len)?.to_vec();
                LogRecord::Update {
                    prev_lsn,
                    tid,
                    page_id,
                    offset,
                    redo,
                    undo,
                }
            }
            TAG_EOL => LogRecord::Eol {
                prev_lsn: cur.take_u64()?,
                tid: cur.take_u64()?,
            },
            TAG_CHECKPOINT => LogRecord::Checkpoint {
                checkpoint_lsn: cur.take_u64()?,
            },
            other => {
                return Err(SpitfireError::Corruption(format!(
                    "unknown log record tag {other}"
                )))
            }
        };
        Ok((record, cur.pos))
    }
}

/// A byte-at-a-time cursor over an undersized-aware read buffer. Mirrors
/// the original's `ReadableSlice::Read`, which fails rather than
/// short-reads past the buffer's end.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.bytes.len() {
            return Err(SpitfireError::NotEnoughSpace(
                "log record truncated".into(),
            ));
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_u16(&mut self) -> Result<u16> {
        let b = self.take_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn take_u64(&mut self) -> Result<u64> {
        let b = self.take_bytes(8)?;
        Ok(u64::from_le_bytes(b.try_into().unwrap()))
    }
}

//! Self-delimiting binary framing for entries.
//!
//! ## Wire layout
//! ```text
//! Shape tags:
//!   1: Standard → tag(u8) + id(i32) + type(u8) + timestamp(i64) + tid(i32)
//!                 + callid(i32) + matchid(i32) + extra(i64)          = 34 bytes
//!   2: Frames   → standard layout + depth(u8) + depth × frame(i64)  = 35 + 8·d bytes
//!   3: Bytes    → tag(u8) + id(i32) + type(u8) + arg1(i32)
//!                 + len(u16) + len bytes                             = 12 + len bytes
//! ```
//!
//! All multi-byte fields are little-endian, densely packed, no padding.
//! The total length of an entry is always derivable from its first bytes
//! (the fixed header plus any length prefix), which is what lets the
//! consumer reassemble an entry from its start packet before the
//! continuations arrive: every fixed header fits inside one packet
//! payload.
//!
//! Unpacking validates declared lengths against the remaining input and
//! against the model bounds; anything inconsistent is rejected as
//! corrupt rather than silently truncated.

use crate::entry::{
    BytesEntry, Entry, EntryType, FramesEntry, StandardEntry, MAX_BYTES_LEN, MAX_FRAME_DEPTH,
};
use smallvec::SmallVec;
use thiserror::Error;

const TAG_STANDARD: u8 = 1;
const TAG_FRAMES: u8 = 2;
const TAG_BYTES: u8 = 3;

/// Serialized size of a standard entry.
const STANDARD_SIZE: usize = 34;
/// Standard layout plus the depth prefix.
const FRAMES_HEADER_SIZE: usize = STANDARD_SIZE + 1;
/// Tag, id, type, arg1 and the two-byte length prefix.
const BYTES_HEADER_SIZE: usize = 12;

/// Largest possible serialized entry (a frames entry at full depth).
pub const MAX_WIRE_SIZE: usize = FRAMES_HEADER_SIZE + 8 * MAX_FRAME_DEPTH;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unknown entry tag {0:#04x}")]
    UnknownTag(u8),
    #[error("entry truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("declared byte run of {0} bytes exceeds the {MAX_BYTES_LEN} limit")]
    OversizedBytes(usize),
}

/// Exact serialized length of `entry`.
pub fn wire_size(entry: &Entry) -> usize {
    match entry {
        Entry::Standard(_) => STANDARD_SIZE,
        Entry::Frames(e) => FRAMES_HEADER_SIZE + 8 * e.frames.len().min(MAX_FRAME_DEPTH),
        Entry::Bytes(e) => BYTES_HEADER_SIZE + e.bytes.len().min(MAX_BYTES_LEN),
    }
}

/// Serialize `entry` into `out`, returning the number of bytes written.
///
/// `out` must hold at least [`wire_size`] bytes; sizing the buffer from
/// `wire_size` makes overflow impossible by construction.
pub fn pack(entry: &Entry, out: &mut [u8]) -> usize {
    let mut w = Writer { out, at: 0 };
    match entry {
        Entry::Standard(e) => {
            w.u8(TAG_STANDARD);
            pack_standard_fields(&mut w, e.id, e.entry_type, e.timestamp, e.tid, e.callid, e.matchid, e.extra);
        }
        Entry::Frames(e) => {
            w.u8(TAG_FRAMES);
            pack_standard_fields(&mut w, e.id, e.entry_type, e.timestamp, e.tid, e.callid, e.matchid, e.extra);
            let depth = e.frames.len().min(MAX_FRAME_DEPTH);
            w.u8(depth as u8);
            for frame in &e.frames[..depth] {
                w.i64(*frame);
            }
        }
        Entry::Bytes(e) => {
            w.u8(TAG_BYTES);
            w.i32(e.id);
            w.u8(e.entry_type.to_u8());
            w.i32(e.arg1);
            let len = e.bytes.len().min(MAX_BYTES_LEN);
            w.u16(len as u16);
            w.bytes(&e.bytes[..len]);
        }
    }
    w.at
}

#[allow(clippy::too_many_arguments)]
fn pack_standard_fields(
    w: &mut Writer<'_>,
    id: i32,
    entry_type: EntryType,
    timestamp: i64,
    tid: i32,
    callid: i32,
    matchid: i32,
    extra: i64,
) {
    w.i32(id);
    w.u8(entry_type.to_u8());
    w.i64(timestamp);
    w.i32(tid);
    w.i32(callid);
    w.i32(matchid);
    w.i64(extra);
}

/// Total serialized length of the entry whose serialized form starts
/// with `prefix`.
///
/// For variable-length shapes this needs the length prefix, so `prefix`
/// must cover the fixed header of the tagged shape; a start packet's
/// payload always does.
pub fn expected_size(prefix: &[u8]) -> Result<usize, CodecError> {
    let Some(&tag) = prefix.first() else {
        return Err(CodecError::Truncated { need: 1, have: 0 });
    };
    match tag {
        TAG_STANDARD => Ok(STANDARD_SIZE),
        TAG_FRAMES => {
            if prefix.len() < FRAMES_HEADER_SIZE {
                return Err(CodecError::Truncated {
                    need: FRAMES_HEADER_SIZE,
                    have: prefix.len(),
                });
            }
            let depth = prefix[FRAMES_HEADER_SIZE - 1] as usize;
            Ok(FRAMES_HEADER_SIZE + 8 * depth)
        }
        TAG_BYTES => {
            if prefix.len() < BYTES_HEADER_SIZE {
                return Err(CodecError::Truncated {
                    need: BYTES_HEADER_SIZE,
                    have: prefix.len(),
                });
            }
            let len = u16::from_le_bytes([prefix[10], prefix[11]]) as usize;
            if len > MAX_BYTES_LEN {
                return Err(CodecError::OversizedBytes(len));
            }
            Ok(BYTES_HEADER_SIZE + len)
        }
        other => Err(CodecError::UnknownTag(other)),
    }
}

/// Deserialize one entry from `buf`. The inverse of [`pack`].
pub fn unpack(buf: &[u8]) -> Result<Entry, CodecError> {
    let mut r = Reader { buf, at: 0 };
    match r.u8()? {
        TAG_STANDARD => {
            let (id, entry_type, timestamp, tid, callid, matchid, extra) = unpack_standard_fields(&mut r)?;
            Ok(Entry::Standard(StandardEntry {
                id,
                entry_type,
                timestamp,
                tid,
                callid,
                matchid,
                extra,
            }))
        }
        TAG_FRAMES => {
            let (id, entry_type, timestamp, tid, callid, matchid, extra) = unpack_standard_fields(&mut r)?;
            let depth = r.u8()? as usize;
            let mut frames = SmallVec::with_capacity(depth);
            for _ in 0..depth {
                frames.push(r.i64()?);
            }
            Ok(Entry::Frames(FramesEntry {
                id,
                entry_type,
                timestamp,
                tid,
                callid,
                matchid,
                extra,
                frames,
            }))
        }
        TAG_BYTES => {
            let id = r.i32()?;
            let entry_type = EntryType::from_u8(r.u8()?);
            let arg1 = r.i32()?;
            let len = r.u16()? as usize;
            if len > MAX_BYTES_LEN {
                return Err(CodecError::OversizedBytes(len));
            }
            let bytes = r.bytes(len)?.to_vec();
            Ok(Entry::Bytes(BytesEntry {
                id,
                entry_type,
                arg1,
                bytes,
            }))
        }
        other => Err(CodecError::UnknownTag(other)),
    }
}

type FieldTuple = (i32, EntryType, i64, i32, i32, i32, i64);

fn unpack_standard_fields(r: &mut Reader<'_>) -> Result<FieldTuple, CodecError> {
    let id = r.i32()?;
    let entry_type = EntryType::from_u8(r.u8()?);
    let timestamp = r.i64()?;
    let tid = r.i32()?;
    let callid = r.i32()?;
    let matchid = r.i32()?;
    let extra = r.i64()?;
    Ok((id, entry_type, timestamp, tid, callid, matchid, extra))
}

struct Writer<'a> {
    out: &'a mut [u8],
    at: usize,
}

impl Writer<'_> {
    fn bytes(&mut self, bytes: &[u8]) {
        self.out[self.at..self.at + bytes.len()].copy_from_slice(bytes);
        self.at += bytes.len();
    }

    fn u8(&mut self, v: u8) {
        self.bytes(&[v]);
    }

    fn u16(&mut self, v: u16) {
        self.bytes(&v.to_le_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.bytes(&v.to_le_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.bytes(&v.to_le_bytes());
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() - self.at < n {
            return Err(CodecError::Truncated {
                need: self.at + n,
                have: self.buf.len(),
            });
        }
        let out = &self.buf[self.at..self.at + n];
        self.at += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn i32(&mut self) -> Result<i32, CodecError> {
        let b = self.bytes(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64, CodecError> {
        let b = self.bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(i64::from_le_bytes(raw))
    }
}

//! The entry model: the typed records producers log and the consumer
//! reassembles.
//!
//! An [`Entry`] is one of three shapes: a fixed-size [`StandardEntry`], a
//! [`FramesEntry`] carrying a bounded run of stack frame addresses, or a
//! [`BytesEntry`] carrying an opaque byte run. The `Serialize` impls are
//! for the convenience of dumping entries as JSON in tools and tests;
//! they do NOT reflect the wire format (see [`crate::codec`] for that).

use serde::Serialize;
use smallvec::SmallVec;
use std::fmt;

/// Maximum number of frame addresses a [`FramesEntry`] can carry.
pub const MAX_FRAME_DEPTH: usize = 255;

/// Maximum byte-run length of a [`BytesEntry`].
pub const MAX_BYTES_LEN: usize = 1024;

/// First type code reserved for user-defined entry types.
pub const USER_TYPE_START: u8 = 128;

/// Tag identifying what an entry means.
///
/// Codes `0..=7` are predefined; `128..=255` are reserved for
/// user-defined types and round-trip through [`EntryType::Custom`].
/// Unrecognized codes below the user range decode as `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EntryType {
    Unknown,
    TraceStart,
    TraceEnd,
    TraceAbort,
    TraceTimeout,
    TraceBackwards,
    TraceAnnotation,
    StackFrame,
    Custom(u8),
}

impl EntryType {
    pub const fn to_u8(self) -> u8 {
        match self {
            EntryType::Unknown => 0,
            EntryType::TraceStart => 1,
            EntryType::TraceEnd => 2,
            EntryType::TraceAbort => 3,
            EntryType::TraceTimeout => 4,
            EntryType::TraceBackwards => 5,
            EntryType::TraceAnnotation => 6,
            EntryType::StackFrame => 7,
            EntryType::Custom(code) => code,
        }
    }

    pub const fn from_u8(code: u8) -> Self {
        match code {
            1 => EntryType::TraceStart,
            2 => EntryType::TraceEnd,
            3 => EntryType::TraceAbort,
            4 => EntryType::TraceTimeout,
            5 => EntryType::TraceBackwards,
            6 => EntryType::TraceAnnotation,
            7 => EntryType::StackFrame,
            code if code >= USER_TYPE_START => EntryType::Custom(code),
            _ => EntryType::Unknown,
        }
    }

    /// True for the entry types that drive the trace lifecycle state
    /// machine rather than carrying payload data.
    pub const fn is_control(self) -> bool {
        matches!(
            self,
            EntryType::TraceStart
                | EntryType::TraceEnd
                | EntryType::TraceAbort
                | EntryType::TraceTimeout
                | EntryType::TraceBackwards
        )
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryType::Unknown => f.write_str("UNKNOWN"),
            EntryType::TraceStart => f.write_str("TRACE_START"),
            EntryType::TraceEnd => f.write_str("TRACE_END"),
            EntryType::TraceAbort => f.write_str("TRACE_ABORT"),
            EntryType::TraceTimeout => f.write_str("TRACE_TIMEOUT"),
            EntryType::TraceBackwards => f.write_str("TRACE_BACKWARDS"),
            EntryType::TraceAnnotation => f.write_str("TRACE_ANNOTATION"),
            EntryType::StackFrame => f.write_str("STACK_FRAME"),
            EntryType::Custom(code) => write!(f, "{code}"),
        }
    }
}

/// Fixed-size entry: the common header every producer-visible record has.
///
/// For lifecycle entries (`TraceStart`, `TraceEnd`, …) `extra` carries the
/// trace id and `matchid` carries the start flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StandardEntry {
    pub id: i32,
    pub entry_type: EntryType,
    pub timestamp: i64,
    pub tid: i32,
    pub callid: i32,
    pub matchid: i32,
    pub extra: i64,
}

/// A standard entry plus a bounded run of stack frame addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FramesEntry {
    pub id: i32,
    pub entry_type: EntryType,
    pub timestamp: i64,
    pub tid: i32,
    pub callid: i32,
    pub matchid: i32,
    pub extra: i64,
    /// Frame addresses, at most [`MAX_FRAME_DEPTH`] of them.
    pub frames: SmallVec<[i64; 16]>,
}

/// An opaque byte run with a minimal `{id, type}` header and one
/// caller-defined argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BytesEntry {
    pub id: i32,
    pub entry_type: EntryType,
    pub arg1: i32,
    /// At most [`MAX_BYTES_LEN`] bytes.
    pub bytes: Vec<u8>,
}

/// A single logical record, possibly spanning multiple ring packets on
/// the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Entry {
    Standard(StandardEntry),
    Frames(FramesEntry),
    Bytes(BytesEntry),
}

impl Entry {
    pub fn id(&self) -> i32 {
        match self {
            Entry::Standard(e) => e.id,
            Entry::Frames(e) => e.id,
            Entry::Bytes(e) => e.id,
        }
    }

    pub fn entry_type(&self) -> EntryType {
        match self {
            Entry::Standard(e) => e.entry_type,
            Entry::Frames(e) => e.entry_type,
            Entry::Bytes(e) => e.entry_type,
        }
    }

    /// The timestamp, if this shape carries one. Bytes entries are
    /// metadata records without timestamps.
    pub fn timestamp(&self) -> Option<i64> {
        match self {
            Entry::Standard(e) => Some(e.timestamp),
            Entry::Frames(e) => Some(e.timestamp),
            Entry::Bytes(_) => None,
        }
    }

    pub fn timestamp_mut(&mut self) -> Option<&mut i64> {
        match self {
            Entry::Standard(e) => Some(&mut e.timestamp),
            Entry::Frames(e) => Some(&mut e.timestamp),
            Entry::Bytes(_) => None,
        }
    }

    pub(crate) fn set_id(&mut self, id: i32) {
        match self {
            Entry::Standard(e) => e.id = id,
            Entry::Frames(e) => e.id = id,
            Entry::Bytes(e) => e.id = id,
        }
    }
}

impl From<StandardEntry> for Entry {
    fn from(entry: StandardEntry) -> Self {
        Entry::Standard(entry)
    }
}

impl From<FramesEntry> for Entry {
    fn from(entry: FramesEntry) -> Self {
        Entry::Frames(entry)
    }
}

impl From<BytesEntry> for Entry {
    fn from(entry: BytesEntry) -> Self {
        Entry::Bytes(entry)
    }
}

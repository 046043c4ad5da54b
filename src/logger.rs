//! The producer path: id assignment, entry packing, and packet
//! publication.
//!
//! Everything here is callable from many threads at once and never
//! blocks on the consumer. The only failure mode visible to callers is
//! the [`TRACING_DISABLED`] sentinel returned while logging is off.

use crate::codec::{self, MAX_WIRE_SIZE};
use crate::entry::{
    BytesEntry, Entry, EntryType, FramesEntry, StandardEntry, MAX_BYTES_LEN, MAX_FRAME_DEPTH,
};
use crate::ring::{Cursor, Packet, PacketRing, PACKET_PAYLOAD};
use smallvec::SmallVec;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

/// Entry id meaning "tracing is disabled"; never assigned to an entry.
pub const TRACING_DISABLED: i32 = -1;
/// Entry id meaning "no match"; never assigned to an entry.
pub const NO_MATCH: i32 = 0;

/// Monotonic, wrap-safe entry id source.
///
/// Ids are handed out by a single `fetch_add`; the reserved sentinels
/// [`TRACING_DISABLED`] and [`NO_MATCH`] are skipped by re-fetching.
/// 32-bit wrap-around is permitted and callers must tolerate it.
pub struct IdAllocator {
    next: AtomicI32,
}

impl IdAllocator {
    pub fn new(start: i32) -> Self {
        IdAllocator {
            next: AtomicI32::new(start),
        }
    }

    /// Fetch the next id, advancing by `step`. `step` must be positive.
    pub fn next(&self, step: u16) -> i32 {
        debug_assert!(step > 0, "id step must be positive");
        loop {
            let id = self.next.fetch_add(step as i32, Ordering::Relaxed);
            if id != TRACING_DISABLED && id != NO_MATCH {
                return id;
            }
        }
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        IdAllocator::new(1)
    }
}

/// Fragments serialized entries into packets and publishes them against
/// the ring.
pub struct PacketLogger {
    ring: Arc<PacketRing>,
}

impl PacketLogger {
    pub fn new(ring: Arc<PacketRing>) -> Self {
        PacketLogger { ring }
    }

    pub fn ring(&self) -> &Arc<PacketRing> {
        &self.ring
    }

    /// Publish `payload` as one entry stream, returning the cursor of
    /// the last packet written.
    ///
    /// All of the stream's slots are claimed in a single `fetch_add`, so
    /// no packet from another entry can land inside the run. Slots are
    /// published in ascending order; release ordering on each
    /// publication means the consumer never observes a continuation
    /// before the packets preceding it in the stream.
    pub fn write(&self, payload: &[u8]) -> Cursor {
        let count = payload.len().div_ceil(PACKET_PAYLOAD).max(1);
        debug_assert!(
            count <= self.ring.capacity(),
            "entry of {} bytes needs {count} packets but the ring holds {}",
            payload.len(),
            self.ring.capacity()
        );
        let base = self.ring.claim(count as u64);

        let mut packet = Packet::empty();
        packet.stream_id = base;
        if payload.is_empty() {
            packet.is_start = true;
            self.ring.publish(base, &packet);
            return Cursor::new(base);
        }

        for (index, chunk) in payload.chunks(PACKET_PAYLOAD).enumerate() {
            packet.index = index as u16;
            packet.is_start = index == 0;
            packet.is_continuation = index != 0;
            packet.payload_len = chunk.len() as u16;
            packet.payload[..chunk.len()].copy_from_slice(chunk);
            self.ring.publish(base + index as u64, &packet);
        }
        Cursor::new(base + count as u64 - 1)
    }
}

// Per-thread scratch for packing entries: one maximum-size entry, reused
// across writes so the hot path never allocates.
thread_local! {
    static SCRATCH: RefCell<[u8; MAX_WIRE_SIZE]> = const { RefCell::new([0; MAX_WIRE_SIZE]) };
}

/// Producer façade: assigns ids, packs entries, and publishes them.
///
/// Cloneable across threads via `Arc`; every method is safe to call
/// concurrently.
pub struct Logger {
    ids: IdAllocator,
    packets: PacketLogger,
    enabled: AtomicBool,
    id_step: u16,
}

impl Logger {
    pub fn new(ring: Arc<PacketRing>) -> Self {
        Logger::with_id_step(ring, 1)
    }

    /// A logger whose allocator advances by `step` per entry. Useful
    /// when several cooperating processes partition the id space.
    pub fn with_id_step(ring: Arc<PacketRing>, step: u16) -> Self {
        assert!(step > 0, "id step must be positive");
        Logger {
            ids: IdAllocator::new(1),
            packets: PacketLogger::new(ring),
            enabled: AtomicBool::new(true),
            id_step: step,
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Publish `entry`, returning its assigned id, or
    /// [`TRACING_DISABLED`] without publishing anything while logging
    /// is off.
    pub fn write(&self, entry: impl Into<Entry>) -> i32 {
        match self.write_entry(entry.into()) {
            Some((id, _)) => id,
            None => TRACING_DISABLED,
        }
    }

    /// As [`Logger::write`], also exposing the publication cursor so the
    /// caller can correlate the entry with a ring checkpoint. `None`
    /// while logging is off.
    pub fn write_and_get_cursor(&self, entry: impl Into<Entry>) -> Option<(i32, Cursor)> {
        self.write_entry(entry.into())
    }

    /// Publish an opaque byte run of up to [`MAX_BYTES_LEN`] bytes;
    /// longer input is truncated.
    pub fn write_bytes(&self, entry_type: EntryType, arg1: i32, bytes: &[u8]) -> i32 {
        let len = bytes.len().min(MAX_BYTES_LEN);
        self.write(BytesEntry {
            id: NO_MATCH,
            entry_type,
            arg1,
            bytes: bytes[..len].to_vec(),
        })
    }

    /// Publish a stack trace for `tid` captured at `timestamp`. Depth is
    /// clamped to [`MAX_FRAME_DEPTH`]; depth 0 is valid.
    pub fn write_stack_frames(
        &self,
        tid: i32,
        timestamp: i64,
        frames: &[i64],
        entry_type: EntryType,
    ) -> i32 {
        let depth = frames.len().min(MAX_FRAME_DEPTH);
        self.write(FramesEntry {
            id: NO_MATCH,
            entry_type,
            timestamp,
            tid,
            callid: 0,
            matchid: 0,
            extra: 0,
            frames: SmallVec::from_slice(&frames[..depth]),
        })
    }

    /// Publish a key/value annotation attributed to the calling thread.
    pub fn write_trace_annotation(&self, key: i32, value: i64) -> i32 {
        self.write(StandardEntry {
            id: NO_MATCH,
            entry_type: EntryType::TraceAnnotation,
            timestamp: monotonic_nanos(),
            tid: current_tid(),
            callid: key,
            matchid: 0,
            extra: value,
        })
    }

    fn write_entry(&self, mut entry: Entry) -> Option<(i32, Cursor)> {
        if !self.enabled.load(Ordering::Relaxed) {
            return None;
        }
        let id = self.ids.next(self.id_step);
        entry.set_id(id);

        let size = codec::wire_size(&entry);
        let cursor = SCRATCH.with(|scratch| {
            let mut buf = scratch.borrow_mut();
            let written = codec::pack(&entry, &mut buf[..size]);
            debug_assert_eq!(written, size);
            self.packets.write(&buf[..size])
        });
        Some((id, cursor))
    }
}

/// Get the OS thread id of the calling thread via `gettid()`.
pub fn current_tid() -> i32 {
    // SAFETY: SYS_gettid takes no arguments and always succeeds.
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

/// Read `CLOCK_MONOTONIC` in nanoseconds.
pub fn monotonic_nanos() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid timespec on the stack; CLOCK_MONOTONIC is
    // always available on Linux and the call cannot fail with it.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::EntryReader;

    fn small_ring() -> Arc<PacketRing> {
        Arc::new(PacketRing::with_capacity(256))
    }

    #[test]
    fn test_ids_skip_sentinels_from_negative_start() {
        let ids = IdAllocator::new(-2);
        assert_eq!(ids.next(1), -2);
        // -1 and 0 are both sentinels and get skipped in one call.
        assert_eq!(ids.next(1), 1);
        assert_eq!(ids.next(1), 2);
    }

    #[test]
    fn test_ids_monotonic_with_step() {
        let ids = IdAllocator::new(1);
        let a = ids.next(3);
        let b = ids.next(3);
        let c = ids.next(3);
        assert!(a < b && b < c);
        assert_eq!(b - a, 3);
        for id in [a, b, c] {
            assert_ne!(id, TRACING_DISABLED);
            assert_ne!(id, NO_MATCH);
        }
    }

    #[test]
    fn test_write_returns_valid_increasing_ids() {
        let logger = Logger::new(small_ring());
        let mut last = NO_MATCH;
        for _ in 0..10 {
            let id = logger.write(StandardEntry {
                id: NO_MATCH,
                entry_type: EntryType::StackFrame,
                timestamp: 0,
                tid: 0,
                callid: 0,
                matchid: 0,
                extra: 0,
            });
            assert_ne!(id, TRACING_DISABLED);
            assert_ne!(id, NO_MATCH);
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn test_disabled_logger_publishes_nothing() {
        let ring = small_ring();
        let logger = Logger::new(ring.clone());
        logger.disable();
        let id = logger.write_trace_annotation(1, 2);
        assert_eq!(id, TRACING_DISABLED);
        assert!(logger.write_and_get_cursor(annotation()).is_none());
        assert_eq!(ring.head(), 0);

        logger.enable();
        assert_ne!(logger.write_trace_annotation(1, 2), TRACING_DISABLED);
        assert!(ring.head() > 0);
    }

    fn annotation() -> StandardEntry {
        StandardEntry {
            id: NO_MATCH,
            entry_type: EntryType::TraceAnnotation,
            timestamp: 5,
            tid: 1,
            callid: 2,
            matchid: 0,
            extra: 3,
        }
    }

    #[test]
    fn test_write_and_get_cursor_tracks_last_packet() {
        let ring = small_ring();
        let logger = Logger::new(ring.clone());
        // A standard entry is 34 bytes: exactly one packet.
        let (_, one) = logger.write_and_get_cursor(annotation()).unwrap();
        assert_eq!(one.as_u64(), 0);

        // 84 payload bytes serialize to 96: exactly two packets.
        let bytes: Vec<u8> = (0..84u8).collect();
        let id = logger.write_bytes(EntryType::TraceAnnotation, 0, &bytes);
        assert_ne!(id, TRACING_DISABLED);
        assert_eq!(ring.head(), 3);
    }

    #[test]
    fn test_roundtrip_through_reader() {
        let ring = small_ring();
        let logger = Logger::new(ring.clone());
        let mut reader = EntryReader::new(ring);

        let id = logger.write_stack_frames(7, 1000, &[0xA, 0xB], EntryType::StackFrame);
        let entry = reader.try_next().expect("entry should be available");
        match entry {
            Entry::Frames(f) => {
                assert_eq!(f.id, id);
                assert_eq!(f.tid, 7);
                assert_eq!(f.timestamp, 1000);
                assert_eq!(&f.frames[..], &[0xA, 0xB]);
            }
            other => panic!("expected Frames, got {other:?}"),
        }
        assert!(reader.try_next().is_none());
    }

    #[test]
    fn test_stack_frames_depth_boundaries() {
        let ring = Arc::new(PacketRing::with_capacity(256));
        let logger = Logger::new(ring.clone());
        let mut reader = EntryReader::new(ring);

        logger.write_stack_frames(1, 0, &[], EntryType::StackFrame);
        let frames: Vec<i64> = (0..300).collect();
        logger.write_stack_frames(1, 0, &frames, EntryType::StackFrame);

        match reader.try_next().unwrap() {
            Entry::Frames(f) => assert!(f.frames.is_empty()),
            other => panic!("expected Frames, got {other:?}"),
        }
        match reader.try_next().unwrap() {
            Entry::Frames(f) => assert_eq!(f.frames.len(), MAX_FRAME_DEPTH),
            other => panic!("expected Frames, got {other:?}"),
        }
    }

    #[test]
    fn test_max_bytes_payload_reassembles() {
        let ring = small_ring();
        let logger = Logger::new(ring.clone());
        let mut reader = EntryReader::new(ring);

        let payload: Vec<u8> = (0..MAX_BYTES_LEN).map(|i| i as u8).collect();
        let id = logger.write_bytes(EntryType::Custom(200), 9, &payload);

        match reader.try_next().unwrap() {
            Entry::Bytes(b) => {
                assert_eq!(b.id, id);
                assert_eq!(b.arg1, 9);
                assert_eq!(b.bytes, payload);
            }
            other => panic!("expected Bytes, got {other:?}"),
        }
    }

    #[test]
    fn test_oversized_bytes_truncated() {
        let ring = small_ring();
        let logger = Logger::new(ring.clone());
        let mut reader = EntryReader::new(ring);

        let payload = vec![0x5A; MAX_BYTES_LEN + 500];
        logger.write_bytes(EntryType::TraceAnnotation, 0, &payload);
        match reader.try_next().unwrap() {
            Entry::Bytes(b) => assert_eq!(b.bytes.len(), MAX_BYTES_LEN),
            other => panic!("expected Bytes, got {other:?}"),
        }
    }

    #[test]
    fn test_tid_and_clock_helpers() {
        assert!(current_tid() > 0);
        let a = monotonic_nanos();
        let b = monotonic_nanos();
        assert!(b >= a);
    }
}

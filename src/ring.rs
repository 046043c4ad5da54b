//! Bounded multi-producer, single-consumer ring of fixed-size packets.
//!
//! Producers claim slots with one `fetch_add` on the head cursor, fill
//! the packet in place, and publish by storing `cursor + 1` into the
//! slot's sequence word with release ordering. The consumer at position
//! `r` waits for sequence `r + 1` with acquire ordering, copies the
//! packet out, and re-checks the sequence to detect a concurrent
//! overwrite of the slot it was reading.
//!
//! Under overload producers overwrite unread slots instead of blocking;
//! the consumer observes the sequence jump and accounts the loss (see
//! [`crate::reader`]). The producer side is wait-free: one `fetch_add`
//! plus plain stores, never waiting on the consumer.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{fence, AtomicU64, Ordering};

/// Total footprint of one ring slot in bytes.
pub const PACKET_SIZE: usize = 64;
/// Bytes reserved for the packet header fields.
pub const PACKET_HEADER_SIZE: usize = 16;
/// Payload capacity of a single packet.
pub const PACKET_PAYLOAD: usize = PACKET_SIZE - PACKET_HEADER_SIZE;

/// Position in the ring's logical publication sequence. Monotonically
/// increasing, never wraps in practice (64-bit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cursor(u64);

impl Cursor {
    pub(crate) const fn new(value: u64) -> Self {
        Cursor(value)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// One fragment of a serialized entry.
///
/// Every entry occupies a contiguous run of packets sharing a
/// `stream_id` (the run's base cursor): one start packet and zero or
/// more continuations with ascending `index`.
#[derive(Debug, Clone, Copy)]
pub struct Packet {
    pub stream_id: u64,
    /// Position of this packet within its stream, starting at 0.
    pub index: u16,
    /// Bytes of `payload` actually used.
    pub payload_len: u16,
    pub is_start: bool,
    pub is_continuation: bool,
    pub payload: [u8; PACKET_PAYLOAD],
}

impl Packet {
    pub(crate) const fn empty() -> Self {
        Packet {
            stream_id: 0,
            index: 0,
            payload_len: 0,
            is_start: false,
            is_continuation: false,
            payload: [0; PACKET_PAYLOAD],
        }
    }

    /// The used portion of the payload.
    pub fn bytes(&self) -> &[u8] {
        &self.payload[..self.payload_len as usize]
    }
}

struct Slot {
    /// Claim/publish word. Holds the slot index before first use, the
    /// claiming cursor while a producer is writing, and `cursor + 1`
    /// once the packet at `cursor` is published.
    seq: AtomicU64,
    packet: UnsafeCell<Packet>,
}

/// Outcome of a consumer read at a given cursor.
#[derive(Debug, Clone)]
pub(crate) enum ReadSlot {
    /// The packet at this cursor, copied out intact.
    Ready(Packet),
    /// Nothing published at this cursor yet.
    NotYet,
    /// The slot was reused by a later cursor; data at this position is gone.
    Overwritten,
}

/// Fixed-capacity MPSC packet ring.
pub struct PacketRing {
    slots: Box<[Slot]>,
    mask: u64,
    head: AtomicU64,
}

// Safety: slot contents are only written by the producer that claimed the
// cursor, between the claim mark and the release publication; the
// consumer copies them out and validates the sequence afterwards.
unsafe impl Send for PacketRing {}
unsafe impl Sync for PacketRing {}

impl PacketRing {
    /// Create a ring of `capacity` packets. `capacity` must be a power
    /// of two and at least 2.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two() && capacity >= 2,
            "ring capacity must be a power of two >= 2, got {capacity}"
        );
        let slots = (0..capacity as u64)
            .map(|i| Slot {
                seq: AtomicU64::new(i),
                packet: UnsafeCell::new(Packet::empty()),
            })
            .collect();
        PacketRing {
            slots,
            mask: capacity as u64 - 1,
            head: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// The producer cursor: the next cursor that will be claimed.
    pub fn head(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    /// Claim `count` consecutive cursors in one atomic step, returning
    /// the first. This is what makes a multi-packet entry atomic with
    /// respect to interleaving: no other producer can place a packet
    /// inside the claimed run.
    pub(crate) fn claim(&self, count: u64) -> u64 {
        self.head.fetch_add(count, Ordering::AcqRel)
    }

    /// Write `packet` into the slot for `cursor` and make it visible to
    /// the consumer. `cursor` must have been claimed by the caller.
    pub(crate) fn publish(&self, cursor: u64, packet: &Packet) {
        let slot = &self.slots[(cursor & self.mask) as usize];
        // Mark the slot as in-progress. The claim value `cursor` can
        // never equal a published value (`c + 1` for some cursor `c`
        // mapping to the same slot differs from `cursor` by a multiple
        // of the capacity, minus one), so a concurrent reader's
        // re-check cannot mistake an in-progress write for valid data.
        slot.seq.store(cursor, Ordering::Relaxed);
        fence(Ordering::Release);
        // Safety: the cursor was claimed by this producer, so no other
        // producer writes this slot until the head laps the ring; the
        // consumer never writes.
        unsafe { ptr::write(slot.packet.get(), *packet) };
        slot.seq.store(cursor + 1, Ordering::Release);
    }

    /// Attempt to read the packet published at `cursor`.
    pub(crate) fn read_at(&self, cursor: u64) -> ReadSlot {
        let slot = &self.slots[(cursor & self.mask) as usize];
        let seq = slot.seq.load(Ordering::Acquire);
        let published = cursor + 1;
        if seq < published {
            return ReadSlot::NotYet;
        }
        if seq > published {
            return ReadSlot::Overwritten;
        }
        // Safety: copy only; validity is established by the sequence
        // re-check below, which catches a producer lapping the ring
        // mid-copy.
        let packet = unsafe { ptr::read_volatile(slot.packet.get()) };
        fence(Ordering::Acquire);
        if slot.seq.load(Ordering::Relaxed) == published {
            ReadSlot::Ready(packet)
        } else {
            ReadSlot::Overwritten
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn packet_with(stream_id: u64, index: u16, fill: u8) -> Packet {
        let mut packet = Packet::empty();
        packet.stream_id = stream_id;
        packet.index = index;
        packet.payload_len = 4;
        packet.is_start = index == 0;
        packet.is_continuation = index != 0;
        packet.payload[..4].copy_from_slice(&[fill; 4]);
        packet
    }

    #[test]
    fn test_empty_ring_has_nothing() {
        let ring = PacketRing::with_capacity(8);
        assert!(matches!(ring.read_at(0), ReadSlot::NotYet));
        assert_eq!(ring.head(), 0);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn test_capacity_must_be_power_of_two() {
        let _ = PacketRing::with_capacity(6);
    }

    #[test]
    fn test_publish_then_read() {
        let ring = PacketRing::with_capacity(8);
        let cursor = ring.claim(1);
        ring.publish(cursor, &packet_with(cursor, 0, 0xAA));

        match ring.read_at(cursor) {
            ReadSlot::Ready(packet) => {
                assert_eq!(packet.stream_id, cursor);
                assert_eq!(packet.bytes(), &[0xAA; 4]);
                assert!(packet.is_start);
            }
            other => panic!("expected Ready, got {other:?}"),
        }
        // The next position is still unpublished.
        assert!(matches!(ring.read_at(cursor + 1), ReadSlot::NotYet));
    }

    #[test]
    fn test_claim_is_contiguous() {
        let ring = PacketRing::with_capacity(8);
        let a = ring.claim(3);
        let b = ring.claim(2);
        assert_eq!(b, a + 3);
        assert_eq!(ring.head(), a + 5);
    }

    #[test]
    fn test_overwrite_detected_after_lap() {
        let ring = PacketRing::with_capacity(4);
        for cursor in 0..6u64 {
            let c = ring.claim(1);
            ring.publish(c, &packet_with(cursor, 0, cursor as u8));
        }
        // Cursors 0 and 1 were lapped by 4 and 5.
        assert!(matches!(ring.read_at(0), ReadSlot::Overwritten));
        assert!(matches!(ring.read_at(1), ReadSlot::Overwritten));
        match ring.read_at(2) {
            ReadSlot::Ready(packet) => assert_eq!(packet.bytes(), &[2; 4]),
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[test]
    fn test_claimed_but_unpublished_reads_not_yet() {
        let ring = PacketRing::with_capacity(8);
        let cursor = ring.claim(1);
        assert!(matches!(ring.read_at(cursor), ReadSlot::NotYet));
    }

    #[test]
    fn test_concurrent_producers_publish_all_claims() {
        let ring = Arc::new(PacketRing::with_capacity(1024));
        let threads: Vec<_> = (0..4u8)
            .map(|t| {
                let ring = ring.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let cursor = ring.claim(1);
                        ring.publish(cursor, &packet_with(cursor, 0, t));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(ring.head(), 400);
        for cursor in 0..400u64 {
            match ring.read_at(cursor) {
                ReadSlot::Ready(packet) => assert_eq!(packet.stream_id, cursor),
                other => panic!("cursor {cursor}: expected Ready, got {other:?}"),
            }
        }
    }
}

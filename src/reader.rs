//! Consumer-side reassembly of entries from the packet ring.
//!
//! Strictly single-threaded: one `EntryReader` owns the read position.
//! It walks the publication sequence, accumulates packet payloads per
//! stream, and emits an entry once a stream's bytes reach the length
//! declared by its start packet. Sequence gaps (the producers lapped
//! us) and corrupt streams are accounted as loss: an affected entry is
//! dropped whole, never silently truncated.

use crate::codec;
use crate::entry::Entry;
use crate::ring::{PacketRing, ReadSlot};
use std::collections::HashMap;
use std::sync::Arc;

struct PartialEntry {
    /// Total serialized length declared by the start packet.
    expected: usize,
    bytes: Vec<u8>,
    /// Intra-stream index the next continuation must carry.
    next_index: u16,
}

/// Reassembles typed entries from the ring.
pub struct EntryReader {
    ring: Arc<PacketRing>,
    next_read: u64,
    partial: HashMap<u64, PartialEntry>,
    lost_packets: u64,
    lost_entries: u64,
}

impl EntryReader {
    pub fn new(ring: Arc<PacketRing>) -> Self {
        EntryReader {
            ring,
            next_read: 0,
            partial: HashMap::new(),
            lost_packets: 0,
            lost_entries: 0,
        }
    }

    /// Packets skipped because producers overwrote them before we read
    /// them.
    pub fn lost_packets(&self) -> u64 {
        self.lost_packets
    }

    /// Entries dropped because part of their stream was lost or failed
    /// to decode.
    pub fn lost_entries(&self) -> u64 {
        self.lost_entries
    }

    /// The cursor this reader will consume next.
    pub fn position(&self) -> u64 {
        self.next_read
    }

    /// Pull the next complete entry, if one can be assembled from what
    /// has been published. Returns `None` once the ring is drained.
    pub fn try_next(&mut self) -> Option<Entry> {
        loop {
            match self.ring.read_at(self.next_read) {
                ReadSlot::NotYet => return None,
                ReadSlot::Overwritten => self.recover_from_gap(),
                ReadSlot::Ready(packet) => {
                    self.next_read += 1;
                    if let Some(entry) = self.accept(&packet) {
                        return Some(entry);
                    }
                }
            }
        }
    }

    /// The producers lapped our position. Account the skipped packets,
    /// drop every partial stream (their continuations are gone), and
    /// resume one capacity behind the producer cursor; `accept` then
    /// skips forward to the next start packet.
    fn recover_from_gap(&mut self) {
        let head = self.ring.head();
        let capacity = self.ring.capacity() as u64;
        let resume = head.saturating_sub(capacity).max(self.next_read + 1);

        self.lost_packets += resume - self.next_read;
        self.lost_entries += self.partial.len() as u64;
        self.partial.clear();
        self.next_read = resume;
    }

    fn accept(&mut self, packet: &crate::ring::Packet) -> Option<Entry> {
        if packet.is_start {
            return self.accept_start(packet);
        }

        // A continuation with no open stream lost its start packet in a
        // gap; skip it.
        let mut pending = self.partial.remove(&packet.stream_id)?;
        if packet.index != pending.next_index {
            self.lost_entries += 1;
            return None;
        }
        pending.bytes.extend_from_slice(packet.bytes());
        pending.next_index += 1;

        if pending.bytes.len() < pending.expected {
            self.partial.insert(packet.stream_id, pending);
            return None;
        }
        if pending.bytes.len() > pending.expected {
            self.lost_entries += 1;
            return None;
        }
        self.decode(&pending.bytes)
    }

    fn accept_start(&mut self, packet: &crate::ring::Packet) -> Option<Entry> {
        let expected = match codec::expected_size(packet.bytes()) {
            Ok(expected) => expected,
            Err(_) => {
                self.lost_entries += 1;
                return None;
            }
        };
        if packet.bytes().len() >= expected {
            return self.decode(&packet.bytes()[..expected]);
        }
        self.partial.insert(
            packet.stream_id,
            PartialEntry {
                expected,
                bytes: packet.bytes().to_vec(),
                next_index: 1,
            },
        );
        None
    }

    fn decode(&mut self, bytes: &[u8]) -> Option<Entry> {
        match codec::unpack(bytes) {
            Ok(entry) => Some(entry),
            Err(_) => {
                self.lost_entries += 1;
                None
            }
        }
    }
}

//! Multi-producer ordering and loss-accounting scenarios.

use ringtrace::{
    Entry, EntryReader, EntryType, Logger, PacketRing, StandardEntry, NO_MATCH,
    TRACING_DISABLED,
};
use std::collections::HashMap;
use std::sync::Arc;

fn marker(tid: i32, sequence: i64) -> StandardEntry {
    StandardEntry {
        id: NO_MATCH,
        entry_type: EntryType::StackFrame,
        timestamp: 0,
        tid,
        callid: 0,
        matchid: 0,
        extra: sequence,
    }
}

#[test]
fn test_producers_preserve_per_thread_program_order() {
    const THREADS: i32 = 4;
    const PER_THREAD: i64 = 250;

    // Large enough that nothing is overwritten: every entry must arrive.
    let ring = Arc::new(PacketRing::with_capacity(4096));
    let logger = Arc::new(Logger::new(ring.clone()));

    let producers: Vec<_> = (0..THREADS)
        .map(|tid| {
            let logger = logger.clone();
            std::thread::spawn(move || {
                for sequence in 0..PER_THREAD {
                    let id = logger.write(marker(tid, sequence));
                    assert_ne!(id, TRACING_DISABLED);
                    assert_ne!(id, NO_MATCH);
                }
            })
        })
        .collect();
    for p in producers {
        p.join().unwrap();
    }

    let mut reader = EntryReader::new(ring);
    let mut last_sequence: HashMap<i32, i64> = HashMap::new();
    let mut seen_ids = std::collections::HashSet::new();
    let mut total = 0usize;

    while let Some(entry) = reader.try_next() {
        let Entry::Standard(e) = entry else {
            panic!("only standard entries were written");
        };
        // Claim order must preserve each producer's program order.
        let last = last_sequence.entry(e.tid).or_insert(-1);
        assert!(
            e.extra > *last,
            "thread {} emitted sequence {} after {}",
            e.tid,
            e.extra,
            *last
        );
        *last = e.extra;
        assert!(seen_ids.insert(e.id), "duplicate id {}", e.id);
        total += 1;
    }

    assert_eq!(total, (THREADS as i64 * PER_THREAD) as usize);
    assert_eq!(reader.lost_packets(), 0);
    assert_eq!(reader.lost_entries(), 0);
}

#[test]
fn test_emission_order_matches_claim_order() {
    let ring = Arc::new(PacketRing::with_capacity(1024));
    let logger = Arc::new(Logger::new(ring.clone()));

    let producers: Vec<_> = (0..4)
        .map(|tid| {
            let logger = logger.clone();
            std::thread::spawn(move || {
                let mut claims = Vec::new();
                for sequence in 0..100 {
                    let (id, cursor) = logger
                        .write_and_get_cursor(marker(tid, sequence))
                        .expect("logging is enabled");
                    claims.push((cursor, id));
                }
                claims
            })
        })
        .collect();

    let mut claims: Vec<_> = producers
        .into_iter()
        .flat_map(|p| p.join().unwrap())
        .collect();
    claims.sort();

    let mut reader = EntryReader::new(ring);
    let mut emitted = Vec::new();
    while let Some(entry) = reader.try_next() {
        emitted.push(entry.id());
    }

    let expected: Vec<i32> = claims.into_iter().map(|(_, id)| id).collect();
    assert_eq!(emitted, expected, "emission must follow claim order");
}

#[test]
fn test_overrun_is_detected_not_silent() {
    let ring = Arc::new(PacketRing::with_capacity(4));
    let logger = Logger::new(ring.clone());

    for sequence in 0..100 {
        logger.write(marker(0, sequence));
    }

    let mut reader = EntryReader::new(ring);
    let mut survivors = 0;
    while let Some(entry) = reader.try_next() {
        // Whatever survives decodes cleanly from a start packet.
        assert_eq!(entry.entry_type(), EntryType::StackFrame);
        survivors += 1;
    }
    assert_eq!(survivors, 4);
    assert!(reader.lost_packets() >= 96);
}

#[test]
fn test_reader_keeps_up_with_live_producers() {
    let ring = Arc::new(PacketRing::with_capacity(4096));
    let logger = Arc::new(Logger::new(ring.clone()));
    let mut reader = EntryReader::new(ring);

    let producer = {
        let logger = logger.clone();
        std::thread::spawn(move || {
            for sequence in 0..500 {
                logger.write(marker(1, sequence));
            }
        })
    };

    // Drain concurrently with the producer until all entries arrive.
    let mut total = 0;
    while total < 500 {
        match reader.try_next() {
            Some(_) => total += 1,
            None => std::thread::yield_now(),
        }
    }
    producer.join().unwrap();
    assert!(reader.try_next().is_none());
    assert_eq!(reader.lost_packets(), 0);
}

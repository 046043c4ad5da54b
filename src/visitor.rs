//! The consumer-side transformation pipeline.
//!
//! Every reassembled entry flows through an ordered list of stages and
//! ends at a printer that owns the output sink. Stages are a tagged sum
//! dispatched with a match; no trait objects or heap indirection on the
//! consumer hot path.
//!
//! The canonical stack, outermost first:
//!
//! 1. [`FrameInverter`] — reverse frame order so the deepest frame
//!    appears last.
//! 2. [`TimestampTruncator`] — round timestamps down to the configured
//!    precision (`ts / p * p`); idempotent.
//! 3. [`DeltaEncoder`] — replace each outgoing timestamp with its
//!    difference from the previously emitted one. A single running
//!    prior suffices because emission is serialized.
//! 4. [`EntryPrinter`] — pipe-delimited text, one entry per line, with
//!    timestamps emitted in precision units.
//!
//! Truncation must run before delta encoding so deltas are exact
//! multiples of the precision; the printer's final division is then
//! lossless, and the file's `prec|` header lets consumers reconstruct
//! the original units.

use crate::entry::Entry;
use std::io::{self, Write};

/// Reverses the frame order of frames entries.
#[derive(Debug, Default)]
pub struct FrameInverter;

impl FrameInverter {
    pub fn visit(&self, entry: &mut Entry) {
        if let Entry::Frames(frames) = entry {
            frames.frames.reverse();
        }
    }
}

/// Rounds timestamps down to a multiple of `precision`.
#[derive(Debug)]
pub struct TimestampTruncator {
    precision: i64,
}

impl TimestampTruncator {
    pub fn new(precision: i64) -> Self {
        assert!(precision > 0, "precision must be positive, got {precision}");
        TimestampTruncator { precision }
    }

    pub fn visit(&self, entry: &mut Entry) {
        if let Some(timestamp) = entry.timestamp_mut() {
            *timestamp = *timestamp / self.precision * self.precision;
        }
    }
}

/// Rewrites each timestamp as the difference from the previous one.
///
/// The prior starts at zero, so the first timestamped entry of a trace
/// carries its absolute (truncated) value.
#[derive(Debug, Default)]
pub struct DeltaEncoder {
    prior: i64,
}

impl DeltaEncoder {
    pub fn visit(&mut self, entry: &mut Entry) {
        if let Some(timestamp) = entry.timestamp_mut() {
            let absolute = *timestamp;
            *timestamp = absolute - self.prior;
            self.prior = absolute;
        }
    }
}

/// Terminal stage: writes one pipe-delimited line per entry.
///
/// Standard entries print as `id|type|timestamp|tid|callid|matchid|extra`;
/// frames entries append the frame count and the frames in hex; bytes
/// entries print as `id|type|arg1|len|hex`.
#[derive(Debug)]
pub struct EntryPrinter<W: Write> {
    out: W,
    precision: i64,
}

impl<W: Write> EntryPrinter<W> {
    pub fn new(out: W, precision: i64) -> Self {
        assert!(precision > 0, "precision must be positive, got {precision}");
        EntryPrinter { out, precision }
    }

    pub fn visit(&mut self, entry: &Entry) -> io::Result<()> {
        match entry {
            Entry::Standard(e) => {
                writeln!(
                    self.out,
                    "{}|{}|{}|{}|{}|{}|{}",
                    e.id,
                    e.entry_type,
                    e.timestamp / self.precision,
                    e.tid,
                    e.callid,
                    e.matchid,
                    e.extra
                )
            }
            Entry::Frames(e) => {
                write!(
                    self.out,
                    "{}|{}|{}|{}|{}|{}|{}|{}",
                    e.id,
                    e.entry_type,
                    e.timestamp / self.precision,
                    e.tid,
                    e.callid,
                    e.matchid,
                    e.extra,
                    e.frames.len()
                )?;
                for frame in &e.frames {
                    write!(self.out, "|{frame:x}")?;
                }
                self.out.write_all(b"\n")
            }
            Entry::Bytes(e) => {
                write!(
                    self.out,
                    "{}|{}|{}|{}|",
                    e.id,
                    e.entry_type,
                    e.arg1,
                    e.bytes.len()
                )?;
                for byte in &e.bytes {
                    write!(self.out, "{byte:02x}")?;
                }
                self.out.write_all(b"\n")
            }
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// A transforming stage of the pipeline.
#[derive(Debug)]
pub enum Stage {
    InvertFrames(FrameInverter),
    TruncateTimestamps(TimestampTruncator),
    DeltaEncodeTimestamps(DeltaEncoder),
}

impl Stage {
    fn apply(&mut self, entry: &mut Entry) {
        match self {
            Stage::InvertFrames(stage) => stage.visit(entry),
            Stage::TruncateTimestamps(stage) => stage.visit(entry),
            Stage::DeltaEncodeTimestamps(stage) => stage.visit(entry),
        }
    }
}

/// An ordered list of stages terminated by a printer that owns the sink.
pub struct Pipeline<W: Write> {
    stages: Vec<Stage>,
    printer: EntryPrinter<W>,
}

impl<W: Write> Pipeline<W> {
    /// The canonical stack: invert, truncate to `precision`, delta
    /// encode, print.
    pub fn standard(out: W, precision: i64) -> Self {
        Pipeline {
            stages: vec![
                Stage::InvertFrames(FrameInverter),
                Stage::TruncateTimestamps(TimestampTruncator::new(precision)),
                Stage::DeltaEncodeTimestamps(DeltaEncoder::default()),
            ],
            printer: EntryPrinter::new(out, precision),
        }
    }

    pub fn visit(&mut self, entry: &Entry) -> io::Result<()> {
        let mut entry = entry.clone();
        for stage in &mut self.stages {
            stage.apply(&mut entry);
        }
        self.printer.visit(&entry)
    }

    /// Flush pending output without consuming the pipeline.
    pub fn flush(&mut self) -> io::Result<()> {
        self.printer.out.flush()
    }

    /// Tear the pipeline down, returning the sink for finalization.
    pub fn into_sink(self) -> W {
        self.printer.into_inner()
    }
}

//! Per-trace file lifecycle: creation, headers, termination, abort.
//!
//! [`TraceLifecycleWriter`] is a state machine keyed to one expected
//! trace id. A matching TRACE_START opens the compressed trace file and
//! builds the transformation pipeline; TRACE_END / TRACE_ABORT /
//! TRACE_TIMEOUT tear it down and fire exactly one terminal callback.
//! Every other entry is forwarded into the pipeline while a trace is
//! active.
//!
//! [`TraceConsumer`] is the single-threaded drain loop that connects an
//! [`EntryReader`] to the lifecycle writer; [`ConsumerGuard`] runs it on
//! a named thread and joins it on drop.

use crate::entry::{Entry, EntryType, StandardEntry};
use crate::reader::EntryReader;
use crate::visitor::Pipeline;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::os::unix::fs::{DirBuilderExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Version stamped into the `ver|` header line.
pub const TRACE_FORMAT_VERSION: u32 = 1;

/// Length of an encoded trace id.
pub const TRACE_ID_LEN: usize = 11;

const TRACE_ID_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Default timestamp precision (clock units per emitted time unit).
pub const DEFAULT_PRECISION: i64 = 1000;

/// Default packet ring capacity.
pub const DEFAULT_RING_CAPACITY: usize = 4096;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("trace id must be non-negative, got {0}")]
    InvalidTraceId(i64),
    #[error("timestamp precision must be positive, got {0}")]
    InvalidPrecision(i64),
    #[error("trace folder must be an absolute path, got {}", .0.display())]
    RelativeFolder(PathBuf),
    #[error("could not create trace folder {}: {source} ({detail})", .path.display())]
    CreateFolder {
        path: PathBuf,
        detail: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Why a trace was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// An external controller aborted the trace, or file I/O failed
    /// while it was being written.
    ControllerInitiated,
    /// The trace exceeded its deadline.
    Timeout,
    /// A new TRACE_START arrived while the trace was still active.
    NewStart,
}

/// Hooks invoked as traces open and close. All methods default to
/// no-ops so implementors override only what they observe.
pub trait TraceCallbacks: Send + Sync {
    fn on_trace_start(&self, _trace_id: i64, _flags: i32, _path: &Path) {}
    fn on_trace_end(&self, _trace_id: i64) {}
    fn on_trace_abort(&self, _trace_id: i64, _reason: AbortReason) {}
}

/// Encode a non-negative trace id as an 11-character base64 string,
/// most significant digit first, zero padded.
pub fn trace_id_string(trace_id: i64) -> Result<String, TraceError> {
    if trace_id < 0 {
        return Err(TraceError::InvalidTraceId(trace_id));
    }
    let mut digits = [0u8; TRACE_ID_LEN];
    let mut rest = trace_id as u64;
    for slot in digits.iter_mut().rev() {
        *slot = TRACE_ID_ALPHABET[(rest % 64) as usize];
        rest /= 64;
    }
    Ok(digits.iter().map(|&b| char::from(b)).collect())
}

/// Decode a string produced by [`trace_id_string`]. `None` for wrong
/// length, characters outside the alphabet, or values past `i64::MAX`.
pub fn decode_trace_id(encoded: &str) -> Option<i64> {
    if encoded.len() != TRACE_ID_LEN {
        return None;
    }
    let mut value: i64 = 0;
    for byte in encoded.bytes() {
        let digit = TRACE_ID_ALPHABET.iter().position(|&c| c == byte)? as i64;
        value = value.checked_mul(64)?.checked_add(digit)?;
    }
    Some(value)
}

/// Replace every character outside `[A-Za-z0-9._-]` with `_`.
pub fn sanitize(input: &str) -> String {
    input
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

fn trace_filename(prefix: &str, trace_id: &str) -> io::Result<String> {
    let (year, month, day, hour, minute, second) = local_time()?;
    Ok(format!(
        "{prefix}-{pid}-{year}-{month}-{day}T{hour}-{minute}-{second}-{trace_id}.tmp",
        pid = std::process::id()
    ))
}

fn local_time() -> io::Result<(i32, i32, i32, i32, i32, i32)> {
    // SAFETY: time(2) with a null argument just returns the current time.
    let now = unsafe { libc::time(std::ptr::null_mut()) };
    let mut tm = unsafe { std::mem::zeroed::<libc::tm>() };
    // SAFETY: `now` and `tm` are valid pointers; localtime_r fills `tm`
    // or returns null.
    let filled = unsafe { libc::localtime_r(&now, &mut tm) };
    if filled.is_null() {
        return Err(io::Error::other("localtime_r failed"));
    }
    Ok((
        1900 + tm.tm_year,
        1 + tm.tm_mon,
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec,
    ))
}

/// Where and how traces get written.
#[derive(Debug, Clone)]
pub struct TraceConfig {
    folder: PathBuf,
    prefix: String,
    precision: i64,
    headers: Vec<(String, String)>,
    ring_capacity: usize,
    id_step: u16,
}

impl TraceConfig {
    pub fn new(folder: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        TraceConfig {
            folder: folder.into(),
            prefix: prefix.into(),
            precision: DEFAULT_PRECISION,
            headers: Vec::new(),
            ring_capacity: DEFAULT_RING_CAPACITY,
            id_step: 1,
        }
    }

    pub fn with_precision(mut self, precision: i64) -> Self {
        self.precision = precision;
        self
    }

    /// Add a `key|value` pair to the header block of every trace file.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_ring_capacity(mut self, capacity: usize) -> Self {
        self.ring_capacity = capacity;
        self
    }

    pub fn with_id_step(mut self, step: u16) -> Self {
        self.id_step = step;
        self
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn precision(&self) -> i64 {
        self.precision
    }

    pub fn ring_capacity(&self) -> usize {
        self.ring_capacity
    }

    pub fn id_step(&self) -> u16 {
        self.id_step
    }
}

type TraceSink = GzEncoder<BufWriter<File>>;

/// The per-trace state machine. See the module docs for the lifecycle.
pub struct TraceLifecycleWriter {
    folder: PathBuf,
    prefix: String,
    precision: i64,
    headers: Vec<(String, String)>,
    expected_trace_id: i64,
    callbacks: Option<Arc<dyn TraceCallbacks>>,
    pipeline: Option<Pipeline<TraceSink>>,
}

impl TraceLifecycleWriter {
    /// Relative folders are rejected here, up front: directory creation
    /// below assumes an absolute root.
    pub fn new(
        config: &TraceConfig,
        expected_trace_id: i64,
        callbacks: Option<Arc<dyn TraceCallbacks>>,
    ) -> Result<Self, TraceError> {
        if !config.folder.is_absolute() {
            return Err(TraceError::RelativeFolder(config.folder.clone()));
        }
        if config.precision <= 0 {
            return Err(TraceError::InvalidPrecision(config.precision));
        }
        Ok(TraceLifecycleWriter {
            folder: config.folder.clone(),
            prefix: config.prefix.clone(),
            precision: config.precision,
            headers: config.headers.clone(),
            expected_trace_id,
            callbacks,
            pipeline: None,
        })
    }

    pub fn is_active(&self) -> bool {
        self.pipeline.is_some()
    }

    /// Route one reassembled entry through the state machine.
    pub fn visit(&mut self, entry: &Entry) {
        if let Entry::Standard(standard) = entry {
            if standard.entry_type.is_control() {
                self.visit_control(standard, entry);
                return;
            }
        }
        self.forward_or_abort(entry);
    }

    /// Abort the active trace from outside the entry stream (consumer
    /// shutdown, external controller). No-op while idle.
    pub fn abort(&mut self, reason: AbortReason) {
        if self.is_active() {
            self.abort_trace(self.expected_trace_id, reason);
        }
    }

    fn visit_control(&mut self, standard: &StandardEntry, entry: &Entry) {
        // Lifecycle entries carry their trace id in `extra`; anything
        // for another trace is not ours to act on.
        if standard.extra != self.expected_trace_id {
            return;
        }
        match standard.entry_type {
            EntryType::TraceStart | EntryType::TraceBackwards => {
                self.handle_start(standard.extra, standard.matchid);
                // Write the start entry into the file it just opened.
                self.forward_or_abort(entry);
            }
            EntryType::TraceEnd => {
                if !self.is_active() {
                    return;
                }
                // Write the terminal entry before tearing down state.
                self.forward_or_abort(entry);
                if self.is_active() {
                    self.end_trace(standard.extra);
                }
            }
            EntryType::TraceAbort | EntryType::TraceTimeout => {
                if !self.is_active() {
                    return;
                }
                let reason = if standard.entry_type == EntryType::TraceTimeout {
                    AbortReason::Timeout
                } else {
                    AbortReason::ControllerInitiated
                };
                self.forward_or_abort(entry);
                if self.is_active() {
                    self.abort_trace(standard.extra, reason);
                }
            }
            _ => {}
        }
    }

    fn handle_start(&mut self, trace_id: i64, flags: i32) {
        if self.is_active() {
            // Same trace started again while still active: tear the
            // current one down; the new start is not begun automatically.
            self.abort_trace(trace_id, AbortReason::NewStart);
            return;
        }
        match self.open_trace(trace_id) {
            Ok(path) => {
                debug!(trace_id, path = %path.display(), "trace started");
                if let Some(callbacks) = &self.callbacks {
                    callbacks.on_trace_start(trace_id, flags, &path);
                }
            }
            Err(err) => {
                warn!(trace_id, error = %err, "could not start trace");
            }
        }
    }

    fn open_trace(&mut self, trace_id: i64) -> Result<PathBuf, TraceError> {
        let id_string = trace_id_string(trace_id)?;
        let trace_folder = self.folder.join(sanitize(&id_string));
        self.ensure_trace_folder(&trace_folder)?;

        let filename = sanitize(&trace_filename(&self.prefix, &id_string)?);
        let path = trace_folder.join(filename);

        let file = File::create(&path)?;
        let mut sink = GzEncoder::new(BufWriter::new(file), Compression::default());
        self.write_headers(&mut sink, &id_string)?;
        self.pipeline = Some(Pipeline::standard(sink, self.precision));
        Ok(path)
    }

    fn ensure_trace_folder(&self, path: &Path) -> Result<(), TraceError> {
        let mut builder = fs::DirBuilder::new();
        builder.mode(0o770);
        match builder.create(path) {
            Ok(()) => Ok(()),
            // Lost a creation race with another process; the folder is
            // there, which is all we need.
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(source) => {
                let detail = match fs::metadata(&self.folder) {
                    Ok(meta) => format!(
                        "parent {} uid={} gid={}, proc euid={} egid={}",
                        self.folder.display(),
                        meta.uid(),
                        meta.gid(),
                        // SAFETY: geteuid/getegid take no arguments and
                        // cannot fail.
                        unsafe { libc::geteuid() },
                        unsafe { libc::getegid() },
                    ),
                    Err(stat_err) => format!(
                        "could not stat parent {}: {stat_err}",
                        self.folder.display()
                    ),
                };
                Err(TraceError::CreateFolder {
                    path: path.to_path_buf(),
                    detail,
                    source,
                })
            }
        }
    }

    fn write_headers(&self, out: &mut impl Write, id_string: &str) -> io::Result<()> {
        write!(
            out,
            "dt\nver|{TRACE_FORMAT_VERSION}\nid|{id_string}\nprec|{}\n",
            self.precision
        )?;
        for (key, value) in &self.headers {
            writeln!(out, "{key}|{value}")?;
        }
        out.write_all(b"\n")
    }

    fn forward_or_abort(&mut self, entry: &Entry) {
        let Some(pipeline) = self.pipeline.as_mut() else {
            return;
        };
        if let Err(err) = pipeline.visit(entry) {
            warn!(error = %err, "trace file write failed; aborting trace");
            self.abort_trace(self.expected_trace_id, AbortReason::ControllerInitiated);
        }
    }

    /// Finish the compressed stream and close the file. The `.tmp` file
    /// stays in place either way; renaming or unlinking is the caller's
    /// business.
    fn teardown(&mut self) -> io::Result<()> {
        let Some(pipeline) = self.pipeline.take() else {
            return Ok(());
        };
        let mut inner = pipeline.into_sink().finish()?;
        inner.flush()
    }

    fn end_trace(&mut self, trace_id: i64) {
        match self.teardown() {
            Ok(()) => {
                debug!(trace_id, "trace finalized");
                if let Some(callbacks) = &self.callbacks {
                    callbacks.on_trace_end(trace_id);
                }
            }
            Err(err) => {
                warn!(trace_id, error = %err, "trace finalization failed");
                if let Some(callbacks) = &self.callbacks {
                    callbacks.on_trace_abort(trace_id, AbortReason::ControllerInitiated);
                }
            }
        }
    }

    fn abort_trace(&mut self, trace_id: i64, reason: AbortReason) {
        if let Err(err) = self.teardown() {
            warn!(trace_id, error = %err, "trace teardown failed during abort");
        }
        debug!(trace_id, ?reason, "trace aborted");
        if let Some(callbacks) = &self.callbacks {
            callbacks.on_trace_abort(trace_id, reason);
        }
    }
}

impl Drop for TraceLifecycleWriter {
    fn drop(&mut self) {
        // A still-active trace at drop means the consumer is going away
        // underneath it; that is an abort, not a finalization.
        self.abort(AbortReason::ControllerInitiated);
    }
}

/// Single-threaded drain loop: ring → reader → lifecycle writer.
pub struct TraceConsumer {
    reader: EntryReader,
    lifecycle: TraceLifecycleWriter,
    reported_loss: u64,
}

impl TraceConsumer {
    pub fn new(reader: EntryReader, lifecycle: TraceLifecycleWriter) -> Self {
        TraceConsumer {
            reader,
            lifecycle,
            reported_loss: 0,
        }
    }

    /// Drain everything currently published, returning how many entries
    /// were processed.
    pub fn poll(&mut self) -> usize {
        let mut processed = 0;
        while let Some(entry) = self.reader.try_next() {
            self.lifecycle.visit(&entry);
            processed += 1;
        }
        let lost = self.reader.lost_packets();
        if lost > self.reported_loss {
            warn!(
                lost_packets = lost - self.reported_loss,
                "ring buffer overran; data was dropped"
            );
            self.reported_loss = lost;
        }
        processed
    }

    /// Drive the loop until `stop` is set, then drain once more and
    /// abort any still-active trace.
    pub fn run(mut self, stop: &AtomicBool) {
        while !stop.load(Ordering::Acquire) {
            if self.poll() == 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        self.poll();
        self.lifecycle.abort(AbortReason::ControllerInitiated);
    }

    /// Run the loop on a dedicated thread; the returned guard stops and
    /// joins it on drop.
    pub fn spawn(self) -> ConsumerGuard {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let thread = std::thread::Builder::new()
            .name("trace-writer".into())
            .spawn(move || self.run(&thread_stop))
            .expect("failed to spawn trace-writer thread");
        ConsumerGuard {
            stop,
            thread: Some(thread),
        }
    }
}

/// RAII handle for a spawned [`TraceConsumer`].
pub struct ConsumerGuard {
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

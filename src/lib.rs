#![doc = include_str!("../README.md")]

pub mod codec;
pub mod entry;
pub mod logger;
pub mod reader;
pub mod ring;
pub mod visitor;
pub mod writer;

pub use entry::{
    BytesEntry, Entry, EntryType, FramesEntry, StandardEntry, MAX_BYTES_LEN, MAX_FRAME_DEPTH,
};
pub use logger::{IdAllocator, Logger, PacketLogger, NO_MATCH, TRACING_DISABLED};
pub use reader::EntryReader;
pub use ring::{Cursor, Packet, PacketRing, PACKET_PAYLOAD, PACKET_SIZE};
pub use writer::{
    AbortReason, ConsumerGuard, TraceCallbacks, TraceConfig, TraceConsumer, TraceError,
    TraceLifecycleWriter,
};

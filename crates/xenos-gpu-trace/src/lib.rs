//! Trace container for the Xenos GPU command-stream interpreter.
//!
//! A trace is a flat, append-only stream of self-delimited records: packet
//! start/end pairs, guest memory reads/writes, indirect-buffer levels, and
//! events. The writer enforces pairing at emission time; the reader recovers
//! the nesting structure for replay and validation tooling.

mod format;
mod reader;
mod writer;

pub use format::{
    EventKind, RecordType, TraceHeader, CONTAINER_VERSION, RECORD_HEADER_SIZE, TRACE_HEADER_SIZE,
    TRACE_MAGIC,
};
pub use reader::{Trace, TraceReadError, TraceRecord};
pub use writer::{TraceWriteError, TraceWriter};

//! Runtime-selected trace recording.
//!
//! The recorder wraps [`xenos_gpu_trace::TraceWriter`] and tolerates being
//! disabled: every operation is a no-op without an open writer, so the hot
//! path never branches on a build-time flag. A write failure downgrades the
//! recorder to disabled rather than disturbing command processing.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use tracing::warn;
use xenos_gpu_trace::{EventKind, TraceWriteError, TraceWriter};

/// Trace capture policy for a command-processor instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceMode {
    Disabled,
    /// Record every frame into one container.
    Streaming,
    /// Record the next frame, then close.
    SingleFrame,
}

/// Builds the conventional trace file name for a captured frame.
pub fn trace_file_name(title_id: u32, sequence: u32) -> String {
    format!("{title_id:08X}_{sequence}.xtr")
}

type BoxedSink = Box<dyn Write + Send>;

#[derive(Default)]
pub struct TraceRecorder {
    writer: Option<TraceWriter<BoxedSink>>,
}

impl TraceRecorder {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    pub fn open_file(&mut self, path: &Path, title_id: u32) -> io::Result<()> {
        let file = File::create(path)?;
        let sink: BoxedSink = Box::new(BufWriter::new(file));
        match TraceWriter::new(sink, title_id) {
            Ok(writer) => {
                self.writer = Some(writer);
                Ok(())
            }
            Err(TraceWriteError::Io(err)) => Err(err),
            Err(other) => Err(io::Error::other(other.to_string())),
        }
    }

    /// Opens a trace into an arbitrary sink; used by tests and tooling.
    pub fn open_sink(&mut self, sink: impl Write + Send + 'static, title_id: u32) {
        match TraceWriter::new(Box::new(sink) as BoxedSink, title_id) {
            Ok(writer) => self.writer = Some(writer),
            Err(err) => warn!("failed to open trace sink: {err}"),
        }
    }

    pub fn close(&mut self) {
        if let Some(writer) = self.writer.take() {
            if let Err(err) = writer.finish() {
                warn!("failed to finalize trace: {err}");
            }
        }
    }

    pub fn flush(&mut self) {
        self.record(TraceWriter::flush);
    }

    pub fn write_packet_start(&mut self, guest_ptr: u32, word_count: u32) {
        self.record(|writer| writer.write_packet_start(guest_ptr, word_count));
    }

    pub fn write_packet_end(&mut self) {
        self.record(TraceWriter::write_packet_end);
    }

    pub fn write_memory_read(&mut self, guest_ptr: u32, length_bytes: u32) {
        self.record(|writer| writer.write_memory_read(guest_ptr, length_bytes));
    }

    pub fn write_memory_write(&mut self, guest_ptr: u32, length_bytes: u32) {
        self.record(|writer| writer.write_memory_write(guest_ptr, length_bytes));
    }

    pub fn write_indirect_buffer_start(&mut self, guest_ptr: u32, length_bytes: u32) {
        self.record(|writer| writer.write_indirect_buffer_start(guest_ptr, length_bytes));
    }

    pub fn write_indirect_buffer_end(&mut self) {
        self.record(TraceWriter::write_indirect_buffer_end);
    }

    pub fn write_event(&mut self, kind: EventKind) {
        self.record(|writer| writer.write_event(kind));
    }

    fn record(
        &mut self,
        op: impl FnOnce(&mut TraceWriter<BoxedSink>) -> Result<(), TraceWriteError>,
    ) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        if let Err(err) = op(writer) {
            warn!("trace write failed, disabling capture: {err}");
            self.writer = None;
        }
    }
}

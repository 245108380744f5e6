use crate::format::{EventKind, RecordType, CONTAINER_VERSION, TRACE_MAGIC};
use std::fmt;
use std::io::{self, Write};

#[derive(Debug)]
pub enum TraceWriteError {
    Io(io::Error),
    /// A `PacketEnd` record with no open `PacketStart`.
    UnbalancedPacketEnd,
    /// An `IndirectBufferEnd` record with no open `IndirectBufferStart`.
    UnbalancedIndirectBufferEnd,
}

impl fmt::Display for TraceWriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceWriteError::Io(err) => write!(f, "trace i/o error: {err}"),
            TraceWriteError::UnbalancedPacketEnd => {
                write!(f, "packet end record without a matching packet start")
            }
            TraceWriteError::UnbalancedIndirectBufferEnd => {
                write!(f, "indirect buffer end record without a matching start")
            }
        }
    }
}

impl std::error::Error for TraceWriteError {}

impl From<io::Error> for TraceWriteError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Append-only trace record sink.
///
/// The writer enforces the nesting contract at the point of emission: packet
/// start/end records must pair, and indirect-buffer start/end records raise a
/// logical nesting level without breaking that pairing.
pub struct TraceWriter<W: Write> {
    sink: W,
    packet_depth: u32,
    indirect_depth: u32,
}

impl<W: Write> TraceWriter<W> {
    /// Creates a writer and emits the container header.
    pub fn new(mut sink: W, title_id: u32) -> Result<Self, TraceWriteError> {
        sink.write_all(&TRACE_MAGIC)?;
        sink.write_all(&CONTAINER_VERSION.to_le_bytes())?;
        sink.write_all(&title_id.to_le_bytes())?;
        sink.write_all(&0u32.to_le_bytes())?; // flags
        sink.write_all(&0u32.to_le_bytes())?; // reserved
        Ok(Self {
            sink,
            packet_depth: 0,
            indirect_depth: 0,
        })
    }

    fn write_record(
        &mut self,
        record_type: RecordType,
        payload: &[u8],
    ) -> Result<(), TraceWriteError> {
        debug_assert!(payload.len() <= u16::MAX as usize);
        self.sink.write_all(&[record_type as u8, 0])?;
        self.sink.write_all(&(payload.len() as u16).to_le_bytes())?;
        self.sink.write_all(payload)?;
        Ok(())
    }

    pub fn write_packet_start(
        &mut self,
        guest_ptr: u32,
        word_count: u32,
    ) -> Result<(), TraceWriteError> {
        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&guest_ptr.to_le_bytes());
        payload[4..].copy_from_slice(&word_count.to_le_bytes());
        self.write_record(RecordType::PacketStart, &payload)?;
        self.packet_depth += 1;
        Ok(())
    }

    pub fn write_packet_end(&mut self) -> Result<(), TraceWriteError> {
        if self.packet_depth == 0 {
            return Err(TraceWriteError::UnbalancedPacketEnd);
        }
        self.write_record(RecordType::PacketEnd, &[])?;
        self.packet_depth -= 1;
        Ok(())
    }

    pub fn write_memory_read(
        &mut self,
        guest_ptr: u32,
        length_bytes: u32,
    ) -> Result<(), TraceWriteError> {
        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&guest_ptr.to_le_bytes());
        payload[4..].copy_from_slice(&length_bytes.to_le_bytes());
        self.write_record(RecordType::MemoryRead, &payload)
    }

    pub fn write_memory_write(
        &mut self,
        guest_ptr: u32,
        length_bytes: u32,
    ) -> Result<(), TraceWriteError> {
        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&guest_ptr.to_le_bytes());
        payload[4..].copy_from_slice(&length_bytes.to_le_bytes());
        self.write_record(RecordType::MemoryWrite, &payload)
    }

    pub fn write_indirect_buffer_start(
        &mut self,
        guest_ptr: u32,
        length_bytes: u32,
    ) -> Result<(), TraceWriteError> {
        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&guest_ptr.to_le_bytes());
        payload[4..].copy_from_slice(&length_bytes.to_le_bytes());
        self.write_record(RecordType::IndirectBufferStart, &payload)?;
        self.indirect_depth += 1;
        Ok(())
    }

    pub fn write_indirect_buffer_end(&mut self) -> Result<(), TraceWriteError> {
        if self.indirect_depth == 0 {
            return Err(TraceWriteError::UnbalancedIndirectBufferEnd);
        }
        self.write_record(RecordType::IndirectBufferEnd, &[])?;
        self.indirect_depth -= 1;
        Ok(())
    }

    pub fn write_event(&mut self, kind: EventKind) -> Result<(), TraceWriteError> {
        self.write_record(RecordType::Event, &(kind as u32).to_le_bytes())
    }

    pub fn flush(&mut self) -> Result<(), TraceWriteError> {
        self.sink.flush()?;
        Ok(())
    }

    /// Flushes and returns the underlying sink.
    pub fn finish(mut self) -> Result<W, TraceWriteError> {
        self.sink.flush()?;
        Ok(self.sink)
    }
}

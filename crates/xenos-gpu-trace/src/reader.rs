use crate::format::{
    EventKind, RecordType, TraceHeader, CONTAINER_VERSION, RECORD_HEADER_SIZE, TRACE_HEADER_SIZE,
    TRACE_MAGIC,
};

#[derive(Debug, PartialEq, Eq)]
pub enum TraceReadError {
    InvalidMagic,
    /// The trace's `container_version` is newer than this reader understands.
    ///
    /// Older versions are accepted best-effort; newer versions are rejected
    /// deterministically before any version-specific field is interpreted.
    UnsupportedContainerVersion(u32),
    TruncatedHeader,
    TruncatedRecord,
    /// Packet or indirect-buffer start/end records do not pair.
    UnbalancedNesting,
}

impl std::fmt::Display for TraceReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceReadError::InvalidMagic => write!(f, "invalid trace magic"),
            TraceReadError::UnsupportedContainerVersion(version) => {
                write!(f, "unsupported trace container version {version}")
            }
            TraceReadError::TruncatedHeader => write!(f, "truncated trace header"),
            TraceReadError::TruncatedRecord => write!(f, "truncated trace record"),
            TraceReadError::UnbalancedNesting => {
                write!(f, "packet start/end records do not pair")
            }
        }
    }
}

impl std::error::Error for TraceReadError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceRecord {
    PacketStart { guest_ptr: u32, word_count: u32 },
    PacketEnd,
    MemoryRead { guest_ptr: u32, length_bytes: u32 },
    MemoryWrite { guest_ptr: u32, length_bytes: u32 },
    IndirectBufferStart { guest_ptr: u32, length_bytes: u32 },
    IndirectBufferEnd,
    /// An event record whose kind this reader does not know is surfaced raw.
    Event { kind: u32 },
    /// A record type from a newer writer; skipped via its payload length.
    Unknown { record_type: u8 },
}

impl TraceRecord {
    pub fn event_kind(&self) -> Option<EventKind> {
        match self {
            TraceRecord::Event { kind } => EventKind::from_u32(*kind),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct Trace {
    pub header: TraceHeader,
    pub records: Vec<TraceRecord>,
}

impl Trace {
    /// Parses a complete in-memory trace.
    pub fn parse(bytes: &[u8]) -> Result<Self, TraceReadError> {
        if bytes.len() < TRACE_HEADER_SIZE as usize {
            return Err(TraceReadError::TruncatedHeader);
        }
        if bytes[..8] != TRACE_MAGIC {
            return Err(TraceReadError::InvalidMagic);
        }
        let container_version = read_u32_le(bytes, 8);
        if container_version > CONTAINER_VERSION {
            return Err(TraceReadError::UnsupportedContainerVersion(
                container_version,
            ));
        }
        let header = TraceHeader {
            container_version,
            title_id: read_u32_le(bytes, 12),
            flags: read_u32_le(bytes, 16),
        };

        let mut records = Vec::new();
        let mut offset = TRACE_HEADER_SIZE as usize;
        while offset < bytes.len() {
            if bytes.len() - offset < RECORD_HEADER_SIZE as usize {
                return Err(TraceReadError::TruncatedRecord);
            }
            let record_type = bytes[offset];
            let payload_len = u16::from_le_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize;
            let payload_start = offset + RECORD_HEADER_SIZE as usize;
            let payload_end = payload_start + payload_len;
            if payload_end > bytes.len() {
                return Err(TraceReadError::TruncatedRecord);
            }
            let payload = &bytes[payload_start..payload_end];
            records.push(decode_record(record_type, payload)?);
            offset = payload_end;
        }

        Ok(Self { header, records })
    }

    /// Validates that packet and indirect-buffer records nest recoverably.
    ///
    /// Packet start/end must pair within each indirect-buffer level, and every
    /// level opened must be closed.
    pub fn check_nesting(&self) -> Result<(), TraceReadError> {
        // Packet depth per indirect-buffer level; the last entry is the
        // current level.
        let mut depth_stack = vec![0u32];
        for record in &self.records {
            match record {
                TraceRecord::PacketStart { .. } => {
                    *depth_stack.last_mut().expect("stack never empty") += 1;
                }
                TraceRecord::PacketEnd => {
                    let depth = depth_stack.last_mut().expect("stack never empty");
                    if *depth == 0 {
                        return Err(TraceReadError::UnbalancedNesting);
                    }
                    *depth -= 1;
                }
                TraceRecord::IndirectBufferStart { .. } => depth_stack.push(0),
                TraceRecord::IndirectBufferEnd => {
                    let depth = depth_stack.pop().expect("stack never empty");
                    if depth != 0 || depth_stack.is_empty() {
                        return Err(TraceReadError::UnbalancedNesting);
                    }
                }
                _ => {}
            }
        }
        if depth_stack.len() != 1 || depth_stack[0] != 0 {
            return Err(TraceReadError::UnbalancedNesting);
        }
        Ok(())
    }
}

fn decode_record(record_type: u8, payload: &[u8]) -> Result<TraceRecord, TraceReadError> {
    let ptr_len = |payload: &[u8]| -> Result<(u32, u32), TraceReadError> {
        if payload.len() < 8 {
            return Err(TraceReadError::TruncatedRecord);
        }
        Ok((read_u32_le(payload, 0), read_u32_le(payload, 4)))
    };

    Ok(match RecordType::from_u8(record_type) {
        Some(RecordType::PacketStart) => {
            let (guest_ptr, word_count) = ptr_len(payload)?;
            TraceRecord::PacketStart {
                guest_ptr,
                word_count,
            }
        }
        Some(RecordType::PacketEnd) => TraceRecord::PacketEnd,
        Some(RecordType::MemoryRead) => {
            let (guest_ptr, length_bytes) = ptr_len(payload)?;
            TraceRecord::MemoryRead {
                guest_ptr,
                length_bytes,
            }
        }
        Some(RecordType::MemoryWrite) => {
            let (guest_ptr, length_bytes) = ptr_len(payload)?;
            TraceRecord::MemoryWrite {
                guest_ptr,
                length_bytes,
            }
        }
        Some(RecordType::IndirectBufferStart) => {
            let (guest_ptr, length_bytes) = ptr_len(payload)?;
            TraceRecord::IndirectBufferStart {
                guest_ptr,
                length_bytes,
            }
        }
        Some(RecordType::IndirectBufferEnd) => TraceRecord::IndirectBufferEnd,
        Some(RecordType::Event) => {
            if payload.len() < 4 {
                return Err(TraceReadError::TruncatedRecord);
            }
            TraceRecord::Event {
                kind: read_u32_le(payload, 0),
            }
        }
        None => TraceRecord::Unknown { record_type },
    })
}

fn read_u32_le(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().expect("length checked"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::TraceWriter;
    use pretty_assertions::assert_eq;

    fn write_sample() -> Vec<u8> {
        let mut writer = TraceWriter::new(Vec::new(), 0x415607F2).unwrap();
        writer.write_packet_start(0x1000, 3).unwrap();
        writer.write_memory_write(0x2000, 8).unwrap();
        writer.write_packet_end().unwrap();
        writer.write_packet_start(0x100C, 2).unwrap();
        writer.write_indirect_buffer_start(0x3000, 0x40).unwrap();
        writer.write_packet_start(0x3000, 1).unwrap();
        writer.write_packet_end().unwrap();
        writer.write_indirect_buffer_end().unwrap();
        writer.write_packet_end().unwrap();
        writer.write_event(EventKind::Swap).unwrap();
        writer.finish().unwrap()
    }

    #[test]
    fn round_trips_records() {
        let bytes = write_sample();
        let trace = Trace::parse(&bytes).unwrap();
        assert_eq!(trace.header.title_id, 0x415607F2);
        assert_eq!(trace.header.container_version, CONTAINER_VERSION);
        assert_eq!(
            trace.records,
            vec![
                TraceRecord::PacketStart {
                    guest_ptr: 0x1000,
                    word_count: 3
                },
                TraceRecord::MemoryWrite {
                    guest_ptr: 0x2000,
                    length_bytes: 8
                },
                TraceRecord::PacketEnd,
                TraceRecord::PacketStart {
                    guest_ptr: 0x100C,
                    word_count: 2
                },
                TraceRecord::IndirectBufferStart {
                    guest_ptr: 0x3000,
                    length_bytes: 0x40
                },
                TraceRecord::PacketStart {
                    guest_ptr: 0x3000,
                    word_count: 1
                },
                TraceRecord::PacketEnd,
                TraceRecord::IndirectBufferEnd,
                TraceRecord::PacketEnd,
                TraceRecord::Event { kind: 1 },
            ]
        );
        trace.check_nesting().unwrap();
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = write_sample();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            Trace::parse(&bytes),
            Err(TraceReadError::InvalidMagic)
        ));
    }

    #[test]
    fn rejects_newer_container_version() {
        let mut bytes = write_sample();
        bytes[8..12].copy_from_slice(&(CONTAINER_VERSION + 1).to_le_bytes());
        match Trace::parse(&bytes) {
            Err(TraceReadError::UnsupportedContainerVersion(version)) => {
                assert_eq!(version, CONTAINER_VERSION + 1);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn skips_unknown_record_types() {
        let mut bytes = write_sample();
        // Append a record with an unknown type and a 4-byte payload.
        bytes.extend_from_slice(&[0x7F, 0, 4, 0]);
        bytes.extend_from_slice(&0xDEADBEEFu32.to_le_bytes());
        let trace = Trace::parse(&bytes).unwrap();
        assert_eq!(
            trace.records.last(),
            Some(&TraceRecord::Unknown { record_type: 0x7F })
        );
        trace.check_nesting().unwrap();
    }

    #[test]
    fn writer_rejects_unbalanced_packet_end() {
        let mut writer = TraceWriter::new(Vec::new(), 0).unwrap();
        assert!(matches!(
            writer.write_packet_end(),
            Err(crate::writer::TraceWriteError::UnbalancedPacketEnd)
        ));
    }

    #[test]
    fn detects_unbalanced_nesting() {
        let mut writer = TraceWriter::new(Vec::new(), 0).unwrap();
        writer.write_packet_start(0, 1).unwrap();
        let bytes = writer.finish().unwrap();
        let trace = Trace::parse(&bytes).unwrap();
        assert_eq!(trace.check_nesting(), Err(TraceReadError::UnbalancedNesting));
    }
}

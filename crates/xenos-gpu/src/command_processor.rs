//! PM4 command-stream interpreter.
//!
//! The processor consumes a guest-authored ring of big-endian 32-bit words,
//! decodes each header into a Type-0/1/2/3 packet, drives the register file,
//! mutates guest memory, and forwards draw/swap requests to the backend.
//!
//! The interpreter runs on a single dedicated worker and is not internally
//! parallel; only `WAIT_REG_MEM` may block, cooperatively. Every handler
//! returns an explicit success flag and leaves the ring reader at a
//! well-defined offset — a Type-3 packet always consumes exactly the number
//! of payload words its header declares.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, warn};
use xenos_gpu_trace::EventKind;

use crate::backend::{Config, GpuBackend, ShaderHandle};
use crate::draw::IndexBufferInfo;
use crate::guest_memory::GuestMemory;
use crate::opcodes::Pm4Opcode;
use crate::register_file::{classify, ConstantBank, RegisterFile};
use crate::registers;
use crate::registers::{PaScVizQuery, VgtDmaSize, VgtDrawInitiator};
use crate::ring_buffer::RingReader;
use crate::trace::{trace_file_name, TraceMode, TraceRecorder};
use crate::xenos::{
    gpu_swap, is_major_mode_explicit, DepthSampleCounts, Endian, PrimitiveType, ShaderType,
    SourceSelect, QUERY_FINISHED_SENTINEL, SWAP_SIGNATURE, TEXTURE_2D_CUBE_MAX_WIDTH_HEIGHT,
    VIZQUERY_END, VIZQUERY_START,
};

/// Indirect-buffer nesting bound. Real streams nest one or two deep; the cap
/// keeps a malicious stream from exhausting the worker.
const MAX_INDIRECT_DEPTH: u32 = 8;

/// Evaluates the `WAIT_REG_MEM` / `COND_WRITE` comparison encoded in the low
/// 3 bits of `wait_info`.
pub(crate) fn match_value_and_ref(value: u32, reference: u32, wait_info: u32) -> bool {
    match wait_info & 0x7 {
        0x0 => false,
        0x1 => value < reference,
        0x2 => value <= reference,
        0x3 => value == reference,
        0x4 => value != reference,
        0x5 => value >= reference,
        0x6 => value > reference,
        _ => true,
    }
}

pub struct CommandProcessor<M: GuestMemory, B: GpuBackend> {
    memory: M,
    backend: B,
    config: Config,

    registers: RegisterFile,
    reader: RingReader,

    bin_select: u64,
    bin_mask: u64,

    /// Micro-engine program uploaded by `ME_INIT`, retained for debug.
    me_bin: Vec<u32>,
    /// Frames presented so far; written back by `EVENT_WRITE_SHD`.
    swap_count: u32,

    active_vertex_shader: Option<ShaderHandle>,
    active_pixel_shader: Option<ShaderHandle>,

    trace: TraceRecorder,
    trace_state: TraceMode,

    worker_running: Arc<AtomicBool>,
    indirect_depth: u32,
}

impl<M: GuestMemory, B: GpuBackend> CommandProcessor<M, B> {
    pub fn new(memory: M, backend: B, config: Config) -> Self {
        let mut trace = TraceRecorder::disabled();
        if config.trace_mode == TraceMode::Streaming {
            let path = config
                .trace_dir
                .join(format!("{:08X}_stream.xtr", config.title_id));
            if let Err(err) = trace.open_file(&path, config.title_id) {
                warn!("failed to open streaming trace {}: {err}", path.display());
            }
        }
        let trace_state = config.trace_mode;
        Self {
            memory,
            backend,
            config,
            registers: RegisterFile::new(),
            // Replaced by `initialize_ring_buffer`; a minimal placeholder
            // keeps the cursor arithmetic well-defined until then.
            reader: RingReader::new(0, 0x1_0000),
            bin_select: 0xFFFF_FFFF,
            bin_mask: 0xFFFF_FFFF,
            me_bin: Vec::new(),
            swap_count: 0,
            active_vertex_shader: None,
            active_pixel_shader: None,
            trace,
            trace_state,
            worker_running: Arc::new(AtomicBool::new(true)),
            indirect_depth: 0,
        }
    }

    /// Installs the primary ring window. `size_bytes` must be a power of two.
    pub fn initialize_ring_buffer(&mut self, base: u32, size_bytes: u32) {
        debug_assert!(size_bytes.is_power_of_two());
        self.reader = RingReader::new(base, size_bytes);
    }

    /// Publishes the guest's new write offset into the primary ring.
    pub fn update_write_offset(&mut self, offset_bytes: u32) {
        self.reader.set_write_offset(offset_bytes);
    }

    /// Cooperative stop flag checked inside `WAIT_REG_MEM` polling. Clear it
    /// from another thread to unwind a stuck wait.
    pub fn worker_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.worker_running)
    }

    /// Arms a single-frame trace capture; the file opens at the next swap.
    pub fn request_frame_trace(&mut self) {
        if self.trace_state == TraceMode::Disabled {
            self.trace_state = TraceMode::SingleFrame;
        }
    }

    /// Starts streaming trace records into `sink` immediately.
    pub fn begin_trace_capture(&mut self, sink: impl std::io::Write + Send + 'static) {
        self.trace.open_sink(sink, self.config.title_id);
        self.trace_state = TraceMode::Streaming;
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn registers(&self) -> &RegisterFile {
        &self.registers
    }

    pub fn reader(&self) -> &RingReader {
        &self.reader
    }

    pub fn bin_mask(&self) -> u64 {
        self.bin_mask
    }

    pub fn bin_select(&self) -> u64 {
        self.bin_select
    }

    pub fn swap_count(&self) -> u32 {
        self.swap_count
    }

    pub fn active_vertex_shader(&self) -> Option<ShaderHandle> {
        self.active_vertex_shader
    }

    pub fn active_pixel_shader(&self) -> Option<ShaderHandle> {
        self.active_pixel_shader
    }

    /// Executes packets until the ring drains or a packet fails.
    pub fn execute_pending(&mut self) -> bool {
        self.reader.prefetch_read_window(self.reader.read_count());
        while self.reader.read_count() != 0 {
            if !self.execute_packet() {
                return false;
            }
        }
        true
    }

    /// Decodes and executes one packet at the read cursor.
    pub fn execute_packet(&mut self) -> bool {
        let header_addr = self.reader.current_address();
        let packet = self.read_and_swap();

        if packet == 0 || packet == 0x0BAD_F00D {
            // Stuffing/bad packet: record an empty one-word packet and move on.
            self.trace.write_packet_start(header_addr, 1);
            self.trace.write_packet_end();
            return true;
        }
        if packet == 0xCDCD_CDCD {
            warn!("GPU packet is CDCDCDCD - probably read uninitialized memory!");
        }

        match packet >> 30 {
            0 => self.execute_packet_type0(packet, header_addr),
            1 => self.execute_packet_type1(packet, header_addr),
            2 => self.execute_packet_type2(header_addr),
            _ => self.execute_packet_type3(packet, header_addr),
        }
    }

    // ------------------------------------------------------------------
    // Ring and guest memory plumbing.

    /// Reads the next ring word, big-endian in guest memory, into host order.
    fn read_and_swap(&mut self) -> u32 {
        let mut bytes = [0u8; 4];
        if let Err(err) = self.memory.read(self.reader.current_address(), &mut bytes) {
            // The ring window was validated at install time; reaching this
            // means the embedder's memory map shrank under us.
            error!("ring read failed: {err}");
        }
        self.reader.advance(4);
        u32::from_be_bytes(bytes)
    }

    /// Guest memory gateway: 32-bit read honoring the address-encoded swap
    /// mode, with trace emission.
    fn mem_read_u32(&mut self, guest_addr: u32, endian: Endian) -> u32 {
        debug_assert_eq!(guest_addr & 0x3, 0);
        let mut bytes = [0u8; 4];
        if let Err(err) = self.memory.read(guest_addr, &mut bytes) {
            warn!("guest memory read dropped: {err}");
            return 0;
        }
        self.trace.write_memory_read(guest_addr, 4);
        gpu_swap(u32::from_le_bytes(bytes), endian)
    }

    /// Guest memory gateway: 32-bit write honoring the address-encoded swap
    /// mode, with trace emission.
    fn mem_write_u32(&mut self, guest_addr: u32, value: u32, endian: Endian) {
        debug_assert_eq!(guest_addr & 0x3, 0);
        let swapped = gpu_swap(value, endian);
        if let Err(err) = self.memory.write(guest_addr, &swapped.to_le_bytes()) {
            warn!("guest memory write dropped: {err}");
            return;
        }
        self.trace.write_memory_write(guest_addr, 4);
    }

    /// Reads `count_dwords` big-endian words from guest memory.
    fn read_guest_words(&self, guest_addr: u32, count_dwords: u32) -> Vec<u32> {
        let mut bytes = vec![0u8; count_dwords as usize * 4];
        if let Err(err) = self.memory.read(guest_addr, &mut bytes) {
            warn!("guest block read dropped: {err}");
        }
        bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_be_bytes(chunk.try_into().unwrap()))
            .collect()
    }

    // ------------------------------------------------------------------
    // Register file access.

    /// Single funnel for register writes; reports side-effecting classes to
    /// the backend hook.
    pub fn write_register(&mut self, index: u32, value: u32) {
        if index as usize >= registers::REGISTER_COUNT {
            warn!("dropping write to out-of-range register 0x{index:04X}");
            return;
        }
        self.registers.set(index, value);
        if let Some(class) = classify(index) {
            self.backend.register_written(class, index, value);
        }
    }

    /// Register read as seen by the command stream. `COHER_STATUS_HOST` is
    /// settled through the backend before the value is returned.
    pub fn read_register(&mut self, index: u32) -> u32 {
        if index == registers::COHER_STATUS_HOST {
            self.backend.make_coherent();
        }
        self.registers.get(index)
    }

    fn write_register_range_from_ring(&mut self, base: u32, count: u32) {
        for i in 0..count {
            let value = self.read_and_swap();
            self.write_register(base + i, value);
        }
    }

    fn write_one_register_from_ring(&mut self, index: u32, count: u32) {
        for _ in 0..count {
            let value = self.read_and_swap();
            self.write_register(index, value);
        }
    }

    fn write_bank_range_from_ring(&mut self, bank: ConstantBank, index: u32, count: u32) {
        self.write_register_range_from_ring(bank.base() + index, count);
    }

    fn write_bank_range_from_mem(&mut self, bank: ConstantBank, index: u32, dwords: &[u32]) {
        for (i, &value) in dwords.iter().enumerate() {
            self.write_register(bank.base() + index + i as u32, value);
        }
    }

    /// Event initiator writes bypass the side-effect funnel; downstream
    /// blocks poll the register directly.
    fn write_event_initiator(&mut self, value: u32) {
        self.registers.set(registers::VGT_EVENT_INITIATOR, value);
    }

    // ------------------------------------------------------------------
    // Packet decode.

    fn execute_packet_type0(&mut self, packet: u32, header_addr: u32) -> bool {
        // Write `count` words to the register range starting at `base_index`,
        // or `count` words into the single register `base_index`.
        let count = ((packet >> 16) & 0x3FFF) + 1;
        if self.reader.read_count() < count * 4 {
            error!(
                "ExecutePacketType0 overflow (read count {:08X}, packet count {:08X})",
                self.reader.read_count(),
                count * 4
            );
            return false;
        }

        self.trace.write_packet_start(header_addr, 1 + count);

        let base_index = packet & 0x7FFF;
        let write_one_reg = (packet >> 15) & 0x1 != 0;
        if write_one_reg {
            self.write_one_register_from_ring(base_index, count);
        } else {
            self.write_register_range_from_ring(base_index, count);
        }

        self.trace.write_packet_end();
        true
    }

    fn execute_packet_type1(&mut self, packet: u32, header_addr: u32) -> bool {
        // Two registers of data; Type-0 is the common form.
        self.trace.write_packet_start(header_addr, 3);
        let reg_index_1 = packet & 0x7FF;
        let reg_index_2 = (packet >> 11) & 0x7FF;
        let reg_data_1 = self.read_and_swap();
        let reg_data_2 = self.read_and_swap();
        self.write_register(reg_index_1, reg_data_1);
        self.write_register(reg_index_2, reg_data_2);
        self.trace.write_packet_end();
        true
    }

    fn execute_packet_type2(&mut self, header_addr: u32) -> bool {
        // Structural no-op; occupies one word.
        self.trace.write_packet_start(header_addr, 1);
        self.trace.write_packet_end();
        true
    }

    fn execute_packet_type3(&mut self, packet: u32, header_addr: u32) -> bool {
        let opcode_raw = (packet >> 8) & 0x7F;
        let count = ((packet >> 16) & 0x3FFF) + 1;
        let data_start_offset = self.reader.read_offset();

        if self.reader.read_count() < count * 4 {
            error!(
                "ExecutePacketType3 overflow (read count {:08X}, packet count {:08X})",
                self.reader.read_count(),
                count * 4
            );
            return false;
        }

        let opcode = Pm4Opcode::from_u32(opcode_raw);

        // Indirect buffers open their own nesting level in the trace, so only
        // the pointer/length words are declared against this packet.
        if matches!(
            opcode,
            Some(Pm4Opcode::IndirectBuffer | Pm4Opcode::IndirectBufferPfd)
        ) {
            self.trace.write_packet_start(header_addr, 2);
        } else {
            self.trace.write_packet_start(header_addr, 1 + count);
        }

        // Bit 0 predicates the packet on the bin select/mask intersection.
        // Predicated swaps are never valid and are skipped outright.
        if packet & 1 != 0 {
            let any_pass = (self.bin_select & self.bin_mask) != 0;
            if !any_pass || opcode == Some(Pm4Opcode::XeSwap) {
                self.reader.advance(count * 4);
                self.trace.write_packet_end();
                return true;
            }
        }

        let result = match opcode {
            Some(Pm4Opcode::MeInit) => self.execute_type3_me_init(count),
            Some(Pm4Opcode::Nop) => {
                self.reader.advance(count * 4);
                true
            }
            Some(Pm4Opcode::Interrupt) => self.execute_type3_interrupt(count),
            Some(Pm4Opcode::XeSwap) => self.execute_type3_xe_swap(count),
            Some(Pm4Opcode::IndirectBuffer | Pm4Opcode::IndirectBufferPfd) => {
                self.execute_type3_indirect_buffer(count)
            }
            Some(Pm4Opcode::WaitRegMem) => self.execute_type3_wait_reg_mem(count),
            Some(Pm4Opcode::RegRmw) => self.execute_type3_reg_rmw(count),
            Some(Pm4Opcode::RegToMem) => self.execute_type3_reg_to_mem(count),
            Some(Pm4Opcode::MemWrite) => self.execute_type3_mem_write(count),
            Some(Pm4Opcode::CondWrite) => self.execute_type3_cond_write(count),
            Some(Pm4Opcode::EventWrite) => self.execute_type3_event_write(count),
            Some(Pm4Opcode::EventWriteShd) => self.execute_type3_event_write_shd(count),
            Some(Pm4Opcode::EventWriteExt) => self.execute_type3_event_write_ext(count),
            Some(Pm4Opcode::EventWriteZpd) => self.execute_type3_event_write_zpd(count),
            Some(Pm4Opcode::DrawIndx) => self.execute_type3_draw_indx(count),
            Some(Pm4Opcode::DrawIndx2) => self.execute_type3_draw_indx_2(count),
            Some(Pm4Opcode::SetConstant) => self.execute_type3_set_constant(count),
            Some(Pm4Opcode::SetConstant2) | Some(Pm4Opcode::SetShaderConstants) => {
                self.execute_type3_set_constant2(count)
            }
            Some(Pm4Opcode::LoadAluConstant) => self.execute_type3_load_alu_constant(count),
            Some(Pm4Opcode::ImLoad) => self.execute_type3_im_load(count),
            Some(Pm4Opcode::ImLoadImmediate) => self.execute_type3_im_load_immediate(count),
            Some(Pm4Opcode::InvalidateState) => {
                // Selective invalidation of state pointers; nothing to do.
                let _mask = self.read_and_swap();
                true
            }
            Some(Pm4Opcode::VizQuery) => self.execute_type3_viz_query(count),
            Some(Pm4Opcode::SetBinMaskLo) => {
                let value = u64::from(self.read_and_swap());
                self.bin_mask = (self.bin_mask & 0xFFFF_FFFF_0000_0000) | value;
                true
            }
            Some(Pm4Opcode::SetBinMaskHi) => {
                let value = u64::from(self.read_and_swap());
                self.bin_mask = (self.bin_mask & 0xFFFF_FFFF) | (value << 32);
                true
            }
            Some(Pm4Opcode::SetBinSelectLo) => {
                let value = u64::from(self.read_and_swap());
                self.bin_select = (self.bin_select & 0xFFFF_FFFF_0000_0000) | value;
                true
            }
            Some(Pm4Opcode::SetBinSelectHi) => {
                let value = u64::from(self.read_and_swap());
                self.bin_select = (self.bin_select & 0xFFFF_FFFF) | (value << 32);
                true
            }
            Some(Pm4Opcode::SetBinMask) => {
                debug_assert_eq!(count, 2);
                let hi = u64::from(self.read_and_swap());
                let lo = u64::from(self.read_and_swap());
                self.bin_mask = (hi << 32) | lo;
                true
            }
            Some(Pm4Opcode::SetBinSelect) => {
                debug_assert_eq!(count, 2);
                let hi = u64::from(self.read_and_swap());
                let lo = u64::from(self.read_and_swap());
                self.bin_select = (hi << 32) | lo;
                true
            }
            Some(Pm4Opcode::ContextUpdate) => {
                debug_assert_eq!(count, 1);
                let value = self.read_and_swap();
                debug!("GPU context update = {value:08X}");
                debug_assert_eq!(value, 0);
                true
            }
            Some(Pm4Opcode::WaitForIdle) => {
                debug_assert_eq!(count, 1);
                let value = self.read_and_swap();
                debug!("GPU wait for idle = {value:08X}");
                true
            }
            None => return self.hit_unknown_opcode(opcode_raw, count),
        };

        self.trace.write_packet_end();

        if opcode == Some(Pm4Opcode::XeSwap) {
            self.update_trace_state_on_swap();
        }

        debug_assert_eq!(
            self.reader.read_offset(),
            (data_start_offset + count * 4) % self.reader.capacity(),
            "handler consumed a different word count than the packet declared"
        );
        result
    }

    fn hit_unknown_opcode(&mut self, opcode: u32, count: u32) -> bool {
        warn!("unimplemented GPU opcode 0x{opcode:02X} (count {count})");
        self.reader.advance(count * 4);
        self.trace.write_packet_end();
        false
    }

    /// Guards a fixed-payload handler against a short packet; a failing
    /// check consumes the declared payload and aborts the stream.
    fn require_words(&mut self, count: u32, needed: u32, opcode_name: &str) -> bool {
        if count < needed {
            error!("{opcode_name}: packet too small ({count} words, need {needed})");
            self.reader.advance(count * 4);
            return false;
        }
        true
    }

    fn update_trace_state_on_swap(&mut self) {
        if self.trace.is_open() {
            // Frame boundary: stamp the swap and make the file readable even
            // if the title never swaps again.
            self.trace.write_event(EventKind::Swap);
            self.trace.flush();
            if self.trace_state == TraceMode::SingleFrame {
                self.trace_state = TraceMode::Disabled;
                self.trace.close();
            }
        } else if self.trace_state == TraceMode::SingleFrame {
            // New trace request; captures begin at a frame boundary.
            let file_name = trace_file_name(self.config.title_id, self.swap_count.wrapping_sub(1));
            let path = self.config.trace_dir.join(file_name);
            if let Err(err) = self.trace.open_file(&path, self.config.title_id) {
                warn!("failed to open trace file {}: {err}", path.display());
                self.trace_state = TraceMode::Disabled;
            }
        }
    }

    // ------------------------------------------------------------------
    // Type-3 handlers.

    fn execute_type3_me_init(&mut self, count: u32) -> bool {
        self.me_bin.clear();
        self.me_bin.reserve(count as usize);
        for _ in 0..count {
            let word = self.read_and_swap();
            self.me_bin.push(word);
        }
        true
    }

    fn execute_type3_interrupt(&mut self, count: u32) -> bool {
        debug_assert_eq!(count, 1);
        // Generate an interrupt from the command stream.
        let cpu_mask = self.read_and_swap();
        for cpu in 0..6 {
            if cpu_mask & (1 << cpu) != 0 {
                self.backend.dispatch_interrupt(1, cpu);
            }
        }
        true
    }

    fn execute_type3_xe_swap(&mut self, count: u32) -> bool {
        // VdSwap posts this packet; only the first four words carry data.
        if !self.require_words(count, 4, "PM4_XE_SWAP") {
            return false;
        }
        let magic = self.read_and_swap();
        if magic != SWAP_SIGNATURE {
            warn!("XE_SWAP packet without swap signature (got {magic:08X})");
        }

        let frontbuffer_ptr = self.read_and_swap();
        let frontbuffer_width = self.read_and_swap();
        let frontbuffer_height = self.read_and_swap();
        self.reader.advance((count - 4) * 4);

        self.backend
            .issue_swap(frontbuffer_ptr, frontbuffer_width, frontbuffer_height);
        self.swap_count = self.swap_count.wrapping_add(1);
        true
    }

    fn execute_type3_indirect_buffer(&mut self, count: u32) -> bool {
        if !self.require_words(count, 2, "PM4_INDIRECT_BUFFER") {
            return false;
        }
        let list_ptr = self.read_and_swap();
        let raw_length = self.read_and_swap();
        if count > 2 {
            self.reader.advance((count - 2) * 4);
        }
        debug_assert_eq!(raw_length & !0xF_FFFF, 0);
        let list_length = raw_length & 0xF_FFFF;
        self.execute_indirect_buffer(list_ptr, list_length)
    }

    fn execute_indirect_buffer(&mut self, list_ptr: u32, count_words: u32) -> bool {
        if count_words == 0 {
            return true;
        }
        if self.indirect_depth >= MAX_INDIRECT_DEPTH {
            error!("indirect buffer nesting exceeds {MAX_INDIRECT_DEPTH}, dropping");
            return false;
        }

        self.trace
            .write_indirect_buffer_start(list_ptr, count_words * 4);

        let saved_reader = self.reader;
        self.indirect_depth += 1;
        self.reader = RingReader::new(list_ptr, count_words * 4);
        self.reader.prefetch_read_window(count_words * 4);

        loop {
            if !self.execute_packet() {
                // A bad packet terminates this buffer only.
                error!("indirect ring buffer: failed to execute packet");
                break;
            }
            if self.reader.read_count() == 0 {
                break;
            }
        }

        // Restored on every exit path so the caller's packet accounting holds.
        self.reader = saved_reader;
        self.indirect_depth -= 1;
        self.trace.write_indirect_buffer_end();
        true
    }

    fn execute_type3_wait_reg_mem(&mut self, count: u32) -> bool {
        // Wait until a register or memory location matches a reference.
        if !self.require_words(count, 5, "PM4_WAIT_REG_MEM") {
            return false;
        }
        let wait_info = self.read_and_swap();
        let poll_addr = self.read_and_swap();
        let reference = self.read_and_swap();
        let mask = self.read_and_swap();
        let wait = self.read_and_swap();

        loop {
            let value = if wait_info & 0x10 != 0 {
                let endianness = Endian::from_address(poll_addr);
                self.mem_read_u32(poll_addr & !0x3, endianness)
            } else {
                debug_assert!((poll_addr as usize) < registers::REGISTER_COUNT);
                self.read_register(poll_addr)
            };
            if match_value_and_ref(value & mask, reference, wait_info) {
                break;
            }

            if !self.worker_running.load(Ordering::Relaxed) {
                // Short-circuited exit.
                return false;
            }
            if wait >= 0x100 {
                self.backend.prepare_for_wait();
                if self.config.vsync {
                    thread::sleep(Duration::from_millis(u64::from(wait / 0x100)));
                } else {
                    // User wants it fast and dangerous.
                    thread::yield_now();
                }
                self.backend.return_from_wait();
                if !self.worker_running.load(Ordering::Relaxed) {
                    return false;
                }
            } else {
                thread::yield_now();
            }
        }
        true
    }

    fn execute_type3_reg_rmw(&mut self, count: u32) -> bool {
        // Register read/modify/write, used during shader upload and EDRAM
        // setup.
        if !self.require_words(count, 3, "PM4_REG_RMW") {
            return false;
        }
        let rmw_info = self.read_and_swap();
        let and_operand = self.read_and_swap();
        let or_operand = self.read_and_swap();

        let mut value = self.registers.get(rmw_info & 0x1FFF);
        value &= if (rmw_info >> 31) & 0x1 != 0 {
            self.registers.get(and_operand & 0x1FFF)
        } else {
            and_operand
        };
        value |= if (rmw_info >> 30) & 0x1 != 0 {
            self.registers.get(or_operand & 0x1FFF)
        } else {
            or_operand
        };
        self.write_register(rmw_info & 0x1FFF, value);
        true
    }

    fn execute_type3_reg_to_mem(&mut self, count: u32) -> bool {
        if !self.require_words(count, 2, "PM4_REG_TO_MEM") {
            return false;
        }
        let reg_addr = self.read_and_swap();
        let mem_addr = self.read_and_swap();

        debug_assert!((reg_addr as usize) < registers::REGISTER_COUNT);
        let reg_value = self.registers.get(reg_addr);

        let endianness = Endian::from_address(mem_addr);
        self.mem_write_u32(mem_addr & !0x3, reg_value, endianness);
        true
    }

    fn execute_type3_mem_write(&mut self, count: u32) -> bool {
        let base_addr = self.read_and_swap();
        let endianness = Endian::from_address(base_addr);
        let mut addr = base_addr & !0x3;
        for _ in 0..count - 1 {
            let data = self.read_and_swap();
            self.mem_write_u32(addr, data, endianness);
            addr = addr.wrapping_add(4);
        }
        true
    }

    fn execute_type3_cond_write(&mut self, count: u32) -> bool {
        // Conditional write to memory or a register.
        if !self.require_words(count, 6, "PM4_COND_WRITE") {
            return false;
        }
        let wait_info = self.read_and_swap();
        let poll_addr = self.read_and_swap();
        let reference = self.read_and_swap();
        let mask = self.read_and_swap();
        let write_addr = self.read_and_swap();
        let write_data = self.read_and_swap();

        let value = if wait_info & 0x10 != 0 {
            let endianness = Endian::from_address(poll_addr);
            self.mem_read_u32(poll_addr & !0x3, endianness)
        } else {
            debug_assert!((poll_addr as usize) < registers::REGISTER_COUNT);
            self.registers.get(poll_addr)
        };

        if match_value_and_ref(value & mask, reference, wait_info) {
            if wait_info & 0x100 != 0 {
                let endianness = Endian::from_address(write_addr);
                self.mem_write_u32(write_addr & !0x3, write_data, endianness);
            } else {
                self.write_register(write_addr, write_data);
            }
        }
        true
    }

    fn execute_type3_event_write(&mut self, count: u32) -> bool {
        // Writeback initiator.
        let initiator = self.read_and_swap();
        self.write_event_initiator(initiator & 0x3F);
        if count > 1 {
            // The payload-carrying form is unobserved in real titles and its
            // semantics are undocumented.
            debug_assert!(false, "EVENT_WRITE with extra payload");
            self.reader.advance((count - 1) * 4);
        }
        true
    }

    fn execute_type3_event_write_shd(&mut self, count: u32) -> bool {
        // Generate a VS|PS_done event.
        if !self.require_words(count, 3, "PM4_EVENT_WRITE_SHD") {
            return false;
        }
        let initiator = self.read_and_swap();
        let address = self.read_and_swap();
        let value = self.read_and_swap();

        self.write_event_initiator(initiator & 0x3F);
        let data_value = if (initiator >> 31) & 0x1 != 0 {
            // Write the vblank-style frame counter.
            self.swap_count
        } else {
            value
        };
        let endianness = Endian::from_address(address);
        self.mem_write_u32(address & !0x3, data_value, endianness);
        true
    }

    fn execute_type3_event_write_ext(&mut self, count: u32) -> bool {
        // Generate a screen extent event: tells the driver the xy region
        // affected by previous draws. Faked as the full texture bounds.
        if !self.require_words(count, 2, "PM4_EVENT_WRITE_EXT") {
            return false;
        }
        let initiator = self.read_and_swap();
        let address_raw = self.read_and_swap();
        self.write_event_initiator(initiator & 0x3F);

        let endianness = Endian::from_address(address_raw);
        let address = address_raw & !0x3;
        debug_assert_eq!(endianness, Endian::Format8in16);

        let max_extent = (TEXTURE_2D_CUBE_MAX_WIDTH_HEIGHT >> 3) as u16;
        // min/max x, min/max y, min/max z.
        let extents: [u16; 6] = [0, max_extent, 0, max_extent, 0, 1];
        let mut bytes = [0u8; 12];
        for (i, extent) in extents.iter().enumerate() {
            bytes[i * 2..i * 2 + 2].copy_from_slice(&extent.to_be_bytes());
        }
        if let Err(err) = self.memory.write(address, &bytes) {
            warn!("EVENT_WRITE_EXT write dropped: {err}");
            return true;
        }
        self.trace.write_memory_write(address, bytes.len() as u32);
        true
    }

    fn execute_type3_event_write_zpd(&mut self, count: u32) -> bool {
        debug_assert_eq!(count, 1);
        let initiator = self.read_and_swap();
        self.write_event_initiator(initiator & 0x3F);

        // Occlusion queries: sent on query begin and end. As a workaround,
        // report a fixed number of passed samples on the end marker.
        let Some(fake_sample_count) = self.config.query_occlusion_fake_sample_count else {
            return true;
        };
        let counts_addr = self.registers.get(registers::RB_SAMPLE_COUNT_ADDR);
        let counts = match DepthSampleCounts::read_from(&self.memory, counts_addr) {
            Ok(counts) => counts,
            Err(err) => {
                warn!("EVENT_WRITE_ZPD: sample count structure unreadable: {err}");
                return true;
            }
        };

        // Direct3D writes the sentinel into these pairs only on query end,
        // and uses it to detect a finished query.
        let end_via_z_pass = counts.z_pass_a == QUERY_FINISHED_SENTINEL
            && counts.z_pass_b == QUERY_FINISHED_SENTINEL;
        // Older Direct3D builds check ZFail instead.
        let end_via_z_fail = counts.z_fail_a == QUERY_FINISHED_SENTINEL
            && counts.z_fail_b == QUERY_FINISHED_SENTINEL;

        let mut updated = DepthSampleCounts::default();
        if end_via_z_pass || end_via_z_fail {
            updated.z_pass_a = fake_sample_count;
            updated.total_a = fake_sample_count;
        }
        if let Err(err) = updated.write_to(&self.memory, counts_addr) {
            warn!("EVENT_WRITE_ZPD: sample count structure unwritable: {err}");
        }
        true
    }

    fn execute_type3_draw_indx(&mut self, count: u32) -> bool {
        // Initiate fetch of the index buffer and draw, with a leading viz
        // query token.
        if count == 0 {
            error!("PM4_DRAW_INDX: packet too small, can't read the viz query token");
            return false;
        }
        let _viz_query_condition = self.read_and_swap();
        self.execute_draw("PM4_DRAW_INDX", count - 1)
    }

    fn execute_type3_draw_indx_2(&mut self, count: u32) -> bool {
        // Draw using supplied indices in the packet; no viz query token.
        self.execute_draw("PM4_DRAW_INDX_2", count)
    }

    fn execute_draw(&mut self, opcode_name: &'static str, mut count_remaining: u32) -> bool {
        if count_remaining == 0 {
            error!("{opcode_name}: packet too small, can't read VGT_DRAW_INITIATOR");
            return false;
        }
        let initiator = VgtDrawInitiator(self.read_and_swap());
        count_remaining -= 1;
        self.registers.set(registers::VGT_DRAW_INITIATOR, initiator.0);

        let mut draw_succeeded = true;
        let mut index_buffer = None;
        match SourceSelect::from_u32(initiator.source_select_raw()) {
            Some(SourceSelect::Dma) => {
                // Indexed draw. Bounds-check word by word so a missing
                // register skips one word in the stream, not two.
                if count_remaining == 0 {
                    error!("{opcode_name}: packet too small, can't read VGT_DMA_BASE");
                    return false;
                }
                let vgt_dma_base = self.read_and_swap();
                count_remaining -= 1;
                self.registers.set(registers::VGT_DMA_BASE, vgt_dma_base);

                if count_remaining == 0 {
                    error!("{opcode_name}: packet too small, can't read VGT_DMA_SIZE");
                    return false;
                }
                let vgt_dma_size = VgtDmaSize(self.read_and_swap());
                count_remaining -= 1;
                self.registers.set(registers::VGT_DMA_SIZE, vgt_dma_size.0);

                let index_size_bytes = initiator.index_size().size_bytes();
                index_buffer = Some(IndexBufferInfo {
                    // Word-aligned per the R6xx docs already, but mask for
                    // safety.
                    guest_base: vgt_dma_base & !(index_size_bytes - 1),
                    endianness: vgt_dma_size.swap_mode(),
                    format: initiator.index_size(),
                    length: vgt_dma_size.num_words() * index_size_bytes,
                    count: initiator.num_indices(),
                });
            }
            Some(SourceSelect::Immediate) => {
                error!("{opcode_name}: immediate vertex indices are not supported");
                draw_succeeded = false;
            }
            Some(SourceSelect::AutoIndex) => {
                // Auto draw; no index buffer.
            }
            None => {
                warn!("{opcode_name}: invalid draw source selection");
                draw_succeeded = false;
            }
        }

        // Skip to the next packet even on failure, e.g. past immediate
        // indices we don't support.
        self.reader.advance(count_remaining * 4);

        if draw_succeeded {
            let viz_query = PaScVizQuery(self.registers.get(registers::PA_SC_VIZ_QUERY));
            if !(viz_query.viz_query_ena() && viz_query.kill_pix_post_hi_z()) {
                match PrimitiveType::from_u32(initiator.prim_type_raw()) {
                    Some(prim_type) => {
                        let explicit = is_major_mode_explicit(initiator.major_mode(), prim_type);
                        let backend_ok = self.backend.issue_draw(
                            prim_type,
                            initiator.num_indices(),
                            index_buffer.as_ref(),
                            explicit,
                        );
                        if !backend_ok {
                            error!(
                                "{opcode_name}({}, {:?}, {}): failed in backend",
                                initiator.num_indices(),
                                prim_type,
                                initiator.source_select_raw()
                            );
                        }
                    }
                    None => {
                        warn!(
                            "{opcode_name}: unhandled primitive type {}",
                            initiator.prim_type_raw()
                        );
                    }
                }
            }
        }

        // A draw the host merely couldn't execute must not poison the rest
        // of the stream.
        true
    }

    fn execute_type3_set_constant(&mut self, count: u32) -> bool {
        // Load constants into a bank selected by the offset/type word.
        let offset_type = self.read_and_swap();
        let index = offset_type & 0x7FF;
        let bank_type = (offset_type >> 16) & 0xFF;
        match ConstantBank::from_type(bank_type) {
            Some(bank) => self.write_bank_range_from_ring(bank, index, count - 1),
            None => {
                warn!("SET_CONSTANT: unknown bank type {bank_type}");
                debug_assert!(false, "SET_CONSTANT: unknown bank type");
                self.reader.advance((count - 1) * 4);
            }
        }
        true
    }

    fn execute_type3_set_constant2(&mut self, count: u32) -> bool {
        let offset_type = self.read_and_swap();
        let index = offset_type & 0xFFFF;
        self.write_register_range_from_ring(index, count - 1);
        true
    }

    fn execute_type3_load_alu_constant(&mut self, count: u32) -> bool {
        // Load constants from memory.
        if !self.require_words(count, 3, "PM4_LOAD_ALU_CONSTANT") {
            return false;
        }
        let address = self.read_and_swap() & 0x3FFF_FFFF;
        let offset_type = self.read_and_swap();
        let size_dwords = self.read_and_swap() & 0xFFF;
        let index = offset_type & 0x7FF;
        let bank_type = (offset_type >> 16) & 0xFF;

        match ConstantBank::from_type(bank_type) {
            Some(bank) => {
                self.trace.write_memory_read(address, size_dwords * 4);
                let dwords = self.read_guest_words(address, size_dwords);
                self.write_bank_range_from_mem(bank, index, &dwords);
            }
            None => {
                warn!("LOAD_ALU_CONSTANT: unknown bank type {bank_type}");
                debug_assert!(false, "LOAD_ALU_CONSTANT: unknown bank type");
            }
        }
        true
    }

    fn execute_type3_im_load(&mut self, count: u32) -> bool {
        // Load sequencer instruction memory from a guest pointer.
        if !self.require_words(count, 2, "PM4_IM_LOAD") {
            return false;
        }
        let addr_type = self.read_and_swap();
        let Some(shader_type) = ShaderType::from_u32(addr_type & 0x3) else {
            error!("IM_LOAD: invalid shader type {}", addr_type & 0x3);
            return false;
        };
        let addr = addr_type & !0x3;
        let start_size = self.read_and_swap();
        let start = start_size >> 16;
        let size_dwords = start_size & 0xFFFF;
        debug_assert_eq!(start, 0);

        self.trace.write_memory_read(addr, size_dwords * 4);
        let dwords = self.read_guest_words(addr, size_dwords);
        let shader = self.backend.load_shader(shader_type, addr, &dwords);
        self.set_active_shader(shader_type, shader);
        true
    }

    fn execute_type3_im_load_immediate(&mut self, count: u32) -> bool {
        // Load sequencer instruction memory embedded in the packet.
        if !self.require_words(count, 2, "PM4_IM_LOAD_IMMEDIATE") {
            return false;
        }
        let dword0 = self.read_and_swap();
        let dword1 = self.read_and_swap();
        let Some(shader_type) = ShaderType::from_u32(dword0) else {
            error!("IM_LOAD_IMMEDIATE: invalid shader type {dword0}");
            return false;
        };
        let start = dword1 >> 16;
        let size_dwords = dword1 & 0xFFFF;
        debug_assert_eq!(start, 0);
        if size_dwords > count - 2 {
            error!("IM_LOAD_IMMEDIATE: {size_dwords} code words exceed the packet payload");
            self.reader.advance((count - 2) * 4);
            return false;
        }

        let guest_addr = self.reader.current_address();
        let mut dwords = Vec::with_capacity(size_dwords as usize);
        for _ in 0..size_dwords {
            let word = self.read_and_swap();
            dwords.push(word);
        }
        let shader = self.backend.load_shader(shader_type, guest_addr, &dwords);
        self.set_active_shader(shader_type, shader);
        self.reader.advance((count - 2 - size_dwords) * 4);
        true
    }

    fn set_active_shader(&mut self, shader_type: ShaderType, shader: ShaderHandle) {
        match shader_type {
            ShaderType::Vertex => self.active_vertex_shader = Some(shader),
            ShaderType::Pixel => self.active_pixel_shader = Some(shader),
        }
    }

    fn execute_type3_viz_query(&mut self, count: u32) -> bool {
        // Begin/end initiator for viz query extent processing.
        debug_assert_eq!(count, 1);
        let dword0 = self.read_and_swap();
        let id = dword0 & 0x3F;
        let end = dword0 & 0x100 != 0;
        if !end {
            // Hardware clears the scan converter's internal state here.
            self.write_event_initiator(VIZQUERY_START);
        } else {
            self.write_event_initiator(VIZQUERY_END);
            // The scan converter would latch the real result; fake it and
            // report the query as visible in case it is read back.
            if id < 32 {
                let status = self.registers.get(registers::PA_SC_VIZ_QUERY_STATUS_0) | (1 << id);
                self.registers
                    .set(registers::PA_SC_VIZ_QUERY_STATUS_0, status);
            } else {
                let status =
                    self.registers.get(registers::PA_SC_VIZ_QUERY_STATUS_1) | (1 << (id - 32));
                self.registers
                    .set(registers::PA_SC_VIZ_QUERY_STATUS_1, status);
            }
        }
        true
    }
}

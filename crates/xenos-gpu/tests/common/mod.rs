#![allow(dead_code)]

use std::io;
use std::sync::{Arc, Mutex};

use xenos_gpu::xenos::{PrimitiveType, ShaderType};
use xenos_gpu::{
    CommandProcessor, Config, GpuBackend, GuestMemory, IndexBufferInfo, Pm4Opcode, RegisterClass,
    ShaderHandle, VecGuestMemory,
};

pub const RING_BASE: u32 = 0x0001_0000;
pub const RING_SIZE: u32 = 0x1000;

/// Guest RAM covering the ring plus a scratch data window.
pub const GUEST_MEMORY_SIZE: usize = 0x4_0000;

/// Scratch guest region for memory-targeting packets.
pub const DATA_BASE: u32 = 0x0002_0000;

#[derive(Clone, Debug, PartialEq)]
pub struct DrawCall {
    pub prim_type: PrimitiveType,
    pub index_count: u32,
    pub index_buffer: Option<IndexBufferInfo>,
    pub major_mode_explicit: bool,
}

/// Backend double recording every callback.
pub struct TestBackend {
    pub swaps: Vec<(u32, u32, u32)>,
    pub draws: Vec<DrawCall>,
    pub interrupts: Vec<(u32, u32)>,
    pub loaded_shaders: Vec<(ShaderType, u32, Vec<u32>)>,
    pub register_hooks: Vec<(RegisterClass, u32, u32)>,
    pub coherent_calls: u32,
    pub wait_brackets: u32,
    /// Returned from `issue_draw`.
    pub draw_result: bool,
    next_shader_handle: u64,
}

impl Default for TestBackend {
    fn default() -> Self {
        Self {
            swaps: Vec::new(),
            draws: Vec::new(),
            interrupts: Vec::new(),
            loaded_shaders: Vec::new(),
            register_hooks: Vec::new(),
            coherent_calls: 0,
            wait_brackets: 0,
            draw_result: true,
            next_shader_handle: 1,
        }
    }
}

impl GpuBackend for TestBackend {
    fn issue_swap(&mut self, frontbuffer_ptr: u32, width: u32, height: u32) {
        self.swaps.push((frontbuffer_ptr, width, height));
    }

    fn issue_draw(
        &mut self,
        prim_type: PrimitiveType,
        index_count: u32,
        index_buffer: Option<&IndexBufferInfo>,
        major_mode_explicit: bool,
    ) -> bool {
        self.draws.push(DrawCall {
            prim_type,
            index_count,
            index_buffer: index_buffer.copied(),
            major_mode_explicit,
        });
        self.draw_result
    }

    fn load_shader(
        &mut self,
        shader_type: ShaderType,
        guest_addr: u32,
        dwords: &[u32],
    ) -> ShaderHandle {
        self.loaded_shaders
            .push((shader_type, guest_addr, dwords.to_vec()));
        let handle = ShaderHandle(self.next_shader_handle);
        self.next_shader_handle += 1;
        handle
    }

    fn dispatch_interrupt(&mut self, source: u32, cpu: u32) {
        self.interrupts.push((source, cpu));
    }

    fn make_coherent(&mut self) {
        self.coherent_calls += 1;
    }

    fn prepare_for_wait(&mut self) {
        self.wait_brackets += 1;
    }

    fn register_written(&mut self, class: RegisterClass, index: u32, value: u32) {
        self.register_hooks.push((class, index, value));
    }
}

pub type TestProcessor = CommandProcessor<VecGuestMemory, TestBackend>;

pub fn setup() -> TestProcessor {
    setup_with_config(Config::default())
}

pub fn setup_with_config(config: Config) -> TestProcessor {
    let memory = VecGuestMemory::new(GUEST_MEMORY_SIZE);
    let mut cp = CommandProcessor::new(memory, TestBackend::default(), config);
    cp.initialize_ring_buffer(RING_BASE, RING_SIZE);
    cp
}

/// Stores `words` big-endian at `guest_addr`, the way the guest authors
/// command streams.
pub fn write_words(memory: &VecGuestMemory, guest_addr: u32, words: &[u32]) {
    for (i, word) in words.iter().enumerate() {
        memory
            .write(guest_addr + i as u32 * 4, &word.to_be_bytes())
            .unwrap();
    }
}

/// Appends `words` to the ring and drains it.
pub fn run_stream(cp: &mut TestProcessor, words: &[u32]) -> bool {
    let write_offset = cp.reader().write_offset();
    write_words(cp.memory(), RING_BASE + write_offset, words);
    cp.update_write_offset(write_offset + words.len() as u32 * 4);
    cp.execute_pending()
}

pub fn type3_header(opcode: Pm4Opcode, count: u32, predicate: bool) -> u32 {
    assert!(count >= 1);
    0xC000_0000 | ((count - 1) << 16) | ((opcode as u32) << 8) | u32::from(predicate)
}

pub fn type0_header(base_index: u32, write_one: bool, count: u32) -> u32 {
    assert!(count >= 1);
    ((count - 1) << 16) | (u32::from(write_one) << 15) | base_index
}

/// Type-3 packet: header followed by its payload words.
pub fn type3_packet(opcode: Pm4Opcode, payload: &[u32]) -> Vec<u32> {
    let mut words = vec![type3_header(opcode, payload.len() as u32, false)];
    words.extend_from_slice(payload);
    words
}

pub fn type3_packet_predicated(opcode: Pm4Opcode, payload: &[u32]) -> Vec<u32> {
    let mut words = vec![type3_header(opcode, payload.len() as u32, true)];
    words.extend_from_slice(payload);
    words
}

/// `io::Write` sink shared with a trace capture, so tests can parse what the
/// processor recorded.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn bytes(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Reads back a guest u32 stored in host (little-endian) order.
pub fn read_guest_u32_le(memory: &VecGuestMemory, guest_addr: u32) -> u32 {
    let mut bytes = [0u8; 4];
    memory.read(guest_addr, &mut bytes).unwrap();
    u32::from_le_bytes(bytes)
}

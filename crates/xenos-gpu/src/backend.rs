//! Contract between the command processor and the embedding emulator.

use std::path::PathBuf;

use crate::draw::IndexBufferInfo;
use crate::register_file::RegisterClass;
use crate::trace::TraceMode;
use crate::xenos::{PrimitiveType, ShaderType};

/// Opaque reference to a shader owned by the external loader/translator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ShaderHandle(pub u64);

/// Callbacks supplied by the rendering backend and the surrounding emulator.
///
/// Handlers run on the command-processor worker; implementations must not
/// re-enter the command processor.
pub trait GpuBackend {
    /// Presents the frontbuffer. Fired by `XE_SWAP`.
    fn issue_swap(&mut self, frontbuffer_ptr: u32, width: u32, height: u32);

    /// Submits a draw. A `false` return drops this draw only; the command
    /// stream continues.
    fn issue_draw(
        &mut self,
        prim_type: PrimitiveType,
        index_count: u32,
        index_buffer: Option<&IndexBufferInfo>,
        major_mode_explicit: bool,
    ) -> bool;

    /// Loads and translates a shader; `dwords` is the program text in host
    /// order, `guest_addr` its location for caching/debug purposes.
    fn load_shader(
        &mut self,
        shader_type: ShaderType,
        guest_addr: u32,
        dwords: &[u32],
    ) -> ShaderHandle;

    /// Raises a guest interrupt from the command stream.
    fn dispatch_interrupt(&mut self, source: u32, cpu: u32);

    /// Flushes pending host caches so `COHER_STATUS_HOST` reads settle.
    fn make_coherent(&mut self);

    /// Bracketing hooks around a long `WAIT_REG_MEM` sleep.
    fn prepare_for_wait(&mut self) {}
    fn return_from_wait(&mut self) {}

    /// Observes a write to a side-effecting register class.
    fn register_written(&mut self, _class: RegisterClass, _index: u32, _value: u32) {}
}

/// Injected configuration for a command-processor instance.
#[derive(Clone, Debug)]
pub struct Config {
    /// When set, occlusion queries are faked as visible with this sample
    /// count; `None` leaves the guest structure untouched.
    pub query_occlusion_fake_sample_count: Option<u32>,
    /// When disabled, `WAIT_REG_MEM` yields instead of sleeping.
    pub vsync: bool,
    pub trace_mode: TraceMode,
    /// Directory trace files are created in.
    pub trace_dir: PathBuf,
    /// Title id stamped into trace containers and file names.
    pub title_id: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            query_occlusion_fake_sample_count: Some(1000),
            vsync: true,
            trace_mode: TraceMode::Disabled,
            trace_dir: PathBuf::new(),
            title_id: 0,
        }
    }
}

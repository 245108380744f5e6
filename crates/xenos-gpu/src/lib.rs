//! PM4 command-stream interpreter for an Xbox-360-class (Xenos) GPU.
//!
//! This crate is the command-processor core of the emulator's GPU subsystem:
//! it consumes a guest-authored ring of big-endian 32-bit command words,
//! decodes typed PM4 packets, drives the register file, mutates guest
//! physical memory, and issues draw/swap requests to a rendering backend.
//!
//! The crate deliberately stops at the backend boundary: rendering, shader
//! translation, and guest memory management are supplied by the embedder
//! through [`GpuBackend`] and [`GuestMemory`].
//!
//! Entry point: build a [`CommandProcessor`] over a memory and backend
//! implementation, install the ring window, publish write offsets, and call
//! [`CommandProcessor::execute_pending`] from the dedicated worker thread.

pub mod registers;
pub mod xenos;

mod backend;
mod command_processor;
mod draw;
mod guest_memory;
mod opcodes;
mod register_file;
mod ring_buffer;
mod trace;

pub use backend::{Config, GpuBackend, ShaderHandle};
pub use command_processor::CommandProcessor;
pub use draw::IndexBufferInfo;
pub use guest_memory::{GuestMemory, GuestMemoryError, VecGuestMemory};
pub use opcodes::Pm4Opcode;
pub use register_file::{classify, ConstantBank, RegisterClass, RegisterFile};
pub use ring_buffer::RingReader;
pub use trace::{trace_file_name, TraceMode};

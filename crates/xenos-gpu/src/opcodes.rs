//! Type-3 packet opcodes understood by the command processor.

/// PM4 Type-3 opcode set, per the Xenos micro-engine encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Pm4Opcode {
    /// Initialize the CP micro-engine.
    MeInit = 0x48,
    /// Skip N 32-bit words.
    Nop = 0x10,
    /// Generate an interrupt from the command stream.
    Interrupt = 0x54,
    /// VdSwap hook: swap the frontbuffer and fire the frame boundary.
    XeSwap = 0x64,
    /// Jump into an embedded command stream.
    IndirectBuffer = 0x3F,
    IndirectBufferPfd = 0x37,
    /// Wait until a register or memory location matches a reference.
    WaitRegMem = 0x3C,
    /// Register read/modify/write.
    RegRmw = 0x21,
    /// Copy one register to memory.
    RegToMem = 0x3E,
    /// Write a block of words to memory.
    MemWrite = 0x3D,
    /// Conditional write to memory or a register.
    CondWrite = 0x45,
    EventWrite = 0x46,
    EventWriteShd = 0x58,
    EventWriteExt = 0x5A,
    EventWriteZpd = 0x5B,
    /// Initiate fetch of an index buffer and draw.
    DrawIndx = 0x22,
    /// Draw using supplied indices in the packet.
    DrawIndx2 = 0x36,
    /// Load constants into a constant bank.
    SetConstant = 0x2D,
    SetConstant2 = 0x55,
    /// Load constants from memory.
    LoadAluConstant = 0x2F,
    SetShaderConstants = 0x56,
    /// Load sequencer instruction memory (pointer-based).
    ImLoad = 0x27,
    /// Load sequencer instruction memory (code embedded in the packet).
    ImLoadImmediate = 0x2B,
    /// Selective invalidation of state pointers.
    InvalidateState = 0x3B,
    /// Begin/end initiator for viz query extent processing.
    VizQuery = 0x23,
    SetBinMask = 0x50,
    SetBinSelect = 0x51,
    SetBinMaskLo = 0x60,
    SetBinMaskHi = 0x61,
    SetBinSelectLo = 0x62,
    SetBinSelectHi = 0x63,
    ContextUpdate = 0x5E,
    WaitForIdle = 0x26,
}

impl Pm4Opcode {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0x48 => Self::MeInit,
            0x10 => Self::Nop,
            0x54 => Self::Interrupt,
            0x64 => Self::XeSwap,
            0x3F => Self::IndirectBuffer,
            0x37 => Self::IndirectBufferPfd,
            0x3C => Self::WaitRegMem,
            0x21 => Self::RegRmw,
            0x3E => Self::RegToMem,
            0x3D => Self::MemWrite,
            0x45 => Self::CondWrite,
            0x46 => Self::EventWrite,
            0x58 => Self::EventWriteShd,
            0x5A => Self::EventWriteExt,
            0x5B => Self::EventWriteZpd,
            0x22 => Self::DrawIndx,
            0x36 => Self::DrawIndx2,
            0x2D => Self::SetConstant,
            0x55 => Self::SetConstant2,
            0x2F => Self::LoadAluConstant,
            0x56 => Self::SetShaderConstants,
            0x27 => Self::ImLoad,
            0x2B => Self::ImLoadImmediate,
            0x3B => Self::InvalidateState,
            0x23 => Self::VizQuery,
            0x50 => Self::SetBinMask,
            0x51 => Self::SetBinSelect,
            0x60 => Self::SetBinMaskLo,
            0x61 => Self::SetBinMaskHi,
            0x62 => Self::SetBinSelectLo,
            0x63 => Self::SetBinSelectHi,
            0x5E => Self::ContextUpdate,
            0x26 => Self::WaitForIdle,
            _ => return None,
        })
    }
}

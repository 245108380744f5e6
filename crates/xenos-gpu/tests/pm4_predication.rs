//! Bin mask/select state and predicated packet gating.

mod common;

use common::*;
use pretty_assertions::assert_eq;
use xenos_gpu::xenos::SWAP_SIGNATURE;
use xenos_gpu::Pm4Opcode;

#[test]
fn bin_mask_halves_compose_like_the_full_write() {
    let value: u64 = 0x1234_5678_9ABC_DEF0;
    let (hi, lo) = ((value >> 32) as u32, value as u32);

    let mut cp_halves = setup();
    let mut words = type3_packet(Pm4Opcode::SetBinMaskLo, &[lo]);
    words.extend(type3_packet(Pm4Opcode::SetBinMaskHi, &[hi]));
    assert!(run_stream(&mut cp_halves, &words));

    let mut cp_full = setup();
    let words = type3_packet(Pm4Opcode::SetBinMask, &[hi, lo]);
    assert!(run_stream(&mut cp_full, &words));

    assert_eq!(cp_halves.bin_mask(), value);
    assert_eq!(cp_full.bin_mask(), value);
}

#[test]
fn bin_select_halves_compose_like_the_full_write() {
    let value: u64 = 0xFEDC_BA98_0101_0202;
    let (hi, lo) = ((value >> 32) as u32, value as u32);

    let mut cp = setup();
    let mut words = type3_packet(Pm4Opcode::SetBinSelectHi, &[hi]);
    words.extend(type3_packet(Pm4Opcode::SetBinSelectLo, &[lo]));
    assert!(run_stream(&mut cp, &words));
    assert_eq!(cp.bin_select(), value);

    let mut cp_full = setup();
    let words = type3_packet(Pm4Opcode::SetBinSelect, &[hi, lo]);
    assert!(run_stream(&mut cp_full, &words));
    assert_eq!(cp_full.bin_select(), value);
}

#[test]
fn half_writes_preserve_the_other_half() {
    let mut cp = setup();
    let mut words = type3_packet(Pm4Opcode::SetBinMask, &[0xAAAA_AAAA, 0xBBBB_BBBB]);
    words.extend(type3_packet(Pm4Opcode::SetBinMaskLo, &[0x1111_1111]));
    assert!(run_stream(&mut cp, &words));
    assert_eq!(cp.bin_mask(), 0xAAAA_AAAA_1111_1111);

    let words = type3_packet(Pm4Opcode::SetBinMaskHi, &[0x2222_2222]);
    assert!(run_stream(&mut cp, &words));
    assert_eq!(cp.bin_mask(), 0x2222_2222_1111_1111);
}

#[test]
fn predicated_swap_is_always_skipped() {
    let mut cp = setup();
    // Default bin state passes the predicate; the swap is skipped anyway.
    let words = type3_packet_predicated(Pm4Opcode::XeSwap, &[SWAP_SIGNATURE, 0, 1280, 720]);
    assert!(run_stream(&mut cp, &words));
    assert!(cp.backend().swaps.is_empty());
    assert_eq!(cp.swap_count(), 0);
    assert_eq!(cp.reader().read_count(), 0);
}

#[test]
fn predicated_swap_under_zero_bin_select_advances_without_effect() {
    let mut cp = setup();
    let mut words = type3_packet(Pm4Opcode::SetBinSelect, &[0, 0]);
    words.extend(type3_packet_predicated(
        Pm4Opcode::XeSwap,
        &[SWAP_SIGNATURE, 0, 1280, 720],
    ));
    assert!(run_stream(&mut cp, &words));
    assert!(cp.backend().swaps.is_empty());
    assert_eq!(cp.swap_count(), 0);
    assert_eq!(cp.reader().read_count(), 0);
}

#[test]
fn failed_predicate_suppresses_all_side_effects() {
    let mut cp = setup();
    let mut words = type3_packet(Pm4Opcode::SetBinMask, &[0, 0]);
    words.extend(type3_packet_predicated(
        Pm4Opcode::MemWrite,
        &[DATA_BASE, 0xDEAD_BEEF],
    ));
    words.extend(type3_packet_predicated(
        Pm4Opcode::SetConstant,
        &[0x10, 0x1234],
    ));
    words.extend(type3_packet_predicated(Pm4Opcode::DrawIndx2, &[0x0004_0084]));
    assert!(run_stream(&mut cp, &words));

    // Only ring advance and trace; registers, memory, and the backend are
    // untouched.
    assert_eq!(cp.reader().read_count(), 0);
    assert_eq!(read_guest_u32_le(cp.memory(), DATA_BASE), 0);
    assert_eq!(cp.registers().get(xenos_gpu::registers::ALU_CONSTANT_BASE + 0x10), 0);
    assert!(cp.backend().draws.is_empty());
}

#[test]
fn passing_predicate_executes_the_packet() {
    let mut cp = setup();
    // select & mask share bit 3.
    let mut words = type3_packet(Pm4Opcode::SetBinMask, &[0, 0x8]);
    words.extend(type3_packet(Pm4Opcode::SetBinSelect, &[0, 0x8]));
    words.extend(type3_packet_predicated(
        Pm4Opcode::MemWrite,
        &[DATA_BASE, 0xDEAD_BEEF],
    ));
    assert!(run_stream(&mut cp, &words));
    assert_eq!(read_guest_u32_le(cp.memory(), DATA_BASE), 0xDEAD_BEEF);
}

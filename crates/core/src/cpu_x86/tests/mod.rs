//! Tests for the x86 CPU core.
//!
//! Organized by area:
//! - `tests_flags`: flag generation and the documented boundary cases
//! - `tests_8bit`: byte ALU operations and data movement
//! - `tests_16bit`: word operations, the stack, and 80186 additions
//! - `tests_32bit`: 80386 operand sizes and extended instructions
//! - `tests_shifts`: shift and rotate semantics
//! - `tests_control`: jumps, calls, returns, and real-mode interrupts
//! - `tests_strings`: string instructions and REP behavior
//! - `tests_protected`: descriptor loading and protection rules
//! - `tests_interrupts`: faults, gates, and stack switches
//! - `tests_tasks`: TSS task switching
//! - `tests_props`: property-based flag conformance
//! - `tests_state`: snapshots and machine descriptions

mod tests_16bit;
mod tests_8bit;
mod tests_control;
mod tests_flags;
mod tests_interrupts;
mod tests_props;
mod tests_shifts;
mod tests_state;

use super::segment::SegId;
use super::{CpuModel, CpuX86, VecBus};

/// Fresh 8086 with a megabyte of RAM.
pub(crate) fn cpu8086() -> CpuX86<VecBus> {
    CpuX86::new(VecBus::new())
}

pub(crate) fn cpu_model(model: CpuModel) -> CpuX86<VecBus> {
    CpuX86::with_model(VecBus::new(), model)
}

/// Point CS:IP at a scratch code area and load a program there.
pub(crate) fn boot(c: &mut CpuX86<VecBus>, code: &[u8]) {
    c.load_seg_real(SegId::Cs, 0x1000);
    c.load_seg_real(SegId::Ds, 0x2000);
    c.load_seg_real(SegId::Es, 0x3000);
    c.load_seg_real(SegId::Ss, 0x4000);
    c.regs[super::REG_SP] = 0x1000;
    c.eip = 0;
    c.bus.load_program(0x10000, code);
}

/// Execute `n` instructions.
pub(crate) fn run(c: &mut CpuX86<VecBus>, n: usize) {
    for _ in 0..n {
        c.step_cpu(1);
    }
}

/// Pack a code/data descriptor into its 8 raw bytes.
pub(crate) fn make_desc(base: u32, limit: u32, access: u8, ext: u8) -> [u8; 8] {
    [
        (limit & 0xFF) as u8,
        ((limit >> 8) & 0xFF) as u8,
        (base & 0xFF) as u8,
        ((base >> 8) & 0xFF) as u8,
        ((base >> 16) & 0xFF) as u8,
        access,
        (((limit >> 16) & 0x0F) as u8) | (ext & 0xF0),
        ((base >> 24) & 0xFF) as u8,
    ]
}

/// Pack a 286-style gate descriptor.
pub(crate) fn make_gate(offset: u16, selector: u16, count: u8, access: u8) -> [u8; 8] {
    [
        (offset & 0xFF) as u8,
        (offset >> 8) as u8,
        (selector & 0xFF) as u8,
        (selector >> 8) as u8,
        count & 0x1F,
        access,
        0,
        0,
    ]
}

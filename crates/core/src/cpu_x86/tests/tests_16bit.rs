//! Word-wide operations, the stack, and the 80186 additions.

use super::super::{CpuModel, REG_AX, REG_BP, REG_BX, REG_CX, REG_DI, REG_DX, REG_SI, REG_SP};
use super::{boot, cpu8086, cpu_model, run};
use crate::Bus;

#[test]
fn push_pop_round_trip() {
    let mut c = cpu8086();
    // MOV AX, 0x1234 ; PUSH AX ; POP BX
    boot(&mut c, &[0xB8, 0x34, 0x12, 0x50, 0x5B]);
    let sp = c.regs[REG_SP];
    run(&mut c, 3);
    assert_eq!(c.regs[REG_BX] & 0xFFFF, 0x1234);
    assert_eq!(c.regs[REG_SP], sp);
}

#[test]
fn push_sp_on_8086_pushes_decremented_value() {
    let mut c = cpu8086();
    boot(&mut c, &[0x54]); // PUSH SP
    run(&mut c, 1);
    let pushed = c.bus.read_word(0x40000 + c.regs[REG_SP]);
    assert_eq!(pushed as u32, c.regs[REG_SP] & 0xFFFF);
}

#[test]
fn push_sp_on_80286_pushes_original_value() {
    let mut c = cpu_model(CpuModel::Intel80286);
    boot(&mut c, &[0x54]); // PUSH SP
    let sp_before = c.regs[REG_SP];
    run(&mut c, 1);
    let pushed = c.bus.read_word(0x40000 + c.regs[REG_SP]);
    assert_eq!(pushed as u32, sp_before & 0xFFFF);
}

#[test]
fn pusha_popa_round_trip() {
    let mut c = cpu_model(CpuModel::Intel80186);
    boot(&mut c, &[0x60, 0x61]); // PUSHA ; POPA
    for (i, r) in c.regs.iter_mut().enumerate() {
        *r = 0x1111 * (i as u32 + 1);
    }
    c.regs[REG_SP] = 0x1000;
    let snapshot = c.regs;
    run(&mut c, 2);
    assert_eq!(c.regs, snapshot);
}

#[test]
fn popa_discards_pushed_sp() {
    let mut c = cpu_model(CpuModel::Intel80186);
    // PUSHA ; MOV BP, SP ; MOV word [BP+6], 0xBEEF ; POPA
    // Slot +6 is the pushed SP image, which POPA must ignore.
    boot(
        &mut c,
        &[0x60, 0x89, 0xE5, 0xC7, 0x46, 0x06, 0xEF, 0xBE, 0x61],
    );
    c.regs[REG_SP] = 0x1000;
    run(&mut c, 4);
    assert_eq!(c.regs[REG_SP], 0x1000);
}

#[test]
fn lea_computes_without_memory_access() {
    let mut c = cpu8086();
    // MOV BX, 0x100 ; MOV SI, 0x23 ; LEA AX, [BX+SI+5]
    boot(&mut c, &[0xBB, 0x00, 0x01, 0xBE, 0x23, 0x00, 0x8D, 0x40, 0x05]);
    run(&mut c, 3);
    assert_eq!(c.regs[REG_AX] & 0xFFFF, 0x0128);
}

#[test]
fn les_loads_pointer_pair() {
    let mut c = cpu8086();
    // dword pointer 0x5678:0x1234 at DS:0x40
    c.bus.load_program(0x20040, &[0x34, 0x12, 0x78, 0x56]);
    boot(&mut c, &[0xC4, 0x1E, 0x40, 0x00]); // LES BX, [0x40]
    run(&mut c, 1);
    assert_eq!(c.regs[REG_BX] & 0xFFFF, 0x1234);
    assert_eq!(c.seg(super::SegId::Es).sel, 0x5678);
}

#[test]
fn enter_leave_frame() {
    let mut c = cpu_model(CpuModel::Intel80186);
    // ENTER 8, 0 ; LEAVE
    boot(&mut c, &[0xC8, 0x08, 0x00, 0xC9]);
    c.regs[REG_BP] = 0xAAAA;
    let sp = c.regs[REG_SP];
    run(&mut c, 1);
    assert_eq!(c.regs[REG_SP], sp - 2 - 8);
    assert_eq!(c.regs[REG_BP], sp - 2);
    run(&mut c, 1);
    assert_eq!(c.regs[REG_SP], sp);
    assert_eq!(c.regs[REG_BP], 0xAAAA);
}

#[test]
fn imul_three_operand() {
    let mut c = cpu_model(CpuModel::Intel80186);
    // MOV BX, 10 ; IMUL AX, BX, 0x20
    boot(&mut c, &[0xBB, 0x0A, 0x00, 0x69, 0xC3, 0x20, 0x00]);
    run(&mut c, 2);
    assert_eq!(c.regs[REG_AX] & 0xFFFF, 320);
    assert!(!c.get_cf());
}

#[test]
fn word_mul_fills_dx() {
    let mut c = cpu8086();
    // MOV AX, 0x4000 ; MOV BX, 0x10 ; MUL BX -> DX:AX = 0x40000
    boot(&mut c, &[0xB8, 0x00, 0x40, 0xBB, 0x10, 0x00, 0xF7, 0xE3]);
    run(&mut c, 3);
    assert_eq!(c.regs[REG_AX] & 0xFFFF, 0x0000);
    assert_eq!(c.regs[REG_DX] & 0xFFFF, 0x0004);
    assert!(c.get_cf());
}

#[test]
fn word_div_uses_dx_ax() {
    let mut c = cpu8086();
    // DX:AX = 0x00040000, BX = 0x10 -> AX = 0x4000 rem 0
    boot(&mut c, &[0xF7, 0xF3]); // DIV BX
    c.regs[REG_AX] = 0x0000;
    c.regs[REG_DX] = 0x0004;
    c.regs[REG_BX] = 0x0010;
    run(&mut c, 1);
    assert_eq!(c.regs[REG_AX] & 0xFFFF, 0x4000);
    assert_eq!(c.regs[REG_DX] & 0xFFFF, 0x0000);
}

#[test]
fn mov_to_memory_with_displacement() {
    let mut c = cpu8086();
    // MOV BX, 0x200 ; MOV word [BX+0x10], 0xCAFE
    boot(&mut c, &[0xBB, 0x00, 0x02, 0xC7, 0x47, 0x10, 0xFE, 0xCA]);
    run(&mut c, 2);
    assert_eq!(c.bus.read_word(0x20210), 0xCAFE);
}

#[test]
fn bp_defaults_to_stack_segment() {
    let mut c = cpu8086();
    // MOV BP, 0x80 ; MOV word [BP], 0x1122 -> lands in SS
    boot(&mut c, &[0xBD, 0x80, 0x00, 0xC7, 0x46, 0x00, 0x22, 0x11]);
    run(&mut c, 2);
    assert_eq!(c.bus.read_word(0x40080), 0x1122);
}

#[test]
fn xchg_ax_register_short_form() {
    let mut c = cpu8086();
    // MOV AX, 1 ; MOV SI, 2 ; XCHG AX, SI
    boot(&mut c, &[0xB8, 0x01, 0x00, 0xBE, 0x02, 0x00, 0x96]);
    run(&mut c, 3);
    assert_eq!(c.regs[REG_AX] & 0xFFFF, 2);
    assert_eq!(c.regs[REG_SI] & 0xFFFF, 1);
}

#[test]
fn test_instruction_is_non_destructive() {
    let mut c = cpu8086();
    // MOV AX, 0x8000 ; TEST AX, 0x8000
    boot(&mut c, &[0xB8, 0x00, 0x80, 0xA9, 0x00, 0x80]);
    run(&mut c, 2);
    assert_eq!(c.regs[REG_AX] & 0xFFFF, 0x8000);
    assert!(!c.get_zf());
    assert!(c.get_sf());
    assert!(!c.get_cf());
}

#[test]
fn sign_extended_immediate_group() {
    let mut c = cpu8086();
    // MOV AX, 0x0100 ; ADD AX, -1 (83 /0 with imm8 0xFF)
    boot(&mut c, &[0xB8, 0x00, 0x01, 0x83, 0xC0, 0xFF]);
    run(&mut c, 2);
    assert_eq!(c.regs[REG_AX] & 0xFFFF, 0x00FF);
}

#[test]
fn mov_segment_registers() {
    let mut c = cpu8086();
    // MOV AX, 0x5000 ; MOV DS, AX ; MOV BX, DS
    boot(&mut c, &[0xB8, 0x00, 0x50, 0x8E, 0xD8, 0x8C, 0xDB]);
    run(&mut c, 3);
    assert_eq!(c.seg(super::SegId::Ds).sel, 0x5000);
    assert_eq!(c.seg(super::SegId::Ds).base, 0x50000);
    assert_eq!(c.regs[REG_BX] & 0xFFFF, 0x5000);
}

#[test]
fn bound_within_range_is_silent() {
    let mut c = cpu_model(CpuModel::Intel80186);
    // bounds [0x10, 0x20] at DS:0x60 ; MOV CX, 0x15 ; BOUND CX, [0x60]
    c.bus.load_program(0x20060, &[0x10, 0x00, 0x20, 0x00]);
    boot(&mut c, &[0xB9, 0x15, 0x00, 0x62, 0x0E, 0x60, 0x00]);
    run(&mut c, 2);
    assert_eq!(c.regs[REG_CX] & 0xFFFF, 0x15);
    assert!(c.fault_state().is_none());
}

#[test]
fn string_ops_use_si_di() {
    let mut c = cpu8086();
    c.bus.load_program(0x20000, b"hi");
    // MOV SI, 0 ; MOV DI, 0 ; MOVSW
    boot(&mut c, &[0xBE, 0x00, 0x00, 0xBF, 0x00, 0x00, 0xA5]);
    run(&mut c, 3);
    assert_eq!(&c.bus.mem[0x30000..0x30002], b"hi");
    assert_eq!(c.regs[REG_SI] & 0xFFFF, 2);
    assert_eq!(c.regs[REG_DI] & 0xFFFF, 2);
}

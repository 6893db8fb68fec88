//! Jumps, calls, returns, and real-mode interrupt entry/exit.

use super::super::segment::SegId;
use super::super::{REG_AX, REG_BX, REG_CX, REG_SP};
use super::{boot, cpu8086, run};

#[test]
fn jmp_short_skips() {
    let mut c = cpu8086();
    // JMP +2 ; MOV AX, 1 (skipped) ; MOV BX, 2... encoded: EB 03
    boot(&mut c, &[0xEB, 0x03, 0xB8, 0x01, 0x00, 0xBB, 0x02, 0x00]);
    run(&mut c, 2);
    assert_eq!(c.regs[REG_AX] & 0xFFFF, 0);
    assert_eq!(c.regs[REG_BX] & 0xFFFF, 2);
}

#[test]
fn conditional_jump_taken_and_not() {
    let mut c = cpu8086();
    // XOR AX, AX ; JNZ +2 (not taken) ; JZ +2 (taken) ; MOV CX, 9 (skipped) ; MOV BX, 5
    boot(
        &mut c,
        &[
            0x31, 0xC0, // XOR AX, AX
            0x75, 0x02, // JNZ +2
            0x74, 0x03, // JZ +3
            0xB9, 0x09, 0x00, // MOV CX, 9
            0xBB, 0x05, 0x00, // MOV BX, 5
        ],
    );
    run(&mut c, 4);
    assert_eq!(c.regs[REG_CX] & 0xFFFF, 0);
    assert_eq!(c.regs[REG_BX] & 0xFFFF, 5);
}

#[test]
fn call_ret_round_trip() {
    let mut c = cpu8086();
    // CALL +3 ; MOV BX, 1 ; HLT ; (sub) MOV AX, 7 ; RET
    boot(
        &mut c,
        &[
            0xE8, 0x04, 0x00, // CALL +4 -> 0x0007
            0xBB, 0x01, 0x00, // MOV BX, 1
            0xF4, // HLT
            0xB8, 0x07, 0x00, // MOV AX, 7
            0xC3, // RET
        ],
    );
    let sp = c.regs[REG_SP];
    run(&mut c, 4);
    assert_eq!(c.regs[REG_AX] & 0xFFFF, 7);
    assert_eq!(c.regs[REG_BX] & 0xFFFF, 1);
    assert_eq!(c.regs[REG_SP], sp);
}

#[test]
fn ret_with_immediate_discards_args() {
    let mut c = cpu8086();
    // PUSH AX ; PUSH AX ; CALL +1 ; HLT ; RET 4
    boot(
        &mut c,
        &[
            0x50, 0x50, // PUSH AX x2
            0xE8, 0x01, 0x00, // CALL +1 -> 0x0006
            0xF4, // HLT
            0xC2, 0x04, 0x00, // RET 4
        ],
    );
    let sp = c.regs[REG_SP];
    run(&mut c, 4);
    assert_eq!(c.regs[REG_SP], sp);
    assert_eq!(c.eip, 0x0005);
}

#[test]
fn call_far_and_ret_far_balance() {
    let mut c = cpu8086();
    // Subroutine at 0x1100:0x0000: MOV AX, 0x55AA ; RETF
    c.bus.load_program(0x11000, &[0xB8, 0xAA, 0x55, 0xCB]);
    // CALL 0x1100:0x0000
    boot(&mut c, &[0x9A, 0x00, 0x00, 0x00, 0x11]);
    let sp = c.regs[REG_SP];
    run(&mut c, 3);
    assert_eq!(c.regs[REG_AX] & 0xFFFF, 0x55AA);
    assert_eq!(c.seg(SegId::Cs).sel, 0x1000);
    assert_eq!(c.eip, 0x0005);
    assert_eq!(c.regs[REG_SP], sp);
}

#[test]
fn jmp_far_reloads_cs() {
    let mut c = cpu8086();
    c.bus.load_program(0x11000, &[0xB8, 0x01, 0x00]); // MOV AX, 1
    boot(&mut c, &[0xEA, 0x00, 0x00, 0x00, 0x11]); // JMP 0x1100:0
    run(&mut c, 2);
    assert_eq!(c.seg(SegId::Cs).sel, 0x1100);
    assert_eq!(c.regs[REG_AX] & 0xFFFF, 1);
}

#[test]
fn indirect_call_through_register() {
    let mut c = cpu8086();
    // MOV AX, 0x0007 ; CALL AX ; HLT ; MOV BX, 3 ; RET
    boot(
        &mut c,
        &[
            0xB8, 0x07, 0x00, // MOV AX, 7
            0xFF, 0xD0, // CALL AX
            0xF4, // HLT
            0xBB, 0x03, 0x00, // MOV BX, 3
            0xC3, // RET
        ],
    );
    run(&mut c, 4);
    assert_eq!(c.regs[REG_BX] & 0xFFFF, 3);
    assert_eq!(c.eip, 0x0005);
}

#[test]
fn loop_decrements_cx() {
    let mut c = cpu8086();
    // MOV CX, 3 ; MOV AX, 0 ; INC AX ; LOOP -3
    boot(&mut c, &[0xB9, 0x03, 0x00, 0xB8, 0x00, 0x00, 0x40, 0xE2, 0xFD]);
    run(&mut c, 8);
    assert_eq!(c.regs[REG_AX] & 0xFFFF, 3);
    assert_eq!(c.regs[REG_CX] & 0xFFFF, 0);
}

#[test]
fn jcxz_branches_on_empty_count() {
    let mut c = cpu8086();
    // XOR CX, CX ; JCXZ +3 ; MOV AX, 1 ; MOV BX, 2
    boot(
        &mut c,
        &[0x31, 0xC9, 0xE3, 0x03, 0xB8, 0x01, 0x00, 0xBB, 0x02, 0x00],
    );
    run(&mut c, 3);
    assert_eq!(c.regs[REG_AX] & 0xFFFF, 0);
    assert_eq!(c.regs[REG_BX] & 0xFFFF, 2);
}

#[test]
fn int_iret_round_trip() {
    let mut c = cpu8086();
    // Handler at 0x1200:0: MOV BX, 0x77 ; IRET
    c.bus.load_program(0x12000, &[0xBB, 0x77, 0x00, 0xCF]);
    // IVT entry for vector 0x21.
    c.bus.load_program(0x21 * 4, &[0x00, 0x00, 0x00, 0x12]);
    // STI ; INT 0x21 ; MOV AX, 1
    boot(&mut c, &[0xFB, 0xCD, 0x21, 0xB8, 0x01, 0x00]);
    let sp = c.regs[REG_SP];
    run(&mut c, 5);
    assert_eq!(c.regs[REG_BX] & 0xFFFF, 0x77);
    assert_eq!(c.regs[REG_AX] & 0xFFFF, 1);
    assert_eq!(c.regs[REG_SP], sp);
    assert_eq!(c.seg(SegId::Cs).sel, 0x1000);
    // IRET restored IF.
    assert!(c.get_flag(super::super::PS_IF));
}

#[test]
fn int_clears_if_until_iret() {
    let mut c = cpu8086();
    c.bus.load_program(0x12000, &[0xCF]); // IRET
    c.bus.load_program(0x21 * 4, &[0x00, 0x00, 0x00, 0x12]);
    // STI ; INT 0x21
    boot(&mut c, &[0xFB, 0xCD, 0x21]);
    run(&mut c, 2);
    // Inside the handler IF is clear.
    assert!(!c.get_flag(super::super::PS_IF));
    run(&mut c, 1);
    assert!(c.get_flag(super::super::PS_IF));
}

#[test]
fn hlt_waits_for_interrupt() {
    let mut c = cpu8086();
    c.bus.load_program(0x12000, &[0xCF]); // IRET handler
    c.bus.load_program(0x08 * 4, &[0x00, 0x00, 0x00, 0x12]);
    // STI ; HLT ; MOV AX, 5
    boot(&mut c, &[0xFB, 0xF4, 0xB8, 0x05, 0x00]);
    run(&mut c, 2);
    assert!(c.is_halted());
    // Burns the budget while halted.
    c.step_cpu(50);
    assert!(c.is_halted());
    // A timer tick wakes it.
    c.set_intr(0x08);
    run(&mut c, 3);
    assert!(!c.is_halted());
    assert_eq!(c.regs[REG_AX] & 0xFFFF, 5);
}

#[test]
fn interrupt_window_respects_if() {
    let mut c = cpu8086();
    c.bus.load_program(0x12000, &[0xCF]);
    c.bus.load_program(0x08 * 4, &[0x00, 0x00, 0x00, 0x12]);
    // CLI ; MOV AX, 1 ; MOV BX, 2
    boot(&mut c, &[0xFA, 0xB8, 0x01, 0x00, 0xBB, 0x02, 0x00]);
    run(&mut c, 1);
    c.set_intr(0x08);
    run(&mut c, 2);
    // With IF clear the vector stays latched.
    assert!(c.fault_state().is_none());
    assert_eq!(c.regs[REG_BX] & 0xFFFF, 2);
    assert_eq!(c.seg(SegId::Cs).sel, 0x1000);
}

#[test]
fn sti_shadows_one_instruction() {
    let mut c = cpu8086();
    // Handler: MOV BX, 9 ; IRET
    c.bus.load_program(0x12000, &[0xBB, 0x09, 0x00, 0xCF]);
    c.bus.load_program(0x08 * 4, &[0x00, 0x00, 0x00, 0x12]);
    // CLI ; STI ; MOV AX, 1  -- the interrupt may not fire before MOV
    boot(&mut c, &[0xFA, 0xFB, 0xB8, 0x01, 0x00]);
    run(&mut c, 1);
    c.set_intr(0x08);
    // STI executes; its shadow holds the interrupt off.
    run(&mut c, 1);
    assert_eq!(c.seg(SegId::Cs).sel, 0x1000);
    assert_eq!(c.regs[super::super::REG_BX] & 0xFFFF, 0);
    // The shadow covers MOV AX; only after it retires is the interrupt
    // taken, landing in the handler.
    run(&mut c, 2);
    assert_eq!(c.regs[REG_AX] & 0xFFFF, 1);
    assert_eq!(c.seg(SegId::Cs).sel, 0x1200);
    assert_eq!(c.regs[super::super::REG_BX] & 0xFFFF, 9);
}

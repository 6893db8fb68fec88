//! Fault delivery, trap timing, gate transit, and escalation.

use super::super::interrupt::INT_GP;
use super::super::segment::{SegId, CR0_PE};
use super::super::{
    CpuModel, CpuX86, DescTableReg, PS_IF, SegReg, VecBus, REG_AX, REG_BX, REG_SP,
};
use super::{boot, cpu8086, cpu_model, make_desc, make_gate, run};
use crate::Bus;

#[test]
fn divide_error_rewinds_to_faulting_instruction() {
    let mut c = cpu8086();
    // Handler for vector 0: HLT at 0x1200:0.
    c.bus.load_program(0x12000, &[0xF4]);
    c.bus.load_program(0x00, &[0x00, 0x00, 0x00, 0x12]);
    // MOV AX, 0x10 ; MOV BX, 0 ; DIV BX
    boot(&mut c, &[0xB8, 0x10, 0x00, 0xBB, 0x00, 0x00, 0xF7, 0xF3]);
    run(&mut c, 3);
    assert_eq!(c.seg(SegId::Cs).sel, 0x1200);
    // The pushed IP points back at the DIV instruction so it restarts
    // after the handler fixes the divisor.
    let pushed_ip = c.bus.read_word(0x40000 + c.regs[REG_SP]);
    assert_eq!(pushed_ip, 0x0006);
    assert_eq!(c.fault_state(), Some(0x00));
}

#[test]
fn divide_overflow_also_faults() {
    let mut c = cpu8086();
    c.bus.load_program(0x12000, &[0xF4]);
    c.bus.load_program(0x00, &[0x00, 0x00, 0x00, 0x12]);
    // DX:AX = 0x00100000 / 1 does not fit in 16 bits.
    boot(&mut c, &[0xF7, 0xF3]); // DIV BX
    c.regs[REG_AX] = 0x0000;
    c.regs[super::super::REG_DX] = 0x0010;
    c.regs[REG_BX] = 0x0001;
    run(&mut c, 1);
    assert_eq!(c.seg(SegId::Cs).sel, 0x1200);
}

#[test]
fn int3_reports_following_instruction() {
    let mut c = cpu8086();
    c.bus.load_program(0x12000, &[0xF4]);
    c.bus.load_program(0x03 * 4, &[0x00, 0x00, 0x00, 0x12]);
    boot(&mut c, &[0xCC]); // INT3
    run(&mut c, 1);
    let pushed_ip = c.bus.read_word(0x40000 + c.regs[REG_SP]);
    // Trap class: the saved IP is past the INT3, not at it.
    assert_eq!(pushed_ip, 0x0001);
}

#[test]
fn into_fires_only_on_overflow() {
    let mut c = cpu8086();
    c.bus.load_program(0x12000, &[0xF4]);
    c.bus.load_program(0x04 * 4, &[0x00, 0x00, 0x00, 0x12]);
    // MOV AL, 0x7F ; ADD AL, 1 (OF=1) ; INTO
    boot(&mut c, &[0xB0, 0x7F, 0x04, 0x01, 0xCE]);
    run(&mut c, 3);
    assert_eq!(c.seg(SegId::Cs).sel, 0x1200);

    let mut c = cpu8086();
    c.bus.load_program(0x12000, &[0xF4]);
    c.bus.load_program(0x04 * 4, &[0x00, 0x00, 0x00, 0x12]);
    // XOR AL, AL ; INTO ; MOV BX, 1
    boot(&mut c, &[0x30, 0xC0, 0xCE, 0xBB, 0x01, 0x00]);
    run(&mut c, 3);
    assert_eq!(c.seg(SegId::Cs).sel, 0x1000);
    assert_eq!(c.regs[REG_BX] & 0xFFFF, 1);
}

#[test]
fn undefined_opcode_faults_ud() {
    let mut c = cpu8086();
    c.bus.load_program(0x12000, &[0xF4]);
    c.bus.load_program(0x06 * 4, &[0x00, 0x00, 0x00, 0x12]);
    boot(&mut c, &[0xF1]);
    run(&mut c, 1);
    assert_eq!(c.seg(SegId::Cs).sel, 0x1200);
    let pushed_ip = c.bus.read_word(0x40000 + c.regs[REG_SP]);
    assert_eq!(pushed_ip, 0x0000);
}

#[test]
fn single_step_trap_fires_after_instruction() {
    let mut c = cpu8086();
    c.bus.load_program(0x12000, &[0xF4]);
    c.bus.load_program(0x01 * 4, &[0x00, 0x00, 0x00, 0x12]);
    boot(&mut c, &[0xB8, 0x05, 0x00, 0xBB, 0x07, 0x00]);
    c.set_flag(super::super::PS_TF, true);
    run(&mut c, 1);
    // The MOV retired, then the trap was taken.
    assert_eq!(c.regs[REG_AX] & 0xFFFF, 5);
    assert_eq!(c.seg(SegId::Cs).sel, 0x1200);
    let pushed_ip = c.bus.read_word(0x40000 + c.regs[REG_SP]);
    assert_eq!(pushed_ip, 0x0003);
}

#[test]
fn triple_fault_resets_the_cpu() {
    let mut c = cpu8086();
    // An empty IVT: the divide fault cannot dispatch, the synthesized
    // double fault cannot dispatch either, so the CPU resets.
    c.idt = DescTableReg { base: 0, limit: 0 };
    boot(&mut c, &[0xB8, 0x10, 0x00, 0xBB, 0x00, 0x00, 0xF7, 0xF3]);
    run(&mut c, 3);
    assert_eq!(c.seg(SegId::Cs).sel, 0xFFFF);
    assert_eq!(c.eip, 0);
    assert!(c.fault_state().is_none());
}

const GDT_BASE: u32 = 0x0800;
const SEL_CODE0: u16 = 0x08;
const SEL_STACK0: u16 = 0x18;
const SEL_CODE3: u16 = 0x28;
const SEL_STACK3: u16 = 0x38;
const SEL_TSS: u16 = 0x40;

/// A 286 in protected mode at CPL 3 with an interrupt gate for vector
/// 0x21 leading to DPL0 code, and a TSS naming the ring-0 stack.
fn gate_cpu() -> CpuX86<VecBus> {
    let mut c = cpu_model(CpuModel::Intel80286);
    let gdt = |c: &mut CpuX86<VecBus>, sel: u16, bytes: [u8; 8]| {
        c.bus.load_program(GDT_BASE + (sel & !7) as u32, &bytes);
    };
    gdt(&mut c, SEL_CODE0, make_desc(0x10000, 0xFFFF, 0x9A, 0));
    gdt(&mut c, SEL_STACK0, make_desc(0x40000, 0xFFFF, 0x92, 0));
    gdt(&mut c, SEL_CODE3, make_desc(0x10000, 0xFFFF, 0xFA, 0));
    gdt(&mut c, SEL_STACK3, make_desc(0x48000, 0xFFFF, 0xF2, 0));
    gdt(&mut c, SEL_TSS, make_desc(0x5000, 0x2B, 0x83, 0));
    c.gdt = DescTableReg {
        base: GDT_BASE,
        limit: 0x00FF,
    };

    // IDT at 0xA00; vector 0x21 is a DPL3 286 interrupt gate to
    // SEL_CODE0:0x0300.
    let idt_base = 0x0A00;
    c.bus.load_program(
        idt_base + 0x21 * 8,
        &make_gate(0x0300, SEL_CODE0, 0, 0xE6),
    );
    c.idt = DescTableReg {
        base: idt_base,
        limit: 0x02FF,
    };

    // Current TSS holds the ring-0 stack: SS0:SP0 = SEL_STACK0:0x0800.
    c.bus.load_program(0x5002, &[0x00, 0x08, 0x18, 0x00]);
    c.tr = SegReg {
        sel: SEL_TSS,
        base: 0x5000,
        limit: 0x2B,
        acc: 0x8300,
        ext: 0,
        dpl: 0,
        desc_addr: Some(GDT_BASE + SEL_TSS as u32),
    };

    c.cr0 |= CR0_PE;
    c.set_prot_mode(true);
    c.segs[SegId::Cs as usize] = SegReg {
        sel: SEL_CODE3 | 3,
        base: 0x10000,
        limit: 0xFFFF,
        acc: 0xFA00,
        ext: 0,
        dpl: 3,
        desc_addr: Some(GDT_BASE + SEL_CODE3 as u32),
    };
    c.segs[SegId::Ss as usize] = SegReg {
        sel: SEL_STACK3 | 3,
        base: 0x48000,
        limit: 0xFFFF,
        acc: 0xF200,
        ext: 0,
        dpl: 3,
        desc_addr: Some(GDT_BASE + SEL_STACK3 as u32),
    };
    c.cpl = 3;
    c.regs[REG_SP] = 0x1000;
    c.eip = 0;
    c
}

#[test]
fn interrupt_gate_switches_stack_and_clears_if() {
    let mut c = gate_cpu();
    c.set_flag(PS_IF, true);
    // INT 0x21 at CPL 3; handler: IRET at 0x0300.
    c.bus.load_program(0x10000, &[0xCD, 0x21]);
    c.bus.load_program(0x10300, &[0xCF]);
    let old_ps = c.get_ps();
    run(&mut c, 1);

    // Now on the ring-0 stack from the TSS.
    assert_eq!(c.cpl(), 0);
    assert_eq!(c.seg(SegId::Ss).sel, SEL_STACK0);
    assert_eq!(c.seg(SegId::Cs).sel, SEL_CODE0);
    assert_eq!(c.eip, 0x0300);
    assert!(!c.get_flag(PS_IF), "interrupt gate clears IF");

    // Five words pushed: old SS, SP, FLAGS, CS, IP.
    let sp = c.regs[REG_SP];
    assert_eq!(sp, 0x0800 - 10);
    let stack = |c: &CpuX86<VecBus>, off: u32| c.bus.read_word(0x40000 + sp + off);
    assert_eq!(stack(&c, 8), (SEL_STACK3 | 3) as u16);
    assert_eq!(stack(&c, 6), 0x1000);
    assert_eq!(stack(&c, 4), (old_ps & 0xFFFF) as u16);
    assert_eq!(stack(&c, 2), (SEL_CODE3 | 3) as u16);
    assert_eq!(stack(&c, 0), 0x0002);
}

#[test]
fn iret_returns_to_outer_level() {
    let mut c = gate_cpu();
    c.set_flag(PS_IF, true);
    c.bus.load_program(0x10000, &[0xCD, 0x21, 0xBB, 0x09, 0x00]);
    c.bus.load_program(0x10300, &[0xCF]);
    run(&mut c, 2);
    // Back at CPL 3 on the user stack, after the INT.
    assert_eq!(c.cpl(), 3);
    assert_eq!(c.seg(SegId::Ss).sel, SEL_STACK3 | 3);
    assert_eq!(c.regs[REG_SP], 0x1000);
    assert_eq!(c.eip, 0x0002);
    assert!(c.get_flag(PS_IF), "IRET restores IF");
    run(&mut c, 1);
    assert_eq!(c.regs[REG_BX] & 0xFFFF, 9);
}

#[test]
fn software_int_honours_gate_dpl() {
    let mut c = gate_cpu();
    // Re-write the gate with DPL 0; INT 0x21 from CPL 3 must #GP with
    // the IDT-flavoured error code.
    c.bus.load_program(
        0x0A00 + 0x21 * 8,
        &make_gate(0x0300, SEL_CODE0, 0, 0x86),
    );
    c.bus.load_program(0x10000, &[0xCD, 0x21]);
    let err = c.do_interrupt(0x21, super::super::interrupt::IntKind::Software)
        .unwrap_err();
    assert_eq!(err.vector, INT_GP);
    assert_eq!(err.code, Some((0x21 << 3) | 2));
}

#[test]
fn error_code_pushed_for_gp_in_protected_mode() {
    let mut c = gate_cpu();
    // Vector 0x0D as a DPL0 interrupt gate to ring-0 code.
    c.bus.load_program(
        0x0A00 + 0x0D * 8,
        &make_gate(0x0310, SEL_CODE0, 0, 0x86),
    );
    c.bus.load_program(0x10310, &[0xF4]);
    // CPL3 code touching a null ES faults GP(0).
    // MOV AX, [ES:0] via override: 26 A1 00 00
    c.segs[SegId::Es as usize] = SegReg {
        sel: 0,
        base: 0,
        limit: 0,
        acc: 0,
        ext: 0,
        dpl: 0,
        desc_addr: None,
    };
    c.bus.load_program(0x10000, &[0x26, 0xA1, 0x00, 0x00]);
    run(&mut c, 1);
    assert_eq!(c.cpl(), 0);
    assert_eq!(c.eip & 0xFFFF, 0x0310);
    // Error code 0 sits on top of the new stack, below IP/CS/FLAGS.
    let sp = c.regs[REG_SP];
    assert_eq!(c.bus.read_word(0x40000 + sp), 0x0000);
    assert_eq!(c.fault_state(), Some(0x0D));
}

//! Exceptions, interrupts, and the escalation ladder.
//!
//! Architectural exceptions travel as [`Fault`] values through `Result`;
//! the burst loop hands them to [`CpuX86::handle_fault`], which rewinds
//! EIP for restartable vectors, escalates nested faults to a double fault,
//! resets the CPU on a triple fault, and otherwise dispatches through the
//! IDT like any other interrupt. Host-level invariant failures are the
//! separate [`CpuError`] type and never reach guest software.

use super::flags::{PS_IF, PS_NT, PS_TF};
use super::segment::{desc, idt_error, sel_error, SegId};
use super::task::TaskNest;
use super::{CpuX86, OpSize};
use crate::logging::{log, LogCategory, LogLevel};
use crate::Bus;
use thiserror::Error;

// Exception vectors.
pub const INT_DE: u8 = 0x00; // divide error
pub const INT_DB: u8 = 0x01; // debug/single-step
pub const INT_BP: u8 = 0x03; // breakpoint (INT3)
pub const INT_OF: u8 = 0x04; // overflow (INTO)
pub const INT_BR: u8 = 0x05; // BOUND range
pub const INT_UD: u8 = 0x06; // invalid opcode
pub const INT_NM: u8 = 0x07; // no math unit
pub const INT_DF: u8 = 0x08; // double fault
pub const INT_TS: u8 = 0x0A; // invalid TSS
pub const INT_NP: u8 = 0x0B; // segment not present
pub const INT_SS: u8 = 0x0C; // stack fault
pub const INT_GP: u8 = 0x0D; // general protection
pub const INT_PF: u8 = 0x0E; // page fault
pub const INT_MF: u8 = 0x10; // math fault

/// An architectural exception: vector plus the error code pushed for the
/// vectors that carry one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    pub vector: u8,
    pub code: Option<u16>,
}

impl Fault {
    pub fn de() -> Self {
        Fault { vector: INT_DE, code: None }
    }

    pub fn br() -> Self {
        Fault { vector: INT_BR, code: None }
    }

    pub fn ud() -> Self {
        Fault { vector: INT_UD, code: None }
    }

    pub fn nm() -> Self {
        Fault { vector: INT_NM, code: None }
    }

    pub fn ts(code: u16) -> Self {
        Fault { vector: INT_TS, code: Some(code) }
    }

    pub fn np(code: u16) -> Self {
        Fault { vector: INT_NP, code: Some(code) }
    }

    pub fn ss(code: u16) -> Self {
        Fault { vector: INT_SS, code: Some(code) }
    }

    pub fn gp(code: u16) -> Self {
        Fault { vector: INT_GP, code: Some(code) }
    }

    pub fn pf(code: u16) -> Self {
        Fault { vector: INT_PF, code: Some(code) }
    }

    pub fn mf() -> Self {
        Fault { vector: INT_MF, code: None }
    }

    fn double() -> Self {
        Fault { vector: INT_DF, code: Some(0) }
    }

    /// Restartable faults rewind EIP to the faulting instruction; traps
    /// and aborts do not.
    pub fn is_restartable(&self) -> bool {
        matches!(
            self.vector,
            INT_DE | INT_BR | INT_UD | INT_NM | INT_TS | INT_NP | INT_SS | INT_GP | INT_PF
                | INT_MF
        )
    }
}

/// Host-level invariant failures: never delivered to the guest, always
/// surfaced to the containing machine.
#[derive(Debug, Error)]
pub enum CpuError {
    #[error("invalid machine configuration: {0}")]
    Config(String),
    #[error("corrupted snapshot: {0}")]
    Snapshot(String),
    #[error("bus contract violation: {0}")]
    Bus(String),
}

/// How an interrupt entered the CPU; decides privilege checks, the EXT
/// bit of dispatch error codes, and error-code pushing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IntKind {
    /// External maskable interrupt acknowledged between instructions.
    Hardware,
    /// INT n / INT3 / INTO: the gate DPL must admit the current CPL.
    Software,
    /// Trap-class exception delivered after the instruction retired.
    Trap,
    /// Fault-class exception, optionally carrying an error code.
    Fault(Option<u16>),
}

impl<B: Bus> CpuX86<B> {
    /// Entry point for every raised [`Fault`]: restores the restart point,
    /// tracks nesting, and dispatches (or escalates).
    pub(crate) fn handle_fault(&mut self, fault: Fault) {
        log(LogCategory::Interrupt, LogLevel::Debug, || {
            format!(
                "fault {:#04x} code {:?} at {:#06x}:{:#x} opcode {:#04x}",
                fault.vector,
                fault.code,
                self.seg(SegId::Cs).sel,
                self.op_eip,
                self.bus.read_byte_direct(self.op_lip & self.model().addr_mask())
            )
        });
        if fault.is_restartable() {
            self.eip = self.op_eip;
        }
        // A fault that interrupted a multi-step instruction may have left
        // the access brakes on; release them before the handler runs.
        self.op_flags
            .remove(super::OpFlags::NOREAD | super::OpFlags::NOWRITE);

        let fault = match self.nfault {
            None => {
                self.nfault = Some(fault.vector);
                fault
            }
            Some(prev) if prev == INT_DF || fault.vector == INT_DF => {
                // A fault while servicing a double fault shuts the
                // machine down the only way it can: reset.
                log(LogCategory::Interrupt, LogLevel::Error, || {
                    "triple fault, resetting CPU".to_string()
                });
                self.reset_regs();
                return;
            }
            Some(_) => {
                self.nfault = Some(INT_DF);
                Fault::double()
            }
        };

        if let Err(next) = self.do_interrupt(fault.vector, IntKind::Fault(fault.code)) {
            self.handle_fault(next);
        }
    }

    /// Dispatch an interrupt or exception through the IVT/IDT.
    pub(crate) fn do_interrupt(&mut self, vector: u8, kind: IntKind) -> Result<(), Fault> {
        self.charge(self.cyc.int_n);
        if self.prot_mode() {
            self.interrupt_prot(vector, kind)
        } else {
            self.interrupt_real(vector)
        }
    }

    /// Real-mode dispatch: four-byte IVT entries, 16-bit pushes.
    fn interrupt_real(&mut self, vector: u8) -> Result<(), Fault> {
        let off = (vector as u32) * 4;
        if off.wrapping_add(3) > self.idt.limit {
            return Err(Fault::gp(idt_error(vector, false)));
        }
        let addr = self.idt.base.wrapping_add(off);
        let new_ip = self.read_linear_word(addr)?;
        let new_cs = self.read_linear_word(addr.wrapping_add(2))?;

        let ps = self.get_ps();
        self.push_sized(ps, OpSize::Word)?;
        self.push_sized(self.seg(SegId::Cs).sel as u32, OpSize::Word)?;
        self.push_sized(self.eip & 0xFFFF, OpSize::Word)?;

        self.set_flag(PS_IF, false);
        self.set_flag(PS_TF, false);
        self.load_seg_real(SegId::Cs, new_cs);
        self.eip = new_ip as u32;
        Ok(())
    }

    /// Protected-mode dispatch through an IDT gate.
    fn interrupt_prot(&mut self, vector: u8, kind: IntKind) -> Result<(), Fault> {
        let ext = matches!(kind, IntKind::Hardware);
        let off = (vector as u32) * 8;
        if off.wrapping_add(7) > self.idt.limit {
            return Err(Fault::gp(idt_error(vector, ext)));
        }
        let gate = self.read_descriptor_at(self.idt.base.wrapping_add(off))?;

        // Software INT honours the gate DPL so user code cannot invoke
        // arbitrary vectors; hardware and exceptions skip the check.
        if kind == IntKind::Software && gate.dpl() < self.cpl {
            return Err(Fault::gp(idt_error(vector, false)));
        }

        let (gate_size, clear_if) = match gate.typ() {
            desc::TYPE_GATE_TASK => {
                if !gate.present() {
                    return Err(Fault::np(idt_error(vector, ext)));
                }
                return self.task_gate_interrupt(&gate, ext);
            }
            desc::TYPE_GATE_INT286 => (OpSize::Word, true),
            desc::TYPE_GATE_TRAP286 => (OpSize::Word, false),
            desc::TYPE_GATE_INT386 => (OpSize::Dword, true),
            desc::TYPE_GATE_TRAP386 => (OpSize::Dword, false),
            _ => return Err(Fault::gp(idt_error(vector, ext))),
        };
        if !gate.present() {
            return Err(Fault::np(idt_error(vector, ext)));
        }

        let sel = gate.gate_selector();
        if sel & 0xFFFC == 0 {
            return Err(Fault::gp(ext as u16));
        }
        let target = self.read_descriptor(sel)?;
        if !target.is_code() {
            return Err(Fault::gp(sel_error(sel, ext)));
        }
        if !target.present() {
            return Err(Fault::np(sel_error(sel, ext)));
        }

        let old_ps = self.get_ps();
        let old_cs = self.seg(SegId::Cs).sel as u32;
        let old_eip = self.eip;

        let dpl = target.dpl();
        if !target.is_conforming() && dpl < self.cpl {
            // Inter-privilege: switch to the handler's stack from the TSS,
            // then push the outer context onto it.
            let (new_ss, new_sp) = self.tss_stack(dpl)?;
            let old_ss = self.seg(SegId::Ss).sel as u32;
            let old_sp = self.regs[super::REG_SP];

            self.load_stack_for_level(new_ss, new_sp, dpl)?;
            self.push_sized(old_ss, gate_size)?;
            self.push_sized(old_sp, gate_size)?;
            self.push_sized(old_ps, gate_size)?;
            self.push_sized(old_cs, gate_size)?;
            self.push_sized(old_eip, gate_size)?;
            self.commit_cs(sel, &target, dpl);
        } else if target.is_conforming() || dpl == self.cpl {
            self.push_sized(old_ps, gate_size)?;
            self.push_sized(old_cs, gate_size)?;
            self.push_sized(old_eip, gate_size)?;
            let cpl = self.cpl;
            self.commit_cs(sel, &target, cpl);
        } else {
            return Err(Fault::gp(sel_error(sel, ext)));
        }

        if let IntKind::Fault(Some(code)) = kind {
            self.push_sized(code as u32, gate_size)?;
        }

        let offset = gate.gate_offset();
        if offset > self.seg(SegId::Cs).limit {
            return Err(Fault::gp(0));
        }
        self.eip = offset;
        if clear_if {
            self.set_flag(PS_IF, false);
        }
        self.set_flag(PS_TF, false);
        self.set_flag(PS_NT, false);
        Ok(())
    }

    /// Interrupt through a task gate: a full task switch that nests the
    /// outgoing task.
    fn task_gate_interrupt(
        &mut self,
        gate: &super::segment::Descriptor,
        ext: bool,
    ) -> Result<(), Fault> {
        let tss_sel = gate.gate_selector();
        if tss_sel & 0xFFFC == 0 || tss_sel & 0x0004 != 0 {
            return Err(Fault::gp(sel_error(tss_sel, ext)));
        }
        self.switch_task(tss_sel, TaskNest::CallOrInt)
    }
}

//! Intel x86 CPU core (8086 through 80386).
//!
//! A generic, reusable execution engine that works with any machine through
//! the [`Bus`] trait. The core covers the real-mode 8086/8088/80186/80188,
//! the 80286 with protected-mode segmentation, and the early 80386 with
//! 32-bit operands, paging, and the extended instruction map.
//!
//! Execution is organized as bursts: [`CpuX86::step_cpu`] runs instructions
//! until a cycle budget is exhausted, always stopping on an instruction
//! boundary. Architectural exceptions are delivered to the guest through
//! the IDT and never escape to the host.

mod alu;
mod control;
mod decode;
mod exec;
mod flags;
mod interrupt;
mod memory;
mod paging;
mod segment;
mod state;
mod string;
mod task;

#[cfg(test)]
mod tests;

pub use flags::{
    PS_AF, PS_CF, PS_DF, PS_IF, PS_IOPL, PS_NT, PS_OF, PS_PF, PS_SF, PS_TF, PS_ZF,
};
pub use interrupt::{CpuError, Fault};
pub use segment::{desc, DescTableReg, SegId, SegReg};
pub use state::{CpuConfig, CpuSnapshot};

use crate::logging::{log, LogCategory, LogLevel};
use crate::Bus;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// CPU model/variant selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CpuModel {
    /// Intel 8086 (1978), 16-bit registers, 20-bit addressing
    #[default]
    Intel8086,
    /// Intel 8088 (1979), 8-bit external bus variant of the 8086
    Intel8088,
    /// Intel 80186 (1982), enhanced instruction set
    Intel80186,
    /// Intel 80188 (1982), 8-bit external bus variant of the 80186
    Intel80188,
    /// Intel 80286 (1982), protected mode, 24-bit addressing
    Intel80286,
    /// Intel 80386 (1985), 32-bit registers, paging, 32-bit addressing
    Intel80386,
}

impl CpuModel {
    /// Returns true if this model supports the 80186 instruction additions.
    pub fn has_80186_ops(&self) -> bool {
        !matches!(self, CpuModel::Intel8086 | CpuModel::Intel8088)
    }

    /// Returns true if this model supports the 80286 system instructions.
    pub fn has_80286_ops(&self) -> bool {
        matches!(self, CpuModel::Intel80286 | CpuModel::Intel80386)
    }

    /// Returns true if this model supports the 80386 instruction set.
    pub fn has_80386_ops(&self) -> bool {
        matches!(self, CpuModel::Intel80386)
    }

    /// Parse the model number used in machine descriptions.
    pub fn from_number(n: u32) -> Option<Self> {
        match n {
            8086 => Some(CpuModel::Intel8086),
            8088 => Some(CpuModel::Intel8088),
            80186 => Some(CpuModel::Intel80186),
            80188 => Some(CpuModel::Intel80188),
            80286 => Some(CpuModel::Intel80286),
            80386 => Some(CpuModel::Intel80386),
            _ => None,
        }
    }

    /// Model number as it appears in machine descriptions.
    pub fn number(&self) -> u32 {
        match self {
            CpuModel::Intel8086 => 8086,
            CpuModel::Intel8088 => 8088,
            CpuModel::Intel80186 => 80186,
            CpuModel::Intel80188 => 80188,
            CpuModel::Intel80286 => 80286,
            CpuModel::Intel80386 => 80386,
        }
    }

    /// Display name.
    pub fn name(&self) -> &'static str {
        match self {
            CpuModel::Intel8086 => "Intel 8086",
            CpuModel::Intel8088 => "Intel 8088",
            CpuModel::Intel80186 => "Intel 80186",
            CpuModel::Intel80188 => "Intel 80188",
            CpuModel::Intel80286 => "Intel 80286",
            CpuModel::Intel80386 => "Intel 80386",
        }
    }

    /// Physical address bus mask: 20-bit, 24-bit, or 32-bit.
    pub fn addr_mask(&self) -> u32 {
        match self {
            CpuModel::Intel8086 | CpuModel::Intel8088 => 0x000F_FFFF,
            CpuModel::Intel80186 | CpuModel::Intel80188 => 0x000F_FFFF,
            CpuModel::Intel80286 => 0x00FF_FFFF,
            CpuModel::Intel80386 => 0xFFFF_FFFF,
        }
    }
}

/// Operand width for the width-parametric helpers. Values travel as `u32`
/// with the unused high bits ignored; `mask` trims them at commit points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpSize {
    Byte,
    Word,
    Dword,
}

impl OpSize {
    #[inline]
    pub fn mask(self) -> u32 {
        match self {
            OpSize::Byte => 0xFF,
            OpSize::Word => 0xFFFF,
            OpSize::Dword => 0xFFFF_FFFF,
        }
    }

    #[inline]
    pub fn sign_bit(self) -> u32 {
        match self {
            OpSize::Byte => 0x80,
            OpSize::Word => 0x8000,
            OpSize::Dword => 0x8000_0000,
        }
    }

    #[inline]
    pub fn bytes(self) -> u32 {
        match self {
            OpSize::Byte => 1,
            OpSize::Word => 2,
            OpSize::Dword => 4,
        }
    }

    #[inline]
    pub fn bits(self) -> u32 {
        self.bytes() * 8
    }
}

bitflags! {
    /// Per-instruction operation flags. The prefix subset survives into
    /// `op_prefixes` at the next instruction boundary; everything else is
    /// reset.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpFlags: u32 {
        /// A segment-override prefix is in force.
        const SEG = 0x0001;
        /// LOCK prefix seen.
        const LOCK = 0x0002;
        /// REP/REPZ prefix seen.
        const REPZ = 0x0004;
        /// REPNZ prefix seen.
        const REPNZ = 0x0008;
        /// Operand-size override (0x66) seen.
        const DATASIZE = 0x0010;
        /// Address-size override (0x67) seen.
        const ADDRSIZE = 0x0020;
        /// Delay interrupt acknowledgement past the next instruction.
        const NOINTR = 0x0100;
        /// Suppress the dispatcher's operand write-back.
        const NOWRITE = 0x0200;
        /// Suppress further operand reads after a mid-instruction fault.
        const NOREAD = 0x0400;
    }
}

impl OpFlags {
    /// The bits carried into `op_prefixes` at each instruction boundary.
    pub const PREFIXES: OpFlags = OpFlags::from_bits_truncate(0x003F);
}

bitflags! {
    /// External event latch, set by the containing machine and consumed at
    /// instruction boundaries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IntFlags: u32 {
        /// A maskable interrupt is pending.
        const INTR = 0x0001;
        /// The CPU executed HLT and is waiting for an interrupt.
        const HALT = 0x0002;
    }
}

/// Register file indices (instruction encoding order).
pub const REG_AX: usize = 0;
pub const REG_CX: usize = 1;
pub const REG_DX: usize = 2;
pub const REG_BX: usize = 3;
pub const REG_SP: usize = 4;
pub const REG_BP: usize = 5;
pub const REG_SI: usize = 6;
pub const REG_DI: usize = 7;

/// Per-model cycle cost constants, looked up by operation and operand
/// locality. Counts are representative per-instruction tallies, not a
/// bus-accurate timing model.
#[derive(Debug, Clone)]
pub(crate) struct CycleTable {
    pub alu_rr: u32,
    pub alu_rm: u32,
    pub mov_rr: u32,
    pub mov_rm: u32,
    pub inc_r: u32,
    pub inc_m: u32,
    pub shift_r: u32,
    pub shift_m: u32,
    pub shift_per_bit: u32,
    pub mul: u32,
    pub div: u32,
    pub jcc_taken: u32,
    pub jcc_not_taken: u32,
    pub jmp_near: u32,
    pub jmp_far: u32,
    pub call_near: u32,
    pub call_far: u32,
    pub ret_near: u32,
    pub ret_far: u32,
    pub push: u32,
    pub pop: u32,
    pub int_n: u32,
    pub iret: u32,
    pub string_iter: u32,
    pub io: u32,
    pub seg_load: u32,
    pub task_switch: u32,
    pub base: u32,
    pub prefix: u32,
}

impl CycleTable {
    fn for_model(model: CpuModel) -> Self {
        if model.has_80386_ops() {
            CycleTable {
                alu_rr: 2,
                alu_rm: 6,
                mov_rr: 2,
                mov_rm: 4,
                inc_r: 2,
                inc_m: 6,
                shift_r: 3,
                shift_m: 7,
                shift_per_bit: 0,
                mul: 17,
                div: 25,
                jcc_taken: 7,
                jcc_not_taken: 3,
                jmp_near: 7,
                jmp_far: 12,
                call_near: 7,
                call_far: 17,
                ret_near: 10,
                ret_far: 18,
                push: 2,
                pop: 4,
                int_n: 37,
                iret: 22,
                string_iter: 4,
                io: 12,
                seg_load: 18,
                task_switch: 200,
                base: 2,
                prefix: 0,
            }
        } else if model.has_80286_ops() {
            CycleTable {
                alu_rr: 2,
                alu_rm: 7,
                mov_rr: 2,
                mov_rm: 5,
                inc_r: 2,
                inc_m: 7,
                shift_r: 5,
                shift_m: 8,
                shift_per_bit: 1,
                mul: 21,
                div: 25,
                jcc_taken: 7,
                jcc_not_taken: 3,
                jmp_near: 7,
                jmp_far: 11,
                call_near: 7,
                call_far: 13,
                ret_near: 11,
                ret_far: 15,
                push: 3,
                pop: 5,
                int_n: 23,
                iret: 17,
                string_iter: 4,
                io: 5,
                seg_load: 17,
                task_switch: 180,
                base: 2,
                prefix: 0,
            }
        } else {
            CycleTable {
                alu_rr: 3,
                alu_rm: 16,
                mov_rr: 2,
                mov_rm: 9,
                inc_r: 3,
                inc_m: 15,
                shift_r: 2,
                shift_m: 15,
                shift_per_bit: 4,
                mul: 70,
                div: 80,
                jcc_taken: 16,
                jcc_not_taken: 4,
                jmp_near: 15,
                jmp_far: 15,
                call_near: 19,
                call_far: 28,
                ret_near: 16,
                ret_far: 26,
                push: 11,
                pop: 8,
                int_n: 51,
                iret: 32,
                string_iter: 17,
                io: 10,
                seg_load: 9,
                task_switch: 0,
                base: 2,
                prefix: 2,
            }
        }
    }
}

/// Intel x86 CPU state and execution engine.
///
/// Generic over the machine's [`Bus`]; all architectural and hidden state
/// lives here, and every operation receives the CPU by mutable reference.
#[derive(Debug)]
pub struct CpuX86<B: Bus> {
    /// Linear address space and I/O ports, owned by the CPU for the burst.
    pub bus: B,

    model: CpuModel,

    /// General registers in instruction encoding order:
    /// EAX, ECX, EDX, EBX, ESP, EBP, ESI, EDI. 16-bit models use the low
    /// halves; the high halves stay zero.
    pub regs: [u32; 8],

    /// Instruction pointer (IP in the low 16 bits).
    pub eip: u32,

    // Directly-stored PS bits plus any flags materialised out of the cache.
    pub(crate) ps: u32,
    // Bits the model implements and bits the model forces set.
    pub(crate) ps_mask: u32,
    pub(crate) ps_set: u32,

    // Lazy flag cache (see flags.rs for the materialisation rules).
    pub(crate) res_dst: u32,
    pub(crate) res_src: u32,
    pub(crate) res_arith: u32,
    pub(crate) res_logic: u32,
    pub(crate) res_type: u32,

    /// Segment register shadow records, indexed by [`SegId`].
    pub(crate) segs: [SegReg; 6],
    /// Current privilege level, updated on CS loads.
    pub(crate) cpl: u8,
    pub(crate) gdt: DescTableReg,
    pub(crate) idt: DescTableReg,
    pub(crate) ldt: SegReg,
    pub(crate) tr: SegReg,

    /// CR0 (the MSW subset on the 80286).
    pub cr0: u32,
    /// Page-fault linear address (80386).
    pub cr2: u32,
    /// Page-directory base (80386).
    pub cr3: u32,
    /// Debug registers DR0-DR7.
    pub dr: [u32; 8],

    pub(crate) op_flags: OpFlags,
    pub(crate) op_prefixes: OpFlags,
    pub(crate) int_flags: IntFlags,
    pub(crate) intr_vector: Option<u8>,
    /// Vector of the fault currently being serviced, if any.
    pub(crate) nfault: Option<u8>,
    halted: bool,

    pub(crate) seg_override: Option<SegId>,
    /// Operand size in force for the current instruction.
    pub(crate) d_size: OpSize,
    /// Address-size mask in force for the current instruction.
    pub(crate) a_mask: u32,
    /// Memory operand of the current ModR/M decode; `None` for a register
    /// operand (the source model's ADDR_INVALID sentinel).
    pub(crate) ea: Option<(SegId, u32)>,
    /// Captured write-back target for the dispatcher.
    pub(crate) ea_write: Option<(SegId, u32)>,

    /// EIP at instruction start, the restart point for faults.
    pub(crate) op_eip: u32,
    /// Linear address of the instruction start, for diagnostics.
    pub(crate) op_lip: u32,
    last_opcode: u8,

    /// Total cycles executed.
    pub cycles: u64,
    /// Remaining budget for the current burst; execution yields when it
    /// goes non-positive.
    pub(crate) cycles_left: i64,

    pub(crate) cyc: CycleTable,

    auto_start: bool,
}

impl<B: Bus> CpuX86<B> {
    /// Create a new CPU with the default model (8086).
    pub fn new(bus: B) -> Self {
        Self::with_model(bus, CpuModel::Intel8086)
    }

    /// Create a new CPU with a specific model.
    pub fn with_model(bus: B, model: CpuModel) -> Self {
        let mut cpu = Self {
            bus,
            model,
            regs: [0; 8],
            eip: 0,
            ps: 0,
            ps_mask: 0,
            ps_set: 0,
            res_dst: 0,
            res_src: 0,
            res_arith: 0,
            res_logic: 0,
            res_type: 0,
            segs: SegReg::file(),
            cpl: 0,
            gdt: DescTableReg::default(),
            idt: DescTableReg::default(),
            ldt: SegReg::system(),
            tr: SegReg::system(),
            cr0: 0,
            cr2: 0,
            cr3: 0,
            dr: [0; 8],
            op_flags: OpFlags::empty(),
            op_prefixes: OpFlags::empty(),
            int_flags: IntFlags::empty(),
            intr_vector: None,
            nfault: None,
            halted: false,
            seg_override: None,
            d_size: OpSize::Word,
            a_mask: 0xFFFF,
            ea: None,
            ea_write: None,
            op_eip: 0,
            op_lip: 0,
            last_opcode: 0,
            cycles: 0,
            cycles_left: 0,
            cyc: CycleTable::for_model(model),
            auto_start: false,
        };
        cpu.reset_regs();
        cpu
    }

    /// Build a CPU from a machine-description component entry.
    pub fn from_config(bus: B, config: &CpuConfig) -> Self {
        let mut cpu = Self::with_model(bus, config.model);
        cpu.auto_start = config.auto_start;
        cpu
    }

    /// Get the CPU model.
    pub fn model(&self) -> CpuModel {
        self.model
    }

    /// Change the CPU model; takes effect at the next reset.
    pub fn set_model(&mut self, model: CpuModel) {
        self.model = model;
        self.cyc = CycleTable::for_model(model);
    }

    /// Return the registers and machine state to the architectural reset
    /// state. Memory and the model are preserved.
    pub fn reset_regs(&mut self) {
        self.regs = [0; 8];
        self.res_dst = 0;
        self.res_src = 0;
        self.res_arith = 0;
        self.res_logic = 0;
        self.res_type = 0;
        self.cr2 = 0;
        self.cr3 = 0;
        self.dr = [0; 8];
        self.op_flags = OpFlags::empty();
        self.op_prefixes = OpFlags::empty();
        self.int_flags = IntFlags::empty();
        self.intr_vector = None;
        self.nfault = None;
        self.halted = false;
        self.seg_override = None;
        self.ea = None;
        self.ea_write = None;
        self.cpl = 0;

        // PS bit model: the 8086/80186 family forces bits 12-15 on; the
        // 80286 adds IOPL/NT as real bits; the 80386 adds RF/VM.
        if self.model.has_80386_ops() {
            self.ps_mask = 0x0003_7FD5;
            self.ps_set = 0x0002;
        } else if self.model.has_80286_ops() {
            self.ps_mask = 0x0000_7FD5;
            self.ps_set = 0x0002;
        } else {
            self.ps_mask = 0x0000_0FD5;
            self.ps_set = 0xF002;
        }
        self.ps = self.ps_set;

        self.gdt = DescTableReg { base: 0, limit: 0xFFFF };
        // Real-mode IVT: 256 four-byte vectors at linear 0.
        self.idt = DescTableReg { base: 0, limit: 0x03FF };
        self.ldt = SegReg::system();
        self.tr = SegReg::system();

        if self.model.has_80286_ops() {
            // MSW resets with the reserved high bits set on the 80286.
            self.cr0 = if self.model.has_80386_ops() { 0 } else { 0xFFF0 };
            self.reset_segs(0xF000, 0xFFF0);
            let top = if self.model.has_80386_ops() {
                0xFFFF_0000
            } else {
                0x00FF_0000
            };
            self.segs[SegId::Cs as usize].base = top;
        } else {
            self.cr0 = 0;
            self.reset_segs(0xFFFF, 0x0000);
        }
        self.d_size = OpSize::Word;
        self.a_mask = 0xFFFF;
    }

    fn reset_segs(&mut self, cs: u16, ip: u16) {
        for id in [SegId::Es, SegId::Cs, SegId::Ss, SegId::Ds, SegId::Fs, SegId::Gs] {
            self.load_seg_real(id, 0);
        }
        self.load_seg_real(SegId::Cs, cs);
        self.eip = ip as u32;
    }

    /// True when CR0.PE is set and the CPU interprets selectors through
    /// descriptor tables.
    #[inline]
    pub fn prot_mode(&self) -> bool {
        self.model.has_80286_ops() && (self.cr0 & segment::CR0_PE) != 0
    }

    /// Current privilege level.
    #[inline]
    pub fn cpl(&self) -> u8 {
        self.cpl
    }

    /// Check if the CPU is halted.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Set or clear the halt latch.
    pub fn set_halted(&mut self, halted: bool) {
        self.halted = halted;
        self.int_flags.set(IntFlags::HALT, halted);
    }

    /// Latch a maskable interrupt request with its vector. The machine's
    /// interrupt controller calls this in place of the INTA cycle; the
    /// vector is consumed at the next open interrupt window.
    pub fn set_intr(&mut self, vector: u8) {
        self.intr_vector = Some(vector);
        self.int_flags.insert(IntFlags::INTR);
    }

    /// Last opcode byte fetched, for debugger display.
    pub fn last_opcode(&self) -> u8 {
        self.last_opcode
    }

    pub(crate) fn set_last_opcode(&mut self, op: u8) {
        self.last_opcode = op;
    }

    /// Vector of the fault currently in service, if any.
    pub fn fault_state(&self) -> Option<u8> {
        self.nfault
    }

    /// Whether this CPU should start running when the machine powers on.
    pub fn auto_start(&self) -> bool {
        self.auto_start
    }

    pub fn set_auto_start(&mut self, on: bool) {
        self.auto_start = on;
    }

    /// Charge cycles against the burst budget.
    #[inline]
    pub(crate) fn charge(&mut self, n: u32) {
        self.cycles += n as u64;
        self.cycles_left -= n as i64;
    }

    /// Segment register accessor.
    #[inline]
    pub fn seg(&self, id: SegId) -> &SegReg {
        &self.segs[id as usize]
    }

    #[inline]
    pub(crate) fn seg_mut(&mut self, id: SegId) -> &mut SegReg {
        &mut self.segs[id as usize]
    }

    /// Read a general register at the given width. Byte registers follow
    /// the instruction encoding: 0-3 are AL/CL/DL/BL, 4-7 are AH/CH/DH/BH.
    #[inline]
    pub fn get_reg(&self, reg: usize, size: OpSize) -> u32 {
        debug_assert!(reg < 8, "invalid register index {}", reg);
        match size {
            OpSize::Byte => {
                if reg < 4 {
                    self.regs[reg] & 0xFF
                } else {
                    (self.regs[reg - 4] >> 8) & 0xFF
                }
            }
            OpSize::Word => self.regs[reg] & 0xFFFF,
            OpSize::Dword => self.regs[reg],
        }
    }

    /// Write a general register at the given width, preserving the
    /// untouched high bits.
    #[inline]
    pub fn set_reg(&mut self, reg: usize, size: OpSize, val: u32) {
        debug_assert!(reg < 8, "invalid register index {}", reg);
        match size {
            OpSize::Byte => {
                if reg < 4 {
                    self.regs[reg] = (self.regs[reg] & !0xFF) | (val & 0xFF);
                } else {
                    self.regs[reg - 4] = (self.regs[reg - 4] & !0xFF00) | ((val & 0xFF) << 8);
                }
            }
            OpSize::Word => self.regs[reg] = (self.regs[reg] & 0xFFFF_0000) | (val & 0xFFFF),
            OpSize::Dword => self.regs[reg] = val,
        }
    }

    /// Default operand size for the current code segment.
    #[inline]
    pub(crate) fn default_data_size(&self) -> OpSize {
        if self.code_seg_big() {
            OpSize::Dword
        } else {
            OpSize::Word
        }
    }

    #[inline]
    pub(crate) fn default_addr_mask(&self) -> u32 {
        if self.code_seg_big() {
            0xFFFF_FFFF
        } else {
            0xFFFF
        }
    }

    #[inline]
    fn code_seg_big(&self) -> bool {
        self.model.has_80386_ops()
            && self.prot_mode()
            && (self.segs[SegId::Cs as usize].ext & desc::EXT_BIG) != 0
    }

    /// Run one burst of at most `budget` cycles, returning the cycles
    /// actually consumed. The burst always ends on an instruction boundary.
    pub fn step_cpu(&mut self, budget: u32) -> u32 {
        self.cycles_left = budget.max(1) as i64;
        let start = self.cycles;

        loop {
            // Interrupt window: between instructions, IF set, no shadow.
            if !self.op_flags.contains(OpFlags::NOINTR)
                && self.int_flags.contains(IntFlags::INTR)
                && (self.get_ps() & PS_IF) != 0
            {
                if let Some(vector) = self.intr_vector.take() {
                    self.int_flags.remove(IntFlags::INTR);
                    self.set_halted(false);
                    log(LogCategory::Interrupt, LogLevel::Debug, || {
                        format!("hardware interrupt {:#04x} acknowledged", vector)
                    });
                    if let Err(f) = self.do_interrupt(vector, interrupt::IntKind::Hardware) {
                        self.handle_fault(f);
                    }
                }
            }

            if self.halted {
                // HLT yields the rest of the burst to the scheduler.
                if self.cycles_left > 0 {
                    self.cycles += self.cycles_left as u64;
                    self.cycles_left = 0;
                }
                break;
            }

            // Instruction boundary: carry the prefix subset forward, reset
            // the rest, and snapshot the restart point.
            self.op_prefixes = self.op_flags & OpFlags::PREFIXES;
            self.op_flags = OpFlags::empty();
            self.seg_override = None;
            self.op_eip = self.eip;
            self.op_lip = self.seg(SegId::Cs).base.wrapping_add(self.eip);
            self.d_size = self.default_data_size();
            self.a_mask = self.default_addr_mask();
            self.ea = None;
            self.ea_write = None;

            let trap_pending = (self.get_ps() & PS_TF) != 0;

            if let Err(fault) = self.exec_insn() {
                self.handle_fault(fault);
            } else if trap_pending && !self.op_flags.contains(OpFlags::NOINTR) {
                // Single-step trap reports the *following* instruction.
                if let Err(f) = self.do_interrupt(interrupt::INT_DB, interrupt::IntKind::Trap) {
                    self.handle_fault(f);
                }
            }

            if self.cycles_left <= 0 {
                break;
            }
        }

        (self.cycles - start) as u32
    }
}

impl<B: Bus> crate::Cpu for CpuX86<B> {
    fn reset(&mut self) {
        self.reset_regs();
        self.cycles = 0;
    }

    fn step(&mut self) -> u32 {
        self.step_cpu(1)
    }
}

/// Flat test memory, the whole address space in one `Vec`.
///
/// Out-of-range reads float high; out-of-range writes are dropped.
#[derive(Debug)]
pub struct VecBus {
    pub mem: Vec<u8>,
    pub ports: std::collections::HashMap<u16, u8>,
}

impl VecBus {
    /// One megabyte, enough for the real-mode address space.
    pub fn new() -> Self {
        Self::with_size(1 << 20)
    }

    pub fn with_size(size: usize) -> Self {
        Self {
            mem: vec![0; size],
            ports: std::collections::HashMap::new(),
        }
    }

    /// Copy a program image into memory at a linear address.
    pub fn load_program(&mut self, addr: u32, program: &[u8]) {
        for (i, &b) in program.iter().enumerate() {
            let a = addr as usize + i;
            if a < self.mem.len() {
                self.mem[a] = b;
            }
        }
    }
}

impl Default for VecBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus for VecBus {
    fn read_byte(&self, addr: u32) -> u8 {
        self.mem.get(addr as usize).copied().unwrap_or(0xFF)
    }

    fn write_byte(&mut self, addr: u32, val: u8) {
        if let Some(b) = self.mem.get_mut(addr as usize) {
            *b = val;
        }
    }

    fn io_read_byte(&mut self, port: u16) -> u8 {
        self.ports.get(&port).copied().unwrap_or(0xFF)
    }

    fn io_write_byte(&mut self, port: u16, val: u8) {
        self.ports.insert(port, val);
    }
}

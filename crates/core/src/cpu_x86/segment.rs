//! Segment registers, descriptors, and the protection rules around them.
//!
//! Every loaded selector leaves behind a shadow record ([`SegReg`]) holding
//! the base, limit, and access rights captured at load time; memory edits
//! to the descriptor are not observed until the next load. The typed
//! loaders below enforce the per-register rules: code for CS, writable
//! data for SS, readable segments for the data registers, system types for
//! LDTR and TR.

use super::flags::PS_ZF;
use super::interrupt::Fault;
use super::{CpuModel, CpuX86};
use crate::logging::{log, LogCategory, LogLevel};
use crate::Bus;
use serde::{Deserialize, Serialize};

// CR0 bits (the low word is the 80286 MSW).
pub const CR0_PE: u32 = 0x0000_0001;
pub const CR0_MP: u32 = 0x0000_0002;
pub const CR0_EM: u32 = 0x0000_0004;
pub const CR0_TS: u32 = 0x0000_0008;
pub const CR0_PG: u32 = 0x8000_0000;

/// Segment register indices in instruction encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SegId {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl SegId {
    pub fn from_index(i: u8) -> Option<Self> {
        match i {
            0 => Some(SegId::Es),
            1 => Some(SegId::Cs),
            2 => Some(SegId::Ss),
            3 => Some(SegId::Ds),
            4 => Some(SegId::Fs),
            5 => Some(SegId::Gs),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SegId::Es => "ES",
            SegId::Cs => "CS",
            SegId::Ss => "SS",
            SegId::Ds => "DS",
            SegId::Fs => "FS",
            SegId::Gs => "GS",
        }
    }
}

/// Descriptor access-word and extension-word encodings. The access word is
/// the descriptor's word at offset 4: low byte BASE[16:23], high byte the
/// access byte. The extension word at offset 6 is meaningful on the 80386.
pub mod desc {
    // Access byte, positioned in the high byte of the ACC word.
    pub const ACC_PRESENT: u16 = 0x8000;
    pub const ACC_DPL_MASK: u16 = 0x6000;
    pub const ACC_DPL_SHIFT: u16 = 13;
    /// S bit: set for code/data segments, clear for system descriptors.
    pub const ACC_TYPE_SEG: u16 = 0x1000;
    pub const ACC_TYPE_MASK: u16 = 0x1F00;

    // Code/data type bits (valid when ACC_TYPE_SEG is set).
    pub const ACC_TYPE_CODE: u16 = 0x0800;
    pub const ACC_TYPE_CONFORMING: u16 = 0x0400;
    pub const ACC_TYPE_READABLE: u16 = 0x0200;
    pub const ACC_TYPE_EXPDOWN: u16 = 0x0400;
    pub const ACC_TYPE_WRITABLE: u16 = 0x0200;
    pub const ACC_TYPE_ACCESSED: u16 = 0x0100;

    // System descriptor types (ACC_TYPE_SEG clear).
    pub const TYPE_TSS286: u16 = 0x0100;
    pub const TYPE_LDT: u16 = 0x0200;
    pub const TYPE_TSS286_BUSY: u16 = 0x0300;
    pub const TYPE_GATE_CALL286: u16 = 0x0400;
    pub const TYPE_GATE_TASK: u16 = 0x0500;
    pub const TYPE_GATE_INT286: u16 = 0x0600;
    pub const TYPE_GATE_TRAP286: u16 = 0x0700;
    pub const TYPE_TSS386: u16 = 0x0900;
    pub const TYPE_TSS386_BUSY: u16 = 0x0B00;
    pub const TYPE_GATE_CALL386: u16 = 0x0C00;
    pub const TYPE_GATE_INT386: u16 = 0x0E00;
    pub const TYPE_GATE_TRAP386: u16 = 0x0F00;
    /// Busy bit within the TSS types.
    pub const TYPE_TSS_BUSY_BIT: u16 = 0x0200;

    // Extension word (80386): LIMIT[16:19], AVL, D/B, G, BASE[24:31].
    pub const EXT_LIMIT_HI: u16 = 0x000F;
    pub const EXT_AVL: u16 = 0x0010;
    pub const EXT_BIG: u16 = 0x0040;
    pub const EXT_GRANULARITY: u16 = 0x0080;

    /// Synthetic access words for real-mode shadow records.
    pub const ACC_REAL_DATA: u16 =
        ACC_PRESENT | ACC_TYPE_SEG | ACC_TYPE_WRITABLE | ACC_TYPE_ACCESSED;
    pub const ACC_REAL_CODE: u16 =
        ACC_PRESENT | ACC_TYPE_SEG | ACC_TYPE_CODE | ACC_TYPE_READABLE | ACC_TYPE_ACCESSED;
}

/// GDTR/IDTR contents: base and limit of a descriptor table.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DescTableReg {
    pub base: u32,
    pub limit: u32,
}

/// Shadow state for one loaded selector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegReg {
    pub sel: u16,
    /// Linear base captured at load time.
    pub base: u32,
    /// Scalar limit (page granularity already expanded).
    pub limit: u32,
    /// Access word; zero marks a null/unusable register.
    pub acc: u16,
    /// 80386 extension word (D/B and granularity bits).
    pub ext: u16,
    /// Descriptor privilege level captured at load time.
    pub dpl: u8,
    /// Linear address of the backing descriptor, for accessed/busy-bit
    /// write-back. `None` for real-mode and synthetic loads.
    pub desc_addr: Option<u32>,
}

impl SegReg {
    fn real(sel: u16, code: bool) -> Self {
        SegReg {
            sel,
            base: (sel as u32) << 4,
            limit: 0xFFFF,
            acc: if code {
                desc::ACC_REAL_CODE
            } else {
                desc::ACC_REAL_DATA
            },
            ext: 0,
            dpl: 0,
            desc_addr: None,
        }
    }

    /// The six-register file in encoding order, at real-mode reset state.
    pub(crate) fn file() -> [SegReg; 6] {
        [
            SegReg::real(0, false),
            SegReg::real(0, true),
            SegReg::real(0, false),
            SegReg::real(0, false),
            SegReg::real(0, false),
            SegReg::real(0, false),
        ]
    }

    /// Empty shadow for LDTR/TR.
    pub(crate) fn system() -> Self {
        SegReg {
            sel: 0,
            base: 0,
            limit: 0,
            acc: 0,
            ext: 0,
            dpl: 0,
            desc_addr: None,
        }
    }

    /// True when the register cannot be used for memory access.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.acc == 0
    }

    /// Upper offset bound for expand-down segments.
    #[inline]
    pub(crate) fn upper_bound(&self) -> u32 {
        if self.ext & desc::EXT_BIG != 0 {
            0xFFFF_FFFF
        } else {
            0xFFFF
        }
    }
}

/// An 8-byte descriptor as read from a table, in its four raw words plus
/// the linear address it came from.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Descriptor {
    pub limit_raw: u16,
    pub base_lo: u16,
    pub acc: u16,
    pub ext: u16,
    pub addr: u32,
}

impl Descriptor {
    pub fn base(&self, model: CpuModel) -> u32 {
        let mut base = (self.base_lo as u32) | (((self.acc & 0xFF) as u32) << 16);
        if model.has_80386_ops() {
            base |= ((self.ext >> 8) as u32) << 24;
        }
        base
    }

    pub fn limit(&self, model: CpuModel) -> u32 {
        let mut limit = self.limit_raw as u32;
        if model.has_80386_ops() {
            limit |= ((self.ext & desc::EXT_LIMIT_HI) as u32) << 16;
            if self.ext & desc::EXT_GRANULARITY != 0 {
                limit = (limit << 12) | 0xFFF;
            }
        }
        limit
    }

    /// Access byte and type field, positioned in the high byte.
    #[inline]
    pub fn access(&self) -> u16 {
        self.acc & 0xFF00
    }

    #[inline]
    pub fn typ(&self) -> u16 {
        self.acc & desc::ACC_TYPE_MASK
    }

    #[inline]
    pub fn present(&self) -> bool {
        self.acc & desc::ACC_PRESENT != 0
    }

    #[inline]
    pub fn dpl(&self) -> u8 {
        ((self.acc & desc::ACC_DPL_MASK) >> desc::ACC_DPL_SHIFT) as u8
    }

    /// Code or data segment (S bit set).
    #[inline]
    pub fn is_seg(&self) -> bool {
        self.acc & desc::ACC_TYPE_SEG != 0
    }

    #[inline]
    pub fn is_code(&self) -> bool {
        self.is_seg() && self.acc & desc::ACC_TYPE_CODE != 0
    }

    #[inline]
    pub fn is_conforming(&self) -> bool {
        self.is_code() && self.acc & desc::ACC_TYPE_CONFORMING != 0
    }

    #[inline]
    pub fn is_readable(&self) -> bool {
        // Data segments are always readable; code segments need the bit.
        self.is_seg() && (!self.is_code() || self.acc & desc::ACC_TYPE_READABLE != 0)
    }

    #[inline]
    pub fn is_writable_data(&self) -> bool {
        self.is_seg() && !self.is_code() && self.acc & desc::ACC_TYPE_WRITABLE != 0
    }

    #[inline]
    pub fn is_tss(&self) -> bool {
        !self.is_seg()
            && matches!(
                self.typ(),
                desc::TYPE_TSS286
                    | desc::TYPE_TSS286_BUSY
                    | desc::TYPE_TSS386
                    | desc::TYPE_TSS386_BUSY
            )
    }

    #[inline]
    pub fn is_tss_busy(&self) -> bool {
        !self.is_seg() && self.typ() & desc::TYPE_TSS_BUSY_BIT != 0
    }

    #[inline]
    pub fn is_tss_386(&self) -> bool {
        matches!(self.typ(), desc::TYPE_TSS386 | desc::TYPE_TSS386_BUSY)
    }

    #[inline]
    pub fn is_gate(&self) -> bool {
        !self.is_seg()
            && matches!(
                self.typ(),
                desc::TYPE_GATE_CALL286
                    | desc::TYPE_GATE_TASK
                    | desc::TYPE_GATE_INT286
                    | desc::TYPE_GATE_TRAP286
                    | desc::TYPE_GATE_CALL386
                    | desc::TYPE_GATE_INT386
                    | desc::TYPE_GATE_TRAP386
            )
    }

    #[inline]
    pub fn is_gate_386(&self) -> bool {
        matches!(
            self.typ(),
            desc::TYPE_GATE_CALL386 | desc::TYPE_GATE_INT386 | desc::TYPE_GATE_TRAP386
        )
    }

    /// Gate fields: target selector, target offset, and the parameter
    /// count for call gates.
    #[inline]
    pub fn gate_selector(&self) -> u16 {
        self.base_lo
    }

    pub fn gate_offset(&self) -> u32 {
        let mut off = self.limit_raw as u32;
        if self.is_gate_386() {
            off |= (self.ext as u32) << 16;
        }
        off
    }

    #[inline]
    pub fn gate_param_count(&self) -> u32 {
        (self.acc & 0x001F) as u32
    }
}

/// Selector-referencing error code: index and TI, RPL zeroed, with the
/// external-event bit when the reference came from outside the program.
pub(crate) fn sel_error(sel: u16, ext: bool) -> u16 {
    (sel & 0xFFFC) | ext as u16
}

/// IDT-referencing error code: vector index with the IDT bit set.
pub(crate) fn idt_error(vector: u8, ext: bool) -> u16 {
    ((vector as u16) << 3) | 0x02 | ext as u16
}

impl<B: Bus> CpuX86<B> {
    /// Fetch the 8-byte descriptor a selector names, checking it against
    /// the GDT or LDT limit. Faults GP(selector) when out of range.
    pub(crate) fn read_descriptor(&mut self, sel: u16) -> Result<Descriptor, Fault> {
        let (base, limit) = if sel & 0x0004 != 0 {
            if self.ldt.acc == 0 {
                return Err(Fault::gp(sel_error(sel, false)));
            }
            (self.ldt.base, self.ldt.limit)
        } else {
            (self.gdt.base, self.gdt.limit)
        };
        let index = (sel & !0x0007) as u32;
        if index.wrapping_add(7) > limit {
            return Err(Fault::gp(sel_error(sel, false)));
        }
        let addr = base.wrapping_add(index);
        self.read_descriptor_at(addr)
    }

    pub(crate) fn read_descriptor_at(&mut self, addr: u32) -> Result<Descriptor, Fault> {
        Ok(Descriptor {
            limit_raw: self.read_linear_word(addr)?,
            base_lo: self.read_linear_word(addr.wrapping_add(2))?,
            acc: self.read_linear_word(addr.wrapping_add(4))?,
            ext: self.read_linear_word(addr.wrapping_add(6))?,
            addr,
        })
    }

    /// Real-mode selector load: base is the selector shifted, limit and
    /// rights are the fixed real-mode defaults.
    pub(crate) fn load_seg_real(&mut self, id: SegId, sel: u16) {
        self.segs[id as usize] = SegReg::real(sel, id == SegId::Cs);
        if id == SegId::Cs {
            self.cpl = 0;
        }
    }

    /// General selector load for the data registers and SS (MOV/POP/LES
    /// and friends). CS never comes through here; control transfers load
    /// it with their own rules.
    pub(crate) fn load_seg(&mut self, id: SegId, sel: u16) -> Result<(), Fault> {
        if !self.prot_mode() {
            self.load_seg_real(id, sel);
            return Ok(());
        }
        match id {
            SegId::Ss => self.load_ss_prot(sel),
            SegId::Cs => Err(Fault::ud()),
            _ => self.load_data_prot(id, sel),
        }
    }

    fn load_data_prot(&mut self, id: SegId, sel: u16) -> Result<(), Fault> {
        if sel & 0xFFFC == 0 {
            // Null selector loads succeed; any later access through the
            // register faults.
            let s = self.seg_mut(id);
            s.sel = sel;
            s.base = 0;
            s.limit = 0;
            s.acc = 0;
            s.ext = 0;
            s.dpl = 0;
            s.desc_addr = None;
            return Ok(());
        }
        let d = self.read_descriptor(sel)?;
        if !d.is_readable() {
            return Err(Fault::gp(sel_error(sel, false)));
        }
        // Conforming code is exempt from the privilege test.
        if !d.is_conforming() {
            let rpl = (sel & 3) as u8;
            if d.dpl() < rpl.max(self.cpl) {
                return Err(Fault::gp(sel_error(sel, false)));
            }
        }
        if !d.present() {
            return Err(Fault::np(sel_error(sel, false)));
        }
        self.commit_seg(id, sel, &d);
        Ok(())
    }

    fn load_ss_prot(&mut self, sel: u16) -> Result<(), Fault> {
        let cpl = self.cpl;
        let d = self.check_ss_for(sel, cpl)?;
        self.commit_seg(SegId::Ss, sel, &d);
        Ok(())
    }

    /// Validate a selector as the stack for privilege `level` without
    /// committing anything; the caller installs the shadow once the rest
    /// of its transfer is known to succeed.
    pub(crate) fn check_ss_for(&mut self, sel: u16, level: u8) -> Result<Descriptor, Fault> {
        if sel & 0xFFFC == 0 {
            return Err(Fault::gp(0));
        }
        let d = self.read_descriptor(sel)?;
        let rpl = (sel & 3) as u8;
        if rpl != level || d.dpl() != level {
            return Err(Fault::ss(sel_error(sel, false)));
        }
        if !d.is_writable_data() {
            return Err(Fault::gp(sel_error(sel, false)));
        }
        if !d.present() {
            return Err(Fault::np(sel_error(sel, false)));
        }
        Ok(d)
    }

    /// Commit a checked descriptor into a shadow register and write the
    /// accessed bit back to the table.
    pub(crate) fn commit_seg(&mut self, id: SegId, sel: u16, d: &Descriptor) {
        let model = self.model();
        let s = self.seg_mut(id);
        s.sel = sel;
        s.base = d.base(model);
        s.limit = d.limit(model);
        s.acc = d.access() | (d.acc & 0x00FF);
        s.ext = d.ext;
        s.dpl = d.dpl();
        s.desc_addr = Some(d.addr);
        self.mark_accessed(d);
        log(LogCategory::Segment, LogLevel::Trace, || {
            format!(
                "{} <- {:#06x} base={:#010x} limit={:#x}",
                id.name(),
                sel,
                d.base(model),
                d.limit(model)
            )
        });
    }

    /// Commit a code-segment descriptor and adopt the new privilege level.
    pub(crate) fn commit_cs(&mut self, sel: u16, d: &Descriptor, cpl: u8) {
        // The selector's visible RPL always matches the new CPL.
        let sel = (sel & !0x0003) | cpl as u16;
        self.commit_seg(SegId::Cs, sel, d);
        self.cpl = cpl;
    }

    fn mark_accessed(&mut self, d: &Descriptor) {
        if self.prot_mode() && d.is_seg() && d.acc & desc::ACC_TYPE_ACCESSED == 0 {
            let access = ((d.acc >> 8) as u8) | ((desc::ACC_TYPE_ACCESSED >> 8) as u8);
            self.write_linear_byte_lossy(d.addr.wrapping_add(5), access);
        }
    }

    /// Flip the busy bit of a TSS descriptor in place.
    pub(crate) fn set_tss_busy(&mut self, desc_addr: u32, busy: bool) {
        let addr = desc_addr.wrapping_add(5);
        let access = match self.lin_to_phys(addr, false, false) {
            Ok(phys) => self.bus.read_byte(phys),
            Err(_) => return,
        };
        let busy_bit = (desc::TYPE_TSS_BUSY_BIT >> 8) as u8;
        let access = if busy {
            access | busy_bit
        } else {
            access & !busy_bit
        };
        self.write_linear_byte_lossy(addr, access);
    }

    /// LLDT: the selector must name a present LDT descriptor in the GDT.
    pub(crate) fn load_ldtr(&mut self, sel: u16) -> Result<(), Fault> {
        if sel & 0xFFFC == 0 {
            self.ldt = SegReg::system();
            self.ldt.sel = sel;
            return Ok(());
        }
        if sel & 0x0004 != 0 {
            return Err(Fault::gp(sel_error(sel, false)));
        }
        let d = self.read_descriptor(sel)?;
        if d.is_seg() || d.typ() != desc::TYPE_LDT {
            return Err(Fault::gp(sel_error(sel, false)));
        }
        if !d.present() {
            return Err(Fault::ts(sel_error(sel, false)));
        }
        let model = self.model();
        self.ldt = SegReg {
            sel,
            base: d.base(model),
            limit: d.limit(model),
            acc: d.access(),
            ext: d.ext,
            dpl: d.dpl(),
            desc_addr: Some(d.addr),
        };
        Ok(())
    }

    /// LTR: the selector must name a non-busy TSS; loading marks it busy.
    pub(crate) fn load_tr(&mut self, sel: u16) -> Result<(), Fault> {
        if sel & 0xFFFC == 0 || sel & 0x0004 != 0 {
            return Err(Fault::gp(sel_error(sel, false)));
        }
        let d = self.read_descriptor(sel)?;
        if d.is_seg() || !d.is_tss() || d.is_tss_busy() {
            return Err(Fault::gp(sel_error(sel, false)));
        }
        if !d.present() {
            return Err(Fault::np(sel_error(sel, false)));
        }
        self.set_tss_busy(d.addr, true);
        let model = self.model();
        self.tr = SegReg {
            sel,
            base: d.base(model),
            limit: d.limit(model),
            acc: d.access() | desc::TYPE_TSS_BUSY_BIT,
            ext: d.ext,
            dpl: d.dpl(),
            desc_addr: Some(d.addr),
        };
        Ok(())
    }

    /// Permissive descriptor fetch for LAR/LSL/VERR/VERW: any selector
    /// within table limits yields its descriptor, out-of-range yields
    /// `None`, and the caller applies its own privilege test.
    pub(crate) fn verify_descriptor(&mut self, sel: u16) -> Result<Option<Descriptor>, Fault> {
        if sel & 0xFFFC == 0 {
            return Ok(None);
        }
        let (base, limit) = if sel & 0x0004 != 0 {
            if self.ldt.acc == 0 {
                return Ok(None);
            }
            (self.ldt.base, self.ldt.limit)
        } else {
            (self.gdt.base, self.gdt.limit)
        };
        let index = (sel & !0x0007) as u32;
        if index.wrapping_add(7) > limit {
            return Ok(None);
        }
        Ok(Some(self.read_descriptor_at(base.wrapping_add(index))?))
    }

    /// The standard privilege test for LAR/LSL/VERR/VERW; conforming code
    /// is exempt.
    pub(crate) fn verify_privilege(&self, sel: u16, d: &Descriptor) -> bool {
        if d.is_conforming() {
            return true;
        }
        let rpl = (sel & 3) as u8;
        d.dpl() >= rpl.max(self.cpl)
    }

    /// Set ZF as the outcome flag the verify instructions report through.
    pub(crate) fn set_verify_outcome(&mut self, ok: bool) {
        self.set_flag(PS_ZF, ok);
    }

    /// Check an offset range against a segment's limit and rights, and
    /// return the linear address of its first byte.
    pub(crate) fn seg_check(
        &mut self,
        id: SegId,
        off: u32,
        len: u32,
        write: bool,
    ) -> Result<u32, Fault> {
        let seg = &self.segs[id as usize];
        if self.prot_mode() {
            if seg.is_null() {
                return Err(Self::seg_fault(id, 0));
            }
            let acc = seg.acc;
            if write {
                let writable_data = acc & desc::ACC_TYPE_CODE == 0
                    && acc & desc::ACC_TYPE_WRITABLE != 0;
                if !writable_data {
                    return Err(Self::seg_fault(id, 0));
                }
            } else {
                let readable = acc & desc::ACC_TYPE_CODE == 0
                    || acc & desc::ACC_TYPE_READABLE != 0;
                if !readable {
                    return Err(Self::seg_fault(id, 0));
                }
            }
            let last = off.wrapping_add(len - 1);
            let expand_down =
                acc & desc::ACC_TYPE_CODE == 0 && acc & desc::ACC_TYPE_EXPDOWN != 0;
            let in_range = if expand_down {
                // Valid offsets live above the limit, up to the bound.
                off > seg.limit && last <= seg.upper_bound() && last >= off
            } else {
                last <= seg.limit && last >= off
            };
            if !in_range {
                return Err(Self::seg_fault(id, 0));
            }
        }
        Ok(seg.base.wrapping_add(off))
    }

    #[inline]
    fn seg_fault(id: SegId, code: u16) -> Fault {
        if id == SegId::Ss {
            Fault::ss(code)
        } else {
            Fault::gp(code)
        }
    }

    /// CR0.PE transition hook. Leaving protected mode re-bases every
    /// segment register from its selector the real-mode way.
    pub fn set_prot_mode(&mut self, on: bool) {
        log(LogCategory::Segment, LogLevel::Info, || {
            format!("protected mode {}", if on { "enabled" } else { "disabled" })
        });
        if on {
            self.cpl = 0;
        } else {
            for id in [SegId::Es, SegId::Cs, SegId::Ss, SegId::Ds, SegId::Fs, SegId::Gs] {
                let sel = self.seg(id).sel;
                self.load_seg_real(id, sel);
            }
            self.ldt = SegReg::system();
            self.tr = SegReg::system();
        }
    }
}

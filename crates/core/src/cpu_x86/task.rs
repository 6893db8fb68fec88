//! Task state segments: per-level stack lookup and full task switches.
//!
//! Both the 286 (16-bit, 44-byte) and 386 (32-bit, 104-byte) TSS layouts
//! are supported; the loaded TR's descriptor type picks between them. The
//! busy-bit protocol nests tasks through CALL/INT (back link plus NT) and
//! unwinds through IRET.

use super::flags::PS_NT;
use super::interrupt::Fault;
use super::segment::{desc, sel_error, SegId, CR0_TS};
use super::{CpuX86, REG_SP};
use crate::logging::{log, LogCategory, LogLevel};
use crate::Bus;

// 286 TSS field offsets.
const TSS286_BACKLINK: u32 = 0x00;
const TSS286_SP0: u32 = 0x02;
const TSS286_IP: u32 = 0x0E;
const TSS286_FLAGS: u32 = 0x10;
const TSS286_REGS: u32 = 0x12;
const TSS286_SEGS: u32 = 0x22;
const TSS286_LDT: u32 = 0x2A;
const TSS286_MIN_LIMIT: u32 = 0x2B;

// 386 TSS field offsets.
const TSS386_BACKLINK: u32 = 0x00;
const TSS386_ESP0: u32 = 0x04;
const TSS386_CR3: u32 = 0x1C;
const TSS386_EIP: u32 = 0x20;
const TSS386_EFLAGS: u32 = 0x24;
const TSS386_REGS: u32 = 0x28;
const TSS386_SEGS: u32 = 0x48;
const TSS386_LDT: u32 = 0x60;
const TSS386_MIN_LIMIT: u32 = 0x67;

/// How a task switch nests: CALL/INT links back and leaves the old task
/// busy; JMP and IRET do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskNest {
    Jmp,
    CallOrInt,
    Iret,
}

impl<B: Bus> CpuX86<B> {
    #[inline]
    fn tr_is_386(&self) -> bool {
        matches!(
            self.tr.acc & desc::ACC_TYPE_MASK,
            desc::TYPE_TSS386 | desc::TYPE_TSS386_BUSY
        )
    }

    /// Fetch the stack pointer pair the current TSS holds for a privilege
    /// level. Faults #TS against TR when the TSS is absent or too small.
    pub(crate) fn tss_stack(&mut self, dpl: u8) -> Result<(u16, u32), Fault> {
        if self.tr.acc == 0 {
            return Err(Fault::ts(sel_error(self.tr.sel, false)));
        }
        if self.tr_is_386() {
            let off = TSS386_ESP0 + (dpl as u32) * 8;
            if off + 7 > self.tr.limit {
                return Err(Fault::ts(sel_error(self.tr.sel, false)));
            }
            let esp = self.read_linear_dword(self.tr.base.wrapping_add(off))?;
            let ss = self.read_linear_word(self.tr.base.wrapping_add(off + 4))?;
            Ok((ss, esp))
        } else {
            let off = TSS286_SP0 + (dpl as u32) * 4;
            if off + 3 > self.tr.limit {
                return Err(Fault::ts(sel_error(self.tr.sel, false)));
            }
            let sp = self.read_linear_word(self.tr.base.wrapping_add(off))?;
            let ss = self.read_linear_word(self.tr.base.wrapping_add(off + 2))?;
            Ok((ss, sp as u32))
        }
    }

    /// Install the inner stack named by a TSS entry. Violations here are
    /// invalid-TSS faults, not stack faults.
    pub(crate) fn load_stack_for_level(
        &mut self,
        ss_sel: u16,
        sp: u32,
        dpl: u8,
    ) -> Result<(), Fault> {
        if ss_sel & 0xFFFC == 0 {
            return Err(Fault::ts(sel_error(ss_sel, false)));
        }
        let d = self.read_descriptor(ss_sel)?;
        let rpl = (ss_sel & 3) as u8;
        if rpl != dpl || d.dpl() != dpl || !d.is_writable_data() {
            return Err(Fault::ts(sel_error(ss_sel, false)));
        }
        if !d.present() {
            return Err(Fault::ss(sel_error(ss_sel, false)));
        }
        self.commit_seg(SegId::Ss, ss_sel, &d);
        let m = self.sp_mask();
        self.regs[REG_SP] = (self.regs[REG_SP] & !m) | (sp & m);
        Ok(())
    }

    /// Switch to the task named by a TSS selector, saving the outgoing
    /// state into the current TSS first.
    pub(crate) fn switch_task(&mut self, new_sel: u16, nest: TaskNest) -> Result<(), Fault> {
        self.charge(self.cyc.task_switch);
        let new_desc = self.read_descriptor(new_sel)?;
        if !new_desc.is_tss() {
            return Err(Fault::gp(sel_error(new_sel, false)));
        }
        match nest {
            TaskNest::Iret => {
                // Returning into a task that must still be marked busy.
                if !new_desc.is_tss_busy() {
                    return Err(Fault::ts(sel_error(new_sel, false)));
                }
            }
            _ => {
                if new_desc.is_tss_busy() {
                    return Err(Fault::gp(sel_error(new_sel, false)));
                }
            }
        }
        if !new_desc.present() {
            return Err(Fault::np(sel_error(new_sel, false)));
        }
        let is386 = new_desc.is_tss_386();
        let min_limit = if is386 { TSS386_MIN_LIMIT } else { TSS286_MIN_LIMIT };
        let new_limit = new_desc.limit(self.model());
        if new_limit < min_limit {
            return Err(Fault::ts(sel_error(new_sel, false)));
        }

        log(LogCategory::Task, LogLevel::Debug, || {
            format!(
                "task switch {:#06x} -> {:#06x} ({:?})",
                self.tr.sel, new_sel, nest
            )
        });

        let old_sel = self.tr.sel;
        let old_base = self.tr.base;
        let old_desc_addr = self.tr.desc_addr;

        // IRET out of a nested task leaves NT clear in the saved image.
        let mut ps_to_save = self.get_ps();
        if nest == TaskNest::Iret {
            ps_to_save &= !PS_NT;
        }

        // Save the outgoing context into the old TSS.
        if self.tr.acc != 0 {
            self.save_task_state(old_base, ps_to_save)?;
        }

        // The outgoing descriptor stays busy across CALL/INT nesting and
        // clears otherwise.
        if nest != TaskNest::CallOrInt {
            if let Some(addr) = old_desc_addr {
                self.set_tss_busy(addr, false);
            }
        }
        if nest != TaskNest::Iret {
            self.set_tss_busy(new_desc.addr, true);
        }

        // Adopt the new TSS as TR.
        let model = self.model();
        self.tr = super::SegReg {
            sel: new_sel,
            base: new_desc.base(model),
            limit: new_limit,
            acc: new_desc.access() | desc::TYPE_TSS_BUSY_BIT,
            ext: new_desc.ext,
            dpl: new_desc.dpl(),
            desc_addr: Some(new_desc.addr),
        };
        self.cr0 |= CR0_TS;

        // Load the incoming context; faults from here on are charged to
        // the new task.
        self.load_task_state(is386, nest, old_sel)?;
        Ok(())
    }

    fn save_task_state(&mut self, base: u32, ps: u32) -> Result<(), Fault> {
        if self.tr_is_386() {
            self.write_linear_dword(base.wrapping_add(TSS386_CR3), self.cr3)?;
            self.write_linear_dword(base.wrapping_add(TSS386_EIP), self.eip)?;
            self.write_linear_dword(base.wrapping_add(TSS386_EFLAGS), ps)?;
            for i in 0..8 {
                self.write_linear_dword(
                    base.wrapping_add(TSS386_REGS + 4 * i as u32),
                    self.regs[i],
                )?;
            }
            for (slot, id) in [
                SegId::Es,
                SegId::Cs,
                SegId::Ss,
                SegId::Ds,
                SegId::Fs,
                SegId::Gs,
            ]
            .iter()
            .enumerate()
            {
                self.write_linear_word(
                    base.wrapping_add(TSS386_SEGS + 4 * slot as u32),
                    self.seg(*id).sel,
                )?;
            }
            self.write_linear_word(base.wrapping_add(TSS386_LDT), self.ldt.sel)?;
        } else {
            self.write_linear_word(base.wrapping_add(TSS286_IP), self.eip as u16)?;
            self.write_linear_word(base.wrapping_add(TSS286_FLAGS), ps as u16)?;
            for i in 0..8 {
                self.write_linear_word(
                    base.wrapping_add(TSS286_REGS + 2 * i as u32),
                    self.regs[i] as u16,
                )?;
            }
            for (slot, id) in [SegId::Es, SegId::Cs, SegId::Ss, SegId::Ds]
                .iter()
                .enumerate()
            {
                self.write_linear_word(
                    base.wrapping_add(TSS286_SEGS + 2 * slot as u32),
                    self.seg(*id).sel,
                )?;
            }
            self.write_linear_word(base.wrapping_add(TSS286_LDT), self.ldt.sel)?;
        }
        Ok(())
    }

    fn load_task_state(
        &mut self,
        is386: bool,
        nest: TaskNest,
        old_sel: u16,
    ) -> Result<(), Fault> {
        let base = self.tr.base;

        // LDT first so the segment loads below can resolve local
        // selectors.
        let ldt_off = if is386 { TSS386_LDT } else { TSS286_LDT };
        let ldt_sel = self.read_linear_word(base.wrapping_add(ldt_off))?;
        self.load_ldtr(ldt_sel)
            .map_err(|_| Fault::ts(sel_error(ldt_sel, false)))?;

        let new_ip: u32;
        let mut new_ps: u32;
        if is386 {
            let cr3 = self.read_linear_dword(base.wrapping_add(TSS386_CR3))?;
            self.cr3 = cr3;
            new_ip = self.read_linear_dword(base.wrapping_add(TSS386_EIP))?;
            new_ps = self.read_linear_dword(base.wrapping_add(TSS386_EFLAGS))?;
            for i in 0..8 {
                self.regs[i] =
                    self.read_linear_dword(base.wrapping_add(TSS386_REGS + 4 * i as u32))?;
            }
        } else {
            new_ip = self.read_linear_word(base.wrapping_add(TSS286_IP))? as u32;
            new_ps = self.read_linear_word(base.wrapping_add(TSS286_FLAGS))? as u32;
            for i in 0..8 {
                self.regs[i] =
                    self.read_linear_word(base.wrapping_add(TSS286_REGS + 2 * i as u32))? as u32;
            }
        }

        if nest == TaskNest::CallOrInt {
            new_ps |= PS_NT;
            let bl_off = if is386 { TSS386_BACKLINK } else { TSS286_BACKLINK };
            self.write_linear_word(base.wrapping_add(bl_off), old_sel)?;
        }
        self.set_ps(new_ps);
        self.eip = new_ip;

        // Segment selectors, CS last so CPL is settled when the data
        // segments check against it.
        let seg_sels: Vec<(SegId, u16)> = if is386 {
            let mut v = Vec::new();
            for (slot, id) in [
                SegId::Es,
                SegId::Cs,
                SegId::Ss,
                SegId::Ds,
                SegId::Fs,
                SegId::Gs,
            ]
            .iter()
            .enumerate()
            {
                let sel =
                    self.read_linear_word(base.wrapping_add(TSS386_SEGS + 4 * slot as u32))?;
                v.push((*id, sel));
            }
            v
        } else {
            let mut v = Vec::new();
            for (slot, id) in [SegId::Es, SegId::Cs, SegId::Ss, SegId::Ds]
                .iter()
                .enumerate()
            {
                let sel =
                    self.read_linear_word(base.wrapping_add(TSS286_SEGS + 2 * slot as u32))?;
                v.push((*id, sel));
            }
            v
        };

        // CS decides the incoming CPL.
        let cs_sel = seg_sels
            .iter()
            .find(|(id, _)| *id == SegId::Cs)
            .map(|(_, s)| *s)
            .unwrap_or(0);
        if cs_sel & 0xFFFC == 0 {
            return Err(Fault::ts(sel_error(cs_sel, false)));
        }
        let cs_desc = self.read_descriptor(cs_sel)?;
        if !cs_desc.is_code() {
            return Err(Fault::ts(sel_error(cs_sel, false)));
        }
        if !cs_desc.present() {
            return Err(Fault::np(sel_error(cs_sel, false)));
        }
        let cpl = (cs_sel & 3) as u8;
        self.commit_cs(cs_sel, &cs_desc, cpl);

        for (id, sel) in seg_sels {
            if id == SegId::Cs {
                continue;
            }
            self.load_seg(id, sel)
                .map_err(|f| if f.vector == super::interrupt::INT_NP { f } else {
                    Fault::ts(sel_error(sel, false))
                })?;
        }
        Ok(())
    }
}

//! Control transfer helpers: near and far jumps, calls and returns,
//! conditional branches, the LOOP family, ENTER/LEAVE, and IRET.
//!
//! Far transfers follow the validate-before-commit rule: the destination
//! CS (and any gate it routes through) is fully checked before any push or
//! register change becomes observable, so a faulting transfer leaves the
//! machine in its pre-instruction state.

use super::decode::ModRm;
use super::interrupt::Fault;
use super::segment::{desc, sel_error, Descriptor, SegId};
use super::task::TaskNest;
use super::{CpuX86, OpSize, REG_BP, REG_CX, REG_SP};
use crate::Bus;

impl<B: Bus> CpuX86<B> {
    #[inline]
    fn op_ip_mask(&self) -> u32 {
        match self.d_size {
            OpSize::Dword => 0xFFFF_FFFF,
            _ => 0xFFFF,
        }
    }

    /// Jcc rel8.
    pub(crate) fn op_jcc_short(&mut self, cc: u8) -> Result<(), Fault> {
        let rel = self.fetch_byte()? as i8 as i32;
        if self.condition(cc) {
            self.eip = self.eip.wrapping_add(rel as u32) & self.op_ip_mask();
            self.charge(self.cyc.jcc_taken);
        } else {
            self.charge(self.cyc.jcc_not_taken);
        }
        Ok(())
    }

    /// Jcc rel16/rel32 (0x0F 0x80 family).
    pub(crate) fn op_jcc_near(&mut self, cc: u8) -> Result<(), Fault> {
        let rel = self.fetch_rel()?;
        if self.condition(cc) {
            self.eip = self.eip.wrapping_add(rel) & self.op_ip_mask();
            self.charge(self.cyc.jcc_taken);
        } else {
            self.charge(self.cyc.jcc_not_taken);
        }
        Ok(())
    }

    /// Displacement at the operand size, sign-extended to 32 bits.
    fn fetch_rel(&mut self) -> Result<u32, Fault> {
        Ok(match self.d_size {
            OpSize::Dword => self.fetch_dword()?,
            _ => self.fetch_word()? as i16 as i32 as u32,
        })
    }

    pub(crate) fn op_jmp_short(&mut self) -> Result<(), Fault> {
        let rel = self.fetch_byte()? as i8 as i32 as u32;
        self.eip = self.eip.wrapping_add(rel) & self.op_ip_mask();
        self.charge(self.cyc.jmp_near);
        Ok(())
    }

    pub(crate) fn op_jmp_near(&mut self) -> Result<(), Fault> {
        let rel = self.fetch_rel()?;
        self.eip = self.eip.wrapping_add(rel) & self.op_ip_mask();
        self.charge(self.cyc.jmp_near);
        Ok(())
    }

    /// JMP to an absolute near target (FF /4).
    pub(crate) fn op_jmp_abs(&mut self, target: u32) -> Result<(), Fault> {
        self.eip = target & self.op_ip_mask();
        self.charge(self.cyc.jmp_near);
        Ok(())
    }

    pub(crate) fn op_call_near(&mut self) -> Result<(), Fault> {
        let rel = self.fetch_rel()?;
        self.push_op(self.eip)?;
        self.eip = self.eip.wrapping_add(rel) & self.op_ip_mask();
        self.charge(self.cyc.call_near);
        Ok(())
    }

    /// CALL to an absolute near target (FF /2).
    pub(crate) fn op_call_abs(&mut self, target: u32) -> Result<(), Fault> {
        self.push_op(self.eip)?;
        self.eip = target & self.op_ip_mask();
        self.charge(self.cyc.call_near);
        Ok(())
    }

    pub(crate) fn op_ret_near(&mut self, extra: u32) -> Result<(), Fault> {
        let ip = self.pop_op()?;
        self.eip = ip & self.op_ip_mask();
        let m = self.sp_mask();
        self.regs[REG_SP] =
            (self.regs[REG_SP] & !m) | (self.regs[REG_SP].wrapping_add(extra) & m);
        self.charge(self.cyc.ret_near);
        Ok(())
    }

    // The LOOP family decrements CX (or ECX under a 32-bit address size)
    // without touching flags.

    pub(crate) fn op_loop(&mut self, kind: u8) -> Result<(), Fault> {
        let rel = self.fetch_byte()? as i8 as i32 as u32;
        let wide = self.a_mask != 0xFFFF;
        let cm: u32 = if wide { 0xFFFF_FFFF } else { 0xFFFF };
        let count = self.regs[REG_CX].wrapping_sub(1) & cm;
        self.regs[REG_CX] = (self.regs[REG_CX] & !cm) | count;
        let taken = match kind {
            0 => count != 0 && !self.get_zf(), // LOOPNZ
            1 => count != 0 && self.get_zf(),  // LOOPZ
            _ => count != 0,                   // LOOP
        };
        if taken {
            self.eip = self.eip.wrapping_add(rel) & self.op_ip_mask();
            self.charge(self.cyc.jcc_taken);
        } else {
            self.charge(self.cyc.jcc_not_taken);
        }
        Ok(())
    }

    pub(crate) fn op_jcxz(&mut self) -> Result<(), Fault> {
        let rel = self.fetch_byte()? as i8 as i32 as u32;
        let count = self.regs[REG_CX] & if self.a_mask != 0xFFFF { 0xFFFF_FFFF } else { 0xFFFF };
        if count == 0 {
            self.eip = self.eip.wrapping_add(rel) & self.op_ip_mask();
            self.charge(self.cyc.jcc_taken);
        } else {
            self.charge(self.cyc.jcc_not_taken);
        }
        Ok(())
    }

    /// ENTER imm16, imm8: build a stack frame with an optional display.
    pub(crate) fn op_enter(&mut self) -> Result<(), Fault> {
        let frame_size = self.fetch_word()? as u32;
        let level = (self.fetch_byte()? & 0x1F) as u32;
        let size = self.d_size;
        self.push_op(self.regs[REG_BP])?;
        let frame_ptr = self.regs[REG_SP];
        if level > 0 {
            let m = self.sp_mask();
            let mut bp = self.regs[REG_BP];
            for _ in 1..level {
                bp = (bp & !m) | (bp.wrapping_sub(size.bytes()) & m);
                let slot = self.read_seg(SegId::Ss, bp & m, size)?;
                self.push_op(slot)?;
            }
            self.push_op(frame_ptr)?;
        }
        self.regs[REG_BP] = frame_ptr;
        let m = self.sp_mask();
        self.regs[REG_SP] =
            (self.regs[REG_SP] & !m) | (self.regs[REG_SP].wrapping_sub(frame_size) & m);
        self.charge(self.cyc.push);
        Ok(())
    }

    pub(crate) fn op_leave(&mut self) -> Result<(), Fault> {
        let m = self.sp_mask();
        self.regs[REG_SP] = (self.regs[REG_SP] & !m) | (self.regs[REG_BP] & m);
        let bp = self.pop_op()?;
        let dm = self.d_size.mask();
        self.regs[REG_BP] = (self.regs[REG_BP] & !dm) | (bp & dm);
        self.charge(self.cyc.pop);
        Ok(())
    }

    /// BOUND r16/r32, m: raise #BR when the index is outside [low, high].
    pub(crate) fn op_bound(&mut self, m: &ModRm) -> Result<(), Fault> {
        if m.is_reg() {
            return Err(Fault::ud());
        }
        let size = self.d_size;
        let (seg, off) = self.ea.unwrap();
        let low = self.read_seg(seg, off, size)?;
        let high = self.read_seg(seg, off.wrapping_add(size.bytes()), size)?;
        let idx = self.get_reg(m.reg, size);
        let (idx, low, high) = match size {
            OpSize::Dword => (idx as i32 as i64, low as i32 as i64, high as i32 as i64),
            _ => (
                idx as u16 as i16 as i64,
                low as u16 as i16 as i64,
                high as u16 as i16 as i64,
            ),
        };
        if idx < low || idx > high {
            return Err(Fault::br());
        }
        self.charge(self.cyc.base);
        Ok(())
    }

    // Far transfers.

    /// JMP ptr16:16/ptr16:32 or JMP m16:16/m16:32.
    pub(crate) fn op_jmp_far(&mut self, sel: u16, off: u32) -> Result<(), Fault> {
        self.charge(self.cyc.jmp_far);
        if !self.prot_mode() {
            self.load_seg_real(SegId::Cs, sel);
            self.eip = off & self.op_ip_mask();
            return Ok(());
        }
        self.far_transfer(sel, off, false)
    }

    /// CALL ptr16:16/ptr16:32 or CALL m16:16/m16:32.
    pub(crate) fn op_call_far(&mut self, sel: u16, off: u32) -> Result<(), Fault> {
        self.charge(self.cyc.call_far);
        if !self.prot_mode() {
            self.push_op(self.seg(SegId::Cs).sel as u32)?;
            self.push_op(self.eip)?;
            self.load_seg_real(SegId::Cs, sel);
            self.eip = off & self.op_ip_mask();
            return Ok(());
        }
        self.far_transfer(sel, off, true)
    }

    /// Protected-mode far JMP/CALL: direct code segment, call gate, task
    /// gate, or TSS.
    fn far_transfer(&mut self, sel: u16, off: u32, is_call: bool) -> Result<(), Fault> {
        if sel & 0xFFFC == 0 {
            return Err(Fault::gp(0));
        }
        let d = self.read_descriptor(sel)?;
        if d.is_seg() {
            if !d.is_code() {
                return Err(Fault::gp(sel_error(sel, false)));
            }
            let rpl = (sel & 3) as u8;
            if d.is_conforming() {
                if d.dpl() > self.cpl {
                    return Err(Fault::gp(sel_error(sel, false)));
                }
            } else if d.dpl() != self.cpl || rpl != self.cpl {
                return Err(Fault::gp(sel_error(sel, false)));
            }
            if !d.present() {
                return Err(Fault::np(sel_error(sel, false)));
            }
            if off > d.limit(self.model()) {
                return Err(Fault::gp(0));
            }
            if is_call {
                self.push_op(self.seg(SegId::Cs).sel as u32)?;
                self.push_op(self.eip)?;
            }
            let cpl = self.cpl;
            self.commit_cs(sel, &d, cpl);
            self.eip = off & self.op_ip_mask();
            return Ok(());
        }

        match d.typ() {
            desc::TYPE_GATE_CALL286 | desc::TYPE_GATE_CALL386 => {
                self.call_gate_transfer(sel, &d, is_call)
            }
            desc::TYPE_GATE_TASK => {
                let tss_sel = d.gate_selector();
                if tss_sel & 0xFFFC == 0 || tss_sel & 0x0004 != 0 {
                    return Err(Fault::gp(sel_error(tss_sel, false)));
                }
                let nest = if is_call { TaskNest::CallOrInt } else { TaskNest::Jmp };
                self.switch_task(tss_sel, nest)
            }
            desc::TYPE_TSS286 | desc::TYPE_TSS386 => {
                let nest = if is_call { TaskNest::CallOrInt } else { TaskNest::Jmp };
                if d.is_tss_busy() {
                    return Err(Fault::gp(sel_error(sel, false)));
                }
                self.switch_task(sel, nest)
            }
            _ => Err(Fault::gp(sel_error(sel, false))),
        }
    }

    /// Transit a call gate, switching stacks and copying parameters for an
    /// inter-privilege CALL.
    fn call_gate_transfer(
        &mut self,
        gate_sel: u16,
        gate: &Descriptor,
        is_call: bool,
    ) -> Result<(), Fault> {
        let rpl = (gate_sel & 3) as u8;
        if gate.dpl() < self.cpl.max(rpl) {
            return Err(Fault::gp(sel_error(gate_sel, false)));
        }
        if !gate.present() {
            return Err(Fault::np(sel_error(gate_sel, false)));
        }
        let sel = gate.gate_selector();
        if sel & 0xFFFC == 0 {
            return Err(Fault::gp(0));
        }
        let d = self.read_descriptor(sel)?;
        if !d.is_code() || d.dpl() > self.cpl {
            return Err(Fault::gp(sel_error(sel, false)));
        }
        if !d.present() {
            return Err(Fault::np(sel_error(sel, false)));
        }

        let gate_size = if gate.is_gate_386() {
            OpSize::Dword
        } else {
            OpSize::Word
        };
        let off = gate.gate_offset();

        if is_call && !d.is_conforming() && d.dpl() < self.cpl {
            // Inter-privilege call: stack switch plus parameter copy.
            let dpl = d.dpl();
            let (new_ss, new_sp) = self.tss_stack(dpl)?;
            let old_ss = self.seg(SegId::Ss).sel as u32;
            let old_sp = self.regs[REG_SP];
            let count = gate.gate_param_count();

            // Read the parameters off the caller's stack first.
            let m = self.sp_mask();
            let mut params = Vec::with_capacity(count as usize);
            for i in 0..count {
                let off = old_sp.wrapping_add(i * gate_size.bytes()) & m;
                params.push(self.read_seg(SegId::Ss, off, gate_size)?);
            }

            let old_cs = self.seg(SegId::Cs).sel as u32;
            let old_eip = self.eip;

            self.load_stack_for_level(new_ss, new_sp, dpl)?;
            self.push_sized(old_ss, gate_size)?;
            self.push_sized(old_sp, gate_size)?;
            for &p in params.iter().rev() {
                self.push_sized(p, gate_size)?;
            }
            self.push_sized(old_cs, gate_size)?;
            self.push_sized(old_eip, gate_size)?;
            self.commit_cs(sel, &d, dpl);
        } else {
            // Same-privilege transit (or any JMP through the gate).
            if !is_call && !d.is_conforming() && d.dpl() != self.cpl {
                return Err(Fault::gp(sel_error(sel, false)));
            }
            if is_call {
                self.push_sized(self.seg(SegId::Cs).sel as u32, gate_size)?;
                self.push_sized(self.eip, gate_size)?;
            }
            let cpl = self.cpl;
            self.commit_cs(sel, &d, cpl);
        }

        if off > self.seg(SegId::Cs).limit {
            return Err(Fault::gp(0));
        }
        self.eip = off;
        Ok(())
    }

    /// RET far, optionally discarding parameter bytes on both stacks.
    pub(crate) fn op_ret_far(&mut self, extra: u32) -> Result<(), Fault> {
        self.charge(self.cyc.ret_far);
        let size = self.d_size;
        let b = size.bytes();
        let m = self.sp_mask();
        let sp0 = self.regs[REG_SP] & m;

        if !self.prot_mode() {
            let ip = self.read_seg(SegId::Ss, sp0, size)?;
            let cs = self.read_seg(SegId::Ss, sp0.wrapping_add(b) & m, size)?;
            self.regs[REG_SP] = (self.regs[REG_SP] & !m)
                | (sp0.wrapping_add(2 * b).wrapping_add(extra) & m);
            self.load_seg_real(SegId::Cs, cs as u16);
            self.eip = ip & self.op_ip_mask();
            return Ok(());
        }

        let ip = self.read_seg(SegId::Ss, sp0, size)?;
        let cs_sel = self.read_seg(SegId::Ss, sp0.wrapping_add(b) & m, size)? as u16;
        let rpl = (cs_sel & 3) as u8;
        if rpl < self.cpl {
            return Err(Fault::gp(sel_error(cs_sel, false)));
        }
        if cs_sel & 0xFFFC == 0 {
            return Err(Fault::gp(0));
        }
        let d = self.read_descriptor(cs_sel)?;
        if !d.is_code() {
            return Err(Fault::gp(sel_error(cs_sel, false)));
        }
        if d.is_conforming() {
            if d.dpl() > rpl {
                return Err(Fault::gp(sel_error(cs_sel, false)));
            }
        } else if d.dpl() != rpl {
            return Err(Fault::gp(sel_error(cs_sel, false)));
        }
        if !d.present() {
            return Err(Fault::np(sel_error(cs_sel, false)));
        }
        if ip > d.limit(self.model()) {
            return Err(Fault::gp(0));
        }

        if rpl == self.cpl {
            self.regs[REG_SP] = (self.regs[REG_SP] & !m)
                | (sp0.wrapping_add(2 * b).wrapping_add(extra) & m);
            self.commit_cs(cs_sel, &d, rpl);
            self.eip = ip & self.op_ip_mask();
        } else {
            // Return to an outer (less privileged) level: restore the
            // caller's stack from this one, then drop the shadow data
            // segments that the outer level may not see. The incoming
            // stack must prove valid before CS, CPL, or EIP change.
            let outer_base = sp0.wrapping_add(2 * b).wrapping_add(extra) & m;
            let new_sp = self.read_seg(SegId::Ss, outer_base, size)?;
            let new_ss = self.read_seg(SegId::Ss, outer_base.wrapping_add(b) & m, size)? as u16;
            let ss_desc = self.check_ss_for(new_ss, rpl)?;
            self.commit_cs(cs_sel, &d, rpl);
            self.eip = ip & self.op_ip_mask();
            self.commit_seg(SegId::Ss, new_ss, &ss_desc);
            let m2 = self.sp_mask();
            self.regs[REG_SP] =
                (self.regs[REG_SP] & !m2) | (new_sp.wrapping_add(extra) & m2);
            self.null_invisible_segs();
        }
        Ok(())
    }

    /// IRET: trap/interrupt return, task return when NT is set.
    pub(crate) fn op_iret(&mut self) -> Result<(), Fault> {
        self.charge(self.cyc.iret);
        // The in-service fault, if any, ends here.
        self.nfault = None;

        if !self.prot_mode() {
            let ip = self.pop_sized(OpSize::Word)?;
            let cs = self.pop_sized(OpSize::Word)?;
            let ps = self.pop_sized(OpSize::Word)?;
            self.load_seg_real(SegId::Cs, cs as u16);
            self.eip = ip;
            self.set_ps(ps);
            return Ok(());
        }

        if self.get_ps() & super::flags::PS_NT != 0 {
            // Nested-task return: the back link in the current TSS names
            // the task to resume.
            let back_link = self.read_linear_word(self.tr.base)?;
            return self.switch_task(back_link, TaskNest::Iret);
        }

        let size = self.d_size;
        let b = size.bytes();
        let m = self.sp_mask();
        let sp0 = self.regs[REG_SP] & m;
        let ip = self.read_seg(SegId::Ss, sp0, size)?;
        let cs_sel = self.read_seg(SegId::Ss, sp0.wrapping_add(b) & m, size)? as u16;
        let ps = self.read_seg(SegId::Ss, sp0.wrapping_add(2 * b) & m, size)?;

        let rpl = (cs_sel & 3) as u8;
        if rpl < self.cpl {
            return Err(Fault::gp(sel_error(cs_sel, false)));
        }
        if cs_sel & 0xFFFC == 0 {
            return Err(Fault::gp(0));
        }
        let d = self.read_descriptor(cs_sel)?;
        if !d.is_code() {
            return Err(Fault::gp(sel_error(cs_sel, false)));
        }
        if d.is_conforming() {
            if d.dpl() > rpl {
                return Err(Fault::gp(sel_error(cs_sel, false)));
            }
        } else if d.dpl() != rpl {
            return Err(Fault::gp(sel_error(cs_sel, false)));
        }
        if !d.present() {
            return Err(Fault::np(sel_error(cs_sel, false)));
        }
        if ip > d.limit(self.model()) {
            return Err(Fault::gp(0));
        }

        if rpl == self.cpl {
            self.regs[REG_SP] = (self.regs[REG_SP] & !m) | (sp0.wrapping_add(3 * b) & m);
            self.set_ps_checked(ps);
            self.commit_cs(cs_sel, &d, rpl);
            self.eip = ip & self.op_ip_mask();
        } else {
            let new_sp = self.read_seg(SegId::Ss, sp0.wrapping_add(3 * b) & m, size)?;
            let new_ss = self.read_seg(SegId::Ss, sp0.wrapping_add(4 * b) & m, size)? as u16;
            // The outer stack must prove valid before anything commits.
            let ss_desc = self.check_ss_for(new_ss, rpl)?;
            // IF/IOPL protection applies at the privilege we are leaving.
            self.set_ps_checked(ps);
            self.commit_cs(cs_sel, &d, rpl);
            self.eip = ip & self.op_ip_mask();
            self.commit_seg(SegId::Ss, new_ss, &ss_desc);
            let m2 = self.sp_mask();
            self.regs[REG_SP] = (self.regs[REG_SP] & !m2) | (new_sp & m2);
            self.null_invisible_segs();
        }
        Ok(())
    }

    /// After a privilege-lowering return, data segment registers whose
    /// DPL is below the new CPL (and which are not conforming code) are
    /// forcibly nulled.
    fn null_invisible_segs(&mut self) {
        for id in [SegId::Es, SegId::Ds, SegId::Fs, SegId::Gs] {
            let s = &self.segs[id as usize];
            if s.acc == 0 {
                continue;
            }
            let conforming_code = s.acc & desc::ACC_TYPE_CODE != 0
                && s.acc & desc::ACC_TYPE_CONFORMING != 0;
            if !conforming_code && s.dpl < self.cpl {
                let s = &mut self.segs[id as usize];
                s.sel = 0;
                s.base = 0;
                s.limit = 0;
                s.acc = 0;
                s.ext = 0;
                s.dpl = 0;
                s.desc_addr = None;
            }
        }
    }
}

//! Memory access plumbing: instruction fetch through CS, segment-checked
//! loads and stores, linear accesses for descriptor tables, the stack, and
//! port I/O.
//!
//! Wider accesses decompose into bytes so page and segment-wrap behavior
//! falls out of the per-byte path. Any access that faults propagates the
//! fault before the instruction commits architectural state.

use super::interrupt::Fault;
use super::segment::{desc, SegId};
use super::{CpuX86, OpSize, REG_SP};
use crate::Bus;

impl<B: Bus> CpuX86<B> {
    /// Offset mask for EIP arithmetic: 64K unless CS is a 32-bit segment.
    #[inline]
    pub(crate) fn ip_mask(&self) -> u32 {
        if self.model().has_80386_ops() && self.seg(SegId::Cs).ext & desc::EXT_BIG != 0 {
            0xFFFF_FFFF
        } else {
            0xFFFF
        }
    }

    /// Offset mask for ESP arithmetic, from the stack segment's D bit.
    #[inline]
    pub(crate) fn sp_mask(&self) -> u32 {
        if self.model().has_80386_ops() && self.seg(SegId::Ss).ext & desc::EXT_BIG != 0 {
            0xFFFF_FFFF
        } else {
            0xFFFF
        }
    }

    /// Offset wrap within a data segment.
    #[inline]
    fn seg_wrap(&self) -> u32 {
        if self.prot_mode() {
            0xFFFF_FFFF
        } else {
            0xFFFF
        }
    }

    #[inline]
    fn user_access(&self) -> bool {
        self.cpl == 3
    }

    // Code fetch. CS limit violations are GP(0); the readable-rights test
    // does not apply to fetches, so this has its own check.
    fn code_lin(&mut self, off: u32) -> Result<u32, Fault> {
        let seg = &self.segs[SegId::Cs as usize];
        if self.prot_mode() && off > seg.limit {
            return Err(Fault::gp(0));
        }
        Ok(seg.base.wrapping_add(off))
    }

    /// Fetch one opcode/immediate byte through CS, advancing EIP.
    pub(crate) fn fetch_byte(&mut self) -> Result<u8, Fault> {
        let mask = self.ip_mask();
        let off = self.eip & mask;
        let lin = self.code_lin(off)?;
        let user = self.user_access();
        let phys = self.lin_to_phys(lin, false, user)?;
        let b = self.bus.read_byte(phys);
        self.eip = self.eip.wrapping_add(1) & mask;
        Ok(b)
    }

    pub(crate) fn fetch_word(&mut self) -> Result<u16, Fault> {
        let lo = self.fetch_byte()? as u16;
        let hi = self.fetch_byte()? as u16;
        Ok((hi << 8) | lo)
    }

    pub(crate) fn fetch_dword(&mut self) -> Result<u32, Fault> {
        let lo = self.fetch_word()? as u32;
        let hi = self.fetch_word()? as u32;
        Ok((hi << 16) | lo)
    }

    /// Fetch an immediate of the given width.
    pub(crate) fn fetch_data(&mut self, size: OpSize) -> Result<u32, Fault> {
        match size {
            OpSize::Byte => Ok(self.fetch_byte()? as u32),
            OpSize::Word => Ok(self.fetch_word()? as u32),
            OpSize::Dword => self.fetch_dword(),
        }
    }

    // Linear accesses, used for descriptor tables, the IVT, and TSS
    // images. These run at supervisor rights.

    pub(crate) fn read_linear_byte(&mut self, lin: u32) -> Result<u8, Fault> {
        let phys = self.lin_to_phys(lin, false, false)?;
        Ok(self.bus.read_byte(phys))
    }

    pub(crate) fn read_linear_word(&mut self, lin: u32) -> Result<u16, Fault> {
        let lo = self.read_linear_byte(lin)? as u16;
        let hi = self.read_linear_byte(lin.wrapping_add(1))? as u16;
        Ok((hi << 8) | lo)
    }

    pub(crate) fn read_linear_dword(&mut self, lin: u32) -> Result<u32, Fault> {
        let lo = self.read_linear_word(lin)? as u32;
        let hi = self.read_linear_word(lin.wrapping_add(2))? as u32;
        Ok((hi << 16) | lo)
    }

    pub(crate) fn write_linear_byte(&mut self, lin: u32, val: u8) -> Result<(), Fault> {
        let phys = self.lin_to_phys(lin, true, false)?;
        self.bus.write_byte(phys, val);
        Ok(())
    }

    pub(crate) fn write_linear_word(&mut self, lin: u32, val: u16) -> Result<(), Fault> {
        self.write_linear_byte(lin, (val & 0xFF) as u8)?;
        self.write_linear_byte(lin.wrapping_add(1), (val >> 8) as u8)
    }

    pub(crate) fn write_linear_dword(&mut self, lin: u32, val: u32) -> Result<(), Fault> {
        self.write_linear_word(lin, (val & 0xFFFF) as u16)?;
        self.write_linear_word(lin.wrapping_add(2), (val >> 16) as u16)
    }

    /// Bookkeeping write (accessed/busy bits) that must not raise a guest
    /// fault of its own; a failed translation drops the write.
    pub(crate) fn write_linear_byte_lossy(&mut self, lin: u32, val: u8) {
        if let Ok(phys) = self.lin_to_phys(lin, true, false) {
            self.bus.write_byte(phys, val);
        }
    }

    // Segment-relative accesses.

    /// Read an operand at `seg:off`, applying limit, rights, and paging.
    pub(crate) fn read_seg(&mut self, id: SegId, off: u32, size: OpSize) -> Result<u32, Fault> {
        let len = size.bytes();
        self.seg_check(id, off, len, false)?;
        let base = self.seg(id).base;
        let wrap = self.seg_wrap();
        let user = self.user_access();
        let mut val = 0u32;
        for i in 0..len {
            let lin = base.wrapping_add(off.wrapping_add(i) & wrap);
            let phys = self.lin_to_phys(lin, false, user)?;
            val |= (self.bus.read_byte(phys) as u32) << (8 * i);
        }
        Ok(val)
    }

    /// Write an operand at `seg:off`, applying limit, rights, and paging.
    pub(crate) fn write_seg(
        &mut self,
        id: SegId,
        off: u32,
        val: u32,
        size: OpSize,
    ) -> Result<(), Fault> {
        let len = size.bytes();
        self.seg_check(id, off, len, true)?;
        let base = self.seg(id).base;
        let wrap = self.seg_wrap();
        let user = self.user_access();
        for i in 0..len {
            let lin = base.wrapping_add(off.wrapping_add(i) & wrap);
            let phys = self.lin_to_phys(lin, true, user)?;
            self.bus.write_byte(phys, (val >> (8 * i)) as u8);
        }
        Ok(())
    }

    // Stack. New SP values commit only after the access succeeds, so a
    // faulting push leaves SS:SP untouched.

    pub(crate) fn push_sized(&mut self, val: u32, size: OpSize) -> Result<(), Fault> {
        let m = self.sp_mask();
        let sp = self.regs[REG_SP];
        let new_off = sp.wrapping_sub(size.bytes()) & m;
        self.write_seg(SegId::Ss, new_off, val, size)?;
        self.regs[REG_SP] = (sp & !m) | new_off;
        Ok(())
    }

    pub(crate) fn pop_sized(&mut self, size: OpSize) -> Result<u32, Fault> {
        let m = self.sp_mask();
        let off = self.regs[REG_SP] & m;
        let val = self.read_seg(SegId::Ss, off, size)?;
        self.regs[REG_SP] =
            (self.regs[REG_SP] & !m) | (off.wrapping_add(size.bytes()) & m);
        Ok(val)
    }

    /// Push at the instruction's operand size.
    pub(crate) fn push_op(&mut self, val: u32) -> Result<(), Fault> {
        self.push_sized(val, self.d_size)
    }

    pub(crate) fn pop_op(&mut self) -> Result<u32, Fault> {
        self.pop_sized(self.d_size)
    }

    // Port I/O, gated by IOPL in protected mode.

    pub(crate) fn io_check(&mut self) -> Result<(), Fault> {
        if self.prot_mode() && (self.cpl as u32) > self.get_iopl() {
            return Err(Fault::gp(0));
        }
        Ok(())
    }

    pub(crate) fn io_read(&mut self, port: u16, size: OpSize) -> Result<u32, Fault> {
        self.io_check()?;
        Ok(match size {
            OpSize::Byte => self.bus.io_read_byte(port) as u32,
            OpSize::Word => self.bus.io_read_word(port) as u32,
            OpSize::Dword => self.bus.io_read_dword(port),
        })
    }

    pub(crate) fn io_write(&mut self, port: u16, val: u32, size: OpSize) -> Result<(), Fault> {
        self.io_check()?;
        match size {
            OpSize::Byte => self.bus.io_write_byte(port, val as u8),
            OpSize::Word => self.bus.io_write_word(port, val as u16),
            OpSize::Dword => self.bus.io_write_dword(port, val),
        }
        Ok(())
    }
}

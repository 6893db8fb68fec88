//! String operations: MOVS/CMPS/SCAS/LODS/STOS and the port forms
//! INS/OUTS, at every operand width, with REP/REPZ/REPNZ iteration.
//!
//! A repeated string instruction is interruptible at each iteration
//! boundary: when the burst budget runs out or a maskable interrupt is
//! pending, EIP rewinds to the instruction start (which includes the
//! prefix bytes), so the instruction resumes exactly where it stopped
//! after the interrupt returns.

use super::alu::AluOp;
use super::flags::{PS_DF, PS_IF};
use super::interrupt::Fault;
use super::segment::SegId;
use super::{CpuX86, IntFlags, OpFlags, OpSize, REG_AX, REG_CX, REG_DI, REG_DX, REG_SI};
use crate::Bus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StringOp {
    Movs,
    Cmps,
    Scas,
    Lods,
    Stos,
    Ins,
    Outs,
}

impl<B: Bus> CpuX86<B> {
    pub(crate) fn op_string(&mut self, op: StringOp, size: OpSize) -> Result<(), Fault> {
        let rep = self.op_flags.intersects(OpFlags::REPZ | OpFlags::REPNZ);
        let repnz = self.op_flags.contains(OpFlags::REPNZ);
        let cm: u32 = if self.a_mask != 0xFFFF { 0xFFFF_FFFF } else { 0xFFFF };
        let step = size.bytes();
        let src_seg = self.mem_seg(SegId::Ds);
        let port = self.get_reg(REG_DX, OpSize::Word) as u16;

        loop {
            if rep && self.regs[REG_CX] & cm == 0 {
                break;
            }

            let down = self.get_flag(PS_DF);
            match op {
                StringOp::Movs => {
                    let v = self.read_seg(src_seg, self.regs[REG_SI] & cm, size)?;
                    self.write_seg(SegId::Es, self.regs[REG_DI] & cm, v, size)?;
                    self.advance(REG_SI, step, down, cm);
                    self.advance(REG_DI, step, down, cm);
                }
                StringOp::Cmps => {
                    let a = self.read_seg(src_seg, self.regs[REG_SI] & cm, size)?;
                    let b = self.read_seg(SegId::Es, self.regs[REG_DI] & cm, size)?;
                    self.alu(AluOp::Cmp, a, b, size);
                    self.advance(REG_SI, step, down, cm);
                    self.advance(REG_DI, step, down, cm);
                }
                StringOp::Scas => {
                    let a = self.get_reg(REG_AX, size);
                    let b = self.read_seg(SegId::Es, self.regs[REG_DI] & cm, size)?;
                    self.alu(AluOp::Cmp, a, b, size);
                    self.advance(REG_DI, step, down, cm);
                }
                StringOp::Lods => {
                    let v = self.read_seg(src_seg, self.regs[REG_SI] & cm, size)?;
                    self.set_reg(REG_AX, size, v);
                    self.advance(REG_SI, step, down, cm);
                }
                StringOp::Stos => {
                    let v = self.get_reg(REG_AX, size);
                    self.write_seg(SegId::Es, self.regs[REG_DI] & cm, v, size)?;
                    self.advance(REG_DI, step, down, cm);
                }
                StringOp::Ins => {
                    let v = self.io_read(port, size)?;
                    self.write_seg(SegId::Es, self.regs[REG_DI] & cm, v, size)?;
                    self.advance(REG_DI, step, down, cm);
                }
                StringOp::Outs => {
                    let v = self.read_seg(src_seg, self.regs[REG_SI] & cm, size)?;
                    self.io_write(port, v, size)?;
                    self.advance(REG_SI, step, down, cm);
                }
            }
            self.charge(self.cyc.string_iter);

            if !rep {
                break;
            }
            let count = self.regs[REG_CX].wrapping_sub(1) & cm;
            self.regs[REG_CX] = (self.regs[REG_CX] & !cm) | count;
            if count == 0 {
                break;
            }
            if matches!(op, StringOp::Cmps | StringOp::Scas) && self.get_zf() == repnz {
                break;
            }

            let intr_pending = self.int_flags.contains(IntFlags::INTR)
                && self.get_ps() & PS_IF != 0;
            if self.cycles_left <= 0 || intr_pending {
                // Resume later: re-point EIP at the prefixed instruction
                // and open the interrupt window.
                self.eip = self.op_eip;
                self.op_flags.remove(OpFlags::NOINTR);
                break;
            }
        }
        Ok(())
    }

    #[inline]
    fn advance(&mut self, reg: usize, step: u32, down: bool, mask: u32) {
        let cur = self.regs[reg];
        let next = if down {
            cur.wrapping_sub(step)
        } else {
            cur.wrapping_add(step)
        };
        self.regs[reg] = (cur & !mask) | (next & mask);
    }
}

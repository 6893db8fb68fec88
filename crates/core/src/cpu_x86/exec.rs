//! The fetch/decode dispatcher: prefix accumulation, the 256-entry
//! one-byte map, the 0x0F two-byte map, and the ModR/M groups.
//!
//! Model differences are resolved here: pre-80186 parts alias the
//! 0x60-0x6F block onto the conditional jumps, the 8086 runs 0x0F as POP
//! CS, and the 386-only prefixes and maps fall through to #UD on earlier
//! parts. Handlers mutate state through the helpers in the sibling
//! modules and raise [`Fault`]s that unwind to the burst loop.

use super::alu::AluOp;
use super::flags::{PS_CF, PS_DF, PS_IF, PS_OF, PS_ZF};
use super::interrupt::{Fault, IntKind, INT_BP, INT_OF};
use super::decode::ModRm;
use super::segment::{SegId, CR0_EM, CR0_PE, CR0_TS};
use super::string::StringOp;
use super::{CpuX86, OpFlags, OpSize, REG_AX, REG_BX, REG_CX, REG_DX, REG_SP};
use crate::logging::{log, LogCategory, LogLevel};
use crate::Bus;

impl<B: Bus> CpuX86<B> {
    /// Execute one instruction: accumulate prefixes, then dispatch.
    pub(crate) fn exec_insn(&mut self) -> Result<(), Fault> {
        loop {
            let op = self.fetch_byte()?;
            self.set_last_opcode(op);
            match op {
                0x26 => self.prefix_seg(SegId::Es),
                0x2E => self.prefix_seg(SegId::Cs),
                0x36 => self.prefix_seg(SegId::Ss),
                0x3E => self.prefix_seg(SegId::Ds),
                0x64 if self.model().has_80386_ops() => self.prefix_seg(SegId::Fs),
                0x65 if self.model().has_80386_ops() => self.prefix_seg(SegId::Gs),
                0x66 if self.model().has_80386_ops() => {
                    self.d_size = match self.default_data_size() {
                        OpSize::Word => OpSize::Dword,
                        _ => OpSize::Word,
                    };
                    self.op_flags.insert(OpFlags::DATASIZE | OpFlags::NOINTR);
                    self.charge(self.cyc.prefix);
                }
                0x67 if self.model().has_80386_ops() => {
                    self.a_mask = if self.default_addr_mask() == 0xFFFF {
                        0xFFFF_FFFF
                    } else {
                        0xFFFF
                    };
                    self.op_flags.insert(OpFlags::ADDRSIZE | OpFlags::NOINTR);
                    self.charge(self.cyc.prefix);
                }
                0xF0 => {
                    self.op_flags.insert(OpFlags::LOCK | OpFlags::NOINTR);
                    self.charge(self.cyc.prefix);
                }
                0xF2 => {
                    self.op_flags.insert(OpFlags::REPNZ | OpFlags::NOINTR);
                    self.charge(self.cyc.prefix);
                }
                0xF3 => {
                    self.op_flags.insert(OpFlags::REPZ | OpFlags::NOINTR);
                    self.charge(self.cyc.prefix);
                }
                _ => return self.exec_opcode(op),
            }
        }
    }

    fn prefix_seg(&mut self, id: SegId) {
        self.seg_override = Some(id);
        self.op_flags.insert(OpFlags::SEG | OpFlags::NOINTR);
        self.charge(self.cyc.prefix);
    }

    fn exec_opcode(&mut self, op: u8) -> Result<(), Fault> {
        let d_size = self.d_size;
        match op {
            // Pre-80186 parts alias this whole block onto Jcc rel8.
            0x60..=0x6F if !self.model().has_80186_ops() => self.op_jcc_short(op & 0x0F)?,

            // The eight ALU operations in their six addressing forms.
            0x00 | 0x08 | 0x10 | 0x18 | 0x20 | 0x28 | 0x30 | 0x38 => {
                self.op_alu_rm_r(AluOp::from_bits(op >> 3), OpSize::Byte)?
            }
            0x01 | 0x09 | 0x11 | 0x19 | 0x21 | 0x29 | 0x31 | 0x39 => {
                self.op_alu_rm_r(AluOp::from_bits(op >> 3), d_size)?
            }
            0x02 | 0x0A | 0x12 | 0x1A | 0x22 | 0x2A | 0x32 | 0x3A => {
                self.op_alu_r_rm(AluOp::from_bits(op >> 3), OpSize::Byte)?
            }
            0x03 | 0x0B | 0x13 | 0x1B | 0x23 | 0x2B | 0x33 | 0x3B => {
                self.op_alu_r_rm(AluOp::from_bits(op >> 3), d_size)?
            }
            0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => {
                self.op_alu_acc_imm(AluOp::from_bits(op >> 3), OpSize::Byte)?
            }
            0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => {
                self.op_alu_acc_imm(AluOp::from_bits(op >> 3), d_size)?
            }

            // Segment register pushes and pops.
            0x06 => self.op_push_seg(SegId::Es)?,
            0x07 => self.op_pop_seg(SegId::Es)?,
            0x0E => self.op_push_seg(SegId::Cs)?,
            0x0F => {
                if self.model().has_80286_ops() {
                    return self.exec_0f();
                }
                // The 8086 runs 0x0F as POP CS.
                let sel = self.pop_sized(OpSize::Word)?;
                self.load_seg_real(SegId::Cs, sel as u16);
                self.charge(self.cyc.pop);
            }
            0x16 => self.op_push_seg(SegId::Ss)?,
            0x17 => {
                self.op_pop_seg(SegId::Ss)?;
                self.op_flags.insert(OpFlags::NOINTR);
            }
            0x1E => self.op_push_seg(SegId::Ds)?,
            0x1F => self.op_pop_seg(SegId::Ds)?,

            // BCD adjusts.
            0x27 => {
                self.alu_daa();
                self.charge(self.cyc.base);
            }
            0x2F => {
                self.alu_das();
                self.charge(self.cyc.base);
            }
            0x37 => {
                self.alu_aaa();
                self.charge(self.cyc.base);
            }
            0x3F => {
                self.alu_aas();
                self.charge(self.cyc.base);
            }

            // INC/DEC r16/r32.
            0x40..=0x47 => {
                let r = (op & 7) as usize;
                let v = self.get_reg(r, d_size);
                let v = self.alu_inc(v, d_size);
                self.set_reg(r, d_size, v);
                self.charge(self.cyc.inc_r);
            }
            0x48..=0x4F => {
                let r = (op & 7) as usize;
                let v = self.get_reg(r, d_size);
                let v = self.alu_dec(v, d_size);
                self.set_reg(r, d_size, v);
                self.charge(self.cyc.inc_r);
            }

            // PUSH/POP r16/r32.
            0x50..=0x57 => {
                let r = (op & 7) as usize;
                let mut v = self.get_reg(r, d_size);
                // The 8086/80186 push SP already decremented; the 80286
                // and later push the original value.
                if r == REG_SP && !self.model().has_80286_ops() {
                    v = v.wrapping_sub(d_size.bytes()) & d_size.mask();
                }
                self.push_op(v)?;
                self.charge(self.cyc.push);
            }
            0x58..=0x5F => {
                let r = (op & 7) as usize;
                let v = self.pop_op()?;
                self.set_reg(r, d_size, v);
                self.charge(self.cyc.pop);
            }

            // 80186 additions.
            0x60 => self.op_pusha()?,
            0x61 => self.op_popa()?,
            0x62 => {
                let m = self.fetch_modrm()?;
                self.op_bound(&m)?;
            }
            0x63 => {
                // ARPL exists only in protected mode.
                if !self.prot_mode() {
                    return Err(Fault::ud());
                }
                let m = self.fetch_modrm()?;
                let dst = self.read_rm(&m, OpSize::Word)?;
                let rpl = self.get_reg(m.reg, OpSize::Word) & 3;
                if dst & 3 < rpl {
                    let adjusted = (dst & !3) | rpl;
                    self.write_rm(&m, OpSize::Word, adjusted)?;
                    self.set_flag(PS_ZF, true);
                } else {
                    self.set_flag(PS_ZF, false);
                }
                self.charge(self.cyc.alu_rm);
            }
            0x68 => {
                let v = self.fetch_data(d_size)?;
                self.push_op(v)?;
                self.charge(self.cyc.push);
            }
            0x69 => {
                let m = self.fetch_modrm()?;
                let a = self.read_rm(&m, d_size)?;
                let imm = self.fetch_data(d_size)?;
                let r = self.alu_imul_trunc(a, imm, d_size);
                self.set_reg(m.reg, d_size, r);
                self.charge(self.cyc.mul);
            }
            0x6A => {
                let v = self.fetch_byte()? as i8 as i32 as u32;
                self.push_op(v & d_size.mask())?;
                self.charge(self.cyc.push);
            }
            0x6B => {
                let m = self.fetch_modrm()?;
                let a = self.read_rm(&m, d_size)?;
                let imm = self.fetch_byte()? as i8 as i32 as u32;
                let r = self.alu_imul_trunc(a, imm, d_size);
                self.set_reg(m.reg, d_size, r);
                self.charge(self.cyc.mul);
            }
            0x6C => self.op_string(StringOp::Ins, OpSize::Byte)?,
            0x6D => self.op_string(StringOp::Ins, d_size)?,
            0x6E => self.op_string(StringOp::Outs, OpSize::Byte)?,
            0x6F => self.op_string(StringOp::Outs, d_size)?,

            0x70..=0x7F => self.op_jcc_short(op & 0x0F)?,

            // Immediate ALU groups.
            0x80 | 0x82 => self.op_group_alu(OpSize::Byte, false)?,
            0x81 => self.op_group_alu(d_size, false)?,
            0x83 => self.op_group_alu(d_size, true)?,

            0x84 => self.op_test_rm_r(OpSize::Byte)?,
            0x85 => self.op_test_rm_r(d_size)?,
            0x86 => self.op_xchg_rm_r(OpSize::Byte)?,
            0x87 => self.op_xchg_rm_r(d_size)?,

            // MOV.
            0x88 => {
                let m = self.fetch_modrm()?;
                let v = self.get_reg(m.reg, OpSize::Byte);
                self.write_rm(&m, OpSize::Byte, v)?;
                self.charge_mov(&m);
            }
            0x89 => {
                let m = self.fetch_modrm()?;
                let v = self.get_reg(m.reg, d_size);
                self.write_rm(&m, d_size, v)?;
                self.charge_mov(&m);
            }
            0x8A => {
                let m = self.fetch_modrm()?;
                let v = self.read_rm(&m, OpSize::Byte)?;
                self.set_reg(m.reg, OpSize::Byte, v);
                self.charge_mov(&m);
            }
            0x8B => {
                let m = self.fetch_modrm()?;
                let v = self.read_rm(&m, d_size)?;
                self.set_reg(m.reg, d_size, v);
                self.charge_mov(&m);
            }
            0x8C => {
                let m = self.fetch_modrm()?;
                let id = SegId::from_index(m.reg as u8).ok_or_else(Fault::ud)?;
                if !self.model().has_80386_ops() && m.reg > 3 {
                    return Err(Fault::ud());
                }
                let sel = self.seg(id).sel as u32;
                if m.is_reg() && d_size == OpSize::Dword {
                    self.set_reg(m.rm, OpSize::Dword, sel);
                } else {
                    self.write_rm(&m, OpSize::Word, sel)?;
                }
                self.charge_mov(&m);
            }
            0x8D => {
                let m = self.fetch_modrm()?;
                match self.ea {
                    // LEA with a register operand has no address to take.
                    None => return Err(Fault::ud()),
                    Some((_, off)) => {
                        self.set_reg(m.reg, d_size, off);
                    }
                }
                self.charge(self.cyc.base);
            }
            0x8E => {
                let m = self.fetch_modrm()?;
                let id = SegId::from_index(m.reg as u8).ok_or_else(Fault::ud)?;
                if id == SegId::Cs {
                    return Err(Fault::ud());
                }
                if !self.model().has_80386_ops() && m.reg > 3 {
                    return Err(Fault::ud());
                }
                let sel = self.read_rm(&m, OpSize::Word)? as u16;
                self.load_seg(id, sel)?;
                if id == SegId::Ss {
                    // Loading SS shields the following instruction from
                    // interrupts so SS:SP moves atomically.
                    self.op_flags.insert(OpFlags::NOINTR);
                }
                self.charge(self.cyc.seg_load);
            }
            0x8F => {
                let m = self.fetch_modrm()?;
                if m.reg != 0 {
                    return Err(Fault::ud());
                }
                let v = self.pop_op()?;
                self.write_rm(&m, d_size, v)?;
                self.charge(self.cyc.pop);
            }

            0x90 => self.charge(self.cyc.base), // NOP
            0x91..=0x97 => {
                let r = (op & 7) as usize;
                let a = self.get_reg(REG_AX, d_size);
                let b = self.get_reg(r, d_size);
                self.set_reg(REG_AX, d_size, b);
                self.set_reg(r, d_size, a);
                self.charge(self.cyc.base);
            }
            0x98 => {
                // CBW / CWDE.
                match d_size {
                    OpSize::Dword => {
                        let v = self.get_reg(REG_AX, OpSize::Word) as u16 as i16 as i32 as u32;
                        self.set_reg(REG_AX, OpSize::Dword, v);
                    }
                    _ => {
                        let v = self.get_reg(REG_AX, OpSize::Byte) as u8 as i8 as i16 as u16;
                        self.set_reg(REG_AX, OpSize::Word, v as u32);
                    }
                }
                self.charge(self.cyc.base);
            }
            0x99 => {
                // CWD / CDQ.
                let sign = self.get_reg(REG_AX, d_size) & d_size.sign_bit() != 0;
                let fill = if sign { d_size.mask() } else { 0 };
                self.set_reg(REG_DX, d_size, fill);
                self.charge(self.cyc.base);
            }
            0x9A => {
                let off = self.fetch_data(d_size)?;
                let sel = self.fetch_word()?;
                self.op_call_far(sel, off)?;
            }
            0x9B => {
                // WAIT polls the math unit; fault when one is pending.
                if self.model().has_80286_ops()
                    && self.cr0 & CR0_TS != 0
                    && self.cr0 & super::segment::CR0_MP != 0
                {
                    return Err(Fault::nm());
                }
                self.charge(self.cyc.base);
            }
            0x9C => {
                let ps = self.get_ps();
                self.push_op(ps)?;
                self.charge(self.cyc.push);
            }
            0x9D => {
                let v = self.pop_op()?;
                self.set_ps_checked(v);
                self.charge(self.cyc.pop);
            }
            0x9E => {
                // SAHF: CF/PF/AF/ZF/SF from AH.
                let ah = (self.get_reg(REG_AX, OpSize::Word) >> 8) & 0xFF;
                for bit in [0x01, 0x04, 0x10, 0x40, 0x80] {
                    self.set_flag(bit, ah & bit != 0);
                }
                self.charge(self.cyc.base);
            }
            0x9F => {
                let low = self.get_ps() & 0xFF;
                self.set_reg(REG_AX, OpSize::Word,
                    (self.get_reg(REG_AX, OpSize::Word) & 0x00FF) | (low << 8));
                self.charge(self.cyc.base);
            }

            // Accumulator moves with a direct offset.
            0xA0 => {
                let off = self.fetch_moffs()?;
                let seg = self.mem_seg(SegId::Ds);
                let v = self.read_seg(seg, off, OpSize::Byte)?;
                self.set_reg(REG_AX, OpSize::Byte, v);
                self.charge(self.cyc.mov_rm);
            }
            0xA1 => {
                let off = self.fetch_moffs()?;
                let seg = self.mem_seg(SegId::Ds);
                let v = self.read_seg(seg, off, d_size)?;
                self.set_reg(REG_AX, d_size, v);
                self.charge(self.cyc.mov_rm);
            }
            0xA2 => {
                let off = self.fetch_moffs()?;
                let seg = self.mem_seg(SegId::Ds);
                let v = self.get_reg(REG_AX, OpSize::Byte);
                self.write_seg(seg, off, v, OpSize::Byte)?;
                self.charge(self.cyc.mov_rm);
            }
            0xA3 => {
                let off = self.fetch_moffs()?;
                let seg = self.mem_seg(SegId::Ds);
                let v = self.get_reg(REG_AX, d_size);
                self.write_seg(seg, off, v, d_size)?;
                self.charge(self.cyc.mov_rm);
            }

            // String operations.
            0xA4 => self.op_string(StringOp::Movs, OpSize::Byte)?,
            0xA5 => self.op_string(StringOp::Movs, d_size)?,
            0xA6 => self.op_string(StringOp::Cmps, OpSize::Byte)?,
            0xA7 => self.op_string(StringOp::Cmps, d_size)?,
            0xA8 => {
                let imm = self.fetch_byte()? as u32;
                let a = self.get_reg(REG_AX, OpSize::Byte);
                self.alu(AluOp::And, a, imm, OpSize::Byte);
                self.op_flags.insert(OpFlags::NOWRITE);
                self.charge(self.cyc.alu_rr);
            }
            0xA9 => {
                let imm = self.fetch_data(d_size)?;
                let a = self.get_reg(REG_AX, d_size);
                self.alu(AluOp::And, a, imm, d_size);
                self.op_flags.insert(OpFlags::NOWRITE);
                self.charge(self.cyc.alu_rr);
            }
            0xAA => self.op_string(StringOp::Stos, OpSize::Byte)?,
            0xAB => self.op_string(StringOp::Stos, d_size)?,
            0xAC => self.op_string(StringOp::Lods, OpSize::Byte)?,
            0xAD => self.op_string(StringOp::Lods, d_size)?,
            0xAE => self.op_string(StringOp::Scas, OpSize::Byte)?,
            0xAF => self.op_string(StringOp::Scas, d_size)?,

            // MOV immediate to register.
            0xB0..=0xB7 => {
                let v = self.fetch_byte()? as u32;
                self.set_reg((op & 7) as usize, OpSize::Byte, v);
                self.charge(self.cyc.mov_rr);
            }
            0xB8..=0xBF => {
                let v = self.fetch_data(d_size)?;
                self.set_reg((op & 7) as usize, d_size, v);
                self.charge(self.cyc.mov_rr);
            }

            // Pre-80186: 0xC0/0xC1 alias the near returns, 0xC8/0xC9 the
            // far returns.
            0xC0 if !self.model().has_80186_ops() => {
                let extra = self.fetch_word()? as u32;
                self.op_ret_near(extra)?;
            }
            0xC1 if !self.model().has_80186_ops() => self.op_ret_near(0)?,
            0xC0 => self.op_group_shift(OpSize::Byte, ShiftCount::Imm)?,
            0xC1 => self.op_group_shift(d_size, ShiftCount::Imm)?,
            0xC2 => {
                let extra = self.fetch_word()? as u32;
                self.op_ret_near(extra)?;
            }
            0xC3 => self.op_ret_near(0)?,
            0xC4 => self.op_load_far_pointer(SegId::Es)?,
            0xC5 => self.op_load_far_pointer(SegId::Ds)?,
            0xC6 => {
                let m = self.fetch_modrm()?;
                if m.reg != 0 {
                    return Err(Fault::ud());
                }
                let v = self.fetch_byte()? as u32;
                self.write_rm(&m, OpSize::Byte, v)?;
                self.charge_mov(&m);
            }
            0xC7 => {
                let m = self.fetch_modrm()?;
                if m.reg != 0 {
                    return Err(Fault::ud());
                }
                let v = self.fetch_data(d_size)?;
                self.write_rm(&m, d_size, v)?;
                self.charge_mov(&m);
            }
            0xC8 if !self.model().has_80186_ops() => {
                let extra = self.fetch_word()? as u32;
                self.op_ret_far(extra)?;
            }
            0xC9 if !self.model().has_80186_ops() => self.op_ret_far(0)?,
            0xC8 => self.op_enter()?,
            0xC9 => self.op_leave()?,
            0xCA => {
                let extra = self.fetch_word()? as u32;
                self.op_ret_far(extra)?;
            }
            0xCB => self.op_ret_far(0)?,
            0xCC => self.do_interrupt(INT_BP, IntKind::Software)?,
            0xCD => {
                let vector = self.fetch_byte()?;
                self.do_interrupt(vector, IntKind::Software)?;
            }
            0xCE => {
                if self.get_flag(PS_OF) {
                    self.do_interrupt(INT_OF, IntKind::Software)?;
                } else {
                    self.charge(self.cyc.base);
                }
            }
            0xCF => self.op_iret()?,

            // Shift/rotate groups.
            0xD0 => self.op_group_shift(OpSize::Byte, ShiftCount::One)?,
            0xD1 => self.op_group_shift(d_size, ShiftCount::One)?,
            0xD2 => self.op_group_shift(OpSize::Byte, ShiftCount::Cl)?,
            0xD3 => self.op_group_shift(d_size, ShiftCount::Cl)?,

            0xD4 => {
                let base = self.fetch_byte()? as u32;
                self.alu_aam(base)?;
                self.charge(self.cyc.mul);
            }
            0xD5 => {
                let base = self.fetch_byte()? as u32;
                self.alu_aad(base);
                self.charge(self.cyc.mul);
            }
            0xD6 => {
                // SALC, undocumented but present on every covered part.
                let v = if self.get_cf() { 0xFF } else { 0x00 };
                self.set_reg(REG_AX, OpSize::Byte, v);
                self.charge(self.cyc.base);
            }
            0xD7 => {
                // XLAT.
                let seg = self.mem_seg(SegId::Ds);
                let off = self.regs[REG_BX]
                    .wrapping_add(self.get_reg(REG_AX, OpSize::Byte))
                    & self.a_mask;
                let v = self.read_seg(seg, off, OpSize::Byte)?;
                self.set_reg(REG_AX, OpSize::Byte, v);
                self.charge(self.cyc.mov_rm);
            }
            0xD8..=0xDF => {
                // x87 escape: no coprocessor in the core. Fault when the
                // machine status word demands emulation, otherwise eat
                // the ModR/M and continue.
                if self.model().has_80286_ops() && self.cr0 & (CR0_EM | CR0_TS) != 0 {
                    return Err(Fault::nm());
                }
                log(LogCategory::Stub, LogLevel::Debug, || {
                    format!("ESC opcode {:#04x} ignored", op)
                });
                let _ = self.fetch_modrm()?;
                self.charge(self.cyc.base);
            }

            0xE0 => self.op_loop(0)?,
            0xE1 => self.op_loop(1)?,
            0xE2 => self.op_loop(2)?,
            0xE3 => self.op_jcxz()?,

            // Port I/O.
            0xE4 => {
                let port = self.fetch_byte()? as u16;
                let v = self.io_read(port, OpSize::Byte)?;
                self.set_reg(REG_AX, OpSize::Byte, v);
                self.charge(self.cyc.io);
            }
            0xE5 => {
                let port = self.fetch_byte()? as u16;
                let v = self.io_read(port, d_size)?;
                self.set_reg(REG_AX, d_size, v);
                self.charge(self.cyc.io);
            }
            0xE6 => {
                let port = self.fetch_byte()? as u16;
                let v = self.get_reg(REG_AX, OpSize::Byte);
                self.io_write(port, v, OpSize::Byte)?;
                self.charge(self.cyc.io);
            }
            0xE7 => {
                let port = self.fetch_byte()? as u16;
                let v = self.get_reg(REG_AX, d_size);
                self.io_write(port, v, d_size)?;
                self.charge(self.cyc.io);
            }
            0xE8 => self.op_call_near()?,
            0xE9 => self.op_jmp_near()?,
            0xEA => {
                let off = self.fetch_data(d_size)?;
                let sel = self.fetch_word()?;
                self.op_jmp_far(sel, off)?;
            }
            0xEB => self.op_jmp_short()?,
            0xEC => {
                let port = self.get_reg(REG_DX, OpSize::Word) as u16;
                let v = self.io_read(port, OpSize::Byte)?;
                self.set_reg(REG_AX, OpSize::Byte, v);
                self.charge(self.cyc.io);
            }
            0xED => {
                let port = self.get_reg(REG_DX, OpSize::Word) as u16;
                let v = self.io_read(port, d_size)?;
                self.set_reg(REG_AX, d_size, v);
                self.charge(self.cyc.io);
            }
            0xEE => {
                let port = self.get_reg(REG_DX, OpSize::Word) as u16;
                let v = self.get_reg(REG_AX, OpSize::Byte);
                self.io_write(port, v, OpSize::Byte)?;
                self.charge(self.cyc.io);
            }
            0xEF => {
                let port = self.get_reg(REG_DX, OpSize::Word) as u16;
                let v = self.get_reg(REG_AX, d_size);
                self.io_write(port, v, d_size)?;
                self.charge(self.cyc.io);
            }

            0xF1 => return Err(Fault::ud()),
            0xF4 => {
                if self.prot_mode() && self.cpl != 0 {
                    return Err(Fault::gp(0));
                }
                self.set_halted(true);
                self.charge(self.cyc.base);
            }
            0xF5 => {
                let cf = self.get_cf();
                self.set_flag(PS_CF, !cf);
                self.charge(self.cyc.base);
            }
            0xF6 => self.op_group3(OpSize::Byte)?,
            0xF7 => self.op_group3(d_size)?,
            0xF8 => {
                self.set_flag(PS_CF, false);
                self.charge(self.cyc.base);
            }
            0xF9 => {
                self.set_flag(PS_CF, true);
                self.charge(self.cyc.base);
            }
            0xFA => {
                self.check_iopl()?;
                self.set_flag(PS_IF, false);
                self.charge(self.cyc.base);
            }
            0xFB => {
                self.check_iopl()?;
                self.set_flag(PS_IF, true);
                // Interrupts are recognized only after the following
                // instruction.
                self.op_flags.insert(OpFlags::NOINTR);
                self.charge(self.cyc.base);
            }
            0xFC => {
                self.set_flag(PS_DF, false);
                self.charge(self.cyc.base);
            }
            0xFD => {
                self.set_flag(PS_DF, true);
                self.charge(self.cyc.base);
            }
            0xFE => {
                let m = self.fetch_modrm()?;
                match m.reg {
                    0 => {
                        let v = self.read_rm(&m, OpSize::Byte)?;
                        let v = self.alu_inc(v, OpSize::Byte);
                        self.write_rm(&m, OpSize::Byte, v)?;
                    }
                    1 => {
                        let v = self.read_rm(&m, OpSize::Byte)?;
                        let v = self.alu_dec(v, OpSize::Byte);
                        self.write_rm(&m, OpSize::Byte, v)?;
                    }
                    _ => return Err(Fault::ud()),
                }
                self.charge_inc(&m);
            }
            0xFF => self.op_group5()?,

            _ => return Err(Fault::ud()),
        }
        Ok(())
    }

    #[inline]
    fn check_iopl(&mut self) -> Result<(), Fault> {
        if self.prot_mode() && (self.cpl as u32) > self.get_iopl() {
            return Err(Fault::gp(0));
        }
        Ok(())
    }

    #[inline]
    fn charge_mov(&mut self, m: &ModRm) {
        if m.is_reg() {
            self.charge(self.cyc.mov_rr);
        } else {
            self.charge(self.cyc.mov_rm);
        }
    }

    #[inline]
    fn charge_alu(&mut self, m: &ModRm) {
        if m.is_reg() {
            self.charge(self.cyc.alu_rr);
        } else {
            self.charge(self.cyc.alu_rm);
        }
    }

    #[inline]
    fn charge_inc(&mut self, m: &ModRm) {
        if m.is_reg() {
            self.charge(self.cyc.inc_r);
        } else {
            self.charge(self.cyc.inc_m);
        }
    }

    fn fetch_moffs(&mut self) -> Result<u32, Fault> {
        if self.a_mask == 0xFFFF {
            Ok(self.fetch_word()? as u32)
        } else {
            self.fetch_dword()
        }
    }

    fn op_alu_rm_r(&mut self, aluop: AluOp, size: OpSize) -> Result<(), Fault> {
        let m = self.fetch_modrm()?;
        let dst = self.read_rm(&m, size)?;
        let src = self.get_reg(m.reg, size);
        let r = self.alu(aluop, dst, src, size);
        if aluop.writes_back() {
            self.write_rm(&m, size, r)?;
        } else {
            self.op_flags.insert(OpFlags::NOWRITE);
        }
        self.charge_alu(&m);
        Ok(())
    }

    fn op_alu_r_rm(&mut self, aluop: AluOp, size: OpSize) -> Result<(), Fault> {
        let m = self.fetch_modrm()?;
        let src = self.read_rm(&m, size)?;
        let dst = self.get_reg(m.reg, size);
        let r = self.alu(aluop, dst, src, size);
        if aluop.writes_back() {
            self.set_reg(m.reg, size, r);
        }
        self.charge_alu(&m);
        Ok(())
    }

    fn op_alu_acc_imm(&mut self, aluop: AluOp, size: OpSize) -> Result<(), Fault> {
        let imm = self.fetch_data(size)?;
        let dst = self.get_reg(REG_AX, size);
        let r = self.alu(aluop, dst, imm, size);
        if aluop.writes_back() {
            self.set_reg(REG_AX, size, r);
        }
        self.charge(self.cyc.alu_rr);
        Ok(())
    }

    /// Immediate ALU group (0x80-0x83); `sext_imm8` marks the 0x83 form.
    fn op_group_alu(&mut self, size: OpSize, sext_imm8: bool) -> Result<(), Fault> {
        let m = self.fetch_modrm()?;
        let aluop = AluOp::from_bits(m.reg as u8);
        let dst = self.read_rm(&m, size)?;
        let imm = if sext_imm8 {
            self.fetch_byte()? as i8 as i32 as u32
        } else {
            self.fetch_data(size)?
        };
        let r = self.alu(aluop, dst, imm, size);
        if aluop.writes_back() {
            self.write_rm(&m, size, r)?;
        } else {
            self.op_flags.insert(OpFlags::NOWRITE);
        }
        self.charge_alu(&m);
        Ok(())
    }

    fn op_test_rm_r(&mut self, size: OpSize) -> Result<(), Fault> {
        let m = self.fetch_modrm()?;
        let dst = self.read_rm(&m, size)?;
        let src = self.get_reg(m.reg, size);
        self.alu(AluOp::And, dst, src, size);
        self.op_flags.insert(OpFlags::NOWRITE);
        self.charge_alu(&m);
        Ok(())
    }

    fn op_xchg_rm_r(&mut self, size: OpSize) -> Result<(), Fault> {
        let m = self.fetch_modrm()?;
        let a = self.read_rm(&m, size)?;
        let b = self.get_reg(m.reg, size);
        self.write_rm(&m, size, b)?;
        self.set_reg(m.reg, size, a);
        self.charge_alu(&m);
        Ok(())
    }

    fn op_push_seg(&mut self, id: SegId) -> Result<(), Fault> {
        let sel = self.seg(id).sel as u32;
        self.push_op(sel)?;
        self.charge(self.cyc.push);
        Ok(())
    }

    fn op_pop_seg(&mut self, id: SegId) -> Result<(), Fault> {
        // Read the selector without moving SP first, so a failed load
        // leaves the stack balanced for the fault handler's restart.
        let m = self.sp_mask();
        let sp0 = self.regs[REG_SP] & m;
        let sel = self.read_seg(SegId::Ss, sp0, self.d_size)? as u16;
        self.load_seg(id, sel)?;
        self.regs[REG_SP] =
            (self.regs[REG_SP] & !m) | (sp0.wrapping_add(self.d_size.bytes()) & m);
        self.charge(self.cyc.seg_load);
        Ok(())
    }

    fn op_pusha(&mut self) -> Result<(), Fault> {
        let sp = self.get_reg(REG_SP, self.d_size);
        let order = [0usize, 1, 2, 3, 4, 5, 6, 7];
        for r in order {
            let v = if r == REG_SP {
                sp
            } else {
                self.get_reg(r, self.d_size)
            };
            self.push_op(v)?;
        }
        self.charge(self.cyc.push);
        Ok(())
    }

    fn op_popa(&mut self) -> Result<(), Fault> {
        for r in [7usize, 6, 5, 4, 3, 2, 1, 0] {
            let v = self.pop_op()?;
            if r == REG_SP {
                // The pushed SP image is discarded.
                continue;
            }
            self.set_reg(r, self.d_size, v);
        }
        self.charge(self.cyc.pop);
        Ok(())
    }

    /// LES/LDS (and via the 0x0F map LSS/LFS/LGS): load a full pointer
    /// from memory into a segment register plus a general register.
    pub(super) fn op_load_far_pointer(&mut self, id: SegId) -> Result<(), Fault> {
        let m = self.fetch_modrm()?;
        if m.is_reg() {
            return Err(Fault::ud());
        }
        let (seg, off) = self.ea.unwrap();
        let d_size = self.d_size;
        let value = self.read_seg(seg, off, d_size)?;
        let sel = self.read_seg(seg, off.wrapping_add(d_size.bytes()), OpSize::Word)? as u16;
        self.load_seg(id, sel)?;
        self.set_reg(m.reg, d_size, value);
        if id == SegId::Ss {
            self.op_flags.insert(OpFlags::NOINTR);
        }
        self.charge(self.cyc.seg_load);
        Ok(())
    }

    fn op_group_shift(&mut self, size: OpSize, count: ShiftCount) -> Result<(), Fault> {
        let m = self.fetch_modrm()?;
        let dst = self.read_rm(&m, size)?;
        let n = match count {
            ShiftCount::One => 1,
            ShiftCount::Cl => self.get_reg(REG_CX, OpSize::Byte),
            ShiftCount::Imm => self.fetch_byte()? as u32,
        };
        let r = self.alu_shift(m.reg as u8, dst, n, size);
        self.write_rm(&m, size, r)?;
        if m.is_reg() {
            self.charge(self.cyc.shift_r + self.cyc.shift_per_bit * n.min(31));
        } else {
            self.charge(self.cyc.shift_m + self.cyc.shift_per_bit * n.min(31));
        }
        Ok(())
    }

    fn op_group3(&mut self, size: OpSize) -> Result<(), Fault> {
        let m = self.fetch_modrm()?;
        match m.reg {
            0 | 1 => {
                // TEST rm, imm.
                let dst = self.read_rm(&m, size)?;
                let imm = self.fetch_data(size)?;
                self.alu(AluOp::And, dst, imm, size);
                self.op_flags.insert(OpFlags::NOWRITE);
                self.charge_alu(&m);
            }
            2 => {
                let v = self.read_rm(&m, size)?;
                self.write_rm(&m, size, !v & size.mask())?;
                self.charge_alu(&m);
            }
            3 => {
                let v = self.read_rm(&m, size)?;
                let r = self.alu_neg(v, size);
                self.write_rm(&m, size, r)?;
                self.charge_alu(&m);
            }
            4 => {
                let v = self.read_rm(&m, size)?;
                self.alu_mul(v, size);
                self.charge(self.cyc.mul);
            }
            5 => {
                let v = self.read_rm(&m, size)?;
                self.alu_imul(v, size);
                self.charge(self.cyc.mul);
            }
            6 => {
                let v = self.read_rm(&m, size)?;
                self.alu_div(v, size)?;
                self.charge(self.cyc.div);
            }
            _ => {
                let v = self.read_rm(&m, size)?;
                self.alu_idiv(v, size)?;
                self.charge(self.cyc.div);
            }
        }
        Ok(())
    }

    fn op_group5(&mut self) -> Result<(), Fault> {
        let d_size = self.d_size;
        let m = self.fetch_modrm()?;
        match m.reg {
            0 => {
                let v = self.read_rm(&m, d_size)?;
                let v = self.alu_inc(v, d_size);
                self.write_rm(&m, d_size, v)?;
                self.charge_inc(&m);
            }
            1 => {
                let v = self.read_rm(&m, d_size)?;
                let v = self.alu_dec(v, d_size);
                self.write_rm(&m, d_size, v)?;
                self.charge_inc(&m);
            }
            2 => {
                let target = self.read_rm(&m, d_size)?;
                self.op_call_abs(target)?;
            }
            3 => {
                let (sel, off) = self.read_far_pointer(&m)?;
                self.op_call_far(sel, off)?;
            }
            4 => {
                let target = self.read_rm(&m, d_size)?;
                self.op_jmp_abs(target)?;
            }
            5 => {
                let (sel, off) = self.read_far_pointer(&m)?;
                self.op_jmp_far(sel, off)?;
            }
            6 => {
                let v = self.read_rm(&m, d_size)?;
                self.push_op(v)?;
                self.charge(self.cyc.push);
            }
            _ => return Err(Fault::ud()),
        }
        Ok(())
    }

    fn read_far_pointer(&mut self, m: &ModRm) -> Result<(u16, u32), Fault> {
        if m.is_reg() {
            return Err(Fault::ud());
        }
        let (seg, off) = self.ea.unwrap();
        let d_size = self.d_size;
        let target = self.read_seg(seg, off, d_size)?;
        let sel = self.read_seg(seg, off.wrapping_add(d_size.bytes()), OpSize::Word)? as u16;
        Ok((sel, target))
    }
}

#[derive(Debug, Clone, Copy)]
enum ShiftCount {
    One,
    Cl,
    Imm,
}

// The 0x0F two-byte map: 80286 system instructions plus the 80386
// extended set.
impl<B: Bus> CpuX86<B> {
    pub(super) fn exec_0f(&mut self) -> Result<(), Fault> {
        let d_size = self.d_size;
        let is386 = self.model().has_80386_ops();
        let op = self.fetch_byte()?;
        self.set_last_opcode(op);
        match op {
            0x00 => self.op_group6()?,
            0x01 => self.op_group7()?,
            0x02 => self.op_lar()?,
            0x03 => self.op_lsl()?,
            0x05 if !is386 => {
                // LOADALL: microcode-level state load, outside this core.
                log(LogCategory::Stub, LogLevel::Warn, || {
                    "LOADALL executed; not implemented".to_string()
                });
                return Err(Fault::ud());
            }
            0x06 => {
                // CLTS.
                if self.prot_mode() && self.cpl != 0 {
                    return Err(Fault::gp(0));
                }
                self.cr0 &= !CR0_TS;
                self.charge(self.cyc.base);
            }
            0x20 | 0x21 | 0x22 | 0x23 | 0x24 | 0x26 if is386 => self.op_mov_special(op)?,
            0x80..=0x8F if is386 => self.op_jcc_near(op & 0x0F)?,
            0x90..=0x9F if is386 => {
                let cc = op & 0x0F;
                let m = self.fetch_modrm()?;
                let v = self.condition(cc) as u32;
                self.write_rm(&m, OpSize::Byte, v)?;
                self.charge_mov(&m);
            }
            0xA0 if is386 => self.op_push_seg(SegId::Fs)?,
            0xA1 if is386 => self.op_pop_seg(SegId::Fs)?,
            0xA3 if is386 => self.op_bittest(0, false)?,
            0xA4 if is386 => self.op_shift_double(false, true)?,
            0xA5 if is386 => self.op_shift_double(false, false)?,
            0xA8 if is386 => self.op_push_seg(SegId::Gs)?,
            0xA9 if is386 => self.op_pop_seg(SegId::Gs)?,
            0xAB if is386 => self.op_bittest(1, false)?,
            0xAC if is386 => self.op_shift_double(true, true)?,
            0xAD if is386 => self.op_shift_double(true, false)?,
            0xAF if is386 => {
                let m = self.fetch_modrm()?;
                let src = self.read_rm(&m, d_size)?;
                let dst = self.get_reg(m.reg, d_size);
                let r = self.alu_imul_trunc(dst, src, d_size);
                self.set_reg(m.reg, d_size, r);
                self.charge(self.cyc.mul);
            }
            0xB2 if is386 => self.op_load_far_pointer(SegId::Ss)?,
            0xB3 if is386 => self.op_bittest(2, false)?,
            0xB4 if is386 => self.op_load_far_pointer(SegId::Fs)?,
            0xB5 if is386 => self.op_load_far_pointer(SegId::Gs)?,
            0xB6 if is386 => {
                let m = self.fetch_modrm()?;
                let v = self.read_rm(&m, OpSize::Byte)?;
                self.set_reg(m.reg, d_size, v);
                self.charge_mov(&m);
            }
            0xB7 if is386 => {
                let m = self.fetch_modrm()?;
                let v = self.read_rm(&m, OpSize::Word)?;
                self.set_reg(m.reg, d_size, v);
                self.charge_mov(&m);
            }
            0xBA if is386 => {
                let m = self.fetch_modrm()?;
                if m.reg < 4 {
                    return Err(Fault::ud());
                }
                self.op_bittest_with_modrm(&m, (m.reg - 4) as u8, true)?;
            }
            0xBB if is386 => self.op_bittest(3, false)?,
            0xBC if is386 => {
                let m = self.fetch_modrm()?;
                let src = self.read_rm(&m, d_size)?;
                if let Some(i) = self.alu_bitscan(src, false, d_size) {
                    self.set_reg(m.reg, d_size, i);
                }
                self.charge_alu(&m);
            }
            0xBD if is386 => {
                let m = self.fetch_modrm()?;
                let src = self.read_rm(&m, d_size)?;
                if let Some(i) = self.alu_bitscan(src, true, d_size) {
                    self.set_reg(m.reg, d_size, i);
                }
                self.charge_alu(&m);
            }
            0xBE if is386 => {
                let m = self.fetch_modrm()?;
                let v = self.read_rm(&m, OpSize::Byte)? as u8 as i8 as i32 as u32;
                self.set_reg(m.reg, d_size, v);
                self.charge_mov(&m);
            }
            0xBF if is386 => {
                let m = self.fetch_modrm()?;
                let v = self.read_rm(&m, OpSize::Word)? as u16 as i16 as i32 as u32;
                self.set_reg(m.reg, d_size, v);
                self.charge_mov(&m);
            }
            _ => return Err(Fault::ud()),
        }
        Ok(())
    }

    /// 0F 00 group: descriptor-table and verify instructions, protected
    /// mode only.
    fn op_group6(&mut self) -> Result<(), Fault> {
        if !self.prot_mode() {
            return Err(Fault::ud());
        }
        let m = self.fetch_modrm()?;
        match m.reg {
            0 => {
                // SLDT.
                let v = self.ldt.sel as u32;
                self.write_rm(&m, OpSize::Word, v)?;
            }
            1 => {
                // STR.
                let v = self.tr.sel as u32;
                self.write_rm(&m, OpSize::Word, v)?;
            }
            2 => {
                // LLDT.
                if self.cpl != 0 {
                    return Err(Fault::gp(0));
                }
                let sel = self.read_rm(&m, OpSize::Word)? as u16;
                self.load_ldtr(sel)?;
            }
            3 => {
                // LTR.
                if self.cpl != 0 {
                    return Err(Fault::gp(0));
                }
                let sel = self.read_rm(&m, OpSize::Word)? as u16;
                self.load_tr(sel)?;
            }
            4 => {
                let sel = self.read_rm(&m, OpSize::Word)? as u16;
                self.op_verify(sel, false)?;
            }
            5 => {
                let sel = self.read_rm(&m, OpSize::Word)? as u16;
                self.op_verify(sel, true)?;
            }
            _ => return Err(Fault::ud()),
        }
        self.charge(self.cyc.seg_load);
        Ok(())
    }

    fn op_verify(&mut self, sel: u16, want_write: bool) -> Result<(), Fault> {
        let ok = match self.verify_descriptor(sel)? {
            Some(d) => {
                d.is_seg()
                    && self.verify_privilege(sel, &d)
                    && if want_write {
                        d.is_writable_data()
                    } else {
                        d.is_readable()
                    }
            }
            None => false,
        };
        self.set_verify_outcome(ok);
        Ok(())
    }

    /// 0F 01 group: descriptor-table register moves and the MSW.
    fn op_group7(&mut self) -> Result<(), Fault> {
        let m = self.fetch_modrm()?;
        match m.reg {
            0 | 1 => {
                // SGDT / SIDT, memory operand only.
                if m.is_reg() {
                    return Err(Fault::ud());
                }
                let (seg, off) = self.ea.unwrap();
                let t = if m.reg == 0 { self.gdt } else { self.idt };
                // The 80286 stores 0xFF in the base's fourth byte, which
                // PC-DOS uses to sniff the CPU generation.
                let base = if self.model().has_80386_ops() {
                    t.base
                } else {
                    (t.base & 0x00FF_FFFF) | 0xFF00_0000
                };
                self.write_seg(seg, off, t.limit & 0xFFFF, OpSize::Word)?;
                self.write_seg(seg, off.wrapping_add(2), base, OpSize::Dword)?;
            }
            2 | 3 => {
                // LGDT / LIDT.
                if m.is_reg() {
                    return Err(Fault::ud());
                }
                if self.prot_mode() && self.cpl != 0 {
                    return Err(Fault::gp(0));
                }
                let (seg, off) = self.ea.unwrap();
                let limit = self.read_seg(seg, off, OpSize::Word)?;
                let mut base = self.read_seg(seg, off.wrapping_add(2), OpSize::Dword)?;
                if !self.model().has_80386_ops() || self.d_size == OpSize::Word {
                    base &= 0x00FF_FFFF;
                }
                let t = super::DescTableReg { base, limit };
                if m.reg == 2 {
                    self.gdt = t;
                } else {
                    self.idt = t;
                }
            }
            4 => {
                // SMSW.
                let v = self.cr0 & 0xFFFF;
                self.write_rm(&m, OpSize::Word, v)?;
            }
            6 => {
                // LMSW: may set PE, can never clear it.
                if self.prot_mode() && self.cpl != 0 {
                    return Err(Fault::gp(0));
                }
                let v = self.read_rm(&m, OpSize::Word)?;
                let was_pe = self.cr0 & CR0_PE != 0;
                self.cr0 = (self.cr0 & !0x0000_000E)
                    | (v & 0x0000_000F)
                    | (self.cr0 & CR0_PE);
                if !was_pe && self.cr0 & CR0_PE != 0 {
                    self.set_prot_mode(true);
                }
            }
            _ => return Err(Fault::ud()),
        }
        self.charge(self.cyc.seg_load);
        Ok(())
    }

    /// LAR: load access rights, reported through ZF.
    fn op_lar(&mut self) -> Result<(), Fault> {
        if !self.prot_mode() {
            return Err(Fault::ud());
        }
        let d_size = self.d_size;
        let m = self.fetch_modrm()?;
        let sel = self.read_rm(&m, OpSize::Word)? as u16;
        let mut outcome = false;
        if let Some(d) = self.verify_descriptor(sel)? {
            let type_ok = d.is_seg()
                || d.is_gate()
                || d.is_tss()
                || d.typ() == super::segment::desc::TYPE_LDT;
            // A conforming code segment passes LAR regardless of CPL/RPL.
            if type_ok && (d.is_conforming() || self.verify_privilege(sel, &d)) {
                let dword1 = (d.acc as u32) | ((d.ext as u32) << 16);
                let v = if d_size == OpSize::Dword {
                    dword1 & 0x00F0_FF00
                } else {
                    dword1 & 0x0000_FF00
                };
                self.set_reg(m.reg, d_size, v);
                outcome = true;
            }
        }
        self.set_verify_outcome(outcome);
        self.charge(self.cyc.seg_load);
        Ok(())
    }

    /// LSL: load segment limit, reported through ZF.
    fn op_lsl(&mut self) -> Result<(), Fault> {
        if !self.prot_mode() {
            return Err(Fault::ud());
        }
        let d_size = self.d_size;
        let m = self.fetch_modrm()?;
        let sel = self.read_rm(&m, OpSize::Word)? as u16;
        let mut outcome = false;
        if let Some(d) = self.verify_descriptor(sel)? {
            let type_ok = d.is_seg()
                || d.is_tss()
                || d.typ() == super::segment::desc::TYPE_LDT;
            if type_ok && (d.is_conforming() || self.verify_privilege(sel, &d)) {
                let limit = d.limit(self.model());
                self.set_reg(m.reg, d_size, limit);
                outcome = true;
            }
        }
        self.set_verify_outcome(outcome);
        self.charge(self.cyc.seg_load);
        Ok(())
    }

    /// MOV to/from the control, debug, and test registers (0F 20-26).
    /// These always use the register form; the mod field is ignored.
    fn op_mov_special(&mut self, op: u8) -> Result<(), Fault> {
        let b = self.fetch_byte()?;
        let reg = ((b >> 3) & 7) as usize;
        let rm = (b & 7) as usize;
        if self.prot_mode() && self.cpl != 0 {
            return Err(Fault::gp(0));
        }
        match op {
            0x20 => {
                let v = match reg {
                    0 => self.cr0,
                    2 => self.cr2,
                    3 => self.cr3,
                    _ => return Err(Fault::ud()),
                };
                self.set_reg(rm, OpSize::Dword, v);
            }
            0x22 => {
                let v = self.get_reg(rm, OpSize::Dword);
                match reg {
                    0 => {
                        let was_pe = self.cr0 & CR0_PE != 0;
                        self.cr0 = v;
                        let now_pe = self.cr0 & CR0_PE != 0;
                        if was_pe != now_pe {
                            self.set_prot_mode(now_pe);
                        }
                    }
                    2 => self.cr2 = v,
                    3 => self.cr3 = v,
                    _ => return Err(Fault::ud()),
                }
            }
            0x21 => {
                let v = self.dr[reg];
                self.set_reg(rm, OpSize::Dword, v);
            }
            0x23 => {
                self.dr[reg] = self.get_reg(rm, OpSize::Dword);
            }
            0x24 => {
                // The test registers read back zero here.
                log(LogCategory::Stub, LogLevel::Debug, || {
                    format!("MOV r32, TR{} reads zero", reg)
                });
                self.set_reg(rm, OpSize::Dword, 0);
            }
            _ => {
                // 0x26: MOV TRn, r32 is accepted and dropped.
                log(LogCategory::Stub, LogLevel::Debug, || {
                    format!("MOV TR{}, r32 ignored", reg)
                });
            }
        }
        self.charge(self.cyc.base);
        Ok(())
    }

    /// BT/BTS/BTR/BTC with a register bit index.
    fn op_bittest(&mut self, kind: u8, imm: bool) -> Result<(), Fault> {
        let m = self.fetch_modrm()?;
        self.op_bittest_with_modrm(&m, kind, imm)
    }

    fn op_bittest_with_modrm(&mut self, m: &ModRm, kind: u8, imm: bool) -> Result<(), Fault> {
        let size = self.d_size;
        let bits = size.bits();
        let bit_src = if imm {
            self.fetch_byte()? as u32
        } else {
            self.get_reg(m.reg, size)
        };
        // A register bit index addresses memory beyond the nominal
        // operand: the effective address moves by the signed bit offset
        // divided by the operand width.
        if !imm && !m.is_reg() {
            let signed = match size {
                OpSize::Word => bit_src as u16 as i16 as i32,
                _ => bit_src as i32,
            };
            let shift = if size == OpSize::Word { 4 } else { 5 };
            let adj = (signed >> shift) * size.bytes() as i32;
            if let Some((seg, off)) = self.ea {
                let moved = (seg, off.wrapping_add(adj as u32));
                self.ea = Some(moved);
                self.ea_write = Some(moved);
            }
        }
        let idx = bit_src & (bits - 1);
        let v = self.read_rm(m, size)?;
        self.set_flag(PS_CF, (v >> idx) & 1 != 0);
        let updated = match kind {
            1 => v | (1 << idx),
            2 => v & !(1 << idx),
            3 => v ^ (1 << idx),
            _ => v,
        };
        if kind != 0 {
            self.write_rm(m, size, updated)?;
        }
        self.charge_alu(m);
        Ok(())
    }

    /// SHLD/SHRD with an immediate or CL count.
    fn op_shift_double(&mut self, right: bool, imm: bool) -> Result<(), Fault> {
        let size = self.d_size;
        let m = self.fetch_modrm()?;
        let dst = self.read_rm(&m, size)?;
        let fill = self.get_reg(m.reg, size);
        let n = if imm {
            self.fetch_byte()? as u32
        } else {
            self.get_reg(REG_CX, OpSize::Byte)
        };
        let r = if right {
            self.alu_shrd(dst, fill, n, size)
        } else {
            self.alu_shld(dst, fill, n, size)
        };
        self.write_rm(&m, size, r)?;
        if m.is_reg() {
            self.charge(self.cyc.shift_r);
        } else {
            self.charge(self.cyc.shift_m);
        }
        Ok(())
    }
}

//! Persisted CPU state and machine-description parsing.
//!
//! A snapshot is a flat record of every architectural and hidden register,
//! including the lazy flag cache words, round-tripped through JSON the way
//! the rest of the emulator persists component state.

use super::interrupt::CpuError;
use super::segment::{DescTableReg, SegReg};
use super::{CpuModel, CpuX86, CycleTable, IntFlags, OpFlags};
use crate::Bus;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Flat snapshot record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuSnapshot {
    pub model: CpuModel,
    pub regs: [u32; 8],
    pub eip: u32,
    pub ps: u32,
    pub res_dst: u32,
    pub res_src: u32,
    pub res_arith: u32,
    pub res_logic: u32,
    pub res_type: u32,
    pub segs: [SegReg; 6],
    pub cpl: u8,
    pub gdt: DescTableReg,
    pub idt: DescTableReg,
    pub ldt: SegReg,
    pub tr: SegReg,
    pub cr0: u32,
    pub cr2: u32,
    pub cr3: u32,
    pub dr: [u32; 8],
    pub int_flags: u32,
    pub op_flags: u32,
    pub op_prefixes: u32,
    pub intr_vector: Option<u8>,
    pub nfault: Option<u8>,
    pub halted: bool,
    pub cycles: u64,
}

/// The CPU entry of a machine description. Unknown keys are ignored.
#[derive(Debug, Clone)]
pub struct CpuConfig {
    pub model: CpuModel,
    pub auto_start: bool,
}

impl Default for CpuConfig {
    fn default() -> Self {
        CpuConfig {
            model: CpuModel::Intel8086,
            auto_start: false,
        }
    }
}

impl CpuConfig {
    /// Parse a machine-description component entry. `autoStart` is forced
    /// off when the machine is being constructed programmatically.
    pub fn from_value(v: &Value, programmatic: bool) -> Result<Self, CpuError> {
        let model = match v.get("model") {
            None => CpuModel::Intel8086,
            Some(m) => {
                let n = m
                    .as_u64()
                    .or_else(|| m.as_str().and_then(|s| s.parse().ok()))
                    .ok_or_else(|| CpuError::Config(format!("bad model entry: {}", m)))?;
                CpuModel::from_number(n as u32)
                    .ok_or_else(|| CpuError::Config(format!("unsupported model {}", n)))?
            }
        };
        let auto_start = !programmatic
            && v.get("autoStart").and_then(Value::as_bool).unwrap_or(false);
        Ok(CpuConfig { model, auto_start })
    }
}

impl<B: Bus> CpuX86<B> {
    /// Capture a snapshot of the full CPU state.
    pub fn snapshot(&self) -> CpuSnapshot {
        CpuSnapshot {
            model: self.model(),
            regs: self.regs,
            eip: self.eip,
            ps: self.ps,
            res_dst: self.res_dst,
            res_src: self.res_src,
            res_arith: self.res_arith,
            res_logic: self.res_logic,
            res_type: self.res_type,
            segs: self.segs.clone(),
            cpl: self.cpl,
            gdt: self.gdt,
            idt: self.idt,
            ldt: self.ldt.clone(),
            tr: self.tr.clone(),
            cr0: self.cr0,
            cr2: self.cr2,
            cr3: self.cr3,
            dr: self.dr,
            int_flags: self.int_flags.bits(),
            op_flags: self.op_flags.bits(),
            op_prefixes: self.op_prefixes.bits(),
            intr_vector: self.intr_vector,
            nfault: self.nfault,
            halted: self.is_halted(),
            cycles: self.cycles,
        }
    }

    /// Restore a previously captured snapshot.
    pub fn restore(&mut self, s: &CpuSnapshot) {
        self.set_model(s.model);
        self.regs = s.regs;
        self.eip = s.eip;
        self.ps = s.ps;
        self.res_dst = s.res_dst;
        self.res_src = s.res_src;
        self.res_arith = s.res_arith;
        self.res_logic = s.res_logic;
        self.res_type = s.res_type;
        self.segs = s.segs.clone();
        self.cpl = s.cpl;
        self.gdt = s.gdt;
        self.idt = s.idt;
        self.ldt = s.ldt.clone();
        self.tr = s.tr.clone();
        self.cr0 = s.cr0;
        self.cr2 = s.cr2;
        self.cr3 = s.cr3;
        self.dr = s.dr;
        self.int_flags = IntFlags::from_bits_truncate(s.int_flags);
        self.op_flags = OpFlags::from_bits_truncate(s.op_flags);
        self.op_prefixes = OpFlags::from_bits_truncate(s.op_prefixes);
        self.intr_vector = s.intr_vector;
        self.nfault = s.nfault;
        self.set_halted(s.halted);
        self.cycles = s.cycles;
        self.cyc = CycleTable::for_model(s.model);
    }

    /// JSON save state, in the shape the machine container persists.
    pub fn save_state(&self) -> Value {
        serde_json::to_value(self.snapshot()).unwrap_or(Value::Null)
    }

    /// Load a JSON save state produced by [`CpuX86::save_state`].
    pub fn load_state(&mut self, v: &Value) -> Result<(), CpuError> {
        let snap: CpuSnapshot = serde_json::from_value(v.clone())
            .map_err(|e| CpuError::Snapshot(e.to_string()))?;
        self.restore(&snap);
        Ok(())
    }
}

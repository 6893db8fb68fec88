//! Snapshot persistence and machine-description parsing.

use super::super::{CpuConfig, CpuModel, REG_AX, REG_SP};
use super::{boot, cpu8086, cpu_model, run};
use crate::Cpu;
use serde_json::json;

#[test]
fn snapshot_round_trip_preserves_state() {
    let mut c = cpu8086();
    // MOV AX, 0x1234 ; ADD AX, 0x4321 ; PUSH AX
    boot(&mut c, &[0xB8, 0x34, 0x12, 0x05, 0x21, 0x43, 0x50]);
    run(&mut c, 3);
    let saved = c.save_state();
    let ps_before = c.get_ps();
    let eip_before = c.eip;
    let sp_before = c.regs[REG_SP];

    // Trash the state, then restore.
    run(&mut c, 5);
    c.regs[REG_AX] = 0;
    c.load_state(&saved).unwrap();

    assert_eq!(c.regs[REG_AX] & 0xFFFF, 0x5555);
    assert_eq!(c.get_ps(), ps_before);
    assert_eq!(c.eip, eip_before);
    assert_eq!(c.regs[REG_SP], sp_before);
    assert_eq!(c.model(), CpuModel::Intel8086);
}

#[test]
fn snapshot_keeps_cached_flags_exact() {
    let mut c = cpu8086();
    // Leave an uncommitted arithmetic result in the cache.
    boot(&mut c, &[0xB8, 0xFF, 0xFF, 0x05, 0x01, 0x00]);
    run(&mut c, 2);
    let saved = c.save_state();

    let mut fresh = cpu8086();
    fresh.load_state(&saved).unwrap();
    assert!(fresh.get_cf());
    assert!(fresh.get_zf());
    assert!(fresh.get_af());
}

#[test]
fn corrupted_snapshot_is_a_host_error() {
    let mut c = cpu8086();
    let err = c.load_state(&json!({"model": "bogus"})).unwrap_err();
    let text = err.to_string();
    assert!(text.contains("snapshot"), "unexpected error: {}", text);
}

#[test]
fn config_parses_model_number() {
    let v = json!({"model": 80286, "autoStart": true});
    let cfg = CpuConfig::from_value(&v, false).unwrap();
    assert_eq!(cfg.model, CpuModel::Intel80286);
    assert!(cfg.auto_start);
}

#[test]
fn config_forces_auto_start_off_programmatically() {
    let v = json!({"model": 8086, "autoStart": true});
    let cfg = CpuConfig::from_value(&v, true).unwrap();
    assert!(!cfg.auto_start);
}

#[test]
fn config_ignores_unknown_keys() {
    let v = json!({"model": "80386", "bus": "isa", "speed": 16, "x": null});
    let cfg = CpuConfig::from_value(&v, false).unwrap();
    assert_eq!(cfg.model, CpuModel::Intel80386);
}

#[test]
fn config_rejects_unknown_model() {
    let v = json!({"model": 80486});
    assert!(CpuConfig::from_value(&v, false).is_err());
}

#[test]
fn config_defaults_to_8086() {
    let cfg = CpuConfig::from_value(&json!({}), false).unwrap();
    assert_eq!(cfg.model, CpuModel::Intel8086);
    assert!(!cfg.auto_start);
}

#[test]
fn cpu_trait_reset_returns_to_power_on() {
    let mut c = cpu_model(CpuModel::Intel80286);
    boot(&mut c, &[0xB8, 0x01, 0x00]);
    run(&mut c, 1);
    c.reset();
    assert_eq!(c.regs[REG_AX], 0);
    assert_eq!(c.eip, 0xFFF0);
    assert_eq!(c.cycles, 0);
    assert!(!c.prot_mode());
}

#[test]
fn model_capability_predicates() {
    assert!(!CpuModel::Intel8088.has_80186_ops());
    assert!(CpuModel::Intel80188.has_80186_ops());
    assert!(!CpuModel::Intel80186.has_80286_ops());
    assert!(CpuModel::Intel80286.has_80286_ops());
    assert!(!CpuModel::Intel80286.has_80386_ops());
    assert!(CpuModel::Intel80386.has_80386_ops());
    assert_eq!(CpuModel::Intel80386.addr_mask(), 0xFFFF_FFFF);
    assert_eq!(CpuModel::Intel80286.addr_mask(), 0x00FF_FFFF);
    assert_eq!(CpuModel::Intel8086.addr_mask(), 0x000F_FFFF);
    assert_eq!(CpuModel::from_number(80386), Some(CpuModel::Intel80386));
    assert_eq!(CpuModel::from_number(6502), None);
}

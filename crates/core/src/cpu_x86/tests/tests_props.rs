//! Property-based conformance: the lazy flag cache against directly
//! computed reference flags, across all three operand widths.

use super::super::{CpuX86, OpSize, VecBus};
use proptest::prelude::*;

fn cpu() -> CpuX86<VecBus> {
    CpuX86::new(VecBus::new())
}

fn sizes() -> [OpSize; 3] {
    [OpSize::Byte, OpSize::Word, OpSize::Dword]
}

fn parity_even(v: u32) -> bool {
    (v as u8).count_ones() % 2 == 0
}

proptest! {
    #[test]
    fn add_flags_match_reference(a in any::<u32>(), b in any::<u32>()) {
        for size in sizes() {
            let m = size.mask() as u64;
            let s = size.sign_bit();
            let a = a & size.mask();
            let b = b & size.mask();
            let wide = a as u64 + b as u64;
            let r = (wide & m) as u32;

            let mut c = cpu();
            c.set_arith_result(a, b, r, size, false);

            prop_assert_eq!(c.get_cf(), wide > m);
            prop_assert_eq!(c.get_zf(), r == 0);
            prop_assert_eq!(c.get_sf(), r & s != 0);
            prop_assert_eq!(c.get_of(), (a ^ r) & (b ^ r) & s != 0);
            prop_assert_eq!(c.get_af(), (a ^ b ^ r) & 0x10 != 0);
            prop_assert_eq!(c.get_pf(), parity_even(r));
        }
    }

    #[test]
    fn sub_flags_match_reference(a in any::<u32>(), b in any::<u32>()) {
        for size in sizes() {
            let s = size.sign_bit();
            let a = a & size.mask();
            let b = b & size.mask();
            let r = a.wrapping_sub(b) & size.mask();

            let mut c = cpu();
            c.set_arith_result(a, b, r, size, true);

            prop_assert_eq!(c.get_cf(), a < b);
            prop_assert_eq!(c.get_zf(), r == 0);
            prop_assert_eq!(c.get_sf(), r & s != 0);
            prop_assert_eq!(c.get_of(), (a ^ b) & (a ^ r) & s != 0);
            prop_assert_eq!(c.get_af(), (a ^ b ^ r) & 0x10 != 0);
            prop_assert_eq!(c.get_pf(), parity_even(r));
        }
    }

    #[test]
    fn logic_flags_match_reference(a in any::<u32>(), b in any::<u32>()) {
        for size in sizes() {
            let s = size.sign_bit();
            for r in [a & b, a | b, a ^ b] {
                let r = r & size.mask();
                let mut c = cpu();
                c.set_logic_result(r, size);
                prop_assert!(!c.get_cf());
                prop_assert!(!c.get_of());
                prop_assert_eq!(c.get_zf(), r == 0);
                prop_assert_eq!(c.get_sf(), r & s != 0);
                prop_assert_eq!(c.get_pf(), parity_even(r));
            }
        }
    }

    #[test]
    fn rotate_left_postcondition(v in any::<u32>()) {
        // At count 1: CF is the last bit rotated out; OF is CF xor the
        // new sign bit.
        for size in sizes() {
            let v = v & size.mask();
            let mut c = cpu();
            let r = c.alu_shift(0, v, 1, size);
            let expected_cf = v & size.sign_bit() != 0;
            prop_assert_eq!(c.get_cf(), expected_cf);
            prop_assert_eq!(c.get_of(), expected_cf != (r & size.sign_bit() != 0));
        }
    }

    #[test]
    fn rotate_pair_inverts(v in any::<u32>(), n in 0u32..16) {
        // ROL by n then ROR by n is the identity on the value.
        for size in sizes() {
            let v = v & size.mask();
            let mut c = cpu();
            let r = c.alu_shift(0, v, n, size);
            let back = c.alu_shift(1, r, n, size);
            prop_assert_eq!(back, v);
        }
    }

    #[test]
    fn push_pop_round_trip(v in any::<u32>()) {
        let mut c = cpu();
        super::boot(&mut c, &[]);
        let sp = c.regs[super::super::REG_SP];
        for size in [OpSize::Word, OpSize::Dword] {
            let v = v & size.mask();
            c.push_sized(v, size).unwrap();
            prop_assert_eq!(c.pop_sized(size).unwrap(), v);
            prop_assert_eq!(c.regs[super::super::REG_SP], sp);
        }
    }

    #[test]
    fn ps_set_get_round_trip(v in any::<u32>()) {
        // Whatever is stored, the readback is stable: writing the image
        // back changes nothing.
        let mut c = cpu();
        c.set_ps(v);
        let once = c.get_ps();
        c.set_ps(once);
        prop_assert_eq!(c.get_ps(), once);
    }

    #[test]
    fn shift_left_matches_multiplication(v in any::<u32>(), n in 1u32..8) {
        for size in sizes() {
            let v = v & size.mask();
            let mut c = cpu();
            let r = c.alu_shift(4, v, n, size);
            prop_assert_eq!(r, v.wrapping_shl(n) & size.mask());
        }
    }
}

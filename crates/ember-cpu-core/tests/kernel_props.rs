//! Property tests over the size-generic kernels.

use ember_cpu_core::alu::{self, ALU, ALU_FAST, BSU};
use ember_cpu_core::flags::{FLAGS_CF, FLAGS_ZF};
use ember_cpu_core::ldbl::{deserialize_ldbl, serialize_ldbl};
use proptest::prelude::*;

proptest! {
    /// Narrow kernels agree with the 64-bit kernel after masking, for
    /// pre-masked inputs.
    #[test]
    fn alu_widths_are_consistent(
        x in any::<u64>(),
        y in any::<u64>(),
        op in prop_oneof![
            Just(alu::ALU_ADD), Just(alu::ALU_SUB), Just(alu::ALU_AND),
            Just(alu::ALU_OR), Just(alu::ALU_XOR), Just(alu::ALU_NOT),
            Just(alu::ALU_NEG),
        ],
        log2 in 0usize..3,
    ) {
        let mask = ((1u128 << (8 << log2)) - 1) as u64;
        let xm = x & mask;
        let ym = y & mask;
        let mut f_narrow = 0;
        let mut f_wide = 0;
        let narrow = ALU[op][log2](xm, ym, &mut f_narrow);
        let wide = ALU[op][3](xm, ym, &mut f_wide) & mask;
        prop_assert_eq!(narrow & mask, wide);
    }

    /// The flag-eliding kernels must still produce the exact result and
    /// agree on CF and ZF wherever they claim to.
    #[test]
    fn fast_kernels_preserve_result_cf_zf(
        x in any::<u64>(),
        y in any::<u64>(),
        op in prop_oneof![
            Just(alu::ALU_ADD), Just(alu::ALU_SUB), Just(alu::ALU_AND),
            Just(alu::ALU_OR), Just(alu::ALU_XOR),
        ],
        log2 in 0usize..4,
    ) {
        let mut f_full = 0;
        let mut f_fast = 0;
        let full = ALU[op][log2](x, y, &mut f_full);
        let fast = ALU_FAST[op][log2](x, y, &mut f_fast);
        prop_assert_eq!(full, fast);
        prop_assert_eq!(f_full & 1 << FLAGS_CF, f_fast & 1 << FLAGS_CF);
        prop_assert_eq!(f_full & 1 << FLAGS_ZF, f_fast & 1 << FLAGS_ZF);
    }

    /// A masked-to-zero shift count changes neither value nor flags.
    #[test]
    fn zero_shift_counts_are_inert(
        x in any::<u64>(),
        op in 0usize..8,
        log2 in 0usize..4,
        flags in any::<u32>(),
    ) {
        let mut f = flags;
        let count = if log2 == 3 { 64u64 } else { 32 };
        let z = BSU[op][log2](x, count, &mut f);
        // Each kernel masks that count to zero for its width.
        let mask = ((1u128 << (8 << log2)) - 1) as u64;
        prop_assert_eq!(z & mask, x & mask);
        prop_assert_eq!(f, flags);
    }

    /// Doubles that survive the 80-bit exponent range round-trip exactly.
    #[test]
    fn extended_precision_round_trips(bits in any::<u64>()) {
        let x = f64::from_bits(bits);
        let y = deserialize_ldbl(&serialize_ldbl(x));
        if x.is_nan() {
            prop_assert!(y.is_nan());
        } else {
            prop_assert_eq!(x.to_bits(), y.to_bits());
        }
    }

    /// `CMP AL, imm8` and the group-80 `/7` route must produce identical
    /// flags: the two dispatch paths share one kernel.
    #[test]
    fn cmp_al_imm_routes_agree(al in any::<u8>(), imm in any::<u8>()) {
        use ember_cpu_core::exec::step;
        use ember_cpu_core::mem::FlatBus;
        use ember_cpu_core::Machine;
        use ember_x86::{DecodeMode, Gpr};

        let mut m1 = Machine::new(DecodeMode::Long);
        let mut bus1 = FlatBus::new(0x2000);
        m1.put_reg(0, Gpr::Rax, al as u64);
        bus1.load(0x1000, &[0x3C, imm]); // cmp al, imm8
        m1.set_ip(0x1000);
        step(&mut m1, &mut bus1).unwrap();

        let mut m2 = Machine::new(DecodeMode::Long);
        let mut bus2 = FlatBus::new(0x2000);
        m2.put_reg(0, Gpr::Rax, al as u64);
        bus2.load(0x1000, &[0x80, 0xF8, imm]); // cmp al, imm8 (group form)
        m2.set_ip(0x1000);
        step(&mut m2, &mut bus2).unwrap();

        prop_assert_eq!(
            ember_cpu_core::flags::export_flags(m1.flags),
            ember_cpu_core::flags::export_flags(m2.flags)
        );
    }
}

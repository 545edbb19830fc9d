use kestrel_dbg::expr::{to_base_str, truncate, ExprEval, NoSymbols};
use proptest::prelude::*;

fn eval(base: u32, bits: u32, text: &str) -> i64 {
    ExprEval::new(&NoSymbols, base, bits)
        .parse(text)
        .unwrap_or_else(|e| panic!("{text:?}: {e}"))
}

proptest! {
    // Round trip: any value printed in any supported base parses back to
    // itself under that default base.
    #[test]
    fn print_parse_round_trip(v in 0u64..1 << 16, base in prop::sample::select(vec![2u32, 8, 10, 16])) {
        let text = to_base_str(v as i64, base, 16);
        prop_assert_eq!(eval(base, 16, &text), v as i64);
    }

    #[test]
    fn round_trip_at_24_bits(v in 0u64..1 << 24) {
        let text = to_base_str(v as i64, 16, 24);
        prop_assert_eq!(eval(16, 24, &text), v as i64);
    }

    // Unsigned truncation is the mathematical mod.
    #[test]
    fn truncation_is_modular(x: i64, bits in 1u32..=63) {
        let m = 1i128 << bits;
        let expected = ((x as i128 % m) + m) % m;
        prop_assert_eq!(truncate(x, bits, true) as i128, expected);
    }

    // Signed truncation sign-extends the top bit.
    #[test]
    fn signed_truncation_sign_extends(x: i64, bits in 1u32..=63) {
        let t = truncate(x, bits, false);
        let u = truncate(x, bits, true);
        let half = 1i64 << (bits - 1);
        if u < half {
            prop_assert_eq!(t, u);
        } else {
            prop_assert_eq!(t, u - (1i64 << bits));
        }
    }

    // Addition in the evaluator matches wrapping-mod arithmetic.
    #[test]
    fn addition_truncates_like_the_bus(a in 0u64..1 << 16, b in 0u64..1 << 16) {
        let text = format!("0x{a:x} + 0x{b:x}");
        prop_assert_eq!(eval(16, 16, &text), ((a + b) & 0xFFFF) as i64);
    }
}

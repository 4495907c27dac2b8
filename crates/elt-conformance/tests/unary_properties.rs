use elt_conformance::HarnessConfig;
use elt_conformance::unary_harness::{UnaryArgs, UnaryRequest, run_unary};
use elt_kernel::{DispatchLedger, PortableProvider};
use proptest::prelude::*;

fn shaped(
    op: u32,
    prec: (&str, &str, &str),
    m: usize,
    n: usize,
    pad_in: usize,
    pad_out: usize,
) -> UnaryArgs {
    UnaryArgs {
        op,
        broadcast: 0,
        prec_in: prec.0.to_string(),
        prec_comp: prec.1.to_string(),
        prec_out: prec.2.to_string(),
        m,
        n,
        ldi: m + pad_in,
        ldo: m + pad_out,
        rnd_mode: 0,
    }
}

const OPS: [(u32, (&str, &str, &str)); 8] = [
    (1, ("HF8", "HF8", "HF8")),
    (2, ("BF16", "BF16", "BF16")),
    (3, ("F16", "F32", "F16")),
    (11, ("F32", "F32", "BF8")),
    (15, ("BF16", "F32", "F32")),
    (42, ("U32", "IMPLICIT", "U16")),
    (64, ("F32", "F32", "BF16")),
    (4, ("F64", "F64", "F64")),
];

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn portable_provider_agrees_for_any_padding(
        which in 0usize..OPS.len(),
        m in 1usize..7,
        n in 1usize..5,
        pad_in in 0usize..3,
        pad_out in 0usize..3,
        bcast in 0u32..4,
    ) {
        let (op, prec) = OPS[which];
        let mut args = shaped(op, prec, m, n, pad_in, pad_out);
        args.broadcast = bcast;
        let request = UnaryRequest::resolve(&args).expect("request resolves");
        let mut ledger = DispatchLedger::new();
        let outcome = run_unary(
            &request,
            &PortableProvider,
            &HarnessConfig::default_paths(),
            &mut ledger,
        )
        .expect("run completes");
        prop_assert!(outcome.passed, "{}: {:?}", outcome.verdict_line(), outcome.report);
        prop_assert!(outcome.bytes_identical);
        let ldo = request.layout.ldo;
        for index in 0..outcome.gold.len() {
            if index % ldo >= m {
                prop_assert_eq!(outcome.gold.get_bits(index).expect("gold"), 0);
            }
        }
    }
}

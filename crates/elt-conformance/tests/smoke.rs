use std::collections::BTreeSet;
use std::path::Path;

use elt_conformance::{HarnessConfig, load_unary_cases, run_all_core_suites};

#[test]
fn default_paths_point_at_bundled_fixtures() {
    let cfg = HarnessConfig::default_paths();
    let fixture_path = cfg.fixture_root.join("unary_cases.json");
    assert!(Path::new(&fixture_path).exists());
    assert!(cfg.report_root.ends_with("artifacts/reports"));
    assert_eq!(cfg.rng_seed, 1);
    assert_eq!(cfg.stochastic_seed, 555);
    assert!(cfg.capability_class.is_none());
    assert!(cfg.reference_kernel_exit_code.is_none());
}

#[test]
fn fixture_ids_are_unique() {
    let cfg = HarnessConfig::default_paths();
    let cases = load_unary_cases(&cfg.fixture_root).expect("fixtures load");
    let ids: BTreeSet<&str> = cases.iter().map(|case| case.id.as_str()).collect();
    assert_eq!(ids.len(), cases.len());
    assert!(cases.iter().any(|case| case.expected_reason_code.is_some()));
    assert!(cases.iter().any(|case| case.rnd_mode == 1));
}

#[test]
fn core_conformance_suites_pass() {
    let cfg = HarnessConfig::default_paths();
    let suites = run_all_core_suites(&cfg).expect("core suites should execute");

    for suite in suites {
        assert!(suite.case_count > 0, "suite {} ran nothing", suite.suite);
        assert!(
            suite.all_passed(),
            "suite {} failed with {:?}",
            suite.suite,
            suite.failures
        );
    }
}

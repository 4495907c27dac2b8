#![forbid(unsafe_code)]

pub mod matdiff;
pub mod tolerance;
pub mod unary_harness;

use crate::unary_harness::{UnaryArgs, UnaryCase, UnaryCaseLogEntry, UnaryRequest, run_unary};
use elt_dtype::{PrecisionTag, RoundingMode};
use elt_kernel::{CapabilityClass, DispatchLedger, KernelProvider, PortableProvider};
use elt_ops::registry;
use elt_random::{DEFAULT_MATRIX_SEED, DEFAULT_STOCHASTIC_SEED};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

pub const CAPABILITY_CLASS_ENV: &str = "ELTCHECK_CAPABILITY_CLASS";
pub const REFERENCE_KERNEL_EXIT_CODE_ENV: &str = "ELTCHECK_REFERENCE_KERNEL_EXIT_CODE";
pub const UNARY_LOG_PATH_ENV: &str = "ELTCHECK_UNARY_LOG_PATH";

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub fixture_root: PathBuf,
    pub report_root: PathBuf,
    /// Overrides the capability class the kernel reports when picking
    /// tolerances.
    pub capability_class: Option<CapabilityClass>,
    pub rng_seed: u64,
    pub stochastic_seed: u64,
    /// Exit status for a passing run on a reference kernel.
    pub reference_kernel_exit_code: Option<i32>,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        let repo_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..");
        Self {
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures"),
            report_root: repo_root.join("artifacts/reports"),
            capability_class: None,
            rng_seed: DEFAULT_MATRIX_SEED,
            stochastic_seed: DEFAULT_STOCHASTIC_SEED,
            reference_kernel_exit_code: None,
        }
    }

    /// Applies `ELTCHECK_CAPABILITY_CLASS` and
    /// `ELTCHECK_REFERENCE_KERNEL_EXIT_CODE` from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, String> {
        let capability = std::env::var(CAPABILITY_CLASS_ENV).ok();
        let exit_code = std::env::var(REFERENCE_KERNEL_EXIT_CODE_ENV).ok();
        self.with_overrides(capability.as_deref(), exit_code.as_deref())
    }

    pub fn with_overrides(
        mut self,
        capability: Option<&str>,
        reference_exit_code: Option<&str>,
    ) -> Result<Self, String> {
        if let Some(raw) = capability.filter(|raw| !raw.trim().is_empty()) {
            let class = CapabilityClass::parse(raw)
                .ok_or_else(|| format!("invalid {CAPABILITY_CLASS_ENV} value `{raw}`"))?;
            self.capability_class = Some(class);
        }
        if let Some(raw) = reference_exit_code.filter(|raw| !raw.trim().is_empty()) {
            let code = raw
                .trim()
                .parse::<i32>()
                .map_err(|err| format!("invalid {REFERENCE_KERNEL_EXIT_CODE_ENV} `{raw}`: {err}"))?;
            self.reference_kernel_exit_code = Some(code);
        }
        Ok(self)
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteReport {
    pub suite: &'static str,
    pub case_count: usize,
    pub pass_count: usize,
    pub failures: Vec<String>,
}

impl SuiteReport {
    fn new(suite: &'static str) -> Self {
        Self {
            suite,
            case_count: 0,
            pass_count: 0,
            failures: Vec::new(),
        }
    }

    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.case_count == self.pass_count && self.failures.is_empty()
    }
}

static UNARY_CASE_LOG_PATH: OnceLock<Mutex<Option<PathBuf>>> = OnceLock::new();

pub fn set_unary_case_log_path(path: Option<PathBuf>) {
    let cell = UNARY_CASE_LOG_PATH.get_or_init(|| Mutex::new(None));
    if let Ok(mut slot) = cell.lock() {
        *slot = path;
    }
}

pub fn load_unary_cases(fixture_root: &Path) -> Result<Vec<UnaryCase>, String> {
    let path = fixture_root.join("unary_cases.json");
    let raw = fs::read_to_string(&path)
        .map_err(|err| format!("failed reading {}: {err}", path.display()))?;
    serde_json::from_str(&raw).map_err(|err| format!("invalid json: {err}"))
}

/// Runs one fixture case and appends its log line. Returns whether the case
/// behaved as the fixture expects, with a failure message when it did not.
pub fn run_unary_case(
    case: &UnaryCase,
    provider: &dyn KernelProvider,
    config: &HarnessConfig,
    ledger: &mut DispatchLedger,
) -> Result<(bool, String), String> {
    let args = case.args();
    let result = UnaryRequest::resolve(&args)
        .and_then(|request| run_unary(&request, provider, config, ledger));

    let (passed, failure, entry) = match (result, case.expected_reason_code.as_deref()) {
        (Ok(outcome), None) => {
            let failure = format!(
                "{}: {} normf_rel={} bound={} bytes_identical={}",
                case.id,
                outcome.verdict_line(),
                outcome.report.normf_rel,
                outcome.tolerance.bound,
                outcome.bytes_identical
            );
            (outcome.passed, failure, outcome.log_entry(&case.id, config))
        }
        (Ok(outcome), Some(expected)) => (
            false,
            format!("{}: expected rejection {expected}, run completed", case.id),
            outcome.log_entry(&case.id, config),
        ),
        (Err(err), Some(expected)) => {
            let passed = err.reason_code() == expected;
            let failure = format!(
                "{}: expected {expected}, got {} ({err})",
                case.id,
                err.reason_code()
            );
            let entry = UnaryCaseLogEntry::rejected(&case.id, &args, config, &err, passed);
            (passed, failure, entry)
        }
        (Err(err), None) => (
            false,
            format!("{}: {} ({err})", case.id, err.reason_code()),
            UnaryCaseLogEntry::rejected(&case.id, &args, config, &err, false),
        ),
    };
    append_unary_case_log(&entry)?;
    Ok((passed, failure))
}

pub fn run_unary_fixture_suite(config: &HarnessConfig) -> Result<SuiteReport, String> {
    let cases = load_unary_cases(&config.fixture_root)?;
    let mut report = SuiteReport::new("unary_fixture");
    let mut ledger = DispatchLedger::new();
    for case in &cases {
        let (passed, failure) = run_unary_case(case, &PortableProvider, config, &mut ledger)?;
        record_suite_check(&mut report, passed, failure);
    }
    Ok(report)
}

/// Every allowed `(op, triple, rounding)` combination on a padded shape,
/// checked against the portable provider.
pub fn run_registry_coverage_suite(config: &HarnessConfig) -> Result<SuiteReport, String> {
    let mut report = SuiteReport::new("unary_registry_coverage");
    let mut ledger = DispatchLedger::new();
    for descriptor in registry() {
        for triple in descriptor.allowed_triples() {
            let mut roundings = vec![RoundingMode::NearestEven];
            if triple.output == PrecisionTag::BF8 {
                roundings.push(RoundingMode::Stochastic);
            }
            for rounding in roundings {
                let args = UnaryArgs {
                    op: descriptor.id,
                    broadcast: 0,
                    prec_in: triple.input.name().to_string(),
                    prec_comp: triple.compute.name().to_string(),
                    prec_out: triple.output.name().to_string(),
                    m: 5,
                    n: 3,
                    ldi: 7,
                    ldo: 6,
                    rnd_mode: rounding.code(),
                };
                let label = format!("{} {triple} {}", descriptor.name, rounding.as_str());
                let result = UnaryRequest::resolve(&args)
                    .and_then(|request| run_unary(&request, &PortableProvider, config, &mut ledger));
                match result {
                    Ok(outcome) => record_suite_check(
                        &mut report,
                        outcome.passed,
                        format!("{label}: normf_rel={}", outcome.report.normf_rel),
                    ),
                    Err(err) => record_suite_check(
                        &mut report,
                        false,
                        format!("{label}: {} ({err})", err.reason_code()),
                    ),
                }
            }
        }
    }
    if report.case_count == 0 {
        return Err("registry produced no combinations".to_string());
    }
    Ok(report)
}

pub fn run_all_core_suites(config: &HarnessConfig) -> Result<Vec<SuiteReport>, String> {
    Ok(vec![
        run_unary_fixture_suite(config)?,
        run_registry_coverage_suite(config)?,
    ])
}

fn record_suite_check(report: &mut SuiteReport, passed: bool, failure: String) {
    report.case_count += 1;
    if passed {
        report.pass_count += 1;
    } else {
        report.failures.push(failure);
    }
}

/// Appends one JSONL line when a log path is configured, either through
/// [`set_unary_case_log_path`] or `ELTCHECK_UNARY_LOG_PATH`.
pub fn append_unary_case_log(entry: &UnaryCaseLogEntry) -> Result<(), String> {
    let configured = UNARY_CASE_LOG_PATH
        .get()
        .and_then(|cell| cell.lock().ok())
        .and_then(|slot| slot.clone());
    let from_env = std::env::var_os(UNARY_LOG_PATH_ENV).map(PathBuf::from);
    let Some(path) = configured.or(from_env) else {
        return Ok(());
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| format!("failed creating {}: {err}", parent.display()))?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|err| format!("failed opening {}: {err}", path.display()))?;
    let line = serde_json::to_string(entry)
        .map_err(|err| format!("failed serializing unary case log entry: {err}"))?;
    let mut payload = line.into_bytes();
    payload.push(b'\n');
    file.write_all(&payload)
        .map_err(|err| format!("failed appending unary case log {}: {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::{HarnessConfig, SuiteReport, record_suite_check};
    use elt_kernel::CapabilityClass;

    #[test]
    fn overrides_parse_capability_and_exit_code() {
        let config = HarnessConfig::default_paths()
            .with_overrides(Some("Extended"), Some(" 77 "))
            .expect("valid overrides");
        assert_eq!(config.capability_class, Some(CapabilityClass::Extended));
        assert_eq!(config.reference_kernel_exit_code, Some(77));
    }

    #[test]
    fn blank_overrides_leave_defaults() {
        let config = HarnessConfig::default_paths()
            .with_overrides(Some(""), None)
            .expect("blank is ignored");
        assert_eq!(config.capability_class, None);
        assert_eq!(config.reference_kernel_exit_code, None);
        assert_eq!(config.rng_seed, 1);
        assert_eq!(config.stochastic_seed, 555);
    }

    #[test]
    fn malformed_overrides_are_rejected() {
        let err = HarnessConfig::default_paths()
            .with_overrides(Some("avx9000"), None)
            .expect_err("unknown class");
        assert!(err.contains("ELTCHECK_CAPABILITY_CLASS"));
        let err = HarnessConfig::default_paths()
            .with_overrides(None, Some("seventy"))
            .expect_err("non-numeric code");
        assert!(err.contains("ELTCHECK_REFERENCE_KERNEL_EXIT_CODE"));
    }

    #[test]
    fn suite_report_tracks_failures() {
        let mut report = SuiteReport::new("t");
        record_suite_check(&mut report, true, "unused".to_string());
        assert!(report.all_passed());
        record_suite_check(&mut report, false, "case b".to_string());
        assert_eq!(report.case_count, 2);
        assert_eq!(report.pass_count, 1);
        assert_eq!(report.failures, vec!["case b".to_string()]);
        assert!(!report.all_passed());
    }
}

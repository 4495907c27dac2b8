#![forbid(unsafe_code)]

use clap::Parser;
use elt_conformance::{
    HarnessConfig, SuiteReport, run_registry_coverage_suite, run_unary_fixture_suite,
    set_unary_case_log_path,
};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Runs the unary fixture and registry coverage suites against the
/// portable provider.
#[derive(Debug, Parser)]
#[command(name = "run_unary_suite")]
struct Cli {
    /// JSONL case log; defaults to artifacts/logs/unary_suite_<ts>.jsonl.
    #[arg(long)]
    log_path: Option<PathBuf>,
    /// Also write the gate summary under the report root.
    #[arg(long)]
    write_report: bool,
    /// Skip the exhaustive registry coverage suite.
    #[arg(long)]
    fixtures_only: bool,
}

#[derive(Debug, Serialize)]
struct SuiteSummary {
    suite: String,
    case_count: usize,
    pass_count: usize,
    failures: Vec<String>,
}

#[derive(Debug, Serialize)]
struct GateSummary {
    status: &'static str,
    unary_log: String,
    suites: Vec<SuiteSummary>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("run_unary_suite failed: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let cli = Cli::parse();
    let ts_millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis());
    let log_path = cli.log_path.unwrap_or_else(|| {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../../artifacts/logs")
            .join(format!("unary_suite_{ts_millis}.jsonl"))
    });
    set_unary_case_log_path(Some(log_path.clone()));

    let cfg = HarnessConfig::default_paths().with_env_overrides()?;
    let mut suites = vec![run_unary_fixture_suite(&cfg)?];
    if !cli.fixtures_only {
        suites.push(run_registry_coverage_suite(&cfg)?);
    }

    let status = if suites.iter().all(SuiteReport::all_passed) {
        "pass"
    } else {
        "fail"
    };
    let summary = GateSummary {
        status,
        unary_log: log_path.display().to_string(),
        suites: suites.into_iter().map(summarize_suite).collect(),
    };

    let summary_json = serde_json::to_string_pretty(&summary)
        .map_err(|err| format!("failed serializing summary: {err}"))?;
    println!("{summary_json}");

    if cli.write_report {
        fs::create_dir_all(&cfg.report_root)
            .map_err(|err| format!("failed creating {}: {err}", cfg.report_root.display()))?;
        let report_path = cfg.report_root.join("unary_suite_gate.json");
        fs::write(&report_path, &summary_json)
            .map_err(|err| format!("failed writing {}: {err}", report_path.display()))?;
        println!("wrote {}", report_path.display());
    }

    if status == "fail" {
        std::process::exit(2);
    }
    Ok(())
}

fn summarize_suite(report: SuiteReport) -> SuiteSummary {
    SuiteSummary {
        suite: report.suite.to_string(),
        case_count: report.case_count,
        pass_count: report.pass_count,
        failures: report.failures,
    }
}

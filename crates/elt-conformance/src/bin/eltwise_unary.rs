#![forbid(unsafe_code)]

use clap::Parser;
use elt_conformance::unary_harness::{UnaryArgs, UnaryCaseLogEntry, UnaryRequest, run_unary};
use elt_conformance::{HarnessConfig, append_unary_case_log, set_unary_case_log_path};
use elt_kernel::{DispatchLedger, PortableProvider};
use std::path::PathBuf;

/// Status for rejected arguments and infrastructure failures.
const USAGE_EXIT: i32 = 255;

const USAGE: &str = "Usage: eltwise_unary [type] [use_bcast: 0/1/2/3] \
[prec_in: F32/BF16/F16/BF8/HF8] [prec_comp: F32/BF16/F16/BF8/HF8] \
[prec_out: F32/BF16/F16/BF8/HF8] [M] [N] [ldi] [ldo] [Opt: rnd_mode: 0/1]";

/// Checks one element-wise unary kernel against the reference engine.
#[derive(Debug, Parser)]
#[command(name = "eltwise_unary")]
struct Cli {
    /// Operation id (1 copy, 2 xor, 3 x2, 4 sqrt, 7-17, 27, 42, 64, 65).
    op: u32,
    /// 0 none, 1 row, 2 column, 3 scalar.
    bcast: u32,
    prec_in: String,
    prec_comp: String,
    prec_out: String,
    m: usize,
    n: usize,
    ldi: usize,
    ldo: usize,
    /// 0 nearest-even, 1 stochastic (BF8 output only).
    #[arg(default_value_t = 0)]
    rnd_mode: u32,
    /// Append a JSONL record of the run to this file.
    #[arg(long)]
    log_path: Option<PathBuf>,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            std::process::exit(if err.use_stderr() { USAGE_EXIT } else { 0 });
        }
    };
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("eltwise_unary failed: {err}");
            std::process::exit(USAGE_EXIT);
        }
    }
}

fn run(cli: Cli) -> Result<i32, String> {
    let config = HarnessConfig::default_paths().with_env_overrides()?;
    if cli.log_path.is_some() {
        set_unary_case_log_path(cli.log_path.clone());
    }

    let args = UnaryArgs {
        op: cli.op,
        broadcast: cli.bcast,
        prec_in: cli.prec_in,
        prec_comp: cli.prec_comp,
        prec_out: cli.prec_out,
        m: cli.m,
        n: cli.n,
        ldi: cli.ldi,
        ldo: cli.ldo,
        rnd_mode: cli.rnd_mode,
    };
    let request = match UnaryRequest::resolve(&args) {
        Ok(request) => request,
        Err(err) => {
            append_unary_case_log(&UnaryCaseLogEntry::rejected(
                "cli", &args, &config, &err, false,
            ))?;
            return Err(format!("{err} [{}]\n{USAGE}", err.reason_code()));
        }
    };
    print!("{}", request.banner());

    let mut ledger = DispatchLedger::new();
    let outcome = match run_unary(&request, &PortableProvider, &config, &mut ledger) {
        Ok(outcome) => outcome,
        Err(err) => {
            append_unary_case_log(&UnaryCaseLogEntry::rejected(
                "cli", &args, &config, &err, false,
            ))?;
            return Err(format!("{err} [{}]", err.reason_code()));
        }
    };
    print!("{}", outcome.render_report());
    append_unary_case_log(&outcome.log_entry("cli", &config))?;

    Ok(outcome.exit_code(config.reference_kernel_exit_code))
}

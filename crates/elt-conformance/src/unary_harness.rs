//! One differential run of a unary op: resolve the request, build the
//! input, compute gold, run the dispatched kernel, compare.

use crate::HarnessConfig;
use crate::matdiff::{self, ErrorReport};
use crate::tolerance::ToleranceEntry;
use elt_dtype::{PrecisionTag, Rounding, RoundingMode};
use elt_kernel::{
    DispatchError, DispatchLedger, KernelError, KernelInfo, KernelProvider, UnaryFlags,
    UnaryParam, UnaryShape, dispatch_and_record,
};
use elt_layout::{BroadcastMode, ElementBuffer, LayoutError, UnaryLayout, apply_broadcast};
use elt_ops::oracle::{self, OraclePath, OracleRequest};
use elt_ops::{OpClass, OpKind, OperationDescriptor, OpsError, PrecisionTriple, lookup};
use elt_random::{StochasticRoundingState, ValueStream};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;

pub const UNARY_HARNESS_REASON_CODES: [&str; 10] = [
    "unary_usage_invalid_shape",
    "unary_usage_unsupported_precision",
    "unary_usage_unsupported_rounding",
    "unary_usage_malformed_argument",
    "unary_unknown_operation",
    "unary_kernel_dispatch_failed",
    "unary_kernel_execution_failed",
    "unary_reference_failed",
    "unary_buffer_access_failed",
    "unary_log_write_failed",
];

/// Cycle length of the reciprocal-family input substitution.
const RECIPROCAL_INPUT_PERIOD: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HarnessError {
    InvalidShape(LayoutError),
    UnsupportedPrecision(String),
    UnsupportedRounding(String),
    MalformedArgument(String),
    UnknownOperation { op_id: u32 },
    KernelDispatch(DispatchError),
    KernelExecution(KernelError),
    Reference(OpsError),
    Buffer(LayoutError),
    Log(String),
}

impl HarnessError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::InvalidShape(_) => "unary_usage_invalid_shape",
            Self::UnsupportedPrecision(_) => "unary_usage_unsupported_precision",
            Self::UnsupportedRounding(_) => "unary_usage_unsupported_rounding",
            Self::MalformedArgument(_) => "unary_usage_malformed_argument",
            Self::UnknownOperation { .. } => "unary_unknown_operation",
            Self::KernelDispatch(_) => "unary_kernel_dispatch_failed",
            Self::KernelExecution(_) => "unary_kernel_execution_failed",
            Self::Reference(_) => "unary_reference_failed",
            Self::Buffer(_) => "unary_buffer_access_failed",
            Self::Log(_) => "unary_log_write_failed",
        }
    }

    /// Rejected before any buffer was touched.
    #[must_use]
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            Self::InvalidShape(_)
                | Self::UnsupportedPrecision(_)
                | Self::UnsupportedRounding(_)
                | Self::MalformedArgument(_)
                | Self::UnknownOperation { .. }
        )
    }
}

impl std::fmt::Display for HarnessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidShape(err) => write!(f, "invalid shape: {err}"),
            Self::UnsupportedPrecision(detail) => write!(f, "unsupported precision: {detail}"),
            Self::UnsupportedRounding(detail) => write!(f, "unsupported rounding: {detail}"),
            Self::MalformedArgument(detail) => write!(f, "malformed argument: {detail}"),
            Self::UnknownOperation { op_id } => write!(f, "invalid op {op_id}"),
            Self::KernelDispatch(err) => write!(f, "kernel dispatch failed: {err}"),
            Self::KernelExecution(err) => write!(f, "{err}"),
            Self::Reference(err) => write!(f, "reference computation failed: {err}"),
            Self::Buffer(err) => write!(f, "buffer access failed: {err}"),
            Self::Log(detail) => write!(f, "log write failed: {detail}"),
        }
    }
}

impl std::error::Error for HarnessError {}

/// Raw invocation arguments, as typed on the command line or stored in a
/// fixture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnaryArgs {
    pub op: u32,
    pub broadcast: u32,
    pub prec_in: String,
    pub prec_comp: String,
    pub prec_out: String,
    pub m: usize,
    pub n: usize,
    pub ldi: usize,
    pub ldo: usize,
    pub rnd_mode: u32,
}

/// A validated invocation. Nothing is allocated until [`run_unary`].
#[derive(Debug, Clone, Copy)]
pub struct UnaryRequest {
    pub descriptor: &'static OperationDescriptor,
    pub triple: PrecisionTriple,
    pub layout: UnaryLayout,
    pub rounding: RoundingMode,
    /// Broadcast as requested, before replicate forces column broadcast.
    pub requested_broadcast: BroadcastMode,
}

fn parse_tag(role: &str, raw: &str) -> Result<PrecisionTag, HarnessError> {
    PrecisionTag::parse(raw)
        .ok_or_else(|| HarnessError::MalformedArgument(format!("{role} precision `{raw}`")))
}

impl UnaryRequest {
    pub fn resolve(args: &UnaryArgs) -> Result<Self, HarnessError> {
        let descriptor =
            lookup(args.op).map_err(|_| HarnessError::UnknownOperation { op_id: args.op })?;
        let triple = PrecisionTriple::new(
            parse_tag("input", &args.prec_in)?,
            parse_tag("output", &args.prec_out)?,
            parse_tag("compute", &args.prec_comp)?,
        );
        let requested_broadcast = BroadcastMode::from_code(args.broadcast).ok_or_else(|| {
            HarnessError::MalformedArgument(format!("broadcast mode {}", args.broadcast))
        })?;
        let rounding = RoundingMode::from_code(args.rnd_mode).ok_or_else(|| {
            HarnessError::UnsupportedRounding(format!("rnd_mode = {}", args.rnd_mode))
        })?;
        descriptor
            .check(triple, rounding)
            .map_err(|err| match err {
                OpsError::UnsupportedRounding { .. } => {
                    HarnessError::UnsupportedRounding(err.to_string())
                }
                other => HarnessError::UnsupportedPrecision(other.to_string()),
            })?;

        let broadcast = if descriptor.forces_column_broadcast {
            BroadcastMode::Column
        } else {
            requested_broadcast
        };
        let layout = UnaryLayout::new(
            args.m,
            args.n,
            args.ldi,
            args.ldo,
            descriptor.fan_out,
            broadcast,
        )
        .map_err(HarnessError::InvalidShape)?;

        Ok(Self {
            descriptor,
            triple,
            layout,
            rounding,
            requested_broadcast,
        })
    }

    /// Lines printed before the run starts.
    #[must_use]
    pub fn banner(&self) -> String {
        let mut out = String::new();
        match self.requested_broadcast {
            BroadcastMode::None => {}
            BroadcastMode::Row => out.push_str("Using row broadcast for the input row-vector ...\n"),
            BroadcastMode::Column => {
                out.push_str("Using column broadcast for the input column-vector...\n");
            }
            BroadcastMode::Scalar => out.push_str("Using scalar broadcast for the input value...\n"),
        }
        let UnaryLayout { m, n, ldi, ldo, .. } = self.layout;
        let _ = writeln!(
            out,
            "Testing {} unary {} - M={m}, N={n}, LDI={ldi}, LDO={ldo}",
            self.triple, self.descriptor.name
        );
        out
    }

    fn shape(&self) -> UnaryShape {
        let UnaryLayout { m, n, ldi, ldo, .. } = self.layout;
        UnaryShape {
            m,
            n: if self.descriptor.forces_column_broadcast {
                0
            } else {
                n
            },
            ldi,
            ldo,
            input: self.triple.input,
            output: self.triple.output,
            compute: self.triple.compute,
        }
    }

    fn flags(&self) -> UnaryFlags {
        UnaryFlags {
            broadcast: self.layout.broadcast,
            stochastic_round: self.rounding == RoundingMode::Stochastic,
            nts_hint: true,
        }
    }

    fn needs_reciprocal_input(&self) -> bool {
        self.descriptor.class == OpClass::Reciprocal
            && (self.triple.input.is_eight_bit() || self.triple.output.is_eight_bit())
    }
}

#[derive(Debug, Clone)]
pub struct UnaryRunOutcome {
    pub request: UnaryRequest,
    pub path: OraclePath,
    pub kernel: KernelInfo,
    pub tolerance: ToleranceEntry,
    pub report: ErrorReport,
    pub bytes_identical: bool,
    pub passed: bool,
    pub input: ElementBuffer,
    pub gold: ElementBuffer,
    pub test: ElementBuffer,
}

impl UnaryRunOutcome {
    #[must_use]
    pub fn verdict_line(&self) -> String {
        let triple = self.request.triple;
        let verdict = if self.passed { "SUCCESS" } else { "FAILURE" };
        format!(
            "{verdict} unary simple {} {} {}",
            triple.input, triple.output, triple.compute
        )
    }

    /// Norm block followed by the verdict line.
    #[must_use]
    pub fn render_report(&self) -> String {
        let r = &self.report;
        let mut out = String::new();
        out.push_str("##########################################\n");
        out.push_str("#   Correctness  - Output                #\n");
        out.push_str("##########################################\n");
        let _ = writeln!(out, "L1 reference  : {}", r.l1_ref);
        let _ = writeln!(out, "L1 test       : {}", r.l1_tst);
        let _ = writeln!(out, "L2 abs.error  : {:.24}", r.l2_abs);
        let _ = writeln!(out, "L2 rel.error  : {:.24}", r.l2_rel);
        let _ = writeln!(out, "Linf abs.error: {:.24}", r.linf_abs);
        let _ = writeln!(out, "Linf rel.error: {:.24}", r.linf_rel);
        let _ = writeln!(out, "Check-norm    : {:.24}\n", r.normf_rel);
        out.push_str(&self.verdict_line());
        out.push('\n');
        out
    }

    /// Process status: 1 on numerical failure, otherwise 0 unless a
    /// reference kernel passed and the caller asked to flag that.
    #[must_use]
    pub fn exit_code(&self, reference_exit_code: Option<i32>) -> i32 {
        if !self.passed {
            1
        } else if self.kernel.is_reference {
            reference_exit_code.unwrap_or(0)
        } else {
            0
        }
    }

    #[must_use]
    pub fn log_entry(&self, fixture_id: &str, config: &HarnessConfig) -> UnaryCaseLogEntry {
        let request = &self.request;
        UnaryCaseLogEntry {
            suite: "unary_differential",
            fixture_id: fixture_id.to_string(),
            op: request.descriptor.name.to_string(),
            op_id: request.descriptor.id,
            triple: request.triple.to_string(),
            shape: request.shape().digest(),
            broadcast: request.layout.broadcast.as_str().to_string(),
            rounding: request.rounding.as_str().to_string(),
            seed: config.rng_seed,
            oracle_path: Some(self.path.as_str().to_string()),
            kernel: Some(self.kernel.name.clone()),
            is_reference: self.kernel.is_reference,
            capability: Some(self.tolerance.capability.as_str().to_string()),
            tolerance: Some(self.tolerance.bound),
            normf_rel: Some(self.report.normf_rel),
            norms: Some(self.report),
            passed: self.passed,
            reason_code: if self.passed {
                "unary_pass".to_string()
            } else {
                "unary_numerical_mismatch".to_string()
            },
            gold_sha256: Some(sha256_hex(self.gold.as_bytes())),
            test_sha256: Some(sha256_hex(self.test.as_bytes())),
        }
    }
}

/// One JSONL line per invocation.
#[derive(Debug, Clone, Serialize)]
pub struct UnaryCaseLogEntry {
    pub suite: &'static str,
    pub fixture_id: String,
    pub op: String,
    pub op_id: u32,
    pub triple: String,
    pub shape: String,
    pub broadcast: String,
    pub rounding: String,
    pub seed: u64,
    pub oracle_path: Option<String>,
    pub kernel: Option<String>,
    pub is_reference: bool,
    pub capability: Option<String>,
    pub tolerance: Option<f64>,
    pub normf_rel: Option<f64>,
    pub norms: Option<ErrorReport>,
    pub passed: bool,
    pub reason_code: String,
    pub gold_sha256: Option<String>,
    pub test_sha256: Option<String>,
}

impl UnaryCaseLogEntry {
    /// Entry for an invocation that stopped with an error before comparing.
    #[must_use]
    pub fn rejected(
        fixture_id: &str,
        args: &UnaryArgs,
        config: &HarnessConfig,
        err: &HarnessError,
        passed: bool,
    ) -> Self {
        Self {
            suite: "unary_differential",
            fixture_id: fixture_id.to_string(),
            op: lookup(args.op).map_or_else(|_| "unknown".to_string(), |d| d.name.to_string()),
            op_id: args.op,
            triple: format!(
                "in:{} out:{} comp:{}",
                args.prec_in, args.prec_out, args.prec_comp
            ),
            shape: format!(
                "m={} n={} ldi={} ldo={}",
                args.m, args.n, args.ldi, args.ldo
            ),
            broadcast: BroadcastMode::from_code(args.broadcast)
                .map_or_else(|| args.broadcast.to_string(), |mode| mode.as_str().to_string()),
            rounding: RoundingMode::from_code(args.rnd_mode)
                .map_or_else(|| args.rnd_mode.to_string(), |mode| mode.as_str().to_string()),
            seed: config.rng_seed,
            oracle_path: None,
            kernel: None,
            is_reference: false,
            capability: None,
            tolerance: None,
            normf_rel: None,
            norms: None,
            passed,
            reason_code: err.reason_code().to_string(),
            gold_sha256: None,
            test_sha256: None,
        }
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

/// Fixture form of [`UnaryArgs`] plus the outcome the case expects.
#[derive(Debug, Clone, Deserialize)]
pub struct UnaryCase {
    pub id: String,
    pub op: u32,
    #[serde(default)]
    pub broadcast: u32,
    pub prec_in: String,
    pub prec_comp: String,
    pub prec_out: String,
    pub m: usize,
    pub n: usize,
    pub ldi: usize,
    pub ldo: usize,
    #[serde(default)]
    pub rnd_mode: u32,
    /// When set, the case must be rejected with this reason code.
    #[serde(default)]
    pub expected_reason_code: Option<String>,
}

impl UnaryCase {
    #[must_use]
    pub fn args(&self) -> UnaryArgs {
        UnaryArgs {
            op: self.op,
            broadcast: self.broadcast,
            prec_in: self.prec_in.clone(),
            prec_comp: self.prec_comp.clone(),
            prec_out: self.prec_out.clone(),
            m: self.m,
            n: self.n,
            ldi: self.ldi,
            ldo: self.ldo,
            rnd_mode: self.rnd_mode,
        }
    }
}

/// Uniform [0, 1) floats narrowed to the element format, or raw 32-bit
/// patterns for integer formats. Padding is filled too.
pub fn randomize_input(input: &mut ElementBuffer, seed: u64) -> Result<(), LayoutError> {
    let mut rng = ValueStream::new(seed);
    let tag = input.tag();
    for index in 0..input.len() {
        if tag == PrecisionTag::F64 {
            input.set_f64(index, rng.next_f64(), Rounding::NearestEven)?;
        } else if tag.is_integer() {
            let bits = u64::from(rng.next_u32()) & bit_mask(tag);
            input.set_bits(index, bits)?;
        } else {
            input.set_f32(index, rng.next_f32(), Rounding::NearestEven)?;
        }
    }
    Ok(())
}

const fn bit_mask(tag: PrecisionTag) -> u64 {
    match tag.item_size() {
        0 => 0,
        width if width >= 8 => u64::MAX,
        width => (1u64 << (width * 8)) - 1,
    }
}

/// Replaces every input slot `k` with `1 + k mod 20` so reciprocals stay
/// inside the 8-bit formats' range.
pub fn apply_reciprocal_input_pattern(input: &mut ElementBuffer) -> Result<(), LayoutError> {
    for index in 0..input.len() {
        let value = (1 + index % RECIPROCAL_INPUT_PERIOD) as f64;
        input.set_f64(index, value, Rounding::NearestEven)?;
    }
    Ok(())
}

fn stochastic_state(rounding: RoundingMode, seed: u64) -> Option<StochasticRoundingState> {
    match rounding {
        RoundingMode::Stochastic => Some(StochasticRoundingState::new(seed)),
        RoundingMode::NearestEven => None,
    }
}

/// Runs one invocation end to end. Numerical mismatch is reported through
/// [`UnaryRunOutcome::passed`], not as an error.
pub fn run_unary(
    request: &UnaryRequest,
    provider: &dyn KernelProvider,
    config: &HarnessConfig,
    ledger: &mut DispatchLedger,
) -> Result<UnaryRunOutcome, HarnessError> {
    let UnaryRequest {
        descriptor,
        triple,
        layout,
        rounding,
        ..
    } = *request;

    let input_len = layout.input_len().map_err(HarnessError::Buffer)?;
    let output_len = layout.output_len().map_err(HarnessError::Buffer)?;
    let mut input = ElementBuffer::zeros(triple.input, input_len).map_err(HarnessError::Buffer)?;
    let mut gold = ElementBuffer::zeros(triple.output, output_len).map_err(HarnessError::Buffer)?;
    let mut test = gold.clone();

    randomize_input(&mut input, config.rng_seed).map_err(HarnessError::Buffer)?;
    if request.needs_reciprocal_input() {
        apply_reciprocal_input_pattern(&mut input).map_err(HarnessError::Buffer)?;
    }
    apply_broadcast(&layout, &mut input).map_err(HarnessError::Buffer)?;

    let oracle_request = OracleRequest {
        descriptor,
        layout,
        triple,
        rounding,
    };
    let mut gold_rng = stochastic_state(rounding, config.stochastic_seed);
    let path = oracle::compute(&oracle_request, &input, &mut gold, gold_rng.as_mut())
        .map_err(HarnessError::Reference)?;

    let kernel = dispatch_and_record(
        ledger,
        provider,
        descriptor.id,
        &request.shape(),
        request.flags(),
        descriptor.name,
    )
    .map_err(HarnessError::KernelDispatch)?;

    let slice_bytes = layout.slice_len().map_err(HarnessError::Buffer)? * triple.output.item_size();
    let mut kernel_rng = stochastic_state(rounding, config.stochastic_seed);
    let mut param = UnaryParam::new(input.as_bytes(), test.as_bytes_mut());
    param.rng_state = kernel_rng.as_mut();
    if descriptor.forces_column_broadcast {
        param.replicate_cols = Some(layout.n);
    }
    match descriptor.kind {
        OpKind::Unzip => param.out_offset_bytes = Some(slice_bytes),
        OpKind::Decompose { .. } => param.out_strides_bytes = Some([slice_bytes, 2 * slice_bytes]),
        OpKind::Scalar => {}
    }
    kernel.execute(param).map_err(HarnessError::KernelExecution)?;

    let capability = config.capability_class.unwrap_or(kernel.info.capability);
    let tolerance = ToleranceEntry::resolve(descriptor, triple, capability);
    let report =
        matdiff::compare(&gold, &test, layout.output_matrix()).map_err(HarnessError::Buffer)?;
    let bytes_identical = matdiff::bytes_identical(&gold, &test);
    let exact = tolerance.exact || path.is_bit_exact();
    let passed = report.within(tolerance.bound) && (!exact || bytes_identical);

    Ok(UnaryRunOutcome {
        request: *request,
        path,
        kernel: kernel.info,
        tolerance,
        report,
        bytes_identical,
        passed,
        input,
        gold,
        test,
    })
}

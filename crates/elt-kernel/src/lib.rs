#![forbid(unsafe_code)]

mod portable;

pub use portable::PortableProvider;

use elt_dtype::{DTypeError, PrecisionTag};
use elt_layout::BroadcastMode;
use elt_random::StochasticRoundingState;
use std::time::{SystemTime, UNIX_EPOCH};

pub const KERNEL_REASON_CODES: [&str; 6] = [
    "kernel_dispatch_unsupported_operation",
    "kernel_dispatch_unsupported_shape",
    "kernel_dispatch_unsupported_flags",
    "kernel_missing_param",
    "kernel_buffer_access_failed",
    "kernel_execution_failed",
];

/// Target class a kernel was generated for. Tolerances for the reciprocal
/// family are looser on `Baseline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityClass {
    Baseline,
    Extended,
}

impl CapabilityClass {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::Extended => "extended",
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "baseline" => Some(Self::Baseline),
            "extended" => Some(Self::Extended),
            _ => None,
        }
    }
}

/// Geometry and formats handed to a provider. Replicate-column kernels are
/// dispatched with `n == 0`; the column count travels in [`UnaryParam`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnaryShape {
    pub m: usize,
    pub n: usize,
    pub ldi: usize,
    pub ldo: usize,
    pub input: PrecisionTag,
    pub output: PrecisionTag,
    pub compute: PrecisionTag,
}

impl UnaryShape {
    #[must_use]
    pub fn digest(&self) -> String {
        format!(
            "m={} n={} ldi={} ldo={} in={} out={} comp={}",
            self.m, self.n, self.ldi, self.ldo, self.input, self.output, self.compute
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnaryFlags {
    pub broadcast: BroadcastMode,
    pub stochastic_round: bool,
    /// Non-temporal store hint; providers may ignore it.
    pub nts_hint: bool,
}

impl Default for UnaryFlags {
    fn default() -> Self {
        Self {
            broadcast: BroadcastMode::None,
            stochastic_round: false,
            nts_hint: false,
        }
    }
}

/// Per-call arguments. Buffers are raw little-endian element storage.
#[derive(Debug)]
pub struct UnaryParam<'a> {
    pub input: &'a [u8],
    pub output: &'a mut [u8],
    pub rng_state: Option<&'a mut StochasticRoundingState>,
    pub replicate_cols: Option<usize>,
    /// Byte offset of the high-half block for unzip.
    pub out_offset_bytes: Option<usize>,
    /// Byte offsets of the second and third decomposition slices.
    pub out_strides_bytes: Option<[usize; 2]>,
}

impl<'a> UnaryParam<'a> {
    #[must_use]
    pub fn new(input: &'a [u8], output: &'a mut [u8]) -> Self {
        Self {
            input,
            output,
            rng_state: None,
            replicate_cols: None,
            out_offset_bytes: None,
            out_strides_bytes: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelInfo {
    pub name: String,
    /// Set when the provider fell back to a reference implementation.
    pub is_reference: bool,
    pub capability: CapabilityClass,
}

pub trait UnaryKernel {
    fn execute(&self, param: UnaryParam<'_>) -> Result<(), KernelError>;
}

pub struct DispatchedKernel {
    pub kernel: Box<dyn UnaryKernel>,
    pub info: KernelInfo,
}

impl DispatchedKernel {
    pub fn execute(&self, param: UnaryParam<'_>) -> Result<(), KernelError> {
        self.kernel.execute(param)
    }
}

impl std::fmt::Debug for DispatchedKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchedKernel")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

pub trait KernelProvider {
    fn name(&self) -> &str;

    fn dispatch(
        &self,
        op_id: u32,
        shape: &UnaryShape,
        flags: UnaryFlags,
    ) -> Result<DispatchedKernel, DispatchError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    UnsupportedOperation { op_id: u32 },
    UnsupportedShape { op_id: u32, detail: String },
    UnsupportedFlags { op_id: u32, detail: String },
}

impl DispatchError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::UnsupportedOperation { .. } => "kernel_dispatch_unsupported_operation",
            Self::UnsupportedShape { .. } => "kernel_dispatch_unsupported_shape",
            Self::UnsupportedFlags { .. } => "kernel_dispatch_unsupported_flags",
        }
    }
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedOperation { op_id } => {
                write!(f, "no kernel for operation id {op_id}")
            }
            Self::UnsupportedShape { op_id, detail } => {
                write!(f, "op {op_id}: unsupported shape: {detail}")
            }
            Self::UnsupportedFlags { op_id, detail } => {
                write!(f, "op {op_id}: unsupported flags: {detail}")
            }
        }
    }
}

impl std::error::Error for DispatchError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    MissingParam(&'static str),
    Buffer(DTypeError),
    Execution { detail: String },
}

impl KernelError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::MissingParam(_) => "kernel_missing_param",
            Self::Buffer(_) => "kernel_buffer_access_failed",
            Self::Execution { .. } => "kernel_execution_failed",
        }
    }
}

impl std::fmt::Display for KernelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingParam(field) => write!(f, "kernel parameter `{field}` is required"),
            Self::Buffer(err) => write!(f, "kernel buffer access failed: {err}"),
            Self::Execution { detail } => write!(f, "kernel execution failed: {detail}"),
        }
    }
}

impl std::error::Error for KernelError {}

impl From<DTypeError> for KernelError {
    fn from(err: DTypeError) -> Self {
        Self::Buffer(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchEvent {
    pub ts_millis: u128,
    pub provider: String,
    pub op_id: u32,
    pub shape_digest: String,
    pub flags: UnaryFlags,
    pub dispatched: bool,
    pub is_reference: bool,
    pub note: String,
}

#[derive(Debug, Default, Clone)]
pub struct DispatchLedger {
    events: Vec<DispatchEvent>,
}

impl DispatchLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: DispatchEvent) {
        self.events.push(event);
    }

    #[must_use]
    pub fn events(&self) -> &[DispatchEvent] {
        &self.events
    }

    #[must_use]
    pub fn last(&self) -> Option<&DispatchEvent> {
        self.events.last()
    }
}

/// Dispatches through `provider` and records the outcome, success or not.
pub fn dispatch_and_record(
    ledger: &mut DispatchLedger,
    provider: &dyn KernelProvider,
    op_id: u32,
    shape: &UnaryShape,
    flags: UnaryFlags,
    note: impl Into<String>,
) -> Result<DispatchedKernel, DispatchError> {
    let result = provider.dispatch(op_id, shape, flags);
    let ts_millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis());
    let (dispatched, is_reference, note) = match &result {
        Ok(kernel) => (true, kernel.info.is_reference, note.into()),
        Err(err) => (false, false, format!("{}: {err}", note.into())),
    };
    ledger.record(DispatchEvent {
        ts_millis,
        provider: provider.name().to_string(),
        op_id,
        shape_digest: shape.digest(),
        flags,
        dispatched,
        is_reference,
        note,
    });
    result
}

#![forbid(unsafe_code)]

pub mod oracle;

use elt_dtype::{PrecisionTag, RoundingMode};
use elt_layout::LayoutError;

pub const OPS_REASON_CODES: [&str; 6] = [
    "ops_unknown_operation",
    "ops_unsupported_precision",
    "ops_unsupported_rounding",
    "ops_missing_rounding_state",
    "ops_buffer_tag_mismatch",
    "ops_layout_violation",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Copy,
    Xor,
    Square,
    Sqrt,
    Tanh,
    TanhInv,
    Sigmoid,
    SigmoidInv,
    Gelu,
    GeluInv,
    Negate,
    Inc,
    Reciprocal,
    ReciprocalSqrt,
    Exp,
    ReplicateColVar,
    Unzip,
    DecompBf16x2,
    DecompBf16x3,
}

impl UnaryOp {
    pub const ALL: [Self; 19] = [
        Self::Copy,
        Self::Xor,
        Self::Square,
        Self::Sqrt,
        Self::Tanh,
        Self::TanhInv,
        Self::Sigmoid,
        Self::SigmoidInv,
        Self::Gelu,
        Self::GeluInv,
        Self::Negate,
        Self::Inc,
        Self::Reciprocal,
        Self::ReciprocalSqrt,
        Self::Exp,
        Self::ReplicateColVar,
        Self::Unzip,
        Self::DecompBf16x2,
        Self::DecompBf16x3,
    ];

    #[must_use]
    pub fn from_id(op_id: u32) -> Option<Self> {
        REGISTRY
            .iter()
            .find(|descriptor| descriptor.id == op_id)
            .map(|descriptor| descriptor.op)
    }

    #[must_use]
    pub fn id(self) -> u32 {
        descriptor(self).id
    }

    #[must_use]
    pub fn descriptor(self) -> &'static OperationDescriptor {
        descriptor(self)
    }

    /// Scalar f32 semantics. Structural ops pass the value through.
    #[must_use]
    pub fn apply_f32(self, x: f32) -> f32 {
        match self {
            Self::Copy | Self::ReplicateColVar => x,
            Self::Xor => 0.0,
            Self::Square => x * x,
            Self::Sqrt => x.sqrt(),
            Self::Tanh => x.tanh(),
            Self::TanhInv => tanh_derivative(x),
            Self::Sigmoid => sigmoid(x),
            Self::SigmoidInv => sigmoid_derivative(x),
            Self::Gelu => gelu(x),
            Self::GeluInv => gelu_derivative(x),
            Self::Negate => -x,
            Self::Inc => x + 1.0,
            Self::Reciprocal => 1.0 / x,
            Self::ReciprocalSqrt => 1.0 / x.sqrt(),
            Self::Exp => x.exp(),
            Self::Unzip | Self::DecompBf16x2 | Self::DecompBf16x3 => x,
        }
    }

    /// Double-precision semantics, defined for a subset of ops only.
    #[must_use]
    pub fn apply_f64(self, x: f64) -> Option<f64> {
        match self {
            Self::Copy => Some(x),
            Self::Xor => Some(0.0),
            Self::Square => Some(x * x),
            Self::Sqrt => Some(x.sqrt()),
            Self::Negate => Some(-x),
            Self::Inc => Some(x + 1.0),
            Self::Reciprocal => Some(1.0 / x),
            Self::ReciprocalSqrt => Some(1.0 / x.sqrt()),
            _ => None,
        }
    }
}

fn sigmoid(x: f32) -> f32 {
    ((x / 2.0).tanh() + 1.0) / 2.0
}

fn sigmoid_derivative(x: f32) -> f32 {
    let s = sigmoid(x);
    s * (1.0 - s)
}

fn tanh_derivative(x: f32) -> f32 {
    let t = x.tanh();
    1.0 - t * t
}

fn gelu(x: f32) -> f32 {
    (libm::erff(x / 2.0f32.sqrt()) + 1.0) * 0.5 * x
}

fn gelu_derivative(x: f32) -> f32 {
    0.5 + 0.5 * libm::erff(x / 2.0f32.sqrt())
        + x / (2.0 * std::f32::consts::PI).sqrt() * (-0.5 * x * x).exp()
}

/// Shape of the computation an op performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Scalar,
    Unzip,
    Decompose { words: usize },
}

/// Grouping used to pick a tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpClass {
    Identity,
    Algebraic,
    Reciprocal,
    Transcendental,
    Structural,
}

impl OpClass {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Algebraic => "algebraic",
            Self::Reciprocal => "reciprocal",
            Self::Transcendental => "transcendental",
            Self::Structural => "structural",
        }
    }
}

/// `(input, output, compute)` element formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PrecisionTriple {
    pub input: PrecisionTag,
    pub output: PrecisionTag,
    pub compute: PrecisionTag,
}

impl PrecisionTriple {
    #[must_use]
    pub const fn new(input: PrecisionTag, output: PrecisionTag, compute: PrecisionTag) -> Self {
        Self {
            input,
            output,
            compute,
        }
    }

    #[must_use]
    pub fn is_uniform(self) -> bool {
        self.input == self.output && self.output == self.compute
    }
}

impl std::fmt::Display for PrecisionTriple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "in:{} out:{} comp:{}",
            self.input, self.output, self.compute
        )
    }
}

const fn t(input: PrecisionTag, output: PrecisionTag, compute: PrecisionTag) -> PrecisionTriple {
    PrecisionTriple::new(input, output, compute)
}

use PrecisionTag::{BF8, BF16, F16, F32, F64, HF8, I32, Implicit, U16, U32};

const IDENTITY_TRIPLES: [PrecisionTriple; 18] = [
    t(F64, F64, F64),
    t(F32, F32, F32),
    t(BF16, F32, F32),
    t(F32, BF16, F32),
    t(BF16, BF16, F32),
    t(BF16, BF16, BF16),
    t(F16, F32, F32),
    t(F32, F16, F32),
    t(F16, F16, F32),
    t(F16, F16, F16),
    t(BF8, F32, F32),
    t(F32, BF8, F32),
    t(BF8, BF8, F32),
    t(BF8, BF8, BF8),
    t(HF8, F32, F32),
    t(F32, HF8, F32),
    t(HF8, HF8, F32),
    t(HF8, HF8, HF8),
];

const SCALAR_TRIPLES: [PrecisionTriple; 14] = [
    t(F64, F64, F64),
    t(F32, F32, F32),
    t(BF16, BF16, F32),
    t(BF16, F32, F32),
    t(F32, BF16, F32),
    t(F16, F16, F32),
    t(F16, F32, F32),
    t(F32, F16, F32),
    t(BF8, BF8, F32),
    t(BF8, F32, F32),
    t(F32, BF8, F32),
    t(HF8, HF8, F32),
    t(HF8, F32, F32),
    t(F32, HF8, F32),
];

const UNZIP_TRIPLES: [PrecisionTriple; 3] = [
    t(F32, U16, Implicit),
    t(I32, U16, Implicit),
    t(U32, U16, Implicit),
];

const DECOMPOSE_TRIPLES: [PrecisionTriple; 1] = [t(F32, BF16, F32)];

/// Registry entry: everything the harness needs to know about one op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationDescriptor {
    pub op: UnaryOp,
    pub id: u32,
    pub name: &'static str,
    pub kind: OpKind,
    pub class: OpClass,
    /// Output slices written per logical column.
    pub fan_out: usize,
    pub forces_column_broadcast: bool,
    pub has_f64_semantics: bool,
    triples: &'static [PrecisionTriple],
}

impl OperationDescriptor {
    #[must_use]
    pub const fn is_structural(&self) -> bool {
        !matches!(self.kind, OpKind::Scalar)
    }

    #[must_use]
    pub fn allowed_triples(&self) -> impl Iterator<Item = PrecisionTriple> + '_ {
        self.triples
            .iter()
            .copied()
            .filter(|triple| triple.compute != F64 || self.has_f64_semantics)
    }

    #[must_use]
    pub fn allows(&self, triple: PrecisionTriple) -> bool {
        self.allowed_triples().any(|allowed| allowed == triple)
    }

    /// Rejects precision triples and rounding modes the op does not support.
    pub fn check(&self, triple: PrecisionTriple, rounding: RoundingMode) -> Result<(), OpsError> {
        if !self.allows(triple) {
            return Err(OpsError::UnsupportedPrecision {
                op: self.name,
                triple,
            });
        }
        if rounding == RoundingMode::Stochastic && triple.output != BF8 {
            return Err(OpsError::UnsupportedRounding {
                op: self.name,
                output: triple.output,
            });
        }
        Ok(())
    }
}

const fn scalar(
    op: UnaryOp,
    id: u32,
    name: &'static str,
    class: OpClass,
    has_f64_semantics: bool,
) -> OperationDescriptor {
    OperationDescriptor {
        op,
        id,
        name,
        kind: OpKind::Scalar,
        class,
        fan_out: 1,
        forces_column_broadcast: false,
        has_f64_semantics,
        triples: &SCALAR_TRIPLES,
    }
}

const fn identity(op: UnaryOp, id: u32, name: &'static str) -> OperationDescriptor {
    OperationDescriptor {
        op,
        id,
        name,
        kind: OpKind::Scalar,
        class: OpClass::Identity,
        fan_out: 1,
        forces_column_broadcast: false,
        has_f64_semantics: true,
        triples: &IDENTITY_TRIPLES,
    }
}

const fn decompose(op: UnaryOp, id: u32, name: &'static str, words: usize) -> OperationDescriptor {
    OperationDescriptor {
        op,
        id,
        name,
        kind: OpKind::Decompose { words },
        class: OpClass::Structural,
        // The two-word split still reserves a third slice.
        fan_out: 3,
        forces_column_broadcast: false,
        has_f64_semantics: false,
        triples: &DECOMPOSE_TRIPLES,
    }
}

/// Indexed by `UnaryOp` discriminant.
static REGISTRY: [OperationDescriptor; 19] = [
    identity(UnaryOp::Copy, 1, "copy"),
    identity(UnaryOp::Xor, 2, "xor"),
    scalar(UnaryOp::Square, 3, "x2", OpClass::Algebraic, true),
    scalar(UnaryOp::Sqrt, 4, "sqrt", OpClass::Transcendental, true),
    scalar(UnaryOp::Tanh, 7, "tanh", OpClass::Transcendental, false),
    scalar(UnaryOp::TanhInv, 8, "tanh_inv", OpClass::Transcendental, false),
    scalar(UnaryOp::Sigmoid, 9, "sigmoid", OpClass::Transcendental, false),
    scalar(UnaryOp::SigmoidInv, 10, "sigmoid_inv", OpClass::Transcendental, false),
    scalar(UnaryOp::Gelu, 11, "gelu", OpClass::Transcendental, false),
    scalar(UnaryOp::GeluInv, 12, "gelu_inv", OpClass::Transcendental, false),
    scalar(UnaryOp::Negate, 13, "negate", OpClass::Algebraic, true),
    scalar(UnaryOp::Inc, 14, "inc", OpClass::Algebraic, true),
    scalar(UnaryOp::Reciprocal, 15, "reciprocal", OpClass::Reciprocal, true),
    scalar(UnaryOp::ReciprocalSqrt, 16, "reciprocal sqrt", OpClass::Reciprocal, true),
    scalar(UnaryOp::Exp, 17, "exp", OpClass::Transcendental, false),
    OperationDescriptor {
        op: UnaryOp::ReplicateColVar,
        id: 27,
        name: "replicate_col_var",
        kind: OpKind::Scalar,
        class: OpClass::Identity,
        fan_out: 1,
        forces_column_broadcast: true,
        has_f64_semantics: false,
        triples: &IDENTITY_TRIPLES,
    },
    OperationDescriptor {
        op: UnaryOp::Unzip,
        id: 42,
        name: "unpack to blocks",
        kind: OpKind::Unzip,
        class: OpClass::Structural,
        fan_out: 2,
        forces_column_broadcast: false,
        has_f64_semantics: false,
        triples: &UNZIP_TRIPLES,
    },
    decompose(UnaryOp::DecompBf16x2, 64, "FP32 decomp to BF16x2", 2),
    decompose(UnaryOp::DecompBf16x3, 65, "FP32 decomp to BF16x3", 3),
];

#[must_use]
pub fn descriptor(op: UnaryOp) -> &'static OperationDescriptor {
    &REGISTRY[op as usize]
}

pub fn lookup(op_id: u32) -> Result<&'static OperationDescriptor, OpsError> {
    REGISTRY
        .iter()
        .find(|descriptor| descriptor.id == op_id)
        .ok_or(OpsError::UnknownOperation { op_id })
}

#[must_use]
pub fn name_of(op: UnaryOp) -> &'static str {
    descriptor(op).name
}

pub fn registry() -> impl Iterator<Item = &'static OperationDescriptor> {
    REGISTRY.iter()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpsError {
    UnknownOperation {
        op_id: u32,
    },
    UnsupportedPrecision {
        op: &'static str,
        triple: PrecisionTriple,
    },
    UnsupportedRounding {
        op: &'static str,
        output: PrecisionTag,
    },
    MissingRoundingState,
    BufferTagMismatch {
        role: &'static str,
        expected: PrecisionTag,
        actual: PrecisionTag,
    },
    Layout(LayoutError),
}

impl OpsError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::UnknownOperation { .. } => "ops_unknown_operation",
            Self::UnsupportedPrecision { .. } => "ops_unsupported_precision",
            Self::UnsupportedRounding { .. } => "ops_unsupported_rounding",
            Self::MissingRoundingState => "ops_missing_rounding_state",
            Self::BufferTagMismatch { .. } => "ops_buffer_tag_mismatch",
            Self::Layout(_) => "ops_layout_violation",
        }
    }
}

impl std::fmt::Display for OpsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownOperation { op_id } => write!(f, "unknown unary operation id {op_id}"),
            Self::UnsupportedPrecision { op, triple } => {
                write!(f, "{op} does not support {triple}")
            }
            Self::UnsupportedRounding { op, output } => {
                write!(
                    f,
                    "{op}: stochastic rounding requires BF8 output, got {output}"
                )
            }
            Self::MissingRoundingState => {
                write!(f, "stochastic rounding requested without a rounding state")
            }
            Self::BufferTagMismatch {
                role,
                expected,
                actual,
            } => write!(f, "{role} buffer holds {actual}, expected {expected}"),
            Self::Layout(err) => write!(f, "layout error: {err}"),
        }
    }
}

impl std::error::Error for OpsError {}

impl From<LayoutError> for OpsError {
    fn from(err: LayoutError) -> Self {
        Self::Layout(err)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        OPS_REASON_CODES, OpClass, OpKind, OpsError, PrecisionTriple, UnaryOp, descriptor,
        lookup, name_of, registry,
    };
    use elt_dtype::PrecisionTag::{BF8, BF16, F16, F32, F64, HF8, I32, Implicit, U16};
    use elt_dtype::RoundingMode;
    use std::collections::HashSet;

    #[test]
    fn reason_code_registry_matches_error_variants() {
        let codes = [
            OpsError::UnknownOperation { op_id: 0 }.reason_code(),
            OpsError::UnsupportedPrecision {
                op: "copy",
                triple: PrecisionTriple::new(F32, F32, F32),
            }
            .reason_code(),
            OpsError::UnsupportedRounding {
                op: "copy",
                output: F32,
            }
            .reason_code(),
            OpsError::MissingRoundingState.reason_code(),
            OpsError::BufferTagMismatch {
                role: "input",
                expected: F32,
                actual: F16,
            }
            .reason_code(),
            OpsError::Layout(elt_layout::LayoutError::SizeOverflow).reason_code(),
        ];
        assert_eq!(OPS_REASON_CODES, codes);
    }

    #[test]
    fn registry_is_indexed_by_discriminant() {
        for (slot, op) in UnaryOp::ALL.iter().enumerate() {
            assert_eq!(descriptor(*op).op, *op, "slot {slot}");
        }
        assert_eq!(registry().count(), UnaryOp::ALL.len());
    }

    #[test]
    fn ids_are_unique_and_resolve_back() {
        let mut seen = HashSet::new();
        for op in UnaryOp::ALL {
            assert!(seen.insert(op.id()), "duplicate id {}", op.id());
            assert_eq!(UnaryOp::from_id(op.id()), Some(op));
            assert_eq!(lookup(op.id()).expect("registered").op, op);
        }
    }

    #[test]
    fn unregistered_ids_are_unknown() {
        for op_id in [0, 5, 6, 18, 99] {
            let err = lookup(op_id).expect_err("unregistered id");
            assert_eq!(err.reason_code(), "ops_unknown_operation");
        }
    }

    #[test]
    fn display_names_come_from_registry() {
        assert_eq!(name_of(UnaryOp::Square), "x2");
        assert_eq!(name_of(UnaryOp::ReciprocalSqrt), "reciprocal sqrt");
        assert_eq!(name_of(UnaryOp::Unzip), "unpack to blocks");
        assert_eq!(name_of(UnaryOp::DecompBf16x3), "FP32 decomp to BF16x3");
        assert_eq!(lookup(27).expect("replicate").name, "replicate_col_var");
    }

    #[test]
    fn structural_descriptors() {
        let unzip = descriptor(UnaryOp::Unzip);
        assert_eq!(unzip.kind, OpKind::Unzip);
        assert_eq!(unzip.fan_out, 2);
        assert!(unzip.allows(PrecisionTriple::new(I32, U16, Implicit)));
        assert!(!unzip.allows(PrecisionTriple::new(F16, U16, Implicit)));

        let x2 = descriptor(UnaryOp::DecompBf16x2);
        assert_eq!(x2.kind, OpKind::Decompose { words: 2 });
        assert_eq!(x2.fan_out, 3);
        assert!(x2.is_structural());
        assert_eq!(x2.class, OpClass::Structural);

        assert!(descriptor(UnaryOp::ReplicateColVar).forces_column_broadcast);
    }

    #[test]
    fn f64_triple_requires_f64_semantics() {
        let f64_triple = PrecisionTriple::new(F64, F64, F64);
        assert!(descriptor(UnaryOp::Sqrt).allows(f64_triple));
        assert!(descriptor(UnaryOp::Copy).allows(f64_triple));
        assert!(!descriptor(UnaryOp::Tanh).allows(f64_triple));
        assert!(!descriptor(UnaryOp::ReplicateColVar).allows(f64_triple));
    }

    #[test]
    fn uniform_reduced_triples_only_for_identity_ops() {
        let uniform = PrecisionTriple::new(BF16, BF16, BF16);
        assert!(descriptor(UnaryOp::Copy).allows(uniform));
        assert!(descriptor(UnaryOp::Xor).allows(uniform));
        assert!(!descriptor(UnaryOp::Square).allows(uniform));
        assert!(uniform.is_uniform());
    }

    #[test]
    fn stochastic_rounding_needs_bf8_output() {
        let exp = descriptor(UnaryOp::Exp);
        let err = exp
            .check(PrecisionTriple::new(F32, F32, F32), RoundingMode::Stochastic)
            .expect_err("stochastic to F32");
        assert_eq!(err.reason_code(), "ops_unsupported_rounding");
        assert!(
            exp.check(PrecisionTriple::new(F32, BF8, F32), RoundingMode::Stochastic)
                .is_ok()
        );
        let err = exp
            .check(PrecisionTriple::new(HF8, HF8, HF8), RoundingMode::NearestEven)
            .expect_err("uniform HF8 exp");
        assert_eq!(err.reason_code(), "ops_unsupported_precision");
    }

    #[test]
    fn scalar_math_reference_points() {
        assert_eq!(UnaryOp::Sigmoid.apply_f32(0.0), 0.5);
        assert_eq!(UnaryOp::SigmoidInv.apply_f32(0.0), 0.25);
        assert_eq!(UnaryOp::TanhInv.apply_f32(0.0), 1.0);
        assert_eq!(UnaryOp::Gelu.apply_f32(0.0), 0.0);
        assert_eq!(UnaryOp::GeluInv.apply_f32(0.0), 0.5);
        assert_eq!(UnaryOp::Xor.apply_f32(3.5), 0.0);
        assert_eq!(UnaryOp::Inc.apply_f32(1.5), 2.5);
        assert_eq!(UnaryOp::ReciprocalSqrt.apply_f32(4.0), 0.5);
        assert!((UnaryOp::Gelu.apply_f32(1.0) - 0.841_344_7).abs() < 1e-6);
        assert!((UnaryOp::Sigmoid.apply_f32(2.0) - 0.880_797).abs() < 1e-6);
    }

    #[test]
    fn gelu_divides_by_the_rooted_constants() {
        let sqrt_2 = 2.0f32.sqrt();
        let sqrt_2pi = (2.0f32 * std::f32::consts::PI).sqrt();
        for x in [-3.25f32, -1.0, -0.37, 0.125, 0.5, 0.999_999_9, 1.7, 4.0] {
            let gelu = (libm::erff(x / sqrt_2) + 1.0) * 0.5 * x;
            assert_eq!(UnaryOp::Gelu.apply_f32(x).to_bits(), gelu.to_bits(), "gelu({x})");
            let derivative = 0.5 + 0.5 * libm::erff(x / sqrt_2)
                + x / sqrt_2pi * (-0.5 * x * x).exp();
            assert_eq!(
                UnaryOp::GeluInv.apply_f32(x).to_bits(),
                derivative.to_bits(),
                "gelu_inv({x})"
            );
        }
        assert!((UnaryOp::GeluInv.apply_f32(1.0) - 1.083_315_5).abs() < 1e-5);
    }

    #[test]
    fn f64_semantics_cover_the_reduced_subset() {
        let with_f64: Vec<UnaryOp> = UnaryOp::ALL
            .into_iter()
            .filter(|op| op.apply_f64(2.0).is_some())
            .collect();
        assert_eq!(
            with_f64,
            vec![
                UnaryOp::Copy,
                UnaryOp::Xor,
                UnaryOp::Square,
                UnaryOp::Sqrt,
                UnaryOp::Negate,
                UnaryOp::Inc,
                UnaryOp::Reciprocal,
                UnaryOp::ReciprocalSqrt,
            ]
        );
        for descriptor in super::registry() {
            assert_eq!(
                descriptor.has_f64_semantics && !descriptor.is_structural(),
                descriptor.op.apply_f64(2.0).is_some(),
                "{}",
                descriptor.name
            );
        }
    }
}

//! Per-invocation error bounds keyed by op class, precision triple and
//! capability class.

use elt_dtype::PrecisionTag;
use elt_kernel::CapabilityClass;
use elt_ops::{OpClass, OperationDescriptor, PrecisionTriple};

pub const DEFAULT_BOUND: f64 = 0.00001;
pub const RECIPROCAL_BOUND: f64 = 0.0027;
pub const RECIPROCAL_REDUCED_BASELINE_BOUND: f64 = 0.008;
pub const TRANSCENDENTAL_F32_BOUND: f64 = 0.0007;
pub const TRANSCENDENTAL_REDUCED_BOUND: f64 = 0.007;
pub const TRANSCENDENTAL_EIGHT_BIT_BOUND: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToleranceEntry {
    pub class: OpClass,
    pub triple: PrecisionTriple,
    pub capability: CapabilityClass,
    /// Maximum admissible `normf_rel`.
    pub bound: f64,
    /// Gold and test must also agree byte for byte.
    pub exact: bool,
}

impl ToleranceEntry {
    #[must_use]
    pub fn resolve(
        descriptor: &OperationDescriptor,
        triple: PrecisionTriple,
        capability: CapabilityClass,
    ) -> Self {
        Self {
            class: descriptor.class,
            triple,
            capability,
            bound: error_bound(descriptor.class, triple, capability),
            exact: is_exact(descriptor.class, triple),
        }
    }
}

#[must_use]
pub fn error_bound(class: OpClass, triple: PrecisionTriple, capability: CapabilityClass) -> f64 {
    match class {
        OpClass::Reciprocal => {
            let reduced = triple.input.is_reduced_mantissa() || triple.output.is_reduced_mantissa();
            if reduced && capability == CapabilityClass::Baseline {
                RECIPROCAL_REDUCED_BASELINE_BOUND
            } else {
                RECIPROCAL_BOUND
            }
        }
        OpClass::Transcendental => {
            if triple == PrecisionTriple::new(PrecisionTag::F32, PrecisionTag::F32, PrecisionTag::F32)
            {
                TRANSCENDENTAL_F32_BOUND
            } else if triple.input == PrecisionTag::F32 && triple.output.is_eight_bit() {
                TRANSCENDENTAL_EIGHT_BIT_BOUND
            } else {
                TRANSCENDENTAL_REDUCED_BOUND
            }
        }
        OpClass::Identity | OpClass::Algebraic | OpClass::Structural => DEFAULT_BOUND,
    }
}

fn is_exact(class: OpClass, triple: PrecisionTriple) -> bool {
    match class {
        OpClass::Structural => true,
        OpClass::Identity => triple.is_uniform() && triple.input.is_reduced_float(),
        _ => false,
    }
}

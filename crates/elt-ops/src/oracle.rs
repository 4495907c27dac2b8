//! Reference computation for every registered unary op.
//!
//! Traversal is column-major: `j` outer over `N`, `i` inner over `M`. The
//! stochastic-rounding sequence advances once per converted element in that
//! order, so any kernel that walks the same order sees the same draws.

use crate::{OpClass, OpKind, OperationDescriptor, OpsError, PrecisionTriple};
use elt_dtype::{
    PrecisionTag, Rounding, RoundingMode, decompose_f32_to_bf16x2, decompose_f32_to_bf16x3,
    split_u32_halves,
};
use elt_layout::{ElementBuffer, UnaryLayout};
use elt_random::StochasticRoundingState;

/// Which branch of the reference engine produced the gold output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OraclePath {
    BitwiseIdentity,
    ComputeF32,
    ComputeF64,
    Unzip,
    Decomposition,
}

impl OraclePath {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BitwiseIdentity => "bitwise_identity",
            Self::ComputeF32 => "compute_f32",
            Self::ComputeF64 => "compute_f64",
            Self::Unzip => "unzip",
            Self::Decomposition => "decomposition",
        }
    }

    /// Paths that move bits without arithmetic.
    #[must_use]
    pub const fn is_bit_exact(self) -> bool {
        matches!(
            self,
            Self::BitwiseIdentity | Self::Unzip | Self::Decomposition
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OracleRequest<'a> {
    pub descriptor: &'a OperationDescriptor,
    pub layout: UnaryLayout,
    pub triple: PrecisionTriple,
    pub rounding: RoundingMode,
}

impl OracleRequest<'_> {
    /// Chooses the reference path. Structural ops come first, then the
    /// uniform reduced-precision identity fast path, then the compute tag.
    pub fn path(&self) -> Result<OraclePath, OpsError> {
        match self.descriptor.kind {
            OpKind::Unzip => return Ok(OraclePath::Unzip),
            OpKind::Decompose { .. } => return Ok(OraclePath::Decomposition),
            OpKind::Scalar => {}
        }
        if self.descriptor.class == OpClass::Identity
            && self.triple.is_uniform()
            && self.triple.input.is_reduced_float()
        {
            return Ok(OraclePath::BitwiseIdentity);
        }
        match self.triple.compute {
            PrecisionTag::F32 => Ok(OraclePath::ComputeF32),
            PrecisionTag::F64 if self.descriptor.has_f64_semantics => Ok(OraclePath::ComputeF64),
            _ => Err(OpsError::UnsupportedPrecision {
                op: self.descriptor.name,
                triple: self.triple,
            }),
        }
    }
}

/// Fills `gold` with the reference result. `gold` is expected pre-zeroed;
/// padding rows and unused slices are never written.
pub fn compute(
    request: &OracleRequest<'_>,
    input: &ElementBuffer,
    gold: &mut ElementBuffer,
    rng: Option<&mut StochasticRoundingState>,
) -> Result<OraclePath, OpsError> {
    request
        .descriptor
        .check(request.triple, request.rounding)?;
    expect_tag("input", request.triple.input, input)?;
    expect_tag("output", request.triple.output, gold)?;

    let path = request.path()?;
    match path {
        OraclePath::BitwiseIdentity => bitwise_identity(request, input, gold)?,
        OraclePath::ComputeF32 => {
            let stochastic = match request.rounding {
                RoundingMode::Stochastic => Some(rng.ok_or(OpsError::MissingRoundingState)?),
                RoundingMode::NearestEven => None,
            };
            compute_f32(request, input, gold, stochastic)?;
        }
        OraclePath::ComputeF64 => compute_f64(request, input, gold)?,
        OraclePath::Unzip => unzip(request, input, gold)?,
        OraclePath::Decomposition => decompose(request, input, gold)?,
    }
    Ok(path)
}

fn expect_tag(
    role: &'static str,
    expected: PrecisionTag,
    buffer: &ElementBuffer,
) -> Result<(), OpsError> {
    if buffer.tag() == expected {
        Ok(())
    } else {
        Err(OpsError::BufferTagMismatch {
            role,
            expected,
            actual: buffer.tag(),
        })
    }
}

fn bitwise_identity(
    request: &OracleRequest<'_>,
    input: &ElementBuffer,
    gold: &mut ElementBuffer,
) -> Result<(), OpsError> {
    let layout = &request.layout;
    let zero_fill = request.descriptor.op == crate::UnaryOp::Xor;
    for j in 0..layout.n {
        for i in 0..layout.m {
            let bits = if zero_fill {
                0
            } else {
                input.get_bits(layout.input_index(i, j))?
            };
            gold.set_bits(layout.output_index(i, j, 0), bits)?;
        }
    }
    Ok(())
}

fn compute_f32(
    request: &OracleRequest<'_>,
    input: &ElementBuffer,
    gold: &mut ElementBuffer,
    mut stochastic: Option<&mut StochasticRoundingState>,
) -> Result<(), OpsError> {
    let layout = &request.layout;
    let op = request.descriptor.op;
    for j in 0..layout.n {
        for i in 0..layout.m {
            let x = input.get_f32(layout.input_index(i, j))?;
            let y = op.apply_f32(x);
            let rounding = match stochastic.as_mut() {
                Some(state) => Rounding::Stochastic(state.next_draw()),
                None => Rounding::NearestEven,
            };
            gold.set_f32(layout.output_index(i, j, 0), y, rounding)?;
        }
    }
    Ok(())
}

fn compute_f64(
    request: &OracleRequest<'_>,
    input: &ElementBuffer,
    gold: &mut ElementBuffer,
) -> Result<(), OpsError> {
    let layout = &request.layout;
    let op = request.descriptor.op;
    for j in 0..layout.n {
        for i in 0..layout.m {
            let x = input.get_f64(layout.input_index(i, j))?;
            let y = op.apply_f64(x).ok_or(OpsError::UnsupportedPrecision {
                op: request.descriptor.name,
                triple: request.triple,
            })?;
            gold.set_f64(layout.output_index(i, j, 0), y, Rounding::NearestEven)?;
        }
    }
    Ok(())
}

fn unzip(
    request: &OracleRequest<'_>,
    input: &ElementBuffer,
    gold: &mut ElementBuffer,
) -> Result<(), OpsError> {
    let layout = &request.layout;
    for j in 0..layout.n {
        for i in 0..layout.m {
            let bits = input.get_bits(layout.input_index(i, j))? as u32;
            let (low, high) = split_u32_halves(bits);
            gold.set_bits(layout.output_index(i, j, 0), u64::from(low))?;
            gold.set_bits(layout.output_index(i, j, 1), u64::from(high))?;
        }
    }
    Ok(())
}

fn decompose(
    request: &OracleRequest<'_>,
    input: &ElementBuffer,
    gold: &mut ElementBuffer,
) -> Result<(), OpsError> {
    let layout = &request.layout;
    let three_way = matches!(request.descriptor.kind, OpKind::Decompose { words: 3 });
    for j in 0..layout.n {
        for i in 0..layout.m {
            let x = input.get_f32(layout.input_index(i, j))?;
            let words: Vec<u16> = if three_way {
                decompose_f32_to_bf16x3(x).to_vec()
            } else {
                decompose_f32_to_bf16x2(x).to_vec()
            };
            for (slice, word) in words.into_iter().enumerate() {
                gold.set_bits(layout.output_index(i, j, slice), u64::from(word))?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{OraclePath, OracleRequest, compute};
    use crate::{PrecisionTriple, UnaryOp, descriptor};
    use elt_dtype::PrecisionTag::{self, BF8, BF16, F32, F64, HF8, Implicit, U16};
    use elt_dtype::{
        Rounding, RoundingMode, decode_bf8, decode_hf8, encode_hf8, from_canonical_f32,
        widen_bf16,
    };
    use elt_layout::{BroadcastMode, ElementBuffer, UnaryLayout};
    use elt_random::{DEFAULT_STOCHASTIC_SEED, StochasticRoundingState};
    use proptest::prelude::*;

    fn layout(m: usize, n: usize, ldi: usize, ldo: usize, op: UnaryOp) -> UnaryLayout {
        UnaryLayout::new(m, n, ldi, ldo, descriptor(op).fan_out, BroadcastMode::None)
            .expect("layout")
    }

    fn buffer_from_f32(tag: PrecisionTag, values: &[f32]) -> ElementBuffer {
        let mut buffer = ElementBuffer::zeros(tag, values.len()).expect("buffer");
        for (k, value) in values.iter().enumerate() {
            buffer
                .set_f32(k, *value, Rounding::NearestEven)
                .expect("set");
        }
        buffer
    }

    fn run(
        op: UnaryOp,
        triple: PrecisionTriple,
        layout: UnaryLayout,
        input: &ElementBuffer,
    ) -> (OraclePath, ElementBuffer) {
        let request = OracleRequest {
            descriptor: descriptor(op),
            layout,
            triple,
            rounding: RoundingMode::NearestEven,
        };
        let mut gold = ElementBuffer::zeros(triple.output, layout.output_len().expect("len"))
            .expect("gold");
        let path = compute(&request, input, &mut gold, None).expect("oracle");
        (path, gold)
    }

    #[test]
    fn square_of_small_integers() {
        let values: Vec<f32> = (1..=16).map(|v| v as f32).collect();
        let input = buffer_from_f32(F32, &values);
        let (path, gold) = run(
            UnaryOp::Square,
            PrecisionTriple::new(F32, F32, F32),
            layout(4, 4, 4, 4, UnaryOp::Square),
            &input,
        );
        assert_eq!(path, OraclePath::ComputeF32);
        for (k, value) in values.iter().enumerate() {
            assert_eq!(gold.get_f32(k).expect("gold"), value * value);
        }
    }

    #[test]
    fn uniform_bf16_copy_is_a_raw_copy_and_leaves_padding() {
        let mut input = ElementBuffer::zeros(BF16, 6).expect("input");
        for k in 0..6 {
            input.set_bits(k, 0x7FC1 + k as u64).expect("set");
        }
        let geometry = layout(2, 2, 3, 3, UnaryOp::Copy);
        let (path, gold) = run(
            UnaryOp::Copy,
            PrecisionTriple::new(BF16, BF16, BF16),
            geometry,
            &input,
        );
        assert_eq!(path, OraclePath::BitwiseIdentity);
        let bits: Vec<u64> = (0..6).map(|k| gold.get_bits(k).expect("gold")).collect();
        assert_eq!(bits, vec![0x7FC1, 0x7FC2, 0, 0x7FC4, 0x7FC5, 0]);
    }

    #[test]
    fn uniform_hf8_xor_zero_fills() {
        let input = buffer_from_f32(HF8, &[1.0, 2.0, 3.0, 4.0]);
        let (path, gold) = run(
            UnaryOp::Xor,
            PrecisionTriple::new(HF8, HF8, HF8),
            layout(2, 2, 2, 2, UnaryOp::Xor),
            &input,
        );
        assert_eq!(path, OraclePath::BitwiseIdentity);
        assert!(gold.as_bytes().iter().all(|byte| *byte == 0));
    }

    #[test]
    fn reciprocal_sqrt_into_hf8_rounds_once_from_f32() {
        let values: Vec<f32> = (0..16).map(|k| (1 + k % 20) as f32).collect();
        let input = buffer_from_f32(HF8, &values);
        let (_, gold) = run(
            UnaryOp::ReciprocalSqrt,
            PrecisionTriple::new(HF8, HF8, F32),
            layout(4, 4, 4, 4, UnaryOp::ReciprocalSqrt),
            &input,
        );
        for (k, value) in values.iter().enumerate() {
            let widened = decode_hf8(encode_hf8(*value));
            let expected = u64::from(encode_hf8(1.0 / widened.sqrt()));
            assert_eq!(gold.get_bits(k).expect("gold"), expected, "k={k}");
        }
    }

    #[test]
    fn unzip_splits_low_and_high_halves_into_slices() {
        let mut input = ElementBuffer::zeros(F32, 4).expect("input");
        let words = [0x1111_AAAA_u64, 0x2222_BBBB, 0x3333_CCCC, 0x4444_DDDD];
        for (k, word) in words.iter().enumerate() {
            input.set_bits(k, *word).expect("set");
        }
        let (path, gold) = run(
            UnaryOp::Unzip,
            PrecisionTriple::new(F32, U16, Implicit),
            layout(2, 2, 2, 2, UnaryOp::Unzip),
            &input,
        );
        assert_eq!(path, OraclePath::Unzip);
        let bits: Vec<u64> = (0..8).map(|k| gold.get_bits(k).expect("gold")).collect();
        assert_eq!(
            bits,
            vec![0xAAAA, 0xBBBB, 0xCCCC, 0xDDDD, 0x1111, 0x2222, 0x3333, 0x4444]
        );
        // Slice 1 starts ldo*N elements in, i.e. 2*ldo*N bytes.
        assert_eq!(&gold.as_bytes()[8..10], &[0x11, 0x11]);
    }

    #[test]
    fn two_way_decomposition_leaves_third_slice_zero() {
        let input = buffer_from_f32(F32, &[1.0 + 1.0e-3, -7.25]);
        let geometry = layout(1, 2, 1, 1, UnaryOp::DecompBf16x2);
        let (path, gold) = run(
            UnaryOp::DecompBf16x2,
            PrecisionTriple::new(F32, BF16, F32),
            geometry,
            &input,
        );
        assert_eq!(path, OraclePath::Decomposition);
        assert_eq!(gold.len(), 6);
        assert_eq!(gold.get_bits(4).expect("slice 2"), 0);
        assert_eq!(gold.get_bits(5).expect("slice 2"), 0);
        let rebuilt = widen_bf16(gold.get_bits(0).expect("head") as u16)
            + widen_bf16(gold.get_bits(2).expect("tail") as u16);
        assert!((rebuilt - (1.0 + 1.0e-3)).abs() < 1.0e-5);
    }

    #[test]
    fn three_way_decomposition_reconstructs_input() {
        let value = std::f32::consts::PI;
        let input = buffer_from_f32(F32, &[value]);
        let (_, gold) = run(
            UnaryOp::DecompBf16x3,
            PrecisionTriple::new(F32, BF16, F32),
            layout(1, 1, 1, 1, UnaryOp::DecompBf16x3),
            &input,
        );
        let parts: Vec<f64> = (0..3)
            .map(|k| f64::from(widen_bf16(gold.get_bits(k).expect("part") as u16)))
            .collect();
        assert_eq!(parts.iter().sum::<f64>(), f64::from(value));
    }

    #[test]
    fn f64_path_uses_double_semantics() {
        let mut input = ElementBuffer::zeros(F64, 2).expect("input");
        input.set_f64(0, 2.0, Rounding::NearestEven).expect("set");
        input.set_f64(1, 9.0, Rounding::NearestEven).expect("set");
        let (path, gold) = run(
            UnaryOp::Sqrt,
            PrecisionTriple::new(F64, F64, F64),
            layout(2, 1, 2, 2, UnaryOp::Sqrt),
            &input,
        );
        assert_eq!(path, OraclePath::ComputeF64);
        assert_eq!(gold.get_f64(0).expect("gold"), 2.0f64.sqrt());
        assert_eq!(gold.get_f64(1).expect("gold"), 3.0);
    }

    #[test]
    fn replicate_reads_column_zero_under_column_broadcast() {
        let input = buffer_from_f32(F32, &[1.0, 2.0, 9.0, 9.0, 9.0, 9.0]);
        let geometry = UnaryLayout::new(2, 3, 2, 2, 1, BroadcastMode::Column).expect("layout");
        let (_, gold) = run(
            UnaryOp::ReplicateColVar,
            PrecisionTriple::new(F32, F32, F32),
            geometry,
            &input,
        );
        let values: Vec<f32> = (0..6).map(|k| gold.get_f32(k).expect("gold")).collect();
        assert_eq!(values, vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
    }

    #[test]
    fn row_broadcast_with_short_ldi_reads_column_heads() {
        let input = buffer_from_f32(F32, &[2.0, 3.0]);
        let geometry = UnaryLayout::new(3, 2, 1, 3, 1, BroadcastMode::Row).expect("layout");
        let (_, gold) = run(
            UnaryOp::Negate,
            PrecisionTriple::new(F32, F32, F32),
            geometry,
            &input,
        );
        let values: Vec<f32> = (0..6).map(|k| gold.get_f32(k).expect("gold")).collect();
        assert_eq!(values, vec![-2.0, -2.0, -2.0, -3.0, -3.0, -3.0]);
    }

    #[test]
    fn single_element_matches_batched_origin() {
        let values = [0.3f32, 0.7, 1.9, 0.05];
        let batched = buffer_from_f32(F32, &values);
        let single = buffer_from_f32(F32, &values[..1]);
        let triple = PrecisionTriple::new(F32, BF16, F32);
        let batched_layout = layout(2, 2, 2, 2, UnaryOp::Gelu);
        let single_layout = layout(1, 1, 1, 1, UnaryOp::Gelu);
        let (_, gold_batched) = run(UnaryOp::Gelu, triple, batched_layout, &batched);
        let (_, gold_single) = run(UnaryOp::Gelu, triple, single_layout, &single);
        assert_eq!(
            gold_batched.get_bits(0).expect("batched"),
            gold_single.get_bits(0).expect("single")
        );
    }

    #[test]
    fn stochastic_bf8_output_is_reproducible_per_seed() {
        let values: Vec<f32> = (0..64).map(|k| 1.0 + k as f32 / 97.0).collect();
        let input = buffer_from_f32(F32, &values);
        let request = OracleRequest {
            descriptor: descriptor(UnaryOp::Copy),
            layout: layout(8, 8, 8, 8, UnaryOp::Copy),
            triple: PrecisionTriple::new(F32, BF8, F32),
            rounding: RoundingMode::Stochastic,
        };
        let mut first = ElementBuffer::zeros(BF8, 64).expect("first");
        let mut second = ElementBuffer::zeros(BF8, 64).expect("second");
        let mut state_a = StochasticRoundingState::new(DEFAULT_STOCHASTIC_SEED);
        let mut state_b = StochasticRoundingState::new(DEFAULT_STOCHASTIC_SEED);
        compute(&request, &input, &mut first, Some(&mut state_a)).expect("first run");
        compute(&request, &input, &mut second, Some(&mut state_b)).expect("second run");
        assert_eq!(first, second);
        assert_eq!(state_a.sequence_index(), 64);
        for k in 0..64 {
            let rounded = decode_bf8(first.get_bits(k).expect("bits") as u8);
            let exact = values[k];
            assert!((rounded - exact).abs() <= 0.25, "k={k}");
        }
    }

    #[test]
    fn stochastic_round_up_frequency_tracks_fraction() {
        // 1.0625 sits a quarter of the way from 1.0 to 1.25.
        let mut state = StochasticRoundingState::new(DEFAULT_STOCHASTIC_SEED);
        let trials = 4000;
        let ups = (0..trials)
            .filter(|_| {
                let rounding = Rounding::Stochastic(state.next_draw());
                let bits = from_canonical_f32(BF8, 1.0625, rounding).expect("encode");
                bits == 0x3D
            })
            .count();
        let frequency = ups as f64 / f64::from(trials);
        assert!((frequency - 0.25).abs() < 0.03, "frequency={frequency}");
    }

    #[test]
    fn stochastic_request_without_state_is_rejected() {
        let input = buffer_from_f32(F32, &[1.0]);
        let request = OracleRequest {
            descriptor: descriptor(UnaryOp::Copy),
            layout: layout(1, 1, 1, 1, UnaryOp::Copy),
            triple: PrecisionTriple::new(F32, BF8, F32),
            rounding: RoundingMode::Stochastic,
        };
        let mut gold = ElementBuffer::zeros(BF8, 1).expect("gold");
        let err = compute(&request, &input, &mut gold, None).expect_err("missing state");
        assert_eq!(err.reason_code(), "ops_missing_rounding_state");
    }

    #[test]
    fn mismatched_buffer_tag_is_rejected() {
        let input = buffer_from_f32(BF16, &[1.0]);
        let request = OracleRequest {
            descriptor: descriptor(UnaryOp::Exp),
            layout: layout(1, 1, 1, 1, UnaryOp::Exp),
            triple: PrecisionTriple::new(F32, F32, F32),
            rounding: RoundingMode::NearestEven,
        };
        let mut gold = ElementBuffer::zeros(F32, 1).expect("gold");
        let err = compute(&request, &input, &mut gold, None).expect_err("tag mismatch");
        assert_eq!(err.reason_code(), "ops_buffer_tag_mismatch");
    }

    proptest! {
        #[test]
        fn identity_fast_path_copies_raw_bytes(
            m in 1usize..5,
            n in 1usize..5,
            pad_in in 0usize..3,
            pad_out in 0usize..3,
            fill in any::<u8>(),
        ) {
            let geometry = layout(m, n, m + pad_in, m + pad_out, UnaryOp::Copy);
            let len = geometry.input_len().expect("len");
            let mut input = ElementBuffer::zeros(BF8, len).expect("input");
            for k in 0..len {
                input.set_bits(k, u64::from(fill.wrapping_add(k as u8))).expect("set");
            }
            let (_, gold) = run(
                UnaryOp::Copy,
                PrecisionTriple::new(BF8, BF8, BF8),
                geometry,
                &input,
            );
            for j in 0..n {
                for i in 0..(m + pad_out) {
                    let out = gold.get_bits(j * (m + pad_out) + i).expect("out");
                    if i < m {
                        prop_assert_eq!(out, input.get_bits(j * (m + pad_in) + i).expect("in"));
                    } else {
                        prop_assert_eq!(out, 0);
                    }
                }
            }
        }
    }
}

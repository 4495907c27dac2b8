//! Scalar kernels for every registered op.
//!
//! Scalar ops evaluate the same `UnaryOp` math and element conversions as the
//! reference engine, so a run against this provider checks dispatch, layout,
//! broadcast and stochastic draw order rather than the math itself. The BF16
//! decompositions are computed here on the raw f32 encoding.

use crate::{
    CapabilityClass, DispatchError, DispatchedKernel, KernelError, KernelInfo, KernelProvider,
    UnaryFlags, UnaryKernel, UnaryParam, UnaryShape,
};
use elt_dtype::{
    PrecisionTag, Rounding, from_canonical_f32, from_canonical_f64, read_bits, split_u32_halves,
    to_canonical_f32, to_canonical_f64, write_bits,
};
use elt_layout::BroadcastMode;
use elt_ops::{OpClass, OpKind, PrecisionTriple, UnaryOp};

/// Straight-line scalar kernels for every registered op. Always reported as a
/// reference kernel on the baseline class.
#[derive(Debug, Default, Clone, Copy)]
pub struct PortableProvider;

impl KernelProvider for PortableProvider {
    fn name(&self) -> &str {
        "portable"
    }

    fn dispatch(
        &self,
        op_id: u32,
        shape: &UnaryShape,
        flags: UnaryFlags,
    ) -> Result<DispatchedKernel, DispatchError> {
        let op = UnaryOp::from_id(op_id).ok_or(DispatchError::UnsupportedOperation { op_id })?;
        let descriptor = op.descriptor();
        let triple = PrecisionTriple::new(shape.input, shape.output, shape.compute);
        if !descriptor.allows(triple) {
            return Err(DispatchError::UnsupportedShape {
                op_id,
                detail: format!("{} not available for {triple}", descriptor.name),
            });
        }
        let column_count_in_param = descriptor.forces_column_broadcast;
        if shape.m == 0 || (shape.n == 0 && !column_count_in_param) {
            return Err(DispatchError::UnsupportedShape {
                op_id,
                detail: format!("empty extent {}", shape.digest()),
            });
        }
        if flags.stochastic_round && shape.output != PrecisionTag::BF8 {
            return Err(DispatchError::UnsupportedFlags {
                op_id,
                detail: format!("stochastic rounding into {}", shape.output),
            });
        }
        if column_count_in_param && flags.broadcast != BroadcastMode::Column {
            return Err(DispatchError::UnsupportedFlags {
                op_id,
                detail: "replicate_col_var needs column broadcast".to_string(),
            });
        }
        Ok(DispatchedKernel {
            kernel: Box::new(PortableKernel {
                op,
                shape: *shape,
                flags,
            }),
            info: KernelInfo {
                name: format!("portable:{}", descriptor.name),
                is_reference: true,
                capability: CapabilityClass::Baseline,
            },
        })
    }
}

struct PortableKernel {
    op: UnaryOp,
    shape: UnaryShape,
    flags: UnaryFlags,
}

impl PortableKernel {
    fn source(&self, i: usize, j: usize) -> usize {
        let ldi = self.shape.ldi;
        match self.flags.broadcast {
            BroadcastMode::None => j * ldi + i,
            BroadcastMode::Row => j * ldi,
            BroadcastMode::Column => i,
            BroadcastMode::Scalar => 0,
        }
    }

    fn raw_identity(&self, n: usize, param: UnaryParam<'_>) -> Result<(), KernelError> {
        let UnaryShape { m, ldo, input, .. } = self.shape;
        for j in 0..n {
            for i in 0..m {
                let bits = match self.op {
                    UnaryOp::Xor => 0,
                    _ => read_bits(input, param.input, self.source(i, j))?,
                };
                write_bits(input, param.output, j * ldo + i, bits)?;
            }
        }
        Ok(())
    }

    fn scalar_f32(&self, n: usize, param: UnaryParam<'_>) -> Result<(), KernelError> {
        let UnaryShape {
            m,
            ldo,
            input,
            output,
            ..
        } = self.shape;
        let mut rng = if self.flags.stochastic_round {
            Some(param.rng_state.ok_or(KernelError::MissingParam("rng_state"))?)
        } else {
            None
        };
        for j in 0..n {
            for i in 0..m {
                let raw = read_bits(input, param.input, self.source(i, j))?;
                let y = self.op.apply_f32(to_canonical_f32(input, raw)?);
                let rounding = match rng.as_mut() {
                    Some(state) => Rounding::Stochastic(state.next_draw()),
                    None => Rounding::NearestEven,
                };
                let bits = from_canonical_f32(output, y, rounding)?;
                write_bits(output, param.output, j * ldo + i, bits)?;
            }
        }
        Ok(())
    }

    fn scalar_f64(&self, n: usize, param: UnaryParam<'_>) -> Result<(), KernelError> {
        let UnaryShape {
            m,
            ldo,
            input,
            output,
            ..
        } = self.shape;
        for j in 0..n {
            for i in 0..m {
                let raw = read_bits(input, param.input, self.source(i, j))?;
                let x = to_canonical_f64(input, raw)?;
                let y = self.op.apply_f64(x).ok_or_else(|| KernelError::Execution {
                    detail: format!("{} has no f64 form", self.op.descriptor().name),
                })?;
                let bits = from_canonical_f64(output, y, Rounding::NearestEven)?;
                write_bits(output, param.output, j * ldo + i, bits)?;
            }
        }
        Ok(())
    }

    fn unzip(&self, param: UnaryParam<'_>) -> Result<(), KernelError> {
        let UnaryShape {
            m,
            n,
            ldo,
            input,
            output,
            ..
        } = self.shape;
        let offset_bytes = param
            .out_offset_bytes
            .ok_or(KernelError::MissingParam("out_offset_bytes"))?;
        let high_base = offset_bytes / output.item_size();
        for j in 0..n {
            for i in 0..m {
                let word = read_bits(input, param.input, self.source(i, j))? as u32;
                let (low, high) = split_u32_halves(word);
                write_bits(output, param.output, j * ldo + i, u64::from(low))?;
                write_bits(output, param.output, high_base + j * ldo + i, u64::from(high))?;
            }
        }
        Ok(())
    }

    fn decompose(&self, words: usize, param: UnaryParam<'_>) -> Result<(), KernelError> {
        let UnaryShape {
            m,
            n,
            ldo,
            input,
            output,
            ..
        } = self.shape;
        let strides = param
            .out_strides_bytes
            .ok_or(KernelError::MissingParam("out_strides_bytes"))?;
        let width = output.item_size();
        let bases = [0, strides[0] / width, strides[1] / width];
        for j in 0..n {
            for i in 0..m {
                let raw = read_bits(input, param.input, self.source(i, j))?;
                let x = to_canonical_f32(input, raw)?;
                let parts = if words == 3 {
                    split_bf16x3(x)
                } else {
                    let [head, tail] = split_bf16x2(x);
                    [head, tail, 0]
                };
                for (base, part) in bases.iter().zip(parts).take(words) {
                    write_bits(output, param.output, base + j * ldo + i, u64::from(part))?;
                }
            }
        }
        Ok(())
    }
}

/// Upper half of the encoding, with the f32 it stands for.
fn bf16_head(x: f32) -> (u16, f32) {
    let head = (x.to_bits() >> 16) as u16;
    (head, f32::from_bits(u32::from(head) << 16))
}

fn bf16_nearest_even(x: f32) -> u16 {
    let bits = x.to_bits();
    if x.is_nan() {
        return (bits >> 16) as u16 | 0x0040;
    }
    let lsb = (bits >> 16) & 1;
    ((bits + 0x7FFF + lsb) >> 16) as u16
}

fn split_bf16x2(x: f32) -> [u16; 2] {
    let (head, covered) = bf16_head(x);
    [head, bf16_nearest_even(x - covered)]
}

fn split_bf16x3(x: f32) -> [u16; 3] {
    let (head, covered) = bf16_head(x);
    let rest = x - covered;
    let (middle, covered_rest) = bf16_head(rest);
    [head, middle, bf16_nearest_even(rest - covered_rest)]
}

impl UnaryKernel for PortableKernel {
    fn execute(&self, param: UnaryParam<'_>) -> Result<(), KernelError> {
        let descriptor = self.op.descriptor();
        let n = if descriptor.forces_column_broadcast {
            param
                .replicate_cols
                .ok_or(KernelError::MissingParam("replicate_cols"))?
        } else {
            self.shape.n
        };
        let UnaryShape {
            input,
            output,
            compute,
            ..
        } = self.shape;
        let triple = PrecisionTriple::new(input, output, compute);
        match descriptor.kind {
            OpKind::Unzip => self.unzip(param),
            OpKind::Decompose { words } => self.decompose(words, param),
            OpKind::Scalar => {
                if descriptor.class == OpClass::Identity
                    && triple.is_uniform()
                    && triple.input.is_reduced_float()
                {
                    self.raw_identity(n, param)
                } else if triple.compute == PrecisionTag::F64 {
                    self.scalar_f64(n, param)
                } else {
                    self.scalar_f32(n, param)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{bf16_nearest_even, split_bf16x2, split_bf16x3};
    use elt_dtype::{decompose_f32_to_bf16x2, decompose_f32_to_bf16x3};
    use elt_random::ValueStream;

    #[test]
    fn nearest_even_breaks_ties_toward_even() {
        assert_eq!(bf16_nearest_even(f32::from_bits(0x3F80_8000)), 0x3F80);
        assert_eq!(bf16_nearest_even(f32::from_bits(0x3F81_8000)), 0x3F82);
        assert_eq!(bf16_nearest_even(f32::from_bits(0x3F80_8001)), 0x3F81);
        assert_eq!(bf16_nearest_even(f32::MAX), 0x7F80);
        assert_eq!(bf16_nearest_even(f32::from_bits(0x7F80_0001)), 0x7FC0);
    }

    #[test]
    fn bit_level_splits_match_library_decomposition() {
        let mut stream = ValueStream::new(7);
        let specials = [
            0.0f32,
            -0.0,
            1.0,
            -1.5,
            std::f32::consts::PI,
            1.0e-40,
            f32::MIN_POSITIVE,
            f32::MAX,
            f32::INFINITY,
            f32::NEG_INFINITY,
        ];
        let sweep = (0..512).map(|_| f32::from_bits(stream.next_u32()));
        for x in specials.into_iter().chain(sweep) {
            if x.is_nan() {
                continue;
            }
            assert_eq!(split_bf16x2(x), decompose_f32_to_bf16x2(x), "x2 of {x:e}");
            assert_eq!(split_bf16x3(x), decompose_f32_to_bf16x3(x), "x3 of {x:e}");
        }
    }
}

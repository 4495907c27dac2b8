#![forbid(unsafe_code)]

use half::{bf16, f16};

pub const DTYPE_REASON_CODES: [&str; 3] = [
    "dtype_conversion_unsupported",
    "dtype_stochastic_target_invalid",
    "dtype_element_out_of_bounds",
];

/// Element formats a unary kernel can read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrecisionTag {
    F64,
    F32,
    F16,
    BF16,
    /// 8-bit E5M2, bit-identical to the upper byte of an IEEE binary16.
    BF8,
    /// 8-bit E4M3, bias 7, all-ones exponent reserved for inf/NaN.
    HF8,
    I32,
    U32,
    U16,
    /// Compute tag of structural ops that never convert values.
    Implicit,
}

impl PrecisionTag {
    pub const ALL: [Self; 10] = [
        Self::F64,
        Self::F32,
        Self::F16,
        Self::BF16,
        Self::BF8,
        Self::HF8,
        Self::I32,
        Self::U32,
        Self::U16,
        Self::Implicit,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::F64 => "F64",
            Self::F32 => "F32",
            Self::F16 => "F16",
            Self::BF16 => "BF16",
            Self::BF8 => "BF8",
            Self::HF8 => "HF8",
            Self::I32 => "I32",
            Self::U32 => "U32",
            Self::U16 => "U16",
            Self::Implicit => "IMPLICIT",
        }
    }

    #[must_use]
    pub const fn item_size(self) -> usize {
        match self {
            Self::F64 => 8,
            Self::F32 | Self::I32 | Self::U32 => 4,
            Self::F16 | Self::BF16 | Self::U16 => 2,
            Self::BF8 | Self::HF8 => 1,
            Self::Implicit => 0,
        }
    }

    /// Case-insensitive parse of the command-line spelling.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "F64" => Some(Self::F64),
            "F32" => Some(Self::F32),
            "F16" => Some(Self::F16),
            "BF16" => Some(Self::BF16),
            "BF8" => Some(Self::BF8),
            "HF8" => Some(Self::HF8),
            "I32" => Some(Self::I32),
            "U32" => Some(Self::U32),
            "U16" => Some(Self::U16),
            "IMPLICIT" => Some(Self::Implicit),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(
            self,
            Self::F64 | Self::F32 | Self::F16 | Self::BF16 | Self::BF8 | Self::HF8
        )
    }

    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(self, Self::I32 | Self::U32 | Self::U16)
    }

    /// Sub-f32 float formats.
    #[must_use]
    pub const fn is_reduced_float(self) -> bool {
        matches!(self, Self::F16 | Self::BF16 | Self::BF8 | Self::HF8)
    }

    /// Formats with fewer than 8 significand bits.
    #[must_use]
    pub const fn is_reduced_mantissa(self) -> bool {
        matches!(self, Self::BF16 | Self::BF8 | Self::HF8)
    }

    #[must_use]
    pub const fn is_eight_bit(self) -> bool {
        matches!(self, Self::BF8 | Self::HF8)
    }

    /// Ordering of float formats by stored significand bits; 0 for non-float tags.
    #[must_use]
    pub const fn fidelity_rank(self) -> u8 {
        match self {
            Self::F64 => 6,
            Self::F32 => 5,
            Self::F16 => 4,
            Self::BF16 => 3,
            Self::HF8 => 2,
            Self::BF8 => 1,
            Self::I32 | Self::U32 | Self::U16 | Self::Implicit => 0,
        }
    }
}

impl std::fmt::Display for PrecisionTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Rounding requested for an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoundingMode {
    NearestEven,
    Stochastic,
}

impl RoundingMode {
    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::NearestEven),
            1 => Some(Self::Stochastic),
            _ => None,
        }
    }

    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::NearestEven => 0,
            Self::Stochastic => 1,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NearestEven => "nearest_even",
            Self::Stochastic => "stochastic",
        }
    }
}

/// Rounding applied to one narrowing conversion. The stochastic variant carries
/// the random draw consumed by that element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    NearestEven,
    Stochastic(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DTypeError {
    ConversionUnsupported { tag: PrecisionTag },
    StochasticTarget { tag: PrecisionTag },
    ElementOutOfBounds { index: usize, len: usize },
}

impl DTypeError {
    #[must_use]
    pub const fn reason_code(self) -> &'static str {
        match self {
            Self::ConversionUnsupported { .. } => "dtype_conversion_unsupported",
            Self::StochasticTarget { .. } => "dtype_stochastic_target_invalid",
            Self::ElementOutOfBounds { .. } => "dtype_element_out_of_bounds",
        }
    }
}

impl std::fmt::Display for DTypeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConversionUnsupported { tag } => {
                write!(f, "{tag} has no floating-point conversion")
            }
            Self::StochasticTarget { tag } => {
                write!(f, "stochastic rounding is only defined for BF8 output, got {tag}")
            }
            Self::ElementOutOfBounds { index, len } => {
                write!(f, "element index {index} out of bounds for {len} elements")
            }
        }
    }
}

impl std::error::Error for DTypeError {}

/// An 8-bit IEEE-style float: one sign bit, `exponent_bits` exponent bits with
/// the all-ones exponent reserved for inf/NaN, and `mantissa_bits` stored bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MiniFloatFormat {
    pub exponent_bits: u32,
    pub mantissa_bits: u32,
}

impl MiniFloatFormat {
    pub const E5M2: Self = Self {
        exponent_bits: 5,
        mantissa_bits: 2,
    };
    pub const E4M3: Self = Self {
        exponent_bits: 4,
        mantissa_bits: 3,
    };

    #[must_use]
    pub const fn bias(self) -> i32 {
        (1 << (self.exponent_bits - 1)) - 1
    }

    const fn exponent_mask(self) -> u32 {
        (1 << self.exponent_bits) - 1
    }

    #[must_use]
    pub fn max_finite(self) -> f32 {
        let top = ((self.exponent_mask() - 1) << self.mantissa_bits)
            | ((1 << self.mantissa_bits) - 1);
        self.decode(top as u8)
    }

    /// Narrows an f32 in one rounding step.
    #[must_use]
    pub fn encode(self, value: f32, rounding: Rounding) -> u8 {
        let m = self.mantissa_bits;
        let bits = value.to_bits();
        let sign = ((bits >> 31) as u8) << 7;
        let inf = (self.exponent_mask() << m) as u8;
        if value.is_nan() {
            return sign | inf | (1 << (m - 1)) as u8;
        }
        if value.is_infinite() {
            return sign | inf;
        }
        let exponent_field = (bits >> 23) & 0xff;
        if exponent_field == 0 {
            // f32 subnormals sit far below the smallest 8-bit subnormal.
            return sign;
        }

        let unbiased = exponent_field as i32 - 127;
        let significand = u64::from((bits & 0x7f_ffff) | 0x80_0000);
        let bias = self.bias();
        let (base, shift) = if unbiased >= 1 - bias {
            (((unbiased + bias - 1) as u64) << m, 23 - m)
        } else {
            (0, 23 - m + (1 - bias - unbiased) as u32)
        };
        let shift = shift.min(62);
        let mask = (1u64 << shift) - 1;
        let quantum = match rounding {
            Rounding::NearestEven => {
                let truncated = significand >> shift;
                let remainder = significand & mask;
                let half = 1u64 << (shift - 1);
                if remainder > half || (remainder == half && truncated & 1 == 1) {
                    truncated + 1
                } else {
                    truncated
                }
            }
            Rounding::Stochastic(draw) => (significand + (draw & mask)) >> shift,
        };

        let encoded = base + quantum;
        if encoded >= u64::from(inf) {
            return sign | inf;
        }
        sign | encoded as u8
    }

    #[must_use]
    pub fn decode(self, bits: u8) -> f32 {
        let m = self.mantissa_bits;
        let negative = bits & 0x80 != 0;
        let exponent = (u32::from(bits) >> m) & self.exponent_mask();
        let fraction = u32::from(bits) & ((1 << m) - 1);
        let magnitude = if exponent == self.exponent_mask() {
            if fraction == 0 { f32::INFINITY } else { f32::NAN }
        } else if exponent == 0 {
            fraction as f32 * 2f32.powi(1 - self.bias() - m as i32)
        } else {
            let biased = (exponent as i32 - self.bias() + 127) as u32;
            f32::from_bits((biased << 23) | (fraction << (23 - m)))
        };
        if negative { -magnitude } else { magnitude }
    }
}

#[must_use]
pub fn decode_bf8(bits: u8) -> f32 {
    f16::from_bits(u16::from(bits) << 8).to_f32()
}

#[must_use]
pub fn encode_bf8(value: f32, rounding: Rounding) -> u8 {
    MiniFloatFormat::E5M2.encode(value, rounding)
}

#[must_use]
pub fn decode_hf8(bits: u8) -> f32 {
    MiniFloatFormat::E4M3.decode(bits)
}

#[must_use]
pub fn encode_hf8(value: f32) -> u8 {
    MiniFloatFormat::E4M3.encode(value, Rounding::NearestEven)
}

/// Widens a raw element of `tag` to f32.
pub fn to_canonical_f32(tag: PrecisionTag, bits: u64) -> Result<f32, DTypeError> {
    match tag {
        PrecisionTag::F64 => Ok(f64::from_bits(bits) as f32),
        PrecisionTag::F32 => Ok(f32::from_bits(bits as u32)),
        PrecisionTag::F16 => Ok(f16::from_bits(bits as u16).to_f32()),
        PrecisionTag::BF16 => Ok(bf16::from_bits(bits as u16).to_f32()),
        PrecisionTag::BF8 => Ok(decode_bf8(bits as u8)),
        PrecisionTag::HF8 => Ok(decode_hf8(bits as u8)),
        PrecisionTag::I32 | PrecisionTag::U32 | PrecisionTag::U16 | PrecisionTag::Implicit => {
            Err(DTypeError::ConversionUnsupported { tag })
        }
    }
}

/// Narrows an f32 into a raw element of `tag`.
pub fn from_canonical_f32(
    tag: PrecisionTag,
    value: f32,
    rounding: Rounding,
) -> Result<u64, DTypeError> {
    if matches!(rounding, Rounding::Stochastic(_)) && tag != PrecisionTag::BF8 {
        return Err(DTypeError::StochasticTarget { tag });
    }
    match tag {
        PrecisionTag::F64 => Ok(f64::from(value).to_bits()),
        PrecisionTag::F32 => Ok(u64::from(value.to_bits())),
        PrecisionTag::F16 => Ok(u64::from(f16::from_f32(value).to_bits())),
        PrecisionTag::BF16 => Ok(u64::from(bf16::from_f32(value).to_bits())),
        PrecisionTag::BF8 => Ok(u64::from(encode_bf8(value, rounding))),
        PrecisionTag::HF8 => Ok(u64::from(encode_hf8(value))),
        PrecisionTag::I32 | PrecisionTag::U32 | PrecisionTag::U16 | PrecisionTag::Implicit => {
            Err(DTypeError::ConversionUnsupported { tag })
        }
    }
}

pub fn to_canonical_f64(tag: PrecisionTag, bits: u64) -> Result<f64, DTypeError> {
    match tag {
        PrecisionTag::F64 => Ok(f64::from_bits(bits)),
        PrecisionTag::U16 => Ok(f64::from(bits as u16)),
        PrecisionTag::U32 => Ok(f64::from(bits as u32)),
        PrecisionTag::I32 => Ok(f64::from(bits as u32 as i32)),
        _ => to_canonical_f32(tag, bits).map(f64::from),
    }
}

pub fn from_canonical_f64(
    tag: PrecisionTag,
    value: f64,
    rounding: Rounding,
) -> Result<u64, DTypeError> {
    match tag {
        PrecisionTag::F64 => {
            if matches!(rounding, Rounding::Stochastic(_)) {
                return Err(DTypeError::StochasticTarget { tag });
            }
            Ok(value.to_bits())
        }
        _ => from_canonical_f32(tag, value as f32, rounding),
    }
}

/// Reads element `index` of a little-endian buffer of `tag` elements.
pub fn read_bits(tag: PrecisionTag, bytes: &[u8], index: usize) -> Result<u64, DTypeError> {
    let slot = element_range(tag, bytes.len(), index)?;
    let mut raw = [0u8; 8];
    raw[..slot.len()].copy_from_slice(&bytes[slot]);
    Ok(u64::from_le_bytes(raw))
}

/// Writes the low `item_size` bytes of `bits` into element `index`.
pub fn write_bits(
    tag: PrecisionTag,
    bytes: &mut [u8],
    index: usize,
    bits: u64,
) -> Result<(), DTypeError> {
    let slot = element_range(tag, bytes.len(), index)?;
    let width = slot.len();
    bytes[slot].copy_from_slice(&bits.to_le_bytes()[..width]);
    Ok(())
}

fn element_range(
    tag: PrecisionTag,
    byte_len: usize,
    index: usize,
) -> Result<std::ops::Range<usize>, DTypeError> {
    let size = tag.item_size();
    if size == 0 {
        return Err(DTypeError::ConversionUnsupported { tag });
    }
    let len = byte_len / size;
    if index >= len {
        return Err(DTypeError::ElementOutOfBounds { index, len });
    }
    let start = index * size;
    Ok(start..start + size)
}

/// Top 16 bits of an f32, i.e. bf16 by truncation.
#[must_use]
pub const fn truncate_to_bf16(value: f32) -> u16 {
    (value.to_bits() >> 16) as u16
}

#[must_use]
pub const fn widen_bf16(bits: u16) -> f32 {
    f32::from_bits((bits as u32) << 16)
}

/// Splits `x` into a truncated head and a nearest-even rounded residual.
#[must_use]
pub fn decompose_f32_to_bf16x2(value: f32) -> [u16; 2] {
    let head = truncate_to_bf16(value);
    let residual = value - widen_bf16(head);
    [head, bf16::from_f32(residual).to_bits()]
}

/// Three-way split: two truncated words and a nearest-even rounded tail.
#[must_use]
pub fn decompose_f32_to_bf16x3(value: f32) -> [u16; 3] {
    let head = truncate_to_bf16(value);
    let first = value - widen_bf16(head);
    let middle = truncate_to_bf16(first);
    let second = first - widen_bf16(middle);
    [head, middle, bf16::from_f32(second).to_bits()]
}

/// Returns `(low, high)` 16-bit halves.
#[must_use]
pub const fn split_u32_halves(bits: u32) -> (u16, u16) {
    (bits as u16, (bits >> 16) as u16)
}

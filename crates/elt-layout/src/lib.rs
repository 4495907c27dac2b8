#![forbid(unsafe_code)]

use elt_dtype::{
    DTypeError, PrecisionTag, Rounding, from_canonical_f32, from_canonical_f64, read_bits,
    to_canonical_f32, to_canonical_f64, write_bits,
};

pub const LAYOUT_REASON_CODES: [&str; 5] = [
    "layout_zero_extent",
    "layout_leading_dimension_too_small",
    "layout_size_overflow",
    "layout_unknown_broadcast",
    "layout_element_access_failed",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutError {
    ZeroExtent {
        rows: usize,
        cols: usize,
    },
    LeadingDimensionTooSmall {
        role: &'static str,
        ld: usize,
        rows: usize,
    },
    SizeOverflow,
    UnknownBroadcast(u32),
    Element(DTypeError),
}

impl LayoutError {
    #[must_use]
    pub const fn reason_code(self) -> &'static str {
        match self {
            Self::ZeroExtent { .. } => "layout_zero_extent",
            Self::LeadingDimensionTooSmall { .. } => "layout_leading_dimension_too_small",
            Self::SizeOverflow => "layout_size_overflow",
            Self::UnknownBroadcast(_) => "layout_unknown_broadcast",
            Self::Element(_) => "layout_element_access_failed",
        }
    }
}

impl std::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ZeroExtent { rows, cols } => {
                write!(f, "matrix extents must be positive, got {rows}x{cols}")
            }
            Self::LeadingDimensionTooSmall { role, ld, rows } => {
                write!(f, "{role}={ld} is smaller than M={rows}")
            }
            Self::SizeOverflow => write!(f, "buffer size overflowed usize"),
            Self::UnknownBroadcast(code) => write!(f, "unknown broadcast code {code}"),
            Self::Element(err) => write!(f, "element access failed: {err}"),
        }
    }
}

impl std::error::Error for LayoutError {}

impl From<DTypeError> for LayoutError {
    fn from(err: DTypeError) -> Self {
        Self::Element(err)
    }
}

/// Input broadcast applied before either side computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BroadcastMode {
    None,
    /// Every row repeats row 0: `in[j*ld + i] = in[j*ld]`.
    Row,
    /// Every column repeats column 0: `in[j*ld + i] = in[i]`.
    Column,
    Scalar,
}

impl BroadcastMode {
    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::Row),
            2 => Some(Self::Column),
            3 => Some(Self::Scalar),
            _ => None,
        }
    }

    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Row => 1,
            Self::Column => 2,
            Self::Scalar => 3,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Row => "row",
            Self::Column => "column",
            Self::Scalar => "scalar",
        }
    }

    /// Row and scalar broadcast only ever read the first element of a column.
    #[must_use]
    pub const fn allows_short_leading_dimension(self) -> bool {
        matches!(self, Self::Row | Self::Scalar)
    }

    /// Storage index holding the value element `(i, j)` observes.
    #[must_use]
    pub const fn source_index(self, i: usize, j: usize, ld: usize) -> usize {
        match self {
            Self::None => j * ld + i,
            Self::Row => j * ld,
            Self::Column => i,
            Self::Scalar => 0,
        }
    }
}

/// Column-major `rows x cols` view with leading dimension `ld`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatrixLayout {
    pub rows: usize,
    pub cols: usize,
    pub ld: usize,
}

impl MatrixLayout {
    pub fn new(rows: usize, cols: usize, ld: usize) -> Result<Self, LayoutError> {
        if rows == 0 || cols == 0 {
            return Err(LayoutError::ZeroExtent { rows, cols });
        }
        if ld < rows {
            return Err(LayoutError::LeadingDimensionTooSmall {
                role: "ld",
                ld,
                rows,
            });
        }
        Ok(Self { rows, cols, ld })
    }

    #[must_use]
    pub const fn index(self, i: usize, j: usize) -> usize {
        j * self.ld + i
    }

    pub fn storage_len(self) -> Result<usize, LayoutError> {
        self.ld
            .checked_mul(self.cols)
            .ok_or(LayoutError::SizeOverflow)
    }
}

/// Geometry of one unary invocation: `M x N` logical elements read through
/// `ldi` and written through `ldo` into `fan_out` consecutive output slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnaryLayout {
    pub m: usize,
    pub n: usize,
    pub ldi: usize,
    pub ldo: usize,
    pub fan_out: usize,
    pub broadcast: BroadcastMode,
}

impl UnaryLayout {
    pub fn new(
        m: usize,
        n: usize,
        ldi: usize,
        ldo: usize,
        fan_out: usize,
        broadcast: BroadcastMode,
    ) -> Result<Self, LayoutError> {
        if m == 0 || n == 0 {
            return Err(LayoutError::ZeroExtent { rows: m, cols: n });
        }
        if ldi == 0 || (ldi < m && !broadcast.allows_short_leading_dimension()) {
            return Err(LayoutError::LeadingDimensionTooSmall {
                role: "ldi",
                ld: ldi,
                rows: m,
            });
        }
        if ldo < m {
            return Err(LayoutError::LeadingDimensionTooSmall {
                role: "ldo",
                ld: ldo,
                rows: m,
            });
        }
        let layout = Self {
            m,
            n,
            ldi,
            ldo,
            fan_out: fan_out.max(1),
            broadcast,
        };
        layout.input_len()?;
        layout.output_len()?;
        Ok(layout)
    }

    pub fn input_len(&self) -> Result<usize, LayoutError> {
        self.ldi
            .checked_mul(self.n)
            .ok_or(LayoutError::SizeOverflow)
    }

    pub fn output_len(&self) -> Result<usize, LayoutError> {
        self.slice_len()?
            .checked_mul(self.fan_out)
            .ok_or(LayoutError::SizeOverflow)
    }

    pub fn slice_len(&self) -> Result<usize, LayoutError> {
        self.ldo
            .checked_mul(self.n)
            .ok_or(LayoutError::SizeOverflow)
    }

    #[must_use]
    pub const fn output_cols(&self) -> usize {
        self.n * self.fan_out
    }

    #[must_use]
    pub const fn input_index(&self, i: usize, j: usize) -> usize {
        self.broadcast.source_index(i, j, self.ldi)
    }

    #[must_use]
    pub const fn output_index(&self, i: usize, j: usize, slice: usize) -> usize {
        slice * self.ldo * self.n + j * self.ldo + i
    }

    #[must_use]
    pub const fn output_matrix(&self) -> MatrixLayout {
        MatrixLayout {
            rows: self.m,
            cols: self.n * self.fan_out,
            ld: self.ldo,
        }
    }
}

/// Owned little-endian storage for elements of one precision tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementBuffer {
    tag: PrecisionTag,
    bytes: Vec<u8>,
}

impl ElementBuffer {
    pub fn zeros(tag: PrecisionTag, len: usize) -> Result<Self, LayoutError> {
        if tag.item_size() == 0 {
            return Err(DTypeError::ConversionUnsupported { tag }.into());
        }
        let byte_len = len
            .checked_mul(tag.item_size())
            .ok_or(LayoutError::SizeOverflow)?;
        Ok(Self {
            tag,
            bytes: vec![0; byte_len],
        })
    }

    #[must_use]
    pub const fn tag(&self) -> PrecisionTag {
        self.tag
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len() / self.tag.item_size().max(1)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn get_bits(&self, index: usize) -> Result<u64, LayoutError> {
        Ok(read_bits(self.tag, &self.bytes, index)?)
    }

    pub fn set_bits(&mut self, index: usize, bits: u64) -> Result<(), LayoutError> {
        Ok(write_bits(self.tag, &mut self.bytes, index, bits)?)
    }

    pub fn get_f32(&self, index: usize) -> Result<f32, LayoutError> {
        Ok(to_canonical_f32(self.tag, self.get_bits(index)?)?)
    }

    pub fn get_f64(&self, index: usize) -> Result<f64, LayoutError> {
        Ok(to_canonical_f64(self.tag, self.get_bits(index)?)?)
    }

    pub fn set_f32(
        &mut self,
        index: usize,
        value: f32,
        rounding: Rounding,
    ) -> Result<(), LayoutError> {
        let bits = from_canonical_f32(self.tag, value, rounding)?;
        self.set_bits(index, bits)
    }

    pub fn set_f64(
        &mut self,
        index: usize,
        value: f64,
        rounding: Rounding,
    ) -> Result<(), LayoutError> {
        let bits = from_canonical_f64(self.tag, value, rounding)?;
        self.set_bits(index, bits)
    }
}

/// Rewrites the input in place so every element holds the value its
/// broadcast source holds. Running it twice changes nothing.
pub fn apply_broadcast(
    layout: &UnaryLayout,
    input: &mut ElementBuffer,
) -> Result<(), LayoutError> {
    let UnaryLayout { m, n, ldi, .. } = *layout;
    match layout.broadcast {
        BroadcastMode::None => {}
        BroadcastMode::Row => {
            for j in 0..n {
                let source = input.get_bits(j * ldi)?;
                for i in 1..m.min(ldi) {
                    input.set_bits(j * ldi + i, source)?;
                }
            }
        }
        BroadcastMode::Column => {
            for j in 1..n {
                for i in 0..m {
                    let source = input.get_bits(i)?;
                    input.set_bits(j * ldi + i, source)?;
                }
            }
        }
        BroadcastMode::Scalar => {
            let source = input.get_bits(0)?;
            for j in 0..n {
                for i in 0..m.min(ldi) {
                    input.set_bits(j * ldi + i, source)?;
                }
            }
        }
    }
    Ok(())
}

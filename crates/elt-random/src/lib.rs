#![forbid(unsafe_code)]

//! Positional random draws. Every value is a pure function of a seed and a
//! position, so gold and test runs replay the same sequence without sharing
//! state.

/// Seed for matrix initialization.
pub const DEFAULT_MATRIX_SEED: u64 = 1;
/// Seed shared by the gold and test stochastic-rounding states.
pub const DEFAULT_STOCHASTIC_SEED: u64 = 555;

const POSITION_STRIDE: u64 = 0xD1B5_4A32_D192_ED03;

/// The draw at `position` of the stream keyed by `seed`.
#[must_use]
pub fn draw(seed: u64, position: u64) -> u64 {
    let mut x = seed ^ position.wrapping_add(1).wrapping_mul(POSITION_STRIDE);
    x ^= x >> 33;
    x = x.wrapping_mul(0xFF51_AFD7_ED55_8CCD);
    x ^= x >> 33;
    x = x.wrapping_mul(0xC4CE_B9FE_1A85_EC53);
    x ^ (x >> 33)
}

/// Sequential reader over the draws of one seed, used to fill input
/// matrices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueStream {
    seed: u64,
    position: u64,
}

impl ValueStream {
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self { seed, position: 0 }
    }

    #[must_use]
    pub const fn position(self) -> u64 {
        self.position
    }

    #[must_use]
    pub fn next_u64(&mut self) -> u64 {
        let value = draw(self.seed, self.position);
        self.position = self.position.wrapping_add(1);
        value
    }

    #[must_use]
    pub fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    /// Uniform in [0, 1) from the high 53 bits.
    #[must_use]
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Uniform in [0, 1) from the high 24 bits.
    #[must_use]
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u64() >> 40) as f32 / (1u32 << 24) as f32
    }
}

/// Per-invocation source of stochastic-rounding draws. Gold and test each
/// build their own state from the same seed; the draw for the `k`-th rounded
/// element depends only on `(seed, k)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StochasticRoundingState {
    seed: u64,
    sequence_index: u64,
}

impl StochasticRoundingState {
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self {
            seed,
            sequence_index: 0,
        }
    }

    #[must_use]
    pub const fn seed(self) -> u64 {
        self.seed
    }

    #[must_use]
    pub const fn sequence_index(self) -> u64 {
        self.sequence_index
    }

    #[must_use]
    pub fn draw_at(self, sequence_index: u64) -> u64 {
        draw(self.seed, sequence_index)
    }

    #[must_use]
    pub fn next_draw(&mut self) -> u64 {
        let value = self.draw_at(self.sequence_index);
        self.sequence_index = self.sequence_index.wrapping_add(1);
        value
    }
}

impl Default for StochasticRoundingState {
    fn default() -> Self {
        Self::new(DEFAULT_STOCHASTIC_SEED)
    }
}

//! Lightweight wrapper for 4-D tensor shapes and offset arithmetic.

use std::fmt;
use std::ops::{Add, AddAssign, Index, IndexMut};

/// A 4-D tensor shape in NHWC order (batch, height, width, channels).
///
/// Also used for DMA offsets into a larger logical tensor, which is why it
/// supports element-wise addition.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorShape(pub [u32; 4]);

impl TensorShape {
    pub const ZERO: TensorShape = TensorShape([0, 0, 0, 0]);

    pub fn new(batch: u32, height: u32, width: u32, channels: u32) -> Self {
        TensorShape([batch, height, width, channels])
    }

    pub fn batch(&self) -> u32 {
        self.0[0]
    }

    pub fn height(&self) -> u32 {
        self.0[1]
    }

    pub fn width(&self) -> u32 {
        self.0[2]
    }

    pub fn channels(&self) -> u32 {
        self.0[3]
    }

    /// Computes the total number of elements implied by the shape.
    pub fn num_elements(&self) -> u64 {
        self.0.iter().map(|&d| u64::from(d)).product()
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl Index<usize> for TensorShape {
    type Output = u32;

    fn index(&self, axis: usize) -> &u32 {
        &self.0[axis]
    }
}

impl IndexMut<usize> for TensorShape {
    fn index_mut(&mut self, axis: usize) -> &mut u32 {
        &mut self.0[axis]
    }
}

impl Add for TensorShape {
    type Output = TensorShape;

    fn add(self, rhs: TensorShape) -> TensorShape {
        TensorShape([
            self.0[0] + rhs.0[0],
            self.0[1] + rhs.0[1],
            self.0[2] + rhs.0[2],
            self.0[3] + rhs.0[3],
        ])
    }
}

impl AddAssign for TensorShape {
    fn add_assign(&mut self, rhs: TensorShape) {
        *self = *self + rhs;
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}x{}x{}",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

//! Floating-point element types the solver can run in.

use std::fmt::{Debug, Display};
use std::iter::Sum;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub};

/// A real floating-point format usable as working or preconditioner precision.
///
/// Conversions go through `f64` with plain `as` casts: widening is exact and
/// narrowing rounds to nearest (overflowing to infinity), never rescales.
pub trait Scalar:
    Copy
    + Default
    + Send
    + Sync
    + PartialOrd
    + Debug
    + Display
    + bytemuck::Pod
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + AddAssign
    + Sum
    + 'static
{
    const ZERO: Self;
    const ONE: Self;
    const NAME: &'static str;

    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;

    /// Convert between formats.
    #[inline]
    fn cast<S: Scalar>(self) -> S {
        S::from_f64(self.to_f64())
    }
}

impl Scalar for f64 {
    const ZERO: Self = 0.0;
    const ONE: Self = 1.0;
    const NAME: &'static str = "f64";

    #[inline]
    fn from_f64(v: f64) -> Self {
        v
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self
    }
}

impl Scalar for f32 {
    const ZERO: Self = 0.0;
    const ONE: Self = 1.0;
    const NAME: &'static str = "f32";

    #[inline]
    fn from_f64(v: f64) -> Self {
        v as f32
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrowing_overflows_to_infinity() {
        let big = 1e300f64;
        assert!(big.cast::<f32>().is_infinite());
        assert_eq!(1.5f64.cast::<f32>(), 1.5f32);
    }

    #[test]
    fn widening_is_exact() {
        let v = 0.1f32;
        assert_eq!(v.cast::<f64>().cast::<f32>(), v);
    }
}

use reliability_graph::CoreError;

use crate::value::Value;

/// A closed real interval `[lower, upper]` with `0 <= lower <= upper <= 1`.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Interval {
    pub lower: f64,
    pub upper: f64,
}

impl Interval {
    pub fn new(lower: f64, upper: f64) -> Result<Self, CoreError> {
        if !(0.0..=1.0).contains(&lower) || !(0.0..=1.0).contains(&upper) || lower > upper {
            return Err(CoreError::InvalidInputBadProbability(format!(
                "interval [{lower}, {upper}] is not a valid subinterval of [0, 1]"
            )));
        }
        Ok(Self { lower, upper })
    }
}

impl Value for Interval {
    fn zero() -> Self {
        Self { lower: 0.0, upper: 0.0 }
    }

    fn one() -> Self {
        Self { lower: 1.0, upper: 1.0 }
    }

    fn neutral() -> Self {
        Self { lower: 0.9, upper: 0.9 }
    }

    fn is_zero(&self) -> bool {
        self.lower == 0.0 && self.upper == 0.0
    }

    fn is_one(&self) -> bool {
        self.lower == 1.0 && self.upper == 1.0
    }

    fn complement(&self) -> Self {
        Self {
            lower: 1.0 - self.upper,
            upper: 1.0 - self.lower,
        }
    }

    fn mul(&self, other: &Self) -> Self {
        Self {
            lower: self.lower * other.lower,
            upper: self.upper * other.upper,
        }
    }

    fn add(&self, other: &Self) -> Self {
        Self {
            lower: self.lower + other.lower,
            upper: self.upper + other.upper,
        }
    }

    fn nominal_scalar(&self) -> f64 {
        (self.lower + self.upper) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_inverted_bounds() {
        assert!(Interval::new(0.6, 0.4).is_err());
        assert!(Interval::new(-0.1, 0.5).is_err());
    }

    #[test]
    fn mul_multiplies_bounds_independently() {
        let a = Interval::new(0.5, 0.8).unwrap();
        let b = Interval::new(0.5, 0.8).unwrap();
        let product = a.mul(&b);
        assert!((product.lower - 0.25).abs() < 1e-12);
        assert!((product.upper - 0.64).abs() < 1e-12);
    }

    #[test]
    fn complement_swaps_and_subtracts() {
        let a = Interval::new(0.2, 0.3).unwrap();
        let c = a.complement();
        assert!((c.lower - 0.7).abs() < 1e-12);
        assert!((c.upper - 0.8).abs() < 1e-12);
    }

    #[test]
    fn nominal_scalar_is_the_midpoint() {
        let a = Interval::new(0.2, 0.8).unwrap();
        assert!((a.nominal_scalar() - 0.5).abs() < 1e-12);
        assert!((Interval::one().nominal_scalar() - 1.0).abs() < 1e-12);
        assert!((Interval::zero().nominal_scalar() - 0.0).abs() < 1e-12);
    }
}

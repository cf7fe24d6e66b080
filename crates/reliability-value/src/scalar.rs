use reliability_graph::CoreError;

use crate::value::Value;

/// A real scalar probability in `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Scalar(pub f64);

impl Scalar {
    pub fn new(p: f64) -> Result<Self, CoreError> {
        if !(0.0..=1.0).contains(&p) {
            return Err(CoreError::InvalidInputBadProbability(format!(
                "scalar {p} outside [0, 1]"
            )));
        }
        Ok(Self(p))
    }

    pub fn get(self) -> f64 {
        self.0
    }
}

impl Value for Scalar {
    fn zero() -> Self {
        Self(0.0)
    }

    fn one() -> Self {
        Self(1.0)
    }

    fn neutral() -> Self {
        Self(0.9)
    }

    fn is_zero(&self) -> bool {
        self.0 == 0.0
    }

    fn is_one(&self) -> bool {
        self.0 == 1.0
    }

    fn complement(&self) -> Self {
        Self(1.0 - self.0)
    }

    fn mul(&self, other: &Self) -> Self {
        Self(self.0 * other.0)
    }

    fn add(&self, other: &Self) -> Self {
        Self(self.0 + other.0)
    }

    fn nominal_scalar(&self) -> f64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range() {
        assert!(Scalar::new(-0.1).is_err());
        assert!(Scalar::new(1.1).is_err());
        assert!(Scalar::new(0.5).is_ok());
    }

    #[test]
    fn complement_and_mul() {
        let a = Scalar::new(0.9).unwrap();
        let b = Scalar::new(0.5).unwrap();
        assert!((a.complement().get() - 0.1).abs() < 1e-12);
        assert!((a.mul(&b).get() - 0.45).abs() < 1e-12);
    }

    #[test]
    fn zero_and_one_are_exact() {
        assert!(Scalar::zero().is_zero());
        assert!(Scalar::one().is_one());
        assert!(!Scalar::neutral().is_zero());
        assert!(!Scalar::neutral().is_one());
    }
}

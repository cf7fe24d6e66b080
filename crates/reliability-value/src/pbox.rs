use reliability_graph::CoreError;

use crate::value::Value;

/// Number of fixed breakpoints on `[0, 1]` at which the lower/upper CDF bounds
/// are discretised. `BREAKPOINTS[i] = i / (LEVELS - 1)`.
const LEVELS: usize = 11;

fn breakpoint(i: usize) -> f64 {
    i as f64 / (LEVELS - 1) as f64
}

/// A discretised probability box: a pair of non-decreasing CDF step functions
/// `lower <= upper`, each sampled at `LEVELS` fixed breakpoints on `[0, 1]`.
///
/// No verified p-box arithmetic crate exists in this project's dependency
/// corpus (see DESIGN.md), so the independent-combination convolution for
/// `mul` is implemented directly here as a discrete Fréchet-style bound over
/// the breakpoint grid, rather than delegated to a third-party library.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PBox {
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

impl PBox {
    pub fn new(lower: Vec<f64>, upper: Vec<f64>) -> Result<Self, CoreError> {
        if lower.len() != LEVELS || upper.len() != LEVELS {
            return Err(CoreError::InvalidInputBadProbability(format!(
                "p-box must have exactly {LEVELS} breakpoints"
            )));
        }
        if !is_non_decreasing(&lower) || !is_non_decreasing(&upper) {
            return Err(CoreError::InvalidInputBadProbability(
                "p-box CDF bounds must be non-decreasing".to_string(),
            ));
        }
        for i in 0..LEVELS {
            let (l, u) = (lower[i], upper[i]);
            if !(0.0..=1.0).contains(&l) || !(0.0..=1.0).contains(&u) || l > u {
                return Err(CoreError::InvalidInputBadProbability(format!(
                    "p-box bound at breakpoint {i} ([{l}, {u}]) is not a valid subinterval of [0, 1]"
                )));
            }
        }
        Ok(Self { lower, upper })
    }

    /// The p-box of a degenerate (certain) scalar `p`: `CDF(x) = 0` for `x < p`,
    /// `1` for `x >= p`.
    pub fn degenerate(p: f64) -> Self {
        let step: Vec<f64> = (0..LEVELS)
            .map(|i| if breakpoint(i) + f64::EPSILON >= p { 1.0 } else { 0.0 })
            .collect();
        Self {
            lower: step.clone(),
            upper: step,
        }
    }
}

fn is_non_decreasing(v: &[f64]) -> bool {
    v.windows(2).all(|w| w[0] <= w[1] + 1e-12)
}

impl Value for PBox {
    fn zero() -> Self {
        Self::degenerate(0.0)
    }

    fn one() -> Self {
        Self::degenerate(1.0)
    }

    fn neutral() -> Self {
        Self::degenerate(0.9)
    }

    fn is_zero(&self) -> bool {
        *self == Self::zero()
    }

    fn is_one(&self) -> bool {
        *self == Self::one()
    }

    fn complement(&self) -> Self {
        let mut lower = vec![0.0; LEVELS];
        let mut upper = vec![0.0; LEVELS];
        for i in 0..LEVELS {
            let mirror = LEVELS - 1 - i;
            lower[i] = 1.0 - self.upper[mirror];
            upper[i] = 1.0 - self.lower[mirror];
        }
        Self { lower, upper }
    }

    /// Independent product `Z = X * Y`, bounded on the breakpoint grid via the
    /// discrete Fréchet envelope: for each output breakpoint `z_k`, the upper
    /// bound is the best (max) CDF value achievable over all grid cells whose
    /// product lands at or below `z_k`, and the lower bound the worst (min),
    /// applying the Fréchet lower-bound correction `max(a + b - 1, 0)`.
    fn mul(&self, other: &Self) -> Self {
        let mut lower = vec![0.0; LEVELS];
        let mut upper = vec![0.0; LEVELS];

        for k in 0..LEVELS {
            let z = breakpoint(k);
            let mut upper_bound = 0.0f64;
            let mut lower_bound = 1.0f64;
            let mut any = false;
            for i in 0..LEVELS {
                for j in 0..LEVELS {
                    if breakpoint(i) * breakpoint(j) <= z + 1e-12 {
                        any = true;
                        upper_bound = upper_bound.max(self.upper[i].min(other.upper[j]));
                        lower_bound = lower_bound.min((self.lower[i] + other.lower[j] - 1.0).max(0.0));
                    }
                }
            }
            if !any {
                upper_bound = 0.0;
                lower_bound = 0.0;
            }
            lower[k] = lower_bound.min(upper_bound);
            upper[k] = upper_bound;
        }

        enforce_non_decreasing(&mut lower);
        enforce_non_decreasing(&mut upper);
        Self { lower, upper }
    }

    fn add(&self, other: &Self) -> Self {
        let lower = self
            .lower
            .iter()
            .zip(&other.lower)
            .map(|(a, b)| a + b)
            .collect();
        let upper = self
            .upper
            .iter()
            .zip(&other.upper)
            .map(|(a, b)| a + b)
            .collect();
        Self { lower, upper }
    }

    /// Projects the box to a single probability by averaging the lower and
    /// upper CDF bounds into one mean CDF, then integrating its survival
    /// function (`E[X] = ∫(1 - CDF(x)) dx`) via the trapezoid rule over the
    /// breakpoint grid.
    fn nominal_scalar(&self) -> f64 {
        let mean_cdf: Vec<f64> = self
            .lower
            .iter()
            .zip(&self.upper)
            .map(|(l, u)| (l + u) / 2.0)
            .collect();
        (0..LEVELS - 1)
            .map(|i| {
                let dx = breakpoint(i + 1) - breakpoint(i);
                let s0 = 1.0 - mean_cdf[i];
                let s1 = 1.0 - mean_cdf[i + 1];
                dx * (s0 + s1) / 2.0
            })
            .sum()
    }
}

/// `mul`'s pointwise max/min over a growing constraint set is already
/// non-decreasing in theory; this guards against floating-point jitter at
/// adjacent breakpoints before the result is trusted as a CDF.
fn enforce_non_decreasing(v: &mut [f64]) {
    for i in 1..v.len() {
        if v[i] < v[i - 1] {
            v[i] = v[i - 1];
        }
    }
}

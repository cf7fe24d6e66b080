/// The capability set every probability value kind (scalar, interval, p-box)
/// implements. Core algorithms (diamond identification, storage, propagation)
/// are generic over `V: Value` and never inspect a concrete representation.
///
/// `neutral` is a placeholder sentinel (`≈ 0.9`) used only to satisfy type
/// invariants for sub-source priors that propagation always overwrites
/// before they are read; see `reliability-diamond`'s storage builder.
pub trait Value: Clone + std::fmt::Debug + PartialEq {
    fn zero() -> Self;
    fn one() -> Self;
    fn neutral() -> Self;
    fn is_zero(&self) -> bool;
    fn is_one(&self) -> bool;
    fn complement(&self) -> Self;
    fn mul(&self, other: &Self) -> Self;
    /// Combine mutually-exclusive, already-weighted outcomes (e.g. the terms
    /// of a conditioning-node sum, or mixture CDFs). Plain addition; callers
    /// are responsible for the operands being disjoint-outcome contributions.
    fn add(&self, other: &Self) -> Self;

    /// Collapse this value to a single Bernoulli parameter for sampling.
    ///
    /// Exact for the scalar kind. For interval and p-box kinds there is no
    /// single probability to draw from, so this is a *projection* (the
    /// interval midpoint, or the p-box's mean-CDF expectation) -- callers
    /// using this outside the scalar kind are getting an approximation, not
    /// an exact probabilistic check, and should label results accordingly.
    fn nominal_scalar(&self) -> f64;
}

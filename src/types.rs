use serde::{Deserialize, Serialize};
use std::fmt;

/// Default polynomial degree of the univariate bases (cubic).
pub const DEFAULT_DEGREE: usize = 3;

/// Default regularization strength used by the smoothing presets.
pub const DEFAULT_ALPHA: f64 = 0.1;

/// Order of the finite-difference operator used by P-spline smoothing.
pub const PSPLINE_DIFFERENCE_ORDER: usize = 2;

/// How interior knots are distributed along one input dimension.
///
/// Every dimension uses the same strategy, but each dimension's knot vector is
/// computed independently from that dimension's sample coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KnotSpacing {
    /// Interior knots follow the distribution of the sample coordinates
    /// (averaged over evenly ranked support points).
    #[default]
    AsSampled,
    /// Interior knots are uniformly spaced between the smallest and largest
    /// sample coordinate.
    Equidistant,
    /// Uniform targets snapped to midpoints between neighbouring samples.
    Experimental,
}

impl fmt::Display for KnotSpacing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KnotSpacing::AsSampled => "as-sampled",
            KnotSpacing::Equidistant => "equidistant",
            KnotSpacing::Experimental => "experimental",
        };
        f.write_str(name)
    }
}

/// Augmentation applied to the least-squares system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Smoothing {
    /// Plain ordinary least squares.
    #[default]
    None,
    /// Ridge penalty `alpha * ||c||²` on the coefficients.
    Identity,
    /// Second-order difference penalty over the coefficient lattice.
    PSpline,
}

impl Smoothing {
    pub fn is_regularized(self) -> bool {
        !matches!(self, Smoothing::None)
    }
}

impl fmt::Display for Smoothing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Smoothing::None => "none",
            Smoothing::Identity => "identity (Tikhonov)",
            Smoothing::PSpline => "P-spline",
        };
        f.write_str(name)
    }
}

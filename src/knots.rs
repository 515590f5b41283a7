//! Per-dimension knot vector construction.
//!
//! Every knot vector produced here is clamped: the first and last values are
//! repeated `degree + 1` times, so the spline domain coincides with the sample
//! range and the boundary basis functions are non-zero at the endpoints.

use crate::types::KnotSpacing;
use ndarray::{Array1, ArrayView1};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum KnotError {
    #[error(
        "Dimension is degenerate: at least 2 distinct sample coordinates are required, found {distinct}."
    )]
    DegenerateDimension { distinct: usize },

    #[error(
        "A degree {degree} basis needs at least {} basis functions, but {requested} were requested.",
        .degree + 1
    )]
    TooFewBasisFunctions { degree: usize, requested: usize },

    #[error(
        "Cannot place {requested} basis functions on {distinct} distinct sample coordinates with {spacing} knot spacing."
    )]
    TooManyBasisFunctions {
        requested: usize,
        distinct: usize,
        spacing: KnotSpacing,
    },

    #[error("Sample coordinates must be finite and strictly increasing: {0}")]
    UnsortedCoordinates(String),

    #[error("The provided knot vector is invalid: {0}")]
    InvalidKnotVector(String),
}

/// Builds a clamped knot vector of length `num_basis_functions + degree + 1`
/// for one input dimension.
///
/// `unique_sorted` are the distinct sample coordinates of the dimension in
/// increasing order.
pub fn build_knot_vector(
    unique_sorted: &[f64],
    degree: usize,
    num_basis_functions: usize,
    spacing: KnotSpacing,
) -> Result<Array1<f64>, KnotError> {
    validate_coordinates(unique_sorted)?;
    let distinct = unique_sorted.len();
    if distinct < 2 {
        return Err(KnotError::DegenerateDimension { distinct });
    }
    if num_basis_functions < degree + 1 {
        return Err(KnotError::TooFewBasisFunctions {
            degree,
            requested: num_basis_functions,
        });
    }
    let needs_support = matches!(spacing, KnotSpacing::AsSampled | KnotSpacing::Experimental);
    if needs_support && num_basis_functions > distinct {
        return Err(KnotError::TooManyBasisFunctions {
            requested: num_basis_functions,
            distinct,
            spacing,
        });
    }

    let num_interior = num_basis_functions - degree - 1;
    let lower = unique_sorted[0];
    let upper = unique_sorted[distinct - 1];
    let interior = match spacing {
        KnotSpacing::AsSampled => {
            averaged_interior_knots(&support_points(unique_sorted, num_basis_functions), degree)
        }
        KnotSpacing::Equidistant => equidistant_interior_knots(lower, upper, num_interior),
        KnotSpacing::Experimental => snapped_interior_knots(unique_sorted, num_interior),
    };
    debug_assert_eq!(interior.len(), num_interior);

    let knots = clamp_knots(lower, upper, &interior, degree);
    log::debug!(
        "built {spacing} knot vector: degree={degree}, basis={num_basis_functions}, knots={}",
        knots.len()
    );
    Ok(knots)
}

/// Checks a caller-supplied knot vector: finite, non-decreasing, long enough
/// for `degree`, with clamped boundary multiplicity and interior multiplicity
/// at most `degree + 1`.
pub fn validate_knot_vector(knots: ArrayView1<'_, f64>, degree: usize) -> Result<(), KnotError> {
    let required = 2 * (degree + 1);
    if knots.len() < required {
        return Err(KnotError::InvalidKnotVector(format!(
            "a degree {degree} clamped knot vector needs at least {required} knots, got {}",
            knots.len()
        )));
    }
    if knots.iter().any(|k| !k.is_finite()) {
        return Err(KnotError::InvalidKnotVector(
            "knot vector contains non-finite (NaN or Infinity) values".to_string(),
        ));
    }
    if knots.windows(2).into_iter().any(|w| w[0] > w[1]) {
        return Err(KnotError::InvalidKnotVector(
            "knot vector is not non-decreasing".to_string(),
        ));
    }
    let first = knots[0];
    let last = knots[knots.len() - 1];
    if first >= last {
        return Err(KnotError::InvalidKnotVector(
            "knot vector spans an empty domain".to_string(),
        ));
    }
    let leading = knots.iter().take_while(|&&k| k == first).count();
    let trailing = knots.iter().rev().take_while(|&&k| k == last).count();
    if leading != degree + 1 || trailing != degree + 1 {
        return Err(KnotError::InvalidKnotVector(format!(
            "boundary knots must be repeated exactly {} times (found {leading} and {trailing})",
            degree + 1
        )));
    }

    let mut run = 1usize;
    for w in knots.windows(2) {
        run = if w[0] == w[1] { run + 1 } else { 1 };
        if run > degree + 1 {
            return Err(KnotError::InvalidKnotVector(format!(
                "knot {} has multiplicity above {}",
                w[1],
                degree + 1
            )));
        }
    }
    Ok(())
}

/// Number of basis functions a knot vector supports for `degree`.
#[inline]
pub fn num_basis_functions(knots: ArrayView1<'_, f64>, degree: usize) -> usize {
    knots.len().saturating_sub(degree + 1)
}

fn validate_coordinates(values: &[f64]) -> Result<(), KnotError> {
    if values.iter().any(|v| !v.is_finite()) {
        return Err(KnotError::UnsortedCoordinates(
            "coordinates contain non-finite values".to_string(),
        ));
    }
    if let Some(pos) = values.windows(2).position(|w| w[0] >= w[1]) {
        return Err(KnotError::UnsortedCoordinates(format!(
            "values at positions {pos} and {} are out of order or repeated",
            pos + 1
        )));
    }
    Ok(())
}

fn clamp_knots(lower: f64, upper: f64, interior: &[f64], degree: usize) -> Array1<f64> {
    let mut knots = Vec::with_capacity(interior.len() + 2 * (degree + 1));
    knots.extend(std::iter::repeat_n(lower, degree + 1));
    knots.extend_from_slice(interior);
    knots.extend(std::iter::repeat_n(upper, degree + 1));
    Array1::from_vec(knots)
}

/// Picks `count` coordinates spread evenly in rank. Requires `count <= values.len()`,
/// which keeps the rounded indices distinct.
fn support_points(values: &[f64], count: usize) -> Vec<f64> {
    let n = values.len();
    if count >= n {
        return values.to_vec();
    }
    if count <= 1 {
        return vec![values[0]];
    }
    let step = (n - 1) as f64 / (count - 1) as f64;
    (0..count)
        .map(|i| values[((i as f64) * step).round() as usize])
        .collect()
}

/// Knot averaging over the support points: `t = mean(s[j+1..=j+degree])`, or
/// midpoints between neighbours for piecewise-constant bases. Each knot span
/// then holds a support point, which gives a full-rank collocation matrix.
fn averaged_interior_knots(support: &[f64], degree: usize) -> Vec<f64> {
    let m = support.len();
    if degree == 0 {
        return support.windows(2).map(|w| 0.5 * (w[0] + w[1])).collect();
    }
    let num_interior = m.saturating_sub(degree + 1);
    (0..num_interior)
        .map(|j| support[j + 1..=j + degree].iter().sum::<f64>() / degree as f64)
        .collect()
}

fn equidistant_interior_knots(lower: f64, upper: f64, num_interior: usize) -> Vec<f64> {
    let h = (upper - lower) / (num_interior as f64 + 1.0);
    (1..=num_interior).map(|i| lower + i as f64 * h).collect()
}

/// Equidistant targets moved onto distinct midpoints between consecutive
/// coordinates. Needs `num_interior <= values.len() - 1`.
fn snapped_interior_knots(values: &[f64], num_interior: usize) -> Vec<f64> {
    let mids: Vec<f64> = values.windows(2).map(|w| 0.5 * (w[0] + w[1])).collect();
    let targets = equidistant_interior_knots(values[0], values[values.len() - 1], num_interior);

    let mut chosen = Vec::with_capacity(num_interior);
    let mut next_free = 0usize;
    for (i, &target) in targets.iter().enumerate() {
        let pos = mids.partition_point(|&m| m < target);
        let nearest = if pos == 0 {
            0
        } else if pos >= mids.len() {
            mids.len() - 1
        } else if (target - mids[pos - 1]) <= (mids[pos] - target) {
            pos - 1
        } else {
            pos
        };
        // Leave room for the remaining knots to the right.
        let last_allowed = mids.len() - (num_interior - i);
        let idx = nearest.max(next_free).min(last_allowed);
        chosen.push(mids[idx]);
        next_free = idx + 1;
    }
    chosen
}

use crate::basis::{BasisError, TensorBasis};
use crate::bspline::{BSpline, BSplineError};
use crate::data::{DataError, DataTable};
use crate::design::{DesignError, assemble_system, check_weights, run_in_pool};
use crate::knots::{KnotError, build_knot_vector};
use crate::solver::{SolverError, residual_sum_of_squares, solve};
use crate::types::{DEFAULT_ALPHA, DEFAULT_DEGREE, KnotSpacing, Smoothing};
use ndarray::Array1;
use rayon::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FitError {
    #[error("A spline needs at least one input and one output dimension (got dim_x={dim_x}, dim_y={dim_y}).")]
    InvalidDimensions { dim_x: usize, dim_y: usize },

    #[error(
        "Builder is configured for x∈R^{expected_x}, y∈R^{expected_y} but the samples have x∈R^{found_x}, y∈R^{found_y}."
    )]
    DataDimensionMismatch {
        expected_x: usize,
        expected_y: usize,
        found_x: usize,
        found_y: usize,
    },

    #[error("Cannot fit a spline to an empty sample table.")]
    EmptyData,

    #[error("Degree vector has {found} entries but there are {expected} input dimensions.")]
    DegreeLengthMismatch { expected: usize, found: usize },

    #[error(
        "Basis-function count vector has {found} entries but there are {expected} input dimensions."
    )]
    BasisCountLengthMismatch { expected: usize, found: usize },

    #[error("Regularization factor alpha must be finite and non-negative, got {0}.")]
    InvalidAlpha(f64),

    #[error(
        "Dimension {dim}: a degree {degree} basis needs at least {} basis functions, but {requested} were requested.",
        .degree + 1
    )]
    TooFewBasisFunctions {
        dim: usize,
        degree: usize,
        requested: usize,
    },

    #[error("Knot vector for dimension {dim}: {source}")]
    Knots { dim: usize, source: KnotError },

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Basis(#[from] BasisError),

    #[error(transparent)]
    Design(#[from] DesignError),

    #[error(transparent)]
    Solver(#[from] SolverError),

    #[error(transparent)]
    Model(#[from] BSplineError),
}

/// Least-squares options of a single `fit` call.
#[derive(Debug, Clone, PartialEq)]
pub struct FitOptions {
    pub smoothing: Smoothing,
    pub alpha: f64,
    /// One non-negative weight per sample; `None` weighs all samples equally.
    pub weights: Option<Array1<f64>>,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            smoothing: Smoothing::None,
            alpha: DEFAULT_ALPHA,
            weights: None,
        }
    }
}

impl FitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn smoothing(mut self, smoothing: Smoothing) -> Self {
        self.smoothing = smoothing;
        self
    }

    pub fn alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn weights(mut self, weights: Array1<f64>) -> Self {
        self.weights = Some(weights);
        self
    }
}

/// Configures and fits tensor-product B-splines.
///
/// Setters may be called in any order; nothing is computed until [`fit`] or
/// [`build_unfitted`], which validate the whole configuration against the
/// sample table first.
///
/// [`fit`]: BSplineBuilder::fit
/// [`build_unfitted`]: BSplineBuilder::build_unfitted
#[derive(Debug, Clone, PartialEq)]
pub struct BSplineBuilder {
    dim_x: usize,
    dim_y: usize,
    degrees: Vec<usize>,
    /// `None` places one basis function per distinct sample coordinate.
    num_basis_functions: Option<Vec<usize>>,
    knot_spacing: KnotSpacing,
}

/// Configuration after validation against a sample table.
struct ResolvedConfig {
    degrees: Vec<usize>,
    num_basis_functions: Vec<usize>,
    unique_coordinates: Vec<Vec<f64>>,
}

impl BSplineBuilder {
    pub fn new(dim_x: usize, dim_y: usize) -> Self {
        Self {
            dim_x,
            dim_y,
            degrees: vec![DEFAULT_DEGREE; dim_x],
            num_basis_functions: None,
            knot_spacing: KnotSpacing::default(),
        }
    }

    pub fn dim_x(&self) -> usize {
        self.dim_x
    }

    pub fn dim_y(&self) -> usize {
        self.dim_y
    }

    /// Same degree in every input dimension.
    pub fn degree(mut self, degree: usize) -> Self {
        self.degrees = vec![degree; self.dim_x];
        self
    }

    /// One degree per input dimension.
    pub fn degrees(mut self, degrees: Vec<usize>) -> Result<Self, FitError> {
        if degrees.len() != self.dim_x {
            return Err(FitError::DegreeLengthMismatch {
                expected: self.dim_x,
                found: degrees.len(),
            });
        }
        self.degrees = degrees;
        Ok(self)
    }

    /// Same basis-function count in every input dimension.
    pub fn num_basis_functions(mut self, count: usize) -> Self {
        self.num_basis_functions = Some(vec![count; self.dim_x]);
        self
    }

    /// One basis-function count per input dimension.
    pub fn num_basis_functions_per_dim(mut self, counts: Vec<usize>) -> Result<Self, FitError> {
        if counts.len() != self.dim_x {
            return Err(FitError::BasisCountLengthMismatch {
                expected: self.dim_x,
                found: counts.len(),
            });
        }
        self.num_basis_functions = Some(counts);
        Ok(self)
    }

    pub fn knot_spacing(mut self, spacing: KnotSpacing) -> Self {
        self.knot_spacing = spacing;
        self
    }

    pub fn degree_vector(&self) -> &[usize] {
        &self.degrees
    }

    pub fn basis_count_vector(&self) -> Option<&[usize]> {
        self.num_basis_functions.as_deref()
    }

    pub fn spacing(&self) -> KnotSpacing {
        self.knot_spacing
    }

    fn check_dimensions(&self, data: &DataTable) -> Result<(), FitError> {
        if self.dim_x == 0 || self.dim_y == 0 {
            return Err(FitError::InvalidDimensions {
                dim_x: self.dim_x,
                dim_y: self.dim_y,
            });
        }
        if data.is_empty() {
            return Err(FitError::EmptyData);
        }
        if data.dim_x() != self.dim_x || data.dim_y() != self.dim_y {
            return Err(FitError::DataDimensionMismatch {
                expected_x: self.dim_x,
                expected_y: self.dim_y,
                found_x: data.dim_x(),
                found_y: data.dim_y(),
            });
        }
        if self.degrees.len() != self.dim_x {
            return Err(FitError::DegreeLengthMismatch {
                expected: self.dim_x,
                found: self.degrees.len(),
            });
        }
        if let Some(counts) = &self.num_basis_functions
            && counts.len() != self.dim_x
        {
            return Err(FitError::BasisCountLengthMismatch {
                expected: self.dim_x,
                found: counts.len(),
            });
        }
        Ok(())
    }

    fn resolve(&self, data: &DataTable) -> Result<ResolvedConfig, FitError> {
        let unique_coordinates = (0..self.dim_x)
            .map(|dim| data.unique_sorted(dim))
            .collect::<Result<Vec<_>, _>>()?;
        let num_basis_functions = match &self.num_basis_functions {
            Some(counts) => counts.clone(),
            None => unique_coordinates.iter().map(Vec::len).collect(),
        };
        for (dim, (&degree, &requested)) in
            self.degrees.iter().zip(&num_basis_functions).enumerate()
        {
            if requested < degree + 1 {
                return Err(FitError::TooFewBasisFunctions {
                    dim,
                    degree,
                    requested,
                });
            }
        }
        Ok(ResolvedConfig {
            degrees: self.degrees.clone(),
            num_basis_functions,
            unique_coordinates,
        })
    }

    fn build_basis(&self, config: ResolvedConfig) -> Result<TensorBasis, FitError> {
        let spacing = self.knot_spacing;
        let ResolvedConfig {
            degrees,
            num_basis_functions,
            unique_coordinates,
        } = config;

        // Each dimension's knots depend only on that dimension's coordinates.
        let knot_vectors = run_in_pool(|| {
            (0..degrees.len())
                .into_par_iter()
                .map(|dim| {
                    build_knot_vector(
                        &unique_coordinates[dim],
                        degrees[dim],
                        num_basis_functions[dim],
                        spacing,
                    )
                    .map_err(|source| FitError::Knots { dim, source })
                })
                .collect::<Result<Vec<_>, _>>()
        })?;

        Ok(TensorBasis::new(knot_vectors, degrees)?)
    }

    /// Fits the spline to `data` by (regularized) least squares.
    pub fn fit(&self, data: &DataTable, options: &FitOptions) -> Result<BSpline, FitError> {
        self.check_dimensions(data)?;
        let alpha = options.alpha;
        if !alpha.is_finite() || alpha < 0.0 {
            return Err(FitError::InvalidAlpha(alpha));
        }
        let config = self.resolve(data)?;
        if let Some(weights) = &options.weights {
            check_weights(weights.view(), data.num_samples())?;
        }

        log::debug!(
            "fitting B-spline: dim_x={}, dim_y={}, samples={}, degrees={:?}, basis={:?}, spacing={}, smoothing={}, alpha={}",
            self.dim_x,
            self.dim_y,
            data.num_samples(),
            config.degrees,
            config.num_basis_functions,
            self.knot_spacing,
            options.smoothing,
            alpha
        );

        let basis = self.build_basis(config)?;
        let system = assemble_system(data, &basis, options.weights.as_ref().map(|w| w.view()))?;
        let coefficients = solve(
            &system,
            options.smoothing,
            alpha,
            &basis.num_basis_functions(),
        )?;

        if log::log_enabled!(log::Level::Debug) {
            let rss = residual_sum_of_squares(&system, &coefficients)?;
            log::debug!(
                "fit complete: {} coefficients, residual sum of squares {rss:.6e}",
                coefficients.nrows()
            );
        }

        Ok(BSpline::new(basis, coefficients)?)
    }

    /// Builds the knot vectors for `data` and returns a spline with zero
    /// coefficients, skipping the solve.
    pub fn build_unfitted(&self, data: &DataTable) -> Result<BSpline, FitError> {
        self.check_dimensions(data)?;
        let config = self.resolve(data)?;
        let basis = self.build_basis(config)?;
        Ok(BSpline::zeros(basis, self.dim_y))
    }
}

fn builder_for(data: &DataTable) -> Result<BSplineBuilder, FitError> {
    if data.is_empty() {
        return Err(FitError::EmptyData);
    }
    Ok(BSplineBuilder::new(data.dim_x(), data.dim_y()))
}

/// Interpolating spline of `degree` through every sample: one basis function
/// per distinct coordinate in each dimension, no smoothing.
///
/// Exact interpolation is guaranteed for samples on a complete regular grid
/// (see [`DataTable::is_grid_complete`]).
pub fn bspline_interpolator(data: &DataTable, degree: usize) -> Result<BSpline, FitError> {
    let builder = builder_for(data)?;
    let counts = (0..data.dim_x())
        .map(|dim| data.unique_sorted(dim).map(|u| u.len()))
        .collect::<Result<Vec<_>, _>>()?;
    builder
        .degree(degree)
        .knot_spacing(KnotSpacing::AsSampled)
        .num_basis_functions_per_dim(counts)?
        .fit(data, &FitOptions::default())
}

/// Smoothing spline with the default basis size and the given regularization.
pub fn bspline_smoother(
    data: &DataTable,
    degree: usize,
    smoothing: Smoothing,
    alpha: f64,
    weights: Option<Array1<f64>>,
) -> Result<BSpline, FitError> {
    let options = FitOptions {
        smoothing,
        alpha,
        weights,
    };
    builder_for(data)?.degree(degree).fit(data, &options)
}

/// Knot vectors for `data` with zero coefficients, to be filled in with
/// [`BSpline::with_coefficients`].
pub fn bspline_unfitted(
    data: &DataTable,
    degrees: Vec<usize>,
    knot_spacing: KnotSpacing,
    num_basis_functions: Vec<usize>,
) -> Result<BSpline, FitError> {
    builder_for(data)?
        .degrees(degrees)?
        .num_basis_functions_per_dim(num_basis_functions)?
        .knot_spacing(knot_spacing)
        .build_unfitted(data)
}

//! Linear-algebra kernels backed by faer, exposed over ndarray types: dense
//! products, SVD and Cholesky, plus a sparse Cholesky path for large
//! symmetric positive-definite systems.

pub mod faer_ndarray;
pub mod sparse_spd;

pub use faer_ndarray::{
    CholeskyFactor, FaerArrayView, FaerLinalgError, gram, singular_values, transpose_product,
};
pub use sparse_spd::{SparseCholeskyFactor, one_norm, symmetric_from_upper};

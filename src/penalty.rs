use ndarray::{Array2, s};

/// `DᵀD` for the `order`-th forward-difference operator on `n` coefficients.
///
/// A dimension with `n <= order` has no differences of that order, so its
/// penalty is the zero matrix.
pub fn difference_penalty_1d(n: usize, order: usize) -> Array2<f64> {
    if n <= order {
        return Array2::zeros((n, n));
    }
    let mut d = Array2::<f64>::eye(n);
    for _ in 0..order {
        d = &d.slice(s![1.., ..]) - &d.slice(s![..-1, ..]);
    }
    d.t().dot(&d)
}

/// Ridge penalty `I_p`.
pub fn identity_penalty(p: usize) -> Array2<f64> {
    Array2::eye(p)
}

/// Upper-triangle entries `(row, col, value)`, `row <= col`, of the tensor
/// difference penalty `Σ_k I ⊗ … ⊗ D_kᵀD_k ⊗ … ⊗ I`, laid out like the
/// tensor-product coefficients (last dimension varying fastest).
///
/// Off-diagonal entries are unique. A diagonal entry appears once per
/// dimension and the copies are meant to be summed.
pub fn tensor_difference_penalty_upper(num_basis: &[usize], order: usize) -> Vec<(usize, usize, f64)> {
    let total: usize = num_basis.iter().product();
    let mut entries = Vec::new();
    let mut stride = total;
    for &n in num_basis {
        stride /= n.max(1);
        let band: Vec<(usize, usize, f64)> = difference_penalty_1d(n, order)
            .indexed_iter()
            .filter(|&((a, b), &v)| a <= b && v != 0.0)
            .map(|((a, b), &v)| (a, b, v))
            .collect();
        if band.is_empty() {
            continue;
        }
        // Offsets of every coefficient line running along this dimension.
        let lines = (0..total).filter(|&idx| (idx / stride) % n == 0);
        for base in lines {
            entries.extend(
                band.iter()
                    .map(|&(a, b, v)| (base + a * stride, base + b * stride, v)),
            );
        }
    }
    entries
}

/// Dense form of [`tensor_difference_penalty_upper`].
pub fn tensor_difference_penalty(num_basis: &[usize], order: usize) -> Array2<f64> {
    let total: usize = num_basis.iter().product();
    let mut penalty = Array2::<f64>::zeros((total, total));
    for (row, col, v) in tensor_difference_penalty_upper(num_basis, order) {
        penalty[[row, col]] += v;
        if row != col {
            penalty[[col, row]] += v;
        }
    }
    penalty
}

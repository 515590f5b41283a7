use approx::assert_abs_diff_eq;
use bspline_fit::{
    BSplineBuilder, DataTable, DesignMatrix, FitOptions, KnotSpacing, LinearSystem, Smoothing,
    TensorBasis, assemble_system, build_knot_vector, bspline_interpolator, bspline_smoother,
    bspline_unfitted, solve,
};
use ndarray::{Array1, Array2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal, Uniform};

fn surface(x: f64, y: f64) -> f64 {
    (1.5 * x).sin() + 0.5 * y * y - 0.3 * x * y
}

fn grid_table(nx: usize, ny: usize) -> DataTable {
    let mut data = DataTable::new();
    for i in 0..nx {
        for j in 0..ny {
            let x = 2.0 * i as f64 / (nx - 1) as f64;
            let y = -1.0 + 2.0 * j as f64 / (ny - 1) as f64;
            data.add_sample(vec![x, y], vec![surface(x, y)]).unwrap();
        }
    }
    data
}

#[test]
fn grid_interpolation_is_exact() {
    let data = grid_table(7, 5);
    assert!(data.is_grid_complete());
    let spline = bspline_interpolator(&data, 3).unwrap();
    assert_eq!(spline.num_basis_functions(), vec![7, 5]);
    assert_eq!(spline.coefficients().nrows(), 35);
    for s in data.samples() {
        assert_abs_diff_eq!(spline.eval(s.x()).unwrap()[0], s.y()[0], epsilon = 1e-8);
    }
}

#[test]
fn mixed_degrees_and_counts_per_dimension() {
    let data = grid_table(12, 9);
    let spline = BSplineBuilder::new(2, 1)
        .degrees(vec![3, 1])
        .unwrap()
        .num_basis_functions_per_dim(vec![8, 6])
        .unwrap()
        .knot_spacing(KnotSpacing::Equidistant)
        .fit(&data, &FitOptions::default())
        .unwrap();
    assert_eq!(spline.degrees(), vec![3, 1]);
    assert_eq!(spline.knot_vectors()[0].len(), 8 + 3 + 1);
    assert_eq!(spline.knot_vectors()[1].len(), 6 + 1 + 1);
    assert_abs_diff_eq!(spline.eval(&[1.1, 0.2]).unwrap()[0], surface(1.1, 0.2), epsilon = 0.05);

    let jacobian = spline.eval_jacobian(&[1.0, 0.3]).unwrap();
    assert_eq!(jacobian.dim(), (1, 2));
    let h = 1e-6;
    let fx = (spline.eval(&[1.0 + h, 0.3]).unwrap()[0] - spline.eval(&[1.0 - h, 0.3]).unwrap()[0])
        / (2.0 * h);
    assert_abs_diff_eq!(jacobian[[0, 0]], fx, epsilon = 1e-5);
}

#[test]
fn scattered_noisy_surface_with_pspline() {
    let mut rng = StdRng::seed_from_u64(42);
    let ux = Uniform::new(0.0, 2.0).unwrap();
    let uy = Uniform::new(-1.0, 1.0).unwrap();
    let noise = Normal::new(0.0, 0.05).unwrap();
    let mut data = DataTable::new();
    for _ in 0..400 {
        let x = ux.sample(&mut rng);
        let y = uy.sample(&mut rng);
        data.add_sample(vec![x, y], vec![surface(x, y) + noise.sample(&mut rng)])
            .unwrap();
    }
    assert!(!data.is_grid_complete());

    let spline = BSplineBuilder::new(2, 1)
        .num_basis_functions(8)
        .fit(
            &data,
            &FitOptions::new().smoothing(Smoothing::PSpline).alpha(0.01),
        )
        .unwrap();
    for &(x, y) in &[(0.5, 0.0), (1.0, -0.5), (1.5, 0.5)] {
        assert_abs_diff_eq!(spline.eval(&[x, y]).unwrap()[0], surface(x, y), epsilon = 0.08);
    }
}

#[test]
fn sparse_design_solves_like_dense() {
    let mut rng = StdRng::seed_from_u64(9);
    let noise = Normal::new(0.0, 0.1).unwrap();
    let n = 1500;
    let mut data = DataTable::new();
    for i in 0..n {
        let x = 10.0 * i as f64 / (n - 1) as f64;
        data.add_sample_scalar(x, x.sin() + noise.sample(&mut rng))
            .unwrap();
    }
    let unique = data.unique_sorted(0).unwrap();
    let knots = build_knot_vector(&unique, 3, 60, KnotSpacing::Equidistant).unwrap();
    let basis = TensorBasis::new(vec![knots], vec![3]).unwrap();

    let system = assemble_system(&data, &basis, None).unwrap();
    assert!(system.design.is_sparse());
    assert!(system.design.nnz() <= n * 4);
    let dense_system = LinearSystem {
        design: DesignMatrix::Dense(system.design.to_dense()),
        targets: system.targets.clone(),
    };

    let shape = basis.num_basis_functions();
    let sparse_coefficients = solve(&system, Smoothing::PSpline, 0.1, &shape).unwrap();
    let dense_coefficients = solve(&dense_system, Smoothing::PSpline, 0.1, &shape).unwrap();
    for (a, b) in sparse_coefficients.iter().zip(dense_coefficients.iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-9);
    }
}

#[test]
fn large_grid_smoother_stays_sparse() {
    // 3600 basis functions: the normal matrix is never formed densely.
    let data = grid_table(60, 60);
    let spline = bspline_smoother(&data, 3, Smoothing::PSpline, 0.1, None).unwrap();
    assert_eq!(spline.num_basis_functions(), vec![60, 60]);
    assert_eq!(spline.coefficients().nrows(), 3600);
    for &(x, y) in &[(0.3, -0.7), (1.0, 0.0), (1.77, 0.45)] {
        assert_abs_diff_eq!(spline.eval(&[x, y]).unwrap()[0], surface(x, y), epsilon = 1e-2);
    }

    let basis = spline.basis();
    let system = assemble_system(&data, basis, None).unwrap();
    assert!(system.design.is_sparse());
}

#[test]
fn repeated_fits_are_bitwise_identical() {
    let mut rng = StdRng::seed_from_u64(17);
    let ux = Uniform::new(0.0, 1.0).unwrap();
    let mut data = DataTable::new();
    for _ in 0..2000 {
        let x = ux.sample(&mut rng);
        let y = ux.sample(&mut rng);
        data.add_sample(vec![x, y], vec![x * y, x - y]).unwrap();
    }
    let builder = BSplineBuilder::new(2, 2)
        .num_basis_functions(10)
        .knot_spacing(KnotSpacing::Equidistant);
    let options = FitOptions::new().smoothing(Smoothing::Identity).alpha(1e-4);
    let first = builder.fit(&data, &options).unwrap();
    let second = builder.fit(&data, &options).unwrap();
    assert_eq!(first.coefficients(), second.coefficients());
}

#[test]
fn unfitted_skeleton_accepts_manual_coefficients() {
    let data = grid_table(6, 6);
    let skeleton = bspline_unfitted(&data, vec![2, 3], KnotSpacing::Equidistant, vec![5, 4]).unwrap();
    assert_eq!(skeleton.num_basis_functions(), vec![5, 4]);
    assert!(skeleton.coefficients().iter().all(|&c| c == 0.0));
    assert_eq!(skeleton.eval(&[1.0, 0.0]).unwrap()[0], 0.0);

    // Unit coefficients reproduce the constant 1 (partition of unity).
    let ones = skeleton.with_coefficients(Array2::ones((20, 1))).unwrap();
    for &(x, y) in &[(0.0, -1.0), (0.7, 0.3), (2.0, 1.0)] {
        assert_abs_diff_eq!(ones.eval(&[x, y]).unwrap()[0], 1.0, epsilon = 1e-12);
    }

    // Greville abscissae as coefficients reproduce the first coordinate.
    let kx = skeleton.knot_vectors()[0].clone();
    let greville: Array1<f64> = (0..5).map(|i| (kx[i + 1] + kx[i + 2]) / 2.0).collect();
    let coefficients = Array2::from_shape_fn((20, 1), |(row, _)| greville[row / 4]);
    let linear = skeleton.with_coefficients(coefficients).unwrap();
    assert_abs_diff_eq!(linear.eval(&[1.3, 0.4]).unwrap()[0], 1.3, epsilon = 1e-12);
}

#[test]
fn data_dimension_must_match_builder() {
    let data = grid_table(5, 5);
    let result = BSplineBuilder::new(2, 2).fit(&data, &FitOptions::default());
    assert!(result.is_err());
    let points = data.x_matrix();
    let spline = bspline_interpolator(&data, 3).unwrap();
    let values = spline.eval_many(points.view()).unwrap();
    for (v, s) in values.column(0).iter().zip(data.samples()) {
        assert_abs_diff_eq!(*v, s.y()[0], epsilon = 1e-8);
    }
}

//! Integration test: the sparse PLS deviance agrees with the dense marginal
//! likelihood of `y ~ N(X beta, sigma^2 (I + Z Lambda Lambda' Z'))`.
//!
//! The dense reference forms the full `n x n` marginal covariance, so the data
//! sets here are kept small.

use std::f64::consts::PI;

use approx::assert_relative_eq;
use lmm_pls_core::data::FactorColumn;
use lmm_pls_core::lmm::PlsEvaluator;
use lmm_pls_core::matrix::dense::log_determinant_spd;
use lmm_pls_core::matrix::sparse::structural_positions;
use lmm_pls_core::model::{design, RandomEffects, RandomTerm};
use nalgebra::{DMatrix, DVector};

/// Dense REML criterion or ML deviance, profiled over beta and sigma, for
/// `y - offset ~ N(X beta, sigma^2 (W^{-1} + Z Lambda Lambda' Z'))`.
///
/// `sum(log w)` is added so the value is on the same scale as the penalized
/// least squares criterion, which works with `W^{1/2}`-scaled data.
fn dense_weighted_deviance(
    x: &DMatrix<f64>,
    y: &[f64],
    weights: &[f64],
    offset: &[f64],
    re: &RandomEffects,
    theta: &[f64],
    reml: bool,
) -> f64 {
    let n = y.len();
    let p = x.ncols();
    let lt = re.lambdat_at(theta).unwrap();
    let z = DMatrix::from_fn(n, re.q(), |i, k| re.zt.get(k, i).copied().unwrap_or(0.0));
    let lambda = DMatrix::from_fn(re.q(), re.q(), |r, c| lt.get(c, r).copied().unwrap_or(0.0));
    let zl = &z * &lambda;
    let w_inv = DMatrix::from_fn(n, n, |i, j| if i == j { 1.0 / weights[i] } else { 0.0 });
    let v = w_inv + &zl * zl.transpose();
    let v_inv = v.clone().try_inverse().unwrap();

    let yv = DVector::from_fn(n, |i, _| y[i] - offset[i]);
    let xtvx = x.transpose() * &v_inv * x;
    let beta = xtvx.clone().try_inverse().unwrap() * x.transpose() * &v_inv * &yv;
    let r = &yv - x * beta;
    let rss = (r.transpose() * &v_inv * &r)[(0, 0)];

    let n_eff = if reml { (n - p) as f64 } else { n as f64 };
    let mut logdet = log_determinant_spd(&v).unwrap() + weights.iter().map(|w| w.ln()).sum::<f64>();
    if reml {
        logdet += log_determinant_spd(&xtvx).unwrap();
    }
    logdet + n_eff * (1.0 + (2.0 * PI * rss / n_eff).ln())
}

fn dense_deviance(
    x: &DMatrix<f64>,
    y: &[f64],
    re: &RandomEffects,
    theta: &[f64],
    reml: bool,
) -> f64 {
    let n = y.len();
    dense_weighted_deviance(x, y, &vec![1.0; n], &vec![0.0; n], re, theta, reml)
}

const SLOPE_Y: [f64; 20] = [
    1.2, 2.1, 2.9, 4.2, 5.1, //
    0.4, 0.9, 1.8, 2.2, 2.8, //
    2.5, 3.9, 5.6, 7.1, 8.4, //
    1.0, 1.4, 2.3, 3.1, 3.6,
];

/// 4 subjects with 5 visits each, response trending in time; `keep` selects
/// which of the 20 observations are used.
fn slope_subset(keep: impl Fn(usize) -> bool) -> (DMatrix<f64>, Vec<f64>, RandomEffects) {
    let subjects = ["s1", "s2", "s3", "s4"];
    let mut labels = Vec::new();
    let mut time = Vec::new();
    let mut y = Vec::new();
    for (s, subject) in subjects.iter().enumerate() {
        for t in 0..5 {
            let i = s * 5 + t;
            if keep(i) {
                labels.push(*subject);
                time.push(t as f64);
                y.push(SLOPE_Y[i]);
            }
        }
    }
    let x = design::intercept_and_slope(&time);
    let term = RandomTerm::new(
        "subject",
        FactorColumn::new(&labels),
        design::intercept_and_slope(&time),
    );
    let re = RandomEffects::assemble(&[term]).unwrap();
    (x, y, re)
}

fn slope_data() -> (DMatrix<f64>, Vec<f64>, RandomEffects) {
    slope_subset(|_| true)
}

#[test]
fn test_correlated_slope_matches_dense() {
    let (x, y, re) = slope_data();
    assert_eq!(re.n_theta(), 3);

    for reml in [false, true] {
        let mut eval = PlsEvaluator::from_random_effects(&x, &y, &re, None, None, reml).unwrap();
        for theta in [[1.0, 0.0, 1.0], [0.8, 0.3, 0.4], [2.0, -0.5, 0.1], [0.0, 0.0, 0.0]] {
            let sparse = eval.evaluate(&theta).unwrap();
            let dense = dense_deviance(&x, &y, &re, &theta, reml);
            assert_relative_eq!(sparse, dense, epsilon = 1e-8, max_relative = 1e-9);
        }
    }
}

#[test]
fn test_crossed_terms_match_dense() {
    // 3 x 4 crossed layout, one observation per cell plus a few repeats.
    let rows = ["r1", "r1", "r1", "r1", "r2", "r2", "r2", "r2", "r3", "r3", "r3", "r3", "r1", "r3"];
    let cols = ["c1", "c2", "c3", "c4", "c1", "c2", "c3", "c4", "c1", "c2", "c3", "c4", "c2", "c4"];
    let y = vec![
        5.1, 6.3, 4.8, 7.0, 5.9, 7.2, 5.5, 8.1, 4.2, 5.8, 3.9, 6.6, 6.0, 6.9,
    ];
    let x = design::intercept_column(y.len());
    let re = RandomEffects::assemble(&[
        RandomTerm::intercept("row", FactorColumn::new(&rows)),
        RandomTerm::intercept("col", FactorColumn::new(&cols)),
    ])
    .unwrap();
    assert_eq!(re.q(), 7);

    let mut eval = PlsEvaluator::from_random_effects(&x, &y, &re, None, None, true).unwrap();
    for theta in [[1.0, 1.0], [0.5, 2.0], [0.0, 1.3]] {
        let sparse = eval.evaluate(&theta).unwrap();
        let dense = dense_deviance(&x, &y, &re, &theta, true);
        assert_relative_eq!(sparse, dense, epsilon = 1e-8, max_relative = 1e-9);
    }
    assert_eq!(eval.cache().n_analyses(), 1);
}

#[test]
fn test_conditional_modes_solve_penalized_normal_equations() {
    let (x, y, re) = slope_data();
    let theta = [0.9, 0.2, 0.6];
    let mut eval = PlsEvaluator::from_random_effects(&x, &y, &re, None, None, false).unwrap();
    eval.evaluate(&theta).unwrap();
    let sol = eval.solution().unwrap();

    // Stationarity in u: Lambdat Zt (y - mu) = u.
    let lt = re.lambdat_at(&theta).unwrap();
    let resid: Vec<f64> = y.iter().zip(&sol.mu).map(|(a, b)| a - b).collect();
    let zt_r = lmm_pls_core::matrix::sparse::spmv(&re.zt, &resid);
    let grad_u = lmm_pls_core::matrix::sparse::spmv(&lt, &zt_r);
    for (g, u) in grad_u.iter().zip(&sol.u) {
        assert_relative_eq!(*g, *u, epsilon = 1e-9);
    }
    // Stationarity in beta: X'(y - mu) = 0.
    let xr = x.transpose() * DVector::from_vec(resid);
    for v in xr.iter() {
        assert!(v.abs() < 1e-9);
    }
}

#[test]
fn test_zero_parameter_keeps_lambdat_pattern() {
    let (x, y, re) = slope_data();
    let mut eval = PlsEvaluator::from_random_effects(&x, &y, &re, None, None, true).unwrap();
    let pattern = structural_positions(eval.lambdat());
    eval.evaluate(&[1.0, 0.0, 0.0]).unwrap();
    eval.evaluate(&[0.0, 0.0, 0.0]).unwrap();
    assert_eq!(structural_positions(eval.lambdat()), pattern);
    assert_eq!(eval.lambdat().nnz(), re.lambdat.nnz());
}

#[test]
fn test_theta_length_is_validated() {
    let (x, y, re) = slope_data();
    let mut eval = PlsEvaluator::from_random_effects(&x, &y, &re, None, None, true).unwrap();
    let err = eval.evaluate(&[1.0, 0.0]).unwrap_err();
    assert_eq!(err.kind(), lmm_pls_core::ErrorKind::Validation);
    assert!(eval.objective(&[1.0, 0.0]).is_err());
}

#[test]
fn test_varying_weights_and_offset_match_dense() {
    let (x, y, re) = slope_data();
    let weights: Vec<f64> = (0..y.len()).map(|i| [0.5, 1.5, 2.5][i % 3]).collect();
    let offset: Vec<f64> = (0..y.len()).map(|i| 0.1 * (i % 4) as f64).collect();

    for reml in [false, true] {
        let mut eval =
            PlsEvaluator::from_random_effects(&x, &y, &re, Some(&weights), Some(&offset), reml)
                .unwrap();
        for theta in [[1.0, 0.0, 1.0], [0.7, -0.4, 0.3]] {
            let sparse = eval.evaluate(&theta).unwrap();
            let dense = dense_weighted_deviance(&x, &y, &weights, &offset, &re, &theta, reml);
            assert_relative_eq!(sparse, dense, epsilon = 1e-8, max_relative = 1e-9);
        }
    }

    // Weights matter: the unweighted criterion is different.
    let mut unweighted = PlsEvaluator::from_random_effects(&x, &y, &re, None, None, true).unwrap();
    let mut weighted =
        PlsEvaluator::from_random_effects(&x, &y, &re, Some(&weights), None, true).unwrap();
    let a = unweighted.evaluate(&[0.7, -0.4, 0.3]).unwrap();
    let b = weighted.evaluate(&[0.7, -0.4, 0.3]).unwrap();
    assert!((a - b).abs() > 1e-3);
}

#[test]
fn test_zero_weight_observation_drops_out() {
    // Observation 7 (subject s2, visit 2) gets weight zero.
    let dropped = 7;
    let (x, y, re) = slope_data();
    let weights: Vec<f64> = (0..y.len())
        .map(|i| if i == dropped { 0.0 } else { [0.5, 1.5, 2.5][i % 3] })
        .collect();
    let (x_sub, y_sub, re_sub) = slope_subset(|i| i != dropped);
    let w_sub: Vec<f64> = weights
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != dropped)
        .map(|(_, w)| *w)
        .collect();
    assert_eq!(re_sub.q(), re.q());

    let theta = [0.9, 0.2, 0.6];
    let mut full =
        PlsEvaluator::from_random_effects(&x, &y, &re, Some(&weights), None, true).unwrap();
    let mut reduced =
        PlsEvaluator::from_random_effects(&x_sub, &y_sub, &re_sub, Some(&w_sub), None, true)
            .unwrap();
    full.evaluate(&theta).unwrap();
    reduced.evaluate(&theta).unwrap();
    let (a, b) = (full.solution().unwrap(), reduced.solution().unwrap());

    assert_relative_eq!(a.pwrss, b.pwrss, epsilon = 1e-10, max_relative = 1e-10);
    assert_relative_eq!(a.ld_l2, b.ld_l2, epsilon = 1e-10);
    assert_relative_eq!(a.ld_rx2, b.ld_rx2, epsilon = 1e-10);
    for (ba, bb) in a.beta.iter().zip(&b.beta) {
        assert_relative_eq!(*ba, *bb, epsilon = 1e-10);
    }
    for (ba, bb) in a.b.iter().zip(&b.b) {
        assert_relative_eq!(*ba, *bb, epsilon = 1e-10);
    }
}

//! Statistical distances between calibration windows.
//!
//! The change detector consumes `yao_1965`; the remaining distances are kept
//! for diagnostics and for the queue admission KL gate. All functions return
//! NaN on dimension mismatches or singular covariances; callers treat
//! non-finite divergences as "consistent".
use nalgebra::{DMatrix, DVector};

use crate::math::chi2_cdf;
use crate::window::CalibrationWindow;

/// Floor for the two-sample p-values. The chi-square CDF saturates to 1 for
/// very large statistics, which would collapse a maximally inconsistent
/// comparison onto the `p == 0` "no comparison" sentinel.
const MIN_P_VALUE: f64 = 1e-16;

fn compatible(w0: &CalibrationWindow, w1: &CalibrationWindow) -> Option<usize> {
    let d = w0.mean.len();
    if d == 0
        || w1.mean.len() != d
        || w0.covariance.nrows() != d
        || w0.covariance.ncols() != d
        || w1.covariance.nrows() != d
        || w1.covariance.ncols() != d
    {
        return None;
    }
    Some(d)
}

/// Symmetric Kullback-Leibler divergence between the two Gaussian
/// posteriors: `0.5 (KL(p0 || p1) + KL(p1 || p0))`. The log-det terms
/// cancel in the symmetrised form.
pub fn kl_divergence(w0: &CalibrationWindow, w1: &CalibrationWindow) -> f64 {
    let Some(d) = compatible(w0, w1) else {
        return f64::NAN;
    };
    let (Some(inv0), Some(inv1)) = (
        w0.covariance.clone().try_inverse(),
        w1.covariance.clone().try_inverse(),
    ) else {
        return f64::NAN;
    };
    let diff = &w0.mean - &w1.mean;
    let trace = (&inv1 * &w0.covariance).trace() + (&inv0 * &w1.covariance).trace();
    let maha = (diff.transpose() * (inv0 + inv1) * &diff)[(0, 0)];
    0.25 * (trace + maha - 2.0 * d as f64)
}

/// Hotelling two-sample T-squared statistic with pooled covariance.
pub fn hotelling_t2(w0: &CalibrationWindow, w1: &CalibrationWindow) -> f64 {
    if compatible(w0, w1).is_none() {
        return f64::NAN;
    }
    let n0 = w0.num_measurements as f64;
    let n1 = w1.num_measurements as f64;
    if n0 < 2.0 || n1 < 2.0 {
        return f64::NAN;
    }
    let pooled: DMatrix<f64> =
        (&w0.covariance * (n0 - 1.0) + &w1.covariance * (n1 - 1.0)) / (n0 + n1 - 2.0);
    let Some(inv) = pooled.try_inverse() else {
        return f64::NAN;
    };
    let diff = &w0.mean - &w1.mean;
    (n0 * n1 / (n0 + n1)) * (diff.transpose() * inv * &diff)[(0, 0)]
}

/// Bhattacharyya distance between the two Gaussians.
pub fn bhattacharyya(w0: &CalibrationWindow, w1: &CalibrationWindow) -> f64 {
    if compatible(w0, w1).is_none() {
        return f64::NAN;
    }
    let avg: DMatrix<f64> = (&w0.covariance + &w1.covariance) * 0.5;
    let Some(avg_inv) = avg.clone().try_inverse() else {
        return f64::NAN;
    };
    let det_avg = avg.determinant();
    let det0 = w0.covariance.determinant();
    let det1 = w1.covariance.determinant();
    if det_avg <= 0.0 || det0 <= 0.0 || det1 <= 0.0 {
        return f64::NAN;
    }
    let diff = &w0.mean - &w1.mean;
    let maha = (diff.transpose() * avg_inv * &diff)[(0, 0)];
    0.125 * maha + 0.5 * (det_avg / (det0 * det1).sqrt()).ln()
}

/// Behrens-Fisher statistic with unequal covariances, shared by the Yao and
/// Nel-Van der Merwe approximations: `d^T (S0/n0 + S1/n1)^-1 d` plus the
/// pieces needed for the effective degrees of freedom.
struct BehrensFisher {
    t2: f64,
    s0n: DMatrix<f64>,
    s1n: DMatrix<f64>,
    se: DMatrix<f64>,
    se_inv: DMatrix<f64>,
    diff: DVector<f64>,
    n0: f64,
    n1: f64,
}

fn behrens_fisher(w0: &CalibrationWindow, w1: &CalibrationWindow) -> Option<BehrensFisher> {
    compatible(w0, w1)?;
    let n0 = w0.num_measurements as f64;
    let n1 = w1.num_measurements as f64;
    if n0 < 2.0 || n1 < 2.0 {
        return None;
    }
    let s0n = &w0.covariance / n0;
    let s1n = &w1.covariance / n1;
    let se = &s0n + &s1n;
    let se_inv = se.clone().try_inverse()?;
    let diff = &w0.mean - &w1.mean;
    let t2 = (diff.transpose() * &se_inv * &diff)[(0, 0)];
    if !t2.is_finite() {
        return None;
    }
    Some(BehrensFisher {
        t2,
        s0n,
        s1n,
        se,
        se_inv,
        diff,
        n0,
        n1,
    })
}

/// Yao (1965) two-sample test. Returns the p-value of the T-squared-like
/// statistic under a chi-square with Yao's effective degrees of freedom.
/// High values mean the two distributions are mutually consistent.
pub fn yao_1965(w0: &CalibrationWindow, w1: &CalibrationWindow) -> f64 {
    let Some(bf) = behrens_fisher(w0, w1) else {
        return f64::NAN;
    };
    if bf.t2 <= 0.0 {
        // Identical means carry no evidence of drift.
        return 1.0;
    }
    // 1/f = sum_i (1/n_i) * ((d^T Se^-1 Si* Se^-1 d) / t2)^2
    let base = bf.se_inv.clone() * &bf.diff;
    let q0 = (base.transpose() * &bf.s0n * &base)[(0, 0)] / bf.t2;
    let q1 = (base.transpose() * &bf.s1n * &base)[(0, 0)] / bf.t2;
    let inv_f = q0 * q0 / bf.n0 + q1 * q1 / bf.n1;
    if inv_f <= 0.0 || !inv_f.is_finite() {
        return f64::NAN;
    }
    let f = 1.0 / inv_f;
    (1.0 - chi2_cdf(bf.t2, f)).max(MIN_P_VALUE)
}

/// Nel & Van der Merwe (1986) two-sample test; same statistic as Yao with a
/// trace-based effective degrees of freedom.
pub fn nel_van_der_merwe_1986(w0: &CalibrationWindow, w1: &CalibrationWindow) -> f64 {
    let Some(bf) = behrens_fisher(w0, w1) else {
        return f64::NAN;
    };
    if bf.t2 <= 0.0 {
        return 1.0;
    }
    let tr_sq = |m: &DMatrix<f64>| (m * m).trace();
    let num = tr_sq(&bf.se) + bf.se.trace().powi(2);
    let den = (tr_sq(&bf.s0n) + bf.s0n.trace().powi(2)) / (bf.n0 - 1.0)
        + (tr_sq(&bf.s1n) + bf.s1n.trace().powi(2)) / (bf.n1 - 1.0);
    if den <= 0.0 || !num.is_finite() {
        return f64::NAN;
    }
    let f = num / den;
    (1.0 - chi2_cdf(bf.t2, f)).max(MIN_P_VALUE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{DMatrix, DVector};

    fn gaussian(mean: &[f64], diag: &[f64], n: usize) -> CalibrationWindow {
        CalibrationWindow {
            start_index: 0,
            end_index: 10,
            mean: DVector::from_row_slice(mean),
            covariance: DMatrix::from_diagonal(&DVector::from_row_slice(diag)),
            num_measurements: n,
            ..Default::default()
        }
    }

    #[test]
    fn kl_of_identical_gaussians_is_zero() {
        let w = gaussian(&[1.0, 2.0], &[0.5, 0.25], 50);
        let kl = kl_divergence(&w, &w.clone());
        assert!(kl.abs() < 1e-12, "kl = {kl}");
    }

    #[test]
    fn kl_grows_with_mean_separation() {
        let w0 = gaussian(&[0.0, 0.0], &[1.0, 1.0], 50);
        let near = gaussian(&[0.5, 0.0], &[1.0, 1.0], 50);
        let far = gaussian(&[3.0, 0.0], &[1.0, 1.0], 50);
        assert!(kl_divergence(&w0, &near) < kl_divergence(&w0, &far));
    }

    #[test]
    fn yao_consistent_vs_drifted() {
        let q = gaussian(&[400.0, 400.0, 320.0, 240.0], &[0.5, 0.5, 0.5, 0.5], 400);
        let same = gaussian(&[400.2, 399.9, 320.1, 240.0], &[0.6, 0.6, 0.6, 0.6], 120);
        let drifted = gaussian(&[440.0, 400.0, 320.0, 240.0], &[0.6, 0.6, 0.6, 0.6], 120);
        let p_same = yao_1965(&q, &same);
        let p_drift = yao_1965(&q, &drifted);
        assert!(p_same > 0.2, "consistent sample rejected: {p_same}");
        assert!(p_drift < 0.2, "drifted sample accepted: {p_drift}");
    }

    #[test]
    fn yao_and_hotelling_are_symmetric() {
        let w0 = gaussian(&[1.0, 2.0, 3.0], &[0.5, 1.0, 0.2], 40);
        let w1 = gaussian(&[1.5, 1.0, 3.5], &[0.7, 0.4, 0.9], 90);
        let y01 = yao_1965(&w0, &w1);
        let y10 = yao_1965(&w1, &w0);
        assert!((y01 - y10).abs() < 1e-10);
        let h01 = hotelling_t2(&w0, &w1);
        let h10 = hotelling_t2(&w1, &w0);
        assert!((h01 - h10).abs() < 1e-8);
    }

    #[test]
    fn identical_means_are_fully_consistent() {
        let w0 = gaussian(&[1.0, 2.0], &[0.5, 0.5], 40);
        let w1 = gaussian(&[1.0, 2.0], &[0.9, 0.9], 70);
        assert_eq!(yao_1965(&w0, &w1), 1.0);
        assert_eq!(nel_van_der_merwe_1986(&w0, &w1), 1.0);
    }

    #[test]
    fn dimension_mismatch_is_nan() {
        let w0 = gaussian(&[1.0, 2.0], &[0.5, 0.5], 40);
        let w1 = gaussian(&[1.0], &[0.5], 40);
        assert!(kl_divergence(&w0, &w1).is_nan());
        assert!(yao_1965(&w0, &w1).is_nan());
        assert!(bhattacharyya(&w0, &w1).is_nan());
    }

    #[test]
    fn bhattacharyya_zero_for_identical() {
        let w = gaussian(&[1.0, -1.0], &[0.3, 0.8], 40);
        assert!(bhattacharyya(&w, &w.clone()).abs() < 1e-12);
    }

    #[test]
    fn nel_van_der_merwe_tracks_yao() {
        let q = gaussian(&[10.0, 10.0], &[0.4, 0.4], 300);
        let drifted = gaussian(&[14.0, 10.0], &[0.5, 0.5], 100);
        assert!(nel_van_der_merwe_1986(&q, &drifted) < 0.2);
    }
}

use nalgebra::{DMatrix, DVector};
use proptest::prelude::*;
use selfcal_core::math::{chi2_cdf, chi2inv};
use selfcal_core::stats::{hotelling_t2, kl_divergence, nel_van_der_merwe_1986, yao_1965};
use selfcal_core::window::{CalibrationWindow, CovarianceWeights, window_score};

const DIM: usize = 3;

fn psd_from(values: &[f64]) -> DMatrix<f64> {
    // A^T A + eps I is symmetric positive definite.
    let a = DMatrix::from_row_slice(DIM, DIM, values);
    a.transpose() * &a + DMatrix::identity(DIM, DIM) * 1e-3
}

fn window(mean: &[f64], cov: DMatrix<f64>, n: usize) -> CalibrationWindow {
    CalibrationWindow {
        start_index: 0,
        end_index: 10,
        mean: DVector::from_row_slice(mean),
        covariance: cov,
        num_measurements: n,
        ..Default::default()
    }
}

prop_compose! {
    fn matrix_entries()(v in prop::collection::vec(-2.0..2.0f64, DIM * DIM)) -> Vec<f64> {
        v
    }
}

prop_compose! {
    fn mean_entries()(v in prop::collection::vec(-10.0..10.0f64, DIM)) -> Vec<f64> {
        v
    }
}

proptest! {
    // Inflating the covariance by any PSD matrix never lowers the score.
    #[test]
    fn score_is_monotone_under_psd_inflation(
        base in matrix_entries(),
        extra in matrix_entries(),
        mean in mean_entries(),
    ) {
        let weights = CovarianceWeights::from_slice(&[1.0, 1.7, 3.2]);
        let sigma = psd_from(&base);
        let inflation = {
            let a = DMatrix::from_row_slice(DIM, DIM, &extra);
            a.transpose() * &a
        };
        let w0 = window(&mean, sigma.clone(), 100);
        let w1 = window(&mean, sigma + inflation, 100);
        let s0 = window_score(&w0, &weights);
        let s1 = window_score(&w1, &weights);
        prop_assert!(s0.is_finite());
        prop_assert!(s1 >= s0 - 1e-9, "inflation lowered score: {s0} -> {s1}");
    }

    // Two-sample distances are symmetric in their arguments.
    #[test]
    fn distances_are_symmetric(
        m0 in mean_entries(),
        m1 in mean_entries(),
        c0 in matrix_entries(),
        c1 in matrix_entries(),
        n0 in 5usize..500,
        n1 in 5usize..500,
    ) {
        let w0 = window(&m0, psd_from(&c0), n0);
        let w1 = window(&m1, psd_from(&c1), n1);

        let y01 = yao_1965(&w0, &w1);
        let y10 = yao_1965(&w1, &w0);
        if y01.is_finite() || y10.is_finite() {
            prop_assert!((y01 - y10).abs() < 1e-8, "yao asymmetric: {y01} vs {y10}");
        }

        let h01 = hotelling_t2(&w0, &w1);
        let h10 = hotelling_t2(&w1, &w0);
        if h01.is_finite() || h10.is_finite() {
            let scale = h01.abs().max(1.0);
            prop_assert!((h01 - h10).abs() / scale < 1e-8, "hotelling asymmetric");
        }

        let k01 = kl_divergence(&w0, &w1);
        let k10 = kl_divergence(&w1, &w0);
        if k01.is_finite() || k10.is_finite() {
            let scale = k01.abs().max(1.0);
            prop_assert!((k01 - k10).abs() / scale < 1e-8, "symmetric KL asymmetric");
        }
    }

    // P-values live in [0, 1] whenever they are finite.
    #[test]
    fn p_values_are_probabilities(
        m0 in mean_entries(),
        m1 in mean_entries(),
        c0 in matrix_entries(),
        c1 in matrix_entries(),
    ) {
        let w0 = window(&m0, psd_from(&c0), 50);
        let w1 = window(&m1, psd_from(&c1), 120);
        for p in [yao_1965(&w0, &w1), nel_van_der_merwe_1986(&w0, &w1)] {
            if p.is_finite() {
                prop_assert!((0.0..=1.0).contains(&p), "p-value out of range: {p}");
            }
        }
    }

    // chi2inv is the right inverse of chi2_cdf across dofs.
    #[test]
    fn chi2_inverse_round_trips(p in 0.01..0.99f64, dof in 1.0..50.0f64) {
        let x = chi2inv(p, dof);
        prop_assert!((chi2_cdf(x, dof) - p).abs() < 1e-6);
    }

    #[test]
    fn chi2inv_is_monotone_in_p(p in 0.05..0.90f64, dof in 1.0..50.0f64) {
        prop_assert!(chi2inv(p + 0.05, dof) >= chi2inv(p, dof));
    }
}

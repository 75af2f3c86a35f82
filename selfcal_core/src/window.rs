//! Calibration windows and the informativeness score.
use nalgebra::{DMatrix, DVector};

/// Index value meaning "window not anchored to a pose range".
pub const UNSET_INDEX: usize = usize::MAX;

/// A contiguous pose range together with the posterior distribution of the
/// calibration parameters estimated over it.
#[derive(Debug, Clone)]
pub struct CalibrationWindow {
    /// `[start_index, end_index)` into the pose sequence.
    pub start_index: usize,
    pub end_index: usize,
    pub mean: DVector<f64>,
    pub covariance: DMatrix<f64>,
    /// Weighted log-det of the covariance; lower is more informative.
    pub score: f64,
    /// Divergence against the queue distribution, filled on comparison.
    pub kl_divergence: f64,
    /// Projection residual count backing the posterior.
    pub num_measurements: usize,
}

impl Default for CalibrationWindow {
    fn default() -> Self {
        Self {
            start_index: UNSET_INDEX,
            end_index: UNSET_INDEX,
            mean: DVector::zeros(0),
            covariance: DMatrix::zeros(0, 0),
            score: f64::MAX,
            kl_divergence: 0.0,
            num_measurements: 0,
        }
    }
}

impl CalibrationWindow {
    pub fn is_empty(&self) -> bool {
        self.mean.len() == 0
    }

    /// Pose-range intersection test; unset ranges never overlap.
    pub fn overlaps(&self, other: &CalibrationWindow) -> bool {
        if self.start_index == UNSET_INDEX || other.start_index == UNSET_INDEX {
            return false;
        }
        self.start_index < other.end_index && other.start_index < self.end_index
    }

    /// True when mean and covariance exist and contain only finite values.
    pub fn has_finite_stats(&self) -> bool {
        !self.is_empty()
            && self.mean.iter().all(|v| v.is_finite())
            && self.covariance.iter().all(|v| v.is_finite())
    }
}

/// Numerical rank via singular values with a relative tolerance.
pub fn covariance_rank(m: &DMatrix<f64>) -> usize {
    if m.nrows() == 0 || m.nrows() != m.ncols() || m.iter().any(|v| !v.is_finite()) {
        return 0;
    }
    let svd = m.clone().svd(false, false);
    let max_sv = svd.singular_values.iter().cloned().fold(0.0, f64::max);
    if max_sv <= 0.0 {
        return 0;
    }
    let tol = max_sv * 1e-10 * m.nrows() as f64;
    svd.singular_values.iter().filter(|&&s| s > tol).count()
}

pub fn is_full_rank(m: &DMatrix<f64>, dim: usize) -> bool {
    dim > 0 && covariance_rank(m) == dim
}

/// Fixed diagonal weighting that normalises heterogeneous parameter units
/// before scoring (focal/center in pixels vs. a distortion coefficient).
#[derive(Debug, Clone)]
pub struct CovarianceWeights(pub DVector<f64>);

impl CovarianceWeights {
    pub fn ones(dim: usize) -> Self {
        Self(DVector::from_element(dim, 1.0))
    }

    pub fn from_slice(w: &[f64]) -> Self {
        Self(DVector::from_row_slice(w))
    }

    /// `S'_{ij} = w_i w_j S_{ij}` — a congruence by diag(w), so definiteness
    /// is preserved.
    pub fn apply(&self, cov: &DMatrix<f64>) -> DMatrix<f64> {
        let n = cov.nrows();
        let mut out = cov.clone();
        for i in 0..n {
            for j in 0..n {
                out[(i, j)] *= self.0[i] * self.0[j];
            }
        }
        out
    }

    /// Weights resized to `dim`: extra entries get weight 1 (the extrinsics
    /// block when the mode appends one), surplus entries are dropped.
    pub fn resized(&self, dim: usize) -> CovarianceWeights {
        let mut w = DVector::from_element(dim, 1.0);
        for i in 0..dim.min(self.0.len()) {
            w[i] = self.0[i];
        }
        CovarianceWeights(w)
    }
}

/// Weighted log-determinant of the window covariance. NaN/infinite inputs
/// and rank-deficient covariances score +inf (worst).
pub fn window_score(window: &CalibrationWindow, weights: &CovarianceWeights) -> f64 {
    if !window.has_finite_stats() {
        return f64::INFINITY;
    }
    let dim = window.mean.len();
    if window.covariance.nrows() != dim || weights.0.len() != dim {
        return f64::INFINITY;
    }
    if !is_full_rank(&window.covariance, dim) {
        return f64::INFINITY;
    }
    let weighted = weights.apply(&window.covariance);
    let det = weighted.determinant();
    if !det.is_finite() || det <= 0.0 {
        return f64::INFINITY;
    }
    det.ln()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(mean: &[f64], diag: &[f64]) -> CalibrationWindow {
        CalibrationWindow {
            start_index: 0,
            end_index: 10,
            mean: DVector::from_row_slice(mean),
            covariance: DMatrix::from_diagonal(&DVector::from_row_slice(diag)),
            num_measurements: 100,
            ..Default::default()
        }
    }

    #[test]
    fn score_of_tighter_posterior_is_lower() {
        let weights = CovarianceWeights::ones(3);
        let tight = window(&[1.0, 2.0, 3.0], &[0.1, 0.1, 0.1]);
        let loose = window(&[1.0, 2.0, 3.0], &[1.0, 1.0, 1.0]);
        assert!(window_score(&tight, &weights) < window_score(&loose, &weights));
    }

    #[test]
    fn rank_deficient_scores_infinite() {
        let weights = CovarianceWeights::ones(3);
        let w = window(&[1.0, 2.0, 3.0], &[0.5, 0.5, 0.0]);
        assert_eq!(covariance_rank(&w.covariance), 2);
        assert!(window_score(&w, &weights).is_infinite());
    }

    #[test]
    fn nan_stats_score_infinite() {
        let weights = CovarianceWeights::ones(2);
        let mut w = window(&[1.0, f64::NAN], &[0.5, 0.5]);
        assert!(window_score(&w, &weights).is_infinite());
        w.mean[1] = 1.0;
        w.covariance[(0, 0)] = f64::NAN;
        assert!(window_score(&w, &weights).is_infinite());
    }

    #[test]
    fn overlap_semantics() {
        let a = window(&[0.0], &[1.0]);
        let mut b = a.clone();
        b.start_index = 10;
        b.end_index = 20;
        assert!(!a.overlaps(&b));
        b.start_index = 9;
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        let unset = CalibrationWindow::default();
        assert!(!a.overlaps(&unset));
    }

    #[test]
    fn weights_are_a_congruence() {
        let weights = CovarianceWeights::from_slice(&[2.0, 3.0]);
        let cov = DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.5, 2.0]);
        let out = weights.apply(&cov);
        assert_eq!(out[(0, 0)], 4.0);
        assert_eq!(out[(0, 1)], 3.0);
        assert_eq!(out[(1, 0)], 3.0);
        assert_eq!(out[(1, 1)], 18.0);
    }
}

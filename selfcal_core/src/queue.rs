//! Bounded priority queue of informative calibration windows.
//!
//! The queue keeps up to `queue_length` windows with mutually disjoint pose
//! ranges. Admission favours windows with a low (informative) score that are
//! also statistically distinct from the joint distribution the queue already
//! represents, so the queue tracks the long-horizon posterior instead of
//! collapsing onto one well-observed stretch of trajectory.
use nalgebra::{DMatrix, DVector};

use crate::stats;
use crate::window::{CalibrationWindow, CovarianceWeights, is_full_rank, window_score};

/// Divergence a candidate must keep from the queue distribution to evict a
/// better-covered but less distinct window.
pub const KL_ADMISSION_THRESHOLD: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    /// Queue had room.
    Admitted,
    /// Candidate replaced the window at this slot (overlap or eviction).
    Replaced(usize),
    Rejected,
}

#[derive(Debug)]
pub struct WindowQueue {
    windows: Vec<CalibrationWindow>,
    queue_length: usize,
    needs_update: bool,
    /// Joint posterior over all queued windows, set by the controller after
    /// `analyze_priority_queue`.
    distribution: CalibrationWindow,
}

impl WindowQueue {
    pub fn new(queue_length: usize) -> Self {
        Self {
            windows: Vec::with_capacity(queue_length),
            queue_length: queue_length.max(1),
            needs_update: false,
            distribution: CalibrationWindow::default(),
        }
    }

    pub fn windows(&self) -> &[CalibrationWindow] {
        &self.windows
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn queue_length(&self) -> usize {
        self.queue_length
    }

    pub fn is_full(&self) -> bool {
        self.windows.len() >= self.queue_length
    }

    /// True iff membership changed since the last `clear_needs_update`.
    pub fn needs_update(&self) -> bool {
        self.needs_update
    }

    pub fn clear_needs_update(&mut self) {
        self.needs_update = false;
    }

    pub fn clear(&mut self) {
        self.windows.clear();
        self.distribution = CalibrationWindow::default();
        self.needs_update = false;
    }

    pub fn distribution(&self) -> &CalibrationWindow {
        &self.distribution
    }

    pub fn set_distribution(
        &mut self,
        covariance: DMatrix<f64>,
        mean: DVector<f64>,
        num_measurements: usize,
    ) {
        self.distribution.covariance = covariance;
        self.distribution.mean = mean;
        self.distribution.num_measurements = num_measurements;
    }

    /// Union of the queued pose ranges, sorted by start index.
    pub fn ranges(&self) -> Vec<(usize, usize)> {
        let mut ranges: Vec<(usize, usize)> = self
            .windows
            .iter()
            .map(|w| (w.start_index, w.end_index))
            .collect();
        ranges.sort_unstable();
        ranges
    }

    /// Apply the admission policy to `candidate`, scoring it first.
    ///
    /// 1. Non-finite score (NaN stats or rank-deficient covariance) rejects.
    /// 2. A candidate overlapping a queued window may only replace that
    ///    window, and only with a better score.
    /// 3. With room available the candidate is admitted outright.
    /// 4. A full queue evicts its worst-scored member when the candidate
    ///    scores better and its KL divergence from the queue distribution
    ///    exceeds the admission threshold.
    pub fn try_admit(
        &mut self,
        candidate: &mut CalibrationWindow,
        weights: &CovarianceWeights,
    ) -> AdmitOutcome {
        candidate.score = window_score(candidate, weights);
        if !candidate.score.is_finite() {
            tracing::debug!(
                start = candidate.start_index,
                end = candidate.end_index,
                "rejecting window with unusable posterior"
            );
            return AdmitOutcome::Rejected;
        }
        if !is_full_rank(&candidate.covariance, candidate.mean.len()) {
            return AdmitOutcome::Rejected;
        }

        let overlapping: Vec<usize> = self
            .windows
            .iter()
            .enumerate()
            .filter(|(_, w)| w.overlaps(candidate))
            .map(|(i, _)| i)
            .collect();
        if let Some(&first) = overlapping.first() {
            // Disjointness is an invariant: an overlapping candidate may only
            // displace everything it overlaps, and only when it beats each of
            // those windows on score.
            if overlapping
                .iter()
                .all(|&i| candidate.score < self.windows[i].score)
            {
                tracing::debug!(
                    slot = first,
                    displaced = overlapping.len(),
                    new_score = candidate.score,
                    "replacing overlapping window(s)"
                );
                for &i in overlapping.iter().rev() {
                    self.windows.remove(i);
                }
                self.windows.insert(first.min(self.windows.len()), candidate.clone());
                self.needs_update = true;
                return AdmitOutcome::Replaced(first);
            }
            return AdmitOutcome::Rejected;
        }

        if !self.is_full() {
            self.windows.push(candidate.clone());
            self.needs_update = true;
            return AdmitOutcome::Admitted;
        }

        let Some(worst_idx) = self
            .windows
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.score.total_cmp(&b.1.score))
            .map(|(i, _)| i)
        else {
            return AdmitOutcome::Rejected;
        };
        if candidate.score >= self.windows[worst_idx].score {
            return AdmitOutcome::Rejected;
        }

        // Distinctness gate: an informative window from an already
        // well-represented region adds nothing to the joint posterior.
        let kl = if self.distribution.is_empty() {
            f64::INFINITY
        } else {
            stats::kl_divergence(candidate, &self.distribution)
        };
        candidate.kl_divergence = kl;
        if kl.is_nan() || kl <= KL_ADMISSION_THRESHOLD {
            return AdmitOutcome::Rejected;
        }

        tracing::debug!(
            slot = worst_idx,
            kl,
            new_score = candidate.score,
            old_score = self.windows[worst_idx].score,
            "evicting least informative window"
        );
        self.windows[worst_idx] = candidate.clone();
        self.needs_update = true;
        AdmitOutcome::Replaced(worst_idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{DMatrix, DVector};

    fn window(start: usize, end: usize, sigma: f64) -> CalibrationWindow {
        CalibrationWindow {
            start_index: start,
            end_index: end,
            mean: DVector::from_row_slice(&[400.0, 400.0, 320.0]),
            covariance: DMatrix::from_diagonal(&DVector::from_element(3, sigma)),
            num_measurements: 200,
            ..Default::default()
        }
    }

    fn weights() -> CovarianceWeights {
        CovarianceWeights::ones(3)
    }

    #[test]
    fn fills_until_capacity_then_rejects_worse() {
        let mut q = WindowQueue::new(3);
        for i in 0..3 {
            let mut w = window(i * 10, (i + 1) * 10, 0.5);
            assert_eq!(q.try_admit(&mut w, &weights()), AdmitOutcome::Admitted);
        }
        assert!(q.is_full());
        assert!(q.needs_update());

        // Same-score candidate from new territory cannot evict.
        q.set_distribution(
            DMatrix::from_diagonal(&DVector::from_element(3, 0.2)),
            DVector::from_row_slice(&[400.0, 400.0, 320.0]),
            600,
        );
        let mut same = window(40, 50, 0.5);
        assert_eq!(q.try_admit(&mut same, &weights()), AdmitOutcome::Rejected);
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn eviction_requires_better_score_and_distinctness() {
        let mut q = WindowQueue::new(2);
        let mut a = window(0, 10, 1.0);
        let mut b = window(10, 20, 1.0);
        q.try_admit(&mut a, &weights());
        q.try_admit(&mut b, &weights());
        q.clear_needs_update();

        // Distribution identical to the candidate: KL ~ 0, so even a much
        // tighter window is rejected as redundant.
        q.set_distribution(
            DMatrix::from_diagonal(&DVector::from_element(3, 0.01)),
            DVector::from_row_slice(&[400.0, 400.0, 320.0]),
            400,
        );
        let mut tight_same = window(30, 40, 0.01);
        assert_eq!(
            q.try_admit(&mut tight_same, &weights()),
            AdmitOutcome::Rejected
        );
        assert!(!q.needs_update());

        // A distinct distribution with a better score evicts the worst.
        let mut tight_distinct = window(50, 60, 0.01);
        tight_distinct.mean = DVector::from_row_slice(&[401.0, 400.5, 320.4]);
        let outcome = q.try_admit(&mut tight_distinct, &weights());
        assert!(matches!(outcome, AdmitOutcome::Replaced(_)));
        assert!(q.needs_update());
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn overlapping_candidate_replaces_only_its_window() {
        let mut q = WindowQueue::new(3);
        let mut a = window(0, 10, 1.0);
        let mut b = window(10, 20, 1.0);
        q.try_admit(&mut a, &weights());
        q.try_admit(&mut b, &weights());

        // Straddles both queued windows: displaces both in one step.
        let mut overlap = window(5, 15, 0.1);
        let outcome = q.try_admit(&mut overlap, &weights());
        assert_eq!(outcome, AdmitOutcome::Replaced(0));
        assert_eq!(q.len(), 1);
        // Disjointness holds afterwards.
        for (i, wi) in q.windows().iter().enumerate() {
            for wj in q.windows().iter().skip(i + 1) {
                assert!(!wi.overlaps(wj));
            }
        }

        // A worse overlapping candidate is dropped.
        let mut worse = window(5, 15, 10.0);
        assert_eq!(q.try_admit(&mut worse, &weights()), AdmitOutcome::Rejected);
    }

    #[test]
    fn rank_deficient_candidate_never_enters() {
        let mut q = WindowQueue::new(2);
        let mut w = window(0, 10, 1.0);
        w.covariance[(2, 2)] = 0.0;
        assert_eq!(q.try_admit(&mut w, &weights()), AdmitOutcome::Rejected);
        assert!(q.is_empty());
        assert!(!q.needs_update());
    }

    #[test]
    fn nan_candidate_never_enters() {
        let mut q = WindowQueue::new(2);
        let mut w = window(0, 10, 1.0);
        w.mean[0] = f64::NAN;
        assert_eq!(q.try_admit(&mut w, &weights()), AdmitOutcome::Rejected);
        let mut w = window(0, 10, 1.0);
        w.covariance[(1, 1)] = f64::INFINITY;
        assert_eq!(q.try_admit(&mut w, &weights()), AdmitOutcome::Rejected);
        assert!(q.is_empty());
    }

    #[test]
    fn clear_resets_distribution_and_flag() {
        let mut q = WindowQueue::new(2);
        let mut a = window(0, 10, 1.0);
        q.try_admit(&mut a, &weights());
        q.set_distribution(
            DMatrix::from_diagonal(&DVector::from_element(3, 0.2)),
            DVector::from_row_slice(&[1.0, 2.0, 3.0]),
            100,
        );
        q.clear();
        assert!(q.is_empty());
        assert!(q.distribution().is_empty());
        assert!(!q.needs_update());
    }
}

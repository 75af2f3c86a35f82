//! Drift detection over the per-keyframe divergence signal.
//!
//! Each keyframe yields a Yao (1965) p-value between the newest candidate
//! window and the queue's joint distribution. A run of low p-values while
//! the queue is full means the live parameters no longer explain recent
//! observations.
pub const DRIFT_THRESHOLD: f64 = 0.2;

/// Heuristic ceiling on the batch score below which recalibration is
/// considered converged.
pub const BATCH_SCORE_EXIT: f64 = 1e7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftDecision {
    /// Divergence consistent (or unusable); counter reset.
    Consistent,
    /// k-th consecutive suspicious keyframe, not yet conclusive.
    Suspect(usize),
    /// Enough consecutive low-divergence keyframes: parameters changed.
    Drifted,
}

#[derive(Debug)]
pub struct ChangeDetector {
    threshold: f64,
    num_change_needed: usize,
    count: usize,
}

impl ChangeDetector {
    pub fn new(num_change_needed: usize) -> Self {
        Self {
            threshold: DRIFT_THRESHOLD,
            num_change_needed: num_change_needed.max(1),
            count: 0,
        }
    }

    pub fn num_change_needed(&self) -> usize {
        self.num_change_needed
    }

    pub fn suspect_count(&self) -> usize {
        self.count
    }

    /// Feed one keyframe's divergence. The suspicion counter only advances
    /// while the queue is full and the calibration is currently trusted;
    /// non-finite and zero divergences count as consistent.
    pub fn observe(
        &mut self,
        divergence: f64,
        queue_full: bool,
        calibration_known: bool,
    ) -> DriftDecision {
        let div = if divergence.is_finite() {
            divergence
        } else {
            0.0
        };
        if div > 0.0 && div < self.threshold && queue_full && calibration_known {
            self.count += 1;
            if self.count >= self.num_change_needed {
                self.count = 0;
                return DriftDecision::Drifted;
            }
            return DriftDecision::Suspect(self.count);
        }
        self.count = 0;
        DriftDecision::Consistent
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }
}

/// Exit test for recalibration: the full-batch posterior is tight enough,
/// or the batch range has grown past twice the segment length without
/// converging (give up and trust what we have).
pub fn batch_recalibration_complete(score: f64, range_len: usize, segment_length: usize) -> bool {
    (score.is_finite() && score != 0.0 && score < BATCH_SCORE_EXIT)
        || range_len > 2 * segment_length
}

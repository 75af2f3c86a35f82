//! Domain and build errors for the self-calibration engine.
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum CalibError {
    #[error("empty pose range")]
    EmptyRange,
    #[error("rank-deficient calibration covariance (rank {rank} of {dim})")]
    RankDeficient { rank: usize, dim: usize },
    #[error("extrinsics estimation requires inertial measurements")]
    DisallowedMode,
    #[error("configuration error: {0}")]
    Config(String),
    #[error("tracker error: {0}")]
    Tracker(String),
    #[error("solver error: {0}")]
    Solver(String),
    #[error("io error: {0}")]
    Io(String),
}

#[derive(Debug, Error, Clone)]
pub enum BuildError {
    #[error("missing feature tracker")]
    MissingTracker,
    #[error("missing solver factory")]
    MissingSolverFactory,
    #[error("missing camera rig")]
    MissingRig,
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;

#[cfg(test)]
mod tests {
    use super::CalibError;

    #[test]
    fn display_is_stable() {
        assert_eq!(CalibError::EmptyRange.to_string(), "empty pose range");
        assert_eq!(
            CalibError::RankDeficient { rank: 3, dim: 5 }.to_string(),
            "rank-deficient calibration covariance (rank 3 of 5)"
        );
    }
}

//! Append-only diagnostic logs: `sigmas.txt`, `pq.txt`, `batch.txt`, and
//! `timings.txt`, truncated at engine start. One CSV line per keyframe:
//! `keyframe_id, cov_diagonal..., score, mean...[, kl_divergence]`.
//!
//! Logging failures are reported and swallowed; diagnostics never take the
//! pipeline down.
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::window::CalibrationWindow;

pub struct CalibLogs {
    sigmas: Option<BufWriter<File>>,
    pq: Option<BufWriter<File>>,
    batch: Option<BufWriter<File>>,
    timings: Option<BufWriter<File>>,
}

fn open_truncated(dir: &Path, name: &str) -> Option<BufWriter<File>> {
    let path: PathBuf = dir.join(name);
    match File::create(&path) {
        Ok(f) => Some(BufWriter::new(f)),
        Err(e) => {
            tracing::warn!(?path, error = %e, "could not open diagnostic log");
            None
        }
    }
}

fn csv(values: impl Iterator<Item = f64>) -> String {
    values
        .map(|v| format!("{v:.12e}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn window_line(keyframe_id: usize, window: &CalibrationWindow, score: f64) -> String {
    format!(
        "{}, {}, {}, {}",
        keyframe_id,
        csv(window.covariance.diagonal().iter().copied()),
        score,
        csv(window.mean.iter().copied()),
    )
}

impl CalibLogs {
    /// Truncate and open all four logs in `dir`.
    pub fn create(dir: &Path) -> Self {
        Self {
            sigmas: open_truncated(dir, "sigmas.txt"),
            pq: open_truncated(dir, "pq.txt"),
            batch: open_truncated(dir, "batch.txt"),
            timings: open_truncated(dir, "timings.txt"),
        }
    }

    /// A no-op sink for embedded use.
    pub fn disabled() -> Self {
        Self {
            sigmas: None,
            pq: None,
            batch: None,
            timings: None,
        }
    }

    pub fn batch(&mut self, keyframe_id: usize, window: &CalibrationWindow, score: f64) {
        write_line(&mut self.batch, window_line(keyframe_id, window, score));
    }

    pub fn pq(&mut self, keyframe_id: usize, window: &CalibrationWindow, score: f64, kl: f64) {
        let line = format!("{}, {}", window_line(keyframe_id, window, score), kl);
        write_line(&mut self.pq, line);
    }

    pub fn sigmas(&mut self, keyframe_id: usize, window: &CalibrationWindow, kl: f64) {
        let line = format!(
            "{}, {}",
            window_line(keyframe_id, window, window.score),
            kl
        );
        write_line(&mut self.sigmas, line);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn timings(
        &mut self,
        keyframe_id: usize,
        batch_s: f64,
        ba_s: f64,
        analyze_s: f64,
        queue_s: f64,
        snl_s: f64,
    ) {
        let line =
            format!("{keyframe_id}, {batch_s}, {ba_s}, {analyze_s}, {queue_s}, {snl_s}");
        write_line(&mut self.timings, line);
    }
}

fn write_line(sink: &mut Option<BufWriter<File>>, line: String) {
    if let Some(w) = sink
        && (writeln!(w, "{line}").is_err() || w.flush().is_err())
    {
        tracing::warn!("diagnostic log write failed");
        *sink = None;
    }
}

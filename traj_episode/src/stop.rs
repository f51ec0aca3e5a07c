//! Stop-frame detection: find where an action sequence settles into its terminal pose.
//!
//! Thresholds are adaptive: the 75th percentile of the per-frame position and
//! yaw deltas over the early part of the trajectory is scaled by `r_pos` /
//! `r_yaw` and floored at `pos_min` / `yaw_min`. Tuning notes:
//!
//! - smaller `r_pos`, `r_yaw`, `pos_min`, `yaw_min` or a larger `k` make the
//!   detector stricter and move the stop frame later;
//! - larger values make it more permissive and move the stop frame earlier;
//! - `hist_ratio` controls how much of the trajectory estimates "normal"
//!   motion. Lower ratios let the settled tail pull the thresholds down.

use ndarray::ArrayView2;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::pose::unwrap;
use crate::TrajError;

const YAW_COLUMN: usize = 5;
const PERCENTILE: f64 = 75.0;

/// What each frame's motion is measured against.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeltaMode {
    /// `|pose[i + 1] - pose[i]|`, one delta per consecutive pair.
    #[default]
    Neighbor,
    /// `|pose[i] - pose[N - 1]|`, one delta per frame.
    End,
}

impl DeltaMode {
    pub fn id(&self) -> &'static str {
        match self {
            DeltaMode::Neighbor => "neighbor",
            DeltaMode::End => "end",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StopConfig {
    pub r_pos: f64,
    pub r_yaw: f64,
    pub pos_min: f64,
    pub yaw_min: f64,
    pub k: usize,
    pub hist_ratio: f64,
    pub mode: DeltaMode,
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            r_pos: 0.0,
            r_yaw: 0.0,
            pos_min: 0.2,
            yaw_min: 0.4,
            k: 2,
            hist_ratio: 0.5,
            mode: DeltaMode::Neighbor,
        }
    }
}

impl StopConfig {
    pub fn validate(&self) -> Result<(), TrajError> {
        if self.k == 0 {
            return Err(TrajError::InvalidParameter(
                "stable window length k must be at least 1".into(),
            ));
        }
        if !(self.hist_ratio > 0.0 && self.hist_ratio <= 1.0) {
            return Err(TrajError::InvalidParameter(format!(
                "hist_ratio must lie in (0, 1], got {}",
                self.hist_ratio
            )));
        }
        for (name, value) in [("r_pos", self.r_pos), ("r_yaw", self.r_yaw)] {
            if value.is_nan() || value < 0.0 {
                return Err(TrajError::InvalidParameter(format!(
                    "{name} must be a non-negative factor, got {value}"
                )));
            }
        }
        for (name, value) in [("pos_min", self.pos_min), ("yaw_min", self.yaw_min)] {
            if value.is_nan() {
                return Err(TrajError::InvalidParameter(format!("{name} is NaN")));
            }
        }
        Ok(())
    }

    /// Non-fatal observations about the configuration, meant to be logged once.
    pub fn warnings(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.r_pos == 0.0 {
            out.push(format!(
                "r_pos is 0: position threshold collapses to the floor pos_min={}",
                self.pos_min
            ));
        }
        if self.r_yaw == 0.0 {
            out.push(format!(
                "r_yaw is 0: yaw threshold collapses to the floor yaw_min={}",
                self.yaw_min
            ));
        }
        out
    }

    /// Hex SHA-256 of the serialized parameters, reported next to each detection.
    pub fn params_hash_sha256(&self) -> Result<String, TrajError> {
        let bytes = serde_json::to_vec(self)?;
        let digest = Sha256::digest(&bytes);
        let mut out = String::with_capacity(digest.len() * 2);
        for b in digest {
            use std::fmt::Write;
            let _ = write!(&mut out, "{:02x}", b);
        }
        Ok(out)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct StopDetection {
    pub stop_frame: usize,
    pub pos_threshold: f64,
    pub yaw_threshold: f64,
}

impl StopDetection {
    /// Number of frames after the stop frame in a sequence of `len` frames.
    pub fn frames_after(&self, len: usize) -> usize {
        len.saturating_sub(1).saturating_sub(self.stop_frame)
    }

    /// Stop frame clamped to a valid row of a sequence of `len` frames.
    pub fn clamped(&self, len: usize) -> usize {
        self.stop_frame.min(len.saturating_sub(1))
    }
}

/// Locate the first frame of the stable tail of an `(N, 6)` action array.
///
/// Columns 0..3 are positions, column 5 is yaw. Fewer than two frames yields
/// stop frame 0 with the floor thresholds.
pub fn find_stop_frame(
    actions: ArrayView2<'_, f64>,
    config: &StopConfig,
) -> Result<StopDetection, TrajError> {
    config.validate()?;
    if actions.ncols() <= YAW_COLUMN {
        return Err(TrajError::InsufficientData(format!(
            "action array needs at least {} columns, got {}",
            YAW_COLUMN + 1,
            actions.ncols()
        )));
    }

    let n = actions.nrows();
    if n < 2 {
        return Ok(StopDetection {
            stop_frame: 0,
            pos_threshold: config.pos_min,
            yaw_threshold: config.yaw_min,
        });
    }

    let yaw_raw: Vec<f64> = actions.column(YAW_COLUMN).to_vec();
    let yaw = unwrap(&yaw_raw);
    let pose_at = |i: usize| [actions[[i, 0]], actions[[i, 1]], actions[[i, 2]], yaw[i]];

    let pairs: Vec<(usize, usize)> = match config.mode {
        DeltaMode::Neighbor => (0..n - 1).map(|i| (i, i + 1)).collect(),
        DeltaMode::End => (0..n).map(|i| (i, n - 1)).collect(),
    };

    let mut pos_delta = Vec::with_capacity(pairs.len());
    let mut yaw_delta = Vec::with_capacity(pairs.len());
    for (a, b) in pairs {
        let (pa, pb) = (pose_at(a), pose_at(b));
        let pos = (0..3)
            .map(|c| (pb[c] - pa[c]).abs())
            .fold(f64::NEG_INFINITY, f64::max);
        pos_delta.push(pos);
        yaw_delta.push((pb[3] - pa[3]).abs());
    }

    let hist_end = ((config.hist_ratio * pos_delta.len() as f64) as usize)
        .max(1)
        .min(pos_delta.len());
    let q_pos = percentile(&pos_delta[..hist_end], PERCENTILE);
    let q_yaw = percentile(&yaw_delta[..hist_end], PERCENTILE);
    let pos_threshold = (q_pos * config.r_pos).max(config.pos_min);
    let yaw_threshold = (q_yaw * config.r_yaw).max(config.yaw_min);

    let stable: Vec<bool> = pos_delta
        .iter()
        .zip(&yaw_delta)
        .map(|(p, y)| *p < pos_threshold && *y < yaw_threshold)
        .collect();

    let stop_frame = stable_tail_start(&stable, config.k);
    debug!(
        frames = n,
        mode = config.mode.id(),
        stop_frame,
        pos_threshold,
        yaw_threshold,
        "stop frame detected"
    );

    Ok(StopDetection {
        stop_frame,
        pos_threshold,
        yaw_threshold,
    })
}

/// Walk backward from the last full window while every `k`-window is stable.
///
/// The earliest window start reached is a delta index; one is added to turn it
/// into a frame index. When the stable run covers the whole delta array there
/// was no motion to step past and the answer is frame 0; that is the only case
/// where the `+1` conversion is skipped. Without any stable window at the end
/// the answer is `len(stable)`.
fn stable_tail_start(stable: &[bool], k: usize) -> usize {
    let len = stable.len();
    let mut earliest = len.saturating_sub(1);
    let mut reached_start = false;
    if k <= len {
        for i in (0..=len - k).rev() {
            if stable[i..i + k].iter().all(|s| *s) {
                earliest = i;
                reached_start = i == 0;
                continue;
            }
            break;
        }
    }
    if reached_start {
        0
    } else {
        earliest + 1
    }
}

/// Percentile with linear interpolation between closest ranks.
fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by_key(|v| OrderedFloat(*v));
    let rank = (q / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

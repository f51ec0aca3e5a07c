//! Per-episode feature statistics written to `episodes_stats.jsonl`.

use std::collections::BTreeMap;

use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::episode::Episode;
use crate::{FrameRecord, TrajError};

/// Column-wise statistics of one feature; scalar features have one column.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureStats {
    pub min: Vec<f64>,
    pub max: Vec<f64>,
    pub mean: Vec<f64>,
    /// Population standard deviation.
    pub std: Vec<f64>,
    pub count: Vec<usize>,
}

impl FeatureStats {
    /// Statistics over the rows of an `(n, d)` matrix.
    pub fn from_rows(rows: &Array2<f64>) -> Result<FeatureStats, TrajError> {
        let n = rows.nrows();
        if n == 0 {
            return Err(TrajError::InsufficientData(
                "feature statistics need at least one row".into(),
            ));
        }
        let fold = |init: f64, pick: fn(f64, f64) -> f64| -> Vec<f64> {
            rows.axis_iter(Axis(1))
                .map(|col| col.iter().copied().fold(init, pick))
                .collect()
        };
        let mean = rows
            .mean_axis(Axis(0))
            .ok_or_else(|| TrajError::InsufficientData("empty feature column".into()))?;
        Ok(FeatureStats {
            min: fold(f64::INFINITY, f64::min),
            max: fold(f64::NEG_INFINITY, f64::max),
            mean: mean.to_vec(),
            std: rows.std_axis(Axis(0), 0.0).to_vec(),
            count: vec![n],
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpisodeStats {
    pub episode_index: usize,
    pub stats: BTreeMap<String, FeatureStats>,
}

/// Statistics for every persisted column of `episode`.
pub fn episode_stats(episode: &Episode) -> Result<EpisodeStats, TrajError> {
    let frames = &episode.frames;
    let scalar = |f: fn(&FrameRecord) -> f64| {
        Array2::from_shape_fn((frames.len(), 1), |(i, _)| f(&frames[i]))
    };
    let vector = |width: usize, f: fn(&FrameRecord, usize) -> f64| {
        Array2::from_shape_fn((frames.len(), width), |(i, j)| f(&frames[i], j))
    };

    let columns: [(&str, Array2<f64>); 9] = [
        ("index", scalar(|r| r.index as f64)),
        ("episode_index", scalar(|r| r.episode_index as f64)),
        ("frame_index", scalar(|r| r.frame_index as f64)),
        ("timestamp", scalar(|r| r.timestamp)),
        ("task_index", scalar(|r| r.task_index as f64)),
        ("state", vector(6, |r, j| r.state[j])),
        ("action", vector(6, |r, j| r.action[j])),
        ("bbox", vector(4, |r, j| r.bbox.0[j])),
        ("grasp", scalar(|r| if r.grasp { 1.0 } else { 0.0 })),
    ];

    let mut stats = BTreeMap::new();
    for (name, rows) in columns {
        stats.insert(name.to_string(), FeatureStats::from_rows(&rows)?);
    }
    Ok(EpisodeStats {
        episode_index: episode.episode_index,
        stats,
    })
}

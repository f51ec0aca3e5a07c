//! Core trajectory-to-episode processing implemented in Rust.
//!
//! Raw per-step pose logs (position + orientation quaternion) are relativized
//! to their first frame, merged per long-horizon task, downsampled and turned
//! into fixed-schema [`FrameRecord`] rows. [`find_stop_frame`] locates the
//! stable tail of an assembled action sequence so trailing frames can be
//! trimmed or relabeled.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod bbox;
pub mod episode;
pub mod labels;
pub mod meta;
pub mod pose;
pub mod segment;
pub mod stats;
pub mod stop;

pub use bbox::{apply_frame_boxes, apply_terminal_box, parse_terminal_boxes, BboxScale};
pub use episode::{
    assemble_task, downsample_indices, grasp_for_type_folder, AssemblyConfig, Episode,
    EpisodeDraft, IndexCounters, SkippedSegment, TaskAssembly, TerminalFrame,
};
pub use labels::{
    parse_step_labels, repair_terminal_answer, stop_labels, Answer, RepairOutcome, StepLabel,
};
pub use meta::{clean_instruction, DatasetSummary, EpisodeMeta};
pub use pose::{
    absolute_actions, normalize_quaternion, quaternion_to_euler, relativize, unwrap, wrap_angle,
    EulerOrder, Pose, RelativeState,
};
pub use segment::{parse_segment_csv, Segment};
pub use stats::{episode_stats, EpisodeStats, FeatureStats};
pub use stop::{find_stop_frame, DeltaMode, StopConfig, StopDetection};

#[derive(Error, Debug)]
pub enum TrajError {
    #[error("missing required column(s): {0}")]
    MissingColumn(String),
    #[error("no readable segment data for task")]
    EmptySegments,
    #[error("unreadable value {value:?} in column {column} at row {row}")]
    InvalidValue {
        row: usize,
        column: String,
        value: String,
    },
    #[error("degenerate orientation quaternion at frame {0}")]
    DegenerateOrientation(usize),
    #[error("insufficient data: {0}")]
    InsufficientData(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("failed to parse CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl TrajError {
    /// True for errors that only invalidate one segment or task (the
    /// `DataError` family) rather than the configuration of the whole run.
    pub fn is_data_error(&self) -> bool {
        !matches!(self, TrajError::InvalidParameter(_))
    }
}

/// Axis-aligned box `(x1, y1, x2, y2)` in pixel coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BBox(pub [f64; 4]);

impl BBox {
    pub const ZERO: BBox = BBox([0.0; 4]);

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|v| *v == 0.0)
    }
}

/// One persisted row of an assembled episode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub index: usize,
    pub episode_index: usize,
    pub frame_index: usize,
    pub timestamp: f64,
    pub task_index: usize,
    pub state: RelativeState,
    pub action: RelativeState,
    pub bbox: BBox,
    pub grasp: bool,
}

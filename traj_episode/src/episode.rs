//! Episode assembly: merge subtask segments, downsample, relativize to the
//! first kept row, derive actions and allocate indices.
//!
//! Assembly is split in two so task folders can be processed in parallel:
//! [`assemble_task`] builds an unindexed [`EpisodeDraft`] from one task's
//! segments, and [`IndexCounters::assign`] turns drafts into [`Episode`]s one
//! at a time. Only the second step touches shared counters, and the counters
//! are a plain value passed in and returned.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::pose::{relativize, Pose, RelativeState};
use crate::segment::Segment;
use crate::{BBox, FrameRecord, TrajError};

/// How the true last frame survives downsampling when it is not on the stride grid.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TerminalFrame {
    /// Replace the last sampled row with the true last row.
    #[default]
    Overwrite,
    /// Keep every sampled row and add the true last row after them.
    Append,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AssemblyConfig {
    pub stride: usize,
    pub frame_period_s: f64,
    pub terminal_frame: TerminalFrame,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            stride: 5,
            frame_period_s: 0.2,
            terminal_frame: TerminalFrame::Overwrite,
        }
    }
}

impl AssemblyConfig {
    pub fn validate(&self) -> Result<(), TrajError> {
        if self.stride == 0 {
            return Err(TrajError::InvalidParameter("stride must be at least 1".into()));
        }
        if !(self.frame_period_s.is_finite() && self.frame_period_s > 0.0) {
            return Err(TrajError::InvalidParameter(format!(
                "frame period must be positive, got {}",
                self.frame_period_s
            )));
        }
        Ok(())
    }

    /// Time between two rows of a downsampled episode.
    pub fn sampled_period_s(&self) -> f64 {
        self.frame_period_s * self.stride as f64
    }

    pub fn sampled_fps(&self) -> f64 {
        1.0 / self.sampled_period_s()
    }
}

/// Grasp flag of a task-type folder: even numeric ids grasp. Ids that are not
/// integers count as 0.
pub fn grasp_for_type_folder(name: &str) -> bool {
    let id: i64 = name.trim().parse().unwrap_or(0);
    id % 2 == 0
}

/// Source row indices kept by downsampling `len` rows with `stride`.
pub fn downsample_indices(len: usize, stride: usize, terminal: TerminalFrame) -> Vec<usize> {
    if len == 0 {
        return Vec::new();
    }
    let stride = stride.max(1);
    let mut kept: Vec<usize> = (0..len).step_by(stride).collect();
    let last = len - 1;
    if last % stride != 0 {
        match terminal {
            TerminalFrame::Overwrite => {
                if let Some(slot) = kept.last_mut() {
                    *slot = last;
                }
            }
            TerminalFrame::Append => kept.push(last),
        }
    }
    kept
}

/// Actions are the next frame's state; the last frame repeats its own state.
pub fn derive_actions(states: &[RelativeState]) -> Vec<RelativeState> {
    (0..states.len())
        .map(|i| states.get(i + 1).copied().unwrap_or(states[i]))
        .collect()
}

#[derive(Clone, Debug, PartialEq)]
pub struct SkippedSegment {
    pub name: String,
    pub reason: String,
}

/// A fully derived episode that has not been given indices yet.
#[derive(Clone, Debug, PartialEq)]
pub struct EpisodeDraft {
    pub states: Vec<RelativeState>,
    pub actions: Vec<RelativeState>,
    pub bboxes: Vec<BBox>,
    pub grasp: bool,
    pub frame_period_s: f64,
    /// Frame count of the merged trajectory before downsampling.
    pub source_len: usize,
    /// Merged-trajectory row behind each kept row.
    pub source_rows: Vec<usize>,
}

impl EpisodeDraft {
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct TaskAssembly {
    pub draft: EpisodeDraft,
    pub skipped: Vec<SkippedSegment>,
}

/// Build one task's draft episode from its segments in folder order.
///
/// Segments that failed to load or have no frames are skipped and reported;
/// if none remain the task fails with [`TrajError::EmptySegments`].
pub fn assemble_task<I>(
    segments: I,
    grasp: bool,
    config: &AssemblyConfig,
) -> Result<TaskAssembly, TrajError>
where
    I: IntoIterator<Item = (String, Result<Segment, TrajError>)>,
{
    config.validate()?;

    let mut skipped = Vec::new();
    let mut poses: Vec<Pose> = Vec::new();
    let mut bboxes: Vec<BBox> = Vec::new();
    for (name, loaded) in segments {
        match loaded {
            Ok(segment) if segment.is_empty() => {
                warn!(segment = %name, "segment has no frames, skipped");
                skipped.push(SkippedSegment {
                    name,
                    reason: "no frames".into(),
                });
            }
            Ok(segment) => {
                poses.extend_from_slice(&segment.poses);
                bboxes.extend(
                    segment
                        .bboxes
                        .iter()
                        .copied()
                        .chain(std::iter::repeat(BBox::ZERO))
                        .take(segment.poses.len()),
                );
            }
            Err(err) => {
                warn!(segment = %name, error = %err, "segment skipped");
                skipped.push(SkippedSegment {
                    name,
                    reason: err.to_string(),
                });
            }
        }
    }

    if poses.is_empty() {
        return Err(TrajError::EmptySegments);
    }

    // The first kept row is the origin, even when overwrite replaced row 0.
    let source_rows = downsample_indices(poses.len(), config.stride, config.terminal_frame);
    let kept_poses: Vec<Pose> = source_rows.iter().map(|&r| poses[r]).collect();
    let states = relativize(&kept_poses)?;
    let kept_boxes: Vec<BBox> = source_rows.iter().map(|&r| bboxes[r]).collect();
    let actions = derive_actions(&states);

    debug!(
        merged = poses.len(),
        kept = states.len(),
        skipped = skipped.len(),
        "task assembled"
    );

    Ok(TaskAssembly {
        draft: EpisodeDraft {
            states,
            actions,
            bboxes: kept_boxes,
            grasp,
            frame_period_s: config.sampled_period_s(),
            source_len: poses.len(),
            source_rows,
        },
        skipped,
    })
}

/// Process-wide counters threaded explicitly through assembly.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexCounters {
    pub next_episode: usize,
    pub next_frame: usize,
    pub task_index: usize,
}

impl IndexCounters {
    /// Give a draft its episode index, global frame range and task index.
    pub fn assign(self, draft: EpisodeDraft) -> (Episode, IndexCounters) {
        let episode_index = self.next_episode;
        let first_index = self.next_frame;
        let len = draft.len();

        let frames = draft
            .states
            .iter()
            .zip(&draft.actions)
            .zip(&draft.bboxes)
            .enumerate()
            .map(|(i, ((state, action), bbox))| FrameRecord {
                index: first_index + i,
                episode_index,
                frame_index: i,
                timestamp: i as f64 * draft.frame_period_s,
                task_index: self.task_index,
                state: *state,
                action: *action,
                bbox: *bbox,
                grasp: draft.grasp,
            })
            .collect();

        let episode = Episode {
            episode_index,
            task_index: self.task_index,
            source_len: draft.source_len,
            frames,
        };
        let next = IndexCounters {
            next_episode: episode_index + 1,
            next_frame: first_index + len,
            task_index: self.task_index,
        };
        (episode, next)
    }

    /// Advance to the next task-type folder.
    pub fn next_task(self) -> IndexCounters {
        IndexCounters {
            task_index: self.task_index + 1,
            ..self
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub episode_index: usize,
    pub task_index: usize,
    pub source_len: usize,
    pub frames: Vec<FrameRecord>,
}

impl Episode {
    /// Rebuild an episode from persisted rows. Rows must share one episode.
    pub fn from_frames(frames: Vec<FrameRecord>) -> Result<Episode, TrajError> {
        let first = frames
            .first()
            .ok_or_else(|| TrajError::InsufficientData("episode has no frames".into()))?;
        let (episode_index, task_index) = (first.episode_index, first.task_index);
        if let Some(bad) = frames.iter().find(|f| f.episode_index != episode_index) {
            return Err(TrajError::InsufficientData(format!(
                "frame {} belongs to episode {} instead of {}",
                bad.index, bad.episode_index, episode_index
            )));
        }
        Ok(Episode {
            episode_index,
            task_index,
            source_len: frames.len(),
            frames,
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// The `(N, 6)` action matrix consumed by stop detection.
    pub fn actions(&self) -> Array2<f64> {
        let flat: Vec<f64> = self
            .frames
            .iter()
            .flat_map(|f| f.action.iter().copied())
            .collect();
        Array2::from_shape_vec((self.frames.len(), 6), flat)
            .unwrap_or_else(|_| Array2::zeros((0, 6)))
    }

    /// Timestamp of `frame`, clamped to the last row.
    pub fn timestamp_at(&self, frame: usize) -> Option<f64> {
        let last = self.frames.len().checked_sub(1)?;
        self.frames.get(frame.min(last)).map(|f| f.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn line_segment(name: &str, xs: std::ops::Range<usize>) -> Segment {
        let poses = xs
            .map(|x| Pose::new([x as f64, 0.0, 0.0], [0.0, 0.0, 0.0, 1.0]))
            .collect();
        Segment::new(name, poses)
    }

    fn loaded(segments: Vec<Segment>) -> Vec<(String, Result<Segment, TrajError>)> {
        segments
            .into_iter()
            .map(|s| (s.name.clone(), Ok(s)))
            .collect()
    }

    #[test]
    fn downsample_overwrites_last_sample() {
        assert_eq!(downsample_indices(10, 5, TerminalFrame::Overwrite), vec![0, 9]);
        assert_eq!(downsample_indices(11, 5, TerminalFrame::Overwrite), vec![0, 5, 10]);
        assert_eq!(downsample_indices(8, 2, TerminalFrame::Overwrite), vec![0, 2, 4, 7]);
        assert_eq!(downsample_indices(1, 5, TerminalFrame::Overwrite), vec![0]);
        assert!(downsample_indices(0, 5, TerminalFrame::Overwrite).is_empty());
    }

    #[test]
    fn downsample_append_keeps_grid_rows() {
        assert_eq!(downsample_indices(10, 5, TerminalFrame::Append), vec![0, 5, 9]);
        assert_eq!(downsample_indices(11, 5, TerminalFrame::Append), vec![0, 5, 10]);
    }

    #[test]
    fn downsample_always_ends_on_last_row() {
        for len in 1..40 {
            for stride in 1..9 {
                for policy in [TerminalFrame::Overwrite, TerminalFrame::Append] {
                    let kept = downsample_indices(len, stride, policy);
                    assert_eq!(*kept.last().unwrap(), len - 1);
                    assert_eq!(kept[0], 0);
                    assert!(kept.windows(2).all(|w| w[0] < w[1]));
                }
            }
        }
    }

    #[test]
    fn actions_shift_states_by_one() {
        let states: Vec<RelativeState> = (0..4).map(|i| [i as f64; 6]).collect();
        let actions = derive_actions(&states);
        for i in 0..3 {
            assert_eq!(actions[i], states[i + 1]);
        }
        assert_eq!(actions[3], states[3]);
        assert!(derive_actions(&[]).is_empty());
    }

    #[test]
    fn grasp_follows_type_folder_parity() {
        assert!(grasp_for_type_folder("2"));
        assert!(!grasp_for_type_folder("7"));
        assert!(grasp_for_type_folder("misc"));
    }

    #[test]
    fn two_segments_with_append_keep_three_frames() {
        let config = AssemblyConfig {
            terminal_frame: TerminalFrame::Append,
            ..AssemblyConfig::default()
        };
        let segs = vec![line_segment("1-1", 0..6), line_segment("1-2", 6..10)];
        let task = assemble_task(loaded(segs), true, &config).unwrap();
        assert_eq!(task.draft.source_len, 10);
        assert_eq!(task.draft.source_rows, vec![0, 5, 9]);

        let (episode, _) = IndexCounters::default().assign(task.draft);
        let frame_index: Vec<usize> = episode.frames.iter().map(|f| f.frame_index).collect();
        assert_eq!(frame_index, vec![0, 1, 2]);
        assert_relative_eq!(episode.frames[2].state[0], 9.0);
    }

    #[test]
    fn two_segments_with_overwrite_end_on_true_last_frame() {
        let segs = vec![line_segment("1-1", 0..6), line_segment("1-2", 6..10)];
        let task = assemble_task(loaded(segs), true, &AssemblyConfig::default()).unwrap();
        assert_eq!(task.draft.source_rows, vec![0, 9]);
        let d = &task.draft;
        assert_eq!(d.states[0], [0.0; 6]);
        assert_relative_eq!(d.states[1][0], 9.0);
        assert_eq!(d.actions[0], d.states[1]);
        assert_eq!(d.actions[1], d.states[1]);
    }

    #[test]
    fn short_task_starts_at_origin_after_overwrite() {
        // three rows, stride 5: the only kept row is the true last row
        let segs = vec![line_segment("1-1", 0..3)];
        let task = assemble_task(loaded(segs), true, &AssemblyConfig::default()).unwrap();
        assert_eq!(task.draft.source_rows, vec![2]);
        assert_eq!(task.draft.states, vec![[0.0; 6]]);
        assert_eq!(task.draft.actions, vec![[0.0; 6]]);

        let segs = vec![line_segment("1-1", 4..6), line_segment("1-2", 6..10)];
        let config = AssemblyConfig {
            stride: 4,
            ..AssemblyConfig::default()
        };
        let task = assemble_task(loaded(segs), true, &config).unwrap();
        assert_eq!(task.draft.source_rows, vec![0, 5]);
        assert_eq!(task.draft.states[0], [0.0; 6]);
        assert_relative_eq!(task.draft.states[1][0], 5.0);
    }

    #[test]
    fn terminal_box_survives_downsampling() {
        let mut last = line_segment("1-2", 6..10);
        last.bboxes[3] = BBox([1.0, 2.0, 3.0, 4.0]);
        let segs = vec![line_segment("1-1", 0..6), last];
        let task = assemble_task(loaded(segs), false, &AssemblyConfig::default()).unwrap();
        assert_eq!(*task.draft.bboxes.last().unwrap(), BBox([1.0, 2.0, 3.0, 4.0]));
        assert!(task.draft.bboxes[0].is_zero());
        assert!(!task.draft.grasp);
    }

    #[test]
    fn failed_segments_are_skipped_not_fatal() {
        let segments = vec![
            ("1-1".to_string(), Ok(line_segment("1-1", 0..3))),
            (
                "1-2".to_string(),
                Err(TrajError::MissingColumn("position_x".into())),
            ),
            ("1-3".to_string(), Ok(line_segment("1-3", 0..0))),
        ];
        let task = assemble_task(segments, true, &AssemblyConfig::default()).unwrap();
        assert_eq!(task.draft.source_len, 3);
        let names: Vec<&str> = task.skipped.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["1-2", "1-3"]);
    }

    #[test]
    fn empty_task_is_reported() {
        let none: Vec<(String, Result<Segment, TrajError>)> = Vec::new();
        assert!(matches!(
            assemble_task(none, true, &AssemblyConfig::default()),
            Err(TrajError::EmptySegments)
        ));
        let only_failed = vec![("x".to_string(), Err(TrajError::EmptySegments))];
        assert!(matches!(
            assemble_task(only_failed, true, &AssemblyConfig::default()),
            Err(TrajError::EmptySegments)
        ));
    }

    #[test]
    fn zero_stride_is_rejected() {
        let config = AssemblyConfig {
            stride: 0,
            ..AssemblyConfig::default()
        };
        let segs = loaded(vec![line_segment("a", 0..3)]);
        assert!(matches!(
            assemble_task(segs, true, &config),
            Err(TrajError::InvalidParameter(_))
        ));
    }

    #[test]
    fn counters_thread_contiguous_indices() {
        let config = AssemblyConfig {
            stride: 2,
            ..AssemblyConfig::default()
        };
        let mut counters = IndexCounters::default();
        let mut episodes = Vec::new();
        for len in [5usize, 8, 3] {
            let task = assemble_task(loaded(vec![line_segment("s", 0..len)]), true, &config).unwrap();
            let (episode, next) = counters.assign(task.draft);
            episodes.push(episode);
            counters = next.next_task();
        }

        let indices: Vec<usize> = episodes
            .iter()
            .flat_map(|e| e.frames.iter().map(|f| f.index))
            .collect();
        assert_eq!(indices, (0..indices.len()).collect::<Vec<_>>());
        assert_eq!(counters.next_frame, indices.len());
        assert_eq!(counters.next_episode, 3);
        assert_eq!(counters.task_index, 3);

        let ep_indices: Vec<usize> = episodes.iter().map(|e| e.episode_index).collect();
        assert_eq!(ep_indices, vec![0, 1, 2]);
        assert_eq!(episodes[1].task_index, 1);
        assert_relative_eq!(episodes[1].frames[1].timestamp, 0.4, epsilon = 1e-12);
    }

    #[test]
    fn counters_do_not_advance_task_within_folder() {
        let config = AssemblyConfig::default();
        let counters = IndexCounters {
            next_episode: 4,
            next_frame: 100,
            task_index: 2,
        };
        let task = assemble_task(loaded(vec![line_segment("s", 0..7)]), true, &config).unwrap();
        let (episode, next) = counters.assign(task.draft);
        assert_eq!(episode.episode_index, 4);
        assert_eq!(episode.frames[0].index, 100);
        assert!(episode.frames.iter().all(|f| f.task_index == 2));
        assert_eq!(next.task_index, 2);
        assert_eq!(next.next_frame, 100 + episode.len());
    }

    #[test]
    fn episode_exposes_action_matrix_and_timestamps() {
        let task = assemble_task(
            loaded(vec![line_segment("s", 0..11)]),
            true,
            &AssemblyConfig::default(),
        )
        .unwrap();
        let (episode, _) = IndexCounters::default().assign(task.draft);
        let actions = episode.actions();
        assert_eq!(actions.dim(), (3, 6));
        assert_relative_eq!(actions[[0, 0]], 5.0);
        assert_relative_eq!(actions[[2, 0]], 10.0);
        assert_eq!(episode.timestamp_at(99), Some(2.0));

        let rebuilt = Episode::from_frames(episode.frames.clone()).unwrap();
        assert_eq!(rebuilt.frames, episode.frames);
    }
}

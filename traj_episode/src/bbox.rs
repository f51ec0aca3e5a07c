//! Bounding-box sources for segments.
//!
//! Detector output is normalized to a 0..1000 grid; boxes are rescaled to the
//! camera image before they are attached to frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::labels::StepLabel;
use crate::segment::Segment;
use crate::{BBox, TrajError};

const NORMALIZED_GRID: f64 = 1000.0;

/// Image size used to map normalized boxes to pixels.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BboxScale {
    pub width: f64,
    pub height: f64,
}

impl Default for BboxScale {
    fn default() -> Self {
        Self {
            width: 640.0,
            height: 480.0,
        }
    }
}

impl BboxScale {
    pub fn validate(&self) -> Result<(), TrajError> {
        if self.width > 0.0 && self.height > 0.0 {
            Ok(())
        } else {
            Err(TrajError::InvalidParameter(format!(
                "image size must be positive, got {}x{}",
                self.width, self.height
            )))
        }
    }

    /// Map a normalized `(x1, y1, x2, y2)` box to pixels.
    pub fn rescale(&self, raw: [f64; 4]) -> BBox {
        BBox([
            raw[0] * self.width / NORMALIZED_GRID,
            raw[1] * self.height / NORMALIZED_GRID,
            raw[2] * self.width / NORMALIZED_GRID,
            raw[3] * self.height / NORMALIZED_GRID,
        ])
    }
}

/// Extract the terminal box from a `bbox.jsonl` detector dump.
///
/// Returns the first line whose `boxes[0]` holds four numbers. Blank lines
/// and lines without a usable box are ignored; malformed JSON is an error.
pub fn parse_terminal_boxes(text: &str) -> Result<Option<[f64; 4]>, TrajError> {
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(line)?;
        let first = value
            .get("boxes")
            .and_then(Value::as_array)
            .and_then(|boxes| boxes.first())
            .and_then(Value::as_array);
        let Some(coords) = first else {
            debug!(line = lineno, "detector line without boxes");
            continue;
        };
        let numbers: Vec<f64> = coords.iter().filter_map(Value::as_f64).collect();
        if let (4, Ok(b)) = (coords.len(), <[f64; 4]>::try_from(numbers.as_slice())) {
            return Ok(Some(b));
        }
        debug!(line = lineno, len = coords.len(), "detector box is not four numbers");
    }
    Ok(None)
}

/// Attach a normalized terminal box to the last frame of `segment`.
pub fn apply_terminal_box(segment: &mut Segment, raw: [f64; 4], scale: &BboxScale) {
    let boxed = scale.rescale(raw);
    if let Some(last) = segment.bboxes.last_mut() {
        *last = boxed;
    }
}

/// Attach per-frame boxes from labels whose answer is a box.
///
/// Label boxes are already in pixels when `scale` is `None`. Frames without a
/// box label keep the zero box; the number of such frames is returned.
pub fn apply_frame_boxes(
    segment: &mut Segment,
    labels: &[StepLabel],
    scale: Option<&BboxScale>,
) -> usize {
    let mut by_frame: Vec<Option<BBox>> = vec![None; segment.len()];
    for label in labels {
        let Some(raw) = label.answer.as_box() else {
            continue;
        };
        match by_frame.get_mut(label.index) {
            Some(slot) => {
                *slot = Some(match scale {
                    Some(scale) => scale.rescale(raw),
                    None => BBox(raw),
                })
            }
            None => warn!(
                segment = %segment.name,
                index = label.index,
                frames = segment.len(),
                "box label beyond segment end ignored"
            ),
        }
    }

    let mut missing = 0;
    for (bbox, labelled) in segment.bboxes.iter_mut().zip(by_frame) {
        match labelled {
            Some(b) => *bbox = b,
            None => {
                *bbox = BBox::ZERO;
                missing += 1;
            }
        }
    }
    missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::Answer;
    use crate::pose::Pose;

    fn segment(len: usize) -> Segment {
        Segment::new("s", vec![Pose::new([0.0; 3], [0.0, 0.0, 0.0, 1.0]); len])
    }

    #[test]
    fn rescale_uses_image_size() {
        let b = BboxScale::default().rescale([100.0, 500.0, 1000.0, 0.0]);
        assert_eq!(b, BBox([64.0, 240.0, 640.0, 0.0]));
    }

    #[test]
    fn first_usable_detector_line_wins() {
        let text = "\n{\"boxes\": []}\n{\"boxes\": [[1, 2, 3]]}\n{\"boxes\": [[10, 20, 30, 40]], \"score\": 0.9}\n{\"boxes\": [[5, 5, 5, 5]]}\n";
        assert_eq!(parse_terminal_boxes(text).unwrap(), Some([10.0, 20.0, 30.0, 40.0]));
        assert_eq!(parse_terminal_boxes("{\"labels\": []}\n").unwrap(), None);
        assert!(parse_terminal_boxes("{not json").is_err());
    }

    #[test]
    fn terminal_box_lands_on_last_frame() {
        let mut seg = segment(3);
        apply_terminal_box(&mut seg, [500.0, 500.0, 1000.0, 1000.0], &BboxScale::default());
        assert!(seg.bboxes[0].is_zero());
        assert!(seg.bboxes[1].is_zero());
        assert_eq!(seg.bboxes[2], BBox([320.0, 240.0, 640.0, 480.0]));

        let mut empty = segment(0);
        apply_terminal_box(&mut empty, [1.0; 4], &BboxScale::default());
        assert!(empty.bboxes.is_empty());
    }

    #[test]
    fn frame_boxes_fill_labelled_frames_only() {
        let mut seg = segment(4);
        let labels = vec![
            StepLabel {
                index: 1,
                question: String::new(),
                answer: Answer::Box([1.0, 2.0, 3.0, 4.0]),
            },
            StepLabel {
                index: 2,
                question: String::new(),
                answer: Answer::PredAction,
            },
            StepLabel {
                index: 9,
                question: String::new(),
                answer: Answer::Box([9.0; 4]),
            },
        ];
        let missing = apply_frame_boxes(&mut seg, &labels, None);
        assert_eq!(missing, 3);
        assert_eq!(seg.bboxes[1], BBox([1.0, 2.0, 3.0, 4.0]));
        assert!(seg.bboxes[2].is_zero());
    }
}

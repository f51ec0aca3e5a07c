//! Per-step question/answer labels (`data.json`).
//!
//! Each label names a frame by `index` and carries an `Answer` that is either
//! a bounding box, the `<pred_action>` marker, empty, or some other string.

use std::cmp::Reverse;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::TrajError;

pub const PRED_ACTION: &str = "<pred_action>";

#[derive(Clone, Debug, PartialEq)]
pub enum Answer {
    Empty,
    PredAction,
    Box([f64; 4]),
    Other(String),
}

impl Answer {
    pub fn is_empty(&self) -> bool {
        matches!(self, Answer::Empty)
    }

    /// The pixel box, when the answer carries one.
    pub fn as_box(&self) -> Option<[f64; 4]> {
        match self {
            Answer::Box(b) => Some(*b),
            _ => None,
        }
    }

    fn from_value(value: &Value) -> Answer {
        match value {
            Value::Null => Answer::Empty,
            Value::String(s) if s.trim().is_empty() => Answer::Empty,
            Value::String(s) if s.trim() == PRED_ACTION => Answer::PredAction,
            Value::String(s) => match serde_json::from_str::<Value>(s.trim()) {
                Ok(inner @ Value::Array(_)) => match Answer::from_value(&inner) {
                    boxed @ Answer::Box(_) => boxed,
                    _ => Answer::Other(s.clone()),
                },
                _ => Answer::Other(s.clone()),
            },
            Value::Array(items) if items.is_empty() => Answer::Empty,
            Value::Array(items) => {
                let coords: Vec<f64> = items.iter().filter_map(Value::as_f64).collect();
                match <[f64; 4]>::try_from(coords.as_slice()) {
                    Ok(b) if items.len() == 4 => Answer::Box(b),
                    _ => Answer::Other(value.to_string()),
                }
            }
            other => Answer::Other(other.to_string()),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Answer::Empty => Value::String(String::new()),
            Answer::PredAction => Value::String(PRED_ACTION.to_string()),
            Answer::Box(b) => serde_json::json!(b),
            Answer::Other(s) => Value::String(s.clone()),
        }
    }
}

impl Serialize for Answer {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Answer {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(Answer::from_value(&value))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepLabel {
    pub index: usize,
    #[serde(rename = "Question", default)]
    pub question: String,
    #[serde(rename = "Answer", default = "empty_answer")]
    pub answer: Answer,
}

fn empty_answer() -> Answer {
    Answer::Empty
}

/// Parse a `data.json` label array.
///
/// Items that are not objects or have no usable `index` are skipped and
/// counted. An index may be an integer, an integral float or a numeric string.
pub fn parse_step_labels(text: &str) -> Result<(Vec<StepLabel>, usize), TrajError> {
    let root: Value = serde_json::from_str(text)?;
    let items = match root {
        Value::Array(items) => items,
        _ => {
            return Err(TrajError::InsufficientData(
                "label file is not a JSON array".into(),
            ))
        }
    };

    let mut labels = Vec::with_capacity(items.len());
    let mut skipped = 0usize;
    for item in &items {
        let Some(object) = item.as_object() else {
            skipped += 1;
            continue;
        };
        let Some(index) = object.get("index").and_then(coerce_index) else {
            skipped += 1;
            continue;
        };
        let question = object
            .get("Question")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let answer = object
            .get("Answer")
            .map(Answer::from_value)
            .unwrap_or(Answer::Empty);
        labels.push(StepLabel {
            index,
            question,
            answer,
        });
    }
    if skipped > 0 {
        warn!(skipped, "label items without a usable index were ignored");
    }
    Ok((labels, skipped))
}

fn coerce_index(value: &Value) -> Option<usize> {
    let as_float = match value {
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                return usize::try_from(u).ok();
            }
            n.as_f64()?
        }
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if as_float.is_finite() && as_float >= 0.0 && as_float.fract() == 0.0 {
        Some(as_float as usize)
    } else {
        None
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RepairOutcome {
    /// The last step already has a box (or there are no labels).
    NotNeeded,
    Filled { target: usize, source: usize, entries: usize },
    /// No step carries a box to copy from.
    NoValidSource,
}

/// Give the last step a box when it has none.
///
/// Every label at the largest index without a box answer receives a copy of
/// the nearest box answer at another index; ties go to the later index.
pub fn repair_terminal_answer(labels: &mut [StepLabel]) -> RepairOutcome {
    let Some(target) = labels.iter().map(|l| l.index).max() else {
        return RepairOutcome::NotNeeded;
    };
    let needs_box: Vec<usize> = labels
        .iter()
        .enumerate()
        .filter(|(_, l)| l.index == target && l.answer.as_box().is_none())
        .map(|(pos, _)| pos)
        .collect();
    if needs_box.is_empty() {
        return RepairOutcome::NotNeeded;
    }

    let source = labels
        .iter()
        .filter(|l| l.index != target)
        .filter_map(|l| l.answer.as_box().map(|b| (l.index, b)))
        .min_by_key(|(index, _)| (index.abs_diff(target), Reverse(*index)));
    let Some((source, boxed)) = source else {
        warn!(target, "no box answer to repair the last step from");
        return RepairOutcome::NoValidSource;
    };

    for &pos in &needs_box {
        labels[pos].answer = Answer::Box(boxed);
    }
    debug!(target, source, entries = needs_box.len(), "last step answer repaired");
    RepairOutcome::Filled {
        target,
        source,
        entries: needs_box.len(),
    }
}

/// Labels for an episode of `len` frames: `<pred_action>` before the stop
/// frame, empty answers from it on.
pub fn stop_labels(len: usize, stop_frame: usize, question: &str) -> Vec<StepLabel> {
    (0..len)
        .map(|index| StepLabel {
            index,
            question: question.to_string(),
            answer: if index >= stop_frame {
                Answer::Empty
            } else {
                Answer::PredAction
            },
        })
        .collect()
}

//! Dataset metadata: `episodes.jsonl` lines and the `info.json` summary.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::episode::Episode;

pub const CODEBASE_VERSION: &str = "v2.0";
pub const ROBOT_TYPE: &str = "UAV";
pub const DATA_PATH: &str = "data/chunk-{episode_chunk:03d}/episode_{episode_index:06d}.jsonl";

/// One line of `episodes.jsonl`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpisodeMeta {
    pub episode_index: usize,
    pub tasks: Vec<String>,
    pub length: usize,
}

impl EpisodeMeta {
    pub fn for_episode(episode: &Episode, instruction: &str) -> Self {
        Self {
            episode_index: episode.episode_index,
            tasks: vec![instruction.to_string()],
            length: episode.len(),
        }
    }
}

/// Strip leading `轨迹 N:` markers from every line of an instruction file.
pub fn clean_instruction(text: &str) -> String {
    static PREFIX: OnceLock<Option<Regex>> = OnceLock::new();
    let prefix = PREFIX.get_or_init(|| Regex::new(r"^\s*轨迹\s*\d+\s*[:：]\s*").ok());
    let lines: Vec<String> = text
        .lines()
        .map(|line| match prefix {
            Some(re) => re.replace(line, "").into_owned(),
            None => line.to_string(),
        })
        .collect();
    lines.join("\n").trim().to_string()
}

/// Totals gathered while writing a dataset, rendered as `info.json`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub total_episodes: usize,
    pub total_frames: usize,
    pub total_tasks: usize,
    pub total_chunks: usize,
    /// Episodes in the first chunk.
    pub chunks_size: usize,
    pub fps: f64,
}

impl DatasetSummary {
    pub fn info_json(&self) -> Value {
        json!({
            "codebase_version": CODEBASE_VERSION,
            "robot_type": ROBOT_TYPE,
            "total_episodes": self.total_episodes,
            "total_frames": self.total_frames,
            "total_tasks": self.total_tasks,
            "total_chunks": self.total_chunks,
            "chunks_size": self.chunks_size,
            "fps": self.fps,
            "splits": { "train": format!("0:{}", self.total_episodes) },
            "data_path": DATA_PATH,
            "features": {
                "timestamp": { "dtype": "float64", "shape": [1] },
                "state": { "dtype": "float32", "shape": [6] },
                "action": { "dtype": "float32", "shape": [6] },
                "frame_index": { "dtype": "int32", "shape": [1] },
                "index": { "dtype": "int32", "shape": [1] },
                "episode_index": { "dtype": "int32", "shape": [1] },
                "task_index": { "dtype": "int32", "shape": [1] },
                "bbox": { "dtype": "float32", "shape": [4] },
                "grasp": { "dtype": "bool", "shape": [1] },
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_numbered_trajectory_prefixes() {
        let text = "轨迹 1: fly to the red door\n  轨迹12：land on the roof\nno prefix here\n";
        assert_eq!(
            clean_instruction(text),
            "fly to the red door\nland on the roof\nno prefix here"
        );
        assert_eq!(clean_instruction("  plain  \n"), "plain");
    }

    #[test]
    fn info_json_reports_totals_and_split() {
        let summary = DatasetSummary {
            total_episodes: 4,
            total_frames: 37,
            total_tasks: 2,
            total_chunks: 2,
            chunks_size: 3,
            fps: 1.0,
        };
        let info = summary.info_json();
        assert_eq!(info["codebase_version"], "v2.0");
        assert_eq!(info["robot_type"], "UAV");
        assert_eq!(info["total_frames"], 37);
        assert_eq!(info["splits"]["train"], "0:4");
        assert_eq!(info["features"]["state"]["shape"], json!([6]));
        assert_eq!(info["features"].as_object().unwrap().len(), 9);
    }
}

use approx::assert_relative_eq;
use ndarray::array;
use traj_episode::{
    assemble_task, episode_stats, find_stop_frame, parse_segment_csv, stop_labels,
    AssemblyConfig, DeltaMode, IndexCounters, Segment, StopConfig, TerminalFrame, TrajError,
};

fn yaw_rows(rows: &[(f64, f64, f64)]) -> String {
    let mut csv = String::from("位置X,位置Y,位置Z,姿态X,姿态Y,姿态Z,姿态W\n");
    for (x, y, yaw) in rows {
        let (s, c) = (yaw / 2.0).sin_cos();
        csv.push_str(&format!("{x},{y},1.5,0,0,{s},{c}\n"));
    }
    csv
}

#[test]
fn raw_segments_become_a_settled_episode() {
    // approach along x, turn toward the target, then hover
    let approach: Vec<(f64, f64, f64)> = (0..10).map(|i| (i as f64, 0.0, 0.0)).collect();
    let turn: Vec<(f64, f64, f64)> = (0..10)
        .map(|i| (10.0 + i as f64 * 0.5, i as f64 * 0.3, 0.15 * i as f64))
        .collect();
    let hover: Vec<(f64, f64, f64)> = (0..10).map(|_| (14.5, 2.7, 1.35)).collect();

    let segments: Vec<(String, Result<Segment, TrajError>)> = [
        ("1-1", &approach),
        ("1-2", &turn),
        ("1-3", &hover),
    ]
    .into_iter()
    .map(|(name, rows)| {
        (
            name.to_string(),
            parse_segment_csv(name, yaw_rows(rows).as_bytes()),
        )
    })
    .collect();

    let config = AssemblyConfig {
        stride: 2,
        ..AssemblyConfig::default()
    };
    let task = assemble_task(segments, true, &config).unwrap();
    assert!(task.skipped.is_empty());
    assert_eq!(task.draft.source_len, 30);

    let (episode, counters) = IndexCounters::default().assign(task.draft);
    assert_eq!(episode.len(), 15);
    assert_eq!(counters.next_frame, 15);
    assert_eq!(episode.frames[0].state, [0.0; 6]);
    let last = episode.frames.last().unwrap();
    assert_relative_eq!(last.state[0], 14.5, epsilon = 1e-12);
    assert_relative_eq!(last.state[5], 1.35, epsilon = 1e-9);
    assert_eq!(last.action, last.state);

    let detection = find_stop_frame(episode.actions().view(), &StopConfig::default()).unwrap();
    // actions are shifted states: hover starts at merged row 20 (kept row 10)
    // so the actions settle from kept row 9 on
    assert_eq!(detection.stop_frame, 10);
    assert_eq!(detection.frames_after(episode.len()), 4);

    let labels = stop_labels(episode.len(), detection.stop_frame, "q");
    assert!(labels[..10].iter().all(|l| !l.answer.is_empty()));
    assert!(labels[10..].iter().all(|l| l.answer.is_empty()));

    let stats = episode_stats(&episode).unwrap();
    assert_eq!(stats.stats["state"].count, vec![15]);
}

#[test]
fn broken_segment_is_skipped_and_rest_assembles() {
    let good = yaw_rows(&[(0.0, 0.0, 0.0), (1.0, 0.0, 0.0), (2.0, 0.0, 0.0)]);
    let broken = "位置X,位置Y\n1,2\n";
    let segments = vec![
        ("a".to_string(), parse_segment_csv("a", good.as_bytes())),
        ("b".to_string(), parse_segment_csv("b", broken.as_bytes())),
    ];
    let config = AssemblyConfig {
        stride: 1,
        terminal_frame: TerminalFrame::Append,
        ..AssemblyConfig::default()
    };
    let task = assemble_task(segments, false, &config).unwrap();
    assert_eq!(task.skipped.len(), 1);
    assert_eq!(task.skipped[0].name, "b");
    assert!(task.skipped[0].reason.contains("position_z"));
    assert_eq!(task.draft.len(), 3);
}

#[test]
fn stationary_sequence_stops_at_first_frame() {
    let actions = array![
        [0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        [0.0, 0.0, 0.0, 0.0, 0.0, 0.001],
        [0.0, 0.0, 0.0, 0.0, 0.0, 0.001],
    ];
    for mode in [DeltaMode::Neighbor, DeltaMode::End] {
        let config = StopConfig {
            mode,
            ..StopConfig::default()
        };
        let detection = find_stop_frame(actions.view(), &config).unwrap();
        assert_eq!(detection.stop_frame, 0);
    }
}

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum, ValueHint};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use traj_episode::{
    absolute_actions, apply_frame_boxes, apply_terminal_box, assemble_task, clean_instruction,
    episode_stats, find_stop_frame, grasp_for_type_folder, parse_segment_csv, parse_step_labels,
    parse_terminal_boxes, repair_terminal_answer, stop_labels, AssemblyConfig, BBox, BboxScale,
    DatasetSummary, DeltaMode, Episode, EpisodeMeta, EpisodeStats, FrameRecord, IndexCounters,
    RepairOutcome, Segment, StopConfig, StopDetection, TaskAssembly, TerminalFrame, TrajError,
};

const DEFAULT_QUESTION: &str =
    "这是你当前的观测，如果能识别到目标，则输出bbox，否则输出<pred_action>";

#[derive(Parser, Debug)]
#[command(author, version, about = "Trajectory episode assembly and stop-frame detection", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Assemble a raw task tree into episode JSONL files plus metadata
    Assemble(AssembleArgs),
    /// Detect the stop frame of assembled episodes or raw segment logs
    DetectStop(DetectStopArgs),
    /// Recompute episode statistics and info.json for an assembled dataset
    Stats(StatsArgs),
}

#[derive(Parser, Debug)]
struct AssembleArgs {
    /// Raw tree root laid out as <type>/<task>/<subtask>/data.csv
    #[arg(long, value_hint = ValueHint::DirPath)]
    input: PathBuf,

    /// Dataset output root
    #[arg(long, value_hint = ValueHint::DirPath)]
    output: PathBuf,

    /// Keep every n-th frame
    #[arg(long)]
    stride: Option<usize>,

    /// Seconds between raw frames
    #[arg(long)]
    frame_period: Option<f64>,

    /// How the true last frame survives downsampling
    #[arg(long, value_enum)]
    terminal_frame: Option<TerminalOpt>,

    /// Where per-frame boxes come from
    #[arg(long, value_enum, default_value_t = BboxSourceOpt::Csv)]
    bbox_source: BboxSourceOpt,

    /// Treat data.json label boxes as 0..1000 normalized (per-frame source only)
    #[arg(long, action = ArgAction::SetTrue)]
    normalized_labels: bool,

    /// Image width used to rescale normalized boxes
    #[arg(long)]
    width: Option<f64>,

    /// Image height used to rescale normalized boxes
    #[arg(long)]
    height: Option<f64>,

    /// JSON file with `assembly`, `stop` and `bbox` sections
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct DetectStopArgs {
    /// Episode JSONL files, or with --raw subtask folders / data.csv files
    #[arg(required = true, value_hint = ValueHint::AnyPath)]
    inputs: Vec<PathBuf>,

    /// Read raw pose logs and detect on absolute poses
    #[arg(long, action = ArgAction::SetTrue)]
    raw: bool,

    /// Write step labels (`.json` next to each input)
    #[arg(long, action = ArgAction::SetTrue)]
    labels: bool,

    /// Question text stored in step labels
    #[arg(long, default_value = DEFAULT_QUESTION)]
    question: String,

    /// Delta mode
    #[arg(long, value_enum)]
    mode: Option<ModeOpt>,

    /// Relative factor on the position percentile
    #[arg(long)]
    r_pos: Option<f64>,

    /// Relative factor on the yaw percentile
    #[arg(long)]
    r_yaw: Option<f64>,

    /// Position threshold floor
    #[arg(long)]
    pos_min: Option<f64>,

    /// Yaw threshold floor (radians)
    #[arg(long)]
    yaw_min: Option<f64>,

    /// Stable window length
    #[arg(short = 'k', long)]
    k: Option<usize>,

    /// Leading share of deltas used for the percentiles
    #[arg(long)]
    hist_ratio: Option<f64>,

    /// Seconds between raw frames, for raw trim timestamps
    #[arg(long)]
    frame_period: Option<f64>,

    /// JSON file with `assembly`, `stop` and `bbox` sections
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Report CSV path (`-` for stdout)
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct StatsArgs {
    /// Dataset root written by `assemble`
    #[arg(long, value_hint = ValueHint::DirPath)]
    root: PathBuf,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum BboxSourceOpt {
    /// bbox_* columns of data.csv, zero when absent
    Csv,
    /// images/bbox.jsonl applied to each segment's last frame
    Terminal,
    /// data.json step labels
    PerFrame,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TerminalOpt {
    Overwrite,
    Append,
}

impl From<TerminalOpt> for TerminalFrame {
    fn from(value: TerminalOpt) -> Self {
        match value {
            TerminalOpt::Overwrite => TerminalFrame::Overwrite,
            TerminalOpt::Append => TerminalFrame::Append,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeOpt {
    Neighbor,
    End,
}

impl From<ModeOpt> for DeltaMode {
    fn from(value: ModeOpt) -> Self {
        match value {
            ModeOpt::Neighbor => DeltaMode::Neighbor,
            ModeOpt::End => DeltaMode::End,
        }
    }
}

/// Contents of a `--config` file. Missing sections keep their defaults.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct RunConfig {
    assembly: AssemblyConfig,
    stop: StopConfig,
    bbox: BboxScale,
}

fn load_run_config(path: Option<&Path>) -> Result<RunConfig> {
    let Some(path) = path else {
        return Ok(RunConfig::default());
    };
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let config: RunConfig = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a valid config file", path.display()))?;
    debug!("Loaded config overrides from {}", path.display());
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Assemble(args) => args.verbose,
        Command::DetectStop(args) => args.verbose,
        Command::Stats(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Assemble(args) => handle_assemble(args),
        Command::DetectStop(args) => handle_detect_stop(args),
        Command::Stats(args) => handle_stats(args),
    }
}

struct SegmentSettings {
    bbox_source: BboxSourceOpt,
    scale: BboxScale,
    normalized_labels: bool,
}

struct TaskJob {
    type_name: String,
    task_name: String,
    grasp: bool,
    subtasks: Vec<PathBuf>,
}

struct TypeFolder {
    name: String,
    instruction: String,
    tasks: Vec<TaskJob>,
}

fn handle_assemble(args: AssembleArgs) -> Result<()> {
    let run_config = load_run_config(args.config.as_deref())?;
    let mut assembly = run_config.assembly;
    if let Some(stride) = args.stride {
        assembly.stride = stride;
    }
    if let Some(period) = args.frame_period {
        assembly.frame_period_s = period;
    }
    if let Some(terminal) = args.terminal_frame {
        assembly.terminal_frame = terminal.into();
    }
    assembly.validate()?;

    let mut scale = run_config.bbox;
    if let Some(width) = args.width {
        scale.width = width;
    }
    if let Some(height) = args.height {
        scale.height = height;
    }
    scale.validate()?;

    let settings = SegmentSettings {
        bbox_source: args.bbox_source,
        scale,
        normalized_labels: args.normalized_labels,
    };

    let t_walk = Instant::now();
    let types = discover_tree(&args.input)?;
    let jobs: Vec<&TaskJob> = types.iter().flat_map(|t| t.tasks.iter()).collect();
    if jobs.is_empty() {
        return Err(anyhow!("no task folders found under {}", args.input.display()));
    }
    info!(
        "Found {} task folders in {} type folders",
        jobs.len(),
        types.len()
    );

    let mut results: Vec<(usize, Result<TaskAssembly, TrajError>)> = jobs
        .par_iter()
        .enumerate()
        .map(|(id, job)| (id, build_task(job, &settings, &assembly)))
        .collect();
    results.sort_by_key(|(id, _)| *id);
    if args.verbose {
        info!(
            "Draft stage: {:.1} ms",
            t_walk.elapsed().as_secs_f64() * 1000.0
        );
    }

    let data_root = args.output.join("data");
    let meta_root = args.output.join("meta");
    fs::create_dir_all(&meta_root)
        .with_context(|| format!("failed to create {}", meta_root.display()))?;

    let mut counters = IndexCounters::default();
    let mut results = results.into_iter().map(|(_, r)| r);
    let mut episode_meta = Vec::new();
    let mut stats = Vec::new();
    let mut tasks = Vec::new();
    let mut chunk_sizes: Vec<usize> = Vec::new();
    let mut skipped_tasks = 0usize;

    // Every type folder owns a task index and a chunk, even when it yields no episode.
    for (chunk, type_folder) in types.iter().enumerate() {
        let chunk_dir = data_root.join(format!("chunk-{:03}", chunk));
        fs::create_dir_all(&chunk_dir)
            .with_context(|| format!("failed to create {}", chunk_dir.display()))?;
        let mut written = 0usize;
        for (job, result) in type_folder.tasks.iter().zip(results.by_ref()) {
            let task = match result {
                Ok(task) => task,
                Err(err) if err.is_data_error() => {
                    warn!(
                        "Skipping task {}/{}: {}",
                        job.type_name, job.task_name, err
                    );
                    skipped_tasks += 1;
                    continue;
                }
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("cannot assemble {}/{}", job.type_name, job.task_name)
                    })
                }
            };
            for skipped in &task.skipped {
                debug!(
                    "{}/{}: segment {} skipped ({})",
                    job.type_name, job.task_name, skipped.name, skipped.reason
                );
            }

            let (episode, next) = counters.assign(task.draft);
            counters = next;
            let path = write_episode(&data_root, chunk, &episode)?;
            debug!("Wrote {}", path.display());
            info!(
                "Task {}/{}: episode {} with {} frames ({} source rows, {} segments skipped)",
                job.type_name,
                job.task_name,
                episode.episode_index,
                episode.len(),
                episode.source_len,
                task.skipped.len()
            );
            episode_meta.push(EpisodeMeta::for_episode(&episode, &type_folder.instruction));
            stats.push(episode_stats(&episode)?);
            written += 1;
        }

        if written == 0 {
            warn!("Type folder {} produced no episodes", type_folder.name);
        }
        tasks.push(TaskLine {
            task_index: counters.task_index,
            task: type_folder.instruction.clone(),
        });
        chunk_sizes.push(written);
        counters = counters.next_task();
    }

    let summary = DatasetSummary {
        total_episodes: counters.next_episode,
        total_frames: counters.next_frame,
        total_tasks: counters.task_index,
        total_chunks: chunk_sizes.len(),
        chunks_size: chunk_sizes.first().copied().unwrap_or(0),
        fps: assembly.sampled_fps(),
    };
    write_jsonl(&meta_root.join("episodes.jsonl"), &episode_meta)?;
    write_jsonl(&meta_root.join("episodes_stats.jsonl"), &stats)?;
    write_jsonl(&meta_root.join("tasks.jsonl"), &tasks)?;
    write_info(&meta_root.join("info.json"), &summary)?;

    info!(
        "Assembled {} episodes ({} frames, {} tasks) into {}; {} task folders skipped",
        summary.total_episodes,
        summary.total_frames,
        summary.total_tasks,
        args.output.display(),
        skipped_tasks
    );
    if args.verbose {
        info!(
            "Total: {:.1} ms",
            t_walk.elapsed().as_secs_f64() * 1000.0
        );
    }
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
struct TaskLine {
    task_index: usize,
    task: String,
}

fn list_dirs(path: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(path).with_context(|| format!("failed to list {}", path.display()))?
    {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            out.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
        }
    }
    Ok(out)
}

/// Numeric names first in numeric order, then the rest lexicographically.
fn numeric_key(name: &str) -> (bool, i64, String) {
    match name.trim().parse::<i64>() {
        Ok(n) => (false, n, name.to_string()),
        Err(_) => (true, 0, name.to_string()),
    }
}

fn discover_tree(root: &Path) -> Result<Vec<TypeFolder>> {
    let mut type_dirs = list_dirs(root)?;
    type_dirs.sort_by_key(|(name, _)| numeric_key(name));

    let mut types = Vec::with_capacity(type_dirs.len());
    for (type_name, type_path) in type_dirs {
        let instruction_path = type_path.join("instruction.txt");
        let instruction = match fs::read_to_string(&instruction_path) {
            Ok(text) => clean_instruction(&text),
            Err(_) => {
                warn!("{} missing, task text left empty", instruction_path.display());
                String::new()
            }
        };
        let grasp = grasp_for_type_folder(&type_name);

        let mut task_dirs = list_dirs(&type_path)?;
        task_dirs.sort_by_key(|(name, _)| numeric_key(name));
        let mut tasks = Vec::with_capacity(task_dirs.len());
        for (task_name, task_path) in task_dirs {
            let mut subtasks = list_dirs(&task_path)?;
            subtasks.sort_by(|a, b| a.0.cmp(&b.0));
            tasks.push(TaskJob {
                type_name: type_name.clone(),
                task_name,
                grasp,
                subtasks: subtasks.into_iter().map(|(_, path)| path).collect(),
            });
        }
        types.push(TypeFolder {
            name: type_name,
            instruction,
            tasks,
        });
    }
    Ok(types)
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn build_task(
    job: &TaskJob,
    settings: &SegmentSettings,
    assembly: &AssemblyConfig,
) -> Result<TaskAssembly, TrajError> {
    let segments = job
        .subtasks
        .iter()
        .map(|dir| (dir_name(dir), load_segment(dir, settings)));
    assemble_task(segments, job.grasp, assembly)
}

fn load_segment(dir: &Path, settings: &SegmentSettings) -> Result<Segment, TrajError> {
    let csv_path = dir.join("data.csv");
    let bytes = fs::read(&csv_path).map_err(|err| {
        TrajError::InsufficientData(format!("cannot read {}: {err}", csv_path.display()))
    })?;
    let mut segment = parse_segment_csv(&dir_name(dir), &bytes)?;

    match settings.bbox_source {
        BboxSourceOpt::Csv => {}
        BboxSourceOpt::Terminal => {
            segment.bboxes.fill(BBox::ZERO);
            apply_terminal_source(dir, &mut segment, &settings.scale);
        }
        BboxSourceOpt::PerFrame => apply_label_source(dir, &mut segment, settings),
    }
    Ok(segment)
}

fn apply_terminal_source(dir: &Path, segment: &mut Segment, scale: &BboxScale) {
    let path = dir.join("images").join("bbox.jsonl");
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(_) => {
            warn!("{} not found, zero box kept", path.display());
            return;
        }
    };
    match parse_terminal_boxes(&text) {
        Ok(Some(raw)) => apply_terminal_box(segment, raw, scale),
        Ok(None) => warn!("{} has no usable box, zero box kept", path.display()),
        Err(err) => warn!("Failed to read {}: {}", path.display(), err),
    }
}

fn apply_label_source(dir: &Path, segment: &mut Segment, settings: &SegmentSettings) {
    let path = dir.join("data.json");
    let mut labels = match fs::read_to_string(&path)
        .map_err(|err| err.to_string())
        .and_then(|text| parse_step_labels(&text).map_err(|err| err.to_string()))
    {
        Ok((labels, _skipped)) => labels,
        Err(err) => {
            warn!("No labels from {} ({}), zero boxes kept", path.display(), err);
            Vec::new()
        }
    };
    match repair_terminal_answer(&mut labels) {
        RepairOutcome::Filled {
            target, source, ..
        } => debug!(
            "{}: last step {} box copied from step {}",
            path.display(),
            target,
            source
        ),
        RepairOutcome::NoValidSource => {
            warn!("{}: no box to repair the last step from", path.display())
        }
        RepairOutcome::NotNeeded => {}
    }
    let scale = settings.normalized_labels.then_some(&settings.scale);
    let missing = apply_frame_boxes(segment, &labels, scale);
    if missing > 0 {
        debug!(
            "{}: {} of {} frames without a box",
            path.display(),
            missing,
            segment.len()
        );
    }
}

fn episode_path(data_root: &Path, chunk: usize, episode_index: usize) -> PathBuf {
    data_root
        .join(format!("chunk-{:03}", chunk))
        .join(format!("episode_{:06}.jsonl", episode_index))
}

fn write_episode(data_root: &Path, chunk: usize, episode: &Episode) -> Result<PathBuf> {
    let path = episode_path(data_root, chunk, episode.episode_index);
    write_jsonl(&path, &episode.frames)?;
    Ok(path)
}

fn write_jsonl<T: Serialize>(path: &Path, items: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    for item in items {
        serde_json::to_writer(&mut writer, item)?;
        writer.write_all(b"\n")?;
    }
    writer
        .flush()
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn write_info(path: &Path, summary: &DatasetSummary) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), &summary.info_json())?;
    info!("Wrote {}", path.display());
    Ok(())
}

#[derive(Debug)]
struct DetectionRow {
    source: String,
    len: usize,
    stop_frame: usize,
    frames_after: usize,
    pos_threshold: f64,
    yaw_threshold: f64,
    trim_start_s: f64,
}

fn handle_detect_stop(args: DetectStopArgs) -> Result<()> {
    let run_config = load_run_config(args.config.as_deref())?;
    let mut config = run_config.stop;
    if let Some(mode) = args.mode {
        config.mode = mode.into();
    }
    if let Some(v) = args.r_pos {
        config.r_pos = v;
    }
    if let Some(v) = args.r_yaw {
        config.r_yaw = v;
    }
    if let Some(v) = args.pos_min {
        config.pos_min = v;
    }
    if let Some(v) = args.yaw_min {
        config.yaw_min = v;
    }
    if let Some(v) = args.k {
        config.k = v;
    }
    if let Some(v) = args.hist_ratio {
        config.hist_ratio = v;
    }
    config.validate()?;
    for warning in config.warnings() {
        warn!("{}", warning);
    }
    let params_hash = config.params_hash_sha256()?;
    debug!(
        "Stop config {} ({}): {:?}",
        config.mode.id(),
        params_hash,
        config
    );
    let frame_period = args
        .frame_period
        .unwrap_or(run_config.assembly.frame_period_s);

    let mut rows: Vec<(usize, Option<DetectionRow>)> = args
        .inputs
        .par_iter()
        .enumerate()
        .map(|(id, input)| {
            let outcome = if args.raw {
                detect_raw(input, &config, frame_period)
            } else {
                detect_episode(input, &config)
            };
            match outcome {
                Ok((row, len, detection, label_path)) => {
                    if args.labels {
                        if let Err(err) = write_labels(&label_path, len, &detection, &args.question)
                        {
                            warn!("Failed to write labels for {}: {:#}", input.display(), err);
                        }
                    }
                    (id, Some(row))
                }
                Err(err) => {
                    warn!("Skipping {}: {:#}", input.display(), err);
                    (id, None)
                }
            }
        })
        .collect();
    rows.sort_by_key(|(id, _)| *id);
    let rows: Vec<DetectionRow> = rows.into_iter().filter_map(|(_, row)| row).collect();

    if args.output.as_os_str() == "-" {
        let stdout = io::stdout();
        let mut writer = csv::Writer::from_writer(stdout.lock());
        write_detection_rows(&rows, &params_hash, &mut writer)?;
    } else {
        let file = File::create(&args.output)
            .with_context(|| format!("failed to create {}", args.output.display()))?;
        let mut writer = csv::Writer::from_writer(file);
        write_detection_rows(&rows, &params_hash, &mut writer)?;
        info!("Wrote stop report: {}", args.output.display());
    }
    info!(
        "Detected stop frames for {} of {} inputs",
        rows.len(),
        args.inputs.len()
    );
    Ok(())
}

type Detected = (DetectionRow, usize, StopDetection, PathBuf);

fn detect_raw(input: &Path, config: &StopConfig, frame_period: f64) -> Result<Detected> {
    let csv_path = if input.is_dir() {
        input.join("data.csv")
    } else {
        input.to_path_buf()
    };
    let bytes =
        fs::read(&csv_path).with_context(|| format!("failed to read {}", csv_path.display()))?;
    let segment = parse_segment_csv(&csv_path.display().to_string(), &bytes)?;
    let actions = absolute_actions(&segment.poses);
    let detection = find_stop_frame(actions.view(), config)?;
    let len = segment.len();
    let row = DetectionRow {
        source: csv_path.display().to_string(),
        len,
        stop_frame: detection.stop_frame,
        frames_after: detection.frames_after(len),
        pos_threshold: detection.pos_threshold,
        yaw_threshold: detection.yaw_threshold,
        trim_start_s: detection.clamped(len) as f64 * frame_period,
    };
    Ok((row, len, detection, csv_path.with_extension("json")))
}

fn detect_episode(input: &Path, config: &StopConfig) -> Result<Detected> {
    let episode = read_episode(input)?;
    let detection = find_stop_frame(episode.actions().view(), config)?;
    let len = episode.len();
    let row = DetectionRow {
        source: input.display().to_string(),
        len,
        stop_frame: detection.stop_frame,
        frames_after: detection.frames_after(len),
        pos_threshold: detection.pos_threshold,
        yaw_threshold: detection.yaw_threshold,
        trim_start_s: episode.timestamp_at(detection.stop_frame).unwrap_or(0.0),
    };
    Ok((row, len, detection, input.with_extension("json")))
}

fn write_labels(path: &Path, len: usize, detection: &StopDetection, question: &str) -> Result<()> {
    let labels = stop_labels(len, detection.stop_frame, question);
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, &labels)?;
    writer.flush()?;
    debug!("Wrote step labels: {}", path.display());
    Ok(())
}

fn write_detection_rows<W: Write>(
    rows: &[DetectionRow],
    params_hash: &str,
    writer: &mut csv::Writer<W>,
) -> Result<()> {
    writer.write_record([
        "source",
        "len",
        "stop_frame",
        "frames_after",
        "pos_threshold",
        "yaw_threshold",
        "trim_start_s",
        "params_sha256",
    ])?;
    for row in rows {
        writer.write_record([
            row.source.clone(),
            row.len.to_string(),
            row.stop_frame.to_string(),
            row.frames_after.to_string(),
            format!("{:.4}", row.pos_threshold),
            format!("{:.4}", row.yaw_threshold),
            format!("{:.3}", row.trim_start_s),
            params_hash.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn read_episode(path: &Path) -> Result<Episode> {
    let file = File::open(path).with_context(|| format!("failed to read {}", path.display()))?;
    let mut frames = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let frame: FrameRecord = serde_json::from_str(&line).with_context(|| {
            format!("{}:{} is not a frame record", path.display(), lineno + 1)
        })?;
        frames.push(frame);
    }
    Episode::from_frames(frames).with_context(|| format!("invalid episode {}", path.display()))
}

/// Episode files grouped by chunk, both in name order.
fn episode_files(data_root: &Path) -> Result<Vec<(String, Vec<PathBuf>)>> {
    let mut chunks = list_dirs(data_root)?;
    chunks.retain(|(name, _)| name.starts_with("chunk-"));
    chunks.sort_by(|a, b| a.0.cmp(&b.0));

    let mut out = Vec::with_capacity(chunks.len());
    for (name, dir) in chunks {
        let mut files = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("failed to list {}", dir.display()))?
        {
            let path = entry?.path();
            let is_episode = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("episode_") && n.ends_with(".jsonl"))
                .unwrap_or(false);
            if is_episode {
                files.push(path);
            }
        }
        files.sort();
        out.push((name, files));
    }
    Ok(out)
}

fn read_existing_tasks(path: &Path) -> BTreeMap<usize, Vec<String>> {
    let Ok(file) = File::open(path) else {
        return BTreeMap::new();
    };
    BufReader::new(file)
        .lines()
        .map_while(|line| line.ok())
        .filter_map(|line| serde_json::from_str::<EpisodeMeta>(&line).ok())
        .map(|meta| (meta.episode_index, meta.tasks))
        .collect()
}

fn handle_stats(args: StatsArgs) -> Result<()> {
    let data_root = args.root.join("data");
    let meta_root = args.root.join("meta");
    let chunks = episode_files(&data_root)?;
    let paths: Vec<PathBuf> = chunks.iter().flat_map(|(_, files)| files.clone()).collect();
    if paths.is_empty() {
        return Err(anyhow!("no episode files under {}", data_root.display()));
    }

    let mut episodes: Vec<(usize, EpisodeStats, usize, usize, Option<f64>)> = paths
        .par_iter()
        .map(|path| -> Result<(usize, EpisodeStats, usize, usize, Option<f64>)> {
            let episode = read_episode(path)?;
            let stats = episode_stats(&episode)?;
            let period = episode
                .frames
                .get(1)
                .map(|f| f.timestamp - episode.frames[0].timestamp)
                .filter(|dt| *dt > 0.0);
            Ok((
                episode.episode_index,
                stats,
                episode.len(),
                episode.task_index,
                period,
            ))
        })
        .collect::<Result<Vec<_>>>()?;
    episodes.sort_by_key(|(index, ..)| *index);

    fs::create_dir_all(&meta_root)
        .with_context(|| format!("failed to create {}", meta_root.display()))?;
    let tasks_by_episode = read_existing_tasks(&meta_root.join("episodes.jsonl"));
    let metas: Vec<EpisodeMeta> = episodes
        .iter()
        .map(|(index, _, len, _, _)| EpisodeMeta {
            episode_index: *index,
            tasks: tasks_by_episode.get(index).cloned().unwrap_or_default(),
            length: *len,
        })
        .collect();

    let task_indices: BTreeSet<usize> = episodes.iter().map(|(_, _, _, t, _)| *t).collect();
    let fps = episodes
        .iter()
        .find_map(|(.., period)| *period)
        .map(|dt| 1.0 / dt)
        .unwrap_or_else(|| AssemblyConfig::default().sampled_fps());
    let summary = DatasetSummary {
        total_episodes: episodes.len(),
        total_frames: episodes.iter().map(|(_, _, len, _, _)| len).sum(),
        total_tasks: task_indices.len(),
        total_chunks: chunks.len(),
        chunks_size: chunks.first().map(|(_, files)| files.len()).unwrap_or(0),
        fps,
    };

    let stats: Vec<EpisodeStats> = episodes.into_iter().map(|(_, s, ..)| s).collect();
    write_jsonl(&meta_root.join("episodes_stats.jsonl"), &stats)?;
    write_jsonl(&meta_root.join("episodes.jsonl"), &metas)?;
    write_info(&meta_root.join("info.json"), &summary)?;
    info!(
        "Recomputed statistics for {} episodes ({} frames)",
        summary.total_episodes, summary.total_frames
    );
    Ok(())
}

//! Dispatch of batches to the external fitting tool
//!
//! Every pending batch becomes one [`FitJob`] handled by a worker of a
//! bounded [`WorkerPool`]. A worker blocks on its own child process only.
//! Tools write to a `.partial` file that is renamed to the final output
//! name once the tool exits successfully, so an interrupted run never
//! leaves a truncated file under a name that resume would trust.

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use shared::worker_pool::WorkerPool;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use crate::batch::{BatchKey, RunLayout};
use crate::error::{FakeStarError, Result};

/// Lines appended to the base parameter profile for fake-star runs.
const FAKE_PARAM_LINES: &str = "RandomFake=1\nFakeMatch=3.0\n";

/// How the external fitting tool is invoked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub program: String,
    /// Base photometry name; the chip number is appended
    pub photometry_prefix: String,
    /// Base parameter profile, `{chip}` replaced by the chip number
    pub param_template: String,
    /// Number of exposures in the photometry, which shifts output columns
    pub n_images: usize,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            program: "dolphot".to_string(),
            photometry_prefix: "output".to_string(),
            param_template: "phot{chip}.param".to_string(),
            n_images: 1,
        }
    }
}

impl ToolConfig {
    pub fn base_param_file(&self, work_dir: &Path, chip: u32) -> PathBuf {
        work_dir.join(self.param_template.replace("{chip}", &chip.to_string()))
    }

    pub fn photometry_name(&self, chip: u32) -> String {
        format!("{}{}", self.photometry_prefix, chip)
    }
}

/// Write the run-specific parameter profile of every chip.
///
/// Each profile is the chip's base profile with the fake-star switches
/// appended.
pub fn write_fake_params(layout: &RunLayout, tool: &ToolConfig, chips: &[u32]) -> Result<Vec<PathBuf>> {
    chips
        .iter()
        .map(|&chip| {
            let base = tool.base_param_file(&layout.work_dir, chip);
            let mut text = fs::read_to_string(&base).map_err(|e| {
                FakeStarError::config(format!(
                    "cannot read parameter profile {}: {e}",
                    base.display()
                ))
            })?;
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(FAKE_PARAM_LINES);

            let path = layout.param_file(chip);
            fs::write(&path, text)?;
            debug!("Wrote fake-star parameters for chip {} to {}", chip, path.display());
            Ok(path)
        })
        .collect()
}

/// Everything one tool invocation needs.
#[derive(Debug, Clone, PartialEq)]
pub struct FitJob {
    pub key: BatchKey,
    pub photometry: String,
    pub param_file: PathBuf,
    pub batch_file: PathBuf,
    /// Where the tool must write its detections
    pub output_file: PathBuf,
}

/// A fitting tool run once per batch.
pub trait FittingTool: Send + Sync {
    /// Run the tool for `job`, returning whether it exited successfully.
    fn invoke(&self, job: &FitJob) -> io::Result<bool>;
}

/// The fitting tool as a child process.
#[derive(Debug, Clone)]
pub struct ExternalTool {
    pub program: String,
    pub work_dir: PathBuf,
}

impl ExternalTool {
    pub fn new(program: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            work_dir: work_dir.into(),
        }
    }

    pub fn command(&self, job: &FitJob) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.current_dir(&self.work_dir)
            .arg(&job.photometry)
            .arg(format!("-p{}", job.param_file.display()))
            .arg(format!("FakeStars={}", job.batch_file.display()))
            .arg(format!("FakeOut={}", job.output_file.display()))
            .stdin(Stdio::null());
        cmd
    }
}

impl FittingTool for ExternalTool {
    fn invoke(&self, job: &FitJob) -> io::Result<bool> {
        let output = self.command(job).output()?;
        if !output.status.success() {
            debug!(
                "{} for batch {} exited with {}: {}",
                self.program,
                job.key,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.status.success())
    }
}

/// Whether an interrupted run continues or starts over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeMode {
    /// Dispatch only batches without a usable output
    #[default]
    Resume,
    /// Delete every output and dispatch everything
    Restart,
}

/// A batch that did not produce a usable output.
#[derive(Debug, Clone, PartialEq)]
pub struct IncompleteBatch {
    pub key: BatchKey,
    pub reason: String,
}

/// Outcome of one orchestration pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    pub dispatched: usize,
    pub completed: usize,
    pub incomplete: Vec<IncompleteBatch>,
}

impl RunReport {
    pub fn is_complete(&self) -> bool {
        self.incomplete.is_empty()
    }
}

/// True when `key` has a non-empty output no older than its batch file.
pub fn is_completed(layout: &RunLayout, key: BatchKey) -> bool {
    let Ok(output) = fs::metadata(layout.output_file(key)) else {
        return false;
    };
    if output.len() == 0 {
        return false;
    }
    let batch_time = fs::metadata(layout.batch_file(key)).and_then(|m| m.modified());
    match (output.modified(), batch_time) {
        (Ok(out), Ok(batch)) => out >= batch,
        _ => true,
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Run one job and commit its output. `Err` carries why it is incomplete.
fn execute(tool: &dyn FittingTool, layout: &RunLayout, job: &FitJob) -> std::result::Result<(), String> {
    let output = layout.output_file(job.key);
    remove_if_exists(&job.output_file).map_err(|e| format!("cannot clear partial output: {e}"))?;
    remove_if_exists(&output).map_err(|e| format!("cannot clear previous output: {e}"))?;

    let succeeded = tool
        .invoke(job)
        .map_err(|e| format!("failed to start fitting tool: {e}"))?;
    if !succeeded {
        // Best effort; an unrenamed partial is ignored by resume and matching
        let _ = remove_if_exists(&job.output_file);
        return Err("fitting tool exited with failure".to_string());
    }
    if !job.output_file.exists() {
        return Err("fitting tool wrote no output".to_string());
    }
    fs::rename(&job.output_file, &output).map_err(|e| format!("cannot commit output: {e}"))?;

    match fs::metadata(&output) {
        Ok(meta) if meta.len() > 0 => Ok(()),
        _ => Err("empty output".to_string()),
    }
}

/// Dispatches batches of one run to a fitting tool.
pub struct Orchestrator {
    layout: RunLayout,
    tool_config: ToolConfig,
    tool: Arc<dyn FittingTool>,
    workers: usize,
    show_progress: bool,
}

impl Orchestrator {
    pub fn new(layout: RunLayout, tool_config: ToolConfig, tool: Arc<dyn FittingTool>, workers: usize) -> Self {
        Self {
            layout,
            tool_config,
            tool,
            workers,
            show_progress: false,
        }
    }

    /// Draw a progress bar on stderr while dispatching.
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn job(&self, key: BatchKey) -> FitJob {
        FitJob {
            key,
            photometry: self.tool_config.photometry_name(key.chip),
            param_file: self.layout.param_file(key.chip),
            batch_file: self.layout.batch_file(key),
            output_file: self.layout.partial_output_file(key),
        }
    }

    /// Batches still to run: every known key minus the completed ones.
    pub fn pending(&self, keys: &[BatchKey], mode: ResumeMode) -> Result<Vec<BatchKey>> {
        match mode {
            ResumeMode::Restart => {
                for &key in keys {
                    remove_if_exists(&self.layout.output_file(key))?;
                    remove_if_exists(&self.layout.partial_output_file(key))?;
                }
                let mut all = keys.to_vec();
                all.sort();
                all.dedup();
                Ok(all)
            }
            ResumeMode::Resume => {
                let known: BTreeSet<BatchKey> = keys.iter().copied().collect();
                let completed: BTreeSet<BatchKey> = known
                    .iter()
                    .copied()
                    .filter(|&key| is_completed(&self.layout, key))
                    .collect();
                Ok(known.difference(&completed).copied().collect())
            }
        }
    }

    /// Run every pending batch and wait for all of them.
    ///
    /// Failed batches are reported, never fatal.
    pub fn run(&self, keys: &[BatchKey], mode: ResumeMode) -> Result<RunReport> {
        let pending = self.pending(keys, mode)?;
        if pending.is_empty() {
            info!("All {} batches already complete, nothing to dispatch", keys.len());
            return Ok(RunReport::default());
        }
        info!(
            "Dispatching {} of {} batches to {} with {} workers",
            pending.len(),
            keys.len(),
            self.tool_config.program,
            self.workers
        );

        let progress = if self.show_progress {
            let pb = ProgressBar::new(pending.len() as u64);
            let style = ProgressStyle::default_bar()
                .template("{msg} [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
                .map_err(|e| FakeStarError::Dispatch(e.to_string()))?
                .progress_chars("█▉▊▋▌▍▎▏ ");
            pb.set_style(style);
            pb.set_message("Fitting batches");
            pb
        } else {
            ProgressBar::hidden()
        };

        let (result_tx, result_rx) =
            crossbeam_channel::unbounded::<(BatchKey, std::result::Result<(), String>)>();
        let pool = {
            let tool = Arc::clone(&self.tool);
            let layout = self.layout.clone();
            let progress = progress.clone();
            WorkerPool::new(self.workers, self.workers * 2, move |_worker, job: FitJob| {
                let outcome = execute(tool.as_ref(), &layout, &job);
                progress.inc(1);
                // Receiver outlives the pool
                let _ = result_tx.send((job.key, outcome));
            })
            .map_err(|e| FakeStarError::Dispatch(e.to_string()))?
        };

        for &key in &pending {
            pool.submit(self.job(key))
                .map_err(|e| FakeStarError::Dispatch(e.to_string()))?;
        }
        pool.wait_for_completion();
        progress.finish_with_message("Fitting complete");

        let mut report = RunReport {
            dispatched: pending.len(),
            ..RunReport::default()
        };
        let mut reported = BTreeSet::new();
        for (key, outcome) in result_rx.try_iter() {
            reported.insert(key);
            match outcome {
                Ok(()) => report.completed += 1,
                Err(reason) => report.incomplete.push(IncompleteBatch { key, reason }),
            }
        }
        for &key in &pending {
            if !reported.contains(&key) {
                report.incomplete.push(IncompleteBatch {
                    key,
                    reason: "worker stopped before reporting".to_string(),
                });
            }
        }
        report.incomplete.sort_by_key(|b| b.key);

        for batch in &report.incomplete {
            warn!("Batch {} incomplete: {}", batch.key, batch.reason);
        }
        info!(
            "Dispatched {} batches: {} completed, {} incomplete",
            report.dispatched,
            report.completed,
            report.incomplete.len()
        );
        Ok(report)
    }
}

//! Heavy external programs, usable both inline from the pipeline and as queued worker jobs.

use super::ffmpeg::{AudioToolkit, NormalizeSpec};
use super::process::run_tool;
use crate::error::LocalizeError;
use crate::providers::BackgroundSeparator;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use task_queue::{HeavyTool, Job, TaskQueueError};
use tracing::{info, instrument};

impl From<LocalizeError> for TaskQueueError {
	fn from(error: LocalizeError) -> Self {
		match error {
			LocalizeError::Timeout { timeout, .. } => Self::TimeoutError(timeout),
			LocalizeError::InputMissing(path) => Self::InputMissing(path),
			LocalizeError::Queue(inner) => inner,
			other => Self::ExecutionError(other.to_string()),
		}
	}
}

fn file_stem(path: &Path) -> String {
	path.file_stem().map_or_else(|| "audio".to_string(), |s| s.to_string_lossy().into_owned())
}

/// Source separation through a demucs-compatible CLI, keeping the accompaniment stem.
pub struct SeparationTool {
	/// Program followed by leading arguments, e.g. `["python3", "-m", "demucs"]`.
	command: Vec<String>,
	model: String,
	timeout: Duration,
	toolkit: Arc<dyn AudioToolkit>,
	spec: NormalizeSpec,
}

impl SeparationTool {
	#[must_use]
	pub fn new(command: Vec<String>, model: impl Into<String>, timeout: Duration, toolkit: Arc<dyn AudioToolkit>) -> Self {
		Self {
			command,
			model: model.into(),
			timeout,
			toolkit,
			spec: NormalizeSpec::default(),
		}
	}

	/// Where the CLI writes the accompaniment for `input`.
	#[must_use]
	pub fn background_stem(&self, input: &Path, out_dir: &Path) -> PathBuf {
		out_dir.join(&self.model).join(file_stem(input)).join("no_vocals.wav")
	}

	fn args(&self, input: &Path, out_dir: &Path) -> Vec<String> {
		let mut args: Vec<String> = self.command.iter().skip(1).cloned().collect();
		args.extend([
			"--two-stems".to_string(),
			"vocals".to_string(),
			"-n".to_string(),
			self.model.clone(),
			"-o".to_string(),
			out_dir.to_string_lossy().into_owned(),
			input.to_string_lossy().into_owned(),
		]);
		args
	}

	#[instrument(skip(self), fields(model = %self.model))]
	async fn run_separation(&self, input: &Path, out_dir: &Path) -> Result<PathBuf, LocalizeError> {
		if !input.exists() {
			return Err(LocalizeError::InputMissing(input.to_path_buf()));
		}
		let program = self.command.first().map_or("demucs", String::as_str);
		tokio::fs::create_dir_all(out_dir).await?;

		let output = run_tool(program, self.args(input, out_dir), self.timeout).await?;
		let stem = self.background_stem(input, out_dir);
		if !tokio::fs::try_exists(&stem).await.unwrap_or(false) {
			return Err(LocalizeError::ToolFailed {
				tool: program.to_string(),
				status: "missing output".to_string(),
				stderr: format!("expected {}", stem.display()),
			});
		}
		info!(elapsed_ms = output.elapsed.as_millis(), stem = %stem.display(), "🎛️ Separation finished");
		Ok(stem)
	}
}

#[async_trait]
impl BackgroundSeparator for SeparationTool {
	async fn separate(&self, audio: &Path, work_dir: &Path) -> Result<PathBuf, LocalizeError> {
		self.run_separation(audio, &work_dir.join("separated")).await
	}
}

#[async_trait]
impl HeavyTool for SeparationTool {
	fn name(&self) -> &str {
		"separation"
	}

	async fn run(&self, job: &Job) -> Result<PathBuf, TaskQueueError> {
		let out_dir = job.payload.output_dir.join("separated");
		Ok(self.run_separation(&job.payload.input_path, &out_dir).await?)
	}

	/// Re-encodes the raw stem into the working format next to the job's other outputs.
	async fn finalize(&self, job: &Job, raw_output: PathBuf) -> Result<PathBuf, TaskQueueError> {
		let target = job.payload.output_dir.join(format!("{}_background.wav", file_stem(&job.payload.input_path)));
		self.toolkit.normalize(&raw_output, &target, &self.spec).await?;
		Ok(target)
	}
}

/// Converts any input into the canonical working WAV. `sample_rate`, `channels` and
/// `gain_db` job params override the defaults.
pub struct ConvertTool {
	toolkit: Arc<dyn AudioToolkit>,
	spec: NormalizeSpec,
}

impl ConvertTool {
	#[must_use]
	pub fn new(toolkit: Arc<dyn AudioToolkit>) -> Self {
		Self {
			toolkit,
			spec: NormalizeSpec::default(),
		}
	}

	fn spec_for(&self, job: &Job) -> Result<NormalizeSpec, TaskQueueError> {
		let mut spec = self.spec;
		let params = &job.payload.params;
		if let Some(rate) = params.get("sample_rate") {
			spec.sample_rate = rate.parse().map_err(|_| TaskQueueError::ConversionError(format!("invalid sample_rate '{rate}'")))?;
		}
		if let Some(channels) = params.get("channels") {
			spec.channels = channels.parse().map_err(|_| TaskQueueError::ConversionError(format!("invalid channels '{channels}'")))?;
		}
		if let Some(gain) = params.get("gain_db") {
			spec.gain_db = gain.parse().map_err(|_| TaskQueueError::ConversionError(format!("invalid gain_db '{gain}'")))?;
		}
		Ok(spec)
	}
}

#[async_trait]
impl HeavyTool for ConvertTool {
	fn name(&self) -> &str {
		"convert"
	}

	async fn run(&self, job: &Job) -> Result<PathBuf, TaskQueueError> {
		let spec = self.spec_for(job)?;
		tokio::fs::create_dir_all(&job.payload.output_dir).await?;
		let target = job.payload.output_dir.join(format!("{}.wav", file_stem(&job.payload.input_path)));
		self.toolkit.normalize(&job.payload.input_path, &target, &spec).await?;
		Ok(target)
	}
}

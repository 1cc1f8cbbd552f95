//! Multi-stage localization of one media file.
//!
//! ```text
//! Prepare -> { Transcribe || ExtractBackground } -> Translate -> Synthesize -> Assemble
//! ```
//!
//! Background extraction degrades instead of failing, as does subtitle burning inside Assemble.
//! Every other stage failure is fatal and recorded against its stage. Artifacts written before
//! a failure are left in the request's work directory.

use crate::error::LocalizeError;
use crate::progress::ProgressKind;
use crate::providers::{BackgroundSeparator, CreditLedger, Transcriber, VoiceParams};
use crate::tools::AudioToolkit;
use crate::transcript::{to_srt, Transcript, TranscriptEntry};
use crate::translate::{ChunkedTranslator, MergeReport};
use crate::tts::SegmentTtsExecutor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use task_queue::{HeavySlots, HeavyToolGauge};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Heavy slots used when no shared cap is injected.
const DEFAULT_HEAVY_SLOTS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
	Prepare,
	Transcribe,
	ExtractBackground,
	Translate,
	Synthesize,
	Assemble,
}

impl Stage {
	pub const ALL: [Self; 6] = [Self::Prepare, Self::Transcribe, Self::ExtractBackground, Self::Translate, Self::Synthesize, Self::Assemble];

	/// Progress kind whose live summary drives this stage's percentage.
	const fn progress_kind(self) -> Option<ProgressKind> {
		match self {
			Self::Translate => Some(ProgressKind::Translation),
			Self::Synthesize => Some(ProgressKind::Synthesis),
			_ => None,
		}
	}
}

impl fmt::Display for Stage {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Self::Prepare => "prepare",
			Self::Transcribe => "transcribe",
			Self::ExtractBackground => "extract_background",
			Self::Translate => "translate",
			Self::Synthesize => "synthesize",
			Self::Assemble => "assemble",
		};
		f.write_str(s)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
	Pending,
	Running,
	Completed,
	/// Finished through a fallback.
	Degraded,
	Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageStatus {
	pub stage: Stage,
	/// 0 to 100.
	pub progress: u8,
	pub state: StageState,
	pub message: Option<String>,
	pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
	Running,
	Completed,
	Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
	pub request_id: String,
	pub state: PipelineState,
	pub stages: Vec<StageStatus>,
	pub failed_stage: Option<Stage>,
	pub error: Option<String>,
	pub warnings: Vec<String>,
	pub started_at: DateTime<Utc>,
	pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineStatus {
	fn new(request_id: &str) -> Self {
		let now = Utc::now();
		Self {
			request_id: request_id.to_string(),
			state: PipelineState::Running,
			stages: Stage::ALL
				.iter()
				.map(|&stage| StageStatus {
					stage,
					progress: 0,
					state: StageState::Pending,
					message: None,
					updated_at: now,
				})
				.collect(),
			failed_stage: None,
			error: None,
			warnings: Vec::new(),
			started_at: now,
			finished_at: None,
		}
	}

	#[must_use]
	pub fn stage(&self, stage: Stage) -> Option<&StageStatus> {
		self.stages.iter().find(|s| s.stage == stage)
	}
}

/// Per-request stage status, behind one lock.
#[derive(Default)]
pub struct StatusTable {
	requests: Mutex<HashMap<String, PipelineStatus>>,
}

impl StatusTable {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	fn lock(&self) -> MutexGuard<'_, HashMap<String, PipelineStatus>> {
		self.requests.lock().unwrap_or_else(PoisonError::into_inner)
	}

	pub fn start(&self, request_id: &str) {
		self.lock().insert(request_id.to_string(), PipelineStatus::new(request_id));
	}

	pub fn update_stage(&self, request_id: &str, stage: Stage, progress: u8, state: StageState, message: Option<String>) {
		let mut requests = self.lock();
		let Some(status) = requests.get_mut(request_id) else { return };
		if let Some(entry) = status.stages.iter_mut().find(|s| s.stage == stage) {
			entry.progress = progress.min(100);
			entry.state = state;
			entry.message = message;
			entry.updated_at = Utc::now();
		}
	}

	pub fn warn(&self, request_id: &str, warning: impl Into<String>) {
		if let Some(status) = self.lock().get_mut(request_id) {
			status.warnings.push(warning.into());
		}
	}

	pub fn finish(&self, request_id: &str, outcome: Result<(), &LocalizeError>) {
		let mut requests = self.lock();
		let Some(status) = requests.get_mut(request_id) else { return };
		status.finished_at = Some(Utc::now());
		match outcome {
			Ok(()) => status.state = PipelineState::Completed,
			Err(err) => {
				status.state = PipelineState::Failed;
				status.failed_stage = err.failed_stage();
				status.error = Some(err.to_string());
			}
		}
	}

	#[must_use]
	pub fn get(&self, request_id: &str) -> Option<PipelineStatus> {
		self.lock().get(request_id).cloned()
	}

	pub fn remove(&self, request_id: &str) -> Option<PipelineStatus> {
		self.lock().remove(request_id)
	}

	/// Removes requests that finished at least `ttl` ago and returns their ids.
	pub fn evict_finished(&self, ttl: Duration) -> Vec<String> {
		let now = Utc::now();
		let mut requests = self.lock();
		let expired: Vec<String> = requests
			.values()
			.filter(|status| status.finished_at.is_some_and(|finished| (now - finished).to_std().is_ok_and(|age| age >= ttl)))
			.map(|status| status.request_id.clone())
			.collect();
		for id in &expired {
			requests.remove(id);
		}
		expired
	}

	/// Marks `stage` failed only if it is still running.
	fn abandon(&self, request_id: &str, stage: Stage, message: String) {
		let running = self.get(request_id).and_then(|s| s.stage(stage).map(|st| st.state)) == Some(StageState::Running);
		if running {
			self.update_stage(request_id, stage, 0, StageState::Failed, Some(message));
		}
	}
}

#[derive(Debug, Clone)]
pub struct PipelineRequest {
	pub request_id: String,
	/// Credit ledger account. No credits are touched without one.
	pub owner_id: Option<String>,
	pub video: PathBuf,
	pub source_language: Option<String>,
	pub target_language: String,
	pub voice: VoiceParams,
	pub burn_subtitles: bool,
	pub credits: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundSource {
	Separated,
	CenterCancelled,
	Original,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineArtifacts {
	pub work_dir: PathBuf,
	pub source_audio: Option<PathBuf>,
	pub background: Option<PathBuf>,
	pub background_source: Option<BackgroundSource>,
	pub transcript_srt: Option<PathBuf>,
	pub translation_srt: Option<PathBuf>,
	pub voice_track: Option<PathBuf>,
	pub mixed_audio: Option<PathBuf>,
	pub video: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutput {
	pub request_id: String,
	pub video: PathBuf,
	pub artifacts: PipelineArtifacts,
	pub transcript: Transcript,
	pub translation: Vec<TranscriptEntry>,
	pub merge_report: MergeReport,
	pub failed_segments: usize,
	pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
	pub work_root: PathBuf,
	pub prepare_timeout: Duration,
	pub transcribe_timeout: Duration,
	pub separation_timeout: Duration,
	pub translate_timeout: Duration,
	pub synthesize_timeout: Duration,
	pub assemble_timeout: Duration,
	/// Background level under the new voice, 1.0 leaves it untouched.
	pub background_volume: f32,
}

impl Default for PipelineConfig {
	fn default() -> Self {
		Self {
			work_root: std::env::temp_dir().join("localize"),
			prepare_timeout: Duration::from_secs(300),
			transcribe_timeout: Duration::from_secs(900),
			separation_timeout: Duration::from_secs(1800),
			translate_timeout: Duration::from_secs(900),
			synthesize_timeout: Duration::from_secs(1800),
			assemble_timeout: Duration::from_secs(900),
			background_volume: 0.35,
		}
	}
}

pub struct PipelineOrchestrator {
	transcriber: Arc<dyn Transcriber>,
	separator: Arc<dyn BackgroundSeparator>,
	toolkit: Arc<dyn AudioToolkit>,
	translator: Arc<ChunkedTranslator>,
	tts: Arc<SegmentTtsExecutor>,
	ledger: Option<Arc<dyn CreditLedger>>,
	status: Arc<StatusTable>,
	heavy: HeavySlots,
	config: PipelineConfig,
}

impl PipelineOrchestrator {
	#[must_use]
	pub fn new(
		transcriber: Arc<dyn Transcriber>,
		separator: Arc<dyn BackgroundSeparator>,
		toolkit: Arc<dyn AudioToolkit>,
		translator: Arc<ChunkedTranslator>,
		tts: Arc<SegmentTtsExecutor>,
		config: PipelineConfig,
	) -> Self {
		Self {
			transcriber,
			separator,
			toolkit,
			translator,
			tts,
			ledger: None,
			status: Arc::new(StatusTable::new()),
			heavy: HeavySlots::new(DEFAULT_HEAVY_SLOTS, HeavyToolGauge::new(None)),
			config,
		}
	}

	#[must_use]
	pub fn with_ledger(mut self, ledger: Arc<dyn CreditLedger>) -> Self {
		self.ledger = Some(ledger);
		self
	}

	#[must_use]
	pub fn with_status_table(mut self, status: Arc<StatusTable>) -> Self {
		self.status = status;
		self
	}

	/// Shares the heavy-tool cap with a worker pool so inline separations count against it.
	#[must_use]
	pub fn with_heavy_slots(mut self, heavy: HeavySlots) -> Self {
		self.heavy = heavy;
		self
	}

	/// Drops the stage table and segment progress of `request_id`, returning the final status.
	pub fn forget(&self, request_id: &str) -> Option<PipelineStatus> {
		self.tts.progress().remove(request_id);
		self.status.remove(request_id)
	}

	/// Evicts requests finished at least `ttl` ago along with their progress, and progress
	/// nobody has touched for `ttl`. Returns the number of requests evicted.
	pub fn evict_expired(&self, ttl: Duration) -> usize {
		let progress = self.tts.progress();
		let evicted = self.status.evict_finished(ttl);
		for request_id in &evicted {
			progress.remove(request_id);
		}
		progress.sweep_expired(ttl);
		evicted.len()
	}

	pub fn spawn_janitor(self: &Arc<Self>, interval: Duration, ttl: Duration, cancel: CancellationToken) -> JoinHandle<()> {
		let orchestrator = Arc::clone(self);
		tokio::spawn(async move {
			loop {
				tokio::select! {
					() = cancel.cancelled() => break,
					() = sleep(interval) => {
						let evicted = orchestrator.evict_expired(ttl);
						if evicted > 0 {
							debug!(evicted, "Evicted finished pipeline requests");
						}
					}
				}
			}
		})
	}

	/// Stage table for `request_id`, with live percentages for the translate and synthesize
	/// stages while they run.
	#[must_use]
	pub fn status(&self, request_id: &str) -> Option<PipelineStatus> {
		let mut status = self.status.get(request_id)?;
		for stage in &mut status.stages {
			if stage.state != StageState::Running {
				continue;
			}
			let live = stage.stage.progress_kind().and_then(|kind| self.tts.progress().summary(request_id, kind));
			if let Some(summary) = live {
				#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
				let percent = summary.percentage.clamp(0.0, 100.0) as u8;
				stage.progress = percent;
			}
		}
		Some(status)
	}

	/// Runs the whole pipeline, settling credits on the way out.
	///
	/// # Errors
	/// Returns `StageFailed` naming the first fatal stage
	#[instrument(skip(self, request), fields(request_id = %request.request_id, target = %request.target_language))]
	pub async fn run(&self, request: PipelineRequest) -> Result<PipelineOutput, LocalizeError> {
		let request_id = request.request_id.clone();
		self.status.start(&request_id);
		info!("🎬 Localization started");

		let ledger = self.ledger.as_ref().zip(request.owner_id.as_deref());
		if let Some((ledger, owner)) = ledger {
			if let Err(e) = ledger.lock(owner, request.credits).await {
				let err = e.in_stage(Stage::Prepare);
				self.status.update_stage(&request_id, Stage::Prepare, 0, StageState::Failed, Some(err.to_string()));
				self.status.finish(&request_id, Err(&err));
				return Err(err);
			}
		}

		let result = self.execute(&request).await;

		if let Some((ledger, owner)) = ledger {
			let settled = match &result {
				Ok(_) => ledger.deduct(owner, request.credits).await,
				Err(_) => ledger.unlock(owner, request.credits).await,
			};
			if let Err(e) = settled {
				error!(owner, credits = request.credits, error = %e, "Failed to settle credits");
			}
		}

		match &result {
			Ok(output) => {
				self.status.finish(&request_id, Ok(()));
				info!(video = %output.video.display(), warnings = output.warnings.len(), "✅ Localization finished");
			}
			Err(err) => {
				self.status.finish(&request_id, Err(err));
				error!(error = %err, "❌ Localization failed");
			}
		}
		result
	}

	/// Runs `fut` as `stage` under `limit`, publishing its status transitions.
	async fn stage<T, F>(&self, request_id: &str, stage: Stage, limit: Duration, fut: F) -> Result<T, LocalizeError>
	where
		F: Future<Output = Result<T, LocalizeError>>,
	{
		self.status.update_stage(request_id, stage, 0, StageState::Running, None);
		let outcome = match timeout(limit, fut).await {
			Ok(result) => result,
			Err(_) => Err(LocalizeError::Timeout {
				operation: stage.to_string(),
				timeout: limit,
			}),
		};

		match outcome {
			Ok(value) => {
				self.status.update_stage(request_id, stage, 100, StageState::Completed, None);
				Ok(value)
			}
			Err(err) => {
				self.status.update_stage(request_id, stage, 0, StageState::Failed, Some(err.to_string()));
				Err(err.in_stage(stage))
			}
		}
	}

	async fn execute(&self, request: &PipelineRequest) -> Result<PipelineOutput, LocalizeError> {
		let id = request.request_id.as_str();
		let work_dir = self.config.work_root.join(id);
		let mut artifacts = PipelineArtifacts {
			work_dir: work_dir.clone(),
			..PipelineArtifacts::default()
		};

		let source_audio = work_dir.join("source.wav");
		self.stage(id, Stage::Prepare, self.config.prepare_timeout, async {
			if !request.video.exists() {
				return Err(LocalizeError::InputMissing(request.video.clone()));
			}
			tokio::fs::create_dir_all(&work_dir).await?;
			self.toolkit.extract_audio(&request.video, &source_audio).await
		})
		.await?;
		artifacts.source_audio = Some(source_audio.clone());

		// A transcription failure drops the separation future, which kills its subprocess.
		let joined = tokio::try_join!(
			self.stage(id, Stage::Transcribe, self.config.transcribe_timeout, self.transcriber.transcribe(&source_audio, request.source_language.as_deref())),
			async { Ok::<_, LocalizeError>(self.extract_background(id, &source_audio, &work_dir).await) },
		);
		let (transcript, (background, background_source)) = match joined {
			Ok(both) => both,
			Err(err) => {
				self.status.abandon(id, Stage::ExtractBackground, "cancelled after transcription failed".to_string());
				return Err(err);
			}
		};
		artifacts.background = Some(background.clone());
		artifacts.background_source = Some(background_source);
		artifacts.transcript_srt = Some(write_srt(&work_dir.join("transcript.srt"), &transcript.entries).await?);
		info!(entries = transcript.entries.len(), ?background_source, "Transcription and background ready");

		if transcript.entries.is_empty() {
			return self.passthrough(request, artifacts, transcript, &source_audio).await;
		}

		let translation = self
			.stage(id, Stage::Translate, self.config.translate_timeout, self.translator.translate(Some(id), &transcript.entries, &request.target_language))
			.await?;
		let translation_srt = write_srt(&work_dir.join(format!("translation.{}.srt", request.target_language)), &translation.entries).await?;
		artifacts.translation_srt = Some(translation_srt.clone());

		let synthesis = self
			.stage(id, Stage::Synthesize, self.config.synthesize_timeout, self.tts.synthesize(id, &translation.entries, &request.voice, &work_dir))
			.await?;
		artifacts.voice_track = Some(synthesis.track.clone());

		let mixed = work_dir.join("mixed.wav");
		let video = self
			.stage(id, Stage::Assemble, self.config.assemble_timeout, self.assemble(request, &synthesis.track, &background, &mixed, &translation_srt))
			.await?;
		artifacts.mixed_audio = Some(mixed);
		artifacts.video = Some(video.clone());

		let warnings = self.status.get(id).map(|s| s.warnings).unwrap_or_default();
		Ok(PipelineOutput {
			request_id: id.to_string(),
			video,
			artifacts,
			transcript,
			translation: translation.entries,
			merge_report: translation.report,
			failed_segments: synthesis.failed,
			warnings,
		})
	}

	/// No speech to localize: the video is remuxed with its original audio.
	async fn passthrough(&self, request: &PipelineRequest, mut artifacts: PipelineArtifacts, transcript: Transcript, source_audio: &Path) -> Result<PipelineOutput, LocalizeError> {
		let id = request.request_id.as_str();
		let message = "no speech detected, delivering the original audio".to_string();
		warn!(request_id = id, "{message}");
		self.status.warn(id, message.clone());
		for stage in [Stage::Translate, Stage::Synthesize] {
			self.status.update_stage(id, stage, 100, StageState::Degraded, Some(message.clone()));
		}

		let extension = request.video.extension().and_then(|e| e.to_str()).unwrap_or("mp4");
		let target = artifacts.work_dir.join(format!("localized.{extension}"));
		let video = self
			.stage(id, Stage::Assemble, self.config.assemble_timeout, async { self.toolkit.mux(&request.video, source_audio, &target).await.map(|()| target.clone()) })
			.await?;
		artifacts.video = Some(video.clone());

		let warnings = self.status.get(id).map(|s| s.warnings).unwrap_or_default();
		Ok(PipelineOutput {
			request_id: id.to_string(),
			video,
			artifacts,
			transcript,
			translation: Vec::new(),
			merge_report: MergeReport::default(),
			failed_segments: 0,
			warnings,
		})
	}

	/// Separation, then center-channel cancellation, then the untouched source. Never fails.
	async fn extract_background(&self, request_id: &str, source_audio: &Path, work_dir: &Path) -> (PathBuf, BackgroundSource) {
		let stage = Stage::ExtractBackground;
		let limit = self.config.separation_timeout;
		self.status.update_stage(request_id, stage, 0, StageState::Running, None);

		let separation = async {
			let _slot = self.heavy.acquire().await?;
			self.separator.separate(source_audio, work_dir).await
		};
		let separation_error = match timeout(limit, separation).await {
			Ok(Ok(path)) => {
				self.status.update_stage(request_id, stage, 100, StageState::Completed, None);
				return (path, BackgroundSource::Separated);
			}
			Ok(Err(e)) => e,
			Err(_) => LocalizeError::Timeout {
				operation: "source separation".to_string(),
				timeout: limit,
			},
		};
		warn!(request_id, error = %separation_error, "Source separation failed, trying center-channel cancellation");

		let fallback = work_dir.join("background_center.wav");
		let cancel_error = match timeout(limit, self.toolkit.center_cancel(source_audio, &fallback)).await {
			Ok(Ok(())) => {
				let message = format!("source separation failed ({separation_error}), used center-channel cancellation");
				self.status.warn(request_id, message.clone());
				self.status.update_stage(request_id, stage, 100, StageState::Degraded, Some(message));
				return (fallback, BackgroundSource::CenterCancelled);
			}
			Ok(Err(e)) => e,
			Err(_) => LocalizeError::Timeout {
				operation: "center-channel cancellation".to_string(),
				timeout: limit,
			},
		};

		let message = format!("source separation failed ({separation_error}) and center-channel cancellation failed ({cancel_error}), using original audio");
		warn!(request_id, "{message}");
		self.status.warn(request_id, message.clone());
		self.status.update_stage(request_id, stage, 100, StageState::Degraded, Some(message));
		(source_audio.to_path_buf(), BackgroundSource::Original)
	}

	async fn assemble(&self, request: &PipelineRequest, voice: &Path, background: &Path, mixed: &Path, subtitles: &Path) -> Result<PathBuf, LocalizeError> {
		let id = request.request_id.as_str();
		let work_dir = mixed.parent().unwrap_or_else(|| Path::new("."));
		let extension = request.video.extension().and_then(|e| e.to_str()).unwrap_or("mp4");

		self.toolkit.overlay(voice, background, self.config.background_volume, mixed).await?;
		self.status.update_stage(id, Stage::Assemble, 50, StageState::Running, None);

		let dubbed = work_dir.join(format!("localized.{extension}"));
		self.toolkit.mux(&request.video, mixed, &dubbed).await?;
		if !request.burn_subtitles {
			return Ok(dubbed);
		}

		self.status.update_stage(id, Stage::Assemble, 80, StageState::Running, None);
		let subtitled = work_dir.join(format!("localized.subtitled.{extension}"));
		match self.toolkit.burn_subtitles(&dubbed, subtitles, &subtitled).await {
			Ok(()) => Ok(subtitled),
			Err(e) => {
				let message = format!("subtitle burn failed ({e}), delivering video without subtitles");
				warn!(request_id = id, "{message}");
				self.status.warn(id, message);
				Ok(dubbed)
			}
		}
	}
}

async fn write_srt(path: &Path, entries: &[TranscriptEntry]) -> Result<PathBuf, LocalizeError> {
	tokio::fs::write(path, to_srt(entries)).await?;
	Ok(path.to_path_buf())
}

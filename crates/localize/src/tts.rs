//! Per-segment speech synthesis and time-accurate reassembly.
//!
//! Every transcript entry becomes one task. Tasks run under a logical concurrency cap and take
//! a rate limiter slot before each provider call. Each one records its outcome in the
//! [`ProgressTracker`]. The surviving clips are then laid onto a single track at their
//! original start offsets.

use crate::error::LocalizeError;
use crate::progress::{ProgressKind, ProgressTracker, SegmentMapping, SegmentStatus};
use crate::providers::{SpeechSynthesizer, VoiceParams};
use crate::rate_limiter::RateLimiter;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::tools::{AudioToolkit, NormalizeSpec, PlacedClip};
use crate::transcript::TranscriptEntry;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct TtsConfig {
	pub concurrency: usize,
	/// Longest a segment waits for a rate limiter slot before giving up.
	pub slot_timeout: Duration,
	pub synth_timeout: Duration,
	pub retry: RetryPolicy,
	/// Most inputs handed to a single mix invocation.
	pub mix_batch_size: usize,
	pub normalize: NormalizeSpec,
	/// Extension for the provider's raw audio.
	pub raw_extension: String,
}

impl Default for TtsConfig {
	fn default() -> Self {
		Self {
			concurrency: 15,
			slot_timeout: Duration::from_secs(120),
			synth_timeout: Duration::from_secs(60),
			retry: RetryPolicy::default(),
			mix_batch_size: 32,
			normalize: NormalizeSpec::default(),
			raw_extension: "mp3".to_string(),
		}
	}
}

#[derive(Debug, Clone)]
pub struct SynthesisOutput {
	pub track: PathBuf,
	/// Probed length of the assembled track in seconds.
	pub duration: f64,
	pub segments: Vec<SegmentMapping>,
	pub failed: usize,
}

/// Everything a segment task needs, shared by all tasks of one synthesis run.
struct SegmentContext {
	job_id: String,
	synthesizer: Arc<dyn SpeechSynthesizer>,
	toolkit: Arc<dyn AudioToolkit>,
	limiter: Arc<RateLimiter>,
	progress: Arc<ProgressTracker>,
	config: TtsConfig,
	voice: VoiceParams,
	segments_dir: PathBuf,
}

impl SegmentContext {
	async fn synthesize_segment(&self, entry: &TranscriptEntry) -> Result<Option<(PathBuf, f64)>, LocalizeError> {
		let text = entry.text.trim();
		if text.is_empty() {
			return Ok(None);
		}

		let audio = retry_with_backoff(&self.config.retry, "synthesize_segment", LocalizeError::is_transient, |_| async move {
			self.limiter.wait_for_slot(self.config.slot_timeout).await?;
			timeout(self.config.synth_timeout, self.synthesizer.synthesize(text, &self.voice)).await.map_err(|_| LocalizeError::Timeout {
				operation: format!("synthesize segment {}", entry.index),
				timeout: self.config.synth_timeout,
			})?
		})
		.await?;

		let raw = self.segments_dir.join(format!("segment_{:05}.{}", entry.index, self.config.raw_extension));
		let normalized = self.segments_dir.join(format!("segment_{:05}.wav", entry.index));
		tokio::fs::write(&raw, &audio).await?;
		self.toolkit.normalize(&raw, &normalized, &self.config.normalize).await?;
		let duration = self.toolkit.probe_duration(&normalized).await?;

		Ok(Some((normalized, duration)))
	}

	/// Runs one segment to a terminal progress state. Panics are contained here.
	async fn run(self: Arc<Self>, entry: TranscriptEntry, slots: Arc<Semaphore>) {
		let Ok(_permit) = slots.acquire_owned().await else {
			self.progress.fail(&self.job_id, ProgressKind::Synthesis, entry.index, "segment semaphore closed");
			return;
		};
		self.progress.mark_processing(&self.job_id, ProgressKind::Synthesis, entry.index);

		let outcome = match AssertUnwindSafe(self.synthesize_segment(&entry)).catch_unwind().await {
			Ok(result) => result,
			Err(payload) => {
				let message = payload.downcast_ref::<&str>().map(|s| (*s).to_string()).or_else(|| payload.downcast_ref::<String>().cloned()).unwrap_or_else(|| "unknown panic".to_string());
				Err(LocalizeError::Panicked(message))
			}
		};

		match outcome {
			Ok(Some((path, duration))) => {
				debug!(segment = entry.index, duration, "Segment synthesized");
				self.progress.complete(&self.job_id, ProgressKind::Synthesis, entry.index, Some(path), Some(duration));
			}
			Ok(None) => {
				self.progress.complete(&self.job_id, ProgressKind::Synthesis, entry.index, None, None);
			}
			Err(err) => {
				warn!(segment = entry.index, error = %err, "Segment synthesis failed, leaving it silent");
				self.progress.fail(&self.job_id, ProgressKind::Synthesis, entry.index, err.to_string());
			}
		}
	}
}

pub struct SegmentTtsExecutor {
	synthesizer: Arc<dyn SpeechSynthesizer>,
	toolkit: Arc<dyn AudioToolkit>,
	limiter: Arc<RateLimiter>,
	progress: Arc<ProgressTracker>,
	config: TtsConfig,
}

impl SegmentTtsExecutor {
	#[must_use]
	pub fn new(synthesizer: Arc<dyn SpeechSynthesizer>, toolkit: Arc<dyn AudioToolkit>, limiter: Arc<RateLimiter>, progress: Arc<ProgressTracker>, config: TtsConfig) -> Self {
		Self {
			synthesizer,
			toolkit,
			limiter,
			progress,
			config,
		}
	}

	#[must_use]
	pub fn progress(&self) -> &Arc<ProgressTracker> {
		&self.progress
	}

	/// Synthesizes every entry and assembles the clips into `work_dir/voice_track.wav`.
	///
	/// # Errors
	/// - `NoAudio` when not a single segment produced audio
	/// - mixing or probing errors during assembly
	#[instrument(skip(self, entries, voice), fields(segments = entries.len()))]
	pub async fn synthesize(&self, job_id: &str, entries: &[TranscriptEntry], voice: &VoiceParams, work_dir: &Path) -> Result<SynthesisOutput, LocalizeError> {
		let segments_dir = work_dir.join("segments");
		tokio::fs::create_dir_all(&segments_dir).await?;
		self.progress.register_segments(job_id, ProgressKind::Synthesis, entries);

		let ctx = Arc::new(SegmentContext {
			job_id: job_id.to_string(),
			synthesizer: Arc::clone(&self.synthesizer),
			toolkit: Arc::clone(&self.toolkit),
			limiter: Arc::clone(&self.limiter),
			progress: Arc::clone(&self.progress),
			config: self.config.clone(),
			voice: voice.clone(),
			segments_dir,
		});
		let slots = Arc::new(Semaphore::new(self.config.concurrency.max(1)));

		let mut tasks = JoinSet::new();
		for entry in entries.iter().cloned() {
			tasks.spawn(Arc::clone(&ctx).run(entry, Arc::clone(&slots)));
		}
		while let Some(joined) = tasks.join_next().await {
			if let Err(e) = joined {
				error!(job_id, error = %e, "Segment task aborted");
			}
		}

		let segments = self.progress.segments(job_id, ProgressKind::Synthesis);
		let failed = segments.iter().filter(|s| s.status == SegmentStatus::Failed).count();
		let clips: Vec<PlacedClip> = segments
			.iter()
			.filter(|s| s.status == SegmentStatus::Completed)
			.filter_map(|s| s.audio_path.as_ref().map(|path| PlacedClip::new(path, s.start)))
			.collect();

		if clips.is_empty() {
			return Err(LocalizeError::NoAudio(entries.len()));
		}

		let track = work_dir.join("voice_track.wav");
		self.assemble(clips, work_dir, &track).await?;
		let duration = self.toolkit.probe_duration(&track).await?;
		info!(job_id, duration, failed, "🔊 Voice track assembled");

		Ok(SynthesisOutput { track, duration, segments, failed })
	}

	/// Two-level mix: batches of at most `mix_batch_size` clips become intermediate tracks,
	/// which are then mixed into `output`. A single batch is mixed straight into `output`.
	///
	/// # Errors
	/// Propagates mixing failures
	pub async fn assemble(&self, mut clips: Vec<PlacedClip>, work_dir: &Path, output: &Path) -> Result<(), LocalizeError> {
		clips.sort_by(|a, b| a.offset.total_cmp(&b.offset));
		let batch_size = self.config.mix_batch_size.max(1);

		if clips.len() <= batch_size {
			return self.toolkit.mix(&clips, output).await;
		}

		let mut intermediates = Vec::with_capacity(clips.len().div_ceil(batch_size));
		for (i, batch) in clips.chunks(batch_size).enumerate() {
			let path = work_dir.join(format!("mix_batch_{i:03}.wav"));
			self.toolkit.mix(batch, &path).await?;
			intermediates.push(PlacedClip::new(path, 0.0));
		}
		debug!(batches = intermediates.len(), "Mixing intermediate tracks");
		self.toolkit.mix(&intermediates, output).await
	}
}

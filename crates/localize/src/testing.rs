//! In-process stand-ins for the external collaborators.
//!
//! Audio files written by these fakes contain their own duration in seconds as text, so
//! `probe_duration` is a file read and mixing can be checked arithmetically.

use crate::error::LocalizeError;
use crate::providers::{BackgroundSeparator, CreditLedger, SpeechSynthesizer, Transcriber, Translator, VoiceParams};
use crate::tools::{AudioToolkit, NormalizeSpec, PlacedClip};
use crate::transcript::{parse_srt, to_srt, Transcript, TranscriptEntry};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

async fn read_duration(path: &Path) -> Result<f64, LocalizeError> {
	let raw = tokio::fs::read_to_string(path).await?;
	Ok(raw.trim().parse().unwrap_or(1.0))
}

async fn write_duration(path: &Path, seconds: f64) -> Result<(), LocalizeError> {
	if let Some(parent) = path.parent() {
		tokio::fs::create_dir_all(parent).await?;
	}
	tokio::fs::write(path, format!("{seconds}")).await?;
	Ok(())
}

fn failure(tool: &str) -> LocalizeError {
	LocalizeError::ToolFailed {
		tool: tool.to_string(),
		status: "exit status: 1".to_string(),
		stderr: "simulated failure".to_string(),
	}
}

#[derive(Default)]
pub struct FakeToolkit {
	pub fail_center_cancel: bool,
	pub fail_burn: bool,
	/// Input count of every `mix` call, in call order.
	pub mix_calls: Mutex<Vec<usize>>,
	pub overlays: Mutex<Vec<(PathBuf, PathBuf)>>,
}

impl FakeToolkit {
	pub fn mix_calls(&self) -> Vec<usize> {
		self.mix_calls.lock().unwrap().clone()
	}
}

#[async_trait]
impl AudioToolkit for FakeToolkit {
	async fn extract_audio(&self, video: &Path, output: &Path) -> Result<(), LocalizeError> {
		if !video.exists() {
			return Err(LocalizeError::InputMissing(video.to_path_buf()));
		}
		write_duration(output, read_duration(video).await?).await
	}

	async fn normalize(&self, input: &Path, output: &Path, _spec: &NormalizeSpec) -> Result<(), LocalizeError> {
		write_duration(output, read_duration(input).await?).await
	}

	async fn probe_duration(&self, path: &Path) -> Result<f64, LocalizeError> {
		read_duration(path).await
	}

	async fn mix(&self, clips: &[PlacedClip], output: &Path) -> Result<(), LocalizeError> {
		self.mix_calls.lock().unwrap().push(clips.len());
		let mut longest = 0.0f64;
		for clip in clips {
			longest = longest.max(clip.offset + read_duration(&clip.path).await?);
		}
		write_duration(output, longest).await
	}

	async fn center_cancel(&self, input: &Path, output: &Path) -> Result<(), LocalizeError> {
		if self.fail_center_cancel {
			return Err(failure("ffmpeg"));
		}
		write_duration(output, read_duration(input).await?).await
	}

	async fn overlay(&self, voice: &Path, background: &Path, _background_volume: f32, output: &Path) -> Result<(), LocalizeError> {
		self.overlays.lock().unwrap().push((voice.to_path_buf(), background.to_path_buf()));
		let longest = read_duration(voice).await?.max(read_duration(background).await?);
		write_duration(output, longest).await
	}

	async fn mux(&self, video: &Path, audio: &Path, output: &Path) -> Result<(), LocalizeError> {
		let longest = read_duration(video).await?.max(read_duration(audio).await?);
		write_duration(output, longest).await
	}

	async fn burn_subtitles(&self, video: &Path, _subtitles: &Path, output: &Path) -> Result<(), LocalizeError> {
		if self.fail_burn {
			return Err(failure("ffmpeg"));
		}
		write_duration(output, read_duration(video).await?).await
	}
}

/// Speech whose duration is one tenth of a second per character. Texts containing `FAIL` are
/// rejected and texts containing `PANIC` panic.
#[derive(Default)]
pub struct FakeSynthesizer {
	pub calls: AtomicUsize,
}

#[async_trait]
impl SpeechSynthesizer for FakeSynthesizer {
	async fn synthesize(&self, text: &str, _voice: &VoiceParams) -> Result<Bytes, LocalizeError> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		assert!(!text.contains("PANIC"), "synthesizer crashed");
		if text.contains("FAIL") {
			return Err(LocalizeError::Provider {
				provider: "fake",
				status: 400,
				body: "rejected".to_string(),
			});
		}
		let chars = u32::try_from(text.chars().count()).unwrap_or(u32::MAX);
		Ok(Bytes::from(format!("{}", f64::from(chars) / 10.0)))
	}
}

pub struct FakeTranscriber {
	pub entries: Vec<TranscriptEntry>,
}

#[async_trait]
impl Transcriber for FakeTranscriber {
	async fn transcribe(&self, audio: &Path, _language: Option<&str>) -> Result<Transcript, LocalizeError> {
		if !audio.exists() {
			return Err(LocalizeError::InputMissing(audio.to_path_buf()));
		}
		Ok(Transcript::new(Some("en".to_string()), self.entries.clone()))
	}
}

/// Prefixes every entry with the target language.
pub struct EchoTranslator {
	pub fail: bool,
}

#[async_trait]
impl Translator for EchoTranslator {
	fn name(&self) -> &'static str {
		"echo"
	}

	async fn translate(&self, text: &str, target_language: &str) -> Result<String, LocalizeError> {
		if self.fail {
			return Err(LocalizeError::Provider {
				provider: "echo",
				status: 401,
				body: "bad key".to_string(),
			});
		}
		let entries: Vec<_> = parse_srt(text)?.into_iter().map(|e| TranscriptEntry { text: format!("[{target_language}] {}", e.text), ..e }).collect();
		Ok(to_srt(&entries))
	}
}

pub struct FakeSeparator {
	pub fail: bool,
}

#[async_trait]
impl BackgroundSeparator for FakeSeparator {
	async fn separate(&self, audio: &Path, work_dir: &Path) -> Result<PathBuf, LocalizeError> {
		if self.fail {
			return Err(failure("demucs"));
		}
		let out = work_dir.join("separated_background.wav");
		write_duration(&out, read_duration(audio).await?).await?;
		Ok(out)
	}
}

/// Slow separator that records how many calls overlap.
pub struct CountingSeparator {
	delay: Duration,
	active: AtomicUsize,
	peak: AtomicUsize,
	calls: AtomicUsize,
}

impl CountingSeparator {
	pub const fn new(delay: Duration) -> Self {
		Self {
			delay,
			active: AtomicUsize::new(0),
			peak: AtomicUsize::new(0),
			calls: AtomicUsize::new(0),
		}
	}

	pub fn peak(&self) -> usize {
		self.peak.load(Ordering::SeqCst)
	}

	pub fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl BackgroundSeparator for CountingSeparator {
	async fn separate(&self, audio: &Path, work_dir: &Path) -> Result<PathBuf, LocalizeError> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
		self.peak.fetch_max(now, Ordering::SeqCst);
		tokio::time::sleep(self.delay).await;
		self.active.fetch_sub(1, Ordering::SeqCst);

		let out = work_dir.join("separated_background.wav");
		write_duration(&out, read_duration(audio).await?).await?;
		Ok(out)
	}
}

pub struct FailingTranscriber;

#[async_trait]
impl Transcriber for FailingTranscriber {
	async fn transcribe(&self, _audio: &Path, _language: Option<&str>) -> Result<Transcript, LocalizeError> {
		Err(LocalizeError::Provider {
			provider: "fake",
			status: 401,
			body: "invalid api key".to_string(),
		})
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerCall {
	Lock(u64),
	Deduct(u64),
	Unlock(u64),
}

#[derive(Default)]
pub struct FakeLedger {
	pub calls: Mutex<Vec<LedgerCall>>,
	pub reject: bool,
}

impl FakeLedger {
	pub fn calls(&self) -> Vec<LedgerCall> {
		self.calls.lock().unwrap().clone()
	}
}

#[async_trait]
impl CreditLedger for FakeLedger {
	async fn lock(&self, _owner: &str, amount: u64) -> Result<(), LocalizeError> {
		if self.reject {
			return Err(LocalizeError::Credits("insufficient balance".to_string()));
		}
		self.calls.lock().unwrap().push(LedgerCall::Lock(amount));
		Ok(())
	}

	async fn deduct(&self, _owner: &str, amount: u64) -> Result<(), LocalizeError> {
		self.calls.lock().unwrap().push(LedgerCall::Deduct(amount));
		Ok(())
	}

	async fn unlock(&self, _owner: &str, amount: u64) -> Result<(), LocalizeError> {
		self.calls.lock().unwrap().push(LedgerCall::Unlock(amount));
		Ok(())
	}
}

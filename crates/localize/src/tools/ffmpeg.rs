use super::process::run_tool;
use crate::error::LocalizeError;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, instrument};

/// Target format for normalized speech and intermediate tracks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizeSpec {
	pub sample_rate: u32,
	pub channels: u16,
	pub gain_db: f32,
}

impl Default for NormalizeSpec {
	fn default() -> Self {
		Self {
			sample_rate: 44_100,
			channels: 2,
			gain_db: 0.0,
		}
	}
}

/// An audio file placed on a timeline at `offset` seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedClip {
	pub path: PathBuf,
	pub offset: f64,
}

impl PlacedClip {
	pub fn new(path: impl Into<PathBuf>, offset: f64) -> Self {
		Self { path: path.into(), offset }
	}
}

#[async_trait]
pub trait AudioToolkit: Send + Sync {
	/// Demuxes the audio track of a video into a WAV file.
	async fn extract_audio(&self, video: &Path, output: &Path) -> Result<(), LocalizeError>;

	async fn normalize(&self, input: &Path, output: &Path, spec: &NormalizeSpec) -> Result<(), LocalizeError>;

	/// Length of the media in seconds.
	async fn probe_duration(&self, path: &Path) -> Result<f64, LocalizeError>;

	/// Mixes every clip at its offset. The output lasts as long as the longest placed clip.
	async fn mix(&self, clips: &[PlacedClip], output: &Path) -> Result<(), LocalizeError>;

	/// Cheap vocal removal: cancels whatever is panned dead center.
	async fn center_cancel(&self, input: &Path, output: &Path) -> Result<(), LocalizeError>;

	/// Lays `voice` over `background`, attenuating the background to `background_volume`.
	async fn overlay(&self, voice: &Path, background: &Path, background_volume: f32, output: &Path) -> Result<(), LocalizeError>;

	/// Replaces the audio of `video` with `audio`, copying the video stream.
	async fn mux(&self, video: &Path, audio: &Path, output: &Path) -> Result<(), LocalizeError>;

	async fn burn_subtitles(&self, video: &Path, subtitles: &Path, output: &Path) -> Result<(), LocalizeError>;
}

#[derive(Debug, Clone)]
pub struct FfmpegToolkit {
	ffmpeg: String,
	ffprobe: String,
	timeout: Duration,
}

impl Default for FfmpegToolkit {
	fn default() -> Self {
		Self::new("ffmpeg", "ffprobe", Duration::from_secs(600))
	}
}

fn arg(path: &Path) -> String {
	path.to_string_lossy().into_owned()
}

/// Escapes a path for use as a filter option value.
#[must_use]
pub fn escape_filter_path(path: &Path) -> String {
	let mut escaped = String::new();
	for c in path.to_string_lossy().chars() {
		if matches!(c, '\\' | ':' | '\'' | ',' | ';' | '[' | ']') {
			escaped.push('\\');
		}
		escaped.push(c);
	}
	escaped
}

/// `filter_complex` graph delaying input `i` by its clip offset, then summing without level normalization.
#[must_use]
pub fn mix_filter(clips: &[PlacedClip]) -> String {
	let mut graph = String::new();
	for (i, clip) in clips.iter().enumerate() {
		#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
		let delay_ms = (clip.offset.max(0.0) * 1000.0).round() as u64;
		let _ = write!(graph, "[{i}:a]adelay=delays={delay_ms}:all=1[a{i}];");
	}
	for i in 0..clips.len() {
		let _ = write!(graph, "[a{i}]");
	}
	if clips.len() == 1 {
		graph.push_str("anull[out]");
	} else {
		let _ = write!(graph, "amix=inputs={}:duration=longest:normalize=0[out]", clips.len());
	}
	graph
}

fn parse_probe_duration(stdout: &[u8]) -> Result<f64, LocalizeError> {
	let probe: Value = serde_json::from_slice(stdout)?;
	probe["format"]["duration"]
		.as_str()
		.and_then(|d| d.parse::<f64>().ok())
		.ok_or_else(|| LocalizeError::ToolFailed {
			tool: "ffprobe".to_string(),
			status: "ok".to_string(),
			stderr: "no duration in probe output".to_string(),
		})
}

impl FfmpegToolkit {
	pub fn new(ffmpeg: impl Into<String>, ffprobe: impl Into<String>, timeout: Duration) -> Self {
		Self {
			ffmpeg: ffmpeg.into(),
			ffprobe: ffprobe.into(),
			timeout,
		}
	}

	async fn ffmpeg(&self, args: Vec<String>) -> Result<(), LocalizeError> {
		let mut full = vec!["-hide_banner".to_string(), "-nostdin".to_string(), "-y".to_string(), "-loglevel".to_string(), "error".to_string()];
		full.extend(args);
		run_tool(&self.ffmpeg, &full, self.timeout).await.map(|_| ())
	}
}

#[async_trait]
impl AudioToolkit for FfmpegToolkit {
	async fn extract_audio(&self, video: &Path, output: &Path) -> Result<(), LocalizeError> {
		self.ffmpeg(vec!["-i".into(), arg(video), "-vn".into(), "-acodec".into(), "pcm_s16le".into(), "-ar".into(), "44100".into(), "-ac".into(), "2".into(), arg(output)]).await
	}

	async fn normalize(&self, input: &Path, output: &Path, spec: &NormalizeSpec) -> Result<(), LocalizeError> {
		self.ffmpeg(vec![
			"-i".into(),
			arg(input),
			"-af".into(),
			format!("volume={}dB", spec.gain_db),
			"-ar".into(),
			spec.sample_rate.to_string(),
			"-ac".into(),
			spec.channels.to_string(),
			"-acodec".into(),
			"pcm_s16le".into(),
			arg(output),
		])
		.await
	}

	async fn probe_duration(&self, path: &Path) -> Result<f64, LocalizeError> {
		let target = arg(path);
		let output = run_tool(&self.ffprobe, ["-v", "quiet", "-print_format", "json", "-show_format", target.as_str()], self.timeout).await?;
		parse_probe_duration(&output.stdout)
	}

	#[instrument(skip(self, clips), fields(clips = clips.len()))]
	async fn mix(&self, clips: &[PlacedClip], output: &Path) -> Result<(), LocalizeError> {
		if clips.is_empty() {
			return Err(LocalizeError::NoAudio(0));
		}
		let mut args = Vec::with_capacity(clips.len() * 2 + 6);
		for clip in clips {
			args.push("-i".to_string());
			args.push(arg(&clip.path));
		}
		args.extend(["-filter_complex".to_string(), mix_filter(clips), "-map".to_string(), "[out]".to_string(), "-acodec".to_string(), "pcm_s16le".to_string(), arg(output)]);
		debug!(output = %output.display(), "Mixing clips");
		self.ffmpeg(args).await
	}

	async fn center_cancel(&self, input: &Path, output: &Path) -> Result<(), LocalizeError> {
		self.ffmpeg(vec!["-i".into(), arg(input), "-af".into(), "pan=stereo|c0=c0-c1|c1=c1-c0".into(), "-acodec".into(), "pcm_s16le".into(), arg(output)]).await
	}

	async fn overlay(&self, voice: &Path, background: &Path, background_volume: f32, output: &Path) -> Result<(), LocalizeError> {
		let graph = format!("[1:a]volume={background_volume}[bg];[0:a][bg]amix=inputs=2:duration=longest:normalize=0[out]");
		self.ffmpeg(vec![
			"-i".into(),
			arg(voice),
			"-i".into(),
			arg(background),
			"-filter_complex".into(),
			graph,
			"-map".into(),
			"[out]".into(),
			"-acodec".into(),
			"pcm_s16le".into(),
			arg(output),
		])
		.await
	}

	async fn mux(&self, video: &Path, audio: &Path, output: &Path) -> Result<(), LocalizeError> {
		self.ffmpeg(vec![
			"-i".into(),
			arg(video),
			"-i".into(),
			arg(audio),
			"-map".into(),
			"0:v:0".into(),
			"-map".into(),
			"1:a:0".into(),
			"-c:v".into(),
			"copy".into(),
			"-c:a".into(),
			"aac".into(),
			arg(output),
		])
		.await
	}

	async fn burn_subtitles(&self, video: &Path, subtitles: &Path, output: &Path) -> Result<(), LocalizeError> {
		self.ffmpeg(vec!["-i".into(), arg(video), "-vf".into(), format!("subtitles={}", escape_filter_path(subtitles)), "-c:a".into(), "copy".into(), arg(output)]).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_mix_filter_delays_and_sums() {
		let clips = vec![PlacedClip::new("a.wav", 0.0), PlacedClip::new("b.wav", 1.5), PlacedClip::new("c.wav", 12.3456)];
		assert_eq!(
			mix_filter(&clips),
			"[0:a]adelay=delays=0:all=1[a0];[1:a]adelay=delays=1500:all=1[a1];[2:a]adelay=delays=12346:all=1[a2];[a0][a1][a2]amix=inputs=3:duration=longest:normalize=0[out]"
		);
	}

	#[test]
	fn test_single_clip_mix_passes_through() {
		assert_eq!(mix_filter(&[PlacedClip::new("a.wav", 2.0)]), "[0:a]adelay=delays=2000:all=1[a0];[a0]anull[out]");
	}

	#[test]
	fn test_filter_path_escaping() {
		assert_eq!(escape_filter_path(Path::new("/tmp/job:1/it's.srt")), "/tmp/job\\:1/it\\'s.srt");
	}

	#[test]
	fn test_probe_duration_parsing() {
		let stdout = br#"{"format":{"filename":"x.wav","duration":"3.250000"}}"#;
		assert!((parse_probe_duration(stdout).unwrap() - 3.25).abs() < 1e-9);
		assert!(parse_probe_duration(br#"{"format":{}}"#).is_err());
	}
}

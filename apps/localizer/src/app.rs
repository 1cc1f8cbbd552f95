use crate::config::{Config, LocalizeArgs, ToolConfig};
use anyhow::{Context, Result};
use localize::providers::{BackgroundSeparator, DeepLTranslator, OpenAiClient, OpenAiConfig, Translator, TranslatorBackend, VoiceParams};
use localize::tools::{AudioToolkit, ConvertTool, FfmpegToolkit, SeparationTool};
use localize::{ChunkedTranslator, PipelineConfig, PipelineOrchestrator, PipelineRequest, ProgressTracker, RateLimiter, RateLimiterConfig, SegmentTtsExecutor, TranslatorConfig, TtsConfig};
use prometheus::Registry;
use std::sync::Arc;
use std::time::Duration;
use task_queue::{HeavySlots, HeavyToolGauge, JobQueue, JobType, RedisJobQueue, WorkerPool};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const REDIS_MAX_RETRIES: u32 = 5;
const REDIS_INITIAL_BACKOFF_MS: u64 = 500;
const LIMITER_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const JANITOR_INTERVAL: Duration = Duration::from_secs(60);
const FINISHED_REQUEST_TTL: Duration = Duration::from_secs(3600);

pub fn toolkit(tools: &ToolConfig) -> Arc<dyn AudioToolkit> {
	Arc::new(FfmpegToolkit::new(tools.ffmpeg.clone(), tools.ffprobe.clone(), tools.tool_timeout))
}

pub fn separation_tool(tools: &ToolConfig, toolkit: Arc<dyn AudioToolkit>) -> Arc<SeparationTool> {
	Arc::new(SeparationTool::new(tools.separator_command.clone(), tools.separator_model.clone(), tools.separator_timeout, toolkit))
}

/// Opens the broker and probes it, backing off exponentially between attempts.
pub async fn connect_with_retry(config: &Config) -> Result<Arc<dyn JobQueue>> {
	let queue = RedisJobQueue::new(&config.queue).context("invalid Redis URL")?;

	let mut attempt = 1;
	loop {
		match queue.queue_lengths().await {
			Ok(lengths) => {
				let pending: usize = lengths.iter().map(|(_, len)| len).sum();
				info!(url = %config.queue.redis_url, pending, "✅ Connected to Redis");
				return Ok(Arc::new(queue));
			}
			Err(e) if attempt >= REDIS_MAX_RETRIES => {
				error!(
					error = %e,
					url = %config.queue.redis_url,
					"❌ Failed to connect to Redis after {} attempts - service cannot continue",
					REDIS_MAX_RETRIES
				);
				return Err(e.into());
			}
			Err(e) => {
				let backoff = REDIS_INITIAL_BACKOFF_MS * 2_u64.pow(attempt - 1);
				warn!(
					attempt,
					max_retries = REDIS_MAX_RETRIES,
					backoff_ms = backoff,
					error = %e,
					"⚠️ Redis connection failed, retrying..."
				);

				tokio::time::sleep(Duration::from_millis(backoff)).await;
				attempt += 1;
			}
		}
	}
}

pub fn worker_pool(config: &Config, queue: Arc<dyn JobQueue>, registry: &Registry) -> Result<WorkerPool> {
	let toolkit = toolkit(&config.tools);
	let separation = separation_tool(&config.tools, toolkit.clone());
	let convert = Arc::new(ConvertTool::new(toolkit));

	let pool = WorkerPool::new(queue, config.queue.clone(), registry)?
		.with_tool(JobType::SourceSeparation, separation)
		.with_tool(JobType::AudioConvert, convert);
	Ok(pool)
}

/// Heavy-tool cap for in-process pipelines, sized like the worker pool's.
pub fn heavy_slots(config: &Config) -> HeavySlots {
	HeavySlots::new(config.queue.heavy_slots, HeavyToolGauge::new(None))
}

/// Wires providers, limiter and executors into one orchestrator. The returned token stops the
/// limiter sweeper and the request janitor.
pub fn orchestrator(tools: &ToolConfig, args: &LocalizeArgs, heavy: HeavySlots) -> Result<(Arc<PipelineOrchestrator>, CancellationToken)> {
	let mut openai_config = OpenAiConfig::new(args.openai_api_key.clone());
	openai_config.base_url = args.openai_base_url.clone();
	let openai = Arc::new(OpenAiClient::new(openai_config)?);
	let speech_format = openai.speech_format().to_string();

	let translator: Arc<dyn Translator> = match args.translator {
		TranslatorBackend::OpenAi => openai.clone(),
		TranslatorBackend::DeepL => {
			let key = args.deepl_api_key.clone().context("DEEPL_API_KEY is required for the deepl translator")?;
			Arc::new(DeepLTranslator::new(key, Duration::from_secs(120))?)
		}
	};
	info!(translator = translator.name(), "🌐 Translator selected");

	let toolkit = toolkit(tools);
	let separator: Arc<dyn BackgroundSeparator> = separation_tool(tools, toolkit.clone());

	let progress = Arc::new(ProgressTracker::new());
	let limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
		max_requests: args.tts_rate_limit,
		window: args.tts_rate_window,
		..RateLimiterConfig::default()
	}));
	let cancel = CancellationToken::new();
	limiter.spawn_sweeper(LIMITER_SWEEP_INTERVAL, cancel.clone());

	let chunked = Arc::new(ChunkedTranslator::new(
		translator,
		TranslatorConfig {
			concurrency: args.translate_concurrency,
			..TranslatorConfig::default()
		},
		Some(progress.clone()),
	));

	let tts = Arc::new(SegmentTtsExecutor::new(
		openai.clone(),
		toolkit.clone(),
		limiter,
		progress,
		TtsConfig {
			concurrency: args.tts_concurrency,
			raw_extension: speech_format,
			..TtsConfig::default()
		},
	));

	let pipeline_config = PipelineConfig {
		work_root: args.work_root.clone(),
		separation_timeout: tools.separator_timeout,
		background_volume: args.background_volume,
		..PipelineConfig::default()
	};

	let orchestrator = Arc::new(PipelineOrchestrator::new(openai, separator, toolkit, chunked, tts, pipeline_config).with_heavy_slots(heavy));
	orchestrator.spawn_janitor(JANITOR_INTERVAL, FINISHED_REQUEST_TTL, cancel.clone());
	Ok((orchestrator, cancel))
}

pub fn request(args: &LocalizeArgs) -> PipelineRequest {
	PipelineRequest {
		request_id: uuid::Uuid::new_v4().to_string(),
		owner_id: None,
		video: args.video.clone(),
		source_language: args.source_language.clone(),
		target_language: args.target_language.clone(),
		voice: VoiceParams {
			voice: args.voice.clone(),
			model: args.tts_model.clone(),
			..VoiceParams::default()
		},
		burn_subtitles: args.burn_subtitles,
		credits: 0,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use clap::Parser;

	fn localize_config() -> Config {
		Config::try_parse_from([
			"localizer",
			"localize",
			"--video",
			"talk.mp4",
			"--target-language",
			"de",
			"--openai-api-key",
			"sk-test",
			"--translator",
			"openai",
			"--voice",
			"nova",
		])
		.unwrap()
	}

	#[test]
	fn test_request_carries_cli_choices() {
		let config = localize_config();
		let crate::config::Command::Localize(args) = &config.command else {
			panic!("expected localize");
		};
		let request = request(args);
		assert_eq!(request.target_language, "de");
		assert_eq!(request.voice.voice, "nova");
		assert!(request.owner_id.is_none());
		assert!(uuid::Uuid::parse_str(&request.request_id).is_ok());
	}

	#[tokio::test]
	async fn test_orchestrator_wiring() {
		let config = localize_config();
		let crate::config::Command::Localize(args) = &config.command else {
			panic!("expected localize");
		};
		let heavy = heavy_slots(&config);
		let (orchestrator, cancel) = orchestrator(&config.tools, args, heavy.clone()).unwrap();
		assert!(orchestrator.status("nothing-yet").is_none());
		assert_eq!(heavy.available(), config.queue.heavy_slots);
		cancel.cancel();
	}
}

use clap::{Args, Parser, Subcommand};
use localize::providers::TranslatorBackend;
use std::path::PathBuf;
use std::time::Duration;
use task_queue::{JobType, WorkerConfig};

#[derive(Parser, Debug, Clone)]
#[command(name = "localizer")]
#[command(about = "Media localization: job worker, queue client and one-shot pipeline", long_about = None)]
pub struct Config {
	/// Service name for observability
	#[arg(long, global = true, env = "OTEL_SERVICE_NAME", default_value = "localizer")]
	pub service_name: String,

	/// Emit logs as JSON lines
	#[arg(long, global = true, env = "LOG_JSON")]
	pub log_json: bool,

	/// Export traces over OTLP (endpoint from OTEL_EXPORTER_OTLP_ENDPOINT)
	#[arg(long, global = true, env = "OTLP_ENABLED")]
	pub otlp: bool,

	#[command(flatten)]
	pub queue: WorkerConfig,

	#[command(flatten)]
	pub tools: ToolConfig,

	#[command(subcommand)]
	pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct ToolConfig {
	#[arg(long, env = "FFMPEG_PATH", default_value = "ffmpeg")]
	pub ffmpeg: String,

	#[arg(long, env = "FFPROBE_PATH", default_value = "ffprobe")]
	pub ffprobe: String,

	/// Per-invocation limit for ffmpeg and ffprobe, in seconds
	#[arg(long = "tool-timeout-secs", env = "TOOL_TIMEOUT_SECS", default_value = "600", value_parser = parse_secs)]
	pub tool_timeout: Duration,

	/// Separation command line, program first
	#[arg(long, env = "SEPARATOR_COMMAND", default_value = "demucs", value_delimiter = ' ')]
	pub separator_command: Vec<String>,

	#[arg(long, env = "SEPARATOR_MODEL", default_value = "htdemucs")]
	pub separator_model: String,

	#[arg(long = "separator-timeout-secs", env = "SEPARATOR_TIMEOUT_SECS", default_value = "1800", value_parser = parse_secs)]
	pub separator_timeout: Duration,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
	/// Run the worker pool and supervisor until SIGINT/SIGTERM
	Worker,

	/// Enqueue a heavy job and print its id
	Submit {
		#[arg(long, value_parser = parse_job_type)]
		job_type: JobType,

		#[arg(long)]
		input: PathBuf,

		#[arg(long)]
		output_dir: PathBuf,

		#[arg(long, default_value = "5")]
		priority: u8,

		#[arg(long = "max-duration-secs", default_value = "1800", value_parser = parse_secs)]
		max_duration: Duration,

		/// Extra job parameters as key=value
		#[arg(long = "param", value_parser = parse_key_value)]
		params: Vec<(String, String)>,
	},

	/// Print a job's status (and result or failure reason when terminal)
	Status { job_id: String },

	/// Poll until the job finishes, then print its result
	Wait {
		job_id: String,

		#[arg(long = "timeout-secs", default_value = "3600", value_parser = parse_secs)]
		timeout: Duration,

		#[arg(long = "poll-millis", default_value = "1000", value_parser = parse_millis)]
		poll_interval: Duration,
	},

	/// Run the full localization pipeline on one video in this process
	Localize(LocalizeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct LocalizeArgs {
	#[arg(long)]
	pub video: PathBuf,

	#[arg(long)]
	pub target_language: String,

	#[arg(long)]
	pub source_language: Option<String>,

	#[arg(long, env = "WORK_ROOT", default_value = "./localize-work")]
	pub work_root: PathBuf,

	#[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
	pub openai_api_key: String,

	#[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
	pub openai_base_url: String,

	#[arg(long, env = "TRANSLATOR", default_value = "openai")]
	pub translator: TranslatorBackend,

	#[arg(long, env = "DEEPL_API_KEY", hide_env_values = true)]
	pub deepl_api_key: Option<String>,

	#[arg(long, env = "TTS_VOICE", default_value = "alloy")]
	pub voice: String,

	#[arg(long, env = "TTS_MODEL", default_value = "tts-1")]
	pub tts_model: String,

	/// Speech requests allowed per rate window
	#[arg(long, env = "TTS_RATE_LIMIT", default_value = "60")]
	pub tts_rate_limit: usize,

	#[arg(long = "tts-rate-window-secs", env = "TTS_RATE_WINDOW_SECS", default_value = "60", value_parser = parse_secs)]
	pub tts_rate_window: Duration,

	#[arg(long, env = "TTS_CONCURRENCY", default_value = "15")]
	pub tts_concurrency: usize,

	#[arg(long, env = "TRANSLATE_CONCURRENCY", default_value = "5")]
	pub translate_concurrency: usize,

	#[arg(long)]
	pub burn_subtitles: bool,

	#[arg(long, default_value = "0.35")]
	pub background_volume: f32,
}

impl Config {
	/// Validate configuration values
	pub fn validate(&self) -> Result<(), String> {
		if self.tools.tool_timeout.is_zero() {
			return Err("tool_timeout must be greater than 0".to_string());
		}

		if self.tools.separator_command.iter().all(|part| part.trim().is_empty()) {
			return Err("separator_command must name a program".to_string());
		}

		match &self.command {
			Command::Worker => self.queue.validate(),
			Command::Submit { priority, .. } if !(1..=10).contains(priority) => Err(format!("priority {priority} is outside 1..=10")),
			Command::Localize(_) if self.queue.heavy_slots == 0 => Err("heavy_slots must be at least 1".to_string()),
			Command::Localize(args) => args.validate(),
			_ => Ok(()),
		}
	}
}

impl LocalizeArgs {
	fn validate(&self) -> Result<(), String> {
		if self.target_language.trim().is_empty() {
			return Err("target_language must not be empty".to_string());
		}

		if self.tts_rate_limit == 0 || self.tts_rate_window.is_zero() {
			return Err("tts rate limit and window must be greater than 0".to_string());
		}

		if self.tts_concurrency == 0 || self.translate_concurrency == 0 {
			return Err("concurrency settings must be at least 1".to_string());
		}

		if self.translator == TranslatorBackend::DeepL && self.deepl_api_key.is_none() {
			return Err("the deepl translator needs DEEPL_API_KEY".to_string());
		}

		if !(0.0..=1.0).contains(&self.background_volume) {
			return Err("background_volume must be within 0.0..=1.0".to_string());
		}

		Ok(())
	}
}

fn parse_secs(s: &str) -> Result<Duration, std::num::ParseIntError> {
	s.parse::<u64>().map(Duration::from_secs)
}

fn parse_millis(s: &str) -> Result<Duration, std::num::ParseIntError> {
	s.parse::<u64>().map(Duration::from_millis)
}

fn parse_job_type(s: &str) -> Result<JobType, String> {
	match s {
		"source_separation" | "separation" => Ok(JobType::SourceSeparation),
		"audio_convert" | "convert" => Ok(JobType::AudioConvert),
		other => Err(format!("unknown job type '{other}' (expected source_separation or audio_convert)")),
	}
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
	s.split_once('=').map(|(k, v)| (k.trim().to_string(), v.trim().to_string())).ok_or_else(|| format!("expected key=value, got '{s}'"))
}

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Hard ceiling on workers regardless of host size; every worker may drive a heavyweight subprocess.
pub const DEFAULT_MAX_WORKERS: usize = 4;

#[derive(Parser, Clone, Debug, Serialize, Deserialize)]
#[command(author, version, about, long_about = None)]
pub struct WorkerConfig {
	#[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1/", help = "Redis broker holding queues, statuses and results")]
	pub redis_url: String,

	#[arg(long, env = "QUEUE_KEY_PREFIX", default_value = "jobs:", help = "Prefix applied to every broker key")]
	pub key_prefix: String,

	#[arg(long, env = "WORKER_COUNT", help = "Number of workers (defaults to the CPU count, capped by --max-workers)")]
	pub workers: Option<usize>,

	#[arg(long, env = "MAX_WORKERS", default_value = "4", help = "Upper bound on the number of workers")]
	pub max_workers: usize,

	#[arg(long, env = "HEAVY_TOOL_SLOTS", default_value = "2", help = "Concurrent heavy subprocess invocations across all workers")]
	pub heavy_slots: usize,

	#[arg(
        long = "dequeue-block-millis",
        env = "DEQUEUE_BLOCK_MILLIS",
        default_value = "100",
        value_parser = parse_millis,
        help = "How long a dequeue blocks on each priority level"
    )]
	pub dequeue_block: Duration,

	#[arg(
        long = "idle-delay-millis",
        env = "IDLE_DELAY_MILLIS",
        default_value = "500",
        value_parser = parse_millis,
        help = "Pause after a dequeue finds every level empty"
    )]
	pub idle_delay: Duration,

	#[arg(
        long = "heartbeat-interval-secs",
        env = "HEARTBEAT_INTERVAL_SECS",
        default_value = "30",
        value_parser = parse_duration,
        help = "Supervisor sweep interval in seconds"
    )]
	pub heartbeat_interval: Duration,

	#[arg(
        long = "stale-grace-secs",
        env = "STALE_GRACE_SECS",
        default_value = "60",
        value_parser = parse_duration,
        help = "Extra time past max_duration before a processing job is reclaimed"
    )]
	pub stale_grace: Duration,

	#[arg(
        long = "status-ttl-secs",
        env = "STATUS_TTL_SECS",
        default_value = "86400",
        value_parser = parse_duration,
        help = "Expiry of job status records"
    )]
	pub status_ttl: Duration,

	#[arg(
        long = "result-ttl-secs",
        env = "RESULT_TTL_SECS",
        default_value = "604800",
        value_parser = parse_duration,
        help = "Expiry of stored job results"
    )]
	pub result_ttl: Duration,
}

impl Default for WorkerConfig {
	fn default() -> Self {
		Self {
			redis_url: "redis://127.0.0.1/".to_string(),
			key_prefix: "jobs:".to_string(),
			workers: None,
			max_workers: DEFAULT_MAX_WORKERS,
			heavy_slots: 2,
			dequeue_block: Duration::from_millis(100),
			idle_delay: Duration::from_millis(500),
			heartbeat_interval: Duration::from_secs(30),
			stale_grace: Duration::from_secs(60),
			status_ttl: Duration::from_secs(86_400),
			result_ttl: Duration::from_secs(604_800),
		}
	}
}

impl WorkerConfig {
	/// Worker count actually used: explicit override or CPU count, never above `max_workers`.
	#[must_use]
	pub fn resolved_workers(&self) -> usize {
		self.workers.unwrap_or_else(num_cpus::get).min(self.max_workers).max(1)
	}

	/// Validate configuration values
	///
	/// # Errors
	/// Returns a description of the first invalid value
	pub fn validate(&self) -> Result<(), String> {
		if self.max_workers == 0 {
			return Err("max_workers must be at least 1".to_string());
		}

		if self.heavy_slots == 0 {
			return Err("heavy_slots must be at least 1".to_string());
		}

		if self.heavy_slots > self.resolved_workers() {
			return Err(format!("heavy_slots ({}) must not exceed the worker count ({})", self.heavy_slots, self.resolved_workers()));
		}

		// BLPOP treats a zero timeout as "block forever", which would pin workers to one level.
		if self.dequeue_block.is_zero() {
			return Err("dequeue_block must be greater than 0".to_string());
		}

		if self.heartbeat_interval.is_zero() {
			return Err("heartbeat_interval must be greater than 0".to_string());
		}

		if self.result_ttl < self.status_ttl {
			return Err("result_ttl must be at least as long as status_ttl".to_string());
		}

		Ok(())
	}

	#[cfg(test)]
	pub fn test() -> Self {
		Self {
			workers: Some(3),
			max_workers: 3,
			heavy_slots: 1,
			dequeue_block: Duration::from_millis(5),
			idle_delay: Duration::from_millis(10),
			heartbeat_interval: Duration::from_millis(50),
			stale_grace: Duration::ZERO,
			..Self::default()
		}
	}
}

fn parse_duration(s: &str) -> Result<Duration, std::num::ParseIntError> {
	s.parse::<u64>().map(Duration::from_secs)
}

fn parse_millis(s: &str) -> Result<Duration, std::num::ParseIntError> {
	s.parse::<u64>().map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_default_config() {
		let config = WorkerConfig::default();
		assert_eq!(config.max_workers, 4);
		assert_eq!(config.heavy_slots, 2);
		assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
		assert_eq!(config.status_ttl, Duration::from_secs(86_400));
		assert!(config.validate().is_ok());
	}

	#[test]
	fn test_resolved_workers_is_capped() {
		let config = WorkerConfig {
			workers: Some(64),
			..WorkerConfig::default()
		};
		assert_eq!(config.resolved_workers(), DEFAULT_MAX_WORKERS);

		let config = WorkerConfig {
			workers: Some(0),
			..WorkerConfig::default()
		};
		assert_eq!(config.resolved_workers(), 1);
	}

	#[test]
	fn test_parse_duration() {
		assert_eq!(parse_duration("60").unwrap(), Duration::from_secs(60));
		assert_eq!(parse_millis("250").unwrap(), Duration::from_millis(250));
		assert!(parse_duration("invalid").is_err());
	}

	#[test]
	fn test_validate_rejects_heavy_slots_above_workers() {
		let config = WorkerConfig {
			workers: Some(2),
			heavy_slots: 3,
			..WorkerConfig::default()
		};
		assert!(config.validate().is_err());
	}

	#[test]
	fn test_validate_rejects_zero_dequeue_block() {
		let config = WorkerConfig::try_parse_from(["program", "--dequeue-block-millis", "0"]).unwrap();
		assert_eq!(config.dequeue_block, Duration::ZERO);
		assert!(config.validate().is_err());
	}

	#[test]
	fn test_config_parser() {
		let args = vec![
			"program",
			"--workers",
			"2",
			"--heavy-slots",
			"1",
			"--dequeue-block-millis",
			"250",
			"--heartbeat-interval-secs",
			"45",
			"--status-ttl-secs",
			"600",
		];

		let config = WorkerConfig::try_parse_from(args).unwrap();
		assert_eq!(config.workers, Some(2));
		assert_eq!(config.heavy_slots, 1);
		assert_eq!(config.dequeue_block, Duration::from_millis(250));
		assert_eq!(config.heartbeat_interval, Duration::from_secs(45));
		assert_eq!(config.status_ttl, Duration::from_secs(600));
		assert_eq!(config.result_ttl, Duration::from_secs(604_800));
	}
}

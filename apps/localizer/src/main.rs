mod app;
mod config;
mod observability;

use anyhow::{Context, Result};
use clap::Parser;
use prometheus::{Encoder, Registry, TextEncoder};
use std::collections::BTreeMap;
use task_queue::{JobClient, JobPayload, JobStatus, JobType};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use config::{Command, Config, LocalizeArgs};

#[tokio::main]
async fn main() -> Result<()> {
	// Load environment variables
	dotenvy::dotenv().ok();

	// Parse CLI arguments
	let config = Config::parse();
	config.validate().map_err(anyhow::Error::msg)?;

	let provider = observability::init(&config.service_name, config.log_json, config.otlp);

	let result = match config.command.clone() {
		Command::Worker => run_worker(&config).await,
		Command::Submit {
			job_type,
			input,
			output_dir,
			priority,
			max_duration,
			params,
		} => submit(&config, job_type, JobPayload { input_path: input, output_dir, params: params.into_iter().collect::<BTreeMap<_, _>>() }, priority, max_duration).await,
		Command::Status { job_id } => status(&config, &job_id).await,
		Command::Wait { job_id, timeout, poll_interval } => wait(&config, &job_id, timeout, poll_interval).await,
		Command::Localize(args) => localize(&config, &args).await,
	};

	if let Err(e) = &result {
		error!(error = %format!("{e:#}"), "❌ Command failed");
	}

	observability::shutdown(provider);
	result
}

async fn run_worker(config: &Config) -> Result<()> {
	info!(
		service = %config.service_name,
		workers = config.queue.resolved_workers(),
		heavy_slots = config.queue.heavy_slots,
		"🎯 Starting localization worker"
	);

	let queue = app::connect_with_retry(config).await?;
	let registry = Registry::new();
	let pool = app::worker_pool(config, queue, &registry)?;

	let cancellation_token = CancellationToken::new();
	let shutdown = cancellation_token.clone();
	tokio::spawn(async move {
		wait_for_shutdown_signal().await;
		info!("🛑 Shutdown signal received (SIGTERM/SIGINT)");
		shutdown.cancel();
	});

	pool.start(cancellation_token).await?;
	log_metrics(&registry);
	info!("✅ Worker pool drained, exiting");
	Ok(())
}

async fn client(config: &Config) -> Result<JobClient> {
	let queue = app::connect_with_retry(config).await?;
	Ok(JobClient::new(queue, std::time::Duration::from_secs(1), config.queue.stale_grace))
}

async fn submit(config: &Config, job_type: JobType, payload: JobPayload, priority: u8, max_duration: std::time::Duration) -> Result<()> {
	let client = client(config).await?;
	let job_id = client.submit(job_type, priority, payload, max_duration).await?;
	info!(job_id = %job_id, job_type = %job_type, priority, "📥 Job submitted");
	println!("{job_id}");
	Ok(())
}

async fn status(config: &Config, job_id: &str) -> Result<()> {
	let client = client(config).await?;
	let status = client.status(job_id).await?;

	let mut report = serde_json::json!({ "job_id": job_id, "status": status.to_string() });
	match status {
		JobStatus::Completed => report["result"] = serde_json::json!(client.result(job_id).await?),
		JobStatus::Failed => report["error"] = serde_json::json!(client.failure_reason(job_id).await?),
		JobStatus::NotFound | JobStatus::Queued | JobStatus::Processing => {}
	}
	println!("{}", serde_json::to_string_pretty(&report)?);
	Ok(())
}

async fn wait(config: &Config, job_id: &str, timeout: std::time::Duration, poll_interval: std::time::Duration) -> Result<()> {
	let queue = app::connect_with_retry(config).await?;
	let client = JobClient::new(queue, poll_interval, config.queue.stale_grace);

	let result = client.wait(job_id, timeout).await.with_context(|| format!("job {job_id} did not complete"))?;
	info!(job_id, result = %result, "✅ Job completed");
	println!("{result}");
	Ok(())
}

async fn localize(config: &Config, args: &LocalizeArgs) -> Result<()> {
	let (orchestrator, sweeper) = app::orchestrator(&config.tools, args, app::heavy_slots(config))?;
	let request = app::request(args);
	info!(request_id = %request.request_id, video = %args.video.display(), target = %args.target_language, "🎬 Localizing video");

	let outcome = tokio::select! {
		outcome = orchestrator.run(request) => outcome,
		() = wait_for_shutdown_signal() => {
			sweeper.cancel();
			warn!("🛑 Interrupted, partial artifacts stay under the work directory");
			anyhow::bail!("localization interrupted");
		}
	};
	sweeper.cancel();

	let output = outcome?;
	orchestrator.forget(&output.request_id);
	for warning in &output.warnings {
		warn!(warning = %warning, "⚠️ Completed with warning");
	}
	info!(video = %output.video.display(), failed_segments = output.failed_segments, "✅ Localization finished");
	println!("{}", serde_json::to_string_pretty(&output)?);
	Ok(())
}

fn log_metrics(registry: &Registry) {
	let mut buffer = Vec::new();
	if let Err(e) = TextEncoder::new().encode(&registry.gather(), &mut buffer) {
		warn!(error = %e, "Failed to encode metrics");
		return;
	}
	info!(metrics = %String::from_utf8_lossy(&buffer), "📊 Final metrics snapshot");
}

async fn wait_for_shutdown_signal() {
	let ctrl_c = async {
		if let Err(e) = signal::ctrl_c().await {
			error!(error = %e, "Failed to install Ctrl+C handler");
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match signal::unix::signal(signal::unix::SignalKind::terminate()) {
			Ok(mut stream) => {
				stream.recv().await;
			}
			Err(e) => {
				error!(error = %e, "Failed to install SIGTERM handler");
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		() = ctrl_c => {},
		() = terminate => {},
	}
}

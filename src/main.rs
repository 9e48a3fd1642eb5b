mod bench;
mod cli;
mod config;
mod dns;
mod doh;
mod doq;
mod limiter;
mod metrics;
mod progress;
mod questions;
mod reqlog;
mod report;
mod stats;
mod transport;

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use crate::bench::Taps;
use crate::cli::Cli;
use crate::config::Config;
use crate::metrics::Metrics;
use crate::progress::Progress;
use crate::reqlog::RequestLog;
use crate::stats::Summary;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.with_writer(std::io::stderr)
		.init();

	let cli = Cli::parse();
	let config = Arc::new(Config::from_cli(&cli)?);

	// Resolve every question source before anything is sent
	let questions = Arc::new(questions::load(&cli.queries).await?);

	// The request log opens during startup so a bad path fails fast
	let request_log = match &config.request_log_path {
		Some(path) => Some(Arc::new(RequestLog::open(path)?)),
		None => None,
	};

	let metrics = match config.prometheus {
		Some(addr) => {
			let metrics = Arc::new(Metrics::new(config.request_timeout)?);
			metrics::spawn_endpoint(metrics.clone(), addr);
			Some(metrics)
		}
		None => None,
	};

	// One shared token: Ctrl-C and the duration timer both arm it
	let cancel = CancellationToken::new();
	{
		let cancel = cancel.clone();
		tokio::spawn(async move {
			if tokio::signal::ctrl_c().await.is_ok() {
				eprintln!("\nInterrupted, stopping...");
				cancel.cancel();
			}
		});
	}

	report::print_config_summary(&config, questions.len());
	println!("Running benchmark...");

	let taps = Arc::new(Taps {
		metrics,
		request_log,
		progress: Progress::start(&config, questions.len(), &cancel),
	});

	let started = Instant::now();
	let sinks = bench::run(config.clone(), questions, taps.clone(), cancel).await?;
	let wall = started.elapsed();
	taps.progress.finish();

	let summary = Summary::from_sinks(&sinks, wall);
	report::print_summary(&summary, wall);

	if let Some(path) = &config.csv {
		report::write_csv(path, &summary)?;
	}

	Ok(())
}

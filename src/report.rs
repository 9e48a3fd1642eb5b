use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};

use crate::config::{Config, DohMethod, HttpVersion, Protocol, RequestDelay};
use crate::stats::Summary;

/// Print a summary of the run configuration before starting.
pub fn print_config_summary(config: &Config, question_count: usize) {
	println!("DNS Load Generator Configuration");
	println!("================================");
	println!("Server:         {}", config.server);
	println!("Transport:      {}", transport_label(config));
	println!("Questions:      {}", question_count);
	println!("Types:          {}", config.qtypes.iter()
		.map(|t| t.to_string())
		.collect::<Vec<_>>()
		.join(", "));
	match config.duration {
		Some(duration) => println!("Duration:       {:?}", duration),
		None => println!("Count:          {}", config.count),
	}
	println!("Concurrency:    {}", config.concurrency);
	if config.rate_limit > 0 {
		println!("Rate limit:     {} qps", config.rate_limit);
	}
	if config.rate_limit_worker > 0 {
		println!("Worker limit:   {} qps", config.rate_limit_worker);
	}
	if config.probability < 1.0 {
		println!("Probability:    {}", config.probability);
	}
	match config.request_delay {
		RequestDelay::None => {}
		RequestDelay::Constant(d) => println!("Delay:          {:?}", d),
		RequestDelay::Uniform(lo, hi) => println!("Delay:          {:?}-{:?}", lo, hi),
	}
	if let Some(seed) = config.seed {
		println!("Seed:           {}", seed);
	}
	println!();
}

fn transport_label(config: &Config) -> String {
	match config.protocol {
		Protocol::Udp => "UDP".to_string(),
		Protocol::Tcp => "TCP".to_string(),
		Protocol::Tls => "DoT".to_string(),
		Protocol::Quic => "DoQ".to_string(),
		Protocol::Doh => {
			let method = match config.doh_method {
				DohMethod::Get => "GET",
				DohMethod::Post => "POST",
			};
			let version = match config.http_version {
				HttpVersion::Http1 => "HTTP/1.1",
				HttpVersion::Http2 => "HTTP/2",
				HttpVersion::Http3 => "HTTP/3",
			};
			format!("DoH ({}, {})", method, version)
		}
	}
}

/// Print the aggregated results.
pub fn print_summary(summary: &Summary, wall: Duration) {
	println!("\nBenchmark Results");
	println!("=================\n");
	println!("Elapsed:        {:.2} s", wall.as_secs_f64());
	println!("Total queries:  {}", summary.total);
	println!("Responses:      {}", summary.responses);
	println!("Errors:         {} ({} timeouts)", summary.errors, summary.timeouts);
	println!("Throughput:     {:.1} qps", summary.qps);

	if !summary.rcodes.is_empty() {
		let mut table = Table::new();
		table.load_preset(UTF8_FULL);
		table.set_content_arrangement(ContentArrangement::Dynamic);
		table.set_header(vec!["Rcode", "Count"]);
		for (rcode, count) in &summary.rcodes {
			table.add_row(vec![rcode.clone(), count.to_string()]);
		}
		println!("\n{table}");
	}

	let latency = &summary.latency;
	let mut table = Table::new();
	table.load_preset(UTF8_FULL);
	table.set_content_arrangement(ContentArrangement::Dynamic);
	table.set_header(vec!["Min", "Mean", "StdDev", "p50", "p95", "p99", "Max"]);
	table.add_row(vec![
		format!("{:.1} ms", latency.min_ms),
		format!("{:.1} ms", latency.mean_ms),
		format!("{:.1} ms", latency.stddev_ms),
		format!("{:.1} ms", latency.p50_ms),
		format!("{:.1} ms", latency.p95_ms),
		format!("{:.1} ms", latency.p99_ms),
		format!("{:.1} ms", latency.max_ms),
	]);
	println!("\n{table}");
}

/// Write the aggregate results to a CSV file, one column per metric plus
/// one per observed rcode.
pub fn write_csv(path: &Path, summary: &Summary) -> Result<()> {
	let mut writer = csv::Writer::from_path(path)?;

	let mut header: Vec<String> = [
		"total", "responses", "errors", "timeouts", "qps",
		"min_ms", "mean_ms", "stddev_ms", "p50_ms", "p95_ms", "p99_ms", "max_ms",
	].iter().map(|s| s.to_string()).collect();
	let mut row = vec![
		summary.total.to_string(),
		summary.responses.to_string(),
		summary.errors.to_string(),
		summary.timeouts.to_string(),
		format!("{:.2}", summary.qps),
		format!("{:.2}", summary.latency.min_ms),
		format!("{:.2}", summary.latency.mean_ms),
		format!("{:.2}", summary.latency.stddev_ms),
		format!("{:.2}", summary.latency.p50_ms),
		format!("{:.2}", summary.latency.p95_ms),
		format!("{:.2}", summary.latency.p99_ms),
		format!("{:.2}", summary.latency.max_ms),
	];
	for (rcode, count) in &summary.rcodes {
		header.push(format!("rcode_{}", rcode.replace(' ', "")));
		row.push(count.to_string());
	}

	writer.write_record(&header)?;
	writer.write_record(&row)?;
	writer.flush()?;
	println!("\nResults written to: {}", path.display());
	Ok(())
}

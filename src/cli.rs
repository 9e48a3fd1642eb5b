use std::path::PathBuf;

use clap::Parser;

use crate::config::{DohMethod, HttpVersion};

/// DNS load generator
#[derive(Parser, Debug)]
#[command(name = "dnsburst")]
#[command(about = "Issue DNS queries at controlled concurrency and rate against a single server")]
pub struct Cli {
	/// Questions to ask: a domain name, @file with one name per line,
	/// or an http(s):// URL returning one name per line (repeatable)
	#[arg(required = true)]
	pub queries: Vec<String>,

	/// Server to benchmark: host[:port], quic://host[:port], or a DoH URL
	#[arg(short = 's', long = "server")]
	pub server: String,

	/// Query type (repeatable, e.g. -t A -t AAAA)
	#[arg(short = 't', long = "type", default_value = "A")]
	pub qtypes: Vec<String>,

	/// Queries per worker per question per type (mutually exclusive with --duration)
	#[arg(short = 'n', long = "number")]
	pub number: Option<u64>,

	/// Run for a fixed wall-clock span instead of a fixed count (e.g. 30s)
	#[arg(short = 'd', long = "duration")]
	pub duration: Option<String>,

	/// Number of concurrent workers
	#[arg(short = 'c', long = "concurrency", default_value = "1")]
	pub concurrency: u32,

	/// Global queries per second across all workers (0 = unlimited)
	#[arg(short = 'l', long = "rate-limit", default_value = "0")]
	pub rate_limit: u32,

	/// Queries per second per worker (0 = unlimited)
	#[arg(long = "rate-limit-worker", default_value = "0")]
	pub rate_limit_worker: u32,

	/// Queries sent on a UDP/TCP/TLS connection before reconnecting (0 = reuse)
	#[arg(long = "query-per-conn", default_value = "0")]
	pub query_per_conn: u64,

	/// Use TCP instead of UDP
	#[arg(long = "tcp")]
	pub tcp: bool,

	/// Use DNS over TLS
	#[arg(long = "dot")]
	pub dot: bool,

	/// HTTP method for DoH requests
	#[arg(long = "doh-method", value_parser = parse_doh_method, default_value = "post")]
	pub doh_method: DohMethod,

	/// HTTP version for DoH requests (1.1, 2, or 3)
	#[arg(long = "doh-protocol", value_parser = parse_http_version, default_value = "2")]
	pub http_version: HttpVersion,

	/// Clear the Recursion Desired flag on queries
	#[arg(long = "norecurse")]
	pub no_recursion: bool,

	/// Probability of issuing each query (1.0 sends everything)
	#[arg(long = "probability", default_value = "1.0")]
	pub probability: f64,

	/// EDNS0 UDP payload size; 0 disables, otherwise 512-4096
	#[arg(long = "edns-size", default_value = "0")]
	pub edns_size: u16,

	/// EDNS0 local option as decimalCode:hexData (e.g. 65001:DEADBEEF)
	#[arg(long = "ednsopt")]
	pub ednsopt: Option<String>,

	/// Set the DNSSEC OK (DO) bit
	#[arg(long = "dnssec")]
	pub dnssec: bool,

	/// Socket write timeout
	#[arg(long = "write", default_value = "1s")]
	pub write_timeout: String,

	/// Socket read timeout
	#[arg(long = "read", default_value = "3s")]
	pub read_timeout: String,

	/// Connection dial timeout
	#[arg(long = "connect", default_value = "1s")]
	pub connect_timeout: String,

	/// Overall per-request deadline
	#[arg(long = "request", default_value = "5s")]
	pub request_timeout: String,

	/// Give every worker its own connection instead of sharing one
	#[arg(long = "separate-connections")]
	pub separate_connections: bool,

	/// Skip TLS certificate verification for DoT/DoQ/DoH
	#[arg(long = "insecure")]
	pub insecure: bool,

	/// Delay between requests: constant "500ms" or uniform "1s-2s"
	#[arg(long = "delay")]
	pub delay: Option<String>,

	/// Log every request to a file
	#[arg(long = "log-requests")]
	pub log_requests: bool,

	/// Request log path (implies --log-requests)
	#[arg(long = "log-requests-path")]
	pub log_requests_path: Option<PathBuf>,

	/// Serve Prometheus metrics on this address (e.g. 127.0.0.1:8080)
	#[arg(long = "prometheus")]
	pub prometheus: Option<String>,

	/// Write the aggregate results to a CSV file
	#[arg(short = 'o', long = "csv")]
	pub csv: Option<PathBuf>,

	/// Base random seed for reproducible per-worker PRNGs
	#[arg(long = "seed")]
	pub seed: Option<u64>,
}

fn parse_doh_method(s: &str) -> Result<DohMethod, String> {
	match s.to_ascii_lowercase().as_str() {
		"get" => Ok(DohMethod::Get),
		"post" => Ok(DohMethod::Post),
		other => Err(format!("expected 'get' or 'post', got '{}'", other)),
	}
}

fn parse_http_version(s: &str) -> Result<HttpVersion, String> {
	match s {
		"1.1" | "1" => Ok(HttpVersion::Http1),
		"2" => Ok(HttpVersion::Http2),
		"3" => Ok(HttpVersion::Http3),
		other => Err(format!("expected '1.1', '2', or '3', got '{}'", other)),
	}
}

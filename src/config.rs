use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use hickory_proto::rr::RecordType;

use crate::cli::Cli;

/// Wire protocol used to reach the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
	Udp,
	Tcp,
	Tls,
	Quic,
	Doh,
}

/// HTTP method for DNS-over-HTTPS requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DohMethod {
	Get,
	Post,
}

/// HTTP version for DNS-over-HTTPS requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
	Http1,
	Http2,
	Http3,
}

/// Inter-request delay shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestDelay {
	None,
	Constant(Duration),
	/// Uniform over [lo, hi).
	Uniform(Duration, Duration),
}

/// Validated, normalized run configuration. Immutable once built.
#[derive(Debug, Clone)]
pub struct Config {
	/// Normalized server endpoint: "host:port" for UDP/TCP/TLS/QUIC,
	/// a full URL for DoH.
	pub server: String,
	pub protocol: Protocol,
	pub doh_method: DohMethod,
	pub http_version: HttpVersion,
	pub qtypes: Vec<RecordType>,
	/// Iterations per worker per (question, type) pair. Zero when running
	/// in duration mode.
	pub count: u64,
	pub duration: Option<Duration>,
	pub concurrency: u32,
	/// Global queries per second across all workers. 0 = unlimited.
	pub rate_limit: u32,
	/// Per-worker queries per second. 0 = unlimited.
	pub rate_limit_worker: u32,
	/// Queries per connection before UDP/TCP/TLS reconnect. 0 = reuse.
	pub queries_per_conn: u64,
	pub recursion_desired: bool,
	pub probability: f64,
	/// EDNS0 UDP payload size. 0 disables the buffer-size option.
	pub edns_size: u16,
	pub edns_opt: Option<(u16, Vec<u8>)>,
	pub dnssec: bool,
	pub write_timeout: Duration,
	pub read_timeout: Duration,
	pub connect_timeout: Duration,
	pub request_timeout: Duration,
	pub separate_connections: bool,
	pub insecure: bool,
	pub request_delay: RequestDelay,
	pub request_log_path: Option<PathBuf>,
	pub prometheus: Option<SocketAddr>,
	pub csv: Option<PathBuf>,
	pub seed: Option<u64>,
}

impl Config {
	/// Validate CLI arguments and fill in defaults.
	///
	/// Errors name the offending flag so the user can correct it.
	pub fn from_cli(cli: &Cli) -> Result<Config> {
		if cli.server.trim().is_empty() {
			bail!("--server must not be empty");
		}
		if cli.concurrency == 0 {
			bail!("--concurrency must be at least 1");
		}
		if cli.probability > 1.0 {
			bail!("--probability must not exceed 1");
		}
		if cli.edns_size != 0 && !(512..=4096).contains(&cli.edns_size) {
			bail!("--edns-size must be 0 or between 512 and 4096");
		}
		if cli.number.is_some() && cli.duration.is_some() {
			bail!("--number and --duration are mutually exclusive");
		}

		let (protocol, server) = parse_server(&cli.server, cli.tcp, cli.dot)?;

		let duration = match &cli.duration {
			Some(spec) => Some(parse_duration(spec)
				.map_err(|e| anyhow!("--duration: {}", e))?),
			None => None,
		};
		// Counted mode is the default: one pass over the question matrix.
		let count = match (cli.number, &duration) {
			(Some(n), _) => n,
			(None, Some(_)) => 0,
			(None, None) => 1,
		};

		let request_delay = match &cli.delay {
			Some(spec) => parse_delay(spec)
				.map_err(|e| anyhow!("--delay: {}", e))?,
			None => RequestDelay::None,
		};

		let edns_opt = match &cli.ednsopt {
			Some(spec) => Some(parse_edns_opt(spec)
				.map_err(|e| anyhow!("--ednsopt: {}", e))?),
			None => None,
		};

		let mut qtypes = Vec::new();
		for t in &cli.qtypes {
			let rt = RecordType::from_str(&t.to_uppercase())
				.map_err(|_| anyhow!("--type: unknown record type '{}'", t))?;
			qtypes.push(rt);
		}

		let prometheus = match &cli.prometheus {
			Some(addr) => Some(addr.parse::<SocketAddr>()
				.map_err(|e| anyhow!("--prometheus: invalid bind address '{}': {}", addr, e))?),
			None => None,
		};

		let request_log_path = if cli.log_requests || cli.log_requests_path.is_some() {
			Some(cli.log_requests_path.clone()
				.unwrap_or_else(|| PathBuf::from("requests.log")))
		} else {
			None
		};

		Ok(Config {
			server,
			protocol,
			doh_method: cli.doh_method,
			http_version: cli.http_version,
			qtypes,
			count,
			duration,
			concurrency: cli.concurrency,
			rate_limit: cli.rate_limit,
			rate_limit_worker: cli.rate_limit_worker,
			queries_per_conn: cli.query_per_conn,
			recursion_desired: !cli.no_recursion,
			probability: cli.probability,
			edns_size: cli.edns_size,
			edns_opt,
			dnssec: cli.dnssec,
			write_timeout: parse_duration(&cli.write_timeout)
				.map_err(|e| anyhow!("--write: {}", e))?,
			read_timeout: parse_duration(&cli.read_timeout)
				.map_err(|e| anyhow!("--read: {}", e))?,
			connect_timeout: parse_duration(&cli.connect_timeout)
				.map_err(|e| anyhow!("--connect: {}", e))?,
			request_timeout: parse_duration(&cli.request_timeout)
				.map_err(|e| anyhow!("--request: {}", e))?,
			separate_connections: cli.separate_connections,
			insecure: cli.insecure,
			request_delay,
			request_log_path,
			prometheus,
			csv: cli.csv.clone(),
			seed: cli.seed,
		})
	}

	/// Total repetitions when every question is issued:
	/// count x workers x |types| x |questions|. None in duration mode.
	pub fn total_repetitions(&self, question_count: usize) -> Option<u64> {
		if self.count == 0 {
			return None;
		}
		Some(self.count
			* self.concurrency as u64
			* self.qtypes.len() as u64
			* question_count as u64)
	}
}

/// Classify and normalize the server endpoint.
///
/// Supported forms:
///   "8.8.8.8" / "dns.example:5353"     -- plain DNS, port 53 default
///   "--dot host[:port]"                -- DoT, port 853 default
///   "quic://host[:port]"               -- DoQ, port 853 default
///   "https://host[:port][/path]"       -- DoH, "/dns-query" default path
pub fn parse_server(server: &str, tcp: bool, dot: bool) -> Result<(Protocol, String)> {
	let trimmed = server.trim();
	if trimmed.is_empty() {
		return Err(anyhow!("empty server address"));
	}

	if let Some(rest) = trimmed.strip_prefix("quic://") {
		return Ok((Protocol::Quic, with_default_port(rest, 853)?));
	}

	if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
		let mut url = reqwest::Url::parse(trimmed)
			.map_err(|e| anyhow!("invalid DoH URL '{}': {}", trimmed, e))?;
		if url.host_str().is_none() {
			return Err(anyhow!("DoH URL '{}' has no host", trimmed));
		}
		if url.path() == "/" || url.path().is_empty() {
			url.set_path("/dns-query");
		}
		return Ok((Protocol::Doh, url.to_string()));
	}

	let protocol = if dot {
		Protocol::Tls
	} else if tcp {
		Protocol::Tcp
	} else {
		Protocol::Udp
	};
	let default_port = if dot { 853 } else { 53 };
	Ok((protocol, with_default_port(trimmed, default_port)?))
}

/// Append the default port unless the address already carries one.
/// Bare IPv6 addresses are bracketed.
fn with_default_port(host: &str, default_port: u16) -> Result<String> {
	if host.is_empty() {
		return Err(anyhow!("empty server address"));
	}
	if host.starts_with('[') {
		// Bracketed IPv6, with or without port
		match host.rfind("]:") {
			Some(_) => Ok(host.to_string()),
			None if host.ends_with(']') => Ok(format!("{}:{}", host, default_port)),
			None => Err(anyhow!("invalid bracketed IPv6 address '{}'", host)),
		}
	} else if host.matches(':').count() > 1 {
		// Bare IPv6 without port
		Ok(format!("[{}]:{}", host, default_port))
	} else if host.contains(':') {
		Ok(host.to_string())
	} else {
		Ok(format!("{}:{}", host, default_port))
	}
}

/// Parse a single duration token: a decimal count with one of the
/// suffixes ns, ms, s, m, h, d, w.
pub fn parse_duration(spec: &str) -> Result<Duration> {
	let spec = spec.trim();
	let (value, unit) = spec
		.find(|c: char| !c.is_ascii_digit())
		.map(|i| spec.split_at(i))
		.ok_or_else(|| anyhow!("missing time unit in '{}'", spec))?;
	if value.is_empty() {
		return Err(anyhow!("missing number in '{}'", spec));
	}
	let n: u64 = value.parse()
		.map_err(|e| anyhow!("invalid number in '{}': {}", spec, e))?;
	let duration = match unit {
		"ns" => Duration::from_nanos(n),
		"ms" => Duration::from_millis(n),
		"s" => Duration::from_secs(n),
		"m" => Duration::from_secs(n * 60),
		"h" => Duration::from_secs(n * 3600),
		"d" => Duration::from_secs(n * 86400),
		"w" => Duration::from_secs(n * 604800),
		other => return Err(anyhow!("unknown time unit '{}' in '{}'", other, spec)),
	};
	Ok(duration)
}

/// Parse the delay grammar "<duration>" or "<duration>-<duration>".
///
/// A single duration yields a constant delay; a pair yields a uniform
/// delay over [lo, hi), which requires hi > lo.
pub fn parse_delay(spec: &str) -> Result<RequestDelay> {
	let spec = spec.trim();
	if spec.is_empty() {
		return Err(anyhow!("empty delay"));
	}
	match spec.split_once('-') {
		None => {
			let d = parse_duration(spec)?;
			if d.is_zero() {
				Ok(RequestDelay::None)
			} else {
				Ok(RequestDelay::Constant(d))
			}
		}
		Some((lo, hi)) => {
			let lo = parse_duration(lo)?;
			let hi = parse_duration(hi)?;
			if hi <= lo {
				return Err(anyhow!(
					"delay interval upper bound {:?} must exceed lower bound {:?}",
					hi, lo,
				));
			}
			Ok(RequestDelay::Uniform(lo, hi))
		}
	}
}

/// Parse the EDNS option grammar "<decimalCode>:<hexData>".
///
/// The code must fit in 16 bits and the data must be an even-length hex
/// string. Both halves are required.
pub fn parse_edns_opt(spec: &str) -> Result<(u16, Vec<u8>)> {
	let (code, data) = spec.split_once(':')
		.ok_or_else(|| anyhow!("expected '<code>:<hexdata>', got '{}'", spec))?;
	if code.is_empty() || data.is_empty() {
		return Err(anyhow!("expected '<code>:<hexdata>', got '{}'", spec));
	}
	let code: u16 = code.parse()
		.map_err(|e| anyhow!("invalid option code '{}': {}", code, e))?;
	let data = hex::decode(data)
		.map_err(|e| anyhow!("invalid hex data '{}': {}", data, e))?;
	Ok((code, data))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_duration_units() {
		assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
		assert_eq!(parse_duration("10ns").unwrap(), Duration::from_nanos(10));
		assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
		assert_eq!(parse_duration("3m").unwrap(), Duration::from_secs(180));
		assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
		assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
		assert_eq!(parse_duration("1w").unwrap(), Duration::from_secs(604800));
	}

	#[test]
	fn test_parse_duration_rejects_garbage() {
		assert!(parse_duration("").is_err());
		assert!(parse_duration("5").is_err());
		assert!(parse_duration("ms").is_err());
		assert!(parse_duration("5x").is_err());
		assert!(parse_duration("-5s").is_err());
	}

	#[test]
	fn test_parse_delay_constant() {
		assert_eq!(
			parse_delay("500ms").unwrap(),
			RequestDelay::Constant(Duration::from_millis(500)),
		);
	}

	#[test]
	fn test_parse_delay_uniform() {
		assert_eq!(
			parse_delay("1s-2s").unwrap(),
			RequestDelay::Uniform(Duration::from_secs(1), Duration::from_secs(2)),
		);
	}

	#[test]
	fn test_parse_delay_inverted_interval() {
		assert!(parse_delay("2s-1s").is_err());
		assert!(parse_delay("1s-1s").is_err());
	}

	#[test]
	fn test_parse_edns_opt() {
		let (code, data) = parse_edns_opt("65001:DEADBEEF").unwrap();
		assert_eq!(code, 65001);
		assert_eq!(data, vec![0xde, 0xad, 0xbe, 0xef]);
	}

	#[test]
	fn test_parse_edns_opt_rejects_malformed() {
		assert!(parse_edns_opt("65001").is_err());
		assert!(parse_edns_opt(":DEADBEEF").is_err());
		assert!(parse_edns_opt("65001:").is_err());
		assert!(parse_edns_opt("70000:DEAD").is_err());
		assert!(parse_edns_opt("65001:DEADBEE").is_err());
		assert!(parse_edns_opt("65001:XYZ1").is_err());
	}

	#[test]
	fn test_parse_server_udp_default_port() {
		let (proto, addr) = parse_server("8.8.8.8", false, false).unwrap();
		assert_eq!(proto, Protocol::Udp);
		assert_eq!(addr, "8.8.8.8:53");
	}

	#[test]
	fn test_parse_server_explicit_port_unchanged() {
		let (proto, addr) = parse_server("8.8.8.8:1234", false, false).unwrap();
		assert_eq!(proto, Protocol::Udp);
		assert_eq!(addr, "8.8.8.8:1234");
	}

	#[test]
	fn test_parse_server_dot_default_port() {
		let (proto, addr) = parse_server("dns.google", false, true).unwrap();
		assert_eq!(proto, Protocol::Tls);
		assert_eq!(addr, "dns.google:853");
	}

	#[test]
	fn test_parse_server_tcp() {
		let (proto, addr) = parse_server("127.0.0.1", true, false).unwrap();
		assert_eq!(proto, Protocol::Tcp);
		assert_eq!(addr, "127.0.0.1:53");
	}

	#[test]
	fn test_parse_server_quic_prefix() {
		let (proto, addr) = parse_server("quic://dns.adguard.com", false, false).unwrap();
		assert_eq!(proto, Protocol::Quic);
		assert_eq!(addr, "dns.adguard.com:853");
	}

	#[test]
	fn test_parse_server_doh_default_path() {
		let (proto, url) = parse_server("https://dns.google", false, false).unwrap();
		assert_eq!(proto, Protocol::Doh);
		assert_eq!(url, "https://dns.google/dns-query");
	}

	#[test]
	fn test_parse_server_doh_explicit_path_kept() {
		let (proto, url) = parse_server("https://cloudflare-dns.com/dns-query", false, false).unwrap();
		assert_eq!(proto, Protocol::Doh);
		assert_eq!(url, "https://cloudflare-dns.com/dns-query");
	}

	#[test]
	fn test_parse_server_ipv6() {
		let (_, addr) = parse_server("2606:4700::1111", false, false).unwrap();
		assert_eq!(addr, "[2606:4700::1111]:53");
		let (_, addr) = parse_server("[2606:4700::1111]:5353", false, false).unwrap();
		assert_eq!(addr, "[2606:4700::1111]:5353");
	}

	#[test]
	fn test_parse_server_empty() {
		assert!(parse_server("", false, false).is_err());
		assert!(parse_server("   ", false, false).is_err());
	}

	#[test]
	fn test_normalize_is_idempotent() {
		// Feeding a normalized address back through yields the same address.
		for input in ["8.8.8.8", "8.8.8.8:53", "dns.example:5353"] {
			let (_, once) = parse_server(input, false, false).unwrap();
			let (_, twice) = parse_server(&once, false, false).unwrap();
			assert_eq!(once, twice);
		}
		let (_, once) = parse_server("https://dns.google", false, false).unwrap();
		let (_, twice) = parse_server(&once, false, false).unwrap();
		assert_eq!(once, twice);
	}
}

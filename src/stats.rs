use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use hickory_proto::op::Message;

use crate::dns::rcode_str;
use crate::transport::QueryError;

/// Per-worker accumulator of completed queries. Single writer: each
/// worker owns exactly one sink for the whole run.
#[derive(Debug)]
pub struct ResultSink {
	pub worker_id: u32,
	latencies_ms: Vec<f64>,
	total: u64,
	responses: u64,
	errors: u64,
	timeouts: u64,
	rcodes: BTreeMap<String, u64>,
}

impl ResultSink {
	pub fn new(worker_id: u32) -> Self {
		ResultSink {
			worker_id,
			latencies_ms: Vec::new(),
			total: 0,
			responses: 0,
			errors: 0,
			timeouts: 0,
			rcodes: BTreeMap::new(),
		}
	}

	/// Record one completed query. The start timestamp is accepted for
	/// symmetry with the engine's lifecycle but only the duration feeds
	/// the aggregates.
	pub fn record(
		&mut self,
		_request: &Message,
		response: Option<&Message>,
		error: Option<&QueryError>,
		_start: Instant,
		duration: Duration,
	) {
		self.total += 1;
		self.latencies_ms.push(duration.as_secs_f64() * 1000.0);
		match (response, error) {
			(Some(response), _) => {
				self.responses += 1;
				*self.rcodes.entry(rcode_str(response)).or_insert(0) += 1;
			}
			(None, Some(e)) => {
				self.errors += 1;
				if e.is_timeout() {
					self.timeouts += 1;
				}
			}
			(None, None) => {}
		}
	}

	pub fn total(&self) -> u64 {
		self.total
	}
}

/// Aggregate view over all worker sinks.
#[derive(Debug, Clone)]
pub struct Summary {
	pub total: u64,
	pub responses: u64,
	pub errors: u64,
	pub timeouts: u64,
	pub rcodes: BTreeMap<String, u64>,
	pub qps: f64,
	pub latency: LatencyStats,
}

#[derive(Debug, Clone, Default)]
pub struct LatencyStats {
	pub min_ms: f64,
	pub mean_ms: f64,
	pub stddev_ms: f64,
	pub p50_ms: f64,
	pub p95_ms: f64,
	pub p99_ms: f64,
	pub max_ms: f64,
}

impl Summary {
	pub fn from_sinks(sinks: &[ResultSink], wall: Duration) -> Summary {
		let mut total = 0;
		let mut responses = 0;
		let mut errors = 0;
		let mut timeouts = 0;
		let mut rcodes: BTreeMap<String, u64> = BTreeMap::new();
		let mut latencies: Vec<f64> = Vec::new();

		for sink in sinks {
			total += sink.total;
			responses += sink.responses;
			errors += sink.errors;
			timeouts += sink.timeouts;
			for (rcode, count) in &sink.rcodes {
				*rcodes.entry(rcode.clone()).or_insert(0) += count;
			}
			latencies.extend(&sink.latencies_ms);
		}

		latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
		let latency = LatencyStats {
			min_ms: latencies.first().copied().unwrap_or(0.0),
			mean_ms: mean(&latencies).unwrap_or(0.0),
			stddev_ms: stddev(&latencies).unwrap_or(0.0),
			p50_ms: percentile(&latencies, 50.0).unwrap_or(0.0),
			p95_ms: percentile(&latencies, 95.0).unwrap_or(0.0),
			p99_ms: percentile(&latencies, 99.0).unwrap_or(0.0),
			max_ms: latencies.last().copied().unwrap_or(0.0),
		};

		let secs = wall.as_secs_f64();
		let qps = if secs > 0.0 { total as f64 / secs } else { 0.0 };

		Summary { total, responses, errors, timeouts, rcodes, qps, latency }
	}
}

/// Calculate the p-th percentile from a sorted slice using nearest-rank.
///
/// Returns None if the slice is empty.
pub fn percentile(sorted_values: &[f64], p: f64) -> Option<f64> {
	if sorted_values.is_empty() {
		return None;
	}
	if sorted_values.len() == 1 {
		return Some(sorted_values[0]);
	}
	// Nearest-rank: rank = ceil(p/100 * N), clamped to [1, N]
	let n = sorted_values.len();
	let rank = ((p / 100.0) * n as f64).ceil() as usize;
	let rank = rank.clamp(1, n);
	Some(sorted_values[rank - 1])
}

/// Calculate the arithmetic mean of a slice of values.
pub fn mean(values: &[f64]) -> Option<f64> {
	if values.is_empty() {
		return None;
	}
	let sum: f64 = values.iter().sum();
	Some(sum / values.len() as f64)
}

/// Calculate the population standard deviation of a slice of values.
pub fn stddev(values: &[f64]) -> Option<f64> {
	let avg = mean(values)?;
	let variance = values.iter()
		.map(|v| (v - avg).powi(2))
		.sum::<f64>() / values.len() as f64;
	Some(variance.sqrt())
}

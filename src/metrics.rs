use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use hickory_proto::rr::RecordType;
use prometheus::{histogram_opts, opts, CounterVec, Encoder, HistogramVec, IntCounter, Registry, TextEncoder};

/// Prometheus collectors updated once per completed query.
pub struct Metrics {
	registry: Registry,
	responses: CounterVec,
	errors: IntCounter,
	duration: HistogramVec,
}

impl Metrics {
	/// Build the registry. Histogram buckets grow exponentially from 1 ms
	/// and are clipped to the per-request deadline, the largest duration
	/// a recorded query can reach.
	pub fn new(hist_max: Duration) -> Result<Self, prometheus::Error> {
		let registry = Registry::new();

		let responses = CounterVec::new(
			opts!(
				"dnsburst_responses_total",
				"DNS responses received, by query type and response code"
			),
			&["qtype", "rcode"],
		)?;

		let errors = IntCounter::with_opts(opts!(
			"dnsburst_errors_total",
			"Queries that failed without a DNS response"
		))?;

		let duration = HistogramVec::new(
			histogram_opts!(
				"dnsburst_request_duration_seconds",
				"Per-query round-trip time, by query type",
				duration_buckets(hist_max)
			),
			&["qtype"],
		)?;

		registry.register(Box::new(responses.clone()))?;
		registry.register(Box::new(errors.clone()))?;
		registry.register(Box::new(duration.clone()))?;

		Ok(Metrics { registry, responses, errors, duration })
	}

	pub fn observe_response(&self, qtype: RecordType, rcode: &str, elapsed: Duration) {
		self.responses
			.with_label_values(&[&qtype.to_string(), rcode])
			.inc();
		self.duration
			.with_label_values(&[&qtype.to_string()])
			.observe(elapsed.as_secs_f64());
	}

	pub fn observe_error(&self, qtype: RecordType, elapsed: Duration) {
		self.errors.inc();
		self.duration
			.with_label_values(&[&qtype.to_string()])
			.observe(elapsed.as_secs_f64());
	}

	pub fn export(&self) -> Result<String, prometheus::Error> {
		let encoder = TextEncoder::new();
		let mut buffer = Vec::new();
		encoder.encode(&self.registry.gather(), &mut buffer)?;
		Ok(String::from_utf8(buffer).unwrap_or_default())
	}
}

fn duration_buckets(hist_max: Duration) -> Vec<f64> {
	let max_secs = hist_max.as_secs_f64().max(0.001);
	let mut buckets = Vec::new();
	let mut bucket = 0.001;
	while bucket < max_secs {
		buckets.push(bucket);
		bucket *= 2.0;
	}
	buckets.push(max_secs);
	buckets
}

/// Serve the registry on the standard scrape path. A bind failure is
/// reported but never stops the benchmark.
pub fn spawn_endpoint(metrics: Arc<Metrics>, addr: SocketAddr) {
	tokio::spawn(async move {
		let listener = match tokio::net::TcpListener::bind(addr).await {
			Ok(listener) => listener,
			Err(e) => {
				eprintln!("Warning: failed to bind Prometheus endpoint {}: {}", addr, e);
				return;
			}
		};
		let app = Router::new()
			.route("/metrics", get(scrape))
			.with_state(metrics);
		if let Err(e) = axum::serve(listener, app).await {
			eprintln!("Warning: Prometheus endpoint failed: {}", e);
		}
	});
}

async fn scrape(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
	match metrics.export() {
		Ok(body) => (
			axum::http::StatusCode::OK,
			[(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
			body,
		),
		Err(e) => (
			axum::http::StatusCode::INTERNAL_SERVER_ERROR,
			[(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
			format!("failed to export metrics: {}", e),
		),
	}
}

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{Config, Protocol, RequestDelay};
use crate::dns::{build_request, rcode_str};
use crate::limiter::{global_limiter, RateGate};
use crate::metrics::Metrics;
use crate::progress::Progress;
use crate::reqlog::RequestLog;
use crate::stats::ResultSink;
use crate::transport::{QueryError, Transport, TransportFactory};

/// Side-effect observers notified once per completed query.
pub struct Taps {
	pub metrics: Option<Arc<Metrics>>,
	pub request_log: Option<Arc<RequestLog>>,
	pub progress: Progress,
}

impl Taps {
	pub fn none() -> Taps {
		Taps { metrics: None, request_log: None, progress: Progress::disabled() }
	}
}

/// Spawn the worker pool, await every worker, and return the per-worker
/// sinks. The shared token cancels the run early; in duration mode a
/// timer arms it when the wall-clock cap elapses.
pub async fn run(
	config: Arc<Config>,
	questions: Arc<Vec<String>>,
	taps: Arc<Taps>,
	cancel: CancellationToken,
) -> anyhow::Result<Vec<ResultSink>> {
	let factory = TransportFactory::new(config.clone())?;
	let global = global_limiter(config.rate_limit);

	let shared_deadline = config.duration.map(|d| Instant::now() + d);
	if let Some(duration) = config.duration {
		let timer_cancel = cancel.clone();
		tokio::spawn(async move {
			tokio::select! {
				_ = timer_cancel.cancelled() => {}
				_ = tokio::time::sleep(duration) => timer_cancel.cancel(),
			}
		});
	}

	let base_seed = config.seed.unwrap_or_else(|| {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map(|d| d.as_nanos() as u64)
			.unwrap_or(0)
	});

	let mut handles = Vec::new();
	for worker_id in 0..config.concurrency {
		let worker = Worker {
			id: worker_id,
			config: config.clone(),
			questions: questions.clone(),
			gate: RateGate::new(global.clone(), config.rate_limit_worker),
			rng: StdRng::seed_from_u64(base_seed.wrapping_add(worker_id as u64)),
			transport: factory.create()?,
			taps: taps.clone(),
			cancel: cancel.clone(),
			shared_deadline,
			sink: ResultSink::new(worker_id),
		};
		handles.push(tokio::spawn(worker.run()));
	}

	let mut sinks = Vec::new();
	for handle in handles {
		match handle.await {
			Ok(sink) => sinks.push(sink),
			Err(e) => eprintln!("Warning: worker task failed: {}", e),
		}
	}
	sinks.sort_by_key(|s| s.worker_id);
	Ok(sinks)
}

struct Worker {
	id: u32,
	config: Arc<Config>,
	questions: Arc<Vec<String>>,
	gate: RateGate,
	rng: StdRng,
	transport: Box<dyn Transport>,
	taps: Arc<Taps>,
	cancel: CancellationToken,
	/// End of the wall-clock cap in duration mode; feeds the
	/// late-cancellation guard.
	shared_deadline: Option<Instant>,
	sink: ResultSink,
}

impl Worker {
	async fn run(mut self) -> ResultSink {
		debug!(worker = self.id, "worker started");
		if self.config.count > 0 {
			for _ in 0..self.config.count {
				if self.iteration().await.is_break() {
					break;
				}
			}
		} else {
			while !self.cancel.is_cancelled() {
				if self.iteration().await.is_break() {
					break;
				}
			}
		}
		debug!(worker = self.id, recorded = self.sink.total(), "worker done");
		self.sink
	}

	/// One pass over the question x type matrix, in stable order.
	async fn iteration(&mut self) -> ControlFlow<()> {
		let questions = self.questions.clone();
		let qtypes = self.config.qtypes.clone();
		for question in questions.iter() {
			for &qtype in &qtypes {
				self.step(question, qtype).await?;
			}
		}
		ControlFlow::Continue(())
	}

	async fn step(&mut self, question: &str, qtype: RecordType) -> ControlFlow<()> {
		if self.cancel.is_cancelled() {
			return ControlFlow::Break(());
		}

		// The draw is over [0,1), so probability 1 issues everything and
		// any probability <= 0 issues nothing.
		if self.rng.gen::<f64>() > self.config.probability {
			return ControlFlow::Continue(());
		}

		if !self.gate.acquire(&self.cancel).await {
			return ControlFlow::Break(());
		}

		// RFC 9250 pins the message ID to zero on QUIC
		let id = match self.config.protocol {
			Protocol::Quic => 0,
			_ => self.rng.gen::<u16>(),
		};
		let request = match build_request(question, qtype, id, &self.config) {
			Ok(request) => request,
			Err(e) => {
				eprintln!("Warning: failed to build query for {}: {}", question, e);
				return ControlFlow::Continue(());
			}
		};

		let cancel = self.cancel.clone();
		let request_timeout = self.config.request_timeout;
		let start = Instant::now();
		let outcome: Result<Message, QueryError> = tokio::select! {
			biased;
			// Abandon the in-flight request on cancellation, unrecorded
			_ = cancel.cancelled() => return ControlFlow::Break(()),
			result = tokio::time::timeout(request_timeout, self.transport.exchange(&request)) => {
				match result {
					Ok(outcome) => outcome,
					Err(_) => Err(QueryError::Timeout),
				}
			}
		};

		// A failing request that only started after the run's deadline
		// would report a spurious timeout; drop it instead.
		if outcome.is_err() {
			if let Some(deadline) = self.shared_deadline {
				if start > deadline {
					return ControlFlow::Break(());
				}
			}
		}

		let duration = start.elapsed();
		match &outcome {
			Ok(response) => {
				let rcode = rcode_str(response);
				if let Some(metrics) = &self.taps.metrics {
					metrics.observe_response(qtype, &rcode, duration);
				}
				if let Some(log) = &self.taps.request_log {
					log.log(self.id, question, qtype, &rcode, duration);
				}
			}
			Err(e) => {
				if let Some(metrics) = &self.taps.metrics {
					metrics.observe_error(qtype, duration);
				}
				if let Some(log) = &self.taps.request_log {
					log.log(self.id, question, qtype, &e.to_string(), duration);
				}
			}
		}
		self.taps.progress.query_issued();

		let (response, error) = match &outcome {
			Ok(response) => (Some(response), None),
			Err(e) => (None, Some(e)),
		};
		self.sink.record(&request, response, error, start, duration);

		self.delay().await;
		ControlFlow::Continue(())
	}

	/// Cancellable inter-request sleep; cancellation is not an error and
	/// the next step's cancellation check terminates the worker.
	async fn delay(&mut self) {
		let span = match self.config.request_delay {
			RequestDelay::None => return,
			RequestDelay::Constant(d) => d,
			RequestDelay::Uniform(lo, hi) => {
				let jitter = self.rng.gen_range(0..(hi - lo).as_nanos() as u64);
				lo + Duration::from_nanos(jitter)
			}
		};
		tokio::select! {
			_ = self.cancel.cancelled() => {}
			_ = tokio::time::sleep(span) => {}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use hickory_proto::op::MessageType;
	use tokio::net::UdpSocket;

	use crate::config::{DohMethod, HttpVersion};

	fn test_config(server: String) -> Config {
		Config {
			server,
			protocol: Protocol::Udp,
			doh_method: DohMethod::Post,
			http_version: HttpVersion::Http2,
			qtypes: vec![RecordType::A],
			count: 1,
			duration: None,
			concurrency: 1,
			rate_limit: 0,
			rate_limit_worker: 0,
			queries_per_conn: 0,
			recursion_desired: true,
			probability: 1.0,
			edns_size: 0,
			edns_opt: None,
			dnssec: false,
			write_timeout: Duration::from_secs(1),
			read_timeout: Duration::from_secs(1),
			connect_timeout: Duration::from_secs(1),
			request_timeout: Duration::from_secs(2),
			separate_connections: true,
			insecure: false,
			request_delay: RequestDelay::None,
			request_log_path: None,
			prometheus: None,
			csv: None,
			seed: Some(42),
		}
	}

	/// Echo every query back as a NOERROR response.
	async fn spawn_udp_responder() -> std::net::SocketAddr {
		let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let addr = socket.local_addr().unwrap();
		tokio::spawn(async move {
			let mut buf = vec![0u8; 4096];
			while let Ok((len, from)) = socket.recv_from(&mut buf).await {
				if let Ok(mut m) = Message::from_vec(&buf[..len]) {
					m.set_message_type(MessageType::Response);
					let _ = socket.send_to(&m.to_vec().unwrap(), from).await;
				}
			}
		});
		addr
	}

	async fn run_with(config: Config, questions: Vec<&str>) -> Vec<ResultSink> {
		let questions: Vec<String> = questions.into_iter().map(String::from).collect();
		run(
			Arc::new(config),
			Arc::new(questions),
			Arc::new(Taps::none()),
			CancellationToken::new(),
		)
		.await
		.unwrap()
	}

	#[tokio::test]
	async fn test_counted_run_records_count_times_workers() {
		let addr = spawn_udp_responder().await;
		let mut config = test_config(addr.to_string());
		config.count = 3;
		config.concurrency = 2;

		let sinks = run_with(config, vec!["example.com."]).await;
		assert_eq!(sinks.len(), 2);
		for sink in &sinks {
			assert_eq!(sink.total(), 3);
		}
	}

	#[tokio::test]
	async fn test_question_type_matrix_multiplies() {
		let addr = spawn_udp_responder().await;
		let mut config = test_config(addr.to_string());
		config.count = 2;
		config.qtypes = vec![RecordType::A, RecordType::AAAA];

		let sinks = run_with(config, vec!["a.example.", "b.example."]).await;
		// 2 iterations x 2 questions x 2 types
		assert_eq!(sinks[0].total(), 8);
	}

	#[tokio::test]
	async fn test_probability_zero_records_nothing() {
		let addr = spawn_udp_responder().await;
		let mut config = test_config(addr.to_string());
		config.count = 10;
		config.probability = 0.0;

		let sinks = run_with(config, vec!["example.com."]).await;
		assert_eq!(sinks[0].total(), 0);
	}

	#[tokio::test]
	async fn test_iteration_order_is_stable() {
		let addr = spawn_udp_responder().await;
		let dir = tempfile::tempdir().unwrap();
		let log_path = dir.path().join("requests.log");

		let mut config = test_config(addr.to_string());
		config.qtypes = vec![RecordType::A, RecordType::AAAA];
		let taps = Taps {
			metrics: None,
			request_log: Some(Arc::new(RequestLog::open(&log_path).unwrap())),
			progress: Progress::disabled(),
		};
		run(
			Arc::new(config),
			Arc::new(vec!["a.example.".to_string(), "b.example.".to_string()]),
			Arc::new(taps),
			CancellationToken::new(),
		)
		.await
		.unwrap();

		let content = std::fs::read_to_string(&log_path).unwrap();
		let order: Vec<(String, String)> = content.lines()
			.map(|line| {
				let question = line.split("question=").nth(1).unwrap()
					.split_whitespace().next().unwrap().to_string();
				let qtype = line.split("type=").nth(1).unwrap()
					.split_whitespace().next().unwrap().to_string();
				(question, qtype)
			})
			.collect();
		assert_eq!(order, vec![
			("a.example.".to_string(), "A".to_string()),
			("a.example.".to_string(), "AAAA".to_string()),
			("b.example.".to_string(), "A".to_string()),
			("b.example.".to_string(), "AAAA".to_string()),
		]);
	}

	#[tokio::test]
	async fn test_external_cancellation_stops_workers() {
		let addr = spawn_udp_responder().await;
		let mut config = test_config(addr.to_string());
		config.count = 1_000_000;
		config.rate_limit_worker = 20;

		let cancel = CancellationToken::new();
		let handle = tokio::spawn(run(
			Arc::new(config),
			Arc::new(vec!["example.com.".to_string()]),
			Arc::new(Taps::none()),
			cancel.clone(),
		));

		tokio::time::sleep(Duration::from_millis(300)).await;
		cancel.cancel();
		let cancelled_at = Instant::now();
		let sinks = tokio::time::timeout(Duration::from_secs(2), handle)
			.await
			.expect("workers must exit promptly after cancellation")
			.unwrap()
			.unwrap();
		assert!(cancelled_at.elapsed() < Duration::from_secs(2));

		// ~20 QPS for ~0.3s, so well under a hundred records
		let total: u64 = sinks.iter().map(|s| s.total()).sum();
		assert!(total >= 1);
		assert!(total < 100, "recorded {} queries", total);
	}

	#[tokio::test]
	async fn test_duration_mode_terminates_on_its_own() {
		let addr = spawn_udp_responder().await;
		let mut config = test_config(addr.to_string());
		config.count = 0;
		config.duration = Some(Duration::from_millis(300));
		config.rate_limit_worker = 50;

		let started = Instant::now();
		let sinks = run_with(config, vec!["example.com."]).await;
		let elapsed = started.elapsed();
		assert!(elapsed >= Duration::from_millis(250));
		assert!(elapsed < Duration::from_secs(3));
		assert!(sinks[0].total() >= 1);
	}

	#[tokio::test]
	async fn test_constant_delay_paces_requests() {
		let addr = spawn_udp_responder().await;
		let mut config = test_config(addr.to_string());
		config.count = 4;
		config.request_delay = RequestDelay::Constant(Duration::from_millis(50));

		let started = Instant::now();
		let sinks = run_with(config, vec!["example.com."]).await;
		let elapsed = started.elapsed();
		assert_eq!(sinks[0].total(), 4);
		// Four delays of 50ms each follow the four records
		assert!(elapsed >= Duration::from_millis(150));
		assert!(elapsed < Duration::from_secs(3));
	}

	#[tokio::test]
	async fn test_global_rate_limit_bounds_throughput() {
		let addr = spawn_udp_responder().await;
		let mut config = test_config(addr.to_string());
		config.concurrency = 4;
		config.rate_limit = 20;
		config.count = 0;
		config.duration = Some(Duration::from_millis(600));

		let sinks = run_with(config, vec!["example.com."]).await;
		let total: u64 = sinks.iter().map(|s| s.total()).sum();
		// 20 QPS over 0.6s, plus the initial burst token
		assert!(total <= 20, "recorded {} queries", total);
		assert!(total >= 2);
	}
}

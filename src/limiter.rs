use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio_util::sync::CancellationToken;

/// Build the shared global token bucket, r tokens per second with a
/// steady-state capacity of one. Returns None when unlimited.
pub fn global_limiter(qps: u32) -> Option<Arc<DefaultDirectRateLimiter>> {
	let qps = NonZeroU32::new(qps)?;
	let quota = Quota::per_second(qps).allow_burst(NonZeroU32::new(1).unwrap());
	Some(Arc::new(RateLimiter::direct(quota)))
}

/// Per-worker view of the rate gate: an optional shared global bucket
/// plus an optional private bucket. Acquire order is global first.
pub struct RateGate {
	global: Option<Arc<DefaultDirectRateLimiter>>,
	worker: Option<DefaultDirectRateLimiter>,
}

impl RateGate {
	pub fn new(global: Option<Arc<DefaultDirectRateLimiter>>, worker_qps: u32) -> Self {
		let worker = NonZeroU32::new(worker_qps).map(|qps| {
			let quota = Quota::per_second(qps).allow_burst(NonZeroU32::new(1).unwrap());
			RateLimiter::direct(quota)
		});
		RateGate { global, worker }
	}

	/// Block until both buckets yield a token, or the shared token is
	/// cancelled. Returns false on cancellation: the caller must then
	/// terminate without issuing a query or recording a result.
	pub async fn acquire(&self, cancel: &CancellationToken) -> bool {
		if let Some(global) = &self.global {
			tokio::select! {
				biased;
				_ = cancel.cancelled() => return false,
				_ = global.until_ready() => {}
			}
		}
		if let Some(worker) = &self.worker {
			tokio::select! {
				biased;
				_ = cancel.cancelled() => return false,
				_ = worker.until_ready() => {}
			}
		}
		true
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::{Duration, Instant};

	#[test]
	fn test_unlimited_gate_has_no_buckets() {
		let gate = RateGate::new(global_limiter(0), 0);
		assert!(gate.global.is_none());
		assert!(gate.worker.is_none());
	}

	#[tokio::test]
	async fn test_acquire_without_limits_is_immediate() {
		let gate = RateGate::new(None, 0);
		let cancel = CancellationToken::new();
		let start = Instant::now();
		for _ in 0..1000 {
			assert!(gate.acquire(&cancel).await);
		}
		assert!(start.elapsed() < Duration::from_millis(100));
	}

	#[tokio::test]
	async fn test_worker_bucket_paces_acquires() {
		// 10 QPS with burst 1: three acquires need roughly 200ms
		let gate = RateGate::new(None, 10);
		let cancel = CancellationToken::new();
		let start = Instant::now();
		for _ in 0..3 {
			assert!(gate.acquire(&cancel).await);
		}
		assert!(start.elapsed() >= Duration::from_millis(150));
	}

	#[tokio::test]
	async fn test_global_bucket_shared_across_gates() {
		let global = global_limiter(10);
		let a = RateGate::new(global.clone(), 0);
		let b = RateGate::new(global, 0);
		let cancel = CancellationToken::new();
		let start = Instant::now();
		assert!(a.acquire(&cancel).await);
		assert!(b.acquire(&cancel).await);
		// Second acquire drains the same bucket, so it has to wait
		assert!(start.elapsed() >= Duration::from_millis(50));
	}

	#[tokio::test]
	async fn test_cancelled_acquire_returns_false() {
		// 1 QPS: the second acquire would block for about a second
		let gate = RateGate::new(None, 1);
		let cancel = CancellationToken::new();
		assert!(gate.acquire(&cancel).await);

		let blocked = tokio::spawn({
			let cancel = cancel.clone();
			async move { gate.acquire(&cancel).await }
		});
		tokio::time::sleep(Duration::from_millis(50)).await;
		cancel.cancel();
		let acquired = blocked.await.unwrap();
		assert!(!acquired);
	}

	#[tokio::test]
	async fn test_acquire_after_cancel_returns_false() {
		let gate = RateGate::new(None, 1);
		let cancel = CancellationToken::new();
		assert!(gate.acquire(&cancel).await);
		cancel.cancel();
		assert!(!gate.acquire(&cancel).await);
	}
}

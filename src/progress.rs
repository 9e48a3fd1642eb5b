use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// Progress indication for the run.
///
/// Counted runs with every query issued get a determinate bar, one tick
/// per query. A probability below one makes the total unknowable, so a
/// spinner stands in. Duration-mode runs of ten seconds or more get a
/// wall-clock bar advanced once per second; it stops advancing when the
/// shared token is cancelled.
pub struct Progress {
	bar: Option<ProgressBar>,
	per_query: bool,
}

impl Progress {
	/// No progress output at all; used for short counted runs and tests.
	pub fn disabled() -> Progress {
		Progress { bar: None, per_query: false }
	}

	pub fn start(config: &Config, question_count: usize, cancel: &CancellationToken) -> Progress {
		if let Some(total) = config.total_repetitions(question_count) {
			if config.probability < 1.0 {
				let bar = ProgressBar::new_spinner();
				bar.enable_steady_tick(Duration::from_millis(120));
				return Progress { bar: Some(bar), per_query: true };
			}
			if total >= 100 {
				let bar = ProgressBar::new(total);
				return Progress { bar: Some(bar), per_query: true };
			}
			return Progress { bar: None, per_query: false };
		}

		let duration = config.duration.expect("duration set when count is zero");
		if duration < Duration::from_secs(10) {
			return Progress { bar: None, per_query: false };
		}
		let secs = duration.as_secs();
		let bar = ProgressBar::new(secs);
		if let Ok(style) = ProgressStyle::with_template("{bar:40} {pos}/{len}s") {
			bar.set_style(style);
		}
		let ticker = bar.clone();
		let cancel = cancel.clone();
		tokio::spawn(async move {
			for _ in 0..secs {
				tokio::select! {
					_ = cancel.cancelled() => break,
					_ = tokio::time::sleep(Duration::from_secs(1)) => ticker.inc(1),
				}
			}
			ticker.finish();
		});
		Progress { bar: Some(bar), per_query: false }
	}

	/// Tick once per issued query. No-op for time-based bars.
	pub fn query_issued(&self) {
		if self.per_query {
			if let Some(bar) = &self.bar {
				bar.inc(1);
			}
		}
	}

	pub fn finish(&self) {
		if let Some(bar) = &self.bar {
			bar.finish_and_clear();
		}
	}
}

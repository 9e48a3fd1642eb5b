use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use hickory_proto::rr::RecordType;

/// Append-only request log, one line per issued query.
///
/// Opened during startup so that an unwritable path fails the run before
/// any query is sent.
pub struct RequestLog {
	writer: Mutex<BufWriter<File>>,
}

impl RequestLog {
	pub fn open(path: &Path) -> Result<RequestLog> {
		let file = OpenOptions::new()
			.create(true)
			.append(true)
			.open(path)
			.map_err(|e| anyhow!("failed to open request log '{}': {}", path.display(), e))?;
		Ok(RequestLog { writer: Mutex::new(BufWriter::new(file)) })
	}

	/// `outcome` is the response code of a received answer or the error text.
	pub fn log(&self, worker_id: u32, question: &str, qtype: RecordType, outcome: &str, duration: Duration) {
		let mut writer = self.writer.lock().unwrap();
		let line = format!(
			"worker={} question={} type={} rcode={} duration={:.3}ms\n",
			worker_id, question, qtype, outcome,
			duration.as_secs_f64() * 1000.0,
		);
		// A failed tap must never abort the benchmark
		let _ = writer.write_all(line.as_bytes());
		let _ = writer.flush();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_log_lines_appended() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("requests.log");

		let log = RequestLog::open(&path).unwrap();
		log.log(0, "example.com.", RecordType::A, "NoError", Duration::from_millis(12));
		log.log(1, "example.org.", RecordType::AAAA, "read: timed out", Duration::from_secs(3));
		drop(log);

		let content = std::fs::read_to_string(&path).unwrap();
		let lines: Vec<&str> = content.lines().collect();
		assert_eq!(lines.len(), 2);
		assert!(lines[0].contains("worker=0"));
		assert!(lines[0].contains("question=example.com."));
		assert!(lines[0].contains("type=A"));
		assert!(lines[1].contains("worker=1"));
		assert!(lines[1].contains("duration=3000.000ms"));
	}

	#[test]
	fn test_open_failure_is_fatal() {
		assert!(RequestLog::open(Path::new("/no/such/dir/requests.log")).is_err());
	}

	#[test]
	fn test_reopen_appends() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("requests.log");

		let log = RequestLog::open(&path).unwrap();
		log.log(0, "a.example.", RecordType::A, "NoError", Duration::from_millis(1));
		drop(log);
		let log = RequestLog::open(&path).unwrap();
		log.log(0, "b.example.", RecordType::A, "NoError", Duration::from_millis(1));
		drop(log);

		let content = std::fs::read_to_string(&path).unwrap();
		assert_eq!(content.lines().count(), 2);
	}
}

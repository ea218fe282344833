use chrono::{Local, NaiveDate};
use regex::{Regex, RegexBuilder};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::logs;
use crate::types::LogRecord;

pub const DEFAULT_CAPACITY: usize = 10_000;
pub const DEFAULT_QUERY_LINES: usize = 200;

/// Bounded record buffer; the oldest record is evicted first.
#[derive(Debug)]
pub struct LogBuffer {
	records: VecDeque<LogRecord>,
	capacity: usize,
}

impl LogBuffer {
	pub fn new(capacity: usize) -> Self {
		let capacity = capacity.max(1);
		Self {
			records: VecDeque::with_capacity(capacity.min(1024)),
			capacity,
		}
	}

	pub fn push(&mut self, record: LogRecord) {
		while self.records.len() >= self.capacity {
			self.records.pop_front();
		}
		self.records.push_back(record);
	}

	pub fn len(&self) -> usize {
		self.records.len()
	}

	pub fn is_empty(&self) -> bool {
		self.records.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = &LogRecord> {
		self.records.iter()
	}

	/// The most recent `n` records, oldest first.
	pub fn tail(&self, n: usize) -> Vec<LogRecord> {
		let skip = self.records.len().saturating_sub(n);
		self.records.iter().skip(skip).cloned().collect()
	}
}

#[derive(Debug, Clone)]
pub struct LogQuery {
	pub lines: usize,
	/// Case-insensitive regular expression over the raw line.
	pub pattern: Option<String>,
	/// Keep terminal color escapes when formatting.
	pub color: bool,
}

impl Default for LogQuery {
	fn default() -> Self {
		Self {
			lines: DEFAULT_QUERY_LINES,
			pattern: None,
			color: false,
		}
	}
}

impl LogQuery {
	fn compile(&self) -> Result<Option<Regex>> {
		self.pattern
			.as_deref()
			.map(|p| {
				RegexBuilder::new(p)
					.case_insensitive(true)
					.build()
					.map_err(|source| Error::InvalidPattern {
						pattern: p.to_string(),
						source,
					})
			})
			.transpose()
	}
}

/// Shared handle to one label's in-memory buffer and its durable log.
#[derive(Clone)]
pub struct LogCapture {
	ring: Arc<Mutex<LogBuffer>>,
	sink: Arc<Mutex<LogSink>>,
}

struct LogSink {
	log_dir: Option<PathBuf>,
	label: String,
	file: Option<File>,
	date: Option<NaiveDate>,
	warned: bool,
}

impl LogCapture {
	/// `log_dir: None` keeps records in memory only.
	pub fn new(label: &str, log_dir: Option<&Path>, capacity: usize) -> Self {
		Self {
			ring: Arc::new(Mutex::new(LogBuffer::new(capacity))),
			sink: Arc::new(Mutex::new(LogSink {
				log_dir: log_dir.map(Path::to_path_buf),
				label: label.to_string(),
				file: None,
				date: None,
				warned: false,
			})),
		}
	}

	pub async fn append(&self, record: LogRecord) {
		self.ring.lock().await.push(record.clone());
		self.sink.lock().await.write(&record);
	}

	pub async fn len(&self) -> usize {
		self.ring.lock().await.len()
	}

	pub async fn snapshot(&self) -> Vec<LogRecord> {
		self.ring.lock().await.iter().cloned().collect()
	}

	/// The last `lines` records, then filtered by `pattern` if present.
	pub async fn query(&self, query: &LogQuery) -> Result<Vec<LogRecord>> {
		let pattern = query.compile()?;
		let recent = self.ring.lock().await.tail(query.lines);
		Ok(match pattern {
			Some(re) => recent.into_iter().filter(|r| re.is_match(&r.line)).collect(),
			None => recent,
		})
	}
}

impl LogSink {
	fn write(&mut self, record: &LogRecord) {
		let Some(log_dir) = self.log_dir.clone() else {
			return;
		};

		let today = logs::today();
		if self.date != Some(today) || self.file.is_none() {
			let path = logs::log_file_path(&log_dir, &self.label, today);
			self.file = match OpenOptions::new().create(true).append(true).open(&path) {
				Ok(f) => Some(f),
				Err(e) => {
					self.warn_once(format!("cannot open {}: {}", path.display(), e));
					None
				}
			};
			self.date = Some(today);
		}

		let Some(file) = self.file.as_mut() else {
			return;
		};
		let mut data = match serde_json::to_vec(record) {
			Ok(d) => d,
			Err(e) => {
				tracing::warn!("failed to encode log record for {}: {}", self.label, e);
				return;
			}
		};
		data.push(b'\n');
		if let Err(e) = file.write_all(&data) {
			self.warn_once(format!("write to log for {} failed: {}", self.label, e));
			self.file = None;
		}
	}

	fn warn_once(&mut self, msg: String) {
		if !self.warned {
			tracing::warn!("{}", msg);
			self.warned = true;
		}
	}
}

fn ansi_regex() -> &'static Regex {
	static ANSI: OnceLock<Regex> = OnceLock::new();
	ANSI.get_or_init(|| {
		Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
			.expect("static ansi pattern")
	})
}

pub fn strip_ansi(s: &str) -> String {
	ansi_regex().replace_all(s, "").into_owned()
}

/// Renders records as `[HH:MM:SS] line`, one per line, in local time.
pub fn format_records(records: &[LogRecord], color: bool) -> String {
	records
		.iter()
		.map(|r| {
			let time = r.time.with_timezone(&Local).format("%H:%M:%S");
			if color {
				format!("[{}] {}", time, r.line)
			} else {
				format!("[{}] {}", time, strip_ansi(&r.line))
			}
		})
		.collect::<Vec<_>>()
		.join("\n")
}

#[cfg(test)]
mod tests {
	use super::*;

	fn record(n: usize) -> LogRecord {
		LogRecord::new("web", Some(1), format!("line {}", n))
	}

	#[test]
	fn test_buffer_evicts_oldest() {
		let mut buf = LogBuffer::new(DEFAULT_CAPACITY);
		for n in 0..=DEFAULT_CAPACITY {
			buf.push(record(n));
		}
		assert_eq!(buf.len(), DEFAULT_CAPACITY);
		let lines: Vec<&str> = buf.iter().map(|r| r.line.as_str()).collect();
		assert_eq!(lines[0], "line 1");
		assert_eq!(lines[DEFAULT_CAPACITY - 1], format!("line {}", DEFAULT_CAPACITY));
		assert!(buf.iter().zip(buf.iter().skip(1)).all(|(a, b)| {
			let a: usize = a.line[5..].parse().unwrap();
			let b: usize = b.line[5..].parse().unwrap();
			b == a + 1
		}));
	}

	#[test]
	fn test_buffer_tail() {
		let mut buf = LogBuffer::new(5);
		for n in 0..3 {
			buf.push(record(n));
		}
		assert_eq!(buf.tail(10).len(), 3);
		let tail = buf.tail(2);
		assert_eq!(tail[0].line, "line 1");
		assert_eq!(tail[1].line, "line 2");
	}

	#[tokio::test]
	async fn test_query_filters_case_insensitive() {
		let capture = LogCapture::new("web", None, 100);
		capture.append(LogRecord::new("web", None, "compiled ok")).await;
		capture.append(LogRecord::new("web", None, "ERROR: boom")).await;
		capture.append(LogRecord::new("web", None, "TypeError in app.tsx")).await;

		let found = capture
			.query(&LogQuery {
				pattern: Some("error".into()),
				..Default::default()
			})
			.await
			.unwrap();
		assert_eq!(found.len(), 2);
		assert!(found.iter().all(|r| r.line.to_lowercase().contains("error")));
	}

	#[tokio::test]
	async fn test_query_tail_before_filter() {
		let capture = LogCapture::new("web", None, 100);
		capture.append(LogRecord::new("web", None, "error early")).await;
		capture.append(LogRecord::new("web", None, "fine")).await;
		let found = capture
			.query(&LogQuery {
				lines: 1,
				pattern: Some("error".into()),
				color: false,
			})
			.await
			.unwrap();
		assert!(found.is_empty());
	}

	#[tokio::test]
	async fn test_invalid_pattern_leaves_buffer() {
		let capture = LogCapture::new("web", None, 100);
		capture.append(record(0)).await;
		let err = capture
			.query(&LogQuery {
				pattern: Some("(unclosed".into()),
				..Default::default()
			})
			.await
			.unwrap_err();
		assert!(matches!(err, Error::InvalidPattern { .. }));
		assert_eq!(capture.len().await, 1);
	}

	#[test]
	fn test_strip_ansi() {
		assert_eq!(strip_ansi("\x1b[32m✓\x1b[0m ready in \x1b[1m120ms\x1b[22m"), "✓ ready in 120ms");
		assert_eq!(strip_ansi("plain"), "plain");
	}

	#[test]
	fn test_format_records_color() {
		let records = vec![LogRecord::new("web", None, "\x1b[31mfail\x1b[0m")];
		assert!(format_records(&records, false).ends_with("] fail"));
		assert!(format_records(&records, true).ends_with("] \x1b[31mfail\x1b[0m"));
	}

	#[tokio::test]
	async fn test_durable_append() {
		let dir = std::env::temp_dir().join(format!("devserve-output-{}", std::process::id()));
		let _ = std::fs::remove_dir_all(&dir);
		std::fs::create_dir_all(&dir).unwrap();

		let capture = LogCapture::new("shop:web", Some(dir.as_path()), 10);
		capture.append(LogRecord::new("shop:web", Some(7), "hello")).await;
		capture.append(LogRecord::new("shop:web", Some(7), "world")).await;

		let path = logs::log_file_path(&dir, "shop:web", logs::today());
		let content = std::fs::read_to_string(&path).unwrap();
		let lines: Vec<LogRecord> = content
			.lines()
			.map(|l| serde_json::from_str(l).unwrap())
			.collect();
		assert_eq!(lines.len(), 2);
		assert_eq!(lines[0].line, "hello");
		assert_eq!(lines[1].pid, Some(7));

		let _ = std::fs::remove_dir_all(&dir);
	}

	#[tokio::test]
	async fn test_durable_failure_keeps_memory() {
		let file = std::env::temp_dir().join(format!("devserve-notadir-{}", std::process::id()));
		std::fs::write(&file, b"").unwrap();

		let capture = LogCapture::new("web", Some(file.as_path()), 10);
		capture.append(record(1)).await;
		capture.append(record(2)).await;
		assert_eq!(capture.len().await, 2);

		let _ = std::fs::remove_file(&file);
	}
}

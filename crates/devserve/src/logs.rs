//! Naming and retention of the per-label, per-day JSONL log files.

use chrono::{NaiveDate, Utc};
use std::path::{Path, PathBuf};

const LOG_EXT: &str = "jsonl";

/// Labels may contain `:`; path separators are the only characters replaced.
pub fn sanitize_label(label: &str) -> String {
	label.replace(['/', '\\'], "_")
}

pub fn log_file_name(label: &str, date: NaiveDate) -> String {
	format!("{}-{}.{}", sanitize_label(label), date.format("%Y-%m-%d"), LOG_EXT)
}

pub fn log_file_path(log_dir: &Path, label: &str, date: NaiveDate) -> PathBuf {
	log_dir.join(log_file_name(label, date))
}

/// Files roll over at UTC midnight, matching the record timestamps.
pub fn today() -> NaiveDate {
	Utc::now().date_naive()
}

/// Extracts the date from a name like `shop:web-2026-02-14.jsonl`.
pub fn parse_log_date(filename: &str) -> Option<NaiveDate> {
	let stem = filename.strip_suffix(LOG_EXT)?.strip_suffix('.')?;
	if stem.len() < 11 || !stem.is_char_boundary(stem.len() - 10) {
		return None;
	}
	let (rest, date) = stem.split_at(stem.len() - 10);
	if !rest.ends_with('-') {
		return None;
	}
	NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

/// Removes log files dated more than `max_age_days` before `today`.
/// Returns how many files were removed.
pub fn expire_logs(log_dir: &Path, max_age_days: u32, today: NaiveDate) -> usize {
	if max_age_days == 0 || !log_dir.exists() {
		return 0;
	}

	let entries = match std::fs::read_dir(log_dir) {
		Ok(e) => e,
		Err(e) => {
			tracing::warn!("cannot read log dir {}: {}", log_dir.display(), e);
			return 0;
		}
	};

	let cutoff = today - chrono::Duration::days(max_age_days as i64);
	let mut removed = 0;
	for entry in entries.flatten() {
		let name = entry.file_name().to_string_lossy().to_string();
		let Some(date) = parse_log_date(&name) else {
			continue;
		};
		if date < cutoff {
			match std::fs::remove_file(entry.path()) {
				Ok(()) => removed += 1,
				Err(e) => tracing::warn!("failed to remove {}: {}", name, e),
			}
		}
	}
	removed
}

//! Persisted sync reports
//!
//! Every finished session leaves one JSON report in the peer's log
//! directory; `GetReports` pages through them, newest first. Old reports
//! are pruned according to `maxLogDirs`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::logging::warn;

/// Outcome of one source in one session
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SourceReport {
	pub mode: String,
	/// "done", "aborted" or "failed"
	pub status: String,
	pub error: u32,
	pub items_new: usize,
	pub items_updated: usize,
	pub items_deleted: usize,
	pub items_received: usize,
}

/// Outcome of one session
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
	pub peer: String,
	/// unix seconds
	pub start: u64,
	pub end: u64,
	/// 0/200 = success
	pub status: u32,
	pub error: String,
	pub sources: BTreeMap<String, SourceReport>,
}

impl SyncReport {
	pub fn new(peer: &str) -> Self {
		SyncReport {
			peer: peer.to_string(),
			start: unix_now(),
			..Default::default()
		}
	}

	pub fn finish(&mut self, status: u32, error: &str) {
		self.end = unix_now();
		self.status = status;
		self.error = error.to_string();
	}

	fn filename(&self) -> String {
		format!("report-{}.json", self.start)
	}

	/// Write the report into `dir`, keeping at most `max_reports` files
	/// (0 = unlimited)
	pub fn save(&self, dir: &Path, max_reports: usize) -> Result<PathBuf, SyncError> {
		fs::create_dir_all(dir)?;
		let path = dir.join(self.filename());
		let json = serde_json::to_string_pretty(self)
			.map_err(|e| SyncError::Other { message: e.to_string() })?;
		fs::write(&path, json)?;

		if max_reports > 0 {
			let mut reports = report_files(dir);
			while reports.len() > max_reports {
				// oldest first
				let victim = reports.remove(reports.len() - 1);
				if let Err(e) = fs::remove_file(&victim) {
					warn!("cannot prune report {}: {}", victim.display(), e);
				}
			}
		}
		Ok(path)
	}
}

pub fn unix_now() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Report files in `dir`, newest first
fn report_files(dir: &Path) -> Vec<PathBuf> {
	let mut files: Vec<PathBuf> = fs::read_dir(dir)
		.map(|read| {
			read.flatten()
				.map(|dent| dent.path())
				.filter(|p| {
					p.file_name()
						.and_then(|n| n.to_str())
						.map(|n| n.starts_with("report-") && n.ends_with(".json"))
						.unwrap_or(false)
				})
				.collect()
		})
		.unwrap_or_default();
	files.sort();
	files.reverse();
	files
}

/// Page through stored reports, newest first
pub fn load_reports(dir: &Path, start: usize, count: usize) -> Vec<SyncReport> {
	report_files(dir)
		.into_iter()
		.skip(start)
		.take(count)
		.filter_map(|path| {
			let text = fs::read_to_string(&path).ok()?;
			match serde_json::from_str(&text) {
				Ok(report) => Some(report),
				Err(e) => {
					warn!("unreadable report {}: {}", path.display(), e);
					None
				}
			}
		})
		.collect()
}

/// Default report directory of a peer when `logDir` is unset
pub fn default_log_dir(peer: &str) -> PathBuf {
	let base = std::env::var("XDG_CACHE_HOME")
		.ok()
		.filter(|v| !v.is_empty())
		.map(PathBuf::from)
		.unwrap_or_else(|| {
			std::env::var("HOME")
				.map(|h| PathBuf::from(h).join(".cache"))
				.unwrap_or_else(|_| PathBuf::from(".cache"))
		});
	base.join("pimsync").join(peer.to_lowercase())
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	fn report_at(peer: &str, start: u64) -> SyncReport {
		SyncReport { peer: peer.to_string(), start, end: start + 10, status: 200, ..Default::default() }
	}

	#[test]
	fn test_save_and_load_round_trip() {
		let dir = TempDir::new().unwrap();
		let mut report = SyncReport::new("work");
		report.sources.insert(
			"addressbook".to_string(),
			SourceReport {
				mode: "two-way".to_string(),
				status: "done".to_string(),
				items_new: 2,
				..Default::default()
			},
		);
		report.finish(200, "");
		report.save(dir.path(), 0).unwrap();

		let loaded = load_reports(dir.path(), 0, 10);
		assert_eq!(loaded.len(), 1);
		assert_eq!(loaded[0], report);
	}

	#[test]
	fn test_reports_newest_first_with_paging() {
		let dir = TempDir::new().unwrap();
		for start in [1000, 3000, 2000] {
			report_at("p", start).save(dir.path(), 0).unwrap();
		}
		let loaded = load_reports(dir.path(), 0, 2);
		assert_eq!(loaded[0].start, 3000);
		assert_eq!(loaded[1].start, 2000);

		let rest = load_reports(dir.path(), 2, 10);
		assert_eq!(rest.len(), 1);
		assert_eq!(rest[0].start, 1000);
	}

	#[test]
	fn test_pruning_keeps_newest() {
		let dir = TempDir::new().unwrap();
		for start in [1000, 2000, 3000, 4000] {
			report_at("p", start).save(dir.path(), 2).unwrap();
		}
		let loaded = load_reports(dir.path(), 0, 10);
		assert_eq!(loaded.len(), 2);
		assert_eq!(loaded[0].start, 4000);
		assert_eq!(loaded[1].start, 3000);
	}
}

// vim: ts=4

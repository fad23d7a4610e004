//! Shutdown on binary changes
//!
//! The daemon watches every executable file and shared library mapped into
//! its own address space. When one of them is replaced (package upgrade),
//! a shutdown helper session is queued at the highest priority; once
//! active it waits for a quiescence period since the last modification and
//! then restarts or stops the daemon.

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use crate::logging::{debug, info};

/// Modifications closer together than this restart the wait
pub const SHUTDOWN_QUIESCENCE: Duration = Duration::from_secs(10);

/// Mapped-file watcher, polled by the scheduler
pub struct BinaryWatch {
	files: Vec<(PathBuf, Option<SystemTime>)>,
}

fn mapped_executables() -> Vec<PathBuf> {
	let mut files: BTreeSet<PathBuf> = BTreeSet::new();

	if let Ok(maps) = fs::read_to_string("/proc/self/maps") {
		for line in maps.lines() {
			let mut fields = line.split_whitespace();
			let _range = fields.next();
			let perms = fields.next().unwrap_or("");
			if !perms.contains('x') {
				continue;
			}
			if let Some(path) = line.find('/').map(|i| &line[i..]) {
				let path = PathBuf::from(path.trim());
				if path.is_file() {
					files.insert(path);
				}
			}
		}
	}
	if files.is_empty() {
		if let Ok(exe) = std::env::current_exe() {
			files.insert(exe);
		}
	}
	files.into_iter().collect()
}

fn mtime(path: &PathBuf) -> Option<SystemTime> {
	fs::metadata(path).and_then(|m| m.modified()).ok()
}

impl BinaryWatch {
	pub fn new() -> Self {
		let files = mapped_executables()
			.into_iter()
			.map(|path| {
				let stamp = mtime(&path);
				(path, stamp)
			})
			.collect::<Vec<_>>();
		info!("watching {} mapped executables for changes", files.len());
		BinaryWatch { files }
	}

	#[cfg(test)]
	pub fn for_files(paths: Vec<PathBuf>) -> Self {
		BinaryWatch {
			files: paths
				.into_iter()
				.map(|path| {
					let stamp = mtime(&path);
					(path, stamp)
				})
				.collect(),
		}
	}

	/// True when any watched file changed since the last poll
	pub fn poll(&mut self) -> bool {
		let mut changed = false;
		for (path, stamp) in self.files.iter_mut() {
			let current = mtime(path);
			if current != *stamp {
				debug!("binary changed: {}", path.display());
				*stamp = current;
				changed = true;
			}
		}
		changed
	}
}

impl Default for BinaryWatch {
	fn default() -> Self {
		Self::new()
	}
}


// vim: ts=4

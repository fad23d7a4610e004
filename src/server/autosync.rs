//! Automatic synchronization management
//!
//! For every configuration with `autoSync` enabled, a task per sync URL is
//! kept in a list grouped by `autoSyncInterval`. Each list has a recurring
//! timer; when it fires, tasks whose transport has been up for at least
//! `autoSyncDelay` seconds are appended to the work queue. The scheduler
//! pops the queue and runs each task as a session with AUTOSYNC priority
//! and a temporary `syncURL` filter, so every endpoint is tried on its own.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crate::logging::debug;
use crate::server::presence::{PresenceMonitor, TransportKind};

/// One automatic sync candidate
#[derive(Debug, Clone)]
pub struct AutoSyncTask {
	pub peer: String,
	pub url: String,
	/// seconds the transport must have been continuously up
	pub delay: u64,
}

impl AutoSyncTask {
	/// Tasks are equal when peer and URL match, ignoring case
	pub fn same_as(&self, other: &AutoSyncTask) -> bool {
		self.peer.eq_ignore_ascii_case(&other.peer) && self.url.eq_ignore_ascii_case(&other.url)
	}
}

/// `autoSync` property value: which transports may run automatic syncs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoSyncSetting {
	Off,
	/// any transport
	On,
	/// only the listed transports
	Transports(Vec<TransportKind>),
}

impl AutoSyncSetting {
	pub fn parse(value: &str) -> AutoSyncSetting {
		let v = value.trim();
		if v.is_empty()
			|| v.eq_ignore_ascii_case("0")
			|| v.eq_ignore_ascii_case("f")
			|| v.eq_ignore_ascii_case("false")
		{
			return AutoSyncSetting::Off;
		}
		if v.eq_ignore_ascii_case("1") || v.eq_ignore_ascii_case("t") || v.eq_ignore_ascii_case("true")
		{
			return AutoSyncSetting::On;
		}
		let mut kinds = Vec::new();
		for part in v.split(',') {
			match part.trim().to_lowercase().as_str() {
				"http" => kinds.push(TransportKind::Http),
				"obex-bt" => kinds.push(TransportKind::Bluetooth),
				other => debug!("ignoring unknown autoSync transport \"{}\"", other),
			}
		}
		if kinds.is_empty() {
			AutoSyncSetting::Off
		} else {
			AutoSyncSetting::Transports(kinds)
		}
	}

	/// May a URL of the given transport class auto-sync?
	pub fn allows(&self, kind: TransportKind) -> bool {
		match self {
			AutoSyncSetting::Off => false,
			AutoSyncSetting::On => true,
			AutoSyncSetting::Transports(kinds) => kinds.contains(&kind),
		}
	}
}

#[derive(Debug, Default)]
struct AutoSyncInner {
	/// interval seconds -> tasks checked at that cadence
	intervals: HashMap<u64, Vec<AutoSyncTask>>,
	queue: VecDeque<AutoSyncTask>,
	active: Option<AutoSyncTask>,
}

/// Bookkeeping of all automatic sync tasks
#[derive(Debug, Default)]
pub struct AutoSyncManager {
	inner: Mutex<AutoSyncInner>,
}

impl AutoSyncManager {
	pub fn new() -> Self {
		Self::default()
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, AutoSyncInner> {
		self.inner.lock().unwrap_or_else(|e| e.into_inner())
	}

	/// Replace all tasks (called at startup and on ConfigChanged)
	pub fn load(&self, tasks: Vec<(u64, AutoSyncTask)>) {
		let mut inner = self.lock();
		inner.intervals.clear();
		for (interval, task) in tasks {
			inner.intervals.entry(interval).or_default().push(task);
		}
		// tasks of dropped configs must not linger in the queue
		let intervals = &inner.intervals;
		let keep: Vec<AutoSyncTask> = inner
			.queue
			.iter()
			.filter(|queued| {
				intervals.values().flatten().any(|t| t.same_as(queued))
			})
			.cloned()
			.collect();
		inner.queue = keep.into();
	}

	/// Intervals that need a recurring timer
	pub fn intervals(&self) -> Vec<u64> {
		let mut intervals: Vec<u64> = self.lock().intervals.keys().cloned().collect();
		intervals.sort_unstable();
		intervals
	}

	/// Any task configured at all? Prevents server auto-termination.
	pub fn prevents_termination(&self) -> bool {
		!self.lock().intervals.is_empty()
	}

	/// Timer callback: enqueue every due task of one interval group.
	/// Returns how many were added.
	pub fn schedule(&self, interval: u64, presence: &PresenceMonitor) -> usize {
		let mut inner = self.lock();
		let candidates: Vec<AutoSyncTask> = match inner.intervals.get(&interval) {
			Some(tasks) => tasks.clone(),
			None => return 0,
		};

		let mut added = 0;
		for task in candidates {
			let kind = TransportKind::of_url(&task.url);
			let up_for = match presence.up_duration(kind) {
				Some(d) => d,
				None => continue,
			};
			if up_for < Duration::from_secs(task.delay) {
				continue;
			}
			let duplicate = inner.queue.iter().any(|t| t.same_as(&task))
				|| inner.active.as_ref().map(|t| t.same_as(&task)).unwrap_or(false);
			if duplicate {
				continue;
			}
			debug!("auto-sync due: {} via {}", task.peer, task.url);
			inner.queue.push_back(task);
			added += 1;
		}
		added
	}

	/// Presence edge for interval-0 tasks ("sync when the transport
	/// appears"): evaluate every group immediately.
	pub fn schedule_all(&self, presence: &PresenceMonitor) -> usize {
		let intervals = self.intervals();
		intervals.into_iter().map(|i| self.schedule(i, presence)).sum()
	}

	/// Pop the next task and mark it active
	pub fn next_task(&self) -> Option<AutoSyncTask> {
		let mut inner = self.lock();
		let task = inner.queue.pop_front();
		inner.active = task.clone();
		task
	}

	pub fn has_task(&self) -> bool {
		!self.lock().queue.is_empty()
	}

	pub fn active_task(&self) -> Option<AutoSyncTask> {
		self.lock().active.clone()
	}

	/// The active task's session ended
	pub fn task_done(&self) {
		self.lock().active = None;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn task(peer: &str, url: &str, delay: u64) -> AutoSyncTask {
		AutoSyncTask { peer: peer.to_string(), url: url.to_string(), delay }
	}

	#[test]
	fn test_setting_parse() {
		assert_eq!(AutoSyncSetting::parse("0"), AutoSyncSetting::Off);
		assert_eq!(AutoSyncSetting::parse("F"), AutoSyncSetting::Off);
		assert_eq!(AutoSyncSetting::parse("1"), AutoSyncSetting::On);
		assert_eq!(AutoSyncSetting::parse("TRUE"), AutoSyncSetting::On);
		assert_eq!(
			AutoSyncSetting::parse("http,obex-bt"),
			AutoSyncSetting::Transports(vec![TransportKind::Http, TransportKind::Bluetooth])
		);
		assert!(AutoSyncSetting::parse("http").allows(TransportKind::Http));
		assert!(!AutoSyncSetting::parse("http").allows(TransportKind::Bluetooth));
		assert!(AutoSyncSetting::parse("1").allows(TransportKind::Bluetooth));
	}

	#[test]
	fn test_schedule_respects_presence_and_delay() {
		let manager = AutoSyncManager::new();
		manager.load(vec![(60, task("work", "http://sync.example.com", 3600))]);

		// transport up, but not long enough for the delay
		let presence = PresenceMonitor::new();
		assert_eq!(manager.schedule(60, &presence), 0);

		// no delay required: schedules immediately
		manager.load(vec![(60, task("work", "http://sync.example.com", 0))]);
		assert_eq!(manager.schedule(60, &presence), 1);
		assert!(manager.has_task());
	}

	#[test]
	fn test_transport_down_blocks_task() {
		let manager = AutoSyncManager::new();
		manager.load(vec![(60, task("phone", "obex-bt://00:11", 0))]);

		let presence = PresenceMonitor::new();
		presence.set_connman_state(&["wifi".to_string()], &[]);
		assert_eq!(manager.schedule(60, &presence), 0);

		presence.set_connman_state(&["wifi".to_string()], &["bluetooth".to_string()]);
		// still zero: bluetooth only just came up... unless delay is 0
		assert_eq!(manager.schedule(60, &presence), 1);
	}

	#[test]
	fn test_no_duplicate_tasks() {
		let manager = AutoSyncManager::new();
		manager.load(vec![(60, task("work", "http://sync.example.com", 0))]);
		let presence = PresenceMonitor::new();

		assert_eq!(manager.schedule(60, &presence), 1);
		assert_eq!(manager.schedule(60, &presence), 0, "queued task must not repeat");

		let active = manager.next_task().unwrap();
		assert_eq!(active.peer, "work");
		// active task also blocks re-queueing
		assert_eq!(manager.schedule(60, &presence), 0);

		manager.task_done();
		assert_eq!(manager.schedule(60, &presence), 1);
	}

	#[test]
	fn test_task_equality_case_insensitive() {
		let a = task("Work", "HTTP://Sync.Example.Com", 0);
		let b = task("work", "http://sync.example.com", 5);
		assert!(a.same_as(&b));
	}

	#[test]
	fn test_load_drops_queued_tasks_of_removed_configs() {
		let manager = AutoSyncManager::new();
		manager.load(vec![(60, task("work", "http://a", 0))]);
		let presence = PresenceMonitor::new();
		manager.schedule(60, &presence);
		assert!(manager.has_task());

		manager.load(vec![(60, task("other", "http://b", 0))]);
		assert!(!manager.has_task());
	}

	#[test]
	fn test_prevents_termination() {
		let manager = AutoSyncManager::new();
		assert!(!manager.prevents_termination());
		manager.load(vec![(300, task("work", "http://a", 0))]);
		assert!(manager.prevents_termination());
	}
}

// vim: ts=4

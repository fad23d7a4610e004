//! Transport presence aggregation
//!
//! Collaborating network stacks report their view of connectivity; the
//! monitor reduces that to "is HTTP usable" and "is Bluetooth usable" plus
//! the moment of the last change, which auto-sync uses for its delay gate.
//! With no collaborator present everything is assumed reachable.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Transport class required by a sync URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
	Http,
	Bluetooth,
	/// unknown scheme: reachable whenever anything is
	Any,
}

impl TransportKind {
	pub fn of_url(url: &str) -> TransportKind {
		let lower = url.to_lowercase();
		if lower.starts_with("http://")
			|| lower.starts_with("https://")
			|| lower.starts_with("local://")
		{
			TransportKind::Http
		} else if lower.starts_with("obex-bt://") {
			TransportKind::Bluetooth
		} else {
			TransportKind::Any
		}
	}
}

#[derive(Debug)]
struct TransportState {
	up: bool,
	since: Instant,
}

impl TransportState {
	fn set(&mut self, up: bool) -> bool {
		if self.up != up {
			self.up = up;
			self.since = Instant::now();
			return true;
		}
		false
	}
}

#[derive(Debug)]
struct PresenceInner {
	http: TransportState,
	bt: TransportState,
	/// a network stack has reported at least once
	has_provider: bool,
}

/// Aggregated reachability of the local transports
#[derive(Debug)]
pub struct PresenceMonitor {
	inner: Mutex<PresenceInner>,
}

impl PresenceMonitor {
	pub fn new() -> Self {
		let now = Instant::now();
		PresenceMonitor {
			inner: Mutex::new(PresenceInner {
				// fail open until a real provider reports
				http: TransportState { up: true, since: now },
				bt: TransportState { up: true, since: now },
				has_provider: false,
			}),
		}
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, PresenceInner> {
		self.inner.lock().unwrap_or_else(|e| e.into_inner())
	}

	/// Connection-manager style report: lists of connected and available
	/// technology names. Returns true when any transport changed.
	pub fn set_connman_state(&self, connected: &[String], available: &[String]) -> bool {
		let http = connected
			.iter()
			.any(|t| ["wifi", "ethernet", "wimax"].iter().any(|k| t.eq_ignore_ascii_case(k)));
		let bt = available.iter().any(|t| t.eq_ignore_ascii_case("bluetooth"));

		let mut inner = self.lock();
		inner.has_provider = true;
		let changed_http = inner.http.set(http);
		let changed_bt = inner.bt.set(bt);
		changed_http || changed_bt
	}

	/// Network-manager style report: a single state number, where 50 and
	/// above means connected. Only affects HTTP.
	pub fn set_network_manager_state(&self, state: u32) -> bool {
		let mut inner = self.lock();
		inner.has_provider = true;
		inner.http.set(state >= 50)
	}

	pub fn http_present(&self) -> bool {
		self.lock().http.up
	}

	pub fn bt_present(&self) -> bool {
		self.lock().bt.up
	}

	/// How long the transport has been continuously up
	pub fn up_duration(&self, kind: TransportKind) -> Option<Duration> {
		let inner = self.lock();
		let state = match kind {
			TransportKind::Http => &inner.http,
			TransportKind::Bluetooth => &inner.bt,
			TransportKind::Any => {
				// the longer-up of the two
				let candidates = [&inner.http, &inner.bt];
				let best = candidates.iter().filter(|s| s.up).min_by_key(|s| s.since);
				return best.map(|s| s.since.elapsed());
			}
		};
		if state.up {
			Some(state.since.elapsed())
		} else {
			None
		}
	}

	pub fn present(&self, kind: TransportKind) -> bool {
		match kind {
			TransportKind::Http => self.http_present(),
			TransportKind::Bluetooth => self.bt_present(),
			TransportKind::Any => self.http_present() || self.bt_present(),
		}
	}

	/// Presence of one peer, derived from its syncURL list.
	/// Returns the status string and the currently usable URLs.
	pub fn peer_status(&self, sync_urls: &[String]) -> (String, Vec<String>) {
		if sync_urls.is_empty() {
			return ("not present".to_string(), Vec::new());
		}
		let usable: Vec<String> = sync_urls
			.iter()
			.filter(|url| self.present(TransportKind::of_url(url)))
			.cloned()
			.collect();
		if usable.is_empty() {
			("no transport".to_string(), Vec::new())
		} else {
			(String::new(), usable)
		}
	}
}

impl Default for PresenceMonitor {
	fn default() -> Self {
		Self::new()
	}
}


// vim: ts=4

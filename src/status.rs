//! SyncML status codes and synchronization modes
//!
//! The numeric status space is shared with HTTP and the protocol engine;
//! codes above 20000 are local to this implementation and never appear on
//! the wire.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Result of SyncML operations, same codes as in HTTP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncStatus {
	/// ok
	Ok,
	/// no content / end of iteration / empty value
	NoContent,
	/// external data has been merged
	DataMerged,
	/// forbidden / access denied
	Forbidden,
	/// object not found
	NotFound,
	/// command not allowed
	CommandNotAllowed,
	/// database / memory full
	Full,
	/// command failed / fatal DB error
	Fatal,
	/// general DB error
	DatastoreFailure,
	/// message exchange failed or timed out (local, not sent on the wire)
	TransportFailure,
	/// password request was not answered in time (local)
	PasswordTimeout,
	/// any other numeric code, preserved verbatim
	Other(u32),
}

impl SyncStatus {
	pub fn code(&self) -> u32 {
		match self {
			SyncStatus::Ok => 200,
			SyncStatus::NoContent => 204,
			SyncStatus::DataMerged => 207,
			SyncStatus::Forbidden => 403,
			SyncStatus::NotFound => 404,
			SyncStatus::CommandNotAllowed => 405,
			SyncStatus::Full => 420,
			SyncStatus::Fatal => 500,
			SyncStatus::DatastoreFailure => 510,
			SyncStatus::TransportFailure => 20043,
			SyncStatus::PasswordTimeout => 20044,
			SyncStatus::Other(c) => *c,
		}
	}

	pub fn from_code(code: u32) -> Self {
		match code {
			0 | 200 => SyncStatus::Ok,
			204 => SyncStatus::NoContent,
			207 => SyncStatus::DataMerged,
			403 => SyncStatus::Forbidden,
			404 => SyncStatus::NotFound,
			405 => SyncStatus::CommandNotAllowed,
			420 => SyncStatus::Full,
			500 => SyncStatus::Fatal,
			510 => SyncStatus::DatastoreFailure,
			20043 => SyncStatus::TransportFailure,
			20044 => SyncStatus::PasswordTimeout,
			c => SyncStatus::Other(c),
		}
	}

	/// 200 and 207 both mean the operation took effect
	pub fn is_ok(&self) -> bool {
		matches!(self, SyncStatus::Ok | SyncStatus::NoContent | SyncStatus::DataMerged)
	}
}

impl fmt::Display for SyncStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.code())
	}
}

/// Synchronization mode of a source
///
/// Canonical names are the ones written into configs and sent to the engine;
/// parsing also accepts the shorter aliases users type on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
	#[default]
	TwoWay,
	Slow,
	RefreshFromClient,
	RefreshFromServer,
	OneWayFromClient,
	OneWayFromServer,
	Disabled,
}

impl SyncMode {
	/// Canonical user-visible name
	pub fn as_str(&self) -> &'static str {
		match self {
			SyncMode::TwoWay => "two-way",
			SyncMode::Slow => "slow",
			SyncMode::RefreshFromClient => "refresh-from-client",
			SyncMode::RefreshFromServer => "refresh-from-server",
			SyncMode::OneWayFromClient => "one-way-from-client",
			SyncMode::OneWayFromServer => "one-way-from-server",
			SyncMode::Disabled => "disabled",
		}
	}

	pub fn is_enabled(&self) -> bool {
		!matches!(self, SyncMode::Disabled)
	}

	/// Change detection requirements, per mode:
	/// (need all items, need new/updated/deleted classification, wipe local data)
	pub fn change_tracking(&self) -> (bool, bool, bool) {
		match self {
			SyncMode::Slow => (true, false, false),
			SyncMode::TwoWay => (false, true, false),
			SyncMode::OneWayFromClient => (false, true, false),
			SyncMode::RefreshFromServer => (false, false, true),
			SyncMode::RefreshFromClient => (true, false, false),
			SyncMode::OneWayFromServer => (false, false, false),
			SyncMode::Disabled => (false, false, false),
		}
	}

	/// True when no data travels from peer to us
	pub fn to_peer_only(&self) -> bool {
		matches!(self, SyncMode::OneWayFromClient | SyncMode::RefreshFromClient)
	}

	/// True when no data travels from us to the peer
	pub fn from_peer_only(&self) -> bool {
		matches!(self, SyncMode::OneWayFromServer | SyncMode::RefreshFromServer)
	}

	/// The same sync seen from the other side: what the peer has to do
	/// when we request this mode
	pub fn peer_view(&self) -> SyncMode {
		match self {
			SyncMode::TwoWay => SyncMode::TwoWay,
			SyncMode::Slow => SyncMode::Slow,
			SyncMode::RefreshFromClient => SyncMode::RefreshFromServer,
			SyncMode::RefreshFromServer => SyncMode::RefreshFromClient,
			SyncMode::OneWayFromClient => SyncMode::OneWayFromServer,
			SyncMode::OneWayFromServer => SyncMode::OneWayFromClient,
			SyncMode::Disabled => SyncMode::Disabled,
		}
	}
}

impl fmt::Display for SyncMode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for SyncMode {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let mode = s.trim();
		let eq = |a: &str| mode.eq_ignore_ascii_case(a);

		if eq("two-way") {
			Ok(SyncMode::TwoWay)
		} else if eq("slow") {
			Ok(SyncMode::Slow)
		} else if eq("refresh-from-client") || eq("refresh-client") {
			Ok(SyncMode::RefreshFromClient)
		} else if eq("refresh-from-server") || eq("refresh-server") || eq("refresh") {
			Ok(SyncMode::RefreshFromServer)
		} else if eq("one-way-from-client") || eq("one-way-client") {
			Ok(SyncMode::OneWayFromClient)
		} else if eq("one-way-from-server") || eq("one-way-server") || eq("one-way") {
			Ok(SyncMode::OneWayFromServer)
		} else if eq("disabled") || eq("none") {
			Ok(SyncMode::Disabled)
		} else {
			Err(format!("invalid sync mode \"{}\"", s))
		}
	}
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	/// waiting in the scheduler queue
	Queueing,
	/// active, holding the mutation lock, no long-running operation yet
	Idle,
	/// a sync or restore is executing
	Running,
	/// abort requested, engine tear-down pending
	Aborting,
	/// suspend requested, graceful stop pending
	Suspending,
	/// finished; terminal
	Done,
}

impl SessionState {
	pub fn as_str(&self) -> &'static str {
		match self {
			SessionState::Queueing => "queueing",
			SessionState::Idle => "idle",
			SessionState::Running => "running",
			SessionState::Aborting => "aborting",
			SessionState::Suspending => "suspending",
			SessionState::Done => "done",
		}
	}
}

impl fmt::Display for SessionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_status_round_trip() {
		for code in [200u32, 204, 207, 403, 404, 405, 420, 500, 510] {
			assert_eq!(SyncStatus::from_code(code).code(), code);
		}
		// 0 is the engine's "no error" spelling of OK
		assert_eq!(SyncStatus::from_code(0), SyncStatus::Ok);
		assert_eq!(SyncStatus::from_code(512), SyncStatus::Other(512));
		assert_eq!(SyncStatus::Other(512).code(), 512);
	}

	#[test]
	fn test_mode_canonical_names() {
		assert_eq!(SyncMode::TwoWay.to_string(), "two-way");
		assert_eq!(SyncMode::RefreshFromServer.to_string(), "refresh-from-server");
		assert_eq!("two-way".parse::<SyncMode>().unwrap(), SyncMode::TwoWay);
	}

	#[test]
	fn test_mode_aliases() {
		assert_eq!("refresh".parse::<SyncMode>().unwrap(), SyncMode::RefreshFromServer);
		assert_eq!("refresh-client".parse::<SyncMode>().unwrap(), SyncMode::RefreshFromClient);
		assert_eq!("one-way".parse::<SyncMode>().unwrap(), SyncMode::OneWayFromServer);
		assert_eq!("ONE-WAY-CLIENT".parse::<SyncMode>().unwrap(), SyncMode::OneWayFromClient);
		assert_eq!("none".parse::<SyncMode>().unwrap(), SyncMode::Disabled);
		assert!("sideways".parse::<SyncMode>().is_err());
	}

	#[test]
	fn test_change_tracking_table() {
		assert_eq!(SyncMode::Slow.change_tracking(), (true, false, false));
		assert_eq!(SyncMode::TwoWay.change_tracking(), (false, true, false));
		assert_eq!(SyncMode::OneWayFromClient.change_tracking(), (false, true, false));
		assert_eq!(SyncMode::RefreshFromServer.change_tracking(), (false, false, true));
		assert_eq!(SyncMode::RefreshFromClient.change_tracking(), (true, false, false));
		assert_eq!(SyncMode::OneWayFromServer.change_tracking(), (false, false, false));
	}
}

// vim: ts=4

//! Server-Alerted Notification parsing
//!
//! A SAN is the binary push message a server sends to make a client start a
//! sync. Layout after the 16 byte digest: a 40 bit header (version, ui
//! mode, initiator, reserved), 16 bit session id, length-prefixed server
//! identifier, then a nibble-counted list of sync entries (alert code,
//! content type, server URI).

use std::fmt;

use crate::status::SyncMode;

/// One requested sync of a SAN message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanEntry {
	pub mode: SyncMode,
	/// numeric MIME code of the data the server wants to sync
	pub content_type: u32,
	/// database URI on the server
	pub uri: String,
}

/// Parsed notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanMessage {
	/// protocol version times ten (12 = SyncML 1.2)
	pub version: u16,
	pub session_id: u16,
	pub server_id: String,
	pub entries: Vec<SanEntry>,
}

/// SAN parse failure with the offending offset
#[derive(Debug)]
pub struct SanError {
	pub message: String,
}

impl fmt::Display for SanError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "invalid notification: {}", self.message)
	}
}

impl std::error::Error for SanError {}

fn err(message: impl Into<String>) -> SanError {
	SanError { message: message.into() }
}

/// Server-alerted alert codes minus 200, as stored in the 4 bit sync type
fn mode_from_alert(sync_type: u8) -> Option<SyncMode> {
	match sync_type {
		6 => Some(SyncMode::TwoWay),
		7 => Some(SyncMode::OneWayFromClient),
		8 => Some(SyncMode::RefreshFromClient),
		9 => Some(SyncMode::OneWayFromServer),
		10 => Some(SyncMode::RefreshFromServer),
		_ => None,
	}
}

fn alert_from_mode(mode: SyncMode) -> u8 {
	match mode {
		SyncMode::OneWayFromClient => 7,
		SyncMode::RefreshFromClient => 8,
		SyncMode::OneWayFromServer => 9,
		SyncMode::RefreshFromServer => 10,
		// slow and disabled have no alert code; fall back to two-way
		_ => 6,
	}
}

/// Parse a binary SAN payload
pub fn parse_san(data: &[u8]) -> Result<SanMessage, SanError> {
	// digest (16) + header (5) + session id (2) + server id length (1)
	if data.len() < 24 {
		return Err(err("message shorter than the fixed header"));
	}

	let b0 = data[16];
	let b1 = data[17];
	let version = (u16::from(b0) << 2) | u16::from(b1 >> 6);
	if !(10..=20).contains(&version) {
		return Err(err(format!("unsupported version {}", version)));
	}

	let session_id = (u16::from(data[21]) << 8) | u16::from(data[22]);
	let server_len = data[23] as usize;
	if data.len() < 24 + server_len + 1 {
		return Err(err("truncated server identifier"));
	}
	let server_id = String::from_utf8(data[24..24 + server_len].to_vec())
		.map_err(|_| err("server identifier is not valid UTF-8"))?;
	if server_id.is_empty() {
		return Err(err("empty server identifier"));
	}

	let mut pos = 24 + server_len;
	let num_syncs = data[pos] >> 4;
	pos += 1;

	let mut entries = Vec::with_capacity(num_syncs as usize);
	for i in 0..num_syncs {
		if data.len() < pos + 5 {
			return Err(err(format!("truncated sync entry {}", i)));
		}
		let sync_type = data[pos] >> 4;
		let mode = mode_from_alert(sync_type)
			.ok_or_else(|| err(format!("unknown sync type {} in entry {}", sync_type, i)))?;
		let content_type = (u32::from(data[pos + 1]) << 16)
			| (u32::from(data[pos + 2]) << 8)
			| u32::from(data[pos + 3]);
		let uri_len = data[pos + 4] as usize;
		pos += 5;
		if data.len() < pos + uri_len {
			return Err(err(format!("truncated URI in entry {}", i)));
		}
		let uri = String::from_utf8(data[pos..pos + uri_len].to_vec())
			.map_err(|_| err("URI is not valid UTF-8"))?;
		pos += uri_len;
		entries.push(SanEntry { mode, content_type, uri });
	}

	Ok(SanMessage { version, session_id, server_id, entries })
}

/// Build a binary SAN payload (server side and tests)
pub fn build_san(message: &SanMessage) -> Vec<u8> {
	let mut out = vec![0u8; 16]; // digest, not verified by us

	out.push((message.version >> 2) as u8);
	out.push(((message.version & 0x3) as u8) << 6);
	out.push(0);
	out.push(0);
	out.push(0);
	out.push((message.session_id >> 8) as u8);
	out.push((message.session_id & 0xff) as u8);
	out.push(message.server_id.len() as u8);
	out.extend_from_slice(message.server_id.as_bytes());

	out.push((message.entries.len() as u8) << 4);
	for entry in &message.entries {
		out.push(alert_from_mode(entry.mode) << 4);
		out.push((entry.content_type >> 16) as u8);
		out.push((entry.content_type >> 8) as u8);
		out.push(entry.content_type as u8);
		out.push(entry.uri.len() as u8);
		out.extend_from_slice(entry.uri.as_bytes());
	}
	out
}

/// A local configuration considered for SAN dispatch
#[derive(Debug, Clone)]
pub struct SanCandidate {
	pub config_name: String,
	pub sync_urls: Vec<String>,
}

/// Pick the configuration a SAN is meant for.
///
/// Order: syncURL equal to the server id, then Bluetooth MAC match for
/// obex-bt URLs, then configuration name equal to the server id. `None`
/// means the caller creates `<serverID>_<timestamp>`.
pub fn match_config<'a>(server_id: &str, candidates: &'a [SanCandidate]) -> Option<&'a SanCandidate> {
	for candidate in candidates {
		if candidate.sync_urls.iter().any(|u| u.eq_ignore_ascii_case(server_id)) {
			return Some(candidate);
		}
	}

	if let Some(mac) = bt_mac(server_id) {
		for candidate in candidates {
			for url in &candidate.sync_urls {
				if bt_mac(url).map(|m| m.eq_ignore_ascii_case(&mac)).unwrap_or(false) {
					return Some(candidate);
				}
			}
		}
	}

	candidates.iter().find(|c| c.config_name.eq_ignore_ascii_case(server_id))
}

fn bt_mac(url: &str) -> Option<String> {
	url.strip_prefix("obex-bt://").map(|rest| {
		rest.split(&['/', '?'][..]).next().unwrap_or(rest).to_string()
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample() -> SanMessage {
		SanMessage {
			version: 12,
			session_id: 0x1234,
			server_id: "http://sync.example.com/sync".to_string(),
			entries: vec![
				SanEntry { mode: SyncMode::TwoWay, content_type: 0x0707, uri: "card".to_string() },
				SanEntry {
					mode: SyncMode::RefreshFromServer,
					content_type: 0x0706,
					uri: "cal".to_string(),
				},
			],
		}
	}

	#[test]
	fn test_san_round_trip() {
		let message = sample();
		let parsed = parse_san(&build_san(&message)).unwrap();
		assert_eq!(parsed, message);
	}

	#[test]
	fn test_san_zero_entries_keeps_server_id() {
		let message = SanMessage {
			version: 12,
			session_id: 7,
			server_id: "scheduleworld".to_string(),
			entries: Vec::new(),
		};
		let parsed = parse_san(&build_san(&message)).unwrap();
		assert_eq!(parsed.server_id, "scheduleworld");
		assert!(parsed.entries.is_empty());
	}

	#[test]
	fn test_san_rejects_garbage() {
		assert!(parse_san(b"short").is_err());
		assert!(parse_san(&[0u8; 64]).is_err()); // version 0

		let mut truncated = build_san(&sample());
		truncated.truncate(truncated.len() - 2);
		assert!(parse_san(&truncated).is_err());
	}

	#[test]
	fn test_match_by_sync_url_first() {
		let candidates = vec![
			SanCandidate {
				config_name: "http://sync.example.com/sync".to_string(),
				sync_urls: vec!["http://other.example.com".to_string()],
			},
			SanCandidate {
				config_name: "work".to_string(),
				sync_urls: vec!["http://sync.example.com/sync".to_string()],
			},
		];
		// the URL match beats the name match
		let chosen = match_config("http://sync.example.com/sync", &candidates).unwrap();
		assert_eq!(chosen.config_name, "work");
	}

	#[test]
	fn test_match_by_bt_mac() {
		let candidates = vec![SanCandidate {
			config_name: "phone".to_string(),
			sync_urls: vec!["obex-bt://00:11:22:33:44:55/channel7".to_string()],
		}];
		let chosen = match_config("obex-bt://00:11:22:33:44:55", &candidates).unwrap();
		assert_eq!(chosen.config_name, "phone");
	}

	#[test]
	fn test_match_by_name_last_or_none() {
		let candidates = vec![SanCandidate {
			config_name: "scheduleworld".to_string(),
			sync_urls: vec!["http://sync.scheduleworld.com".to_string()],
		}];
		assert!(match_config("ScheduleWorld", &candidates).is_some());
		assert!(match_config("unknown-server", &candidates).is_none());
	}
}

// vim: ts=4

//! IPC bus
//!
//! Clients talk to the daemon over a unix domain socket with one JSON
//! document per line: calls carry an id, a target object path and a
//! method; the daemon answers with a return value or a typed error and
//! pushes signals at any time. `server` dispatches calls onto the
//! scheduler, `client` is the typed counterpart used by the CLI.

pub mod client;
pub mod server;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Signal as broadcast inside the daemon
#[derive(Debug, Clone)]
pub struct BusSignal {
	pub path: String,
	pub name: String,
	pub args: Value,
}

/// One line on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "kebab-case")]
pub enum BusMessage {
	Call {
		id: u64,
		path: String,
		method: String,
		#[serde(default)]
		args: Value,
	},
	Return {
		id: u64,
		result: Value,
	},
	Error {
		id: u64,
		name: String,
		message: String,
	},
	Signal {
		path: String,
		name: String,
		args: Value,
	},
}

/// Default socket location: `$XDG_RUNTIME_DIR/pimsync.sock` with a
/// fallback under the config directory
pub fn default_socket_path() -> std::path::PathBuf {
	std::env::var("XDG_RUNTIME_DIR")
		.ok()
		.filter(|v| !v.is_empty())
		.map(|dir| std::path::PathBuf::from(dir).join("pimsync.sock"))
		.unwrap_or_else(|| crate::config::tree::modern_config_dir().join("pimsync.sock"))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_message_round_trip() {
		let call = BusMessage::Call {
			id: 7,
			path: "/".to_string(),
			method: "GetVersions".to_string(),
			args: serde_json::json!([]),
		};
		let line = serde_json::to_string(&call).unwrap();
		assert!(line.contains("\"msg\":\"call\""));
		let parsed: BusMessage = serde_json::from_str(&line).unwrap();
		match parsed {
			BusMessage::Call { id, method, .. } => {
				assert_eq!(id, 7);
				assert_eq!(method, "GetVersions");
			}
			other => panic!("wrong variant: {:?}", other),
		}
	}

	#[test]
	fn test_call_args_default_to_null() {
		let parsed: BusMessage =
			serde_json::from_str(r#"{"msg":"call","id":1,"path":"/","method":"Attach"}"#)
				.unwrap();
		match parsed {
			BusMessage::Call { args, .. } => assert!(args.is_null()),
			other => panic!("wrong variant: {:?}", other),
		}
	}
}

// vim: ts=4

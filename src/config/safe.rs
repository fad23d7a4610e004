//! Escaping wrapper for nodes whose keys or values may contain arbitrary
//! bytes
//!
//! Tracking nodes store item UIDs as property names; UIDs are opaque and can
//! contain characters the node file format cannot represent. Every byte
//! outside `[A-Za-z0-9_-]` is stored as `!HH` (lowercase hex).

use std::sync::Arc;

use crate::config::node::ConfigNode;
use crate::error::ConfigError;
use crate::logging::warn;

/// Escape arbitrary bytes into the safe key/value alphabet
pub fn escape(input: &str) -> String {
	let mut out = String::with_capacity(input.len());
	for byte in input.bytes() {
		if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
			out.push(byte as char);
		} else {
			out.push('!');
			out.push_str(&hex::encode([byte]));
		}
	}
	out
}

/// Inverse of [`escape`]. Rejects `!` not followed by two hex digits.
pub fn unescape(input: &str) -> Result<String, ConfigError> {
	let bytes = input.as_bytes();
	let mut out = Vec::with_capacity(bytes.len());
	let mut pos = 0;

	while pos < bytes.len() {
		if bytes[pos] == b'!' {
			if pos + 3 > bytes.len() {
				return Err(ConfigError::Parse {
					path: String::new(),
					message: format!("truncated escape sequence in \"{}\"", input),
				});
			}
			let hex_pair = &input[pos + 1..pos + 3];
			let decoded = hex::decode(hex_pair).map_err(|_| ConfigError::Parse {
				path: String::new(),
				message: format!("invalid escape sequence \"!{}\" in \"{}\"", hex_pair, input),
			})?;
			out.push(decoded[0]);
			pos += 3;
		} else {
			out.push(bytes[pos]);
			pos += 1;
		}
	}

	String::from_utf8(out).map_err(|_| ConfigError::Parse {
		path: String::new(),
		message: format!("unescaped content of \"{}\" is not valid UTF-8", input),
	})
}

/// Node wrapper that escapes every key and value passing through it
pub struct SafeConfigNode {
	node: Arc<dyn ConfigNode>,
}

impl SafeConfigNode {
	pub fn new(node: Arc<dyn ConfigNode>) -> Self {
		SafeConfigNode { node }
	}

	fn unescape_or_warn(&self, input: &str) -> String {
		match unescape(input) {
			Ok(s) => s,
			Err(e) => {
				warn!("{}: {}", self.node.name(), e);
				String::new()
			}
		}
	}
}

impl ConfigNode for SafeConfigNode {
	fn name(&self) -> String {
		self.node.name()
	}

	fn read(&self, key: &str) -> String {
		let raw = self.node.read(&escape(key));
		self.unescape_or_warn(&raw)
	}

	fn write_full(
		&self,
		key: &str,
		value: &str,
		comment: Option<&str>,
		is_default: bool,
	) -> Result<(), ConfigError> {
		self.node.write_full(&escape(key), &escape(value), comment, is_default)
	}

	fn remove(&self, key: &str) -> Result<(), ConfigError> {
		self.node.remove(&escape(key))
	}

	fn read_all(&self) -> Vec<(String, String)> {
		self.node
			.read_all()
			.into_iter()
			.map(|(k, v)| (self.unescape_or_warn(&k), self.unescape_or_warn(&v)))
			.collect()
	}

	fn has_key(&self, key: &str) -> bool {
		self.node.has_key(&escape(key))
	}

	fn exists(&self) -> bool {
		self.node.exists()
	}

	fn is_read_only(&self) -> bool {
		self.node.is_read_only()
	}

	fn flush(&self) -> Result<(), ConfigError> {
		self.node.flush()
	}
}


// vim: ts=4

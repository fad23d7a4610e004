//! Key-prefix wrapper
//!
//! Restricts a shared node to the keys starting with a fixed prefix, so
//! several owners can keep disjoint key spaces in one file. The tracking
//! layer stores item state under `item-`.

use std::sync::Arc;

use crate::config::node::ConfigNode;
use crate::error::ConfigError;

pub struct PrefixConfigNode {
	prefix: String,
	node: Arc<dyn ConfigNode>,
}

impl PrefixConfigNode {
	pub fn new(prefix: &str, node: Arc<dyn ConfigNode>) -> Self {
		PrefixConfigNode { prefix: prefix.to_string(), node }
	}
}

impl ConfigNode for PrefixConfigNode {
	fn name(&self) -> String {
		self.node.name()
	}

	fn read(&self, key: &str) -> String {
		self.node.read(&format!("{}{}", self.prefix, key))
	}

	fn write_full(
		&self,
		key: &str,
		value: &str,
		comment: Option<&str>,
		is_default: bool,
	) -> Result<(), ConfigError> {
		self.node.write_full(&format!("{}{}", self.prefix, key), value, comment, is_default)
	}

	fn remove(&self, key: &str) -> Result<(), ConfigError> {
		self.node.remove(&format!("{}{}", self.prefix, key))
	}

	fn read_all(&self) -> Vec<(String, String)> {
		self.node
			.read_all()
			.into_iter()
			.filter_map(|(k, v)| {
				if k.len() >= self.prefix.len()
					&& k[..self.prefix.len()].eq_ignore_ascii_case(&self.prefix)
				{
					Some((k[self.prefix.len()..].to_string(), v))
				} else {
					None
				}
			})
			.collect()
	}

	fn has_key(&self, key: &str) -> bool {
		self.node.has_key(&format!("{}{}", self.prefix, key))
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

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::node::VolatileConfigNode;

	#[test]
	fn test_prefix_isolation() {
		let inner = Arc::new(VolatileConfigNode::new("shared"));
		inner.write("other-key", "not ours").unwrap();

		let prefixed = PrefixConfigNode::new("item-", inner.clone() as Arc<dyn ConfigNode>);
		prefixed.write("A", "r1").unwrap();
		prefixed.write("B", "r2").unwrap();

		assert_eq!(inner.read("item-A"), "r1");
		assert_eq!(prefixed.read("A"), "r1");

		let all = prefixed.read_all();
		assert_eq!(all.len(), 2);
		assert!(all.contains(&("A".to_string(), "r1".to_string())));
		assert!(!all.iter().any(|(k, _)| k == "other-key"));

		prefixed.remove("A").unwrap();
		assert_eq!(inner.read("item-A"), "");
		assert_eq!(inner.read("other-key"), "not ours");
	}
}

// vim: ts=4

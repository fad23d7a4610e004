//! In-memory override layers on top of configuration nodes
//!
//! A session carries filters for peer and source settings: reads check the
//! filter first, writes clear the override and go through to the underlying
//! node. Filters never touch permanent storage.

use std::sync::{Arc, Mutex};

use crate::config::node::ConfigNode;
use crate::error::ConfigError;

/// Ordered, case-insensitive key/value override set
#[derive(Debug, Clone, Default)]
pub struct ConfigFilter {
	entries: Vec<(String, String)>,
}

impl ConfigFilter {
	pub fn new() -> Self {
		ConfigFilter::default()
	}

	pub fn get(&self, key: &str) -> Option<&str> {
		self.entries
			.iter()
			.find(|(k, _)| k.eq_ignore_ascii_case(key))
			.map(|(_, v)| v.as_str())
	}

	/// Insert or replace an override
	pub fn set(&mut self, key: &str, value: &str) {
		if let Some(entry) = self.entries.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
			entry.1 = value.to_string();
		} else {
			self.entries.push((key.to_string(), value.to_string()));
		}
	}

	pub fn remove(&mut self, key: &str) {
		self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
		self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
	}

	/// Merge `other` on top of self (other wins on conflicts)
	pub fn merge(&mut self, other: &ConfigFilter) {
		for (k, v) in other.iter() {
			self.set(k, v);
		}
	}
}

impl ConfigFilter {
	/// Build a filter from key/value pairs
	pub fn from_pairs<I: IntoIterator<Item = (String, String)>>(pairs: I) -> Self {
		let mut filter = ConfigFilter::new();
		for (k, v) in pairs {
			filter.set(&k, &v);
		}
		filter
	}
}

/// Node wrapper applying a [`ConfigFilter`]
pub struct FilterConfigNode {
	node: Arc<dyn ConfigNode>,
	filter: Mutex<ConfigFilter>,
	read_only: bool,
}

impl FilterConfigNode {
	pub fn new(node: Arc<dyn ConfigNode>, filter: ConfigFilter) -> Self {
		FilterConfigNode { node, filter: Mutex::new(filter), read_only: false }
	}

	/// Wrapper over a node the caller must not modify; any write through
	/// this filter is rejected.
	pub fn new_read_only(node: Arc<dyn ConfigNode>, filter: ConfigFilter) -> Self {
		FilterConfigNode { node, filter: Mutex::new(filter), read_only: true }
	}

	/// Insert/override one filter entry
	pub fn add_filter(&self, key: &str, value: &str) {
		self.filter.lock().unwrap_or_else(|e| e.into_inner()).set(key, value);
	}

	/// Replace the whole filter
	pub fn set_filter(&self, filter: ConfigFilter) {
		*self.filter.lock().unwrap_or_else(|e| e.into_inner()) = filter;
	}

	pub fn get_filter(&self) -> ConfigFilter {
		self.filter.lock().unwrap_or_else(|e| e.into_inner()).clone()
	}

	pub fn underlying(&self) -> Arc<dyn ConfigNode> {
		Arc::clone(&self.node)
	}
}

impl ConfigNode for FilterConfigNode {
	fn name(&self) -> String {
		self.node.name()
	}

	fn read(&self, key: &str) -> String {
		if let Some(v) = self.filter.lock().unwrap_or_else(|e| e.into_inner()).get(key) {
			return v.to_string();
		}
		self.node.read(key)
	}

	fn write_full(
		&self,
		key: &str,
		value: &str,
		comment: Option<&str>,
		is_default: bool,
	) -> Result<(), ConfigError> {
		if self.read_only {
			return Err(ConfigError::ReadOnly { name: self.name() });
		}
		// the override would shadow what we are about to write
		self.filter.lock().unwrap_or_else(|e| e.into_inner()).remove(key);
		self.node.write_full(key, value, comment, is_default)
	}

	fn remove(&self, key: &str) -> Result<(), ConfigError> {
		if self.read_only {
			return Err(ConfigError::ReadOnly { name: self.name() });
		}
		self.filter.lock().unwrap_or_else(|e| e.into_inner()).remove(key);
		self.node.remove(key)
	}

	fn read_all(&self) -> Vec<(String, String)> {
		let filter = self.filter.lock().unwrap_or_else(|e| e.into_inner());
		let mut all = self.node.read_all();
		for (k, v) in all.iter_mut() {
			if let Some(over) = filter.get(k) {
				*v = over.to_string();
			}
		}
		for (k, v) in filter.iter() {
			if !all.iter().any(|(key, _)| key.eq_ignore_ascii_case(k)) {
				all.push((k.to_string(), v.to_string()));
			}
		}
		all
	}

	fn has_key(&self, key: &str) -> bool {
		self.filter.lock().unwrap_or_else(|e| e.into_inner()).get(key).is_some()
			|| self.node.has_key(key)
	}

	fn exists(&self) -> bool {
		self.node.exists()
	}

	fn is_read_only(&self) -> bool {
		self.read_only || self.node.is_read_only()
	}

	fn flush(&self) -> Result<(), ConfigError> {
		if self.read_only {
			return Err(ConfigError::ReadOnly { name: self.name() });
		}
		self.node.flush()
	}
}


// vim: ts=4

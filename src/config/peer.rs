//! High-level view of one peer configuration
//!
//! Combines the node tree, the property registries and the session filters:
//! reads go through the filter stack, writes are validated against the
//! registries before they reach persistent storage.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::filter::{ConfigFilter, FilterConfigNode};
use crate::config::node::ConfigNode;
use crate::config::property::{source_registry, sync_registry};
use crate::config::tree::{discover, FileConfigTree, Layout, NodeKind};
use crate::error::ConfigError;
use crate::status::SyncMode;

/// Informational keys a config map may carry; they are not properties and
/// are silently ignored on writes.
pub const READONLY_KEYS: &[&str] =
	&["configName", "description", "score", "deviceName", "templateName", "fingerprint"];

/// Outer config-map key of one source
pub fn source_key(source: &str) -> String {
	format!("source/{}", source)
}

/// Map format used on the bus: `""` holds global properties, one
/// `source/<name>` entry per source.
pub type ConfigMap = BTreeMap<String, BTreeMap<String, String>>;

/// The three nodes of one source
pub struct SourceNodes {
	pub visible: Arc<FilterConfigNode>,
	pub hidden: Arc<dyn ConfigNode>,
	pub tracking: Arc<dyn ConfigNode>,
}

/// One peer configuration with its session filter stack
pub struct PeerConfig {
	name: String,
	tree: FileConfigTree,
	sync_filter: ConfigFilter,
	/// applied to every source of this session
	common_source_filter: ConfigFilter,
	/// per-source overrides, keyed by lowercased source name
	source_filters: HashMap<String, ConfigFilter>,
}

impl PeerConfig {
	/// Open the configuration by name, discovering its layout
	pub fn open(name: &str) -> Self {
		let (root, layout) = discover(name);
		Self::open_at(name, FileConfigTree::new(root, layout, false))
	}

	/// Open with an explicit tree (tests, migration tooling)
	pub fn open_at(name: &str, tree: FileConfigTree) -> Self {
		PeerConfig {
			name: name.to_string(),
			tree,
			sync_filter: ConfigFilter::new(),
			common_source_filter: ConfigFilter::new(),
			source_filters: HashMap::new(),
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn tree(&self) -> &FileConfigTree {
		&self.tree
	}

	pub fn exists(&self) -> bool {
		self.tree.exists()
			&& self
				.tree
				.open(self.tree.peer_path(), NodeKind::Visible)
				.map(|n| n.exists())
				.unwrap_or(false)
	}

	// --- filter stack -------------------------------------------------

	pub fn set_sync_filter(&mut self, filter: ConfigFilter) {
		self.sync_filter = filter;
	}

	pub fn sync_filter(&self) -> &ConfigFilter {
		&self.sync_filter
	}

	pub fn add_sync_filter(&mut self, key: &str, value: &str) {
		self.sync_filter.set(key, value);
	}

	pub fn set_common_source_filter(&mut self, filter: ConfigFilter) {
		self.common_source_filter = filter;
	}

	pub fn set_source_filter(&mut self, source: &str, filter: ConfigFilter) {
		self.source_filters.insert(source.to_lowercase(), filter);
	}

	pub fn merge_source_filter(&mut self, source: &str, other: &ConfigFilter) {
		self.source_filters.entry(source.to_lowercase()).or_default().merge(other);
	}

	/// Effective filter of one source: common filter first, then the
	/// per-source override on top
	fn effective_source_filter(&self, source: &str) -> ConfigFilter {
		let mut filter = self.common_source_filter.clone();
		if let Some(over) = self.source_filters.get(&source.to_lowercase()) {
			filter.merge(over);
		}
		filter
	}

	// --- node access --------------------------------------------------

	/// Peer-level node with the sync filter applied
	pub fn peer_node(&self) -> Result<Arc<FilterConfigNode>, ConfigError> {
		let node = self.tree.open(self.tree.peer_path(), NodeKind::Visible)?;
		Ok(Arc::new(FilterConfigNode::new(node, self.sync_filter.clone())))
	}

	pub fn hidden_node(&self) -> Result<Arc<dyn ConfigNode>, ConfigError> {
		self.tree.open(self.tree.peer_path(), NodeKind::Hidden)
	}

	/// All three nodes of a source, filters applied to the visible one
	pub fn source_nodes(&self, source: &str, change_id: &str) -> Result<SourceNodes, ConfigError> {
		let path = self.tree.source_path(source);
		let visible = self.tree.open(&path, NodeKind::Visible)?;
		let hidden = self.tree.open(&path, NodeKind::Hidden)?;
		let tracking = self.tree.open(&path, NodeKind::Tracking(change_id.to_string()))?;
		Ok(SourceNodes {
			visible: Arc::new(FilterConfigNode::new(visible, self.effective_source_filter(source))),
			hidden,
			tracking,
		})
	}

	/// Configured source names (on disk plus uncommitted)
	pub fn source_names(&self) -> Vec<String> {
		self.tree.children(self.tree.sources_path())
	}

	pub fn has_source(&self, source: &str) -> bool {
		self.source_names().iter().any(|s| s.eq_ignore_ascii_case(source))
	}

	// --- typed property access ---------------------------------------

	pub fn get(&self, prop_name: &str) -> Result<String, ConfigError> {
		let prop = sync_registry()
			.find(prop_name)
			.ok_or_else(|| ConfigError::InvalidCall {
				message: format!("unknown property \"{}\"", prop_name),
			})?;
		let node = self.peer_node()?;
		Ok(prop.get(node.as_ref()))
	}

	pub fn get_bool(&self, prop_name: &str) -> bool {
		self.get(prop_name)
			.ok()
			.and_then(|v| crate::config::property::parse_bool(&v))
			.unwrap_or(false)
	}

	pub fn get_u64(&self, prop_name: &str) -> u64 {
		self.get(prop_name).ok().and_then(|v| v.parse().ok()).unwrap_or(0)
	}

	pub fn sync_url(&self) -> String {
		self.get("syncURL").unwrap_or_default()
	}

	/// syncURL may list several space separated endpoints
	pub fn sync_urls(&self) -> Vec<String> {
		self.sync_url().split_whitespace().map(|s| s.to_string()).collect()
	}

	pub fn remote_device_id(&self) -> String {
		self.get("remoteDeviceId").unwrap_or_default()
	}

	/// Sync mode of a source after the filter stack is applied
	pub fn source_mode(&self, source: &str, change_id: &str) -> Result<SyncMode, ConfigError> {
		let nodes = self.source_nodes(source, change_id)?;
		let prop = source_registry().find("sync").expect("sync property registered");
		prop.get(nodes.visible.as_ref())
			.parse()
			.map_err(|message| ConfigError::InvalidCall { message })
	}

	// --- config map conversion ---------------------------------------

	/// Dump the whole configuration in the bus map format, defaults
	/// included, hidden properties and passwords excluded from the dump
	/// unless set.
	pub fn to_map(&self) -> Result<ConfigMap, ConfigError> {
		if !self.exists() {
			return Err(ConfigError::NoSuchConfig { name: self.name.clone() });
		}
		let mut map = ConfigMap::new();

		let peer = self.peer_node()?;
		let mut global = BTreeMap::new();
		global.insert("configName".to_string(), self.name.clone());
		for prop in sync_registry().iter().filter(|p| !p.hidden) {
			global.insert(prop.name.to_string(), prop.get(peer.as_ref()));
		}
		map.insert(String::new(), global);

		for source in self.source_names() {
			let nodes = self.source_nodes(&source, "meta")?;
			let mut inner = BTreeMap::new();
			for prop in source_registry().iter().filter(|p| !p.hidden) {
				inner.insert(prop.name.to_string(), prop.get(nodes.visible.as_ref()));
			}
			map.insert(source_key(&source), inner);
		}

		Ok(map)
	}

	/// Apply a config map to persistent storage.
	///
	/// With `update` false the existing content is replaced: properties not
	/// named in the map return to their defaults and sources not named are
	/// removed from the map's point of view (their directories stay, their
	/// sync mode becomes "disabled"). Every key is validated before
	/// anything is written, so an invalid map leaves the store untouched.
	pub fn apply_map(&self, update: bool, map: &ConfigMap) -> Result<(), ConfigError> {
		// validate everything first
		for (outer, inner) in map {
			let (registry, what) = if outer.is_empty() {
				(sync_registry(), "global".to_string())
			} else if let Some(source) = outer.strip_prefix("source/") {
				(source_registry(), format!("source \"{}\"", source))
			} else {
				return Err(ConfigError::InvalidCall {
					message: format!("invalid config map key \"{}\"", outer),
				});
			};
			for (key, value) in inner {
				if READONLY_KEYS.iter().any(|k| k.eq_ignore_ascii_case(key)) {
					continue;
				}
				let prop = registry.find(key).ok_or_else(|| ConfigError::InvalidCall {
					message: format!("unknown {} property \"{}\"", what, key),
				})?;
				prop.check(value).map_err(|message| ConfigError::InvalidCall { message })?;
			}
		}

		// then write
		for (outer, inner) in map {
			let node: Arc<dyn ConfigNode> = if outer.is_empty() {
				let node = self.tree.open(self.tree.peer_path(), NodeKind::Visible)?;
				if !update {
					sync_registry().set_defaults(node.as_ref(), false)?;
				}
				node
			} else {
				let source = outer.strip_prefix("source/").expect("validated above");
				let node = self.tree.open(&self.tree.source_path(source), NodeKind::Visible)?;
				if !update {
					source_registry().set_defaults(node.as_ref(), false)?;
				}
				node
			};
			let registry = if outer.is_empty() { sync_registry() } else { source_registry() };
			for (key, value) in inner {
				if READONLY_KEYS.iter().any(|k| k.eq_ignore_ascii_case(key)) {
					continue;
				}
				let prop = registry.find(key).expect("validated above");
				prop.set(node.as_ref(), value)?;
			}
		}

		self.tree.flush()
	}

	pub fn remove_config(&self) -> Result<(), ConfigError> {
		if !self.exists() {
			return Err(ConfigError::NoSuchConfig { name: self.name.clone() });
		}
		self.tree.remove()
	}

	pub fn flush(&self) -> Result<(), ConfigError> {
		self.tree.flush()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	fn test_config(dir: &TempDir) -> PeerConfig {
		let tree = FileConfigTree::new(dir.path().join("peer"), Layout::Modern, false);
		PeerConfig::open_at("peer", tree)
	}

	fn seeded_map() -> ConfigMap {
		let mut map = ConfigMap::new();
		let mut global = BTreeMap::new();
		global.insert("syncURL".to_string(), "http://sync.example.com".to_string());
		global.insert("username".to_string(), "me".to_string());
		map.insert(String::new(), global);
		let mut source = BTreeMap::new();
		source.insert("sync".to_string(), "two-way".to_string());
		source.insert("uri".to_string(), "card".to_string());
		map.insert("source/addressbook".to_string(), source);
		map
	}

	#[test]
	fn test_apply_and_dump_round_trip() {
		let dir = TempDir::new().unwrap();
		let config = test_config(&dir);
		config.apply_map(false, &seeded_map()).unwrap();

		let dumped = config.to_map().unwrap();
		assert_eq!(dumped[""]["syncURL"], "http://sync.example.com");
		assert_eq!(dumped[""]["username"], "me");
		assert_eq!(dumped[""]["configName"], "peer");
		// defaults appear in the dump
		assert_eq!(dumped[""]["maxLogDirs"], "10");
		assert_eq!(dumped["source/addressbook"]["sync"], "two-way");
		assert_eq!(dumped["source/addressbook"]["uri"], "card");
	}

	#[test]
	fn test_unknown_key_rejected_store_untouched() {
		let dir = TempDir::new().unwrap();
		let config = test_config(&dir);
		config.apply_map(false, &seeded_map()).unwrap();

		let mut bad = ConfigMap::new();
		let mut global = BTreeMap::new();
		global.insert("syncURL".to_string(), "http://other.example.com".to_string());
		global.insert("frobnicate".to_string(), "yes".to_string());
		bad.insert(String::new(), global);

		assert!(matches!(
			config.apply_map(true, &bad),
			Err(ConfigError::InvalidCall { .. })
		));
		// the valid first key was not applied either
		assert_eq!(config.sync_url(), "http://sync.example.com");
	}

	#[test]
	fn test_readonly_keys_silently_ignored() {
		let dir = TempDir::new().unwrap();
		let config = test_config(&dir);

		let mut map = seeded_map();
		map.get_mut("").unwrap().insert("templateName".to_string(), "Funambol".to_string());
		map.get_mut("").unwrap().insert("score".to_string(), "5".to_string());
		config.apply_map(false, &map).unwrap();
		assert_eq!(config.sync_url(), "http://sync.example.com");
	}

	#[test]
	fn test_alias_canonicalized_on_write() {
		let dir = TempDir::new().unwrap();
		let config = test_config(&dir);
		let mut map = seeded_map();
		map.get_mut("source/addressbook")
			.unwrap()
			.insert("sync".to_string(), "refresh".to_string());
		config.apply_map(false, &map).unwrap();

		let dumped = config.to_map().unwrap();
		assert_eq!(dumped["source/addressbook"]["sync"], "refresh-from-server");
		assert_eq!(
			config.source_mode("addressbook", "meta").unwrap(),
			SyncMode::RefreshFromServer
		);
	}

	#[test]
	fn test_sync_filter_overrides_reads_not_store() {
		let dir = TempDir::new().unwrap();
		let mut config = test_config(&dir);
		config.apply_map(false, &seeded_map()).unwrap();

		let mut filter = ConfigFilter::new();
		filter.set("syncURL", "http://temporary.example.com");
		config.set_sync_filter(filter);
		assert_eq!(config.sync_url(), "http://temporary.example.com");

		config.set_sync_filter(ConfigFilter::new());
		assert_eq!(config.sync_url(), "http://sync.example.com");
	}

	#[test]
	fn test_source_filter_changes_mode() {
		let dir = TempDir::new().unwrap();
		let mut config = test_config(&dir);
		config.apply_map(false, &seeded_map()).unwrap();

		let mut filter = ConfigFilter::new();
		filter.set("sync", "one-way-from-client");
		config.set_source_filter("addressbook", filter);
		assert_eq!(
			config.source_mode("addressbook", "meta").unwrap(),
			SyncMode::OneWayFromClient
		);
	}

	#[test]
	fn test_missing_config_errors() {
		let dir = TempDir::new().unwrap();
		let config = test_config(&dir);
		assert!(matches!(config.to_map(), Err(ConfigError::NoSuchConfig { .. })));
		assert!(matches!(config.remove_config(), Err(ConfigError::NoSuchConfig { .. })));
	}
}

// vim: ts=4

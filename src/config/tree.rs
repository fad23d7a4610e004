//! Configuration tree: a directory of node files for one peer configuration
//!
//! Two on-disk layouts are supported. The legacy layout lives under
//! `~/.sync4j/evolution/<server>` with `spds/syncml` and `spds/sources/<src>`
//! subdirectories whose node files are all called `config.txt`; visible and
//! hidden properties share one file there. The modern layout lives under
//! `$XDG_CONFIG_HOME/pimsync/<server>` with one file per node kind.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::config::node::{list_children, ConfigNode, FileConfigNode, VolatileConfigNode};
use crate::error::ConfigError;
use crate::logging::debug;

/// On-disk layout of a configuration tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
	/// `~/.sync4j/evolution/<server>` with `config.txt` node files
	Sync4j,
	/// `$XDG_CONFIG_HOME/pimsync/<server>` with per-kind node files
	Modern,
}

/// Which node of a path is requested
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
	/// user-facing settings
	Visible,
	/// internal state (nonces, last sync anchor, device info hash)
	Hidden,
	/// per-peer change bookkeeping for a source, keyed by change id
	Tracking(String),
}

struct TreeState {
	cache: HashMap<PathBuf, Arc<dyn ConfigNode>>,
	removed: bool,
}

/// A tree of configuration nodes rooted at one directory
pub struct FileConfigTree {
	root: PathBuf,
	layout: Layout,
	read_only: bool,
	state: Mutex<TreeState>,
}

impl FileConfigTree {
	pub fn new<P: AsRef<Path>>(root: P, layout: Layout, read_only: bool) -> Self {
		FileConfigTree {
			root: root.as_ref().to_path_buf(),
			layout,
			read_only,
			state: Mutex::new(TreeState { cache: HashMap::new(), removed: false }),
		}
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	pub fn layout(&self) -> Layout {
		self.layout
	}

	/// Relative directory of the peer's main nodes
	pub fn peer_path(&self) -> &'static str {
		match self.layout {
			Layout::Sync4j => "spds/syncml",
			Layout::Modern => "",
		}
	}

	/// Relative directory holding all source directories
	pub fn sources_path(&self) -> &'static str {
		match self.layout {
			Layout::Sync4j => "spds/sources",
			Layout::Modern => "sources",
		}
	}

	/// Relative directory of one source's nodes
	pub fn source_path(&self, source: &str) -> String {
		format!("{}/{}", self.sources_path(), source)
	}

	fn node_file(&self, rel_path: &str, kind: &NodeKind) -> PathBuf {
		let dir = if rel_path.is_empty() {
			self.root.clone()
		} else {
			self.root.join(rel_path)
		};
		match (self.layout, kind) {
			// legacy: visible and hidden share one file by design
			(Layout::Sync4j, NodeKind::Visible) | (Layout::Sync4j, NodeKind::Hidden) => {
				dir.join("config.txt")
			}
			(Layout::Sync4j, NodeKind::Tracking(id)) => {
				dir.join(format!("changes_{}", id)).join("config.txt")
			}
			(Layout::Modern, NodeKind::Visible) => dir.join("config.ini"),
			(Layout::Modern, NodeKind::Hidden) => dir.join(".internal.ini"),
			(Layout::Modern, NodeKind::Tracking(id)) => dir.join(format!(".other_{}.ini", id)),
		}
	}

	/// Open a node. Nodes are cached by file path, so the same path and
	/// kind always yields the same object; in the legacy layout, visible
	/// and hidden kinds alias the same node.
	pub fn open(&self, rel_path: &str, kind: NodeKind) -> Result<Arc<dyn ConfigNode>, ConfigError> {
		let file = self.node_file(rel_path, &kind);
		let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

		if let Some(node) = state.cache.get(&file) {
			return Ok(Arc::clone(node));
		}

		let node: Arc<dyn ConfigNode> = if state.removed {
			Arc::new(VolatileConfigNode::new(&file.display().to_string()))
		} else {
			Arc::new(FileConfigNode::new(&file, self.read_only)?)
		};
		state.cache.insert(file, Arc::clone(&node));
		Ok(node)
	}

	/// Child directory names below `rel_path`: union of what is on disk
	/// and what exists only as uncommitted in-memory nodes.
	pub fn children(&self, rel_path: &str) -> Vec<String> {
		let dir = if rel_path.is_empty() {
			self.root.clone()
		} else {
			self.root.join(rel_path)
		};
		let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
		list_children(&dir, state.cache.keys().cloned(), &dir)
	}

	/// Write every modified node
	pub fn flush(&self) -> Result<(), ConfigError> {
		let nodes: Vec<Arc<dyn ConfigNode>> = {
			let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
			if state.removed {
				return Ok(());
			}
			state.cache.values().cloned().collect()
		};
		for node in nodes {
			node.flush()?;
		}
		Ok(())
	}

	/// Delete the tree on disk and turn this object into a volatile
	/// stand-in: nodes opened afterwards exist in memory only.
	pub fn remove(&self) -> Result<(), ConfigError> {
		if self.read_only {
			return Err(ConfigError::ReadOnly { name: self.root.display().to_string() });
		}
		let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
		if self.root.exists() {
			fs::remove_dir_all(&self.root).map_err(|e| ConfigError::Io {
				path: self.root.display().to_string(),
				source: e,
			})?;
		}
		state.cache.clear();
		state.removed = true;
		debug!("removed configuration tree {}", self.root.display());
		Ok(())
	}

	/// Drop cached nodes so the next open re-reads from disk
	pub fn reset(&self) {
		let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
		state.cache.clear();
	}

	pub fn exists(&self) -> bool {
		let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
		!state.removed && self.root.is_dir()
	}
}

/// Base directory for modern-layout configurations
pub fn modern_config_dir() -> PathBuf {
	let base = env::var("XDG_CONFIG_HOME")
		.ok()
		.filter(|v| !v.is_empty())
		.map(PathBuf::from)
		.unwrap_or_else(|| home_dir().join(".config"));
	base.join("pimsync")
}

fn legacy_config_dir(config_name: &str) -> PathBuf {
	home_dir().join(".sync4j").join("evolution").join(config_name)
}

fn home_dir() -> PathBuf {
	env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("."))
}

/// Find the tree for a configuration name.
///
/// The legacy layout wins when its peer node file already exists; new
/// configurations always use the modern layout with the name lowercased.
pub fn discover(config_name: &str) -> (PathBuf, Layout) {
	let legacy = legacy_config_dir(config_name);
	if legacy.join("spds/syncml/config.txt").is_file() {
		return (legacy, Layout::Sync4j);
	}
	(modern_config_dir().join(config_name.to_lowercase()), Layout::Modern)
}

/// All configuration names visible in the modern base directory
pub fn list_configs() -> Vec<String> {
	let mut names = Vec::new();
	if let Ok(read) = fs::read_dir(modern_config_dir()) {
		for dent in read.flatten() {
			if dent.path().join("config.ini").is_file() {
				if let Some(name) = dent.file_name().to_str() {
					names.push(name.to_string());
				}
			}
		}
	}
	// legacy configs keep their original case
	if let Ok(read) = fs::read_dir(home_dir().join(".sync4j").join("evolution")) {
		for dent in read.flatten() {
			if dent.path().join("spds/syncml/config.txt").is_file() {
				if let Some(name) = dent.file_name().to_str() {
					if !names.iter().any(|n| n.eq_ignore_ascii_case(name)) {
						names.push(name.to_string());
					}
				}
			}
		}
	}
	names.sort();
	names
}


// vim: ts=4

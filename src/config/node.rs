//! Key/value configuration nodes and their file persistence
//!
//! A node is an ordered mapping from case-insensitive property name to
//! (value, comment, default flag). The on-disk format is a flat INI-like
//! file, one `key = value` per line. A leading `# ` on a property line marks
//! the value as "default, not user-set": the dumper shows it, reads skip it.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::ConfigError;

/// One property inside a node
#[derive(Debug, Clone)]
struct Entry {
	key: String,
	value: String,
	/// comment lines above the property, without the leading '#'
	comments: Vec<String>,
	/// written by the property layer as a suppressed default
	is_default: bool,
}

/// Contract every configuration node implements.
///
/// Nodes are shared via `Arc` between the tree cache, filters and sources,
/// so all methods take `&self`; implementations use interior mutability.
pub trait ConfigNode: Send + Sync {
	/// Identifier used in error messages (usually the file path)
	fn name(&self) -> String;

	/// Value of a property; the empty string when unset.
	///
	/// Mapping "unset" to a registered default happens in the property
	/// layer, not here.
	fn read(&self, key: &str) -> String;

	/// Set a property
	fn write(&self, key: &str, value: &str) -> Result<(), ConfigError> {
		self.write_full(key, value, None, false)
	}

	/// Set a property together with its comment and default marking.
	///
	/// A comment given on first write persists until the key is removed;
	/// later writes never replace an existing comment.
	fn write_full(
		&self,
		key: &str,
		value: &str,
		comment: Option<&str>,
		is_default: bool,
	) -> Result<(), ConfigError>;

	/// Remove a property; removing an unknown key is not an error
	fn remove(&self, key: &str) -> Result<(), ConfigError>;

	/// All user-set properties in insertion order (defaults are skipped)
	fn read_all(&self) -> Vec<(String, String)>;

	/// True when the key was explicitly written (not just defaulted)
	fn has_key(&self, key: &str) -> bool;

	/// True when the node has a backing file on disk
	fn exists(&self) -> bool;

	fn is_read_only(&self) -> bool {
		false
	}

	/// Write pending modifications to permanent storage
	fn flush(&self) -> Result<(), ConfigError>;
}

fn key_eq(a: &str, b: &str) -> bool {
	a.eq_ignore_ascii_case(b)
}

struct FileState {
	entries: Vec<Entry>,
	modified: bool,
	on_disk: bool,
}

/// Node backed by one INI-like file
pub struct FileConfigNode {
	path: PathBuf,
	read_only: bool,
	state: Mutex<FileState>,
}

impl FileConfigNode {
	/// Open a node file. The file is read once; persistence is deferred
	/// until `flush`.
	pub fn new<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self, ConfigError> {
		let path = path.as_ref().to_path_buf();
		let mut entries = Vec::new();
		let mut on_disk = false;

		if path.is_file() {
			on_disk = true;
			let text = fs::read_to_string(&path)
				.map_err(|e| ConfigError::Io { path: path.display().to_string(), source: e })?;
			entries = parse_node_file(&text);
		}

		Ok(FileConfigNode {
			path,
			read_only,
			state: Mutex::new(FileState { entries, modified: false, on_disk }),
		})
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	fn serialize(entries: &[Entry]) -> String {
		let mut out = String::new();
		for entry in entries {
			for comment in &entry.comments {
				out.push_str("# ");
				out.push_str(comment);
				out.push('\n');
			}
			if entry.is_default {
				out.push_str("# ");
			}
			out.push_str(&entry.key);
			out.push_str(" = ");
			out.push_str(&entry.value);
			out.push('\n');
		}
		out
	}
}

/// Parse the node file format: comment blocks attach to the following
/// property, "# key = value" is a suppressed default, everything else
/// starting with '#' is a plain comment.
fn parse_node_file(text: &str) -> Vec<Entry> {
	let mut entries: Vec<Entry> = Vec::new();
	let mut comments: Vec<String> = Vec::new();

	for line in text.lines() {
		let trimmed = line.trim();
		if trimmed.is_empty() {
			comments.clear();
			continue;
		}

		if let Some(rest) = trimmed.strip_prefix('#') {
			let rest = rest.trim_start();
			if let Some((key, value)) = split_assignment(rest) {
				entries.push(Entry {
					key: key.to_string(),
					value: value.to_string(),
					comments: std::mem::take(&mut comments),
					is_default: true,
				});
			} else {
				comments.push(rest.to_string());
			}
			continue;
		}

		if let Some((key, value)) = split_assignment(trimmed) {
			entries.push(Entry {
				key: key.to_string(),
				value: value.to_string(),
				comments: std::mem::take(&mut comments),
				is_default: false,
			});
		}
		// lines that are neither comments nor assignments are dropped
	}

	entries
}

/// Split "key = value"; keys must not contain '=' or whitespace
fn split_assignment(line: &str) -> Option<(&str, &str)> {
	let eq = line.find('=')?;
	let key = line[..eq].trim();
	let value = line[eq + 1..].trim();
	if key.is_empty() || key.contains(char::is_whitespace) {
		return None;
	}
	Some((key, value))
}

impl ConfigNode for FileConfigNode {
	fn name(&self) -> String {
		self.path.display().to_string()
	}

	fn read(&self, key: &str) -> String {
		let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
		state
			.entries
			.iter()
			.find(|e| !e.is_default && key_eq(&e.key, key))
			.map(|e| e.value.clone())
			.unwrap_or_default()
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

		let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
		state.modified = true;

		if let Some(entry) = state.entries.iter_mut().find(|e| key_eq(&e.key, key)) {
			entry.value = value.to_string();
			entry.is_default = is_default;
			if entry.comments.is_empty() {
				if let Some(c) = comment {
					entry.comments = c.lines().map(|l| l.to_string()).collect();
				}
			}
			return Ok(());
		}

		state.entries.push(Entry {
			key: key.to_string(),
			value: value.to_string(),
			comments: comment.map(|c| c.lines().map(|l| l.to_string()).collect()).unwrap_or_default(),
			is_default,
		});
		Ok(())
	}

	fn remove(&self, key: &str) -> Result<(), ConfigError> {
		if self.read_only {
			return Err(ConfigError::ReadOnly { name: self.name() });
		}
		let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
		let before = state.entries.len();
		state.entries.retain(|e| !key_eq(&e.key, key));
		if state.entries.len() != before {
			state.modified = true;
		}
		Ok(())
	}

	fn read_all(&self) -> Vec<(String, String)> {
		let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
		state
			.entries
			.iter()
			.filter(|e| !e.is_default)
			.map(|e| (e.key.clone(), e.value.clone()))
			.collect()
	}

	fn has_key(&self, key: &str) -> bool {
		let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
		state.entries.iter().any(|e| !e.is_default && key_eq(&e.key, key))
	}

	fn exists(&self) -> bool {
		let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
		state.on_disk || self.path.is_file()
	}

	fn is_read_only(&self) -> bool {
		self.read_only
	}

	fn flush(&self) -> Result<(), ConfigError> {
		let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
		if !state.modified {
			return Ok(());
		}
		if self.read_only {
			return Err(ConfigError::ReadOnly { name: self.name() });
		}

		if let Some(parent) = self.path.parent() {
			fs::create_dir_all(parent)
				.map_err(|e| ConfigError::Io { path: parent.display().to_string(), source: e })?;
		}
		fs::write(&self.path, Self::serialize(&state.entries))
			.map_err(|e| ConfigError::Io { path: self.path.display().to_string(), source: e })?;

		state.modified = false;
		state.on_disk = true;
		Ok(())
	}
}

/// In-memory node that is never persisted.
///
/// Stands in for on-disk nodes after a tree has been removed and backs
/// per-session transient configurations.
pub struct VolatileConfigNode {
	label: String,
	state: Mutex<Vec<Entry>>,
}

impl VolatileConfigNode {
	pub fn new(label: &str) -> Self {
		VolatileConfigNode { label: label.to_string(), state: Mutex::new(Vec::new()) }
	}
}

impl ConfigNode for VolatileConfigNode {
	fn name(&self) -> String {
		format!("{} (volatile)", self.label)
	}

	fn read(&self, key: &str) -> String {
		let entries = self.state.lock().unwrap_or_else(|e| e.into_inner());
		entries
			.iter()
			.find(|e| !e.is_default && key_eq(&e.key, key))
			.map(|e| e.value.clone())
			.unwrap_or_default()
	}

	fn write_full(
		&self,
		key: &str,
		value: &str,
		comment: Option<&str>,
		is_default: bool,
	) -> Result<(), ConfigError> {
		let mut entries = self.state.lock().unwrap_or_else(|e| e.into_inner());
		if let Some(entry) = entries.iter_mut().find(|e| key_eq(&e.key, key)) {
			entry.value = value.to_string();
			entry.is_default = is_default;
			return Ok(());
		}
		entries.push(Entry {
			key: key.to_string(),
			value: value.to_string(),
			comments: comment.map(|c| c.lines().map(|l| l.to_string()).collect()).unwrap_or_default(),
			is_default,
		});
		Ok(())
	}

	fn remove(&self, key: &str) -> Result<(), ConfigError> {
		let mut entries = self.state.lock().unwrap_or_else(|e| e.into_inner());
		entries.retain(|e| !key_eq(&e.key, key));
		Ok(())
	}

	fn read_all(&self) -> Vec<(String, String)> {
		let entries = self.state.lock().unwrap_or_else(|e| e.into_inner());
		entries
			.iter()
			.filter(|e| !e.is_default)
			.map(|e| (e.key.clone(), e.value.clone()))
			.collect()
	}

	fn has_key(&self, key: &str) -> bool {
		let entries = self.state.lock().unwrap_or_else(|e| e.into_inner());
		entries.iter().any(|e| !e.is_default && key_eq(&e.key, key))
	}

	fn exists(&self) -> bool {
		true
	}

	fn flush(&self) -> Result<(), ConfigError> {
		Ok(())
	}
}

/// Names of child directories that contain node files, merged from disk and
/// a set of not-yet-flushed in-memory paths
pub(crate) fn list_children(
	dir: &Path,
	pending: impl Iterator<Item = PathBuf>,
	prefix: &Path,
) -> Vec<String> {
	let mut names: HashSet<String> = HashSet::new();

	if let Ok(read) = fs::read_dir(dir) {
		for dent in read.flatten() {
			if dent.path().is_dir() {
				if let Some(name) = dent.file_name().to_str() {
					names.insert(name.to_string());
				}
			}
		}
	}

	for path in pending {
		if let Ok(rest) = path.strip_prefix(prefix) {
			let mut parts = rest.components();
			if let Some(std::path::Component::Normal(first)) = parts.next() {
				// only count it when a node file lives deeper inside
				if parts.next().is_some() {
					if let Some(name) = first.to_str() {
						names.insert(name.to_string());
					}
				}
			}
		}
	}

	let mut out: Vec<String> = names.into_iter().collect();
	out.sort();
	out
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	#[test]
	fn test_read_missing_returns_empty() {
		let dir = TempDir::new().unwrap();
		let node = FileConfigNode::new(dir.path().join("config.ini"), false).unwrap();
		assert_eq!(node.read("syncURL"), "");
		assert!(!node.exists());
	}

	#[test]
	fn test_write_read_flush_cycle() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("config.ini");

		let node = FileConfigNode::new(&path, false).unwrap();
		node.write_full("syncURL", "http://sync.example.com", Some("peer URL"), false).unwrap();
		node.write("username", "me").unwrap();
		assert_eq!(node.read("syncurl"), "http://sync.example.com");
		node.flush().unwrap();

		let reread = FileConfigNode::new(&path, false).unwrap();
		assert_eq!(reread.read("syncURL"), "http://sync.example.com");
		assert_eq!(reread.read("USERNAME"), "me");
		// insertion order preserved
		let all = reread.read_all();
		assert_eq!(all[0].0, "syncURL");
		assert_eq!(all[1].0, "username");
		// comment survived the round trip
		let text = fs::read_to_string(&path).unwrap();
		assert!(text.contains("# peer URL"));
	}

	#[test]
	fn test_default_marked_values_invisible_to_read() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("config.ini");

		let node = FileConfigNode::new(&path, false).unwrap();
		node.write_full("logLevel", "2", None, true).unwrap();
		assert_eq!(node.read("logLevel"), "");
		assert!(!node.has_key("logLevel"));
		node.flush().unwrap();

		let text = fs::read_to_string(&path).unwrap();
		assert!(text.contains("# logLevel = 2"));

		let reread = FileConfigNode::new(&path, false).unwrap();
		assert_eq!(reread.read("logLevel"), "");

		// explicit write overrides the default marking
		reread.write("logLevel", "4").unwrap();
		assert_eq!(reread.read("logLevel"), "4");
		assert!(reread.has_key("logLevel"));
	}

	#[test]
	fn test_read_only_rejects_mutation() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("config.ini");
		fs::write(&path, "a = 1\n").unwrap();

		let node = FileConfigNode::new(&path, true).unwrap();
		assert_eq!(node.read("a"), "1");
		assert!(matches!(node.write("a", "2"), Err(ConfigError::ReadOnly { .. })));
		assert!(matches!(node.remove("a"), Err(ConfigError::ReadOnly { .. })));
	}

	#[test]
	fn test_remove_then_rewrite_drops_comment() {
		let dir = TempDir::new().unwrap();
		let node = FileConfigNode::new(dir.path().join("c.ini"), false).unwrap();
		node.write_full("k", "v", Some("about k"), false).unwrap();
		node.remove("k").unwrap();
		node.write("k", "v2").unwrap();
		node.flush().unwrap();
		let text = fs::read_to_string(dir.path().join("c.ini")).unwrap();
		assert!(!text.contains("about k"));
		assert!(text.contains("k = v2"));
	}

	#[test]
	fn test_volatile_node_never_persists() {
		let node = VolatileConfigNode::new("session");
		node.write("a", "1").unwrap();
		assert_eq!(node.read("A"), "1");
		node.flush().unwrap();
		assert!(node.exists());
	}
}

// vim: ts=4

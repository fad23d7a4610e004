//! Sync sources: the backend contract and the generic layers above it
//!
//! A backend only has to enumerate items with revision tokens and do CRUD;
//! `tracking` turns that into correct add/update/delete classification for
//! every sync mode, `backup` adds snapshot/restore on top of the same
//! primitives.

pub mod backup;
pub mod memory;
pub mod tracking;

use std::collections::BTreeMap;
use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::{ConfigError, SourceError};
use crate::status::SyncMode;

/// Map from item UID to revision token
pub type RevisionMap = BTreeMap<String, String>;

/// Result of a backend insert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertResult {
	pub uid: String,
	pub revision: String,
	/// the backend merged the data into an existing item
	pub merged: bool,
}

/// The only contract a data store must implement.
///
/// UIDs are opaque non-empty strings that stay stable across edits; the
/// revision token is opaque and changes iff the item content changes.
#[async_trait]
pub trait SyncSource: Send {
	/// Every item currently in the store
	async fn list_all(&mut self) -> Result<RevisionMap, SourceError>;

	/// Create (`uid` = None) or overwrite (`uid` = Some) an item
	async fn insert(&mut self, uid: Option<&str>, item: &[u8]) -> Result<InsertResult, SourceError>;

	/// Raw item content
	async fn read_item(&mut self, uid: &str) -> Result<Vec<u8>, SourceError>;

	async fn delete_item(&mut self, uid: &str) -> Result<(), SourceError>;

	/// Commit pending changes to the store
	async fn flush(&mut self) -> Result<(), SourceError>;
}

/// Everything needed to instantiate and describe one source
#[derive(Debug, Clone, Default)]
pub struct SourceDescriptor {
	pub name: String,
	/// backend kind, first field of the "type" property
	pub backend: String,
	pub mime_type: String,
	pub mime_version: String,
	/// send our format even when the peer prefers another one
	pub force_format: bool,
	/// local database name or URI
	pub database: String,
	pub database_user: String,
	pub database_password: String,
	/// database URI on the peer
	pub uri: String,
	pub mode: SyncMode,
}

impl SourceDescriptor {
	/// Parse the "type" property: `backend[:mime[:version]][!]`
	pub fn parse_type(&mut self, type_value: &str) -> Result<(), ConfigError> {
		let mut value = type_value.trim();
		if value.is_empty() || value == "select backend" {
			return Err(ConfigError::SourceUnusable { source: self.name.clone() });
		}
		if let Some(stripped) = value.strip_suffix('!') {
			self.force_format = true;
			value = stripped;
		}
		let mut fields = value.splitn(3, ':');
		self.backend = fields.next().unwrap_or_default().to_string();
		self.mime_type = fields.next().unwrap_or_default().to_string();
		self.mime_version = fields.next().unwrap_or_default().to_string();
		if self.backend.is_empty() {
			return Err(ConfigError::SourceUnusable { source: self.name.clone() });
		}
		Ok(())
	}
}

/// Constructor for one backend kind
pub type BackendFactory = fn(&SourceDescriptor) -> Result<Box<dyn SyncSource>, SourceError>;

/// Maps backend kinds to factories.
///
/// Real backends (Evolution, files, databases) are separate collaborators
/// that register themselves here; the built-in "memory" backend exists for
/// tests and local demos.
pub struct BackendRegistry {
	factories: HashMap<String, BackendFactory>,
}

impl BackendRegistry {
	pub fn new() -> Self {
		let mut registry = BackendRegistry { factories: HashMap::new() };
		registry.register("memory", memory::create_backend);
		registry
	}

	pub fn register(&mut self, kind: &str, factory: BackendFactory) {
		self.factories.insert(kind.to_lowercase(), factory);
	}

	pub fn create(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn SyncSource>, SourceError> {
		match self.factories.get(&descriptor.backend.to_lowercase()) {
			Some(factory) => factory(descriptor),
			None => Err(SourceError::Backend {
				message: format!(
					"no backend \"{}\" for source \"{}\"",
					descriptor.backend, descriptor.name
				),
			}),
		}
	}

	pub fn kinds(&self) -> Vec<String> {
		let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
		kinds.sort();
		kinds
	}
}

impl Default for BackendRegistry {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_type_full() {
		let mut desc = SourceDescriptor { name: "addressbook".to_string(), ..Default::default() };
		desc.parse_type("addressbook:text/vcard:3.0!").unwrap();
		assert_eq!(desc.backend, "addressbook");
		assert_eq!(desc.mime_type, "text/vcard");
		assert_eq!(desc.mime_version, "3.0");
		assert!(desc.force_format);
	}

	#[test]
	fn test_parse_type_backend_only() {
		let mut desc = SourceDescriptor { name: "memo".to_string(), ..Default::default() };
		desc.parse_type("memory").unwrap();
		assert_eq!(desc.backend, "memory");
		assert_eq!(desc.mime_type, "");
		assert!(!desc.force_format);
	}

	#[test]
	fn test_parse_type_unset_is_unusable() {
		let mut desc = SourceDescriptor { name: "memo".to_string(), ..Default::default() };
		assert!(desc.parse_type("select backend").is_err());
		assert!(desc.parse_type("").is_err());
	}

	#[test]
	fn test_registry_knows_memory_backend() {
		let registry = BackendRegistry::new();
		assert_eq!(registry.kinds(), vec!["memory".to_string()]);

		let mut desc = SourceDescriptor { name: "memo".to_string(), ..Default::default() };
		desc.parse_type("memory").unwrap();
		assert!(registry.create(&desc).is_ok());

		desc.backend = "carrier-pigeon".to_string();
		assert!(registry.create(&desc).is_err());
	}
}

// vim: ts=4

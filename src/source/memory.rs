//! In-memory backend
//!
//! Used by unit tests, the loopback demo daemon and anything else that needs
//! a store without external dependencies. Several `MemorySource` handles can
//! share one store, which mimics a database modified behind the engine's
//! back.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::SourceError;
use crate::source::{InsertResult, RevisionMap, SourceDescriptor, SyncSource};

#[derive(Debug, Default)]
struct MemoryStore {
	items: BTreeMap<String, (String, Vec<u8>)>,
	next_uid: u64,
	next_rev: u64,
	/// fail the next operation, for error path tests
	poisoned: bool,
}

/// Shared handle to a memory store
#[derive(Debug, Clone, Default)]
pub struct MemoryStoreHandle {
	store: Arc<Mutex<MemoryStore>>,
}

impl MemoryStoreHandle {
	pub fn new() -> Self {
		Self::default()
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, MemoryStore> {
		self.store.lock().unwrap_or_else(|e| e.into_inner())
	}

	/// Put an item directly into the store, bumping its revision
	pub fn put(&self, uid: &str, item: &[u8]) {
		let mut store = self.lock();
		store.next_rev += 1;
		let rev = format!("rev-{}", store.next_rev);
		store.items.insert(uid.to_string(), (rev, item.to_vec()));
	}

	pub fn remove(&self, uid: &str) {
		self.lock().items.remove(uid);
	}

	pub fn get(&self, uid: &str) -> Option<Vec<u8>> {
		self.lock().items.get(uid).map(|(_, data)| data.clone())
	}

	pub fn revisions(&self) -> RevisionMap {
		self.lock()
			.items
			.iter()
			.map(|(uid, (rev, _))| (uid.clone(), rev.clone()))
			.collect()
	}

	pub fn len(&self) -> usize {
		self.lock().items.len()
	}

	pub fn is_empty(&self) -> bool {
		self.lock().items.is_empty()
	}

	/// Make the next backend operation fail
	pub fn poison(&self) {
		self.lock().poisoned = true;
	}

	pub fn source(&self) -> MemorySource {
		MemorySource { store: self.clone() }
	}
}

/// Backend over a [`MemoryStoreHandle`]
#[derive(Debug, Clone)]
pub struct MemorySource {
	store: MemoryStoreHandle,
}

impl MemorySource {
	pub fn new() -> Self {
		MemoryStoreHandle::new().source()
	}

	pub fn handle(&self) -> MemoryStoreHandle {
		self.store.clone()
	}

	fn check_poison(store: &mut MemoryStore) -> Result<(), SourceError> {
		if store.poisoned {
			store.poisoned = false;
			return Err(SourceError::Backend { message: "memory store poisoned".to_string() });
		}
		Ok(())
	}
}

impl Default for MemorySource {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl SyncSource for MemorySource {
	async fn list_all(&mut self) -> Result<RevisionMap, SourceError> {
		let mut store = self.store.lock();
		Self::check_poison(&mut store)?;
		Ok(store
			.items
			.iter()
			.map(|(uid, (rev, _))| (uid.clone(), rev.clone()))
			.collect())
	}

	async fn insert(&mut self, uid: Option<&str>, item: &[u8]) -> Result<InsertResult, SourceError> {
		let mut store = self.store.lock();
		Self::check_poison(&mut store)?;

		// adding an identical item again counts as a merge
		if uid.is_none() {
			if let Some((existing_uid, (rev, _))) =
				store.items.iter().find(|(_, (_, data))| data == item)
			{
				return Ok(InsertResult {
					uid: existing_uid.clone(),
					revision: rev.clone(),
					merged: true,
				});
			}
		}

		let uid = match uid {
			Some(u) => u.to_string(),
			None => {
				store.next_uid += 1;
				format!("mem-{}", store.next_uid)
			}
		};
		store.next_rev += 1;
		let revision = format!("rev-{}", store.next_rev);
		store.items.insert(uid.clone(), (revision.clone(), item.to_vec()));
		Ok(InsertResult { uid, revision, merged: false })
	}

	async fn read_item(&mut self, uid: &str) -> Result<Vec<u8>, SourceError> {
		let mut store = self.store.lock();
		Self::check_poison(&mut store)?;
		store
			.items
			.get(uid)
			.map(|(_, data)| data.clone())
			.ok_or_else(|| SourceError::NotFound { uid: uid.to_string() })
	}

	async fn delete_item(&mut self, uid: &str) -> Result<(), SourceError> {
		let mut store = self.store.lock();
		Self::check_poison(&mut store)?;
		store
			.items
			.remove(uid)
			.map(|_| ())
			.ok_or_else(|| SourceError::NotFound { uid: uid.to_string() })
	}

	async fn flush(&mut self) -> Result<(), SourceError> {
		Ok(())
	}
}

pub(crate) fn create_backend(
	_descriptor: &SourceDescriptor,
) -> Result<Box<dyn SyncSource>, SourceError> {
	Ok(Box::new(MemorySource::new()))
}


// vim: ts=4

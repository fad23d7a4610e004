//! Change tracking on top of an arbitrary backend
//!
//! The backend only reports "these UIDs exist with these revision tokens";
//! this layer compares that against the tracking node of the active peer and
//! derives the new/updated/deleted sets a sync needs. The tracking node is
//! only flushed after a successful sync; a failed sync leaves it untouched,
//! which forces the drift to be corrected by a slow sync later.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::config::node::ConfigNode;
use crate::config::prefix::PrefixConfigNode;
use crate::config::safe::SafeConfigNode;
use crate::error::SourceError;
use crate::source::{SourceDescriptor, SyncSource};
use crate::status::{SyncMode, SyncStatus};

/// Item sets derived by [`TrackingSource::begin_sync`]
#[derive(Debug, Default, Clone)]
pub struct ChangeSet {
	pub new_items: BTreeSet<String>,
	pub updated: BTreeSet<String>,
	pub deleted: BTreeSet<String>,
	/// every live item; only kept for modes that send everything
	pub all: BTreeSet<String>,
}

impl ChangeSet {
	pub fn clear(&mut self) {
		self.new_items.clear();
		self.updated.clear();
		self.deleted.clear();
		self.all.clear();
	}

	pub fn total_changes(&self) -> usize {
		self.new_items.len() + self.updated.len() + self.deleted.len()
	}
}

/// A backend store turned into a syncable source
pub struct TrackingSource {
	descriptor: SourceDescriptor,
	backend: Box<dyn SyncSource>,
	/// per-peer uid -> revision map, stored under `item-` with escaping
	tracking: Arc<dyn ConfigNode>,
	mode: SyncMode,
	changes: ChangeSet,
	failed: bool,
}

impl TrackingSource {
	pub fn new(
		descriptor: SourceDescriptor,
		backend: Box<dyn SyncSource>,
		tracking_node: Arc<dyn ConfigNode>,
	) -> Self {
		let tracking = Arc::new(PrefixConfigNode::new(
			"item-",
			Arc::new(SafeConfigNode::new(tracking_node)) as Arc<dyn ConfigNode>,
		)) as Arc<dyn ConfigNode>;
		let mode = descriptor.mode;
		TrackingSource {
			descriptor,
			backend,
			tracking,
			mode,
			changes: ChangeSet::default(),
			failed: false,
		}
	}

	pub fn name(&self) -> &str {
		&self.descriptor.name
	}

	pub fn descriptor(&self) -> &SourceDescriptor {
		&self.descriptor
	}

	pub fn mode(&self) -> SyncMode {
		self.mode
	}

	pub fn changes(&self) -> &ChangeSet {
		&self.changes
	}

	pub fn has_failed(&self) -> bool {
		self.failed
	}

	pub fn set_failed(&mut self) {
		self.failed = true;
	}

	/// Compare backend content against the tracking node and build the
	/// change sets for the given mode.
	pub async fn begin_sync(&mut self, mode: SyncMode) -> Result<&ChangeSet, SourceError> {
		self.mode = mode;
		self.changes.clear();
		match self.begin_sync_inner(mode).await {
			Ok(()) => Ok(&self.changes),
			Err(e) => {
				self.failed = true;
				Err(e)
			}
		}
	}

	async fn begin_sync_inner(&mut self, mode: SyncMode) -> Result<(), SourceError> {
		let (need_all, need_partial, delete_local) = mode.change_tracking();
		let live = self.backend.list_all().await?;

		// slow sync or refresh: drop the tracking set, it is rebuilt from
		// the current content below
		if !need_partial {
			for (uid, _) in self.tracking.read_all() {
				self.changes.deleted.insert(uid.clone());
				self.tracking.remove(&uid)?;
			}
		}

		// refresh-from-client cannot be told apart from a slow sync here,
		// so empty revisions pass for both
		let from_client = need_all && !need_partial && !delete_local;

		for (uid, revision) in &live {
			if uid.is_empty() {
				return Err(SourceError::MissingUid);
			}
			if revision.is_empty() && !from_client {
				return Err(SourceError::MissingRevision { uid: uid.clone() });
			}

			if delete_local {
				self.backend.delete_item(uid).await?;
				continue;
			}

			// full list needed to find deleted items
			self.changes.all.insert(uid.clone());

			if need_partial {
				let tracked = self.tracking.read(uid);
				if tracked.is_empty() {
					self.changes.new_items.insert(uid.clone());
					self.tracking.write(uid, revision)?;
				} else if &tracked != revision {
					self.changes.updated.insert(uid.clone());
					self.tracking.write(uid, revision)?;
				}
			} else {
				// seed the tracking set so the next incremental sync has
				// a baseline
				self.tracking.write(uid, revision)?;
			}
		}

		if need_partial {
			for (uid, _) in self.tracking.read_all() {
				if !self.changes.all.contains(&uid) {
					self.changes.deleted.insert(uid.clone());
					self.tracking.remove(&uid)?;
				}
			}
		}

		if !need_all {
			self.changes.all.clear();
		}

		Ok(())
	}

	/// Persist backend changes; the tracking node is only flushed when the
	/// source has not failed.
	pub async fn end_sync(&mut self) -> Result<(), SourceError> {
		if let Err(e) = self.backend.flush().await {
			self.failed = true;
			return Err(e);
		}
		if !self.failed {
			self.tracking.flush()?;
		}
		Ok(())
	}

	/// Add an item the peer sent. Returns the new UID and `DataMerged`
	/// when the backend folded it into an existing item.
	pub async fn add(&mut self, item: &[u8]) -> Result<(String, SyncStatus), SourceError> {
		match self.add_inner(item).await {
			Ok(res) => Ok(res),
			Err(e) => {
				self.failed = true;
				Err(e)
			}
		}
	}

	async fn add_inner(&mut self, item: &[u8]) -> Result<(String, SyncStatus), SourceError> {
		let res = self.backend.insert(None, item).await?;
		if res.uid.is_empty() || res.revision.is_empty() {
			return Err(SourceError::Backend { message: "could not add item".to_string() });
		}
		self.tracking.write(&res.uid, &res.revision)?;
		let status = if res.merged { SyncStatus::DataMerged } else { SyncStatus::Ok };
		Ok((res.uid, status))
	}

	/// Update an existing item. The backend may switch the UID (merges);
	/// the stale tracking entry is removed then.
	pub async fn update(&mut self, uid: &str, item: &[u8]) -> Result<(String, SyncStatus), SourceError> {
		match self.update_inner(uid, item).await {
			Ok(res) => Ok(res),
			Err(e) => {
				self.failed = true;
				Err(e)
			}
		}
	}

	async fn update_inner(
		&mut self,
		uid: &str,
		item: &[u8],
	) -> Result<(String, SyncStatus), SourceError> {
		let res = self.backend.insert(Some(uid), item).await?;
		if res.uid != uid {
			self.tracking.remove(uid)?;
		}
		if res.uid.is_empty() || res.revision.is_empty() {
			return Err(SourceError::Backend { message: "could not update item".to_string() });
		}
		self.tracking.write(&res.uid, &res.revision)?;
		let status = if res.merged { SyncStatus::DataMerged } else { SyncStatus::Ok };
		Ok((res.uid, status))
	}

	/// Delete an item on the peer's request
	pub async fn remove(&mut self, uid: &str) -> Result<SyncStatus, SourceError> {
		match self.remove_inner(uid).await {
			Ok(()) => Ok(SyncStatus::Ok),
			Err(e) => {
				self.failed = true;
				Err(e)
			}
		}
	}

	async fn remove_inner(&mut self, uid: &str) -> Result<(), SourceError> {
		self.backend.delete_item(uid).await?;
		self.tracking.remove(uid)?;
		Ok(())
	}

	pub async fn read_item(&mut self, uid: &str) -> Result<Vec<u8>, SourceError> {
		self.backend.read_item(uid).await
	}

	/// Current uid -> revision entries in the tracking node
	pub fn tracked(&self) -> Vec<(String, String)> {
		self.tracking.read_all()
	}

	pub(crate) fn backend_mut(&mut self) -> &mut dyn SyncSource {
		self.backend.as_mut()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::node::{FileConfigNode, VolatileConfigNode};
	use crate::source::memory::MemoryStoreHandle;
	use tempfile::TempDir;

	fn source_with(handle: &MemoryStoreHandle) -> TrackingSource {
		let descriptor = SourceDescriptor {
			name: "addressbook".to_string(),
			backend: "memory".to_string(),
			mode: SyncMode::TwoWay,
			..Default::default()
		};
		TrackingSource::new(
			descriptor,
			Box::new(handle.source()),
			Arc::new(VolatileConfigNode::new("tracking")),
		)
	}

	fn tracked_pairs(source: &TrackingSource) -> Vec<(String, String)> {
		let mut pairs = source.tracked();
		pairs.sort();
		pairs
	}

	#[tokio::test]
	async fn test_fresh_two_way_detects_add() {
		let handle = MemoryStoreHandle::new();
		handle.put("A", b"first");
		let mut source = source_with(&handle);

		let changes = source.begin_sync(SyncMode::TwoWay).await.unwrap();
		assert_eq!(changes.new_items.iter().collect::<Vec<_>>(), vec!["A"]);
		assert!(changes.updated.is_empty());
		assert!(changes.deleted.is_empty());

		source.end_sync().await.unwrap();
		let revs = handle.revisions();
		assert_eq!(tracked_pairs(&source), vec![("A".to_string(), revs["A"].clone())]);
	}

	#[tokio::test]
	async fn test_revision_change_detected_as_update() {
		let handle = MemoryStoreHandle::new();
		handle.put("A", b"first");
		let mut source = source_with(&handle);
		source.begin_sync(SyncMode::TwoWay).await.unwrap();
		source.end_sync().await.unwrap();

		handle.put("A", b"second");
		let changes = source.begin_sync(SyncMode::TwoWay).await.unwrap();
		assert!(changes.new_items.is_empty());
		assert_eq!(changes.updated.iter().collect::<Vec<_>>(), vec!["A"]);

		source.end_sync().await.unwrap();
		assert_eq!(source.tracked()[0].1, handle.revisions()["A"]);
	}

	#[tokio::test]
	async fn test_deletion_detected() {
		let handle = MemoryStoreHandle::new();
		handle.put("A", b"a");
		handle.put("B", b"b");
		let mut source = source_with(&handle);
		source.begin_sync(SyncMode::TwoWay).await.unwrap();
		source.end_sync().await.unwrap();

		handle.remove("B");
		let changes = source.begin_sync(SyncMode::TwoWay).await.unwrap();
		assert_eq!(changes.deleted.iter().collect::<Vec<_>>(), vec!["B"]);

		source.end_sync().await.unwrap();
		assert_eq!(tracked_pairs(&source).len(), 1);
		assert_eq!(tracked_pairs(&source)[0].0, "A");
	}

	#[tokio::test]
	async fn test_refresh_from_server_wipes_local() {
		let handle = MemoryStoreHandle::new();
		handle.put("A", b"a");
		let mut source = source_with(&handle);
		source.begin_sync(SyncMode::TwoWay).await.unwrap();
		source.end_sync().await.unwrap();

		source.begin_sync(SyncMode::RefreshFromServer).await.unwrap();
		assert!(handle.is_empty(), "local item must be deleted");
		source.end_sync().await.unwrap();
		assert!(source.tracked().is_empty());
	}

	#[tokio::test]
	async fn test_slow_sync_seeds_tracking_without_classification() {
		let handle = MemoryStoreHandle::new();
		handle.put("A", b"a");
		handle.put("B", b"b");
		let mut source = source_with(&handle);

		let changes = source.begin_sync(SyncMode::Slow).await.unwrap();
		assert!(changes.new_items.is_empty());
		assert!(changes.updated.is_empty());
		assert_eq!(changes.all.len(), 2);

		source.end_sync().await.unwrap();
		assert_eq!(source.tracked().len(), 2);
	}

	#[tokio::test]
	async fn test_empty_revision_only_in_refresh_from_client() {
		// the memory backend never produces empty revisions, so fake a
		// backend that does
		struct EmptyRev;
		#[async_trait::async_trait]
		impl SyncSource for EmptyRev {
			async fn list_all(&mut self) -> Result<crate::source::RevisionMap, SourceError> {
				let mut map = crate::source::RevisionMap::new();
				map.insert("X".to_string(), String::new());
				Ok(map)
			}
			async fn insert(
				&mut self,
				_uid: Option<&str>,
				_item: &[u8],
			) -> Result<crate::source::InsertResult, SourceError> {
				unreachable!()
			}
			async fn read_item(&mut self, _uid: &str) -> Result<Vec<u8>, SourceError> {
				unreachable!()
			}
			async fn delete_item(&mut self, _uid: &str) -> Result<(), SourceError> {
				unreachable!()
			}
			async fn flush(&mut self) -> Result<(), SourceError> {
				Ok(())
			}
		}

		let descriptor = SourceDescriptor { name: "x".to_string(), ..Default::default() };
		let mut source = TrackingSource::new(
			descriptor,
			Box::new(EmptyRev),
			Arc::new(VolatileConfigNode::new("tracking")),
		);

		// allowed for refresh-from-client
		assert!(source.begin_sync(SyncMode::RefreshFromClient).await.is_ok());

		// rejected for two-way, diagnostic names the uid
		let descriptor = SourceDescriptor { name: "x".to_string(), ..Default::default() };
		let mut source = TrackingSource::new(
			descriptor,
			Box::new(EmptyRev),
			Arc::new(VolatileConfigNode::new("tracking")),
		);
		let err = source.begin_sync(SyncMode::TwoWay).await.unwrap_err();
		assert!(err.to_string().contains("X"));
		assert!(source.has_failed());
	}

	#[tokio::test]
	async fn test_add_update_delete_maintain_tracking() {
		let handle = MemoryStoreHandle::new();
		let mut source = source_with(&handle);
		source.begin_sync(SyncMode::TwoWay).await.unwrap();

		let (uid, status) = source.add(b"new item").await.unwrap();
		assert_eq!(status, SyncStatus::Ok);
		assert_eq!(source.tracked().len(), 1);

		let (uid2, _) = source.update(&uid, b"changed").await.unwrap();
		assert_eq!(uid, uid2);
		assert_eq!(source.tracked()[0].1, handle.revisions()[&uid]);

		assert_eq!(source.remove(&uid).await.unwrap(), SyncStatus::Ok);
		assert!(source.tracked().is_empty());
		assert!(handle.is_empty());
	}

	#[tokio::test]
	async fn test_merged_add_reports_data_merged() {
		let handle = MemoryStoreHandle::new();
		let mut source = source_with(&handle);
		source.add(b"dup").await.unwrap();
		let (_, status) = source.add(b"dup").await.unwrap();
		assert_eq!(status, SyncStatus::DataMerged);
	}

	#[tokio::test]
	async fn test_failed_sync_leaves_tracking_file_untouched() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("tracking.ini");

		let handle = MemoryStoreHandle::new();
		handle.put("A", b"a");
		{
			let node = Arc::new(FileConfigNode::new(&path, false).unwrap());
			let descriptor = SourceDescriptor { name: "s".to_string(), ..Default::default() };
			let mut source =
				TrackingSource::new(descriptor, Box::new(handle.source()), node);
			source.begin_sync(SyncMode::TwoWay).await.unwrap();
			source.end_sync().await.unwrap();
		}
		let before = std::fs::read_to_string(&path).unwrap();

		handle.put("B", b"b");
		{
			let node = Arc::new(FileConfigNode::new(&path, false).unwrap());
			let descriptor = SourceDescriptor { name: "s".to_string(), ..Default::default() };
			let mut source =
				TrackingSource::new(descriptor, Box::new(handle.source()), node);
			source.begin_sync(SyncMode::TwoWay).await.unwrap();
			source.set_failed();
			source.end_sync().await.unwrap();
		}
		let after = std::fs::read_to_string(&path).unwrap();
		assert_eq!(before, after, "failed sync must not flush tracking");
	}
}

// vim: ts=4

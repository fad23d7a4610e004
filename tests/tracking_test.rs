/// Integration tests for change tracking against file-backed tracking
/// nodes: the full add/update/delete detection cycle with real
/// persistence, plus backup and restore.
use std::sync::Arc;

use tempfile::TempDir;

use pimsync::config::node::FileConfigNode;
use pimsync::source::backup::{backup, restore};
use pimsync::source::memory::MemoryStoreHandle;
use pimsync::source::tracking::TrackingSource;
use pimsync::source::SourceDescriptor;
use pimsync::status::SyncMode;

fn file_tracked_source(path: &std::path::Path, handle: &MemoryStoreHandle) -> TrackingSource {
	let node = Arc::new(FileConfigNode::new(path, false).unwrap());
	TrackingSource::new(
		SourceDescriptor { name: "addressbook".to_string(), ..Default::default() },
		Box::new(handle.source()),
		node,
	)
}

#[tokio::test]
async fn test_incremental_cycle_across_restarts() {
	let dir = TempDir::new().unwrap();
	let tracking = dir.path().join(".other_peer.ini");
	let store = MemoryStoreHandle::new();

	// first sync: everything is new
	store.put("A", b"alpha");
	store.put("B", b"beta");
	{
		let mut source = file_tracked_source(&tracking, &store);
		let changes = source.begin_sync(SyncMode::TwoWay).await.unwrap();
		assert_eq!(changes.new_items.len(), 2);
		source.end_sync().await.unwrap();
	}
	assert!(tracking.is_file(), "tracking node must be flushed");

	// second sync, fresh objects as after a daemon restart: only the
	// modified item shows up
	store.put("A", b"alpha2");
	{
		let mut source = file_tracked_source(&tracking, &store);
		let changes = source.begin_sync(SyncMode::TwoWay).await.unwrap();
		assert!(changes.new_items.is_empty());
		assert_eq!(changes.updated.iter().collect::<Vec<_>>(), vec!["A"]);
		assert!(changes.deleted.is_empty());
		source.end_sync().await.unwrap();
	}

	// third sync: deletion detected
	store.remove("B");
	{
		let mut source = file_tracked_source(&tracking, &store);
		let changes = source.begin_sync(SyncMode::TwoWay).await.unwrap();
		assert_eq!(changes.deleted.iter().collect::<Vec<_>>(), vec!["B"]);
		source.end_sync().await.unwrap();
	}

	// quiescent sync: nothing at all
	{
		let mut source = file_tracked_source(&tracking, &store);
		let changes = source.begin_sync(SyncMode::TwoWay).await.unwrap();
		assert_eq!(changes.total_changes(), 0);
		source.end_sync().await.unwrap();
	}
}

#[tokio::test]
async fn test_tracking_uids_with_hostile_characters() {
	let dir = TempDir::new().unwrap();
	let tracking = dir.path().join(".other_peer.ini");
	let store = MemoryStoreHandle::new();
	store.put("pas-cal@example.com, weird = uid!", b"data");

	{
		let mut source = file_tracked_source(&tracking, &store);
		source.begin_sync(SyncMode::TwoWay).await.unwrap();
		source.end_sync().await.unwrap();
	}

	// survives the file round trip intact
	let mut source = file_tracked_source(&tracking, &store);
	let changes = source.begin_sync(SyncMode::TwoWay).await.unwrap();
	assert_eq!(changes.total_changes(), 0);
	let tracked = source.tracked();
	assert_eq!(tracked.len(), 1);
	assert_eq!(tracked[0].0, "pas-cal@example.com, weird = uid!");
}

#[tokio::test]
async fn test_refresh_from_server_then_incremental() {
	let dir = TempDir::new().unwrap();
	let tracking = dir.path().join(".other_peer.ini");
	let store = MemoryStoreHandle::new();
	store.put("OLD", b"stale");

	{
		let mut source = file_tracked_source(&tracking, &store);
		source.begin_sync(SyncMode::RefreshFromServer).await.unwrap();
		// peer data arrives
		source.update("NEW", b"fresh").await.unwrap();
		source.end_sync().await.unwrap();
	}
	assert!(store.get("OLD").is_none());
	assert_eq!(store.get("NEW").unwrap(), b"fresh");

	// next incremental run sees a clean baseline
	let mut source = file_tracked_source(&tracking, &store);
	let changes = source.begin_sync(SyncMode::TwoWay).await.unwrap();
	assert_eq!(changes.total_changes(), 0);
}

#[tokio::test]
async fn test_backup_restore_through_files() {
	let dir = TempDir::new().unwrap();
	let store = MemoryStoreHandle::new();
	store.put("A", b"BEGIN:VCARD\nFN:Ada\nEND:VCARD");
	store.put("B", b"BEGIN:VCARD\nFN:Bob\nEND:VCARD");

	let tracking = dir.path().join(".other_peer.ini");
	let mut source = file_tracked_source(&tracking, &store);

	let backup_dir = dir.path().join("backup/addressbook");
	let index = FileConfigNode::new(dir.path().join("backup/addressbook.ini"), false).unwrap();
	let report = backup(&mut source, &backup_dir, &index).await.unwrap();
	assert_eq!(report.num_items, 2);

	// wreck the store, then restore
	store.remove("A");
	store.put("B", b"tampered");
	store.put("C", b"extra");

	let index = FileConfigNode::new(dir.path().join("backup/addressbook.ini"), false).unwrap();
	let report = restore(&mut source, &backup_dir, &index).await.unwrap();
	assert_eq!(report.added, 1);
	assert_eq!(report.updated, 1);
	assert_eq!(report.deleted, 1);
	assert_eq!(store.get("A").unwrap(), b"BEGIN:VCARD\nFN:Ada\nEND:VCARD");
	assert_eq!(store.get("B").unwrap(), b"BEGIN:VCARD\nFN:Bob\nEND:VCARD");
	assert!(store.get("C").is_none());
}

// vim: ts=4

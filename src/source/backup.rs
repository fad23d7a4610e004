//! Backup and restore of source content
//!
//! A backup is a directory of numbered item files plus a node recording
//! `<N>-uid` / `<N>-rev` pairs and `numitems`. Item content is stored
//! verbatim; the backend decides the encoding. Restore diffs the backup
//! against the current store and replays the difference.

use std::path::Path;

use tokio::fs;

use crate::config::node::ConfigNode;
use crate::error::SourceError;
use crate::source::tracking::TrackingSource;

/// Summary of one backup or restore run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BackupReport {
	pub num_items: usize,
	pub added: usize,
	pub updated: usize,
	pub deleted: usize,
}

/// Write every item of the source into `dir` and its index into `node`
pub async fn backup(
	source: &mut TrackingSource,
	dir: &Path,
	node: &dyn ConfigNode,
) -> Result<BackupReport, SourceError> {
	fs::create_dir_all(dir).await?;

	let live = source.backend_mut().list_all().await?;
	let mut counter = 0usize;

	for (uid, rev) in &live {
		counter += 1;
		let item = source.backend_mut().read_item(uid).await?;
		let filename = dir.join(counter.to_string());
		fs::write(&filename, &item).await?;

		node.write(&format!("{}-uid", counter), uid)?;
		node.write(&format!("{}-rev", counter), rev)?;
	}

	node.write("numitems", &counter.to_string())?;
	node.flush()?;

	Ok(BackupReport { num_items: counter, ..Default::default() })
}

/// Bring the source back to the state recorded in `dir`/`node`.
///
/// Items missing from the store are inserted under their original UID,
/// items with a different revision are overwritten, items unknown to the
/// backup are deleted.
pub async fn restore(
	source: &mut TrackingSource,
	dir: &Path,
	node: &dyn ConfigNode,
) -> Result<BackupReport, SourceError> {
	let num_items: usize = node.read("numitems").parse().map_err(|_| SourceError::Backend {
		message: format!("backup node {} has no valid numitems", node.name()),
	})?;

	let mut report = BackupReport { num_items, ..Default::default() };
	let live = source.backend_mut().list_all().await?;
	let mut backed_up: Vec<String> = Vec::with_capacity(num_items);

	for counter in 1..=num_items {
		let uid = node.read(&format!("{}-uid", counter));
		let rev = node.read(&format!("{}-rev", counter));
		if uid.is_empty() {
			return Err(SourceError::Backend {
				message: format!("backup item {} has no uid", counter),
			});
		}
		backed_up.push(uid.clone());

		let need_write = match live.get(&uid) {
			None => {
				report.added += 1;
				true
			}
			Some(live_rev) if live_rev != &rev => {
				report.updated += 1;
				true
			}
			Some(_) => false,
		};

		if need_write {
			let item = fs::read(dir.join(counter.to_string())).await?;
			source.backend_mut().insert(Some(&uid), &item).await?;
		}
	}

	for uid in live.keys() {
		if !backed_up.iter().any(|b| b == uid) {
			source.backend_mut().delete_item(uid).await?;
			report.deleted += 1;
		}
	}

	source.backend_mut().flush().await?;
	Ok(report)
}


// vim: ts=4

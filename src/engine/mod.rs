//! Protocol engine contract
//!
//! The engine drives the actual message exchange of one sync session. The
//! core treats it as a black box behind [`ProtocolEngine`]: it gets the
//! prepared sources, a transport and an event sink, and reports a final
//! status. The SyncML wire codec is such an engine provided externally;
//! `local` is the built-in engine speaking JSON frames between two pimsync
//! instances, `mock` is scripted test support.

pub mod local;
pub mod mock;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SyncError;
use crate::progress::ProgressStep;
use crate::source::tracking::TrackingSource;
use crate::status::{SyncMode, SyncStatus};
use crate::transport::TransportAgent;

/// Progress events the engine reports while it runs.
///
/// The session folds them into its progress machine and per-source
/// progress records.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
	/// the session entered a new phase
	StepChange(ProgressStep),
	/// a message is about to be sent
	SendStart,
	/// a complete reply has been processed
	ReceiveEnd,
	/// engine is blocked on transport I/O (true) or computing again (false)
	Waiting(bool),
	SourceStart { source: String, mode: SyncMode },
	SourceEnd { source: String, status: SyncStatus },
	ItemPrepare { source: String, count: i32, total: i32 },
	ItemSend { source: String, count: i32, total: i32 },
	ItemReceive { source: String, count: i32, total: i32 },
}

/// Abort/suspend request flags, polled by the engine at message and item
/// boundaries
#[derive(Debug, Clone, Default)]
pub struct SyncFlags {
	abort: Arc<AtomicBool>,
	suspend: Arc<AtomicBool>,
}

impl SyncFlags {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn request_abort(&self) {
		self.abort.store(true, Ordering::SeqCst);
	}

	pub fn request_suspend(&self) {
		self.suspend.store(true, Ordering::SeqCst);
	}

	pub fn aborted(&self) -> bool {
		self.abort.load(Ordering::SeqCst)
	}

	pub fn suspended(&self) -> bool {
		self.suspend.load(Ordering::SeqCst)
	}

	/// Abort is terminal: engines bail out with an error.
	/// Suspend lets the current message finish, so it is not checked here.
	pub fn check(&self) -> Result<(), SyncError> {
		if self.aborted() {
			Err(SyncError::Aborted)
		} else {
			Ok(())
		}
	}
}

/// Authentication data resolved by the session before the engine starts
#[derive(Debug, Clone, Default)]
pub struct Credentials {
	pub username: String,
	pub password: String,
}

/// Everything an engine needs for one run
pub struct EngineContext<'a> {
	/// sources taking part in the sync, already configured with their modes
	pub sources: &'a mut [TrackingSource],
	pub transport: &'a mut dyn TransportAgent,
	pub events: &'a mut (dyn FnMut(EngineEvent) + Send),
	pub flags: &'a SyncFlags,
	pub credentials: Credentials,
	/// local device id, sent to the peer
	pub device_id: String,
	/// act as the answering side of the exchange
	pub server_mode: bool,
}

impl<'a> EngineContext<'a> {
	pub fn emit(&mut self, event: EngineEvent) {
		(self.events)(event);
	}
}

/// One protocol engine run: drive the exchange to completion
#[async_trait]
pub trait ProtocolEngine: Send {
	async fn run(&mut self, ctx: &mut EngineContext<'_>) -> Result<SyncStatus, SyncError>;
}

/// Constructor injected into the server at composition time
pub type EngineFactory = Arc<dyn Fn() -> Box<dyn ProtocolEngine> + Send + Sync>;

/// Factory for the built-in JSON frame engine
pub fn local_engine_factory() -> EngineFactory {
	Arc::new(|| Box::new(local::LocalEngine::new()) as Box<dyn ProtocolEngine>)
}


// vim: ts=4

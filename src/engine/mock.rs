//! Scripted engine and loopback transport for tests
//!
//! `MockEngine` emits a fixed event sequence and returns a fixed outcome;
//! `loopback_pair` connects two transports directly in memory so a client
//! and a server engine can talk without any I/O.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::engine::{EngineContext, EngineEvent, EngineFactory, ProtocolEngine};
use crate::error::{SyncError, TransportError};
use crate::status::SyncStatus;
use crate::transport::{TransportAgent, TransportStatus};

/// Transport delivering directly into its twin
pub struct LoopbackTransport {
	tx: mpsc::UnboundedSender<(Vec<u8>, String)>,
	rx: mpsc::UnboundedReceiver<(Vec<u8>, String)>,
	content_type: String,
	timeout: Duration,
	reply: Option<(Vec<u8>, String)>,
	canceled: bool,
}

/// Two cross-connected in-memory transports
pub fn loopback_pair() -> (LoopbackTransport, LoopbackTransport) {
	let (a_tx, a_rx) = mpsc::unbounded_channel();
	let (b_tx, b_rx) = mpsc::unbounded_channel();
	(
		LoopbackTransport {
			tx: a_tx,
			rx: b_rx,
			content_type: String::new(),
			timeout: Duration::from_secs(30),
			reply: None,
			canceled: false,
		},
		LoopbackTransport {
			tx: b_tx,
			rx: a_rx,
			content_type: String::new(),
			timeout: Duration::from_secs(30),
			reply: None,
			canceled: false,
		},
	)
}

#[async_trait]
impl TransportAgent for LoopbackTransport {
	fn set_url(&mut self, _url: &str) {}

	fn set_content_type(&mut self, content_type: &str) {
		self.content_type = content_type.to_string();
	}

	fn set_timeout(&mut self, seconds: u64) {
		self.timeout = Duration::from_secs(seconds);
	}

	async fn send(&mut self, message: &[u8]) -> Result<(), TransportError> {
		if self.canceled {
			return Err(TransportError::Canceled);
		}
		self.tx
			.send((message.to_vec(), self.content_type.clone()))
			.map_err(|_| TransportError::Closed)
	}

	async fn wait(&mut self, no_reply: bool) -> Result<TransportStatus, TransportError> {
		if self.canceled {
			return Ok(TransportStatus::Failed);
		}
		if no_reply {
			return Ok(TransportStatus::Inactive);
		}
		match tokio::time::timeout(self.timeout, self.rx.recv()).await {
			Err(_) => Ok(TransportStatus::TimeOut),
			Ok(None) => Ok(TransportStatus::Closed),
			Ok(Some(reply)) => {
				self.reply = Some(reply);
				Ok(TransportStatus::GotReply)
			}
		}
	}

	fn get_reply(&self) -> Option<(Vec<u8>, String)> {
		self.reply.clone()
	}

	fn cancel(&mut self) {
		self.canceled = true;
	}

	async fn shutdown(&mut self) -> Result<(), TransportError> {
		Ok(())
	}
}

/// Engine that replays a scripted event list and returns a fixed outcome
pub struct MockEngine {
	pub events: Vec<EngineEvent>,
	/// Ok(code) or Err(message)
	pub outcome: Result<SyncStatus, String>,
	/// pause between events, to give abort/suspend tests time to act
	pub step_delay: Duration,
}

impl MockEngine {
	pub fn succeeding() -> Self {
		MockEngine {
			events: Vec::new(),
			outcome: Ok(SyncStatus::Ok),
			step_delay: Duration::from_millis(0),
		}
	}

	pub fn failing(message: &str) -> Self {
		MockEngine {
			events: Vec::new(),
			outcome: Err(message.to_string()),
			step_delay: Duration::from_millis(0),
		}
	}
}

#[async_trait]
impl ProtocolEngine for MockEngine {
	async fn run(&mut self, ctx: &mut EngineContext<'_>) -> Result<SyncStatus, SyncError> {
		for event in self.events.clone() {
			ctx.flags.check()?;
			ctx.emit(event);
			if !self.step_delay.is_zero() {
				tokio::time::sleep(self.step_delay).await;
			}
		}
		ctx.flags.check()?;
		match &self.outcome {
			Ok(status) => Ok(*status),
			Err(message) => Err(SyncError::Other { message: message.clone() }),
		}
	}
}

/// Factory producing identical mock engines
pub fn mock_factory(events: Vec<EngineEvent>, outcome: Result<SyncStatus, String>) -> EngineFactory {
	std::sync::Arc::new(move || {
		Box::new(MockEngine {
			events: events.clone(),
			outcome: outcome.clone(),
			step_delay: Duration::from_millis(0),
		}) as Box<dyn ProtocolEngine>
	})
}


// vim: ts=4

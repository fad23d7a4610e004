//! Bus-relayed transport
//!
//! Used when a connection object owns the session: outgoing engine messages
//! become `Reply` signals on the bus, inbound `Process` calls complete the
//! engine's wait. The peer at the other end of the relay is typically an
//! OBEX/Bluetooth bridge or a server-alerted phone.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::transport::{TransportAgent, TransportStatus};

/// One outgoing message handed to the connection for re-emission
#[derive(Debug, Clone)]
pub struct RelayReply {
	pub data: Vec<u8>,
	pub content_type: String,
	pub meta: BTreeMap<String, String>,
	/// engine declared the session finished; peer must close afterwards
	pub final_msg: bool,
}

/// Connection-side endpoints of a relay transport
pub struct RelayChannel {
	/// replies the engine sends, to be re-emitted as bus signals
	pub replies: mpsc::UnboundedReceiver<RelayReply>,
	/// inbound messages from `Process` calls
	pub inbound: mpsc::UnboundedSender<(Vec<u8>, String)>,
}

/// Engine-side transport backed by connection channels
pub struct RelayTransport {
	session_id: String,
	content_type: String,
	timeout: Duration,
	replies: mpsc::UnboundedSender<RelayReply>,
	inbound: mpsc::UnboundedReceiver<(Vec<u8>, String)>,
	reply: Option<(Vec<u8>, String)>,
	canceled: bool,
}

impl RelayTransport {
	/// Create the transport and the matching connection-side channel
	pub fn channel(session_id: &str) -> (Self, RelayChannel) {
		let (reply_tx, reply_rx) = mpsc::unbounded_channel();
		let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
		(
			RelayTransport {
				session_id: session_id.to_string(),
				content_type: String::new(),
				timeout: Duration::from_secs(300),
				replies: reply_tx,
				inbound: inbound_rx,
				reply: None,
				canceled: false,
			},
			RelayChannel { replies: reply_rx, inbound: inbound_tx },
		)
	}

	pub fn session_id(&self) -> &str {
		&self.session_id
	}
}

#[async_trait]
impl TransportAgent for RelayTransport {
	fn set_url(&mut self, _url: &str) {
		// the connection decides where messages go
	}

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
		let mut meta = BTreeMap::new();
		meta.insert("URL".to_string(), String::new());
		self.replies
			.send(RelayReply {
				data: message.to_vec(),
				content_type: self.content_type.clone(),
				meta,
				final_msg: false,
			})
			.map_err(|_| TransportError::Closed)
	}

	async fn wait(&mut self, no_reply: bool) -> Result<TransportStatus, TransportError> {
		if self.canceled {
			return Ok(TransportStatus::Failed);
		}
		if no_reply {
			return Ok(TransportStatus::Inactive);
		}

		match tokio::time::timeout(self.timeout, self.inbound.recv()).await {
			Err(_) => Ok(TransportStatus::TimeOut),
			Ok(None) => Ok(TransportStatus::Closed),
			Ok(Some((data, content_type))) => {
				self.reply = Some((data, content_type));
				Ok(TransportStatus::GotReply)
			}
		}
	}

	fn get_reply(&self) -> Option<(Vec<u8>, String)> {
		self.reply.clone()
	}

	fn cancel(&mut self) {
		self.canceled = true;
		self.inbound.close();
	}

	async fn shutdown(&mut self) -> Result<(), TransportError> {
		// tell the peer this was the last message
		let _ = self.replies.send(RelayReply {
			data: Vec::new(),
			content_type: self.content_type.clone(),
			meta: BTreeMap::new(),
			final_msg: true,
		});
		Ok(())
	}
}


// vim: ts=4

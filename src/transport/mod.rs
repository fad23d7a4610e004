//! Message transports used by the protocol engine
//!
//! The engine only knows this trait: configure a target, send a message,
//! wait for the reply, fetch it. Concrete bindings are a direct HTTP client
//! and a relay that turns the exchange into bus signals for
//! server-alerted/OBEX scenarios.

pub mod http;
pub mod relay;

use async_trait::async_trait;

use crate::error::TransportError;

/// Content type of plain-text SyncML messages
pub const CONTENT_TYPE_SYNCML_XML: &str = "application/vnd.syncml+xml";
/// Content type of binary SyncML messages
pub const CONTENT_TYPE_SYNCML_WBXML: &str = "application/vnd.syncml+wbxml";
/// Content type of Server-Alerted Notifications
pub const CONTENT_TYPE_SAN: &str = "application/vnd.syncml.notification";
/// Content type of the built-in engine's JSON frames
pub const CONTENT_TYPE_JSON_FRAME: &str = "application/vnd.pimsync+json";

/// Result of waiting for transport activity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
	/// message in flight, no reply yet
	Active,
	/// complete reply received, fetch it with `get_reply`
	GotReply,
	/// no message pending
	Inactive,
	/// peer closed the channel
	Closed,
	/// wait ran into the configured timeout
	TimeOut,
	/// message exchange failed
	Failed,
}

/// Pluggable message exchange with timeout and cancellation
#[async_trait]
pub trait TransportAgent: Send {
	fn set_url(&mut self, url: &str);

	fn set_content_type(&mut self, content_type: &str);

	/// Hard wall-clock limit for one send/reply exchange
	fn set_timeout(&mut self, seconds: u64);

	/// Start sending one message. Returns once the message is on its way;
	/// the reply is picked up via `wait` + `get_reply`.
	async fn send(&mut self, message: &[u8]) -> Result<(), TransportError>;

	/// Wait until the pending exchange makes progress. With `no_reply` the
	/// caller does not expect an answer and only waits for the send to
	/// finish.
	async fn wait(&mut self, no_reply: bool) -> Result<TransportStatus, TransportError>;

	/// The last reply and its content type
	fn get_reply(&self) -> Option<(Vec<u8>, String)>;

	/// Abort the pending exchange; `wait` returns `Failed` afterwards
	fn cancel(&mut self);

	/// Close the channel gracefully
	async fn shutdown(&mut self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_status_is_comparable() {
		assert_ne!(TransportStatus::GotReply, TransportStatus::TimeOut);
		assert_eq!(TransportStatus::Closed, TransportStatus::Closed);
	}
}

// vim: ts=4

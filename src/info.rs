//! Out-of-band information requests
//!
//! When a sync needs data only a user can provide (passwords, choices), the
//! server broadcasts an `InfoRequest` signal and the session blocks until an
//! attached client answers, the request times out, or the session aborts.
//! The first client answering "working" becomes the handler; its later
//! "response" completes the request.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Default time a request may stay unanswered
pub const INFO_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoState {
	/// broadcast, nobody answered yet
	Request,
	/// a handler is working on the answer
	Waiting,
	/// answered, timed out or cancelled; terminal
	Done,
}

impl InfoState {
	pub fn as_str(&self) -> &'static str {
		match self {
			InfoState::Request => "request",
			InfoState::Waiting => "waiting",
			InfoState::Done => "done",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoStatus {
	Run,
	Ok,
	Timeout,
	Cancel,
}

#[derive(Debug)]
struct InfoInner {
	state: InfoState,
	status: InfoStatus,
	handler: Option<String>,
	response: Option<BTreeMap<String, String>>,
	deadline: Instant,
}

/// One pending request
#[derive(Debug)]
pub struct InfoReq {
	id: String,
	session_path: String,
	req_type: String,
	params: BTreeMap<String, String>,
	timeout: Duration,
	inner: Mutex<InfoInner>,
	changed: Notify,
}

impl InfoReq {
	pub fn new(
		id: &str,
		session_path: &str,
		req_type: &str,
		params: BTreeMap<String, String>,
		timeout: Duration,
	) -> Self {
		InfoReq {
			id: id.to_string(),
			session_path: session_path.to_string(),
			req_type: req_type.to_string(),
			params,
			timeout,
			inner: Mutex::new(InfoInner {
				state: InfoState::Request,
				status: InfoStatus::Run,
				handler: None,
				response: None,
				deadline: Instant::now() + timeout,
			}),
			changed: Notify::new(),
		}
	}

	pub fn id(&self) -> &str {
		&self.id
	}

	pub fn session_path(&self) -> &str {
		&self.session_path
	}

	pub fn req_type(&self) -> &str {
		&self.req_type
	}

	pub fn params(&self) -> &BTreeMap<String, String> {
		&self.params
	}

	pub fn state(&self) -> InfoState {
		self.lock().state
	}

	pub fn status(&self) -> InfoStatus {
		self.lock().status
	}

	pub fn handler(&self) -> Option<String> {
		self.lock().handler.clone()
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, InfoInner> {
		self.inner.lock().unwrap_or_else(|e| e.into_inner())
	}

	/// A client volunteered to answer. Returns true when it became the
	/// handler (first one wins); the timeout restarts then.
	pub fn set_working(&self, client: &str) -> bool {
		let mut inner = self.lock();
		if inner.state != InfoState::Request {
			return false;
		}
		inner.state = InfoState::Waiting;
		inner.handler = Some(client.to_string());
		inner.deadline = Instant::now() + self.timeout;
		drop(inner);
		self.changed.notify_waiters();
		true
	}

	/// The handler delivered the response. Late or duplicate responses are
	/// ignored.
	pub fn set_response(&self, client: &str, response: BTreeMap<String, String>) -> bool {
		let mut inner = self.lock();
		if inner.state == InfoState::Done {
			return false;
		}
		if let Some(handler) = &inner.handler {
			if handler != client {
				return false;
			}
		}
		inner.state = InfoState::Done;
		inner.status = InfoStatus::Ok;
		inner.response = Some(response);
		drop(inner);
		self.changed.notify_waiters();
		true
	}

	/// Abort the request (session abort or server shutdown)
	pub fn cancel(&self, status: InfoStatus) {
		let mut inner = self.lock();
		if inner.state == InfoState::Done {
			return;
		}
		inner.state = InfoState::Done;
		inner.status = status;
		drop(inner);
		self.changed.notify_waiters();
	}

	/// Block until the request is answered or runs out of time.
	/// Returns the response map on success.
	pub async fn wait(&self) -> (InfoStatus, Option<BTreeMap<String, String>>) {
		loop {
			let deadline = {
				let inner = self.lock();
				if inner.state == InfoState::Done {
					return (inner.status, inner.response.clone());
				}
				inner.deadline
			};

			tokio::select! {
				_ = self.changed.notified() => {}
				_ = tokio::time::sleep_until(deadline) => {
					// the deadline may have been pushed by set_working
					let expired = {
						let inner = self.lock();
						inner.state != InfoState::Done && Instant::now() >= inner.deadline
					};
					if expired {
						self.cancel(InfoStatus::Timeout);
					}
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;

	fn request(timeout: Duration) -> Arc<InfoReq> {
		let mut params = BTreeMap::new();
		params.insert("user".to_string(), "me".to_string());
		params.insert("description".to_string(), "server password".to_string());
		Arc::new(InfoReq::new("1", "/sessions/abc", "password", params, timeout))
	}

	#[tokio::test]
	async fn test_first_responder_becomes_handler() {
		let req = request(INFO_REQUEST_TIMEOUT);
		assert!(req.set_working("client-a"));
		assert!(!req.set_working("client-b"));
		assert_eq!(req.handler().unwrap(), "client-a");
		assert_eq!(req.state(), InfoState::Waiting);
	}

	#[tokio::test]
	async fn test_response_completes_wait() {
		let req = request(INFO_REQUEST_TIMEOUT);
		let waiter = Arc::clone(&req);
		let task = tokio::spawn(async move { waiter.wait().await });

		req.set_working("client-a");
		let mut response = BTreeMap::new();
		response.insert("password".to_string(), "secret".to_string());
		assert!(req.set_response("client-a", response));

		let (status, response) = task.await.unwrap();
		assert_eq!(status, InfoStatus::Ok);
		assert_eq!(response.unwrap()["password"], "secret");
	}

	#[tokio::test]
	async fn test_non_handler_response_ignored() {
		let req = request(INFO_REQUEST_TIMEOUT);
		req.set_working("client-a");
		assert!(!req.set_response("client-b", BTreeMap::new()));
		assert_eq!(req.state(), InfoState::Waiting);
	}

	#[tokio::test]
	async fn test_timeout_expires_request() {
		let req = request(Duration::from_millis(50));
		let (status, response) = req.wait().await;
		assert_eq!(status, InfoStatus::Timeout);
		assert!(response.is_none());
		// a response arriving after the timeout is dropped
		assert!(!req.set_response("late", BTreeMap::new()));
	}

	#[tokio::test]
	async fn test_cancel_wins_over_response() {
		let req = request(INFO_REQUEST_TIMEOUT);
		req.cancel(InfoStatus::Cancel);
		assert_eq!(req.status(), InfoStatus::Cancel);
		assert!(!req.set_working("client-a"));
	}
}

// vim: ts=4

//! Connection objects: peers that push messages to us over the bus
//!
//! A connection relays a message stream (HTTP frontend, OBEX/Bluetooth
//! bridge, server-alerted notification) into the engine. The first inbound
//! payload decides what happens: a SyncML message starts a server-mode
//! session over a relay transport, a SAN starts a client-mode session
//! towards the alerting server.

use std::collections::BTreeMap;
use std::sync::{Mutex, Weak};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::node::ConfigNode;
use crate::error::ConfigError;
use crate::logging::{debug, info, warn};
use crate::report::unix_now;
use crate::san;
use crate::server::Server;
use crate::session::{priority, Session};
use crate::status::SyncMode;
use crate::transport::relay::{RelayChannel, RelayTransport};
use crate::transport::{CONTENT_TYPE_SAN, CONTENT_TYPE_SYNCML_WBXML, CONTENT_TYPE_SYNCML_XML};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	/// ready for the first message
	Setup,
	/// message received, waiting for the engine's reply
	Processing,
	/// reply sent, waiting for the next follow-up message
	Waiting,
	/// engine sent the final reply, peer must close now
	Final,
	Done,
	Failed,
}

impl ConnectionState {
	pub fn as_str(&self) -> &'static str {
		match self {
			ConnectionState::Setup => "setup",
			ConnectionState::Processing => "processing",
			ConnectionState::Waiting => "waiting",
			ConnectionState::Final => "final",
			ConnectionState::Done => "done",
			ConnectionState::Failed => "failed",
		}
	}
}

struct ConnInner {
	state: ConnectionState,
	failure: String,
	session: Option<std::sync::Arc<Session>>,
	inbound: Option<mpsc::UnboundedSender<(Vec<u8>, String)>>,
}

/// One bus-visible connection
pub struct Connection {
	id: String,
	peer: BTreeMap<String, String>,
	must_authenticate: bool,
	server: Weak<Server>,
	/// back-reference for spawning owned tasks
	this: Weak<Connection>,
	inner: Mutex<ConnInner>,
}

impl Connection {
	pub fn new(
		server: Weak<Server>,
		peer: BTreeMap<String, String>,
		must_authenticate: bool,
	) -> std::sync::Arc<Connection> {
		std::sync::Arc::new_cyclic(|this| Connection {
			this: this.clone(),
			id: Uuid::new_v4().to_string(),
			peer,
			must_authenticate,
			server,
			inner: Mutex::new(ConnInner {
				state: ConnectionState::Setup,
				failure: String::new(),
				session: None,
				inbound: None,
			}),
		})
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, ConnInner> {
		self.inner.lock().unwrap_or_else(|e| e.into_inner())
	}

	pub fn id(&self) -> &str {
		&self.id
	}

	pub fn path(&self) -> String {
		format!("/connections/{}", self.id)
	}

	pub fn state(&self) -> ConnectionState {
		self.lock().state
	}

	pub fn failure(&self) -> String {
		self.lock().failure.clone()
	}

	pub fn session(&self) -> Option<std::sync::Arc<Session>> {
		self.lock().session.clone()
	}

	/// Describe the peer for log messages
	fn description(&self) -> String {
		self.peer
			.get("description")
			.cloned()
			.unwrap_or_else(|| self.peer.get("id").cloned().unwrap_or_else(|| self.id.clone()))
	}

	/// Record a failure, tear the session down, tell the peer to stop
	pub fn failed(&self, reason: &str) {
		let session = {
			let mut inner = self.lock();
			if inner.failure.is_empty() {
				inner.failure = reason.to_string();
			}
			if inner.state == ConnectionState::Failed {
				return;
			}
			inner.state = ConnectionState::Failed;
			inner.session.clone()
		};
		warn!("connection {} failed: {}", self.description(), reason);
		if let Some(session) = session {
			session.set_connection_error(reason);
			session.abort();
		}
		if let Some(server) = self.server.upgrade() {
			server.signal(&self.path(), "Abort", json!([]));
		}
	}

	/// Inbound message from the peer
	pub fn process(
		&self,
		data: Vec<u8>,
		content_type: &str,
	) -> Result<(), ConfigError> {
		let state = self.lock().state;
		match state {
			ConnectionState::Setup => self.process_initial(data, content_type),
			ConnectionState::Waiting => {
				let mut inner = self.lock();
				match &inner.inbound {
					Some(tx) if tx.send((data, content_type.to_string())).is_ok() => {
						inner.state = ConnectionState::Processing;
						Ok(())
					}
					_ => {
						drop(inner);
						self.failed("session already gone");
						Err(ConfigError::InvalidCall {
							message: "session already gone".to_string(),
						})
					}
				}
			}
			other => Err(ConfigError::InvalidCall {
				message: format!("unexpected message in state {}", other.as_str()),
			}),
		}
	}

	fn process_initial(
		&self,
		data: Vec<u8>,
		content_type: &str,
	) -> Result<(), ConfigError> {
		let server = self.server.upgrade().ok_or_else(|| ConfigError::InvalidCall {
			message: "server is shutting down".to_string(),
		})?;

		if content_type.eq_ignore_ascii_case(CONTENT_TYPE_SAN) {
			return self.process_san(&server, &data);
		}
		if content_type.eq_ignore_ascii_case(CONTENT_TYPE_SYNCML_XML)
			|| content_type.eq_ignore_ascii_case(CONTENT_TYPE_SYNCML_WBXML)
		{
			return self.process_sync_message(&server, data, content_type);
		}
		self.failed(&format!("unknown content type \"{}\"", content_type));
		Err(ConfigError::InvalidCall {
			message: format!("unknown content type \"{}\"", content_type),
		})
	}

	/// Server-Alerted Notification: pick or create the configuration and
	/// run a client-mode sync towards the alerting server.
	fn process_san(
		&self,
		server: &std::sync::Arc<Server>,
		data: &[u8],
	) -> Result<(), ConfigError> {
		let message = san::parse_san(data).map_err(|e| {
			self.failed(&e.to_string());
			ConfigError::InvalidCall { message: e.to_string() }
		})?;
		info!(
			"SAN from \"{}\" with {} sync entries",
			message.server_id,
			message.entries.len()
		);

		let candidates = server.san_candidates();
		let config_name = match san::match_config(&message.server_id, &candidates) {
			Some(candidate) => candidate.config_name.clone(),
			None => server.create_san_config(&message.server_id, unix_now())?,
		};

		let session =
			server.start_session(&config_name, vec!["san".to_string()], priority::CONNECTION);
		session.set_remote_device_id(&message.server_id);

		// With sync entries, only the named databases take part; the rest
		// of the configuration is disabled for this session. Entries whose
		// URI matches no local source enable nothing.
		if !message.entries.is_empty() {
			let mut map = crate::config::peer::ConfigMap::new();
			let config = server.open_config(&config_name);
			for source in config.source_names() {
				let nodes = config.source_nodes(&source, "meta")?;
				let uri = nodes.visible.read("uri");
				let entry = message.entries.iter().find(|e| {
					e.uri.eq_ignore_ascii_case(&uri) || e.uri.eq_ignore_ascii_case(&source)
				});
				let mut filter = BTreeMap::new();
				match entry {
					Some(entry) => filter.insert("sync".to_string(), entry.mode.to_string()),
					None => filter.insert("sync".to_string(), SyncMode::Disabled.to_string()),
				};
				map.insert(format!("source/{}", source), filter);
			}
			session.set_config(true, true, &map)?;
		}

		{
			let mut inner = self.lock();
			inner.session = Some(std::sync::Arc::clone(&session));
		}

		// no reply needed for a notification: finish the relay right away
		server.signal(
			&self.path(),
			"Reply",
			json!({
				"data": "",
				"type": "",
				"meta": {},
				"final": true,
				"session": session.id(),
			}),
		);
		self.lock().state = ConnectionState::Final;

		// run the sync once the scheduler activates the session
		let run = std::sync::Arc::clone(&session);
		tokio::spawn(async move {
			run.wait_until_active().await;
			if let Err(e) = run.sync("", &BTreeMap::new()) {
				warn!("SAN session could not start: {}", e);
			}
		});
		Ok(())
	}

	/// First real SyncML message: find the configuration by the device id
	/// in the message and start a server-mode session on a relay.
	fn process_sync_message(
		&self,
		server: &std::sync::Arc<Server>,
		data: Vec<u8>,
		content_type: &str,
	) -> Result<(), ConfigError> {
		let device_id = match peek_loc_uri(&data) {
			Some(id) => id,
			None => {
				self.failed("no device id found in first message");
				return Err(ConfigError::InvalidCall {
					message: "no device id found in first message".to_string(),
				});
			}
		};
		debug!("initial message from device \"{}\"", device_id);

		let config_name = match server.find_config_by_device(&device_id) {
			Some(name) => name,
			None => {
				let message =
					format!("no configuration found for device \"{}\"", device_id);
				self.failed(&message);
				return Err(ConfigError::NoSuchConfig { name: device_id });
			}
		};

		// a newer connection from the same peer supersedes queued work
		server.kill_sessions_by_device(&device_id);

		let session = server.start_session(
			&config_name,
			vec!["connection".to_string()],
			priority::CONNECTION,
		);
		session.set_remote_device_id(&device_id);

		let (transport, channel) = RelayTransport::channel(session.id());
		session.adopt_transport(Box::new(transport), true);

		{
			let mut inner = self.lock();
			inner.session = Some(std::sync::Arc::clone(&session));
			inner.inbound = Some(channel.inbound.clone());
			inner.state = ConnectionState::Processing;
		}

		// deliver the message that opened the connection
		if let Some(inbound) = &self.lock().inbound {
			let _ = inbound.send((data, content_type.to_string()));
		}

		self.spawn_reply_pump(channel, std::sync::Arc::clone(&session));

		let run = std::sync::Arc::clone(&session);
		if let Some(connection) = self.this.upgrade() {
			tokio::spawn(async move {
				run.wait_until_active().await;
				if let Err(e) = run.sync("", &BTreeMap::new()) {
					connection.failed(&format!("session could not start: {}", e));
				}
			});
		}
		Ok(())
	}

	/// Forward engine replies to the peer as bus signals
	fn spawn_reply_pump(
		&self,
		mut channel: RelayChannel,
		session: std::sync::Arc<Session>,
	) {
		let connection = match self.this.upgrade() {
			Some(connection) => connection,
			None => return,
		};
		tokio::spawn(async move {
			while let Some(reply) = channel.replies.recv().await {
				let server = match connection.server.upgrade() {
					Some(server) => server,
					None => break,
				};
				let final_msg = reply.final_msg;
				server.signal(
					&connection.path(),
					"Reply",
					json!({
						"data": BASE64.encode(&reply.data),
						"type": reply.content_type,
						"meta": reply.meta,
						"final": final_msg,
						"session": session.id(),
					}),
				);
				let mut inner = connection.lock();
				if matches!(inner.state, ConnectionState::Done | ConnectionState::Failed) {
					break;
				}
				inner.state = if final_msg {
					ConnectionState::Final
				} else {
					ConnectionState::Waiting
				};
			}
		});
	}

	/// Peer closed the connection
	pub fn close(&self, normal: bool, error: &str) {
		let state = self.lock().state;
		if !normal {
			let reason = if error.is_empty() { "peer reported failure" } else { error };
			self.failed(reason);
			return;
		}
		match state {
			ConnectionState::Final | ConnectionState::Done => {
				self.lock().state = ConnectionState::Done;
				debug!("connection {} closed normally", self.description());
			}
			_ => {
				self.failed("connection closed before the session finished");
			}
		}
	}

	pub fn must_authenticate(&self) -> bool {
		self.must_authenticate
	}
}

/// Extract the client device id (Source LocURI) from a plain-text SyncML
/// header. Binary messages would need the engine's parser; relays for
/// those peers announce the device id in the peer description instead.
pub fn peek_loc_uri(data: &[u8]) -> Option<String> {
	let text = String::from_utf8_lossy(data);
	let source_pos = text.find("<Source>");
	let search_from = source_pos.unwrap_or(0);
	let rest = &text[search_from..];
	let start = rest.find("<LocURI>")? + "<LocURI>".len();
	let end = rest[start..].find("</LocURI>")?;
	let uri = rest[start..start + end].trim().to_string();
	if uri.is_empty() {
		None
	} else {
		Some(uri)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_peek_loc_uri_prefers_source() {
		let message = br#"<SyncML><SyncHdr>
			<Target><LocURI>http://server.example.com/sync</LocURI></Target>
			<Source><LocURI>IMEI:004400112233445</LocURI></Source>
		</SyncHdr></SyncML>"#;
		assert_eq!(peek_loc_uri(message).unwrap(), "IMEI:004400112233445");
	}

	#[test]
	fn test_peek_loc_uri_falls_back_to_first() {
		let message = b"<SyncML><LocURI>dev-1</LocURI></SyncML>";
		assert_eq!(peek_loc_uri(message).unwrap(), "dev-1");
	}

	#[test]
	fn test_peek_loc_uri_absent() {
		assert!(peek_loc_uri(b"<SyncML></SyncML>").is_none());
		assert!(peek_loc_uri(&[0x02, 0x00, 0x6a]).is_none());
	}

	#[test]
	fn test_state_strings() {
		assert_eq!(ConnectionState::Setup.as_str(), "setup");
		assert_eq!(ConnectionState::Final.as_str(), "final");
	}
}

// vim: ts=4

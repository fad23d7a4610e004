//! Bus server: socket handling and method dispatch
//!
//! Every accepted socket is one client. Calls are dispatched onto the
//! scheduler objects addressed by path ("/", "/sessions/<id>",
//! "/connections/<id>"); all signals are forwarded to every connected
//! client. A closing socket counts as client disappearance.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::bus::BusMessage;
use crate::config::node::ConfigNode;
use crate::error::ConfigError;
use crate::logging::{debug, info, warn};
use crate::server::Server;
use crate::session::priority;

/// Dispatch error: the (name, message) pair sent back to the caller
type MethodError = (String, String);

fn invalid(message: impl Into<String>) -> MethodError {
	("InvalidCall".to_string(), message.into())
}

fn config_error(e: ConfigError) -> MethodError {
	(e.bus_name().to_string(), e.to_string())
}

/// Positional argument helper
fn arg<T: serde::de::DeserializeOwned>(args: &Value, index: usize, name: &str) -> Result<T, MethodError> {
	let value = args
		.get(index)
		.ok_or_else(|| invalid(format!("missing argument {} ({})", index, name)))?;
	serde_json::from_value(value.clone())
		.map_err(|e| invalid(format!("argument {} ({}): {}", index, name, e)))
}

fn opt_arg<T: serde::de::DeserializeOwned>(args: &Value, index: usize) -> Option<T> {
	args.get(index).and_then(|v| serde_json::from_value(v.clone()).ok())
}

/// Handle one call addressed to the root object
async fn dispatch_root(
	server: &Arc<Server>,
	client: &str,
	method: &str,
	args: &Value,
) -> Result<Value, MethodError> {
	match method {
		"GetCapabilities" => Ok(json!([
			"Version",
			"SessionFlags",
			"SessionAttach",
			"Notifications",
			"NamedConfig",
			"ConfigChanged"
		])),
		"GetVersions" => Ok(json!({
			"version": env!("CARGO_PKG_VERSION"),
			"bus": "1",
		})),
		"Attach" => {
			server.attach_client(client);
			Ok(Value::Null)
		}
		"Detach" => {
			server.detach_client(client).map_err(config_error)?;
			Ok(Value::Null)
		}
		"StartSession" => {
			let config: String = arg(args, 0, "server")?;
			let session = server.start_session(&config, Vec::new(), priority::DEFAULT);
			Ok(json!(session.path()))
		}
		"StartSessionWithFlags" => {
			let config: String = arg(args, 0, "server")?;
			let flags: Vec<String> = arg(args, 1, "flags")?;
			let session_priority = if flags.iter().any(|f| f == "cmdline") {
				priority::CMDLINE
			} else {
				priority::DEFAULT
			};
			let session = server.start_session(&config, flags, session_priority);
			Ok(json!(session.path()))
		}
		"Connect" => {
			let peer: BTreeMap<String, String> = arg(args, 0, "peer")?;
			let must_authenticate: bool = arg(args, 1, "must_authenticate")?;
			let connection = server.add_connection(peer, must_authenticate);
			Ok(json!(connection.path()))
		}
		"GetConfigs" => {
			let template: bool = opt_arg(args, 0).unwrap_or(false);
			if template {
				Ok(json!(server.list_templates()))
			} else {
				Ok(json!(server.list_configs()))
			}
		}
		"GetConfig" => {
			let name: String = arg(args, 0, "name")?;
			let template: bool = opt_arg(args, 1).unwrap_or(false);
			if template {
				let template = crate::config::templates::find_template(&name)
					.ok_or_else(|| {
						config_error(ConfigError::NoSuchConfig { name: name.clone() })
					})?;
				Ok(serde_json::to_value(template.to_map()).unwrap_or_default())
			} else {
				let config = server.open_config(&name);
				let map = config.to_map().map_err(config_error)?;
				Ok(serde_json::to_value(map).unwrap_or_default())
			}
		}
		"GetReports" => {
			let name: String = arg(args, 0, "name")?;
			let start: usize = opt_arg(args, 1).unwrap_or(0);
			let count: usize = opt_arg(args, 2).unwrap_or(10);
			let config = server.open_config(&name);
			if !config.exists() {
				return Err(config_error(ConfigError::NoSuchConfig { name }));
			}
			let configured = config.get("logDir").unwrap_or_default();
			let dir = if configured.is_empty() {
				crate::report::default_log_dir(&name)
			} else {
				std::path::PathBuf::from(configured)
			};
			let reports = crate::report::load_reports(&dir, start, count);
			Ok(serde_json::to_value(reports).unwrap_or_default())
		}
		"CheckSource" => {
			let name: String = arg(args, 0, "config")?;
			let source: String = arg(args, 1, "source")?;
			check_source(server, &name, &source)?;
			Ok(Value::Null)
		}
		"GetDatabases" => {
			let name: String = arg(args, 0, "config")?;
			let source: String = arg(args, 1, "source")?;
			check_source(server, &name, &source)?;
			// backends report their databases; the built-in one has a
			// single anonymous store
			Ok(json!([["default", "", true]]))
		}
		"CheckPresence" => {
			let name: String = arg(args, 0, "server")?;
			let (status, transports) = server.check_presence(&name).map_err(config_error)?;
			Ok(json!([status, transports]))
		}
		"GetSessions" => {
			let paths: Vec<String> =
				server.get_sessions().iter().map(|s| s.path()).collect();
			Ok(json!(paths))
		}
		"InfoResponse" => {
			let id: String = arg(args, 0, "id")?;
			let state: String = arg(args, 1, "state")?;
			let response: BTreeMap<String, String> = opt_arg(args, 2).unwrap_or_default();
			server.info_response(client, &id, &state, response).map_err(config_error)?;
			Ok(Value::Null)
		}
		// notification rendering is a client concern; the daemon only
		// acknowledges the setting
		"EnableNotifications" | "DisableNotifications" | "NotificationAction" => Ok(Value::Null),
		"SetPresence" => {
			// collaborator hook: network stacks push their state here
			let connected: Vec<String> = opt_arg(args, 0).unwrap_or_default();
			let available: Vec<String> = opt_arg(args, 1).unwrap_or_default();
			if server.presence().set_connman_state(&connected, &available) {
				server.broadcast_presence();
			}
			Ok(Value::Null)
		}
		"SetNetworkState" => {
			let state: u32 = arg(args, 0, "state")?;
			if server.presence().set_network_manager_state(state) {
				server.broadcast_presence();
			}
			Ok(Value::Null)
		}
		other => Err(("UnknownMethod".to_string(), format!("no method {} on /", other))),
	}
}

fn check_source(server: &Arc<Server>, name: &str, source: &str) -> Result<(), MethodError> {
	let config = server.open_config(name);
	if !config.exists() {
		return Err(config_error(ConfigError::NoSuchConfig { name: name.to_string() }));
	}
	if !config.has_source(source) {
		return Err(config_error(ConfigError::NoSuchSource {
			config: name.to_string(),
			source: source.to_string(),
		}));
	}
	let nodes = config.source_nodes(source, "meta").map_err(config_error)?;
	let mut descriptor = crate::source::SourceDescriptor {
		name: source.to_string(),
		..Default::default()
	};
	descriptor
		.parse_type(&nodes.visible.read("type"))
		.map_err(config_error)?;
	server
		.backends()
		.create(&descriptor)
		.map_err(|_| config_error(ConfigError::SourceUnusable { source: source.to_string() }))?;
	Ok(())
}

/// Handle one call addressed to a session object
async fn dispatch_session(
	server: &Arc<Server>,
	client: &str,
	session_id: &str,
	method: &str,
	args: &Value,
) -> Result<Value, MethodError> {
	let session = server.find_session(session_id).ok_or_else(|| {
		("UnknownObject".to_string(), format!("no session {}", session_id))
	})?;

	match method {
		"Attach" => {
			session.attach(client);
			Ok(Value::Null)
		}
		"Detach" => {
			if session.detach(client) == 0 {
				return Err(invalid("client is not attached to this session"));
			}
			Ok(Value::Null)
		}
		"GetFlags" => Ok(json!(session.flags())),
		"GetConfigName" => Ok(json!(session.config_name())),
		"GetConfig" => {
			let _template: bool = opt_arg(args, 0).unwrap_or(false);
			let map = session.get_config().map_err(config_error)?;
			Ok(serde_json::to_value(map).unwrap_or_default())
		}
		"SetConfig" => {
			let update: bool = arg(args, 0, "update")?;
			let temporary: bool = arg(args, 1, "temporary")?;
			let map: crate::config::peer::ConfigMap = arg(args, 2, "config")?;
			session.set_config(update, temporary, &map).map_err(config_error)?;
			Ok(Value::Null)
		}
		"Sync" => {
			let mode: String = opt_arg(args, 0).unwrap_or_default();
			let source_modes: BTreeMap<String, String> = opt_arg(args, 1).unwrap_or_default();
			session.sync(&mode, &source_modes).map_err(config_error)?;
			Ok(Value::Null)
		}
		"Abort" => {
			session.abort();
			Ok(Value::Null)
		}
		"Suspend" => {
			session.suspend();
			Ok(Value::Null)
		}
		"GetStatus" => Ok(session.status_value()),
		"GetProgress" => Ok(session.progress_value()),
		"Restore" => {
			let dir: String = arg(args, 0, "dir")?;
			let before: bool = opt_arg(args, 1).unwrap_or(true);
			let sources: Vec<String> = opt_arg(args, 2).unwrap_or_default();
			session.restore(&dir, before, &sources).map_err(config_error)?;
			Ok(Value::Null)
		}
		"Execute" => {
			let cmd: Vec<String> = arg(args, 0, "args")?;
			let env: BTreeMap<String, String> = opt_arg(args, 1).unwrap_or_default();
			session.execute(&cmd, &env).map_err(config_error)?;
			Ok(Value::Null)
		}
		"CheckPresence" => Ok(json!(session.check_presence())),
		"GetReports" => {
			let start: usize = opt_arg(args, 0).unwrap_or(0);
			let count: usize = opt_arg(args, 1).unwrap_or(10);
			Ok(serde_json::to_value(session.get_reports(start, count)).unwrap_or_default())
		}
		// read-only mirrors of the root methods, scoped to this session's
		// configuration
		"GetConfigs" => {
			let template: bool = opt_arg(args, 0).unwrap_or(false);
			if template {
				Ok(json!(server.list_templates()))
			} else {
				Ok(json!(server.list_configs()))
			}
		}
		"CheckSource" => {
			let source: String = arg(args, 0, "source")?;
			check_source(server, session.config_name(), &source)?;
			Ok(Value::Null)
		}
		"GetDatabases" => {
			let source: String = arg(args, 0, "source")?;
			check_source(server, session.config_name(), &source)?;
			Ok(json!([["default", "", true]]))
		}
		other => Err((
			"UnknownMethod".to_string(),
			format!("no method {} on sessions", other),
		)),
	}
}

/// Handle one call addressed to a connection object
async fn dispatch_connection(
	server: &Arc<Server>,
	connection_id: &str,
	method: &str,
	args: &Value,
) -> Result<Value, MethodError> {
	let connection = server.find_connection(connection_id).ok_or_else(|| {
		("UnknownObject".to_string(), format!("no connection {}", connection_id))
	})?;

	match method {
		"Process" => {
			let data_b64: String = arg(args, 0, "message")?;
			let content_type: String = arg(args, 1, "type")?;
			let data = BASE64
				.decode(data_b64.as_bytes())
				.map_err(|e| invalid(format!("message payload: {}", e)))?;
			connection.process(data, &content_type).map_err(config_error)?;
			Ok(Value::Null)
		}
		"Close" => {
			let normal: bool = opt_arg(args, 0).unwrap_or(true);
			let error: String = opt_arg(args, 1).unwrap_or_default();
			connection.close(normal, &error);
			server.remove_connection(connection_id);
			Ok(Value::Null)
		}
		other => Err((
			"UnknownMethod".to_string(),
			format!("no method {} on connections", other),
		)),
	}
}

/// Route one call by object path
pub async fn dispatch(
	server: &Arc<Server>,
	client: &str,
	path: &str,
	method: &str,
	args: &Value,
) -> Result<Value, MethodError> {
	server.note_activity();
	if path == "/" {
		dispatch_root(server, client, method, args).await
	} else if let Some(id) = path.strip_prefix("/sessions/") {
		dispatch_session(server, client, id, method, args).await
	} else if let Some(id) = path.strip_prefix("/connections/") {
		dispatch_connection(server, id, method, args).await
	} else {
		Err(("UnknownObject".to_string(), format!("no object {}", path)))
	}
}

async fn serve_client(server: Arc<Server>, stream: UnixStream) {
	let client = Uuid::new_v4().to_string();
	debug!("bus client {} connected", client);

	let (read_half, mut write_half) = stream.into_split();
	let (out_tx, mut out_rx) = mpsc::unbounded_channel::<BusMessage>();

	// single writer task: replies and signals share the socket
	let writer = tokio::spawn(async move {
		while let Some(message) = out_rx.recv().await {
			let mut line = match serde_json::to_string(&message) {
				Ok(line) => line,
				Err(_) => continue,
			};
			line.push('\n');
			if write_half.write_all(line.as_bytes()).await.is_err() {
				break;
			}
		}
	});

	// forward broadcast signals
	let signal_tx = out_tx.clone();
	let mut signals = server.subscribe();
	let signal_task = tokio::spawn(async move {
		loop {
			match signals.recv().await {
				Ok(signal) => {
					let forward = BusMessage::Signal {
						path: signal.path,
						name: signal.name,
						args: signal.args,
					};
					if signal_tx.send(forward).is_err() {
						break;
					}
				}
				Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
					warn!("bus client lost {} signals", n);
				}
				Err(_) => break,
			}
		}
	});

	let mut lines = BufReader::new(read_half).lines();
	while let Ok(Some(line)) = lines.next_line().await {
		if line.trim().is_empty() {
			continue;
		}
		let message: BusMessage = match serde_json::from_str(&line) {
			Ok(message) => message,
			Err(e) => {
				warn!("malformed bus message from {}: {}", client, e);
				continue;
			}
		};
		if let BusMessage::Call { id, path, method, args } = message {
			let reply = match dispatch(&server, &client, &path, &method, &args).await {
				Ok(result) => BusMessage::Return { id, result },
				Err((name, message)) => BusMessage::Error { id, name, message },
			};
			if out_tx.send(reply).is_err() {
				break;
			}
		}
	}

	debug!("bus client {} disconnected", client);
	server.client_gone(&client);
	signal_task.abort();
	drop(out_tx);
	let _ = writer.await;
}

/// Accept clients until the listener fails
pub async fn run(server: Arc<Server>, listener: UnixListener) {
	info!("bus listening");
	loop {
		match listener.accept().await {
			Ok((stream, _addr)) => {
				tokio::spawn(serve_client(Arc::clone(&server), stream));
			}
			Err(e) => {
				warn!("bus accept failed: {}", e);
				break;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::engine::mock::mock_factory;
	use crate::server::ServerOptions;
	use crate::source::BackendRegistry;
	use crate::status::SyncStatus;
	use std::collections::BTreeMap as Map;
	use tempfile::TempDir;

	fn test_server(dir: &TempDir) -> Arc<Server> {
		Server::new(ServerOptions {
			config_root: Some(dir.path().to_path_buf()),
			engine: mock_factory(Vec::new(), Ok(SyncStatus::Ok)),
			backends: Arc::new(BackendRegistry::new()),
			auto_term_duration: None,
		})
	}

	fn seed_config(server: &Arc<Server>, name: &str) {
		let mut map = crate::config::peer::ConfigMap::new();
		let mut global = Map::new();
		global.insert("syncURL".to_string(), "http://sync.example.com".to_string());
		map.insert(String::new(), global);
		let mut source = Map::new();
		source.insert("sync".to_string(), "two-way".to_string());
		source.insert("type".to_string(), "memory".to_string());
		map.insert("source/addressbook".to_string(), source);
		server.open_config(name).apply_map(false, &map).unwrap();
	}

	#[tokio::test]
	async fn test_get_versions_and_capabilities() {
		let dir = TempDir::new().unwrap();
		let server = test_server(&dir);
		let result = dispatch(&server, "c", "/", "GetVersions", &json!([])).await.unwrap();
		assert_eq!(result["version"], env!("CARGO_PKG_VERSION"));

		let caps = dispatch(&server, "c", "/", "GetCapabilities", &json!([])).await.unwrap();
		assert!(caps.as_array().unwrap().iter().any(|v| v == "SessionFlags"));
	}

	#[tokio::test]
	async fn test_get_config_missing_is_typed_error() {
		let dir = TempDir::new().unwrap();
		let server = test_server(&dir);
		let err = dispatch(&server, "c", "/", "GetConfig", &json!(["nope", false]))
			.await
			.unwrap_err();
		assert_eq!(err.0, "NoSuchConfig");
	}

	#[tokio::test]
	async fn test_start_session_and_get_status() {
		let dir = TempDir::new().unwrap();
		let server = test_server(&dir);
		seed_config(&server, "work");

		let path = dispatch(&server, "c", "/", "StartSession", &json!(["work"]))
			.await
			.unwrap();
		let path = path.as_str().unwrap().to_string();
		assert!(path.starts_with("/sessions/"));

		let status = dispatch(&server, "c", &path, "GetStatus", &json!([])).await.unwrap();
		assert_eq!(status["status"], "queueing");

		let sessions = dispatch(&server, "c", "/", "GetSessions", &json!([])).await.unwrap();
		assert_eq!(sessions.as_array().unwrap().len(), 1);
	}

	#[tokio::test]
	async fn test_check_source() {
		let dir = TempDir::new().unwrap();
		let server = test_server(&dir);
		seed_config(&server, "work");

		dispatch(&server, "c", "/", "CheckSource", &json!(["work", "addressbook"]))
			.await
			.unwrap();
		let err = dispatch(&server, "c", "/", "CheckSource", &json!(["work", "calendar"]))
			.await
			.unwrap_err();
		assert_eq!(err.0, "NoSuchSource");
	}

	#[tokio::test]
	async fn test_unknown_method_and_object() {
		let dir = TempDir::new().unwrap();
		let server = test_server(&dir);
		let err = dispatch(&server, "c", "/", "Juggle", &json!([])).await.unwrap_err();
		assert_eq!(err.0, "UnknownMethod");

		let err = dispatch(&server, "c", "/sessions/nope", "GetStatus", &json!([]))
			.await
			.unwrap_err();
		assert_eq!(err.0, "UnknownObject");
	}

	#[tokio::test]
	async fn test_set_config_temporary_does_not_persist() {
		let dir = TempDir::new().unwrap();
		let server = test_server(&dir);
		seed_config(&server, "work");

		let path = dispatch(&server, "c", "/", "StartSession", &json!(["work"]))
			.await
			.unwrap();
		let path = path.as_str().unwrap().to_string();

		let filter = json!({"": {"syncURL": "http://tmp.example.com"}});
		dispatch(&server, "c", &path, "SetConfig", &json!([true, true, filter]))
			.await
			.unwrap();

		// session view shows the override
		let session_view =
			dispatch(&server, "c", &path, "GetConfig", &json!([false])).await.unwrap();
		assert_eq!(session_view[""]["syncURL"], "http://tmp.example.com");

		// persistent config is unchanged
		let persistent =
			dispatch(&server, "c", "/", "GetConfig", &json!(["work", false])).await.unwrap();
		assert_eq!(persistent[""]["syncURL"], "http://sync.example.com");
	}

	#[tokio::test]
	async fn test_empty_set_config_removes_configuration() {
		let dir = TempDir::new().unwrap();
		let server = test_server(&dir);
		seed_config(&server, "work");

		let path = dispatch(&server, "c", "/", "StartSession", &json!(["work"]))
			.await
			.unwrap();
		let path = path.as_str().unwrap().to_string();
		// no scheduler loop in this test: activate by hand
		server.find_session(path.strip_prefix("/sessions/").unwrap()).unwrap().activate();

		dispatch(&server, "c", &path, "SetConfig", &json!([false, false, {}]))
			.await
			.unwrap();

		let err = dispatch(&server, "c", "/", "GetConfig", &json!(["work", false]))
			.await
			.unwrap_err();
		assert_eq!(err.0, "NoSuchConfig");
	}

	#[tokio::test]
	async fn test_persistent_set_config_requires_activation() {
		let dir = TempDir::new().unwrap();
		let server = test_server(&dir);
		seed_config(&server, "work");

		let path = dispatch(&server, "c", "/", "StartSession", &json!(["work"]))
			.await
			.unwrap();
		let path = path.as_str().unwrap().to_string();

		let change = json!({"": {"username": "me"}});
		let err = dispatch(&server, "c", &path, "SetConfig", &json!([true, false, change]))
			.await
			.unwrap_err();
		assert_eq!(err.0, "InvalidCall");
	}
}

// vim: ts=4

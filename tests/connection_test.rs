/// Integration tests for connection dispatch: initial-message routing by
/// device id and Server-Alerted Notifications.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use pimsync::engine::mock::mock_factory;
use pimsync::san::{build_san, SanEntry, SanMessage};
use pimsync::server::connection::ConnectionState;
use pimsync::server::{Server, ServerOptions};
use pimsync::source::BackendRegistry;
use pimsync::status::{SyncMode, SyncStatus};
use pimsync::transport::{CONTENT_TYPE_SAN, CONTENT_TYPE_SYNCML_XML};

fn server_in(dir: &TempDir) -> Arc<Server> {
	Server::new(ServerOptions {
		config_root: Some(dir.path().join("configs")),
		engine: mock_factory(Vec::new(), Ok(SyncStatus::Ok)),
		backends: Arc::new(BackendRegistry::new()),
		auto_term_duration: None,
	})
}

fn seed_config(server: &Arc<Server>, name: &str, extra: &[(&str, &str)]) {
	let mut map = pimsync::ConfigMap::new();
	let mut global = BTreeMap::new();
	global.insert("syncURL".to_string(), "http://sync.example.com".to_string());
	let log_dir = server.open_config(name).tree().root().join("logs");
	global.insert("logDir".to_string(), log_dir.display().to_string());
	for (key, value) in extra {
		global.insert(key.to_string(), value.to_string());
	}
	map.insert(String::new(), global);
	let mut source = BTreeMap::new();
	source.insert("sync".to_string(), "two-way".to_string());
	source.insert("type".to_string(), "memory".to_string());
	source.insert("uri".to_string(), "card".to_string());
	map.insert("source/addressbook".to_string(), source);
	server.open_config(name).apply_map(false, &map).unwrap();
}

fn initial_message(device_id: &str) -> Vec<u8> {
	format!(
		"<SyncML><SyncHdr><Target><LocURI>http://us/sync</LocURI></Target>\
		 <Source><LocURI>{}</LocURI></Source></SyncHdr></SyncML>",
		device_id
	)
	.into_bytes()
}

#[tokio::test]
async fn test_initial_message_selects_config_by_device_id() {
	let dir = TempDir::new().unwrap();
	let server = server_in(&dir);
	seed_config(&server, "phone", &[("remoteDeviceId", "IMEI:12345")]);
	seed_config(&server, "other", &[("remoteDeviceId", "IMEI:99999")]);

	let connection = server.add_connection(BTreeMap::new(), false);
	connection.process(initial_message("IMEI:12345"), CONTENT_TYPE_SYNCML_XML).unwrap();

	let session = connection.session().expect("session created");
	assert_eq!(session.config_name(), "phone");
	assert_eq!(session.remote_device_id(), "IMEI:12345");
	assert_eq!(connection.state(), ConnectionState::Processing);
}

#[tokio::test]
async fn test_initial_message_unknown_device_fails_connection() {
	let dir = TempDir::new().unwrap();
	let server = server_in(&dir);
	seed_config(&server, "phone", &[("remoteDeviceId", "IMEI:12345")]);

	let connection = server.add_connection(BTreeMap::new(), false);
	let err = connection
		.process(initial_message("IMEI:00000"), CONTENT_TYPE_SYNCML_XML)
		.unwrap_err();
	assert!(err.to_string().contains("IMEI:00000"));
	assert_eq!(connection.state(), ConnectionState::Failed);
	assert!(!connection.failure().is_empty());
}

#[tokio::test]
async fn test_new_connection_kills_older_session_for_same_device() {
	let dir = TempDir::new().unwrap();
	let server = server_in(&dir);
	seed_config(&server, "phone", &[("remoteDeviceId", "IMEI:12345")]);

	let first = server.add_connection(BTreeMap::new(), false);
	first.process(initial_message("IMEI:12345"), CONTENT_TYPE_SYNCML_XML).unwrap();
	let old_session = first.session().unwrap();

	let second = server.add_connection(BTreeMap::new(), false);
	second.process(initial_message("IMEI:12345"), CONTENT_TYPE_SYNCML_XML).unwrap();

	assert!(old_session.is_done(), "stale session must be aborted");
	let new_session = second.session().unwrap();
	assert!(!new_session.is_done());
	assert_ne!(old_session.id(), new_session.id());
}

#[tokio::test]
async fn test_san_selects_config_and_modes() {
	let dir = TempDir::new().unwrap();
	let server = server_in(&dir);
	seed_config(&server, "work", &[]);

	let san = build_san(&SanMessage {
		version: 12,
		session_id: 1,
		server_id: "http://sync.example.com".to_string(),
		entries: vec![SanEntry {
			mode: SyncMode::RefreshFromServer,
			content_type: 0x0707,
			uri: "card".to_string(),
		}],
	});

	let connection = server.add_connection(BTreeMap::new(), false);
	connection.process(san, CONTENT_TYPE_SAN).unwrap();

	let session = connection.session().expect("session created");
	assert_eq!(session.config_name(), "work");
	// the SAN entry overrides the configured mode
	let config = session.get_config().unwrap();
	assert_eq!(config["source/addressbook"]["sync"], "refresh-from-server");
	// notifications need no reply: the relay is already final
	assert_eq!(connection.state(), ConnectionState::Final);
	connection.close(true, "");
	assert_eq!(connection.state(), ConnectionState::Done);
}

#[tokio::test]
async fn test_san_with_unknown_uri_enables_no_source() {
	let dir = TempDir::new().unwrap();
	let server = server_in(&dir);
	seed_config(&server, "work", &[]);

	let san = build_san(&SanMessage {
		version: 12,
		session_id: 2,
		server_id: "http://sync.example.com".to_string(),
		entries: vec![SanEntry {
			mode: SyncMode::TwoWay,
			content_type: 0x0706,
			uri: "events".to_string(),
		}],
	});

	let connection = server.add_connection(BTreeMap::new(), false);
	connection.process(san, CONTENT_TYPE_SAN).unwrap();

	let session = connection.session().expect("session created");
	let config = session.get_config().unwrap();
	// the only configured source is not addressed by the SAN
	assert_eq!(config["source/addressbook"]["sync"], "disabled");

	// run it to completion: the sync is a no-op
	let runner = tokio::spawn(Arc::clone(&server).run());
	tokio::time::timeout(Duration::from_secs(5), async {
		while !session.is_done() {
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
	})
	.await
	.expect("session must finish");
	assert_eq!(session.status_value()["error"], 0);
	runner.abort();
}

#[tokio::test]
async fn test_san_zero_entries_keeps_configured_modes() {
	let dir = TempDir::new().unwrap();
	let server = server_in(&dir);
	seed_config(&server, "work", &[]);

	let san = build_san(&SanMessage {
		version: 12,
		session_id: 3,
		server_id: "http://sync.example.com".to_string(),
		entries: Vec::new(),
	});

	let connection = server.add_connection(BTreeMap::new(), false);
	connection.process(san, CONTENT_TYPE_SAN).unwrap();

	let session = connection.session().expect("session created");
	let config = session.get_config().unwrap();
	assert_eq!(config["source/addressbook"]["sync"], "two-way");
}

#[tokio::test]
async fn test_premature_close_fails_session() {
	let dir = TempDir::new().unwrap();
	let server = server_in(&dir);
	seed_config(&server, "phone", &[("remoteDeviceId", "IMEI:12345")]);

	let connection = server.add_connection(BTreeMap::new(), false);
	connection.process(initial_message("IMEI:12345"), CONTENT_TYPE_SYNCML_XML).unwrap();
	let session = connection.session().unwrap();

	connection.close(true, "");
	assert_eq!(connection.state(), ConnectionState::Failed);
	assert!(session.is_done());
}

// vim: ts=4

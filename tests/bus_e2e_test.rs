/// End-to-end test over the bus socket: a client attaches, configures a
/// peer, runs a sync against the scheduler and reads the report back,
/// all through the same calls the CLI uses.
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio::net::UnixListener;

use pimsync::bus::client::BusClient;
use pimsync::bus::server as bus_server;
use pimsync::engine::mock::mock_factory;
use pimsync::server::{Server, ServerOptions};
use pimsync::source::BackendRegistry;
use pimsync::status::SyncStatus;

async fn daemon(dir: &TempDir) -> (Arc<Server>, std::path::PathBuf) {
	let server = Server::new(ServerOptions {
		config_root: Some(dir.path().join("configs")),
		engine: mock_factory(Vec::new(), Ok(SyncStatus::Ok)),
		backends: Arc::new(BackendRegistry::new()),
		auto_term_duration: None,
	});
	let socket = dir.path().join("bus.sock");
	let listener = UnixListener::bind(&socket).unwrap();
	tokio::spawn(bus_server::run(Arc::clone(&server), listener));
	tokio::spawn(Arc::clone(&server).run());
	(server, socket)
}

fn config_map(dir: &TempDir) -> serde_json::Value {
	json!({
		"": {
			"syncURL": "http://sync.example.com",
			"username": "me",
			"logDir": dir.path().join("logs").display().to_string(),
		},
		"source/addressbook": {
			"sync": "two-way",
			"type": "memory",
			"uri": "card",
		},
	})
}

async fn wait_session_status(
	signals: &mut tokio::sync::mpsc::UnboundedReceiver<pimsync::bus::BusSignal>,
	path: &str,
	wanted: &str,
) -> serde_json::Value {
	loop {
		let signal = tokio::time::timeout(Duration::from_secs(5), signals.recv())
			.await
			.expect("signal within timeout")
			.expect("bus open");
		if signal.path == path && signal.name == "StatusChanged" {
			let status = signal.args["status"].as_str().unwrap_or("").to_string();
			if status.starts_with(wanted) {
				return signal.args;
			}
		}
	}
}

#[tokio::test]
async fn test_configure_sync_report_cycle() {
	let dir = TempDir::new().unwrap();
	let (_server, socket) = daemon(&dir).await;

	let client = BusClient::connect(&socket).await.unwrap();
	let mut signals = client.signals().unwrap();
	client.call("/", "Attach", json!([])).await.unwrap();

	// create the configuration through an active session
	let path = client.call("/", "StartSession", json!(["work"])).await.unwrap();
	let path = path.as_str().unwrap().to_string();
	wait_session_status(&mut signals, &path, "idle").await;
	client
		.call(&path, "SetConfig", json!([false, false, config_map(&dir)]))
		.await
		.unwrap();
	client.call(&path, "Abort", json!([])).await.unwrap();
	wait_session_status(&mut signals, &path, "done").await;

	// the configuration is now visible
	let configs = client.call("/", "GetConfigs", json!([false])).await.unwrap();
	assert_eq!(configs, json!(["work"]));

	// run a sync in a second session
	let path = client.call("/", "StartSession", json!(["work"])).await.unwrap();
	let path = path.as_str().unwrap().to_string();
	client.call(&path, "Attach", json!([])).await.unwrap();
	wait_session_status(&mut signals, &path, "idle").await;
	client.call(&path, "Sync", json!(["", {}])).await.unwrap();

	let final_status = wait_session_status(&mut signals, &path, "done").await;
	assert_eq!(final_status["error"], 0);

	// exactly one report exists now
	let reports = client.call("/", "GetReports", json!(["work", 0, 10])).await.unwrap();
	let reports = reports.as_array().unwrap();
	assert_eq!(reports.len(), 1);
	assert_eq!(reports[0]["peer"], "work");
	assert_eq!(reports[0]["status"], 0);

	client.call(&path, "Detach", json!([])).await.unwrap();
	client.call("/", "Detach", json!([])).await.unwrap();
}

#[tokio::test]
async fn test_sync_mode_override_rejected_when_invalid() {
	let dir = TempDir::new().unwrap();
	let (_server, socket) = daemon(&dir).await;

	let client = BusClient::connect(&socket).await.unwrap();
	let mut signals = client.signals().unwrap();

	let path = client.call("/", "StartSession", json!(["work"])).await.unwrap();
	let path = path.as_str().unwrap().to_string();
	wait_session_status(&mut signals, &path, "idle").await;
	client
		.call(&path, "SetConfig", json!([false, false, config_map(&dir)]))
		.await
		.unwrap();

	let err = client.call(&path, "Sync", json!(["sideways", {}])).await.unwrap_err();
	assert!(err.to_string().contains("sideways"));

	// a valid alias passes and the session completes
	client.call(&path, "Sync", json!(["refresh-client", {}])).await.unwrap();
	let final_status = wait_session_status(&mut signals, &path, "done").await;
	assert_eq!(final_status["error"], 0);
}

#[tokio::test]
async fn test_presence_signal_broadcast() {
	let dir = TempDir::new().unwrap();
	let (_server, socket) = daemon(&dir).await;

	let client = BusClient::connect(&socket).await.unwrap();
	let mut signals = client.signals().unwrap();

	// configure a peer first
	let path = client.call("/", "StartSession", json!(["work"])).await.unwrap();
	let path = path.as_str().unwrap().to_string();
	wait_session_status(&mut signals, &path, "idle").await;
	client
		.call(&path, "SetConfig", json!([false, false, config_map(&dir)]))
		.await
		.unwrap();
	client.call(&path, "Abort", json!([])).await.unwrap();

	// reachable by default (fail open)
	let presence = client.call("/", "CheckPresence", json!(["work"])).await.unwrap();
	assert_eq!(presence[0], "");

	// a network stack reports: everything down
	client.call("/", "SetPresence", json!([[], []])).await.unwrap();
	let presence = client.call("/", "CheckPresence", json!(["work"])).await.unwrap();
	assert_eq!(presence[0], "no transport");

	// wifi comes up: Presence signal announces reachability
	client.call("/", "SetPresence", json!([["wifi"], []])).await.unwrap();
	loop {
		let signal = tokio::time::timeout(Duration::from_secs(5), signals.recv())
			.await
			.expect("signal within timeout")
			.expect("bus open");
		if signal.name == "Presence" && signal.args[0] == "work" && signal.args[1] == "" {
			break;
		}
	}
}

// vim: ts=4

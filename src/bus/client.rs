//! Bus client used by the command line tools
//!
//! One background task owns the socket's read half and routes returns to
//! their pending calls and signals to a channel the caller can drain.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};

use crate::bus::{BusMessage, BusSignal};
use crate::error::BusError;
use crate::logging::debug;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, BusError>>>>>;

/// Client half of the bus
pub struct BusClient {
	writer: mpsc::UnboundedSender<BusMessage>,
	pending: Pending,
	next_id: AtomicU64,
	signals: Mutex<Option<mpsc::UnboundedReceiver<BusSignal>>>,
}

impl BusClient {
	/// Connect to the daemon socket
	pub async fn connect<P: AsRef<Path>>(socket: P) -> Result<Self, BusError> {
		let stream = UnixStream::connect(socket.as_ref()).await?;
		let (read_half, mut write_half) = stream.into_split();

		let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<BusMessage>();
		tokio::spawn(async move {
			while let Some(message) = writer_rx.recv().await {
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

		let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
		let (signal_tx, signal_rx) = mpsc::unbounded_channel();

		let reader_pending = Arc::clone(&pending);
		tokio::spawn(async move {
			let mut lines = BufReader::new(read_half).lines();
			while let Ok(Some(line)) = lines.next_line().await {
				let message: BusMessage = match serde_json::from_str(&line) {
					Ok(message) => message,
					Err(e) => {
						debug!("malformed bus reply: {}", e);
						continue;
					}
				};
				match message {
					BusMessage::Return { id, result } => {
						if let Some(tx) = reader_pending
							.lock()
							.unwrap_or_else(|e| e.into_inner())
							.remove(&id)
						{
							let _ = tx.send(Ok(result));
						}
					}
					BusMessage::Error { id, name, message } => {
						if let Some(tx) = reader_pending
							.lock()
							.unwrap_or_else(|e| e.into_inner())
							.remove(&id)
						{
							let _ = tx.send(Err(BusError::Remote { name, message }));
						}
					}
					BusMessage::Signal { path, name, args } => {
						let _ = signal_tx.send(BusSignal { path, name, args });
					}
					BusMessage::Call { .. } => {}
				}
			}
			// connection gone: fail all pending calls
			let mut pending = reader_pending.lock().unwrap_or_else(|e| e.into_inner());
			for (_, tx) in pending.drain() {
				let _ = tx.send(Err(BusError::Disconnected));
			}
		});

		Ok(BusClient {
			writer: writer_tx,
			pending,
			next_id: AtomicU64::new(1),
			signals: Mutex::new(Some(signal_rx)),
		})
	}

	/// Invoke a method and wait for its return value
	pub async fn call(&self, path: &str, method: &str, args: Value) -> Result<Value, BusError> {
		let id = self.next_id.fetch_add(1, Ordering::SeqCst);
		let (tx, rx) = oneshot::channel();
		self.pending.lock().unwrap_or_else(|e| e.into_inner()).insert(id, tx);

		self.writer
			.send(BusMessage::Call {
				id,
				path: path.to_string(),
				method: method.to_string(),
				args,
			})
			.map_err(|_| BusError::Disconnected)?;

		rx.await.map_err(|_| BusError::Disconnected)?
	}

	/// Take the signal stream; can be taken once
	pub fn signals(&self) -> Option<mpsc::UnboundedReceiver<BusSignal>> {
		self.signals.lock().unwrap_or_else(|e| e.into_inner()).take()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::bus::server as bus_server;
	use crate::engine::mock::mock_factory;
	use crate::server::{Server, ServerOptions};
	use crate::source::BackendRegistry;
	use crate::status::SyncStatus;
	use tempfile::TempDir;
	use tokio::net::UnixListener;

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
		(server, socket)
	}

	#[tokio::test]
	async fn test_call_round_trip() {
		let dir = TempDir::new().unwrap();
		let (_server, socket) = daemon(&dir).await;

		let client = BusClient::connect(&socket).await.unwrap();
		let versions = client.call("/", "GetVersions", serde_json::json!([])).await.unwrap();
		assert_eq!(versions["version"], env!("CARGO_PKG_VERSION"));
	}

	#[tokio::test]
	async fn test_remote_error_is_typed() {
		let dir = TempDir::new().unwrap();
		let (_server, socket) = daemon(&dir).await;

		let client = BusClient::connect(&socket).await.unwrap();
		let err = client
			.call("/", "GetConfig", serde_json::json!(["missing", false]))
			.await
			.unwrap_err();
		match err {
			BusError::Remote { name, .. } => assert_eq!(name, "NoSuchConfig"),
			other => panic!("unexpected error {:?}", other),
		}
	}

	#[tokio::test]
	async fn test_signals_arrive() {
		let dir = TempDir::new().unwrap();
		let (server, socket) = daemon(&dir).await;

		let client = BusClient::connect(&socket).await.unwrap();
		let mut signals = client.signals().unwrap();
		// one call makes sure the subscription is up
		client.call("/", "GetVersions", serde_json::json!([])).await.unwrap();

		server.signal("/", "TestSignal", serde_json::json!(["hello"]));
		let signal = signals.recv().await.unwrap();
		assert_eq!(signal.name, "TestSignal");
		assert_eq!(signal.args[0], "hello");
	}
}

// vim: ts=4

//! Session scheduler and server state
//!
//! One `Server` owns the session queue, the active-session lock, client
//! attach bookkeeping, connections, info requests, presence and auto-sync.
//! Everything runs on the tokio loop; other components talk to the server
//! through `Arc<Server>` and get woken through its Notify handles.

pub mod autosync;
pub mod connection;
pub mod presence;
pub mod watchdog;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::{broadcast, Notify};

use crate::bus::BusSignal;
use crate::config::peer::PeerConfig;
use crate::config::templates;
use crate::config::tree::{self, FileConfigTree, Layout};
use crate::engine::EngineFactory;
use crate::error::ConfigError;
use crate::info::InfoReq;
use crate::logging::{debug, info, warn};
use crate::san::SanCandidate;
use crate::server::autosync::{AutoSyncManager, AutoSyncSetting, AutoSyncTask};
use crate::server::connection::Connection;
use crate::server::presence::{PresenceMonitor, TransportKind};
use crate::server::watchdog::{BinaryWatch, SHUTDOWN_QUIESCENCE};
use crate::session::{priority, Session, SESSION_LINGER};
use crate::source::BackendRegistry;

/// Composition-time options
pub struct ServerOptions {
	/// override configuration discovery (tests, containers); None uses
	/// the regular layout probing per configuration name
	pub config_root: Option<PathBuf>,
	pub engine: EngineFactory,
	pub backends: Arc<BackendRegistry>,
	/// exit after being idle this long; None = stay forever
	pub auto_term_duration: Option<Duration>,
}

struct ClientInfo {
	/// Attach() references to the server itself
	server_refs: usize,
}

struct Queues {
	waiting: VecDeque<Arc<Session>>,
	active: Option<Arc<Session>>,
}

/// The scheduler
pub struct Server {
	options: ServerOptions,
	/// back-reference for handing out Weak pointers and spawning tasks
	this: std::sync::Weak<Server>,
	queues: Mutex<Queues>,
	/// every live session by id, including done ones within their linger
	sessions: Mutex<HashMap<String, Arc<Session>>>,
	connections: Mutex<HashMap<String, Arc<Connection>>>,
	clients: Mutex<HashMap<String, ClientInfo>>,
	info_reqs: Mutex<HashMap<String, Arc<InfoReq>>>,
	next_info_id: AtomicU64,
	signals: broadcast::Sender<BusSignal>,
	wake: Notify,
	presence: PresenceMonitor,
	autosync: AutoSyncManager,
	/// moment of the last queue/client/bus activity
	last_activity: Mutex<Instant>,
	/// moment of the last watched-binary change
	last_binary_change: Mutex<Option<Instant>>,
	shutdown_queued: AtomicBool,
	terminate: AtomicBool,
}

impl Server {
	pub fn new(options: ServerOptions) -> Arc<Server> {
		let (signals, _) = broadcast::channel(256);
		let server = Arc::new_cyclic(|this| Server {
			options,
			this: this.clone(),
			queues: Mutex::new(Queues { waiting: VecDeque::new(), active: None }),
			sessions: Mutex::new(HashMap::new()),
			connections: Mutex::new(HashMap::new()),
			clients: Mutex::new(HashMap::new()),
			info_reqs: Mutex::new(HashMap::new()),
			next_info_id: AtomicU64::new(1),
			signals,
			wake: Notify::new(),
			presence: PresenceMonitor::new(),
			autosync: AutoSyncManager::new(),
			last_activity: Mutex::new(Instant::now()),
			last_binary_change: Mutex::new(None),
			shutdown_queued: AtomicBool::new(false),
			terminate: AtomicBool::new(false),
		});
		server.reload_autosync();
		server
	}

	// --- signals ------------------------------------------------------

	pub fn signal(&self, path: &str, name: &str, args: serde_json::Value) {
		let _ = self.signals.send(BusSignal {
			path: path.to_string(),
			name: name.to_string(),
			args,
		});
	}

	pub fn subscribe(&self) -> broadcast::Receiver<BusSignal> {
		self.signals.subscribe()
	}

	/// Remember that something happened; postpones idle shutdown
	pub fn note_activity(&self) {
		*self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
	}

	// --- configuration access ----------------------------------------

	pub fn open_config(&self, name: &str) -> PeerConfig {
		match &self.options.config_root {
			Some(root) => PeerConfig::open_at(
				name,
				FileConfigTree::new(root.join(name.to_lowercase()), Layout::Modern, false),
			),
			None => PeerConfig::open(name),
		}
	}

	pub fn list_configs(&self) -> Vec<String> {
		match &self.options.config_root {
			Some(root) => {
				let mut names = Vec::new();
				if let Ok(read) = std::fs::read_dir(root) {
					for dent in read.flatten() {
						if dent.path().join("config.ini").is_file() {
							if let Some(name) = dent.file_name().to_str() {
								names.push(name.to_string());
							}
						}
					}
				}
				names.sort();
				names
			}
			None => tree::list_configs(),
		}
	}

	pub fn list_templates(&self) -> Vec<String> {
		templates::list_templates().iter().map(|t| t.name.to_string()).collect()
	}

	pub fn config_changed(&self) {
		self.reload_autosync();
		self.signal("/", "ConfigChanged", json!([]));
		self.wake.notify_waiters();
	}

	pub fn backends(&self) -> &BackendRegistry {
		&self.options.backends
	}

	pub fn engine_factory(&self) -> EngineFactory {
		Arc::clone(&self.options.engine)
	}

	pub fn presence(&self) -> &PresenceMonitor {
		&self.presence
	}

	pub fn autosync(&self) -> &AutoSyncManager {
		&self.autosync
	}

	/// Presence of one named peer
	pub fn check_presence(&self, name: &str) -> Result<(String, Vec<String>), ConfigError> {
		let config = self.open_config(name);
		if !config.exists() {
			return Err(ConfigError::NoSuchConfig { name: name.to_string() });
		}
		Ok(self.presence.peer_status(&config.sync_urls()))
	}

	/// Push a presence update to every peer's listeners
	pub fn broadcast_presence(&self) {
		for name in self.list_configs() {
			let config = self.open_config(&name);
			let (status, transports) = self.presence.peer_status(&config.sync_urls());
			self.signal("/", "Presence", json!([name, status, transports]));
		}
		// transports may have come up: interval-0 tasks run on the edge
		if self.autosync.schedule_all(&self.presence) > 0 {
			self.wake.notify_waiters();
		}
	}

	// --- session queue ------------------------------------------------

	/// Create a session and put it into the queue
	pub fn start_session(
		&self,
		config_name: &str,
		flags: Vec<String>,
		session_priority: i32,
	) -> Arc<Session> {
		let session = Session::new(
			self.this.clone(),
			config_name,
			flags,
			session_priority,
		);
		self.sessions
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.insert(session.id().to_string(), Arc::clone(&session));
		self.enqueue(Arc::clone(&session));
		self.signal("/", "SessionChanged", json!([session.path(), true]));
		self.note_activity();
		session
	}

	/// Stable priority insertion: a new session goes behind every session
	/// of equal or higher priority.
	fn enqueue(&self, session: Arc<Session>) {
		let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
		let pos = queues
			.waiting
			.iter()
			.position(|s| s.priority() < session.priority())
			.unwrap_or(queues.waiting.len());
		queues.waiting.insert(pos, session);
		drop(queues);
		self.wake.notify_waiters();
	}

	/// Sessions currently known (queued, active, lingering)
	pub fn get_sessions(&self) -> Vec<Arc<Session>> {
		let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
		let mut list: Vec<Arc<Session>> = sessions.values().cloned().collect();
		list.sort_by(|a, b| a.id().cmp(b.id()));
		list
	}

	pub fn find_session(&self, id: &str) -> Option<Arc<Session>> {
		self.sessions.lock().unwrap_or_else(|e| e.into_inner()).get(id).cloned()
	}

	pub fn active_session(&self) -> Option<Arc<Session>> {
		self.queues.lock().unwrap_or_else(|e| e.into_inner()).active.clone()
	}

	/// Called by a session when it reaches DONE
	pub fn session_done(&self, session: &Session) {
		{
			let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
			if queues.active.as_ref().map(|s| s.id() == session.id()).unwrap_or(false) {
				queues.active = None;
			}
			queues.waiting.retain(|s| s.id() != session.id());
		}
		if session.flags().iter().any(|f| f == "autosync") {
			self.autosync.task_done();
		}
		self.note_activity();
		self.wake.notify_waiters();

		// delayed destruction for post-mortem inspection
		let server = match self.this.upgrade() {
			Some(server) => server,
			None => return,
		};
		let id = session.id().to_string();
		let path = session.path();
		tokio::spawn(async move {
			loop {
				tokio::time::sleep(SESSION_LINGER).await;
				let attached = server
					.find_session(&id)
					.map(|s| s.attachment_count())
					.unwrap_or(0);
				if attached == 0 {
					break;
				}
			}
			server.sessions.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
			server.signal("/", "SessionChanged", json!([path, false]));
		});
	}

	/// Abort every session for a peer device; a fresh connection from the
	/// same device makes the older ones obsolete.
	pub fn kill_sessions_by_device(&self, device_id: &str) {
		let victims: Vec<Arc<Session>> = {
			let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
			queues
				.waiting
				.iter()
				.chain(queues.active.iter())
				.filter(|s| s.remote_device_id().eq_ignore_ascii_case(device_id))
				.cloned()
				.collect()
		};
		for session in victims {
			info!(
				"aborting session {} for device \"{}\": newer connection wins",
				session.id(),
				device_id
			);
			session.abort();
		}
	}

	// --- clients ------------------------------------------------------

	pub fn attach_client(&self, client: &str) {
		let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
		clients
			.entry(client.to_string())
			.or_insert(ClientInfo { server_refs: 0 })
			.server_refs += 1;
		drop(clients);
		self.note_activity();
	}

	pub fn detach_client(&self, client: &str) -> Result<(), ConfigError> {
		let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
		match clients.get_mut(client) {
			Some(info) if info.server_refs > 0 => {
				info.server_refs -= 1;
				Ok(())
			}
			_ => Err(ConfigError::InvalidCall {
				message: "client is not attached".to_string(),
			}),
		}
	}

	/// A bus client disappeared: drop all its references
	pub fn client_gone(&self, client: &str) {
		self.clients.lock().unwrap_or_else(|e| e.into_inner()).remove(client);
		for session in self.get_sessions() {
			session.detach_all(client);
		}
		self.note_activity();
		self.wake.notify_waiters();
	}

	fn attached_client_count(&self) -> usize {
		self.clients
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.values()
			.filter(|c| c.server_refs > 0)
			.count()
	}

	// --- connections --------------------------------------------------

	pub fn add_connection(
		&self,
		peer: BTreeMap<String, String>,
		must_authenticate: bool,
	) -> Arc<Connection> {
		let connection = Connection::new(self.this.clone(), peer, must_authenticate);
		self.connections
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.insert(connection.id().to_string(), Arc::clone(&connection));
		self.note_activity();
		connection
	}

	pub fn find_connection(&self, id: &str) -> Option<Arc<Connection>> {
		self.connections.lock().unwrap_or_else(|e| e.into_inner()).get(id).cloned()
	}

	pub fn remove_connection(&self, id: &str) {
		self.connections.lock().unwrap_or_else(|e| e.into_inner()).remove(id);
	}

	// --- info requests ------------------------------------------------

	pub fn create_info_request(
		&self,
		session_path: &str,
		req_type: &str,
		params: BTreeMap<String, String>,
		timeout: Duration,
	) -> Arc<InfoReq> {
		let id = self.next_info_id.fetch_add(1, Ordering::SeqCst).to_string();
		let request = Arc::new(InfoReq::new(&id, session_path, req_type, params, timeout));
		self.info_reqs
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.insert(id.clone(), Arc::clone(&request));
		self.signal(
			"/",
			"InfoRequest",
			json!([id, session_path, "request", "", req_type, request.params()]),
		);
		request
	}

	/// Bus method: a client answers an info request
	pub fn info_response(
		&self,
		client: &str,
		id: &str,
		state: &str,
		response: BTreeMap<String, String>,
	) -> Result<(), ConfigError> {
		let request = self
			.info_reqs
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.get(id)
			.cloned();
		let request = match request {
			Some(r) => r,
			// late answers to expired requests are not an error
			None => return Ok(()),
		};

		match state {
			"working" => {
				if request.set_working(client) {
					self.signal(
						"/",
						"InfoRequest",
						json!([
							id,
							request.session_path(),
							"waiting",
							client,
							request.req_type(),
							request.params()
						]),
					);
				}
				Ok(())
			}
			"response" => {
				if request.set_response(client, response) {
					self.signal(
						"/",
						"InfoRequest",
						json!([
							id,
							request.session_path(),
							"done",
							client,
							request.req_type(),
							request.params()
						]),
					);
				}
				Ok(())
			}
			other => Err(ConfigError::InvalidCall {
				message: format!("invalid info request state \"{}\"", other),
			}),
		}
	}

	pub fn cancel_info_request(&self, id: &str) {
		if let Some(request) = self
			.info_reqs
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.get(id)
			.cloned()
		{
			request.cancel(crate::info::InfoStatus::Cancel);
			self.signal(
				"/",
				"InfoRequest",
				json!([
					id,
					request.session_path(),
					"done",
					request.handler().unwrap_or_default(),
					request.req_type(),
					request.params()
				]),
			);
		}
	}

	pub fn finish_info_request(&self, id: &str) {
		self.info_reqs.lock().unwrap_or_else(|e| e.into_inner()).remove(id);
	}

	// --- SAN dispatch helpers -----------------------------------------

	pub fn san_candidates(&self) -> Vec<SanCandidate> {
		self.list_configs()
			.into_iter()
			.map(|name| {
				let config = self.open_config(&name);
				SanCandidate { config_name: name, sync_urls: config.sync_urls() }
			})
			.collect()
	}

	/// Create a configuration for an unknown alerting server
	pub fn create_san_config(
		&self,
		server_id: &str,
		timestamp: u64,
	) -> Result<String, ConfigError> {
		let sanitized: String = server_id
			.chars()
			.map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
			.collect();
		let name = format!("{}_{}", sanitized, timestamp);
		info!("creating configuration \"{}\" for alerting server", name);

		let template = templates::find_template("default").expect("default template exists");
		let mut map = template.to_map();
		map.entry(String::new())
			.or_default()
			.insert("syncURL".to_string(), server_id.to_string());
		let config = self.open_config(&name);
		config.apply_map(false, &map)?;
		self.config_changed();
		Ok(name)
	}

	pub fn find_config_by_device(&self, device_id: &str) -> Option<String> {
		self.list_configs().into_iter().find(|name| {
			self.open_config(name)
				.remote_device_id()
				.eq_ignore_ascii_case(device_id)
		})
	}

	// --- auto-sync ----------------------------------------------------

	/// Re-derive the auto-sync task lists from the configurations
	pub fn reload_autosync(&self) {
		let mut tasks = Vec::new();
		for name in self.list_configs() {
			let config = self.open_config(&name);
			let setting = AutoSyncSetting::parse(&config.get("autoSync").unwrap_or_default());
			if setting == AutoSyncSetting::Off {
				continue;
			}
			let interval = config.get_u64("autoSyncInterval");
			let delay = config.get_u64("autoSyncDelay");
			for url in config.sync_urls() {
				if !setting.allows(TransportKind::of_url(&url)) {
					continue;
				}
				tasks.push((interval, AutoSyncTask { peer: name.clone(), url, delay }));
			}
		}
		debug!("auto-sync: {} tasks loaded", tasks.len());
		self.autosync.load(tasks);
	}

	/// Turn a due auto-sync task into a session
	fn start_autosync_task(&self, task: AutoSyncTask) {
		info!("starting automatic sync of \"{}\" via {}", task.peer, task.url);
		let session =
			self.start_session(&task.peer, vec!["autosync".to_string()], priority::AUTOSYNC);

		// one temporary filter per endpoint, so each URL is tried on its
		// own instead of iterating the whole syncURL list
		let mut map = crate::config::peer::ConfigMap::new();
		let mut global = BTreeMap::new();
		global.insert("syncURL".to_string(), task.url.clone());
		map.insert(String::new(), global);
		if let Err(e) = session.set_config(true, true, &map) {
			warn!("auto-sync session filter rejected: {}", e);
		}

		let run = session;
		tokio::spawn(async move {
			run.wait_until_active().await;
			if let Err(e) = run.sync("", &BTreeMap::new()) {
				warn!("auto-sync could not start: {}", e);
			}
		});
	}

	// --- shutdown on binary change ------------------------------------

	fn schedule_shutdown(&self) {
		*self.last_binary_change.lock().unwrap_or_else(|e| e.into_inner()) =
			Some(Instant::now());
		if self.shutdown_queued.swap(true, Ordering::SeqCst) {
			return;
		}
		info!("binary change detected, queueing shutdown");
		self.start_session("", vec!["shutdown".to_string()], priority::SHUTDOWN);
	}

	/// Run the shutdown helper session: wait for quiescence, then restart
	/// or stop.
	async fn run_shutdown_session(&self, session: Arc<Session>) {
		session.activate();
		loop {
			let last = self
				.last_binary_change
				.lock()
				.unwrap_or_else(|e| e.into_inner())
				.unwrap_or_else(Instant::now);
			// bus requests also postpone the shutdown
			let activity = *self.last_activity.lock().unwrap_or_else(|e| e.into_inner());
			let reference = last.max(activity);
			let elapsed = reference.elapsed();
			if elapsed >= SHUTDOWN_QUIESCENCE {
				break;
			}
			tokio::time::sleep(SHUTDOWN_QUIESCENCE - elapsed).await;
		}

		if self.autosync.prevents_termination() {
			info!("restarting after upgrade: auto-sync configurations present");
			restart_daemon();
		} else {
			info!("terminating after upgrade");
		}
		self.terminate.store(true, Ordering::SeqCst);
		// mark done through the normal path
		session.abort();
		self.wake.notify_waiters();
	}

	// --- main loop ----------------------------------------------------

	fn termination_reasons(&self) -> usize {
		let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
		let busy = queues.waiting.len() + usize::from(queues.active.is_some());
		drop(queues);
		let connections = self.connections.lock().unwrap_or_else(|e| e.into_inner()).len();
		busy + connections
			+ self.attached_client_count()
			+ usize::from(self.autosync.prevents_termination())
	}

	/// The scheduler: activates sessions one at a time, drives auto-sync
	/// timers, auto-termination and the shutdown watchdog. Returns when
	/// the server decided to exit.
	pub async fn run(self: Arc<Self>) {
		// binary watchdog
		{
			let server = Arc::clone(&self);
			tokio::spawn(async move {
				let mut watch = BinaryWatch::new();
				let mut ticker = tokio::time::interval(Duration::from_secs(2));
				ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
				loop {
					ticker.tick().await;
					if server.terminate.load(Ordering::SeqCst) {
						break;
					}
					if watch.poll() {
						server.schedule_shutdown();
					}
				}
			});
		}

		let mut autosync_next: HashMap<u64, Instant> = HashMap::new();
		let mut idle_since: Option<Instant> = None;

		loop {
			if self.terminate.load(Ordering::SeqCst) {
				break;
			}

			// activate the head of the queue, skipping corpses
			let next = {
				let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
				if queues.active.is_none() {
					let mut popped = None;
					while let Some(session) = queues.waiting.pop_front() {
						if session.is_done() {
							continue;
						}
						if !session.is_shutdown_helper() {
							queues.active = Some(Arc::clone(&session));
						}
						popped = Some(session);
						break;
					}
					popped
				} else {
					None
				}
			};
			if let Some(session) = next {
				if session.is_shutdown_helper() {
					self.run_shutdown_session(session).await;
					continue;
				}
				debug!("activating session {}", session.id());
				session.activate();
			}

			// auto-sync interval timers
			let now = Instant::now();
			for interval in self.autosync.intervals() {
				if interval == 0 {
					// interval 0 syncs only on presence edges
					continue;
				}
				let due = autosync_next
					.entry(interval)
					.or_insert_with(|| now + Duration::from_secs(interval));
				if now >= *due {
					*due = now + Duration::from_secs(interval);
					self.autosync.schedule(interval, &self.presence);
				}
			}
			if self.autosync.has_task() && self.autosync.active_task().is_none() {
				if let Some(task) = self.autosync.next_task() {
					self.start_autosync_task(task);
				}
			}

			// auto-termination
			if let Some(duration) = self.options.auto_term_duration {
				if self.termination_reasons() == 0 {
					let since = *idle_since.get_or_insert_with(Instant::now);
					let last_activity =
						*self.last_activity.lock().unwrap_or_else(|e| e.into_inner());
					let idle_for = since.max(last_activity).elapsed();
					if idle_for >= duration {
						info!("idle for {:?}, terminating", idle_for);
						break;
					}
				} else {
					idle_since = None;
				}
			}

			tokio::select! {
				_ = self.wake.notified() => {}
				_ = tokio::time::sleep(Duration::from_secs(1)) => {}
			}
		}

		// wind down: cancel pending info requests, abort sessions
		let pending: Vec<String> = self
			.info_reqs
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.keys()
			.cloned()
			.collect();
		for id in pending {
			self.cancel_info_request(&id);
		}
		for session in self.get_sessions() {
			if !session.is_done() {
				session.abort();
			}
		}
		info!("scheduler stopped");
	}
}

/// Replace the process with a fresh copy of itself
fn restart_daemon() {
	use std::os::unix::process::CommandExt;
	let args: Vec<String> = std::env::args().collect();
	if let Ok(exe) = std::env::current_exe() {
		let err = std::process::Command::new(exe).args(&args[1..]).exec();
		warn!("re-exec failed: {}", err);
	}
}


// vim: ts=4

//! Sync sessions
//!
//! A session is one synchronization attempt: it owns a snapshot of config
//! filters, the progress model and the lifecycle from queueing through
//! running to done. Only the scheduler activates sessions; all mutating
//! configuration work requires the session to hold the activation.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Mutex, Weak};
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::config::filter::ConfigFilter;
use crate::config::node::{ConfigNode, FileConfigNode};
use crate::config::peer::{ConfigMap, PeerConfig};
use crate::config::property::{source_registry, sync_registry, PasswordValue};
use crate::config::safe::escape;
use crate::engine::{Credentials, EngineContext, EngineEvent, SyncFlags};
use crate::error::{ConfigError, SyncError};
use crate::info::{InfoStatus, INFO_REQUEST_TIMEOUT};
use crate::logging::{debug, error, info, warn};
use crate::progress::{ProgressData, SourceProgress};
use crate::report::{default_log_dir, load_reports, SourceReport, SyncReport};
use crate::server::Server;
use crate::source::backup;
use crate::source::tracking::TrackingSource;
use crate::source::SourceDescriptor;
use crate::status::{SessionState, SyncMode, SyncStatus};
use crate::transport::http::{HttpTransport, TlsOptions};
use crate::transport::TransportAgent;

/// Grace period a finished session stays inspectable after the last detach
pub const SESSION_LINGER: Duration = Duration::from_secs(60);

/// Minimum pause between StatusChanged signals
const STATUS_RATE_LIMIT: Duration = Duration::from_millis(100);
/// Minimum pause between ProgressChanged signals
const PROGRESS_RATE_LIMIT: Duration = Duration::from_millis(50);

/// Scheduler priorities; higher value preempts queue order
pub mod priority {
	pub const CMDLINE: i32 = -10;
	pub const DEFAULT: i32 = 0;
	pub const CONNECTION: i32 = 10;
	pub const AUTOSYNC: i32 = 20;
	/// always ahead of everything else
	pub const SHUTDOWN: i32 = 256;
}

/// Per-source outcome shown in GetStatus
#[derive(Debug, Clone, Default)]
pub struct SourceStatus {
	pub mode: String,
	/// "idle", "running", "done" or "failed"
	pub status: String,
	pub error: u32,
}

struct SessionInner {
	state: SessionState,
	/// engine is blocked on transport or info request
	waiting: bool,
	active: bool,
	error: u32,
	error_text: String,
	/// client id -> attach count
	attachments: HashMap<String, usize>,
	sync_filter: ConfigFilter,
	common_source_filter: ConfigFilter,
	source_filters: HashMap<String, ConfigFilter>,
	progress: ProgressData,
	/// fixed percentage reported instead of the phase machine (restore)
	direct_progress: Option<i32>,
	source_progress: BTreeMap<String, SourceProgress>,
	source_status: BTreeMap<String, SourceStatus>,
	running_op: Option<&'static str>,
	last_status_signal: Option<Instant>,
	last_progress_signal: Option<Instant>,
	/// transport handed over by a connection (server mode)
	pending_transport: Option<Box<dyn TransportAgent>>,
	server_mode: bool,
	remote_device_id: String,
	connection_error: String,
	pending_info_id: Option<String>,
	/// finished sessions are eligible for removal once this has passed
	done_since: Option<Instant>,
}

/// One synchronization attempt
pub struct Session {
	id: String,
	config_name: String,
	flags: Vec<String>,
	priority: i32,
	server: Weak<Server>,
	/// back-reference for spawning owned tasks
	this: Weak<Session>,
	sync_flags: SyncFlags,
	inner: Mutex<SessionInner>,
	/// woken on activation and state changes
	pub(crate) changed: Notify,
}

impl Session {
	pub fn new(
		server: Weak<Server>,
		config_name: &str,
		flags: Vec<String>,
		priority: i32,
	) -> std::sync::Arc<Session> {
		std::sync::Arc::new_cyclic(|this| Session {
			this: this.clone(),
			id: Uuid::new_v4().to_string(),
			config_name: config_name.to_string(),
			flags,
			priority,
			server,
			sync_flags: SyncFlags::new(),
			inner: Mutex::new(SessionInner {
				state: SessionState::Queueing,
				waiting: false,
				active: false,
				error: 0,
				error_text: String::new(),
				attachments: HashMap::new(),
				sync_filter: ConfigFilter::new(),
				common_source_filter: ConfigFilter::new(),
				source_filters: HashMap::new(),
				progress: ProgressData::new(),
				direct_progress: None,
				source_progress: BTreeMap::new(),
				source_status: BTreeMap::new(),
				running_op: None,
				last_status_signal: None,
				last_progress_signal: None,
				pending_transport: None,
				server_mode: false,
				remote_device_id: String::new(),
				connection_error: String::new(),
				pending_info_id: None,
				done_since: None,
			}),
			changed: Notify::new(),
		})
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner> {
		self.inner.lock().unwrap_or_else(|e| e.into_inner())
	}

	pub fn id(&self) -> &str {
		&self.id
	}

	pub fn path(&self) -> String {
		format!("/sessions/{}", self.id)
	}

	pub fn config_name(&self) -> &str {
		&self.config_name
	}

	pub fn flags(&self) -> &[String] {
		&self.flags
	}

	pub fn priority(&self) -> i32 {
		self.priority
	}

	pub fn is_shutdown_helper(&self) -> bool {
		self.flags.iter().any(|f| f == "shutdown")
	}

	pub fn state(&self) -> SessionState {
		self.lock().state
	}

	pub fn is_active(&self) -> bool {
		self.lock().active
	}

	pub fn is_done(&self) -> bool {
		self.lock().state == SessionState::Done
	}

	pub fn done_since(&self) -> Option<Instant> {
		self.lock().done_since
	}

	pub fn remote_device_id(&self) -> String {
		self.lock().remote_device_id.clone()
	}

	pub fn set_remote_device_id(&self, device_id: &str) {
		self.lock().remote_device_id = device_id.to_string();
	}

	pub fn sync_flags(&self) -> &SyncFlags {
		&self.sync_flags
	}

	/// Hand over a ready transport (connection-owned server sessions)
	pub fn adopt_transport(&self, transport: Box<dyn TransportAgent>, server_mode: bool) {
		let mut inner = self.lock();
		inner.pending_transport = Some(transport);
		inner.server_mode = server_mode;
	}

	pub fn set_connection_error(&self, reason: &str) {
		let mut inner = self.lock();
		if inner.connection_error.is_empty() {
			inner.connection_error = reason.to_string();
		}
		if inner.error == 0 {
			inner.error = SyncStatus::TransportFailure.code();
		}
	}

	// --- lifecycle ----------------------------------------------------

	/// Block until the scheduler activates this session (or it is done)
	pub async fn wait_until_active(&self) {
		loop {
			// arm the notification before checking, so a wake between
			// check and await is not lost
			let notified = self.changed.notified();
			{
				let inner = self.lock();
				if inner.active || inner.state == SessionState::Done {
					return;
				}
			}
			notified.await;
		}
	}

	/// Called by the scheduler: this session now holds the activation
	pub fn activate(&self) {
		{
			let mut inner = self.lock();
			if inner.state == SessionState::Done {
				return;
			}
			inner.active = true;
			if inner.state == SessionState::Queueing {
				inner.state = SessionState::Idle;
			}
		}
		self.changed.notify_waiters();
		self.emit_status(true);
	}

	/// Transition into DONE; terminal
	fn finish(&self, error: u32, error_text: &str) {
		{
			let mut inner = self.lock();
			if inner.state == SessionState::Done {
				return;
			}
			inner.state = SessionState::Done;
			inner.active = false;
			inner.waiting = false;
			inner.running_op = None;
			inner.done_since = Some(Instant::now());
			if error != 0 && inner.error == 0 {
				inner.error = error;
			}
			if !error_text.is_empty() && inner.error_text.is_empty() {
				inner.error_text = error_text.to_string();
			}
		}
		self.changed.notify_waiters();
		self.emit_status(true);
		if let Some(server) = self.server.upgrade() {
			server.session_done(self);
		}
	}

	pub fn abort(&self) {
		let state = {
			let mut inner = self.lock();
			if inner.state == SessionState::Done {
				return;
			}
			if inner.running_op.is_some() {
				inner.state = SessionState::Aborting;
			}
			inner.state
		};
		self.sync_flags.request_abort();
		// wake a pending password prompt
		let info_id = self.lock().pending_info_id.clone();
		if let (Some(id), Some(server)) = (info_id, self.server.upgrade()) {
			server.cancel_info_request(&id);
		}
		if state != SessionState::Aborting {
			// nothing running: aborting a queued or idle session ends it
			self.finish(0, "");
		} else {
			self.emit_status(true);
		}
	}

	pub fn suspend(&self) {
		{
			let mut inner = self.lock();
			if inner.state != SessionState::Running {
				return;
			}
			inner.state = SessionState::Suspending;
		}
		self.sync_flags.request_suspend();
		self.emit_status(true);
	}

	// --- attach tracking ----------------------------------------------

	pub fn attach(&self, client: &str) {
		let mut inner = self.lock();
		*inner.attachments.entry(client.to_string()).or_insert(0) += 1;
	}

	/// Returns the number of references dropped
	pub fn detach(&self, client: &str) -> usize {
		let mut inner = self.lock();
		match inner.attachments.get_mut(client) {
			Some(count) if *count > 1 => {
				*count -= 1;
				1
			}
			Some(_) => {
				inner.attachments.remove(client);
				1
			}
			None => 0,
		}
	}

	/// Drop every reference a vanished client held
	pub fn detach_all(&self, client: &str) -> usize {
		let mut inner = self.lock();
		inner.attachments.remove(client).unwrap_or(0)
	}

	pub fn attachment_count(&self) -> usize {
		self.lock().attachments.values().sum()
	}

	// --- filters and configuration ------------------------------------

	/// SetConfig: persistent writes need the activation; temporary ones
	/// only touch this session's filters.
	pub fn set_config(
		&self,
		update: bool,
		temporary: bool,
		map: &ConfigMap,
	) -> Result<(), ConfigError> {
		if temporary {
			let mut inner = self.lock();
			if !update {
				inner.sync_filter = ConfigFilter::new();
				inner.common_source_filter = ConfigFilter::new();
				inner.source_filters.clear();
			}
			for (outer, props) in map {
				let filter = if outer.is_empty() {
					&mut inner.sync_filter
				} else if let Some(source) = outer.strip_prefix("source/") {
					inner.source_filters.entry(source.to_lowercase()).or_default()
				} else {
					return Err(ConfigError::InvalidCall {
						message: format!("invalid config map key \"{}\"", outer),
					});
				};
				for (key, value) in props {
					filter.set(key, value);
				}
			}
			return Ok(());
		}

		if !self.is_active() {
			return Err(ConfigError::InvalidCall {
				message: "session is not active, cannot modify configuration".to_string(),
			});
		}

		let server = self.server.upgrade().ok_or_else(|| ConfigError::InvalidCall {
			message: "server is shutting down".to_string(),
		})?;
		let config = server.open_config(&self.config_name);

		if !update && map.is_empty() {
			config.remove_config()?;
			server.config_changed();
			return Ok(());
		}

		config.apply_map(update, map)?;
		server.config_changed();
		Ok(())
	}

	/// Session view of the configuration, filters applied
	fn filtered_config(&self, server: &Server) -> PeerConfig {
		let mut config = server.open_config(&self.config_name);
		let inner = self.lock();
		config.set_sync_filter(inner.sync_filter.clone());
		config.set_common_source_filter(inner.common_source_filter.clone());
		for (source, filter) in &inner.source_filters {
			config.set_source_filter(source, filter.clone());
		}
		config
	}

	pub fn get_config(&self) -> Result<ConfigMap, ConfigError> {
		let server = self.server.upgrade().ok_or_else(|| ConfigError::InvalidCall {
			message: "server is shutting down".to_string(),
		})?;
		self.filtered_config(&server).to_map()
	}

	// --- status and progress ------------------------------------------

	fn status_string(inner: &SessionInner) -> String {
		let mut status = inner.state.as_str().to_string();
		if inner.waiting {
			status.push_str(";waiting");
		}
		status
	}

	pub fn status_value(&self) -> serde_json::Value {
		let inner = self.lock();
		let sources: BTreeMap<String, serde_json::Value> = inner
			.source_status
			.iter()
			.map(|(name, s)| (name.clone(), json!([s.mode, s.status, s.error])))
			.collect();
		json!({
			"status": Self::status_string(&inner),
			"error": inner.error,
			"sources": sources,
		})
	}

	pub fn progress_value(&self) -> serde_json::Value {
		let inner = self.lock();
		let percent = inner.direct_progress.unwrap_or_else(|| inner.progress.percent());
		json!({
			"progress": percent,
			"sources": &inner.source_progress,
		})
	}

	fn emit_status(&self, flush: bool) {
		{
			let mut inner = self.lock();
			if !flush {
				if let Some(last) = inner.last_status_signal {
					if last.elapsed() < STATUS_RATE_LIMIT {
						return;
					}
				}
			}
			inner.last_status_signal = Some(Instant::now());
		}
		if let Some(server) = self.server.upgrade() {
			server.signal(&self.path(), "StatusChanged", self.status_value());
		}
	}

	fn emit_progress(&self, flush: bool) {
		{
			let mut inner = self.lock();
			if !flush {
				if let Some(last) = inner.last_progress_signal {
					if last.elapsed() < PROGRESS_RATE_LIMIT {
						return;
					}
				}
			}
			inner.last_progress_signal = Some(Instant::now());
		}
		if let Some(server) = self.server.upgrade() {
			server.signal(&self.path(), "ProgressChanged", self.progress_value());
		}
	}

	/// Fold one engine event into progress and status bookkeeping
	pub(crate) fn handle_engine_event(&self, event: EngineEvent) {
		match event {
			EngineEvent::StepChange(step) => {
				self.lock().progress.set_step(step);
				self.emit_progress(false);
			}
			EngineEvent::SendStart => {
				self.lock().progress.send_start();
				self.emit_progress(false);
			}
			EngineEvent::ReceiveEnd => {
				self.lock().progress.receive_end();
				self.emit_progress(false);
			}
			EngineEvent::Waiting(waiting) => {
				self.lock().waiting = waiting;
				self.emit_status(false);
			}
			EngineEvent::SourceStart { source, mode } => {
				let mut inner = self.lock();
				inner.progress.add_sync_mode(mode);
				inner.source_status.insert(
					source.clone(),
					SourceStatus {
						mode: mode.to_string(),
						status: "running".to_string(),
						error: 0,
					},
				);
				inner.source_progress.entry(source).or_default();
				drop(inner);
				self.emit_status(true);
			}
			EngineEvent::SourceEnd { source, status } => {
				let mut inner = self.lock();
				let entry = inner.source_status.entry(source).or_default();
				entry.status =
					if status.is_ok() { "done".to_string() } else { "failed".to_string() };
				entry.error = if status.is_ok() { 0 } else { status.code() };
				drop(inner);
				self.emit_status(true);
			}
			EngineEvent::ItemPrepare { source, count, total } => {
				let mut inner = self.lock();
				inner.source_progress.entry(source).or_default().preparing(count, total);
				inner.progress.item_prepare();
				drop(inner);
				self.emit_progress(false);
			}
			EngineEvent::ItemSend { source, count, total } => {
				let mut inner = self.lock();
				inner.source_progress.entry(source).or_default().sending(count, total);
				drop(inner);
				self.emit_progress(false);
			}
			EngineEvent::ItemReceive { source, count, total } => {
				let mut inner = self.lock();
				inner.source_progress.entry(source.clone()).or_default().receiving(count, total);
				inner.progress.item_receive(&source, count, total);
				drop(inner);
				self.emit_progress(false);
			}
		}
	}

	// --- operations ---------------------------------------------------

	fn begin_operation(&self, op: &'static str) -> Result<(), ConfigError> {
		let mut inner = self.lock();
		if !inner.active {
			return Err(ConfigError::InvalidCall {
				message: format!("session is not active, cannot run {}", op),
			});
		}
		if let Some(running) = inner.running_op {
			return Err(ConfigError::InvalidCall {
				message: format!("{} already in progress", running),
			});
		}
		inner.running_op = Some(op);
		inner.state = SessionState::Running;
		drop(inner);
		self.emit_status(true);
		Ok(())
	}

	/// Start a sync. `mode` empty keeps each source's configured mode.
	pub fn sync(
		&self,
		mode: &str,
		source_modes: &BTreeMap<String, String>,
	) -> Result<(), ConfigError> {
		// validate modes before anything starts
		if !mode.is_empty() {
			mode.parse::<SyncMode>()
				.map_err(|message| ConfigError::InvalidCall { message })?;
		}
		for value in source_modes.values() {
			value
				.parse::<SyncMode>()
				.map_err(|message| ConfigError::InvalidCall { message })?;
		}
		self.begin_operation("sync")?;

		{
			let mut inner = self.lock();
			if !mode.is_empty() {
				inner.common_source_filter.set("sync", mode);
			}
			for (source, value) in source_modes {
				inner
					.source_filters
					.entry(source.to_lowercase())
					.or_default()
					.set("sync", value);
			}
		}

		let session = self.this.upgrade().ok_or_else(|| ConfigError::InvalidCall {
			message: "session is gone".to_string(),
		})?;
		let explicit_override = !mode.is_empty();
		tokio::spawn(async move {
			let result = session.run_sync(explicit_override).await;
			match result {
				Ok(status) => {
					let code = if status.is_ok() { 0 } else { status.code() };
					info!(
						"sync of \"{}\" finished with status {}",
						session.config_name,
						status.code()
					);
					session.finish(code, "");
				}
				Err(e) => {
					error!("sync of \"{}\" failed: {}", session.config_name, e);
					session.finish(e.status().code(), &e.to_string());
				}
			}
		});
		Ok(())
	}

	async fn run_sync(&self, explicit_override: bool) -> Result<SyncStatus, SyncError> {
		let server = self
			.server
			.upgrade()
			.ok_or_else(|| SyncError::Other { message: "server is gone".to_string() })?;
		let config = self.filtered_config(&server);
		if !config.exists() {
			return Err(ConfigError::NoSuchConfig { name: self.config_name.clone() }.into());
		}

		let remote_id = config.remote_device_id();
		if !remote_id.is_empty() {
			self.set_remote_device_id(&remote_id);
		}
		let change_id = if remote_id.is_empty() {
			escape(&self.config_name.to_lowercase())
		} else {
			escape(&remote_id)
		};

		let mut sources = self.assemble_sources(&config, &change_id, explicit_override)?;
		if sources.is_empty() {
			info!("no enabled sources for \"{}\", nothing to do", self.config_name);
			return Ok(SyncStatus::Ok);
		}

		let server_mode = self.lock().server_mode;
		let credentials = self.resolve_credentials(&config).await?;

		// transport: a connection may have handed one over, otherwise HTTP
		let adopted = self.lock().pending_transport.take();
		let mut transport: Box<dyn TransportAgent> = match adopted {
			Some(t) => t,
			None => {
				let urls = config.sync_urls();
				let url = urls.first().ok_or_else(|| ConfigError::InvalidCall {
					message: format!("{}: no syncURL configured", self.config_name),
				})?;
				let tls = TlsOptions {
					verify_server: config.get_bool("SSLVerifyServer"),
					verify_host: config.get_bool("SSLVerifyHost"),
					server_certificates: config
						.get("SSLServerCertificates")
						.unwrap_or_default(),
				};
				let mut http = HttpTransport::new(tls);
				http.set_url(url);
				Box::new(http)
			}
		};
		transport.set_timeout(300);

		let device_id = {
			let configured = config.get("deviceId").unwrap_or_default();
			if configured.is_empty() {
				format!("pimsync-{}", &self.id[..8])
			} else {
				configured
			}
		};

		let mut report = SyncReport::new(&self.config_name);
		let mut events = |event: EngineEvent| self.handle_engine_event(event);

		let factory = server.engine_factory();
		let mut engine = (*factory)();
		let mut ctx = EngineContext {
			sources: &mut sources,
			transport: transport.as_mut(),
			events: &mut events,
			flags: &self.sync_flags,
			credentials,
			device_id,
			server_mode,
		};
		let outcome = engine.run(&mut ctx).await;

		// per-source results for the report
		{
			let inner = self.lock();
			for source in sources.iter() {
				let progress = inner.source_progress.get(source.name());
				let status = inner.source_status.get(source.name());
				let changes = source.changes();
				report.sources.insert(
					source.name().to_string(),
					SourceReport {
						mode: source.mode().to_string(),
						status: status.map(|s| s.status.clone()).unwrap_or_default(),
						error: status.map(|s| s.error).unwrap_or(0),
						items_new: changes.new_items.len(),
						items_updated: changes.updated.len(),
						items_deleted: changes.deleted.len(),
						items_received: progress
							.map(|p| p.receive_count.max(0) as usize)
							.unwrap_or(0),
					},
				);
			}
		}

		let (code, error_text) = match &outcome {
			Ok(status) => (if status.is_ok() { 0 } else { status.code() }, String::new()),
			Err(e) => (e.status().code(), e.to_string()),
		};
		report.finish(code, &error_text);
		let log_dir = {
			let configured = config.get("logDir").unwrap_or_default();
			if configured.is_empty() {
				default_log_dir(&self.config_name)
			} else {
				PathBuf::from(configured)
			}
		};
		let max_reports = config.get_u64("maxLogDirs") as usize;
		if let Err(e) = report.save(&log_dir, max_reports) {
			warn!("cannot save sync report: {}", e);
		}

		outcome
	}

	/// Build the tracking sources for every enabled source of the session
	fn assemble_sources(
		&self,
		config: &PeerConfig,
		change_id: &str,
		explicit_override: bool,
	) -> Result<Vec<TrackingSource>, SyncError> {
		let mut sources = Vec::new();
		for name in config.source_names() {
			let nodes = config.source_nodes(&name, change_id)?;
			let mode_prop = source_registry().find("sync").expect("sync property registered");
			let mode: SyncMode = mode_prop
				.get(nodes.visible.as_ref())
				.parse()
				.map_err(|message| ConfigError::InvalidCall { message })?;

			// a mode override enables no disabled sources: check the
			// stored value underneath the filter stack
			if explicit_override {
				let stored: SyncMode = mode_prop
					.get(nodes.visible.underlying().as_ref())
					.parse()
					.unwrap_or(SyncMode::Disabled);
				if !stored.is_enabled() {
					continue;
				}
			}
			if !mode.is_enabled() {
				continue;
			}

			let mut descriptor = SourceDescriptor {
				name: name.clone(),
				mode,
				..Default::default()
			};
			let type_prop = source_registry().find("type").expect("type property registered");
			descriptor
				.parse_type(&type_prop.get(nodes.visible.as_ref()))
				.map_err(SyncError::from)?;
			descriptor.database = nodes.visible.read("database");
			descriptor.database_user = nodes.visible.read("databaseUser");
			descriptor.uri = nodes.visible.read("uri");
			if let Some(password) =
				PasswordValue::parse(&nodes.visible.read("databasePassword"))
					.resolve()
					.map_err(SyncError::from)?
			{
				descriptor.database_password = password;
			}

			let server = self.server.upgrade().ok_or_else(|| SyncError::Other {
				message: "server is gone".to_string(),
			})?;
			let backend =
				server.backends().create(&descriptor).map_err(|error| SyncError::Source {
					source_name: name.clone(),
					error,
				})?;
			sources.push(TrackingSource::new(descriptor, backend, nodes.tracking));

			let mut inner = self.lock();
			inner.source_status.insert(
				name.clone(),
				SourceStatus { mode: mode.to_string(), status: "idle".to_string(), error: 0 },
			);
		}
		Ok(sources)
	}

	/// Resolve username/password, asking attached clients when the
	/// password is configured as "-"
	async fn resolve_credentials(&self, config: &PeerConfig) -> Result<Credentials, SyncError> {
		let username = config.get("username").unwrap_or_default();
		let password_prop = sync_registry().find("password").expect("password registered");
		let node = config.peer_node()?;
		let raw = if password_prop.is_set(node.as_ref()) { node.read("password") } else { String::new() };

		let password = match PasswordValue::parse(&raw).resolve()? {
			Some(resolved) => resolved,
			None => self.ask_password(&username, &config.sync_url()).await?,
		};
		Ok(Credentials { username, password })
	}

	/// Block the sync on an out-of-band password request
	async fn ask_password(&self, username: &str, server_url: &str) -> Result<String, SyncError> {
		let server = self
			.server
			.upgrade()
			.ok_or_else(|| SyncError::Other { message: "server is gone".to_string() })?;

		let mut params = BTreeMap::new();
		params.insert("user".to_string(), username.to_string());
		params.insert("SyncML server".to_string(), server_url.to_string());
		params.insert(
			"description".to_string(),
			format!("password for \"{}\"", self.config_name),
		);

		let request =
			server.create_info_request(&self.path(), "password", params, INFO_REQUEST_TIMEOUT);
		self.lock().pending_info_id = Some(request.id().to_string());
		{
			let mut inner = self.lock();
			inner.waiting = true;
		}
		self.emit_status(false);

		let (status, response) = request.wait().await;

		{
			let mut inner = self.lock();
			inner.waiting = false;
			inner.pending_info_id = None;
		}
		self.emit_status(false);
		server.finish_info_request(request.id());

		match status {
			InfoStatus::Ok => Ok(response
				.and_then(|mut r| r.remove("password"))
				.unwrap_or_default()),
			InfoStatus::Cancel => Err(SyncError::Aborted),
			_ => Err(SyncError::PasswordTimeout),
		}
	}

	/// Restore sources from a backup directory
	pub fn restore(
		&self,
		dir: &str,
		_before: bool,
		source_names: &[String],
	) -> Result<(), ConfigError> {
		self.begin_operation("restore")?;
		let session = self.this.upgrade().ok_or_else(|| ConfigError::InvalidCall {
			message: "session is gone".to_string(),
		})?;
		let dir = PathBuf::from(dir);
		let names: Vec<String> = source_names.to_vec();
		tokio::spawn(async move {
			match session.run_restore(&dir, &names).await {
				Ok(()) => session.finish(0, ""),
				Err(e) => {
					error!("restore of \"{}\" failed: {}", session.config_name, e);
					session.finish(e.status().code(), &e.to_string());
				}
			}
		});
		Ok(())
	}

	async fn run_restore(
		&self,
		dir: &std::path::Path,
		source_names: &[String],
	) -> Result<(), SyncError> {
		let server = self
			.server
			.upgrade()
			.ok_or_else(|| SyncError::Other { message: "server is gone".to_string() })?;
		let config = self.filtered_config(&server);
		if !config.exists() {
			return Err(ConfigError::NoSuchConfig { name: self.config_name.clone() }.into());
		}

		let all_names = config.source_names();
		let selected: Vec<String> = if source_names.is_empty() {
			all_names
		} else {
			// everything not listed stays untouched
			all_names
				.into_iter()
				.filter(|name| source_names.iter().any(|s| s.eq_ignore_ascii_case(name)))
				.collect()
		};
		if selected.is_empty() {
			return Err(ConfigError::InvalidCall {
				message: "no matching sources to restore".to_string(),
			}
			.into());
		}

		let change_id = escape(&self.config_name.to_lowercase());
		let total = selected.len();
		for (done, name) in selected.iter().enumerate() {
			self.sync_flags.check()?;
			let nodes = config.source_nodes(name, &change_id)?;
			let mut descriptor =
				SourceDescriptor { name: name.clone(), ..Default::default() };
			let type_prop = source_registry().find("type").expect("type property registered");
			descriptor
				.parse_type(&type_prop.get(nodes.visible.as_ref()))
				.map_err(SyncError::from)?;
			descriptor.database = nodes.visible.read("database");

			let backend =
				server.backends().create(&descriptor).map_err(|error| SyncError::Source {
					source_name: name.clone(),
					error,
				})?;
			let mut source = TrackingSource::new(descriptor, backend, nodes.tracking);

			let index = FileConfigNode::new(dir.join(format!("{}.ini", name)), false)
				.map_err(SyncError::from)?;
			let item_dir = dir.join(name);
			backup::restore(&mut source, &item_dir, &index)
				.await
				.map_err(|error| SyncError::Source { source_name: name.clone(), error })?;

			{
				let mut inner = self.lock();
				inner.direct_progress = Some(((done + 1) * 100 / total) as i32);
			}
			self.emit_progress(true);
			debug!("restored source {} from {}", name, item_dir.display());
		}
		Ok(())
	}

	/// Run a helper command with the session's configuration as context.
	/// Output is re-emitted line by line as LogOutput signals.
	pub fn execute(
		&self,
		args: &[String],
		env: &BTreeMap<String, String>,
	) -> Result<(), ConfigError> {
		if args.is_empty() {
			return Err(ConfigError::InvalidCall { message: "empty command".to_string() });
		}
		self.begin_operation("execute")?;

		let session = self.this.upgrade().ok_or_else(|| ConfigError::InvalidCall {
			message: "session is gone".to_string(),
		})?;
		let args: Vec<String> = args.to_vec();
		let env: BTreeMap<String, String> = env.clone();
		tokio::spawn(async move {
			match session.run_execute(&args, &env).await {
				Ok(code) if code == 0 => session.finish(0, ""),
				Ok(code) => {
					session.finish(
						SyncStatus::Fatal.code(),
						&format!("command exited with status {}", code),
					);
				}
				Err(e) => {
					session.finish(SyncStatus::Fatal.code(), &e.to_string());
				}
			}
		});
		Ok(())
	}

	async fn run_execute(
		&self,
		args: &[String],
		env: &BTreeMap<String, String>,
	) -> Result<i32, SyncError> {
		use tokio::io::AsyncBufReadExt;

		let mut command = tokio::process::Command::new(&args[0]);
		command
			.args(&args[1..])
			.env("PIMSYNC_CONFIG", &self.config_name)
			.stdout(std::process::Stdio::piped())
			.stderr(std::process::Stdio::piped());
		for (key, value) in env {
			command.env(key, value);
		}

		let mut child = command
			.spawn()
			.map_err(|e| SyncError::Other { message: format!("cannot run {}: {}", args[0], e) })?;

		let stdout = child.stdout.take();
		let stderr = child.stderr.take();
		let path = self.path();

		let server_out = self.server.clone();
		let out_task = tokio::spawn(async move {
			if let Some(stdout) = stdout {
				let mut lines = tokio::io::BufReader::new(stdout).lines();
				while let Ok(Some(line)) = lines.next_line().await {
					if let Some(server) = server_out.upgrade() {
						server.signal(&path, "LogOutput", json!(["INFO", line]));
					}
				}
			}
		});
		let path = self.path();
		let server_err = self.server.clone();
		let err_task = tokio::spawn(async move {
			if let Some(stderr) = stderr {
				let mut lines = tokio::io::BufReader::new(stderr).lines();
				while let Ok(Some(line)) = lines.next_line().await {
					if let Some(server) = server_err.upgrade() {
						server.signal(&path, "LogOutput", json!(["ERROR", line]));
					}
				}
			}
		});

		let status = child
			.wait()
			.await
			.map_err(|e| SyncError::Other { message: e.to_string() })?;
		let _ = tokio::join!(out_task, err_task);
		Ok(status.code().unwrap_or(-1))
	}

	/// Presence of this session's peer
	pub fn check_presence(&self) -> String {
		match self.server.upgrade() {
			Some(server) => {
				let config = server.open_config(&self.config_name);
				server.presence().peer_status(&config.sync_urls()).0
			}
			None => "not present".to_string(),
		}
	}

	/// Reports of this session's peer, newest first
	pub fn get_reports(&self, start: usize, count: usize) -> Vec<SyncReport> {
		let log_dir = self
			.server
			.upgrade()
			.map(|server| {
				let config = server.open_config(&self.config_name);
				let configured = config.get("logDir").unwrap_or_default();
				if configured.is_empty() {
					default_log_dir(&self.config_name)
				} else {
					PathBuf::from(configured)
				}
			})
			.unwrap_or_else(|| default_log_dir(&self.config_name));
		load_reports(&log_dir, start, count)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::engine::mock::mock_factory;
	use crate::server::{Server, ServerOptions};
	use crate::source::BackendRegistry;
	use std::sync::Arc;
	use tempfile::TempDir;

	fn test_server(dir: &TempDir) -> Arc<Server> {
		Server::new(ServerOptions {
			config_root: Some(dir.path().to_path_buf()),
			engine: mock_factory(Vec::new(), Ok(SyncStatus::Ok)),
			backends: Arc::new(BackendRegistry::new()),
			auto_term_duration: None,
		})
	}

	#[tokio::test]
	async fn test_attach_detach_reference_counting() {
		let dir = TempDir::new().unwrap();
		let server = test_server(&dir);
		let session = server.start_session("peer", vec![], priority::DEFAULT);

		session.attach("a");
		session.attach("a");
		session.attach("b");
		assert_eq!(session.attachment_count(), 3);

		assert_eq!(session.detach("a"), 1);
		assert_eq!(session.attachment_count(), 2);
		assert_eq!(session.detach_all("a"), 1);
		assert_eq!(session.attachment_count(), 1);
		assert_eq!(session.detach("c"), 0);
	}

	#[tokio::test]
	async fn test_status_string_carries_waiting_suffix() {
		let dir = TempDir::new().unwrap();
		let server = test_server(&dir);
		let session = server.start_session("peer", vec![], priority::DEFAULT);
		assert_eq!(session.status_value()["status"], "queueing");

		session.lock().waiting = true;
		assert_eq!(session.status_value()["status"], "queueing;waiting");
	}

	#[tokio::test]
	async fn test_temporary_config_replaces_and_merges_filters() {
		let dir = TempDir::new().unwrap();
		let server = test_server(&dir);
		let session = server.start_session("peer", vec![], priority::DEFAULT);

		let mut map = ConfigMap::new();
		let mut global = BTreeMap::new();
		global.insert("syncURL".to_string(), "http://one".to_string());
		map.insert(String::new(), global);
		session.set_config(true, true, &map).unwrap();
		assert_eq!(session.lock().sync_filter.get("syncURL"), Some("http://one"));

		// update merges
		let mut map = ConfigMap::new();
		let mut global = BTreeMap::new();
		global.insert("username".to_string(), "me".to_string());
		map.insert(String::new(), global);
		session.set_config(true, true, &map).unwrap();
		assert_eq!(session.lock().sync_filter.get("syncURL"), Some("http://one"));
		assert_eq!(session.lock().sync_filter.get("username"), Some("me"));

		// replace clears
		session.set_config(false, true, &ConfigMap::new()).unwrap();
		assert!(session.lock().sync_filter.is_empty());
	}

	#[tokio::test]
	async fn test_abort_before_activation_is_terminal() {
		let dir = TempDir::new().unwrap();
		let server = test_server(&dir);
		let session = server.start_session("peer", vec![], priority::DEFAULT);
		assert_eq!(session.state(), SessionState::Queueing);

		session.abort();
		assert_eq!(session.state(), SessionState::Done);

		// DONE never transitions back
		session.activate();
		assert_eq!(session.state(), SessionState::Done);
		assert!(!session.is_active());
	}

	#[tokio::test]
	async fn test_sync_requires_activation() {
		let dir = TempDir::new().unwrap();
		let server = test_server(&dir);
		let session = server.start_session("peer", vec![], priority::DEFAULT);
		assert!(session.sync("", &BTreeMap::new()).is_err());

		session.activate();
		// still fails: the config does not exist, but only once running
		assert!(session.sync("", &BTreeMap::new()).is_ok());
	}
}

// vim: ts=4

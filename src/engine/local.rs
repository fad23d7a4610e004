//! Built-in peer-to-peer engine
//!
//! Speaks a compact JSON frame protocol over any transport, so two pimsync
//! instances can sync against each other without an external SyncML codec.
//! One wire message is an array of frames; every exchange is one
//! send/reply roundtrip, mirroring the package structure of a SyncML
//! session (init, data, map/ack).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use async_trait::async_trait;

use crate::engine::{EngineContext, EngineEvent, ProtocolEngine, SyncFlags};
use crate::error::{SyncError, TransportError};
use crate::logging::{debug, info};
use crate::progress::ProgressStep;
use crate::source::tracking::TrackingSource;
use crate::status::{SyncMode, SyncStatus};
use crate::transport::{TransportAgent, TransportStatus, CONTENT_TYPE_JSON_FRAME};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
enum ChangeOp {
	Add,
	Update,
	Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ItemChange {
	op: ChangeOp,
	uid: String,
	/// base64 item content; empty for deletes
	#[serde(default)]
	data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ItemResult {
	uid: String,
	status: u32,
	#[serde(default)]
	new_uid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SourceInit {
	name: String,
	uri: String,
	mode: SyncMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SourceAck {
	uri: String,
	status: u32,
}

/// One protocol command; a wire message is a `Vec<Frame>`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "kebab-case")]
enum Frame {
	Init {
		device_id: String,
		username: String,
		password: String,
		sources: Vec<SourceInit>,
	},
	InitAck {
		sources: Vec<SourceAck>,
	},
	Changes {
		source: String,
		items: Vec<ItemChange>,
	},
	ChangesAck {
		source: String,
		results: Vec<ItemResult>,
	},
	Final,
	Bye {
		status: u32,
	},
}

/// The built-in engine
pub struct LocalEngine;

impl LocalEngine {
	pub fn new() -> Self {
		LocalEngine
	}
}

impl Default for LocalEngine {
	fn default() -> Self {
		Self::new()
	}
}

type Events<'a> = &'a mut (dyn FnMut(EngineEvent) + Send);

async fn send_message(
	transport: &mut dyn TransportAgent,
	events: Events<'_>,
	frames: &[Frame],
	expect_reply: bool,
) -> Result<Vec<Frame>, SyncError> {
	events(EngineEvent::SendStart);
	let buf = serde_json::to_vec(frames)
		.map_err(|e| SyncError::Other { message: e.to_string() })?;
	transport.set_content_type(CONTENT_TYPE_JSON_FRAME);
	transport.send(&buf).await?;

	events(EngineEvent::Waiting(true));
	let status = transport.wait(!expect_reply).await?;
	events(EngineEvent::Waiting(false));

	match status {
		TransportStatus::GotReply => {
			let (data, _content_type) =
				transport.get_reply().ok_or(TransportError::Failed {
					message: "reply vanished".to_string(),
				})?;
			let frames: Vec<Frame> = serde_json::from_slice(&data)
				.map_err(|e| SyncError::Other { message: format!("bad frame: {}", e) })?;
			events(EngineEvent::ReceiveEnd);
			Ok(frames)
		}
		TransportStatus::Inactive => Ok(Vec::new()),
		TransportStatus::TimeOut => Err(TransportError::Timeout.into()),
		TransportStatus::Closed => Err(TransportError::Closed.into()),
		_ => Err(TransportError::Failed { message: "message exchange failed".to_string() }.into()),
	}
}

async fn receive_message(
	transport: &mut dyn TransportAgent,
	events: Events<'_>,
) -> Result<Vec<Frame>, SyncError> {
	events(EngineEvent::Waiting(true));
	let status = transport.wait(false).await?;
	events(EngineEvent::Waiting(false));
	match status {
		TransportStatus::GotReply => {
			let (data, _content_type) =
				transport.get_reply().ok_or(TransportError::Failed {
					message: "message vanished".to_string(),
				})?;
			let frames: Vec<Frame> = serde_json::from_slice(&data)
				.map_err(|e| SyncError::Other { message: format!("bad frame: {}", e) })?;
			events(EngineEvent::ReceiveEnd);
			Ok(frames)
		}
		TransportStatus::TimeOut => Err(TransportError::Timeout.into()),
		TransportStatus::Closed => Err(TransportError::Closed.into()),
		_ => Err(TransportError::Failed { message: "receive failed".to_string() }.into()),
	}
}

/// Outgoing item list of one source, derived from its change sets
async fn collect_changes(
	source: &mut TrackingSource,
	events: Events<'_>,
	flags: &SyncFlags,
) -> Result<Vec<ItemChange>, SyncError> {
	let name = source.name().to_string();
	let changes = source.changes().clone();
	let (need_all, _, _) = source.mode().change_tracking();
	let mut items = Vec::new();

	let uids: Vec<(ChangeOp, String)> = if need_all {
		changes.all.iter().map(|u| (ChangeOp::Add, u.clone())).collect()
	} else {
		changes
			.new_items
			.iter()
			.map(|u| (ChangeOp::Add, u.clone()))
			.chain(changes.updated.iter().map(|u| (ChangeOp::Update, u.clone())))
			.chain(changes.deleted.iter().map(|u| (ChangeOp::Delete, u.clone())))
			.collect()
	};

	let total = uids.len() as i32;
	for (count, (op, uid)) in uids.into_iter().enumerate() {
		flags.check()?;
		let data = match op {
			ChangeOp::Delete => String::new(),
			_ => {
				let content = source
					.read_item(&uid)
					.await
					.map_err(|error| SyncError::Source { source_name: name.clone(), error })?;
				BASE64.encode(content)
			}
		};
		items.push(ItemChange { op, uid, data });
		events(EngineEvent::ItemSend { source: name.clone(), count: count as i32 + 1, total });
	}
	Ok(items)
}

/// Apply a peer's change list to one source
async fn apply_changes(
	source: &mut TrackingSource,
	items: &[ItemChange],
	events: Events<'_>,
	flags: &SyncFlags,
) -> Result<Vec<ItemResult>, SyncError> {
	let name = source.name().to_string();
	let total = items.len() as i32;
	let mut results = Vec::with_capacity(items.len());

	for (count, item) in items.iter().enumerate() {
		flags.check()?;
		let result = match item.op {
			ChangeOp::Delete => match source.remove(&item.uid).await {
				Ok(status) => ItemResult {
					uid: item.uid.clone(),
					status: status.code(),
					new_uid: String::new(),
				},
				Err(e) => {
					debug!("{}: delete {} failed: {}", name, item.uid, e);
					ItemResult {
						uid: item.uid.clone(),
						status: SyncStatus::Fatal.code(),
						new_uid: String::new(),
					}
				}
			},
			// adds carry the peer's uid; upsert keeps uids aligned on
			// both sides, like globally unique PIM item ids
			ChangeOp::Add | ChangeOp::Update => {
				let data = BASE64.decode(item.data.as_bytes()).map_err(|e| {
					SyncError::Other { message: format!("bad item payload: {}", e) }
				})?;
				match source.update(&item.uid, &data).await {
					Ok((new_uid, status)) => ItemResult {
						uid: item.uid.clone(),
						status: status.code(),
						new_uid,
					},
					Err(e) => {
						debug!("{}: store {} failed: {}", name, item.uid, e);
						ItemResult {
							uid: item.uid.clone(),
							status: SyncStatus::Fatal.code(),
							new_uid: String::new(),
						}
					}
				}
			}
		};
		results.push(result);
		events(EngineEvent::ItemReceive {
			source: name.clone(),
			count: count as i32 + 1,
			total,
		});
	}
	Ok(results)
}

/// Run begin_sync on every enabled source, reporting events
async fn prepare_sources(
	sources: &mut [TrackingSource],
	events: Events<'_>,
	server_mode: bool,
) -> Result<(), SyncError> {
	events(EngineEvent::StepChange(ProgressStep::Prepare));
	for source in sources.iter_mut() {
		let mode = if server_mode { source.mode().peer_view() } else { source.mode() };
		if !mode.is_enabled() {
			continue;
		}
		events(EngineEvent::SourceStart { source: source.name().to_string(), mode });
		let name = source.name().to_string();
		let changes = source
			.begin_sync(mode)
			.await
			.map_err(|error| SyncError::Source { source_name: name.clone(), error })?;
		let total = changes.total_changes() as i32;
		events(EngineEvent::ItemPrepare { source: name, count: total, total });
	}
	Ok(())
}

async fn finish_sources(
	sources: &mut [TrackingSource],
	events: Events<'_>,
	suspended: bool,
) -> Result<SyncStatus, SyncError> {
	let mut status = SyncStatus::Ok;
	for source in sources.iter_mut() {
		if !source.mode().is_enabled() {
			continue;
		}
		if suspended {
			// keep the tracking node as it was; the resumed sync
			// re-detects the outstanding changes
			source.set_failed();
		}
		let name = source.name().to_string();
		let source_status = if source.has_failed() && !suspended {
			status = SyncStatus::DatastoreFailure;
			SyncStatus::DatastoreFailure
		} else {
			SyncStatus::Ok
		};
		if let Err(error) = source.end_sync().await {
			status = SyncStatus::DatastoreFailure;
			events(EngineEvent::SourceEnd {
				source: name.clone(),
				status: SyncStatus::DatastoreFailure,
			});
			debug!("{}: end_sync failed: {}", name, error);
			continue;
		}
		events(EngineEvent::SourceEnd { source: name, status: source_status });
	}
	Ok(status)
}

impl LocalEngine {
	async fn run_client(&mut self, ctx: &mut EngineContext<'_>) -> Result<SyncStatus, SyncError> {
		let EngineContext { sources, transport, events, flags, credentials, device_id, .. } = ctx;
		let sources: &mut [TrackingSource] = &mut **sources;
		let transport: &mut dyn TransportAgent = &mut **transport;
		let events: Events<'_> = &mut **events;
		let flags: &SyncFlags = *flags;

		prepare_sources(sources, events, false).await?;
		flags.check()?;

		// package one: init
		events(EngineEvent::StepChange(ProgressStep::Init));
		let inits: Vec<SourceInit> = sources
			.iter()
			.filter(|s| s.mode().is_enabled())
			.map(|s| SourceInit {
				name: s.name().to_string(),
				uri: source_uri(s),
				mode: s.mode(),
			})
			.collect();
		let init = Frame::Init {
			device_id: device_id.clone(),
			username: credentials.username.clone(),
			password: credentials.password.clone(),
			sources: inits,
		};
		let reply = send_message(transport, events, &[init], true).await?;
		let acks = match reply.first() {
			Some(Frame::InitAck { sources }) => sources.clone(),
			_ => {
				return Err(SyncError::Other {
					message: "peer did not acknowledge session start".to_string(),
				})
			}
		};
		let mut reject_status: Option<SyncStatus> = None;
		for ack in &acks {
			let status = SyncStatus::from_code(ack.status);
			if !status.is_ok() {
				info!("peer rejected source {}: {}", ack.uri, ack.status);
				if let Some(source) =
					sources.iter_mut().find(|s| source_uri(s) == ack.uri)
				{
					source.set_failed();
				}
				if status == SyncStatus::Forbidden {
					return Err(SyncError::Status(SyncStatus::Forbidden));
				}
				reject_status.get_or_insert(status);
			}
		}
		flags.check()?;
		if flags.suspended() {
			// graceful stop before any data travelled
			return finish_sources(sources, events, true).await;
		}

		// package two: our changes
		events(EngineEvent::StepChange(ProgressStep::Data));
		let mut frames = Vec::new();
		for source in sources.iter_mut() {
			if !source.mode().is_enabled() || source.has_failed() {
				continue;
			}
			if source.mode().from_peer_only() {
				continue;
			}
			events(EngineEvent::ItemPrepare {
				source: source.name().to_string(),
				count: 0,
				total: source.changes().total_changes() as i32,
			});
			let items = collect_changes(source, events, flags).await?;
			frames.push(Frame::Changes { source: source_uri(source), items });
		}
		frames.push(Frame::Final);
		let reply = send_message(transport, events, &frames, true).await?;

		// package three: apply what the peer sent, acknowledge it
		events(EngineEvent::StepChange(ProgressStep::Uninit));
		let mut out = Vec::new();
		let mut peer_status = SyncStatus::Ok;
		for frame in reply {
			match frame {
				Frame::ChangesAck { source, results } => {
					for result in results {
						let status = SyncStatus::from_code(result.status);
						if !status.is_ok() {
							debug!("peer failed item {} of {}: {}", result.uid, source, result.status);
						}
					}
				}
				Frame::Changes { source: uri, items } => {
					if let Some(source) =
						sources.iter_mut().find(|s| source_uri(s) == uri)
					{
						let results = apply_changes(source, &items, events, flags).await?;
						out.push(Frame::ChangesAck { source: uri, results });
					} else {
						out.push(Frame::ChangesAck { source: uri, results: Vec::new() });
					}
				}
				Frame::Bye { status } => {
					peer_status = SyncStatus::from_code(status);
				}
				_ => {}
			}
		}
		out.push(Frame::Bye { status: SyncStatus::Ok.code() });
		send_message(transport, events, &out, false).await?;
		transport.shutdown().await?;

		let local_status = finish_sources(sources, events, flags.suspended()).await?;
		if let Some(status) = reject_status {
			Ok(status)
		} else if !peer_status.is_ok() {
			Ok(peer_status)
		} else {
			Ok(local_status)
		}
	}

	async fn run_server(&mut self, ctx: &mut EngineContext<'_>) -> Result<SyncStatus, SyncError> {
		let EngineContext { sources, transport, events, flags, credentials, .. } = ctx;
		let sources: &mut [TrackingSource] = &mut **sources;
		let transport: &mut dyn TransportAgent = &mut **transport;
		let events: Events<'_> = &mut **events;
		let flags: &SyncFlags = *flags;

		// package one: peer introduces itself
		let frames = receive_message(transport, events).await?;
		let (peer_user, peer_password, peer_sources) = match frames.into_iter().next() {
			Some(Frame::Init { username, password, sources, .. }) => {
				(username, password, sources)
			}
			_ => {
				return Err(SyncError::Other {
					message: "peer did not start with an init frame".to_string(),
				})
			}
		};

		let authenticated = credentials.username.is_empty()
			|| (credentials.username == peer_user && credentials.password == peer_password);

		events(EngineEvent::StepChange(ProgressStep::Prepare));
		let mut acks = Vec::new();
		let mut matched: Vec<(String, SyncMode)> = Vec::new();
		for init in &peer_sources {
			if !authenticated {
				acks.push(SourceAck { uri: init.uri.clone(), status: SyncStatus::Forbidden.code() });
				continue;
			}
			let found = sources.iter().any(|s| {
				source_uri(s).eq_ignore_ascii_case(&init.uri)
					|| s.name().eq_ignore_ascii_case(&init.uri)
			});
			if found {
				matched.push((init.uri.clone(), init.mode));
				acks.push(SourceAck { uri: init.uri.clone(), status: SyncStatus::Ok.code() });
			} else {
				acks.push(SourceAck { uri: init.uri.clone(), status: SyncStatus::NotFound.code() });
			}
		}

		// change detection with the mirrored mode of each matched source
		for source in sources.iter_mut() {
			let uri = source_uri(source);
			let init_mode = matched
				.iter()
				.find(|(u, _)| {
					u.eq_ignore_ascii_case(&uri) || u.eq_ignore_ascii_case(source.name())
				})
				.map(|(_, m)| *m);
			let mode = match init_mode {
				Some(m) => m.peer_view(),
				None => continue,
			};
			events(EngineEvent::SourceStart { source: source.name().to_string(), mode });
			let name = source.name().to_string();
			source
				.begin_sync(mode)
				.await
				.map_err(|error| SyncError::Source { source_name: name, error })?;
		}

		events(EngineEvent::StepChange(ProgressStep::Init));
		send_message(transport, events, &[Frame::InitAck { sources: acks }], false).await?;
		if !authenticated {
			return Err(SyncError::Status(SyncStatus::Forbidden));
		}

		// package two: apply peer changes, reply with ours
		events(EngineEvent::StepChange(ProgressStep::Data));
		let frames = receive_message(transport, events).await?;
		let mut out = Vec::new();
		for frame in frames {
			match frame {
				Frame::Changes { source: uri, items } => {
					if let Some(source) = sources.iter_mut().find(|s| {
						source_uri(s).eq_ignore_ascii_case(&uri)
							|| s.name().eq_ignore_ascii_case(&uri)
					}) {
						let results = apply_changes(source, &items, events, flags).await?;
						out.push(Frame::ChangesAck { source: uri, results });
					} else {
						out.push(Frame::ChangesAck { source: uri, results: Vec::new() });
					}
				}
				Frame::Final => break,
				_ => {}
			}
		}

		for source in sources.iter_mut() {
			let uri = source_uri(source);
			let active = matched.iter().any(|(u, _)| {
				u.eq_ignore_ascii_case(&uri) || u.eq_ignore_ascii_case(source.name())
			});
			if !active || source.has_failed() || source.mode().from_peer_only() {
				continue;
			}
			let items = collect_changes(source, events, flags).await?;
			out.push(Frame::Changes { source: uri, items });
		}
		out.push(Frame::Bye { status: SyncStatus::Ok.code() });
		send_message(transport, events, &out, false).await?;

		// package three: peer acknowledges, then the channel closes
		events(EngineEvent::StepChange(ProgressStep::Uninit));
		let frames = receive_message(transport, events).await?;
		let mut peer_status = SyncStatus::Ok;
		for frame in frames {
			if let Frame::Bye { status } = frame {
				peer_status = SyncStatus::from_code(status);
			}
		}
		transport.shutdown().await?;

		let local_status = finish_sources(sources, events, flags.suspended()).await?;
		if !peer_status.is_ok() {
			Ok(peer_status)
		} else {
			Ok(local_status)
		}
	}
}

fn source_uri(source: &TrackingSource) -> String {
	let uri = &source.descriptor().uri;
	if uri.is_empty() {
		source.name().to_string()
	} else {
		uri.clone()
	}
}

#[async_trait]
impl ProtocolEngine for LocalEngine {
	async fn run(&mut self, ctx: &mut EngineContext<'_>) -> Result<SyncStatus, SyncError> {
		if ctx.server_mode {
			self.run_server(ctx).await
		} else {
			self.run_client(ctx).await
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::node::VolatileConfigNode;
	use crate::engine::mock::loopback_pair;
	use crate::engine::Credentials;
	use crate::source::memory::MemoryStoreHandle;
	use crate::source::SourceDescriptor;
	use std::sync::Arc;

	fn tracking_source(name: &str, uri: &str, mode: SyncMode, handle: &MemoryStoreHandle) -> TrackingSource {
		TrackingSource::new(
			SourceDescriptor {
				name: name.to_string(),
				uri: uri.to_string(),
				mode,
				..Default::default()
			},
			Box::new(handle.source()),
			Arc::new(VolatileConfigNode::new("tracking")),
		)
	}

	async fn run_pair(
		client_sources: &mut [TrackingSource],
		server_sources: &mut [TrackingSource],
	) -> (SyncStatus, SyncStatus) {
		let (mut ct, mut st) = loopback_pair();
		let flags_c = SyncFlags::new();
		let flags_s = SyncFlags::new();
		let mut events_c = |_e: EngineEvent| {};
		let mut events_s = |_e: EngineEvent| {};

		let client = async {
			let mut ctx = EngineContext {
				sources: client_sources,
				transport: &mut ct,
				events: &mut events_c,
				flags: &flags_c,
				credentials: Credentials::default(),
				device_id: "client-dev".to_string(),
				server_mode: false,
			};
			LocalEngine::new().run(&mut ctx).await
		};
		let server = async {
			let mut ctx = EngineContext {
				sources: server_sources,
				transport: &mut st,
				events: &mut events_s,
				flags: &flags_s,
				credentials: Credentials::default(),
				device_id: "server-dev".to_string(),
				server_mode: true,
			};
			LocalEngine::new().run(&mut ctx).await
		};

		let (client_status, server_status) = tokio::join!(client, server);
		(client_status.unwrap(), server_status.unwrap())
	}

	#[tokio::test]
	async fn test_two_way_sync_converges() {
		let client_store = MemoryStoreHandle::new();
		let server_store = MemoryStoreHandle::new();
		client_store.put("A", b"from client");
		server_store.put("B", b"from server");

		let mut client = vec![tracking_source("addressbook", "card", SyncMode::TwoWay, &client_store)];
		let mut server = vec![tracking_source("contacts", "card", SyncMode::TwoWay, &server_store)];

		let (cs, ss) = run_pair(&mut client, &mut server).await;
		assert_eq!(cs, SyncStatus::Ok);
		assert_eq!(ss, SyncStatus::Ok);

		assert_eq!(client_store.get("B").unwrap(), b"from server");
		assert_eq!(server_store.get("A").unwrap(), b"from client");
		assert_eq!(client_store.len(), 2);
		assert_eq!(server_store.len(), 2);
	}

	#[tokio::test]
	async fn test_refresh_from_client_replaces_server_content() {
		let client_store = MemoryStoreHandle::new();
		let server_store = MemoryStoreHandle::new();
		client_store.put("A", b"client a");
		server_store.put("STALE", b"server junk");

		let mut client =
			vec![tracking_source("memo", "note", SyncMode::RefreshFromClient, &client_store)];
		let mut server = vec![tracking_source("memo", "note", SyncMode::TwoWay, &server_store)];

		let (cs, ss) = run_pair(&mut client, &mut server).await;
		assert_eq!(cs, SyncStatus::Ok);
		assert_eq!(ss, SyncStatus::Ok);

		assert!(server_store.get("STALE").is_none(), "server content must be wiped");
		assert_eq!(server_store.get("A").unwrap(), b"client a");
		assert_eq!(client_store.len(), 1);
	}

	#[tokio::test]
	async fn test_unknown_uri_gets_not_found_and_no_changes() {
		let client_store = MemoryStoreHandle::new();
		let server_store = MemoryStoreHandle::new();
		client_store.put("E1", b"event");
		server_store.put("C1", b"contact");

		let mut client = vec![tracking_source("calendar", "events", SyncMode::TwoWay, &client_store)];
		let mut server = vec![tracking_source("addressbook", "card", SyncMode::TwoWay, &server_store)];

		let (cs, _ss) = run_pair(&mut client, &mut server).await;
		// the peer reported 404 for the unknown database
		assert_eq!(cs, SyncStatus::NotFound);
		// nothing crossed over
		assert_eq!(client_store.len(), 1);
		assert_eq!(server_store.len(), 1);
		assert!(server_store.get("E1").is_none());
	}

	#[tokio::test]
	async fn test_wrong_password_forbidden() {
		let client_store = MemoryStoreHandle::new();
		let server_store = MemoryStoreHandle::new();
		client_store.put("A", b"data");

		let mut client_sources =
			vec![tracking_source("memo", "note", SyncMode::TwoWay, &client_store)];
		let mut server_sources =
			vec![tracking_source("memo", "note", SyncMode::TwoWay, &server_store)];

		let (mut ct, mut st) = loopback_pair();
		let flags = SyncFlags::new();
		let mut ev1 = |_e: EngineEvent| {};
		let mut ev2 = |_e: EngineEvent| {};

		let client = async {
			let mut ctx = EngineContext {
				sources: &mut client_sources,
				transport: &mut ct,
				events: &mut ev1,
				flags: &flags,
				credentials: Credentials {
					username: "user".to_string(),
					password: "wrong".to_string(),
				},
				device_id: "c".to_string(),
				server_mode: false,
			};
			LocalEngine::new().run(&mut ctx).await
		};
		let server_flags = SyncFlags::new();
		let server = async {
			let mut ctx = EngineContext {
				sources: &mut server_sources,
				transport: &mut st,
				events: &mut ev2,
				flags: &server_flags,
				credentials: Credentials {
					username: "user".to_string(),
					password: "right".to_string(),
				},
				device_id: "s".to_string(),
				server_mode: true,
			};
			LocalEngine::new().run(&mut ctx).await
		};

		let (client_result, server_result) = tokio::join!(client, server);
		assert!(matches!(
			client_result,
			Err(SyncError::Status(SyncStatus::Forbidden))
		));
		assert!(matches!(
			server_result,
			Err(SyncError::Status(SyncStatus::Forbidden))
		));
		assert!(server_store.is_empty());
	}
}

// vim: ts=4

use std::collections::BTreeMap;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use clap::{Arg, ArgAction, Command};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixListener;

use pimsync::bus::client::BusClient;
use pimsync::bus::{default_socket_path, server as bus_server, BusSignal};
use pimsync::engine::local_engine_factory;
use pimsync::logging;
use pimsync::server::{Server, ServerOptions};
use pimsync::source::BackendRegistry;

fn main() -> Result<(), Box<dyn Error>> {
	let matches = Command::new("pimsync")
		.version(env!("CARGO_PKG_VERSION"))
		.about("PIM data synchronization engine")
		.subcommand_required(true)
		.arg(
			Arg::new("socket")
				.short('s')
				.long("socket")
				.value_name("PATH")
				.help("Bus socket path"),
		)
		.subcommand(
			Command::new("daemon")
				.about("Run the sync scheduler")
				.arg(
					Arg::new("duration")
						.short('d')
						.long("duration")
						.value_name("SECONDS")
						.help("Exit after being idle this long (0 = never)"),
				),
		)
		.subcommand(
			Command::new("sync")
				.about("Synchronize a configured peer")
				.arg(Arg::new("config").required(true))
				.arg(
					Arg::new("mode")
						.short('m')
						.long("mode")
						.value_name("MODE")
						.help("Override the sync mode of all enabled sources"),
				)
				.arg(
					Arg::new("source")
						.action(ArgAction::Append)
						.num_args(0..)
						.help("Restrict the sync to these sources"),
				),
		)
		.subcommand(
			Command::new("configure")
				.about("Show or modify a configuration")
				.arg(Arg::new("config").required(true))
				.arg(
					Arg::new("property")
						.action(ArgAction::Append)
						.num_args(0..)
						.help("Assignments like syncURL=http://... or source/addressbook/sync=two-way"),
				),
		)
		.subcommand(
			Command::new("status")
				.about("Presence and last report of a peer")
				.arg(Arg::new("config").required(true)),
		)
		.get_matches();

	let socket = matches
		.get_one::<String>("socket")
		.map(std::path::PathBuf::from)
		.unwrap_or_else(default_socket_path);

	let runtime = tokio::runtime::Runtime::new()?;
	runtime.block_on(async move {
		if let Some(sub) = matches.subcommand_matches("daemon") {
			let duration = sub
				.get_one::<String>("duration")
				.and_then(|v| v.parse::<u64>().ok())
				.unwrap_or(600);
			run_daemon(&socket, duration).await
		} else if let Some(sub) = matches.subcommand_matches("sync") {
			let config = sub.get_one::<String>("config").expect("required");
			let mode = sub.get_one::<String>("mode").cloned().unwrap_or_default();
			let sources: Vec<String> =
				sub.get_many::<String>("source")
					.map(|v| v.cloned().collect())
					.unwrap_or_default();
			run_sync(&socket, config, &mode, &sources).await
		} else if let Some(sub) = matches.subcommand_matches("configure") {
			let config = sub.get_one::<String>("config").expect("required");
			let assignments: Vec<String> =
				sub.get_many::<String>("property")
					.map(|v| v.cloned().collect())
					.unwrap_or_default();
			run_configure(&socket, config, &assignments).await
		} else if let Some(sub) = matches.subcommand_matches("status") {
			let config = sub.get_one::<String>("config").expect("required");
			run_status(&socket, config).await
		} else {
			unreachable!("subcommand required")
		}
	})
}

async fn run_daemon(socket: &std::path::Path, duration: u64) -> Result<(), Box<dyn Error>> {
	let mut log_records = logging::init_daemon_tracing();

	let server = Server::new(ServerOptions {
		config_root: None,
		engine: local_engine_factory(),
		backends: Arc::new(BackendRegistry::new()),
		auto_term_duration: if duration == 0 {
			None
		} else {
			Some(Duration::from_secs(duration))
		},
	});

	// captured log lines become LogOutput signals for attached clients
	{
		let server = Arc::clone(&server);
		tokio::spawn(async move {
			while let Some(record) = log_records.recv().await {
				server.signal("/", "LogOutput", json!([record.level, record.text]));
			}
		});
	}

	if let Some(parent) = socket.parent() {
		std::fs::create_dir_all(parent)?;
	}
	// a previous crash may have left the socket behind
	let _ = std::fs::remove_file(socket);
	let listener = UnixListener::bind(socket)?;
	logging::info!("pimsync daemon on {}", socket.display());

	let bus = tokio::spawn(bus_server::run(Arc::clone(&server), listener));
	server.run().await;
	bus.abort();
	let _ = std::fs::remove_file(socket);
	Ok(())
}

/// Wait for a StatusChanged of `session_path` matching `predicate`
async fn wait_for_status(
	signals: &mut tokio::sync::mpsc::UnboundedReceiver<BusSignal>,
	session_path: &str,
	predicate: impl Fn(&str) -> bool,
) -> Result<(), Box<dyn Error>> {
	while let Some(signal) = signals.recv().await {
		match (signal.path.as_str(), signal.name.as_str()) {
			(path, "StatusChanged") if path == session_path => {
				let status = signal.args["status"].as_str().unwrap_or("");
				if predicate(status) {
					return Ok(());
				}
			}
			(_, "InfoRequest") => {
				// password prompts can arrive while waiting
				eprintln!("info request ignored in this phase");
			}
			_ => {}
		}
	}
	Err("daemon closed the connection".into())
}

async fn run_sync(
	socket: &std::path::Path,
	config: &str,
	mode: &str,
	sources: &[String],
) -> Result<(), Box<dyn Error>> {
	let client = BusClient::connect(socket).await?;
	let mut signals = client.signals().expect("fresh client");

	client.call("/", "Attach", json!([])).await?;
	let path = client
		.call("/", "StartSessionWithFlags", json!([config, ["cmdline"]]))
		.await?;
	let path = path.as_str().ok_or("bad session path")?.to_string();
	client.call(&path, "Attach", json!([])).await?;

	wait_for_status(&mut signals, &path, |s| s.starts_with("idle")).await?;

	let source_modes: BTreeMap<String, String> = sources
		.iter()
		.map(|s| (s.clone(), if mode.is_empty() { "two-way".to_string() } else { mode.to_string() }))
		.collect();
	client.call(&path, "Sync", json!([mode, source_modes])).await?;

	// follow the session until it is done, answering password prompts
	let mut last_progress = -1i64;
	loop {
		let signal = match signals.recv().await {
			Some(signal) => signal,
			None => return Err("daemon closed the connection".into()),
		};
		match (signal.path.as_str(), signal.name.as_str()) {
			(p, "ProgressChanged") if p == path => {
				let percent = signal.args["progress"].as_i64().unwrap_or(0);
				if percent != last_progress {
					eprint!("\rprogress: {:3}%", percent);
					last_progress = percent;
				}
			}
			(p, "StatusChanged") if p == path => {
				let status = signal.args["status"].as_str().unwrap_or("");
				if status.starts_with("done") {
					eprintln!();
					let error = signal.args["error"].as_u64().unwrap_or(0);
					if error == 0 || error == 200 {
						println!("synchronization complete");
					} else {
						println!("synchronization failed with status {}", error);
					}
					break;
				}
			}
			(_, "InfoRequest") => {
				let id = signal.args[0].as_str().unwrap_or_default().to_string();
				let state = signal.args[2].as_str().unwrap_or_default();
				let req_type = signal.args[4].as_str().unwrap_or_default();
				if state == "request" && req_type == "password" {
					client.call("/", "InfoResponse", json!([id, "working", {}])).await?;
					let password = prompt_password(&signal.args[5]).await?;
					client
						.call(
							"/",
							"InfoResponse",
							json!([id, "response", { "password": password }]),
						)
						.await?;
				}
			}
			(_, "LogOutput") => {
				let level = signal.args[0].as_str().unwrap_or("INFO");
				let text = signal.args[1].as_str().unwrap_or("");
				eprintln!("[{}] {}", level, text);
			}
			_ => {}
		}
	}

	client.call(&path, "Detach", json!([])).await?;
	client.call("/", "Detach", json!([])).await?;
	Ok(())
}

/// Ask on the terminal for the password an InfoRequest wants
async fn prompt_password(params: &serde_json::Value) -> Result<String, Box<dyn Error>> {
	let description = params
		.get("description")
		.and_then(|d| d.as_str())
		.unwrap_or("peer password");
	eprint!("{}: ", description);
	let mut line = String::new();
	BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
	Ok(line.trim_end_matches('\n').to_string())
}

async fn run_configure(
	socket: &std::path::Path,
	config: &str,
	assignments: &[String],
) -> Result<(), Box<dyn Error>> {
	let client = BusClient::connect(socket).await?;

	if assignments.is_empty() {
		let map = client.call("/", "GetConfig", json!([config, false])).await?;
		println!("{}", serde_json::to_string_pretty(&map)?);
		return Ok(());
	}

	// assignments: "key=value" or "source/<name>/key=value"
	let mut map: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
	for assignment in assignments {
		let (key_path, value) = assignment
			.split_once('=')
			.ok_or_else(|| format!("not an assignment: {}", assignment))?;
		let (outer, key) = match key_path.strip_prefix("source/") {
			Some(rest) => {
				let (source, key) = rest
					.split_once('/')
					.ok_or_else(|| format!("bad source property: {}", key_path))?;
				(format!("source/{}", source), key)
			}
			None => (String::new(), key_path),
		};
		map.entry(outer).or_default().insert(key.to_string(), value.to_string());
	}

	let mut signals = client.signals().expect("fresh client");
	let path = client.call("/", "StartSession", json!([config])).await?;
	let path = path.as_str().ok_or("bad session path")?.to_string();
	wait_for_status(&mut signals, &path, |s| s.starts_with("idle")).await?;

	client.call(&path, "SetConfig", json!([true, false, map])).await?;
	client.call(&path, "Abort", json!([])).await?;
	println!("configuration \"{}\" updated", config);
	Ok(())
}

async fn run_status(socket: &std::path::Path, config: &str) -> Result<(), Box<dyn Error>> {
	let client = BusClient::connect(socket).await?;

	let presence = client.call("/", "CheckPresence", json!([config])).await?;
	let status = presence[0].as_str().unwrap_or("");
	if status.is_empty() {
		println!("peer is reachable via {}", presence[1].to_string());
	} else {
		println!("peer is not reachable: {}", status);
	}

	let reports = client.call("/", "GetReports", json!([config, 0, 1])).await?;
	match reports.as_array().and_then(|a| a.first()) {
		Some(report) => {
			println!(
				"last sync: start {} status {}",
				report["start"], report["status"]
			);
			if let Some(sources) = report["sources"].as_object() {
				for (name, source) in sources {
					println!(
						"  {}: {} ({} new, {} updated, {} deleted)",
						name,
						source["status"].as_str().unwrap_or("?"),
						source["itemsNew"],
						source["itemsUpdated"],
						source["itemsDeleted"]
					);
				}
			}
		}
		None => println!("no sync reports yet"),
	}
	Ok(())
}

// vim: ts=4

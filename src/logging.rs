//! Logging prelude module for convenient access to tracing macros.
//!
//! # Usage
//!
//! ```ignore
//! use crate::logging::*;
//!
//! info!("This is an info message");
//! warn!("This is a warning");
//! ```

use tokio::sync::mpsc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub use tracing::{debug, error, info, trace, warn};

/// Initialize the tracing subscriber with environment filter support.
///
/// By default, logs at INFO level and above are displayed. Control the log
/// level with the `RUST_LOG` environment variable:
///
/// ```bash
/// RUST_LOG=debug pimsync daemon
/// RUST_LOG=pimsync::server=trace pimsync daemon
/// ```
pub fn init_tracing() {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
		)
		.with_writer(std::io::stderr)
		.init();
}

/// A log line captured for re-emission as a bus `LogOutput` signal
#[derive(Debug, Clone)]
pub struct LogRecord {
	/// "ERROR", "WARNING", "INFO", "DEBUG" or "DEVELOPER"
	pub level: &'static str,
	pub text: String,
}

fn level_name(level: &tracing::Level) -> &'static str {
	match *level {
		tracing::Level::ERROR => "ERROR",
		tracing::Level::WARN => "WARNING",
		tracing::Level::INFO => "INFO",
		tracing::Level::DEBUG => "DEBUG",
		tracing::Level::TRACE => "DEVELOPER",
	}
}

struct MessageVisitor {
	message: String,
}

impl tracing::field::Visit for MessageVisitor {
	fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
		if field.name() == "message" {
			self.message = format!("{:?}", value);
		}
	}

	fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
		if field.name() == "message" {
			self.message = value.to_string();
		}
	}
}

/// Layer that copies every event into a channel consumed by the bus server,
/// which broadcasts it as a `LogOutput` signal to attached clients.
struct BusLogLayer {
	tx: mpsc::UnboundedSender<LogRecord>,
}

impl<S> tracing_subscriber::Layer<S> for BusLogLayer
where
	S: tracing::Subscriber,
{
	fn on_event(
		&self,
		event: &tracing::Event<'_>,
		_ctx: tracing_subscriber::layer::Context<'_, S>,
	) {
		let mut visitor = MessageVisitor { message: String::new() };
		event.record(&mut visitor);
		if visitor.message.is_empty() {
			return;
		}
		let _ = self.tx.send(LogRecord {
			level: level_name(event.metadata().level()),
			text: visitor.message,
		});
	}
}

/// Daemon-mode initialization: stderr output plus the LogOutput capture
/// channel. Returns the receiving end for the bus server.
pub fn init_daemon_tracing() -> mpsc::UnboundedReceiver<LogRecord> {
	let (tx, rx) = mpsc::unbounded_channel();

	tracing_subscriber::registry()
		.with(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
		)
		.with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
		.with(BusLogLayer { tx })
		.init();

	rx
}

// vim: ts=4

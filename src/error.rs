//! Error types for pimsync operations

use std::error::Error;
use std::fmt;
use std::io;

use crate::status::SyncStatus;

/// Helper to reduce Box::new() boilerplate when wrapping errors
#[inline]
pub fn boxed_error<E: Error + Send + Sync + 'static>(e: E) -> Box<dyn Error + Send + Sync> {
	Box::new(e)
}

/// Configuration layer errors
///
/// These map one to one onto the typed bus errors: the variant name is the
/// error name a bus client sees, the Display text is the one-line message.
#[derive(Debug)]
pub enum ConfigError {
	/// A named configuration does not exist
	NoSuchConfig { name: String },

	/// A source is not configured for the given configuration
	NoSuchSource { config: String, source: String },

	/// Invalid method call or argument (unknown property, bad value, ...)
	InvalidCall { message: String },

	/// A configured source cannot be used (backend missing or broken)
	SourceUnusable { source: String },

	/// Write attempted through a read-only node or tree
	ReadOnly { name: String },

	/// Malformed node file content
	Parse { path: String, message: String },

	/// I/O error with the file path it happened on
	Io { path: String, source: io::Error },
}

impl fmt::Display for ConfigError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ConfigError::NoSuchConfig { name } => {
				write!(f, "No configuration \"{}\" found", name)
			}
			ConfigError::NoSuchSource { config, source } => {
				write!(f, "Configuration \"{}\" has no source \"{}\"", config, source)
			}
			ConfigError::InvalidCall { message } => write!(f, "Invalid call: {}", message),
			ConfigError::SourceUnusable { source } => {
				write!(f, "Source \"{}\" is not usable", source)
			}
			ConfigError::ReadOnly { name } => {
				write!(f, "{}: read-only, modification not allowed", name)
			}
			ConfigError::Parse { path, message } => write!(f, "{}: {}", path, message),
			ConfigError::Io { path, source } => write!(f, "{}: {}", path, source),
		}
	}
}

impl Error for ConfigError {}

impl ConfigError {
	/// Error name used on the bus wire
	pub fn bus_name(&self) -> &'static str {
		match self {
			ConfigError::NoSuchConfig { .. } => "NoSuchConfig",
			ConfigError::NoSuchSource { .. } => "NoSuchSource",
			ConfigError::InvalidCall { .. } => "InvalidCall",
			ConfigError::SourceUnusable { .. } => "SourceUnusable",
			ConfigError::ReadOnly { .. } => "ReadOnly",
			ConfigError::Parse { .. } => "ParseError",
			ConfigError::Io { .. } => "IoError",
		}
	}
}

/// Errors raised by sync source backends and the change-tracking layer
#[derive(Debug)]
pub enum SourceError {
	/// An item without a UID was reported by the backend
	MissingUid,

	/// An item has no revision token; only refresh-from-client allows that
	MissingRevision { uid: String },

	/// The backend failed an item or listing operation
	Backend { message: String },

	/// Item not found in the backend
	NotFound { uid: String },

	/// Underlying config node failure (tracking node)
	Config(ConfigError),

	/// I/O error (backup/restore item files)
	Io(io::Error),
}

impl fmt::Display for SourceError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SourceError::MissingUid => write!(f, "could not read UID for an item"),
			SourceError::MissingRevision { uid } => {
				write!(
					f,
					"could not read revision identifier for item {}: only refresh-from-client synchronization is supported",
					uid
				)
			}
			SourceError::Backend { message } => write!(f, "backend failure: {}", message),
			SourceError::NotFound { uid } => write!(f, "item {} not found", uid),
			SourceError::Config(e) => write!(f, "tracking node: {}", e),
			SourceError::Io(e) => write!(f, "I/O error: {}", e),
		}
	}
}

impl Error for SourceError {}

impl From<ConfigError> for SourceError {
	fn from(e: ConfigError) -> Self {
		SourceError::Config(e)
	}
}

impl From<io::Error> for SourceError {
	fn from(e: io::Error) -> Self {
		SourceError::Io(e)
	}
}

/// Transport layer errors
#[derive(Debug)]
pub enum TransportError {
	/// No reply within the configured timeout
	Timeout,

	/// Operation cancelled via cancel() or session abort
	Canceled,

	/// Peer closed the channel before the exchange finished
	Closed,

	/// Message could not be sent or received
	Failed { message: String },

	/// Transport used in the wrong state (send before setURL, ...)
	BadState { message: String },
}

impl fmt::Display for TransportError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			TransportError::Timeout => write!(f, "transport timeout"),
			TransportError::Canceled => write!(f, "transport cancelled"),
			TransportError::Closed => write!(f, "transport closed by peer"),
			TransportError::Failed { message } => write!(f, "transport failure: {}", message),
			TransportError::BadState { message } => write!(f, "transport misuse: {}", message),
		}
	}
}

impl Error for TransportError {}

/// Bus protocol errors (malformed frames, unknown methods, dead peers)
#[derive(Debug)]
pub enum BusError {
	/// I/O error on the socket
	Io(io::Error),

	/// Malformed JSON frame
	Malformed { message: String },

	/// Method does not exist on the addressed object
	UnknownMethod { path: String, method: String },

	/// Object path does not exist (session/connection already gone)
	UnknownObject { path: String },

	/// Remote side reported an error
	Remote { name: String, message: String },

	/// Reply channel dropped before an answer arrived
	Disconnected,
}

impl fmt::Display for BusError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			BusError::Io(e) => write!(f, "bus I/O error: {}", e),
			BusError::Malformed { message } => write!(f, "malformed bus message: {}", message),
			BusError::UnknownMethod { path, method } => {
				write!(f, "no method {} on {}", method, path)
			}
			BusError::UnknownObject { path } => write!(f, "no object {}", path),
			BusError::Remote { name, message } => write!(f, "{}: {}", name, message),
			BusError::Disconnected => write!(f, "bus peer disconnected"),
		}
	}
}

impl Error for BusError {}

impl From<io::Error> for BusError {
	fn from(e: io::Error) -> Self {
		BusError::Io(e)
	}
}

impl From<serde_json::Error> for BusError {
	fn from(e: serde_json::Error) -> Self {
		BusError::Malformed { message: e.to_string() }
	}
}

/// Unified error type for session-level operations
///
/// Every failure a session can observe ends up here; the session records it,
/// maps it to a SyncML status where one applies, and transitions to DONE.
#[derive(Debug)]
pub enum SyncError {
	/// Configuration error
	Config(ConfigError),

	/// Source/backend error
	Source { source_name: String, error: SourceError },

	/// Transport error
	Transport(TransportError),

	/// Bus error
	Bus(BusError),

	/// A SyncML status code reported by the engine or a peer
	Status(SyncStatus),

	/// Session aborted on request
	Aborted,

	/// Password request timed out
	PasswordTimeout,

	/// I/O error
	Io(io::Error),

	/// Generic error message
	Other { message: String },
}

impl fmt::Display for SyncError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SyncError::Config(e) => write!(f, "{}", e),
			SyncError::Source { source_name, error } => {
				write!(f, "source {}: {}", source_name, error)
			}
			SyncError::Transport(e) => write!(f, "{}", e),
			SyncError::Bus(e) => write!(f, "{}", e),
			SyncError::Status(s) => write!(f, "error code from peer: {}", s.code()),
			SyncError::Aborted => write!(f, "aborted on request"),
			SyncError::PasswordTimeout => write!(f, "password request timed out"),
			SyncError::Io(e) => write!(f, "I/O error: {}", e),
			SyncError::Other { message } => write!(f, "{}", message),
		}
	}
}

impl Error for SyncError {}

impl SyncError {
	/// The SyncML status a session reports for this failure
	pub fn status(&self) -> SyncStatus {
		match self {
			SyncError::Status(s) => *s,
			SyncError::Source { .. } => SyncStatus::DatastoreFailure,
			SyncError::Transport(_) => SyncStatus::TransportFailure,
			SyncError::PasswordTimeout => SyncStatus::PasswordTimeout,
			_ => SyncStatus::Fatal,
		}
	}

	/// Transport failures are temporary: auto-sync retries them silently
	pub fn is_temporary(&self) -> bool {
		matches!(self, SyncError::Transport(_))
	}
}

impl From<ConfigError> for SyncError {
	fn from(e: ConfigError) -> Self {
		SyncError::Config(e)
	}
}

impl From<TransportError> for SyncError {
	fn from(e: TransportError) -> Self {
		SyncError::Transport(e)
	}
}

impl From<BusError> for SyncError {
	fn from(e: BusError) -> Self {
		SyncError::Bus(e)
	}
}

impl From<io::Error> for SyncError {
	fn from(e: io::Error) -> Self {
		SyncError::Io(e)
	}
}

impl From<String> for SyncError {
	fn from(e: String) -> Self {
		SyncError::Other { message: e }
	}
}


// vim: ts=4

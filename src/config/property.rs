//! Typed, validated configuration properties
//!
//! Registry entries are plain values with a tagged-union kind; lookup by
//! name is case-insensitive and registration order is preserved for UI
//! enumeration. A property is immutable once registered.

use std::env;
use std::sync::Arc;
use std::sync::OnceLock;

use crate::config::node::ConfigNode;
use crate::error::ConfigError;

/// Value type of a property
#[derive(Debug, Clone)]
pub enum PropertyKind {
	/// free-form string
	String,
	/// enumerated string; each group lists aliases, the first alias of a
	/// group is its canonical spelling
	Enum(&'static [&'static [&'static str]]),
	/// signed 64 bit integer
	Int,
	/// unsigned 64 bit integer
	UInt,
	/// `0/1/f/t/false/true`, canonically `0`/`1`
	Bool,
	/// literal secret, `-` (ask at sync time) or `${VAR}` (environment)
	Password,
}

/// One registered property
#[derive(Debug, Clone)]
pub struct ConfigProperty {
	pub name: &'static str,
	/// multi-line help text, shown to users line by line
	pub comment: &'static str,
	pub default: &'static str,
	/// must be set explicitly in every valid configuration
	pub obligatory: bool,
	/// lives in the hidden node, never shown in config dumps
	pub hidden: bool,
	pub kind: PropertyKind,
}

impl ConfigProperty {
	/// Validate a value against the property type
	pub fn check(&self, value: &str) -> Result<(), String> {
		match &self.kind {
			PropertyKind::String => Ok(()),
			PropertyKind::Enum(groups) => {
				for group in groups.iter() {
					for alias in group.iter() {
						if alias.eq_ignore_ascii_case(value) {
							return Ok(());
						}
					}
				}
				Err(format!("\"{}\" is not one of the valid values for {}", value, self.name))
			}
			PropertyKind::Int => value
				.parse::<i64>()
				.map(|_| ())
				.map_err(|_| format!("{}: \"{}\" is not an integer", self.name, value)),
			PropertyKind::UInt => value
				.parse::<u64>()
				.map(|_| ())
				.map_err(|_| format!("{}: \"{}\" is not an unsigned integer", self.name, value)),
			PropertyKind::Bool => {
				if parse_bool(value).is_some() {
					Ok(())
				} else {
					Err(format!("{}: \"{}\" is not a boolean", self.name, value))
				}
			}
			// "" / "-" / "${NAME}" / literal: anything goes at check time,
			// resolution happens when the sync runs
			PropertyKind::Password => Ok(()),
		}
	}

	/// Canonical spelling of a valid value: first alias of the matching
	/// enum group (first match in registration order wins), `0`/`1` for
	/// booleans, everything else unchanged.
	pub fn canonicalize(&self, value: &str) -> String {
		match &self.kind {
			PropertyKind::Enum(groups) => {
				for group in groups.iter() {
					for alias in group.iter() {
						if alias.eq_ignore_ascii_case(value) {
							return group[0].to_string();
						}
					}
				}
				value.to_string()
			}
			PropertyKind::Bool => match parse_bool(value) {
				Some(true) => "1".to_string(),
				Some(false) => "0".to_string(),
				None => value.to_string(),
			},
			_ => value.to_string(),
		}
	}

	/// Value of the property in a node, falling back to the registered
	/// default when unset
	pub fn get(&self, node: &dyn ConfigNode) -> String {
		let raw = node.read(self.name);
		if raw.is_empty() && !node.has_key(self.name) {
			self.default.to_string()
		} else {
			self.canonicalize(&raw)
		}
	}

	pub fn get_bool(&self, node: &dyn ConfigNode) -> bool {
		parse_bool(&self.get(node)).unwrap_or(false)
	}

	pub fn get_u64(&self, node: &dyn ConfigNode) -> u64 {
		self.get(node).parse().unwrap_or(0)
	}

	/// Validate, canonicalize and store a value
	pub fn set(&self, node: &dyn ConfigNode, value: &str) -> Result<(), ConfigError> {
		self.check(value).map_err(|message| ConfigError::InvalidCall { message })?;
		node.write_full(self.name, &self.canonicalize(value), Some(self.comment), false)
	}

	/// Write the canonical default into a node. Non-obligatory defaults
	/// are marked so the dumper shows them commented out; obligatory ones
	/// are real values the user is expected to replace.
	pub fn set_default(&self, node: &dyn ConfigNode) -> Result<(), ConfigError> {
		node.write_full(self.name, self.default, Some(self.comment), !self.obligatory)
	}

	/// True when the property was set by the user rather than defaulted
	pub fn is_set(&self, node: &dyn ConfigNode) -> bool {
		node.has_key(self.name)
	}
}

pub fn parse_bool(value: &str) -> Option<bool> {
	if value.eq_ignore_ascii_case("1")
		|| value.eq_ignore_ascii_case("t")
		|| value.eq_ignore_ascii_case("true")
	{
		Some(true)
	} else if value.eq_ignore_ascii_case("0")
		|| value.eq_ignore_ascii_case("f")
		|| value.eq_ignore_ascii_case("false")
	{
		Some(false)
	} else {
		None
	}
}

/// Ordered list of properties with case-insensitive lookup
pub struct PropertyRegistry {
	properties: Vec<ConfigProperty>,
}

impl PropertyRegistry {
	pub fn new(properties: Vec<ConfigProperty>) -> Self {
		PropertyRegistry { properties }
	}

	pub fn find(&self, name: &str) -> Option<&ConfigProperty> {
		self.properties.iter().find(|p| p.name.eq_ignore_ascii_case(name))
	}

	pub fn iter(&self) -> impl Iterator<Item = &ConfigProperty> {
		self.properties.iter()
	}

	/// Seed a freshly created node with every default
	pub fn set_defaults(&self, node: &dyn ConfigNode, hidden: bool) -> Result<(), ConfigError> {
		for prop in self.properties.iter().filter(|p| p.hidden == hidden) {
			prop.set_default(node)?;
		}
		Ok(())
	}
}

/// How a password property value is to be obtained
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PasswordValue {
	/// nothing configured
	Unset,
	/// `-`: ask the user when the sync runs
	Ask,
	/// `${NAME}`: read from the process environment
	FromEnv(String),
	Literal(String),
}

impl PasswordValue {
	pub fn parse(value: &str) -> Self {
		if value.is_empty() {
			PasswordValue::Unset
		} else if value == "-" {
			PasswordValue::Ask
		} else if let Some(name) = value.strip_prefix("${").and_then(|v| v.strip_suffix('}')) {
			PasswordValue::FromEnv(name.to_string())
		} else {
			PasswordValue::Literal(value.to_string())
		}
	}

	/// Resolve everything that does not need user interaction.
	/// `Ask` stays unresolved; the session turns it into an info request.
	pub fn resolve(&self) -> Result<Option<String>, ConfigError> {
		match self {
			PasswordValue::Unset => Ok(Some(String::new())),
			PasswordValue::Ask => Ok(None),
			PasswordValue::FromEnv(name) => match env::var(name) {
				Ok(v) => Ok(Some(v)),
				Err(_) => Err(ConfigError::InvalidCall {
					message: format!("environment variable \"{}\" for password not set", name),
				}),
			},
			PasswordValue::Literal(v) => Ok(Some(v.clone())),
		}
	}
}

/// Hash of the local device description, stored in the hidden node so a
/// changed device setup can be detected and devinfo resent.
pub fn device_info_hash(parts: &[&str]) -> String {
	let mut hasher = blake3::Hasher::new();
	for part in parts {
		hasher.update(part.as_bytes());
		hasher.update(b"\0");
	}
	hasher.finalize().to_hex().to_string()
}

const SYNC_MODE_GROUPS: &[&[&str]] = &[
	&["two-way"],
	&["slow"],
	&["refresh-from-server", "refresh-server", "refresh"],
	&["refresh-from-client", "refresh-client"],
	&["one-way-from-server", "one-way-server", "one-way"],
	&["one-way-from-client", "one-way-client"],
	&["disabled", "none"],
];

fn prop(
	name: &'static str,
	comment: &'static str,
	default: &'static str,
	kind: PropertyKind,
) -> ConfigProperty {
	ConfigProperty { name, comment, default, obligatory: false, hidden: false, kind }
}

fn hidden_prop(name: &'static str, default: &'static str, kind: PropertyKind) -> ConfigProperty {
	ConfigProperty { name, comment: "", default, obligatory: false, hidden: true, kind }
}

/// Peer-level properties
pub fn sync_registry() -> &'static PropertyRegistry {
	static REGISTRY: OnceLock<PropertyRegistry> = OnceLock::new();
	REGISTRY.get_or_init(|| {
		let mut props = vec![
			ConfigProperty {
				name: "syncURL",
				comment: "Identifies how to contact the peer,\n\
					e.g. http://sync.example.com/sync or obex-bt://00:11:22:33:44:55.\n\
					Multiple URLs may be given separated by spaces; each one is\n\
					tried until a sync succeeds.",
				default: "",
				obligatory: true,
				hidden: false,
				kind: PropertyKind::String,
			},
			prop("username", "user name used for authorization with the peer", "", PropertyKind::String),
			prop(
				"password",
				"password used for authorization with the peer;\n\
					use \"-\" to be asked at sync time and \"${VAR}\" to read\n\
					the password from the environment",
				"",
				PropertyKind::Password,
			),
			prop("logDir", "full path to directory where sync reports are stored", "", PropertyKind::String),
			prop("maxLogDirs", "how many sync reports are kept, 0 = unlimited", "10", PropertyKind::UInt),
			prop("logLevel", "verbosity of the session log, 0 = default", "0", PropertyKind::UInt),
			prop("useProxy", "route HTTP traffic through a proxy", "0", PropertyKind::Bool),
			prop("proxyHost", "proxy URL (http://server:port)", "", PropertyKind::String),
			prop("proxyUsername", "user name for the proxy", "", PropertyKind::String),
			prop("proxyPassword", "password for the proxy", "", PropertyKind::Password),
			prop(
				"deviceId",
				"local device identifier sent to the peer;\n\
					generated automatically when left empty",
				"",
				PropertyKind::String,
			),
			prop(
				"remoteDeviceId",
				"device ID of the peer, used to pick this configuration\n\
					when the peer contacts us",
				"",
				PropertyKind::String,
			),
			prop("PeerIsClient", "the peer is a SyncML client, we act as server", "0", PropertyKind::Bool),
			prop("enableWBXML", "use the binary message encoding", "1", PropertyKind::Bool),
			prop("maxMsgSize", "maximum size of a single message in bytes", "20000", PropertyKind::UInt),
			prop("maxObjSize", "maximum size of a single item in bytes", "4000000", PropertyKind::UInt),
			prop(
				"SSLServerCertificates",
				"file or directory with the CA certificates used to verify the peer",
				"",
				PropertyKind::String,
			),
			prop("SSLVerifyServer", "verify the TLS certificate of the peer", "1", PropertyKind::Bool),
			prop("SSLVerifyHost", "verify that the certificate matches the host name", "1", PropertyKind::Bool),
			prop("WebURL", "web page of the peer, shown in UIs", "", PropertyKind::String),
			prop("IconURI", "icon representing the peer, shown in UIs", "", PropertyKind::String),
			prop("ConsumerReady", "configuration is ready for end users", "0", PropertyKind::Bool),
			prop(
				"autoSync",
				"automatic sync: 0/1 or a comma separated list of transports\n\
					(http, obex-bt) over which automatic syncs may run",
				"0",
				PropertyKind::String,
			),
			prop(
				"autoSyncInterval",
				"seconds between automatic syncs, 0 = only when a transport comes up",
				"86400",
				PropertyKind::UInt,
			),
			prop(
				"autoSyncDelay",
				"seconds a transport must have been up before an automatic sync starts",
				"300",
				PropertyKind::UInt,
			),
		];
		props.push(hidden_prop("deviceData", "", PropertyKind::String));
		props.push(hidden_prop("adminData", "", PropertyKind::String));
		PropertyRegistry::new(props)
	})
}

/// Per-source properties
pub fn source_registry() -> &'static PropertyRegistry {
	static REGISTRY: OnceLock<PropertyRegistry> = OnceLock::new();
	REGISTRY.get_or_init(|| {
		let props = vec![
			ConfigProperty {
				name: "sync",
				comment: "requests a certain synchronization mode:\n\
					two-way, slow, refresh-from-client, refresh-from-server,\n\
					one-way-from-client, one-way-from-server, disabled",
				default: "disabled",
				obligatory: true,
				hidden: false,
				kind: PropertyKind::Enum(SYNC_MODE_GROUPS),
			},
			prop(
				"type",
				"backend and data format of the source,\n\
					e.g. \"addressbook:text/vcard:3.0\"; a trailing \"!\" forces\n\
					the format even when the peer prefers another one",
				"select backend",
				PropertyKind::String,
			),
			prop("database", "name or URI of the local database", "", PropertyKind::String),
			prop("databaseUser", "user name for the local database", "", PropertyKind::String),
			prop("databasePassword", "password for the local database", "", PropertyKind::Password),
			prop("uri", "name of the corresponding database on the peer", "", PropertyKind::String),
			hidden_prop("adminData", "", PropertyKind::String),
			hidden_prop("last", "0", PropertyKind::UInt),
		];
		PropertyRegistry::new(props)
	})
}

/// Resolve a (possibly filtered) node's password property
pub fn password_of(node: &Arc<dyn ConfigNode>, name: &str) -> PasswordValue {
	PasswordValue::parse(&node.read(name))
}


// vim: ts=4

//! Layered configuration store
//!
//! The persistent layer is a tree of INI-like node files (`tree`, `node`),
//! wrapped by in-memory override filters (`filter`) and key transformation
//! wrappers (`prefix`, `safe`). The `property` layer adds types, defaults
//! and validation; `peer` ties everything together for one peer
//! configuration and `templates` seeds new ones.

pub mod filter;
pub mod node;
pub mod peer;
pub mod prefix;
pub mod property;
pub mod safe;
pub mod templates;
pub mod tree;

pub use filter::{ConfigFilter, FilterConfigNode};
pub use node::{ConfigNode, FileConfigNode, VolatileConfigNode};
pub use peer::{ConfigMap, PeerConfig, SourceNodes};
pub use prefix::PrefixConfigNode;
pub use property::{source_registry, sync_registry, PasswordValue, PropertyRegistry};
pub use safe::SafeConfigNode;
pub use tree::{discover, FileConfigTree, Layout, NodeKind};

// vim: ts=4

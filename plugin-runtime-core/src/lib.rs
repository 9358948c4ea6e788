//! # Plugin Runtime Core
//!
//! Leaf crate of the plugin runtime workspace: the version model, the
//! closed error taxonomy, the plugin metadata schema, the lifecycle state
//! enumeration, and the `Plugin` contract trait every extension module
//! implements. Every other crate in the workspace depends on this one and
//! none of its types depend back on them.

pub mod contract;
pub mod error;
pub mod metadata;
pub mod state;
pub mod version;

pub use contract::{Plugin, PluginContext};
pub use error::{PluginError, PluginErrorKind, PluginResult};
pub use metadata::{Capability, PluginId, PluginMetadata, Priority};
pub use state::{LifecycleEvent, PluginState};
pub use version::{Identifier, Version, VersionRange};

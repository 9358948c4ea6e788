//! # Plugin Runtime
//!
//! Root facade crate. Re-exports the public API of every workspace member
//! behind one `plugin_runtime::` path. No binary target lives here:
//! discovery, configuration-file loading, and CLI argument parsing are
//! integration concerns left to the embedding host.

pub use plugin_runtime_bus as bus;
pub use plugin_runtime_core as core;
pub use plugin_runtime_loader as loader;
pub use plugin_runtime_manager as manager;
pub use plugin_runtime_resources as resources;
pub use plugin_runtime_security as security;

pub use plugin_runtime_bus::{DeliveryMode, LogEntry, MessageBus, MessageBusConfig};
pub use plugin_runtime_core::{
    Capability, Identifier, LifecycleEvent, Plugin, PluginContext, PluginError, PluginErrorKind,
    PluginId, PluginMetadata, PluginResult, PluginState, Priority, Version, VersionRange,
};
pub use plugin_runtime_loader::{LibraryPluginLoader, LoaderFactory, PluginLoader};
pub use plugin_runtime_manager::{
    resolve_load_order, LoadOptions, PluginInfo, PluginManager, PluginManagerConfig, PluginRecord,
    ResolveOutcome,
};
pub use plugin_runtime_resources::{
    AllocationPriority, DefaultFactory, ResourceFactory, ResourceHandle, ResourceManager,
    ResourceManagerConfig, ResourceQuota, ResourceState, ResourceType,
};
pub use plugin_runtime_security::{
    PermissiveSignatureVerifier, SecurityConfig, SecurityLevel, SecurityValidationResult,
    SecurityValidator, SignatureVerifier, TrustStore,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn facade_reexports_are_usable() {
        let v = Version::parse("1.0.0").unwrap();
        assert_eq!(v.to_string(), "1.0.0");
        let _ = PluginManagerConfig::default();
    }
}

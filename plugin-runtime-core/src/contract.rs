//! The polymorphic contract every plugin satisfies: identity, lifecycle
//! callbacks, configuration, command dispatch, and diagnostic reporting.

use serde_json::Value as JsonValue;

use crate::error::PluginResult;
use crate::metadata::PluginMetadata;

/// Runtime context handed to a plugin at initialization time. Immutable
/// after construction so plugins cannot mutate manager-owned state.
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub plugin_id: String,
    pub configuration: JsonValue,
}

/// The core plugin contract. All methods must be safe to call concurrently
/// from multiple host threads; the manager never holds a global lock while
/// invoking any of these.
pub trait Plugin: Send + Sync {
    /// Static identity and capability metadata. Must not change across the
    /// plugin's lifetime.
    fn metadata(&self) -> PluginMetadata;

    /// Called once during the `Loaded -> Initializing` transition.
    fn initialize(&mut self, context: &PluginContext) -> PluginResult<()>;

    /// Called on the `Running -> Stopping` and `Paused -> Stopping`
    /// transitions, and during `shutdown_all`.
    fn shutdown(&mut self) -> PluginResult<()>;

    /// Apply a new effective configuration. The manager never interprets
    /// the JSON payload itself.
    fn configure(&mut self, config: &JsonValue) -> PluginResult<()>;

    /// The configuration a freshly-constructed plugin would use if none is
    /// supplied.
    fn default_configuration(&self) -> JsonValue {
        JsonValue::Object(serde_json::Map::new())
    }

    /// Whether `config` would be accepted by `configure`.
    fn validate_configuration(&self, _config: &JsonValue) -> bool {
        true
    }

    /// The plugin's current effective configuration.
    fn current_configuration(&self) -> JsonValue {
        JsonValue::Object(serde_json::Map::new())
    }

    /// Invoke a plugin-defined command. Command names and parameter shapes
    /// are entirely plugin-defined.
    fn execute_command(&mut self, command: &str, params: &JsonValue) -> PluginResult<JsonValue>;

    /// Command names this plugin recognizes, for discovery.
    fn available_commands(&self) -> Vec<String> {
        Vec::new()
    }

    /// Free-form diagnostic snapshot surfaced through the manager's metrics.
    fn diagnostics(&self) -> JsonValue {
        JsonValue::Object(serde_json::Map::new())
    }
}

//! The manager's per-plugin bookkeeping: `PluginRecord`, its serializable
//! snapshot `PluginInfo`, and the options accepted by a load request.

use std::collections::VecDeque;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use plugin_runtime_core::{Plugin, PluginError, PluginId, PluginMetadata, PluginState};
use plugin_runtime_security::SecurityLevel;
use serde::Serialize;
use serde_json::Value as JsonValue;

/// Bounded FIFO capacity for a record's error log.
const ERROR_LOG_CAPACITY: usize = 100;

/// The manager's bookkeeping for one admitted plugin. Owned exclusively by
/// the `PluginManager`; plugins never see or mutate this directly.
pub struct PluginRecord {
    pub id: PluginId,
    pub file_path: PathBuf,
    pub metadata: PluginMetadata,
    pub state: PluginState,
    pub load_time: DateTime<Utc>,
    pub last_error: Option<PluginError>,
    pub error_log: VecDeque<PluginError>,
    /// `None` only while the instance has been taken out for an in-flight
    /// callback invocation (see `PluginManager::call_plugin`); never
    /// observable outside that brief window.
    pub instance: Option<Box<dyn Plugin>>,
    pub configuration: JsonValue,
    pub trust_level: SecurityLevel,
}

impl PluginRecord {
    pub fn new(
        file_path: PathBuf,
        metadata: PluginMetadata,
        instance: Box<dyn Plugin>,
        trust_level: SecurityLevel,
    ) -> Self {
        Self {
            id: metadata.id.clone(),
            file_path,
            metadata,
            state: PluginState::Loaded,
            load_time: Utc::now(),
            last_error: None,
            error_log: VecDeque::new(),
            instance: Some(instance),
            configuration: JsonValue::Object(serde_json::Map::new()),
            trust_level,
        }
    }

    /// Record a failure: sets `last_error`, appends to the bounded log, and
    /// transitions to `Error`.
    pub fn record_error(&mut self, error: PluginError) {
        self.last_error = Some(error.clone());
        if self.error_log.len() >= ERROR_LOG_CAPACITY {
            self.error_log.pop_front();
        }
        self.error_log.push_back(error);
        self.state = PluginState::Error;
    }

    pub fn info(&self) -> PluginInfo {
        PluginInfo {
            id: self.id.clone(),
            file_path: self.file_path.clone(),
            metadata: self.metadata.clone(),
            state: self.state,
            load_time: self.load_time,
            last_error: self.last_error.clone(),
            trust_level: self.trust_level,
        }
    }
}

/// A serializable, read-only snapshot of a `PluginRecord`, returned by
/// `get_plugin` and `all_plugin_info` in place of a direct reference.
#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    pub id: PluginId,
    pub file_path: PathBuf,
    pub metadata: PluginMetadata,
    pub state: PluginState,
    pub load_time: DateTime<Utc>,
    pub last_error: Option<PluginError>,
    pub trust_level: SecurityLevel,
}

/// Options accepted by `load_plugin` / `load_plugins`.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub configuration: Option<JsonValue>,
    pub initialize_immediately: bool,
    pub timeout: Option<std::time::Duration>,
}

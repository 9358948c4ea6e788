//! Manager-level configuration, following the `*Config` + `impl Default`
//! pattern shared by every subsystem in this workspace.

use std::time::Duration;

use plugin_runtime_core::Version;

/// Configuration controlling the manager's own behavior, independent of the
/// per-subsystem configs (`SecurityConfig`, `ResourceQuota`, ...) owned by
/// the components it composes.
#[derive(Debug, Clone)]
pub struct PluginManagerConfig {
    /// The embedding host's own version, checked against each plugin's
    /// `min_host_version`/`max_host_version` constraints.
    pub host_version: Version,
    /// Directories searched by `discover` in addition to explicit calls to
    /// `add_search_path`.
    pub initial_search_paths: Vec<std::path::PathBuf>,
    /// Upper bound on how long a single plugin callback (`initialize`,
    /// `shutdown`, `configure`, `execute_command`) may run before the
    /// manager gives up and marks the record `Error`.
    pub callback_timeout: Duration,
    pub resource_cleanup_interval: Duration,
}

impl Default for PluginManagerConfig {
    fn default() -> Self {
        Self {
            host_version: Version::new(1, 0, 0),
            initial_search_paths: Vec::new(),
            callback_timeout: Duration::from_secs(30),
            resource_cleanup_interval: Duration::from_secs(1),
        }
    }
}

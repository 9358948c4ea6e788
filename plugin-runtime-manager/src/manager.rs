//! The orchestrator: composes the loader, security validator, resource
//! manager, message bus, and dependency resolver; owns the plugin registry;
//! drives the lifecycle state machine end to end.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use plugin_runtime_core::{
    LifecycleEvent, Plugin, PluginContext, PluginError, PluginErrorKind, PluginId, PluginMetadata,
    PluginResult, PluginState,
};
use plugin_runtime_bus::MessageBus;
use plugin_runtime_loader::{LoaderFactory, PluginLoader};
use plugin_runtime_resources::ResourceManager;
use plugin_runtime_security::{SecurityLevel, SecurityValidationResult, SecurityValidator};
use serde_json::Value as JsonValue;
use tokio::sync::RwLock as AsyncRwLock;
use tracing::{info, warn};

use crate::config::PluginManagerConfig;
use crate::record::{LoadOptions, PluginInfo, PluginRecord};
use crate::resolver::{self, ResolveOutcome};

/// The single entry point for loading, querying, configuring, commanding,
/// and unloading plugins, and the authority over state transitions.
pub struct PluginManager {
    registry: dashmap::DashMap<PluginId, Arc<AsyncRwLock<PluginRecord>>>,
    loader: Box<dyn PluginLoader>,
    security: SecurityValidator,
    resources: Arc<ResourceManager>,
    bus: Arc<MessageBus>,
    search_paths: parking_lot::RwLock<Vec<PathBuf>>,
    config: PluginManagerConfig,
}

impl PluginManager {
    pub fn new(
        config: PluginManagerConfig,
        loader: Box<dyn PluginLoader>,
        security: SecurityValidator,
        resources: Arc<ResourceManager>,
        bus: Arc<MessageBus>,
    ) -> Self {
        resources.start_cleanup_task();
        Self {
            registry: dashmap::DashMap::new(),
            loader,
            security,
            resources,
            bus,
            search_paths: parking_lot::RwLock::new(config.initial_search_paths.clone()),
            config,
        }
    }

    /// Convenience constructor wiring up the bundled default implementation
    /// of every subsystem.
    pub fn with_defaults(host_version: plugin_runtime_core::Version) -> Self {
        let config = PluginManagerConfig {
            host_version,
            ..Default::default()
        };
        Self::new(
            config,
            LoaderFactory::create_default(),
            SecurityValidator::new(plugin_runtime_security::SecurityConfig::default()),
            Arc::new(ResourceManager::default()),
            Arc::new(MessageBus::new()),
        )
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub fn add_search_path(&self, path: PathBuf) {
        self.search_paths.write().push(path);
    }

    /// Enumerate candidate plugin files below `path`, filtered to the
    /// loader's supported extensions.
    pub fn discover(&self, path: &Path, recursive: bool) -> PluginResult<Vec<PathBuf>> {
        let mut found = Vec::new();
        self.discover_into(path, recursive, &mut found)?;
        Ok(found)
    }

    fn discover_into(&self, dir: &Path, recursive: bool, out: &mut Vec<PathBuf>) -> PluginResult<()> {
        let entries = read_dir_with_retry(dir)?;
        for entry in entries {
            let path = entry.path();
            if path.is_dir() {
                if recursive {
                    self.discover_into(&path, recursive, out)?;
                }
                continue;
            }
            if self.loader.can_load(&path) {
                out.push(path);
            }
        }
        Ok(())
    }

    fn get_record_arc(&self, id: &str) -> PluginResult<Arc<AsyncRwLock<PluginRecord>>> {
        self.registry
            .get(id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| PluginError::new(PluginErrorKind::NotFound, format!("no such plugin: {id}")))
    }

    fn validate_and_read_metadata(
        &self,
        path: &Path,
    ) -> PluginResult<(PluginMetadata, SecurityValidationResult)> {
        // Metadata is read up front so the metadata-dependent security
        // stages (Standard and above) have something to check; the basic
        // file-integrity stage runs identically whether or not metadata was
        // available.
        let metadata = self.loader.read_metadata(path).ok();
        let result = self.security.validate(path, metadata.as_ref());
        if !result.is_valid {
            return Ok((
                metadata.unwrap_or_else(|| placeholder_metadata(path)),
                result,
            ));
        }
        let metadata = metadata.ok_or_else(|| {
            PluginError::new(
                PluginErrorKind::InvalidFormat,
                format!("failed to read plugin metadata from {}", path.display()),
            )
        })?;
        Ok((metadata, result))
    }

    fn check_host_version(&self, metadata: &PluginMetadata) -> PluginResult<()> {
        if let Some(min) = &metadata.min_host_version {
            if self.config.host_version < *min {
                return Err(PluginError::new(
                    PluginErrorKind::VersionMismatch,
                    format!(
                        "plugin {} requires host >= {min}, running {}",
                        metadata.id, self.config.host_version
                    ),
                ));
            }
        }
        if let Some(max) = &metadata.max_host_version {
            if self.config.host_version >= *max {
                return Err(PluginError::new(
                    PluginErrorKind::VersionMismatch,
                    format!(
                        "plugin {} requires host < {max}, running {}",
                        metadata.id, self.config.host_version
                    ),
                ));
            }
        }
        Ok(())
    }

    fn check_dependencies_single(&self, metadata: &PluginMetadata) -> PluginResult<()> {
        for dep in &metadata.dependencies {
            if !self.registry.contains_key(dep) {
                return Err(PluginError::new(
                    PluginErrorKind::DependencyMissing,
                    format!("missing required dependency \"{dep}\" of \"{}\"", metadata.id),
                ));
            }
        }
        for dep in &metadata.optional_dependencies {
            if !self.registry.contains_key(dep) {
                warn!(plugin = %metadata.id, dependency = %dep, "optional dependency not available; continuing without it");
            }
        }
        Ok(())
    }

    /// Run the full load protocol against one file: existence, security
    /// validation, conflict and version checks, dependency checks, the
    /// actual load, optional configuration, and optional initialization.
    /// Any failing step leaves no trace of the plugin in the registry.
    pub async fn load_plugin(&self, path: impl Into<PathBuf>, options: LoadOptions) -> PluginResult<PluginId> {
        let path = path.into();
        let inserted_id: Arc<parking_lot::Mutex<Option<PluginId>>> = Arc::new(parking_lot::Mutex::new(None));
        let inserted_id_for_body = Arc::clone(&inserted_id);

        let body = async move {
            if !path.exists() {
                return Err(PluginError::new(
                    PluginErrorKind::FileNotFound,
                    format!("plugin file not found: {}", path.display()),
                ));
            }

            let (metadata, validation) = self.validate_and_read_metadata(&path)?;
            if !validation.is_valid {
                return Err(PluginError::new(
                    PluginErrorKind::SecurityViolation,
                    validation.errors.join("; "),
                ));
            }

            if self.registry.contains_key(&metadata.id) {
                return Err(PluginError::new(
                    PluginErrorKind::AlreadyLoaded,
                    format!("plugin already loaded: {}", metadata.id),
                ));
            }

            self.check_host_version(&metadata)?;
            self.check_dependencies_single(&metadata)?;

            let (instance, _loader_assigned_id) = self.loader.load(&path)?;
            let trust_level = validation.validated_level.unwrap_or(SecurityLevel::None);
            let record = PluginRecord::new(path.clone(), metadata, instance, trust_level);
            let id = record.id.clone();

            self.registry.insert(id.clone(), Arc::new(AsyncRwLock::new(record)));
            self.resources.mark_plugin_registered(&id);
            *inserted_id_for_body.lock() = Some(id.clone());
            info!(plugin = %id, path = %path.display(), "plugin admitted and registered");

            if let Some(cfg) = options.configuration.clone() {
                if let Err(e) = self.configure(&id, cfg).await {
                    let _ = self.finalize_unload(&id).await;
                    return Err(PluginError::new(PluginErrorKind::ConfigurationError, e.to_string()));
                }
            }

            if options.initialize_immediately {
                if let Err(e) = self.initialize(&id).await {
                    let _ = self.unload_single(&id).await;
                    return Err(e);
                }
            }

            Ok(id)
        };

        match options.timeout {
            Some(duration) => match tokio::time::timeout(duration, body).await {
                Ok(result) => result,
                Err(_) => {
                    if let Some(id) = inserted_id.lock().clone() {
                        let _ = self.finalize_unload(&id).await;
                    }
                    Err(PluginError::new(PluginErrorKind::TimeoutError, "load_plugin timed out"))
                }
            },
            None => body.await,
        }
    }

    /// Batch-load `paths`, resolving a dependency order across the batch
    /// before loading any of them. Per-item results are returned in the
    /// same order as `paths` regardless of the order plugins were actually
    /// loaded in.
    pub async fn load_plugins(
        &self,
        paths: Vec<PathBuf>,
        options: LoadOptions,
    ) -> Vec<PluginResult<PluginId>> {
        let mut metas = Vec::new();
        let mut path_by_id: HashMap<PluginId, PathBuf> = HashMap::new();
        let mut early_failures: Vec<(PathBuf, PluginError)> = Vec::new();

        for path in &paths {
            match self.validate_and_read_metadata(path) {
                Ok((meta, validation)) if validation.is_valid => {
                    path_by_id.insert(meta.id.clone(), path.clone());
                    metas.push(meta);
                }
                Ok((_, validation)) => {
                    early_failures.push((
                        path.clone(),
                        PluginError::new(PluginErrorKind::SecurityViolation, validation.errors.join("; ")),
                    ));
                }
                Err(e) => early_failures.push((path.clone(), e)),
            }
        }

        let already_loaded: HashSet<PluginId> = self.registry.iter().map(|e| e.key().clone()).collect();
        let ResolveOutcome { order, warnings } = match resolver::resolve_load_order(&metas, &already_loaded) {
            Ok(outcome) => outcome,
            Err(e) => return paths.iter().map(|_| Err(e.clone())).collect(),
        };
        for w in warnings {
            warn!("{w}");
        }

        let mut results: HashMap<PathBuf, PluginResult<PluginId>> = HashMap::new();
        for id in order {
            let path = path_by_id.remove(&id).expect("order only contains batch ids");
            let result = self.load_plugin(path.clone(), options.clone()).await;
            results.insert(path, result);
        }
        for (path, err) in early_failures {
            results.insert(path, Err(err));
        }

        paths
            .into_iter()
            .map(|p| {
                results
                    .remove(&p)
                    .unwrap_or_else(|| Err(PluginError::new(PluginErrorKind::UnknownError, "plugin was not processed")))
            })
            .collect()
    }

    fn transition(&self, guard: &mut PluginRecord, event: LifecycleEvent) -> PluginResult<()> {
        match guard.state.apply(event) {
            Some(next) => {
                guard.state = next;
                Ok(())
            }
            None => Err(PluginError::new(
                PluginErrorKind::StateError,
                format!("invalid event {event:?} from state {:?} for plugin {}", guard.state, guard.id),
            )),
        }
    }

    async fn apply_event(&self, id: &str, event: LifecycleEvent) -> PluginResult<()> {
        let record_arc = self.get_record_arc(id)?;
        let mut guard = record_arc.write().await;
        self.transition(&mut guard, event)
    }

    /// Take the plugin instance out of its record, invoke `op` on a blocking
    /// thread outside any lock and under the manager's configured
    /// `callback_timeout`, then restore the instance and commit the outcome.
    /// Panics are caught and converted to `ExecutionFailed`. A callback that
    /// does not return within `callback_timeout` converts to `TimeoutError`;
    /// its instance cannot be reclaimed from the still-running blocking
    /// thread, so the record is left without one (consistent with the
    /// plugin having transitioned to `Error` and being expected to unload).
    async fn call_plugin<R: Send + 'static>(
        &self,
        id: &str,
        op: impl FnOnce(&mut dyn Plugin) -> PluginResult<R> + Send + 'static,
    ) -> PluginResult<R> {
        let record_arc = self.get_record_arc(id)?;

        let mut instance = {
            let mut guard = record_arc.write().await;
            guard.instance.take().ok_or_else(|| {
                PluginError::new(
                    PluginErrorKind::StateError,
                    format!("plugin {id} has no live instance to invoke"),
                )
            })?
        };

        let callback_timeout = self.config.callback_timeout;
        let join = tokio::task::spawn_blocking(move || {
            let result =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| op(instance.as_mut())));
            (instance, result)
        });

        let mut guard = record_arc.write().await;
        match tokio::time::timeout(callback_timeout, join).await {
            Ok(Ok((instance, Ok(Ok(value))))) => {
                guard.instance = Some(instance);
                Ok(value)
            }
            Ok(Ok((instance, Ok(Err(e))))) => {
                guard.instance = Some(instance);
                guard.record_error(e.clone());
                Err(e)
            }
            Ok(Ok((instance, Err(_panic)))) => {
                guard.instance = Some(instance);
                let e = PluginError::new(
                    PluginErrorKind::ExecutionFailed,
                    format!("plugin {id} callback panicked"),
                );
                guard.record_error(e.clone());
                Err(e)
            }
            Ok(Err(join_err)) => {
                let e = PluginError::new(
                    PluginErrorKind::ExecutionFailed,
                    format!("plugin {id} callback task failed: {join_err}"),
                );
                guard.record_error(e.clone());
                Err(e)
            }
            Err(_elapsed) => {
                let e = PluginError::new(
                    PluginErrorKind::TimeoutError,
                    format!("plugin {id} callback exceeded callback_timeout"),
                );
                guard.record_error(e.clone());
                Err(e)
            }
        }
    }

    pub async fn initialize(&self, id: &str) -> PluginResult<()> {
        self.apply_event(id, LifecycleEvent::Initialize).await?;
        let context = {
            let record_arc = self.get_record_arc(id)?;
            let guard = record_arc.read().await;
            PluginContext {
                plugin_id: guard.id.clone(),
                configuration: guard.configuration.clone(),
            }
        };
        self.call_plugin(id, move |p| p.initialize(&context)).await?;
        let record_arc = self.get_record_arc(id)?;
        record_arc.write().await.state = PluginState::Running;
        Ok(())
    }

    pub async fn start(&self, id: &str) -> PluginResult<()> {
        self.apply_event(id, LifecycleEvent::Start).await
    }

    pub async fn resume(&self, id: &str) -> PluginResult<()> {
        self.apply_event(id, LifecycleEvent::Resume).await
    }

    pub async fn pause(&self, id: &str) -> PluginResult<()> {
        self.apply_event(id, LifecycleEvent::Pause).await
    }

    pub async fn stop(&self, id: &str) -> PluginResult<()> {
        self.apply_event(id, LifecycleEvent::Stop).await?;
        self.call_plugin(id, |p| p.shutdown()).await?;
        let record_arc = self.get_record_arc(id)?;
        record_arc.write().await.state = PluginState::Stopped;
        Ok(())
    }

    pub async fn configure(&self, id: &str, config: JsonValue) -> PluginResult<()> {
        let config_for_plugin = config.clone();
        self.call_plugin(id, move |p| p.configure(&config_for_plugin)).await?;
        let record_arc = self.get_record_arc(id)?;
        record_arc.write().await.configuration = config;
        Ok(())
    }

    pub async fn execute_command(&self, id: &str, command: &str, params: JsonValue) -> PluginResult<JsonValue> {
        let command = command.to_string();
        self.call_plugin(id, move |p| p.execute_command(&command, &params)).await
    }

    fn dependents_of(&self, id: &str) -> BTreeSet<PluginId> {
        self.registry
            .iter()
            .filter(|entry| entry.key() != id)
            .filter_map(|entry| {
                // try_read avoids blocking on a record mid-transition; a
                // plugin that cannot be inspected right now cannot be a
                // cascade target this round either.
                entry
                    .value()
                    .try_read()
                    .ok()
                    .filter(|r| r.metadata.dependencies.iter().any(|d| d == id))
                    .map(|_| entry.key().clone())
            })
            .collect()
    }

    async fn unload_single(&self, id: &str) -> PluginResult<()> {
        let record_arc = self.get_record_arc(id)?;
        let state = record_arc.read().await.state;

        match state {
            PluginState::Running | PluginState::Paused | PluginState::Initializing => {
                self.apply_event(id, LifecycleEvent::Shutdown).await?;
                let _ = self.call_plugin(id, |p| p.shutdown()).await;
            }
            PluginState::Loaded | PluginState::Stopped | PluginState::Error => {
                self.apply_event(id, LifecycleEvent::Shutdown).await?;
            }
            PluginState::Stopping | PluginState::Unloaded | PluginState::Reloading => {}
        }

        self.finalize_unload(id).await
    }

    async fn finalize_unload(&self, id: &str) -> PluginResult<()> {
        // Drop order: the registry entry (and the plugin object it owns)
        // goes first, then the loader's OS handle, then (inside the
        // loader's own Drop) the file unmap, per plugin-object -> loader-
        // entry -> file-unmap.
        self.registry.remove(id);
        self.resources.mark_plugin_unregistered(id);
        self.loader.unload(id)
    }

    /// Unload `id`, refusing if a dependent is still loaded unless `force`
    /// is set, in which case dependents cascade-unload first.
    pub async fn unload_plugin(&self, id: &str, force: bool) -> PluginResult<()> {
        let dependents = self.dependents_of(id);
        if !dependents.is_empty() {
            if !force {
                return Err(PluginError::new(
                    PluginErrorKind::DependencyMissing,
                    format!("cannot unload {id}: depended on by {dependents:?}"),
                ));
            }
            for dependent in dependents {
                Box::pin(self.unload_plugin(&dependent, true)).await?;
            }
        }
        self.unload_single(id).await
    }

    /// Unload and re-load a plugin from the same path, preserving its
    /// current effective configuration and re-initializing it if it was
    /// previously running.
    pub async fn reload_plugin(&self, id: &str) -> PluginResult<PluginId> {
        let (file_path, configuration, was_live) = {
            let record_arc = self.get_record_arc(id)?;
            let guard = record_arc.read().await;
            (
                guard.file_path.clone(),
                guard.configuration.clone(),
                matches!(
                    guard.state,
                    PluginState::Running | PluginState::Paused | PluginState::Initializing
                ),
            )
        };

        self.apply_event(id, LifecycleEvent::Reload).await?;
        if was_live {
            let _ = self.call_plugin(id, |p| p.shutdown()).await;
        }
        self.finalize_unload(id).await?;

        self.load_plugin(
            file_path,
            LoadOptions {
                configuration: Some(configuration),
                initialize_immediately: was_live,
                timeout: None,
            },
        )
        .await
    }

    /// Best-effort shutdown of every registered plugin. Never blocks
    /// indefinitely: a plugin whose shutdown exceeds the configured limit is
    /// force-removed and reported as `TimeoutError`.
    pub async fn shutdown_all(&self) -> Vec<(PluginId, PluginResult<()>)> {
        let ids: Vec<PluginId> = self.registry.iter().map(|e| e.key().clone()).collect();
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            if !self.registry.contains_key(&id) {
                continue; // already cascaded away by an earlier unload in this loop
            }
            let outcome = tokio::time::timeout(self.config.callback_timeout, self.unload_plugin(&id, true)).await;
            match outcome {
                Ok(result) => results.push((id, result)),
                Err(_) => {
                    warn!(plugin = %id, "shutdown exceeded the configured limit; forcing removal");
                    let _ = self.finalize_unload(&id).await;
                    results.push((
                        id,
                        Err(PluginError::new(PluginErrorKind::TimeoutError, "shutdown exceeded configured limit")),
                    ));
                }
            }
        }
        results
    }

    pub async fn get_plugin(&self, id: &str) -> Option<PluginInfo> {
        let record_arc = self.registry.get(id).map(|r| Arc::clone(r.value()))?;
        Some(record_arc.read().await.info())
    }

    pub async fn all_plugin_info(&self) -> Vec<PluginInfo> {
        let arcs: Vec<Arc<AsyncRwLock<PluginRecord>>> =
            self.registry.iter().map(|e| Arc::clone(e.value())).collect();
        let mut infos = Vec::with_capacity(arcs.len());
        for arc in arcs {
            infos.push(arc.read().await.info());
        }
        infos
    }

    pub fn loaded_plugins(&self) -> Vec<PluginId> {
        self.registry.iter().map(|e| e.key().clone()).collect()
    }

    pub async fn system_metrics(&self) -> JsonValue {
        let mut by_state: HashMap<String, u64> = HashMap::new();
        let arcs: Vec<Arc<AsyncRwLock<PluginRecord>>> =
            self.registry.iter().map(|e| Arc::clone(e.value())).collect();
        for arc in &arcs {
            let state = arc.read().await.state;
            let label = serde_json::to_value(state)
                .ok()
                .and_then(|v| v.as_str().map(|s| s.to_string()))
                .unwrap_or_else(|| "Unknown".to_string());
            *by_state.entry(label).or_insert(0) += 1;
        }

        let bus_stats = self.bus.statistics();
        let security_stats = self.security.statistics();
        let resource_stats = self.resources.usage_stats(None, None);

        serde_json::json!({
            "plugin_count": arcs.len(),
            "by_state": by_state,
            "messages_published": bus_stats["messages_published"],
            "messages_delivered": bus_stats["messages_delivered"],
            "delivery_failures": bus_stats["delivery_failures"],
            "validations_performed": security_stats["validations_performed"],
            "validations_passed": security_stats["validations_passed"],
            "validations_failed": security_stats["validations_failed"],
            "resource_pools": resource_stats["pools"],
            "search_paths": self.search_paths.read().clone(),
        })
    }
}

fn placeholder_metadata(path: &Path) -> PluginMetadata {
    PluginMetadata {
        id: path.display().to_string(),
        name: String::new(),
        description: String::new(),
        version: plugin_runtime_core::Version::new(0, 0, 0),
        author: String::new(),
        license: String::new(),
        homepage: String::new(),
        category: String::new(),
        tags: Default::default(),
        dependencies: vec![],
        optional_dependencies: vec![],
        capabilities: Default::default(),
        priority: Default::default(),
        min_host_version: None,
        max_host_version: None,
        custom_data: None,
    }
}

/// One automatic retry for transient I/O during directory scanning. Plugin
/// callbacks never get this treatment; a misbehaving plugin fails once.
fn read_dir_with_retry(dir: &Path) -> PluginResult<Vec<std::fs::DirEntry>> {
    match std::fs::read_dir(dir) {
        Ok(entries) => Ok(entries.filter_map(Result::ok).collect()),
        Err(_) => std::fs::read_dir(dir)
            .map(|entries| entries.filter_map(Result::ok).collect())
            .map_err(|e| {
                PluginError::new(
                    PluginErrorKind::FileSystemError,
                    format!("failed to read directory {}: {e}", dir.display()),
                )
            }),
    }
}

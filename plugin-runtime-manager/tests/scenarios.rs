//! End-to-end scenario tests covering batch load ordering, host-version
//! gating, version parsing, message bus delivery, resource quota
//! exhaustion, and security validation. A `FakeLoader`/`FakePlugin` pair
//! stands in for a real dynamic-library plugin so these run without an
//! actual `.so`/`.dll` on disk; the security validator's file-integrity
//! stage still runs against real temp files so the admission pipeline is
//! exercised honestly.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use plugin_runtime_bus::{DeliveryMode, MessageBus};
use plugin_runtime_core::{
    Capability, Plugin, PluginContext, PluginErrorKind, PluginMetadata, PluginResult, Priority,
    Version,
};
use plugin_runtime_loader::PluginLoader;
use plugin_runtime_manager::{LoadOptions, PluginManager, PluginManagerConfig};
use plugin_runtime_resources::{AllocationPriority, ResourceManager, ResourceQuota, ResourceType};
use plugin_runtime_security::{SecurityConfig, SecurityLevel, SecurityValidator};
use serde_json::Value as JsonValue;
use tempfile::NamedTempFile;

struct FakePlugin {
    metadata: PluginMetadata,
}

impl Plugin for FakePlugin {
    fn metadata(&self) -> PluginMetadata {
        self.metadata.clone()
    }

    fn initialize(&mut self, _context: &PluginContext) -> PluginResult<()> {
        Ok(())
    }

    fn shutdown(&mut self) -> PluginResult<()> {
        Ok(())
    }

    fn configure(&mut self, _config: &JsonValue) -> PluginResult<()> {
        Ok(())
    }

    fn execute_command(&mut self, _command: &str, params: &JsonValue) -> PluginResult<JsonValue> {
        Ok(params.clone())
    }
}

/// An in-memory `PluginLoader` keyed by file path, standing in for a real
/// dynamic-library loader in tests.
#[derive(Default)]
struct FakeLoader {
    metadata_by_path: HashMap<PathBuf, PluginMetadata>,
    loaded: RwLock<HashSet<String>>,
}

impl FakeLoader {
    fn register(&mut self, path: PathBuf, metadata: PluginMetadata) {
        self.metadata_by_path.insert(path, metadata);
    }
}

impl PluginLoader for FakeLoader {
    fn can_load(&self, path: &Path) -> bool {
        self.metadata_by_path.contains_key(path)
    }

    fn supported_extensions(&self) -> Vec<String> {
        vec![".so".to_string()]
    }

    fn read_metadata(&self, path: &Path) -> PluginResult<PluginMetadata> {
        self.metadata_by_path.get(path).cloned().ok_or_else(|| {
            plugin_runtime_core::PluginError::new(
                PluginErrorKind::NotFound,
                format!("no fake metadata registered for {}", path.display()),
            )
        })
    }

    fn load(&self, path: &Path) -> PluginResult<(Box<dyn Plugin>, String)> {
        let metadata = self.read_metadata(path)?;
        let id = metadata.id.clone();
        self.loaded.write().insert(id.clone());
        Ok((Box::new(FakePlugin { metadata }), id))
    }

    fn unload(&self, plugin_id: &str) -> PluginResult<()> {
        self.loaded.write().remove(plugin_id);
        Ok(())
    }

    fn is_loaded(&self, plugin_id: &str) -> bool {
        self.loaded.read().contains(plugin_id)
    }

    fn loaded_ids(&self) -> Vec<String> {
        self.loaded.read().iter().cloned().collect()
    }
}

/// A real, non-empty temp file with an allowed extension, so the security
/// validator's file-integrity stage passes honestly. The returned
/// `NamedTempFile` must be kept alive for as long as its path is in use;
/// it unlinks the file on drop.
fn temp_plugin_file() -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".so")
        .tempfile()
        .unwrap();
    file.write_all(b"fake-plugin-binary").unwrap();
    file
}

fn bare_metadata(id: &str, deps: &[&str]) -> PluginMetadata {
    PluginMetadata {
        id: id.to_string(),
        name: id.to_string(),
        description: String::new(),
        version: Version::new(1, 0, 0),
        author: String::new(),
        license: String::new(),
        homepage: String::new(),
        category: String::new(),
        tags: HashSet::new(),
        dependencies: deps.iter().map(|s| s.to_string()).collect(),
        optional_dependencies: vec![],
        capabilities: [Capability::Service].into_iter().collect(),
        priority: Priority::Normal,
        min_host_version: None,
        max_host_version: None,
        custom_data: None,
    }
}

fn manager_with_fake_loader(loader: FakeLoader, host_version: Version) -> PluginManager {
    PluginManager::new(
        PluginManagerConfig {
            host_version,
            ..Default::default()
        },
        Box::new(loader),
        SecurityValidator::new(SecurityConfig {
            level: SecurityLevel::Basic,
            ..Default::default()
        }),
        Arc::new(ResourceManager::default()),
        Arc::new(MessageBus::new()),
    )
}

/// S1. Load two plugins A (id="a"), B (id="b" depends on "a"). Batch-load
/// `[B, A]`. Expected: load order `[A, B]`; both reach `Running` after
/// `initialize_immediately=true`; `get_plugin("b") != null`.
#[tokio::test]
async fn s1_batch_load_orders_dependency_first() {
    let file_a = temp_plugin_file();
    let file_b = temp_plugin_file();
    let path_a = file_a.path().to_path_buf();
    let path_b = file_b.path().to_path_buf();

    let mut loader = FakeLoader::default();
    loader.register(path_a.clone(), bare_metadata("a", &[]));
    loader.register(path_b.clone(), bare_metadata("b", &["a"]));

    let manager = manager_with_fake_loader(loader, Version::new(1, 0, 0));

    let results = manager
        .load_plugins(
            vec![path_b.clone(), path_a.clone()],
            LoadOptions {
                configuration: None,
                initialize_immediately: true,
                timeout: None,
            },
        )
        .await;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].as_ref().unwrap(), "b");
    assert_eq!(results[1].as_ref().unwrap(), "a");

    let info_a = manager.get_plugin("a").await.expect("a registered");
    let info_b = manager.get_plugin("b").await.expect("b registered");
    assert_eq!(info_a.state, plugin_runtime_core::PluginState::Running);
    assert_eq!(info_b.state, plugin_runtime_core::PluginState::Running);
}

/// S2. Load A v1.0.0 declaring `min_host_version="2.0.0"` into host v1.9.9.
/// Expected: `VersionMismatch`; registry unchanged.
#[tokio::test]
async fn s2_host_version_below_minimum_is_rejected() {
    let file = temp_plugin_file();
    let path = file.path().to_path_buf();
    let mut metadata = bare_metadata("a", &[]);
    metadata.min_host_version = Some(Version::new(2, 0, 0));

    let mut loader = FakeLoader::default();
    loader.register(path.clone(), metadata);

    let manager = manager_with_fake_loader(loader, Version::new(1, 9, 9));

    let err = manager
        .load_plugin(path.clone(), LoadOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code, PluginErrorKind::VersionMismatch);
    assert!(manager.get_plugin("a").await.is_none());
}

/// S3 (version ordering/round-trip) is covered directly in
/// `plugin-runtime-core::version`; re-asserted here against the facade path
/// actually used by the manager.
#[test]
fn s3_version_parse_and_ordering() {
    let v = Version::parse("1.2.3-rc.1+build.5").unwrap();
    assert_eq!(v.major, 1);
    assert_eq!(v.minor, 2);
    assert_eq!(v.patch, 3);
    assert_eq!(v.to_string(), "1.2.3-rc.1+build.5");
    assert!(v < Version::new(1, 2, 3));
}

/// S4. Subscribe X to T, publish twice, unsubscribe, publish a third time.
/// Expected: X's handler invoked exactly twice; `delivery_failures == 0`;
/// `messages_published == 3`, `messages_delivered == 2`.
#[test]
fn s4_unsubscribe_stops_further_delivery() {
    #[derive(Debug)]
    struct T(u32);

    let bus = MessageBus::new();
    let invocations = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let invocations_clone = Arc::clone(&invocations);
    bus.subscribe::<T, _, fn(&T) -> bool>(
        "x",
        move |_| {
            invocations_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        },
        None,
    );

    bus.publish(T(1), "sender", DeliveryMode::Broadcast).unwrap();
    bus.publish(T(2), "sender", DeliveryMode::Broadcast).unwrap();
    bus.unsubscribe("x", None);
    bus.publish(T(3), "sender", DeliveryMode::Broadcast).unwrap();

    assert_eq!(invocations.load(std::sync::atomic::Ordering::SeqCst), 2);
    let stats = bus.statistics();
    assert_eq!(stats["delivery_failures"], 0);
    assert_eq!(stats["messages_published"], 3);
    assert_eq!(stats["messages_delivered"], 2);
}

/// S5. Create a memory pool with `max_instances=2`. Two acquires for plugin
/// "p" succeed with distinct allocation ids; a third fails with
/// `ResourceExhausted`; releasing the first lets a fourth succeed.
#[test]
fn s5_quota_exhaustion_and_release() {
    let manager = ResourceManager::new(Duration::from_secs(1));
    manager.create_pool(
        ResourceType::Memory,
        "mem",
        ResourceQuota {
            max_instances: 2,
            max_memory_bytes: 1024 * 1024,
            max_lifetime: Duration::from_secs(3600),
        },
    );

    let (h1, _) = manager.acquire("mem", "p", AllocationPriority::Normal).unwrap();
    let (h2, _) = manager.acquire("mem", "p", AllocationPriority::Normal).unwrap();
    assert_ne!(h1.allocation_id, h2.allocation_id);

    let err = manager.acquire("mem", "p", AllocationPriority::Normal).unwrap_err();
    assert_eq!(err.code, PluginErrorKind::ResourceExhausted);

    manager.release("mem", &h1).unwrap();
    manager.acquire("mem", "p", AllocationPriority::Normal).unwrap();
}

/// S6. Validate a file whose extension is `.exe`. Expected: `is_valid ==
/// false`, error "Invalid file extension", `validated_level == None`;
/// `validations_failed` incremented.
#[test]
fn s6_disallowed_extension_fails_at_basic_stage() {
    let mut file = tempfile::Builder::new()
        .suffix(".exe")
        .tempfile()
        .unwrap();
    file.write_all(b"irrelevant").unwrap();

    let validator = SecurityValidator::new(SecurityConfig::default());
    let result = validator.validate(file.path(), None);

    assert!(!result.is_valid);
    assert_eq!(result.validated_level, None);
    assert!(result
        .errors
        .iter()
        .any(|e| e.contains("Invalid file extension")));
    assert_eq!(validator.statistics()["validations_failed"], 1);
}

/// Removing a plugin while a dependent is loaded fails unless `force` is
/// set; with `force`, dependents cascade-unload first.
#[tokio::test]
async fn unload_without_force_is_blocked_by_a_live_dependent() {
    let file_a = temp_plugin_file();
    let file_b = temp_plugin_file();
    let path_a = file_a.path().to_path_buf();
    let path_b = file_b.path().to_path_buf();

    let mut loader = FakeLoader::default();
    loader.register(path_a.clone(), bare_metadata("a", &[]));
    loader.register(path_b.clone(), bare_metadata("b", &["a"]));

    let manager = manager_with_fake_loader(loader, Version::new(1, 0, 0));
    manager
        .load_plugins(
            vec![path_a.clone(), path_b.clone()],
            LoadOptions::default(),
        )
        .await;

    let err = manager.unload_plugin("a", false).await.unwrap_err();
    assert_eq!(err.code, PluginErrorKind::DependencyMissing);

    manager.unload_plugin("a", true).await.unwrap();
    assert!(manager.get_plugin("a").await.is_none());
    assert!(manager.get_plugin("b").await.is_none());
}

/// A second `load_plugin` with the same id returns `AlreadyLoaded`.
#[tokio::test]
async fn loading_the_same_id_twice_is_rejected() {
    let file = temp_plugin_file();
    let path = file.path().to_path_buf();
    let mut loader = FakeLoader::default();
    loader.register(path.clone(), bare_metadata("a", &[]));

    let manager = manager_with_fake_loader(loader, Version::new(1, 0, 0));
    manager
        .load_plugin(path.clone(), LoadOptions::default())
        .await
        .unwrap();

    let err = manager
        .load_plugin(path.clone(), LoadOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code, PluginErrorKind::AlreadyLoaded);
}

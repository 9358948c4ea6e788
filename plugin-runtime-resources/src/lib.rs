//! # Plugin Runtime Resources
//!
//! Pools and quotas for typed resources (threads, timers, handles, memory,
//! custom), with per-plugin enforcement, event notifications, and scheduled
//! cleanup via a spawned `tokio::time::interval` loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use plugin_runtime_core::{PluginError, PluginErrorKind, PluginId, PluginResult};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock as AsyncRwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Closed taxonomy of resource kinds a pool can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    Thread,
    Timer,
    NetworkConnection,
    FileHandle,
    DatabaseConnection,
    Memory,
    Custom,
}

/// Observable state of a resource allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceState {
    Available,
    InUse,
    Reserved,
    Cleanup,
    Error,
}

/// Priority a caller requests an allocation at; currently informational,
/// carried through to events and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AllocationPriority {
    Low,
    Normal,
    High,
}

impl Default for AllocationPriority {
    fn default() -> Self {
        AllocationPriority::Normal
    }
}

/// The sole capability to release a resource. Holding one is required to
/// call `ResourceManager::release`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceHandle {
    pub allocation_id: Uuid,
    pub resource_type: ResourceType,
    pub plugin_id: PluginId,
    pub priority: AllocationPriority,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Per-(plugin, type) resource limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceQuota {
    pub max_instances: u32,
    pub max_memory_bytes: u64,
    pub max_lifetime: Duration,
}

impl Default for ResourceQuota {
    fn default() -> Self {
        Self {
            max_instances: 16,
            max_memory_bytes: 64 * 1024 * 1024,
            max_lifetime: Duration::from_secs(3600),
        }
    }
}

/// Produces live resource instances for one resource type. The manager
/// selects a factory by the handle's recorded `resource_type`.
pub trait ResourceFactory: Send + Sync {
    fn resource_type(&self) -> ResourceType;

    /// Whether this factory could produce the resource `handle` describes,
    /// independent of quota headroom.
    fn can_create(&self, handle: &ResourceHandle) -> bool {
        handle.resource_type == self.resource_type()
    }

    fn estimated_cost(&self, handle: &ResourceHandle) -> u64;

    fn create(&self, handle: &ResourceHandle) -> PluginResult<serde_json::Value>;
}

/// A trivial factory for resource types with no meaningful live instance
/// beyond a cost estimate (timers, threads treated as opaque tokens).
pub struct DefaultFactory {
    resource_type: ResourceType,
    cost_per_instance: u64,
}

impl DefaultFactory {
    pub fn new(resource_type: ResourceType, cost_per_instance: u64) -> Self {
        Self {
            resource_type,
            cost_per_instance,
        }
    }
}

impl ResourceFactory for DefaultFactory {
    fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    fn estimated_cost(&self, _handle: &ResourceHandle) -> u64 {
        self.cost_per_instance
    }

    fn create(&self, handle: &ResourceHandle) -> PluginResult<serde_json::Value> {
        Ok(serde_json::json!({
            "allocation_id": handle.allocation_id,
            "resource_type": handle.resource_type,
        }))
    }
}

struct Allocation {
    handle: ResourceHandle,
    cost: u64,
    created_at: Instant,
    state: ResourceState,
}

/// A named group of resources of one type, bounded by a `ResourceQuota`.
pub struct Pool {
    name: String,
    resource_type: ResourceType,
    quota: ResourceQuota,
    factories: RwLock<Vec<Arc<dyn ResourceFactory>>>,
    allocations: DashMap<Uuid, Allocation>,
}

impl Pool {
    fn new(name: impl Into<String>, resource_type: ResourceType, quota: ResourceQuota) -> Self {
        Self {
            name: name.into(),
            resource_type,
            quota,
            factories: RwLock::new(Vec::new()),
            allocations: DashMap::new(),
        }
    }

    fn register_factory(&self, factory: Arc<dyn ResourceFactory>) {
        self.factories.write().push(factory);
    }

    fn count_for(&self, plugin_id: &str) -> u32 {
        self.allocations
            .iter()
            .filter(|entry| entry.value().handle.plugin_id == plugin_id)
            .count() as u32
    }

    fn cost_sum_for(&self, plugin_id: &str) -> u64 {
        self.allocations
            .iter()
            .filter(|entry| entry.value().handle.plugin_id == plugin_id)
            .map(|entry| entry.value().cost)
            .sum()
    }
}

/// `(handle, old_state, new_state)` delivered to event subscribers.
pub type ResourceEvent = (ResourceHandle, ResourceState, ResourceState);

pub type EventCallback = Box<dyn Fn(&ResourceEvent) + Send + Sync>;

struct EventSubscription {
    callback: EventCallback,
    type_filter: Option<ResourceType>,
    plugin_filter: Option<PluginId>,
}

/// Configuration controlling the resource manager's own behavior,
/// independent of the per-pool `ResourceQuota`s it enforces. Follows the
/// same `*Config` + `impl Default` pattern as `PluginManagerConfig` and
/// `SecurityConfig`.
#[derive(Debug, Clone)]
pub struct ResourceManagerConfig {
    /// How often the background cleanup task sweeps for expired or
    /// orphaned allocations. Spec default is 1 second.
    pub cleanup_interval: Duration,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(1),
        }
    }
}

/// Pools and quotas for typed resources, with per-plugin enforcement, event
/// notifications, and scheduled cleanup.
pub struct ResourceManager {
    pools: Arc<DashMap<String, Arc<Pool>>>,
    subscriptions: Arc<DashMap<u64, EventSubscription>>,
    next_subscription_id: AtomicU64,
    cleanup_running: Arc<AsyncRwLock<bool>>,
    cleanup_interval: Duration,
    registered_plugins: Arc<DashMap<PluginId, ()>>,
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::with_config(ResourceManagerConfig::default())
    }
}

impl ResourceManager {
    /// Construct directly from a cleanup interval. Kept alongside
    /// `with_config` for callers that only ever care about that one knob.
    pub fn new(cleanup_interval: Duration) -> Self {
        Self::with_config(ResourceManagerConfig { cleanup_interval })
    }

    pub fn with_config(config: ResourceManagerConfig) -> Self {
        Self {
            pools: Arc::new(DashMap::new()),
            subscriptions: Arc::new(DashMap::new()),
            next_subscription_id: AtomicU64::new(1),
            cleanup_running: Arc::new(AsyncRwLock::new(false)),
            cleanup_interval: config.cleanup_interval,
            registered_plugins: Arc::new(DashMap::new()),
        }
    }

    /// Tell the manager a plugin id is currently registered. Resources owned
    /// by ids absent from this set are reclaimed by the cleanup task.
    pub fn mark_plugin_registered(&self, plugin_id: &str) {
        self.registered_plugins.insert(plugin_id.to_string(), ());
    }

    pub fn mark_plugin_unregistered(&self, plugin_id: &str) {
        self.registered_plugins.remove(plugin_id);
    }

    pub fn create_pool(&self, resource_type: ResourceType, name: &str, quota: ResourceQuota) {
        info!(pool = name, ?resource_type, "creating resource pool");
        let pool = Arc::new(Pool::new(name, resource_type, quota));
        pool.register_factory(Arc::new(DefaultFactory::new(resource_type, 1024)));
        self.pools.insert(name.to_string(), pool);
    }

    pub fn register_factory(&self, pool_name: &str, factory: Arc<dyn ResourceFactory>) -> PluginResult<()> {
        let pool = self.get_pool(pool_name)?;
        pool.register_factory(factory);
        Ok(())
    }

    pub fn remove_pool(&self, name: &str) {
        self.pools.remove(name);
    }

    fn get_pool(&self, name: &str) -> PluginResult<Arc<Pool>> {
        self.pools
            .get(name)
            .map(|p| p.clone())
            .ok_or_else(|| {
                PluginError::new(PluginErrorKind::NotFound, format!("no such resource pool: {name}"))
            })
    }

    /// Acquire a resource from `pool_name` for `plugin_id`, enforcing the
    /// pool's quota in order: instance count, then memory budget, then
    /// factory availability.
    pub fn acquire(
        &self,
        pool_name: &str,
        plugin_id: &str,
        priority: AllocationPriority,
    ) -> PluginResult<(ResourceHandle, serde_json::Value)> {
        let pool = self.get_pool(pool_name)?;

        if pool.count_for(plugin_id) >= pool.quota.max_instances {
            return Err(PluginError::new(
                PluginErrorKind::ResourceExhausted,
                format!(
                    "plugin {plugin_id} already holds {} instances in pool {pool_name}",
                    pool.quota.max_instances
                ),
            ));
        }

        let handle = ResourceHandle {
            allocation_id: Uuid::new_v4(),
            resource_type: pool.resource_type,
            plugin_id: plugin_id.to_string(),
            priority,
            metadata: HashMap::new(),
        };

        let factories = pool.factories.read();
        let estimate_cost = factories
            .first()
            .map(|f| f.estimated_cost(&handle))
            .unwrap_or(0);
        let current_cost = pool.cost_sum_for(plugin_id);
        if current_cost + estimate_cost > pool.quota.max_memory_bytes {
            drop(factories);
            return Err(PluginError::new(
                PluginErrorKind::ResourceExhausted,
                format!("acquiring would exceed the memory quota for pool {pool_name}"),
            ));
        }

        let factory = factories
            .iter()
            .find(|f| f.can_create(&handle))
            .cloned()
            .ok_or_else(|| {
                PluginError::new(
                    PluginErrorKind::ResourceUnavailable,
                    format!("no factory can produce resources for pool {pool_name}"),
                )
            })?;
        drop(factories);

        let cost = factory.estimated_cost(&handle);

        let instance = factory.create(&handle)?;

        pool.allocations.insert(
            handle.allocation_id,
            Allocation {
                handle: handle.clone(),
                cost,
                created_at: Instant::now(),
                state: ResourceState::InUse,
            },
        );

        debug!(pool = pool_name, plugin = plugin_id, "resource acquired");
        self.notify(&handle, ResourceState::Available, ResourceState::InUse);

        Ok((handle, instance))
    }

    pub fn release(&self, pool_name: &str, handle: &ResourceHandle) -> PluginResult<()> {
        let pool = self.get_pool(pool_name)?;
        match pool.allocations.remove(&handle.allocation_id) {
            Some((_, allocation)) => {
                self.notify(&handle.clone(), allocation.state, ResourceState::Available);
                Ok(())
            }
            None => Err(PluginError::new(
                PluginErrorKind::NotFound,
                format!("no such allocation: {}", handle.allocation_id),
            )),
        }
    }

    pub fn list_active(&self, plugin_id: &str) -> Vec<ResourceHandle> {
        self.pools
            .iter()
            .flat_map(|pool| {
                pool.allocations
                    .iter()
                    .filter(|entry| entry.value().handle.plugin_id == plugin_id)
                    .map(|entry| entry.value().handle.clone())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn usage_stats(
        &self,
        resource_type: Option<ResourceType>,
        plugin_id: Option<&str>,
    ) -> serde_json::Value {
        let mut pools_json = Vec::new();
        for entry in self.pools.iter() {
            let pool = entry.value();
            if let Some(rt) = resource_type {
                if pool.resource_type != rt {
                    continue;
                }
            }
            let active = pool
                .allocations
                .iter()
                .filter(|a| plugin_id.map_or(true, |id| a.value().handle.plugin_id == id))
                .count();
            pools_json.push(serde_json::json!({
                "name": pool.name,
                "type": pool.resource_type,
                "active": active,
                "max_instances": pool.quota.max_instances,
            }));
        }
        serde_json::json!({ "pools": pools_json })
    }

    /// Register `(callback, type_filter, plugin_filter)`; returns an opaque
    /// subscription id usable for cancellation.
    pub fn subscribe(
        &self,
        callback: EventCallback,
        type_filter: Option<ResourceType>,
        plugin_filter: Option<PluginId>,
    ) -> u64 {
        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.insert(
            id,
            EventSubscription {
                callback,
                type_filter,
                plugin_filter,
            },
        );
        id
    }

    pub fn unsubscribe(&self, subscription_id: u64) {
        self.subscriptions.remove(&subscription_id);
    }

    fn notify(&self, handle: &ResourceHandle, old_state: ResourceState, new_state: ResourceState) {
        let event: ResourceEvent = (handle.clone(), old_state, new_state);
        for entry in self.subscriptions.iter() {
            let sub = entry.value();
            if let Some(t) = sub.type_filter {
                if t != handle.resource_type {
                    continue;
                }
            }
            if let Some(p) = &sub.plugin_filter {
                if p != &handle.plugin_id {
                    continue;
                }
            }
            (sub.callback)(&event);
        }
    }

    /// Spawn the background cleanup task. Releases resources whose age
    /// exceeds `quota.max_lifetime` or whose owning plugin is no longer
    /// registered, emitting a cleanup event with the count released.
    pub fn start_cleanup_task(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            {
                let mut running = manager.cleanup_running.write().await;
                if *running {
                    warn!("resource cleanup task already running");
                    return;
                }
                *running = true;
            }
            let mut interval = tokio::time::interval(manager.cleanup_interval);
            loop {
                interval.tick().await;
                if !*manager.cleanup_running.read().await {
                    break;
                }
                manager.run_cleanup_pass();
            }
        });
    }

    pub async fn stop_cleanup_task(&self) {
        *self.cleanup_running.write().await = false;
    }

    fn run_cleanup_pass(&self) {
        let mut released = 0u64;
        for pool_entry in self.pools.iter() {
            let pool = pool_entry.value();
            let expired: Vec<Uuid> = pool
                .allocations
                .iter()
                .filter(|entry| {
                    let allocation = entry.value();
                    let aged_out = allocation.created_at.elapsed() > pool.quota.max_lifetime;
                    let orphaned = !self.registered_plugins.contains_key(&allocation.handle.plugin_id);
                    aged_out || orphaned
                })
                .map(|entry| *entry.key())
                .collect();

            for id in expired {
                if let Some((_, allocation)) = pool.allocations.remove(&id) {
                    self.notify(&allocation.handle, allocation.state, ResourceState::Cleanup);
                    released += 1;
                }
            }
        }
        if released > 0 {
            debug!(released, "resource cleanup pass released expired allocations");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_bounds_instance_count() {
        let manager = ResourceManager::new(Duration::from_secs(1));
        manager.create_pool(
            ResourceType::Memory,
            "memory-pool",
            ResourceQuota {
                max_instances: 2,
                max_memory_bytes: 1024 * 1024,
                max_lifetime: Duration::from_secs(60),
            },
        );

        let (h1, _) = manager
            .acquire("memory-pool", "p", AllocationPriority::Normal)
            .unwrap();
        let (h2, _) = manager
            .acquire("memory-pool", "p", AllocationPriority::Normal)
            .unwrap();
        assert_ne!(h1.allocation_id, h2.allocation_id);

        let err = manager
            .acquire("memory-pool", "p", AllocationPriority::Normal)
            .unwrap_err();
        assert_eq!(err.code, PluginErrorKind::ResourceExhausted);

        manager.release("memory-pool", &h1).unwrap();
        manager
            .acquire("memory-pool", "p", AllocationPriority::Normal)
            .unwrap();
    }

    #[test]
    fn events_fire_on_acquire_and_release() {
        let manager = ResourceManager::new(Duration::from_secs(1));
        manager.create_pool(ResourceType::Timer, "timers", ResourceQuota::default());

        let events: Arc<parking_lot::Mutex<Vec<ResourceState>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));
        let events_clone = Arc::clone(&events);
        manager.subscribe(
            Box::new(move |(_, _, new_state)| events_clone.lock().push(*new_state)),
            None,
            None,
        );

        let (handle, _) = manager.acquire("timers", "p", AllocationPriority::Normal).unwrap();
        manager.release("timers", &handle).unwrap();

        let recorded = events.lock();
        assert_eq!(*recorded, vec![ResourceState::InUse, ResourceState::Available]);
    }

    #[tokio::test]
    async fn cleanup_task_releases_orphaned_resources() {
        let manager = Arc::new(ResourceManager::new(Duration::from_millis(20)));
        manager.create_pool(
            ResourceType::Thread,
            "threads",
            ResourceQuota {
                max_instances: 10,
                max_memory_bytes: 1024 * 1024,
                max_lifetime: Duration::from_secs(3600),
            },
        );
        manager.mark_plugin_registered("owner");
        manager.acquire("threads", "owner", AllocationPriority::Normal).unwrap();
        manager.mark_plugin_unregistered("owner");

        manager.start_cleanup_task();
        tokio::time::sleep(Duration::from_millis(80)).await;
        manager.stop_cleanup_task().await;

        assert!(manager.list_active("owner").is_empty());
    }
}
